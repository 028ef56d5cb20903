//! Execution submission.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use algobox_config::{Backend, InferenceSettings};
use algobox_session::{SessionManager, TaskSession};
use algobox_store::ExecutionRecord;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, instrument};

use crate::error::RunnerError;
use crate::handler::TaskHandler;
use crate::runner::{Args, RunInput};
use crate::runtime::Runtime;

/// A client's request to run an algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
  pub algorithm_id: String,
  pub input_dataset_ids: Vec<String>,
  #[serde(default)]
  pub execution_device_override: Option<String>,
  #[serde(default)]
  pub additional_parameters: Args,
  #[serde(default)]
  pub session_token: Option<String>,
}

impl ExecutionRequest {
  pub fn new(algorithm_id: impl Into<String>, input_dataset_ids: Vec<String>) -> Self {
    Self {
      algorithm_id: algorithm_id.into(),
      input_dataset_ids,
      ..Default::default()
    }
  }

  pub fn with_device_override(mut self, device: impl Into<String>) -> Self {
    self.execution_device_override = Some(device.into());
    self
  }

  pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.additional_parameters.insert(name.into(), value);
    self
  }

  pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
    self.session_token = Some(token.into());
    self
  }

  fn into_record(self, execution_id: String) -> ExecutionRecord {
    let mut record = ExecutionRecord::new(execution_id, self.algorithm_id, self.input_dataset_ids)
      .with_parameters(self.additional_parameters);
    record.execution_device_override = self.execution_device_override;
    record.session_token = self.session_token;
    record
  }
}

type RunningTasks = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// Removes a running execution from the executor when its task ends,
/// whether it returns or unwinds. Dropping the sender wakes every waiter.
struct RunningEntry {
  tasks: RunningTasks,
  execution_id: String,
  _done: watch::Sender<()>,
}

impl Drop for RunningEntry {
  fn drop(&mut self) {
    self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&self.execution_id);
  }
}

/// Accepts execution requests and runs them in the background.
///
/// At most `worker_number` executions run at once. Under the distributed
/// backend, tasks get an unsupported session marker since their state would
/// not outlive the worker.
pub struct Executor {
  runtime: Arc<Runtime>,
  sessions: Arc<SessionManager>,
  backend: Backend,
  workers: Arc<Semaphore>,
  /// Executions still running, so `wait` can block on them.
  tasks: RunningTasks,
}

impl Executor {
  pub fn new(
    runtime: Arc<Runtime>,
    sessions: Arc<SessionManager>,
    settings: &InferenceSettings,
  ) -> Self {
    Self {
      runtime,
      sessions,
      backend: settings.backend.clone(),
      workers: Arc::new(Semaphore::new(settings.worker_number.max(1))),
      tasks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn backend(&self) -> &Backend {
    &self.backend
  }

  pub fn runtime(&self) -> &Arc<Runtime> {
    &self.runtime
  }

  /// Store a PENDING record and schedule the execution. Returns its id.
  #[instrument(
    name = "execution_submit",
    skip(self, request),
    fields(algorithm_id = %request.algorithm_id, backend = self.backend.name())
  )]
  pub async fn submit(&self, request: ExecutionRequest) -> Result<String, RunnerError> {
    let execution_id = uuid::Uuid::new_v4().to_string();
    let mut record = request.into_record(execution_id.clone());
    if !self.backend.supports_sessions() {
      record.session_token = None;
    }
    self.runtime.records().create(&record).await?;
    info!(execution_id = %execution_id, "execution_submitted");

    let session = if self.backend.supports_sessions() {
      self.sessions.open(record.session_token.clone())
    } else {
      TaskSession::unsupported(self.backend.name())
    };

    let (done, waiter) = watch::channel(());
    self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(execution_id.clone(), waiter);
    let entry = RunningEntry {
      tasks: self.tasks.clone(),
      execution_id: execution_id.clone(),
      _done: done,
    };

    let runtime = self.runtime.clone();
    let workers = self.workers.clone();
    tokio::spawn(async move {
      let _entry = entry;
      let _permit = workers
        .acquire_owned()
        .await
        .map_err(|e| RunnerError::stage(format!("executor is shut down: {}", e)))?;
      execute(runtime, record, Some(session)).await
    });

    Ok(execution_id)
  }

  /// Number of submitted executions that have not finished yet.
  pub fn running(&self) -> usize {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Wait for a submitted execution and return its final record.
  ///
  /// Finished executions, and those not submitted through this executor,
  /// are read from the store.
  pub async fn wait(&self, execution_id: &str) -> Result<ExecutionRecord, RunnerError> {
    let waiter = self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(execution_id)
      .cloned();
    if let Some(mut waiter) = waiter {
      // Only ever closed, never sent to.
      let _ = waiter.changed().await;
      debug!(execution_id = %execution_id, "execution task finished");
    }
    self.record(execution_id).await
  }

  pub async fn record(&self, execution_id: &str) -> Result<ExecutionRecord, RunnerError> {
    Ok(self.runtime.records().get(execution_id).await?)
  }
}

/// Run one accepted execution to completion.
///
/// This is the body of a background task or queue worker: it takes the
/// record from PENDING to a terminal status and returns the final record.
#[instrument(
  name = "execution_run",
  skip(runtime, record, session),
  fields(
    execution_id = %record.execution_id,
    algorithm_id = %record.algorithm_id,
  )
)]
pub async fn execute(
  runtime: Arc<Runtime>,
  record: ExecutionRecord,
  session: Option<TaskSession>,
) -> Result<ExecutionRecord, RunnerError> {
  info!("execution_started");

  let result = async {
    let handler = TaskHandler::start(runtime.clone(), &record.execution_id, session).await?;
    // Stage panics are handled by the runner; this covers asset loading.
    match AssertUnwindSafe(fetch_and_run(&handler, &record))
      .catch_unwind()
      .await
    {
      Ok(result) => result,
      Err(payload) => {
        let e = RunnerError::from_panic(payload);
        handler.mark_as_failed(Some(&e)).await;
        Err(e)
      }
    }
  }
  .await;

  match &result {
    Ok(outputs) => info!(outputs = outputs.len(), "execution_completed"),
    Err(e) => error!(error = %e, "execution_failed"),
  }
  result?;

  Ok(runtime.records().get(&record.execution_id).await?)
}

async fn fetch_and_run(
  handler: &TaskHandler,
  record: &ExecutionRecord,
) -> Result<Vec<String>, RunnerError> {
  handler.log().info("Fetching algorithm...");
  let start = Instant::now();
  let mut runner = handler
    .fetch_algorithm(
      &record.algorithm_id,
      record.execution_device_override.as_deref(),
    )
    .await?;
  handler.log().info(format!(
    "Algorithm fetched in {} seconds.",
    start.elapsed().as_secs_f64()
  ));

  let input = RunInput {
    input_dataset_ids: record.input_dataset_ids.clone(),
  };
  runner
    .run(handler, &input, &record.additional_parameters)
    .await
}
