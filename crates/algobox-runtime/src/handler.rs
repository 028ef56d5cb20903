//! Per-execution façade handed to every runner stage.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use algobox_session::{CachedItem, TaskSession};
use algobox_store::{ExecutionRecord, ExecutionStatus, RecordUpdate, validate_progress};
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use tracing::{error, instrument};

use crate::cache::CacheKey;
use crate::data::{DataBundle, DataSchema};
use crate::device::resolve_device;
use crate::error::RunnerError;
use crate::log::TaskLog;
use crate::runner::{LoadedRunner, RunnerInstance};
use crate::runtime::Runtime;

/// Count and cumulative duration of dataset transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStats {
  pub count: usize,
  pub seconds: f64,
}

impl FileStats {
  fn add(&mut self, count: usize, started: Instant) {
    self.count += count;
    self.seconds += started.elapsed().as_secs_f64();
  }
}

type AssetMap = BTreeMap<String, String>;

/// Keeps a runner's assets in effect for the handler while alive.
pub(crate) struct AssetScope<'a> {
  handler: &'a TaskHandler,
}

impl Drop for AssetScope<'_> {
  fn drop(&mut self) {
    self.handler.assets_lock().pop();
  }
}

/// Binds one execution record to the runner driving it.
///
/// Every write is a read-modify-write of a single record field. A write
/// that fails on the storage side marks the execution failed before the
/// error is returned, so pollers never see a record stuck mid-run.
pub struct TaskHandler {
  execution_id: String,
  runtime: Arc<Runtime>,
  log: TaskLog,
  session: Option<TaskSession>,
  /// Asset maps of the runners being driven, innermost last. The first
  /// entry is the execution's own algorithm.
  algorithm_assets: Mutex<Vec<AssetMap>>,
  fetch_stats: Mutex<FileStats>,
  post_stats: Mutex<FileStats>,
  finished: AtomicBool,
}

impl TaskHandler {
  /// Take ownership of an accepted execution and mark it STARTED.
  ///
  /// With an active session, its token is written to the record so the
  /// client can continue the session.
  pub async fn start(
    runtime: Arc<Runtime>,
    execution_id: impl Into<String>,
    session: Option<TaskSession>,
  ) -> Result<Self, RunnerError> {
    let execution_id = execution_id.into();
    let handler = Self {
      log: TaskLog::new(execution_id.clone()),
      execution_id,
      runtime,
      session,
      algorithm_assets: Mutex::new(Vec::new()),
      fetch_stats: Mutex::new(FileStats::default()),
      post_stats: Mutex::new(FileStats::default()),
      finished: AtomicBool::new(false),
    };

    handler.set_status(ExecutionStatus::Started).await?;
    if let Some(token) = handler.session.as_ref().and_then(|s| s.token()) {
      let token = token.to_string();
      handler.set_session_token(Some(token)).await?;
    }
    Ok(handler)
  }

  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  pub fn log(&self) -> &TaskLog {
    &self.log
  }

  pub fn runtime(&self) -> &Arc<Runtime> {
    &self.runtime
  }

  pub fn session(&self) -> Option<&TaskSession> {
    self.session.as_ref()
  }

  /// The current state of this execution's record.
  pub async fn record(&self) -> Result<ExecutionRecord, RunnerError> {
    Ok(self.runtime.records().get(&self.execution_id).await?)
  }

  pub fn fetch_stats(&self) -> FileStats {
    *self.fetch_stats.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn post_stats(&self) -> FileStats {
    *self.post_stats.lock().unwrap_or_else(|e| e.into_inner())
  }

  async fn write(&self, update: RecordUpdate) -> Result<ExecutionRecord, RunnerError> {
    Ok(
      self
        .runtime
        .records()
        .update(&self.execution_id, update)
        .await?,
    )
  }

  /// Mark the execution failed when `result` is an error.
  async fn or_fail<T>(&self, result: Result<T, RunnerError>) -> Result<T, RunnerError> {
    if let Err(e) = &result {
      self.mark_as_failed(Some(e)).await;
    }
    result
  }

  /// Report progress in `[0, 1]`. Out of range values leave the record as is.
  pub async fn set_progress(&self, progress: f64) -> Result<(), RunnerError> {
    validate_progress(progress)?;
    let result = self.write(RecordUpdate::Progress(progress)).await;
    self.or_fail(result).await.map(|_| ())
  }

  pub async fn set_status(&self, status: ExecutionStatus) -> Result<(), RunnerError> {
    let result = self.write(RecordUpdate::Status(status)).await;
    self.or_fail(result).await.map(|_| ())
  }

  pub async fn set_output_dataset_ids(&self, ids: Vec<String>) -> Result<(), RunnerError> {
    let result = self.write(RecordUpdate::OutputDatasetIds(ids)).await;
    self.or_fail(result).await.map(|_| ())
  }

  pub async fn set_time_completed(&self) -> Result<(), RunnerError> {
    let result = self.write(RecordUpdate::TimeCompleted(Utc::now())).await;
    self.or_fail(result).await.map(|_| ())
  }

  pub async fn set_session_token(&self, token: Option<String>) -> Result<(), RunnerError> {
    let result = self.write(RecordUpdate::SessionToken(token)).await;
    self.or_fail(result).await.map(|_| ())
  }

  /// Copy the task log into the record.
  pub async fn update_log(&self) -> Result<(), RunnerError> {
    let result = self.write(RecordUpdate::Log(self.log.contents())).await;
    self.or_fail(result).await.map(|_| ())
  }

  fn log_file_stats(&self) {
    let fetched = self.fetch_stats();
    let posted = self.post_stats();
    self.log.info(format!(
      "File fetching stats: {} files fetched in {:.4} seconds.",
      fetched.count, fetched.seconds
    ));
    self.log.info(format!(
      "File posting stats: {} files posted in {:.4} seconds.",
      posted.count, posted.seconds
    ));
  }

  /// Record a successful run: progress, outputs, completion time, log, then
  /// the COMPLETED status.
  pub async fn mark_as_completed(&self, output_dataset_ids: &[String]) -> Result<(), RunnerError> {
    self.set_progress(1.0).await?;
    self
      .set_output_dataset_ids(output_dataset_ids.to_vec())
      .await?;
    self.set_time_completed().await?;
    self.log_file_stats();
    self.update_log().await?;
    self.set_status(ExecutionStatus::Completed).await?;
    self.finished.store(true, Ordering::SeqCst);
    Ok(())
  }

  /// Record a failed run. Only the first call has an effect.
  ///
  /// Write failures here are logged and swallowed: the caller is already
  /// reporting an error.
  pub async fn mark_as_failed(&self, cause: Option<&RunnerError>) {
    if self.finished.swap(true, Ordering::SeqCst) {
      return;
    }

    if let Some(e) = cause {
      self.log.error(e.to_string());
      let mut source = std::error::Error::source(e);
      while let Some(inner) = source {
        self.log.error(format!("caused by: {}", inner));
        source = inner.source();
      }
    }

    self.log_file_stats();
    let updates = [
      RecordUpdate::Progress(1.0),
      RecordUpdate::TimeCompleted(Utc::now()),
      RecordUpdate::OutputDatasetIds(Vec::new()),
      RecordUpdate::Log(self.log.contents()),
      RecordUpdate::Status(ExecutionStatus::Failed),
    ];
    for update in updates {
      let field = update.field();
      if let Err(e) = self.write(update).await {
        error!(
          execution_id = %self.execution_id,
          field,
          error = %e,
          "failed to record execution failure"
        );
      }
    }
  }

  /// Resolve an algorithm to a runner ready for a new execution.
  ///
  /// Loaded runners are cached per algorithm version and device; on a hit
  /// only the per-execution context is reset.
  #[instrument(
    name = "fetch_algorithm",
    skip(self),
    fields(execution_id = %self.execution_id)
  )]
  pub async fn fetch_algorithm(
    &self,
    algorithm_id: &str,
    device_override: Option<&str>,
  ) -> Result<RunnerInstance, RunnerError> {
    self
      .log
      .info(format!("Fetching algorithm {} from the database.", algorithm_id));
    self.log.info("Loading the algorithm.");
    let start = Instant::now();

    match self.fetch_algorithm_inner(algorithm_id, device_override).await {
      Ok(instance) => {
        self.log.info(format!(
          "Algorithm runner successfully loaded in {:.8} seconds.",
          start.elapsed().as_secs_f64()
        ));
        self.log.bind_algorithm(instance.loaded().descriptor().label());
        Ok(instance)
      }
      Err(e) => {
        let e = RunnerError::fetch_algorithm(e);
        self.mark_as_failed(Some(&e)).await;
        Err(e)
      }
    }
  }

  async fn fetch_algorithm_inner(
    &self,
    algorithm_id: &str,
    device_override: Option<&str>,
  ) -> Result<RunnerInstance, RunnerError> {
    let descriptor = self.runtime.registry().get(algorithm_id).await?;
    {
      let mut assets = self.assets_lock();
      if assets.is_empty() {
        assets.push(descriptor.assets.clone());
      }
    }

    let device = resolve_device(
      &descriptor,
      device_override,
      self.runtime.probe(),
      &self.log,
    )
    .await?;

    let key = CacheKey {
      algorithm_id: descriptor.algorithm_id.clone(),
      major_version: descriptor.major_version,
      minor_version: descriptor.minor_version,
      device,
      device_override: device_override
        .filter(|d| !d.is_empty())
        .map(str::to_ascii_lowercase),
    };

    let loaded = self
      .runtime
      .cache()
      .get_or_load(key, || async {
        let module = self
          .runtime
          .registry()
          .fetch_module(&descriptor.module_reference)
          .await?;
        let runner = self.runtime.loader().load(&descriptor, &module)?;
        let _scope = self.enter_assets(&descriptor.assets);
        LoadedRunner::load(runner, descriptor.clone(), device, self).await
      })
      .await?;

    loaded.initialize()
  }

  fn assets_lock(&self) -> MutexGuard<'_, Vec<AssetMap>> {
    self.algorithm_assets.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Resolve `fetch_asset` against `assets` until the scope is dropped.
  pub(crate) fn enter_assets(&self, assets: &AssetMap) -> AssetScope<'_> {
    self.assets_lock().push(assets.clone());
    AssetScope { handler: self }
  }

  /// Read an asset of the algorithm being driven by its relative path.
  pub async fn fetch_asset(&self, asset_path: &str) -> Result<Bytes, RunnerError> {
    let result = self.fetch_asset_inner(asset_path).await;
    self.or_fail(result).await
  }

  async fn fetch_asset_inner(&self, asset_path: &str) -> Result<Bytes, RunnerError> {
    let locator = self
      .assets_lock()
      .last()
      .and_then(|assets| assets.get(asset_path))
      .cloned()
      .ok_or_else(|| {
        RunnerError::not_found(format!("asset {} is not part of the algorithm", asset_path))
      })?;

    self
      .log
      .info(format!("Fetching asset {} from the database.", locator));
    let start = Instant::now();
    let asset = self.runtime.registry().fetch_asset(&locator).await?;
    self.log.info(format!(
      "Asset {} fetched in {:.4} seconds.",
      locator,
      start.elapsed().as_secs_f64()
    ));
    Ok(asset)
  }

  /// Download datasets and validate them against `schema`.
  ///
  /// With `keys`, only those fields are read; a requested key missing from
  /// the dataset is left out before validation.
  pub async fn fetch_data(
    &self,
    file_ids: &[String],
    schema: DataSchema,
    keys: &[&str],
    parallel: bool,
  ) -> Result<Vec<DataBundle>, RunnerError> {
    let start = Instant::now();
    let result = if parallel {
      try_join_all(file_ids.iter().map(|id| self.fetch_file(id, schema, keys))).await
    } else {
      let mut datasets = Vec::with_capacity(file_ids.len());
      for id in file_ids {
        match self.fetch_file(id, schema, keys).await {
          Ok(bundle) => datasets.push(bundle),
          Err(e) => return self.or_fail(Err(e)).await,
        }
      }
      Ok(datasets)
    };

    if result.is_ok() {
      self
        .fetch_stats
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .add(file_ids.len(), start);
    }
    self.or_fail(result).await
  }

  async fn fetch_file(
    &self,
    file_id: &str,
    schema: DataSchema,
    keys: &[&str],
  ) -> Result<DataBundle, RunnerError> {
    let data = self
      .runtime
      .blobs()
      .get(self.runtime.data_collection(), file_id)
      .await
      .map_err(|e| {
        if e.is_not_found() {
          RunnerError::not_found(format!("dataset {} not found", file_id))
        } else {
          RunnerError::Storage(e)
        }
      })?;
    let mut bundle = self.runtime.codec().decode(&data)?;
    if !keys.is_empty() {
      bundle.retain(|name, _| keys.contains(&name.as_str()));
    }
    schema.conform(bundle)
  }

  /// Validate and upload result datasets, returning their new ids in order.
  pub async fn post_data(
    &self,
    results: Vec<DataBundle>,
    schema: DataSchema,
    parallel: bool,
  ) -> Result<Vec<String>, RunnerError> {
    self
      .log
      .info(format!("Uploading {} results to the database.", results.len()));
    let count = results.len();
    let start = Instant::now();

    let result = if parallel {
      try_join_all(results.into_iter().map(|r| self.post_file(r, schema))).await
    } else {
      let mut ids = Vec::with_capacity(count);
      let mut failed = None;
      for bundle in results {
        match self.post_file(bundle, schema).await {
          Ok(id) => ids.push(id),
          Err(e) => {
            failed = Some(e);
            break;
          }
        }
      }
      match failed {
        Some(e) => Err(e),
        None => Ok(ids),
      }
    };

    if result.is_ok() {
      self
        .post_stats
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .add(count, start);
    }
    self.or_fail(result).await
  }

  async fn post_file(&self, bundle: DataBundle, schema: DataSchema) -> Result<String, RunnerError> {
    let bundle = schema.conform(bundle)?;
    let data = self.runtime.codec().encode(&bundle)?;
    let dataset_id = uuid::Uuid::new_v4().to_string();
    self
      .runtime
      .blobs()
      .put(self.runtime.data_collection(), &dataset_id, data)
      .await?;
    Ok(dataset_id)
  }

  fn task_session(&self) -> Result<&TaskSession, RunnerError> {
    self.session.as_ref().ok_or_else(|| {
      RunnerError::validation(
        "The algorithm is using the task session, but the task session is not initialized. \
         Please make sure you are providing the session token in the execution request.",
      )
    })
  }

  /// Keep a value in the client's session for later executions.
  pub async fn save_item_to_session<T: Any + Send + Sync>(
    &self,
    key: &str,
    value: T,
  ) -> Result<(), RunnerError> {
    self
      .save_cached_item_to_session(key, CachedItem::new(value))
      .await
  }

  /// Like [`save_item_to_session`](Self::save_item_to_session) with an
  /// explicit memory footprint for the session's memory limit.
  pub async fn save_cached_item_to_session(
    &self,
    key: &str,
    item: CachedItem,
  ) -> Result<(), RunnerError> {
    let result = self
      .task_session()
      .and_then(|s| s.add_item(key, item).map_err(RunnerError::from));
    if result.is_ok() {
      self
        .log
        .info(format!("Saved object with key {} to the task session.", key));
    }
    self.or_fail(result).await
  }

  pub async fn load_item_from_session<T: Any + Send + Sync>(
    &self,
    key: &str,
  ) -> Result<Arc<T>, RunnerError> {
    let result = self
      .task_session()
      .and_then(|s| s.get::<T>(key).map_err(RunnerError::from));
    if result.is_ok() {
      self
        .log
        .info(format!("Loaded object with key {} from the task session.", key));
    }
    self.or_fail(result).await
  }

  pub async fn remove_item_from_session(&self, key: &str) -> Result<(), RunnerError> {
    let result = self
      .task_session()
      .and_then(|s| s.remove_item(key).map_err(RunnerError::from));
    if result.is_ok() {
      self
        .log
        .info(format!("Removed object with key {} from the task session.", key));
    }
    self.or_fail(result).await
  }
}

impl std::fmt::Debug for TaskHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskHandler")
      .field("execution_id", &self.execution_id)
      .field("session", &self.session)
      .field("finished", &self.finished.load(Ordering::SeqCst))
      .finish_non_exhaustive()
  }
}
