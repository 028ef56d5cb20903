//! End-to-end tests for `Executor`: submission, background execution,
//! isolation of concurrent executions and sessions per backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use algobox_config::{Backend, InferenceSettings};
use algobox_runtime::{ExecutionRequest, Executor, Field, StaticDeviceProbe, execute};
use algobox_session::{SessionLimits, SessionManager};
use algobox_store::ExecutionStatus;
use common::*;

fn executor(fx: &Fixture, backend: Backend, workers: usize) -> Executor {
  let settings = InferenceSettings {
    backend,
    worker_number: workers,
    ..InferenceSettings::default()
  };
  Executor::new(
    fx.runtime.clone(),
    Arc::new(SessionManager::new(SessionLimits::default())),
    &settings,
  )
}

#[tokio::test]
async fn test_submit_and_wait() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "scale", "scale").await;
  let input = put_dataset(&fx.runtime, &data_bundle(vec![0.5, 1.5])).await;
  let executor = executor(&fx, Backend::InProcess, 2);

  let id = executor
    .submit(
      ExecutionRequest::new("scale", vec![input.clone()])
        .with_parameter("factor", serde_json::json!(4)),
    )
    .await
    .expect("submit should succeed");

  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.execution_id, id);
  assert_eq!(record.status, ExecutionStatus::Completed);
  assert_eq!(record.input_dataset_ids, vec![input]);
  assert_eq!(record.output_dataset_ids.len(), 1);
  assert!(record.log.contains("Fetching algorithm..."));
  assert!(record.log.contains("Algorithm fetched in"));

  let output = get_dataset(&fx, &record.output_dataset_ids[0]).await;
  match output.get("data") {
    Some(Field::Tensor(t)) => assert_eq!(t.values, vec![2.0, 6.0]),
    other => panic!("unexpected output field: {:?}", other),
  }

  // Records outlive the task handle.
  let again = executor.record(&id).await.unwrap();
  assert_eq!(again.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_missing_algorithm_fails_record() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  let executor = executor(&fx, Backend::InProcess, 1);

  let id = executor
    .submit(ExecutionRequest::new("does-not-exist", vec![]))
    .await
    .unwrap();
  let record = executor.wait(&id).await.unwrap();

  assert_eq!(record.status, ExecutionStatus::Failed);
  assert_eq!(record.progress, 1.0);
  assert!(record.log.contains("Failed to fetch algorithm"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_do_not_share_context() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "isolation", "isolation").await;
  let executor = executor(&fx, Backend::InProcess, 4);

  let mut ids = Vec::new();
  for _ in 0..6 {
    ids.push(
      executor
        .submit(ExecutionRequest::new("isolation", vec![]))
        .await
        .unwrap(),
    );
  }

  for id in &ids {
    let record = executor.wait(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed, "{}", record.log);
  }
  // All six ran on one loaded runner.
  assert_eq!(fx.runtime.cache().loads(), 1);
}

#[tokio::test]
async fn test_session_carries_across_executions() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "session", "session").await;
  let executor = executor(&fx, Backend::InProcess, 1);

  let id = executor
    .submit(
      ExecutionRequest::new("session", vec![]).with_parameter("mode", serde_json::json!("save")),
    )
    .await
    .unwrap();
  let first = executor.wait(&id).await.unwrap();
  assert_eq!(first.status, ExecutionStatus::Completed);
  let token = first.session_token.expect("a session token is generated");

  let id = executor
    .submit(
      ExecutionRequest::new("session", vec![])
        .with_parameter("mode", serde_json::json!("load"))
        .with_session_token(token.clone()),
    )
    .await
    .unwrap();
  let second = executor.wait(&id).await.unwrap();
  assert_eq!(second.status, ExecutionStatus::Completed, "{}", second.log);
  assert_eq!(second.session_token, Some(token));
}

#[tokio::test]
async fn test_unknown_session_token_starts_empty() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "session", "session").await;
  let executor = executor(&fx, Backend::InProcess, 1);

  let id = executor
    .submit(
      ExecutionRequest::new("session", vec![])
        .with_parameter("mode", serde_json::json!("load"))
        .with_session_token("fresh-token"),
    )
    .await
    .unwrap();
  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.status, ExecutionStatus::Failed);
  assert!(record.log.contains("embedding"));
}

#[tokio::test]
async fn test_distributed_backend_rejects_sessions() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "session", "session").await;
  publish_cpu(&fx.runtime, "scale", "scale").await;
  let executor = executor(
    &fx,
    Backend::Distributed {
      broker_url: "redis://localhost:6379/0".to_string(),
    },
    1,
  );
  assert_eq!(executor.backend().name(), "distributed");

  let id = executor
    .submit(ExecutionRequest::new("session", vec![]))
    .await
    .unwrap();
  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.status, ExecutionStatus::Failed);
  assert_eq!(record.session_token, None);
  assert!(record.log.contains("in_process"));

  // Algorithms that do not touch the session still run.
  let input = put_dataset(&fx.runtime, &data_bundle(vec![1.0])).await;
  let id = executor
    .submit(ExecutionRequest::new("scale", vec![input]))
    .await
    .unwrap();
  assert_eq!(
    executor.wait(&id).await.unwrap().status,
    ExecutionStatus::Completed
  );
}

#[tokio::test]
async fn test_execute_accepted_record() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "recorder", "recording").await;
  let record = accept(&fx.runtime, "recorder", vec![]).await;

  let done = execute(fx.runtime.clone(), record, None).await.unwrap();
  assert_eq!(done.status, ExecutionStatus::Completed);
  assert_eq!(done.output_dataset_ids, vec!["out-1".to_string()]);
}

#[tokio::test]
async fn test_device_override_is_recorded() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "recorder", "recording").await;
  let executor = executor(&fx, Backend::InProcess, 1);

  let id = executor
    .submit(ExecutionRequest::new("recorder", vec![]).with_device_override("cpu"))
    .await
    .unwrap();
  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.execution_device_override.as_deref(), Some("cpu"));
  assert!(record.log.contains("Computing device override set to cpu"));
}

#[tokio::test]
async fn test_panicking_runner_ends_failed() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "panicking", "panicking").await;
  let executor = executor(&fx, Backend::InProcess, 1);

  let id = executor
    .submit(ExecutionRequest::new("panicking", vec![]))
    .await
    .unwrap();
  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.status, ExecutionStatus::Failed);
  assert_eq!(record.progress, 1.0);
  assert!(record.log.contains("stage panicked"));
}

#[tokio::test]
async fn test_distributed_backend_drops_client_token() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "recorder", "recording").await;
  let executor = executor(
    &fx,
    Backend::Distributed {
      broker_url: "redis://localhost:6379/0".to_string(),
    },
    1,
  );

  let id = executor
    .submit(ExecutionRequest::new("recorder", vec![]).with_session_token("client-token"))
    .await
    .unwrap();
  assert_eq!(executor.record(&id).await.unwrap().session_token, None);

  let record = executor.wait(&id).await.unwrap();
  assert_eq!(record.status, ExecutionStatus::Completed);
  assert_eq!(record.session_token, None);
}

#[tokio::test]
async fn test_finished_tasks_are_released_without_wait() {
  let fx = fixture(1, StaticDeviceProbe::cpu_only());
  publish_cpu(&fx.runtime, "recorder", "recording").await;
  let executor = executor(&fx, Backend::InProcess, 2);

  let mut ids = Vec::new();
  for _ in 0..3 {
    ids.push(
      executor
        .submit(ExecutionRequest::new("recorder", vec![]))
        .await
        .unwrap(),
    );
  }

  // Poll the store the way a client would, never calling `wait`.
  tokio::time::timeout(Duration::from_secs(5), async {
    while executor.running() > 0 {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("finished executions should leave the executor");

  for id in &ids {
    let record = executor.record(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    // Waiting on a finished execution reads the store.
    assert_eq!(executor.wait(id).await.unwrap().status, ExecutionStatus::Completed);
  }
}
