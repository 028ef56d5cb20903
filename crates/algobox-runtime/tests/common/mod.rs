//! Test runners and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use algobox_blob::{BlobStore, MemoryBlobStore, RetryPolicy};
use algobox_registry::{AlgorithmDescriptor, AlgorithmPackage, DeviceKind};
use algobox_runtime::{
  Args, DType, DataBundle, DataCodec, DataSchema, Field, JsonCodec, ModuleManifest, RunInput,
  Runner, RunnerContext, RunnerError, RunnerFactoryRegistry, Runtime, RuntimeConfig,
  StaticDeviceProbe, TaskHandler, Tensor,
};
use algobox_session::TaskSession;
use algobox_store::ExecutionRecord;
use async_trait::async_trait;
use bytes::Bytes;

pub const WEIGHTS_ASSET: &str = "files/weights.json";
pub const PARENT_ASSET: &str = "files/parent.json";

/// Loads `weights` as an asset and scales the `data` tensor of every input
/// dataset by the `factor` argument.
#[derive(Default)]
pub struct ScaleRunner {
  pub loads: Arc<AtomicUsize>,
}

#[async_trait]
impl Runner for ScaleRunner {
  type Prepared = Vec<DataBundle>;
  type Inferred = Vec<DataBundle>;

  fn init(&self, ctx: &mut RunnerContext) -> Result<(), RunnerError> {
    ctx.set("scaled", 0usize)
  }

  async fn load_assets(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
  ) -> Result<(), RunnerError> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    let raw = handler.fetch_asset(WEIGHTS_ASSET).await?;
    let weights: Vec<i32> = serde_json::from_slice(&raw)?;
    ctx.set("weights", Mutex::new(weights))
  }

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    _args: &Args,
  ) -> Result<Self::Prepared, RunnerError> {
    let data = handler
      .fetch_data(&input.input_dataset_ids, DataSchema::Generic, &[], false)
      .await?;
    handler.set_progress(0.3).await?;
    Ok(data)
  }

  async fn inference(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    mut data: Self::Prepared,
    args: &Args,
  ) -> Result<Self::Inferred, RunnerError> {
    let factor = args.get("factor").and_then(|v| v.as_f64()).unwrap_or(2.0);
    for bundle in &mut data {
      if let Some(Field::Tensor(t)) = bundle.get_mut("data") {
        t.values.iter_mut().for_each(|v| *v *= factor);
      }
    }
    ctx.set("scaled", data.len())?;
    handler.set_progress(0.6).await?;
    Ok(data)
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Inferred,
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    handler.post_data(data, DataSchema::Generic, true).await
  }
}

/// Records which stages ran and can fail in any of them.
pub struct RecordingRunner {
  pub calls: Arc<Mutex<Vec<&'static str>>>,
  pub fail_in: Option<&'static str>,
}

impl RecordingRunner {
  fn enter(&self, stage: &'static str) -> Result<(), RunnerError> {
    self.calls.lock().unwrap().push(stage);
    if self.fail_in == Some(stage) {
      return Err(RunnerError::stage("bad input"));
    }
    Ok(())
  }
}

#[async_trait]
impl Runner for RecordingRunner {
  type Prepared = ();
  type Inferred = ();

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _input: &RunInput,
    _args: &Args,
  ) -> Result<(), RunnerError> {
    self.enter("preprocess")
  }

  async fn inference(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<(), RunnerError> {
    self.enter("inference")
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    self.enter("postprocess")?;
    Ok(vec!["out-1".to_string()])
  }
}

/// Tries to reassign its frozen `weights` asset during inference.
#[derive(Default)]
pub struct TamperingRunner;

#[async_trait]
impl Runner for TamperingRunner {
  type Prepared = ();
  type Inferred = ();

  async fn load_assets(
    &self,
    ctx: &mut RunnerContext,
    _handler: &TaskHandler,
  ) -> Result<(), RunnerError> {
    ctx.set("weights", Mutex::new(vec![1, 2, 3]))
  }

  async fn preprocess(
    &self,
    ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _input: &RunInput,
    _args: &Args,
  ) -> Result<(), RunnerError> {
    ctx.require::<Mutex<Vec<i32>>>("weights")?.lock().unwrap().push(4);
    Ok(())
  }

  async fn inference(
    &self,
    ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<(), RunnerError> {
    ctx.set("weights", Mutex::new(vec![99, 2, 3]))
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    Ok(vec![])
  }
}

/// Stores its execution id in the context, yields, and checks it is still
/// there afterwards.
#[derive(Default)]
pub struct IsolationRunner;

#[async_trait]
impl Runner for IsolationRunner {
  type Prepared = ();
  type Inferred = ();

  async fn preprocess(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    _input: &RunInput,
    _args: &Args,
  ) -> Result<(), RunnerError> {
    ctx.set("owner", handler.execution_id().to_string())?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    Ok(())
  }

  async fn inference(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<(), RunnerError> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    let owner = ctx.require::<String>("owner")?;
    if owner.as_str() != handler.execution_id() {
      return Err(RunnerError::stage(format!(
        "context of {} leaked into {}",
        owner,
        handler.execution_id()
      )));
    }
    Ok(())
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    Ok(vec![])
  }
}

/// Saves an item to the session with `{"mode": "save"}`, reads it back with
/// `{"mode": "load"}`.
#[derive(Default)]
pub struct SessionRunner;

#[async_trait]
impl Runner for SessionRunner {
  type Prepared = ();
  type Inferred = ();

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    _input: &RunInput,
    args: &Args,
  ) -> Result<(), RunnerError> {
    match args.get("mode").and_then(|v| v.as_str()) {
      Some("load") => {
        let embedding = handler.load_item_from_session::<Vec<f32>>("embedding").await?;
        if embedding.as_slice() != [0.5, 0.25] {
          return Err(RunnerError::stage("unexpected embedding"));
        }
      }
      _ => {
        handler
          .save_item_to_session("embedding", vec![0.5f32, 0.25])
          .await?
      }
    }
    Ok(())
  }

  async fn inference(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<(), RunnerError> {
    Ok(())
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    _data: (),
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    Ok(vec![])
  }
}

/// Fetches the `scale` algorithm as a child runner and reports its weights.
#[derive(Default)]
pub struct ParentRunner;

#[async_trait]
impl Runner for ParentRunner {
  type Prepared = usize;
  type Inferred = usize;

  async fn preprocess(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    _input: &RunInput,
    _args: &Args,
  ) -> Result<usize, RunnerError> {
    ctx.set("role", "parent".to_string())?;
    let own = handler.fetch_asset(PARENT_ASSET).await?;

    let child = handler.fetch_algorithm("scale", None).await?;
    if child.context().contains("role") {
      return Err(RunnerError::stage("child sees the parent context"));
    }
    let weights = child.context().require::<Mutex<Vec<i32>>>("weights")?;
    let len = weights.lock().unwrap().len();

    if handler.fetch_asset(PARENT_ASSET).await? != own {
      return Err(RunnerError::stage("parent asset changed after the child fetch"));
    }
    let own_weights: Vec<i32> = serde_json::from_slice(&handler.fetch_asset(WEIGHTS_ASSET).await?)?;
    if own_weights != vec![9] {
      return Err(RunnerError::stage("parent resolved the child's weights"));
    }
    Ok(len)
  }

  async fn inference(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    data: usize,
    _args: &Args,
  ) -> Result<usize, RunnerError> {
    Ok(data)
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    data: usize,
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    Ok(vec![format!("weights:{}", data)])
  }
}

/// Indexes past the end of its inputs in `preprocess`.
#[derive(Default)]
pub struct PanickingRunner;

#[async_trait]
impl Runner for PanickingRunner {
  type Prepared = String;
  type Inferred = String;

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    input: &RunInput,
    _args: &Args,
  ) -> Result<String, RunnerError> {
    Ok(input.input_dataset_ids[3].clone())
  }

  async fn inference(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    data: String,
    _args: &Args,
  ) -> Result<String, RunnerError> {
    Ok(data)
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
    data: String,
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    Ok(vec![data])
  }
}

pub struct Fixture {
  pub blobs: Arc<MemoryBlobStore>,
  pub runtime: Arc<Runtime>,
  pub scale_loads: Arc<AtomicUsize>,
  pub calls: Arc<Mutex<Vec<&'static str>>>,
}

/// A runtime over an in-memory blob store with every test runner registered.
pub fn fixture(cache_size: usize, probe: StaticDeviceProbe) -> Fixture {
  fixture_failing_in(cache_size, probe, None)
}

pub fn fixture_failing_in(
  cache_size: usize,
  probe: StaticDeviceProbe,
  fail_in: Option<&'static str>,
) -> Fixture {
  let blobs = Arc::new(MemoryBlobStore::new());
  let scale_loads = Arc::new(AtomicUsize::new(0));
  let calls = Arc::new(Mutex::new(Vec::new()));

  let mut loader = RunnerFactoryRegistry::new();
  let loads = scale_loads.clone();
  loader.register_with("scale", move || ScaleRunner {
    loads: loads.clone(),
  });
  let recorded = calls.clone();
  loader.register_with("recording", move || RecordingRunner {
    calls: recorded.clone(),
    fail_in,
  });
  loader
    .register::<TamperingRunner>("tampering")
    .register::<IsolationRunner>("isolation")
    .register::<SessionRunner>("session")
    .register::<ParentRunner>("parent")
    .register::<PanickingRunner>("panicking");

  let config = RuntimeConfig {
    algorithm_cache_size: cache_size,
    retry: RetryPolicy::none(),
    ..RuntimeConfig::default()
  };
  let runtime = Runtime::new(blobs.clone(), Arc::new(loader), config).with_probe(Arc::new(probe));

  Fixture {
    blobs,
    runtime: Arc::new(runtime),
    scale_loads,
    calls,
  }
}

/// Publish version 1.0 of an algorithm whose module points at `entry_point`.
pub async fn publish(
  runtime: &Runtime,
  algorithm_id: &str,
  entry_point: &str,
  default_device: Option<DeviceKind>,
  supported: Vec<DeviceKind>,
) -> AlgorithmDescriptor {
  let module = ModuleManifest::new(entry_point).to_bytes().unwrap();
  let package = AlgorithmPackage::new(algorithm_id, entry_point, 1, 0, module)
    .with_devices(default_device, supported)
    .with_asset(WEIGHTS_ASSET, Bytes::from_static(b"[1, 2, 3]"));
  runtime.registry().publish(package).await.unwrap()
}

pub async fn publish_cpu(runtime: &Runtime, algorithm_id: &str, entry_point: &str) -> AlgorithmDescriptor {
  publish(
    runtime,
    algorithm_id,
    entry_point,
    Some(DeviceKind::Cpu),
    vec![DeviceKind::Cpu],
  )
  .await
}

/// Publish a `parent` algorithm whose weights differ from the child's and
/// which carries an asset of its own.
pub async fn publish_parent(runtime: &Runtime, algorithm_id: &str) -> AlgorithmDescriptor {
  let module = ModuleManifest::new("parent").to_bytes().unwrap();
  let package = AlgorithmPackage::new(algorithm_id, "parent", 1, 0, module)
    .with_devices(Some(DeviceKind::Cpu), vec![DeviceKind::Cpu])
    .with_asset(WEIGHTS_ASSET, Bytes::from_static(b"[9]"))
    .with_asset(PARENT_ASSET, Bytes::from_static(br#"{"role": "parent"}"#));
  runtime.registry().publish(package).await.unwrap()
}

/// Store a PENDING record, as the API layer does on request.
pub async fn accept(runtime: &Runtime, algorithm_id: &str, inputs: Vec<String>) -> ExecutionRecord {
  let id = uuid::Uuid::new_v4().to_string();
  let record = ExecutionRecord::new(id, algorithm_id, inputs);
  runtime.records().create(&record).await.unwrap();
  record
}

pub async fn start_handler(
  runtime: &Arc<Runtime>,
  record: &ExecutionRecord,
  session: Option<TaskSession>,
) -> TaskHandler {
  TaskHandler::start(runtime.clone(), &record.execution_id, session)
    .await
    .unwrap()
}

pub fn data_bundle(values: Vec<f64>) -> DataBundle {
  let len = values.len();
  DataBundle::from([(
    "data".to_string(),
    Field::Tensor(Tensor::new(DType::F64, vec![len], values).unwrap()),
  )])
}

/// Upload a dataset and return its id.
pub async fn put_dataset(runtime: &Runtime, bundle: &DataBundle) -> String {
  let id = uuid::Uuid::new_v4().to_string();
  let data = JsonCodec.encode(bundle).unwrap();
  runtime
    .blobs()
    .put(runtime.data_collection(), &id, data)
    .await
    .unwrap();
  id
}

pub async fn get_dataset(fixture: &Fixture, id: &str) -> DataBundle {
  let data = fixture
    .blobs
    .get(fixture.runtime.data_collection(), id)
    .await
    .unwrap();
  JsonCodec.decode(&data).unwrap()
}
