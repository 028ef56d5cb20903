//! Algobox Runtime
//!
//! The runner lifecycle and execution-state engine of the backend:
//!
//! - [`RunnerContext`]: per-execution attribute scope with write-once assets
//! - [`Runner`]: the preprocess, inference and postprocess contract, driven by
//!   [`RunnerInstance::run`]
//! - [`AlgorithmCache`]: bounded, single-flight cache of loaded runners
//! - [`TaskHandler`]: the façade a runner uses to report progress, read
//!   assets, move datasets and reach its session
//! - [`Executor`]: accepts requests and runs them in the background
//!
//! ```ignore
//! let runtime = Arc::new(Runtime::new(blobs, Arc::new(loader), RuntimeConfig::default()));
//! let executor = Executor::new(runtime, sessions, &InferenceSettings::default());
//! let id = executor.submit(ExecutionRequest::new("denoiser", vec![dataset_id])).await?;
//! let record = executor.wait(&id).await?;
//! ```

mod cache;
mod context;
mod data;
mod device;
mod error;
mod executor;
mod handler;
mod loader;
mod log;
mod runner;
mod runtime;

pub use cache::{AlgorithmCache, CacheKey};
pub use context::{AssetSet, Phase, RESERVED_NAMES, RunnerContext, Value};
pub use data::{DType, DataBundle, DataCodec, DataSchema, Field, JsonCodec, Tensor};
pub use device::{Device, DeviceProbe, StaticDeviceProbe, SystemDeviceProbe, resolve_device};
pub use error::RunnerError;
pub use executor::{ExecutionRequest, Executor, execute};
pub use handler::{FileStats, TaskHandler};
pub use loader::{ModuleLoader, ModuleManifest, RunnerFactoryRegistry};
pub use log::{Level, TaskLog};
pub use runner::{Args, DynRunner, LoadedRunner, RunInput, Runner, RunnerInstance};
pub use runtime::{Runtime, RuntimeConfig, retry_policy};
