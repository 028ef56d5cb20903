//! The three-stage runner pipeline.
//!
//! An algorithm implements [`Runner`]. The runtime loads it once per cache
//! entry as a [`LoadedRunner`] (runner object plus frozen assets) and hands
//! every execution its own [`RunnerInstance`] with a fresh context.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use algobox_registry::AlgorithmDescriptor;
use algobox_store::ExecutionStatus;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::context::{AssetSet, Phase, RunnerContext};
use crate::device::Device;
use crate::error::RunnerError;
use crate::handler::TaskHandler;

/// Additional parameters of an execution request.
pub type Args = serde_json::Map<String, serde_json::Value>;

/// Input handed to [`Runner::preprocess`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
  pub input_dataset_ids: Vec<String>,
}

/// A user-supplied algorithm.
///
/// The runner object is shared by every execution using the same cache
/// entry, so it takes `&self` everywhere. Per-execution state goes in the
/// [`RunnerContext`]; everything written there during
/// [`load_assets`](Runner::load_assets) is frozen afterwards.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
  /// Output of `preprocess`, input of `inference`.
  type Prepared: Send;
  /// Output of `inference`, input of `postprocess`.
  type Inferred: Send;

  /// Populate default context attributes. Runs before every execution.
  fn init(&self, _ctx: &mut RunnerContext) -> Result<(), RunnerError> {
    Ok(())
  }

  /// Load long-lived assets. Runs once per loaded runner.
  async fn load_assets(
    &self,
    _ctx: &mut RunnerContext,
    _handler: &TaskHandler,
  ) -> Result<(), RunnerError> {
    Ok(())
  }

  async fn preprocess(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    args: &Args,
  ) -> Result<Self::Prepared, RunnerError>;

  async fn inference(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Prepared,
    args: &Args,
  ) -> Result<Self::Inferred, RunnerError>;

  /// Persist the result and return the output dataset ids.
  async fn postprocess(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Inferred,
    args: &Args,
  ) -> Result<Vec<String>, RunnerError>;
}

/// Object-safe form of [`Runner`], implemented for every runner.
#[async_trait]
pub trait DynRunner: Send + Sync {
  fn init_context(&self, ctx: &mut RunnerContext) -> Result<(), RunnerError>;

  async fn load_context_assets(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
  ) -> Result<(), RunnerError>;

  /// Drive preprocess, inference and postprocess with timing and log flushes.
  async fn run_stages(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    args: &Args,
  ) -> Result<Vec<String>, RunnerError>;
}

#[async_trait]
impl<R: Runner> DynRunner for R {
  fn init_context(&self, ctx: &mut RunnerContext) -> Result<(), RunnerError> {
    Runner::init(self, ctx)
  }

  async fn load_context_assets(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
  ) -> Result<(), RunnerError> {
    Runner::load_assets(self, ctx, handler).await
  }

  async fn run_stages(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    let start = Instant::now();
    handler.set_status(ExecutionStatus::Running).await?;
    let prepared = self.preprocess(ctx, handler, input, args).await?;
    handler.log().info(format!(
      "Data preprocessing finished in {:.2} seconds",
      start.elapsed().as_secs_f64()
    ));
    handler.update_log().await?;

    let start = Instant::now();
    handler.log().info("Running inference.");
    let inferred = self.inference(ctx, handler, prepared, args).await?;
    handler.log().info(format!(
      "Inference finished in {:.2} seconds",
      start.elapsed().as_secs_f64()
    ));
    handler.update_log().await?;

    let start = Instant::now();
    handler.log().info("Postprocessing output data.");
    let outputs = self.postprocess(ctx, handler, inferred, args).await?;
    handler.log().info(format!(
      "Postprocessing finished in {:.2} seconds",
      start.elapsed().as_secs_f64()
    ));
    handler.update_log().await?;

    Ok(outputs)
  }
}

/// A runner with its assets loaded and frozen, shared through the cache.
pub struct LoadedRunner {
  runner: Box<dyn DynRunner>,
  assets: Arc<AssetSet>,
  device: Device,
  descriptor: AlgorithmDescriptor,
}

impl LoadedRunner {
  /// Initialize the runner and run its asset loading hook once.
  pub async fn load(
    runner: Box<dyn DynRunner>,
    descriptor: AlgorithmDescriptor,
    device: Device,
    handler: &TaskHandler,
  ) -> Result<Self, RunnerError> {
    let mut ctx = RunnerContext::new(device, Arc::new(AssetSet::empty()));
    runner.init_context(&mut ctx)?;
    ctx.set_phase(Phase::LoadingAssets);
    runner.load_context_assets(&mut ctx, handler).await?;
    let assets = ctx.freeze_assets();
    Ok(Self {
      runner,
      assets,
      device,
      descriptor,
    })
  }

  /// Start a logical execution with a fresh context.
  pub fn initialize(self: &Arc<Self>) -> Result<RunnerInstance, RunnerError> {
    let mut ctx = RunnerContext::new(self.device, self.assets.clone());
    self.runner.init_context(&mut ctx)?;
    ctx.set_phase(Phase::Running);
    Ok(RunnerInstance {
      loaded: self.clone(),
      ctx,
    })
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn assets(&self) -> &Arc<AssetSet> {
    &self.assets
  }

  pub fn descriptor(&self) -> &AlgorithmDescriptor {
    &self.descriptor
  }
}

impl std::fmt::Debug for LoadedRunner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoadedRunner")
      .field("algorithm", &self.descriptor.label())
      .field("device", &self.device)
      .field("assets", &self.assets)
      .finish_non_exhaustive()
  }
}

/// One logical execution of a loaded runner.
#[derive(Debug)]
pub struct RunnerInstance {
  loaded: Arc<LoadedRunner>,
  ctx: RunnerContext,
}

impl RunnerInstance {
  pub fn loaded(&self) -> &Arc<LoadedRunner> {
    &self.loaded
  }

  pub fn device(&self) -> Device {
    self.loaded.device
  }

  pub fn context(&self) -> &RunnerContext {
    &self.ctx
  }

  pub fn context_mut(&mut self) -> &mut RunnerContext {
    &mut self.ctx
  }

  /// Run the pipeline and record the outcome.
  ///
  /// Any stage error marks the execution failed and is returned unchanged.
  /// A panicking stage is reported as a [`RunnerError::Stage`].
  /// While the stages run, `fetch_asset` resolves against this runner's
  /// assets.
  #[instrument(
    name = "runner_run",
    skip(self, handler, input, args),
    fields(
      execution_id = %handler.execution_id(),
      algorithm = %self.loaded.descriptor.label(),
    )
  )]
  pub async fn run(
    &mut self,
    handler: &TaskHandler,
    input: &RunInput,
    args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    handler.log().info("Starting execution.");
    let start = Instant::now();
    let _assets = handler.enter_assets(&self.loaded.descriptor.assets);

    let stages = self
      .loaded
      .runner
      .run_stages(&mut self.ctx, handler, input, args);
    let outputs = match AssertUnwindSafe(stages)
      .catch_unwind()
      .await
      .unwrap_or_else(|payload| Err(RunnerError::from_panic(payload)))
    {
      Ok(outputs) => outputs,
      Err(e) => {
        handler.mark_as_failed(Some(&e)).await;
        return Err(e);
      }
    };

    handler.log().info(format!(
      "Execution completed in {:.2} seconds.",
      start.elapsed().as_secs_f64()
    ));
    handler.mark_as_completed(&outputs).await?;
    Ok(outputs)
  }
}
