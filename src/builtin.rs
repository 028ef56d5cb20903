//! Runners shipped with the binary.

use algobox_runtime::{
  Args, DType, DataBundle, DataSchema, Field, RunInput, Runner, RunnerContext, RunnerError,
  RunnerFactoryRegistry, TaskHandler, Tensor,
};
use async_trait::async_trait;

pub const SCALE: &str = "builtin.scale";
pub const THRESHOLD: &str = "builtin.threshold";

/// Asset holding the default cut-off of [`ThresholdRunner`].
pub const THRESHOLD_ASSET: &str = "files/threshold.json";

pub fn loader() -> RunnerFactoryRegistry {
  RunnerFactoryRegistry::new()
    .with::<ScaleRunner>(SCALE)
    .with::<ThresholdRunner>(THRESHOLD)
}

fn data_tensor(bundle: &DataBundle) -> Result<&Tensor, RunnerError> {
  match bundle.get("data") {
    Some(Field::Tensor(t)) => Ok(t),
    _ => Err(RunnerError::validation("dataset has no 'data' tensor")),
  }
}

/// Multiplies the `data` tensor of each input by the `factor` argument.
#[derive(Default)]
pub struct ScaleRunner;

#[async_trait]
impl Runner for ScaleRunner {
  type Prepared = Vec<DataBundle>;
  type Inferred = Vec<DataBundle>;

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    _args: &Args,
  ) -> Result<Self::Prepared, RunnerError> {
    let data = handler
      .fetch_data(&input.input_dataset_ids, DataSchema::Generic, &[], true)
      .await?;
    handler.set_progress(0.2).await?;
    Ok(data)
  }

  async fn inference(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Prepared,
    args: &Args,
  ) -> Result<Self::Inferred, RunnerError> {
    let factor = args.get("factor").and_then(|v| v.as_f64()).unwrap_or(1.0);
    let total = data.len();
    let mut scaled = Vec::with_capacity(total);
    for (i, bundle) in data.iter().enumerate() {
      let t = data_tensor(bundle)?;
      let values = t.values.iter().map(|v| v * factor).collect();
      let out = Tensor::new(t.dtype, t.shape.clone(), values)?;
      scaled.push(DataBundle::from([("data".to_string(), Field::Tensor(out))]));
      handler
        .set_progress(0.2 + 0.6 * (i + 1) as f64 / total as f64)
        .await?;
    }
    Ok(scaled)
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

/// Turns the `data` tensor of each input into a binary segmentation mask.
///
/// The cut-off comes from the `threshold` argument, or from the algorithm's
/// threshold asset when the argument is absent.
#[derive(Default)]
pub struct ThresholdRunner;

#[async_trait]
impl Runner for ThresholdRunner {
  type Prepared = Vec<DataBundle>;
  type Inferred = Vec<DataBundle>;

  fn init(&self, ctx: &mut RunnerContext) -> Result<(), RunnerError> {
    ctx.set("masks_written", 0usize)
  }

  async fn load_assets(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
  ) -> Result<(), RunnerError> {
    let raw = handler.fetch_asset(THRESHOLD_ASSET).await?;
    let threshold: f64 = serde_json::from_slice(&raw)?;
    ctx.set("threshold", threshold)
  }

  async fn preprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    input: &RunInput,
    _args: &Args,
  ) -> Result<Self::Prepared, RunnerError> {
    handler
      .fetch_data(&input.input_dataset_ids, DataSchema::Generic, &["data"], false)
      .await
  }

  async fn inference(
    &self,
    ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Prepared,
    args: &Args,
  ) -> Result<Self::Inferred, RunnerError> {
    let threshold = match args.get("threshold").and_then(|v| v.as_f64()) {
      Some(t) => t,
      None => *ctx.require::<f64>("threshold")?,
    };
    handler
      .log()
      .info(format!("Thresholding {} datasets at {}.", data.len(), threshold));

    let mut masks = Vec::with_capacity(data.len());
    for bundle in &data {
      let t = data_tensor(bundle)?;
      let values = t
        .values
        .iter()
        .map(|v| if *v > threshold { 1.0 } else { 0.0 })
        .collect();
      let mask = Tensor::new(DType::U8, t.shape.clone(), values)?;
      masks.push(DataBundle::from([("mask".to_string(), Field::Tensor(mask))]));
    }
    ctx.set("masks_written", masks.len())?;
    handler.set_progress(0.8).await?;
    Ok(masks)
  }

  async fn postprocess(
    &self,
    _ctx: &mut RunnerContext,
    handler: &TaskHandler,
    data: Self::Inferred,
    _args: &Args,
  ) -> Result<Vec<String>, RunnerError> {
    handler.post_data(data, DataSchema::Segmentation, false).await
  }
}
