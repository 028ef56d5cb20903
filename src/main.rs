mod builtin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use algobox_blob::{BlobStore, FsBlobStore};
use algobox_config::ServerConfig;
use algobox_registry::{AlgorithmPackage, DeviceKind};
use algobox_runtime::{
  DataBundle, DataCodec, ExecutionRequest, Executor, JsonCodec, ModuleManifest, Runtime,
  RuntimeConfig,
};
use algobox_session::SessionManager;

/// Algobox - run registered algorithms against stored datasets
#[derive(Parser)]
#[command(name = "algobox")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to a JSON configuration file
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Path to the data directory (default: ~/.algobox)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Publish an algorithm version backed by a built-in runner
  Publish {
    algorithm_id: String,

    /// Runner entry point, e.g. builtin.scale or builtin.threshold
    #[arg(long)]
    entry_point: String,

    /// Display name (defaults to the algorithm id)
    #[arg(long)]
    name: Option<String>,

    /// Version as MAJOR.MINOR
    #[arg(long, default_value = "1.0")]
    version: String,

    #[arg(long, default_value = "cpu")]
    default_device: String,

    /// Supported devices (repeatable; defaults to the default device)
    #[arg(long = "supported-device")]
    supported_devices: Vec<String>,

    /// Asset as PATH=FILE, e.g. files/threshold.json=./threshold.json (repeatable)
    #[arg(long = "asset")]
    assets: Vec<String>,
  },

  /// Run an algorithm and wait for it to finish
  Run {
    algorithm_id: String,

    /// JSON dataset file to upload as input (repeatable)
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// Execution device override (cpu or gpu)
    #[arg(long)]
    device: Option<String>,

    /// Additional parameter as KEY=VALUE; VALUE is parsed as JSON when possible (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,

    #[arg(long)]
    session_token: Option<String>,
  },

  /// Print an execution record
  Show { execution_id: String },

  /// Print a stored dataset
  Dataset { dataset_id: String },

  /// List execution ids
  List,

  /// List published algorithms
  Algorithms,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let mut config = match &cli.config {
    Some(path) => ServerConfig::load(path)
      .with_context(|| format!("failed to load config: {}", path.display()))?,
    None => ServerConfig::default(),
  };
  match cli.data_dir {
    Some(dir) => config.storage.root = dir,
    None if cli.config.is_none() => {
      config.storage.root = dirs::home_dir()
        .context("could not determine home directory")?
        .join(".algobox");
    }
    None => {}
  }

  let Some(command) = cli.command else {
    println!("algobox - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_command(command, config).await })
}

async fn run_command(command: Commands, config: ServerConfig) -> Result<()> {
  tracing::debug!(
    root = %config.storage.root.display(),
    backend = config.inference.backend.name(),
    "opening storage"
  );
  let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage.root.clone()));
  let runtime = Arc::new(Runtime::new(
    blobs,
    Arc::new(builtin::loader()),
    RuntimeConfig::from(&config),
  ));

  match command {
    Commands::Publish {
      algorithm_id,
      entry_point,
      name,
      version,
      default_device,
      supported_devices,
      assets,
    } => {
      let (major, minor) = parse_version(&version)?;
      let default_device: DeviceKind = default_device.parse()?;
      let mut supported = supported_devices
        .iter()
        .map(|d| d.parse::<DeviceKind>())
        .collect::<Result<Vec<_>, _>>()?;
      if supported.is_empty() {
        supported.push(default_device);
      }

      let module = ModuleManifest::new(entry_point).to_bytes()?;
      let name = name.unwrap_or_else(|| algorithm_id.clone());
      let mut package = AlgorithmPackage::new(algorithm_id, name, major, minor, module)
        .with_devices(Some(default_device), supported);
      for asset in &assets {
        let (path, file) = split_pair(asset)?;
        let data = tokio::fs::read(file)
          .await
          .with_context(|| format!("failed to read asset file: {}", file))?;
        package = package.with_asset(path, Bytes::from(data));
      }

      let descriptor = runtime
        .registry()
        .publish(package)
        .await
        .context("failed to publish algorithm")?;
      println!("{}", serde_json::to_string_pretty(&descriptor)?);
    }

    Commands::Run {
      algorithm_id,
      inputs,
      device,
      params,
      session_token,
    } => {
      let mut dataset_ids = Vec::with_capacity(inputs.len());
      for input in &inputs {
        dataset_ids.push(upload_dataset(&runtime, input).await?);
      }

      let mut request = ExecutionRequest::new(algorithm_id, dataset_ids);
      if let Some(device) = device {
        request = request.with_device_override(device);
      }
      if let Some(token) = session_token {
        request = request.with_session_token(token);
      }
      for param in &params {
        let (key, value) = split_pair(param)?;
        let value = serde_json::from_str(value)
          .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        request = request.with_parameter(key, value);
      }

      let sessions = Arc::new(SessionManager::from_settings(&config.session));
      let executor = Executor::new(runtime.clone(), sessions, &config.inference);
      let execution_id = executor
        .submit(request)
        .await
        .context("failed to submit execution")?;
      eprintln!("Submitted execution: {}", execution_id);

      let record = executor.wait(&execution_id).await?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }

    Commands::Show { execution_id } => {
      let record = runtime
        .records()
        .get(&execution_id)
        .await
        .with_context(|| format!("failed to read execution {}", execution_id))?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }

    Commands::Dataset { dataset_id } => {
      let data = runtime
        .blobs()
        .get(runtime.data_collection(), &dataset_id)
        .await
        .with_context(|| format!("failed to read dataset {}", dataset_id))?;
      let bundle = runtime.codec().decode(&data)?;
      println!("{}", serde_json::to_string_pretty(&bundle)?);
    }

    Commands::List => {
      let mut ids = runtime.records().list().await?;
      ids.sort();
      for id in ids {
        println!("{}", id);
      }
    }

    Commands::Algorithms => {
      for descriptor in runtime.registry().list().await? {
        println!(
          "{}\t{}\t{}",
          descriptor.algorithm_id,
          descriptor.label(),
          descriptor.module_reference
        );
      }
    }
  }

  Ok(())
}

async fn upload_dataset(runtime: &Runtime, path: &Path) -> Result<String> {
  let content = tokio::fs::read(path)
    .await
    .with_context(|| format!("failed to read dataset file: {}", path.display()))?;
  let bundle: DataBundle = serde_json::from_slice(&content)
    .with_context(|| format!("failed to parse dataset file: {}", path.display()))?;

  let dataset_id = uuid::Uuid::new_v4().to_string();
  let data = JsonCodec.encode(&bundle)?;
  runtime
    .blobs()
    .put(runtime.data_collection(), &dataset_id, data)
    .await
    .with_context(|| format!("failed to upload dataset: {}", path.display()))?;
  eprintln!("Uploaded {} as dataset {}", path.display(), dataset_id);
  Ok(dataset_id)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
  match pair.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key, value)),
    _ => bail!("expected KEY=VALUE, got '{}'", pair),
  }
}

fn parse_version(version: &str) -> Result<(u32, u32)> {
  let (major, minor) = version.split_once('.').unwrap_or((version, "0"));
  let major = major
    .parse()
    .with_context(|| format!("invalid major version in '{}'", version))?;
  let minor = minor
    .parse()
    .with_context(|| format!("invalid minor version in '{}'", version))?;
  Ok((major, minor))
}
