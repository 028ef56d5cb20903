//! Execution device selection.

use std::fmt;

use algobox_registry::{AlgorithmDescriptor, DeviceKind};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::RunnerError;
use crate::log::TaskLog;

/// The concrete device a runner is loaded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
  Cpu,
  Cuda,
  Mps,
}

impl Device {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cpu => "cpu",
      Self::Cuda => "cuda",
      Self::Mps => "mps",
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Reports which accelerators the host has.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
  /// Whether a CUDA GPU is usable, and how many there are.
  async fn gpu_available(&self) -> (bool, usize);

  async fn mps_available(&self) -> bool;
}

/// Probe with fixed answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDeviceProbe {
  pub gpus: usize,
  pub mps: bool,
}

impl StaticDeviceProbe {
  pub fn cpu_only() -> Self {
    Self::default()
  }

  pub fn with_gpus(gpus: usize) -> Self {
    Self { gpus, mps: false }
  }
}

#[async_trait]
impl DeviceProbe for StaticDeviceProbe {
  async fn gpu_available(&self) -> (bool, usize) {
    (self.gpus > 0, self.gpus)
  }

  async fn mps_available(&self) -> bool {
    self.mps
  }
}

/// Probe that asks `nvidia-smi` once and remembers the answer.
#[derive(Debug, Default)]
pub struct SystemDeviceProbe {
  gpus: OnceCell<usize>,
  enable_mps: bool,
}

impl SystemDeviceProbe {
  pub fn new() -> Self {
    Self::default()
  }

  /// Allow MPS on Apple silicon. It is never reported otherwise.
  pub fn with_mps(mut self, enable: bool) -> Self {
    self.enable_mps = enable;
    self
  }

  async fn query_gpus() -> usize {
    let output = tokio::process::Command::new("nvidia-smi")
      .args([
        "--query-gpu=index,name,memory.total",
        "--format=csv,noheader,nounits",
      ])
      .output()
      .await;
    match output {
      Ok(out) if out.status.success() => parse_gpu_listing(&String::from_utf8_lossy(&out.stdout)),
      Ok(out) => {
        debug!(status = %out.status, "nvidia-smi failed, assuming no gpu");
        0
      }
      Err(e) => {
        debug!(error = %e, "nvidia-smi unavailable, assuming no gpu");
        0
      }
    }
  }
}

#[async_trait]
impl DeviceProbe for SystemDeviceProbe {
  async fn gpu_available(&self) -> (bool, usize) {
    let count = *self.gpus.get_or_init(Self::query_gpus).await;
    (count > 0, count)
  }

  async fn mps_available(&self) -> bool {
    self.enable_mps && cfg!(all(target_os = "macos", target_arch = "aarch64"))
  }
}

/// Count the `index, name, memory` lines of an `nvidia-smi` csv listing.
fn parse_gpu_listing(listing: &str) -> usize {
  listing
    .lines()
    .filter(|line| {
      let parts: Vec<&str> = line.split(',').map(str::trim).collect();
      parts.len() == 3 && parts[0].parse::<u32>().is_ok() && parts[2].parse::<f64>().is_ok()
    })
    .count()
}

/// Pick the device to load an algorithm on.
///
/// A valid override wins. An override the descriptor does not support falls
/// back to the default device with a warning. A GPU or MPS device that is not
/// available falls back to the CPU with a warning.
pub async fn resolve_device(
  descriptor: &AlgorithmDescriptor,
  override_device: Option<&str>,
  probe: &dyn DeviceProbe,
  log: &TaskLog,
) -> Result<Device, RunnerError> {
  if let Some(default) = descriptor.default_device.filter(|d| !descriptor.supports(*d)) {
    return Err(RunnerError::validation(format!(
      "Default device {} is not supported. Supported devices are {:?}.",
      default, descriptor.supported_devices
    )));
  }

  let (gpu_available, _) = probe.gpu_available().await;

  if let Some(requested) = override_device.filter(|d| !d.is_empty()) {
    let kind = requested.parse::<DeviceKind>().ok();
    match kind {
      Some(DeviceKind::Cpu) if descriptor.supports(DeviceKind::Cpu) => {
        log.info(format!(
          "Computing device override set to {}. Running on CPU.",
          requested
        ));
        return Ok(Device::Cpu);
      }
      Some(DeviceKind::Gpu) if descriptor.supports(DeviceKind::Gpu) => {
        if gpu_available {
          log.info(format!(
            "Computing device override set to {}. Running on GPU.",
            requested
          ));
          return Ok(Device::Cuda);
        }
        log.warn(format!(
          "Computing device override set to {}, however CUDA is not available. Running on CPU.",
          requested
        ));
        return Ok(Device::Cpu);
      }
      _ => {
        log.warn(format!(
          "Computing device override {} is not supported, falling back to the default device: {}.",
          requested,
          descriptor.default_device.map(|d| d.as_str()).unwrap_or("")
        ));
      }
    }
  }

  match descriptor.default_device {
    Some(DeviceKind::Cpu) => {
      log.info("Algorithm is set to run on CPU. Running on CPU.");
      Ok(Device::Cpu)
    }
    Some(DeviceKind::Gpu) if gpu_available => {
      log.info("Algorithm is set to run on GPU. Running on GPU.");
      Ok(Device::Cuda)
    }
    Some(DeviceKind::Gpu) => {
      log.warn("Algorithm is set to run on GPU but CUDA is not available. Running on CPU.");
      Ok(Device::Cpu)
    }
    Some(DeviceKind::Mps) => {
      if probe.mps_available().await {
        log.info("Algorithm is set to run on MPS. Running on MPS.");
        Ok(Device::Mps)
      } else {
        log.warn("Algorithm is set to run on MPS, but MPS is not available. Running on CPU.");
        Ok(Device::Cpu)
      }
    }
    None if descriptor.supports(DeviceKind::Gpu) => {
      if gpu_available {
        log.info("No default device specified. CUDA is available and GPU is supported. Running on GPU.");
        Ok(Device::Cuda)
      } else {
        log.warn(
          "No default device specified. GPU is supported but CUDA is not available. Running on CPU.",
        );
        Ok(Device::Cpu)
      }
    }
    None => Err(RunnerError::validation(
      "No default device specified and GPU is not supported.",
    )),
  }
}
