use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RegistryError;
use crate::key::AlgorithmKey;

/// A class of compute device an algorithm can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
  Cpu,
  Gpu,
  Mps,
}

impl DeviceKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cpu => "cpu",
      Self::Gpu => "gpu",
      Self::Mps => "mps",
    }
  }
}

impl fmt::Display for DeviceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DeviceKind {
  type Err = RegistryError;

  /// Device names are matched case-insensitively.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" => Ok(Self::Cpu),
      "gpu" => Ok(Self::Gpu),
      "mps" => Ok(Self::Mps),
      _ => Err(RegistryError::InvalidDescriptor(format!(
        "unknown device '{}', expected cpu, gpu or mps",
        s
      ))),
    }
  }
}

impl Serialize for DeviceKind {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for DeviceKind {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Serialize an unspecified default device as an empty string.
mod default_device {
  use super::*;

  pub fn serialize<S: Serializer>(
    device: &Option<DeviceKind>,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(device.map(|d| d.as_str()).unwrap_or(""))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<DeviceKind>, D::Error> {
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
      return Ok(None);
    }
    s.parse().map(Some).map_err(serde::de::Error::custom)
  }
}

fn default_cpu() -> Option<DeviceKind> {
  Some(DeviceKind::Cpu)
}

fn default_supported() -> Vec<DeviceKind> {
  vec![DeviceKind::Cpu]
}

fn default_algorithm_type() -> String {
  "Undefined".to_string()
}

/// Metadata of one published algorithm version.
///
/// Stored as JSON in the algorithm collection under [`AlgorithmDescriptor::key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
  pub algorithm_id: String,
  #[serde(rename = "algorithm_name")]
  pub name: String,
  #[serde(rename = "algorithm_major_version")]
  pub major_version: u32,
  #[serde(rename = "algorithm_minor_version")]
  pub minor_version: u32,
  #[serde(default = "default_algorithm_type")]
  pub algorithm_type: String,
  #[serde(rename = "algorithm_tags", default)]
  pub tags: Vec<String>,
  #[serde(rename = "algorithm_description", default)]
  pub description: String,
  /// Locator of the code module in the module collection.
  #[serde(rename = "module_id")]
  pub module_reference: String,
  /// Relative asset path to asset locator.
  #[serde(default)]
  pub assets: BTreeMap<String, String>,
  /// `None` when the publisher left the default device unspecified.
  #[serde(with = "default_device", default = "default_cpu")]
  pub default_device: Option<DeviceKind>,
  #[serde(default = "default_supported")]
  pub supported_devices: Vec<DeviceKind>,
  #[serde(rename = "additional_parameters", default)]
  pub additional_parameter_schema: Vec<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub published_at: Option<DateTime<Utc>>,
}

impl AlgorithmDescriptor {
  pub fn key(&self) -> AlgorithmKey {
    AlgorithmKey {
      algorithm_id: self.algorithm_id.clone(),
      name: self.name.clone(),
      major_version: self.major_version,
      minor_version: self.minor_version,
    }
  }

  /// Display label, e.g. `segmenter 1.2`.
  pub fn label(&self) -> String {
    format!("{} {}.{}", self.name, self.major_version, self.minor_version)
  }

  pub fn supports(&self, device: DeviceKind) -> bool {
    self.supported_devices.contains(&device)
  }

  /// Check the device invariants and key-safe fields.
  pub fn validate(&self) -> Result<(), RegistryError> {
    for (field, value) in [("algorithm_id", &self.algorithm_id), ("algorithm_name", &self.name)] {
      if value.is_empty() || value.contains(AlgorithmKey::SEPARATOR) {
        return Err(RegistryError::InvalidDescriptor(format!(
          "{} must be non-empty and must not contain '{}'",
          field,
          AlgorithmKey::SEPARATOR
        )));
      }
    }
    if self.supported_devices.is_empty() {
      return Err(RegistryError::InvalidDescriptor(
        "supported_devices must not be empty".to_string(),
      ));
    }
    if let Some(default) = self.default_device
      && !self.supports(default)
    {
      return Err(RegistryError::InvalidDescriptor(format!(
        "default device '{}' is not in the list of supported devices {:?}",
        default,
        self
          .supported_devices
          .iter()
          .map(|d| d.as_str())
          .collect::<Vec<_>>()
      )));
    }
    Ok(())
  }
}
