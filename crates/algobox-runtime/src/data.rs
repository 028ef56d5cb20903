//! Datasets exchanged with the data store.
//!
//! A dataset is a [`DataBundle`]: named fields, most of them n-dimensional
//! [`Tensor`]s. Bundles are encoded by a [`DataCodec`] and validated against a
//! [`DataSchema`] after every download and before every upload.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
  U8,
  U16,
  I32,
  I64,
  F16,
  F32,
  F64,
}

impl DType {
  pub fn is_float(&self) -> bool {
    matches!(self, Self::F16 | Self::F32 | Self::F64)
  }
}

/// A dense row-major array. Values are held as `f64` whatever the dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
  pub dtype: DType,
  pub shape: Vec<usize>,
  pub values: Vec<f64>,
}

impl Tensor {
  /// Build a tensor, checking that the values fill the shape.
  pub fn new(dtype: DType, shape: Vec<usize>, values: Vec<f64>) -> Result<Self, RunnerError> {
    let tensor = Self {
      dtype,
      shape,
      values,
    };
    tensor.check_len()?;
    Ok(tensor)
  }

  pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
    let len = shape.iter().product();
    Self {
      dtype,
      shape,
      values: vec![0.0; len],
    }
  }

  pub fn ndim(&self) -> usize {
    self.shape.len()
  }

  fn check_len(&self) -> Result<(), RunnerError> {
    let expected: usize = self.shape.iter().product();
    if self.values.len() != expected {
      return Err(RunnerError::validation(format!(
        "tensor of shape {:?} needs {} values, got {}",
        self.shape,
        expected,
        self.values.len()
      )));
    }
    Ok(())
  }
}

/// One named entry of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
  Tensor(Tensor),
  TensorList(Vec<Tensor>),
  Scalars(Vec<f64>),
  Text(String),
}

impl Field {
  fn kind(&self) -> &'static str {
    match self {
      Self::Tensor(_) => "tensor",
      Self::TensorList(_) => "tensor list",
      Self::Scalars(_) => "scalar list",
      Self::Text(_) => "text",
    }
  }
}

/// Named fields of one dataset.
pub type DataBundle = BTreeMap<String, Field>;

/// Converts bundles to and from stored bytes.
pub trait DataCodec: Send + Sync {
  fn encode(&self, bundle: &DataBundle) -> Result<Bytes, RunnerError>;

  fn decode(&self, data: &[u8]) -> Result<DataBundle, RunnerError>;
}

/// Bundles as JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl DataCodec for JsonCodec {
  fn encode(&self, bundle: &DataBundle) -> Result<Bytes, RunnerError> {
    Ok(Bytes::from(serde_json::to_vec(bundle)?))
  }

  fn decode(&self, data: &[u8]) -> Result<DataBundle, RunnerError> {
    Ok(serde_json::from_slice(data)?)
  }
}

/// Expected layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSchema {
  /// `data` tensor of any shape.
  Generic,
  /// `mask` tensor.
  Segmentation,
  /// 2D or 3xHxW `image` with optional `mask` and `points`.
  Image,
  /// 3D `volume` with optional `mask`, `points` and `stats`.
  Volume,
  /// Nx3 float `vertices` and Nx3 integer `faces`, optional `stats`.
  Mesh,
  /// Optional `points1`, `points2`, `confidence`, `transform_matrix` and
  /// `translation_matrix`.
  Alignment,
  /// `features` tensor with `input_size` and `original_size`.
  Embedding,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
  Tensor,
  TensorList,
  Scalars,
  Text,
}

struct Spec {
  name: &'static str,
  kind: Kind,
  required: bool,
}

const fn required(name: &'static str, kind: Kind) -> Spec {
  Spec {
    name,
    kind,
    required: true,
  }
}

const fn optional(name: &'static str, kind: Kind) -> Spec {
  Spec {
    name,
    kind,
    required: false,
  }
}

impl DataSchema {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Generic => "GenericSchema",
      Self::Segmentation => "SegmentationSchema",
      Self::Image => "ImageSchema",
      Self::Volume => "VolumeSchema",
      Self::Mesh => "MeshSchema",
      Self::Alignment => "AlignmentSchema",
      Self::Embedding => "EmbeddingSchema",
    }
  }

  fn fields(&self) -> &'static [Spec] {
    use Kind::*;
    const GENERIC: &[Spec] = &[required("data", Tensor)];
    const SEGMENTATION: &[Spec] = &[required("mask", Tensor)];
    const IMAGE: &[Spec] = &[
      required("image", Tensor),
      optional("mask", Tensor),
      optional("points", TensorList),
    ];
    const VOLUME: &[Spec] = &[
      required("volume", Tensor),
      optional("mask", Tensor),
      optional("points", TensorList),
      optional("stats", Text),
    ];
    const MESH: &[Spec] = &[
      required("vertices", Tensor),
      required("faces", Tensor),
      optional("stats", Text),
    ];
    const ALIGNMENT: &[Spec] = &[
      optional("points1", TensorList),
      optional("points2", TensorList),
      optional("confidence", Scalars),
      optional("transform_matrix", Tensor),
      optional("translation_matrix", Tensor),
    ];
    const EMBEDDING: &[Spec] = &[
      required("features", Tensor),
      required("input_size", Scalars),
      required("original_size", Scalars),
    ];
    match self {
      Self::Generic => GENERIC,
      Self::Segmentation => SEGMENTATION,
      Self::Image => IMAGE,
      Self::Volume => VOLUME,
      Self::Mesh => MESH,
      Self::Alignment => ALIGNMENT,
      Self::Embedding => EMBEDDING,
    }
  }

  /// Validate a bundle and keep only the fields this schema knows.
  pub fn conform(&self, mut bundle: DataBundle) -> Result<DataBundle, RunnerError> {
    let mut out = DataBundle::new();
    for spec in self.fields() {
      match bundle.remove(spec.name) {
        Some(field) => {
          if !matches_kind(&field, spec.kind) {
            return Err(self.invalid(format!(
              "field '{}' cannot be a {}",
              spec.name,
              field.kind()
            )));
          }
          if let Field::Tensor(t) = &field {
            t.check_len().map_err(|e| self.invalid(e.to_string()))?;
          }
          out.insert(spec.name.to_string(), field);
        }
        None if spec.required => {
          return Err(self.invalid(format!("field '{}' is required", spec.name)));
        }
        None => {}
      }
    }
    self.check(&out)?;
    Ok(out)
  }

  fn check(&self, bundle: &DataBundle) -> Result<(), RunnerError> {
    match self {
      Self::Image => {
        let image = tensor(bundle, "image");
        if let Some(v) = image {
          if v.ndim() != 2 && (v.ndim() != 3 || v.shape[0] != 3) {
            return Err(self.invalid(format!(
              "Image must be 2D (got {} dimensions), grayscale or RGB (got {} channels).",
              v.ndim(),
              if v.ndim() == 2 { 1 } else { v.shape.first().copied().unwrap_or(0) }
            )));
          }
          if v.dtype == DType::I32 || v.dtype == DType::I64 {
            return Err(self.invalid(format!(
              "Image must be uint8, uint16, float64, float32 or float16 (got {:?}).",
              v.dtype
            )));
          }
        }
      }
      Self::Volume => {
        if tensor(bundle, "volume").is_some_and(|v| v.ndim() != 3) {
          return Err(self.invalid("Volume must be a 3 dimensional array."));
        }
      }
      Self::Mesh => {
        if tensor(bundle, "vertices")
          .is_some_and(|v| v.ndim() != 2 || v.shape[1] != 3 || v.dtype != DType::F64)
        {
          return Err(self.invalid("Mesh vertices must be Nx3 array of floats"));
        }
        if tensor(bundle, "faces")
          .is_some_and(|v| v.ndim() != 2 || v.shape[1] != 3 || v.dtype != DType::I64)
        {
          return Err(self.invalid(
            "Mesh faces must be Nx3 array of integers pointing into vertices array.",
          ));
        }
      }
      _ => {}
    }
    Ok(())
  }

  fn invalid(&self, message: impl std::fmt::Display) -> RunnerError {
    RunnerError::validation(format!("{} validation failed: {}", self.name(), message))
  }
}

fn tensor<'a>(bundle: &'a DataBundle, name: &str) -> Option<&'a Tensor> {
  match bundle.get(name) {
    Some(Field::Tensor(t)) => Some(t),
    _ => None,
  }
}

fn matches_kind(field: &Field, kind: Kind) -> bool {
  matches!(
    (field, kind),
    (Field::Tensor(_), Kind::Tensor)
      | (Field::TensorList(_), Kind::TensorList)
      | (Field::Scalars(_), Kind::Scalars)
      | (Field::Text(_), Kind::Text)
  )
}
