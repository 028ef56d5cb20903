//! Algobox Registry
//!
//! Resolution of algorithm ids to published [`AlgorithmDescriptor`]s, plus
//! access to the module archives and assets they reference. Publishing a
//! package uploads its module and assets with retry and then writes the
//! descriptor, so a descriptor is only visible once everything it points to
//! exists.

mod blob_registry;
mod descriptor;
mod error;
mod key;
mod registry;

pub use blob_registry::BlobAlgorithmRegistry;
pub use descriptor::{AlgorithmDescriptor, DeviceKind};
pub use error::RegistryError;
pub use key::AlgorithmKey;
pub use registry::{AlgorithmPackage, AlgorithmRegistry};
