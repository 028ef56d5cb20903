use std::fmt;

/// Object key of a descriptor in the algorithm collection.
///
/// Format: `{algorithm_id}~{name}~{major}~{minor}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlgorithmKey {
  pub algorithm_id: String,
  pub name: String,
  pub major_version: u32,
  pub minor_version: u32,
}

impl AlgorithmKey {
  pub const SEPARATOR: char = '~';

  /// Parse an object key. Returns `None` unless the key has exactly four
  /// fields and both versions are integers.
  pub fn parse(key: &str) -> Option<Self> {
    let mut parts = key.split(Self::SEPARATOR);
    let algorithm_id = parts.next()?;
    let name = parts.next()?;
    let major_version = parts.next()?.parse().ok()?;
    let minor_version = parts.next()?.parse().ok()?;
    if parts.next().is_some() || algorithm_id.is_empty() {
      return None;
    }
    Some(Self {
      algorithm_id: algorithm_id.to_string(),
      name: name.to_string(),
      major_version,
      minor_version,
    })
  }

  /// Id field of a key, even when the rest of it is malformed.
  pub fn id_of(key: &str) -> &str {
    key.split(Self::SEPARATOR).next().unwrap_or(key)
  }

  pub fn version(&self) -> (u32, u32) {
    (self.major_version, self.minor_version)
  }
}

impl fmt::Display for AlgorithmKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}{sep}{}{sep}{}{sep}{}",
      self.algorithm_id,
      self.name,
      self.major_version,
      self.minor_version,
      sep = Self::SEPARATOR
    )
  }
}
