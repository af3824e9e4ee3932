//! Request correlation data carried across HTTP and gRPC hops.
//!
//! A [`Correlation`] is a small ordered key/value map. It travels in the
//! `x-correlation-id` header as `k1=v1,k2=v2` (values percent-encoded) and is
//! stored as a request extension on the receiving side.
//!
//! ```ignore
//! use grpc_platform::correlation::Correlation;
//!
//! let mut correlation = Correlation::parse("tenancy=acme,correlation_id=42");
//! correlation.set("user", "jane doe");
//! assert_eq!(correlation.generate(), "correlation_id=42,tenancy=acme,user=jane%20doe");
//! ```

mod middleware;
mod parse;

pub use middleware::{RequestId, correlation_layer, correlation_middleware};

use std::collections::BTreeMap;
use std::fmt;

pub const TENANCY_KEY: &str = "tenancy";
pub const ID_KEY: &str = "correlation_id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
  values: BTreeMap<String, String>,
}

impl Correlation {
  pub fn new() -> Self {
    Self::default()
  }

  /// Decodes an `x-correlation-id` header value. Never fails; malformed
  /// entries are skipped.
  pub fn parse(header: &str) -> Self {
    Self {
      values: parse::parse_header(header),
    }
  }

  /// Encodes the map as an `x-correlation-id` header value, keys in order.
  pub fn generate(&self) -> String {
    parse::generate_header(&self.values)
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str)
  }

  pub fn has(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  /// Empty keys are ignored; an empty value removes the key.
  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    let value = value.into();
    if key.is_empty() {
      return;
    }
    if value.is_empty() {
      self.values.remove(&key);
    } else {
      self.values.insert(key, value);
    }
  }

  pub fn delete(&mut self, key: &str) -> Option<String> {
    self.values.remove(key)
  }

  /// Copies every entry of `other` into `self`; `other` wins on conflicts.
  pub fn merge(&mut self, other: &Correlation) {
    for (key, value) in &other.values {
      if !value.is_empty() {
        self.values.insert(key.clone(), value.clone());
      }
    }
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.values.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn id(&self) -> Option<&str> {
    self.get(ID_KEY)
  }

  pub fn set_id(&mut self, id: impl Into<String>) {
    self.set(ID_KEY, id);
  }

  pub fn tenancy(&self) -> Option<&str> {
    self.get(TENANCY_KEY)
  }

  pub fn set_tenancy(&mut self, tenancy: impl Into<String>) {
    self.set(TENANCY_KEY, tenancy);
  }

  pub fn into_map(self) -> BTreeMap<String, String> {
    self.values
  }
}

impl fmt::Display for Correlation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.generate())
  }
}

impl From<BTreeMap<String, String>> for Correlation {
  fn from(values: BTreeMap<String, String>) -> Self {
    let mut correlation = Correlation::new();
    for (key, value) in values {
      correlation.set(key, value);
    }
    correlation
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Correlation {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut correlation = Correlation::new();
    for (key, value) in iter {
      correlation.set(key, value);
    }
    correlation
  }
}
