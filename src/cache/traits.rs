//! Core types for the resource cache.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Request;

/// One versioned snapshot of the resource cache, e.g. "outpost-v1".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation {
  name: String,
}

impl Generation {
  /// Build the generation name from the cache prefix and version constant.
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      name: format!("{}-{}", prefix, version),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// Identity of a cache entry: (method, absolute URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
  pub method: Method,
  pub url: Url,
}

impl RequestIdentity {
  pub fn of(request: &Request) -> Self {
    Self {
      method: request.method.clone(),
      url: request.url.clone(),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Indicates where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Request not handled by the worker; plain network exchange
  Bypass,
  /// Served from the current cache generation
  Cache,
  /// Fresh data from network
  Network,
  /// Network unavailable, serving the offline document
  Offline,
  /// Network unavailable and nothing to fall back to
  Unavailable,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Bypass => "bypass",
      Self::Cache => "cache",
      Self::Network => "network",
      Self::Offline => "offline",
      Self::Unavailable => "unavailable",
    };
    f.write_str(s)
  }
}
