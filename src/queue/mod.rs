//! Durable queue of form submissions awaiting delivery.
//!
//! Submissions that could not reach the network are queued per category and
//! relayed by the [`SyncCoordinator`] when a connectivity-restored signal for
//! that category arrives.

mod store;
mod sync;

pub use store::QueueStore;
pub use sync::{SyncCoordinator, SyncReport};

use std::fmt;
use std::str::FromStr;

/// Kind of deferred write; each has its own collection and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
  Assessment,
  Consultation,
}

impl Category {
  pub const ALL: [Category; 2] = [Category::Assessment, Category::Consultation];

  /// Table holding this category's entries.
  pub fn collection(self) -> &'static str {
    match self {
      Self::Assessment => "assessments",
      Self::Consultation => "consultations",
    }
  }

  /// Background-sync tag that triggers a pass for this category.
  pub fn sync_tag(self) -> &'static str {
    match self {
      Self::Assessment => "sync-assessments",
      Self::Consultation => "sync-consultations",
    }
  }

  pub fn from_sync_tag(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|c| c.sync_tag() == tag)
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.collection())
  }
}

impl FromStr for Category {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "assessment" | "assessments" => Ok(Self::Assessment),
      "consultation" | "consultations" => Ok(Self::Consultation),
      other => Err(format!(
        "unknown category '{}', expected 'assessment' or 'consultation'",
        other
      )),
    }
  }
}

/// One deferred write. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSubmission {
  pub id: i64,
  pub category: Category,
  /// Opaque payload, owned by the receiving service
  pub data: Vec<u8>,
}
