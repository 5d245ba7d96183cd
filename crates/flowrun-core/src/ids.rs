//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identifier of a Task in the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Reference attached to a single dispatch.
///
/// References are generated by the caller (see [`ReferenceGenerator`]) and
/// travel with the job request, so the processor can recognise duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobReference(String);

impl JobReference {
    /// Create a reference from an existing string.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobReference {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Issues unique, monotonic job references for one process.
///
/// Format: `job-<nonce>-<counter>`. The nonce separates processes, the
/// zero-padded counter keeps lexical order equal to issue order.
#[derive(Debug)]
pub struct ReferenceGenerator {
    nonce: String,
    counter: AtomicU64,
}

impl ReferenceGenerator {
    /// Create a generator with a random per-process nonce.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_nonce(&uuid[..8])
    }

    /// Create a generator with a fixed nonce (useful for testing).
    pub fn with_nonce(nonce: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Issue the next reference.
    pub fn next_reference(&self) -> JobReference {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        JobReference(format!("job-{}-{:08}", self.nonce, n))
    }
}

impl Default for ReferenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_are_monotonic() {
        let gen = ReferenceGenerator::with_nonce("abc");
        let first = gen.next_reference();
        let second = gen.next_reference();

        assert_eq!(first.as_str(), "job-abc-00000001");
        assert!(second > first);
    }

    #[test]
    fn test_generators_do_not_collide() {
        let a = ReferenceGenerator::new();
        let b = ReferenceGenerator::new();
        assert_ne!(a.next_reference(), b.next_reference());
    }

    #[test]
    fn test_id_display() {
        let id = TaskId::new("task-123");
        assert_eq!(format!("{}", id), "task-123");
    }
}
