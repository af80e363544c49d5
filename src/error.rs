//! Error taxonomy for the collection pipeline.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the collection pipeline.
pub type Result<T> = std::result::Result<T, CollectError>;

#[derive(Error, Debug)]
pub enum CollectError {
    /// Invalid configuration. Fatal at startup, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control plane could not be reached or listed. Aborts one cycle.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single stat query or file read failed, was malformed, or timed out.
    #[error("read error: {0}")]
    Read(String),

    /// An expected sub-resource or file is absent.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Aggregated per-entity failures of one cycle.
    #[error("{} entities failed: {}", .0.len(), FailureList(.0))]
    EntityFailures(Vec<EntityFailure>),
}

impl CollectError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CollectError::NotFound(_))
    }
}

/// Why a single entity produced no records during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub entity: String,
    pub reason: String,
}

struct FailureList<'a>(&'a [EntityFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} ({})", failure.entity, failure.reason)?;
        }
        Ok(())
    }
}
