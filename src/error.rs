//! Error taxonomy for the dispatch run.
//!
//! Contention, backpressure and stale claims are handled inside the worker
//! and dispatcher loops and never show up here.

use std::time::Duration;

use thiserror::Error;

use crate::locks::Resource;
use crate::types::{RestaurantId, WorkerId};

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("lock on {resource} is poisoned")]
    LockPoisoned { resource: Resource },

    #[error("protocol violation on {resource}: {detail}")]
    ProtocolViolation { resource: Resource, detail: String },

    #[error("no vehicle for restaurant {0}")]
    UnknownRestaurant(RestaurantId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rider {0} panicked")]
    WorkerPanicked(WorkerId),

    #[error("queue did not drain within {0:?}")]
    Stalled(Duration),
}

impl DispatchError {
    pub(crate) fn violation(resource: Resource, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            resource,
            detail: detail.into(),
        }
    }

    /// Internal-consistency faults that must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockPoisoned { .. }
                | Self::ProtocolViolation { .. }
                | Self::UnknownRestaurant(_)
                | Self::WorkerPanicked(_)
        )
    }

    /// Process exit status reported by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidConfig(_) => 64,
            Self::Spawn { .. } => 71,
            Self::Stalled(_) => 75,
            _ => 70,
        }
    }
}
