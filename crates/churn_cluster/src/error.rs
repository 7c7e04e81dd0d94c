//! Error taxonomy for cluster orchestration.

use std::io;

use thiserror::Error;

use crate::slot_map::Slot;

/// Errors surfaced by the registry, migration engine and controller.
///
/// Component-local retries are exhausted before any of these reach the
/// caller. The end of a trace is not an error: replayers return `Ok(None)`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Slot index outside `[0, total_slots)`.
    #[error("unknown slot {slot} (total slots {total})")]
    UnknownSlot { slot: u32, total: u32 },

    /// A node id that the registry or slot map does not know about.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// No member answered discovery after the bounded retry loop.
    #[error("no cluster member reachable after {attempts} discovery attempts")]
    DiscoveryUnavailable { attempts: u32 },

    /// A slot transfer could not complete within its retry budget.
    #[error("migration {from} -> {to} failed at slot {slot:?}: {reason}")]
    MigrationFailed {
        from: String,
        to: String,
        slot: Option<Slot>,
        reason: String,
    },

    /// Bootstrap never reached the requested size.
    #[error("cluster start failed after {attempts} attempts: reached {reached}/{wanted} nodes")]
    ClusterStartFailed {
        attempts: u32,
        reached: usize,
        wanted: usize,
    },

    /// An administrative or workload command did not signal completion.
    #[error("command {command} did not complete against {target}")]
    CommandTimeout { command: String, target: String },

    /// Operation not allowed in the controller's current state.
    #[error("cannot {op} while {state}")]
    InvalidTransition { op: &'static str, state: String },

    /// The slot map stopped being a total, non-overlapping partition.
    #[error("slot partition violated: {0}")]
    PartitionViolated(String),

    /// Unexpected reply from a cluster member.
    #[error("protocol error from {target}: {message}")]
    Protocol { target: String, message: String },

    /// Provisioning layer command failed.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Trace source could not be read or parsed.
    #[error("trace error: {0}")]
    Trace(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClusterError {
    pub(crate) fn protocol(target: impl ToString, message: impl Into<String>) -> Self {
        Self::Protocol {
            target: target.to_string(),
            message: message.into(),
        }
    }
}

/// Result alias for cluster orchestration.
pub type Result<T> = std::result::Result<T, ClusterError>;
