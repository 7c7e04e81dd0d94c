//! Membership orchestration for a sharded key-value cluster under churn.
//!
//! [`ClusterController`] starts, scales and stops the cluster. It learns
//! members through [`NodeRegistry`], plans slot moves with [`SlotMap`] and
//! executes them with [`MigrationEngine`]. [`TraceReplayer`] implementations
//! turn synthetic or recorded traces into the sizes the controller walks
//! through.

pub mod admin;
pub mod controller;
pub mod error;
pub mod migration;
pub mod node;
pub mod provision;
pub mod registry;
pub mod sim;
pub mod slot_map;
pub mod trace;

pub use admin::{AdminCommand, AdminExt, AdminReply, AdminTransport, RespAdmin, RespAdminConfig};
pub use controller::{
    ClusterController, ClusterState, ControllerConfig, ControllerState, RemovalMode, ScaleReport,
};
pub use error::{ClusterError, Result};
pub use migration::{MigrationConfig, MigrationEngine, TransferOutcome};
pub use node::{InstanceId, Node, NodeAddr, NodeId};
pub use provision::{ComposeConfig, ComposeProvisioner, Instance, Provisioner};
pub use registry::{NodeRegistry, RegistryConfig};
pub use sim::SimCluster;
pub use slot_map::{MigrationPlan, Slot, SlotMap, SlotTransfer, DEFAULT_TOTAL_SLOTS};
pub use trace::{
    Clock, EventLog, ManualClock, RecordedTrace, ReplayConfig, SyntheticTrace, TraceEvent,
    TraceReplayer, TraceSource, TraceStep, WallClock,
};
