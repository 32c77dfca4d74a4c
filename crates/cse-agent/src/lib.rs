//! Container service agent core
//!
//! Receives behavior messages for cluster entities and reconciles the
//! platform to match:
//!
//! - [`message`]: inbound message decoding and the per-dispatch [`OperationContext`]
//! - [`tracker`]: task records and the idempotency gate
//! - [`dispatcher`]: routes messages to handlers, at most one execution per task id
//! - [`commands`]: create, update, delete and get-kubeconfig reconcilers
//! - [`provisioning`]: the node provisioning backend seam
//! - [`acl`]: ACL convergence

#![deny(missing_docs)]

pub mod acl;
pub mod commands;
pub mod dispatcher;
pub mod message;
pub mod provisioning;
pub mod tracker;

pub use acl::{grant_for, AclSyncReport, AclSynchronizer};
pub use commands::{cluster_handlers, ReconcilerConfig, ReconcilerContext};
pub use dispatcher::{
    BehaviorHandler, DispatchOutcome, Dispatcher, DispatcherConfig, HandlerRegistry,
};
pub use message::{BehaviorKind, BehaviorMessage, BehaviorResponse, OperationContext};
pub use provisioning::{ProvisioningBackend, RetryingBackend, SimulatedBackend};
pub use tracker::{InMemoryTaskTracker, OperationTask, TaskResult, TaskStatus, TaskTracker};
