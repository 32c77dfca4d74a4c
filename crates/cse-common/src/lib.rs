//! Common types for the container service agent: errors, retry, telemetry and
//! the cluster entity / ACL data model shared by the store client and the agent.

#![deny(missing_docs)]

pub mod acl;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod page;
pub mod retry;
pub mod telemetry;

pub use acl::{AccessLevel, AclGrant};
pub use entity::{
    ClusterEntity, ClusterKind, ClusterPhase, ClusterSpec, ClusterStatus, Node, NodeRole,
    TemplateRef,
};
pub use error::{Error, ErrorDetail, ErrorKind};
pub use page::Page;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default API version sent to the platform
pub const DEFAULT_API_VERSION: &str = "36.0";

/// URL fragment of the container service extension API
pub const CSE_URL_FRAGMENT: &str = "cse";

/// API revision of the cluster endpoints
pub const CSE_API_REVISION: &str = "3.0";
