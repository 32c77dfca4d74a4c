//! Cluster entity model
//!
//! A [`ClusterEntity`] is the declarative record of one Kubernetes cluster
//! held by the platform's entity store: desired spec, observed status and the
//! version token used for optimistic concurrency.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Entity type id for native clusters
pub const NATIVE_ENTITY_TYPE_ID: &str = "urn:vcloud:type:cse:nativeCluster:2.0.0";

/// Runtime internal name for native clusters
pub const NATIVE_RUNTIME_INTERNAL_NAME: &str = "native";

/// Runtime internal name for TKG+ clusters
pub const TKG_PLUS_RUNTIME_INTERNAL_NAME: &str = "tkgplus";

/// Cluster flavour
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterKind {
    /// Clusters stood up directly by this agent
    #[default]
    #[serde(rename = "native")]
    Native,
    /// Managed clusters backed by the platform's supervisor
    #[serde(rename = "TanzuKubernetesCluster")]
    TanzuKubernetesCluster,
    /// Managed clusters on the TKG+ runtime
    #[serde(rename = "TKG+")]
    TkgPlus,
}

impl ClusterKind {
    /// Display name as used on the wire
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::TanzuKubernetesCluster => "TanzuKubernetesCluster",
            Self::TkgPlus => "TKG+",
        }
    }

    /// Internal runtime name used for placement policies, if the kind has one
    pub fn runtime_internal_name(&self) -> Option<&'static str> {
        match self {
            Self::Native => Some(NATIVE_RUNTIME_INTERNAL_NAME),
            Self::TkgPlus => Some(TKG_PLUS_RUNTIME_INTERNAL_NAME),
            Self::TanzuKubernetesCluster => None,
        }
    }

    /// Reverse of [`ClusterKind::runtime_internal_name`]
    pub fn from_runtime_internal_name(name: &str) -> Option<Self> {
        match name {
            NATIVE_RUNTIME_INTERNAL_NAME => Some(Self::Native),
            TKG_PLUS_RUNTIME_INTERNAL_NAME => Some(Self::TkgPlus),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Reference to a node template (OS image + Kubernetes version bundle)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    /// Template name
    pub name: String,
    /// Template revision
    #[serde(default)]
    pub revision: u32,
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.revision)
    }
}

/// Desired cluster shape
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of control plane nodes
    pub control_plane_count: u32,
    /// Number of worker nodes
    #[serde(default)]
    pub worker_count: u32,
    /// Number of NFS nodes
    #[serde(default)]
    pub nfs_count: u32,
    /// Node template
    pub template: TemplateRef,
    /// Network profile the nodes attach to
    pub network: String,
    /// Storage profile for node disks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<String>,
    /// SSH public key injected into nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

impl ClusterSpec {
    /// Total number of nodes this spec describes
    pub fn node_count(&self) -> u32 {
        self.control_plane_count + self.worker_count + self.nfs_count
    }

    /// Reject specs that can never be provisioned
    pub fn validate(&self, cluster: &str) -> Result<()> {
        if cluster.is_empty() {
            return Err(Error::validation_for(UNNAMED, "cluster name must not be empty"));
        }
        if self.control_plane_count == 0 {
            return Err(Error::validation_for(
                cluster,
                "control plane count must be at least 1",
            ));
        }
        if self.template.name.is_empty() {
            return Err(Error::validation_for(cluster, "template name must be set"));
        }
        if self.network.is_empty() {
            return Err(Error::validation_for(cluster, "network must be set"));
        }
        Ok(())
    }
}

const UNNAMED: &str = "<unnamed>";

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterPhase {
    /// Nodes are being stood up
    #[default]
    Provisioning,
    /// All requested nodes joined
    Ready,
    /// Cluster is usable but some nodes failed to join
    ReadyWithError,
    /// A spec change is being applied
    Updating,
    /// Resources are being torn down
    Deleting,
    /// Teardown partially failed; delete can be re-run
    DeletingWithErrors,
}

impl ClusterPhase {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::ReadyWithError => "ready-with-error",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::DeletingWithErrors => "deleting-with-errors",
        }
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRole {
    /// Kubernetes control plane
    ControlPlane,
    /// Kubernetes worker
    Worker,
    /// NFS storage node
    Nfs,
}

impl NodeRole {
    /// Prefix used in generated node names
    pub fn name_prefix(&self) -> &'static str {
        match self {
            Self::ControlPlane => "mstr",
            Self::Worker => "node",
            Self::Nfs => "nfsd",
        }
    }
}

/// One node of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node (VM) name
    pub name: String,
    /// Role of the node
    pub role: NodeRole,
    /// Primary IP address, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Observed cluster state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Nodes that joined the cluster
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Errors recorded by the last reconciliation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Task that last wrote this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Template the nodes run; only written once the backend confirmed it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
}

impl ClusterStatus {
    /// Status with the given phase and nothing else
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Nodes with the given role, ordered by the numeric suffix of their name
    pub fn nodes_with_role(&self, role: NodeRole) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.iter().filter(|n| n.role == role).collect();
        nodes.sort_by(|a, b| {
            (node_ordinal(&a.name), &a.name).cmp(&(node_ordinal(&b.name), &b.name))
        });
        nodes
    }
}

/// Numeric suffix of a generated node name (`node-12` -> 12)
pub fn node_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

/// A cluster as stored in the platform's entity store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntity {
    /// Platform-assigned identifier; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Cluster name
    pub name: String,
    /// Cluster flavour
    #[serde(default)]
    pub kind: ClusterKind,
    /// Entity type id
    #[serde(default)]
    pub entity_type: String,
    /// Desired state
    pub spec: ClusterSpec,
    /// Observed state
    #[serde(default)]
    pub status: ClusterStatus,
    /// Version token (ETag) of the last read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ClusterEntity {
    /// Create a native cluster entity that has not been stored yet
    pub fn new(name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: ClusterKind::Native,
            entity_type: NATIVE_ENTITY_TYPE_ID.to_string(),
            spec,
            status: ClusterStatus::default(),
            version: None,
        }
    }

    /// Identifier, or an error if the entity was never stored
    pub fn require_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| Error::malformed("entity", format!("entity '{}' has no id", self.name)))
    }

    /// Version token, or an error if the read did not return one
    pub fn require_version(&self) -> Result<&str> {
        self.version.as_deref().ok_or_else(|| {
            Error::malformed(
                "entity",
                format!("entity '{}' was read without a version token", self.name),
            )
        })
    }

    /// Current phase
    pub fn phase(&self) -> ClusterPhase {
        self.status.phase
    }
}
