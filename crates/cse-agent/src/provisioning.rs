//! Cluster provisioning backend
//!
//! The compute/network steps that stand up and tear down cluster nodes live
//! behind [`ProvisioningBackend`]. The reconcilers only decide *which* nodes
//! should exist; the backend makes it so.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use cse_common::retry::{retry_transient, RetryConfig};
use cse_common::{ClusterSpec, Error, Node, NodeRole, Result, TemplateRef};

/// A node the backend is asked to create
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Node name
    pub name: String,
    /// Node role
    pub role: NodeRole,
}

/// Names for `count` nodes of a role, numbered from `first_ordinal`
pub fn plan_nodes(role: NodeRole, count: u32, first_ordinal: u32) -> Vec<NodeRequest> {
    (first_ordinal..first_ordinal + count)
        .map(|n| NodeRequest {
            name: format!("{}-{}", role.name_prefix(), n),
            role,
        })
        .collect()
}

/// Request to stand up nodes for a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Entity the nodes belong to
    pub entity_id: String,
    /// Cluster name
    pub cluster_name: String,
    /// Node template
    pub template: TemplateRef,
    /// Network the nodes attach to
    pub network: String,
    /// Storage profile for node disks
    pub storage_profile: Option<String>,
    /// SSH key to inject
    pub ssh_key: Option<String>,
    /// Nodes to create
    pub nodes: Vec<NodeRequest>,
}

impl ProvisionRequest {
    /// Request for specific nodes of a cluster with the given spec
    pub fn for_nodes(
        entity_id: impl Into<String>,
        cluster_name: impl Into<String>,
        spec: &ClusterSpec,
        nodes: Vec<NodeRequest>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            cluster_name: cluster_name.into(),
            template: spec.template.clone(),
            network: spec.network.clone(),
            storage_profile: spec.storage_profile.clone(),
            ssh_key: spec.ssh_key.clone(),
            nodes,
        }
    }

    /// Request for every node a spec describes
    pub fn for_spec(
        entity_id: impl Into<String>,
        cluster_name: impl Into<String>,
        spec: &ClusterSpec,
    ) -> Self {
        let mut nodes = plan_nodes(NodeRole::ControlPlane, spec.control_plane_count, 1);
        nodes.extend(plan_nodes(NodeRole::Worker, spec.worker_count, 1));
        nodes.extend(plan_nodes(NodeRole::Nfs, spec.nfs_count, 1));
        Self::for_nodes(entity_id, cluster_name, spec, nodes)
    }
}

/// A node that was requested but did not join
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// Node name
    pub name: String,
    /// Node role
    pub role: NodeRole,
    /// Why it failed
    pub reason: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

/// Outcome of a provision call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSet {
    /// Nodes that joined
    pub nodes: Vec<Node>,
    /// Nodes that did not
    pub failures: Vec<NodeFailure>,
}

impl NodeSet {
    /// Whether every requested node joined
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures rendered for status and error records
    pub fn failure_messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }
}

/// Cluster access credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Kubeconfig document
    pub kubeconfig: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("kubeconfig", &"<redacted>")
            .finish()
    }
}

/// Trait abstracting node provisioning
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Create the requested nodes; nodes that fail to join are reported, not errors
    async fn provision(&self, request: &ProvisionRequest) -> Result<NodeSet>;

    /// Remove specific nodes of a cluster
    async fn remove_nodes(&self, entity_id: &str, names: &[String]) -> Result<()>;

    /// Move every node of a cluster to a new template
    async fn upgrade(&self, entity_id: &str, template: &TemplateRef) -> Result<()>;

    /// Tear down every resource of a cluster
    ///
    /// Fails with `PartialFailure` when some resources could not be removed;
    /// calling it again retries only what is left.
    async fn deprovision(&self, entity_id: &str) -> Result<()>;

    /// Fetch credentials for a provisioned cluster
    async fn fetch_credentials(&self, entity_id: &str) -> Result<Credentials>;
}

/// Backend wrapper that retries transient failures with backoff
pub struct RetryingBackend {
    inner: Arc<dyn ProvisioningBackend>,
    retry: RetryConfig,
}

impl RetryingBackend {
    /// Wrap a backend
    pub fn new(inner: Arc<dyn ProvisioningBackend>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl ProvisioningBackend for RetryingBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<NodeSet> {
        retry_transient(&self.retry, "provision", || self.inner.provision(request)).await
    }

    async fn remove_nodes(&self, entity_id: &str, names: &[String]) -> Result<()> {
        retry_transient(&self.retry, "remove_nodes", || {
            self.inner.remove_nodes(entity_id, names)
        })
        .await
    }

    async fn upgrade(&self, entity_id: &str, template: &TemplateRef) -> Result<()> {
        retry_transient(&self.retry, "upgrade", || {
            self.inner.upgrade(entity_id, template)
        })
        .await
    }

    async fn deprovision(&self, entity_id: &str) -> Result<()> {
        retry_transient(&self.retry, "deprovision", || {
            self.inner.deprovision(entity_id)
        })
        .await
    }

    async fn fetch_credentials(&self, entity_id: &str) -> Result<Credentials> {
        retry_transient(&self.retry, "fetch_credentials", || {
            self.inner.fetch_credentials(entity_id)
        })
        .await
    }
}

struct SimulatedCluster {
    name: String,
    template: TemplateRef,
    nodes: Vec<Node>,
}

#[derive(Default)]
struct SimulatedState {
    clusters: HashMap<String, SimulatedCluster>,
    failing_nodes: HashSet<String>,
    stuck_nodes: HashSet<String>,
    transient_failures: u32,
    torn_down: Vec<String>,
    next_host: u32,
}

impl SimulatedState {
    fn take_transient(&mut self, operation: &str) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(Error::transient(format!("{}: backend busy", operation)));
        }
        Ok(())
    }

    fn next_ip(&mut self) -> String {
        self.next_host += 1;
        format!("10.0.{}.{}", self.next_host / 250, self.next_host % 250 + 2)
    }
}

/// In-process backend that "provisions" nodes instantly
///
/// Supports failure injection: nodes that never join, nodes whose teardown
/// fails, and a budget of transient errors.
#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimulatedState>,
}

impl SimulatedBackend {
    /// Backend where everything succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named node fail to join whenever it is provisioned
    pub fn fail_node(&self, name: impl Into<String>) {
        self.state.lock().failing_nodes.insert(name.into());
    }

    /// Make teardown of the named node fail until [`Self::unstick`] is called
    pub fn fail_teardown_of(&self, name: impl Into<String>) {
        self.state.lock().stuck_nodes.insert(name.into());
    }

    /// Let a previously stuck node be torn down
    pub fn unstick(&self, name: &str) {
        self.state.lock().stuck_nodes.remove(name);
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next_calls(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Whether any resources exist for an entity
    pub fn has_cluster(&self, entity_id: &str) -> bool {
        self.state.lock().clusters.contains_key(entity_id)
    }

    /// Nodes currently provisioned for an entity
    pub fn nodes(&self, entity_id: &str) -> Vec<Node> {
        self.state
            .lock()
            .clusters
            .get(entity_id)
            .map(|c| c.nodes.clone())
            .unwrap_or_default()
    }

    /// Template an entity's nodes currently run
    pub fn template(&self, entity_id: &str) -> Option<TemplateRef> {
        self.state
            .lock()
            .clusters
            .get(entity_id)
            .map(|c| c.template.clone())
    }

    /// Names of every node torn down so far, in order
    pub fn torn_down(&self) -> Vec<String> {
        self.state.lock().torn_down.clone()
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<NodeSet> {
        let mut state = self.state.lock();
        state.take_transient("provision")?;

        let mut set = NodeSet::default();
        let mut joined = Vec::new();
        for node in &request.nodes {
            if state.failing_nodes.contains(&node.name) {
                warn!(entity_id = %request.entity_id, node = %node.name, "node failed to join");
                set.failures.push(NodeFailure {
                    name: node.name.clone(),
                    role: node.role,
                    reason: "node did not join the cluster".to_string(),
                });
                continue;
            }
            joined.push(Node {
                name: node.name.clone(),
                role: node.role,
                ip: Some(state.next_ip()),
            });
        }

        let cluster = state
            .clusters
            .entry(request.entity_id.clone())
            .or_insert_with(|| SimulatedCluster {
                name: request.cluster_name.clone(),
                template: request.template.clone(),
                nodes: Vec::new(),
            });
        for node in &joined {
            cluster.nodes.retain(|n| n.name != node.name);
            cluster.nodes.push(node.clone());
        }
        set.nodes = joined;

        debug!(
            entity_id = %request.entity_id,
            joined = set.nodes.len(),
            failed = set.failures.len(),
            "provisioned nodes"
        );
        Ok(set)
    }

    async fn remove_nodes(&self, entity_id: &str, names: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.take_transient("remove_nodes")?;
        let Some(cluster) = state.clusters.get_mut(entity_id) else {
            return Ok(());
        };
        cluster.nodes.retain(|n| !names.contains(&n.name));
        state.torn_down.extend(names.iter().cloned());
        Ok(())
    }

    async fn upgrade(&self, entity_id: &str, template: &TemplateRef) -> Result<()> {
        let mut state = self.state.lock();
        state.take_transient("upgrade")?;
        let cluster = state
            .clusters
            .get_mut(entity_id)
            .ok_or_else(|| Error::not_found("cluster", entity_id))?;
        info!(entity_id = %entity_id, from = %cluster.template, to = %template, "upgrading nodes");
        cluster.template = template.clone();
        Ok(())
    }

    async fn deprovision(&self, entity_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.take_transient("deprovision")?;
        let Some(mut cluster) = state.clusters.remove(entity_id) else {
            return Ok(());
        };

        let (stuck, removed): (Vec<Node>, Vec<Node>) = cluster
            .nodes
            .drain(..)
            .partition(|n| state.stuck_nodes.contains(&n.name));
        state.torn_down.extend(removed.into_iter().map(|n| n.name));

        if stuck.is_empty() {
            return Ok(());
        }
        let failures = stuck
            .iter()
            .map(|n| format!("{}: teardown failed", n.name))
            .collect();
        cluster.nodes = stuck;
        state.clusters.insert(entity_id.to_string(), cluster);
        Err(Error::partial_failure(
            format!("teardown of cluster {} incomplete", entity_id),
            failures,
        ))
    }

    async fn fetch_credentials(&self, entity_id: &str) -> Result<Credentials> {
        let mut state = self.state.lock();
        state.take_transient("fetch_credentials")?;
        let cluster = state
            .clusters
            .get(entity_id)
            .ok_or_else(|| Error::not_found("cluster", entity_id))?;
        let server = cluster
            .nodes
            .iter()
            .find(|n| n.role == NodeRole::ControlPlane)
            .and_then(|n| n.ip.clone())
            .ok_or_else(|| {
                Error::fatal_with_context(
                    "backend",
                    format!("cluster {} has no control plane address", entity_id),
                )
            })?;

        Ok(Credentials {
            kubeconfig: format!(
                "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: https://{server}:6443\ncontexts:\n- name: {name}-admin@{name}\n  context:\n    cluster: {name}\n    user: {name}-admin\ncurrent-context: {name}-admin@{name}\nusers:\n- name: {name}-admin\n",
                name = cluster.name,
                server = server,
            ),
        })
    }
}
