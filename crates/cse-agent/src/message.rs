//! Inbound behavior messages and outbound responses
//!
//! A behavior message has two parts: routing `headers` and a `payload` that is
//! itself a JSON document encoded as a string:
//!
//! ```json
//! {
//!   "headers": {
//!     "taskId": "urn:vcloud:task:1",
//!     "entityId": "urn:vcloud:entity:cse:nativeCluster:abc",
//!     "behaviorId": "urn:vcloud:behavior-interface:createCluster:cse:k8s:1.0.0",
//!     "context": {"userId": "...", "orgId": "...", "userName": "...", "rights": [], "isSysAdmin": false}
//!   },
//!   "payload": "{\"entity\": {...}, \"typeId\": \"...\", \"arguments\": {...}}"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cse_common::{ClusterEntity, Error, ErrorDetail, Result, DEFAULT_API_VERSION};

use crate::tracker::{OperationTask, TaskStatus};

/// Prefix of behavior interface ids
pub const BEHAVIOR_URN_PREFIX: &str = "urn:vcloud:behavior-interface:";

/// Vendor, interface and version suffix of the cluster behaviors
pub const BEHAVIOR_URN_SUFFIX: &str = ":cse:k8s:1.0.0";

/// Operation a behavior message asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BehaviorKind {
    /// Stand up a new cluster
    CreateCluster,
    /// Resize or upgrade an existing cluster
    UpdateCluster,
    /// Tear down a cluster
    DeleteCluster,
    /// Fetch cluster credentials
    GetKubeConfig,
}

impl BehaviorKind {
    /// Every behavior, in registration order
    pub const ALL: [BehaviorKind; 4] = [
        Self::CreateCluster,
        Self::UpdateCluster,
        Self::DeleteCluster,
        Self::GetKubeConfig,
    ];

    /// Behavior name as it appears inside the behavior id
    pub fn behavior_name(&self) -> &'static str {
        match self {
            Self::CreateCluster => "createCluster",
            Self::UpdateCluster => "updateCluster",
            Self::DeleteCluster => "deleteCluster",
            Self::GetKubeConfig => "getKubeConfig",
        }
    }

    /// Full behavior id
    pub fn behavior_id(&self) -> String {
        format!(
            "{}{}{}",
            BEHAVIOR_URN_PREFIX,
            self.behavior_name(),
            BEHAVIOR_URN_SUFFIX
        )
    }

    /// Resolve a behavior id; bare behavior names are accepted too
    pub fn from_behavior_id(id: &str) -> Option<Self> {
        let name = id
            .strip_prefix(BEHAVIOR_URN_PREFIX)
            .and_then(|rest| rest.strip_suffix(BEHAVIOR_URN_SUFFIX))
            .unwrap_or(id);
        Self::ALL.into_iter().find(|k| k.behavior_name() == name)
    }

    /// Snake case label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateCluster => "create_cluster",
            Self::UpdateCluster => "update_cluster",
            Self::DeleteCluster => "delete_cluster",
            Self::GetKubeConfig => "get_kubeconfig",
        }
    }
}

impl std::fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the user who triggered the behavior
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    /// User URN
    #[serde(default)]
    pub user_id: String,
    /// Organization URN
    #[serde(default)]
    pub org_id: String,
    /// Login name
    #[serde(default)]
    pub user_name: String,
    /// Rights held by the user
    #[serde(default)]
    pub rights: Vec<String>,
    /// Whether the user is a system administrator
    #[serde(default)]
    pub is_sys_admin: bool,
}

/// Routing headers of a behavior message
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    /// Caller-supplied task id
    pub task_id: String,
    /// Entity the behavior was invoked on
    pub entity_id: String,
    /// Behavior interface id
    pub behavior_id: String,
    /// Caller identity
    #[serde(default)]
    pub context: UserContext,
    /// Caller token; the agent's own credentials are used when absent
    #[serde(default)]
    pub auth_token: Option<String>,
    /// API version the caller speaks
    #[serde(default)]
    pub api_version: Option<String>,
}

impl std::fmt::Debug for MessageHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHeaders")
            .field("task_id", &self.task_id)
            .field("entity_id", &self.entity_id)
            .field("behavior_id", &self.behavior_id)
            .field("context", &self.context)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Decoded body of a behavior message
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorPayload {
    /// Entity snapshot as the caller last saw it
    #[serde(default)]
    pub entity: Value,
    /// Entity type id
    #[serde(default)]
    pub type_id: String,
    /// Behavior arguments
    #[serde(default)]
    pub arguments: Value,
}

/// Raw behavior message with its payload still encoded
#[derive(Clone, Debug, Deserialize)]
pub struct BehaviorMessage {
    /// Routing headers
    pub headers: MessageHeaders,
    /// JSON-encoded [`BehaviorPayload`]
    pub payload: String,
}

impl BehaviorMessage {
    /// Decode the envelope; the payload is decoded separately by [`Self::decode_payload`]
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let message: BehaviorMessage =
            serde_json::from_slice(raw).map_err(|e| Error::malformed("message", e.to_string()))?;
        if message.headers.task_id.trim().is_empty() {
            return Err(Error::malformed("message", "taskId must not be empty"));
        }
        Ok(message)
    }

    /// Decode the string-encoded payload
    pub fn decode_payload(&self) -> Result<BehaviorPayload> {
        serde_json::from_str(&self.payload).map_err(|e| Error::malformed("payload", e.to_string()))
    }
}

/// Everything a handler knows about one invocation
///
/// Built by the dispatcher for a single dispatch and dropped when it returns.
#[derive(Clone)]
pub struct OperationContext {
    /// Task id
    pub task_id: String,
    /// Target entity
    pub entity_id: String,
    /// Behavior id as received
    pub behavior_id: String,
    /// Resolved behavior
    pub behavior: BehaviorKind,
    /// Caller identity
    pub user: UserContext,
    /// Caller token, if the message carried one
    pub auth_token: Option<String>,
    /// API version for calls made on the caller's behalf
    pub api_version: String,
    /// Entity type id from the payload
    pub entity_type_id: String,
    /// Entity snapshot from the payload
    pub entity: Value,
    /// Behavior arguments from the payload
    pub arguments: Value,
    /// When the dispatcher accepted the message
    pub received_at: DateTime<Utc>,
}

impl OperationContext {
    /// Assemble a context from a decoded message
    pub fn new(
        message: &BehaviorMessage,
        behavior: BehaviorKind,
        payload: BehaviorPayload,
        default_api_version: &str,
    ) -> Self {
        let headers = &message.headers;
        Self {
            task_id: headers.task_id.clone(),
            entity_id: headers.entity_id.clone(),
            behavior_id: headers.behavior_id.clone(),
            behavior,
            user: headers.context.clone(),
            auth_token: headers.auth_token.clone(),
            api_version: headers
                .api_version
                .clone()
                .unwrap_or_else(|| default_api_version.to_string()),
            entity_type_id: payload.type_id,
            entity: payload.entity,
            arguments: payload.arguments,
            received_at: Utc::now(),
        }
    }

    /// Context for tests and local tooling
    pub fn for_entity(
        behavior: BehaviorKind,
        task_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            entity_id: entity_id.into(),
            behavior_id: behavior.behavior_id(),
            behavior,
            user: UserContext::default(),
            auth_token: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            entity_type_id: String::new(),
            entity: Value::Null,
            arguments: Value::Null,
            received_at: Utc::now(),
        }
    }

    /// Decode the arguments; missing arguments decode as the type's default
    pub fn arguments<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.arguments.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| Error::malformed("arguments", e.to_string()))
    }

    /// Decode the entity snapshot
    pub fn entity_snapshot(&self) -> Result<ClusterEntity> {
        if self.entity.is_null() {
            return Err(Error::malformed("payload", "entity snapshot is missing"));
        }
        serde_json::from_value(self.entity.clone())
            .map_err(|e| Error::malformed("entity", e.to_string()))
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("task_id", &self.task_id)
            .field("entity_id", &self.entity_id)
            .field("behavior", &self.behavior)
            .field("user", &self.user.user_name)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

/// Reply sent once a task reaches a terminal status (or is replayed)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorResponse {
    /// Task id
    pub task_id: String,
    /// Target entity
    pub entity_id: String,
    /// Task status at the time of the reply
    pub status: TaskStatus,
    /// Handler result, when the task succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Caveat attached to a succeeded-but-degraded result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<ErrorDetail>,
    /// Failure detail, when the task failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl From<&OperationTask> for BehaviorResponse {
    fn from(task: &OperationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            entity_id: task.entity_id.clone(),
            status: task.status,
            payload: task.result.as_ref().map(|r| r.payload.clone()),
            degraded: task.result.as_ref().and_then(|r| r.degraded.clone()),
            error: task.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn raw_message(behavior_id: &str, payload: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "headers": {
                "taskId": "task-1",
                "entityId": "urn:vcloud:entity:cse:nativeCluster:abc",
                "behaviorId": behavior_id,
                "context": {
                    "userId": "urn:vcloud:user:u1",
                    "orgId": "urn:vcloud:org:o1",
                    "userName": "alice",
                    "rights": ["Cluster: View"],
                    "isSysAdmin": false
                },
                "authToken": "secret"
            },
            "payload": payload
        }))
        .unwrap()
    }

    #[rstest]
    #[case("urn:vcloud:behavior-interface:createCluster:cse:k8s:1.0.0", Some(BehaviorKind::CreateCluster))]
    #[case("urn:vcloud:behavior-interface:getKubeConfig:cse:k8s:1.0.0", Some(BehaviorKind::GetKubeConfig))]
    #[case("deleteCluster", Some(BehaviorKind::DeleteCluster))]
    #[case("urn:vcloud:behavior-interface:createCluster:other:k8s:1.0.0", None)]
    #[case("xyz", None)]
    fn test_behavior_id_resolution(#[case] id: &str, #[case] expected: Option<BehaviorKind>) {
        assert_eq!(BehaviorKind::from_behavior_id(id), expected);
    }

    #[test]
    fn test_behavior_ids_round_trip() {
        for kind in BehaviorKind::ALL {
            assert_eq!(BehaviorKind::from_behavior_id(&kind.behavior_id()), Some(kind));
        }
    }

    #[test]
    fn test_decode_builds_context() {
        let payload = r#"{"entity": {"name": "c1"}, "typeId": "urn:vcloud:type:cse:nativeCluster:2.0.0", "arguments": {"rollback": false}}"#;
        let raw = raw_message("updateCluster", payload);

        let message = BehaviorMessage::decode(&raw).unwrap();
        let payload = message.decode_payload().unwrap();
        let ctx = OperationContext::new(&message, BehaviorKind::UpdateCluster, payload, "36.0");

        assert_eq!(ctx.task_id, "task-1");
        assert_eq!(ctx.user.user_name, "alice");
        assert_eq!(ctx.auth_token.as_deref(), Some("secret"));
        assert_eq!(ctx.api_version, "36.0");
        assert_eq!(ctx.entity_type_id, "urn:vcloud:type:cse:nativeCluster:2.0.0");
        assert_eq!(ctx.arguments["rollback"], false);
        assert!(!format!("{:?}", message.headers).contains("secret"));
    }

    #[test]
    fn test_bad_payload_is_malformed_but_headers_survive() {
        let raw = raw_message("createCluster", "{not json");
        let message = BehaviorMessage::decode(&raw).unwrap();
        let err = message.decode_payload().unwrap_err();
        assert!(err.to_string().starts_with("malformed payload"));
    }

    #[test]
    fn test_missing_task_id_is_malformed() {
        let raw = br#"{"headers": {"taskId": " ", "entityId": "e", "behaviorId": "b"}, "payload": "{}"}"#;
        let err = BehaviorMessage::decode(raw).unwrap_err();
        assert!(err.to_string().contains("taskId"));
        assert!(BehaviorMessage::decode(b"[]").is_err());
    }

    #[test]
    fn test_missing_arguments_use_defaults() {
        #[derive(Default, Deserialize)]
        struct Args {
            #[serde(default)]
            rollback: Option<bool>,
        }
        let ctx = OperationContext::for_entity(BehaviorKind::CreateCluster, "t", "e");
        let args: Args = ctx.arguments().unwrap();
        assert!(args.rollback.is_none());
        assert!(ctx.entity_snapshot().is_err());
    }
}
