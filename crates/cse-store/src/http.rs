//! REST implementation of [`EntityStore`]
//!
//! Endpoints live under `{base}/cse/3.0`:
//!
//! | operation       | request                                        |
//! |-----------------|------------------------------------------------|
//! | create          | `POST /clusters`                               |
//! | get             | `GET /cluster/{id}`                            |
//! | update          | `PUT /cluster/{id}` with `If-Match: <version>` |
//! | delete          | `DELETE /cluster/{id}`                         |
//! | list ACL page   | `GET /cluster/{id}/acl?page=N&pageSize=M`      |
//! | replace ACL     | `PUT /cluster/{id}/acl`                        |
//! | delete NFS node | `DELETE /cluster/{id}/nfs/{node}`              |
//! | upgrade plan    | `GET /cluster/{id}/upgrade-plan`               |
//! | upgrade         | `POST /cluster/{id}/action/upgrade`            |
//!
//! Version tokens travel as `ETag` on reads and `If-Match` on writes. Every
//! request is retried on transient failures (network errors, 408, 429, 5xx).

use std::time::Duration;

use async_trait::async_trait;
use http::{header, Method, StatusCode};
use serde::Serialize;
use tracing::debug;

use cse_common::retry::{retry_transient, RetryConfig};
use cse_common::{
    AclGrant, ClusterEntity, ClusterPhase, ClusterStatus, Error, Page, Result, TemplateRef,
    CSE_API_REVISION, CSE_URL_FRAGMENT, DEFAULT_API_VERSION,
};

use crate::EntityStore;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ERROR_CONTEXT: &str = "entity-store";

/// Connection settings for [`HttpEntityStore`]
#[derive(Clone, Debug)]
pub struct HttpStoreConfig {
    /// Platform base URL, e.g. `https://vcd.example.com/api`
    pub base_url: String,
    /// API version sent in the `Accept` header
    pub api_version: String,
    /// Bearer token; requests are sent unauthenticated without one
    pub auth_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl HttpStoreConfig {
    /// Config with default version, timeout and retry policy
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            auth_token: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

/// Request being issued, used to classify failures
#[derive(Clone, Copy, Debug)]
enum Op<'a> {
    Create { name: &'a str },
    Get { id: &'a str },
    Update { id: &'a str, expected: &'a str },
    Delete { id: &'a str },
    ListAcl { id: &'a str },
    ReplaceAcl { id: &'a str },
    DeleteNfsNode { id: &'a str, node: &'a str },
    UpgradePlan { id: &'a str },
    Upgrade { id: &'a str },
}

impl Op<'_> {
    fn name(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create_entity",
            Op::Get { .. } => "get_entity",
            Op::Update { .. } => "update_entity",
            Op::Delete { .. } => "delete_entity",
            Op::ListAcl { .. } => "list_acl",
            Op::ReplaceAcl { .. } => "replace_acl",
            Op::DeleteNfsNode { .. } => "delete_nfs_node",
            Op::UpgradePlan { .. } => "get_upgrade_plan",
            Op::Upgrade { .. } => "upgrade_cluster",
        }
    }

    fn target(&self) -> &str {
        match *self {
            Op::Create { name } => name,
            Op::Get { id }
            | Op::Update { id, .. }
            | Op::Delete { id }
            | Op::ListAcl { id }
            | Op::ReplaceAcl { id }
            | Op::DeleteNfsNode { id, .. }
            | Op::UpgradePlan { id }
            | Op::Upgrade { id } => id,
        }
    }
}

/// Successful response, read fully inside the retry loop
struct RawResponse {
    etag: Option<String>,
    body: Vec<u8>,
}

impl RawResponse {
    fn decode_entity(self, what: &str) -> Result<ClusterEntity> {
        let mut entity: ClusterEntity = serde_json::from_slice(&self.body)
            .map_err(|e| Error::malformed(what, e.to_string()))?;
        if self.etag.is_some() {
            entity.version = self.etag;
        }
        Ok(entity)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessSettings {
    access_setting: Vec<AclGrant>,
}

/// Entity store backed by the platform's REST API
#[derive(Clone)]
pub struct HttpEntityStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
    api_root: String,
}

impl HttpEntityStore {
    /// Build a store with its own HTTP client
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::fatal_with_context(
                    ERROR_CONTEXT,
                    format!("Failed to build HTTP client: {}", e),
                )
            })?;
        Ok(Self::with_client(client, config))
    }

    /// Build a store around an existing client
    pub fn with_client(client: reqwest::Client, config: HttpStoreConfig) -> Self {
        let api_root = format!(
            "{}/{}/{}",
            config.base_url.trim_end_matches('/'),
            CSE_URL_FRAGMENT,
            CSE_API_REVISION
        );
        Self {
            client,
            config,
            api_root,
        }
    }

    /// Same store acting with a different bearer token
    ///
    /// The underlying connection pool is shared.
    pub fn with_auth_token(&self, token: impl Into<String>) -> Self {
        let mut store = self.clone();
        store.config.auth_token = Some(token.into());
        store
    }

    /// Root of the cluster endpoints
    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    fn clusters_url(&self) -> String {
        format!("{}/clusters", self.api_root)
    }

    fn cluster_url(&self, id: &str) -> String {
        format!("{}/cluster/{}", self.api_root, id)
    }

    fn acl_url(&self, id: &str) -> String {
        format!("{}/cluster/{}/acl", self.api_root, id)
    }

    fn cluster_action_url(&self, id: &str, action: &str) -> String {
        format!("{}/cluster/{}/{}", self.api_root, id, action)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url).header(
            header::ACCEPT,
            format!("application/json;version={}", self.config.api_version),
        );
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<F>(&self, op: Op<'_>, build: F) -> Result<RawResponse>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        retry_transient(&self.config.retry, op.name(), || {
            let request = build();
            async move {
                let response = request.send().await.map_err(|e| transport_error(op, e))?;
                let status = response.status();
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await.map_err(|e| transport_error(op, e))?;

                if !status.is_success() {
                    return Err(error_for_status(op, status, &body));
                }
                debug!(operation = op.name(), target = op.target(), %status, "store request ok");
                Ok(RawResponse {
                    etag,
                    body: body.to_vec(),
                })
            }
        })
        .await
    }
}

#[async_trait]
impl EntityStore for HttpEntityStore {
    async fn create(&self, entity: &ClusterEntity) -> Result<ClusterEntity> {
        let url = self.clusters_url();
        let op = Op::Create { name: &entity.name };
        self.execute(op, || self.request(Method::POST, &url).json(entity))
            .await?
            .decode_entity("create response")
    }

    async fn update(
        &self,
        id: &str,
        entity: &ClusterEntity,
        expected_version: &str,
    ) -> Result<ClusterEntity> {
        let url = self.cluster_url(id);
        let op = Op::Update {
            id,
            expected: expected_version,
        };
        self.execute(op, || {
            self.request(Method::PUT, &url)
                .header(header::IF_MATCH, expected_version)
                .json(entity)
        })
        .await?
        .decode_entity("update response")
    }

    async fn delete(&self, id: &str) -> Result<ClusterEntity> {
        let url = self.cluster_url(id);
        let raw = self
            .execute(Op::Delete { id }, || self.request(Method::DELETE, &url))
            .await?;

        // Some platform versions answer 204 with no body
        if raw.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ClusterEntity {
                id: Some(id.to_string()),
                status: ClusterStatus::with_phase(ClusterPhase::Deleting),
                ..Default::default()
            });
        }
        raw.decode_entity("delete response")
    }

    async fn get(&self, id: &str) -> Result<ClusterEntity> {
        let url = self.cluster_url(id);
        self.execute(Op::Get { id }, || self.request(Method::GET, &url))
            .await?
            .decode_entity("entity")
    }

    async fn list_acl_page(&self, id: &str, page: u32, page_size: u32) -> Result<Page<AclGrant>> {
        let url = self.acl_url(id);
        let raw = self
            .execute(Op::ListAcl { id }, || {
                self.request(Method::GET, &url)
                    .query(&[("page", page), ("pageSize", page_size)])
            })
            .await?;

        let mut listing: Page<AclGrant> = serde_json::from_slice(&raw.body)
            .map_err(|e| Error::malformed("acl page", e.to_string()))?;
        if listing.page == 0 {
            listing.page = page;
        }
        if listing.page_size == 0 {
            listing.page_size = page_size;
        }
        Ok(listing)
    }

    async fn replace_acl(&self, id: &str, grants: &[AclGrant]) -> Result<()> {
        let url = self.acl_url(id);
        let body = AccessSettings {
            access_setting: grants.iter().map(AclGrant::to_setting).collect(),
        };
        self.execute(Op::ReplaceAcl { id }, || {
            self.request(Method::PUT, &url).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_nfs_node(&self, id: &str, node_name: &str) -> Result<ClusterEntity> {
        let url = self.cluster_action_url(id, &format!("nfs/{}", node_name));
        let op = Op::DeleteNfsNode {
            id,
            node: node_name,
        };
        self.execute(op, || self.request(Method::DELETE, &url))
            .await?
            .decode_entity("nfs node delete response")
    }

    async fn upgrade_plan(&self, id: &str) -> Result<Vec<TemplateRef>> {
        let url = self.cluster_action_url(id, "upgrade-plan");
        let raw = self
            .execute(Op::UpgradePlan { id }, || self.request(Method::GET, &url))
            .await?;
        serde_json::from_slice(&raw.body)
            .map_err(|e| Error::malformed("upgrade plan", e.to_string()))
    }

    async fn upgrade(&self, id: &str, entity: &ClusterEntity) -> Result<ClusterEntity> {
        let url = self.cluster_action_url(id, "action/upgrade");
        self.execute(Op::Upgrade { id }, || {
            self.request(Method::POST, &url).json(entity)
        })
        .await?
        .decode_entity("upgrade response")
    }
}

fn transport_error(op: Op<'_>, e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::fatal_with_context(ERROR_CONTEXT, format!("{}: invalid request: {}", op.name(), e))
    } else {
        Error::transient(format!("{} {}: {}", op.name(), op.target(), e))
    }
}

/// Pull the human readable message out of a platform error body
fn platform_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    ["message", "error description", "detail"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

fn error_for_status(op: Op<'_>, status: StatusCode, body: &[u8]) -> Error {
    let message = platform_message(body).unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        format!("{} returned {}: {}", op.name(), status, text.trim())
    });

    match (status.as_u16(), op) {
        (401 | 403, _) => Error::unauthorized(message),
        (404, Op::ListAcl { id } | Op::ReplaceAcl { id }) => Error::entity_not_found(id),
        (404, Op::DeleteNfsNode { node, .. }) => Error::not_found("node", node),
        (404, Op::Create { .. }) => Error::fatal_with_context(ERROR_CONTEXT, message),
        (404, op) => Error::entity_not_found(op.target()),
        (409, Op::Create { name }) => Error::AlreadyExists {
            id: name.to_string(),
        },
        (409 | 412, Op::Update { id, expected }) => Error::version_conflict(id, expected),
        (408 | 409 | 429, _) | (500..=599, _) => Error::transient_status(status.as_u16(), message),
        _ => Error::fatal_with_context(
            ERROR_CONTEXT,
            format!("{} rejected ({}): {}", op.name(), status, message),
        ),
    }
}
