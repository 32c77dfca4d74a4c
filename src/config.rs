//! Agent settings
//!
//! Command line flags (with environment fallbacks) and their translation into
//! the typed configs of the store, dispatcher and reconcilers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgAction, Args};
use tracing::warn;

use cse_agent::dispatcher::DispatcherConfig;
use cse_agent::{grant_for, ReconcilerConfig};
use cse_common::page::DEFAULT_PAGE_SIZE;
use cse_common::retry::RetryConfig;
use cse_common::{AccessLevel, AclGrant, TemplateRef, DEFAULT_API_VERSION};
use cse_store::{EntityStore, HttpEntityStore, HttpStoreConfig, InMemoryEntityStore, SharedStore, StoreProvider};

/// Settings shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// Platform API base URL (e.g. https://vcd.example.com/api)
    ///
    /// Without one the agent runs against an in-memory store.
    #[arg(long, env = "CSE_STORE_URL")]
    pub store_url: Option<String>,

    /// API version sent to the platform
    #[arg(long, env = "CSE_API_VERSION", default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Service token used when a request carries no token of its own
    #[arg(long, env = "CSE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Page size for ACL listings
    #[arg(
        long,
        env = "CSE_PAGE_SIZE",
        default_value_t = DEFAULT_PAGE_SIZE,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub page_size: u32,

    /// Extra attempts after a version conflict on an entity write
    #[arg(long, env = "CSE_UPDATE_RETRIES", default_value_t = 3)]
    pub update_retries: u32,

    /// Attempts for calls that fail transiently
    #[arg(
        long,
        env = "CSE_RETRY_ATTEMPTS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub retry_attempts: u32,

    /// Roll back creates with failed nodes unless the request says otherwise
    #[arg(long, env = "CSE_ROLLBACK", default_value_t = true, action = ArgAction::Set)]
    pub rollback: bool,

    /// File task records are loaded from at startup and saved to on every change
    #[arg(long, env = "CSE_TASK_JOURNAL")]
    pub task_journal: Option<PathBuf>,

    /// Seconds a delete waits for in-flight work on its cluster
    #[arg(long, env = "CSE_DELETE_QUEUE_TIMEOUT", default_value_t = 300)]
    pub delete_queue_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            auth_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            update_retries: 3,
            retry_attempts: 5,
            rollback: true,
            task_journal: None,
            delete_queue_timeout: 300,
        }
    }
}

/// Entity store handles built from [`Settings`]
pub struct Stores {
    /// Per-caller store access for the reconcilers
    pub provider: Arc<dyn StoreProvider>,
    /// Store acting with the service credentials
    pub service: Arc<dyn EntityStore>,
}

impl Settings {
    /// Retry policy for transient failures
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.retry_attempts)
    }

    /// HTTP store config, if a store URL is set
    pub fn http_store_config(&self) -> Option<HttpStoreConfig> {
        let url = self.store_url.as_ref()?;
        let mut config = HttpStoreConfig::new(url.clone());
        config.api_version = self.api_version.clone();
        config.auth_token = self.auth_token.clone();
        config.retry = self.retry_config();
        Some(config)
    }

    /// Reconciler settings
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            update_retries: self.update_retries,
            default_rollback: self.rollback,
        }
    }

    /// Dispatcher settings
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            api_version: self.api_version.clone(),
            queue_timeout: Duration::from_secs(self.delete_queue_timeout),
            ..Default::default()
        }
    }

    /// Connect to the configured store
    pub fn stores(&self) -> anyhow::Result<Stores> {
        match self.http_store_config() {
            Some(config) => {
                let store = HttpEntityStore::new(config).context("failed to build store client")?;
                Ok(Stores {
                    service: Arc::new(store.clone()),
                    provider: Arc::new(store),
                })
            }
            None => {
                warn!("no store URL configured, using an in-memory entity store");
                let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
                Ok(Stores {
                    provider: Arc::new(SharedStore(store.clone())),
                    service: store,
                })
            }
        }
    }

    /// Like [`Self::stores`] but refuses the in-memory fallback
    pub fn remote_store(&self) -> anyhow::Result<Arc<dyn EntityStore>> {
        if self.store_url.is_none() {
            bail!("--store-url (or CSE_STORE_URL) is required for this command");
        }
        Ok(self.stores()?.service)
    }
}

/// Parse `SUBJECT=LEVEL`, e.g. `alice=ReadOnly` or `urn:vcloud:group:ops=fullcontrol`
pub fn parse_grant(s: &str) -> anyhow::Result<AclGrant> {
    let Some((subject, level)) = s.rsplit_once('=') else {
        bail!("grant '{}' must have the form SUBJECT=LEVEL", s);
    };
    if subject.is_empty() {
        bail!("grant '{}' names no subject", s);
    }
    let level: AccessLevel = level.parse()?;
    Ok(grant_for(subject, level))
}

/// Parse `NAME@REVISION`, e.g. `ubuntu-20.04_k8-1.22@2`
pub fn parse_template(s: &str) -> anyhow::Result<TemplateRef> {
    let Some((name, revision)) = s.rsplit_once('@') else {
        bail!("template '{}' must have the form NAME@REVISION", s);
    };
    if name.is_empty() {
        bail!("template '{}' names no template", s);
    }
    let revision = revision
        .parse()
        .with_context(|| format!("template '{}' has an invalid revision", s))?;
    Ok(TemplateRef {
        name: name.to_string(),
        revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grant_accepts_short_and_urn_levels() {
        let grant = parse_grant("alice=readwrite").unwrap();
        assert_eq!(grant.member_id, "urn:vcloud:user:alice");
        assert_eq!(grant.access_level, AccessLevel::ReadWrite);

        let grant = parse_grant("urn:vcloud:group:ops=urn:vcloud:accessLevel:FullControl").unwrap();
        assert_eq!(grant.member_id, "urn:vcloud:group:ops");
        assert_eq!(grant.access_level, AccessLevel::FullControl);
    }

    #[test]
    fn test_parse_grant_rejects_bad_input() {
        assert!(parse_grant("alice").is_err());
        assert!(parse_grant("=ReadOnly").is_err());
        assert!(parse_grant("alice=owner").is_err());
    }

    #[test]
    fn test_parse_template() {
        let template = parse_template("ubuntu-20.04_k8-1.22@2").unwrap();
        assert_eq!(template.name, "ubuntu-20.04_k8-1.22");
        assert_eq!(template.revision, 2);

        assert!(parse_template("ubuntu").is_err());
        assert!(parse_template("@2").is_err());
        assert!(parse_template("ubuntu@latest").is_err());
    }

    #[test]
    fn test_settings_flow_into_configs() {
        let settings = Settings {
            store_url: Some("https://vcd.example.com/api".to_string()),
            update_retries: 1,
            rollback: false,
            ..Default::default()
        };

        let store = settings.http_store_config().unwrap();
        assert_eq!(store.api_version, "36.0");
        assert_eq!(settings.reconciler_config().write_attempts(), 2);
        assert!(!settings.reconciler_config().default_rollback);
        assert!(Settings::default().http_store_config().is_none());
    }

    #[test]
    fn test_remote_store_requires_url() {
        assert!(Settings::default().remote_store().is_err());
    }
}
