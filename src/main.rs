//! cse - container service agent

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cse::config::{parse_grant, parse_template};
use cse::service::run_agent;
use cse::Settings;
use cse_agent::AclSynchronizer;
use cse_common::telemetry::{init_telemetry, TelemetryConfig};
use cse_common::{AclGrant, TemplateRef};

/// cse - reconciles platform-managed Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "cse", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Log output format
    #[arg(long, env = "CSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent
    ///
    /// Reads behavior messages as JSON lines from stdin, executes each task
    /// at most once, and writes one JSON response line per finished or
    /// replayed task to stdout. Logs go to stderr.
    Agent,

    /// Inspect or change cluster access control lists
    Acl {
        #[command(subcommand)]
        command: AclCommand,
    },

    /// Cluster actions handled by the platform
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ClusterCommand {
    /// Print the templates a cluster can be upgraded to
    UpgradePlan {
        /// Cluster entity id
        entity_id: String,
    },
    /// Upgrade a cluster to a template from its upgrade plan
    Upgrade {
        /// Cluster entity id
        entity_id: String,
        /// Target template as NAME@REVISION
        #[arg(long, value_parser = parse_template)]
        template: TemplateRef,
    },
    /// Remove one NFS node from a cluster
    DeleteNfs {
        /// Cluster entity id
        entity_id: String,
        /// Name of the NFS node
        node: String,
    },
}

#[derive(Subcommand, Debug)]
enum AclCommand {
    /// Print every grant on a cluster
    List {
        /// Cluster entity id
        entity_id: String,
    },
    /// Replace a cluster's ACL with exactly the given grants
    Sync {
        /// Cluster entity id
        entity_id: String,
        /// Grant as SUBJECT=LEVEL (repeatable)
        #[arg(long = "grant", value_parser = parse_grant)]
        grants: Vec<AclGrant>,
    },
    /// Add or change grants, keeping all others
    Share {
        /// Cluster entity id
        entity_id: String,
        /// Grant as SUBJECT=LEVEL (repeatable)
        #[arg(long = "grant", value_parser = parse_grant, required = true)]
        grants: Vec<AclGrant>,
    },
    /// Revoke access of the given subjects
    Unshare {
        /// Cluster entity id
        entity_id: String,
        /// User ids or subject URNs
        #[arg(required = true)]
        subjects: Vec<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_acl(settings: &Settings, command: AclCommand) -> anyhow::Result<()> {
    let acl = AclSynchronizer::new(settings.remote_store()?, settings.page_size);
    match command {
        AclCommand::List { entity_id } => print_json(&acl.list(&entity_id).await?),
        AclCommand::Sync { entity_id, grants } => print_json(&acl.sync(&entity_id, &grants).await?),
        AclCommand::Share { entity_id, grants } => {
            print_json(&acl.share(&entity_id, &grants).await?)
        }
        AclCommand::Unshare {
            entity_id,
            subjects,
        } => print_json(&acl.unshare(&entity_id, &subjects).await?),
    }
}

async fn run_cluster(settings: &Settings, command: ClusterCommand) -> anyhow::Result<()> {
    let store = settings.remote_store()?;
    match command {
        ClusterCommand::UpgradePlan { entity_id } => {
            print_json(&store.upgrade_plan(&entity_id).await?)
        }
        ClusterCommand::Upgrade {
            entity_id,
            template,
        } => {
            let mut entity = store.get(&entity_id).await?;
            info!(
                entity_id = %entity_id,
                from = %entity.spec.template,
                to = %template,
                "requesting upgrade"
            );
            entity.spec.template = template;
            print_json(&store.upgrade(&entity_id, &entity).await?)
        }
        ClusterCommand::DeleteNfs { entity_id, node } => {
            print_json(&store.delete_nfs_node(&entity_id, &node).await?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.log_format == LogFormat::Json,
        ..Default::default()
    })
    .context("failed to initialize telemetry")?;

    match cli.command {
        Commands::Agent => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing running behaviors");
                    on_signal.cancel();
                }
            });
            run_agent(
                &cli.settings,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                cancel,
            )
            .await
        }
        Commands::Acl { command } => run_acl(&cli.settings, command).await,
        Commands::Cluster { command } => run_cluster(&cli.settings, command).await,
    }
}
