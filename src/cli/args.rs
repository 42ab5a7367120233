//! CLI argument definitions using clap derive

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::InstallSource;
use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// agent-cache - node-local agent binary cache
///
/// Installs agent versions into a shared, content-addressed directory,
/// records which volumes use them, and reclaims what nothing uses.
#[derive(Parser, Debug)]
#[command(name = "agent-cache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "AGENT_CACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides [storage].data_dir and CSI_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Repair metadata against live cluster state
    Check(CheckArgs),

    /// Remove unused agent binaries and stale volume records
    Gc(GcArgs),

    /// Install an agent version for a tenant
    Install(InstallArgs),

    /// Record a volume against its tenant's installed version
    Publish(PublishArgs),

    /// Remove a volume record
    Unpublish(UnpublishArgs),

    /// List tenants or volumes
    List(ListArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the gc command
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Run the reconcile-triggered pass for one managed resource
    #[arg(short, long)]
    pub tenant: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the install command
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "agent_version"])))]
pub struct InstallArgs {
    /// Name of the managed resource requesting the agent
    #[arg(short, long)]
    pub tenant: String,

    /// API URL of the tenant (https://<tenant>.<domain>/api)
    #[arg(long)]
    pub api_url: String,

    /// Pull the agent from this OCI image
    #[arg(long)]
    pub image: Option<String>,

    /// Download this agent version from the tenant API
    #[arg(long = "agent-version")]
    pub agent_version: Option<String>,
}

impl InstallArgs {
    /// Where the agent comes from; an image wins over a version
    pub fn source(&self) -> AgentCacheResult<InstallSource> {
        if let Some(reference) = &self.image {
            return Ok(InstallSource::Image {
                reference: reference.clone(),
            });
        }
        let version = self
            .agent_version
            .clone()
            .ok_or_else(|| AgentCacheError::InvalidVersion {
                value: String::new(),
                reason: "pass --agent-version or --image".to_string(),
            })?;
        Ok(InstallSource::Url { version })
    }
}

/// Arguments for the publish command
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// CSI volume ID
    #[arg(long)]
    pub volume_id: String,

    /// Pod the volume is mounted into
    #[arg(long)]
    pub pod: String,

    /// Name of the managed resource the pod belongs to
    #[arg(short, long)]
    pub tenant: String,
}

/// Arguments for the unpublish command
#[derive(Parser, Debug)]
pub struct UnpublishArgs {
    /// CSI volume ID
    #[arg(long)]
    pub volume_id: String,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// What to list
    #[arg(value_enum)]
    pub target: ListTarget,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListTarget {
    Tenants,
    Volumes,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show effective configuration (file, defaults and env overrides)
    Show,

    /// Show configuration file path
    Path,
}

/// Output format for reports and listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
