//! Install command - bring a tenant to an agent version

use super::{cancel_on_interrupt, Node};
use crate::cli::args::InstallArgs;
use crate::config::Config;
use crate::error::AgentCacheResult;
use crate::events::EventLog;
use crate::provisioner::{ProvisionRequest, Provisioner};
use crate::ui::{Report, Tone, UiContext};
use std::sync::Arc;

/// Execute the install command
pub async fn execute(args: InstallArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;

    let installer = args
        .source()?
        .build(&args.api_url, &config.installer, &node.paths)?;

    let events = Arc::new(EventLog::new(config.storage.event_log_path()));
    let provisioner = Provisioner::new(node.store, node.paths, events);
    let request = ProvisionRequest {
        owner_name: args.tenant,
        api_url: args.api_url,
    };

    let result = provisioner
        .provision(&request, installer.as_ref(), &cancel_on_interrupt())
        .await?;

    let message = if result.freshly_installed {
        "Installed"
    } else {
        "Already present"
    };
    Report::bare()
        .step_with(Tone::Ok, message, result.version.as_str())
        .field("tenant", &result.tenant_id)
        .field("path", result.binary_dir.display())
        .print(&UiContext::detect());
    Ok(())
}
