//! List command - show tenants or volumes

use super::Node;
use crate::cli::args::{ListArgs, ListTarget, OutputFormat};
use crate::config::Config;
use crate::error::AgentCacheResult;
use crate::metadata::{MetadataStore, Tenant, Volume};
use crate::ui::{Report, Tone, UiContext};
use console::style;

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;

    match args.target {
        ListTarget::Tenants => {
            let tenants = node.store.all_tenants().await?;
            match args.format {
                OutputFormat::Table => print_tenant_table(&tenants),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tenants)?),
                OutputFormat::Plain => tenants.iter().for_each(|t| println!("{}", t.tenant_id)),
            }
        }
        ListTarget::Volumes => {
            let volumes = node.store.all_volumes().await?;
            match args.format {
                OutputFormat::Table => print_volume_table(&volumes),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&volumes)?),
                OutputFormat::Plain => volumes.iter().for_each(|v| println!("{}", v.volume_id)),
            }
        }
    }

    Ok(())
}

fn print_tenant_table(tenants: &[Tenant]) {
    if tenants.is_empty() {
        Report::bare()
            .step(Tone::Info, "No tenants recorded")
            .print(&UiContext::detect());
        return;
    }

    println!(
        "{:<24} {:<30} {:<40}",
        style("TENANT").bold(),
        style("OWNER").bold(),
        style("VERSION").bold()
    );
    println!("{}", "-".repeat(94));

    for tenant in tenants {
        let version = match &tenant.latest_version {
            Some(v) => v.to_string(),
            None => style("unresolved").dim().to_string(),
        };
        println!(
            "{:<24} {:<30} {:<40}",
            tenant.tenant_id, tenant.owner_name, version
        );
    }

    println!();
    println!("{} tenant(s)", tenants.len());
}

fn print_volume_table(volumes: &[Volume]) {
    if volumes.is_empty() {
        Report::bare()
            .step(Tone::Info, "No volumes recorded")
            .print(&UiContext::detect());
        return;
    }

    println!(
        "{:<40} {:<30} {:<16} {:<20} {:<16}",
        style("VOLUME").bold(),
        style("POD").bold(),
        style("TENANT").bold(),
        style("VERSION").bold(),
        style("MOUNTED").bold()
    );
    println!("{}", "-".repeat(126));

    for volume in volumes {
        let version: String = volume.version.as_str().chars().take(20).collect();
        println!(
            "{:<40} {:<30} {:<16} {:<20} {:<16}",
            volume.volume_id,
            volume.pod_name,
            volume.tenant_id,
            version,
            volume.mounted_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("{} volume(s)", volumes.len());
}
