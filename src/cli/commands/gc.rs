//! GC command - reclaim unused binaries and stale volume records

use super::{cancel_on_interrupt, Node};
use crate::cli::args::{GcArgs, OutputFormat};
use crate::config::Config;
use crate::error::AgentCacheResult;
use crate::gc::{GarbageCollector, GcReport};
use crate::ui::{Report, Tone, UiContext};

/// Execute the gc command
pub async fn execute(args: GcArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;
    let gc = GarbageCollector::new(node.store, node.cluster, node.paths)
        .with_max_unmounted_age(config.gc.max_unmounted_volume_age()?)
        .with_config_pins(config.gc.pinned_versions()?);

    let cancel = cancel_on_interrupt();
    let report = match &args.tenant {
        Some(owner) => gc.reconcile(owner, &cancel).await?,
        None => gc.collect_all(&cancel).await?,
    };

    match args.format {
        OutputFormat::Table => {
            table_report(&report, args.tenant.as_deref()).print(&UiContext::detect())
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print_plain(&report),
    }
    Ok(())
}

fn table_report(report: &GcReport, tenant: Option<&str>) -> Report {
    let mut out = Report::titled("Garbage collection");

    if report.skipped {
        out.step_with(
            Tone::Warn,
            format!("{} no longer exists", tenant.unwrap_or("resource")),
            "nothing collected",
        );
        return out;
    }

    for version in &report.removed_versions {
        out.step_with(Tone::Ok, "Removed shared binaries", version);
    }
    for version in &report.removed_tenant_binaries {
        out.step_with(Tone::Ok, "Removed per-tenant binaries", version);
    }
    for volume in &report.removed_volumes {
        out.step_with(Tone::Ok, "Removed stale volume", volume);
    }
    if report.removed_staging > 0 {
        out.step(
            Tone::Ok,
            format!("Removed {} abandoned staging entr(ies)", report.removed_staging),
        );
    }

    if report.cancelled {
        out.close(Tone::Warn, "Cancelled before all phases ran");
    } else if report.total_removed() == 0 {
        out.close(Tone::Ok, "Nothing to collect");
    } else {
        out.close(Tone::Ok, format!("Removed {} item(s)", report.total_removed()));
    }
    out
}

fn print_plain(report: &GcReport) {
    for version in &report.removed_versions {
        println!("version {}", version);
    }
    for version in &report.removed_tenant_binaries {
        println!("tenant-binary {}", version);
    }
    for volume in &report.removed_volumes {
        println!("volume {}", volume);
    }
}
