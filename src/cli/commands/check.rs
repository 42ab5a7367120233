//! Check command - run the correctness pass

use super::{cancel_on_interrupt, Node};
use crate::cli::args::{CheckArgs, OutputFormat};
use crate::config::Config;
use crate::correctness::{CorrectionReport, CorrectnessChecker};
use crate::error::AgentCacheResult;
use crate::ui::{Report, Tone, UiContext};

/// Execute the check command
pub async fn execute(args: CheckArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;
    let checker = CorrectnessChecker::new(node.store, node.cluster, node.paths);
    let report = checker.correct(&cancel_on_interrupt()).await?;

    match args.format {
        OutputFormat::Table => table_report(&report).print(&UiContext::detect()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print_plain(&report),
    }
    Ok(())
}

fn table_report(report: &CorrectionReport) -> Report {
    let mut out = Report::titled("Metadata correction");

    let groups = [
        ("Volumes without pod", "volume|pod", &report.pruned_volumes),
        ("Tenants without resource", "tenant|owner", &report.pruned_tenants),
        ("Tenants on per-tenant layout", "tenant|owner", &report.migrated_tenants),
    ];
    for (title, label, pairs) in groups {
        if pairs.is_empty() {
            out.step(Tone::Ok, format!("{}: none", title));
            continue;
        }
        out.heading(title);
        for (a, b) in pairs.iter() {
            out.item(format!("{} {}|{}", label, a, b));
        }
    }

    out.field("tenants", report.remaining_tenants)
        .field("volumes", report.remaining_volumes)
        .close(Tone::Ok, format!("Pruned {} row(s)", report.total_pruned()));
    out
}

fn print_plain(report: &CorrectionReport) {
    for (volume, pod) in &report.pruned_volumes {
        println!("volume {}|{}", volume, pod);
    }
    for (tenant, owner) in report.pruned_tenants.iter().chain(&report.migrated_tenants) {
        println!("tenant {}|{}", tenant, owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::Line;

    #[test]
    fn pruned_pairs_are_grouped_under_headings() {
        let report = CorrectionReport {
            pruned_volumes: vec![("vol-1".to_string(), "pod-1".to_string())],
            remaining_tenants: 3,
            ..CorrectionReport::default()
        };
        let out = table_report(&report);

        assert_eq!(out.lines()[0], Line::Heading("Volumes without pod".to_string()));
        assert_eq!(out.lines()[1], Line::Item("volume|pod vol-1|pod-1".to_string()));
        assert!(out
            .plain_lines()
            .contains(&"  [OK] Tenants without resource: none".to_string()));
        assert!(out.plain_lines().contains(&"  tenants: 3".to_string()));
        assert_eq!(out.closing(), Some((Tone::Ok, "Pruned 1 row(s)")));
    }
}
