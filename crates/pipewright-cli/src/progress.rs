//! Live run progress printed from the event stream.

use console::style;
use futures::StreamExt;
use pipewright_core::events::{Event, LogStream};
use pipewright_core::ports::EventStream;
use pipewright_core::run::{InstanceStatus, RunReport, RunStatus, StepStatus};
use tracing::debug;

/// Print instance transitions until the run completes.
pub async fn follow(mut events: EventStream, verbose: bool) {
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Progress stream lagged");
                continue;
            }
        };
        if let Some(line) = render(&event, verbose) {
            println!("{line}");
        }
        if matches!(event, Event::RunCompleted(_)) {
            break;
        }
    }
}

fn render(event: &Event, verbose: bool) -> Option<String> {
    match event {
        Event::RunStarted(p) => Some(format!(
            "{} {} ({} instances, run {})",
            style("▶").cyan(),
            style(&p.pipeline).bold(),
            p.instance_count,
            style(p.run_id).dim()
        )),
        Event::InstanceStatusChanged(p) => {
            let key = p.instance.as_str();
            let reason = p
                .reason
                .as_ref()
                .map(|r| format!(" {}", style(format!("({r})")).dim()))
                .unwrap_or_default();
            match p.status {
                InstanceStatus::Running => Some(format!("  {} {key}", style("●").cyan())),
                InstanceStatus::Succeeded => Some(format!("  {} {key}", style("✓").green())),
                InstanceStatus::Failed => Some(format!("  {} {key}{reason}", style("✗").red())),
                InstanceStatus::Skipped => Some(format!("  {} {key}{reason}", style("-").dim())),
                InstanceStatus::Cancelled => {
                    Some(format!("  {} {key}{reason}", style("⊘").yellow()))
                }
                InstanceStatus::Blocked | InstanceStatus::Pending => None,
            }
        }
        Event::StepCompleted(p) if verbose || p.status == StepStatus::Failed => {
            let mark = match p.status {
                StepStatus::Succeeded => style("✓").green(),
                StepStatus::Failed => style("✗").red(),
                _ => style("-").dim(),
            };
            let code = p
                .exit_code
                .filter(|code| *code != 0)
                .map(|code| format!(" exit {code}"))
                .unwrap_or_default();
            Some(format!(
                "    {mark} {} / {}{code} {}",
                p.instance,
                p.step,
                style(format!("{}ms", p.duration_ms)).dim()
            ))
        }
        Event::StepOutput(p) if verbose => {
            let prefix = format!("[{} / {}]", p.instance, p.step);
            let prefix = match p.stream {
                LogStream::Stdout => style(prefix).dim(),
                LogStream::Stderr => style(prefix).yellow(),
            };
            Some(format!("      {prefix} {}", p.line))
        }
        Event::ArtifactSealed(p) if verbose => Some(format!(
            "    {} artifact {} ({} bytes) from {}",
            style("↑").blue(),
            p.name,
            p.size_bytes,
            p.producer
        )),
        Event::RunCancelled(_) => Some(format!("{} Cancelling run", style("!").yellow())),
        _ => None,
    }
}

/// Final summary table.
pub fn summary(report: &RunReport) -> String {
    let mut out = String::new();
    let width = report
        .instances
        .iter()
        .map(|i| i.key.as_str().len())
        .max()
        .unwrap_or(0);

    for instance in &report.instances {
        let status = match instance.status {
            InstanceStatus::Succeeded => style(instance.status.as_str()).green(),
            InstanceStatus::Failed => style(instance.status.as_str()).red(),
            InstanceStatus::Cancelled => style(instance.status.as_str()).yellow(),
            _ => style(instance.status.as_str()).dim(),
        };
        let reason = instance
            .reason
            .as_ref()
            .map(|r| format!("  {r}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "  {:<width$}  {status}{reason}\n",
            instance.key.as_str()
        ));
    }

    let headline = match report.status {
        RunStatus::Succeeded => style("Run succeeded").green().bold(),
        RunStatus::Failed => style("Run failed").red().bold(),
        _ => style("Run cancelled").yellow().bold(),
    };
    out.push_str(&format!(
        "{headline} in {:.1}s ({} succeeded, {} failed, {} skipped, {} cancelled)\n",
        report.duration_ms as f64 / 1000.0,
        report.count(InstanceStatus::Succeeded),
        report.count(InstanceStatus::Failed),
        report.count(InstanceStatus::Skipped),
        report.count(InstanceStatus::Cancelled),
    ));
    out
}
