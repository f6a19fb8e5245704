//! Progress bar and report printing for the CLI.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::{
    ArtifactStatus, ProgressEvent, ProgressSink, StatusReport, TransferOutcome, format_bytes,
    format_duration, format_percent, format_speed,
};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates the bar for one artifact. Its length is set by the first event.
pub fn make_progress_bar(name: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    let template = ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(template.progress_chars("━━╌"));
    bar.set_message(name.to_string());
    bar
}

/// Drives a progress bar from transfer events.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub const fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn on_event(&self, event: &ProgressEvent) {
        let report = &event.report;
        if report.total_bytes > 0 && self.bar.length() != Some(report.total_bytes) {
            self.bar.set_length(report.total_bytes);
        }
        self.bar.set_position(report.downloaded_bytes);
        if report.status != ArtifactStatus::Downloading {
            self.bar
                .set_message(format!("{} ({})", event.artifact_id, report.status));
        }
    }
}

fn styled_status(status: ArtifactStatus) -> String {
    let text = status.as_str();
    match status {
        ArtifactStatus::Completed => style(text).green().to_string(),
        ArtifactStatus::Error => style(text).red().to_string(),
        ArtifactStatus::Paused => style(text).yellow().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

/// Prints one artifact's report on a single line.
pub fn print_report(artifact_id: &str, report: &StatusReport) {
    println!(
        "{artifact_id}: {} / {} ({}) {}",
        format_bytes(report.downloaded_bytes),
        format_bytes(report.total_bytes),
        format_percent(report.percent),
        styled_status(report.status)
    );
    if let Some(error) = &report.error {
        println!("  {}", style(error).red());
    }
}

/// Prints a table of every recorded artifact.
pub fn print_list(reports: &[(String, StatusReport)]) {
    if reports.is_empty() {
        println!("No artifacts recorded.");
        return;
    }
    println!("{SEPARATOR}");
    for (id, report) in reports {
        print_report(id, report);
    }
    println!("{SEPARATOR}");
    println!("  {} artifact(s)", reports.len());
}

/// Prints the summary of a finished transfer attempt.
pub fn print_summary(artifact_id: &str, outcome: &TransferOutcome) {
    let stats = &outcome.stats;
    println!("\n{SEPARATOR}");
    print_report(artifact_id, &outcome.report);
    println!("{SEPARATOR}");
    if stats.resumed_from > 0 {
        println!("  Resumed from:      {}", format_bytes(stats.resumed_from));
    }
    println!("  Received:          {}", format_bytes(stats.bytes_received));
    println!("  Time:              {}", format_duration(stats.elapsed));
    println!("  Average speed:     {}", format_speed(stats.average_speed));
    println!("  Peak speed:        {}", format_speed(stats.peak_speed));
    println!("{SEPARATOR}");
}

/// Prints `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: could not encode report: {e}"),
    }
}
