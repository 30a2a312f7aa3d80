//! End-of-run report.

use crate::master::RunSummary;
use crate::renderer::{ErrorKind, ErrorRecord};
use crate::theme::Themed;

/// How the report is printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable lines (default).
    #[default]
    Text,
    /// The full summary as JSON on stdout.
    Json,
}

/// Print the report for a finished run.
///
/// Text goes to stdout, the error report (if any) to stderr.
pub fn print_report(summary: &RunSummary, format: ReportFormat) {
    match format {
        ReportFormat::Text => {
            println!("{}", done_line(summary));
            if let Some(report) = error_report(&summary.errors) {
                eprintln!("{}", report);
            }
        }
        ReportFormat::Json => {
            let json = serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string());
            println!("{}", json);
        }
    }
}

pub fn done_line(summary: &RunSummary) -> String {
    format!("Files generated in {}s", summary.duration_secs().count())
}

/// `==== Error report ====` block, grouped by item then worker, or `None`
/// when the run had no errors.
pub fn error_report(errors: &[ErrorRecord]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }

    let mut items: Vec<&str> = Vec::new();
    for error in errors {
        if !items.contains(&error.item.as_str()) {
            items.push(&error.item);
        }
    }
    // Stable: reporting order is kept within a group.
    let mut grouped: Vec<&ErrorRecord> = errors.iter().collect();
    grouped.sort_by_key(|e| {
        let rank = items.iter().position(|item| *item == e.item).unwrap_or(usize::MAX);
        (rank, e.worker_id)
    });

    let entries: Vec<String> = grouped.into_iter().map(entry).collect();
    Some(format!(
        "{}\n{}",
        "==== Error report ====".section_header_error(),
        entries.join("\n\n")
    ))
}

fn entry(error: &ErrorRecord) -> String {
    let route = format!("'{}'", error.item).item();
    let worker = format!("worker {}", error.worker_id).worker();
    match error.kind {
        ErrorKind::Unhandled => format!("Route: {} ({})\n{}", route, worker, error.detail.as_str().error_style()),
        ErrorKind::Handled => format!(
            "Route: {} ({}) thrown an error:\n{}",
            route,
            worker,
            error.detail.as_str().muted()
        ),
    }
}
