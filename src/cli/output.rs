//! CLI output formatting

use crate::core::error::{Diagnostic, ExecutionError, Severity};
use crate::execution::tracker::{TrackerEvent, TrackerEventKind};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a validation finding for display
pub fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let icon = if diagnostic.is_error() { CROSS } else { WARN };
    let severity = match diagnostic.severity {
        Severity::Critical | Severity::Error => style("ERROR").red().to_string(),
        Severity::Warning => style("WARNING").yellow().to_string(),
        Severity::Info => style("INFO").dim().to_string(),
    };
    if diagnostic.context.is_empty() {
        format!("{} {} {}", icon, severity, diagnostic.message)
    } else {
        format!(
            "{} {} {}: {}",
            icon,
            severity,
            style(diagnostic.context.join("/")).cyan(),
            diagnostic.message
        )
    }
}

/// Format a failed run, the error and its causes
pub fn format_error(error: &ExecutionError) -> String {
    let mut lines = vec![format!("{} {}", CROSS, style(error).red())];
    if let Some(source) = &error.source_id {
        lines.push(format!("  at step {}", style(source).cyan()));
    }
    for cause in error.chain().skip(1) {
        lines.push(format!("  caused by: {}", style(cause).dim()));
    }
    for validation in &error.validations {
        lines.push(format!("  {}", format_diagnostic(validation)));
    }
    lines.join("\n")
}

/// Format a step event recorded while tracing
pub fn format_tracker_event(event: &TrackerEvent) -> String {
    let at = event.at.format("%H:%M:%S%.3f").to_string();
    let step = format!("{} {}", event.step_kind, style(&event.step_id).cyan());
    match &event.kind {
        TrackerEventKind::Before => format!("{} {}", style(&at).dim(), step),
        TrackerEventKind::After => format!("{} {} {}", style(&at).dim(), CHECK, step),
        TrackerEventKind::Error(message) => {
            format!("{} {} {}: {}", style(&at).dim(), CROSS, step, style(message).red())
        }
        TrackerEventKind::Describe(text) => format!("{} {} {}: {}", style(&at).dim(), INFO, step, text),
    }
}
