//! Command result rendering: colored text for people, an envelope for
//! scripts.

use crate::core::error::FleetError;
use crate::core::time;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Collapse whitespace and bound length for one terminal line.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

pub fn ok_line(msg: &str) {
    println!("{} {}", "✓".bright_green(), msg);
}

pub fn warn_line(msg: &str) {
    println!("{} {}", "⚠".bright_yellow(), msg);
}

pub fn fail_line(scope: &str, msg: &str) {
    println!(
        "{} {}: {}",
        "✗".bright_red(),
        scope.bold(),
        compact_line(msg, 160)
    );
}

/// Print `payload` as a JSON envelope, or run `text` to print it for people.
pub fn emit<T: Serialize>(
    format: OutputFormat,
    cmd: &str,
    status: &str,
    payload: &T,
    text: impl FnOnce(&T),
) -> Result<(), FleetError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::Envelope::new(cmd, status, payload);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => text(payload),
    }
    Ok(())
}
