//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;

/// Print one value as a JSON line (json) or via `human` (human)
pub fn print_output<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(value)?);
        }
        OutputFormat::Human => {
            println!("{}", human(value));
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format a KB/s limit, 0 meaning unlimited
pub fn format_limit(kb_per_sec: u64) -> String {
    if kb_per_sec == 0 {
        "Unlimited".to_string()
    } else {
        format!("{}/s", human_bytes::human_bytes((kb_per_sec * 1024) as f64))
    }
}
