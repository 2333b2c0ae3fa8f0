//! Progress display for inline downloads and worker pools

use brd_types::{EngineEvent, SupervisorEvent, WorkerMessageKind};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Progress bar for one inline download
pub struct DownloadProgress {
    bar: ProgressBar,
}

impl DownloadProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Update the bar from an engine event
    pub fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Progress(snapshot) => {
                if snapshot.total > 0 {
                    self.bar.set_length(snapshot.total);
                }
                self.bar.set_position(snapshot.downloaded);
                self.bar.set_message(snapshot.filename.clone());
            }

            EngineEvent::Retry { attempt, .. } => {
                self.bar.set_position(0);
                self.bar
                    .println(format!("{} Retrying (attempt {})", style("↻").yellow(), attempt));
            }

            EngineEvent::Paused { .. } => {
                self.bar.set_message(format!("{} Paused", style("⏸").yellow()));
            }

            EngineEvent::Completed { path, .. } => {
                self.bar.finish_with_message(format!(
                    "{} Saved {}",
                    style("✓").green().bold(),
                    path.display()
                ));
            }

            EngineEvent::Error { error, .. } => {
                self.bar.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    error
                ));
            }

            _ => {}
        }
    }

    pub fn cancelled(&self) {
        self.bar
            .abandon_with_message(format!("{} Cancelled", style("○").dim()));
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One status line per worker process
pub struct WorkerProgress {
    multi: MultiProgress,
    lines: HashMap<u32, ProgressBar>,
}

impl WorkerProgress {
    pub fn new(pids: &[u32]) -> Self {
        let multi = MultiProgress::new();
        let lines = pids
            .iter()
            .map(|pid| {
                let line = multi.add(ProgressBar::new_spinner());
                line.set_style(spinner_style());
                line.set_prefix(format!("worker {}", pid));
                line.set_message("starting");
                line.enable_steady_tick(Duration::from_millis(120));
                (*pid, line)
            })
            .collect();
        Self { multi, lines }
    }

    pub fn handle_event(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::Message(message) => {
                let Some(line) = self.lines.get(&message.pid) else {
                    return;
                };
                match message.kind {
                    WorkerMessageKind::Progress => line.set_message(message.message.clone()),
                    WorkerMessageKind::Completed => line.finish_with_message(format!(
                        "{} {}",
                        style("✓").green().bold(),
                        message.message
                    )),
                    WorkerMessageKind::Failed => line.abandon_with_message(format!(
                        "{} {}",
                        style("✗").red().bold(),
                        message.error.as_deref().unwrap_or(&message.message)
                    )),
                }
            }

            SupervisorEvent::Error { pid, error } => {
                let _ = self.multi.println(format!(
                    "{} worker {}: {}",
                    style("✗").red().bold(),
                    pid,
                    error
                ));
            }

            SupervisorEvent::Disconnected { pid } => {
                if let Some(line) = self.lines.get(pid) {
                    if !line.is_finished() {
                        line.abandon_with_message(format!("{} disconnected", style("○").dim()));
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        for line in self.lines.values() {
            if !line.is_finished() {
                line.finish_and_clear();
            }
        }
    }
}
