//! Shared types for brd
//!
//! This crate contains the plain data structures exchanged between the
//! download engine, the worker supervisor, worker processes and the CLI.
//! Everything here is serializable because task metadata and worker status
//! cross a process boundary as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Suffix appended to the resolved filename while a download is in flight.
pub const TEMP_SUFFIX: &str = ".download";

/// Extension used for generated fallback filenames.
pub const FALLBACK_EXTENSION: &str = "brd";

// ============================================================================
// Task Types
// ============================================================================

/// Input for a single retrieval.
///
/// `url` and `destination` are required; every other field falls back to its
/// default when omitted from serialized metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    pub url: String,
    /// Directory the finished file is written into
    pub destination: PathBuf,
    /// Explicit filename, overriding `Content-Disposition`
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_true")]
    pub retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Reserved; ranged resume is not performed
    #[serde(default)]
    pub resumable: bool,
    /// Bandwidth cap in KB/s (0 = unlimited)
    #[serde(default)]
    pub bandwidth_throttle: u64,
    /// Minimum interval between progress notifications, in milliseconds
    #[serde(default = "default_progress_throttle")]
    pub progress_throttle: u64,
    #[serde(default = "default_true")]
    pub clone_files: bool,
    #[serde(default = "default_true")]
    pub remove_on_error: bool,
    /// Opaque task identifier
    #[serde(default = "generate_uid", alias = "uuid")]
    pub uid: String,
    /// Maximum number of redirect hops followed per attempt
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Delay between retry attempts, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Highest `_n` suffix probed when resolving filename collisions
    #[serde(default = "default_max_clone_suffix")]
    pub max_clone_suffix: u32,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_progress_throttle() -> u64 {
    500
}

fn default_max_redirects() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_max_clone_suffix() -> u32 {
    9999
}

fn generate_uid() -> String {
    Uuid::new_v4().to_string()
}

impl TaskOptions {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            filename: None,
            method: default_method(),
            retry: true,
            max_retries: default_max_retries(),
            resumable: false,
            bandwidth_throttle: 0,
            progress_throttle: default_progress_throttle(),
            clone_files: true,
            remove_on_error: true,
            uid: generate_uid(),
            max_redirects: default_max_redirects(),
            retry_delay: default_retry_delay(),
            max_clone_suffix: default_max_clone_suffix(),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_throttle)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    /// Total number of attempts the engine may make, first one included.
    pub fn max_attempts(&self) -> u32 {
        if self.retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

// ============================================================================
// Engine State
// ============================================================================

/// Lifecycle state of one download engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Idle,
    Started,
    Downloading,
    Completed,
    Error,
    Paused,
    Cancelled,
}

impl EngineState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    ///
    /// `Started -> Started` is a redirect hop, `Downloading -> Started` a retry.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Started)
                | (Started, Started)
                | (Started, Downloading)
                | (Started, Error)
                | (Started, Cancelled)
                | (Downloading, Started)
                | (Downloading, Completed)
                | (Downloading, Error)
                | (Downloading, Paused)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Error)
                | (Paused, Cancelled)
        )
    }
}

// ============================================================================
// Progress & File Snapshots
// ============================================================================

/// Point-in-time progress of a download
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: String,
    /// Total bytes from Content-Length (0 = unknown)
    pub total: u64,
    pub downloaded: u64,
    /// Percentage in `0.0..=100.0`, `None` while the total is unknown
    pub progress: Option<f64>,
    /// Bytes received since the previous notification
    pub window_bytes: u64,
    pub filename: String,
}

impl ProgressSnapshot {
    pub fn percent_label(&self) -> String {
        match self.progress {
            Some(p) => format!("{:.2}", p),
            None => "unknown".to_string(),
        }
    }

    /// Human-readable one-line summary, as relayed by worker processes
    pub fn summary(&self) -> String {
        let total = if self.total > 0 {
            self.total.to_string()
        } else {
            "unknown".to_string()
        };
        format!(
            "Progress: {} - Downloaded: {} - Total: {}",
            self.percent_label(),
            self.downloaded,
            total
        )
    }
}

/// Copy of a file descriptor, handed to caller hooks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub filename: String,
    pub extension: String,
    pub base_name: String,
    pub filepath: PathBuf,
    pub temp_filepath: PathBuf,
    pub size: u64,
}

// ============================================================================
// Event Types
// ============================================================================

/// Lifecycle notifications emitted by a download engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    Idle { id: String },
    Started { id: String },
    Download { id: String },
    Progress(ProgressSnapshot),
    Completed { id: String, path: PathBuf },
    BeforeSave { id: String, filename: String },
    Error { id: String, error: String },
    FileRemoved { id: String },
    Paused { id: String },
    Resumed { id: String },
    Retry { id: String, attempt: u32 },
}

/// Notifications emitted by the task registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Added { id: String },
    Removed { id: String },
}

// ============================================================================
// Worker Protocol
// ============================================================================

/// Commands sent from the supervisor to a worker process, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum WorkerCommand {
    Task(TaskOptions),
    Disconnect,
}

/// What a worker message reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMessageKind {
    Progress,
    Completed,
    Failed,
}

/// Status message sent from a worker process to its supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub error: Option<String>,
    pub pid: u32,
    pub message: String,
    pub kind: WorkerMessageKind,
}

impl WorkerMessage {
    pub fn progress(pid: u32, snapshot: &ProgressSnapshot) -> Self {
        Self {
            error: None,
            pid,
            message: snapshot.summary(),
            kind: WorkerMessageKind::Progress,
        }
    }

    pub fn completed(pid: u32) -> Self {
        Self {
            error: None,
            pid,
            message: "Downloader worker download completed.".to_string(),
            kind: WorkerMessageKind::Completed,
        }
    }

    pub fn failed(pid: u32, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            pid,
            message: "Downloader worker error.".to_string(),
            kind: WorkerMessageKind::Failed,
        }
    }
}

/// Notifications emitted by the worker supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Message(WorkerMessage),
    Error { pid: u32, error: String },
    Disconnected { pid: u32 },
}

/// Tracked worker, as reported by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub connected: bool,
    pub spawned_at: DateTime<Utc>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_destination: PathBuf,
    /// KB/s, 0 = unlimited
    pub bandwidth_throttle: u64,
    pub progress_throttle_ms: u64,
    pub retry: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub clone_files: bool,
    pub remove_on_error: bool,
    pub max_redirects: u32,
    pub max_clone_suffix: u32,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Workers spawned by `brd spawn` when no count is given
    pub worker_count: u32,
    /// How long a busy worker may keep running after a disconnect request
    pub disconnect_grace_secs: u64,
    /// Stop each worker this long after spawning it (0 = never)
    pub auto_disconnect_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_destination: dirs::download_dir()
                .map(|p| p.join("brd"))
                .unwrap_or_else(|| PathBuf::from(".")),
            bandwidth_throttle: 0,
            progress_throttle_ms: default_progress_throttle(),
            retry: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            clone_files: true,
            remove_on_error: true,
            max_redirects: default_max_redirects(),
            max_clone_suffix: default_max_clone_suffix(),
            user_agent: format!("brd/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            worker_count: 1,
            disconnect_grace_secs: 600,
            auto_disconnect_ms: 0,
        }
    }
}

impl Settings {
    /// Task options for `url` seeded from these settings
    pub fn task_options(&self, url: impl Into<String>) -> TaskOptions {
        let mut options = TaskOptions::new(url, self.default_destination.clone());
        options.bandwidth_throttle = self.bandwidth_throttle;
        options.progress_throttle = self.progress_throttle_ms;
        options.retry = self.retry;
        options.max_retries = self.max_retries;
        options.retry_delay = self.retry_delay_ms;
        options.clone_files = self.clone_files;
        options.remove_on_error = self.remove_on_error;
        options.max_redirects = self.max_redirects;
        options.max_clone_suffix = self.max_clone_suffix;
        options
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn auto_disconnect(&self) -> Option<Duration> {
        (self.auto_disconnect_ms > 0).then(|| Duration::from_millis(self.auto_disconnect_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_options_defaults_are_merged() {
        let json = r#"{"url":"http://example.com/a.bin","destination":"/tmp"}"#;
        let options: TaskOptions = serde_json::from_str(json).unwrap();

        assert_eq!(options.method, "GET");
        assert!(options.retry);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.progress_throttle, 500);
        assert_eq!(options.bandwidth_throttle, 0);
        assert!(options.clone_files);
        assert!(options.remove_on_error);
        assert!(!options.resumable);
        assert!(Uuid::parse_str(&options.uid).is_ok());
    }

    #[test]
    fn test_task_options_accepts_uuid_alias() {
        let json = r#"{"url":"http://x","destination":"/tmp","uuid":"abc","bandwidthThrottle":64}"#;
        let options: TaskOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.uid, "abc");
        assert_eq!(options.bandwidth_throttle, 64);
    }

    #[test]
    fn test_max_attempts() {
        let mut options = TaskOptions::new("http://x", "/tmp");
        assert_eq!(options.max_attempts(), 4);
        options.retry = false;
        assert_eq!(options.max_attempts(), 1);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            EngineState::Idle,
            EngineState::Started,
            EngineState::Downloading,
            EngineState::Completed,
            EngineState::Error,
            EngineState::Paused,
            EngineState::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in &all {
                assert!(!from.can_transition_to(*to), "{:?} -> {:?}", from, to);
            }
        }
        assert!(EngineState::Started.can_transition_to(EngineState::Started));
        assert!(!EngineState::Idle.can_transition_to(EngineState::Downloading));
    }

    #[test]
    fn test_progress_summary_with_unknown_total() {
        let snapshot = ProgressSnapshot {
            downloaded: 42,
            ..Default::default()
        };
        assert_eq!(
            snapshot.summary(),
            "Progress: unknown - Downloaded: 42 - Total: unknown"
        );
    }

    #[test]
    fn test_worker_command_wire_format() {
        let line = serde_json::to_string(&WorkerCommand::Disconnect).unwrap();
        assert_eq!(line, r#"{"command":"disconnect"}"#);
        let parsed: WorkerCommand = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, WorkerCommand::Disconnect);
    }

    #[test]
    fn test_settings_seed_task_options() {
        let settings = Settings {
            bandwidth_throttle: 128,
            clone_files: false,
            ..Default::default()
        };
        let options = settings.task_options("http://example.com/file");
        assert_eq!(options.bandwidth_throttle, 128);
        assert!(!options.clone_files);
        assert_eq!(options.destination, settings.default_destination);
    }
}
