//! Worker Supervisor - spawns worker processes and tracks them until they exit
//!
//! Each worker gets the task over its stdin as soon as it is spawned. A
//! reader task per worker relays its stdout messages as [`SupervisorEvent`]s.
//! Only the supervisor ever terminates a worker process.

use crate::error::SupervisorError;
use crate::supervisor::channel::{write_line, LineReader};
use brd_types::{SupervisorEvent, TaskOptions, WorkerCommand, WorkerInfo, WorkerMessage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// How long a worker that closed its output gets to report an exit status
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(5);

/// Program (and arguments) a worker process is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl WorkerEntry {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// The running executable itself, for binaries that carry a worker subcommand
    pub fn current_exe() -> Result<Self, SupervisorError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(SupervisorError::Spawn)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Ask every worker to disconnect this long after it was spawned
    pub auto_disconnect: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_disconnect: None,
            event_capacity: 256,
        }
    }
}

/// One tracked worker process
struct WorkerSlot {
    child: Child,
    /// `None` once a disconnect was requested
    stdin: Option<ChildStdin>,
    spawned_at: DateTime<Utc>,
}

impl WorkerSlot {
    fn is_connected(&mut self) -> bool {
        self.stdin.is_some() && matches!(self.child.try_wait(), Ok(None))
    }
}

struct SupervisorInner {
    workers: Mutex<HashMap<u32, WorkerSlot>>,
    event_tx: broadcast::Sender<SupervisorEvent>,
    config: SupervisorConfig,
}

/// Process pool manager. Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(SupervisorInner {
                workers: Mutex::new(HashMap::new()),
                event_tx,
                config,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Spawn `count` workers and hand each the same task. Returns their pids.
    pub async fn start(
        &self,
        count: usize,
        entry: &WorkerEntry,
        options: &TaskOptions,
    ) -> Result<Vec<u32>, SupervisorError> {
        if count == 0 {
            return Err(SupervisorError::InvalidArguments(
                "worker count must be at least 1".to_string(),
            ));
        }
        if entry.program.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidArguments(
                "a worker entry point is required".to_string(),
            ));
        }

        let pids = self
            .spawn_all(std::iter::repeat(entry).take(count), options)
            .await?;
        info!("Started {} worker(s) for {}: {:?}", count, options.url, pids);
        Ok(pids)
    }

    /// Spawn one worker per entry. All or nothing: when one spawn fails, the
    /// workers already started by this call are killed before the error returns.
    async fn spawn_all<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a WorkerEntry>,
        options: &TaskOptions,
    ) -> Result<Vec<u32>, SupervisorError> {
        let mut pids = Vec::new();
        for entry in entries {
            match self.spawn_worker(entry, options).await {
                Ok(pid) => pids.push(pid),
                Err(e) => {
                    warn!(
                        "Spawning worker {} failed, rolling back {:?}: {}",
                        pids.len() + 1,
                        pids,
                        e
                    );
                    for pid in pids {
                        self.kill(Some(pid)).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(pids)
    }

    async fn spawn_worker(
        &self,
        entry: &WorkerEntry,
        options: &TaskOptions,
    ) -> Result<u32, SupervisorError> {
        let mut child = Command::new(&entry.program)
            .args(&entry.args)
            .envs(entry.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::Process {
                pid: 0,
                reason: "worker exited before it could be tracked".to_string(),
            });
        };
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(SupervisorError::Process {
                pid,
                reason: "worker pipes are unavailable".to_string(),
            });
        };

        if let Err(e) = write_line(&mut stdin, &WorkerCommand::Task(options.clone())).await {
            error!("Could not hand task to worker {}: {}", pid, e);
            let _ = child.kill().await;
            return Err(e);
        }
        debug!("Worker {} spawned and given task {}", pid, options.uid);

        self.inner.workers.lock().await.insert(
            pid,
            WorkerSlot {
                child,
                stdin: Some(stdin),
                spawned_at: Utc::now(),
            },
        );

        tokio::spawn(relay_messages(pid, stdout, Arc::downgrade(&self.inner)));

        if let Some(delay) = self.inner.config.auto_disconnect {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    debug!("Auto-disconnecting worker {}", pid);
                    inner.request_disconnect(pid).await;
                }
            });
        }

        Ok(pid)
    }

    /// Ask one worker to disconnect. It exits once idle; nothing is killed.
    pub async fn stop(&self, pid: u32) {
        self.inner.request_disconnect(pid).await;
    }

    /// Forcibly terminate one worker, or every tracked worker when `pid` is
    /// `None`. Unknown or already-dead pids are not an error; targets are
    /// deregistered regardless of the outcome.
    pub async fn kill(&self, pid: Option<u32>) {
        let targets: Vec<(u32, WorkerSlot)> = {
            let mut workers = self.inner.workers.lock().await;
            match pid {
                Some(pid) => workers.remove(&pid).map(|slot| (pid, slot)).into_iter().collect(),
                None => workers.drain().collect(),
            }
        };
        if targets.is_empty() {
            debug!("Kill requested for untracked worker {:?}", pid);
        }

        for (pid, mut slot) in targets {
            match slot.child.try_wait() {
                Ok(Some(status)) => debug!("Worker {} already exited ({})", pid, status),
                Ok(None) => match slot.child.kill().await {
                    Ok(()) => info!("Killed worker {}", pid),
                    Err(e) => warn!("Failed to kill worker {}: {}", pid, e),
                },
                Err(e) => warn!("Could not probe worker {}: {}", pid, e),
            }
        }
    }

    /// Tracked workers: the one matching `pid`, or all when `pid` is `None`.
    pub async fn get(&self, pid: Option<u32>) -> Vec<WorkerInfo> {
        let mut workers = self.inner.workers.lock().await;
        let mut infos: Vec<WorkerInfo> = workers
            .iter_mut()
            .filter(|(id, _)| pid.map_or(true, |pid| **id == pid))
            .map(|(id, slot)| WorkerInfo {
                pid: *id,
                connected: slot.is_connected(),
                spawned_at: slot.spawned_at,
            })
            .collect();
        infos.sort_by_key(|info| info.pid);
        infos
    }

    pub async fn len(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.workers.lock().await.is_empty()
    }
}

impl SupervisorInner {
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn request_disconnect(&self, pid: u32) {
        let mut workers = self.workers.lock().await;
        let Some(slot) = workers.get_mut(&pid) else {
            debug!("Stop requested for untracked worker {}", pid);
            return;
        };
        disconnect_slot(pid, slot).await;
    }

    /// A worker closed its channel or failed: forward the notification, then
    /// clear every tracked record.
    async fn on_worker_gone(&self, pid: u32, mut failure: Option<String>) {
        let slot = self.workers.lock().await.remove(&pid);

        if let Some(mut slot) = slot {
            match tokio::time::timeout(EXIT_STATUS_WAIT, slot.child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    failure = failure.or_else(|| Some(format!("worker exited with {}", status)));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => failure = failure.or_else(|| Some(e.to_string())),
                Err(_) => warn!("Worker {} closed its channel but did not exit", pid),
            }
        }

        if let Some(reason) = failure {
            let err = SupervisorError::Process { pid, reason };
            error!("{}", err);
            self.emit(SupervisorEvent::Error {
                pid,
                error: err.to_string(),
            });
        }
        info!("Worker {} disconnected", pid);
        self.emit(SupervisorEvent::Disconnected { pid });

        let mut workers = self.workers.lock().await;
        for (other, slot) in workers.iter_mut() {
            disconnect_slot(*other, slot).await;
        }
        if !workers.is_empty() {
            debug!("Clearing {} tracked worker record(s)", workers.len());
        }
        workers.clear();
    }
}

async fn disconnect_slot(pid: u32, slot: &mut WorkerSlot) {
    let Some(mut stdin) = slot.stdin.take() else {
        return;
    };
    info!("Requesting disconnect of worker {}", pid);
    if let Err(e) = write_line(&mut stdin, &WorkerCommand::Disconnect).await {
        debug!("Worker {} channel already closed: {}", pid, e);
    }
    // Dropping stdin closes the pipe, which the worker also treats as a disconnect
}

/// Relay one worker's stdout until it closes
async fn relay_messages(pid: u32, stdout: ChildStdout, inner: Weak<SupervisorInner>) {
    let mut reader = LineReader::new(stdout);
    let mut failure = None;

    loop {
        match reader.next::<WorkerMessage>().await {
            Ok(Some(message)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.emit(SupervisorEvent::Message(message));
            }
            Ok(None) => break,
            Err(SupervisorError::Serialization(e)) => {
                warn!("Worker {} wrote an unreadable message: {}", pid, e);
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.on_worker_gone(pid, failure).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let options = TaskOptions::new("http://example.com/a", "/tmp");
        let err = supervisor
            .start(0, &WorkerEntry::new("brd-worker"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_start_requires_entry_point() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let options = TaskOptions::new("http://example.com/a", "/tmp");
        let err = supervisor
            .start(1, &WorkerEntry::new(""), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let options = TaskOptions::new("http://example.com/a", "/tmp");
        let err = supervisor
            .start(1, &WorkerEntry::new("/definitely/not/a/worker"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(supervisor.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partial_spawn_failure_kills_started_workers() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let options = TaskOptions::new("http://example.com/a", "/tmp");
        // Reads its stdin until closed, like an idle worker
        let healthy = WorkerEntry::new("cat");
        let broken = WorkerEntry::new("/definitely/not/a/worker");

        let err = supervisor
            .spawn_all([&healthy, &broken], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(supervisor.is_empty().await);
        assert!(supervisor.get(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_kill_and_stop_unknown_pid_are_noops() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        supervisor.kill(Some(999_999)).await;
        supervisor.kill(None).await;
        supervisor.stop(999_999).await;
        assert!(supervisor.get(None).await.is_empty());
        assert!(supervisor.get(Some(999_999)).await.is_empty());
    }

    #[test]
    fn test_worker_entry_builder() {
        let entry = WorkerEntry::new("brd").arg("worker");
        assert_eq!(entry.program, PathBuf::from("brd"));
        assert_eq!(entry.args, vec![OsString::from("worker")]);
    }
}
