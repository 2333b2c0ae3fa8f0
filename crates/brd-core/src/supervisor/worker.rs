//! Worker process protocol
//!
//! A worker reads [`WorkerCommand`]s from its input, runs at most one
//! download engine, and writes [`WorkerMessage`]s to its output. It never
//! terminates itself on failure: it reports and waits for the supervisor to
//! ask it to disconnect. Closing the input counts as that request.

use crate::engine::{build_client, DownloadEngine, EngineControl, TaskHooks};
use crate::error::SupervisorError;
use crate::supervisor::channel::{write_line, LineReader};
use brd_types::{EngineEvent, Settings, TaskOptions, WorkerCommand, WorkerMessage};
use reqwest::Client;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-process worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pid: u32,
    /// How long a busy worker keeps running after a disconnect request
    pub disconnect_grace: Duration,
    pub settings: Settings,
}

impl WorkerConfig {
    pub fn new(settings: Settings) -> Self {
        Self {
            pid: std::process::id(),
            disconnect_grace: settings.disconnect_grace(),
            settings,
        }
    }
}

/// The running task, if one was accepted
struct ActiveTask {
    control: EngineControl,
    handle: JoinHandle<()>,
}

/// Everything the worker owns for its lifetime
struct WorkerContext {
    pid: u32,
    client: Client,
    disconnect_grace: Duration,
    outbound: Option<mpsc::UnboundedSender<WorkerMessage>>,
    task: Option<ActiveTask>,
    accepted: bool,
}

impl WorkerContext {
    fn send(&self, message: WorkerMessage) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(message);
        }
    }

    fn is_busy(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the one task this worker will ever run
    fn accept(&mut self, options: TaskOptions) {
        if self.accepted {
            warn!("Worker {} already has a task, ignoring {}", self.pid, options.uid);
            return;
        }
        self.accepted = true;

        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        let pid = self.pid;
        let (event_tx, mut event_rx) = broadcast::channel(256);
        let hooks = TaskHooks::default().silent_errors();

        let mut engine = match DownloadEngine::new(options, hooks, self.client.clone(), event_tx) {
            Ok(engine) => engine,
            Err(e) => {
                error!("Worker {} rejected task: {}", pid, e);
                self.send(WorkerMessage::failed(pid, e.to_string()));
                return;
            }
        };
        info!("Worker {} accepted task {}", pid, engine.id());
        let control = engine.control();

        let progress_tx = outbound.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(EngineEvent::Progress(snapshot)) => {
                        let _ = progress_tx.send(WorkerMessage::progress(pid, &snapshot));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Worker {} skipped {} engine events", pid, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let handle = tokio::spawn(async move {
            let result = engine.start().await;
            // Closing the event channel lets the forwarder drain, so every
            // progress message precedes the outcome
            drop(engine);
            let _ = forwarder.await;

            let message = match result {
                Ok(path) => {
                    info!("Worker {} finished: {:?}", pid, path);
                    WorkerMessage::completed(pid)
                }
                Err(e) => {
                    error!("Worker {} download failed: {}", pid, e);
                    WorkerMessage::failed(pid, e.to_string())
                }
            };
            let _ = outbound.send(message);
        });

        self.task = Some(ActiveTask { control, handle });
    }
}

/// Run the worker protocol over `input`/`output` until a disconnect request.
pub async fn run_worker<R, W>(input: R, output: W, config: WorkerConfig) -> Result<(), SupervisorError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let client = build_client(&config.settings)
        .map_err(|e| SupervisorError::Process {
            pid: config.pid,
            reason: e.to_string(),
        })?;
    let (outbound, mut messages) = mpsc::unbounded_channel();
    let mut ctx = WorkerContext {
        pid: config.pid,
        client,
        disconnect_grace: config.disconnect_grace,
        outbound: Some(outbound),
        task: None,
        accepted: false,
    };
    let mut commands = LineReader::new(input);
    let mut output = output;

    debug!("Worker {} ready", ctx.pid);
    loop {
        tokio::select! {
            Some(message) = messages.recv() => write_line(&mut output, &message).await?,
            command = commands.next::<WorkerCommand>() => match command {
                Ok(Some(WorkerCommand::Task(options))) => ctx.accept(options),
                Ok(Some(WorkerCommand::Disconnect)) | Ok(None) => break,
                Err(SupervisorError::Serialization(e)) => {
                    warn!("Worker {} ignoring malformed command: {}", ctx.pid, e);
                }
                Err(e) => {
                    warn!("Worker {} lost its command channel: {}", ctx.pid, e);
                    break;
                }
            },
        }
    }

    info!(
        "Worker {} disconnect requested ({})",
        ctx.pid,
        if ctx.is_busy() { "busy" } else { "idle" }
    );
    shutdown(&mut ctx, &mut messages, &mut output).await
}

/// Wait for the active task within the grace period, cancelling it when the
/// period runs out, then flush every pending message.
async fn shutdown<W>(
    ctx: &mut WorkerContext,
    messages: &mut mpsc::UnboundedReceiver<WorkerMessage>,
    output: &mut W,
) -> Result<(), SupervisorError>
where
    W: AsyncWrite + Unpin,
{
    ctx.outbound = None;

    if let Some(mut task) = ctx.task.take() {
        let deadline = tokio::time::sleep(ctx.disconnect_grace);
        tokio::pin!(deadline);
        let mut cancelled = false;

        loop {
            tokio::select! {
                Some(message) = messages.recv() => write_line(output, &message).await?,
                _ = &mut task.handle => break,
                _ = &mut deadline, if !cancelled => {
                    warn!("Worker {} grace period elapsed, cancelling task", ctx.pid);
                    task.control.cancel();
                    cancelled = true;
                }
            }
        }
    }

    while let Some(message) = messages.recv().await {
        write_line(output, &message).await?;
    }
    info!("Worker {} exiting", ctx.pid);
    Ok(())
}

/// Worker entry point over the process's own stdin/stdout
pub async fn run_stdio(config: WorkerConfig) -> Result<(), SupervisorError> {
    run_worker(tokio::io::stdin(), tokio::io::stdout(), config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use brd_types::WorkerMessageKind;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn config() -> WorkerConfig {
        WorkerConfig {
            pid: 42,
            disconnect_grace: Duration::from_secs(5),
            settings: Settings::default(),
        }
    }

    #[tokio::test]
    async fn test_idle_worker_exits_on_disconnect() {
        let input: &[u8] = b"{\"command\":\"disconnect\"}\n";
        let mut output = Vec::new();

        run_worker(input, &mut output, config()).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_closed_input_is_a_disconnect() {
        let input: &[u8] = b"";
        let mut output = Vec::new();
        run_worker(input, &mut output, config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_task_reports_failure() {
        let task = WorkerCommand::Task(TaskOptions::new("ftp://example.com/x", "/tmp"));
        let mut input = serde_json::to_vec(&task).unwrap();
        input.push(b'\n');
        let mut output = Vec::new();

        run_worker(input.as_slice(), &mut output, config()).await.unwrap();

        let line = output.split(|b| *b == b'\n').next().unwrap();
        let message: WorkerMessage = serde_json::from_slice(line).unwrap();
        assert_eq!(message.kind, WorkerMessageKind::Failed);
        assert_eq!(message.pid, 42);
        assert!(message.error.unwrap().contains("unsupported url"));
    }

    #[tokio::test]
    async fn test_malformed_command_is_skipped() {
        let (mut supervisor_side, worker_side) = tokio::io::duplex(4096);
        let (worker_in, worker_out) = tokio::io::split(worker_side);
        let worker = tokio::spawn(run_worker(worker_in, worker_out, config()));

        supervisor_side.write_all(b"{oops}\n").await.unwrap();
        supervisor_side
            .write_all(b"{\"command\":\"disconnect\"}\n")
            .await
            .unwrap();

        worker.await.unwrap().unwrap();
        let mut lines = BufReader::new(supervisor_side).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
