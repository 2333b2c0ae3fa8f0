//! Download engine - drives one HTTP(S) retrieval from request to durable file
//!
//! One engine runs one task, once. Each attempt walks the redirect chain,
//! streams the body through the rate limiter into `{filename}.download`, and
//! renames that file into place when the stream ends. Retryable failures
//! restart the whole attempt from a clean file descriptor.

use crate::engine::filename::{resolve_descriptor, sanitize_filename, FileDescriptor};
use crate::engine::hooks::{ErrorDispatch, ProgressDispatch, TaskHooks};
use crate::engine::progress::ProgressTracker;
use crate::engine::rate_limiter::{Pacing, RateLimiter};
use crate::error::EngineError;
use brd_types::{EngineEvent, EngineState, ProgressSnapshot, TaskOptions};
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_DISPOSITION, LOCATION};
use reqwest::{Client, Method, Response};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Transport scheme, chosen from the URL prefix alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.trim_start().to_ascii_lowercase();
        if lower.starts_with("https://") {
            Some(Scheme::Https)
        } else if lower.starts_with("http://") {
            Some(Scheme::Http)
        } else {
            None
        }
    }
}

/// State shared between the engine and its control handles
struct Shared {
    state: RwLock<EngineState>,
    stats: RwLock<ProgressSnapshot>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Cloneable handle for controlling a running engine from elsewhere
#[derive(Clone)]
pub struct EngineControl {
    id: String,
    shared: Arc<Shared>,
}

impl EngineControl {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The engine removes its temporary file and
    /// resolves with [`EngineError::Cancelled`].
    pub fn cancel(&self) {
        info!("Download {} cancel requested", self.id);
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop pulling from the response until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    pub fn stats(&self) -> ProgressSnapshot {
        self.shared.stats.read().clone()
    }
}

impl std::fmt::Debug for EngineControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineControl")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-task download state machine
pub struct DownloadEngine {
    options: TaskOptions,
    hooks: TaskHooks,
    client: Client,
    method: Method,
    url: Url,
    event_tx: broadcast::Sender<EngineEvent>,
    shared: Arc<Shared>,
    paused_rx: watch::Receiver<bool>,
    tracker: ProgressTracker,
    file: FileDescriptor,
}

impl DownloadEngine {
    /// Validate `options` and build an idle engine.
    ///
    /// Hook-vs-event dispatch is fixed here by `hooks`.
    pub fn new(
        options: TaskOptions,
        hooks: TaskHooks,
        client: Client,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        if Scheme::from_url(&options.url).is_none() {
            return Err(EngineError::InvalidOptions(format!(
                "unsupported url: {:?}",
                options.url
            )));
        }
        let url = Url::parse(options.url.trim())
            .map_err(|e| EngineError::InvalidOptions(format!("invalid url {:?}: {}", options.url, e)))?;
        if options.destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidOptions("destination is required".to_string()));
        }
        let method = Method::from_bytes(options.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| EngineError::InvalidOptions(format!("invalid method {:?}", options.method)))?;

        let (paused, paused_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState::Idle),
            stats: RwLock::new(ProgressSnapshot {
                id: options.uid.clone(),
                ..Default::default()
            }),
            paused,
            cancel: CancellationToken::new(),
        });
        let tracker = ProgressTracker::new(options.uid.clone(), options.progress_interval());

        let engine = Self {
            options,
            hooks,
            client,
            method,
            url,
            event_tx,
            shared,
            paused_rx,
            tracker,
            file: FileDescriptor::default(),
        };
        engine.emit(EngineEvent::Idle {
            id: engine.id().to_string(),
        });
        Ok(engine)
    }

    pub fn id(&self) -> &str {
        &self.options.uid
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn control(&self) -> EngineControl {
        EngineControl {
            id: self.options.uid.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    pub fn cancel(&self) {
        self.control().cancel();
    }

    /// Run the task to completion. Resolves with the finalized file path.
    pub async fn start(&mut self) -> Result<PathBuf, EngineError> {
        if self.state() != EngineState::Idle {
            return Err(EngineError::InvalidOptions(
                "engine has already been started".to_string(),
            ));
        }

        let max_attempts = self.options.max_attempts();
        let mut attempt = 1;
        info!(
            "Starting download {}: {} (bandwidth: {} KB/s, attempts: {})",
            self.id(),
            self.options.url,
            self.options.bandwidth_throttle,
            max_attempts
        );

        loop {
            self.set_state(EngineState::Started);
            self.emit(EngineEvent::Started {
                id: self.id().to_string(),
            });

            let result = self.attempt().await;
            let err = match result {
                Ok(path) => return Ok(path),
                Err(EngineError::Cancelled) => return Err(self.on_cancelled().await),
                Err(err) => err,
            };

            // Whatever failed, a fired token makes this a cancellation
            if self.shared.cancel.is_cancelled() {
                return Err(self.on_cancelled().await);
            }
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(self.on_error(err).await);
            }

            warn!(
                "Download {} failed (attempt {}/{}): {}. Will retry.",
                self.id(),
                attempt,
                max_attempts,
                err
            );
            self.discard_attempt().await;
            attempt += 1;
            self.emit(EngineEvent::Retry {
                id: self.id().to_string(),
                attempt,
            });

            let delay = self.options.retry_interval();
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shared.cancel.cancelled() => return Err(self.on_cancelled().await),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// One full attempt: redirect chain, then streaming and finalize.
    async fn attempt(&mut self) -> Result<PathBuf, EngineError> {
        let mut url = self.url.clone();
        let mut hops = 0;

        let response = loop {
            debug!("Download {} requesting {} ({:?})", self.id(), url, Scheme::from_url(url.as_str()));
            let response = self.send(url.clone()).await?;
            let status = response.status();

            if status.is_redirection() {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .and_then(|v| url.join(v).ok())
                    .filter(|u| Scheme::from_url(u.as_str()).is_some());
                let Some(next) = next else {
                    return Err(EngineError::Redirect {
                        status: status.as_u16(),
                    });
                };

                hops += 1;
                if hops > self.options.max_redirects {
                    return Err(EngineError::TooManyRedirects {
                        limit: self.options.max_redirects,
                    });
                }

                info!("Download {} redirected ({}) to {}", self.id(), status, next);
                // A hop is a fresh attempt; nothing from the previous response carries over
                self.reset_attempt();
                self.set_state(EngineState::Started);
                self.emit(EngineEvent::Started {
                    id: self.id().to_string(),
                });
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(EngineError::Protocol {
                    status: status.as_u16(),
                });
            }
            break response;
        };

        self.stream_to_disk(response).await?;
        self.finalize().await
    }

    async fn send(&self, url: Url) -> Result<Response, EngineError> {
        let request = self.client.request(self.method.clone(), url);
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(EngineError::Cancelled),
            result = request.send() => result.map_err(|e| {
                if e.is_timeout() {
                    warn!("Download {} timed out: {}", self.options.uid, e);
                }
                EngineError::Transport(e)
            }),
        }
    }

    async fn stream_to_disk(&mut self, response: Response) -> Result<(), EngineError> {
        let content_length = response.content_length().filter(|len| *len > 0);
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        tokio::fs::create_dir_all(&self.options.destination)
            .await
            .map_err(|e| EngineError::fs(&self.options.destination, e))?;

        self.file = resolve_descriptor(&self.options, disposition.as_deref(), content_length).await?;
        let temp_path = self.file.temp_filepath.clone();
        self.file.handle = Some(
            File::create(&temp_path)
                .await
                .map_err(|e| EngineError::fs(&temp_path, e))?,
        );
        // The loop below owns the handle; it is closed on every exit path
        let mut handle = match self.file.handle.take() {
            Some(handle) => handle,
            None => return Err(EngineError::fs(&temp_path, std::io::ErrorKind::NotFound.into())),
        };

        self.tracker.begin(self.file.size, self.file.filename.clone());
        self.publish_stats();
        self.set_state(EngineState::Downloading);
        self.emit(EngineEvent::Download {
            id: self.id().to_string(),
        });
        info!(
            "Download {} streaming into {:?} (size: {})",
            self.id(),
            temp_path,
            self.file.size
        );

        let mut limiter = (self.options.bandwidth_throttle > 0)
            .then(|| RateLimiter::new(self.options.bandwidth_throttle));
        let mut stream = response.bytes_stream();
        let cancel = self.shared.cancel.clone();

        loop {
            self.wait_if_paused(limiter.as_mut()).await?;

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            let pacing = match limiter.as_mut() {
                Some(limiter) => limiter
                    .forward(&chunk, &mut handle)
                    .await
                    .map_err(EngineError::Limiter)?,
                None => {
                    handle
                        .write_all(&chunk)
                        .await
                        .map_err(|e| EngineError::fs(&temp_path, e))?;
                    Pacing::Flow
                }
            };
            self.account(chunk.len() as u64);

            if let Pacing::Pause(delay) = pacing {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        match limiter.as_mut() {
            Some(limiter) => limiter
                .finish(&mut handle)
                .await
                .map_err(EngineError::Limiter)?,
            None => handle
                .flush()
                .await
                .map_err(|e| EngineError::fs(&temp_path, e))?,
        }
        handle
            .sync_all()
            .await
            .map_err(|e| EngineError::fs(&temp_path, e))?;
        drop(handle);

        let received = self.tracker.downloaded();
        if self.file.size > 0 && received < self.file.size {
            return Err(EngineError::Truncated {
                expected: self.file.size,
                received,
            });
        }

        if matches!(self.hooks.progress, ProgressDispatch::Emit) {
            if let Some(snapshot) = self.tracker.finish() {
                self.emit(EngineEvent::Progress(snapshot));
            }
        }
        Ok(())
    }

    /// Raw chunk accounting; runs after the chunk reached the file.
    fn account(&mut self, bytes: u64) {
        let due = self.tracker.record(bytes);
        self.publish_stats();

        match &self.hooks.progress {
            ProgressDispatch::Hook(hook) => hook(bytes),
            ProgressDispatch::Emit => {
                if let Some(snapshot) = due {
                    self.emit(EngineEvent::Progress(snapshot));
                }
            }
        }
    }

    async fn wait_if_paused(&mut self, limiter: Option<&mut RateLimiter>) -> Result<(), EngineError> {
        if !*self.paused_rx.borrow() {
            return Ok(());
        }

        self.set_state(EngineState::Paused);
        match &self.hooks.paused {
            Some(hook) => hook(&self.options.uid),
            None => self.emit(EngineEvent::Paused {
                id: self.id().to_string(),
            }),
        }
        info!("Download {} paused", self.id());

        let cancel = self.shared.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = self.paused_rx.wait_for(|paused| !*paused) => {}
        }

        if let Some(limiter) = limiter {
            limiter.restart_window();
        }
        self.set_state(EngineState::Downloading);
        match &self.hooks.resumed {
            Some(hook) => hook(&self.options.uid),
            None => self.emit(EngineEvent::Resumed {
                id: self.id().to_string(),
            }),
        }
        info!("Download {} resumed", self.id());
        Ok(())
    }

    /// Rename the temporary file into place under the (possibly hook-chosen) save name.
    async fn finalize(&mut self) -> Result<PathBuf, EngineError> {
        let save_name = self
            .hooks
            .before_save
            .as_ref()
            .and_then(|hook| hook(&self.file.filename))
            .map(|name| sanitize_filename(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.file.filename.clone());

        self.emit(EngineEvent::BeforeSave {
            id: self.id().to_string(),
            filename: save_name.clone(),
        });

        let target = self.options.destination.join(&save_name);
        tokio::fs::rename(&self.file.temp_filepath, &target)
            .await
            .map_err(|e| EngineError::fs(&target, e))?;
        self.file.filename = save_name;
        self.file.filepath = target.clone();

        self.set_state(EngineState::Completed);
        match &self.hooks.completed {
            Some(hook) => hook(&self.options.uid),
            None => self.emit(EngineEvent::Completed {
                id: self.id().to_string(),
                path: target.clone(),
            }),
        }
        info!("Download completed: {:?}", target);
        Ok(target)
    }

    async fn on_error(&mut self, err: EngineError) -> EngineError {
        error!("Download {} failed: {}", self.id(), err);
        self.set_state(EngineState::Error);

        match self.hooks.error.clone() {
            ErrorDispatch::Hook(hook) => {
                hook(&err, self.options.remove_on_error, &self.file.snapshot());
                err
            }
            ErrorDispatch::Emit => {
                self.emit(EngineEvent::Error {
                    id: self.id().to_string(),
                    error: err.to_string(),
                });
                self.apply_removal_policy(err).await
            }
            ErrorDispatch::Silent => self.apply_removal_policy(err).await,
        }
    }

    async fn apply_removal_policy(&mut self, err: EngineError) -> EngineError {
        if !self.options.remove_on_error {
            return err;
        }
        match self.remove_temp_file().await {
            Ok(()) => self.emit(EngineEvent::FileRemoved {
                id: self.id().to_string(),
            }),
            Err(remove_err) => {
                warn!("Download {} could not remove partial file: {}", self.id(), remove_err)
            }
        }
        err
    }

    async fn on_cancelled(&mut self) -> EngineError {
        self.set_state(EngineState::Cancelled);
        if let Err(e) = self.remove_temp_file().await {
            warn!("Download {} could not remove temp file: {}", self.id(), e);
        }
        info!("Download {} cancelled", self.id());
        EngineError::Cancelled
    }

    /// Delete the attempt's temporary file. Absent files are not an error.
    async fn remove_temp_file(&mut self) -> Result<(), EngineError> {
        self.file.handle = None;
        let path = self.file.temp_filepath.clone();
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed temp file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::fs(path, e)),
        }
    }

    /// Drop everything a failed attempt produced before the next one starts.
    async fn discard_attempt(&mut self) {
        if let Err(e) = self.remove_temp_file().await {
            warn!("Download {} could not discard partial file: {}", self.id(), e);
        }
        self.reset_attempt();
    }

    fn reset_attempt(&mut self) {
        self.file = FileDescriptor::default();
        self.tracker.reset();
        self.publish_stats();
    }

    fn publish_stats(&self) {
        *self.shared.stats.write() = self.tracker.snapshot();
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.shared.state.write();
        if state.can_transition_to(next) {
            debug!("Download {}: {:?} -> {:?}", self.options.uid, *state, next);
            *state = next;
        } else {
            warn!(
                "Download {}: ignoring invalid transition {:?} -> {:?}",
                self.options.uid, *state, next
            );
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("id", &self.options.uid)
            .field("url", &self.options.url)
            .field("state", &self.state())
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_for(options: TaskOptions) -> Result<DownloadEngine, EngineError> {
        let (tx, _) = broadcast::channel(16);
        DownloadEngine::new(options, TaskHooks::default(), Client::new(), tx)
    }

    #[test]
    fn test_scheme_from_prefix() {
        assert_eq!(Scheme::from_url("https://a.b/c"), Some(Scheme::Https));
        assert_eq!(Scheme::from_url("HTTP://a.b/c"), Some(Scheme::Http));
        assert_eq!(Scheme::from_url("ftp://a.b/c"), None);
        assert_eq!(Scheme::from_url("a.b/c"), None);
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = engine_for(TaskOptions::new("ftp://example.com/f", "/tmp")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));
    }

    #[test]
    fn test_rejects_empty_destination() {
        let err = engine_for(TaskOptions::new("http://example.com/f", "")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));
    }

    #[test]
    fn test_rejects_invalid_method() {
        let mut options = TaskOptions::new("http://example.com/f", "/tmp");
        options.method = "BAD METHOD".to_string();
        assert!(matches!(
            engine_for(options).unwrap_err(),
            EngineError::InvalidOptions(_)
        ));
    }

    #[test]
    fn test_new_engine_is_idle() {
        let engine = engine_for(TaskOptions::new("http://example.com/f", "/tmp")).unwrap();
        let control = engine.control();
        assert_eq!(control.state(), EngineState::Idle);
        assert_eq!(control.stats().downloaded, 0);
        assert_eq!(control.id(), engine.id());
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_nothing_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = engine_for(TaskOptions::new("http://127.0.0.1:9/f", dir.path())).unwrap();
        engine.cancel();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(engine.state(), EngineState::Cancelled);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_engine_runs_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = engine_for(TaskOptions::new("http://127.0.0.1:9/f", dir.path())).unwrap();
        engine.cancel();
        let _ = engine.start().await;

        assert!(matches!(
            engine.start().await.unwrap_err(),
            EngineError::InvalidOptions(_)
        ));
    }
}
