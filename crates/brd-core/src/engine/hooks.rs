//! Caller-supplied overrides for engine notifications
//!
//! Whether a notification goes out as an [`EngineEvent`](brd_types::EngineEvent)
//! or through a hook is fixed when the engine is built, never decided per call.

use crate::error::EngineError;
use brd_types::FileSnapshot;
use std::fmt;
use std::sync::Arc;

/// Receives the raw size of every chunk
pub type ProgressHook = Arc<dyn Fn(u64) + Send + Sync>;
/// Receives the error, the removal policy and the file descriptor of the failed attempt
pub type ErrorHook = Arc<dyn Fn(&EngineError, bool, &FileSnapshot) + Send + Sync>;
/// Receives the task id
pub type LifecycleHook = Arc<dyn Fn(&str) + Send + Sync>;
/// Receives the resolved filename, may return a different save name
pub type BeforeSaveHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// How progress is reported
#[derive(Clone, Default)]
pub enum ProgressDispatch {
    /// Throttled `Progress` events
    #[default]
    Emit,
    /// Every chunk goes to the hook; no `Progress` events
    Hook(ProgressHook),
}

/// How a failed download is reported
#[derive(Clone, Default)]
pub enum ErrorDispatch {
    /// Emit an `Error` event, then apply the removal policy
    #[default]
    Emit,
    /// Apply the removal policy without emitting; the error only travels
    /// through the returned outcome
    Silent,
    /// Hand everything to the hook, which owns cleanup
    Hook(ErrorHook),
}

/// Hook overrides for one task
#[derive(Clone, Default)]
pub struct TaskHooks {
    pub progress: ProgressDispatch,
    pub error: ErrorDispatch,
    pub paused: Option<LifecycleHook>,
    pub resumed: Option<LifecycleHook>,
    pub completed: Option<LifecycleHook>,
    pub before_save: Option<BeforeSaveHook>,
}

impl TaskHooks {
    pub fn on_progress(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = ProgressDispatch::Hook(Arc::new(hook));
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(&EngineError, bool, &FileSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.error = ErrorDispatch::Hook(Arc::new(hook));
        self
    }

    pub fn silent_errors(mut self) -> Self {
        self.error = ErrorDispatch::Silent;
        self
    }

    pub fn on_paused(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.paused = Some(Arc::new(hook));
        self
    }

    pub fn on_resumed(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.resumed = Some(Arc::new(hook));
        self
    }

    pub fn on_completed(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.completed = Some(Arc::new(hook));
        self
    }

    pub fn on_before_save(
        mut self,
        hook: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.before_save = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for TaskHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = match self.progress {
            ProgressDispatch::Emit => "emit",
            ProgressDispatch::Hook(_) => "hook",
        };
        let error = match self.error {
            ErrorDispatch::Emit => "emit",
            ErrorDispatch::Silent => "silent",
            ErrorDispatch::Hook(_) => "hook",
        };
        f.debug_struct("TaskHooks")
            .field("progress", &progress)
            .field("error", &error)
            .field("paused", &self.paused.is_some())
            .field("resumed", &self.resumed.is_some())
            .field("completed", &self.completed.is_some())
            .field("before_save", &self.before_save.is_some())
            .finish()
    }
}
