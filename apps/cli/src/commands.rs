//! CLI command implementations

use crate::output::{format_bytes, format_limit, print_output};
use crate::progress::{DownloadProgress, WorkerProgress};
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use brd_core::{
    apply_setting, build_client, DownloadEngine, EngineControl, EngineError, Storage, Supervisor,
    SupervisorConfig, TaskHooks, TaskRegistry, WorkerEntry, CONFIG_ENV,
};
use brd_types::{EngineEvent, Settings, SupervisorEvent, TaskOptions, WorkerMessageKind};
use console::style;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Download Commands
// ============================================================================

#[derive(Serialize)]
struct FetchResult {
    id: String,
    path: PathBuf,
    size: u64,
}

pub async fn fetch(settings: &Settings, options: TaskOptions, format: OutputFormat) -> Result<()> {
    let client = build_client(settings)?;
    let (event_tx, mut event_rx) = broadcast::channel(1024);
    let mut engine = DownloadEngine::new(options, TaskHooks::default(), client, event_tx)?;

    let registry: Arc<TaskRegistry<EngineControl>> = Arc::new(TaskRegistry::new());
    let id = registry.add(engine.control(), Some(engine.id().to_string()));

    let interrupt = registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for (_, control) in interrupt.all() {
                control.cancel();
            }
        }
    });

    let printer = tokio::spawn(async move {
        let bar = (format == OutputFormat::Human).then(DownloadProgress::new);
        loop {
            match event_rx.recv().await {
                Ok(event) => match &bar {
                    Some(bar) => bar.handle_event(&event),
                    None => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{}", line);
                        }
                    }
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        bar
    });

    let result = engine.start().await;
    let size = engine.control().stats().downloaded;
    registry.remove(&id);
    drop(engine);
    let bar = printer.await?;

    match result {
        Ok(path) => print_output(&FetchResult { id, path, size }, format, |r| {
            format!(
                "{} Downloaded {} ({})",
                style("✓").green().bold(),
                style(r.path.display()).cyan(),
                format_bytes(r.size)
            )
        }),
        Err(EngineError::Cancelled) => {
            if let Some(bar) = bar {
                bar.cancelled();
            }
            bail!("download {} was cancelled", id)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn spawn(
    storage: &Storage,
    settings: &Settings,
    options: TaskOptions,
    workers: Option<u32>,
    auto_disconnect_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let count = workers.unwrap_or(settings.worker_count) as usize;
    let auto_disconnect = match auto_disconnect_ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => settings.auto_disconnect(),
    };

    let supervisor = Supervisor::new(SupervisorConfig {
        auto_disconnect,
        ..Default::default()
    });
    let mut events = supervisor.subscribe();
    let entry = WorkerEntry::current_exe()?
        .arg("worker")
        .env(CONFIG_ENV, storage.path());

    let pids = supervisor.start(count, &entry, &options).await?;
    let display = (format == OutputFormat::Human).then(|| WorkerProgress::new(&pids));
    let mut alive: HashSet<u32> = pids.iter().copied().collect();
    let mut failures = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !alive.is_empty() {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                supervisor.kill(None).await;
                if let Some(display) = &display {
                    display.clear();
                }
                bail!("interrupted; {} worker(s) killed", alive.len());
            }
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match &display {
            Some(display) => display.handle_event(&event),
            None => println!("{}", serde_json::to_string(&event)?),
        }

        match event {
            SupervisorEvent::Message(message) => match message.kind {
                WorkerMessageKind::Completed => supervisor.stop(message.pid).await,
                WorkerMessageKind::Failed => {
                    failures += 1;
                    supervisor.stop(message.pid).await;
                }
                WorkerMessageKind::Progress => {}
            },
            SupervisorEvent::Error { .. } => failures += 1,
            SupervisorEvent::Disconnected { pid } => {
                alive.remove(&pid);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} worker(s) failed", failures, pids.len());
    }
    Ok(())
}

// ============================================================================
// Settings
// ============================================================================

pub async fn config_action(
    storage: &Storage,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                OutputFormat::Human => {
                    println!("brd Configuration ({}):", storage.path().display());
                    println!();
                    println!("  Default destination: {}", settings.default_destination.display());
                    println!("  Bandwidth limit: {}", format_limit(settings.bandwidth_throttle));
                    println!("  Progress interval: {}ms", settings.progress_throttle_ms);
                    println!(
                        "  Retry: {} (max {}, delay {}ms)",
                        settings.retry, settings.max_retries, settings.retry_delay_ms
                    );
                    println!("  Clone on collision: {}", settings.clone_files);
                    println!("  Remove partial on error: {}", settings.remove_on_error);
                    println!("  Max redirects: {}", settings.max_redirects);
                    println!("  User agent: {}", settings.user_agent);
                    println!(
                        "  Timeouts: connect {}s, read {}s",
                        settings.connect_timeout_secs, settings.read_timeout_secs
                    );
                    println!("  Workers: {}", settings.worker_count);
                    println!("  Disconnect grace: {}s", settings.disconnect_grace_secs);
                }
            }
        }

        Some(ConfigAction::Path) => {
            println!("{}", storage.path().display());
        }

        Some(ConfigAction::Get { key }) => {
            let settings = serde_json::to_value(storage.load_settings().await?)?;
            let value = settings
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = storage.load_settings().await?;
            let updated = apply_setting(&settings, &key, &value)?;
            storage.save_settings(&updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                storage.reset().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
