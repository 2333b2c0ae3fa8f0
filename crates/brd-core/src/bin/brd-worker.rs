//! Worker process the Supervisor spawns. Stdout carries the message channel,
//! so logs go to stderr.

use brd_core::supervisor::{run_stdio, WorkerConfig};
use brd_core::Storage;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let settings = Storage::locate(None)?.load_settings().await?;
        run_stdio(WorkerConfig::new(settings)).await?;
        anyhow::Ok(())
    });
    // A pending stdin read must not hold the process open
    runtime.shutdown_background();
    result
}
