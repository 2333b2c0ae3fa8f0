//! brd CLI - Command-line downloader
//!
//! Runs a download in this process or through supervised worker processes.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use brd_types::{Settings, TaskOptions};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// brd - rate-limited HTTP(S) downloader
#[derive(Parser)]
#[command(name = "brd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "BRD_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL in this process
    Fetch(TaskArgs),

    /// Download a URL through supervised worker processes
    Spawn {
        #[command(flatten)]
        task: TaskArgs,

        /// Number of workers (each downloads the same task)
        #[arg(short, long)]
        workers: Option<u32>,

        /// Ask each worker to disconnect this many ms after spawning it
        #[arg(long)]
        auto_disconnect_ms: Option<u64>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },

    /// Run as a worker process (stdin/stdout message channel)
    #[command(hide = true)]
    Worker,
}

/// Task options shared by `fetch` and `spawn`; unset flags fall back to settings
#[derive(Args, Debug, Clone)]
struct TaskArgs {
    /// URL to download
    url: String,

    /// Destination directory
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Save under this filename instead of the server's
    #[arg(short, long)]
    name: Option<String>,

    /// HTTP method
    #[arg(short = 'X', long)]
    method: Option<String>,

    /// Bandwidth limit in KB/s (0 = unlimited)
    #[arg(short, long)]
    limit: Option<u64>,

    /// Maximum retries after the first attempt
    #[arg(long)]
    retries: Option<u32>,

    /// Fail on the first error
    #[arg(long)]
    no_retry: bool,

    /// Overwrite an existing file instead of picking a numbered name
    #[arg(long)]
    overwrite: bool,

    /// Keep the partial file when the download fails
    #[arg(long)]
    keep_partial: bool,

    /// Maximum redirect hops
    #[arg(long)]
    max_redirects: Option<u32>,

    /// Minimum interval between progress updates in ms
    #[arg(long)]
    progress_ms: Option<u64>,

    /// Task identifier (generated when absent)
    #[arg(long)]
    id: Option<String>,
}

impl TaskArgs {
    fn into_options(self, settings: &Settings) -> TaskOptions {
        let mut options = settings.task_options(self.url);
        if let Some(destination) = self.destination {
            options.destination = destination;
        }
        options.filename = self.name;
        if let Some(method) = self.method {
            options.method = method;
        }
        if let Some(limit) = self.limit {
            options.bandwidth_throttle = limit;
        }
        if let Some(retries) = self.retries {
            options.max_retries = retries;
        }
        if self.no_retry {
            options.retry = false;
        }
        if self.overwrite {
            options.clone_files = false;
        }
        if self.keep_partial {
            options.remove_on_error = false;
        }
        if let Some(max_redirects) = self.max_redirects {
            options.max_redirects = max_redirects;
        }
        if let Some(progress_ms) = self.progress_ms {
            options.progress_throttle = progress_ms;
        }
        if let Some(id) = self.id {
            options.uid = id;
        }
        options
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Print the settings file location
    Path,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // Workers may still have a stdin read in flight
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let storage = brd_core::Storage::locate(cli.config)?;

    match cli.command {
        Commands::Fetch(task) => {
            let settings = storage.load_settings().await?;
            commands::fetch(&settings, task.into_options(&settings), cli.output).await?
        }

        Commands::Spawn {
            task,
            workers,
            auto_disconnect_ms,
        } => {
            let settings = storage.load_settings().await?;
            let options = task.into_options(&settings);
            commands::spawn(&storage, &settings, options, workers, auto_disconnect_ms, cli.output)
                .await?
        }

        Commands::Config { action } => commands::config_action(&storage, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "brd", &mut std::io::stdout());
        }

        Commands::Worker => {
            let settings = storage.load_settings().await?;
            brd_core::supervisor::run_stdio(brd_core::WorkerConfig::new(settings)).await?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::parse_from([
            "brd",
            "fetch",
            "http://example.com/a.iso",
            "-d",
            "/tmp/out",
            "--limit",
            "64",
            "--no-retry",
            "--overwrite",
            "--id",
            "job-1",
        ]);
        let Commands::Fetch(task) = cli.command else {
            panic!("expected fetch");
        };

        let settings = Settings {
            max_redirects: 4,
            ..Default::default()
        };
        let options = task.into_options(&settings);
        assert_eq!(options.destination, PathBuf::from("/tmp/out"));
        assert_eq!(options.bandwidth_throttle, 64);
        assert!(!options.retry);
        assert!(!options.clone_files);
        assert!(options.remove_on_error);
        assert_eq!(options.max_redirects, 4);
        assert_eq!(options.uid, "job-1");
    }
}
