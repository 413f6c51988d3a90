use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod assets;
mod cleanup;
mod commands;
mod config;
mod governor;
mod identity;
mod orchestrator;
mod plan;
mod sandbox;

#[derive(Parser)]
#[command(name = "sandkit")]
#[command(
    author,
    version,
    about = "Sandbox lifecycle orchestration for model evaluation runs"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level; `sandbox` adds backend lifecycle events
    #[arg(long, value_enum, global = true, default_value = "info")]
    log_level: LogLevel,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Directory for the cleanup ledger and local workspaces
    #[arg(long, global = true, env = "SANDKIT_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Info,
    Sandbox,
    Debug,
}

impl LogLevel {
    fn directives(self) -> &'static str {
        match self {
            Self::Info => "sandkit=info",
            Self::Sandbox => "sandkit=info,sandkit::sandbox=debug",
            Self::Debug => "sandkit=debug",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tasks of a plan file
    Run {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Sandbox for every task, `backend[:config]`
        #[arg(long)]
        sandbox: Option<String>,

        /// Leave environments running and print cleanup commands
        #[arg(long)]
        no_cleanup: bool,

        /// Maximum concurrently live environment sets
        #[arg(long)]
        max_sandboxes: Option<usize>,

        /// Maximum concurrently running commands
        #[arg(long)]
        max_exec_slots: Option<usize>,
    },

    /// Remove environments a backend left behind
    Cleanup {
        /// Backend name
        backend: String,

        /// Only this set id
        target: Option<String>,
    },

    /// Show recorded environment sets
    List {
        /// Only records of this backend
        backend: Option<String>,
    },
}

/// Cancels `token` on Ctrl+C or SIGTERM.
async fn wait_for_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }

    warn!("interrupt received, tearing down environments");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directives = if cli.verbose {
        LogLevel::Debug.directives()
    } else {
        cli.log_level.directives()
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let (file_layer, _guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map_or_else(|| "sandkit.log".into(), |n| n.to_os_string());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter()))
        .with(file_layer)
        .init();

    let state_dir = cli.state_dir.unwrap_or_else(config::default_state_dir);
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Run {
            plan,
            sandbox,
            no_cleanup,
            max_sandboxes,
            max_exec_slots,
        } => {
            let config = config::Config::load(&cwd)?;
            let cancel = CancellationToken::new();
            tokio::spawn(wait_for_shutdown(cancel.clone()));
            let args = commands::run::RunArgs {
                plan,
                sandbox,
                no_cleanup,
                max_sandboxes,
                max_exec_slots,
            };
            commands::run::run(args, state_dir, config, cancel).await?;
        }
        Commands::Cleanup { backend, target } => {
            let config = config::Config::load(&cwd)?;
            commands::cleanup::run(state_dir, config, &backend, target.as_deref()).await?;
        }
        Commands::List { backend } => {
            commands::list::run(state_dir, backend.as_deref()).await?;
        }
    }

    Ok(())
}
