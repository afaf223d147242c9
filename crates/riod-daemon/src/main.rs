//! riod — display server daemon.
//!
//! Builds the synthetic tree and holds it until shutdown. There is no wire
//! protocol here: a 9P codec or FUSE bridge links against `riod-core` and
//! drives `FileServer` directly; this binary exists for standalone bring-up
//! (spawn a terminal, let routes run, exercise the tree in-process).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use riod_core::{RioConfig, RioRoot};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "riod", about = "Plan-9-style display server over synthetic files")]
struct Args {
    /// Scene width.
    #[arg(long, default_value_t = 3840)]
    width: u32,

    /// Scene height.
    #[arg(long, default_value_t = 2160)]
    height: u32,

    /// Background color (#RRGGBB).
    #[arg(long, default_value = "#FAFAFA")]
    background: String,

    /// Client-visible mount point of this tree.
    #[arg(long, default_value = "/n/rio")]
    rio_mount: String,

    /// Mount point of the agent filesystem.
    #[arg(long, default_value = "/n/llm")]
    llmfs_mount: String,

    /// Root the sandbox allows writes under.
    #[arg(long, default_value = "/n")]
    writable_root: String,

    /// Quiet interval (ms) before terminal stdout batches are marked ready.
    #[arg(long, default_value_t = 120)]
    stdout_debounce_ms: u64,

    /// Disable the shell sandbox (development only).
    #[arg(long)]
    no_sandbox: bool,

    /// Path for `ctl save` / `ctl load`.
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Spawn one terminal at startup.
    #[arg(long)]
    with_terminal: bool,

    /// Directory for rolling log files (stderr only when unset).
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let registry = tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let _guard = if let Some(log_dir) = &args.log_dir {
        std::fs::create_dir_all(log_dir).ok();
        let appender = tracing_appender::rolling::daily(log_dir, "riod.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    let default_state = RioConfig::default().state_path;
    let config = RioConfig {
        width: args.width,
        height: args.height,
        background: args.background,
        rio_mount: args.rio_mount,
        llmfs_mount: args.llmfs_mount,
        writable_root: args.writable_root,
        stdout_debounce_ms: args.stdout_debounce_ms,
        sandbox_enabled: !args.no_sandbox,
        state_path: args.state_path.unwrap_or(default_state),
    };

    info!(
        width = config.width,
        height = config.height,
        rio_mount = %config.rio_mount,
        llmfs_mount = %config.llmfs_mount,
        sandbox = config.sandbox_enabled,
        "riod starting"
    );

    let root = RioRoot::new(config);

    if args.with_terminal {
        match root.terms.register_terminal() {
            Ok(id) => info!(term_id = %id, "startup terminal ready"),
            Err(e) => tracing::warn!(error = %e, "could not spawn startup terminal"),
        }
    }

    info!("tree assembled; waiting for transport (ctrl-c to exit)");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    root.shutdown();
    Ok(())
}
