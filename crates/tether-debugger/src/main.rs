use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tether_config::TetherConfig;
use tether_debugger::Orchestrator;

/// Tether debugger orchestrator.
///
/// Reads host requests framed like Debug Adapter Protocol messages on stdin
/// and writes responses and session events on stdout.
#[derive(Debug, Parser)]
#[command(name = "tether-debugger", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `TETHER_CONFIG` is used as a fallback. When neither is
    /// provided the built-in defaults apply.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, load_error) = TetherConfig::load_or_default(cli.config);
    tether_debugger::hardening::init(&config, Arc::new(|message| eprintln!("{message}")));
    if let Some(err) = load_error {
        tracing::warn!(target: "tether.debugger", error = %err, "failed to load config; continuing with defaults");
    }

    let orchestrator = Orchestrator::new(&config);
    tether_debugger::host::run_stdio(orchestrator).await
}
