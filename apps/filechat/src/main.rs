//! filechat entry point.
//!
//! ```text
//! filechat [serve|connect] [--config <path>]
//! ```

mod app;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: filechat [serve|connect] [--config <path>]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Connect,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    mode: Mode,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut mode = Mode::Connect;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "serve" => mode = Mode::Serve,
            "connect" => mode = Mode::Connect,
            "--config" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }
    Ok(Args { mode, config })
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = config::Config::load(args.config.as_deref())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?args.mode,
        nickname = %config.nickname,
        "starting filechat"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("SIGINT received, shutting down");
                ctrl_c.cancel();
            }
        });

        match args.mode {
            Mode::Serve => app::run_server(config, cancel).await,
            Mode::Connect => app::run_client(config, cancel).await,
        }
    });

    // A pending stdin read would otherwise keep the runtime alive.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}
