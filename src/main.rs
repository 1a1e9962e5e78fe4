//! EISV governance service: CLI entry point

use clap::{Parser, Subcommand};
use eisv_core::{system_clock, ConfigHandle, ConfigWatcher, GovernanceConfig};
use eisv_gateway::{serve, AppState, ResolvedAuth};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "eisv", about = "EISV governance service: agent state, verdicts and peer review")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the governance gateway
    Serve {
        /// Config file (default: $EISV_CONFIG, then ./eisv.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the bind address
        #[arg(short, long)]
        bind: Option<String>,
        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print the default config as TOML
    Config,
    /// Show version
    Version,
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("EISV_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("eisv.toml"))
}

/// Returns the appender guard; dropping it flushes the file layer.
fn init_tracing(log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eisv=info,tower_http=info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "eisv.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn run_server(
    config_file: PathBuf,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let mut config = GovernanceConfig::load_resolved(&config_file)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let env_token = std::env::var("EISV_AUTH_TOKEN").ok();
    let auth = ResolvedAuth::from_config(&config.server, env_token);
    if !auth.required() {
        warn!("no auth token configured; RPC is open to anyone who can reach {}", config.server.bind);
    }
    let poll = Duration::from_millis(config.server.reload_poll_ms.max(100));

    let handle = ConfigHandle::new(config);
    let state = AppState::build(handle.clone(), system_clock(), auth).await?;

    let cancel = CancellationToken::new();
    let mut tasks = state.spawn_background(&cancel);
    let watcher = ConfigWatcher::new(config_file, handle, poll);
    tasks.push(tokio::spawn(watcher.run(cancel.clone())));

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!("failed to listen for ctrl-c: {}", e),
            }
            cancel.cancel();
        })
    };

    let served = serve(state.clone(), cancel.clone()).await;
    cancel.cancel();
    ctrl_c.abort();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {}", e);
        }
    }
    if let Err(e) = state.shutdown().await {
        error!("failed to persist session bindings: {}", e);
    }
    served
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            config,
            port,
            bind,
            log_file,
        }) => {
            let _guard = init_tracing(log_file.as_ref());
            run_server(config_path(config), port, bind).await?;
        }
        Some(Commands::Config) => {
            print!("{}", GovernanceConfig::default().to_toml());
        }
        Some(Commands::Version) => {
            println!("eisv v{}", env!("CARGO_PKG_VERSION"));
        }
        None => {
            let _guard = init_tracing(None);
            run_server(config_path(None), None, None).await?;
        }
    }

    Ok(())
}
