use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lib::adapters::{TelegramAdapter, WeChatAdapter};
use lib::backend::HttpBackend;
use lib::config::{load_config, Config};
use lib::service::{Adapter, Handler};
use lib::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Relay chat-platform messages to a conversational backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run all enabled adapters from the config file
    Run {
        /// Config file path
        #[arg(long, short, value_name = "PATH", default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Config helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print an example config
    Gen,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run(config).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Config {
            command: ConfigCommands::Gen,
        }) => {
            if let Err(e) = config_gen() {
                log::error!("config gen failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn config_gen() -> Result<()> {
    let yaml = serde_yaml::to_string(&lib::config::example_config())?;
    print!("{}", yaml);
    Ok(())
}

/// Start one handler with its own store per enabled adapter, then wait for
/// ctrl-c and signal shutdown to all dispatch loops.
async fn run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for name in &config.adapters.enabled {
        let handle = start_adapter(&config, name, shutdown_rx.clone())
            .with_context(|| format!("starting adapter {}", name))?;
        handles.push(handle);
    }
    if handles.is_empty() {
        anyhow::bail!("no adapters enabled");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn start_adapter(
    config: &Config,
    name: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    let adapter_cfg = config
        .adapters
        .items
        .get(name)
        .with_context(|| format!("adapter not found: {}", name))?;
    let general = adapter_cfg.general(&config.general);

    let adapter: Arc<dyn Adapter> = match adapter_cfg.driver.as_str() {
        "telegram" => {
            let telegram = adapter_cfg
                .telegram
                .clone()
                .context("telegram config missing")?;
            Arc::new(TelegramAdapter::new(name, telegram))
        }
        "wechat" => {
            let wechat = adapter_cfg.wechat.clone().context("wechat config missing")?;
            Arc::new(WeChatAdapter::new(name, wechat))
        }
        other => anyhow::bail!("invalid driver: {}", other),
    };

    let backend = Arc::new(HttpBackend::new(
        general.backend.host.clone(),
        general.backend.app_id.clone(),
        general.backend.debug,
    ));
    let handler = Handler::new(general, backend, Arc::new(MemoryStore::new()))?;

    log::info!("starting adapter {} ({})", name, adapter_cfg.driver);
    Ok(tokio::spawn(async move {
        handler.run(adapter, shutdown).await;
    }))
}
