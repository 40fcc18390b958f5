use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hubsync::config::ClientConfig;
use hubsync::sync::{
    ChangeEventProcessor, ChannelDispatcher, EchoSuppressionRegistry, ExcludePatterns,
    FileWatcher,
};

#[derive(Debug, Parser)]
#[command(name = "hubsync", version, about = "Propagate local file changes to a sync hub")]
struct Cli {
    /// Configuration file (defaults to <config dir>/hubsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch a directory and print confirmed changes as JSON lines
    Watch {
        /// Directory to watch (overrides `root` from the config file)
        root: Option<PathBuf>,

        /// Extra glob pattern to exclude; may be repeated
        #[arg(long = "exclude", value_name = "GLOB")]
        excludes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Command::Watch { root, excludes } => watch(config, root, excludes).await,
    }
}

async fn watch(config: ClientConfig, root: Option<PathBuf>, extra: Vec<String>) -> Result<()> {
    let root = root
        .or_else(|| config.root.clone())
        .context("no directory to watch: pass one or set `root` in the config file")?;
    let root = root
        .canonicalize()
        .with_context(|| format!("cannot access {}", root.display()))?;

    let mut excludes = config.excludes_for(&root)?;
    excludes.merge(&ExcludePatterns::from_patterns(&extra)?)?;

    let registry = match config.echo.ttl() {
        Some(ttl) => EchoSuppressionRegistry::with_ttl(ttl),
        None => EchoSuppressionRegistry::new(),
    };
    let (dispatcher, mut records) = ChannelDispatcher::channel();

    let processor = ChangeEventProcessor::builder(&root, registry, Arc::new(dispatcher))
        .retry_policy(config.retry_policy())
        .excludes(excludes)
        .build()?;
    let watcher = FileWatcher::start(Arc::new(processor))?;

    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(record) = records.recv().await {
            let line = serde_json::to_string(&record)?;
            writeln!(stdout, "{line}")?;
            stdout.flush()?;
        }
        anyhow::Ok(())
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let processor = Arc::clone(watcher.processor());
    drop(watcher);
    processor.shutdown().await;
    // The printer ends once the last dispatcher handle is gone.
    drop(processor);
    printer.await??;

    Ok(())
}
