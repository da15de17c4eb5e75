#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod cli;

use std::path::PathBuf;

use clap::Parser;
use gas_relay::config::load_config;
use gas_relay::shutdown::Shutdown;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

#[derive(Parser)]
struct Options {
    /// Path to a config file (TOML, JSON, YAML, ...). Settings are also read
    /// from `RELAY__*` environment variables, which take precedence.
    #[arg(long, env)]
    config: Option<PathBuf>,

    #[command(flatten)]
    log: cli::logging::Options,

    #[command(flatten)]
    tokio_console: cli::tokio_console::Options,

    #[command(flatten)]
    opentelemetry: cli::opentelemetry::Options,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let options = Options::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(options))
}

async fn run(options: Options) -> anyhow::Result<()> {
    {
        let early_log = Registry::default().with(options.log.to_layer()?);
        let _guard = tracing::subscriber::set_default(early_log);
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(options.log.to_layer()?)
                .with(options.opentelemetry.to_layer()?)
                .with(options.tokio_console.to_layer()?),
        )?;
    }

    let commit_sha = env!("COMMIT_SHA");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = &commit_sha[..commit_sha.len().min(8)],
        target = env!("TARGET"),
        built = env!("BUILD_DATE"),
        "starting gas-relay",
    );

    let config = load_config(options.config.as_deref())?;
    let shutdown = Shutdown::spawn(config.app.shutdown_timeout, config.app.shutdown_delay);

    let result = gas_relay::main(config, shutdown).await;

    cli::opentelemetry::shutdown();

    result
}
