use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod config;
mod migrate;

#[derive(Parser, Debug)]
#[command(name = "docket-harness")]
#[command(about = "Docket coordination substrate harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations.
    Migrate,

    /// Run the engine HTTP surface with the reaper.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Serve => serve(&cfg).await,
    }
}

async fn serve(cfg: &config::HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect db")?;

    let access = cfg.tenant_access()?;
    let bind = cfg.bind.parse().context("parse bind address")?;
    let server = docket_engine::EngineServer::start(pool, cfg.engine_config(), access, bind, true)
        .await
        .context("start engine")?;

    tracing::info!(
        event = "docket.harness.serving",
        addr = %server.addr,
        "engine started"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    tracing::info!(event = "docket.harness.shutdown", "engine shutting down");
    server.shutdown().await
}
