use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::HarnessConfig;

/// Run the embedded migrations.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect db")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate db")?;

    tracing::info!("migrations complete");
    Ok(())
}
