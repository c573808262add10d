use std::sync::Arc;

use pin_ledger::billing::spawn_maintenance_scheduler;
use pin_ledger::{config, Clock, Ledger, PgStore, SystemClock};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let store = PgStore::connect(&config::DATABASE_URL, *config::DATABASE_MAX_CONNECTIONS).await?;

    if let Err(error) = store.migrate().await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Ledger::new(Arc::new(store), clock.clone());
    let (resets, scans) = spawn_maintenance_scheduler(ledger.usage, ledger.uploads, clock);

    tracing::info!(
        reset_interval_secs = *config::USAGE_RESET_INTERVAL_SECS,
        scan_interval_secs = *config::GC_SCAN_INTERVAL_SECS,
        "pin ledger maintenance started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down pin ledger maintenance");
    resets.abort();
    scans.abort();
    Ok(())
}
