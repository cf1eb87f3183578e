use color_eyre::eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use address_harvester::config::Config;
use address_harvester::db::Db;
use address_harvester::ingest::Coordinator;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::read()?;

    // the store must be usable before any block is requested
    let db = Db::connect(&config.db).await?;
    db.initialize().await?;

    let mut coordinator = Coordinator::new(db.clone(), &config.ingest, config.explorer.clone());
    let report = coordinator.run().await?;

    if !report.failed.is_empty() || report.aborted_workers > 0 {
        warn!(
            failed = ?report.failed,
            aborted_workers = report.aborted_workers,
            "some heights were not ingested, rerun to resume from the progress marker"
        );
    }

    info!(
        addresses = db.count_addresses().await?,
        progress = report.progress,
        "done"
    );

    Ok(())
}

fn setup() -> Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::from_default_env();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
