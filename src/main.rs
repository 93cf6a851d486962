use chanlog::config::Config;
use chanlog::db::Database;
use chanlog::ingest::{EngineOptions, IngestEngine};
use chanlog::source::DiscordSource;
use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Load and validate configuration before touching anything external
    let config = Config::from_env()?;
    config.validate()?;
    info!("Configuration loaded: {:?}", config);

    let db = Database::open(&config.database_path)?;
    db.initialize()?;

    let source = DiscordSource::new(&config.discord_token, config.channel_id, config.page_delay_ms);
    let engine = IngestEngine::new(db, source, EngineOptions::from(&config));

    let report = match engine.run(Utc::now()).await {
        Ok(report) => report,
        Err(e) => {
            error!("Run aborted: {}", e);
            return Err(e.into());
        }
    };

    for failure in &report.failures {
        warn!("Failed to store {}: {}", failure.external_id, failure.reason);
    }
    info!(
        "Successfully processed window: {} inserted, {} skipped, {} failed",
        report.inserted, report.skipped, report.failed
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
