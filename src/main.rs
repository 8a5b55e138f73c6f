use anyhow::Context;
use clap::Parser;
use log::info;
use merchant_backfill::gateway::BranchCountUpdater;
use merchant_backfill::mysql::MySqlStore;
use merchant_backfill::pipeline::Pipeline;
use merchant_backfill::settings::Settings;
use merchant_backfill::source::RecordSource;
use merchant_backfill::types::PipelineError;
use std::path::PathBuf;
use std::sync::Arc;

/// Fills in unset merchant branch counts from a `retailer_id,branch_count` CSV file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Input file, overriding `input.path` from the configuration.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let args = Args::parse();

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("failed to read config from {}", args.config.display()))?;
    if let Some(input) = args.input {
        settings.input.path = input;
    }

    info!(target: "main", "Reading data from {}", settings.input.path.display());
    let source = RecordSource::open(&settings.input.path)?;

    let store = MySqlStore::connect(&settings.database, &settings.table)
        .await
        .context("failed to connect to the merchant database")?;
    let store = Arc::new(store);

    let pipeline = Pipeline::new(BranchCountUpdater::new(store.clone()));
    let result = pipeline.run(source).await;
    store.close().await;

    match &result {
        Ok(report) | Err(PipelineError::Input { report, .. }) => {
            info!(target: "main", "{report}");
        }
        Err(PipelineError::Task(_)) => {}
    }
    result?;
    Ok(())
}
