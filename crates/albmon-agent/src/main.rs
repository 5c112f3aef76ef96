mod config;
mod output;

use albmon_cloud::aws::AwsClient;
use albmon_cloud::catalogue;
use albmon_cloud::collector::AlbCollector;
use albmon_cloud::MetricStatistics;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("albmon=info".parse()?))
        .init();

    let args = config::Args::parse();
    let config = config::AgentConfig::load(&args)?;

    catalogue::validate_catalogue().map_err(anyhow::Error::msg)?;

    if config.meta {
        output::write_graph_definitions(&mut std::io::stdout().lock(), &config.prefix)?;
        return Ok(());
    }

    config.account.validate()?;
    tracing::info!(
        load_balancer = %config.account.load_balancer,
        fetch_secs = config.account.fetch_duration_secs,
        "albmon-agent starting"
    );

    let client = Arc::new(
        AwsClient::new(&config.account)
            .await
            .context("Failed to set up AWS client")?,
    );
    tracing::debug!(region = %client.region(), "AWS client ready");

    let statistics: Arc<dyn MetricStatistics> = client.clone();
    let collector = AlbCollector::setup(client.as_ref(), statistics, &config.account).await;

    let snapshot = collector.collect().await;
    let mut out = std::io::stdout().lock();
    output::write_snapshot(&mut out, &snapshot, &config.prefix, Utc::now())?;
    out.flush()?;

    Ok(())
}
