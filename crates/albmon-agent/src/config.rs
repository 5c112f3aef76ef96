use albmon_cloud::{split_target_groups, AlbAccountConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Report AWS Application Load Balancer metrics to the monitoring agent.
#[derive(Debug, Parser)]
#[command(name = "albmon-agent", version, about)]
pub struct Args {
    /// Optional TOML config file; flags override its values
    #[arg(long, env = "ALBMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// AWS region (defaults to environment, then instance metadata)
    #[arg(long)]
    pub region: Option<String>,

    /// Load balancer name, e.g. app/my-lb/50dc6c495c0c9188
    #[arg(long)]
    pub lbname: Option<String>,

    /// Comma-separated target groups, used when discovery finds none
    #[arg(long)]
    pub tgname: Option<String>,

    /// Lookback window in seconds
    #[arg(long)]
    pub fetch: Option<u64>,

    #[arg(long)]
    pub access_key_id: Option<String>,

    #[arg(long)]
    pub secret_access_key: Option<String>,

    /// Maximum number of statistics queries in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-query timeout in seconds
    #[arg(long)]
    pub query_timeout: Option<u64>,

    /// Print graph definitions instead of collecting
    #[arg(long)]
    pub meta: bool,

    /// Graph name prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Debug)]
pub struct AgentConfig {
    pub account: AlbAccountConfig,
    pub prefix: String,
    pub meta: bool,
}

fn default_prefix() -> String {
    "alb".to_string()
}

/// Replace `key` (and any of its aliases) in the table.
fn set(table: &mut toml::Table, key: &str, aliases: &[&str], value: toml::Value) {
    for alias in aliases {
        table.remove(*alias);
    }
    table.insert(key.to_string(), value);
}

impl AgentConfig {
    pub fn load(args: &Args) -> Result<Self> {
        let mut table = match &args.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str::<toml::Table>(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => toml::Table::new(),
        };

        let prefix = match table.remove("prefix") {
            Some(toml::Value::String(p)) => p,
            Some(other) => anyhow::bail!("prefix must be a string, got {other}"),
            None => default_prefix(),
        };

        Self::apply_args(&mut table, args)?;
        if !table.contains_key("load_balancer") && !table.contains_key("lbname") {
            set(&mut table, "load_balancer", &[], toml::Value::String(String::new()));
        }

        let account: AlbAccountConfig = toml::Value::Table(table)
            .try_into()
            .context("Invalid load balancer configuration")?;

        let meta = args.meta
            || std::env::var("MACKEREL_AGENT_PLUGIN_META").is_ok_and(|v| v == "1");

        Ok(Self {
            account,
            prefix: args.prefix.clone().unwrap_or(prefix),
            meta,
        })
    }

    fn apply_args(table: &mut toml::Table, args: &Args) -> Result<()> {
        if let Some(region) = &args.region {
            set(table, "region", &[], toml::Value::String(region.clone()));
        }
        if let Some(lbname) = &args.lbname {
            set(table, "load_balancer", &["lbname"], toml::Value::String(lbname.clone()));
        }
        if let Some(tgname) = &args.tgname {
            let names = split_target_groups(tgname)
                .into_iter()
                .map(toml::Value::String)
                .collect();
            set(table, "target_groups", &["tgname"], toml::Value::Array(names));
        }
        if let Some(fetch) = args.fetch {
            let secs = i64::try_from(fetch).context("fetch is out of range")?;
            set(table, "fetch_duration_secs", &["fetch"], toml::Value::Integer(secs));
        }
        if let Some(id) = &args.access_key_id {
            set(table, "access_key_id", &[], toml::Value::String(id.clone()));
        }
        if let Some(secret) = &args.secret_access_key {
            set(table, "secret_access_key", &[], toml::Value::String(secret.clone()));
        }
        if let Some(concurrency) = args.concurrency {
            let n = i64::try_from(concurrency).context("concurrency is out of range")?;
            set(table, "concurrency", &[], toml::Value::Integer(n));
        }
        if let Some(timeout) = args.query_timeout {
            let secs = i64::try_from(timeout).context("query timeout is out of range")?;
            set(table, "query_timeout_secs", &[], toml::Value::Integer(secs));
        }
        Ok(())
    }
}
