use albmon_cloud::catalogue::{self, LOAD_BALANCER_GROUPS};
use albmon_cloud::Snapshot;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io::Write;

const META_HEADER: &str = "# mackerel-agent-plugin";

/// Full reported name of a snapshot key under `prefix`.
///
/// Load balancer metrics are keyed by bare CloudWatch name in the snapshot
/// and get their group key prepended here; composite target group keys only
/// have their `alb` prefix replaced.
pub fn metric_name(key: &str, prefix: &str) -> String {
    if let Some(rest) = key.strip_prefix("alb.") {
        return format!("{prefix}.{rest}");
    }
    let group = LOAD_BALANCER_GROUPS
        .iter()
        .find(|g| g.metrics.iter().any(|m| m.source_metric_name == key));
    match group.and_then(|g| g.group_key.strip_prefix("alb")) {
        Some(rest) => format!("{prefix}{rest}.{key}"),
        None => format!("{prefix}.{key}"),
    }
}

/// One `name\tvalue\tepoch` line per snapshot entry, sorted by key.
pub fn write_snapshot<W: Write>(
    out: &mut W,
    snapshot: &Snapshot,
    prefix: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let epoch = now.timestamp();
    for (key, value) in snapshot.iter() {
        writeln!(out, "{}\t{}\t{}", metric_name(key, prefix), value, epoch)?;
    }
    Ok(())
}

pub fn write_graph_definitions<W: Write>(out: &mut W, prefix: &str) -> Result<()> {
    let doc = serde_json::json!({ "graphs": catalogue::graph_definitions(prefix) });
    writeln!(out, "{META_HEADER}")?;
    writeln!(out, "{}", serde_json::to_string(&doc)?)?;
    Ok(())
}
