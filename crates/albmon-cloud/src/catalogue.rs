//! Static catalogue of every reported metric.
//!
//! The same table drives both the collection engine and the graph
//! definitions handed to the monitoring agent.

use crate::{Aggregation, MetricDefinition, MetricGroup, Unit};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Placeholder substituted with a target group's short name.
pub const WILDCARD: &str = "#";

const fn sum(source_metric_name: &'static str, display_label: &'static str) -> MetricDefinition {
    MetricDefinition {
        source_metric_name,
        display_label,
        aggregation: Aggregation::Sum,
    }
}

const fn avg(source_metric_name: &'static str, display_label: &'static str) -> MetricDefinition {
    MetricDefinition {
        source_metric_name,
        display_label,
        aggregation: Aggregation::Average,
    }
}

/// Groups queried with only the `LoadBalancer` dimension.
pub const LOAD_BALANCER_GROUPS: &[MetricGroup] = &[
    MetricGroup {
        group_key: "alb.bytes.processed",
        display_label: "Processed Bytes",
        unit: Unit::Bytes,
        metrics: &[sum("ProcessedBytes", "Processed")],
    },
    MetricGroup {
        group_key: "alb.connection_count",
        display_label: "Connection Count",
        unit: Unit::Integer,
        metrics: &[
            sum("NewConnectionCount", "New"),
            sum("RejectedConnectionCount", "Rejected"),
        ],
    },
    MetricGroup {
        group_key: "alb.concurrent_connection_count",
        display_label: "Concurrent Connection Count",
        unit: Unit::Integer,
        metrics: &[sum("ActiveConnectionCount", "Active")],
    },
    MetricGroup {
        group_key: "alb.connection_error_count",
        display_label: "Target Connection Error Count",
        unit: Unit::Integer,
        metrics: &[sum("TargetConnectionErrorCount", "Count")],
    },
    MetricGroup {
        group_key: "alb.request",
        display_label: "Request Count",
        unit: Unit::Integer,
        metrics: &[sum("RequestCount", "Request Count")],
    },
    MetricGroup {
        group_key: "alb.response",
        display_label: "Target Response Time",
        unit: Unit::Float,
        metrics: &[avg("TargetResponseTime", "Time")],
    },
    MetricGroup {
        group_key: "alb.httpcode_count",
        display_label: "HTTP Code Count",
        unit: Unit::Integer,
        metrics: &[
            sum("HTTPCode_ELB_4XX_Count", "ALB 4XX"),
            sum("HTTPCode_ELB_5XX_Count", "ALB 5XX"),
            sum("HTTPCode_Target_2XX_Count", "Target 2XX"),
            sum("HTTPCode_Target_3XX_Count", "Target 3XX"),
            sum("HTTPCode_Target_4XX_Count", "Target 4XX"),
            sum("HTTPCode_Target_5XX_Count", "Target 5XX"),
        ],
    },
];

/// Groups queried once per target group with `LoadBalancer` and `TargetGroup`.
pub const TARGET_GROUP_GROUPS: &[MetricGroup] = &[
    MetricGroup {
        group_key: "alb.host_count.#",
        display_label: "Host Count",
        unit: Unit::Float,
        metrics: &[
            avg("HealthyHostCount", "Healthy"),
            avg("UnHealthyHostCount", "UnHealthy"),
        ],
    },
    MetricGroup {
        group_key: "alb.httpcode_count_per_group.#",
        display_label: "HTTP Code Count per Target Group",
        unit: Unit::Integer,
        metrics: &[
            sum("HTTPCode_Target_2XX_Count", "Target 2XX"),
            sum("HTTPCode_Target_3XX_Count", "Target 3XX"),
            sum("HTTPCode_Target_4XX_Count", "Target 4XX"),
            sum("HTTPCode_Target_5XX_Count", "Target 5XX"),
        ],
    },
    MetricGroup {
        group_key: "alb.request_per_group.#",
        display_label: "Request Count per Target",
        unit: Unit::Integer,
        metrics: &[sum("RequestCountPerTarget", "Request Count")],
    },
    MetricGroup {
        group_key: "alb.response_per_group.#",
        display_label: "Target Response Time per Target Group",
        unit: Unit::Float,
        metrics: &[avg("TargetResponseTime", "Time")],
    },
];

/// Which dimension scope a group is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    LoadBalancer,
    TargetGroup,
}

/// Every group of both tiers.
pub fn groups() -> impl Iterator<Item = (Tier, &'static MetricGroup)> {
    LOAD_BALANCER_GROUPS
        .iter()
        .map(|g| (Tier::LoadBalancer, g))
        .chain(TARGET_GROUP_GROUPS.iter().map(|g| (Tier::TargetGroup, g)))
}

pub fn lookup(group_key: &str) -> Option<&'static MetricGroup> {
    groups().map(|(_, g)| g).find(|g| g.group_key == group_key)
}

/// Substitute the wildcard of a group key with a target group short name.
///
/// Keys without a wildcard are returned unchanged.
pub fn resolve_group_key(group_key: &str, short_name: &str) -> String {
    group_key.replacen(WILDCARD, short_name, 1)
}

/// Composite snapshot key of a per-target-group metric.
pub fn target_group_metric_key(
    group: &MetricGroup,
    short_name: &str,
    metric: &MetricDefinition,
) -> String {
    // `alb.host_count.#` with `my-tg` becomes `alb.host_count.my-tg.HealthyHostCount`
    format!(
        "{}.{}",
        resolve_group_key(group.group_key, short_name),
        metric.source_metric_name
    )
}

/// Check the internal consistency of the catalogue tables.
///
/// # Errors
///
/// Returns a description of the first inconsistency found.
pub fn validate_catalogue() -> Result<(), String> {
    let mut seen_keys = HashSet::new();
    for (tier, group) in groups() {
        if !seen_keys.insert(group.group_key) {
            return Err(format!("duplicate group key {}", group.group_key));
        }
        if group.metrics.is_empty() {
            return Err(format!("group {} has no metrics", group.group_key));
        }
        let has_wildcard = group.group_key.contains(WILDCARD);
        match tier {
            Tier::LoadBalancer if has_wildcard => {
                return Err(format!(
                    "load balancer group {} must not contain a wildcard",
                    group.group_key
                ));
            }
            Tier::TargetGroup if group.group_key.matches(WILDCARD).count() != 1 => {
                return Err(format!(
                    "target group {} must contain exactly one wildcard",
                    group.group_key
                ));
            }
            _ => {}
        }
        let mut names = HashSet::new();
        for metric in group.metrics {
            if !names.insert(metric.source_metric_name) {
                return Err(format!(
                    "metric {} listed twice in group {}",
                    metric.source_metric_name, group.group_key
                ));
            }
        }
    }

    // Load balancer metrics are keyed by bare name, so they must be unique across the tier.
    let mut bare = HashSet::new();
    for group in LOAD_BALANCER_GROUPS {
        for metric in group.metrics {
            if !bare.insert(metric.source_metric_name) {
                return Err(format!(
                    "metric {} appears in more than one load balancer group",
                    metric.source_metric_name
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphMetric {
    pub name: String,
    pub label: String,
    pub stacked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphDefinition {
    pub label: String,
    pub unit: Unit,
    pub metrics: Vec<GraphMetric>,
}

/// Graph metadata for the monitoring agent, keyed by group key.
///
/// `prefix` replaces the leading `alb` segment of every group key.
pub fn graph_definitions(prefix: &str) -> BTreeMap<String, GraphDefinition> {
    groups()
        .map(|(_, group)| {
            let key = match group.group_key.strip_prefix("alb") {
                Some(rest) => format!("{prefix}{rest}"),
                None => group.group_key.to_string(),
            };
            let definition = GraphDefinition {
                label: group.display_label.to_string(),
                unit: group.unit,
                metrics: group
                    .metrics
                    .iter()
                    .map(|m| GraphMetric {
                        name: m.source_metric_name.to_string(),
                        label: m.display_label.to_string(),
                        stacked: false,
                    })
                    .collect(),
            };
            (key, definition)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_consistency() {
        assert_eq!(validate_catalogue(), Ok(()));
    }

    #[test]
    fn test_catalogue_aggregations() {
        for (_, group) in groups() {
            for metric in group.metrics {
                let expected = match metric.source_metric_name {
                    "TargetResponseTime" | "HealthyHostCount" | "UnHealthyHostCount" => {
                        Aggregation::Average
                    }
                    _ => Aggregation::Sum,
                };
                assert_eq!(metric.aggregation, expected, "{}", metric.source_metric_name);
            }
        }
    }

    #[test]
    fn test_resolve_wildcard_group_key() {
        assert_eq!(resolve_group_key("alb.host_count.#", "my-tg"), "alb.host_count.my-tg");
        assert_eq!(resolve_group_key("alb.request", "my-tg"), "alb.request");
    }

    #[test]
    fn test_target_group_metric_key() {
        let group = lookup("alb.httpcode_count_per_group.#").expect("group exists");
        let key = target_group_metric_key(group, "web", &group.metrics[0]);
        assert_eq!(key, "alb.httpcode_count_per_group.web.HTTPCode_Target_2XX_Count");
    }

    #[test]
    fn test_lookup_unknown_group() {
        assert!(lookup("alb.unknown").is_none());
        assert!(lookup("alb.response").is_some());
    }

    #[test]
    fn test_graph_definitions_prefix() {
        let graphs = graph_definitions("prod-alb");
        assert_eq!(graphs.len(), LOAD_BALANCER_GROUPS.len() + TARGET_GROUP_GROUPS.len());
        let host = graphs.get("prod-alb.host_count.#").expect("host count graph");
        assert_eq!(host.metrics.len(), 2);
        assert_eq!(host.metrics[0].name, "HealthyHostCount");

        let json = serde_json::to_value(&graphs).expect("serializable");
        assert_eq!(json["prod-alb.bytes.processed"]["unit"], "bytes");
    }
}
