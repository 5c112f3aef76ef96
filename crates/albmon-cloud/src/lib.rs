//! Metric resolution and collection engine for AWS Application Load Balancers.
//!
//! The engine discovers a load balancer's target groups, builds the
//! CloudWatch dimension set for every catalogued metric, picks the most
//! recent data point of each query and assembles one flat [`Snapshot`].

pub mod aws;
pub mod catalogue;
pub mod collector;
pub mod dimension;
pub mod error;
pub mod resolver;
pub mod selector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// CloudWatch namespace of every Application Load Balancer metric.
pub const NAMESPACE: &str = "AWS/ApplicationELB";

/// Granularity of every statistics query, in seconds.
pub const PERIOD_SECS: i64 = 60;

/// Longest accepted lookback: CloudWatch keeps data for 455 days.
pub const MAX_FETCH_DURATION_SECS: u64 = 455 * 24 * 60 * 60;

/// Which statistic of a data point is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Sum,
    Average,
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Sum => write!(f, "Sum"),
            Aggregation::Average => write!(f, "Average"),
        }
    }
}

/// One catalogued CloudWatch metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricDefinition {
    pub source_metric_name: &'static str,
    pub display_label: &'static str,
    pub aggregation: Aggregation,
}

/// Display unit of a metric group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Bytes,
    Integer,
    Float,
}

/// Related metrics reported together under one group key.
///
/// Target-group groups carry the [`catalogue::WILDCARD`] in their key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricGroup {
    pub group_key: &'static str,
    pub display_label: &'static str,
    pub unit: Unit,
    pub metrics: &'static [MetricDefinition],
}

/// The load balancer named by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerTarget {
    /// As supplied: `app/my-lb/50dc6c495c0c9188` or just `my-lb`.
    pub name: String,
}

impl LoadBalancerTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Short name usable with `DescribeLoadBalancers`.
    pub fn short_name(&self) -> &str {
        resolver::load_balancer_short_name(&self.name)
    }

    /// `LoadBalancer` dimension derivable from the name alone: ARNs are
    /// reduced to `app/<name>/<id>`, anything else is used as supplied.
    pub fn dimension_value(&self) -> &str {
        resolver::load_balancer_dimension(&self.name)
    }
}

/// A target group attached to the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResourceRef {
    /// ARN when discovered, otherwise the name as configured.
    pub fully_qualified_id: String,
    /// Value of the `TargetGroup` dimension (`targetgroup/<name>/<id>`).
    pub dimension_value: String,
    /// Segment used inside composite snapshot keys.
    pub short_name: String,
}

/// Load balancer as returned by the directory API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerRecord {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// Ordered dimensions of one statistics query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionSet(Vec<Dimension>);

impl DimensionSet {
    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push(Dimension {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn as_slice(&self) -> &[Dimension] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

/// A single statistics data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub sum: Option<f64>,
    pub average: Option<f64>,
}

impl Datapoint {
    pub fn value(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Sum => self.sum,
            Aggregation::Average => self.average,
        }
    }
}

/// Parameters of one `GetMetricStatistics` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticQuery {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: DimensionSet,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: i64,
    pub aggregation: Aggregation,
}

/// Flat key to value result of one collection cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    values: BTreeMap<String, f64>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl From<BTreeMap<String, f64>> for Snapshot {
    fn from(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }
}

/// Load-balancer lookup side of the ELBv2 API.
#[async_trait::async_trait]
pub trait LoadBalancerDirectory: Send + Sync {
    /// Look up load balancers by short name.
    async fn describe_load_balancers(&self, name: &str) -> error::Result<Vec<LoadBalancerRecord>>;

    /// ARNs of the target groups attached to a load balancer.
    async fn describe_target_groups(&self, load_balancer_arn: &str) -> error::Result<Vec<String>>;
}

/// CloudWatch statistics query.
#[async_trait::async_trait]
pub trait MetricStatistics: Send + Sync {
    async fn get_metric_statistics(&self, query: &StatisticQuery) -> error::Result<Vec<Datapoint>>;
}

/// Values the engine consumes, normally built from the agent's config file
/// and command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbAccountConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(alias = "lbname")]
    pub load_balancer: String,
    #[serde(
        default,
        alias = "tgname",
        deserialize_with = "deserialize_target_groups"
    )]
    pub target_groups: Vec<String>,
    #[serde(default = "default_fetch_duration", alias = "fetch")]
    pub fetch_duration_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

pub fn default_fetch_duration() -> u64 {
    300
}

pub fn default_concurrency() -> usize {
    5
}

pub fn default_query_timeout() -> u64 {
    30
}

/// Split a comma-separated target group list, dropping empty entries.
pub fn split_target_groups(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_target_groups<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TargetGroupsInput {
        Joined(String),
        Many(Vec<String>),
    }

    match TargetGroupsInput::deserialize(deserializer)? {
        TargetGroupsInput::Joined(raw) => Ok(split_target_groups(&raw)),
        TargetGroupsInput::Many(names) => Ok(names
            .into_iter()
            .filter(|n| !n.trim().is_empty())
            .collect()),
    }
}

impl AlbAccountConfig {
    pub fn new(load_balancer: impl Into<String>) -> Self {
        Self {
            region: None,
            load_balancer: load_balancer.into(),
            target_groups: Vec::new(),
            fetch_duration_secs: default_fetch_duration(),
            concurrency: default_concurrency(),
            query_timeout_secs: default_query_timeout(),
            access_key_id: None,
            secret_access_key: None,
        }
    }

    /// # Errors
    ///
    /// Returns [`error::AlbError::ConfigError`] when the load balancer is
    /// missing, the lookback is outside `[PERIOD_SECS, MAX_FETCH_DURATION_SECS]`
    /// or concurrency is zero.
    pub fn validate(&self) -> error::Result<()> {
        if self.load_balancer.trim().is_empty() {
            return Err(error::AlbError::ConfigError(
                "load_balancer must not be empty".to_string(),
            ));
        }
        if self.fetch_duration_secs < PERIOD_SECS as u64 {
            return Err(error::AlbError::ConfigError(format!(
                "fetch_duration_secs must be at least {PERIOD_SECS}, got {}",
                self.fetch_duration_secs
            )));
        }
        if self.fetch_duration_secs > MAX_FETCH_DURATION_SECS {
            return Err(error::AlbError::ConfigError(format!(
                "fetch_duration_secs must be at most {MAX_FETCH_DURATION_SECS}, got {}",
                self.fetch_duration_secs
            )));
        }
        if self.concurrency == 0 {
            return Err(error::AlbError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target(&self) -> LoadBalancerTarget {
        LoadBalancerTarget::new(self.load_balancer.trim())
    }
}
