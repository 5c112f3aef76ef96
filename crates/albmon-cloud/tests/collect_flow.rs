use albmon_cloud::catalogue::LOAD_BALANCER_GROUPS;
use albmon_cloud::collector::AlbCollector;
use albmon_cloud::error::{AlbError, Result};
use albmon_cloud::{
    AlbAccountConfig, Aggregation, Datapoint, LoadBalancerDirectory, LoadBalancerRecord,
    MetricStatistics, StatisticQuery,
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;

const LB: &str = "app/my-lb/abc123";
const TG_ARN: &str = "arn:aws:elasticloadbalancing:region:account:targetgroup/my-tg/def456";

struct FakeDirectory {
    target_groups: Vec<String>,
}

#[async_trait]
impl LoadBalancerDirectory for FakeDirectory {
    async fn describe_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancerRecord>> {
        if name != "my-lb" {
            return Ok(Vec::new());
        }
        Ok(vec![LoadBalancerRecord {
            arn: "arn:aws:elasticloadbalancing:region:account:loadbalancer/app/my-lb/abc123"
                .to_string(),
            name: name.to_string(),
        }])
    }

    async fn describe_target_groups(&self, _load_balancer_arn: &str) -> Result<Vec<String>> {
        Ok(self.target_groups.clone())
    }
}

/// Data points keyed by (metric name, target group dimension or "").
#[derive(Default)]
struct FakeStatistics {
    points: HashMap<(String, String), Vec<Datapoint>>,
    failing: Vec<String>,
    /// When set, queries with any other `LoadBalancer` dimension find no data.
    load_balancer: Option<&'static str>,
}

impl FakeStatistics {
    fn with(mut self, metric: &str, target_group: &str, points: Vec<Datapoint>) -> Self {
        self.points
            .insert((metric.to_string(), target_group.to_string()), points);
        self
    }
}

#[async_trait]
impl MetricStatistics for FakeStatistics {
    async fn get_metric_statistics(&self, query: &StatisticQuery) -> Result<Vec<Datapoint>> {
        if self.failing.contains(&query.metric_name) {
            return Err(AlbError::HttpError {
                service: "monitoring".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        if let Some(expected) = self.load_balancer {
            if query.dimensions.get("LoadBalancer") != Some(expected) {
                return Ok(Vec::new());
            }
        }
        let tg = query.dimensions.get("TargetGroup").unwrap_or("").to_string();
        Ok(self
            .points
            .get(&(query.metric_name.clone(), tg))
            .cloned()
            .unwrap_or_default())
    }
}

fn point(age_minutes: i64, aggregation: Aggregation, value: f64) -> Datapoint {
    let timestamp = Utc::now() - TimeDelta::minutes(age_minutes);
    match aggregation {
        Aggregation::Sum => Datapoint {
            timestamp,
            sum: Some(value),
            average: None,
        },
        Aggregation::Average => Datapoint {
            timestamp,
            sum: None,
            average: Some(value),
        },
    }
}

fn config() -> AlbAccountConfig {
    AlbAccountConfig::new(LB)
}

#[tokio::test]
async fn test_discovered_target_group_composite_host_count_key() {
    let directory = FakeDirectory {
        target_groups: vec![TG_ARN.to_string()],
    };
    let stats = FakeStatistics::default().with(
        "HealthyHostCount",
        "targetgroup/my-tg/def456",
        vec![point(1, Aggregation::Average, 7.0)],
    );

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &config()).await;
    assert_eq!(collector.target_groups().len(), 1);
    assert_eq!(collector.target_groups()[0].short_name, "my-tg");

    let snapshot = collector.collect().await;
    assert_eq!(snapshot.get("alb.host_count.my-tg.HealthyHostCount"), Some(7.0));
    assert_eq!(snapshot.len(), 1);
}

#[tokio::test]
async fn test_later_point_wins_over_larger_value() {
    let directory = FakeDirectory {
        target_groups: vec![],
    };
    let stats = FakeStatistics::default().with(
        "ProcessedBytes",
        "",
        vec![
            point(1, Aggregation::Sum, 150.0),
            point(3, Aggregation::Sum, 100.0),
            point(4, Aggregation::Sum, 999.0),
        ],
    );

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &config()).await;
    let snapshot = collector.collect().await;

    assert_eq!(snapshot.get("ProcessedBytes"), Some(150.0));
}

#[tokio::test]
async fn test_no_target_groups_only_load_balancer_keys() {
    let directory = FakeDirectory {
        target_groups: vec![],
    };
    let mut stats = FakeStatistics::default();
    for group in LOAD_BALANCER_GROUPS {
        for metric in group.metrics {
            stats = stats.with(
                metric.source_metric_name,
                "",
                vec![point(2, metric.aggregation, 1.0)],
            );
        }
    }

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &config()).await;
    assert!(collector.target_groups().is_empty());

    let snapshot = collector.collect().await;
    let expected: usize = LOAD_BALANCER_GROUPS.iter().map(|g| g.metrics.len()).sum();
    assert_eq!(snapshot.len(), expected);
    assert!(snapshot.keys().all(|k| !k.starts_with("alb.")));
}

#[tokio::test]
async fn test_failing_and_empty_metrics_absent() {
    let directory = FakeDirectory {
        target_groups: vec![TG_ARN.to_string()],
    };
    let mut stats = FakeStatistics::default()
        .with("RequestCount", "", vec![point(1, Aggregation::Sum, 5.0)])
        .with("TargetResponseTime", "", vec![point(1, Aggregation::Average, 0.2)]);
    stats.failing.push("TargetResponseTime".to_string());

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &config()).await;
    let snapshot = collector.collect().await;

    assert_eq!(snapshot.get("RequestCount"), Some(5.0));
    assert!(!snapshot.contains_key("TargetResponseTime"));
    assert!(!snapshot.contains_key("alb.response_per_group.my-tg.TargetResponseTime"));
    assert!(!snapshot.contains_key("ProcessedBytes"));
}

#[tokio::test]
async fn test_consecutive_collections_same_key_set() {
    let directory = FakeDirectory {
        target_groups: vec![TG_ARN.to_string()],
    };
    let stats = FakeStatistics::default()
        .with("RequestCount", "", vec![point(1, Aggregation::Sum, 5.0)])
        .with(
            "UnHealthyHostCount",
            "targetgroup/my-tg/def456",
            vec![point(1, Aggregation::Average, 0.0)],
        );

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &config()).await;
    let first = collector.collect().await;
    let second = collector.collect().await;

    let first_keys: Vec<_> = first.keys().collect();
    let second_keys: Vec<_> = second.keys().collect();
    assert_eq!(first_keys, second_keys);
    assert_eq!(first_keys.len(), 2);
}

#[tokio::test]
async fn test_preseeded_target_groups_when_discovery_finds_nothing() {
    let directory = FakeDirectory {
        target_groups: vec![],
    };
    let stats = FakeStatistics::default().with(
        "RequestCountPerTarget",
        "targetgroup/web/0001",
        vec![point(1, Aggregation::Sum, 12.0)],
    );
    let mut cfg = config();
    cfg.target_groups = vec!["targetgroup/web/0001".to_string()];

    let collector = AlbCollector::setup(&directory, Arc::new(stats), &cfg).await;
    let snapshot = collector.collect().await;

    assert_eq!(
        snapshot.get("alb.request_per_group.web.RequestCountPerTarget"),
        Some(12.0)
    );
}

#[tokio::test]
async fn test_short_load_balancer_name_queries_full_dimension() {
    let directory = FakeDirectory {
        target_groups: vec![TG_ARN.to_string()],
    };
    let mut stats = FakeStatistics::default()
        .with("RequestCount", "", vec![point(1, Aggregation::Sum, 9.0)])
        .with(
            "HealthyHostCount",
            "targetgroup/my-tg/def456",
            vec![point(1, Aggregation::Average, 3.0)],
        );
    stats.load_balancer = Some(LB);

    let collector =
        AlbCollector::setup(&directory, Arc::new(stats), &AlbAccountConfig::new("my-lb")).await;
    assert_eq!(collector.load_balancer_dimension(), LB);

    let snapshot = collector.collect().await;
    assert_eq!(snapshot.get("RequestCount"), Some(9.0));
    assert_eq!(snapshot.get("alb.host_count.my-tg.HealthyHostCount"), Some(3.0));
}
