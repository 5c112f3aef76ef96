use crate::catalogue::{self, LOAD_BALANCER_GROUPS, TARGET_GROUP_GROUPS};
use crate::dimension::build_dimensions;
use crate::resolver;
use crate::selector::{PointSelector, SelectError};
use crate::{
    AlbAccountConfig, DimensionSet, LoadBalancerDirectory, LoadBalancerTarget, MetricDefinition,
    MetricStatistics, Snapshot, SubResourceRef,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// One (metric, resource) evaluation.
#[derive(Debug, Clone)]
struct Job {
    key: String,
    dimensions: DimensionSet,
    metric: &'static MetricDefinition,
}

/// Snapshot assembler that evaluates the whole catalogue against one load
/// balancer and its target groups with bounded concurrency.
pub struct AlbCollector {
    statistics: Arc<dyn MetricStatistics>,
    target: LoadBalancerTarget,
    load_balancer_dimension: String,
    target_groups: Vec<SubResourceRef>,
    selector: PointSelector,
    concurrency: usize,
    timeout_secs: u64,
}

impl AlbCollector {
    pub fn new(
        statistics: Arc<dyn MetricStatistics>,
        target: LoadBalancerTarget,
        target_groups: Vec<SubResourceRef>,
        selector: PointSelector,
    ) -> Self {
        Self {
            statistics,
            load_balancer_dimension: target.dimension_value().to_string(),
            target,
            target_groups,
            selector,
            concurrency: crate::default_concurrency(),
            timeout_secs: crate::default_query_timeout(), // per query
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Override the `LoadBalancer` dimension, normally with the
    /// `app/<name>/<id>` path found by discovery.
    pub fn with_load_balancer_dimension(mut self, value: impl Into<String>) -> Self {
        self.load_balancer_dimension = value.into();
        self
    }

    /// Resolve target groups once and build a collector for the session.
    pub async fn setup(
        directory: &dyn LoadBalancerDirectory,
        statistics: Arc<dyn MetricStatistics>,
        config: &AlbAccountConfig,
    ) -> Self {
        let target = config.target();
        let resolution = resolver::resolve(directory, &target, &config.target_groups).await;

        let mut collector = Self::new(
            statistics,
            target,
            resolution.target_groups,
            PointSelector::new(config.fetch_duration_secs),
        )
        .with_concurrency(config.concurrency)
        .with_timeout_secs(config.query_timeout_secs);
        if let Some(dimension) = resolution.load_balancer_dimension {
            collector = collector.with_load_balancer_dimension(dimension);
        }
        collector
    }

    pub fn target(&self) -> &LoadBalancerTarget {
        &self.target
    }

    pub fn load_balancer_dimension(&self) -> &str {
        &self.load_balancer_dimension
    }

    pub fn target_groups(&self) -> &[SubResourceRef] {
        &self.target_groups
    }

    fn jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();

        let lb_dimensions = build_dimensions(&self.load_balancer_dimension, None);
        for group in LOAD_BALANCER_GROUPS {
            for metric in group.metrics {
                jobs.push(Job {
                    key: metric.source_metric_name.to_string(),
                    dimensions: lb_dimensions.clone(),
                    metric,
                });
            }
        }

        for tg in &self.target_groups {
            let tg_dimensions =
                build_dimensions(&self.load_balancer_dimension, Some(&tg.dimension_value));
            for group in TARGET_GROUP_GROUPS {
                for metric in group.metrics {
                    jobs.push(Job {
                        key: catalogue::target_group_metric_key(group, &tg.short_name, metric),
                        dimensions: tg_dimensions.clone(),
                        metric,
                    });
                }
            }
        }

        jobs
    }

    /// Collect one snapshot. Metrics that fail or have no data are left out;
    /// this never fails as a whole.
    pub async fn collect(&self) -> Snapshot {
        let jobs = self.jobs();
        let total = jobs.len();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let timeout_duration = Duration::from_secs(self.timeout_secs);
        let mut tasks = Vec::with_capacity(total);

        for job in jobs {
            let sem = Arc::clone(&semaphore);
            let statistics = Arc::clone(&self.statistics);
            let selector = self.selector;

            let task = tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return None;
                };

                let result = match timeout(
                    timeout_duration,
                    selector.fetch_latest(
                        statistics.as_ref(),
                        job.dimensions,
                        job.metric.source_metric_name,
                        job.metric.aggregation,
                    ),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SelectError::TimedOut(timeout_duration)),
                };

                match result {
                    Ok(value) => Some((job.key, value)),
                    Err(e) => {
                        tracing::debug!(metric = %job.key, error = %e, "Metric skipped");
                        None
                    }
                }
            });

            tasks.push(task);
        }

        let mut values = BTreeMap::new();
        for task in tasks {
            match task.await {
                Ok(Some((key, value))) => {
                    values.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Metric task panicked");
                }
            }
        }

        tracing::info!(
            load_balancer = %self.target.name,
            collected = values.len(),
            total,
            "Collected load balancer metrics"
        );
        Snapshot::from(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AlbError, Result};
    use crate::{Aggregation, Datapoint, StatisticQuery};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Answers every query with `value` unless the metric is listed as failing.
    struct MockStatistics {
        value: f64,
        failing: Vec<&'static str>,
        empty: Vec<&'static str>,
    }

    #[async_trait]
    impl MetricStatistics for MockStatistics {
        async fn get_metric_statistics(&self, query: &StatisticQuery) -> Result<Vec<Datapoint>> {
            if self.failing.contains(&query.metric_name.as_str()) {
                return Err(AlbError::ApiResponseError {
                    service: "monitoring".to_string(),
                    code: "Throttling".to_string(),
                    message: "rate exceeded".to_string(),
                });
            }
            if self.empty.contains(&query.metric_name.as_str()) {
                return Ok(Vec::new());
            }
            let (sum, average) = match query.aggregation {
                Aggregation::Sum => (Some(self.value), None),
                Aggregation::Average => (None, Some(self.value)),
            };
            Ok(vec![Datapoint {
                timestamp: Utc::now(),
                sum,
                average,
            }])
        }
    }

    struct SlowStatistics;

    #[async_trait]
    impl MetricStatistics for SlowStatistics {
        async fn get_metric_statistics(&self, query: &StatisticQuery) -> Result<Vec<Datapoint>> {
            if query.metric_name == "ProcessedBytes" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(vec![Datapoint {
                timestamp: Utc::now(),
                sum: Some(1.0),
                average: Some(1.0),
            }])
        }
    }

    fn lb_metric_count() -> usize {
        LOAD_BALANCER_GROUPS.iter().map(|g| g.metrics.len()).sum()
    }

    fn tg_metric_count() -> usize {
        TARGET_GROUP_GROUPS.iter().map(|g| g.metrics.len()).sum()
    }

    #[tokio::test]
    async fn test_collect_all_catalogued_metrics() {
        let stats = Arc::new(MockStatistics {
            value: 3.0,
            failing: vec![],
            empty: vec![],
        });
        let tgs = vec![
            SubResourceRef::from_configured("targetgroup/web/1"),
            SubResourceRef::from_configured("targetgroup/api/2"),
        ];
        let collector = AlbCollector::new(
            stats,
            LoadBalancerTarget::new("app/my-lb/abc123"),
            tgs,
            PointSelector::default(),
        );

        let snapshot = collector.collect().await;

        assert_eq!(snapshot.len(), lb_metric_count() + 2 * tg_metric_count());
        assert_eq!(snapshot.get("RequestCount"), Some(3.0));
        assert_eq!(snapshot.get("alb.host_count.api.HealthyHostCount"), Some(3.0));
        assert_eq!(
            snapshot.get("alb.response_per_group.web.TargetResponseTime"),
            Some(3.0)
        );
    }

    #[tokio::test]
    async fn test_collect_omits_failed_and_empty_metrics() {
        let stats = Arc::new(MockStatistics {
            value: 1.0,
            failing: vec!["RequestCount"],
            empty: vec!["HealthyHostCount"],
        });
        let collector = AlbCollector::new(
            stats,
            LoadBalancerTarget::new("app/my-lb/abc123"),
            vec![SubResourceRef::from_configured("targetgroup/web/1")],
            PointSelector::default(),
        )
        .with_concurrency(1);

        let snapshot = collector.collect().await;

        assert!(!snapshot.contains_key("RequestCount"));
        assert!(!snapshot.contains_key("alb.host_count.web.HealthyHostCount"));
        assert!(snapshot.contains_key("ProcessedBytes"));
        assert!(snapshot.contains_key("alb.host_count.web.UnHealthyHostCount"));
        assert_eq!(snapshot.len(), lb_metric_count() + tg_metric_count() - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_drops_only_timed_out_metric() {
        let collector = AlbCollector::new(
            Arc::new(SlowStatistics),
            LoadBalancerTarget::new("my-lb"),
            vec![],
            PointSelector::default(),
        )
        .with_timeout_secs(1);

        let snapshot = collector.collect().await;

        assert!(!snapshot.contains_key("ProcessedBytes"));
        assert_eq!(snapshot.len(), lb_metric_count() - 1);
    }

    #[test]
    fn test_target_group_jobs_carry_both_dimensions() {
        let collector = AlbCollector::new(
            Arc::new(MockStatistics {
                value: 0.0,
                failing: vec![],
                empty: vec![],
            }),
            LoadBalancerTarget::new("app/my-lb/abc123"),
            vec![SubResourceRef::from_configured("targetgroup/web/1")],
            PointSelector::default(),
        );

        let jobs = collector.jobs();
        let job = jobs
            .iter()
            .find(|j| j.key == "alb.request_per_group.web.RequestCountPerTarget")
            .expect("per target group job");
        assert_eq!(job.dimensions.get("LoadBalancer"), Some("app/my-lb/abc123"));
        assert_eq!(job.dimensions.get("TargetGroup"), Some("targetgroup/web/1"));

        let lb_job = jobs.iter().find(|j| j.key == "ProcessedBytes").expect("lb job");
        assert_eq!(lb_job.dimensions.len(), 1);
    }

    #[test]
    fn test_load_balancer_arn_reduced_to_dimension_path() {
        let collector = AlbCollector::new(
            Arc::new(MockStatistics {
                value: 0.0,
                failing: vec![],
                empty: vec![],
            }),
            LoadBalancerTarget::new(
                "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/my-lb/abc123",
            ),
            vec![],
            PointSelector::default(),
        );

        assert_eq!(collector.load_balancer_dimension(), "app/my-lb/abc123");
        let jobs = collector.jobs();
        assert!(jobs
            .iter()
            .all(|j| j.dimensions.get("LoadBalancer") == Some("app/my-lb/abc123")));
    }
}
