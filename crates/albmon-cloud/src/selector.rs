use crate::error::AlbError;
use crate::{
    Aggregation, Datapoint, DimensionSet, MetricStatistics, StatisticQuery,
    MAX_FETCH_DURATION_SECS, NAMESPACE, PERIOD_SECS,
};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::time::Duration;

/// Why a metric produced no value. All variants are recoverable: the metric
/// is left out of the snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("fetched no datapoints")]
    NoDataPoints,

    #[error("query failed: {0}")]
    QueryFailed(#[from] AlbError),

    #[error("query timed out after {0:?}")]
    TimedOut(Duration),
}

/// Picks the latest data point of a metric over a trailing window.
#[derive(Debug, Clone, Copy)]
pub struct PointSelector {
    lookback: TimeDelta,
}

impl PointSelector {
    /// Lookbacks beyond [`MAX_FETCH_DURATION_SECS`] are clamped to it.
    pub fn new(lookback_secs: u64) -> Self {
        let secs = lookback_secs.min(MAX_FETCH_DURATION_SECS) as i64;
        Self {
            lookback: TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn lookback(&self) -> TimeDelta {
        self.lookback
    }

    /// `[end - lookback, end]` where `end` is `now` truncated to the minute.
    /// A start before the representable range saturates at the earliest instant.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = now
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or(now);
        let start = end
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, end)
    }

    pub fn query(
        &self,
        dimensions: DimensionSet,
        metric_name: &str,
        aggregation: Aggregation,
        now: DateTime<Utc>,
    ) -> StatisticQuery {
        let (start, end) = self.window(now);
        StatisticQuery {
            namespace: NAMESPACE.to_string(),
            metric_name: metric_name.to_string(),
            dimensions,
            start,
            end,
            period_secs: PERIOD_SECS,
            aggregation,
        }
    }

    /// Query the telemetry API and return the value of the most recent point.
    pub async fn fetch_latest(
        &self,
        statistics: &dyn MetricStatistics,
        dimensions: DimensionSet,
        metric_name: &str,
        aggregation: Aggregation,
    ) -> Result<f64, SelectError> {
        let query = self.query(dimensions, metric_name, aggregation, Utc::now());
        let points = statistics.get_metric_statistics(&query).await?;
        latest_value(&points, aggregation)
    }
}

impl Default for PointSelector {
    fn default() -> Self {
        Self::new(crate::default_fetch_duration())
    }
}

/// Value of the point with the greatest timestamp.
///
/// On equal timestamps the later point in the response wins. Points that do
/// not carry the requested statistic are ignored.
pub fn latest_value(points: &[Datapoint], aggregation: Aggregation) -> Result<f64, SelectError> {
    let mut latest: Option<(DateTime<Utc>, f64)> = None;
    for point in points {
        let Some(value) = point.value(aggregation) else {
            continue;
        };
        match latest {
            Some((ts, _)) if point.timestamp < ts => {}
            _ => latest = Some((point.timestamp, value)),
        }
    }
    latest.map(|(_, v)| v).ok_or(SelectError::NoDataPoints)
}
