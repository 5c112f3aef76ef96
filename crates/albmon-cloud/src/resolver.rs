//! Target group discovery for a load balancer.
//!
//! Discovery is best-effort: every directory failure degrades to the
//! pre-seeded target group list instead of aborting the run.

use crate::{LoadBalancerDirectory, LoadBalancerRecord, LoadBalancerTarget, SubResourceRef};
use regex::Regex;
use std::sync::LazyLock;

static LOAD_BALANCER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"app/(.+?)/.+").expect("valid load balancer pattern"));

static ELB_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arn:aws[a-z-]*:elasticloadbalancing:.+:(.+)").expect("valid arn pattern")
});

static TARGET_GROUP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"targetgroup/(.+?)/.+").expect("valid target group pattern"));

/// `app/my-lb/50dc6c495c0c9188` -> `my-lb`; anything else is returned as is.
pub fn load_balancer_short_name(name: &str) -> &str {
    LOAD_BALANCER_NAME
        .captures(name)
        .and_then(|c| c.get(1))
        .map_or(name, |m| m.as_str())
}

/// Resource path of an ELB ARN, which is what the `TargetGroup` dimension expects.
///
/// `arn:aws:elasticloadbalancing:us-east-1:123:targetgroup/my-tg/def456`
/// -> `targetgroup/my-tg/def456`. Non-ARN input is returned as is.
pub fn resource_path(arn: &str) -> &str {
    ELB_ARN
        .captures(arn)
        .and_then(|c| c.get(1))
        .map_or(arn, |m| m.as_str())
}

/// Value of the `LoadBalancer` dimension for a load balancer ARN.
///
/// `arn:aws:elasticloadbalancing:us-east-1:123:loadbalancer/app/my-lb/abc123`
/// -> `app/my-lb/abc123`. Input that is not an ARN is returned as is.
pub fn load_balancer_dimension(arn: &str) -> &str {
    let path = resource_path(arn);
    path.strip_prefix("loadbalancer/").unwrap_or(path)
}

/// `targetgroup/my-tg/def456` -> `my-tg`; anything else is returned as is.
pub fn target_group_short_name(path: &str) -> &str {
    TARGET_GROUP_NAME
        .captures(path)
        .and_then(|c| c.get(1))
        .map_or(path, |m| m.as_str())
}

impl SubResourceRef {
    /// Build a reference from a discovered target group ARN.
    pub fn from_arn(arn: &str) -> Self {
        let path = resource_path(arn);
        Self {
            fully_qualified_id: arn.to_string(),
            dimension_value: path.to_string(),
            short_name: target_group_short_name(path).to_string(),
        }
    }

    /// Build a reference from an operator-supplied name (path or ARN).
    pub fn from_configured(name: &str) -> Self {
        let mut tg = Self::from_arn(name.trim());
        tg.fully_qualified_id = name.trim().to_string();
        tg
    }
}

/// Why discovery fell back to the pre-seeded list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionDegraded {
    #[error("load balancer {0} not found")]
    NotFound(String),
    #[error("load balancer name {name} matched {count} load balancers")]
    Ambiguous { name: String, count: usize },
    #[error("load balancer {0} has no target groups")]
    NoTargetGroups(String),
    #[error("directory lookup failed: {0}")]
    DirectoryFailed(String),
}

/// Outcome of target group resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// `app/<name>/<id>` taken from the directory, when the lookup succeeded.
    pub load_balancer_dimension: Option<String>,
    pub target_groups: Vec<SubResourceRef>,
    pub degraded: Option<ResolutionDegraded>,
}

/// Ask the directory for the target groups of `target`.
///
/// Returns the discovered ARNs, in directory order, without placeholder entries.
pub async fn discover(
    directory: &dyn LoadBalancerDirectory,
    target: &LoadBalancerTarget,
) -> Result<Vec<String>, ResolutionDegraded> {
    let load_balancer = find_load_balancer(directory, target).await?;
    target_group_arns(directory, &load_balancer).await
}

/// The single load balancer whose short name matches `target`.
pub async fn find_load_balancer(
    directory: &dyn LoadBalancerDirectory,
    target: &LoadBalancerTarget,
) -> Result<LoadBalancerRecord, ResolutionDegraded> {
    let short = target.short_name();

    let load_balancers = directory
        .describe_load_balancers(short)
        .await
        .map_err(|e| ResolutionDegraded::DirectoryFailed(e.to_string()))?;

    match load_balancers.as_slice() {
        [one] => Ok(one.clone()),
        [] => Err(ResolutionDegraded::NotFound(short.to_string())),
        many => Err(ResolutionDegraded::Ambiguous {
            name: short.to_string(),
            count: many.len(),
        }),
    }
}

async fn target_group_arns(
    directory: &dyn LoadBalancerDirectory,
    load_balancer: &LoadBalancerRecord,
) -> Result<Vec<String>, ResolutionDegraded> {
    let arns = directory
        .describe_target_groups(&load_balancer.arn)
        .await
        .map_err(|e| ResolutionDegraded::DirectoryFailed(e.to_string()))?;

    let arns: Vec<String> = arns.into_iter().filter(|a| !a.trim().is_empty()).collect();
    if arns.is_empty() {
        return Err(ResolutionDegraded::NoTargetGroups(load_balancer.name.clone()));
    }
    Ok(arns)
}

/// Resolve the working set of target groups for a collection session.
///
/// Discovered target groups replace `preseeded`; on any degradation the
/// pre-seeded names are used. The load balancer dimension is kept whenever
/// the load balancer itself was found, even if its target groups were not.
pub async fn resolve(
    directory: &dyn LoadBalancerDirectory,
    target: &LoadBalancerTarget,
    preseeded: &[String],
) -> Resolution {
    let (load_balancer_dimension, outcome) = match find_load_balancer(directory, target).await {
        Ok(lb) => (
            Some(load_balancer_dimension(&lb.arn).to_string()),
            target_group_arns(directory, &lb).await,
        ),
        Err(reason) => (None, Err(reason)),
    };

    match outcome {
        Ok(arns) => {
            let target_groups: Vec<SubResourceRef> =
                arns.iter().map(|arn| SubResourceRef::from_arn(arn)).collect();
            tracing::info!(
                load_balancer = %target.name,
                count = target_groups.len(),
                "Discovered target groups"
            );
            Resolution {
                load_balancer_dimension,
                target_groups,
                degraded: None,
            }
        }
        Err(reason) => {
            let target_groups: Vec<SubResourceRef> = preseeded
                .iter()
                .filter(|n| !n.trim().is_empty())
                .map(|n| SubResourceRef::from_configured(n))
                .collect();
            tracing::warn!(
                load_balancer = %target.name,
                reason = %reason,
                preseeded = target_groups.len(),
                "Target group discovery degraded"
            );
            Resolution {
                load_balancer_dimension,
                target_groups,
                degraded: Some(reason),
            }
        }
    }
}
