use crate::DimensionSet;

pub const LOAD_BALANCER_DIMENSION: &str = "LoadBalancer";
pub const TARGET_GROUP_DIMENSION: &str = "TargetGroup";

/// Dimensions scoping a query to the load balancer, or to one of its target groups.
pub fn build_dimensions(load_balancer: &str, target_group: Option<&str>) -> DimensionSet {
    let mut dimensions = DimensionSet::default();
    dimensions.push(LOAD_BALANCER_DIMENSION, load_balancer);
    if let Some(tg) = target_group {
        dimensions.push(TARGET_GROUP_DIMENSION, tg);
    }
    dimensions
}
