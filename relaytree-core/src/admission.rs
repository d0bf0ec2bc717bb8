//! Per-node admission policies
//!
//! A policy turns a node's element population into a load figure and decides
//! whether the node may take more work. Policies are pure: they never mutate
//! the graph, and placement evaluates them under the same lock that applies
//! the resulting reservation.

use serde::{Deserialize, Serialize};

use crate::node::NodeLoad;

/// Pluggable load/admission decision
pub trait AdmissionPolicy: Send + Sync {
    /// Non-negative load, monotonic in the element population
    fn load(&self, node: &NodeLoad) -> f64;

    /// Whether placement may put more elements on the node
    fn admits_more(&self, node: &NodeLoad) -> bool;
}

/// Control policy: every node reports zero load and always admits
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedPolicy;

impl AdmissionPolicy for UnlimitedPolicy {
    fn load(&self, _node: &NodeLoad) -> f64 {
        0.0
    }

    fn admits_more(&self, _node: &NodeLoad) -> bool {
        true
    }
}

/// Weighted element-count policy
///
/// `load = (endpoints·endpoint_cost + stubs·tunnel_cost + pipelines·pipeline_cost) / capacity`
///
/// A node admits more while its load stays below `threshold`. Nodes may carry
/// their own capacity; otherwise the policy default applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedPolicy {
    pub capacity: f64,
    pub endpoint_cost: f64,
    pub tunnel_cost: f64,
    pub pipeline_cost: f64,
    pub threshold: f64,
}

impl Default for WeightedPolicy {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            endpoint_cost: 1.0,
            tunnel_cost: 1.0,
            pipeline_cost: 0.0,
            threshold: 1.0,
        }
    }
}

impl WeightedPolicy {
    /// Endpoint-only policy admitting exactly `endpoints` endpoints per node
    #[must_use]
    pub fn endpoints(endpoints: usize) -> Self {
        Self {
            capacity: endpoints as f64,
            endpoint_cost: 1.0,
            tunnel_cost: 0.0,
            pipeline_cost: 0.0,
            threshold: 1.0,
        }
    }
}

impl AdmissionPolicy for WeightedPolicy {
    fn load(&self, node: &NodeLoad) -> f64 {
        let capacity = node.capacity.unwrap_or(self.capacity);
        if capacity <= 0.0 {
            return f64::INFINITY;
        }
        let weighted = (node.endpoints as f64).mul_add(
            self.endpoint_cost,
            (node.tunnel_stubs as f64).mul_add(
                self.tunnel_cost,
                node.pipelines as f64 * self.pipeline_cost,
            ),
        );
        (weighted / capacity).max(0.0)
    }

    fn admits_more(&self, node: &NodeLoad) -> bool {
        self.load(node) < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn population(endpoints: usize, tunnel_stubs: usize) -> NodeLoad {
        NodeLoad {
            endpoints,
            tunnel_stubs,
            pipelines: 1,
            capacity: None,
        }
    }

    #[test]
    fn test_unlimited_policy() {
        let policy = UnlimitedPolicy;
        let load = population(1000, 1000);
        assert!(policy.load(&load).abs() < f64::EPSILON);
        assert!(policy.admits_more(&load));
    }

    #[test]
    fn test_weighted_policy_threshold() {
        let policy = WeightedPolicy::endpoints(3);
        assert!(policy.admits_more(&population(2, 5)));
        assert!(!policy.admits_more(&population(3, 0)));
        assert!((policy.load(&population(3, 0)) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weighted_policy_is_monotonic() {
        let policy = WeightedPolicy {
            pipeline_cost: 0.5,
            ..WeightedPolicy::default()
        };
        let mut previous = 0.0;
        for endpoints in 0..20 {
            for stubs in 0..3 {
                let load = policy.load(&population(endpoints, stubs));
                assert!(load >= 0.0);
                if stubs == 0 {
                    assert!(load >= previous);
                    previous = load;
                }
                assert!(policy.load(&population(endpoints, stubs + 1)) >= load);
            }
        }
    }

    #[test]
    fn test_node_capacity_override() {
        let policy = WeightedPolicy::endpoints(10);
        let mut small = population(2, 0);
        small.capacity = Some(2.0);
        assert!(!policy.admits_more(&small));
        assert!(policy.admits_more(&population(2, 0)));

        small.capacity = Some(0.0);
        assert!(policy.load(&small).is_infinite());
    }
}
