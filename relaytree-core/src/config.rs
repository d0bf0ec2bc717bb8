use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::admission::{AdmissionPolicy, UnlimitedPolicy, WeightedPolicy};
use crate::membership::TieBreak;
use crate::node::NodeSpec;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
    pub admission: AdmissionConfig,
    pub tree: TreeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Static pool; placement fails once every node is saturated
    #[default]
    Fixed,
    /// Pool grows through the node provisioner
    Elastic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub capacity: Option<f64>,
}

impl From<&NodeConfig> for NodeSpec {
    fn from(node: &NodeConfig) -> Self {
        let spec = Self::new(node.id.as_str(), node.address.as_str());
        match node.capacity {
            Some(capacity) => spec.with_capacity(capacity),
            None => spec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Nodes present at startup
    pub nodes: Vec<NodeConfig>,
    /// Elastic upper bound (0 = unbounded)
    pub max_nodes: usize,
    /// Elastic lower bound for idle reaping; defaults to the startup pool size
    pub min_nodes: Option<usize>,
    /// `{seq}` is replaced by the provisioning sequence number
    pub node_id_template: String,
    pub node_address_template: String,
    pub provisioned_capacity: Option<f64>,
    pub tie_break: TieBreak,
    /// Idle node reaping period (0 disables)
    pub idle_reap_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Fixed,
            nodes: vec![NodeConfig {
                id: "kms-0".to_string(),
                address: "ws://127.0.0.1:8888/kurento".to_string(),
                capacity: None,
            }],
            max_nodes: 0,
            min_nodes: None,
            node_id_template: "kms-{seq}".to_string(),
            node_address_template: "ws://kms-{seq}:8888/kurento".to_string(),
            provisioned_capacity: None,
            tie_break: TieBreak::OldestFirst,
            idle_reap_interval_secs: 60,
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn node_specs(&self) -> Vec<NodeSpec> {
        self.nodes.iter().map(NodeSpec::from).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Unlimited,
    #[default]
    Weighted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub policy: PolicyKind,
    pub weighted: WeightedPolicy,
}

impl AdmissionConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn AdmissionPolicy> {
        match self.policy {
            PolicyKind::Unlimited => Arc::new(UnlimitedPolicy),
            PolicyKind::Weighted => Arc::new(self.weighted),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Outgoing tunnels per branch before relaying through a deeper node
    /// (0 = unlimited, every branch hangs from the source)
    pub relay_fanout: usize,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYTREE_CLUSTER__MAX_NODES, RELAYTREE_TREE__RELAY_FANOUT, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYTREE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level: unknown level '{}'", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format: expected 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let cluster = &self.cluster;
        let mut seen = HashSet::new();
        for node in &cluster.nodes {
            if node.id.is_empty() {
                errors.push("cluster.nodes: node id must not be empty".to_string());
            } else if !seen.insert(node.id.as_str()) {
                errors.push(format!("cluster.nodes: duplicate node id '{}'", node.id));
            }
            if node.address.is_empty() {
                errors.push(format!("cluster.nodes: node '{}' has no address", node.id));
            }
            if node.capacity.is_some_and(|c| c <= 0.0) {
                errors.push(format!("cluster.nodes: node '{}' capacity must be positive", node.id));
            }
        }

        match cluster.mode {
            ClusterMode::Fixed => {
                if cluster.nodes.is_empty() {
                    errors.push("cluster.nodes: a fixed cluster needs at least one node".to_string());
                }
            }
            ClusterMode::Elastic => {
                if !cluster.node_id_template.contains("{seq}") {
                    errors.push("cluster.node_id_template: must contain '{seq}'".to_string());
                }
                if cluster.node_address_template.is_empty() {
                    errors.push("cluster.node_address_template: must not be empty".to_string());
                }
                if cluster.max_nodes > 0 && cluster.max_nodes < cluster.nodes.len() {
                    errors.push(format!(
                        "cluster.max_nodes: {} is below the {} configured node(s)",
                        cluster.max_nodes,
                        cluster.nodes.len()
                    ));
                }
                if let Some(min) = cluster.min_nodes {
                    if cluster.max_nodes > 0 && min > cluster.max_nodes {
                        errors.push(format!(
                            "cluster.min_nodes: {min} exceeds max_nodes {}",
                            cluster.max_nodes
                        ));
                    }
                }
                if cluster.provisioned_capacity.is_some_and(|c| c <= 0.0) {
                    errors.push("cluster.provisioned_capacity: must be positive".to_string());
                }
            }
        }

        if self.admission.policy == PolicyKind::Weighted {
            let w = &self.admission.weighted;
            if w.capacity <= 0.0 {
                errors.push("admission.weighted.capacity: must be positive".to_string());
            }
            if w.threshold <= 0.0 {
                errors.push("admission.weighted.threshold: must be positive".to_string());
            }
            if w.endpoint_cost < 0.0 || w.tunnel_cost < 0.0 || w.pipeline_cost < 0.0 {
                errors.push("admission.weighted: costs must not be negative".to_string());
            }
            if w.endpoint_cost <= 0.0 && w.tunnel_cost <= 0.0 && w.pipeline_cost <= 0.0 {
                errors.push("admission.weighted: at least one cost must be positive".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.mode, ClusterMode::Fixed);
        assert_eq!(config.cluster.node_specs().len(), 1);
        assert_eq!(config.tree.relay_fanout, 0);
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        config.cluster.nodes.push(config.cluster.nodes[0].clone());
        config.admission.weighted.capacity = 0.0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("duplicate node id")));
    }

    #[test]
    fn test_elastic_limits() {
        let mut config = Config::default();
        config.cluster.mode = ClusterMode::Elastic;
        config.cluster.nodes.clear();
        assert!(config.validate().is_ok());

        config.cluster.node_id_template = "kms".to_string();
        config.cluster.max_nodes = 2;
        config.cluster.min_nodes = Some(3);
        assert_eq!(config.validate().unwrap_err().len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("relaytree-{}.yaml", nanoid::nanoid!(8)));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "cluster:\n  mode: elastic\n  max_nodes: 4\n  tie_break: newest_first\n  nodes:\n    - id: a\n      address: ws://a\n      capacity: 20\nadmission:\n  policy: weighted\n  weighted:\n    capacity: 50\n    tunnel_cost: 0.5\ntree:\n  relay_fanout: 3\n"
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.cluster.mode, ClusterMode::Elastic);
        assert_eq!(config.cluster.max_nodes, 4);
        assert_eq!(config.cluster.tie_break, TieBreak::NewestFirst);
        assert_eq!(config.cluster.nodes[0].capacity, Some(20.0));
        assert!((config.admission.weighted.tunnel_cost - 0.5).abs() < f64::EPSILON);
        assert!((config.admission.weighted.endpoint_cost - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.tree.relay_fanout, 3);
        assert!(config.validate().is_ok());
    }
}
