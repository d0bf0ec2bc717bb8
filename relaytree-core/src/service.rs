//! Tree service - top-level control surface
//!
//! This module provides:
//! - Tree lifecycle (create, source, sinks, release) keyed by tree id
//! - One structural change in flight per tree; different trees run in parallel
//! - Read-only diagnostics (tree summaries, topology snapshots)
//! - Background maintenance shrinking an elastic cluster

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::config::{ClusterMode, Config};
use crate::driver::MediaDriver;
use crate::error::{Error, Result};
use crate::membership::{ClusterMembership, StaticProvisioner};
use crate::snapshot::TopologySnapshot;
use crate::tree::{Tree, TreeState, TreeSynthesizer};
use crate::types::{NodeId, TreeId, ViewerId};

/// Summary of one tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeSummary {
    pub id: TreeId,
    pub state: TreeState,
    pub source_node: Option<NodeId>,
    pub viewers: usize,
    pub nodes: Vec<NodeId>,
    pub tunnels: usize,
}

impl From<&Tree> for TreeSummary {
    fn from(tree: &Tree) -> Self {
        Self {
            id: tree.id().clone(),
            state: tree.state(),
            source_node: tree.source_node().cloned(),
            viewers: tree.sink_count(),
            nodes: tree.nodes().cloned().collect(),
            tunnels: tree.tunnel_count(),
        }
    }
}

/// Tree service - manages every broadcast tree on a cluster
pub struct TreeService {
    synthesizer: TreeSynthesizer,

    /// Trees by id; each behind its own lock, held across driver calls
    trees: DashMap<TreeId, Arc<Mutex<Tree>>>,
}

impl TreeService {
    #[must_use]
    pub fn new(synthesizer: TreeSynthesizer) -> Self {
        Self {
            synthesizer,
            trees: DashMap::new(),
        }
    }

    /// Build the cluster, admission policy and synthesizer described by `config`
    pub fn from_config(config: &Config, driver: Arc<dyn MediaDriver>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;

        let cluster = &config.cluster;
        let policy = config.admission.build();
        let membership = match cluster.mode {
            ClusterMode::Fixed => ClusterMembership::fixed(cluster.node_specs(), policy)?,
            ClusterMode::Elastic => {
                let mut provisioner = StaticProvisioner::new(
                    cluster.node_id_template.as_str(),
                    cluster.node_address_template.as_str(),
                );
                if let Some(capacity) = cluster.provisioned_capacity {
                    provisioner = provisioner.with_capacity(capacity);
                }
                let membership = ClusterMembership::elastic(
                    cluster.node_specs(),
                    policy,
                    Arc::new(provisioner),
                    cluster.max_nodes,
                )?;
                match cluster.min_nodes {
                    Some(min) => membership.with_min_nodes(min),
                    None => membership,
                }
            }
        }
        .with_tie_break(cluster.tie_break);

        let synthesizer = TreeSynthesizer::new(Arc::new(membership), driver)
            .with_relay_fanout(config.tree.relay_fanout);

        info!(
            mode = ?cluster.mode,
            nodes = cluster.nodes.len(),
            relay_fanout = config.tree.relay_fanout,
            "Tree service initialized"
        );
        Ok(Self::new(synthesizer))
    }

    #[must_use]
    pub const fn membership(&self) -> &Arc<ClusterMembership> {
        self.synthesizer.membership()
    }

    fn tree(&self, id: &TreeId) -> Result<Arc<Mutex<Tree>>> {
        self.trees
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(format!("tree {id}")))
    }

    /// Register a new, empty tree
    pub fn create_tree(&self) -> TreeId {
        let id = TreeId::generate();
        self.trees
            .insert(id.clone(), Arc::new(Mutex::new(Tree::new(id.clone()))));
        info!(tree_id = %id, total_trees = self.trees.len(), "Created tree");
        id
    }

    /// Attach the tree's source; returns the SDP answer
    pub async fn set_tree_source(&self, id: &TreeId, offer: &str) -> Result<String> {
        let tree = self.tree(id)?;
        let mut tree = tree.lock().await;
        self.synthesizer.create_source(&mut tree, offer).await
    }

    /// Attach a viewer; returns the SDP answer
    pub async fn add_tree_sink(&self, id: &TreeId, viewer: ViewerId, offer: &str) -> Result<String> {
        let tree = self.tree(id)?;
        let mut tree = tree.lock().await;
        self.synthesizer.add_sink(&mut tree, viewer, offer).await
    }

    pub async fn remove_tree_sink(&self, id: &TreeId, viewer: &ViewerId) -> Result<()> {
        let tree = self.tree(id)?;
        let mut tree = tree.lock().await;
        self.synthesizer.remove_sink(&mut tree, viewer).await
    }

    /// Tear the tree down
    ///
    /// The closed tree stays registered, so late calls fail with
    /// `InvalidTransition` until maintenance forgets it.
    pub async fn release_tree(&self, id: &TreeId) -> Result<()> {
        let tree = self.tree(id)?;
        let mut tree = tree.lock().await;
        self.synthesizer.remove_source(&mut tree).await
    }

    pub async fn tree_state(&self, id: &TreeId) -> Result<TreeState> {
        let tree = self.tree(id)?;
        let state = tree.lock().await.state();
        Ok(state)
    }

    pub async fn describe_tree(&self, id: &TreeId) -> Result<TreeSummary> {
        let tree = self.tree(id)?;
        let summary = TreeSummary::from(&*tree.lock().await);
        Ok(summary)
    }

    /// Ids of every registered tree
    #[must_use]
    pub fn list_trees(&self) -> Vec<TreeId> {
        let mut ids: Vec<TreeId> = self.trees.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Point-in-time view of the whole cluster
    #[must_use]
    pub fn topology(&self) -> TopologySnapshot {
        TopologySnapshot::capture(self.membership())
    }

    /// Drop closed trees from the registry
    pub async fn forget_closed_trees(&self) -> usize {
        let mut closed = Vec::new();
        let trees: Vec<(TreeId, Arc<Mutex<Tree>>)> = self
            .trees
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (id, tree) in trees {
            if tree.lock().await.state() == TreeState::Closed {
                closed.push(id);
            }
        }
        for id in &closed {
            self.trees.remove(id);
            debug!(tree_id = %id, "Forgot closed tree");
        }
        closed.len()
    }

    /// One maintenance pass: forget closed trees, then shrink the cluster
    pub async fn run_maintenance(&self) {
        let forgotten = self.forget_closed_trees().await;
        let released = self.membership().release_idle_nodes().await;
        if forgotten > 0 || !released.is_empty() {
            info!(
                forgotten_trees = forgotten,
                released_nodes = released.len(),
                remaining_trees = self.trees.len(),
                "Maintenance pass finished"
            );
        }
    }

    /// Background task for periodic maintenance
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            info!(interval_secs = period.as_secs(), "Starting maintenance task");

            loop {
                ticker.tick().await;
                service.run_maintenance().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::WeightedPolicy;
    use crate::config::PolicyKind;
    use crate::driver::LoopbackDriver;

    fn service(config: &Config) -> TreeService {
        TreeService::from_config(config, Arc::new(LoopbackDriver::new())).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tree() {
        let service = service(&Config::default());
        let ghost = TreeId::from("ghost");
        assert!(matches!(service.set_tree_source(&ghost, "v=0").await, Err(Error::NotFound(_))));
        assert!(matches!(service.release_tree(&ghost).await, Err(Error::NotFound(_))));
        assert!(matches!(service.tree_state(&ghost).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tree_lifecycle() {
        let service = service(&Config::default());
        let id = service.create_tree();
        assert_eq!(service.tree_state(&id).await.unwrap(), TreeState::Empty);
        assert_eq!(service.list_trees(), vec![id.clone()]);

        service.set_tree_source(&id, "v=0").await.unwrap();
        service.add_tree_sink(&id, ViewerId::from("v1"), "v=0").await.unwrap();
        let summary = service.describe_tree(&id).await.unwrap();
        assert_eq!(summary.state, TreeState::Active);
        assert_eq!(summary.viewers, 1);
        assert_eq!(summary.source_node.unwrap().as_str(), "kms-0");

        service.remove_tree_sink(&id, &ViewerId::from("v1")).await.unwrap();
        assert_eq!(service.tree_state(&id).await.unwrap(), TreeState::HasSource);

        service.release_tree(&id).await.unwrap();
        assert_eq!(service.tree_state(&id).await.unwrap(), TreeState::Closed);
        assert!(matches!(service.release_tree(&id).await, Err(Error::InvalidTransition(_))));

        assert_eq!(service.forget_closed_trees().await, 1);
        assert!(matches!(service.tree_state(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.cluster.nodes.clear();
        let result = TreeService::from_config(&config, Arc::new(LoopbackDriver::new()));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_maintenance_releases_idle_provisioned_nodes() {
        let mut config = Config::default();
        config.cluster.mode = ClusterMode::Elastic;
        config.admission.policy = PolicyKind::Weighted;
        config.admission.weighted = WeightedPolicy::endpoints(2);
        let service = service(&config);

        let id = service.create_tree();
        service.set_tree_source(&id, "v=0").await.unwrap();
        service.add_tree_sink(&id, ViewerId::from("v1"), "v=0").await.unwrap();
        service.add_tree_sink(&id, ViewerId::from("v2"), "v=0").await.unwrap();
        assert_eq!(service.membership().node_count(), 2);

        service.release_tree(&id).await.unwrap();
        service.run_maintenance().await;

        assert_eq!(service.membership().node_count(), 1);
        assert_eq!(service.tree_count(), 0);
        assert!(service.topology().elements.is_empty());
    }
}
