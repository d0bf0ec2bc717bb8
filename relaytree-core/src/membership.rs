//! Cluster membership and placement
//!
//! The membership manager owns the cluster's [`MediaGraph`] and decides where
//! new elements go:
//! - candidates are the nodes the admission policy still admits
//! - the least loaded candidate wins, ties broken by [`TieBreak`]
//! - a fixed pool fails with `NoCapacity` once every node is saturated
//! - an elastic pool provisions one node per overload event
//!
//! Placement evaluates admission and applies the caller's reservation under a
//! single write lock, so two placements can never both see the same spare
//! slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::admission::AdmissionPolicy;
use crate::error::{Error, Result};
use crate::graph::MediaGraph;
use crate::node::{Node, NodeLoad, NodeSpec};
use crate::types::NodeId;

/// Ordering among equally loaded candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Prefer the node that joined first
    #[default]
    OldestFirst,
    /// Prefer the node that joined last
    NewestFirst,
    /// Lexicographic node id
    NodeId,
}

impl TieBreak {
    fn compare(self, a: &Node, b: &Node) -> Ordering {
        match self {
            Self::OldestFirst => a.seq.cmp(&b.seq),
            Self::NewestFirst => b.seq.cmp(&a.seq),
            Self::NodeId => a.id.cmp(&b.id),
        }
    }
}

/// Infrastructure hook that brings new media nodes online
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Start the `seq`-th provisioned node and describe it
    async fn provision(&self, seq: usize) -> anyhow::Result<NodeSpec>;

    /// Shut down a node that left the cluster
    async fn decommission(&self, _node: &NodeId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Provisioner that derives node ids and addresses from templates
///
/// `{seq}` in either template is replaced by the provisioning sequence number.
#[derive(Debug, Clone)]
pub struct StaticProvisioner {
    id_template: String,
    address_template: String,
    capacity: Option<f64>,
}

impl StaticProvisioner {
    pub fn new(id_template: impl Into<String>, address_template: impl Into<String>) -> Self {
        Self {
            id_template: id_template.into(),
            address_template: address_template.into(),
            capacity: None,
        }
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

#[async_trait]
impl NodeProvisioner for StaticProvisioner {
    async fn provision(&self, seq: usize) -> anyhow::Result<NodeSpec> {
        let seq = seq.to_string();
        let mut spec = NodeSpec::new(
            self.id_template.replace("{seq}", &seq),
            self.address_template.replace("{seq}", &seq),
        );
        spec.capacity = self.capacity;
        Ok(spec)
    }
}

/// Read-only view of one cluster member
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub address: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub load: f64,
    pub admits_more: bool,
    pub population: NodeLoad,
}

/// Elastic growth state
pub struct ElasticGrowth {
    provisioner: Arc<dyn NodeProvisioner>,
    /// Upper bound on cluster size (0 = unbounded)
    max_nodes: usize,
    /// Idle reaping never shrinks the cluster below this size
    min_nodes: usize,
    /// Serializes re-check-then-provision
    gate: Mutex<()>,
    /// Last sequence number handed to the provisioner
    seq: AtomicUsize,
    provisioned: AtomicUsize,
}

pub enum Growth {
    Fixed,
    Elastic(ElasticGrowth),
}

/// Pool of media nodes plus the graph of everything placed on them
pub struct ClusterMembership {
    graph: RwLock<MediaGraph>,
    policy: Arc<dyn AdmissionPolicy>,
    tie_break: TieBreak,
    growth: Growth,
}

impl ClusterMembership {
    fn with_nodes(nodes: Vec<NodeSpec>, policy: Arc<dyn AdmissionPolicy>, growth: Growth) -> Result<Self> {
        let mut graph = MediaGraph::new();
        for spec in nodes {
            graph.add_node(spec)?;
        }
        Ok(Self {
            graph: RwLock::new(graph),
            policy,
            tie_break: TieBreak::default(),
            growth,
        })
    }

    /// Static pool
    pub fn fixed(nodes: Vec<NodeSpec>, policy: Arc<dyn AdmissionPolicy>) -> Result<Self> {
        let membership = Self::with_nodes(nodes, policy, Growth::Fixed)?;
        info!(nodes = membership.node_count(), "Fixed cluster membership initialized");
        Ok(membership)
    }

    /// Pool that grows through `provisioner` up to `max_nodes` (0 = unbounded)
    pub fn elastic(
        nodes: Vec<NodeSpec>,
        policy: Arc<dyn AdmissionPolicy>,
        provisioner: Arc<dyn NodeProvisioner>,
        max_nodes: usize,
    ) -> Result<Self> {
        let min_nodes = nodes.len();
        let membership = Self::with_nodes(
            nodes,
            policy,
            Growth::Elastic(ElasticGrowth {
                provisioner,
                max_nodes,
                min_nodes,
                gate: Mutex::new(()),
                seq: AtomicUsize::new(0),
                provisioned: AtomicUsize::new(0),
            }),
        )?;
        info!(
            nodes = membership.node_count(),
            max_nodes,
            "Elastic cluster membership initialized"
        );
        Ok(membership)
    }

    #[must_use]
    pub const fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    #[must_use]
    pub fn with_min_nodes(mut self, min: usize) -> Self {
        if let Growth::Elastic(elastic) = &mut self.growth {
            elastic.min_nodes = min;
        }
        self
    }

    #[must_use]
    pub const fn is_elastic(&self) -> bool {
        matches!(self.growth, Growth::Elastic(_))
    }

    #[must_use]
    pub fn policy(&self) -> &dyn AdmissionPolicy {
        self.policy.as_ref()
    }

    /// Nodes provisioned by elastic growth so far
    #[must_use]
    pub fn provisioned_count(&self) -> usize {
        match &self.growth {
            Growth::Elastic(elastic) => elastic.provisioned.load(AtomicOrdering::Acquire),
            Growth::Fixed => 0,
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.read().node_count()
    }

    /// Run `f` against a consistent view of the graph
    pub fn read<R>(&self, f: impl FnOnce(&MediaGraph) -> R) -> R {
        f(&self.graph.read())
    }

    /// Run `f` with exclusive access to the graph
    pub fn write<R>(&self, f: impl FnOnce(&mut MediaGraph) -> R) -> R {
        f(&mut self.graph.write())
    }

    /// Currently known nodes, in join order
    #[must_use]
    pub fn list_nodes(&self) -> Vec<NodeSummary> {
        self.read(|graph| self.summarize(graph))
    }

    pub(crate) fn summarize(&self, graph: &MediaGraph) -> Vec<NodeSummary> {
        graph
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let population = graph.node_load(&node.id)?;
                Some(NodeSummary {
                    id: node.id.clone(),
                    address: node.address.clone(),
                    seq: node.seq,
                    created_at: node.created_at,
                    load: self.policy.load(&population),
                    admits_more: self.policy.admits_more(&population),
                    population,
                })
            })
            .collect()
    }

    /// Least loaded node the policy still admits
    #[must_use]
    pub fn select_node(&self, graph: &MediaGraph) -> Option<NodeId> {
        graph
            .nodes()
            .into_iter()
            .filter_map(|node| graph.node_load(&node.id).map(|load| (node, load)))
            .filter(|(_, load)| self.policy.admits_more(load))
            .map(|(node, load)| (node, self.policy.load(&load)))
            .min_by(|(a, load_a), (b, load_b)| {
                load_a
                    .total_cmp(load_b)
                    .then_with(|| self.tie_break.compare(a, b))
            })
            .map(|(node, _)| node.id.clone())
    }

    fn try_place<T, F>(&self, reserve: &mut F) -> Result<Option<(NodeId, T)>>
    where
        F: FnMut(&mut MediaGraph, &NodeId) -> Result<T>,
    {
        let mut graph = self.graph.write();
        let Some(node) = self.select_node(&graph) else {
            return Ok(None);
        };
        let reserved = reserve(&mut graph, &node)?;
        debug!(node_id = %node, "Reserved placement on node");
        Ok(Some((node, reserved)))
    }

    /// Pick a node and apply `reserve` to it atomically with the admission check
    ///
    /// When every node is saturated an elastic pool provisions one node and
    /// retries; concurrent callers that observed the same overload wait on the
    /// growth gate and reuse that node instead of provisioning their own.
    /// `reserve` is invoked at most once per successful placement.
    pub async fn place<T, F>(&self, mut reserve: F) -> Result<(NodeId, T)>
    where
        F: FnMut(&mut MediaGraph, &NodeId) -> Result<T> + Send,
        T: Send,
    {
        if let Some(placed) = self.try_place(&mut reserve)? {
            return Ok(placed);
        }

        let Growth::Elastic(elastic) = &self.growth else {
            warn!(nodes = self.node_count(), "All nodes saturated and the cluster cannot grow");
            return Err(Error::NoCapacity(format!(
                "all {} node(s) saturated",
                self.node_count()
            )));
        };

        let _gate = elastic.gate.lock().await;

        if let Some(placed) = self.try_place(&mut reserve)? {
            debug!("Capacity appeared while waiting for the growth gate");
            return Ok(placed);
        }

        let nodes = self.node_count();
        if elastic.max_nodes > 0 && nodes >= elastic.max_nodes {
            warn!(nodes, max_nodes = elastic.max_nodes, "Cluster growth limit reached");
            return Err(Error::NoCapacity(format!(
                "all {nodes} node(s) saturated and growth limit {} reached",
                elastic.max_nodes
            )));
        }

        let node = self.provision_node(elastic, nodes).await?;
        info!(node_id = %node, total_nodes = nodes + 1, "Provisioned node for overloaded cluster");

        self.try_place(&mut reserve)?.ok_or_else(|| {
            Error::NoCapacity(format!("freshly provisioned node {node} does not admit load"))
        })
    }

    /// Bring one node online through the provisioner
    ///
    /// A provisioned node whose id is already a member burns its sequence
    /// number and the next one is tried, at most once per current member.
    /// Must be called with the growth gate held.
    async fn provision_node(&self, elastic: &ElasticGrowth, members: usize) -> Result<NodeId> {
        for _ in 0..=members {
            let seq = elastic.seq.load(AtomicOrdering::Acquire) + 1;
            let spec = elastic.provisioner.provision(seq).await.map_err(|e| {
                warn!(error = %e, seq, "Node provisioning failed");
                Error::ProvisioningFailed(e.to_string())
            })?;
            elastic.seq.store(seq, AtomicOrdering::Release);

            let id = spec.id.clone();
            match self.write(|graph| graph.add_node(spec)) {
                Ok(node) => {
                    elastic.provisioned.fetch_add(1, AtomicOrdering::AcqRel);
                    return Ok(node);
                }
                Err(Error::AlreadyExists(_)) => {
                    warn!(node_id = %id, seq, "Provisioned node id already in use, skipping sequence number");
                }
                Err(e) => return Err(Error::ProvisioningFailed(format!("node {id} could not join: {e}"))),
            }
        }
        Err(Error::ProvisioningFailed(format!(
            "provisioner kept returning ids already in use after {} attempt(s)",
            members + 1
        )))
    }

    /// Remove a node that no longer hosts pipelines
    pub fn remove_node(&self, id: &NodeId) -> Result<()> {
        self.write(|graph| graph.remove_node(id))?;
        info!(node_id = %id, "Removed node from cluster");
        Ok(())
    }

    /// Shrink an elastic pool by removing idle nodes, newest first
    ///
    /// Never goes below the configured minimum. Returns the removed ids.
    pub async fn release_idle_nodes(&self) -> Vec<NodeId> {
        let Growth::Elastic(elastic) = &self.growth else {
            return Vec::new();
        };
        let _gate = elastic.gate.lock().await;

        let removed: Vec<NodeId> = self.write(|graph| {
            let mut idle: Vec<(u64, NodeId)> = graph
                .nodes()
                .into_iter()
                .filter(|n| n.is_idle())
                .map(|n| (n.seq, n.id.clone()))
                .collect();
            idle.sort_by(|a, b| b.0.cmp(&a.0));

            let surplus = graph.node_count().saturating_sub(elastic.min_nodes);
            idle.into_iter()
                .take(surplus)
                .filter_map(|(_, id)| graph.remove_node(&id).ok().map(|_| id))
                .collect()
        });

        for id in &removed {
            if let Err(e) = elastic.provisioner.decommission(id).await {
                warn!(node_id = %id, error = %e, "Failed to decommission idle node");
            }
        }
        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                remaining = self.node_count(),
                "Released idle nodes"
            );
        }
        removed
    }
}
