//! Nodes and pipelines
//!
//! A node is one media server of the cluster. It owns pipelines, and each
//! pipeline is the sole owner of its elements: tearing a pipeline down
//! destroys everything inside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::graph::{Element, ElementKind, Journal, MediaGraph, Transaction, TunnelEnd};
use crate::types::{ElementId, NodeId, PipelineId, TreeId};

/// Description of a node joining the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    /// Address the media driver uses to reach the node
    pub address: String,
    /// Per-node capacity override for weighted admission policies
    #[serde(default)]
    pub capacity: Option<f64>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capacity: None,
        }
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// A cluster member
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    /// Join order, used for oldest/newest tie-breaking
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub capacity: Option<f64>,
    pub(crate) pipelines: BTreeSet<PipelineId>,
}

impl Node {
    pub fn pipelines(&self) -> impl Iterator<Item = PipelineId> + '_ {
        self.pipelines.iter().copied()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Per-node processing context; sole owner of its elements
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub id: PipelineId,
    pub node: NodeId,
    pub tree: TreeId,
    pub remote: Option<String>,
    pub(crate) elements: BTreeSet<ElementId>,
}

impl Pipeline {
    pub fn elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.elements.iter().copied()
    }
}

/// Element population of a node, as seen by admission policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub endpoints: usize,
    pub tunnel_stubs: usize,
    pub pipelines: usize,
    pub capacity: Option<f64>,
}

impl MediaGraph {
    /// Register a node; its join order is recorded for tie-breaking
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        if self.nodes.contains_key(&spec.id) {
            return Err(Error::AlreadyExists(format!("node {}", spec.id)));
        }
        self.next_node_seq += 1;
        let node = Node {
            id: spec.id.clone(),
            address: spec.address,
            seq: self.next_node_seq,
            created_at: Utc::now(),
            capacity: spec.capacity,
            pipelines: BTreeSet::new(),
        };
        self.nodes.insert(spec.id.clone(), node);
        Ok(spec.id)
    }

    /// Remove an idle node
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Node> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        if !node.is_idle() {
            return Err(Error::NodeBusy(format!(
                "node {id} still hosts {} pipeline(s)",
                node.pipelines.len()
            )));
        }
        self.nodes
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in join order
    pub fn nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Recompute a node's element population
    #[must_use]
    pub fn node_load(&self, id: &NodeId) -> Option<NodeLoad> {
        let node = self.nodes.get(id)?;
        let mut load = NodeLoad {
            pipelines: node.pipelines.len(),
            capacity: node.capacity,
            ..NodeLoad::default()
        };
        for element in node
            .pipelines
            .iter()
            .filter_map(|p| self.pipelines.get(p))
            .flat_map(|p| p.elements.iter())
            .filter_map(|e| self.elements.get(e))
        {
            match element.kind {
                ElementKind::Endpoint => load.endpoints += 1,
                ElementKind::TunnelStub { .. } => load.tunnel_stubs += 1,
            }
        }
        Some(load)
    }

    #[must_use]
    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.get(&id)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn create_pipeline(&mut self, node: &NodeId, tree: &TreeId) -> Result<PipelineId> {
        if !self.nodes.contains_key(node) {
            return Err(Error::InvalidTopology(format!("unknown node {node}")));
        }
        let id = PipelineId(self.allocate_id());
        self.pipelines.insert(
            id,
            Pipeline {
                id,
                node: node.clone(),
                tree: tree.clone(),
                remote: None,
                elements: BTreeSet::new(),
            },
        );
        if let Some(n) = self.nodes.get_mut(node) {
            n.pipelines.insert(id);
        }
        Ok(id)
    }

    pub fn create_endpoint(&mut self, pipeline: PipelineId) -> Result<ElementId> {
        let node = self.pipeline_node(pipeline)?;
        let id = ElementId(self.allocate_id());
        self.insert_element(Element::new(id, pipeline, node, ElementKind::Endpoint));
        Ok(id)
    }

    /// Create two linked stubs, one in each pipeline
    pub fn create_tunnel_pair(
        &mut self,
        origin: PipelineId,
        destination: PipelineId,
    ) -> Result<(ElementId, ElementId)> {
        if origin == destination {
            return Err(Error::InvalidTopology(format!(
                "tunnel endpoints must live in different pipelines, got {origin} twice"
            )));
        }
        let origin_node = self.pipeline_node(origin)?;
        let destination_node = self.pipeline_node(destination)?;
        let a = ElementId(self.allocate_id());
        let b = ElementId(self.allocate_id());
        self.insert_element(Element::new(
            a,
            origin,
            origin_node,
            ElementKind::TunnelStub {
                peer: b,
                end: TunnelEnd::Origin,
            },
        ));
        self.insert_element(Element::new(
            b,
            destination,
            destination_node,
            ElementKind::TunnelStub {
                peer: a,
                end: TunnelEnd::Destination,
            },
        ));
        Ok((a, b))
    }

    fn pipeline_node(&self, pipeline: PipelineId) -> Result<NodeId> {
        self.pipelines
            .get(&pipeline)
            .map(|p| p.node.clone())
            .ok_or_else(|| Error::InvalidTopology(format!("unknown pipeline {pipeline}")))
    }

    pub fn set_pipeline_remote(&mut self, pipeline: PipelineId, handle: String) -> Result<()> {
        self.pipelines
            .get_mut(&pipeline)
            .map(|p| p.remote = Some(handle))
            .ok_or_else(|| Error::InvalidTopology(format!("unknown pipeline {pipeline}")))
    }

    pub fn clear_pipeline_remote(&mut self, pipeline: PipelineId) {
        if let Some(p) = self.pipelines.get_mut(&pipeline) {
            p.remote = None;
        }
    }

    /// Destroy a pipeline together with every element it owns
    pub fn remove_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        let mut journal = Journal::default();
        Transaction::new(self, &mut journal).teardown_pipeline(pipeline)?;
        // Teardown drops the pipeline once its last element goes; an empty one stays
        if self.pipelines.contains_key(&pipeline) {
            self.remove_empty_pipeline(pipeline)?;
        }
        Ok(())
    }

    pub(crate) fn remove_empty_pipeline(&mut self, id: PipelineId) -> Result<Pipeline> {
        let pipeline = self
            .pipelines
            .get(&id)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown pipeline {id}")))?;
        if !pipeline.elements.is_empty() {
            return Err(Error::InvalidTopology(format!(
                "{id} still owns {} element(s)",
                pipeline.elements.len()
            )));
        }
        let pipeline = self
            .pipelines
            .remove(&id)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown pipeline {id}")))?;
        if let Some(node) = self.nodes.get_mut(&pipeline.node) {
            node.pipelines.remove(&id);
        }
        Ok(pipeline)
    }

    pub(crate) fn restore_pipeline(&mut self, pipeline: Pipeline) {
        if let Some(node) = self.nodes.get_mut(&pipeline.node) {
            node.pipelines.insert(pipeline.id);
        }
        self.pipelines.insert(pipeline.id, pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_join_order() {
        let mut graph = MediaGraph::new();
        graph.add_node(NodeSpec::new("b", "ws://b")).unwrap();
        graph.add_node(NodeSpec::new("a", "ws://a")).unwrap();

        let order: Vec<_> = graph.nodes().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(order, vec!["b", "a"]);

        let dup = graph.add_node(NodeSpec::new("a", "ws://a2"));
        assert!(matches!(dup, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_node_load_counts_population() {
        let mut graph = MediaGraph::new();
        let a = graph.add_node(NodeSpec::new("a", "ws://a")).unwrap();
        let b = graph.add_node(NodeSpec::new("b", "ws://b").with_capacity(4.0)).unwrap();
        let tree = TreeId::from("t");
        let pa = graph.create_pipeline(&a, &tree).unwrap();
        let pb = graph.create_pipeline(&b, &tree).unwrap();
        graph.create_endpoint(pa).unwrap();
        graph.create_endpoint(pb).unwrap();
        graph.create_endpoint(pb).unwrap();
        graph.create_tunnel_pair(pa, pb).unwrap();

        let load_a = graph.node_load(&a).unwrap();
        assert_eq!((load_a.endpoints, load_a.tunnel_stubs, load_a.pipelines), (1, 1, 1));
        let load_b = graph.node_load(&b).unwrap();
        assert_eq!((load_b.endpoints, load_b.tunnel_stubs), (2, 1));
        assert_eq!(load_b.capacity, Some(4.0));
    }

    #[test]
    fn test_tunnel_pair_peers() {
        let mut graph = MediaGraph::new();
        let a = graph.add_node(NodeSpec::new("a", "ws://a")).unwrap();
        let tree = TreeId::from("t");
        let p1 = graph.create_pipeline(&a, &tree).unwrap();
        let p2 = graph.create_pipeline(&a, &tree).unwrap();

        let (x, y) = graph.create_tunnel_pair(p1, p2).unwrap();
        assert_eq!(graph.element(x).unwrap().peer(), Some(y));
        assert_eq!(graph.element(y).unwrap().peer(), Some(x));
        assert_eq!(graph.element(x).unwrap().pipeline, p1);
        assert_eq!(graph.element(y).unwrap().pipeline, p2);
        assert!(matches!(
            graph.element(x).unwrap().kind,
            ElementKind::TunnelStub { end: TunnelEnd::Origin, .. }
        ));
        assert!(matches!(
            graph.element(y).unwrap().kind,
            ElementKind::TunnelStub { end: TunnelEnd::Destination, .. }
        ));

        assert!(matches!(
            graph.create_tunnel_pair(p1, p1),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_pipeline_owns_elements() {
        let mut graph = MediaGraph::new();
        let a = graph.add_node(NodeSpec::new("a", "ws://a")).unwrap();
        let p = graph.create_pipeline(&a, &TreeId::from("t")).unwrap();
        let master = graph.create_endpoint(p).unwrap();
        let viewer = graph.create_endpoint(p).unwrap();
        graph.connect(master, viewer).unwrap();

        assert!(matches!(graph.remove_node(&a), Err(Error::NodeBusy(_))));

        graph.remove_pipeline(p).unwrap();
        assert_eq!(graph.element_count(), 0);
        assert!(graph.node(&a).unwrap().is_idle());
        graph.remove_node(&a).unwrap();
        assert_eq!(graph.node_count(), 0);
    }
}
