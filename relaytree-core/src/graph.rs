//! Element graph model
//!
//! Every element, pipeline and node lives in an id-indexed arena owned by
//! [`MediaGraph`]. Links between elements (sink → source, stub → peer) are
//! plain ids, so a removed element never leaves a dangling owner behind.
//!
//! Mutations that must be reversible go through a [`Transaction`], which
//! records each change in a [`Journal`]. Replaying the journal backwards
//! restores the graph (and therefore every node's load) exactly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::error;

use crate::error::{Error, Result};
use crate::node::{Node, Pipeline};
use crate::types::{ElementId, NodeId, PipelineId, TreeId};

/// Which side of a tunnel pair a stub sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelEnd {
    /// Fed by the upstream branch
    Origin,
    /// Feeds the downstream branch
    Destination,
}

/// Element discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ElementKind {
    /// WebRTC-style endpoint: a tree's master or a viewer
    Endpoint,
    /// One half of a tunnel pair
    TunnelStub { peer: ElementId, end: TunnelEnd },
}

/// A vertex of the media graph
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub pipeline: PipelineId,
    pub node: NodeId,
    pub kind: ElementKind,
    /// Handle assigned by the media driver once the remote object exists
    pub remote: Option<String>,
    source: Option<ElementId>,
    sinks: BTreeSet<ElementId>,
}

impl Element {
    pub(crate) const fn new(
        id: ElementId,
        pipeline: PipelineId,
        node: NodeId,
        kind: ElementKind,
    ) -> Self {
        Self {
            id,
            pipeline,
            node,
            kind,
            remote: None,
            source: None,
            sinks: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn source(&self) -> Option<ElementId> {
        self.source
    }

    pub fn sinks(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.sinks.iter().copied()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub const fn peer(&self) -> Option<ElementId> {
        match self.kind {
            ElementKind::TunnelStub { peer, .. } => Some(peer),
            ElementKind::Endpoint => None,
        }
    }

    #[must_use]
    pub const fn is_tunnel_stub(&self) -> bool {
        matches!(self.kind, ElementKind::TunnelStub { .. })
    }
}

/// In-memory model of every node, pipeline and element in the cluster
#[derive(Debug, Default, Clone)]
pub struct MediaGraph {
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    pub(crate) pipelines: BTreeMap<PipelineId, Pipeline>,
    pub(crate) elements: BTreeMap<ElementId, Element>,
    next_id: u64,
    pub(crate) next_node_seq: u64,
}

impl MediaGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn element_or_err(&self, id: ElementId) -> Result<&Element> {
        self.elements
            .get(&id)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown element {id}")))
    }

    /// Link `target` as a sink of `source`
    ///
    /// Returns `false` when the link already existed. A target that is fed by
    /// a different source must be disconnected first.
    pub fn connect(&mut self, source: ElementId, target: ElementId) -> Result<bool> {
        if source == target {
            return Err(Error::InvalidTopology(format!(
                "cannot connect {source} to itself"
            )));
        }
        self.element_or_err(source)?;
        match self.element_or_err(target)?.source {
            Some(current) if current == source => return Ok(false),
            Some(current) => {
                return Err(Error::InvalidTopology(format!(
                    "{target} is already fed by {current}"
                )))
            }
            None => {}
        }

        // Walking up from the new source must never reach the target
        let mut cursor = Some(source);
        while let Some(id) = cursor {
            if id == target {
                return Err(Error::InvalidTopology(format!(
                    "connecting {source} -> {target} would create a cycle"
                )));
            }
            cursor = self.elements.get(&id).and_then(|e| e.source);
        }

        if let Some(t) = self.elements.get_mut(&target) {
            t.source = Some(source);
        }
        if let Some(s) = self.elements.get_mut(&source) {
            s.sinks.insert(target);
        }
        Ok(true)
    }

    /// Detach `element` from its source
    ///
    /// Idempotent: an element without a source is left untouched. Returns the
    /// former source, if any.
    pub fn disconnect(&mut self, element: ElementId) -> Result<Option<ElementId>> {
        let Some(source) = self.element_or_err(element)?.source else {
            return Ok(None);
        };
        if let Some(s) = self.elements.get_mut(&source) {
            s.sinks.remove(&element);
        }
        if let Some(e) = self.elements.get_mut(&element) {
            e.source = None;
        }
        Ok(Some(source))
    }

    /// Point-in-time copy of an element's sinks
    pub fn sinks_of(&self, element: ElementId) -> Result<Vec<ElementId>> {
        Ok(self.element_or_err(element)?.sinks().collect())
    }

    /// Disconnect every sink currently fed by `element`
    pub fn disconnect_sinks(&mut self, element: ElementId) -> Result<usize> {
        let sinks = self.sinks_of(element)?;
        for sink in &sinks {
            self.disconnect(*sink)?;
        }
        Ok(sinks.len())
    }

    /// Disconnect and destroy an element; a tunnel stub takes its peer with it
    pub fn release_element(&mut self, element: ElementId) -> Result<()> {
        let mut journal = Journal::default();
        Transaction::new(self, &mut journal).release_element(element)
    }

    pub fn set_element_remote(&mut self, element: ElementId, handle: String) -> Result<()> {
        self.elements
            .get_mut(&element)
            .map(|e| e.remote = Some(handle))
            .ok_or_else(|| Error::InvalidTopology(format!("unknown element {element}")))
    }

    /// Forget the remote handle of an element whose remote object is gone
    pub fn clear_element_remote(&mut self, element: ElementId) {
        if let Some(e) = self.elements.get_mut(&element) {
            e.remote = None;
        }
    }

    /// Remove an element that has no links left
    pub(crate) fn remove_detached_element(&mut self, id: ElementId) -> Result<Element> {
        let element = self.element_or_err(id)?;
        if element.source.is_some() || !element.sinks.is_empty() {
            return Err(Error::InvalidTopology(format!(
                "{id} is still connected"
            )));
        }
        let element = self
            .elements
            .remove(&id)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown element {id}")))?;
        if let Some(pipeline) = self.pipelines.get_mut(&element.pipeline) {
            pipeline.elements.remove(&id);
        }
        Ok(element)
    }

    pub(crate) fn insert_element(&mut self, element: Element) {
        if let Some(pipeline) = self.pipelines.get_mut(&element.pipeline) {
            pipeline.elements.insert(element.id);
        }
        self.elements.insert(element.id, element);
    }
}

/// One reversible mutation of the media graph
#[derive(Debug, Clone)]
pub enum Change {
    PipelineCreated(PipelineId),
    ElementCreated(ElementId),
    Connected { source: ElementId, target: ElementId },
    Disconnected { source: ElementId, target: ElementId },
    ElementRemoved(Element),
    PipelineRemoved(Pipeline),
}

/// Ordered record of the changes applied by one operation
#[derive(Debug, Default, Clone)]
pub struct Journal {
    changes: Vec<Change>,
}

impl Journal {
    #[must_use]
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Undo every recorded change, newest first
    pub fn rollback(self, graph: &mut MediaGraph) {
        for change in self.changes.into_iter().rev() {
            let outcome = match change {
                Change::PipelineCreated(id) => graph.remove_empty_pipeline(id).map(drop),
                Change::ElementCreated(id) => graph.remove_detached_element(id).map(drop),
                Change::Connected { target, .. } => graph.disconnect(target).map(drop),
                Change::Disconnected { source, target } => graph.connect(source, target).map(drop),
                Change::ElementRemoved(element) => {
                    graph.insert_element(element);
                    Ok(())
                }
                Change::PipelineRemoved(pipeline) => {
                    graph.restore_pipeline(pipeline);
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                error!(error = %e, "Failed to undo graph change");
            }
        }
    }
}

/// Journaled view over a [`MediaGraph`]
pub struct Transaction<'a> {
    graph: &'a mut MediaGraph,
    journal: &'a mut Journal,
}

impl<'a> Transaction<'a> {
    pub fn new(graph: &'a mut MediaGraph, journal: &'a mut Journal) -> Self {
        Self { graph, journal }
    }

    #[must_use]
    pub fn graph(&self) -> &MediaGraph {
        self.graph
    }

    pub fn create_pipeline(&mut self, node: &NodeId, tree: &TreeId) -> Result<PipelineId> {
        let id = self.graph.create_pipeline(node, tree)?;
        self.journal.push(Change::PipelineCreated(id));
        Ok(id)
    }

    pub fn create_endpoint(&mut self, pipeline: PipelineId) -> Result<ElementId> {
        let id = self.graph.create_endpoint(pipeline)?;
        self.journal.push(Change::ElementCreated(id));
        Ok(id)
    }

    pub fn create_tunnel_pair(
        &mut self,
        origin: PipelineId,
        destination: PipelineId,
    ) -> Result<(ElementId, ElementId)> {
        let (a, b) = self.graph.create_tunnel_pair(origin, destination)?;
        self.journal.push(Change::ElementCreated(a));
        self.journal.push(Change::ElementCreated(b));
        Ok((a, b))
    }

    pub fn connect(&mut self, source: ElementId, target: ElementId) -> Result<()> {
        if self.graph.connect(source, target)? {
            self.journal.push(Change::Connected { source, target });
        }
        Ok(())
    }

    pub fn disconnect(&mut self, element: ElementId) -> Result<()> {
        if let Some(source) = self.graph.disconnect(element)? {
            self.journal.push(Change::Disconnected {
                source,
                target: element,
            });
        }
        Ok(())
    }

    fn detach(&mut self, element: ElementId) -> Result<()> {
        self.disconnect(element)?;
        for sink in self.graph.sinks_of(element)? {
            self.disconnect(sink)?;
        }
        Ok(())
    }

    fn remove(&mut self, element: ElementId) -> Result<()> {
        let removed = self.graph.remove_detached_element(element)?;
        let pipeline = removed.pipeline;
        self.journal.push(Change::ElementRemoved(removed));

        let emptied = self
            .graph
            .pipelines
            .get(&pipeline)
            .is_some_and(|p| p.elements.is_empty());
        if emptied {
            let pipeline = self.graph.remove_empty_pipeline(pipeline)?;
            self.journal.push(Change::PipelineRemoved(pipeline));
        }
        Ok(())
    }

    /// Disconnect and destroy an element; a tunnel stub takes its peer with it
    ///
    /// Pipelines left without elements are destroyed as well.
    pub fn release_element(&mut self, element: ElementId) -> Result<()> {
        let peer = self.graph.element_or_err(element)?.peer();
        self.detach(element)?;
        if let Some(peer) = peer {
            if self.graph.elements.contains_key(&peer) {
                self.detach(peer)?;
                self.remove(peer)?;
            }
        }
        self.remove(element)
    }

    /// Destroy a pipeline and everything it owns
    ///
    /// Tunnel stubs are removed without their peers; callers tearing down a
    /// whole tree release the peers with their own pipelines.
    pub fn teardown_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        let elements: Vec<ElementId> = self
            .graph
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown pipeline {pipeline}")))?
            .elements
            .iter()
            .copied()
            .collect();
        for element in &elements {
            self.detach(*element)?;
        }
        for element in elements {
            self.remove(element)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;

    fn graph_with_pipeline() -> (MediaGraph, PipelineId) {
        let mut graph = MediaGraph::new();
        let node = graph.add_node(NodeSpec::new("kms-1", "ws://kms-1:8888")).unwrap();
        let pipeline = graph.create_pipeline(&node, &TreeId::from("tree")).unwrap();
        (graph, pipeline)
    }

    fn assert_links_consistent(graph: &MediaGraph) {
        for element in graph.elements() {
            if let Some(source) = element.source() {
                let source = graph.element(source).unwrap();
                assert!(source.sinks().any(|s| s == element.id));
            }
            for sink in element.sinks() {
                assert_eq!(graph.element(sink).unwrap().source(), Some(element.id));
            }
        }
    }

    #[test]
    fn test_connect_sets_both_sides() {
        let (mut graph, p) = graph_with_pipeline();
        let master = graph.create_endpoint(p).unwrap();
        let viewer = graph.create_endpoint(p).unwrap();

        assert!(graph.connect(master, viewer).unwrap());
        assert_eq!(graph.element(viewer).unwrap().source(), Some(master));
        assert_eq!(graph.sinks_of(master).unwrap(), vec![viewer]);

        // Same link again is a no-op
        assert!(!graph.connect(master, viewer).unwrap());
        assert_links_consistent(&graph);
    }

    #[test]
    fn test_connect_rejects_self_and_repointing() {
        let (mut graph, p) = graph_with_pipeline();
        let a = graph.create_endpoint(p).unwrap();
        let b = graph.create_endpoint(p).unwrap();
        let c = graph.create_endpoint(p).unwrap();

        assert!(matches!(graph.connect(a, a), Err(Error::InvalidTopology(_))));

        graph.connect(a, c).unwrap();
        assert!(matches!(graph.connect(b, c), Err(Error::InvalidTopology(_))));
        assert_eq!(graph.element(c).unwrap().source(), Some(a));
    }

    #[test]
    fn test_connect_rejects_cycles() {
        let (mut graph, p) = graph_with_pipeline();
        let a = graph.create_endpoint(p).unwrap();
        let b = graph.create_endpoint(p).unwrap();
        let c = graph.create_endpoint(p).unwrap();
        graph.connect(a, b).unwrap();
        graph.connect(b, c).unwrap();

        assert!(matches!(graph.connect(c, a), Err(Error::InvalidTopology(_))));
        assert_links_consistent(&graph);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut graph, p) = graph_with_pipeline();
        let a = graph.create_endpoint(p).unwrap();
        let b = graph.create_endpoint(p).unwrap();

        assert_eq!(graph.disconnect(b).unwrap(), None);
        graph.connect(a, b).unwrap();
        assert_eq!(graph.disconnect(b).unwrap(), Some(a));
        assert_eq!(graph.disconnect(b).unwrap(), None);
        assert!(graph.sinks_of(a).unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_all_from_snapshot() {
        let (mut graph, p) = graph_with_pipeline();
        let master = graph.create_endpoint(p).unwrap();
        let sinks: Vec<_> = (0..3).map(|_| graph.create_endpoint(p).unwrap()).collect();
        for sink in &sinks {
            graph.connect(master, *sink).unwrap();
        }

        let snapshot = graph.sinks_of(master).unwrap();
        assert_eq!(snapshot.len(), 3);
        for sink in snapshot {
            graph.disconnect(sink).unwrap();
        }

        assert_eq!(graph.element(master).unwrap().sink_count(), 0);
        for sink in sinks {
            assert_eq!(graph.element(sink).unwrap().source(), None);
        }

        let other = graph.create_endpoint(p).unwrap();
        graph.connect(master, other).unwrap();
        assert_eq!(graph.disconnect_sinks(master).unwrap(), 1);
        assert_eq!(graph.disconnect_sinks(master).unwrap(), 0);
    }

    #[test]
    fn test_random_connect_disconnect_sequence_keeps_links_consistent() {
        let (mut graph, p) = graph_with_pipeline();
        let ids: Vec<_> = (0..6).map(|_| graph.create_endpoint(p).unwrap()).collect();

        // Deterministic pseudo-random walk over connect/disconnect requests
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let a = ids[(state % 6) as usize];
            let b = ids[((state >> 8) % 6) as usize];
            if state & 1 == 0 {
                let _ = graph.connect(a, b);
            } else {
                graph.disconnect(b).unwrap();
            }
            assert_links_consistent(&graph);
        }
    }

    #[test]
    fn test_release_tunnel_stub_takes_peer_and_empty_pipelines() {
        let mut graph = MediaGraph::new();
        let a = graph.add_node(NodeSpec::new("a", "ws://a")).unwrap();
        let b = graph.add_node(NodeSpec::new("b", "ws://b")).unwrap();
        let tree = TreeId::from("tree");
        let pa = graph.create_pipeline(&a, &tree).unwrap();
        let pb = graph.create_pipeline(&b, &tree).unwrap();
        let master = graph.create_endpoint(pa).unwrap();
        let (origin, destination) = graph.create_tunnel_pair(pa, pb).unwrap();
        graph.connect(master, origin).unwrap();

        graph.release_element(destination).unwrap();

        assert!(graph.element(origin).is_none());
        assert!(graph.element(destination).is_none());
        assert!(graph.pipeline(pb).is_none());
        assert!(graph.pipeline(pa).is_some());
        assert_eq!(graph.element(master).unwrap().sink_count(), 0);
    }

    #[test]
    fn test_journal_rollback_restores_graph() {
        let (mut graph, p) = graph_with_pipeline();
        let master = graph.create_endpoint(p).unwrap();
        let viewer = graph.create_endpoint(p).unwrap();
        graph.connect(master, viewer).unwrap();
        let node = graph.element(master).unwrap().node.clone();
        let before = graph.node_load(&node).unwrap();

        let mut journal = Journal::default();
        {
            let mut txn = Transaction::new(&mut graph, &mut journal);
            txn.release_element(viewer).unwrap();
            let extra = txn.create_endpoint(p).unwrap();
            txn.connect(master, extra).unwrap();
        }
        assert_eq!(graph.sinks_of(master).unwrap().len(), 1);

        journal.rollback(&mut graph);

        assert_eq!(graph.sinks_of(master).unwrap(), vec![viewer]);
        assert_eq!(graph.element_count(), 2);
        assert_eq!(graph.node_load(&node).unwrap(), before);
        assert_links_consistent(&graph);
    }
}
