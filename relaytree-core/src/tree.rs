//! Broadcast tree synthesis
//!
//! A tree fans one master endpoint out to many viewer endpoints. Inside the
//! cluster it is a set of branches, one pipeline per node, linked by tunnel
//! pairs:
//!
//! ```text
//!   node a                     node b
//!   master ──► origin stub ═══ destination stub ──► viewer
//!     └──► viewer                   └──► viewer
//! ```
//!
//! Growing a tree follows the same shape every time:
//! 1. apply the change to the graph through a journaled transaction
//!    (placement and admission happen under the same lock)
//! 2. replay the journal through the [`MediaDriver`]
//! 3. if the driver fails, release what was created remotely, undo the
//!    journal and restore the tree's own bookkeeping
//!
//! Shrinking runs the other way round: the removal is planned against the
//! graph, carried out on the media nodes, and only then committed. Freed
//! capacity never becomes visible to placement before the remote objects
//! are actually gone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::driver::MediaDriver;
use crate::error::{Error, Result};
use crate::graph::{Change, Element, ElementKind, Journal, MediaGraph, Transaction, TunnelEnd};
use crate::membership::ClusterMembership;
use crate::types::{ElementId, NodeId, PipelineId, TreeId, ViewerId};

/// Tree lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeState {
    /// Created, no source yet
    Empty,
    /// Source attached, no viewers
    HasSource,
    /// Source attached, at least one viewer
    Active,
    /// Released; terminal
    Closed,
}

impl fmt::Display for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::HasSource => "has_source",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Link from a branch back to the branch feeding it
#[derive(Debug, Clone)]
struct Upstream {
    node: NodeId,
    origin_stub: ElementId,
}

/// The tree's pipeline on one node
#[derive(Debug, Clone)]
struct Branch {
    pipeline: PipelineId,
    /// Element carrying the stream inside the pipeline
    delivery: ElementId,
    upstream: Option<Upstream>,
    depth: usize,
    /// Tunnels leaving this branch
    fanout: usize,
}

#[derive(Debug, Clone)]
struct Sink {
    element: ElementId,
    node: NodeId,
}

/// Bookkeeping of one broadcast tree
#[derive(Debug, Clone)]
pub struct Tree {
    id: TreeId,
    state: TreeState,
    master: Option<ElementId>,
    source_node: Option<NodeId>,
    branches: BTreeMap<NodeId, Branch>,
    sinks: BTreeMap<ViewerId, Sink>,
}

impl Tree {
    #[must_use]
    pub const fn new(id: TreeId) -> Self {
        Self {
            id,
            state: TreeState::Empty,
            master: None,
            source_node: None,
            branches: BTreeMap::new(),
            sinks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TreeId {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> TreeState {
        self.state
    }

    #[must_use]
    pub const fn master(&self) -> Option<ElementId> {
        self.master
    }

    #[must_use]
    pub const fn source_node(&self) -> Option<&NodeId> {
        self.source_node.as_ref()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &ViewerId> {
        self.sinks.keys()
    }

    #[must_use]
    pub fn viewer_node(&self, viewer: &ViewerId) -> Option<&NodeId> {
        self.sinks.get(viewer).map(|s| &s.node)
    }

    #[must_use]
    pub fn viewer_element(&self, viewer: &ViewerId) -> Option<ElementId> {
        self.sinks.get(viewer).map(|s| s.element)
    }

    /// Nodes the tree currently spans
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.branches.keys()
    }

    /// Number of tunnel pairs in the tree
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.branches.values().filter(|b| b.upstream.is_some()).count()
    }

    /// Chain of nodes the stream crosses from the master to `viewer`
    #[must_use]
    pub fn route(&self, graph: &MediaGraph, viewer: &ViewerId) -> Option<Vec<NodeId>> {
        let master = self.master?;
        let element = graph.element(self.sinks.get(viewer)?.element)?;
        let mut route = vec![element.node.clone()];
        let mut cursor = element.source()?;
        for _ in 0..=graph.element_count() {
            if cursor == master {
                route.reverse();
                return Some(route);
            }
            let destination = graph.element(cursor)?;
            let origin = graph.element(destination.peer()?)?;
            route.push(origin.node.clone());
            cursor = origin.source()?;
        }
        None
    }

    fn require(&self, allowed: &[TreeState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition(format!(
                "cannot {operation} on tree {} in state {}",
                self.id, self.state
            )))
        }
    }

    /// Branch a new node should hang from
    ///
    /// Without a fan-out limit every branch hangs from the source. With one,
    /// the shallowest branch with spare fan-out is used.
    fn origin_for_new_branch(&self, relay_fanout: usize) -> Result<NodeId> {
        let source = self
            .source_node
            .clone()
            .ok_or_else(|| Error::InvalidTransition(format!("tree {} has no source", self.id)))?;
        if relay_fanout == 0 {
            return Ok(source);
        }
        self.branches
            .iter()
            .filter(|(_, b)| b.fanout < relay_fanout)
            .min_by_key(|(_, b)| (b.depth, b.pipeline))
            .map(|(node, _)| node.clone())
            .ok_or_else(|| Error::NoCapacity(format!("tree {} has no branch with spare fan-out", self.id)))
    }

    /// Connect a new viewer endpoint on `node`, opening a branch there if needed
    fn attach_viewer(
        &mut self,
        txn: &mut Transaction<'_>,
        node: &NodeId,
        relay_fanout: usize,
    ) -> Result<ElementId> {
        if !self.branches.contains_key(node) {
            let origin = self.origin_for_new_branch(relay_fanout)?;
            let parent = self
                .branches
                .get_mut(&origin)
                .ok_or_else(|| Error::InvalidTopology(format!("tree {} lost branch {origin}", self.id)))?;

            let pipeline = txn.create_pipeline(node, &self.id)?;
            let (origin_stub, destination_stub) = txn.create_tunnel_pair(parent.pipeline, pipeline)?;
            txn.connect(parent.delivery, origin_stub)?;
            parent.fanout += 1;
            let depth = parent.depth + 1;

            debug!(tree_id = %self.id, from = %origin, to = %node, depth, "Opened tunnel");
            self.branches.insert(
                node.clone(),
                Branch {
                    pipeline,
                    delivery: destination_stub,
                    upstream: Some(Upstream {
                        node: origin,
                        origin_stub,
                    }),
                    depth,
                    fanout: 0,
                },
            );
        }

        let (pipeline, delivery) = self
            .branches
            .get(node)
            .map(|b| (b.pipeline, b.delivery))
            .ok_or_else(|| Error::InvalidTopology(format!("tree {} has no branch on {node}", self.id)))?;
        let viewer = txn.create_endpoint(pipeline)?;
        txn.connect(delivery, viewer)?;
        Ok(viewer)
    }

    /// Drop starved branches walking up from `node`
    ///
    /// Stops at the source branch or at the first branch whose delivery
    /// element still feeds something. Returns the number of tunnels removed.
    fn prune_from(&mut self, txn: &mut Transaction<'_>, node: &NodeId) -> Result<usize> {
        let mut pruned = 0;
        let mut cursor = node.clone();
        loop {
            let Some(branch) = self.branches.get(&cursor) else {
                break;
            };
            let Some(upstream) = branch.upstream.clone() else {
                break;
            };
            let still_feeding = txn
                .graph()
                .element(branch.delivery)
                .map_or(0, Element::sink_count);
            if still_feeding > 0 {
                break;
            }

            // Releasing the destination stub takes the origin stub and the
            // now empty pipeline with it
            txn.release_element(branch.delivery)?;
            self.branches.remove(&cursor);
            if let Some(parent) = self.branches.get_mut(&upstream.node) {
                parent.fanout = parent.fanout.saturating_sub(1);
            }
            debug!(
                tree_id = %self.id,
                node_id = %cursor,
                origin_stub = %upstream.origin_stub,
                "Pruned tunnel"
            );
            pruned += 1;
            cursor = upstream.node;
        }
        Ok(pruned)
    }
}

/// Remote objects created while replaying a journal
enum Created {
    Pipeline(String),
    Element(String),
}

/// Builds and maintains broadcast trees on top of the cluster
pub struct TreeSynthesizer {
    membership: Arc<ClusterMembership>,
    driver: Arc<dyn MediaDriver>,
    relay_fanout: usize,
}

impl TreeSynthesizer {
    pub fn new(membership: Arc<ClusterMembership>, driver: Arc<dyn MediaDriver>) -> Self {
        Self {
            membership,
            driver,
            relay_fanout: 0,
        }
    }

    /// Limit the tunnels leaving each branch (0 = unlimited, star topology)
    #[must_use]
    pub const fn with_relay_fanout(mut self, relay_fanout: usize) -> Self {
        self.relay_fanout = relay_fanout;
        self
    }

    #[must_use]
    pub const fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Place the tree's master endpoint; returns the SDP answer
    pub async fn create_source(&self, tree: &mut Tree, offer: &str) -> Result<String> {
        tree.require(&[TreeState::Empty], "set a source")?;

        let before = tree.clone();
        let mut journal = Journal::default();
        let tree_id = tree.id.clone();
        let placed = self
            .membership
            .place(|graph, node| {
                let mut txn = Transaction::new(graph, &mut journal);
                let pipeline = txn.create_pipeline(node, &tree_id)?;
                let master = txn.create_endpoint(pipeline)?;
                Ok((pipeline, master))
            })
            .await;
        let (node, (pipeline, master)) = match placed {
            Ok(placed) => placed,
            Err(e) => return Err(self.abort(tree, before, journal, e)),
        };

        tree.master = Some(master);
        tree.source_node = Some(node.clone());
        tree.branches.insert(
            node.clone(),
            Branch {
                pipeline,
                delivery: master,
                upstream: None,
                depth: 0,
                fanout: 0,
            },
        );

        let answer = match self.realize(&journal, Some(offer)).await {
            Ok(answer) => answer.unwrap_or_default(),
            Err(e) => return Err(self.abort(tree, before, journal, e)),
        };
        tree.state = TreeState::HasSource;
        info!(tree_id = %tree.id, node_id = %node, "Tree source placed");
        Ok(answer)
    }

    /// Attach a viewer; returns the SDP answer
    pub async fn add_sink(&self, tree: &mut Tree, viewer: ViewerId, offer: &str) -> Result<String> {
        tree.require(&[TreeState::HasSource, TreeState::Active], "add a sink")?;
        if tree.sinks.contains_key(&viewer) {
            return Err(Error::AlreadyExists(format!(
                "viewer {viewer} in tree {}",
                tree.id
            )));
        }

        let before = tree.clone();
        let mut journal = Journal::default();
        let relay_fanout = self.relay_fanout;
        let placed = self
            .membership
            .place(|graph, node| {
                let mut txn = Transaction::new(graph, &mut journal);
                tree.attach_viewer(&mut txn, node, relay_fanout)
            })
            .await;
        let (node, element) = match placed {
            Ok(placed) => placed,
            Err(e) => return Err(self.abort(tree, before, journal, e)),
        };
        tree.sinks.insert(
            viewer.clone(),
            Sink {
                element,
                node: node.clone(),
            },
        );

        let answer = match self.realize(&journal, Some(offer)).await {
            Ok(answer) => answer.unwrap_or_default(),
            Err(e) => return Err(self.abort(tree, before, journal, e)),
        };
        tree.state = TreeState::Active;
        info!(
            tree_id = %tree.id,
            viewer_id = %viewer,
            node_id = %node,
            viewers = tree.sinks.len(),
            tunnels = tree.tunnel_count(),
            "Viewer joined tree"
        );
        Ok(answer)
    }

    /// Detach a viewer and prune tunnels that no longer feed anyone
    pub async fn remove_sink(&self, tree: &mut Tree, viewer: &ViewerId) -> Result<()> {
        tree.require(&[TreeState::HasSource, TreeState::Active], "remove a sink")?;
        let sink = tree
            .sinks
            .get(viewer)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("viewer {viewer} in tree {}", tree.id)))?;

        let pruned = self
            .remove_with(tree, |tree, txn| {
                txn.release_element(sink.element)?;
                let pruned = tree.prune_from(txn, &sink.node)?;
                tree.sinks.remove(viewer);
                Ok(pruned)
            })
            .await?;
        if tree.sinks.is_empty() {
            tree.state = TreeState::HasSource;
        }
        info!(
            tree_id = %tree.id,
            viewer_id = %viewer,
            pruned_tunnels = pruned,
            viewers = tree.sinks.len(),
            "Viewer left tree"
        );
        Ok(())
    }

    /// Tear the whole tree down; the tree ends up closed
    pub async fn remove_source(&self, tree: &mut Tree) -> Result<()> {
        tree.require(
            &[TreeState::Empty, TreeState::HasSource, TreeState::Active],
            "release",
        )?;
        if tree.state == TreeState::Empty {
            tree.state = TreeState::Closed;
            info!(tree_id = %tree.id, "Released tree without source");
            return Ok(());
        }

        let viewers = tree.sinks.len();
        self.remove_with(tree, |tree, txn| {
            // Deepest branches first, so each tunnel goes from its far end
            let mut branches: Vec<(usize, PipelineId)> =
                tree.branches.values().map(|b| (b.depth, b.pipeline)).collect();
            branches.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, pipeline) in branches {
                txn.teardown_pipeline(pipeline)?;
            }
            tree.branches.clear();
            tree.sinks.clear();
            tree.master = None;
            Ok(())
        })
        .await?;
        tree.state = TreeState::Closed;
        info!(tree_id = %tree.id, viewers, "Tree released");
        Ok(())
    }

    /// Run a removal against the media nodes first and commit it afterwards
    ///
    /// `change` is applied once to plan the removal and undone under the
    /// same lock, so the capacity it frees stays counted until every remote
    /// object is gone. Remote objects released before a failure lose their
    /// handle; a retry skips them and finishes the rest. `change` is applied
    /// again to commit.
    async fn remove_with<T>(
        &self,
        tree: &mut Tree,
        change: impl Fn(&mut Tree, &mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut scratch = tree.clone();
        let plan = self.membership.write(|graph| {
            let mut journal = Journal::default();
            let planned = change(&mut scratch, &mut Transaction::new(graph, &mut journal));
            let plan = journal.clone();
            journal.rollback(graph);
            planned.map(|_| plan)
        })?;

        for step in plan.changes() {
            if let Err(e) = self.retire(step).await {
                warn!(tree_id = %tree.id, error = %e, "Remote teardown interrupted");
                return Err(e);
            }
        }

        let before = tree.clone();
        let mut journal = Journal::default();
        let committed = self
            .membership
            .write(|graph| change(tree, &mut Transaction::new(graph, &mut journal)));
        committed.map_err(|e| self.abort(tree, before, journal, e))
    }

    /// Mirror one removal step onto the media nodes
    ///
    /// Elements and pipelines without a handle were already released.
    async fn retire(&self, change: &Change) -> Result<()> {
        match change {
            Change::Disconnected { target, .. } => {
                if let Some(handle) = self.live_element_handle(*target) {
                    self.driver
                        .disconnect(&handle)
                        .await
                        .map_err(|e| remote("disconnect", &e))?;
                }
            }
            Change::ElementRemoved(element) => {
                if let Some(handle) = self.live_element_handle(element.id) {
                    self.driver
                        .release(&handle)
                        .await
                        .map_err(|e| remote("release", &e))?;
                    self.membership
                        .write(|graph| graph.clear_element_remote(element.id));
                }
            }
            Change::PipelineRemoved(pipeline) => {
                let handle = self
                    .membership
                    .read(|graph| graph.pipeline(pipeline.id).and_then(|p| p.remote.clone()));
                if let Some(handle) = handle {
                    self.driver
                        .release_pipeline(&handle)
                        .await
                        .map_err(|e| remote("release_pipeline", &e))?;
                    self.membership
                        .write(|graph| graph.clear_pipeline_remote(pipeline.id));
                }
            }
            Change::PipelineCreated(_) | Change::ElementCreated(_) | Change::Connected { .. } => {}
        }
        Ok(())
    }

    /// Undo local changes and hand back the error
    fn abort(&self, tree: &mut Tree, before: Tree, journal: Journal, error: Error) -> Error {
        if !journal.is_empty() {
            self.membership.write(|graph| journal.rollback(graph));
        }
        *tree = before;
        warn!(tree_id = %tree.id, error = %error, "Tree operation rolled back");
        error
    }

    /// Mirror a journal onto the media nodes
    ///
    /// On failure every object created remotely during this call is released
    /// again before the error is returned.
    async fn realize(&self, journal: &Journal, offer: Option<&str>) -> Result<Option<String>> {
        let mut created = Vec::new();
        match self.replay(journal, offer, &mut created).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.compensate(created).await;
                Err(e)
            }
        }
    }

    async fn replay(
        &self,
        journal: &Journal,
        offer: Option<&str>,
        created: &mut Vec<Created>,
    ) -> Result<Option<String>> {
        let mut answer = None;
        for change in journal.changes() {
            match change {
                Change::PipelineCreated(id) => {
                    let (node, address) = self.membership.read(|graph| {
                        let pipeline = graph.pipeline(*id)?;
                        let node = graph.node(&pipeline.node)?;
                        Some((node.id.clone(), node.address.clone()))
                    })
                    .ok_or_else(|| missing(format!("{id}")))?;
                    let handle = self
                        .driver
                        .create_pipeline(&node, &address)
                        .await
                        .map_err(|e| remote("create_pipeline", &e))?;
                    created.push(Created::Pipeline(handle.clone()));
                    self.membership.write(|graph| graph.set_pipeline_remote(*id, handle))?;
                }
                Change::ElementCreated(id) => {
                    let Some((kind, pipeline)) = self.membership.read(|graph| {
                        let element = graph.element(*id)?;
                        if element.remote.is_some() {
                            return None;
                        }
                        Some((element.kind, element.pipeline))
                    }) else {
                        // Second half of a tunnel pair created together with its peer
                        continue;
                    };
                    match kind {
                        ElementKind::Endpoint => {
                            let pipeline = self.pipeline_handle(pipeline)?;
                            let (handle, sdp) = self
                                .driver
                                .create_endpoint(&pipeline, offer.unwrap_or_default())
                                .await
                                .map_err(|e| remote("create_endpoint", &e))?;
                            created.push(Created::Element(handle.clone()));
                            self.membership.write(|graph| graph.set_element_remote(*id, handle))?;
                            answer = Some(sdp);
                        }
                        ElementKind::TunnelStub { peer, end } => {
                            let peer_pipeline = self
                                .membership
                                .read(|graph| graph.element(peer).map(|e| e.pipeline))
                                .ok_or_else(|| missing(format!("{peer}")))?;
                            let ((origin, origin_pipeline), (destination, destination_pipeline)) =
                                match end {
                                    TunnelEnd::Origin => ((*id, pipeline), (peer, peer_pipeline)),
                                    TunnelEnd::Destination => ((peer, peer_pipeline), (*id, pipeline)),
                                };
                            let (a, b) = self
                                .driver
                                .create_tunnel_pair(
                                    &self.pipeline_handle(origin_pipeline)?,
                                    &self.pipeline_handle(destination_pipeline)?,
                                )
                                .await
                                .map_err(|e| remote("create_tunnel_pair", &e))?;
                            created.push(Created::Element(a.clone()));
                            created.push(Created::Element(b.clone()));
                            self.membership.write(|graph| {
                                graph.set_element_remote(origin, a)?;
                                graph.set_element_remote(destination, b)
                            })?;
                        }
                    }
                }
                Change::Connected { source, target } => {
                    let source = self.element_handle(*source)?;
                    let target = self.element_handle(*target)?;
                    self.driver
                        .connect(&source, &target)
                        .await
                        .map_err(|e| remote("connect", &e))?;
                }
                // Removals go through `remove_with`
                Change::Disconnected { .. }
                | Change::ElementRemoved(_)
                | Change::PipelineRemoved(_) => {}
            }
        }
        Ok(answer)
    }

    async fn compensate(&self, created: Vec<Created>) {
        for object in created.into_iter().rev() {
            let (outcome, handle) = match &object {
                Created::Element(h) => (self.driver.release(h).await, h),
                Created::Pipeline(h) => (self.driver.release_pipeline(h).await, h),
            };
            if let Err(e) = outcome {
                warn!(handle = %handle, error = %e, "Failed to release remote object during rollback");
            }
        }
    }

    fn pipeline_handle(&self, id: PipelineId) -> Result<String> {
        self.membership
            .read(|graph| graph.pipeline(id).and_then(|p| p.remote.clone()))
            .ok_or_else(|| missing(format!("{id}")))
    }

    fn live_element_handle(&self, id: ElementId) -> Option<String> {
        self.membership
            .read(|graph| graph.element(id).and_then(|e| e.remote.clone()))
    }

    fn element_handle(&self, id: ElementId) -> Result<String> {
        self.live_element_handle(id)
            .ok_or_else(|| missing(format!("{id}")))
    }
}

fn remote(operation: &str, error: &anyhow::Error) -> Error {
    Error::RemoteOperationFailed(format!("{operation}: {error}"))
}

fn missing(what: String) -> Error {
    Error::RemoteOperationFailed(format!("{what} has no remote counterpart"))
}
