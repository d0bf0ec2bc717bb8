//! Media driver: the collaborator that instructs real media nodes
//!
//! The tree layer never talks to a media server directly. It applies its
//! changes to the in-memory graph first and then replays them through a
//! [`MediaDriver`]. Handles returned by the driver are opaque strings.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::types::NodeId;

/// Transport-agnostic remote control of media nodes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDriver: Send + Sync {
    /// Create a pipeline on the node reachable at `address`
    async fn create_pipeline(&self, node: &NodeId, address: &str) -> anyhow::Result<String>;

    /// Create an endpoint and negotiate `offer`; returns `(handle, answer)`
    async fn create_endpoint(&self, pipeline: &str, offer: &str) -> anyhow::Result<(String, String)>;

    /// Create two linked tunnel stubs; returns their handles in argument order
    async fn create_tunnel_pair(
        &self,
        origin: &str,
        destination: &str,
    ) -> anyhow::Result<(String, String)>;

    async fn connect(&self, source: &str, target: &str) -> anyhow::Result<()>;

    async fn disconnect(&self, element: &str) -> anyhow::Result<()>;

    async fn release(&self, element: &str) -> anyhow::Result<()>;

    async fn release_pipeline(&self, pipeline: &str) -> anyhow::Result<()>;
}

/// Driver operations, used for failure injection and call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    CreatePipeline,
    CreateEndpoint,
    CreateTunnelPair,
    Connect,
    Disconnect,
    Release,
    ReleasePipeline,
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_handle: u64,
    pipelines: HashSet<String>,
    /// element handle -> owning pipeline handle
    elements: HashMap<String, String>,
    /// target handle -> source handle
    links: HashMap<String, String>,
    pending_failures: HashMap<DriverOp, usize>,
    calls: HashMap<DriverOp, usize>,
}

impl LoopbackState {
    fn enter(&mut self, op: DriverOp) -> anyhow::Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(remaining) = self.pending_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("injected {op:?} failure");
            }
        }
        Ok(())
    }

    fn handle(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{prefix}-{}", self.next_handle)
    }

    fn element(&mut self, pipeline: &str) -> anyhow::Result<String> {
        if !self.pipelines.contains(pipeline) {
            anyhow::bail!("no such pipeline {pipeline}");
        }
        let handle = self.handle("el");
        self.elements.insert(handle.clone(), pipeline.to_string());
        Ok(handle)
    }

    fn require_element(&self, element: &str) -> anyhow::Result<()> {
        if self.elements.contains_key(element) {
            Ok(())
        } else {
            anyhow::bail!("no such element {element}")
        }
    }

    fn drop_element(&mut self, element: &str) {
        self.elements.remove(element);
        self.links.remove(element);
        self.links.retain(|_, source| source != element);
    }
}

/// In-process media driver
///
/// Keeps a mirror of the remote objects it was asked to create so tests and
/// simulations can check that local and remote state agree. Failures can be
/// injected per operation.
#[derive(Debug, Default)]
pub struct LoopbackDriver {
    state: Mutex<LoopbackState>,
}

impl LoopbackDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `op` fail
    pub fn fail_next(&self, op: DriverOp, count: usize) {
        self.state.lock().pending_failures.insert(op, count);
    }

    #[must_use]
    pub fn calls(&self, op: DriverOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    #[must_use]
    pub fn live_elements(&self) -> usize {
        self.state.lock().elements.len()
    }

    #[must_use]
    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }
}

#[async_trait]
impl MediaDriver for LoopbackDriver {
    async fn create_pipeline(&self, node: &NodeId, address: &str) -> anyhow::Result<String> {
        let mut state = self.state.lock();
        state.enter(DriverOp::CreatePipeline)?;
        let handle = state.handle("mp");
        state.pipelines.insert(handle.clone());
        trace!(node_id = %node, address, handle = %handle, "Loopback pipeline created");
        Ok(handle)
    }

    async fn create_endpoint(&self, pipeline: &str, offer: &str) -> anyhow::Result<(String, String)> {
        let mut state = self.state.lock();
        state.enter(DriverOp::CreateEndpoint)?;
        let handle = state.element(pipeline)?;
        let answer = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns={handle}\r\nt=0 0\r\na=offer-bytes:{}\r\n",
            state.next_handle,
            offer.len()
        );
        Ok((handle, answer))
    }

    async fn create_tunnel_pair(
        &self,
        origin: &str,
        destination: &str,
    ) -> anyhow::Result<(String, String)> {
        let mut state = self.state.lock();
        state.enter(DriverOp::CreateTunnelPair)?;
        if !state.pipelines.contains(destination) {
            anyhow::bail!("no such pipeline {destination}");
        }
        let a = state.element(origin)?;
        let b = state.element(destination)?;
        Ok((a, b))
    }

    async fn connect(&self, source: &str, target: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.enter(DriverOp::Connect)?;
        state.require_element(source)?;
        state.require_element(target)?;
        state.links.insert(target.to_string(), source.to_string());
        Ok(())
    }

    async fn disconnect(&self, element: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.enter(DriverOp::Disconnect)?;
        state.require_element(element)?;
        state.links.remove(element);
        Ok(())
    }

    async fn release(&self, element: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.enter(DriverOp::Release)?;
        state.require_element(element)?;
        state.drop_element(element);
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.enter(DriverOp::ReleasePipeline)?;
        if !state.pipelines.remove(pipeline) {
            anyhow::bail!("no such pipeline {pipeline}");
        }
        let owned: Vec<String> = state
            .elements
            .iter()
            .filter(|(_, p)| p.as_str() == pipeline)
            .map(|(e, _)| e.clone())
            .collect();
        for element in owned {
            state.drop_element(&element);
        }
        Ok(())
    }
}
