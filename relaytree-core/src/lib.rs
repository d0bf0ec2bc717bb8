//! relaytree core - broadcast tree placement across a media cluster
//!
//! Distributes one real-time media source to many viewers over a pool of
//! media nodes with finite capacity. For every join and leave it decides
//! which node hosts the new endpoint, whether an inter-node tunnel is needed,
//! when the cluster has to grow and which tunnels can be pruned.
//!
//! ## Architecture
//!
//! - **`MediaGraph`**: id-indexed arena of nodes, pipelines and elements
//! - **`AdmissionPolicy`**: per-node load and admission decision
//! - **`ClusterMembership`**: fixed or elastic node pool, owns the graph
//! - **`TreeSynthesizer`**: builds and prunes trees through a `MediaDriver`
//! - **`TreeService`**: tree registry and control surface
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaytree_core::{Config, LoopbackDriver, TreeService, ViewerId};
//!
//! let service = TreeService::from_config(&Config::default(), Arc::new(LoopbackDriver::new()))?;
//! let tree = service.create_tree();
//! let answer = service.set_tree_source(&tree, &offer).await?;
//! let answer = service.add_tree_sink(&tree, ViewerId::from("viewer-1"), &offer).await?;
//! ```

pub mod admission;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod logging;
pub mod membership;
pub mod node;
pub mod service;
pub mod snapshot;
pub mod tree;
pub mod types;

pub use admission::{AdmissionPolicy, UnlimitedPolicy, WeightedPolicy};
pub use config::Config;
pub use driver::{DriverOp, LoopbackDriver, MediaDriver};
pub use error::{Error, Result};
pub use graph::{Element, ElementKind, MediaGraph, TunnelEnd};
pub use membership::{ClusterMembership, NodeProvisioner, NodeSummary, StaticProvisioner, TieBreak};
pub use node::{NodeLoad, NodeSpec};
pub use service::{TreeService, TreeSummary};
pub use snapshot::TopologySnapshot;
pub use tree::{Tree, TreeState, TreeSynthesizer};
pub use types::{ElementId, NodeId, PipelineId, TreeId, ViewerId};
