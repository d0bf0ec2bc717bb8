//! Read-only topology snapshots
//!
//! A snapshot is taken under the graph's read lock, so it is a consistent
//! point-in-time view even while trees keep changing. It serializes to JSON
//! and renders as a GraphViz document with one cluster per node and one
//! nested cluster per pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;

use crate::graph::{ElementKind, TunnelEnd};
use crate::membership::{ClusterMembership, NodeSummary};
use crate::types::{ElementId, NodeId, PipelineId, TreeId};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub id: PipelineId,
    pub node: NodeId,
    pub tree: TreeId,
    pub remote: Option<String>,
    pub elements: Vec<ElementId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElementSnapshot {
    pub id: ElementId,
    pub pipeline: PipelineId,
    pub node: NodeId,
    #[serde(flatten)]
    pub kind: ElementKind,
    pub remote: Option<String>,
    pub source: Option<ElementId>,
}

/// Media flowing from `source` into `target` inside one pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source: ElementId,
    pub target: ElementId,
}

/// Tunnel pair crossing from `origin` to `destination`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TunnelLink {
    pub origin: ElementId,
    pub destination: ElementId,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeSummary>,
    pub pipelines: Vec<PipelineSnapshot>,
    pub elements: Vec<ElementSnapshot>,
    pub edges: Vec<Edge>,
    pub tunnels: Vec<TunnelLink>,
}

impl TopologySnapshot {
    #[must_use]
    pub fn capture(membership: &ClusterMembership) -> Self {
        membership.read(|graph| {
            let pipelines = graph
                .pipelines()
                .map(|p| PipelineSnapshot {
                    id: p.id,
                    node: p.node.clone(),
                    tree: p.tree.clone(),
                    remote: p.remote.clone(),
                    elements: p.elements().collect(),
                })
                .collect();

            let mut elements = Vec::with_capacity(graph.element_count());
            let mut edges = Vec::new();
            let mut tunnels = Vec::new();
            for element in graph.elements() {
                elements.push(ElementSnapshot {
                    id: element.id,
                    pipeline: element.pipeline,
                    node: element.node.clone(),
                    kind: element.kind,
                    remote: element.remote.clone(),
                    source: element.source(),
                });
                edges.extend(element.sinks().map(|target| Edge {
                    source: element.id,
                    target,
                }));
                if let ElementKind::TunnelStub {
                    peer,
                    end: TunnelEnd::Origin,
                } = element.kind
                {
                    tunnels.push(TunnelLink {
                        origin: element.id,
                        destination: peer,
                    });
                }
            }

            Self {
                taken_at: Utc::now(),
                nodes: membership.summarize(graph),
                pipelines,
                elements,
                edges,
                tunnels,
            }
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// GraphViz rendering
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph relaytree {\n  compound=true;\n  rankdir=LR;\n");

        for (n, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(out, "  subgraph cluster_n{n} {{");
            let _ = writeln!(
                out,
                "    label=\"{} load={:.2}{}\";",
                escape(node.id.as_str()),
                node.load,
                if node.admits_more { "" } else { " (full)" }
            );
            for pipeline in self.pipelines.iter().filter(|p| p.node == node.id) {
                let _ = writeln!(out, "    subgraph \"cluster_{}\" {{", pipeline.id);
                let _ = writeln!(
                    out,
                    "      label=\"{} tree={}\";",
                    pipeline.id,
                    escape(pipeline.tree.as_str())
                );
                for id in &pipeline.elements {
                    let Some(element) = self.elements.iter().find(|e| e.id == *id) else {
                        continue;
                    };
                    let shape = match element.kind {
                        ElementKind::Endpoint => "ellipse",
                        ElementKind::TunnelStub { .. } => "box",
                    };
                    let _ = writeln!(out, "      \"{id}\" [shape={shape}];");
                }
                out.push_str("    }\n");
            }
            out.push_str("  }\n");
        }

        for edge in &self.edges {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", edge.source, edge.target);
        }
        for tunnel in &self.tunnels {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [style=dashed];",
                tunnel.origin, tunnel.destination
            );
        }
        out.push_str("}\n");
        out
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::WeightedPolicy;
    use crate::graph::Element;
    use crate::node::NodeSpec;
    use std::sync::Arc;

    fn two_node_tree() -> ClusterMembership {
        let membership = ClusterMembership::fixed(
            vec![NodeSpec::new("a", "ws://a"), NodeSpec::new("b", "ws://b")],
            Arc::new(WeightedPolicy::endpoints(4)),
        )
        .unwrap();
        membership.write(|graph| {
            let tree = TreeId::from("t");
            let pa = graph.create_pipeline(&NodeId::from("a"), &tree).unwrap();
            let pb = graph.create_pipeline(&NodeId::from("b"), &tree).unwrap();
            let master = graph.create_endpoint(pa).unwrap();
            let (origin, destination) = graph.create_tunnel_pair(pa, pb).unwrap();
            let viewer = graph.create_endpoint(pb).unwrap();
            graph.connect(master, origin).unwrap();
            graph.connect(destination, viewer).unwrap();
        });
        membership
    }

    #[test]
    fn test_capture_lists_edges_and_tunnels() {
        let membership = two_node_tree();
        let snapshot = TopologySnapshot::capture(&membership);

        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.pipelines.len(), 2);
        assert_eq!(snapshot.elements.len(), 4);
        assert_eq!(snapshot.edges.len(), 2);
        assert_eq!(snapshot.tunnels.len(), 1);

        let tunnel = snapshot.tunnels[0];
        let origin = snapshot.elements.iter().find(|e| e.id == tunnel.origin).unwrap();
        assert_eq!(origin.node.as_str(), "a");
        assert!(snapshot.edges.contains(&Edge {
            source: origin.source.unwrap(),
            target: origin.id,
        }));
    }

    #[test]
    fn test_tunnel_direction_follows_stub_end() {
        let membership = ClusterMembership::fixed(
            vec![NodeSpec::new("a", "ws://a"), NodeSpec::new("b", "ws://b")],
            Arc::new(WeightedPolicy::endpoints(4)),
        )
        .unwrap();
        let (origin, destination) = membership.write(|graph| {
            let tree = TreeId::from("t");
            let pa = graph.create_pipeline(&NodeId::from("a"), &tree).unwrap();
            let pb = graph.create_pipeline(&NodeId::from("b"), &tree).unwrap();
            // Destination half allocated first
            let destination = ElementId(graph.allocate_id());
            let origin = ElementId(graph.allocate_id());
            graph.insert_element(Element::new(
                destination,
                pb,
                NodeId::from("b"),
                ElementKind::TunnelStub {
                    peer: origin,
                    end: TunnelEnd::Destination,
                },
            ));
            graph.insert_element(Element::new(
                origin,
                pa,
                NodeId::from("a"),
                ElementKind::TunnelStub {
                    peer: destination,
                    end: TunnelEnd::Origin,
                },
            ));
            (origin, destination)
        });
        assert!(destination < origin);

        let snapshot = TopologySnapshot::capture(&membership);
        assert_eq!(snapshot.tunnels, vec![TunnelLink { origin, destination }]);
    }

    #[test]
    fn test_json_and_dot_rendering() {
        let snapshot = TopologySnapshot::capture(&two_node_tree());

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["elements"].as_array().unwrap().len(), 4);
        assert_eq!(json["elements"][0]["kind"], "endpoint");
        assert_eq!(json["nodes"][0]["population"]["endpoints"], 1);

        let dot = snapshot.to_dot();
        assert!(dot.starts_with("digraph relaytree {"));
        assert!(dot.contains("subgraph cluster_n0"));
        assert!(dot.contains("subgraph \"cluster_pipeline-"));
        assert!(dot.contains("[style=dashed]"));
        assert_eq!(dot.matches("->").count(), 3);
    }
}
