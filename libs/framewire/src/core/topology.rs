//! Topology snapshots of the node graph.
//!
//! Built on demand from the live graph for visualization, debugging, and
//! validation. Separate from the broadcast path so inspection never costs
//! the pipeline anything. Snapshots export to GraphViz DOT and JSON.

use serde::Serialize;

use crate::core::graph::{Graph, NodeHandle};

/// Point-in-time picture of the graph's nodes and edges.
#[derive(Debug, Clone, Serialize)]
pub struct GraphTopology {
    pub nodes: Vec<NodeInfo>,
    pub edges: Vec<EdgeInfo>,
}

/// One registered node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Stable display id, e.g. `relay#3`.
    pub id: String,
    pub handle: NodeHandle,
    /// Node kind label (`type_name`).
    pub kind: String,
    /// Occupied input slots, ascending. Empty for pure sources.
    pub input_slots: Vec<u32>,
    /// Attached downstream edges (live entries only).
    pub target_count: usize,
}

/// One live edge, source side to consumer slot.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
    pub slot: u32,
}

impl GraphTopology {
    /// Walk the live nodes and collect nodes plus source-side edges. Edges
    /// whose consumer has been removed are skipped, mirroring what the next
    /// broadcast would prune. Nodes currently mid-delivery are listed
    /// without detail.
    pub fn capture(graph: &Graph) -> Self {
        let live = graph.live_nodes();
        let display_id = |handle: NodeHandle, kind: &str| format!("{kind}#{}", handle.index());

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut kinds: Vec<(NodeHandle, String)> = Vec::new();

        for (handle, cell) in &live {
            let kind = cell
                .try_borrow()
                .map(|node| node.type_name().to_string())
                .unwrap_or_else(|_| "busy".to_string());
            kinds.push((*handle, kind));
        }
        let kind_of = |handle: NodeHandle| {
            kinds
                .iter()
                .find(|(h, _)| *h == handle)
                .map(|(_, k)| k.as_str())
                .unwrap_or("unknown")
        };

        for (handle, cell) in &live {
            let Ok(mut node) = cell.try_borrow_mut() else {
                nodes.push(NodeInfo {
                    id: display_id(*handle, "busy"),
                    handle: *handle,
                    kind: "busy".into(),
                    input_slots: Vec::new(),
                    target_count: 0,
                });
                continue;
            };
            let kind = node.type_name();
            let id = display_id(*handle, kind);

            let input_slots: Vec<u32> = node
                .as_consumer()
                .map(|c| c.source_slots_mut().occupied().map(|(slot, _)| slot).collect())
                .unwrap_or_default();

            let mut target_count = 0;
            if let Some(source) = node.as_source() {
                for entry in source.targets_mut().entries() {
                    if !graph.contains(entry.consumer) {
                        continue;
                    }
                    target_count += 1;
                    edges.push(EdgeInfo {
                        from: id.clone(),
                        to: display_id(entry.consumer, kind_of(entry.consumer)),
                        slot: entry.slot,
                    });
                }
            }

            nodes.push(NodeInfo {
                id,
                handle: *handle,
                kind: kind.to_string(),
                input_slots,
                target_count,
            });
        }

        Self { nodes, edges }
    }

    /// Export as GraphViz DOT, renderable with `dot -Tpng`.
    pub fn to_graphviz(&self) -> String {
        let mut dot = String::from("digraph FrameGraph {\n");
        dot.push_str("  rankdir=LR;\n");
        dot.push_str("  node [shape=box];\n\n");

        for node in &self.nodes {
            dot.push_str(&format!(
                "  \"{}\" [label=\"{}\\n({})\"];\n",
                node.id, node.id, node.kind
            ));
        }

        dot.push('\n');

        for edge in &self.edges {
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\" [label=\"slot {}\"];\n",
                edge.from, edge.to, edge.slot
            ));
        }

        dot.push_str("}\n");
        dot
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for GraphTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "nodes ({}):", self.nodes.len())?;
        for node in &self.nodes {
            writeln!(
                f,
                "  {} inputs={:?} targets={}",
                node.id, node.input_slots, node.target_count
            )?;
        }
        writeln!(f, "edges ({}):", self.edges.len())?;
        for edge in &self.edges {
            writeln!(f, "  {} -> {} [slot {}]", edge.from, edge.to, edge.slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::node::ExternalSource;
    use crate::core::relay::RelayNode;

    #[test]
    fn test_empty_graph_snapshot() {
        let graph = Graph::new(&EngineConfig::default());
        let topology = graph.topology();
        assert!(topology.nodes.is_empty());
        assert!(topology.edges.is_empty());
    }

    #[test]
    fn test_snapshot_of_simple_chain() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        graph.connect(source, relay, None);

        let topology = graph.topology();
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.edges.len(), 1);
        assert_eq!(topology.edges[0].slot, 0);
        assert!(topology.edges[0].from.starts_with("external_source#"));
        assert!(topology.edges[0].to.starts_with("relay#"));
    }

    #[test]
    fn test_dead_edges_skipped() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        graph.connect(source, relay, None);
        graph.remove_node(relay);

        let topology = graph.topology();
        assert_eq!(topology.nodes.len(), 1);
        assert!(topology.edges.is_empty());
    }

    #[test]
    fn test_graphviz_export() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        graph.connect(source, relay, None);

        let dot = graph.topology().to_graphviz();
        assert!(dot.contains("digraph FrameGraph"));
        assert!(dot.contains("->"));
        assert!(dot.contains("slot 0"));
    }

    #[test]
    fn test_json_export() {
        let graph = Graph::new(&EngineConfig::default());
        graph.add_node(ExternalSource::new());

        let json = graph.topology().to_json().unwrap();
        assert!(json.contains("external_source#"));
    }
}
