//! The layer graph: a directed graph of image layers annotated with tag and
//! repository references.
//!
//! An edge points from a layer to its parent, the same direction the
//! registry's ancestry listing walks (head first, root last). Reachability
//! is computed by depth-first traversal starting at a tag's head layer and
//! following edges outward to its ancestors.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::GraphError;

/// A single layer node and its annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(rename = "ref", default)]
    pub ref_count: u32,
}

impl Node {
    fn new(id: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            tags: Vec::new(),
            repos: Vec::new(),
            ref_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    graph: DiGraph<Node, ()>,
    index: HashMap<String, NodeIndex>,
}

#[derive(Serialize, Deserialize)]
struct Link {
    source: String,
    target: String,
}

#[derive(Serialize, Deserialize)]
struct NodeLinkDoc {
    directed: bool,
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Insert a node with default attributes if it is not already present.
    /// Idempotent: existing annotations are preserved.
    pub fn add_node(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(Node::new(id));
        self.index.insert(id.to_string(), idx);
        idx
    }

    /// Add every missing node along `ids` and an edge between each
    /// consecutive pair. Multi-edges collapse: re-adding the same path is a
    /// no-op on the edge set.
    pub fn add_path(&mut self, ids: &[String]) {
        let mut nodes = ids.iter();
        let first = match nodes.next() {
            Some(id) => id,
            None => return,
        };
        let mut prev = self.add_node(first);
        for id in nodes {
            let cur = self.add_node(id);
            if self.graph.find_edge(prev, cur).is_none() {
                self.graph.add_edge(prev, cur, ());
            }
            prev = cur;
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        let idx = *self.index.get(id)?;
        Some(&mut self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Preorder depth-first traversal starting at `source`, following
    /// edges outward (towards parents).
    pub fn dfs(&self, source: &str) -> Result<Vec<String>, GraphError> {
        let start = *self
            .index
            .get(source)
            .ok_or_else(|| GraphError::NodeNotFound {
                id: source.to_string(),
            })?;
        let mut visitor = Dfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(idx) = visitor.next(&self.graph) {
            out.push(self.graph[idx].id.clone());
        }
        Ok(out)
    }

    /// The subgraph induced by a DFS from `source`: the visited nodes and
    /// every edge between two visited nodes.
    pub fn dfs_tree(&self, source: &str) -> Result<LayerGraph, GraphError> {
        let visited: HashSet<String> = self.dfs(source)?.into_iter().collect();
        let mut sub = LayerGraph::new();
        for id in &visited {
            let node = self.node(id).expect("dfs only visits existing nodes");
            sub.add_node(id);
            *sub.node_mut(id).expect("just inserted") = node.clone();
        }
        for edge in self.graph.edge_references() {
            let src = &self.graph[edge.source()].id;
            let dst = &self.graph[edge.target()].id;
            if visited.contains(src) && visited.contains(dst) {
                let s = sub.add_node(src);
                let d = sub.add_node(dst);
                if sub.graph.find_edge(s, d).is_none() {
                    sub.graph.add_edge(s, d, ());
                }
            }
        }
        Ok(sub)
    }

    /// Topological order of the whole graph, restricted to `subset` if
    /// given. Stable across runs of the same graph: ties among nodes that
    /// become ready simultaneously break lexicographically by id.
    pub fn topo_sort(&self, subset: Option<&HashSet<String>>) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.get_mut(&edge.target()).expect("target indexed above") += 1;
        }

        let mut ready: BTreeSet<(String, NodeIndex)> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&idx, _)| (self.graph[idx].id.clone(), idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(&next);
            let (id, idx) = next;
            order.push(id);
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                let deg = in_degree.get_mut(&target).expect("target indexed above");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert((self.graph[target].id.clone(), target));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(GraphError::CycleDetected);
        }

        Ok(match subset {
            Some(subset) => order.into_iter().filter(|id| subset.contains(id)).collect(),
            None => order,
        })
    }

    /// Serialize to the node-link JSON format (pretty-printed).
    pub fn to_json(&self) -> Result<String, GraphError> {
        let nodes: Vec<Node> = self.graph.node_weights().cloned().collect();
        let links: Vec<Link> = self
            .graph
            .edge_references()
            .map(|edge| Link {
                source: self.graph[edge.source()].id.clone(),
                target: self.graph[edge.target()].id.clone(),
            })
            .collect();
        let doc = NodeLinkDoc {
            directed: true,
            nodes,
            links,
        };
        serde_json::to_string_pretty(&doc).map_err(|e| GraphError::Serde(e.to_string()))
    }

    /// Deserialize from the node-link JSON format.
    pub fn from_json(data: &str) -> Result<LayerGraph, GraphError> {
        let doc: NodeLinkDoc =
            serde_json::from_str(data).map_err(|e| GraphError::Serde(e.to_string()))?;
        let mut g = LayerGraph::new();
        for node in doc.nodes {
            let id = node.id.clone();
            g.add_node(&id);
            *g.node_mut(&id).expect("just inserted") = node;
        }
        for link in doc.links {
            let s = g.add_node(&link.source);
            let t = g.add_node(&link.target);
            if g.graph.find_edge(s, t).is_none() {
                g.graph.add_edge(s, t, ());
            }
        }
        Ok(g)
    }
}

impl PartialEq for LayerGraph {
    fn eq(&self, other: &Self) -> bool {
        let mut a_nodes: Vec<&Node> = self.graph.node_weights().collect();
        let mut b_nodes: Vec<&Node> = other.graph.node_weights().collect();
        a_nodes.sort_by(|x, y| x.id.cmp(&y.id));
        b_nodes.sort_by(|x, y| x.id.cmp(&y.id));
        if a_nodes != b_nodes {
            return false;
        }

        let mut a_edges: Vec<(String, String)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].id.clone(),
                    self.graph[e.target()].id.clone(),
                )
            })
            .collect();
        let mut b_edges: Vec<(String, String)> = other
            .graph
            .edge_references()
            .map(|e| {
                (
                    other.graph[e.source()].id.clone(),
                    other.graph[e.target()].id.clone(),
                )
            })
            .collect();
        a_edges.sort();
        b_edges.sort();
        a_edges == b_edges
    }
}
