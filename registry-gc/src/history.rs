//! History reporter: the descendant history of a single layer, in
//! topological order, enriched with per-node metadata fetched from the
//! registry.

use crate::errors::GcError;
use crate::registry::RegistryDriver;
use layergraph::LayerGraph;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: String,
    pub command: Option<String>,
    pub size: u64,
    #[serde(rename = "ref")]
    pub ref_count: u32,
    pub tags: Vec<String>,
    pub created: String,
}

/// Builds the history of `source`: every node reachable by a DFS from it,
/// in topological order, with metadata fetched per node. Read-only; any
/// fetch failure aborts the whole report.
pub async fn history(
    driver: &RegistryDriver,
    graph: &LayerGraph,
    source: &str,
) -> Result<Vec<HistoryRecord>, GcError> {
    let tree = graph.dfs_tree(source)?;
    let order = tree.topo_sort(None)?;

    let mut records = Vec::with_capacity(order.len());
    for id in order {
        let node = graph
            .node(&id)
            .expect("topo_sort only returns ids present in the graph");
        let info = driver.get_image_info(&id).await?;
        records.push(HistoryRecord {
            id,
            command: info.container_config.cmd.map(|cmd| cmd.join(" ")),
            size: info.size,
            ref_count: node.ref_count,
            tags: node.tags.clone(),
            created: info.created,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_record_serializes_ref_under_its_wire_name() {
        let record = HistoryRecord {
            id: "a".to_string(),
            command: Some("/bin/sh -c true".to_string()),
            size: 10,
            ref_count: 2,
            tags: vec!["repo:latest".to_string()],
            created: "2020-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"ref\":2"));
        assert!(!json.contains("ref_count"));
    }
}
