//! Two-pass bounded-concurrency scanner: ancestry import builds the graph,
//! repository/tag import annotates it and propagates the reachability
//! mark. Pass 2 never starts before pass 1's `JoinSet` has fully drained —
//! the DFS reachability walk in pass 2 is only correct against the
//! complete DAG.

use crate::errors::GcError;
use crate::registry::RegistryDriver;
use layergraph::LayerGraph;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A single item is dropped from its pass after this many consecutive
/// failed attempts, aborting the whole pass.
pub const MAX_ITEM_RETRIES: u32 = 5;

#[derive(Default)]
pub struct ScanStats {
    pub images_seen: AtomicU32,
    pub repositories_seen: AtomicU32,
}

enum AncestryOutcome {
    Done(String, Vec<String>),
    Failed(String),
}

/// Pass 1: for every enumerated image id, fetch its ancestry and insert
/// the resulting path into the graph. Workers only do the fetch; the
/// scan loop applies `add_node`/`add_path` as results arrive, so the
/// graph is mutated from a single place.
pub async fn import_ancestry(
    driver: &RegistryDriver,
    graph: &mut LayerGraph,
    concurrency: usize,
    stats: &ScanStats,
    cancel: &CancellationToken,
) -> Result<(), GcError> {
    let mut ids = Vec::new();
    driver.enumerate_images(|id| ids.push(id)).await?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut retries: HashMap<String, u32> = HashMap::new();
    let mut pending: Vec<String> = ids;

    while !pending.is_empty() {
        if cancel.is_cancelled() {
            debug!("ancestry import cancelled with {} images left unscanned", pending.len());
            break;
        }
        let mut join_set: JoinSet<AncestryOutcome> = JoinSet::new();
        for id in pending.drain(..) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let driver = driver.clone();
            join_set.spawn(async move {
                let _permit = permit;
                match driver.get_image_ancestry(&id).await {
                    Ok(ancestry) => AncestryOutcome::Done(id, ancestry),
                    Err(err) => {
                        debug!("ancestry fetch for {} failed: {}", id, err);
                        AncestryOutcome::Failed(id)
                    }
                }
            });
        }

        let mut retry_batch = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.map_err(|err| GcError::Transport(err.to_string()))?;
            match outcome {
                AncestryOutcome::Done(id, ancestry) => {
                    graph.add_node(&id);
                    if !ancestry.is_empty() && ancestry[0] != id {
                        warn!(
                            "ancestry for {} does not start with itself (got {}), inserting as-is",
                            id, ancestry[0]
                        );
                    }
                    graph.add_path(&ancestry);
                    stats.images_seen.fetch_add(1, Ordering::Relaxed);
                }
                AncestryOutcome::Failed(id) => {
                    let count = retries.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= MAX_ITEM_RETRIES {
                        return Err(GcError::Transport(format!(
                            "giving up on image {} after {} consecutive failures",
                            id, count
                        )));
                    }
                    retry_batch.push(id);
                }
            }
        }
        pending = retry_batch;
    }

    Ok(())
}

struct RepoImport {
    index: Vec<String>,
    tags: HashMap<String, String>,
}

async fn fetch_repo_import(driver: &RegistryDriver, repo: &str) -> Result<RepoImport, GcError> {
    let index = driver.get_repository_index(repo).await?;
    let tags = driver.get_repository_tags(repo).await?;
    Ok(RepoImport { index, tags })
}

/// Pass 2: annotate the graph with repository membership and tag
/// reachability. Each repository is claimed exactly once via `claimed`
/// before any mutation begins, so a re-enqueued repository (on failure)
/// never double-counts `ref`.
pub async fn import_repositories(
    driver: &RegistryDriver,
    graph: &mut LayerGraph,
    concurrency: usize,
    stats: &ScanStats,
    cancel: &CancellationToken,
) -> Result<(), GcError> {
    let mut repos = Vec::new();
    driver.enumerate_repositories(|repo| repos.push(repo)).await?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let claimed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut retries: HashMap<String, u32> = HashMap::new();
    let mut pending = repos;

    while !pending.is_empty() {
        if cancel.is_cancelled() {
            debug!("repository import cancelled with {} repositories left unscanned", pending.len());
            break;
        }
        let mut join_set: JoinSet<(String, Result<RepoImport, GcError>)> = JoinSet::new();
        for repo in pending.drain(..) {
            {
                let mut guard = claimed.lock().expect("claimed set poisoned");
                if !guard.insert(repo.clone()) {
                    continue;
                }
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let driver = driver.clone();
            let repo_name = repo.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = fetch_repo_import(&driver, &repo_name).await;
                (repo_name, result)
            });
        }

        let mut retry_batch = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (repo, result) = joined.map_err(|err| GcError::Transport(err.to_string()))?;
            match result {
                Ok(import) => {
                    apply_repo_import(graph, &repo, import)?;
                    stats.repositories_seen.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    debug!("repository import for {} failed: {}", repo, err);
                    claimed.lock().expect("claimed set poisoned").remove(&repo);
                    let count = retries.entry(repo.clone()).or_insert(0);
                    *count += 1;
                    if *count >= MAX_ITEM_RETRIES {
                        return Err(GcError::Transport(format!(
                            "giving up on repository {} after {} consecutive failures",
                            repo, count
                        )));
                    }
                    retry_batch.push(repo);
                }
            }
        }
        pending = retry_batch;
    }

    Ok(())
}

fn apply_repo_import(graph: &mut LayerGraph, repo: &str, import: RepoImport) -> Result<(), GcError> {
    for id in import.index {
        match graph.node_mut(&id) {
            Some(node) => {
                if !node.repos.iter().any(|r| r == repo) {
                    node.repos.push(repo.to_string());
                }
            }
            None => warn!("repository {} indexes unknown layer {}, skipping", repo, id),
        }
    }

    for (tag, head) in import.tags {
        let label = format!("{}:{}", repo, tag);
        match graph.node_mut(&head) {
            Some(node) => {
                if !node.tags.iter().any(|t| t == &label) {
                    node.tags.push(label);
                }
            }
            None => {
                warn!("tag {} points at unknown head layer {}, skipping", label, head);
                continue;
            }
        }

        for id in graph.dfs(&head)? {
            if let Some(node) = graph.node_mut(&id) {
                node.ref_count += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_repo_import_annotates_repos_and_refs() {
        let mut graph = LayerGraph::new();
        graph.add_path(&["a".to_string(), "b".to_string(), "c".to_string()]);

        let mut tags = HashMap::new();
        tags.insert("latest".to_string(), "a".to_string());
        apply_repo_import(
            &mut graph,
            "myrepo",
            RepoImport {
                index: vec!["a".to_string(), "b".to_string()],
                tags,
            },
        )
        .unwrap();

        assert_eq!(graph.node("a").unwrap().tags, vec!["myrepo:latest".to_string()]);
        assert_eq!(graph.node("a").unwrap().ref_count, 1);
        assert_eq!(graph.node("b").unwrap().ref_count, 1);
        assert_eq!(graph.node("c").unwrap().ref_count, 1);
        assert!(graph.node("a").unwrap().repos.contains(&"myrepo".to_string()));
    }

    #[test]
    fn apply_repo_import_skips_unknown_layers_without_failing() {
        let mut graph = LayerGraph::new();
        graph.add_node("a");
        apply_repo_import(
            &mut graph,
            "myrepo",
            RepoImport {
                index: vec!["missing".to_string()],
                tags: HashMap::new(),
            },
        )
        .unwrap();
        assert_eq!(graph.node("a").unwrap().ref_count, 0);
    }

    #[test]
    fn apply_repo_import_is_safe_to_apply_twice_for_the_same_repo() {
        let mut graph = LayerGraph::new();
        graph.add_path(&["a".to_string()]);
        let mut tags = HashMap::new();
        tags.insert("latest".to_string(), "a".to_string());

        apply_repo_import(
            &mut graph,
            "myrepo",
            RepoImport {
                index: vec!["a".to_string()],
                tags: tags.clone(),
            },
        )
        .unwrap();
        apply_repo_import(
            &mut graph,
            "myrepo",
            RepoImport {
                index: vec!["a".to_string()],
                tags,
            },
        )
        .unwrap();

        // Re-applying the same repo+tag is what pass 2's "claimed" mark
        // exists to prevent at the scan level; the annotation step itself
        // is written so a duplicate apply double-counts ref (the claimed
        // mark is the actual idempotency guard, not this function).
        assert_eq!(graph.node("a").unwrap().ref_count, 2);
        assert_eq!(graph.node("a").unwrap().tags.len(), 1);
    }
}
