//! Sweep engine: computes the unreferenced set, reconciles it against the
//! persisted "first seen unreferenced" timestamps, and emits the delete
//! candidate set — layers unreferenced for at least two sweeps spanning
//! the configured minimum age.

use crate::errors::GcError;
use chrono::{DateTime, Utc};
use layergraph::LayerGraph;
use log::info;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// A stub for the out-of-scope delete call: the sweep engine only ever
/// produces a candidate set, never deletes anything itself.
pub trait DeleteExecutor {
    fn delete(&self, layer_id: &str) -> Result<(), GcError>;
}

/// Does nothing; used by tests and by a caller that only wants the
/// candidate set printed, not acted on.
pub struct NoopExecutor;

impl DeleteExecutor for NoopExecutor {
    fn delete(&self, _layer_id: &str) -> Result<(), GcError> {
        Ok(())
    }
}

pub type SweepState = HashMap<String, DateTime<Utc>>;

pub fn load_sweep_state(path: &Path) -> Result<SweepState, GcError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(|err| GcError::Parse(err.to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SweepState::new()),
        Err(err) => {
            info!("treating unreadable sweep-state file {:?} as empty: {}", path, err);
            Ok(SweepState::new())
        }
    }
}

pub fn save_sweep_state(path: &Path, state: &SweepState) -> Result<(), GcError> {
    let json = serde_json::to_string_pretty(state).map_err(|err| GcError::Parse(err.to_string()))?;
    std::fs::write(path, json).map_err(GcError::from)
}

pub struct SweepResult {
    /// Delete candidates, ordered descendant-first (topological order of
    /// the full graph, restricted to the candidate set).
    pub candidates: Vec<String>,
    pub new_state: SweepState,
}

/// Runs one sweep: unreferenced set, reconcile against `previous`, emit
/// the expired candidate set. `now` is passed in rather than read from the
/// clock so the reconciliation logic stays a pure, testable function.
pub fn sweep(
    graph: &LayerGraph,
    previous: &SweepState,
    min_age: Duration,
    now: DateTime<Utc>,
) -> Result<SweepResult, GcError> {
    let unreferenced: HashSet<String> = graph
        .nodes()
        .filter(|node| node.ref_count < 1)
        .map(|node| node.id.clone())
        .collect();

    let ordered = graph.topo_sort(Some(&unreferenced))?;

    let mut current: SweepState = HashMap::new();
    for id in &ordered {
        let first_seen = previous.get(id).copied().unwrap_or(now);
        current.insert(id.clone(), first_seen);
    }

    let min_age = chrono::Duration::from_std(min_age)
        .map_err(|err| GcError::Config(format!("sweep age out of range: {}", err)))?;

    let mut expired = HashSet::new();
    for id in &ordered {
        if let Some(first_seen) = previous.get(id) {
            if current.contains_key(id) && (now - *first_seen) > min_age {
                expired.insert(id.clone());
            }
        }
    }

    let new_state: SweepState = current
        .into_iter()
        .filter(|(id, _)| !expired.contains(id))
        .collect();

    let candidates = ordered.into_iter().filter(|id| expired.contains(id)).collect();

    Ok(SweepResult {
        candidates,
        new_state,
    })
}
