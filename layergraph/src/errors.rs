//! Errors surfaced by graph construction and traversal.

use failure::Fail;

/// A failure originating in the graph store.
///
/// The registry driver and scanner treat `GraphError` as recoverable in
/// most contexts (a missing node is logged and skipped rather than
/// propagated), but `CycleDetected` aborts a sweep outright: a cyclic
/// layer graph means the source registry returned inconsistent ancestry
/// and a topological delete order cannot be computed.
#[derive(Debug, Fail)]
pub enum GraphError {
    #[fail(display = "node '{}' not found in graph", id)]
    NodeNotFound { id: String },

    #[fail(display = "graph contains a cycle, refusing to compute a topological order")]
    CycleDetected,

    #[fail(display = "failed to (de)serialize graph: {}", _0)]
    Serde(String),
}
