//! Typed error kinds for the object store client, registry driver, scanner,
//! sweep engine, and history reporter.

use failure::Fail;

/// Error kinds surfaced by this crate.
///
/// Most call sites propagate `GcError` with `?`; the scanner and sweep
/// engine instead match on specific variants to decide whether a failure
/// is recoverable (logged and skipped) or fatal (aborts the pass/run).
#[derive(Debug, Fail)]
pub enum GcError {
    /// Network, DNS, or timeout failure while talking to the object store.
    #[fail(display = "transport error: {}", _0)]
    Transport(String),

    /// The object store responded with a non-2xx status.
    #[fail(display = "store error ({}): {}", status, message)]
    Store { status: u16, message: String },

    /// Missing credentials, or a precondition for signing was unmet.
    #[fail(display = "auth error: {}", _0)]
    Auth(String),

    /// Malformed JSON or XML from the registry or object store.
    #[fail(display = "parse error: {}", _0)]
    Parse(String),

    /// A repository or tag referenced a layer id absent from the graph.
    #[fail(display = "graph error: {}", _0)]
    Graph(String),

    /// The configuration file or CLI arguments are invalid.
    #[fail(display = "configuration error: {}", _0)]
    Config(String),

    /// The sweep-state file could not be read or written.
    #[fail(display = "sweep-state error: {}", _0)]
    State(String),
}

impl GcError {
    /// Whether this error is worth retrying for an idempotent (GET/LIST)
    /// operation: transport failures, 5xx, and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            GcError::Transport(_) => true,
            GcError::Store { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The process exit code this error kind maps to (§6 of the spec).
    pub fn exit_code(&self) -> i32 {
        match self {
            GcError::Config(_) => 2,
            GcError::State(_) => 4,
            _ => 3,
        }
    }
}

impl From<layergraph::GraphError> for GcError {
    fn from(err: layergraph::GraphError) -> Self {
        GcError::Graph(err.to_string())
    }
}

impl From<reqwest::Error> for GcError {
    fn from(err: reqwest::Error) -> Self {
        GcError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GcError {
    fn from(err: serde_json::Error) -> Self {
        GcError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for GcError {
    fn from(err: std::io::Error) -> Self {
        GcError::State(err.to_string())
    }
}
