/// Core error type.
///
/// Adapter crates map their specific errors into this type so the bot core
/// can handle failures consistently. Expected denials (no credits, protected
/// term, refused broadcast start) are modeled as outcome enums on the
/// operations that produce them; this type is for faults only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// The user-record store could not be reached or rejected an operation.
    /// Callers must treat this as a denial, never as an implicit allow.
    #[error("store unavailable: {0}")]
    Store(String),

    /// The external lookup service failed or timed out. Quota is untouched
    /// and the request is safe to retry.
    #[error("lookup upstream failed: {0}")]
    Upstream(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
