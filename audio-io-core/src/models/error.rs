use thiserror::Error;

/// Errors surfaced by negotiation, topology construction and session control.
///
/// Runtime problems on the realtime thread (xruns, consumer panics) are never
/// returned as errors; they are recorded as [`FaultKind`](super::fault::FaultKind)s.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no compatible stream topology: {0}")]
    NoCompatibleTopology(String),

    #[error("stream open failure: {0}")]
    StreamOpenFailure(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
