use crate::models::FileStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestrator.
///
/// The remote's `-1` progress sentinel is deliberately *not* an error here:
/// stage failures are recorded as `FileStatus::Failed` on the record (with
/// `error_message` set) so observers read them as state, never as a thrown
/// error. Only transport problems and caller mistakes come back as `Err`.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network-level failure: connection refused, timeout, interrupted body.
    /// Recoverable by the poller on its next tick.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with a non-success HTTP status.
    #[error("remote returned HTTP {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    /// The remote answered 2xx but the body did not parse.
    #[error("unexpected response from the masking service: {0}")]
    UnexpectedResponse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no file with id {0}")]
    NotFound(Uuid),

    #[error("file {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: FileStatus,
        expected: &'static str,
    },

    #[error("file {id} is not ready for download (status: {status})")]
    NotReady { id: Uuid, status: FileStatus },
}

impl PipelineError {
    /// True for network-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// True for failures the poller should retry on the next tick: network
    /// faults and server-side 5xx responses. Client errors (4xx) and decode
    /// failures do not heal on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::RemoteStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::UnexpectedResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
