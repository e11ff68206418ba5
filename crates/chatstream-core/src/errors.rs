/// Failures of the stream transport itself, as opposed to error packets
/// delivered in-band by the server.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::Interrupted(_) => "interrupted",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
        }
    }
}
