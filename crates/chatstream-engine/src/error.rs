use chatstream_core::errors::TransportError;
use chatstream_core::ids::{MessageId, SessionKey};
use chatstream_core::state::ChatState;

use crate::graph::GraphError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session {session} is busy ({state}), please wait")]
    Busy { session: SessionKey, state: &'static str },

    #[error("session {0} is uploading files, please wait for the upload to finish")]
    UploadInProgress(SessionKey),

    #[error("message {0} not found")]
    UnknownMessage(MessageId),

    #[error("message {id} is not {expected} message")]
    WrongRole { id: MessageId, expected: &'static str },

    #[error("message {0} has no parent to branch from")]
    NoParent(MessageId),

    #[error("session {0} has no messages")]
    EmptySession(SessionKey),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to create session: {0}")]
    SessionCreate(TransportError),

    /// The turn failed with an in-band error. The message is also committed
    /// into the graph when ids were assigned.
    #[error("{message}")]
    Turn { message: String },
}

impl EngineError {
    pub fn busy(session: &SessionKey, state: ChatState) -> Self {
        match state {
            ChatState::Uploading => Self::UploadInProgress(session.clone()),
            other => Self::Busy {
                session: session.clone(),
                state: other.as_str(),
            },
        }
    }

    /// Guard rejections leave engine state untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::UploadInProgress(_)
                | Self::UnknownMessage(_)
                | Self::WrongRole { .. }
                | Self::NoParent(_)
                | Self::EmptySession(_)
                | Self::Graph(GraphError::NotAChild { .. } | GraphError::UnknownMessage(_))
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "busy",
            Self::UploadInProgress(_) => "upload_in_progress",
            Self::UnknownMessage(_) | Self::WrongRole { .. } | Self::NoParent(_) | Self::EmptySession(_) => {
                "invalid_target"
            }
            Self::Graph(_) => "graph",
            Self::Transport(e) | Self::SessionCreate(e) => e.error_kind(),
            Self::Turn { .. } => "turn_failed",
        }
    }
}
