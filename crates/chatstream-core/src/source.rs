//! Contracts with the collaborators the engine drives but does not own:
//! the packet stream, session bookkeeping on the server, and file upload.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::ids::{MessageId, SessionId};
use crate::messages::{FileDescriptor, FileKind};
use crate::packets::Packet;

pub type PacketStream = Pin<Box<dyn Stream<Item = Result<Packet, TransportError>> + Send>>;

/// Everything the server needs to answer one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub session_id: SessionId,
    pub message: String,
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub filters: RetrievalFilters,
    #[serde(default)]
    pub model: Option<ModelSelection>,
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default)]
    pub query_override: Option<String>,
    #[serde(default)]
    pub force_search: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    #[serde(default)]
    pub source_types: Vec<String>,
    #[serde(default)]
    pub document_sets: Vec<String>,
    #[serde(default)]
    pub time_cutoff: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user_file_ids: Vec<i64>,
    #[serde(default)]
    pub user_folder_ids: Vec<i64>,
    #[serde(default)]
    pub selected_document_ids: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Like,
    Dislike,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub kind: FeedbackKind,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub predefined: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub name: String,
    pub kind: FileKind,
    pub content: Vec<u8>,
}

/// Produces the packet stream for one turn. Cancelling `cancel` must stop
/// packet production; the returned stream may simply end afterwards.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<PacketStream, TransportError>;
}

/// Server-side session bookkeeping. Only `create_session` sits on the
/// critical path of a turn; the rest are called fire-and-forget.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        persona_id: u64,
        title: Option<&str>,
    ) -> Result<SessionId, TransportError>;

    async fn name_session(&self, session_id: &SessionId) -> Result<(), TransportError>;

    async fn record_model_override(
        &self,
        _session_id: &SessionId,
        _model: &ModelSelection,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_latest_message(&self, _message_id: MessageId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn submit_feedback(
        &self,
        message_id: MessageId,
        feedback: &Feedback,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(&self, files: Vec<UploadRequest>) -> Result<Vec<FileDescriptor>, TransportError>;
}
