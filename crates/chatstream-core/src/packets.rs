use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::messages::{Document, FileDescriptor, StopReason, ToolCall};

/// One unit of a turn's response stream.
///
/// Ordering contract: `IdAssignment` comes first; everything else may arrive
/// in any order and is merged into the turn draft by key. A top-level `Error`
/// may arrive at any point, including before `IdAssignment`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    IdAssignment {
        user_message_id: MessageId,
        reserved_assistant_message_id: MessageId,
    },
    AgenticMessageIds {
        agentic_message_ids: Vec<AgenticMessageId>,
    },
    AnswerDelta {
        answer_piece: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<u32>,
    },
    SubQuestion(SubQuestionEvent),
    Documents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level_question_num: Option<u32>,
        top_documents: Vec<Document>,
    },
    ToolCall(ToolCall),
    Files {
        file_ids: Vec<String>,
    },
    UserFiles {
        user_files: Vec<FileDescriptor>,
    },
    RefinedAnswerImprovement {
        refined_answer_improvement: bool,
    },
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_type: Option<StreamType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level_question_num: Option<u32>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack_trace: Option<String>,
    },
    FinalMessage(FinalMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgenticMessageId {
    pub level: u32,
    pub message_id: MessageId,
}

/// Which part of an agentic answer a stop packet closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    MainAnswer,
    SubQuestions,
    SubAnswer,
}

/// Update to one sub-question record. Text-bearing parts carry the
/// cumulative text for that field, so replaying an event is harmless.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuestionEvent {
    pub level: u32,
    pub level_question_num: u32,
    #[serde(flatten)]
    pub part: SubQuestionPart,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum SubQuestionPart {
    Question { text: String },
    SubQuery { query_id: u32, query: String },
    Answer { text: String },
}

/// Authoritative trailing payload. Its fields win over anything the draft
/// accumulated from incremental packets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalMessage {
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rephrased_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<BTreeMap<u32, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_docs: Option<Vec<Document>>,
}

impl Packet {
    pub fn answer(text: impl Into<String>) -> Self {
        Self::AnswerDelta {
            answer_piece: text.into(),
            level: None,
        }
    }

    pub fn ids(user: i64, assistant: i64) -> Self {
        Self::IdAssignment {
            user_message_id: MessageId::new(user),
            reserved_assistant_message_id: MessageId::new(assistant),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            stack_trace: None,
        }
    }

    /// Short name of the variant for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdAssignment { .. } => "id_assignment",
            Self::AgenticMessageIds { .. } => "agentic_message_ids",
            Self::AnswerDelta { .. } => "answer_delta",
            Self::SubQuestion(_) => "sub_question",
            Self::Documents { .. } => "documents",
            Self::ToolCall(_) => "tool_call",
            Self::Files { .. } => "files",
            Self::UserFiles { .. } => "user_files",
            Self::RefinedAnswerImprovement { .. } => "refined_answer_improvement",
            Self::Stop { .. } => "stop",
            Self::Error { .. } => "error",
            Self::FinalMessage(_) => "final_message",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
