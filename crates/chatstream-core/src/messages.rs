use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Error,
}

/// A node of a session's message graph.
///
/// `children_ids` and `latest_child_id` are owned by the graph: callers may
/// supply them, but the graph keeps them consistent on every mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub body: String,
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub children_ids: Vec<MessageId>,
    #[serde(default)]
    pub latest_child_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Box<AssistantDetail>>,
}

impl Message {
    pub fn new(id: MessageId, role: Role, body: impl Into<String>, parent_id: Option<MessageId>) -> Self {
        Self {
            id,
            role,
            body: body.into(),
            parent_id,
            children_ids: Vec::new(),
            latest_child_id: None,
            files: Vec::new(),
            tool_call: None,
            detail: None,
        }
    }

    pub fn system_root(id: MessageId) -> Self {
        Self::new(id, Role::System, "", None)
    }

    pub fn user(id: MessageId, body: impl Into<String>, parent_id: MessageId) -> Self {
        Self::new(id, Role::User, body, Some(parent_id))
    }

    pub fn assistant(id: MessageId, body: impl Into<String>, parent_id: MessageId) -> Self {
        Self::new(id, Role::Assistant, body, Some(parent_id))
    }

    pub fn error(id: MessageId, body: impl Into<String>, parent_id: MessageId) -> Self {
        Self::new(id, Role::Error, body, Some(parent_id))
    }

    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        self.files = files;
        self
    }

    pub fn is_error(&self) -> bool {
        self.role == Role::Error
    }

    /// A tool call that started but never reported a result.
    pub fn has_pending_tool_call(&self) -> bool {
        self.tool_call.as_ref().is_some_and(|tc| tc.result().is_none())
    }
}

/// Everything an assistant message carries beyond its body. The engine
/// fills it from the turn draft and never interprets it afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub second_level_body: String,
    #[serde(default)]
    pub citations: BTreeMap<u32, i64>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub agentic_documents: Vec<Document>,
    #[serde(default)]
    pub sub_questions: Vec<SubQuestion>,
    #[serde(default)]
    pub retrieval_type: RetrievalType,
    pub query: Option<String>,
    pub is_generating: bool,
    pub second_level_generating: bool,
    pub is_streaming_questions: bool,
    pub is_agentic: bool,
    pub is_improvement: Option<bool>,
    pub stack_trace: Option<String>,
    pub overridden_model: Option<String>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalType {
    #[default]
    None,
    Search,
    SelectedDocs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Document,
    PlainText,
    Csv,
    UserKnowledge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FileDescriptor {
    pub fn image(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: FileKind::Image,
            name: None,
        }
    }
}

/// Appends descriptors whose id is not already present.
pub fn merge_files(existing: &mut Vec<FileDescriptor>, incoming: impl IntoIterator<Item = FileDescriptor>) {
    for file in incoming {
        if !existing.iter().any(|f| f.id == file.id) {
            existing.push(file);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<serde_json::Value>,
}

impl ToolCall {
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.tool_result.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    #[serde(default)]
    pub semantic_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub blurb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_doc_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    pub query_id: u32,
    pub query: String,
}

/// One step of an agentic answer, keyed by `(level, level_question_num)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub level: u32,
    pub level_question_num: u32,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub sub_queries: Vec<SubQuery>,
    #[serde(default)]
    pub context_docs: Vec<Document>,
    pub is_generating: bool,
    pub question_complete: bool,
    pub is_stopped: bool,
}

impl SubQuestion {
    pub fn new(level: u32, level_question_num: u32) -> Self {
        Self {
            level,
            level_question_num,
            question: String::new(),
            answer: String::new(),
            sub_queries: Vec::new(),
            context_docs: Vec::new(),
            is_generating: false,
            question_complete: false,
            is_stopped: false,
        }
    }

    pub fn key(&self) -> (u32, u32) {
        (self.level, self.level_question_num)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Finished,
    ContextLength,
    Cancelled,
}
