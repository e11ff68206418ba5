//! Turn draft reducer.
//!
//! Folds packets into an in-memory draft of the current turn. Nothing here
//! touches the message graph or the session registry; the orchestrator reads
//! the returned [`Applied`] value and the draft's message builders to decide
//! what to commit.

use std::collections::BTreeMap;

use chatstream_core::ids::MessageId;
use chatstream_core::messages::{
    merge_files, AssistantDetail, Document, FileDescriptor, Message, RetrievalType, Role,
    StopReason, SubQuery, SubQuestion, ToolCall,
};
use chatstream_core::packets::{FinalMessage, Packet, StreamType, SubQuestionEvent, SubQuestionPart};
use chatstream_core::state::ChatState;

/// Tool names containing this marker are internal bookkeeping.
const AGENT_TOOL_MARKER: &str = "agent";
const SEARCH_TOOL_NAME: &str = "run_search";

/// Server-assigned ids for the turn's message pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnIds {
    pub user: MessageId,
    pub assistant: MessageId,
}

/// Side effects a merged packet asks the orchestrator to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effect {
    pub chat_state: Option<ChatState>,
    pub can_continue: bool,
}

impl Effect {
    fn state(chat_state: ChatState) -> Self {
        Self {
            chat_state: Some(chat_state),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A non-error packet arrived before the id assignment.
    BeforeIds(&'static str),
    DuplicateIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFailure {
    /// Error packet with no ids assigned yet. Nothing is committed.
    BeforeIds { message: String },
    /// Error after every level-0 sub-question stopped.
    Terminal {
        message: String,
        stack_trace: Option<String>,
    },
}

impl TurnFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::BeforeIds { message } | Self::Terminal { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Assigned(TurnIds),
    Merged(Effect),
    Skipped(ProtocolViolation),
    Fatal(TurnFailure),
}

/// Accumulated state of one in-flight turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDraft {
    ids: Option<TurnIds>,
    second_level_id: Option<MessageId>,
    pub answer: String,
    pub second_level_answer: String,
    pub is_generating: bool,
    pub second_level_generating: bool,
    pub sub_questions: Vec<SubQuestion>,
    pub is_streaming_questions: bool,
    pub documents: Vec<Document>,
    pub agentic_documents: Vec<Document>,
    pub retrieval_type: RetrievalType,
    pub query: Option<String>,
    pub tool_call: Option<ToolCall>,
    pub files: Vec<FileDescriptor>,
    pub user_files: Vec<FileDescriptor>,
    pub is_agentic: bool,
    pub is_improvement: Option<bool>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub final_message: Option<FinalMessage>,
}

impl Default for TurnDraft {
    fn default() -> Self {
        Self {
            ids: None,
            second_level_id: None,
            answer: String::new(),
            second_level_answer: String::new(),
            is_generating: false,
            second_level_generating: false,
            sub_questions: Vec::new(),
            is_streaming_questions: true,
            documents: Vec::new(),
            agentic_documents: Vec::new(),
            retrieval_type: RetrievalType::None,
            query: None,
            tool_call: None,
            files: Vec::new(),
            user_files: Vec::new(),
            is_agentic: false,
            is_improvement: None,
            error: None,
            stack_trace: None,
            stop_reason: None,
            final_message: None,
        }
    }
}

impl TurnDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Option<TurnIds> {
        self.ids
    }

    pub fn second_level_id(&self) -> Option<MessageId> {
        self.second_level_id
    }

    pub fn apply(&mut self, packet: Packet) -> Applied {
        if self.ids.is_none() {
            return match packet {
                Packet::IdAssignment {
                    user_message_id,
                    reserved_assistant_message_id,
                } => {
                    let ids = TurnIds {
                        user: user_message_id,
                        assistant: reserved_assistant_message_id,
                    };
                    self.ids = Some(ids);
                    Applied::Assigned(ids)
                }
                Packet::Error { error, .. } => Applied::Fatal(TurnFailure::BeforeIds { message: error }),
                other => Applied::Skipped(ProtocolViolation::BeforeIds(other.kind())),
            };
        }

        match packet {
            Packet::IdAssignment { .. } => Applied::Skipped(ProtocolViolation::DuplicateIds),
            Packet::AgenticMessageIds { agentic_message_ids } => {
                if let Some(entry) = agentic_message_ids.iter().find(|e| e.level == 1) {
                    self.second_level_id = Some(entry.message_id);
                }
                Applied::Merged(Effect::default())
            }
            Packet::AnswerDelta { answer_piece, level } => {
                self.apply_answer(&answer_piece, level);
                Applied::Merged(Effect::state(ChatState::Streaming))
            }
            Packet::SubQuestion(event) => {
                self.is_agentic = true;
                self.apply_sub_question(event);
                Applied::Merged(Effect::state(ChatState::ToolBuilding))
            }
            Packet::Documents {
                level,
                level_question_num,
                top_documents,
            } => {
                self.apply_documents(level, level_question_num, top_documents);
                Applied::Merged(Effect::default())
            }
            Packet::ToolCall(call) => Applied::Merged(self.apply_tool_call(call)),
            Packet::Files { file_ids } => {
                merge_files(&mut self.files, file_ids.into_iter().map(FileDescriptor::image));
                Applied::Merged(Effect::default())
            }
            Packet::UserFiles { user_files } => {
                merge_files(&mut self.user_files, user_files);
                Applied::Merged(Effect::default())
            }
            Packet::RefinedAnswerImprovement {
                refined_answer_improvement,
            } => {
                self.is_improvement = Some(refined_answer_improvement);
                Applied::Merged(Effect::default())
            }
            Packet::Stop {
                stop_reason,
                stream_type,
                level,
                level_question_num,
            } => Applied::Merged(self.apply_stop(stop_reason, stream_type, level, level_question_num)),
            Packet::Error { error, stack_trace } => {
                if self.all_top_level_stopped() {
                    Applied::Fatal(TurnFailure::Terminal {
                        message: error,
                        stack_trace,
                    })
                } else {
                    self.error = Some(error);
                    self.stack_trace = stack_trace;
                    Applied::Merged(Effect::default())
                }
            }
            Packet::FinalMessage(fm) => {
                self.final_message = Some(fm);
                Applied::Merged(Effect::default())
            }
        }
    }

    fn apply_answer(&mut self, piece: &str, level: Option<u32>) {
        if level == Some(1) {
            self.second_level_generating = true;
            self.second_level_answer.push_str(piece);
        } else {
            self.is_generating = true;
            self.answer.push_str(piece);
        }
        for q in &mut self.sub_questions {
            q.is_generating = false;
        }
    }

    fn sub_question_mut(&mut self, level: u32, num: u32) -> &mut SubQuestion {
        let pos = match self.sub_questions.iter().position(|q| q.key() == (level, num)) {
            Some(pos) => pos,
            None => {
                self.sub_questions.push(SubQuestion::new(level, num));
                self.sub_questions.len() - 1
            }
        };
        &mut self.sub_questions[pos]
    }

    fn apply_sub_question(&mut self, event: SubQuestionEvent) {
        let q = self.sub_question_mut(event.level, event.level_question_num);
        match event.part {
            SubQuestionPart::Question { text } => q.question = text,
            SubQuestionPart::SubQuery { query_id, query } => {
                match q.sub_queries.iter_mut().find(|s| s.query_id == query_id) {
                    Some(existing) => existing.query = query,
                    None => q.sub_queries.push(SubQuery { query_id, query }),
                }
            }
            SubQuestionPart::Answer { text } => {
                q.is_generating = true;
                q.answer = text;
            }
        }
    }

    fn apply_documents(&mut self, level: Option<u32>, num: Option<u32>, docs: Vec<Document>) {
        match (level, num) {
            (None, None) => {
                self.documents = docs;
                self.retrieval_type = RetrievalType::Search;
            }
            (Some(0), Some(0)) => self.documents = docs,
            (Some(1), Some(0)) => self.agentic_documents = docs,
            (Some(level), Some(num)) => self.sub_question_mut(level, num).context_docs = docs,
            (Some(0), None) => self.documents = docs,
            _ => {}
        }
    }

    fn apply_tool_call(&mut self, call: ToolCall) -> Effect {
        if call.tool_name.contains(AGENT_TOOL_MARKER) {
            return Effect::default();
        }
        if call.tool_name == SEARCH_TOOL_NAME {
            if let Some(q) = call.tool_args.get("query").and_then(|v| v.as_str()) {
                self.query = Some(q.to_string());
            }
        }
        let next = if call.result().is_some() {
            ChatState::Streaming
        } else {
            ChatState::ToolBuilding
        };
        self.tool_call = Some(call);
        Effect::state(next)
    }

    fn apply_stop(
        &mut self,
        reason: Option<StopReason>,
        stream_type: Option<StreamType>,
        level: Option<u32>,
        num: Option<u32>,
    ) -> Effect {
        let mut effect = Effect::default();
        match (stream_type, num) {
            (Some(StreamType::MainAnswer), _) => {
                self.is_generating = false;
                effect.chat_state = Some(ChatState::Streaming);
            }
            (Some(StreamType::SubQuestions), None) => self.is_streaming_questions = false,
            (Some(StreamType::SubQuestions), Some(num)) => {
                self.sub_question_mut(level.unwrap_or(0), num).question_complete = true;
            }
            (Some(StreamType::SubAnswer), Some(num)) => {
                let q = self.sub_question_mut(level.unwrap_or(0), num);
                q.is_stopped = true;
                q.is_generating = false;
            }
            _ => {}
        }
        if let Some(reason) = reason {
            self.stop_reason = Some(reason);
            effect.can_continue = reason == StopReason::ContextLength;
        }
        effect
    }

    /// True once the turn has at least one level-0 sub-question and all of
    /// them are stopped.
    fn all_top_level_stopped(&self) -> bool {
        let mut top = self.sub_questions.iter().filter(|q| q.level == 0).peekable();
        top.peek().is_some() && top.all(|q| q.is_stopped)
    }

    /// User half of the turn as it should appear in the graph.
    pub fn user_message(&self, id: MessageId, body: &str, parent: MessageId, files: &[FileDescriptor]) -> Message {
        let mut all = files.to_vec();
        merge_files(&mut all, self.user_files.iter().cloned());
        Message::user(id, body, parent).with_files(all)
    }

    /// Assistant half of the turn. A recorded partial error turns it into an
    /// error message whose body is the error text.
    pub fn assistant_message(&self, id: MessageId, parent: MessageId) -> Message {
        let fm = self.final_message.as_ref();
        let (role, body) = match &self.error {
            Some(error) => (Role::Error, error.clone()),
            None => (Role::Assistant, self.answer.clone()),
        };
        let mut msg = Message::new(id, role, body, Some(parent));
        msg.files = fm
            .and_then(|f| f.files.clone())
            .unwrap_or_else(|| self.files.clone());
        msg.tool_call = fm
            .and_then(|f| f.tool_call.clone())
            .or_else(|| self.tool_call.clone());
        let documents = match fm.and_then(|f| f.context_docs.clone()) {
            Some(docs) if !docs.is_empty() => docs,
            _ => self.documents.clone(),
        };
        msg.detail = Some(Box::new(AssistantDetail {
            second_level_body: self.second_level_answer.clone(),
            citations: fm.and_then(|f| f.citations.clone()).unwrap_or_else(BTreeMap::new),
            documents,
            agentic_documents: self.agentic_documents.clone(),
            sub_questions: self.sub_questions.clone(),
            retrieval_type: self.retrieval_type,
            query: fm
                .and_then(|f| f.rephrased_query.clone())
                .or_else(|| self.query.clone()),
            is_generating: self.is_generating,
            second_level_generating: self.second_level_generating,
            is_streaming_questions: self.is_streaming_questions,
            is_agentic: self.is_agentic,
            is_improvement: self.is_improvement,
            stack_trace: self.stack_trace.clone(),
            overridden_model: fm.and_then(|f| f.overridden_model.clone()),
            stop_reason: self.stop_reason,
        }));
        msg
    }

    /// Elevated answer node, once a level-1 message id is known.
    pub fn second_level_message(&self, parent: MessageId) -> Option<Message> {
        self.second_level_id
            .map(|id| Message::assistant(id, self.second_level_answer.clone(), parent))
    }
}
