//! Turn orchestrator.
//!
//! `ChatEngine` drives one request/stream/commit cycle per turn and exposes
//! the operations a chat UI calls. Turn state lives in the
//! [`SessionRegistry`]; each turn owns its session through an
//! [`AbortHandle`] and stops touching it as soon as it loses that handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chatstream_core::ids::{MessageId, SessionId, SessionKey};
use chatstream_core::messages::{FileDescriptor, Message, Role};
use chatstream_core::source::{
    Feedback, FeedbackKind, FileUploader, ModelSelection, RetrievalFilters, SessionService,
    StreamRequest, StreamSource, UploadRequest,
};
use chatstream_core::state::{ChatState, RegenerationState};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::{GraphError, MessageGraph, UpsertOptions};
use crate::interpreter::{Applied, TurnDraft, TurnFailure, TurnIds};
use crate::queue::{spawn_producer, Next, PacketQueue};
use crate::registry::{AbortHandle, SessionRegistry, SessionState};

/// A user-initiated message send.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Target session; the current session when `None`.
    pub session: Option<SessionKey>,
    pub message: String,
    pub files: Vec<FileDescriptor>,
    pub filters: RetrievalFilters,
    pub model: Option<ModelSelection>,
    /// Persona for a session this submit has to create.
    pub persona_id: Option<u64>,
    /// Explicit title for a session this submit has to create. Suppresses
    /// automatic naming.
    pub title: Option<String>,
    pub query_override: Option<String>,
    pub force_search: bool,
}

impl SubmitRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, key: impl Into<SessionKey>) -> Self {
        self.session = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: ModelSelection) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        self.files = files;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream ran to its end. The assistant message may still be an
    /// error message if a partial error was recorded.
    Completed,
    /// Stopped by the user or preempted; partial content stays committed.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Session the turn ended in, after any placeholder migration.
    pub session: SessionKey,
    pub ids: Option<TurnIds>,
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, Copy)]
enum TurnKind {
    /// Append to the displayed chain.
    Fresh,
    /// New user message under `parent`, made the active branch.
    Resend { parent: MessageId },
    /// New assistant reply to existing user message `user` (itself under
    /// `user_parent`), replacing `replaced`.
    Regenerate { user: MessageId, user_parent: MessageId, replaced: MessageId },
}

struct TurnPlan {
    key: SessionKey,
    message: String,
    files: Vec<FileDescriptor>,
    filters: RetrievalFilters,
    model: Option<ModelSelection>,
    persona_id: Option<u64>,
    title: Option<String>,
    query_override: Option<String>,
    force_search: bool,
    kind: TurnKind,
}

impl TurnPlan {
    fn from_submit(key: SessionKey, req: SubmitRequest) -> Self {
        Self {
            key,
            message: req.message,
            files: req.files,
            filters: req.filters,
            model: req.model,
            persona_id: req.persona_id,
            title: req.title,
            query_override: req.query_override,
            force_search: req.force_search,
            kind: TurnKind::Fresh,
        }
    }

    fn retry(key: SessionKey, message: String, files: Vec<FileDescriptor>, kind: TurnKind) -> Self {
        Self {
            key,
            message,
            files,
            filters: RetrievalFilters::default(),
            model: None,
            persona_id: None,
            title: None,
            query_override: None,
            force_search: false,
            kind,
        }
    }

    fn preempts(&self) -> bool {
        !matches!(self.kind, TurnKind::Fresh)
    }
}

/// Client-side chat engine shared by every session of one UI.
#[derive(Clone)]
pub struct ChatEngine {
    source: Arc<dyn StreamSource>,
    sessions: Arc<dyn SessionService>,
    uploader: Arc<dyn FileUploader>,
    registry: Arc<SessionRegistry>,
    config: Arc<EngineConfig>,
    next_turn: Arc<AtomicU64>,
}

impl ChatEngine {
    pub fn new(
        source: Arc<dyn StreamSource>,
        sessions: Arc<dyn SessionService>,
        uploader: Arc<dyn FileUploader>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            sessions,
            uploader,
            registry: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
            next_turn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // -- read side --

    pub fn current_session(&self) -> SessionKey {
        self.registry.current()
    }

    /// Messages of the displayed branch, root excluded.
    pub fn current_chain(&self, key: &SessionKey) -> Vec<Message> {
        self.registry
            .graph(key)
            .project_chain()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn graph(&self, key: &SessionKey) -> Arc<MessageGraph> {
        self.registry.graph(key)
    }

    /// `None` when the session has no state at all.
    pub fn current_chat_state(&self, key: &SessionKey) -> Option<ChatState> {
        self.registry.chat_state(key)
    }

    pub fn regeneration_state(&self, key: &SessionKey) -> Option<RegenerationState> {
        self.registry.regeneration(key)
    }

    pub fn can_continue(&self, key: &SessionKey) -> bool {
        self.registry.can_continue(key)
    }

    // -- session lifecycle --

    /// Seed a session from server history and make it current. A session
    /// with a turn in flight keeps its live graph.
    pub fn load_session(&self, id: SessionId, history: Vec<Message>) -> Result<(), EngineError> {
        let key = SessionKey::from(id);
        if self.registry.active_turn(&key).is_none() {
            let graph = MessageGraph::from_history(history)?;
            self.registry.seed(
                key.clone(),
                SessionState {
                    graph: Arc::new(graph),
                    ..Default::default()
                },
            );
        } else {
            debug!(session_id = %key, "session is streaming, keeping live graph");
        }
        self.registry.set_current(key);
        Ok(())
    }

    /// Change the current session. Turns running elsewhere keep running.
    pub fn switch_session(&self, key: SessionKey) {
        self.registry.set_current(key);
    }

    /// Navigate away: abort the current session's stream and drop its state.
    pub fn close(&self) {
        let key = self.registry.current();
        if let Some(handle) = self.registry.take_abort(&key) {
            handle.token.cancel();
        }
        self.registry.evict(&key);
        self.registry.set_current(SessionKey::placeholder());
        debug!(session_id = %key, "session closed");
    }

    // -- turns --

    pub async fn submit(&self, req: SubmitRequest) -> Result<TurnReport, EngineError> {
        let key = req.session.clone().unwrap_or_else(|| self.registry.current());
        self.run_turn(TurnPlan::from_submit(key, req)).await
    }

    /// Resume an answer cut off by the context limit.
    pub async fn continue_generating(&self) -> Result<TurnReport, EngineError> {
        let key = self.registry.current();
        if self.registry.graph(&key).project_chain().is_empty() {
            return Err(EngineError::EmptySession(key));
        }
        let req = SubmitRequest::new(self.config.continue_prompt.clone());
        self.run_turn(TurnPlan::from_submit(key, req)).await
    }

    /// Send user message `message_id` again, optionally with new text, as a
    /// sibling that becomes the active branch.
    pub async fn resend(
        &self,
        message_id: MessageId,
        override_text: Option<String>,
    ) -> Result<TurnReport, EngineError> {
        let key = self.registry.current();
        let graph = self.registry.graph(&key);
        let msg = graph.get(message_id).ok_or(EngineError::UnknownMessage(message_id))?;
        if msg.role != Role::User {
            return Err(EngineError::WrongRole { id: message_id, expected: "a user" });
        }
        let parent = msg.parent_id.ok_or(EngineError::NoParent(message_id))?;
        let text = override_text.unwrap_or_else(|| msg.body.clone());
        let plan = TurnPlan::retry(key, text, msg.files.clone(), TurnKind::Resend { parent });
        self.run_turn(plan).await
    }

    /// Replace the text of user message `message_id`: the edited message
    /// becomes a new branch next to the original.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_text: impl Into<String>,
    ) -> Result<TurnReport, EngineError> {
        let key = self.registry.current();
        let graph = self.registry.graph(&key);
        let msg = graph.get(message_id).ok_or(EngineError::UnknownMessage(message_id))?;
        if msg.role != Role::User {
            return Err(EngineError::WrongRole { id: message_id, expected: "a user" });
        }
        let parent = msg.parent_id.ok_or(EngineError::NoParent(message_id))?;
        self.check_claimable(&key, true)?;
        self.registry
            .update_graph(&key, |g| g.clear_latest_child(parent))?;
        self.resend(message_id, Some(new_text.into())).await
    }

    /// Ask for a new answer to the user message behind assistant message
    /// `assistant_id`, optionally with a different model.
    pub async fn regenerate(
        &self,
        assistant_id: MessageId,
        model_override: Option<ModelSelection>,
    ) -> Result<TurnReport, EngineError> {
        let key = self.registry.current();
        let graph = self.registry.graph(&key);
        let answer = graph.get(assistant_id).ok_or(EngineError::UnknownMessage(assistant_id))?;
        if !matches!(answer.role, Role::Assistant | Role::Error) {
            return Err(EngineError::WrongRole { id: assistant_id, expected: "an assistant" });
        }
        let user_id = answer.parent_id.ok_or(EngineError::NoParent(assistant_id))?;
        let user = graph.get(user_id).ok_or(EngineError::UnknownMessage(user_id))?;
        if user.role != Role::User {
            return Err(EngineError::WrongRole { id: user_id, expected: "a user" });
        }
        let user_parent = user.parent_id.ok_or(EngineError::NoParent(user_id))?;
        let mut plan = TurnPlan::retry(
            key,
            user.body.clone(),
            user.files.clone(),
            TurnKind::Regenerate { user: user_id, user_parent, replaced: assistant_id },
        );
        plan.model = model_override;
        self.run_turn(plan).await
    }

    /// Abort the session's in-flight turn. Returns false if nothing was
    /// streaming.
    pub fn stop_generating(&self, key: &SessionKey) -> bool {
        let Some(handle) = self.registry.take_abort(key) else {
            return false;
        };
        handle.token.cancel();
        let cleared = self.registry.update_graph(key, |g| match g.chain_tail() {
            Some(tail) if tail.role == Role::Assistant && tail.has_pending_tool_call() => {
                g.update_message(tail.id, |m| m.tool_call = None)
            }
            _ => Ok(g.clone()),
        });
        if let Err(e) = cleared {
            warn!(session_id = %key, error = %e, "failed to clear dangling tool call");
        }
        self.registry.set_regeneration(key, None);
        self.registry.set_chat_state(key, ChatState::Input);
        info!(session_id = %key, turn = handle.turn, "generation stopped");
        true
    }

    /// Make `message_id` the active child of its parent.
    pub fn switch_branch(&self, message_id: MessageId) -> Result<(), EngineError> {
        let key = self.registry.current();
        let parent = self
            .registry
            .graph(&key)
            .get(message_id)
            .ok_or(EngineError::UnknownMessage(message_id))?
            .parent_id
            .ok_or(EngineError::NoParent(message_id))?;
        self.registry
            .update_graph(&key, |g| g.set_latest_child(parent, message_id))?;

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            if let Err(e) = sessions.set_latest_message(message_id).await {
                warn!(message_id = %message_id, error = %e, "failed to persist branch switch");
            }
        });
        Ok(())
    }

    // -- side requests --

    pub async fn upload(&self, files: Vec<UploadRequest>) -> Result<Vec<FileDescriptor>, EngineError> {
        let key = self.registry.current();
        self.registry
            .try_enter(&key, ChatState::Uploading)
            .map_err(|state| EngineError::busy(&key, state))?;
        let result = self.uploader.upload(files).await;
        self.registry.set_chat_state(&key, ChatState::Input);
        result.map_err(|e| {
            warn!(session_id = %key, error = %e, "upload failed");
            EngineError::from(e)
        })
    }

    pub async fn feedback(
        &self,
        message_id: MessageId,
        kind: FeedbackKind,
        details: impl Into<String>,
        predefined: Option<String>,
    ) -> Result<(), EngineError> {
        let key = self.registry.current();
        if !self.registry.graph(&key).contains(message_id) {
            return Err(EngineError::UnknownMessage(message_id));
        }
        let feedback = Feedback {
            kind,
            details: details.into(),
            predefined,
        };
        self.sessions
            .submit_feedback(message_id, &feedback)
            .await
            .map_err(EngineError::from)
    }

    // -- turn driver --

    fn check_claimable(&self, key: &SessionKey, preempt: bool) -> Result<(), EngineError> {
        match self.registry.chat_state(key).unwrap_or_default() {
            ChatState::Input => Ok(()),
            state if preempt && state.is_answering() => Ok(()),
            state => Err(EngineError::busy(key, state)),
        }
    }

    #[instrument(skip_all, fields(session_id = %plan.key, turn = tracing::field::Empty))]
    async fn run_turn(&self, mut plan: TurnPlan) -> Result<TurnReport, EngineError> {
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("turn", turn);

        let token = CancellationToken::new();
        let handle = AbortHandle { turn, token: token.clone() };
        let displaced = self
            .registry
            .try_claim(&plan.key, handle, plan.preempts())
            .map_err(|state| EngineError::busy(&plan.key, state))?;
        if let Some(previous) = displaced {
            info!(previous = previous.turn, "preempting in-flight turn");
            previous.token.cancel();
        }

        let parent = match plan.kind {
            TurnKind::Fresh => {
                self.prune_error_tail(&plan.key);
                self.registry
                    .graph(&plan.key)
                    .chain_tail()
                    .map(|m| m.id)
                    .unwrap_or(MessageId::SYSTEM)
            }
            TurnKind::Resend { parent } => parent,
            TurnKind::Regenerate { user_parent, .. } => user_parent,
        };

        let mut created = false;
        let session_id = match plan.key.id().cloned() {
            Some(id) => id,
            None => {
                let persona = plan.persona_id.unwrap_or(self.config.default_persona_id);
                match self.sessions.create_session(persona, plan.title.as_deref()).await {
                    Ok(id) => {
                        let new_key = SessionKey::from(&id);
                        if !self.registry.migrate_turn(&plan.key, &new_key, turn) {
                            info!(session_id = %id, "turn stopped while its session was created");
                            return Ok(TurnReport { session: new_key, ids: None, outcome: TurnOutcome::Cancelled });
                        }
                        tracing::Span::current().record("session_id", tracing::field::display(&new_key));
                        info!(session_id = %id, "session created");
                        plan.key = new_key;
                        created = true;
                        id
                    }
                    Err(e) => {
                        warn!(error = %e, kind = e.error_kind(), "session creation failed");
                        self.registry.release_turn(&plan.key, turn);
                        return Err(EngineError::SessionCreate(e));
                    }
                }
            }
        };
        let key = plan.key.clone();

        if plan.model.is_none() {
            plan.model = self.config.default_model.clone();
        }
        if let Some(model) = plan.model.clone() {
            let sessions = Arc::clone(&self.sessions);
            let id = session_id.clone();
            tokio::spawn(async move {
                if let Err(e) = sessions.record_model_override(&id, &model).await {
                    warn!(session_id = %id, error = %e, "failed to record model override");
                }
            });
        }

        let anchor = match plan.kind {
            TurnKind::Fresh => None,
            TurnKind::Resend { parent } => Some(parent),
            TurnKind::Regenerate { user, .. } => Some(user),
        };
        if let Some(anchor) = anchor {
            self.registry.with_turn(&key, turn, |s| {
                s.regeneration = Some(RegenerationState::replacing_after(anchor));
            });
        }

        let request = StreamRequest {
            session_id: session_id.clone(),
            message: plan.message.clone(),
            parent_message_id: self.request_parent(&key, parent),
            files: plan.files.clone(),
            filters: plan.filters.clone(),
            model: plan.model.clone(),
            regenerate: matches!(plan.kind, TurnKind::Regenerate { .. }),
            query_override: plan.query_override.clone(),
            force_search: plan.force_search,
        };

        let stream_cancel = token.child_token();
        let stream = match self.source.open(request, stream_cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                self.registry.release_turn(&key, turn);
                return Ok(TurnReport { session: key, ids: None, outcome: TurnOutcome::Cancelled });
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "failed to open stream");
                self.commit_failure(&key, turn, &plan, parent, &TurnDraft::new(), &e.to_string());
                self.finish(&key, turn, created, &plan, &session_id);
                return Err(EngineError::Transport(e));
            }
        };

        let queue = Arc::new(PacketQueue::new());
        let producer = spawn_producer(stream, Arc::clone(&queue), stream_cancel.clone());

        let delay = self.config.initial_drain_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            }
        }

        let mut draft = TurnDraft::new();
        let mut committed = false;
        let failure = loop {
            let packet = match queue.next(&token).await {
                Next::Packet(packet) => packet,
                Next::Drained => break queue.error(),
                Next::Cancelled => {
                    debug!("turn cancelled");
                    stream_cancel.cancel();
                    self.registry.release_turn(&key, turn);
                    return Ok(TurnReport { session: key, ids: draft.ids(), outcome: TurnOutcome::Cancelled });
                }
            };
            let kind = packet.kind();
            match draft.apply(packet) {
                Applied::Assigned(ids) => {
                    debug!(user = %ids.user, assistant = %ids.assistant, "ids assigned");
                    self.registry.with_turn(&key, turn, |s| s.regeneration = None);
                }
                Applied::Merged(effect) => {
                    self.registry.with_turn(&key, turn, |s| {
                        if let Some(state) = effect.chat_state {
                            s.chat_state = state;
                        }
                        if effect.can_continue {
                            s.can_continue = true;
                        }
                    });
                }
                Applied::Skipped(violation) => {
                    warn!(packet = kind, ?violation, "protocol violation, packet skipped");
                    continue;
                }
                Applied::Fatal(failure) => {
                    stream_cancel.cancel();
                    match &failure {
                        TurnFailure::BeforeIds { message } => {
                            warn!(error = %message, "turn failed before id assignment");
                        }
                        TurnFailure::Terminal { message, .. } => {
                            warn!(error = %message, "terminal error");
                            self.commit_failure(&key, turn, &plan, parent, &draft, message);
                        }
                    }
                    self.finish(&key, turn, created, &plan, &session_id);
                    return Err(EngineError::Turn { message: failure.message().to_string() });
                }
            }

            match self.commit_draft(&key, turn, &plan, parent, &draft, !committed) {
                Ok(true) => committed = true,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "failed to commit turn");
                    stream_cancel.cancel();
                    self.registry.release_turn(&key, turn);
                    return Err(e.into());
                }
            }
        };
        producer.abort();

        if let Some(message) = failure {
            warn!(error = %message, "stream failed");
            self.commit_failure(&key, turn, &plan, parent, &draft, &message);
            self.finish(&key, turn, created, &plan, &session_id);
            return Err(EngineError::Turn { message });
        }
        if draft.ids().is_none() {
            warn!("stream ended before id assignment");
        }
        self.finish(&key, turn, created, &plan, &session_id);
        Ok(TurnReport { session: key, ids: draft.ids(), outcome: TurnOutcome::Completed })
    }

    /// Parent id sent to the server. The graph root, synthetic or loaded from
    /// history, is never sent.
    fn request_parent(&self, key: &SessionKey, parent: MessageId) -> Option<MessageId> {
        let root = self.registry.graph(key).root().map(|m| m.id);
        (!parent.is_sentinel() && Some(parent) != root).then_some(parent)
    }

    /// Drop a trailing error turn (the error and the user message it
    /// answered) before a fresh message is appended.
    fn prune_error_tail(&self, key: &SessionKey) {
        let pruned = self.registry.update_graph(key, |g| {
            let Some(tail) = g.chain_tail().filter(|m| m.is_error()) else {
                return Ok(g.clone());
            };
            let target = match tail.parent_id.and_then(|p| g.get(p)) {
                Some(parent) if parent.role == Role::User => parent.id,
                _ => tail.id,
            };
            debug!(message_id = %target, "pruning dangling error turn");
            g.remove(target)
        });
        if let Err(e) = pruned {
            warn!(session_id = %key, error = %e, "failed to prune error turn");
        }
    }

    fn user_id(plan: &TurnPlan, ids: TurnIds) -> MessageId {
        match plan.kind {
            TurnKind::Regenerate { user, .. } => user,
            _ => ids.user,
        }
    }

    fn upsert_options(plan: &TurnPlan, assistant: MessageId, first: bool) -> UpsertOptions {
        match plan.kind {
            TurnKind::Fresh => UpsertOptions::default(),
            TurnKind::Resend { .. } if first => UpsertOptions::chain_head(),
            TurnKind::Resend { .. } => UpsertOptions::default(),
            TurnKind::Regenerate { replaced, .. } => UpsertOptions::replacing(replaced, assistant),
        }
    }

    /// Write the draft's messages into the graph. Returns false when there
    /// was nothing to write or the turn no longer owns the session.
    fn commit_draft(
        &self,
        key: &SessionKey,
        turn: u64,
        plan: &TurnPlan,
        parent: MessageId,
        draft: &TurnDraft,
        first: bool,
    ) -> Result<bool, GraphError> {
        let Some(ids) = draft.ids() else {
            return Ok(false);
        };
        let user_id = Self::user_id(plan, ids);
        let mut messages = vec![
            draft.user_message(user_id, &plan.message, parent, &plan.files),
            draft.assistant_message(ids.assistant, user_id),
        ];
        messages.extend(draft.second_level_message(ids.assistant));
        let opts = Self::upsert_options(plan, ids.assistant, first);
        let written = self.registry.with_turn(key, turn, |s| {
            let next = s.graph.upsert(messages, &opts)?;
            s.graph = Arc::new(next);
            Ok::<_, GraphError>(())
        });
        written.transpose().map(|w| w.is_some())
    }

    /// Commit the user message and an error reply carrying `message`. Before
    /// ids are known the pair uses the placeholder ids.
    fn commit_failure(
        &self,
        key: &SessionKey,
        turn: u64,
        plan: &TurnPlan,
        parent: MessageId,
        draft: &TurnDraft,
        message: &str,
    ) {
        let (messages, opts) = match (draft.ids(), plan.kind) {
            (Some(ids), _) => {
                let user_id = Self::user_id(plan, ids);
                let mut error = Message::error(ids.assistant, message, user_id);
                error.files = draft.files.clone();
                (
                    vec![draft.user_message(user_id, &plan.message, parent, &plan.files), error],
                    Self::upsert_options(plan, ids.assistant, true),
                )
            }
            (None, TurnKind::Regenerate { user, .. }) => (
                vec![Message::error(MessageId::TEMP_ASSISTANT, message, user)],
                UpsertOptions::default(),
            ),
            (None, _) => (
                vec![
                    Message::user(MessageId::TEMP_USER, plan.message.clone(), parent)
                        .with_files(plan.files.clone()),
                    Message::error(MessageId::TEMP_ASSISTANT, message, MessageId::TEMP_USER),
                ],
                Self::upsert_options(plan, MessageId::TEMP_ASSISTANT, true),
            ),
        };
        let written = self.registry.with_turn(key, turn, |s| {
            let mut base = (*s.graph).clone();
            for temp in [MessageId::TEMP_USER, MessageId::TEMP_ASSISTANT] {
                if base.contains(temp) {
                    base = base.remove(temp)?;
                }
            }
            s.graph = Arc::new(base.upsert(messages, &opts)?);
            Ok::<_, GraphError>(())
        });
        if let Some(Err(e)) = written {
            warn!(session_id = %key, error = %e, "failed to commit error turn");
        }
    }

    /// Hand the session back to the user and, for a session this turn
    /// created, schedule naming.
    fn finish(&self, key: &SessionKey, turn: u64, created: bool, plan: &TurnPlan, session_id: &SessionId) {
        self.registry.release_turn(key, turn);
        if !created || plan.title.is_some() {
            return;
        }
        let sessions = Arc::clone(&self.sessions);
        let delay = self.config.naming_delay();
        let id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = sessions.name_session(&id).await {
                warn!(session_id = %id, error = %e, "failed to name session");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chatstream_core::errors::TransportError;
    use chatstream_core::messages::{FileKind, StopReason, ToolCall};
    use chatstream_core::packets::{AgenticMessageId, Packet, StreamType, SubQuestionEvent, SubQuestionPart};
    use chatstream_source::mock::{MockResponse, MockSessions, MockSource, MockUploader};
    use tokio::task::JoinHandle;

    struct Harness {
        engine: ChatEngine,
        source: Arc<MockSource>,
        sessions: Arc<MockSessions>,
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            naming_delay_ms: 0,
            initial_drain_delay_ms: 0,
            ..Default::default()
        }
    }

    fn harness_with(responses: Vec<MockResponse>, sessions: MockSessions, uploader: MockUploader) -> Harness {
        harness_configured(responses, sessions, uploader, test_config())
    }

    fn harness_configured(
        responses: Vec<MockResponse>,
        sessions: MockSessions,
        uploader: MockUploader,
        config: EngineConfig,
    ) -> Harness {
        let source = Arc::new(MockSource::new(responses));
        let sessions = Arc::new(sessions);
        let engine = ChatEngine::new(
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&sessions) as Arc<dyn SessionService>,
            Arc::new(uploader),
            config,
        );
        Harness { engine, source, sessions }
    }

    fn slow_create_harness(responses: Vec<MockResponse>) -> Harness {
        harness_with(
            responses,
            MockSessions::new().with_create_delay(Duration::from_millis(30)),
            MockUploader::empty(),
        )
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        harness_with(responses, MockSessions::new(), MockUploader::empty())
    }

    fn id(n: i64) -> MessageId {
        MessageId::new(n)
    }

    fn s1() -> SessionKey {
        SessionKey::from(SessionId::from_raw("S1"))
    }

    fn load(h: &Harness, history: Vec<Message>) {
        h.engine
            .load_session(SessionId::from_raw("S1"), history)
            .unwrap();
    }

    fn chain_ids(h: &Harness, key: &SessionKey) -> Vec<i64> {
        h.engine.current_chain(key).iter().map(|m| m.id.get()).collect()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn spawn_submit(engine: &ChatEngine, req: SubmitRequest) -> JoinHandle<Result<TurnReport, EngineError>> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(req).await })
    }

    fn sub_question(num: u32) -> Packet {
        Packet::SubQuestion(SubQuestionEvent {
            level: 0,
            level_question_num: num,
            part: SubQuestionPart::Question { text: format!("step {num}") },
        })
    }

    fn sub_answer_stop(num: u32) -> Packet {
        Packet::Stop {
            stop_reason: None,
            stream_type: Some(StreamType::SubAnswer),
            level: Some(0),
            level_question_num: Some(num),
        }
    }

    fn two_turn_history() -> Vec<Message> {
        vec![
            Message::user(id(1), "a", MessageId::SYSTEM),
            Message::assistant(id(2), "answer a", id(1)),
            Message::user(id(3), "b", id(2)),
            Message::assistant(id(4), "answer b", id(3)),
        ]
    }

    #[tokio::test]
    async fn first_submit_creates_session_and_names_it() {
        let h = harness(vec![MockResponse::answer(1, 2, "Hello")]);
        let report = h.engine.submit(SubmitRequest::new("hi")).await.unwrap();

        assert_eq!(report.session, s1());
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.ids, Some(TurnIds { user: id(1), assistant: id(2) }));
        assert_eq!(h.engine.current_session(), s1());

        let chain = h.engine.current_chain(&s1());
        assert_eq!(chain.len(), 2);
        assert_eq!((chain[0].role, chain[0].body.as_str()), (Role::User, "hi"));
        assert_eq!((chain[1].role, chain[1].body.as_str()), (Role::Assistant, "Hello"));
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
        assert_eq!(h.engine.current_chat_state(&SessionKey::placeholder()), None);

        let req = h.source.last_request().unwrap();
        assert_eq!(req.session_id.as_str(), "S1");
        assert_eq!(req.parent_message_id, None);
        wait_until(|| h.sessions.named().len() == 1).await;
    }

    #[tokio::test]
    async fn explicit_title_skips_naming() {
        let h = harness(vec![MockResponse::answer(1, 2, "ok")]);
        h.engine
            .submit(SubmitRequest::new("hi").with_title("Lease dispute"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.sessions.named().is_empty());
        assert_eq!(h.sessions.created()[0].1.as_deref(), Some("Lease dispute"));
    }

    #[tokio::test]
    async fn second_turn_extends_chain() {
        let h = harness(vec![MockResponse::answer(1, 2, "one"), MockResponse::answer(3, 4, "two")]);
        h.engine.submit(SubmitRequest::new("first")).await.unwrap();
        h.engine.submit(SubmitRequest::new("second")).await.unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2, 3, 4]);
        assert_eq!(h.source.last_request().unwrap().parent_message_id, Some(id(2)));
        assert_eq!(h.sessions.created().len(), 1);
    }

    #[tokio::test]
    async fn delta_before_ids_is_discarded() {
        let h = harness(vec![MockResponse::Packets(vec![
            Packet::answer("a"),
            Packet::ids(1, 2),
            Packet::answer("b"),
        ])]);
        h.engine.submit(SubmitRequest::new("hi")).await.unwrap();
        assert_eq!(h.engine.current_chain(&s1())[1].body, "b");
    }

    #[tokio::test]
    async fn busy_session_rejects_submit_without_mutation() {
        let h = harness(vec![MockResponse::Hold(vec![Packet::ids(1, 2), Packet::answer("thinking")])]);
        let first = spawn_submit(&h.engine, SubmitRequest::new("one"));
        wait_until(|| h.engine.current_chain(&s1()).len() == 2).await;

        let before = h.engine.graph(&s1());
        let err = h.engine.submit(SubmitRequest::new("two")).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy { .. }), "{err}");
        assert!(err.is_rejection());
        assert_eq!(*h.engine.graph(&s1()), *before);
        assert_eq!(h.source.call_count(), 1);

        assert!(h.engine.stop_generating(&s1()));
        assert_eq!(first.await.unwrap().unwrap().outcome, TurnOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_answer() {
        let (response, tx) = MockResponse::channel();
        let h = harness(vec![response]);
        let turn = spawn_submit(&h.engine, SubmitRequest::new("explain"));

        tx.send(Ok(Packet::ids(1, 2))).unwrap();
        tx.send(Ok(Packet::answer("partial"))).unwrap();
        wait_until(|| {
            h.engine
                .current_chain(&s1())
                .last()
                .is_some_and(|m| m.body == "partial")
        })
        .await;
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Streaming));

        assert!(h.engine.stop_generating(&s1()));
        tx.send(Ok(Packet::answer(" and more"))).ok();

        let report = turn.await.unwrap().unwrap();
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        let chain = h.engine.current_chain(&s1());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].body, "partial");
        assert!(chain.iter().all(|m| !m.is_error()));
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
        assert!(!h.engine.stop_generating(&s1()));
    }

    #[tokio::test]
    async fn stop_clears_dangling_tool_call() {
        let (response, tx) = MockResponse::channel();
        let h = harness(vec![response]);
        let turn = spawn_submit(&h.engine, SubmitRequest::new("find statutes"));

        tx.send(Ok(Packet::ids(1, 2))).unwrap();
        tx.send(Ok(Packet::ToolCall(ToolCall {
            tool_name: "run_search".into(),
            tool_args: serde_json::json!({"query": "statutes"}),
            tool_result: None,
        })))
        .unwrap();
        wait_until(|| {
            h.engine
                .current_chain(&s1())
                .last()
                .is_some_and(|m| m.tool_call.is_some())
        })
        .await;
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::ToolBuilding));

        h.engine.stop_generating(&s1());
        turn.await.unwrap().unwrap();
        assert!(h.engine.current_chain(&s1())[1].tool_call.is_none());
    }

    #[tokio::test]
    async fn partial_error_completes_as_error_message() {
        let h = harness(vec![MockResponse::Packets(vec![
            Packet::ids(1, 2),
            sub_question(0),
            sub_question(1),
            sub_answer_stop(0),
            Packet::error("sub-step failed"),
        ])]);
        let report = h.engine.submit(SubmitRequest::new("hi")).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        let last = h.engine.current_chain(&s1()).pop().unwrap();
        assert_eq!((last.id, last.role), (id(2), Role::Error));
        assert_eq!(last.body, "sub-step failed");
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
    }

    #[tokio::test]
    async fn terminal_error_fails_turn() {
        let h = harness(vec![MockResponse::Packets(vec![
            Packet::ids(1, 2),
            sub_question(0),
            sub_question(1),
            sub_answer_stop(0),
            sub_answer_stop(1),
            Packet::error("synthesis failed"),
            Packet::answer("never applied"),
        ])]);
        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert!(matches!(&err, EngineError::Turn { message } if message == "synthesis failed"));
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
        let last = h.engine.current_chain(&s1()).pop().unwrap();
        assert_eq!((last.id, last.role), (id(2), Role::Error));
        assert_eq!(last.body, "synthesis failed");
    }

    #[tokio::test]
    async fn error_before_ids_commits_nothing() {
        let h = harness(vec![MockResponse::Packets(vec![Packet::error("quota exceeded")])]);
        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(h.engine.current_chain(&s1()).is_empty());
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
    }

    #[tokio::test]
    async fn open_failure_commits_placeholder_pair_then_prunes_it() {
        let h = harness(vec![
            MockResponse::Fail(TransportError::Status { status: 503, body: "unavailable".into() }),
            MockResponse::answer(1, 2, "ok"),
        ]);
        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(chain_ids(&h, &s1()), [MessageId::TEMP_USER.get(), MessageId::TEMP_ASSISTANT.get()]);
        assert!(h.engine.current_chain(&s1())[1].is_error());

        h.engine.submit(SubmitRequest::new("retry")).await.unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2]);
        let graph = h.engine.graph(&s1());
        assert!(!graph.contains(MessageId::TEMP_USER));
        assert!(!graph.contains(MessageId::TEMP_ASSISTANT));
        assert_eq!(h.source.last_request().unwrap().parent_message_id, None);
    }

    #[tokio::test]
    async fn interrupted_stream_commits_error_reply() {
        let h = harness(vec![MockResponse::Interrupted(
            vec![Packet::ids(1, 2), Packet::answer("half")],
            TransportError::Interrupted("connection reset".into()),
        )]);
        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        let last = h.engine.current_chain(&s1()).pop().unwrap();
        assert_eq!((last.id, last.role), (id(2), Role::Error));
    }

    #[tokio::test]
    async fn session_migration_is_atomic() {
        let (response, tx) = MockResponse::channel();
        let h = harness_with(
            vec![response],
            MockSessions::new().with_create_delay(Duration::from_millis(30)),
            MockUploader::empty(),
        );
        let placeholder = SessionKey::placeholder();
        let turn = spawn_submit(&h.engine, SubmitRequest::new("hi"));

        wait_until(|| h.engine.current_chat_state(&placeholder) == Some(ChatState::Loading)).await;
        assert_eq!(h.engine.current_chat_state(&s1()), None);

        wait_until(|| h.engine.current_session() == s1()).await;
        assert_eq!(h.engine.current_chat_state(&placeholder), None);
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Loading));

        tx.send(Ok(Packet::ids(1, 2))).unwrap();
        tx.send(Ok(Packet::answer("done"))).unwrap();
        drop(tx);
        let report = turn.await.unwrap().unwrap();
        assert_eq!(report.session, s1());
        assert_eq!(chain_ids(&h, &s1()), [1, 2]);
    }

    #[tokio::test]
    async fn stop_during_session_creation_leaves_next_turn_alone() {
        let h = slow_create_harness(vec![MockResponse::answer(1, 2, "second")]);
        let placeholder = SessionKey::placeholder();
        let first = spawn_submit(&h.engine, SubmitRequest::new("a"));
        wait_until(|| h.engine.current_chat_state(&placeholder) == Some(ChatState::Loading)).await;

        assert!(h.engine.stop_generating(&placeholder));
        assert_eq!(h.engine.current_chat_state(&placeholder), Some(ChatState::Input));

        let second = h.engine.submit(SubmitRequest::new("b")).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.outcome, TurnOutcome::Cancelled);
        assert_eq!(second.outcome, TurnOutcome::Completed);
        assert_ne!(first.session, second.session);

        assert_eq!(chain_ids(&h, &second.session), [1, 2]);
        assert_eq!(h.engine.current_chat_state(&second.session), Some(ChatState::Input));
        assert_eq!(h.engine.current_chat_state(&first.session), None);
        assert_eq!(h.engine.current_chat_state(&placeholder), None);
        assert_eq!(h.engine.current_session(), second.session);
        assert_eq!(h.source.call_count(), 1);
    }

    #[tokio::test]
    async fn close_during_session_creation_discards_the_turn() {
        let h = slow_create_harness(vec![MockResponse::answer(1, 2, "fresh")]);
        let placeholder = SessionKey::placeholder();
        let first = spawn_submit(&h.engine, SubmitRequest::new("a"));
        wait_until(|| h.engine.current_chat_state(&placeholder) == Some(ChatState::Loading)).await;

        h.engine.close();
        assert_eq!(h.engine.current_chat_state(&placeholder), None);

        let second = h.engine.submit(SubmitRequest::new("b")).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.outcome, TurnOutcome::Cancelled);
        assert_eq!(second.outcome, TurnOutcome::Completed);
        assert_eq!(h.engine.current_chat_state(&first.session), None);
        assert_eq!(h.engine.current_chain(&second.session)[1].body, "fresh");
        assert_eq!(h.engine.current_chat_state(&second.session), Some(ChatState::Input));

        let follow_up = h.engine.submit(SubmitRequest::new("c")).await;
        assert!(!matches!(follow_up, Err(EngineError::Busy { .. })));
    }

    #[tokio::test]
    async fn default_model_is_sent_and_recorded_each_turn() {
        let model = ModelSelection {
            provider: "openai".into(),
            model_name: "gpt-4o".into(),
            temperature: None,
        };
        let h = harness_configured(
            vec![MockResponse::answer(1, 2, "one"), MockResponse::answer(3, 4, "two")],
            MockSessions::new(),
            MockUploader::empty(),
            EngineConfig {
                default_model: Some(model.clone()),
                ..test_config()
            },
        );
        h.engine.submit(SubmitRequest::new("first")).await.unwrap();
        h.engine.submit(SubmitRequest::new("second")).await.unwrap();

        assert_eq!(h.source.last_request().unwrap().model, Some(model.clone()));
        wait_until(|| h.sessions.model_overrides().len() == 2).await;
        assert!(h
            .sessions
            .model_overrides()
            .iter()
            .all(|(id, m)| id.as_str() == "S1" && *m == model));
    }

    #[tokio::test]
    async fn loaded_root_is_never_sent_as_parent() {
        let h = harness(vec![MockResponse::answer(2, 3, "hello"), MockResponse::answer(4, 5, "again")]);
        load(&h, vec![Message::system_root(id(0))]);

        h.engine.submit(SubmitRequest::new("hi")).await.unwrap();
        assert_eq!(h.source.last_request().unwrap().parent_message_id, None);
        assert_eq!(chain_ids(&h, &s1()), [2, 3]);

        h.engine.resend(id(2), None).await.unwrap();
        assert_eq!(h.source.last_request().unwrap().parent_message_id, None);
        assert_eq!(h.engine.graph(&s1()).children_of(id(0)), &[id(2), id(4)]);
    }

    #[tokio::test]
    async fn session_creation_failure_releases_placeholder() {
        let h = harness_with(
            vec![MockResponse::answer(1, 2, "unused")],
            MockSessions::new().failing_create(TransportError::Network("offline".into())),
            MockUploader::empty(),
        );
        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionCreate(_)));
        assert_eq!(
            h.engine.current_chat_state(&SessionKey::placeholder()),
            Some(ChatState::Input)
        );
        assert_eq!(h.source.call_count(), 0);
    }

    #[tokio::test]
    async fn regeneration_replaces_answer() {
        let h = harness(vec![MockResponse::answer(6, 9, "new answer")]);
        load(
            &h,
            vec![
                Message::user(id(6), "question", MessageId::SYSTEM),
                Message::assistant(id(7), "old answer", id(6)),
            ],
        );

        h.engine.regenerate(id(7), None).await.unwrap();

        let graph = h.engine.graph(&s1());
        assert_eq!(graph.children_of(id(6)), &[id(9)]);
        assert!(!graph.contains(id(7)));
        assert_eq!(chain_ids(&h, &s1()), [6, 9]);
        assert_eq!(h.engine.current_chain(&s1())[1].body, "new answer");

        let req = h.source.last_request().unwrap();
        assert!(req.regenerate);
        assert_eq!(req.message, "question");
        assert_eq!(req.parent_message_id, None);
        assert_eq!(h.engine.regeneration_state(&s1()), None);
    }

    #[tokio::test]
    async fn regeneration_state_lasts_until_ids_arrive() {
        let (response, tx) = MockResponse::channel();
        let h = harness(vec![response]);
        load(
            &h,
            vec![
                Message::user(id(6), "question", MessageId::SYSTEM),
                Message::assistant(id(7), "old answer", id(6)),
            ],
        );
        let model = ModelSelection {
            provider: "openai".into(),
            model_name: "gpt-4o".into(),
            temperature: None,
        };
        let turn = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.regenerate(id(7), Some(model)).await })
        };

        wait_until(|| h.engine.regeneration_state(&s1()).is_some()).await;
        assert_eq!(
            h.engine.regeneration_state(&s1()),
            Some(RegenerationState::replacing_after(id(6)))
        );
        tx.send(Ok(Packet::ids(6, 9))).unwrap();
        wait_until(|| h.engine.regeneration_state(&s1()).is_none()).await;
        drop(tx);
        turn.await.unwrap().unwrap();

        wait_until(|| h.sessions.model_overrides().len() == 1).await;
        assert_eq!(h.sessions.model_overrides()[0].1.model_name, "gpt-4o");
    }

    #[tokio::test]
    async fn resend_keeps_error_turn_as_sibling() {
        let h = harness(vec![MockResponse::answer(3, 4, "recovered")]);
        load(
            &h,
            vec![
                Message::user(id(1), "q", MessageId::SYSTEM),
                Message::error(id(2), "boom", id(1)),
            ],
        );
        h.engine.resend(id(1), None).await.unwrap();

        assert_eq!(chain_ids(&h, &s1()), [3, 4]);
        let graph = h.engine.graph(&s1());
        assert_eq!(graph.children_of(MessageId::SYSTEM), &[id(1), id(3)]);
        assert!(graph.contains(id(2)));
        assert_eq!(h.source.last_request().unwrap().message, "q");
    }

    #[tokio::test]
    async fn edit_branches_and_switch_returns() {
        let h = harness(vec![MockResponse::answer(5, 6, "edited answer")]);
        load(&h, two_turn_history());

        h.engine.edit_message(id(3), "b2").await.unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2, 5, 6]);
        assert_eq!(h.engine.current_chain(&s1())[2].body, "b2");
        assert_eq!(h.engine.graph(&s1()).children_of(id(2)), &[id(3), id(5)]);

        h.engine.switch_branch(id(3)).unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2, 3, 4]);
        wait_until(|| h.sessions.latest_messages() == vec![id(3)]).await;

        let err = h.engine.switch_branch(id(99)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownMessage(_)));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn fresh_submit_prunes_trailing_error_turn() {
        let h = harness(vec![MockResponse::answer(5, 6, "good")]);
        let mut history = two_turn_history();
        history[3] = Message::error(id(4), "failed", id(3));
        load(&h, history);

        h.engine.submit(SubmitRequest::new("again")).await.unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2, 5, 6]);
        let graph = h.engine.graph(&s1());
        assert!(!graph.contains(id(3)));
        assert!(!graph.contains(id(4)));
        assert_eq!(h.source.last_request().unwrap().parent_message_id, Some(id(2)));
    }

    #[tokio::test]
    async fn continue_after_context_cutoff() {
        let h = harness(vec![
            MockResponse::Packets(vec![
                Packet::ids(1, 2),
                Packet::answer("part"),
                Packet::Stop {
                    stop_reason: Some(StopReason::ContextLength),
                    stream_type: None,
                    level: None,
                    level_question_num: None,
                },
            ]),
            MockResponse::answer(3, 4, "rest"),
        ]);
        h.engine.submit(SubmitRequest::new("long question")).await.unwrap();
        assert!(h.engine.can_continue(&s1()));

        h.engine.continue_generating().await.unwrap();
        let req = h.source.last_request().unwrap();
        assert_eq!(req.message, h.engine.config().continue_prompt);
        assert_eq!(req.parent_message_id, Some(id(2)));
        assert!(!h.engine.can_continue(&s1()));
        assert_eq!(chain_ids(&h, &s1()), [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn continue_needs_a_conversation() {
        let h = harness(vec![]);
        let err = h.engine.continue_generating().await.unwrap_err();
        assert!(matches!(err, EngineError::EmptySession(_)));
    }

    #[tokio::test]
    async fn upload_blocks_submit_until_done() {
        let h = harness_with(
            vec![],
            MockSessions::new(),
            MockUploader::new(Ok(vec![FileDescriptor::image("f1")])).with_delay(Duration::from_millis(50)),
        );
        let upload = {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .upload(vec![UploadRequest {
                        name: "scan.png".into(),
                        kind: FileKind::Image,
                        content: vec![0; 4],
                    }])
                    .await
            })
        };
        let placeholder = SessionKey::placeholder();
        wait_until(|| h.engine.current_chat_state(&placeholder) == Some(ChatState::Uploading)).await;

        let err = h.engine.submit(SubmitRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, EngineError::UploadInProgress(_)));

        let files = upload.await.unwrap().unwrap();
        assert_eq!(files[0].id, "f1");
        assert_eq!(h.engine.current_chat_state(&placeholder), Some(ChatState::Input));
    }

    #[tokio::test]
    async fn feedback_is_forwarded() {
        let h = harness(vec![]);
        load(&h, two_turn_history());
        h.engine
            .feedback(id(2), FeedbackKind::Like, "precise", None)
            .await
            .unwrap();
        let recorded = h.sessions.feedback();
        assert_eq!(recorded[0].0, id(2));
        assert_eq!(recorded[0].1.details, "precise");

        let err = h.engine.feedback(id(42), FeedbackKind::Dislike, "", None).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownMessage(_)));
    }

    #[tokio::test]
    async fn failed_feedback_surfaces_transport_error() {
        let h = harness_with(
            vec![],
            MockSessions::new().failing_feedback(TransportError::Status { status: 500, body: "no".into() }),
            MockUploader::empty(),
        );
        load(&h, two_turn_history());
        let err = h.engine.feedback(id(2), FeedbackKind::Like, "", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn sessions_stream_independently() {
        let (response, tx) = MockResponse::channel();
        let h = harness(vec![response, MockResponse::answer(3, 4, "second session")]);
        load(&h, vec![]);
        let first = spawn_submit(&h.engine, SubmitRequest::new("slow").in_session(s1()));
        wait_until(|| h.source.call_count() == 1).await;

        let s2 = SessionKey::from(SessionId::from_raw("S2"));
        h.engine.load_session(SessionId::from_raw("S2"), vec![]).unwrap();
        h.engine.submit(SubmitRequest::new("fast")).await.unwrap();
        assert_eq!(chain_ids(&h, &s2), [3, 4]);
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Loading));

        tx.send(Ok(Packet::ids(1, 2))).unwrap();
        drop(tx);
        first.await.unwrap().unwrap();
        assert_eq!(chain_ids(&h, &s1()), [1, 2]);
        assert_eq!(h.engine.current_session(), s2);
    }

    #[tokio::test]
    async fn switch_session_leaves_other_turn_running() {
        let h = harness(vec![MockResponse::Hold(vec![Packet::ids(1, 2), Packet::answer("x")])]);
        load(&h, vec![]);
        let turn = spawn_submit(&h.engine, SubmitRequest::new("hi"));
        wait_until(|| h.engine.current_chain(&s1()).len() == 2).await;

        let s2 = SessionKey::from(SessionId::from_raw("S2"));
        h.engine.switch_session(s2.clone());
        assert_eq!(h.engine.current_session(), s2);
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Streaming));

        h.engine.switch_session(s1());
        assert!(h.engine.stop_generating(&s1()));
        assert_eq!(turn.await.unwrap().unwrap().outcome, TurnOutcome::Cancelled);
        assert_eq!(chain_ids(&h, &s1()), [1, 2]);
    }

    #[tokio::test]
    async fn close_aborts_and_evicts() {
        let h = harness(vec![MockResponse::Hold(vec![Packet::ids(1, 2), Packet::answer("x")])]);
        let turn = spawn_submit(&h.engine, SubmitRequest::new("hi"));
        wait_until(|| h.engine.current_chain(&s1()).len() == 2).await;

        h.engine.close();
        assert_eq!(turn.await.unwrap().unwrap().outcome, TurnOutcome::Cancelled);
        assert!(h.engine.current_session().is_placeholder());
        assert_eq!(h.engine.current_chat_state(&s1()), None);
        assert!(h.engine.current_chain(&s1()).is_empty());
    }

    #[tokio::test]
    async fn agentic_answer_commits_second_level_node() {
        let h = harness(vec![MockResponse::Packets(vec![
            Packet::ids(1, 2),
            Packet::AgenticMessageIds {
                agentic_message_ids: vec![AgenticMessageId { level: 1, message_id: id(3) }],
            },
            Packet::answer("base"),
            Packet::AnswerDelta { answer_piece: "refined".into(), level: Some(1) },
            Packet::RefinedAnswerImprovement { refined_answer_improvement: true },
        ])]);
        h.engine.submit(SubmitRequest::new("hard question")).await.unwrap();

        assert_eq!(chain_ids(&h, &s1()), [1, 2, 3]);
        let graph = h.engine.graph(&s1());
        let second = graph.get(id(3)).unwrap();
        assert_eq!(second.parent_id, Some(id(2)));
        assert_eq!(second.body, "refined");
        let detail = graph.get(id(2)).unwrap().detail.as_ref().unwrap();
        assert_eq!(detail.is_improvement, Some(true));
    }

    #[tokio::test]
    async fn resend_preempts_in_flight_turn() {
        let h = harness(vec![
            MockResponse::Hold(vec![Packet::ids(3, 4), Packet::answer("slow")]),
            MockResponse::answer(5, 6, "fast"),
        ]);
        load(
            &h,
            vec![
                Message::user(id(1), "q", MessageId::SYSTEM),
                Message::assistant(id(2), "a", id(1)),
            ],
        );
        let first = spawn_submit(&h.engine, SubmitRequest::new("follow-up"));
        wait_until(|| h.engine.current_chain(&s1()).len() == 4).await;

        let report = h.engine.resend(id(1), Some("q, rephrased".into())).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(first.await.unwrap().unwrap().outcome, TurnOutcome::Cancelled);
        assert_eq!(chain_ids(&h, &s1()), [5, 6]);
        assert_eq!(h.engine.current_chat_state(&s1()), Some(ChatState::Input));
    }

    #[tokio::test]
    async fn invalid_targets_are_rejected() {
        let h = harness(vec![]);
        load(&h, two_turn_history());
        let before = h.engine.graph(&s1());

        let err = h.engine.resend(id(42), None).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownMessage(_)));
        let err = h.engine.resend(id(2), None).await.unwrap_err();
        assert!(matches!(err, EngineError::WrongRole { .. }));
        let err = h.engine.regenerate(id(1), None).await.unwrap_err();
        assert!(matches!(err, EngineError::WrongRole { .. }));
        let err = h.engine.edit_message(id(4), "x").await.unwrap_err();
        assert!(err.is_rejection());

        assert_eq!(*h.engine.graph(&s1()), *before);
        assert_eq!(h.source.call_count(), 0);
    }
}
