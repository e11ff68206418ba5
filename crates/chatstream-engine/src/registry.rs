//! Per-session bookkeeping.
//!
//! All per-session state lives in one map behind one lock, so moving a
//! placeholder entry to its server-assigned id is a single write.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chatstream_core::ids::SessionKey;
use chatstream_core::state::{ChatState, RegenerationState};

use crate::graph::{GraphError, MessageGraph};

/// Cancellation handle of the turn currently streaming into a session.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    pub turn: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub chat_state: ChatState,
    pub regeneration: Option<RegenerationState>,
    pub can_continue: bool,
    pub abort: Option<AbortHandle>,
    pub graph: Arc<MessageGraph>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionKey, SessionState>,
    current: SessionKey,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SessionKey {
        self.inner.read().current.clone()
    }

    pub fn set_current(&self, key: SessionKey) {
        self.inner.write().current = key;
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.inner.read().sessions.contains_key(key)
    }

    /// `None` when the session has no entry at all.
    pub fn chat_state(&self, key: &SessionKey) -> Option<ChatState> {
        self.inner.read().sessions.get(key).map(|s| s.chat_state)
    }

    pub fn set_chat_state(&self, key: &SessionKey, state: ChatState) {
        self.inner.write().sessions.entry(key.clone()).or_default().chat_state = state;
    }

    pub fn regeneration(&self, key: &SessionKey) -> Option<RegenerationState> {
        self.inner.read().sessions.get(key).and_then(|s| s.regeneration)
    }

    pub fn set_regeneration(&self, key: &SessionKey, state: Option<RegenerationState>) {
        self.inner.write().sessions.entry(key.clone()).or_default().regeneration = state;
    }

    pub fn can_continue(&self, key: &SessionKey) -> bool {
        self.inner.read().sessions.get(key).is_some_and(|s| s.can_continue)
    }

    pub fn set_can_continue(&self, key: &SessionKey, value: bool) {
        self.inner.write().sessions.entry(key.clone()).or_default().can_continue = value;
    }

    /// Register `handle` as the session's live turn, returning the handle it
    /// displaced.
    pub fn install_abort(&self, key: &SessionKey, handle: AbortHandle) -> Option<AbortHandle> {
        self.inner.write().sessions.entry(key.clone()).or_default().abort.replace(handle)
    }

    pub fn take_abort(&self, key: &SessionKey) -> Option<AbortHandle> {
        self.inner.write().sessions.get_mut(key).and_then(|s| s.abort.take())
    }

    /// Id of the turn that currently owns the session, if any.
    pub fn active_turn(&self, key: &SessionKey) -> Option<u64> {
        self.inner
            .read()
            .sessions
            .get(key)
            .and_then(|s| s.abort.as_ref().map(|a| a.turn))
    }

    /// Claim the session for a new turn: move it to `loading` and install
    /// `handle`. A busy session is rejected with its current state unless
    /// `preempt` is set and it is answering, in which case the displaced
    /// handle is returned for the caller to cancel.
    pub fn try_claim(
        &self,
        key: &SessionKey,
        handle: AbortHandle,
        preempt: bool,
    ) -> Result<Option<AbortHandle>, ChatState> {
        let mut inner = self.inner.write();
        let state = inner.sessions.entry(key.clone()).or_default();
        match state.chat_state {
            ChatState::Input => {}
            busy if preempt && busy.is_answering() => {}
            busy => return Err(busy),
        }
        state.chat_state = ChatState::Loading;
        state.can_continue = false;
        Ok(state.abort.replace(handle))
    }

    /// Move an idle session into `next` without installing a turn.
    pub fn try_enter(&self, key: &SessionKey, next: ChatState) -> Result<(), ChatState> {
        let mut inner = self.inner.write();
        let state = inner.sessions.entry(key.clone()).or_default();
        if state.chat_state != ChatState::Input {
            return Err(state.chat_state);
        }
        state.chat_state = next;
        Ok(())
    }

    /// Run `f` only if `turn` still owns the session.
    pub fn with_turn<R>(
        &self,
        key: &SessionKey,
        turn: u64,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(key) {
            Some(state) if state.abort.as_ref().is_some_and(|a| a.turn == turn) => Some(f(state)),
            _ => None,
        }
    }

    /// Give the session back to the user if `turn` still owns it.
    pub fn release_turn(&self, key: &SessionKey, turn: u64) -> bool {
        self.with_turn(key, turn, |state| {
            state.abort = None;
            state.regeneration = None;
            state.chat_state = ChatState::Input;
        })
        .is_some()
    }

    pub fn graph(&self, key: &SessionKey) -> Arc<MessageGraph> {
        self.inner
            .read()
            .sessions
            .get(key)
            .map(|s| Arc::clone(&s.graph))
            .unwrap_or_default()
    }

    /// Read the freshest graph, derive the next one, store it. The lock is
    /// held across `f`, so concurrent writers never extend a stale copy.
    pub fn update_graph(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&MessageGraph) -> Result<MessageGraph, GraphError>,
    ) -> Result<Arc<MessageGraph>, GraphError> {
        let mut inner = self.inner.write();
        let state = inner.sessions.entry(key.clone()).or_default();
        let next = Arc::new(f(&state.graph)?);
        state.graph = Arc::clone(&next);
        Ok(next)
    }

    /// Move every piece of state from `old` to `new` in one step, but only
    /// while `turn` still owns `old`. The current session follows the move.
    /// Returns false, leaving everything in place, when the turn was stopped
    /// or displaced in the meantime.
    pub fn migrate_turn(&self, old: &SessionKey, new: &SessionKey, turn: u64) -> bool {
        let mut inner = self.inner.write();
        let owned = inner
            .sessions
            .get(old)
            .is_some_and(|s| s.abort.as_ref().is_some_and(|a| a.turn == turn));
        if !owned {
            debug!(from = %old, to = %new, turn, "turn no longer owns session, not migrating");
            return false;
        }
        if old == new {
            return true;
        }
        if let Some(state) = inner.sessions.remove(old) {
            inner.sessions.insert(new.clone(), state);
        }
        if inner.current == *old {
            inner.current = new.clone();
        }
        debug!(from = %old, to = %new, turn, "session migrated");
        true
    }

    /// Insert a fully formed session, replacing any previous entry.
    pub fn seed(&self, key: SessionKey, state: SessionState) {
        self.inner.write().sessions.insert(key, state);
    }

    pub fn evict(&self, key: &SessionKey) -> Option<SessionState> {
        self.inner.write().sessions.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_core::ids::{MessageId, SessionId};
    use chatstream_core::messages::Message;

    use crate::graph::UpsertOptions;

    fn s1() -> SessionKey {
        SessionKey::from(SessionId::from_raw("S1"))
    }

    fn handle(turn: u64) -> AbortHandle {
        AbortHandle {
            turn,
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn absent_session_reads_as_none() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.chat_state(&s1()), None);
        assert!(!reg.can_continue(&s1()));
        assert!(reg.graph(&s1()).is_empty());
        assert!(reg.current().is_placeholder());
    }

    #[test]
    fn migrate_moves_everything_at_once() {
        let reg = SessionRegistry::new();
        let placeholder = SessionKey::placeholder();
        reg.set_chat_state(&placeholder, ChatState::Loading);
        reg.set_can_continue(&placeholder, true);
        reg.set_regeneration(&placeholder, Some(RegenerationState::replacing_after(MessageId::new(4))));
        reg.install_abort(&placeholder, handle(1));
        reg.update_graph(&placeholder, |g| {
            g.upsert(vec![Message::user(MessageId::new(1), "hi", MessageId::SYSTEM)], &UpsertOptions::default())
        })
        .unwrap();

        assert!(reg.migrate_turn(&placeholder, &s1(), 1));

        assert_eq!(reg.chat_state(&placeholder), None);
        assert_eq!(reg.chat_state(&s1()), Some(ChatState::Loading));
        assert!(reg.can_continue(&s1()));
        assert!(reg.regeneration(&s1()).is_some());
        assert_eq!(reg.active_turn(&s1()), Some(1));
        assert_eq!(reg.graph(&s1()).len(), 2);
        assert_eq!(reg.current(), s1());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn migrate_leaves_current_alone_when_elsewhere() {
        let reg = SessionRegistry::new();
        let other = SessionKey::from(SessionId::from_raw("S0"));
        reg.set_current(other.clone());
        reg.set_chat_state(&SessionKey::placeholder(), ChatState::Loading);
        reg.install_abort(&SessionKey::placeholder(), handle(1));
        assert!(reg.migrate_turn(&SessionKey::placeholder(), &s1(), 1));
        assert_eq!(reg.current(), other);
        assert_eq!(reg.chat_state(&s1()), Some(ChatState::Loading));
    }

    #[test]
    fn migrate_refused_for_displaced_turn() {
        let reg = SessionRegistry::new();
        let placeholder = SessionKey::placeholder();
        reg.set_chat_state(&placeholder, ChatState::Loading);
        reg.install_abort(&placeholder, handle(2));

        assert!(!reg.migrate_turn(&placeholder, &s1(), 1));
        assert_eq!(reg.active_turn(&placeholder), Some(2));
        assert_eq!(reg.chat_state(&placeholder), Some(ChatState::Loading));
        assert!(!reg.contains(&s1()));
        assert_eq!(reg.current(), placeholder);

        reg.take_abort(&placeholder);
        assert!(!reg.migrate_turn(&placeholder, &s1(), 2));
        assert!(!reg.migrate_turn(&s1(), &placeholder, 2));
    }

    #[test]
    fn release_only_by_owning_turn() {
        let reg = SessionRegistry::new();
        reg.set_chat_state(&s1(), ChatState::Streaming);
        reg.install_abort(&s1(), handle(1));
        let displaced = reg.install_abort(&s1(), handle(2));
        assert_eq!(displaced.map(|h| h.turn), Some(1));

        assert!(!reg.release_turn(&s1(), 1));
        assert_eq!(reg.chat_state(&s1()), Some(ChatState::Streaming));
        assert!(reg.release_turn(&s1(), 2));
        assert_eq!(reg.chat_state(&s1()), Some(ChatState::Input));
        assert!(reg.take_abort(&s1()).is_none());
    }

    #[test]
    fn claim_rejects_busy_sessions() {
        let reg = SessionRegistry::new();
        reg.set_can_continue(&s1(), true);
        assert!(reg.try_claim(&s1(), handle(1), false).unwrap().is_none());
        assert_eq!(reg.chat_state(&s1()), Some(ChatState::Loading));
        assert!(!reg.can_continue(&s1()));
        assert_eq!(reg.try_claim(&s1(), handle(2), false).unwrap_err(), ChatState::Loading);
        assert_eq!(reg.active_turn(&s1()), Some(1));

        let displaced = reg.try_claim(&s1(), handle(3), true).unwrap();
        assert_eq!(displaced.map(|h| h.turn), Some(1));
        assert_eq!(reg.active_turn(&s1()), Some(3));
    }

    #[test]
    fn uploads_block_even_preempting_claims() {
        let reg = SessionRegistry::new();
        reg.try_enter(&s1(), ChatState::Uploading).unwrap();
        assert_eq!(reg.try_claim(&s1(), handle(1), true).unwrap_err(), ChatState::Uploading);
        assert_eq!(reg.try_enter(&s1(), ChatState::Uploading).unwrap_err(), ChatState::Uploading);
    }

    #[test]
    fn with_turn_ignores_stale_turns() {
        let reg = SessionRegistry::new();
        reg.install_abort(&s1(), handle(4));
        assert_eq!(reg.with_turn(&s1(), 4, |s| s.can_continue = true), Some(()));
        assert_eq!(reg.with_turn(&s1(), 5, |s| s.can_continue = false), None);
        assert!(reg.can_continue(&s1()));
    }

    #[test]
    fn failed_graph_update_keeps_previous_graph() {
        let reg = SessionRegistry::new();
        let err = reg
            .update_graph(&s1(), |g| {
                g.upsert(
                    vec![Message::user(MessageId::new(1), "hi", MessageId::SYSTEM)],
                    &UpsertOptions::default(),
                )?
                .set_latest_child(MessageId::new(1), MessageId::new(99))
            })
            .unwrap_err();
        assert_eq!(err, GraphError::NotAChild { parent: MessageId::new(1), child: MessageId::new(99) });
        assert!(reg.graph(&s1()).is_empty());
    }

    #[test]
    fn evict_drops_the_graph() {
        let reg = SessionRegistry::new();
        reg.seed(s1(), SessionState::default());
        assert!(reg.contains(&s1()));
        assert!(reg.evict(&s1()).is_some());
        assert!(reg.is_empty());
    }
}
