//! Per-session message graph.
//!
//! An arena of messages indexed by id. Every mutation returns a new graph and
//! leaves the receiver untouched, so a stored `Arc<MessageGraph>` is always a
//! consistent snapshot.

use std::collections::{BTreeMap, HashMap};

use chatstream_core::ids::MessageId;
use chatstream_core::messages::{Message, Role};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("message {0} not found")]
    UnknownMessage(MessageId),
    #[error("message {child} is not a child of {parent}")]
    NotAChild { parent: MessageId, child: MessageId },
    #[error("parent {parent} of message {child} is not in the graph")]
    MissingParent { parent: MessageId, child: MessageId },
    #[error("message {0} has no parent")]
    Orphan(MessageId),
}

/// Options for [`MessageGraph::upsert`].
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// old id -> new id. When a message with a new id is supplied, the old
    /// message is spliced out first.
    pub replacements: BTreeMap<MessageId, MessageId>,
    /// Point the tail of the current chain at the first supplied message.
    pub chain_head: bool,
    /// Register new children without moving their parent's branch pointer.
    pub preserve_branch: bool,
}

impl UpsertOptions {
    pub fn replacing(old: MessageId, new: MessageId) -> Self {
        let mut replacements = BTreeMap::new();
        replacements.insert(old, new);
        Self {
            replacements,
            ..Default::default()
        }
    }

    pub fn chain_head() -> Self {
        Self {
            chain_head: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageGraph {
    nodes: HashMap<MessageId, Message>,
    root: Option<MessageId>,
}

impl MessageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from server-provided history. Linkage fields on the
    /// input are ignored and recomputed from `parent_id`; the last child seen
    /// for each parent becomes its branch pointer unless the input names one.
    pub fn from_history(messages: Vec<Message>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut pointers = Vec::new();
        let mut pending: Vec<Message> = Vec::with_capacity(messages.len());
        for mut m in messages {
            if let Some(latest) = m.latest_child_id.take() {
                pointers.push((m.id, latest));
            }
            m.children_ids.clear();
            pending.push(m);
        }
        graph = graph.upsert(pending, &UpsertOptions::default())?;
        for (parent, child) in pointers {
            if graph.children_of(parent).contains(&child) {
                graph = graph.set_latest_child(parent, child)?;
            }
        }
        Ok(graph)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<&Message> {
        self.root.and_then(|id| self.nodes.get(&id))
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn children_of(&self, id: MessageId) -> &[MessageId] {
        self.nodes
            .get(&id)
            .map(|m| m.children_ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.nodes.values()
    }

    /// The displayed conversation: follow branch pointers from the root.
    /// The synthetic root itself is not part of the chain.
    pub fn project_chain(&self) -> Vec<&Message> {
        let mut chain = Vec::new();
        let Some(root) = self.root() else {
            return chain;
        };
        let mut next = root.latest_child_id;
        while let Some(id) = next {
            let Some(msg) = self.nodes.get(&id) else { break };
            chain.push(msg);
            next = msg.latest_child_id;
        }
        chain
    }

    /// Last node of the displayed chain, falling back to the root.
    pub fn chain_tail(&self) -> Option<&Message> {
        self.project_chain().last().copied().or_else(|| self.root())
    }

    /// Insert or overwrite each message by id, keeping parent/child links and
    /// branch pointers consistent.
    pub fn upsert(&self, mut messages: Vec<Message>, opts: &UpsertOptions) -> Result<Self, GraphError> {
        let mut next = self.clone();
        if messages.is_empty() {
            return Ok(next);
        }

        if next.is_empty() {
            let first = &mut messages[0];
            if first.parent_id.is_none() && first.role == Role::System {
                next.root = Some(first.id);
            } else {
                let root_id = first.parent_id.unwrap_or(MessageId::SYSTEM);
                next.nodes.insert(root_id, Message::system_root(root_id));
                next.root = Some(root_id);
                first.parent_id = Some(root_id);
            }
        }

        let tail = if opts.chain_head {
            self.chain_tail().map(|m| m.id)
        } else {
            None
        };
        let head = messages[0].id;

        for mut msg in messages {
            if let Some(old) = opts
                .replacements
                .iter()
                .find(|(old, new)| **new == msg.id && **old != msg.id)
                .map(|(old, _)| *old)
            {
                next.splice_out(old);
            }

            match next.nodes.get(&msg.id) {
                Some(existing) => {
                    let mut children = existing.children_ids.clone();
                    for child in msg.children_ids.drain(..) {
                        if !children.contains(&child) {
                            children.push(child);
                        }
                    }
                    msg.children_ids = children;
                    if msg.latest_child_id.is_none() {
                        msg.latest_child_id = existing.latest_child_id;
                    }
                    msg.parent_id = existing.parent_id;
                }
                None if next.root == Some(msg.id) => {}
                None => {
                    let Some(parent_id) = msg.parent_id else {
                        return Err(GraphError::Orphan(msg.id));
                    };
                    let parent = next.nodes.get_mut(&parent_id).ok_or(GraphError::MissingParent {
                        parent: parent_id,
                        child: msg.id,
                    })?;
                    if !parent.children_ids.contains(&msg.id) {
                        parent.children_ids.push(msg.id);
                    }
                    if !opts.preserve_branch || parent.latest_child_id.is_none() {
                        parent.latest_child_id = Some(msg.id);
                    }
                }
            }
            next.nodes.insert(msg.id, msg);
        }

        if let Some(tail) = tail {
            if next.children_of(tail).contains(&head) {
                if let Some(node) = next.nodes.get_mut(&tail) {
                    node.latest_child_id = Some(head);
                }
            } else {
                tracing::debug!(%tail, %head, "chain head is not a child of the chain tail, pointer left as is");
            }
        }

        next.normalize();
        Ok(next)
    }

    /// Explicit branch switch.
    pub fn set_latest_child(&self, parent: MessageId, child: MessageId) -> Result<Self, GraphError> {
        let node = self.nodes.get(&parent).ok_or(GraphError::UnknownMessage(parent))?;
        if !node.children_ids.contains(&child) {
            return Err(GraphError::NotAChild { parent, child });
        }
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(&parent) {
            node.latest_child_id = Some(child);
        }
        Ok(next)
    }

    /// Clear a node's branch pointer so the displayed chain ends at it.
    pub fn clear_latest_child(&self, parent: MessageId) -> Result<Self, GraphError> {
        if !self.nodes.contains_key(&parent) {
            return Err(GraphError::UnknownMessage(parent));
        }
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(&parent) {
            node.latest_child_id = None;
        }
        Ok(next)
    }

    /// Remove a message and everything below it. A parent whose branch
    /// pointer named the removed message is left with no pointer.
    pub fn remove(&self, id: MessageId) -> Result<Self, GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownMessage(id));
        }
        let mut next = self.clone();
        next.splice_out(id);
        Ok(next)
    }

    /// Replace a message in place, keeping its links.
    pub fn update_message(&self, id: MessageId, f: impl FnOnce(&mut Message)) -> Result<Self, GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownMessage(id));
        }
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(&id) {
            let (parent, children, latest) =
                (node.parent_id, node.children_ids.clone(), node.latest_child_id);
            f(node);
            node.parent_id = parent;
            node.children_ids = children;
            node.latest_child_id = latest;
        }
        Ok(next)
    }

    fn splice_out(&mut self, id: MessageId) {
        let Some(removed) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(parent_id) = removed.parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.children_ids.retain(|c| *c != id);
                if parent.latest_child_id == Some(id) {
                    parent.latest_child_id = None;
                }
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        let mut stack = removed.children_ids;
        while let Some(child) = stack.pop() {
            if let Some(node) = self.nodes.remove(&child) {
                stack.extend(node.children_ids);
            }
        }
    }

    /// Drop children that no longer exist and pointers outside `children_ids`.
    fn normalize(&mut self) {
        let ids: Vec<MessageId> = self.nodes.keys().copied().collect();
        for id in ids {
            let present: Vec<MessageId> = self.children_of(id)
                .iter()
                .copied()
                .filter(|c| self.nodes.contains_key(c))
                .collect();
            if let Some(node) = self.nodes.get_mut(&id) {
                node.children_ids = present;
                if let Some(latest) = node.latest_child_id {
                    if !node.children_ids.contains(&latest) {
                        node.latest_child_id = None;
                    }
                }
            }
        }
    }
}
