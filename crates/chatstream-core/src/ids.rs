use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-assigned chat session identifier. Opaque to the client.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key for per-session state. The placeholder key stands for a brand-new
/// conversation whose id the server has not assigned yet.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(Option<SessionId>);

impl SessionKey {
    pub const PLACEHOLDER: SessionKey = SessionKey(None);

    pub fn placeholder() -> Self {
        Self::PLACEHOLDER
    }

    pub fn id(&self) -> Option<&SessionId> {
        self.0.as_ref()
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.is_none()
    }
}

impl From<SessionId> for SessionKey {
    fn from(id: SessionId) -> Self {
        Self(Some(id))
    }
}

impl From<&SessionId> for SessionKey {
    fn from(id: &SessionId) -> Self {
        Self(Some(id.clone()))
    }
}

impl From<Option<SessionId>> for SessionKey {
    fn from(id: Option<SessionId>) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => f.write_str(id.as_str()),
            None => f.write_str("<new>"),
        }
    }
}

/// Message identifier, unique within a session. Negative values are
/// client-side sentinels that never come from the server.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Placeholder for the user message of a turn that failed before ids arrived.
    pub const TEMP_USER: MessageId = MessageId(-1);
    /// Placeholder for the assistant message of a turn that failed before ids arrived.
    pub const TEMP_ASSISTANT: MessageId = MessageId(-2);
    /// Synthetic root of every session graph.
    pub const SYSTEM: MessageId = MessageId(-3);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub fn is_sentinel(self) -> bool {
        self.0 < 0
    }
}

impl From<i64> for MessageId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
