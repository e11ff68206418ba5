use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Per-session UI phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatState {
    #[default]
    Input,
    Loading,
    ToolBuilding,
    Streaming,
    Uploading,
}

impl ChatState {
    /// True while a turn is producing output.
    pub fn is_answering(self) -> bool {
        matches!(self, Self::Loading | Self::ToolBuilding | Self::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Loading => "loading",
            Self::ToolBuilding => "toolBuilding",
            Self::Streaming => "streaming",
            Self::Uploading => "uploading",
        }
    }
}

/// Marks that messages past `final_message_index` in the current chain are
/// being replaced by a resend or regeneration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationState {
    pub regenerating: bool,
    pub final_message_index: MessageId,
}

impl RegenerationState {
    pub fn replacing_after(message_id: MessageId) -> Self {
        Self {
            regenerating: true,
            final_message_index: message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_input() {
        assert_eq!(ChatState::default(), ChatState::Input);
        assert!(!ChatState::Input.is_answering());
        assert!(!ChatState::Uploading.is_answering());
        assert!(ChatState::ToolBuilding.is_answering());
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_string(&ChatState::ToolBuilding).unwrap();
        assert_eq!(json, "\"toolBuilding\"");
        assert_eq!(ChatState::ToolBuilding.as_str(), "toolBuilding");
    }
}
