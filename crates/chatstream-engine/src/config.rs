use std::time::Duration;

use serde::{Deserialize, Serialize};

use chatstream_core::source::ModelSelection;

const DEFAULT_CONTINUE_PROMPT: &str = "Continue Generating (pick up exactly where you left off)";

/// Tunables for [`crate::ChatEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Message text sent by `continue_generating`.
    pub continue_prompt: String,
    /// Wait between the end of a new session's first turn and naming it.
    pub naming_delay_ms: u64,
    /// Wait before the first queue read of a turn.
    pub initial_drain_delay_ms: u64,
    /// Persona used when a submit has to create its session.
    pub default_persona_id: u64,
    /// Model used when a turn names none. Recorded as the session's model
    /// override on every turn that ends up with a model.
    pub default_model: Option<ModelSelection>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            continue_prompt: DEFAULT_CONTINUE_PROMPT.into(),
            naming_delay_ms: 200,
            initial_drain_delay_ms: 50,
            default_persona_id: 0,
            default_model: None,
        }
    }
}

impl EngineConfig {
    pub fn naming_delay(&self) -> Duration {
        Duration::from_millis(self.naming_delay_ms)
    }

    pub fn initial_drain_delay(&self) -> Duration {
        Duration::from_millis(self.initial_drain_delay_ms)
    }
}
