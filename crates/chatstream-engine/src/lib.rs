pub mod config;
pub mod error;
pub mod graph;
pub mod interpreter;
pub mod orchestrator;
pub mod queue;
pub mod registry;

pub use config::EngineConfig;
pub use error::EngineError;
pub use graph::{GraphError, MessageGraph, UpsertOptions};
pub use interpreter::{Applied, TurnDraft, TurnIds};
pub use orchestrator::{ChatEngine, SubmitRequest, TurnOutcome, TurnReport};
pub use queue::PacketQueue;
pub use registry::SessionRegistry;
