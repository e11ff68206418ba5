pub mod errors;
pub mod ids;
pub mod messages;
pub mod packets;
pub mod source;
pub mod state;

pub use errors::TransportError;
pub use ids::{MessageId, SessionId, SessionKey};
pub use messages::{Message, Role};
pub use packets::Packet;
pub use state::{ChatState, RegenerationState};
