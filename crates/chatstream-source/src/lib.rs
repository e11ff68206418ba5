//! Stream-source side of the engine: packet transcript decoding and scripted
//! collaborators.

pub mod mock;
pub mod ndjson;

pub use mock::{MockResponse, MockSessions, MockSource, MockUploader};
pub use ndjson::{decode_stream, decode_transcript, DecodeError, PacketDecoder};
