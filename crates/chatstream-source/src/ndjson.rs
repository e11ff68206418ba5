//! Newline-delimited JSON packet transcripts.
//!
//! The server writes one JSON packet per line. Chunks from the transport cut
//! lines at arbitrary byte offsets, so the decoder buffers the unterminated
//! tail until its newline arrives.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use tracing::debug;

use chatstream_core::errors::TransportError;
use chatstream_core::packets::Packet;
use chatstream_core::source::PacketStream;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("line {line}: invalid packet: {source}")]
    InvalidPacket {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: not valid UTF-8")]
    InvalidUtf8 { line: usize },
}

impl DecodeError {
    pub fn line(&self) -> usize {
        match self {
            Self::InvalidPacket { line, .. } | Self::InvalidUtf8 { line } => *line,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidPacket { .. } => "invalid_packet",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
        }
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Malformed(e.to_string())
    }
}

/// Incremental line decoder. Blank lines are skipped; line numbers count
/// every line, blank or not, starting at 1.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
    line: usize,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete line in `chunk` plus whatever was buffered.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Packet, DecodeError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            if let Some(item) = self.decode_line(&raw) {
                out.push(item);
            }
        }
        out
    }

    /// Decode a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<Result<Packet, DecodeError>> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = self.buf.split();
        self.decode_line(&raw)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Result<Packet, DecodeError>> {
        self.line += 1;
        let line = self.line;
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(_) => return Some(Err(DecodeError::InvalidUtf8 { line })),
        };
        if text.is_empty() {
            return None;
        }
        Some(serde_json::from_str(text).map_err(|source| DecodeError::InvalidPacket { line, source }))
    }
}

/// Decode a whole transcript held in memory. Stops at the first bad line.
pub fn decode_transcript(text: &str) -> Result<Vec<Packet>, DecodeError> {
    let mut decoder = PacketDecoder::new();
    let mut packets = decoder.feed(text.as_bytes()).into_iter().collect::<Result<Vec<_>, _>>()?;
    if let Some(last) = decoder.finish() {
        packets.push(last?);
    }
    Ok(packets)
}

/// Adapt a raw byte stream into a packet stream. Transport errors pass
/// through; malformed lines surface as [`TransportError::Malformed`] without
/// ending the stream.
pub fn decode_stream<S>(bytes: S) -> PacketStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    struct State<S> {
        input: std::pin::Pin<Box<S>>,
        decoder: PacketDecoder,
        ready: VecDeque<Result<Packet, TransportError>>,
        done: bool,
    }

    let state = State {
        input: Box::pin(bytes),
        decoder: PacketDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.input.next().await {
                Some(Ok(chunk)) => {
                    for item in st.decoder.feed(&chunk) {
                        if let Err(e) = &item {
                            debug!(line = e.line(), kind = e.error_kind(), "undecodable packet line");
                        }
                        st.ready.push_back(item.map_err(TransportError::from));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.ready.push_back(Err(e));
                }
                None => {
                    st.done = true;
                    if let Some(last) = st.decoder.finish() {
                        st.ready.push_back(last.map_err(TransportError::from));
                    }
                }
            }
        }
    }))
}
