//! Scripted collaborators for tests and transcript replay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use chatstream_core::errors::TransportError;
use chatstream_core::ids::{MessageId, SessionId};
use chatstream_core::messages::FileDescriptor;
use chatstream_core::packets::Packet;
use chatstream_core::source::{
    Feedback, FileUploader, ModelSelection, PacketStream, SessionService, StreamRequest,
    StreamSource, UploadRequest,
};

/// Sender half of a [`MockResponse::Channel`].
pub type PacketSender = mpsc::UnboundedSender<Result<Packet, TransportError>>;

/// Pre-programmed answer to one `open` call.
pub enum MockResponse {
    /// Yield the packets, then end.
    Packets(Vec<Packet>),
    /// Fail the `open` call itself.
    Fail(TransportError),
    /// Yield the packets, then fail mid-stream.
    Interrupted(Vec<Packet>, TransportError),
    /// Yield the packets, then stay open until cancelled.
    Hold(Vec<Packet>),
    /// Yield whatever the test sends; ends when the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Result<Packet, TransportError>>),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete plain answer: ids, the text as one delta, main-answer stop.
    pub fn answer(user: i64, assistant: i64, text: &str) -> Self {
        Self::Packets(vec![
            Packet::ids(user, assistant),
            Packet::answer(text),
            Packet::Stop {
                stop_reason: None,
                stream_type: Some(chatstream_core::packets::StreamType::MainAnswer),
                level: None,
                level_question_num: None,
            },
        ])
    }

    /// A response driven step by step from the test.
    pub fn channel() -> (Self, PacketSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Channel(rx), tx)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Stream source returning pre-programmed responses in sequence.
pub struct MockSource {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<StreamRequest>>,
    call_count: AtomicUsize,
}

impl MockSource {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl StreamSource for MockSource {
    async fn open(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<PacketStream, TransportError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request);
        let Some(mut current) = self.responses.lock().pop_front() else {
            return Err(TransportError::Status {
                status: 500,
                body: format!("MockSource: no response configured for call {idx}"),
            });
        };
        // Unroll nested delays iteratively.
        loop {
            let body: PacketStream = match current {
                MockResponse::Packets(packets) => Box::pin(ok_stream(packets)),
                MockResponse::Fail(e) => return Err(e),
                MockResponse::Interrupted(packets, e) => {
                    Box::pin(ok_stream(packets).chain(stream::once(async move { Err(e) })))
                }
                MockResponse::Hold(packets) => Box::pin(ok_stream(packets).chain(stream::pending())),
                MockResponse::Channel(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
                MockResponse::Delay(duration, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    }
                    current = *inner;
                    continue;
                }
            };
            return Ok(Box::pin(body.take_until(cancel.cancelled_owned())));
        }
    }
}

fn ok_stream(
    packets: Vec<Packet>,
) -> impl futures::Stream<Item = Result<Packet, TransportError>> + Send {
    stream::iter(packets.into_iter().map(Ok))
}

#[derive(Default)]
struct SessionLog {
    created: Vec<(u64, Option<String>)>,
    named: Vec<SessionId>,
    model_overrides: Vec<(SessionId, ModelSelection)>,
    latest_messages: Vec<MessageId>,
    feedback: Vec<(MessageId, Feedback)>,
}

/// Session service that hands out `S1`, `S2`, ... and records every call.
#[derive(Default)]
pub struct MockSessions {
    ids: Mutex<VecDeque<SessionId>>,
    issued: AtomicUsize,
    create_delay: Option<Duration>,
    create_error: Mutex<Option<TransportError>>,
    feedback_error: Mutex<Option<TransportError>>,
    log: Mutex<SessionLog>,
}

impl MockSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out these ids before falling back to the numbered ones.
    pub fn with_ids(ids: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().map(SessionId::from_raw).collect()),
            ..Default::default()
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn failing_create(self, error: TransportError) -> Self {
        *self.create_error.lock() = Some(error);
        self
    }

    pub fn failing_feedback(self, error: TransportError) -> Self {
        *self.feedback_error.lock() = Some(error);
        self
    }

    pub fn created(&self) -> Vec<(u64, Option<String>)> {
        self.log.lock().created.clone()
    }

    pub fn named(&self) -> Vec<SessionId> {
        self.log.lock().named.clone()
    }

    pub fn model_overrides(&self) -> Vec<(SessionId, ModelSelection)> {
        self.log.lock().model_overrides.clone()
    }

    pub fn latest_messages(&self) -> Vec<MessageId> {
        self.log.lock().latest_messages.clone()
    }

    pub fn feedback(&self) -> Vec<(MessageId, Feedback)> {
        self.log.lock().feedback.clone()
    }
}

#[async_trait]
impl SessionService for MockSessions {
    async fn create_session(
        &self,
        persona_id: u64,
        title: Option<&str>,
    ) -> Result<SessionId, TransportError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.create_error.lock().clone() {
            return Err(e);
        }
        self.log
            .lock()
            .created
            .push((persona_id, title.map(str::to_string)));
        let next = self.ids.lock().pop_front();
        Ok(next.unwrap_or_else(|| {
            let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
            SessionId::from_raw(format!("S{n}"))
        }))
    }

    async fn name_session(&self, session_id: &SessionId) -> Result<(), TransportError> {
        self.log.lock().named.push(session_id.clone());
        Ok(())
    }

    async fn record_model_override(
        &self,
        session_id: &SessionId,
        model: &ModelSelection,
    ) -> Result<(), TransportError> {
        self.log
            .lock()
            .model_overrides
            .push((session_id.clone(), model.clone()));
        Ok(())
    }

    async fn set_latest_message(&self, message_id: MessageId) -> Result<(), TransportError> {
        self.log.lock().latest_messages.push(message_id);
        Ok(())
    }

    async fn submit_feedback(
        &self,
        message_id: MessageId,
        feedback: &Feedback,
    ) -> Result<(), TransportError> {
        if let Some(e) = self.feedback_error.lock().clone() {
            return Err(e);
        }
        self.log.lock().feedback.push((message_id, feedback.clone()));
        Ok(())
    }
}

/// Uploader answering every call with the same result.
pub struct MockUploader {
    result: Result<Vec<FileDescriptor>, TransportError>,
    delay: Option<Duration>,
    uploads: Mutex<Vec<Vec<UploadRequest>>>,
}

impl MockUploader {
    pub fn new(result: Result<Vec<FileDescriptor>, TransportError>) -> Self {
        Self {
            result,
            delay: None,
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Uploader that accepts everything and returns no descriptors.
    pub fn empty() -> Self {
        Self::new(Ok(Vec::new()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn uploads(&self) -> Vec<Vec<UploadRequest>> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl FileUploader for MockUploader {
    async fn upload(&self, files: Vec<UploadRequest>) -> Result<Vec<FileDescriptor>, TransportError> {
        self.uploads.lock().push(files);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}
