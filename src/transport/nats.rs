use super::messages::{AudioFrameMessage, HandshakeReply, HandshakeRequest, ResultMessage};
use super::{FrameSink, SessionChannel, Transport};
use crate::error::TransportError;
use crate::frame::SequencedFrame;
use async_nats::Client;
use futures::stream::StreamExt;
use tracing::{debug, info, warn};

/// Transport speaking JSON over NATS subjects:
/// - `<prefix>.session.start` (request/reply handshake)
/// - `<prefix>.frame.<session_id>` (outbound frames)
/// - `<prefix>.result.<session_id>` (inbound results)
pub struct NatsTransport {
    client: Client,
    subject_prefix: String,
}

impl NatsTransport {
    /// Connect to NATS server
    pub async fn connect(url: &str, subject_prefix: &str) -> Result<Self, TransportError> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to connect to NATS: {e}")))?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            subject_prefix: subject_prefix.to_string(),
        })
    }

    fn subject(&self, kind: &str, session_id: &str) -> String {
        format!("{}.{}.{}", self.subject_prefix, kind, session_id)
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<String, TransportError> {
        let subject = format!("{}.session.start", self.subject_prefix);
        let payload = serde_json::to_vec(request)?;

        info!(
            "Requesting session on {} (proposed id={})",
            subject, request.session_id
        );

        let reply = self
            .client
            .request(subject, payload.into())
            .await
            .map_err(|e| TransportError::Unavailable(format!("handshake request failed: {e}")))?;

        let reply: HandshakeReply = serde_json::from_slice(&reply.payload)
            .map_err(|e| TransportError::Protocol(format!("malformed handshake reply: {e}")))?;

        reply.into_session_id()
    }

    async fn open(&self, session_id: &str) -> Result<SessionChannel, TransportError> {
        let result_subject = self.subject("result", session_id);

        info!("Subscribing to results on {}", result_subject);

        let subscriber = self
            .client
            .subscribe(result_subject.clone())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to subscribe: {e}")))?;

        let inbound = subscriber
            .map(|msg| {
                serde_json::from_slice::<ResultMessage>(&msg.payload).map_err(|e| {
                    warn!("Failed to parse result message: {}", e);
                    TransportError::Protocol(format!("malformed result: {e}"))
                })
            })
            .boxed();

        let outbound = NatsFrameSink {
            client: self.client.clone(),
            subject: self.subject("frame", session_id),
            session_id: session_id.to_string(),
        };

        Ok(SessionChannel {
            outbound: Box::new(outbound),
            inbound,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Publishes one session's frames to its frame subject
struct NatsFrameSink {
    client: Client,
    subject: String,
    session_id: String,
}

#[async_trait::async_trait]
impl FrameSink for NatsFrameSink {
    async fn send(&mut self, frame: &SequencedFrame) -> Result<(), TransportError> {
        let message = AudioFrameMessage::from_frame(frame);
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to publish frame: {e}")))?;

        debug!(
            "Published frame to {} (sequence={}, bytes={}, late={})",
            self.subject,
            frame.sequence,
            frame.pcm.len(),
            frame.late
        );

        Ok(())
    }

    async fn finish(&mut self, next_sequence: u64) -> Result<(), TransportError> {
        let marker = AudioFrameMessage::end_of_stream(&self.session_id, next_sequence);
        let payload = serde_json::to_vec(&marker)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!("failed to publish final marker: {e}"))
            })?;

        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to flush: {e}")))?;

        info!("Published end-of-stream marker to {}", self.subject);
        Ok(())
    }
}
