//! Reliable, ordered control channel carrying call setup and teardown messages.
//!
//! Frames are a 4-byte big-endian length followed by a JSON document. The
//! channel works over any byte stream: TCP in production, in-memory pipes in
//! tests.

use std::net::SocketAddr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crypto::KeyExchangePayload;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("signaling channel closed")]
    Closed,
}

/// Media parameters advertised in offers and answers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// UDP endpoint where the sender expects audio
    pub media_addr: SocketAddr,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Registration with a rendezvous server; ignored by call sessions
    Hello { display_name: Option<String> },
    Offer { media: MediaDescription },
    Answer { media: MediaDescription },
    KeyExchange { payload: KeyExchangePayload },
    Bye { reason: String, ack: bool },
    /// Callee declined the Offer; no Answer follows
    Reject { reason: String },
    Error { reason: String },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello { .. } => "hello",
            MessageBody::Offer { .. } => "offer",
            MessageBody::Answer { .. } => "answer",
            MessageBody::KeyExchange { .. } => "key_exchange",
            MessageBody::Bye { .. } => "bye",
            MessageBody::Reject { .. } => "reject",
            MessageBody::Error { .. } => "error",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub session_id: Uuid,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub body: MessageBody,
}

impl SignalingMessage {
    pub fn new(session_id: Uuid, sender: impl Into<String>, body: MessageBody) -> Self {
        Self {
            session_id,
            sender: sender.into(),
            recipient: None,
            body,
        }
    }

    pub fn to(mut self, recipient: Option<String>) -> Self {
        self.recipient = recipient;
        self
    }
}

/// What the channel delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// A frame arrived that is not a valid message
    Invalid(String),
    /// The peer went away; reported exactly once
    Closed,
}

/// Read one frame. `Ok(None)` on clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<SignalingMessage>, SignalingError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(SignalingError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_frame<W>(writer: &mut W, message: &SignalingMessage) -> Result<(), SignalingError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SignalingError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Ordered message channel backed by reader and writer tasks
pub struct SignalingChannel {
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
    inbound: mpsc::UnboundedReceiver<SignalingEvent>,
    closed_reported: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    reader_task: JoinHandle<()>,
}

impl SignalingChannel {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, SignalingError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream))
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on signaling socket: {}", e);
        }
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let mut channel = Self::from_stream(stream);
        channel.local_addr = local_addr;
        channel.peer_addr = peer_addr;
        channel
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let write_failed = inbound_tx.clone();

        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(message)) => {
                        if inbound_tx.send(SignalingEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(SignalingError::Malformed(e)) => {
                        let _ = inbound_tx.send(SignalingEvent::Invalid(e.to_string()));
                    }
                    Err(e) => {
                        debug!("Signaling read ended: {}", e);
                        if matches!(e, SignalingError::FrameTooLarge(_)) {
                            let _ = inbound_tx.send(SignalingEvent::Invalid(e.to_string()));
                        }
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(SignalingEvent::Closed);
        });

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    warn!("Failed to send {} message: {}", message.body.kind(), e);
                    let _ = write_failed.send(SignalingEvent::Closed);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            closed_reported: false,
            local_addr: None,
            peer_addr: None,
            reader_task,
        }
    }

    /// Queue a message; messages are written in the order they are sent
    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let outbound = self.outbound.as_ref().ok_or(SignalingError::Closed)?;
        debug!("Signaling -> {} ({})", message.body.kind(), message.session_id);
        outbound.send(message).map_err(|_| SignalingError::Closed)
    }

    /// Next inbound event. Once `Closed` has been returned this never resolves.
    pub async fn recv(&mut self) -> SignalingEvent {
        if self.closed_reported {
            return std::future::pending().await;
        }
        let event = self.inbound.recv().await.unwrap_or(SignalingEvent::Closed);
        if event == SignalingEvent::Closed {
            self.closed_reported = true;
        }
        event
    }

    /// Stop sending; already queued messages are still flushed
    pub fn close(&mut self) {
        self.outbound = None;
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
