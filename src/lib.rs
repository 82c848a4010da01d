//! # Parley
//!
//! Encrypted two-party voice calls over UDP with a reliable signaling channel.
//!
//! ## Overview
//!
//! A call is negotiated over a length-prefixed JSON control channel (direct TCP
//! or relayed by a rendezvous server). Once both sides have exchanged media
//! endpoints and completed an authenticated key agreement, compressed audio
//! frames flow as individually encrypted datagrams. The receiver authenticates
//! each datagram, reorders it in an adaptive jitter buffer and plays it out on
//! a steady clock, concealing frames that never arrive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley::{
//!     AudioFormat, CallController, CallSession, ControllerSettings, IdentityKey, MediaDevices,
//!     NullSink, PcmCodec, SessionConfig, SignalingChannel, ToneSource, UdpMediaEngine,
//!     JitterBufferConfig,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let format = AudioFormat::default();
//! let devices = MediaDevices {
//!     source: Box::new(ToneSource::new(format, 440.0)),
//!     sink: Box::new(NullSink::default()),
//!     encoder: Box::new(PcmCodec::new(format)),
//!     decoder: Box::new(PcmCodec::new(format)),
//! };
//! let engine = UdpMediaEngine::new(format, JitterBufferConfig::default(), devices);
//! let session = CallSession::new(SessionConfig::default(), IdentityKey::generate());
//! let channel = SignalingChannel::connect("127.0.0.1:7878").await?;
//!
//! let handle = CallController::new(session, channel, Box::new(engine), ControllerSettings::default())
//!     .spawn_dial();
//! println!("{:?}", handle.join().await);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`device`]: microphone and speaker through cpal
//! - [`packet`]: datagram header codec
//! - [`crypto`]: key agreement and per-packet authenticated encryption
//! - [`jitter_buffer`]: reordering and adaptive playout delay
//! - [`transport`]: UDP endpoint of one call
//! - [`pipeline`]: capture, send, receive and playout tasks
//! - [`signaling`]: control channel framing and messages
//! - [`session`]: call state machine
//! - [`app`]: controller task driving a session
//! - [`rendezvous`]: relay for reaching peers by identifier
//! - [`config`]: persistent configuration
//!
//! ## Security Model
//!
//! - **Forward Secrecy**: Ephemeral X25519 key exchange per call
//! - **Authentication**: Ed25519 signatures over each side's ephemeral key
//! - **Encryption**: ChaCha20-Poly1305 per datagram with direction-separated keys
//! - **Trust Management**: Optional allow-list of peer identities and pre-shared passphrase

/// Error classification shared by every layer
pub mod error;

/// Audio frame format, sources and sinks
pub mod audio;

/// Sound card capture and playback
pub mod device;

/// Audio codec capability and raw PCM codec
pub mod codec;

/// Opus audio codec integration for compressed calls
pub mod opus_codec;

/// Audio datagram header encoding
pub mod packet;

/// Key agreement and per-packet authenticated encryption
pub mod crypto;

/// Adaptive jitter buffer for network packet reordering
pub mod jitter_buffer;

/// Playout clocks
pub mod pacing;

/// UDP audio endpoint
pub mod transport;

/// Per-call media tasks
pub mod pipeline;

/// Control channel and message types
pub mod signaling;

/// Call lifecycle state machine
pub mod session;

/// Call controller and handles
pub mod app;

/// Rendezvous relay server
pub mod rendezvous;

/// Configuration management with persistence and validation
pub mod config;

#[cfg(test)]
pub mod tests;

// Re-export main types for convenience
pub use app::{CallController, CallHandle, CallStatus, ControllerSettings};
pub use audio::{AudioFormat, AudioSink, AudioSource, MemorySink, NullSink, ToneSource, WavFileSink, WavFileSource};
pub use codec::{AudioCodec, CodecError, PcmCodec};
pub use config::{AppConfig, ConfigManager};
pub use device::{CpalSink, CpalSource};
pub use crypto::{ChaChaCipher, CipherSuite, CryptoSession, IdentityKey, KeyAgreement, Role};
pub use error::{ErrorClass, SessionError};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats, Playout};
pub use opus_codec::{OpusCodec, OpusConfig};
pub use packet::AudioPacket;
pub use pacing::{IntervalPacer, ManualPacer, Pacer, manual_pacer};
pub use pipeline::{MediaDevices, MediaEngine, MediaParams, UdpMediaEngine};
pub use rendezvous::RendezvousServer;
pub use session::{
    AcceptAll, AllowedCallers, CallDecision, CallOutcome, CallSession, CallState, Effect, IncomingCall,
    IncomingCallPolicy, SessionConfig,
};
pub use signaling::{MessageBody, SignalingChannel, SignalingEvent, SignalingMessage};
pub use transport::{AudioTransport, TransportStats};
