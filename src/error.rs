use thiserror::Error;

/// Classification of every failure the call stack can observe.
///
/// Data-plane classes are local to a single packet and never end a call.
/// Control-plane classes are fatal to the session that observed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Audio packet missing or too late; surfaces only as a playout gap
    TransientNetworkLoss,
    /// Datagram could not be parsed
    Decode,
    /// Payload failed authentication
    Auth,
    /// Unexpected or malformed signaling message
    SignalingProtocol,
    /// Control channel went away
    ChannelClosed,
    /// Device or socket acquisition failed
    Resource,
}

impl ErrorClass {
    /// Whether an error of this class must drive the session to `Failed`
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorClass::SignalingProtocol | ErrorClass::ChannelClosed | ErrorClass::Resource
        )
    }
}

/// Session-fatal control-plane errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("resource acquisition failed: {0}")]
    Resource(String),
    #[error("remote peer reported error: {0}")]
    Remote(String),
    #[error("call setup timed out")]
    SetupTimeout,
    #[error("call declined: {0}")]
    Declined(String),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Protocol(_)
            | SessionError::KeyExchange(_)
            | SessionError::Remote(_)
            | SessionError::SetupTimeout
            | SessionError::Declined(_) => ErrorClass::SignalingProtocol,
            SessionError::ChannelClosed => ErrorClass::ChannelClosed,
            SessionError::Resource(_) => ErrorClass::Resource,
        }
    }
}
