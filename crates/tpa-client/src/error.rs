use thiserror::Error;

/// Failures surfaced by [`crate::TpaSession`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpaError {
    /// A send was attempted without an open transport. Nothing is queued.
    #[error("websocket not connected")]
    NotConnected,
    /// The cloud did not acknowledge the handshake in time.
    #[error("connection handshake timed out")]
    Timeout,
    /// Transport-level failure while connecting or during the handshake.
    #[error("connection error: {0}")]
    Connection(String),
    /// The cloud sent a frame that could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// The cloud refused the handshake with a `connection_error` frame.
    #[error("connection rejected by cloud: {0}")]
    Rejected(String),
    /// Automatic reconnection gave up; call `connect` again to resume.
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// `disconnect` was called while the attempt was in flight.
    #[error("connection attempt cancelled")]
    Cancelled,
}

pub type TpaResult<T> = Result<T, TpaError>;
