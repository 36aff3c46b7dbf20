//! Error kinds callers branch on. Everything else propagates as `anyhow::Error`.

use thiserror::Error;

/// Errors surfaced by adapters (ASR/TTS/LLM) that the orchestrator and
/// WebSocket handler need to match on, distinct from the "log and recover
/// locally" transient failures described in spec §7.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter misconfigured: {0}")]
    Misconfigured(String),

    #[error("adapter request failed: {0}")]
    Transient(String),

    #[error("no model matched preference list {0:?}")]
    NoModelAvailable(Vec<String>),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("unsupported capability: {0}")]
    Unsupported(&'static str),
}

/// Errors from decoding the binary `ws_bidirectional` TTS sub-protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is too short")]
    FrameTooShort,
    #[error("invalid header size")]
    InvalidHeaderSize,
    #[error("invalid header padding")]
    InvalidHeaderPadding,
    #[error("not enough bytes for int32")]
    TruncatedInt32,
    #[error("not enough bytes for uint32")]
    TruncatedUint32,
    #[error("invalid string size in frame")]
    InvalidStringSize,
    #[error("invalid payload size")]
    InvalidPayloadSize,
    #[error("unexpected trailing bytes in frame")]
    TrailingBytes,
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(u8),
}
