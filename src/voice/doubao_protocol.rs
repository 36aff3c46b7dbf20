//! Binary wire protocol for the `ws_bidirectional` ("Doubao"/Volcengine
//! style) TTS sub-protocol: a 3+ byte header, an optional event int32 and
//! session/connect id strings, a sequence or error code, and a
//! length-prefixed payload.
//!
//! Grounded in `core/volc_tts_protocol.py`, ported field-for-field.

use std::io::{Cursor, Read};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    FullClientRequest,
    FullServerResponse,
    AudioOnlyServer,
    Error,
}

impl MessageType {
    fn from_nibble(nibble: u8) -> Result<Self, ProtocolError> {
        match nibble {
            0x1 => Ok(Self::FullClientRequest),
            0x9 => Ok(Self::FullServerResponse),
            0xB => Ok(Self::AudioOnlyServer),
            0xF => Ok(Self::Error),
            other => Err(ProtocolError::UnsupportedMessageType(other)),
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::FullClientRequest => 0x1,
            Self::FullServerResponse => 0x9,
            Self::AudioOnlyServer => 0xB,
            Self::Error => 0xF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlag {
    NoSeq,
    PositiveSeq,
    LastNoSeq,
    NegativeSeq,
    WithEvent,
}

impl MessageFlag {
    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x1 => Self::PositiveSeq,
            0x2 => Self::LastNoSeq,
            0x3 => Self::NegativeSeq,
            0x4 => Self::WithEvent,
            _ => Self::NoSeq,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::NoSeq => 0x0,
            Self::PositiveSeq => 0x1,
            Self::LastNoSeq => 0x2,
            Self::NegativeSeq => 0x3,
            Self::WithEvent => 0x4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventType {
    StartConnection = 1,
    FinishConnection = 2,
    ConnectionStarted = 50,
    ConnectionFailed = 51,
    ConnectionFinished = 52,
    StartSession = 100,
    FinishSession = 102,
    SessionStarted = 150,
    SessionFinished = 152,
    SessionFailed = 153,
    TaskRequest = 200,
}

impl EventType {
    fn is_connection_scoped(value: i32) -> bool {
        matches!(
            value,
            x if x == Self::StartConnection as i32
                || x == Self::FinishConnection as i32
                || x == Self::ConnectionStarted as i32
                || x == Self::ConnectionFailed as i32
                || x == Self::ConnectionFinished as i32
        )
    }

    fn carries_connect_id(value: i32) -> bool {
        matches!(
            value,
            x if x == Self::ConnectionStarted as i32
                || x == Self::ConnectionFailed as i32
                || x == Self::ConnectionFinished as i32
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    Raw,
    #[default]
    Json,
}

impl Serialization {
    fn from_nibble(nibble: u8) -> Self {
        if nibble == 0x1 {
            Self::Json
        } else {
            Self::Raw
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::Raw => 0x0,
            Self::Json => 0x1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
}

impl Compression {
    fn from_nibble(_nibble: u8) -> Self {
        Self::None
    }

    fn nibble(self) -> u8 {
        0x0
    }
}

/// One frame of the Doubao bidirectional streaming protocol.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub msg_type: MessageType,
    pub flag: MessageFlag,
    pub payload: Vec<u8>,
    pub event: i32,
    pub session_id: String,
    pub connect_id: String,
    pub sequence: i32,
    pub error_code: u32,
    pub version: u8,
    pub header_size: u8,
    pub serialization: Serialization,
    pub compression: Compression,
}

impl Default for ProtocolMessage {
    fn default() -> Self {
        Self {
            msg_type: MessageType::FullClientRequest,
            flag: MessageFlag::NoSeq,
            payload: Vec::new(),
            event: 0,
            session_id: String::new(),
            connect_id: String::new(),
            sequence: 0,
            error_code: 0,
            version: 1,
            header_size: 1,
            serialization: Serialization::Json,
            compression: Compression::None,
        }
    }
}

fn write_int32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_uint32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    write_uint32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn read_int32(cursor: &mut Cursor<&[u8]>) -> Result<i32, ProtocolError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| ProtocolError::TruncatedInt32)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_uint32(cursor: &mut Cursor<&[u8]>) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| ProtocolError::TruncatedUint32)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let size = read_uint32(cursor)?;
    if size == 0 {
        return Ok(String::new());
    }
    let mut data = vec![0u8; size as usize];
    cursor
        .read_exact(&mut data)
        .map_err(|_| ProtocolError::InvalidStringSize)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Encode a frame. Panics only if `header_size` is too small to hold the
/// mandatory 3-byte header, which no caller in this codebase ever requests.
pub fn encode_message(message: &ProtocolMessage) -> Vec<u8> {
    let mut buf = Vec::new();

    let header_bytes = 4usize * message.header_size as usize;
    assert!(header_bytes >= 3, "header_size is too small");

    buf.push(((message.version & 0xF) << 4) | (message.header_size & 0xF));
    buf.push((message.msg_type.nibble() << 4) | message.flag.nibble());
    buf.push((message.serialization.nibble() << 4) | message.compression.nibble());
    if header_bytes > 3 {
        buf.extend(std::iter::repeat(0u8).take(header_bytes - 3));
    }

    if message.flag == MessageFlag::WithEvent {
        write_int32(&mut buf, message.event);
        if !EventType::is_connection_scoped(message.event) {
            write_string(&mut buf, &message.session_id);
        }
        if EventType::carries_connect_id(message.event) {
            write_string(&mut buf, &message.connect_id);
        }
    }

    match message.msg_type {
        MessageType::FullClientRequest | MessageType::FullServerResponse | MessageType::AudioOnlyServer => {
            if matches!(message.flag, MessageFlag::PositiveSeq | MessageFlag::NegativeSeq) {
                write_int32(&mut buf, message.sequence);
            }
        }
        MessageType::Error => {
            write_uint32(&mut buf, message.error_code);
        }
    }

    write_uint32(&mut buf, message.payload.len() as u32);
    buf.extend_from_slice(&message.payload);
    buf
}

/// Decode a frame, rejecting trailing bytes the same way the original does.
pub fn decode_message(data: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    if data.len() < 3 {
        return Err(ProtocolError::FrameTooShort);
    }
    let mut cursor = Cursor::new(data);

    let mut one = [0u8; 1];
    cursor.read_exact(&mut one).expect("length checked above");
    let version = (one[0] >> 4) & 0xF;
    let header_size = one[0] & 0xF;
    if header_size < 1 {
        return Err(ProtocolError::InvalidHeaderSize);
    }

    cursor.read_exact(&mut one).expect("length checked above");
    let msg_type = MessageType::from_nibble((one[0] >> 4) & 0xF)?;
    let flag = MessageFlag::from_nibble(one[0] & 0xF);

    cursor.read_exact(&mut one).expect("length checked above");
    let serialization = Serialization::from_nibble((one[0] >> 4) & 0xF);
    let compression = Compression::from_nibble(one[0] & 0xF);

    let padding = (header_size as i64 * 4) - 3;
    if padding > 0 {
        let mut skip = vec![0u8; padding as usize];
        cursor
            .read_exact(&mut skip)
            .map_err(|_| ProtocolError::InvalidHeaderPadding)?;
    }

    let mut message = ProtocolMessage {
        msg_type,
        flag,
        version,
        header_size,
        serialization,
        compression,
        ..Default::default()
    };

    if flag == MessageFlag::WithEvent {
        message.event = read_int32(&mut cursor)?;
        if !EventType::is_connection_scoped(message.event) {
            message.session_id = read_string(&mut cursor)?;
        }
        if EventType::carries_connect_id(message.event) {
            message.connect_id = read_string(&mut cursor)?;
        }
    }

    match msg_type {
        MessageType::FullClientRequest | MessageType::FullServerResponse | MessageType::AudioOnlyServer => {
            if matches!(flag, MessageFlag::PositiveSeq | MessageFlag::NegativeSeq) {
                message.sequence = read_int32(&mut cursor)?;
            }
        }
        MessageType::Error => {
            message.error_code = read_uint32(&mut cursor)?;
        }
    }

    let payload_size = read_uint32(&mut cursor)?;
    if payload_size > 0 {
        let mut payload = vec![0u8; payload_size as usize];
        cursor
            .read_exact(&mut payload)
            .map_err(|_| ProtocolError::InvalidPayloadSize)?;
        message.payload = payload;
    }

    let mut trailing = Vec::new();
    cursor
        .read_to_end(&mut trailing)
        .expect("reading to end cannot fail");
    if !trailing.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }

    Ok(message)
}

pub fn build_start_connection() -> Vec<u8> {
    encode_message(&ProtocolMessage {
        msg_type: MessageType::FullClientRequest,
        flag: MessageFlag::WithEvent,
        event: EventType::StartConnection as i32,
        payload: b"{}".to_vec(),
        ..Default::default()
    })
}

pub fn build_start_session(session_id: &str, payload: Vec<u8>) -> Vec<u8> {
    encode_message(&ProtocolMessage {
        msg_type: MessageType::FullClientRequest,
        flag: MessageFlag::WithEvent,
        event: EventType::StartSession as i32,
        session_id: session_id.to_string(),
        payload,
        ..Default::default()
    })
}

pub fn build_task_request(session_id: &str, payload: Vec<u8>) -> Vec<u8> {
    encode_message(&ProtocolMessage {
        msg_type: MessageType::FullClientRequest,
        flag: MessageFlag::WithEvent,
        event: EventType::TaskRequest as i32,
        session_id: session_id.to_string(),
        payload,
        ..Default::default()
    })
}

pub fn build_finish_session(session_id: &str) -> Vec<u8> {
    encode_message(&ProtocolMessage {
        msg_type: MessageType::FullClientRequest,
        flag: MessageFlag::WithEvent,
        event: EventType::FinishSession as i32,
        session_id: session_id.to_string(),
        payload: b"{}".to_vec(),
        ..Default::default()
    })
}

pub fn build_finish_connection() -> Vec<u8> {
    encode_message(&ProtocolMessage {
        msg_type: MessageType::FullClientRequest,
        flag: MessageFlag::WithEvent,
        event: EventType::FinishConnection as i32,
        payload: b"{}".to_vec(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_connection_round_trips() {
        let frame = build_start_connection();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.event, EventType::StartConnection as i32);
        assert_eq!(decoded.payload, b"{}");
        assert!(decoded.session_id.is_empty());
    }

    #[test]
    fn start_session_carries_session_id() {
        let frame = build_start_session("sess-123", b"{\"voice\":\"x\"}".to_vec());
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.event, EventType::StartSession as i32);
        assert_eq!(decoded.session_id, "sess-123");
        assert_eq!(decoded.payload, b"{\"voice\":\"x\"}");
    }

    #[test]
    fn connection_started_carries_connect_id_not_session_id() {
        let frame = encode_message(&ProtocolMessage {
            msg_type: MessageType::FullServerResponse,
            flag: MessageFlag::WithEvent,
            event: EventType::ConnectionStarted as i32,
            connect_id: "conn-abc".to_string(),
            payload: Vec::new(),
            ..Default::default()
        });
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.connect_id, "conn-abc");
        assert!(decoded.session_id.is_empty());
    }

    #[test]
    fn error_frame_carries_error_code_not_sequence() {
        let frame = encode_message(&ProtocolMessage {
            msg_type: MessageType::Error,
            flag: MessageFlag::NoSeq,
            error_code: 55_000_001,
            payload: b"bad request".to_vec(),
            ..Default::default()
        });
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.error_code, 55_000_001);
        assert_eq!(decoded.payload, b"bad request");
    }

    #[test]
    fn audio_only_frame_with_sequence_round_trips() {
        let frame = encode_message(&ProtocolMessage {
            msg_type: MessageType::AudioOnlyServer,
            flag: MessageFlag::PositiveSeq,
            sequence: 7,
            payload: vec![1, 2, 3, 4],
            ..Default::default()
        });
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut frame = build_start_connection();
        frame.truncate(frame.len() - 2);
        assert!(decode_message(&frame).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut frame = build_start_connection();
        frame.push(0xFF);
        assert!(matches!(
            decode_message(&frame),
            Err(ProtocolError::TrailingBytes)
        ));
    }

    #[test]
    fn unsupported_message_type_is_rejected() {
        let mut frame = build_start_connection();
        // clobber the type nibble (byte 1, high nibble) with an unused value
        frame[1] = (0x3 << 4) | (frame[1] & 0x0F);
        assert!(matches!(
            decode_message(&frame),
            Err(ProtocolError::UnsupportedMessageType(0x3))
        ));
    }
}
