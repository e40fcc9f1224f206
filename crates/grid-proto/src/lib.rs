//! # grid-proto
//!
//! Wire frame codec for the Gridbase RPC protocol.
//!
//! A frame is `<mtype:1><flag?:1><reqId:ASCII digits>[':' <payload>]`:
//!
//! - `mtype` is `C` (Call), `S` (Signal) or `R` (Resp)
//! - the optional flag is `!` (error payload), `+` (more frames follow)
//!   or `#` (abort); at most one flag appears
//! - `reqId` is a positive base-10 integer
//! - a missing `:` means no payload
//!
//! Payloads are serialized as JSON — the one serialization chosen for
//! all payloads, which both peers must agree on.

#![warn(missing_docs)]
#![warn(clippy::all)]

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The frame was empty.
    #[error("empty frame")]
    Empty,

    /// The one-byte type tag was not `C`, `S` or `R`.
    #[error("unknown message type tag {0:#04x}")]
    BadTag(u8),

    /// The request id was missing, malformed, or not positive.
    #[error("bad request id: {0}")]
    BadReqId(String),

    /// The payload was not valid JSON.
    #[error("bad payload: {0}")]
    BadPayload(String),
}

/// Result type for codec operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Message kind: request-expecting-response, fire-and-forget, or
/// response-to-a-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// A call expecting a response.
    Call,
    /// A fire-and-forget signal.
    Signal,
    /// A response to a call.
    Resp,
}

impl MsgType {
    /// Returns the one-byte wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            MsgType::Call => b'C',
            MsgType::Signal => b'S',
            MsgType::Resp => b'R',
        }
    }

    /// Parses a one-byte wire tag.
    pub fn from_tag(tag: u8) -> FrameResult<Self> {
        match tag {
            b'C' => Ok(MsgType::Call),
            b'S' => Ok(MsgType::Signal),
            b'R' => Ok(MsgType::Resp),
            other => Err(FrameError::BadTag(other)),
        }
    }
}

/// One protocol message.
///
/// At most one of `data` and `error` is meaningful; an error payload
/// terminates any streaming sequence on the same request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind.
    pub mtype: MsgType,
    /// Positive request id.
    pub req_id: u64,
    /// More frames follow on this request id.
    pub more: bool,
    /// The sender is aborting this request id.
    pub abort: bool,
    /// Data payload, if any.
    pub data: Option<Value>,
    /// Error payload, if any.
    pub error: Option<Value>,
}

impl Message {
    /// Creates a plain message with no flags or payload.
    #[must_use]
    pub fn new(mtype: MsgType, req_id: u64) -> Self {
        Message {
            mtype,
            req_id,
            more: false,
            abort: false,
            data: None,
            error: None,
        }
    }

    /// Creates a message carrying a data payload.
    #[must_use]
    pub fn with_data(mtype: MsgType, req_id: u64, data: Value) -> Self {
        Message {
            data: Some(data),
            ..Message::new(mtype, req_id)
        }
    }

    /// Creates a message carrying an error payload.
    #[must_use]
    pub fn with_error(mtype: MsgType, req_id: u64, error: Value) -> Self {
        Message {
            error: Some(error),
            ..Message::new(mtype, req_id)
        }
    }

    /// Creates an abort frame for the given request id.
    #[must_use]
    pub fn abort(mtype: MsgType, req_id: u64) -> Self {
        Message {
            abort: true,
            ..Message::new(mtype, req_id)
        }
    }

    /// Sets the `more` flag.
    #[must_use]
    pub fn more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }
}

/// Encodes a message into a wire frame.
///
/// Flag precedence when more than one property is set: `!` over `#`
/// over `+` — an error payload terminates any stream, so `more` never
/// accompanies it on the wire.
pub fn encode(msg: &Message) -> FrameResult<Bytes> {
    if msg.req_id == 0 {
        return Err(FrameError::BadReqId("0".to_string()));
    }
    let payload = msg.error.as_ref().or(msg.data.as_ref());
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(msg.mtype.tag());
    if msg.error.is_some() {
        buf.put_u8(b'!');
    } else if msg.abort {
        buf.put_u8(b'#');
    } else if msg.more {
        buf.put_u8(b'+');
    }
    buf.put_slice(msg.req_id.to_string().as_bytes());
    if let Some(payload) = payload {
        buf.put_u8(b':');
        // Serializing a Value cannot fail: all map keys are strings.
        let text = serde_json::to_vec(payload)
            .map_err(|e| FrameError::BadPayload(e.to_string()))?;
        buf.put_slice(&text);
    }
    Ok(buf.freeze())
}

/// Decodes a wire frame into a message.
pub fn decode(frame: &[u8]) -> FrameResult<Message> {
    let (&tag, mut rest) = frame.split_first().ok_or(FrameError::Empty)?;
    let mtype = MsgType::from_tag(tag)?;

    let mut more = false;
    let mut abort = false;
    let mut is_error = false;
    if let Some((&flag, after)) = rest.split_first() {
        match flag {
            b'!' => {
                is_error = true;
                rest = after;
            }
            b'+' => {
                more = true;
                rest = after;
            }
            b'#' => {
                abort = true;
                rest = after;
            }
            _ => {}
        }
    }

    let digits_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    let digits = &rest[..digits_len];
    if digits.is_empty() {
        return Err(FrameError::BadReqId(
            String::from_utf8_lossy(rest).into_owned(),
        ));
    }
    let req_id: u64 = std::str::from_utf8(digits)
        .expect("digits are ASCII")
        .parse()
        .map_err(|_| FrameError::BadReqId(String::from_utf8_lossy(digits).into_owned()))?;
    if req_id == 0 {
        return Err(FrameError::BadReqId("0".to_string()));
    }

    let rest = &rest[digits_len..];
    let payload = match rest.split_first() {
        None => None,
        Some((&b':', body)) => Some(
            serde_json::from_slice::<Value>(body)
                .map_err(|e| FrameError::BadPayload(e.to_string()))?,
        ),
        Some((&other, _)) => {
            return Err(FrameError::BadReqId(format!(
                "unexpected byte {other:#04x} after request id"
            )))
        }
    };

    let (data, error) = if is_error {
        (None, payload)
    } else {
        (payload, None)
    };
    Ok(Message {
        mtype,
        req_id,
        more,
        abort,
        data,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_basic() {
        let msg = Message::with_data(MsgType::Call, 12, json!("hello"));
        let frame = encode(&msg).unwrap();
        assert_eq!(&frame[..], b"C12:\"hello\"");
    }

    #[test]
    fn test_encode_flags() {
        let more = Message::with_data(MsgType::Resp, 3, json!([1])).more(true);
        assert_eq!(&encode(&more).unwrap()[..], b"R+3:[1]");

        let abort = Message::abort(MsgType::Call, 7);
        assert_eq!(&encode(&abort).unwrap()[..], b"C#7");

        let error = Message::with_error(MsgType::Resp, 9, json!({"code": "HANDLER"}));
        assert_eq!(&encode(&error).unwrap()[..], b"R!9:{\"code\":\"HANDLER\"}");
    }

    #[test]
    fn test_error_flag_wins_over_more() {
        let msg = Message::with_error(MsgType::Resp, 4, json!("e")).more(true);
        let frame = encode(&msg).unwrap();
        assert_eq!(frame[1], b'!');
    }

    #[test]
    fn test_decode_no_payload() {
        let msg = decode(b"R41").unwrap();
        assert_eq!(msg.mtype, MsgType::Resp);
        assert_eq!(msg.req_id, 41);
        assert!(msg.data.is_none());
        assert!(msg.error.is_none());
        assert!(!msg.more);
    }

    #[test]
    fn test_roundtrip_all_shapes() {
        let shapes = vec![
            Message::new(MsgType::Resp, 1),
            Message::with_data(MsgType::Call, 2, json!({"a": [1, 2, null]})),
            Message::with_data(MsgType::Signal, 3, json!(["action", {"actionNum": 1}])),
            Message::with_data(MsgType::Resp, 4, json!("chunk")).more(true),
            Message::with_error(MsgType::Resp, 5, json!({"code": "ABORTED"})),
            Message::abort(MsgType::Call, 6),
            Message::new(MsgType::Call, u64::MAX),
        ];
        for msg in shapes {
            let decoded = decode(&encode(&msg).unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_bad_tag() {
        assert_eq!(decode(b"X1"), Err(FrameError::BadTag(b'X')));
        assert_eq!(decode(b""), Err(FrameError::Empty));
    }

    #[test]
    fn test_decode_bad_req_id() {
        assert!(matches!(decode(b"C0"), Err(FrameError::BadReqId(_))));
        assert!(matches!(decode(b"C"), Err(FrameError::BadReqId(_))));
        assert!(matches!(decode(b"C-5"), Err(FrameError::BadReqId(_))));
        assert!(matches!(decode(b"Cabc"), Err(FrameError::BadReqId(_))));
        // Overflowing u64 is rejected rather than wrapped.
        assert!(matches!(
            decode(b"C99999999999999999999999"),
            Err(FrameError::BadReqId(_))
        ));
    }

    #[test]
    fn test_decode_bad_payload() {
        assert!(matches!(decode(b"C1:"), Err(FrameError::BadPayload(_))));
        assert!(matches!(decode(b"C1:{oops"), Err(FrameError::BadPayload(_))));
    }

    #[test]
    fn test_decode_junk_after_req_id() {
        assert!(matches!(decode(b"C12;x"), Err(FrameError::BadReqId(_))));
    }

    #[test]
    fn test_encode_rejects_zero_req_id() {
        let msg = Message::new(MsgType::Call, 0);
        assert!(matches!(encode(&msg), Err(FrameError::BadReqId(_))));
    }
}
