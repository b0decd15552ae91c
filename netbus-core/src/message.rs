//! Wire message model: typed envelopes and their length-prefixed byte encoding.
//!
//! A [`Frame`] is either a routed [`Message`] or a bare liveness [`Frame::Ping`]. Encoding
//! produces the *payload* half of the wire format described in the crate's design notes; the
//! 4-byte big-endian length prefix that precedes each payload on the wire is applied by the
//! transport layer (connection pool / inbound server), not here — this module only ever sees
//! fully-buffered payloads, matching the "entire frame present" fast path of a length-prefixed
//! protocol.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BusError, Result};
use crate::node::NodeID;

const TAG_PING: u8 = 0;
const TAG_STR: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_F32: u8 = 6;
const TAG_F64: u8 = 7;
const TAG_JSON: u8 = 8;
const TAG_OBJECT: u8 = 9;

/// A message body.
///
/// The primitive variants mirror the well-known body types a codec-free send can carry
/// (string, byte array, integers, floats, boolean, structured JSON). [`Body::Object`] carries a
/// body that was serialized through a registered [`crate::codec::MessageCodec`]; its `type_name`
/// is the lookup key the receiving side uses to find a matching codec.
///
/// [`Body::Local`] never crosses the wire: it holds an arbitrary Rust value by reference count
/// for delivery within the same process when no codec is registered and the bus is not
/// clustered (the only topology where "by reference, no serialization" is sound). Attempting to
/// write a `Local` body to a peer connection is a logic error in the dispatch engine, not a
/// condition this module needs to handle.
#[derive(Clone)]
pub enum Body {
    /// UTF-8 string.
    Str(Arc<str>),
    /// Opaque byte array.
    Bytes(Bytes),
    /// Boolean.
    Bool(bool),
    /// Signed 32-bit integer.
    I32(i32),
    /// Signed 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Structured JSON value (object or array).
    Json(Arc<serde_json::Value>),
    /// User-codec body: already-encoded bytes plus the type name used to find the codec again.
    Object {
        /// Key used to look up the codec in the `CodecRegistry`.
        type_name: Arc<str>,
        /// Codec-encoded payload.
        payload: Bytes,
    },
    /// In-process-only body, carried by `Arc` without serialization. Never appears on the wire.
    Local(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::I32(v) => f.debug_tuple("I32").field(v).finish(),
            Self::I64(v) => f.debug_tuple("I64").field(v).finish(),
            Self::F32(v) => f.debug_tuple("F32").field(v).finish(),
            Self::F64(v) => f.debug_tuple("F64").field(v).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Object { type_name, payload } => f
                .debug_struct("Object")
                .field("type_name", type_name)
                .field("payload_len", &payload.len())
                .finish(),
            Self::Local(_) => f.debug_tuple("Local").field(&"<opaque>").finish(),
        }
    }
}

impl Body {
    /// Whether this body is eligible to be written to the wire.
    #[must_use]
    pub const fn is_wire_encodable(&self) -> bool {
        !matches!(self, Self::Local(_))
    }

    fn wire_tag(&self) -> Option<u8> {
        Some(match self {
            Self::Str(_) => TAG_STR,
            Self::Bytes(_) => TAG_BYTES,
            Self::Bool(_) => TAG_BOOL,
            Self::I32(_) => TAG_I32,
            Self::I64(_) => TAG_I64,
            Self::F32(_) => TAG_F32,
            Self::F64(_) => TAG_F64,
            Self::Json(_) => TAG_JSON,
            Self::Object { .. } => TAG_OBJECT,
            Self::Local(_) => return None,
        })
    }
}

/// A routed message envelope.
#[derive(Debug, Clone)]
pub struct Message {
    /// `true` for point-to-point `send`, `false` for fan-out `publish`.
    pub send: bool,
    /// Destination address.
    pub address: String,
    /// Reply-to address, present when the sender expects a reply.
    pub reply_address: Option<String>,
    /// Identity of the node that originated this message, if known (absent for purely local
    /// deliveries that never touched the wire).
    pub sender: Option<NodeID>,
    /// The message payload.
    pub body: Body,
}

impl Message {
    /// Build a new envelope.
    #[must_use]
    pub const fn new(send: bool, address: String, body: Body) -> Self {
        Self {
            send,
            address,
            reply_address: None,
            sender: None,
            body,
        }
    }
}

/// Either a routed [`Message`] or a bare ping carrying only the sender's identity.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A routed message.
    Message(Message),
    /// A liveness probe. The receiver replies with the single byte `0x01`, which is recognized
    /// by the connection holder's read loop as a pong and never length-prefixed itself.
    Ping {
        /// Identity of the peer sending the ping.
        sender: NodeID,
    },
}

/// Encode a frame's payload (the part that follows the 4-byte length prefix on the wire).
///
/// # Errors
///
/// Returns [`BusError::Protocol`] if asked to encode a [`Body::Local`] value, which by
/// definition cannot be serialized.
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    match frame {
        Frame::Ping { sender } => {
            buf.put_u8(TAG_PING);
            put_node(&mut buf, sender);
        }
        Frame::Message(msg) => {
            let tag = msg.body.wire_tag().ok_or_else(|| {
                BusError::protocol("cannot encode a Local (in-process-only) body to the wire")
            })?;
            buf.put_u8(tag);
            buf.put_u8(u8::from(msg.send));
            put_str_field(&mut buf, msg.reply_address.as_deref().unwrap_or(""));
            put_str_field(&mut buf, &msg.address);
            match &msg.sender {
                Some(n) => put_node(&mut buf, n),
                None => put_node(&mut buf, &NodeID::new(String::new(), 0)),
            }
            put_body(&mut buf, &msg.body)?;
        }
    }
    Ok(buf.freeze())
}

/// Decode a frame from a fully-buffered payload (the bytes following the length prefix).
///
/// # Errors
///
/// Returns [`BusError::Protocol`] on truncated input, invalid UTF-8, or an unrecognized type
/// tag.
pub fn decode_frame(mut src: &[u8]) -> Result<Frame> {
    let tag = take_u8(&mut src)?;
    if tag == TAG_PING {
        let sender = take_node(&mut src)?;
        return Ok(Frame::Ping { sender });
    }

    let send = take_u8(&mut src)? != 0;
    let reply_address = take_str_field(&mut src)?;
    let address = take_str_field(&mut src)?;
    let sender = take_node(&mut src)?;
    let body = take_body(tag, &mut src)?;

    Ok(Frame::Message(Message {
        send,
        address,
        reply_address: if reply_address.is_empty() {
            None
        } else {
            Some(reply_address)
        },
        sender: if sender.host.is_empty() && sender.port == 0 {
            None
        } else {
            Some(sender)
        },
        body,
    }))
}

fn put_str_field(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_node(buf: &mut BytesMut, node: &NodeID) {
    buf.put_u32(u32::from(node.port));
    put_str_field(buf, &node.host);
}

fn put_body(buf: &mut BytesMut, body: &Body) -> Result<()> {
    match body {
        Body::Str(s) => put_bytes_field(buf, s.as_bytes()),
        Body::Bytes(b) => put_bytes_field(buf, b),
        Body::Bool(b) => put_bytes_field(buf, &[u8::from(*b)]),
        Body::I32(v) => put_bytes_field(buf, &v.to_be_bytes()),
        Body::I64(v) => put_bytes_field(buf, &v.to_be_bytes()),
        Body::F32(v) => put_bytes_field(buf, &v.to_be_bytes()),
        Body::F64(v) => put_bytes_field(buf, &v.to_be_bytes()),
        Body::Json(v) => {
            let encoded = serde_json::to_vec(v.as_ref())
                .map_err(|e| BusError::protocol(format!("json encode failed: {e}")))?;
            put_bytes_field(buf, &encoded);
        }
        Body::Object { type_name, payload } => {
            put_str_field(buf, type_name);
            put_bytes_field(buf, payload);
        }
        Body::Local(_) => unreachable!("wire_tag() already rejected Local bodies"),
    }
    Ok(())
}

fn put_bytes_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_u8(src: &mut &[u8]) -> Result<u8> {
    if src.is_empty() {
        return Err(BusError::protocol("truncated frame: expected a tag byte"));
    }
    Ok(src.get_u8())
}

fn take_u32(src: &mut &[u8]) -> Result<u32> {
    if src.len() < 4 {
        return Err(BusError::protocol("truncated frame: expected a u32 length"));
    }
    Ok(src.get_u32())
}

fn take_bytes_field(src: &mut &[u8]) -> Result<Bytes> {
    let len = take_u32(src)? as usize;
    if src.len() < len {
        return Err(BusError::protocol("truncated frame: field shorter than declared length"));
    }
    let out = Bytes::copy_from_slice(&src[..len]);
    src.advance(len);
    Ok(out)
}

fn take_str_field(src: &mut &[u8]) -> Result<String> {
    let bytes = take_bytes_field(src)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| BusError::protocol(format!("invalid utf-8: {e}")))
}

fn take_node(src: &mut &[u8]) -> Result<NodeID> {
    let port = take_u32(src)?;
    let host = take_str_field(src)?;
    Ok(NodeID::new(host, port as u16))
}

fn take_body(tag: u8, src: &mut &[u8]) -> Result<Body> {
    Ok(match tag {
        TAG_STR => {
            let bytes = take_bytes_field(src)?;
            let s = String::from_utf8(bytes.to_vec())
                .map_err(|e| BusError::protocol(format!("invalid utf-8 body: {e}")))?;
            Body::Str(Arc::from(s))
        }
        TAG_BYTES => Body::Bytes(take_bytes_field(src)?),
        TAG_BOOL => {
            let bytes = take_bytes_field(src)?;
            Body::Bool(bytes.first().copied().unwrap_or(0) != 0)
        }
        TAG_I32 => {
            let bytes = take_bytes_field(src)?;
            let arr: [u8; 4] = bytes
                .get(..4)
                .ok_or_else(|| BusError::protocol("i32 body too short"))?
                .try_into()
                .unwrap();
            Body::I32(i32::from_be_bytes(arr))
        }
        TAG_I64 => {
            let bytes = take_bytes_field(src)?;
            let arr: [u8; 8] = bytes
                .get(..8)
                .ok_or_else(|| BusError::protocol("i64 body too short"))?
                .try_into()
                .unwrap();
            Body::I64(i64::from_be_bytes(arr))
        }
        TAG_F32 => {
            let bytes = take_bytes_field(src)?;
            let arr: [u8; 4] = bytes
                .get(..4)
                .ok_or_else(|| BusError::protocol("f32 body too short"))?
                .try_into()
                .unwrap();
            Body::F32(f32::from_be_bytes(arr))
        }
        TAG_F64 => {
            let bytes = take_bytes_field(src)?;
            let arr: [u8; 8] = bytes
                .get(..8)
                .ok_or_else(|| BusError::protocol("f64 body too short"))?
                .try_into()
                .unwrap();
            Body::F64(f64::from_be_bytes(arr))
        }
        TAG_JSON => {
            let bytes = take_bytes_field(src)?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| BusError::protocol(format!("json decode failed: {e}")))?;
            Body::Json(Arc::new(value))
        }
        TAG_OBJECT => {
            let type_name = take_str_field(src)?;
            let payload = take_bytes_field(src)?;
            Body::Object {
                type_name: Arc::from(type_name),
                payload,
            }
        }
        other => return Err(BusError::protocol(format!("unknown body type tag {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: Body) -> Body {
        let mut msg = Message::new(true, "a.b".to_string(), body);
        msg.reply_address = Some("reply.1".to_string());
        msg.sender = Some(NodeID::new("127.0.0.1", 9000));
        let encoded = encode_frame(&Frame::Message(msg.clone())).unwrap();
        match decode_frame(&encoded).unwrap() {
            Frame::Message(decoded) => {
                assert_eq!(decoded.send, msg.send);
                assert_eq!(decoded.address, msg.address);
                assert_eq!(decoded.reply_address, msg.reply_address);
                assert_eq!(decoded.sender, msg.sender);
                decoded.body
            }
            Frame::Ping { .. } => panic!("expected Message frame"),
        }
    }

    #[test]
    fn roundtrip_str() {
        match roundtrip(Body::Str(Arc::from("hello"))) {
            Body::Str(s) => assert_eq!(&*s, "hello"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn roundtrip_bytes() {
        match roundtrip(Body::Bytes(Bytes::from_static(b"\x00\x01\xff"))) {
            Body::Bytes(b) => assert_eq!(&b[..], b"\x00\x01\xff"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn roundtrip_bool() {
        match roundtrip(Body::Bool(true)) {
            Body::Bool(b) => assert!(b),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn roundtrip_integers_and_floats() {
        assert!(matches!(roundtrip(Body::I32(-42)), Body::I32(-42)));
        assert!(matches!(roundtrip(Body::I64(i64::MIN)), Body::I64(v) if v == i64::MIN));
        assert!(matches!(roundtrip(Body::F32(1.5)), Body::F32(v) if (v - 1.5).abs() < f32::EPSILON));
        assert!(matches!(roundtrip(Body::F64(3.25)), Body::F64(v) if (v - 3.25).abs() < f64::EPSILON));
    }

    #[test]
    fn roundtrip_json() {
        let value = serde_json::json!({"a": 1, "b": [1,2,3]});
        match roundtrip(Body::Json(Arc::new(value.clone()))) {
            Body::Json(v) => assert_eq!(*v, value),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn roundtrip_object() {
        let body = Body::Object {
            type_name: Arc::from("my.Type"),
            payload: Bytes::from_static(b"encoded"),
        };
        match roundtrip(body) {
            Body::Object { type_name, payload } => {
                assert_eq!(&*type_name, "my.Type");
                assert_eq!(&payload[..], b"encoded");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn local_body_rejects_wire_encoding() {
        let body = Body::Local(Arc::new(42u32));
        let msg = Message::new(true, "a".to_string(), body);
        assert!(encode_frame(&Frame::Message(msg)).is_err());
    }

    #[test]
    fn ping_roundtrip() {
        let sender = NodeID::new("10.0.0.5", 7000);
        let encoded = encode_frame(&Frame::Ping { sender: sender.clone() }).unwrap();
        match decode_frame(&encoded).unwrap() {
            Frame::Ping { sender: decoded } => assert_eq!(decoded, sender),
            Frame::Message(_) => panic!("expected Ping frame"),
        }
    }

    #[test]
    fn truncated_frame_is_protocol_error() {
        let err = decode_frame(&[TAG_STR]).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    /// A peer that declares (and actually sends) an I32/I64/F32/F64 body shorter than the type
    /// requires must produce a `Protocol` error, not an out-of-bounds slice panic — even though
    /// the declared body length matches the bytes actually present on the wire.
    #[test]
    fn truncated_numeric_body_is_protocol_error_not_a_panic() {
        for (tag, short_len) in [(TAG_I32, 2usize), (TAG_I64, 4), (TAG_F32, 2), (TAG_F64, 4)] {
            let mut msg = Message::new(true, "a".to_string(), Body::I32(0));
            msg.sender = Some(NodeID::new("127.0.0.1", 9000));
            let mut encoded = encode_frame(&Frame::Message(msg)).unwrap().to_vec();
            encoded[0] = tag;
            // The I32 body this was built from is an 8-byte tail: a u32 length prefix (4) plus
            // its 4-byte payload. Replace both with a length prefix and payload of `short_len`
            // bytes, so the declared length matches what's actually present but is still too
            // short for the numeric type the tag claims.
            let tail = encoded.len() - 8;
            encoded.truncate(tail);
            encoded.extend_from_slice(&(short_len as u32).to_be_bytes());
            encoded.extend(std::iter::repeat(0u8).take(short_len));
            let err = decode_frame(&encoded).unwrap_err();
            assert!(matches!(err, BusError::Protocol(_)), "tag {tag} should report Protocol, not panic");
        }
    }
}
