//! Frame codec spoken between the client and a broker.
//!
//! Every frame is `[varint body length][u8 tag][fields]`. Strings and byte
//! strings carry a varint length prefix, optional fields a presence byte,
//! integers are big endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::message::{Payload, Properties, PropertyValue, QoS};
use crate::varint;

/// Largest frame body accepted by [`decode_frame`].
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Open = 0x01,
    Opened = 0x02,
    OpenRejected = 0x03,
    Send = 0x10,
    SendAck = 0x11,
    Subscribe = 0x20,
    SubscribeAck = 0x21,
    Unsubscribe = 0x22,
    UnsubscribeAck = 0x23,
    Rejected = 0x30,
    Deliver = 0x40,
    Confirm = 0x41,
    Close = 0x7F,
}

impl TryFrom<u8> for FrameTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameTag::Open),
            0x02 => Ok(FrameTag::Opened),
            0x03 => Ok(FrameTag::OpenRejected),
            0x10 => Ok(FrameTag::Send),
            0x11 => Ok(FrameTag::SendAck),
            0x20 => Ok(FrameTag::Subscribe),
            0x21 => Ok(FrameTag::SubscribeAck),
            0x22 => Ok(FrameTag::Unsubscribe),
            0x23 => Ok(FrameTag::UnsubscribeAck),
            0x30 => Ok(FrameTag::Rejected),
            0x40 => Ok(FrameTag::Deliver),
            0x41 => Ok(FrameTag::Confirm),
            0x7F => Ok(FrameTag::Close),
            _ => Err(ProtocolError::InvalidFrameTag(value)),
        }
    }
}

/// Why a broker refused to open a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Unauthorized = 0,
    InvalidClientId = 1,
    Other = 2,
}

impl TryFrom<u8> for RejectReason {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RejectReason::Unauthorized),
            1 => Ok(RejectReason::InvalidClientId),
            2 => Ok(RejectReason::Other),
            _ => Err(ProtocolError::InvalidValue {
                field: "reject reason",
                value,
            }),
        }
    }
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// Another client opened a session with the same identifier.
    Replaced,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A message sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: u64,
    pub topic: String,
    pub qos: QoS,
    pub ttl_ms: Option<u64>,
    pub properties: Properties,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub id: u64,
    pub topic_pattern: String,
    pub share: Option<String>,
    pub qos: QoS,
    pub auto_confirm: bool,
    pub ttl_ms: u64,
    pub credit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub id: u64,
    pub topic_pattern: String,
    pub share: Option<String>,
    pub ttl_ms: Option<u64>,
}

/// A message delivered to the client for one of its subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub delivery_id: u64,
    pub topic: String,
    pub topic_pattern: String,
    pub share: Option<String>,
    pub qos: QoS,
    pub ttl_ms: Option<u64>,
    pub properties: Properties,
    pub payload: Payload,
    /// Set when the payload was tagged as text but was not valid UTF-8.
    /// The raw bytes are kept in `payload`.
    pub malformed: bool,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Open),
    Opened,
    OpenRejected { reason: RejectReason, message: String },
    Send(OutboundMessage),
    SendAck { id: u64 },
    Subscribe(SubscribeRequest),
    SubscribeAck { id: u64 },
    Unsubscribe(UnsubscribeRequest),
    UnsubscribeAck { id: u64 },
    Rejected { id: u64, message: String },
    Deliver(InboundMessage),
    Confirm { delivery_id: u64 },
    Close(CloseReason),
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Open(_) => FrameTag::Open,
            Frame::Opened => FrameTag::Opened,
            Frame::OpenRejected { .. } => FrameTag::OpenRejected,
            Frame::Send(_) => FrameTag::Send,
            Frame::SendAck { .. } => FrameTag::SendAck,
            Frame::Subscribe(_) => FrameTag::Subscribe,
            Frame::SubscribeAck { .. } => FrameTag::SubscribeAck,
            Frame::Unsubscribe(_) => FrameTag::Unsubscribe,
            Frame::UnsubscribeAck { .. } => FrameTag::UnsubscribeAck,
            Frame::Rejected { .. } => FrameTag::Rejected,
            Frame::Deliver(_) => FrameTag::Deliver,
            Frame::Confirm { .. } => FrameTag::Confirm,
            Frame::Close(_) => FrameTag::Close,
        }
    }
}

const PAYLOAD_TEXT: u8 = 0;
const PAYLOAD_BYTES: u8 = 1;

const PROP_BOOL: u8 = 0;
const PROP_INTEGER: u8 = 1;
const PROP_DOUBLE: u8 = 2;
const PROP_TEXT: u8 = 3;
const PROP_BYTES: u8 = 4;

const CLOSE_NORMAL: u8 = 0;
const CLOSE_REPLACED: u8 = 1;
const CLOSE_ERROR: u8 = 2;

/// Cursor over a frame body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(ProtocolError::InvalidValue {
                field: "bool",
                value,
            }),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_len(&mut self) -> Result<usize> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((len, consumed)) => {
                self.pos += consumed;
                Ok(len)
            }
            None => Err(ProtocolError::Truncated {
                needed: 1,
                have: 0,
            }),
        }
    }

    fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        if self.read_bool()? {
            Ok(Some(self.read_u64()?))
        } else {
            Ok(None)
        }
    }

    fn read_qos(&mut self) -> Result<QoS> {
        QoS::try_from(self.read_u8()?)
    }

    fn read_properties(&mut self) -> Result<Properties> {
        let count = self.read_len()?;
        let mut properties = Properties::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = match self.read_u8()? {
                PROP_BOOL => PropertyValue::Bool(self.read_bool()?),
                PROP_INTEGER => PropertyValue::Integer(self.read_u64()? as i64),
                PROP_DOUBLE => PropertyValue::Double(f64::from_bits(self.read_u64()?)),
                PROP_TEXT => PropertyValue::Text(self.read_string()?),
                PROP_BYTES => PropertyValue::Bytes(Bytes::copy_from_slice(self.read_blob()?)),
                value => {
                    return Err(ProtocolError::InvalidValue {
                        field: "property type",
                        value,
                    })
                }
            };
            properties.insert(key, value);
        }
        Ok(properties)
    }

    /// Returns the payload and whether a text payload failed UTF-8 decoding.
    fn read_payload(&mut self) -> Result<(Payload, bool)> {
        let kind = self.read_u8()?;
        let raw = self.read_blob()?;
        match kind {
            PAYLOAD_TEXT => match std::str::from_utf8(raw) {
                Ok(text) => Ok((Payload::Text(text.to_string()), false)),
                Err(_) => Ok((Payload::Bytes(Bytes::copy_from_slice(raw)), true)),
            },
            PAYLOAD_BYTES => Ok((Payload::Bytes(Bytes::copy_from_slice(raw)), false)),
            value => Err(ProtocolError::InvalidValue {
                field: "payload type",
                value,
            }),
        }
    }

    fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` if a whole frame is buffered,
/// `Ok(None)` if more data is needed, or `Err` on protocol errors.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some((body_len, len_bytes)) = varint::decode(buf)? else {
        return Ok(None);
    };
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    let total_len = len_bytes + body_len;
    if buf.len() < total_len {
        return Ok(None);
    }
    if body_len == 0 {
        return Err(ProtocolError::MalformedFrame("empty frame".into()));
    }

    let body = &buf[len_bytes..total_len];
    let tag = FrameTag::try_from(body[0])?;
    let mut d = Decoder::new(&body[1..]);

    let frame = match tag {
        FrameTag::Open => Frame::Open(Open {
            client_id: d.read_string()?,
            username: d.read_opt_string()?,
            password: d.read_opt_string()?,
        }),
        FrameTag::Opened => Frame::Opened,
        FrameTag::OpenRejected => Frame::OpenRejected {
            reason: RejectReason::try_from(d.read_u8()?)?,
            message: d.read_string()?,
        },
        FrameTag::Send => {
            let id = d.read_u64()?;
            let topic = d.read_string()?;
            let qos = d.read_qos()?;
            let ttl_ms = d.read_opt_u64()?;
            let properties = d.read_properties()?;
            let (payload, _) = d.read_payload()?;
            Frame::Send(OutboundMessage {
                id,
                topic,
                qos,
                ttl_ms,
                properties,
                payload,
            })
        }
        FrameTag::SendAck => Frame::SendAck { id: d.read_u64()? },
        FrameTag::Subscribe => Frame::Subscribe(SubscribeRequest {
            id: d.read_u64()?,
            topic_pattern: d.read_string()?,
            share: d.read_opt_string()?,
            qos: d.read_qos()?,
            auto_confirm: d.read_bool()?,
            ttl_ms: d.read_u64()?,
            credit: d.read_u32()?,
        }),
        FrameTag::SubscribeAck => Frame::SubscribeAck { id: d.read_u64()? },
        FrameTag::Unsubscribe => Frame::Unsubscribe(UnsubscribeRequest {
            id: d.read_u64()?,
            topic_pattern: d.read_string()?,
            share: d.read_opt_string()?,
            ttl_ms: d.read_opt_u64()?,
        }),
        FrameTag::UnsubscribeAck => Frame::UnsubscribeAck { id: d.read_u64()? },
        FrameTag::Rejected => Frame::Rejected {
            id: d.read_u64()?,
            message: d.read_string()?,
        },
        FrameTag::Deliver => {
            let delivery_id = d.read_u64()?;
            let topic = d.read_string()?;
            let topic_pattern = d.read_string()?;
            let share = d.read_opt_string()?;
            let qos = d.read_qos()?;
            let ttl_ms = d.read_opt_u64()?;
            let properties = d.read_properties()?;
            let (payload, malformed) = d.read_payload()?;
            Frame::Deliver(InboundMessage {
                delivery_id,
                topic,
                topic_pattern,
                share,
                qos,
                ttl_ms,
                properties,
                payload,
                malformed,
            })
        }
        FrameTag::Confirm => Frame::Confirm {
            delivery_id: d.read_u64()?,
        },
        FrameTag::Close => Frame::Close(match d.read_u8()? {
            CLOSE_NORMAL => CloseReason::Normal,
            CLOSE_REPLACED => CloseReason::Replaced,
            CLOSE_ERROR => CloseReason::Error(d.read_string()?),
            value => {
                return Err(ProtocolError::InvalidValue {
                    field: "close reason",
                    value,
                })
            }
        }),
    };

    d.finish()?;
    Ok(Some((frame, total_len)))
}

fn put_blob(buf: &mut BytesMut, raw: &[u8]) -> Result<()> {
    varint::encode(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_blob(buf, value.as_bytes())
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u64(value);
        }
        None => buf.put_u8(0),
    }
}

fn put_properties(buf: &mut BytesMut, properties: &Properties) -> Result<()> {
    varint::encode(properties.len(), buf)?;
    for (key, value) in properties {
        put_blob(buf, key.as_bytes())?;
        match value {
            PropertyValue::Bool(v) => {
                buf.put_u8(PROP_BOOL);
                buf.put_u8(*v as u8);
            }
            PropertyValue::Integer(v) => {
                buf.put_u8(PROP_INTEGER);
                buf.put_u64(*v as u64);
            }
            PropertyValue::Double(v) => {
                buf.put_u8(PROP_DOUBLE);
                buf.put_u64(v.to_bits());
            }
            PropertyValue::Text(v) => {
                buf.put_u8(PROP_TEXT);
                put_blob(buf, v.as_bytes())?;
            }
            PropertyValue::Bytes(v) => {
                buf.put_u8(PROP_BYTES);
                put_blob(buf, v)?;
            }
        }
    }
    Ok(())
}

fn put_payload(buf: &mut BytesMut, payload: &Payload, force_text: bool) -> Result<()> {
    let kind = match payload {
        Payload::Text(_) => PAYLOAD_TEXT,
        Payload::Bytes(_) if force_text => PAYLOAD_TEXT,
        Payload::Bytes(_) => PAYLOAD_BYTES,
    };
    buf.put_u8(kind);
    put_blob(buf, payload.as_bytes())
}

fn encode_body(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(frame.tag() as u8);
    match frame {
        Frame::Open(open) => {
            put_blob(buf, open.client_id.as_bytes())?;
            put_opt_string(buf, open.username.as_deref())?;
            put_opt_string(buf, open.password.as_deref())?;
        }
        Frame::Opened => {}
        Frame::OpenRejected { reason, message } => {
            buf.put_u8(*reason as u8);
            put_blob(buf, message.as_bytes())?;
        }
        Frame::Send(msg) => {
            buf.put_u64(msg.id);
            put_blob(buf, msg.topic.as_bytes())?;
            buf.put_u8(msg.qos as u8);
            put_opt_u64(buf, msg.ttl_ms);
            put_properties(buf, &msg.properties)?;
            put_payload(buf, &msg.payload, false)?;
        }
        Frame::SendAck { id } | Frame::SubscribeAck { id } | Frame::UnsubscribeAck { id } => {
            buf.put_u64(*id);
        }
        Frame::Subscribe(req) => {
            buf.put_u64(req.id);
            put_blob(buf, req.topic_pattern.as_bytes())?;
            put_opt_string(buf, req.share.as_deref())?;
            buf.put_u8(req.qos as u8);
            buf.put_u8(req.auto_confirm as u8);
            buf.put_u64(req.ttl_ms);
            buf.put_u32(req.credit);
        }
        Frame::Unsubscribe(req) => {
            buf.put_u64(req.id);
            put_blob(buf, req.topic_pattern.as_bytes())?;
            put_opt_string(buf, req.share.as_deref())?;
            put_opt_u64(buf, req.ttl_ms);
        }
        Frame::Rejected { id, message } => {
            buf.put_u64(*id);
            put_blob(buf, message.as_bytes())?;
        }
        Frame::Deliver(msg) => {
            buf.put_u64(msg.delivery_id);
            put_blob(buf, msg.topic.as_bytes())?;
            put_blob(buf, msg.topic_pattern.as_bytes())?;
            put_opt_string(buf, msg.share.as_deref())?;
            buf.put_u8(msg.qos as u8);
            put_opt_u64(buf, msg.ttl_ms);
            put_properties(buf, &msg.properties)?;
            put_payload(buf, &msg.payload, msg.malformed)?;
        }
        Frame::Confirm { delivery_id } => buf.put_u64(*delivery_id),
        Frame::Close(reason) => match reason {
            CloseReason::Normal => buf.put_u8(CLOSE_NORMAL),
            CloseReason::Replaced => buf.put_u8(CLOSE_REPLACED),
            CloseReason::Error(message) => {
                buf.put_u8(CLOSE_ERROR);
                put_blob(buf, message.as_bytes())?;
            }
        },
    }
    Ok(())
}

/// Append the encoding of `frame` to `buf`.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::with_capacity(64);
    encode_body(frame, &mut body)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    buf.reserve(varint::encoded_len(body.len()) + body.len());
    varint::encode(body.len(), buf)?;
    buf.put_slice(&body);
    Ok(())
}

/// Encode `frame` into a standalone buffer.
pub fn frame_to_bytes(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf)?;
    Ok(buf.freeze())
}
