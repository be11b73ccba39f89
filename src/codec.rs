use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::format::{Field, FieldFlags, MessageFormat, Schema, Value, WireType};
use crate::messages::{self, BackendMessage, FrontendMessage};

/// Maximum message size in bytes (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Writes every field of the message in declared order. The inclusive length field is
/// written as a placeholder and back-patched once everything after it is known.
pub fn encode(message: &MessageFormat, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let schema = message.schema();
    if message.values().len() != schema.fields.len() {
        return Err(ProtocolError::SchemaMismatch {
            expected: schema.name,
            actual: "MessageFormat",
        });
    }

    let mut length_at = None;
    for (field, value) in schema.fields.iter().zip(message.values()) {
        if field.flags == FieldFlags::InclusiveLength {
            length_at = Some(dst.len());
            dst.put_i32(0);
        } else {
            put_field(field, value, dst)?;
        }
    }

    if let Some(at) = length_at {
        let len = dst.len() - at;
        let len = i32::try_from(len).map_err(|_| ProtocolError::MessageTooLarge {
            len,
            max: i32::MAX as usize,
        })?;
        dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }

    Ok(())
}

fn put_field(field: &Field, value: &Value, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let invalid = || ProtocolError::InvalidValue { field: field.name };

    match (&field.wire_type, value) {
        (WireType::Byte1, Value::Byte(b)) => dst.put_u8(*b),
        (WireType::Int16, Value::Int16(i)) => dst.put_i16(*i),
        (WireType::Int32, Value::Int32(i)) => dst.put_i32(*i),
        (WireType::CString, Value::Str(s)) => {
            if s.contains('\0') {
                return Err(invalid());
            }
            dst.put_slice(s.as_bytes());
            dst.put_u8(0);
        }
        (WireType::LengthPrefixed, Value::Bytes(None)) => dst.put_i32(-1),
        (WireType::LengthPrefixed, Value::Bytes(Some(bytes))) => {
            let len = i32::try_from(bytes.len()).map_err(|_| invalid())?;
            dst.put_i32(len);
            dst.put_slice(bytes);
        }
        (WireType::Remaining, Value::Raw(bytes)) => dst.put_slice(bytes),
        (WireType::Repeated16(children), Value::Group(rows)) => {
            let count = i16::try_from(rows.len()).map_err(|_| invalid())?;
            dst.put_i16(count);
            put_rows(children, rows, dst)?;
        }
        (WireType::Repeated32(children), Value::Group(rows)) => {
            let count = i32::try_from(rows.len()).map_err(|_| invalid())?;
            dst.put_i32(count);
            put_rows(children, rows, dst)?;
        }
        (WireType::Terminated(children), Value::Group(rows)) => {
            put_rows(children, rows, dst)?;
            dst.put_u8(0);
        }
        _ => return Err(invalid()),
    }

    Ok(())
}

fn put_rows(
    children: &[Field],
    rows: &[Vec<Value>],
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    for row in rows {
        if row.len() != children.len() {
            return Err(ProtocolError::InvalidValue {
                field: children.first().map_or("group", |f| f.name),
            });
        }
        for (child, value) in children.iter().zip(row) {
            put_field(child, value, dst)?;
        }
    }
    Ok(())
}

/// Reads one complete frame into an instance of `schema`.
///
/// The inclusive length bounds every following read; a frame that is shorter than its
/// fields require, or that leaves bytes unconsumed, is malformed.
pub fn decode(mut src: Bytes, schema: &'static Schema) -> Result<MessageFormat, ProtocolError> {
    let mut values = Vec::with_capacity(schema.fields.len());
    let mut trailing = Bytes::new();

    for field in schema.fields {
        match field.flags {
            FieldFlags::HeaderTag => {
                let tag = get_u8(&mut src, field)?;
                if Some(tag) != schema.header_tag() {
                    return Err(ProtocolError::malformed(format!(
                        "expected tag {:?} for {}, got {:?}",
                        schema.header_tag().map(char::from),
                        schema.name,
                        char::from(tag)
                    )));
                }
                values.push(Value::Byte(tag));
            }
            FieldFlags::InclusiveLength => {
                let len = get_i32(&mut src, field)?;
                let body = usize::try_from(len)
                    .ok()
                    .and_then(|len| len.checked_sub(4))
                    .ok_or_else(|| {
                        ProtocolError::malformed(format!("invalid message length {len}"))
                    })?;
                if src.remaining() < body {
                    return Err(ProtocolError::malformed(format!(
                        "{} declares {} bytes but only {} are available",
                        schema.name,
                        body,
                        src.remaining()
                    )));
                }
                trailing = src.split_off(body);
                values.push(Value::Int32(len));
            }
            FieldFlags::None => values.push(get_field(field, &mut src)?),
        }
    }

    if src.has_remaining() || trailing.has_remaining() {
        return Err(ProtocolError::malformed(format!(
            "{} bytes left unconsumed after {}",
            src.remaining() + trailing.remaining(),
            schema.name
        )));
    }

    Ok(MessageFormat::from_parts(schema, values))
}

fn truncated(field: &Field) -> ProtocolError {
    ProtocolError::malformed(format!("not enough data for field {}", field.name))
}

fn get_u8(src: &mut Bytes, field: &Field) -> Result<u8, ProtocolError> {
    if src.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(src.get_u8())
}

fn get_i16(src: &mut Bytes, field: &Field) -> Result<i16, ProtocolError> {
    if src.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(src.get_i16())
}

fn get_i32(src: &mut Bytes, field: &Field) -> Result<i32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(truncated(field));
    }
    Ok(src.get_i32())
}

fn get_count(count: i64, field: &Field) -> Result<usize, ProtocolError> {
    usize::try_from(count)
        .map_err(|_| ProtocolError::malformed(format!("negative count for {}", field.name)))
}

fn get_field(field: &Field, src: &mut Bytes) -> Result<Value, ProtocolError> {
    let value = match field.wire_type {
        WireType::Byte1 => Value::Byte(get_u8(src, field)?),
        WireType::Int16 => Value::Int16(get_i16(src, field)?),
        WireType::Int32 => Value::Int32(get_i32(src, field)?),
        WireType::CString => {
            let end = src
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| truncated(field))?;
            let bytes = src.split_to(end);
            src.advance(1);
            let string = String::from_utf8(bytes.to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8 { field: field.name })?;
            Value::str(string)
        }
        WireType::LengthPrefixed => {
            let len = get_i32(src, field)?;
            if len == -1 {
                Value::Bytes(None)
            } else {
                let len = get_count(len.into(), field)?;
                if src.remaining() < len {
                    return Err(truncated(field));
                }
                Value::Bytes(Some(src.split_to(len)))
            }
        }
        WireType::Remaining => Value::Raw(src.split_to(src.remaining())),
        WireType::Repeated16(children) => {
            let count = get_count(get_i16(src, field)?.into(), field)?;
            Value::Group(get_rows(children, count, src)?)
        }
        WireType::Repeated32(children) => {
            let count = get_count(get_i32(src, field)?.into(), field)?;
            Value::Group(get_rows(children, count, src)?)
        }
        WireType::Terminated(children) => {
            let mut rows = Vec::new();
            loop {
                match src.first() {
                    None => return Err(truncated(field)),
                    Some(0) => {
                        src.advance(1);
                        break;
                    }
                    Some(_) => rows.push(get_row(children, src)?),
                }
            }
            Value::Group(rows)
        }
    };

    Ok(value)
}

fn get_rows(
    children: &[Field],
    count: usize,
    src: &mut Bytes,
) -> Result<Vec<Vec<Value>>, ProtocolError> {
    // The count comes from the peer; cap the preallocation by what the frame can hold.
    let mut rows = Vec::with_capacity(count.min(src.remaining()));
    for _ in 0..count {
        rows.push(get_row(children, src)?);
    }
    Ok(rows)
}

fn get_row(children: &[Field], src: &mut Bytes) -> Result<Vec<Value>, ProtocolError> {
    children.iter().map(|child| get_field(child, src)).collect()
}

/// Framing phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Untagged frames: `[length][request code or protocol version][payload]`.
    Startup,
    /// Tagged frames: `[tag][length][payload]`.
    Ready,
}

/// Server side codec: decodes [`FrontendMessage`]s and encodes [`BackendMessage`]s.
#[derive(Debug)]
pub struct MessageCodec {
    max_message_size: usize,
    phase: Phase,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            phase: Phase::Startup,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = FrontendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.phase {
            Phase::Startup => {
                let Some(frame) = split_untagged(src, self.max_message_size)? else {
                    return Ok(None);
                };
                FrontendMessage::decode_startup(frame).map(Some)
            }
            Phase::Ready => {
                let registry = messages::frontend()?;
                if let Some(&tag) = src.first() {
                    // Fail before waiting on a length we cannot interpret.
                    if registry.lookup(tag).is_none() {
                        return Err(ProtocolError::UnknownMessageType(tag));
                    }
                }
                let Some(frame) = split_tagged(src, self.max_message_size)? else {
                    return Ok(None);
                };
                registry.decode(frame).map(Some)
            }
        }
    }
}

impl Encoder<BackendMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&item.encode()?, dst)
    }
}

/// Client side codec: decodes [`BackendMessage`]s and encodes [`FrontendMessage`]s.
#[derive(Debug)]
pub struct ClientCodec {
    max_message_size: usize,
    awaiting_negotiation: bool,
}

impl ClientCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            awaiting_negotiation: false,
        }
    }

    /// The next inbound frame is the single byte answer to an SSL or GSSAPI request.
    pub fn expect_negotiation_response(&mut self) {
        self.awaiting_negotiation = true;
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for ClientCodec {
    type Item = BackendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.awaiting_negotiation {
            if src.is_empty() {
                return Ok(None);
            }
            self.awaiting_negotiation = false;
            let frame = src.split_to(1).freeze();
            return BackendMessage::decode_negotiation(frame).map(Some);
        }

        let registry = messages::backend()?;
        if let Some(&tag) = src.first() {
            if registry.lookup(tag).is_none() {
                return Err(ProtocolError::UnknownMessageType(tag));
            }
        }
        let Some(frame) = split_tagged(src, self.max_message_size)? else {
            return Ok(None);
        };
        registry.decode(frame).map(Some)
    }
}

impl Encoder<FrontendMessage> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: FrontendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&item.encode()?, dst)
    }
}

/// Splits one `[length][payload]` frame off the buffer once it is complete.
fn split_untagged(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>, ProtocolError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = peek_length(src, 0)?;
    if len < 8 {
        return Err(ProtocolError::malformed(format!(
            "startup packet length {len} is too short"
        )));
    }
    split_frame(src, len, max)
}

/// Splits one `[tag][length][payload]` frame off the buffer once it is complete.
fn split_tagged(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>, ProtocolError> {
    if src.len() < 5 {
        return Ok(None);
    }
    let len = peek_length(src, 1)?;
    if len < 4 {
        return Err(ProtocolError::malformed(format!(
            "invalid message length {len}"
        )));
    }
    split_frame(src, len + 1, max)
}

fn peek_length(src: &BytesMut, at: usize) -> Result<usize, ProtocolError> {
    let len = i32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);
    usize::try_from(len)
        .map_err(|_| ProtocolError::malformed(format!("invalid message length {len}")))
}

fn split_frame(
    src: &mut BytesMut,
    total: usize,
    max: usize,
) -> Result<Option<Bytes>, ProtocolError> {
    if total > max {
        return Err(ProtocolError::MessageTooLarge { len: total, max });
    }
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    Ok(Some(src.split_to(total).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE: Schema = Schema {
        name: "Sample",
        fields: &[
            Field::header(b'x'),
            Field::length(),
            Field::cstring("Name"),
            Field::int16("Small"),
            Field::repeated16("Values", &[Field::length_prefixed("Value")]),
            Field::terminated(
                "Pairs",
                &[Field::byte1("Code", 0), Field::cstring("Text")],
            ),
            Field::remaining("Rest"),
        ],
    };

    static UNTAGGED: Schema = Schema {
        name: "Untagged",
        fields: &[Field::length(), Field::int32("Code", 7)],
    };

    fn sample() -> MessageFormat {
        MessageFormat::new(&SAMPLE)
            .with("Name", Value::str("abc"))
            .unwrap()
            .with("Small", Value::Int16(-2))
            .unwrap()
            .with(
                "Values",
                Value::Group(vec![
                    vec![Value::Bytes(Some(Bytes::from_static(b"hi")))],
                    vec![Value::Bytes(None)],
                ]),
            )
            .unwrap()
            .with(
                "Pairs",
                Value::Group(vec![vec![Value::Byte(b'M'), Value::str("oops")]]),
            )
            .unwrap()
            .with("Rest", Value::Raw(Bytes::from_static(b"tail")))
            .unwrap()
    }

    #[test]
    fn encode_writes_header_then_inclusive_length() {
        let mut buf = BytesMut::new();
        encode(&sample(), &mut buf).unwrap();

        let expected: &[u8] = &[
            b'x', 0, 0, 0, 33, // header + length
            b'a', b'b', b'c', 0, // Name
            0xFF, 0xFE, // Small
            0, 2, // Values count
            0, 0, 0, 2, b'h', b'i', // "hi"
            0xFF, 0xFF, 0xFF, 0xFF, // NULL
            b'M', b'o', b'o', b'p', b's', 0, 0, // Pairs + terminator
            b't', b'a', b'i', b'l', // Rest
        ];
        assert_eq!(&buf[..], expected);
        assert_eq!(buf.len() - 1, 33);
    }

    #[test]
    fn decode_reverses_encode() {
        let mut buf = BytesMut::new();
        encode(&sample(), &mut buf).unwrap();

        let decoded = decode(buf.freeze(), &SAMPLE).unwrap();

        let mut values = sample().values().to_vec();
        values[1] = Value::Int32(33);
        assert_eq!(decoded, MessageFormat::from_parts(&SAMPLE, values));
    }

    #[test]
    fn length_of_untagged_message_counts_itself() {
        let mut buf = BytesMut::new();
        encode(&MessageFormat::new(&UNTAGGED), &mut buf).unwrap();

        assert_eq!(&buf[..], &[0, 0, 0, 8, 0, 0, 0, 7]);
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let frame = Bytes::from_static(&[0, 0, 0, 8, 0, 0]);

        let err = decode(frame, &UNTAGGED).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_unconsumed_bytes() {
        let frame = Bytes::from_static(&[0, 0, 0, 9, 0, 0, 0, 7, 1]);

        let err = decode(frame, &UNTAGGED).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_bytes_beyond_declared_length() {
        let frame = Bytes::from_static(&[0, 0, 0, 8, 0, 0, 0, 7, 1]);

        let err = decode(frame, &UNTAGGED).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_length_below_four() {
        let frame = Bytes::from_static(&[0, 0, 0, 3, 0, 0, 0, 7]);

        assert!(decode(frame, &UNTAGGED).is_err());
    }

    #[test]
    fn decode_rejects_wrong_tag() {
        let frame = Bytes::from_static(&[b'y', 0, 0, 0, 4]);

        let err = decode(frame, &SAMPLE).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_unterminated_group() {
        // Name "", Small 0, no Values, one Pairs entry and no terminator.
        let frame = Bytes::from_static(&[b'x', 0, 0, 0, 12, 0, 0, 0, 0, 0, b'M', b'a', 0]);

        let err = decode(frame, &SAMPLE).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn encode_rejects_value_that_does_not_fit() {
        let format = MessageFormat::from_parts(
            &UNTAGGED,
            vec![Value::Int32(0), Value::str("not an int")],
        );

        let err = encode(&format, &mut BytesMut::new()).unwrap_err();

        assert!(matches!(err, ProtocolError::InvalidValue { field: "Code" }));
    }

    #[test]
    fn split_waits_for_complete_frame() {
        let mut buf = BytesMut::from(&[b'Q', 0, 0, 0, 9, b'a'][..]);

        assert!(split_tagged(&mut buf, 1024).unwrap().is_none());

        buf.extend_from_slice(&[b'b', b'c', b'd', 0]);
        let frame = split_tagged(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame.len(), 10);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_rejects_oversized_frame() {
        let mut buf = BytesMut::from(&[b'Q', 0, 0, 4, 0][..]);

        let err = split_tagged(&mut buf, 64).unwrap_err();

        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
