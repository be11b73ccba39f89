//! Scalar values and their text and binary wire representations.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::engine::ExecutionError;
use crate::error::sql_state;

pub type Oid = u32;

/// Type OIDs understood by [`DefaultFormat`].
///
/// Ref: <https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat>
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const VOID: Oid = 2278;
}

/// Size in bytes of a fixed width type, -1 for variable length types.
pub fn type_size(type_oid: Oid) -> i16 {
    match type_oid {
        oid::BOOL | oid::CHAR => 1,
        oid::INT2 => 2,
        oid::INT4 | oid::OID | oid::FLOAT4 | oid::VOID => 4,
        oid::INT8 | oid::FLOAT8 => 8,
        oid::NAME => 64,
        _ => -1,
    }
}

/// Format code for parameter and result values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum FormatCode {
    #[default]
    Text = 0,
    Binary = 1,
}

impl TryFrom<i16> for FormatCode {
    type Error = i16;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            _ => Err(value),
        }
    }
}

impl FormatCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Expands the format codes of a Bind message to one code per value: none means all
    /// text, one applies to every value, otherwise there must be exactly one per value.
    pub fn expand(codes: &[i16], count: usize) -> Result<Vec<FormatCode>, ExecutionError> {
        let codes = codes
            .iter()
            .map(|&code| {
                FormatCode::try_from(code).map_err(|code| {
                    ExecutionError::new(
                        sql_state::PROTOCOL_VIOLATION,
                        format!("unsupported format code: {code}"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        match codes.as_slice() {
            [] => Ok(vec![FormatCode::Text; count]),
            [code] => Ok(vec![*code; count]),
            _ if codes.len() == count => Ok(codes),
            _ => Err(ExecutionError::new(
                sql_state::PROTOCOL_VIOLATION,
                format!(
                    "bind message has {} format codes but {} values",
                    codes.len(),
                    count
                ),
            )),
        }
    }
}

/// A scalar value flowing between the engine and the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type a literal of this value would naturally be described as.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => oid::TEXT,
            Value::Bool(_) => oid::BOOL,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Text(_) => oid::TEXT,
            Value::Bytea(_) => oid::BYTEA,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => f.write_str(if *b { "t" } else { "f" }),
            Value::Int2(i) => write!(f, "{i}"),
            Value::Int4(i) => write!(f, "{i}"),
            Value::Int8(i) => write!(f, "{i}"),
            Value::Float4(x) => write_float(f, f64::from(*x)),
            Value::Float8(x) => write_float(f, *x),
            Value::Text(s) => f.write_str(s),
            Value::Bytea(bytes) => {
                f.write_str("\\x")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_nan() {
        f.write_str("NaN")
    } else if x.is_infinite() {
        f.write_str(if x > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        write!(f, "{x}")
    }
}

/// Converts values to and from their wire representation for a declared type.
pub trait ValueFormat: Send + Sync {
    /// Formats a value as column or parameter bytes. SQL NULL is `None`.
    fn format(
        &self,
        type_oid: Oid,
        format: FormatCode,
        value: &Value,
    ) -> Result<Option<Bytes>, ExecutionError>;

    /// Parses column or parameter bytes. `None` is SQL NULL.
    fn parse(
        &self,
        type_oid: Oid,
        format: FormatCode,
        bytes: Option<&[u8]>,
    ) -> Result<Value, ExecutionError>;
}

/// Text and binary representations of the built in scalar types.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFormat;

impl ValueFormat for DefaultFormat {
    fn format(
        &self,
        type_oid: Oid,
        format: FormatCode,
        value: &Value,
    ) -> Result<Option<Bytes>, ExecutionError> {
        if value.is_null() {
            return Ok(None);
        }

        let bytes = match format {
            FormatCode::Text => Bytes::from(value.to_string()),
            FormatCode::Binary => format_binary(type_oid, value)?,
        };
        Ok(Some(bytes))
    }

    fn parse(
        &self,
        type_oid: Oid,
        format: FormatCode,
        bytes: Option<&[u8]>,
    ) -> Result<Value, ExecutionError> {
        let Some(bytes) = bytes else {
            return Ok(Value::Null);
        };

        match format {
            FormatCode::Text => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    ExecutionError::new(
                        sql_state::INVALID_TEXT_REPRESENTATION,
                        "invalid byte sequence for encoding \"UTF8\"",
                    )
                })?;
                parse_text(type_oid, text)
            }
            FormatCode::Binary => parse_binary(type_oid, bytes),
        }
    }
}

fn invalid_text(type_name: &str, text: &str) -> ExecutionError {
    ExecutionError::new(
        sql_state::INVALID_TEXT_REPRESENTATION,
        format!("invalid input syntax for type {type_name}: \"{text}\""),
    )
}

fn parse_text(type_oid: Oid, text: &str) -> Result<Value, ExecutionError> {
    let value = match type_oid {
        oid::BOOL => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "yes" | "on" | "1" => Value::Bool(true),
            "f" | "false" | "no" | "off" | "0" => Value::Bool(false),
            _ => return Err(invalid_text("boolean", text)),
        },
        oid::INT2 => Value::Int2(
            text.trim()
                .parse()
                .map_err(|_| invalid_text("smallint", text))?,
        ),
        oid::INT4 => Value::Int4(
            text.trim()
                .parse()
                .map_err(|_| invalid_text("integer", text))?,
        ),
        oid::INT8 => Value::Int8(
            text.trim()
                .parse()
                .map_err(|_| invalid_text("bigint", text))?,
        ),
        oid::FLOAT4 => {
            Value::Float4(parse_float(text).map_err(|_| invalid_text("real", text))? as f32)
        }
        oid::FLOAT8 => {
            Value::Float8(parse_float(text).map_err(|_| invalid_text("double precision", text))?)
        }
        oid::BYTEA => Value::Bytea(parse_hex(text).ok_or_else(|| invalid_text("bytea", text))?),
        _ => Value::Text(text.to_owned()),
    };
    Ok(value)
}

fn parse_float(text: &str) -> Result<f64, std::num::ParseFloatError> {
    match text.trim() {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other.parse(),
    }
}

fn parse_hex(text: &str) -> Option<Bytes> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

fn unsupported_binary(type_oid: Oid) -> ExecutionError {
    ExecutionError::new(
        sql_state::FEATURE_NOT_SUPPORTED,
        format!("binary format is not supported for type {type_oid}"),
    )
}

fn format_binary(type_oid: Oid, value: &Value) -> Result<Bytes, ExecutionError> {
    let mut buf = BytesMut::new();
    match (type_oid, value) {
        (oid::BOOL, Value::Bool(b)) => buf.put_u8(u8::from(*b)),
        (oid::INT2, Value::Int2(i)) => buf.put_i16(*i),
        (oid::INT4, Value::Int4(i)) => buf.put_i32(*i),
        (oid::INT4, Value::Int2(i)) => buf.put_i32(i32::from(*i)),
        (oid::INT8, Value::Int8(i)) => buf.put_i64(*i),
        (oid::INT8, Value::Int4(i)) => buf.put_i64(i64::from(*i)),
        (oid::FLOAT4, Value::Float4(x)) => buf.put_f32(*x),
        (oid::FLOAT8, Value::Float8(x)) => buf.put_f64(*x),
        (oid::BYTEA, Value::Bytea(bytes)) => buf.put_slice(bytes),
        (oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN, value) => {
            buf.put_slice(value.to_string().as_bytes())
        }
        _ => return Err(unsupported_binary(type_oid)),
    }
    Ok(buf.freeze())
}

fn parse_binary(type_oid: Oid, bytes: &[u8]) -> Result<Value, ExecutionError> {
    let invalid = || {
        ExecutionError::new(
            sql_state::INVALID_BINARY_REPRESENTATION,
            format!("incorrect binary data format for type {type_oid}"),
        )
    };

    let value = match type_oid {
        oid::BOOL => match bytes {
            [b] => Value::Bool(*b != 0),
            _ => return Err(invalid()),
        },
        oid::INT2 => Value::Int2(i16::from_be_bytes(bytes.try_into().map_err(|_| invalid())?)),
        oid::INT4 => Value::Int4(i32::from_be_bytes(bytes.try_into().map_err(|_| invalid())?)),
        oid::INT8 => Value::Int8(i64::from_be_bytes(bytes.try_into().map_err(|_| invalid())?)),
        oid::FLOAT4 => Value::Float4(f32::from_be_bytes(bytes.try_into().map_err(|_| invalid())?)),
        oid::FLOAT8 => Value::Float8(f64::from_be_bytes(bytes.try_into().map_err(|_| invalid())?)),
        oid::BYTEA => Value::Bytea(Bytes::copy_from_slice(bytes)),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN => Value::Text(
            String::from_utf8(bytes.to_vec()).map_err(|_| invalid())?,
        ),
        _ => return Err(unsupported_binary(type_oid)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format_matches_postgres_output() {
        let formats = [
            (oid::BOOL, Value::Bool(true), "t"),
            (oid::INT4, Value::Int4(-42), "-42"),
            (oid::FLOAT8, Value::Float8(f64::INFINITY), "Infinity"),
            (oid::FLOAT8, Value::Float8(1.5), "1.5"),
            (oid::BYTEA, Value::Bytea(Bytes::from_static(&[0xde, 0xad])), "\\xdead"),
            (oid::TEXT, Value::Text("hi".into()), "hi"),
        ];

        for (type_oid, value, expected) in formats {
            let bytes = DefaultFormat
                .format(type_oid, FormatCode::Text, &value)
                .unwrap()
                .unwrap();
            assert_eq!(&bytes[..], expected.as_bytes());
        }
    }

    #[test]
    fn null_has_no_bytes() {
        let bytes = DefaultFormat
            .format(oid::INT4, FormatCode::Binary, &Value::Null)
            .unwrap();

        assert!(bytes.is_none());
        assert_eq!(
            DefaultFormat.parse(oid::INT4, FormatCode::Binary, None).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn binary_integers_are_big_endian() {
        let bytes = DefaultFormat
            .format(oid::INT4, FormatCode::Binary, &Value::Int4(258))
            .unwrap()
            .unwrap();

        assert_eq!(&bytes[..], &[0, 0, 1, 2]);
        assert_eq!(
            DefaultFormat
                .parse(oid::INT4, FormatCode::Binary, Some(&[0, 0, 1, 2]))
                .unwrap(),
            Value::Int4(258)
        );
    }

    #[test]
    fn parse_rejects_bad_text() {
        let err = DefaultFormat
            .parse(oid::INT4, FormatCode::Text, Some(b"abc"))
            .unwrap_err();

        assert_eq!(err.code, sql_state::INVALID_TEXT_REPRESENTATION);
    }

    #[test]
    fn format_codes_expand_per_value() {
        assert_eq!(
            FormatCode::expand(&[], 2).unwrap(),
            vec![FormatCode::Text, FormatCode::Text]
        );
        assert_eq!(
            FormatCode::expand(&[1], 3).unwrap(),
            vec![FormatCode::Binary; 3]
        );
        assert_eq!(
            FormatCode::expand(&[0, 1], 2).unwrap(),
            vec![FormatCode::Text, FormatCode::Binary]
        );
        assert!(FormatCode::expand(&[0, 1], 3).is_err());
        assert!(FormatCode::expand(&[2], 1).is_err());
    }
}
