//! Declarative message layouts.
//!
//! Every protocol message is described by a static [`Schema`]: an ordered list of [`Field`]s,
//! each with a wire type and an optional flag. A [`MessageFormat`] pairs a schema with concrete
//! values and is what the codec engine reads and writes.

use std::borrow::Cow;
use std::fmt;
use std::mem;

use bytes::Bytes;
use itertools::Itertools;

use crate::error::ProtocolError;

/// How a single field is laid out on the wire. Numeric types are always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Byte1,
    Int16,
    Int32,
    /// Null-terminated string.
    CString,
    /// Int32 length followed by that many bytes. A length of -1 denotes SQL NULL.
    LengthPrefixed,
    /// Whatever is left in the message.
    Remaining,
    /// Int16 count followed by that many instances of the child fields.
    Repeated16(&'static [Field]),
    /// Int32 count followed by that many instances of the child fields.
    Repeated32(&'static [Field]),
    /// Instances of the child fields repeated until a single zero byte.
    Terminated(&'static [Field]),
}

impl WireType {
    fn children(&self) -> Option<&'static [Field]> {
        match self {
            WireType::Repeated16(children)
            | WireType::Repeated32(children)
            | WireType::Terminated(children) => Some(children),
            _ => None,
        }
    }

    fn same_shape(&self, other: &WireType) -> bool {
        match (self.children(), other.children()) {
            (Some(a), Some(b)) => {
                mem::discriminant(self) == mem::discriminant(other) && fields_match(a, b)
            }
            (None, None) => self == other,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFlags {
    None,
    /// Constant tag byte identifying the message type.
    HeaderTag,
    /// Int32 whose value is the byte length of itself plus every following field.
    InclusiveLength,
}

/// Value used when building a zero-value instance of a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Str(&'static str),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub wire_type: WireType,
    pub flags: FieldFlags,
    pub default: Placeholder,
}

impl Field {
    const fn new(name: &'static str, wire_type: WireType, default: Placeholder) -> Field {
        Field {
            name,
            wire_type,
            flags: FieldFlags::None,
            default,
        }
    }

    pub const fn header(tag: u8) -> Field {
        Field {
            name: "Header",
            wire_type: WireType::Byte1,
            flags: FieldFlags::HeaderTag,
            default: Placeholder::Byte(tag),
        }
    }

    pub const fn length() -> Field {
        Field {
            name: "MessageLength",
            wire_type: WireType::Int32,
            flags: FieldFlags::InclusiveLength,
            default: Placeholder::Int32(4),
        }
    }

    pub const fn byte1(name: &'static str, default: u8) -> Field {
        Field::new(name, WireType::Byte1, Placeholder::Byte(default))
    }

    pub const fn int16(name: &'static str) -> Field {
        Field::new(name, WireType::Int16, Placeholder::Int16(0))
    }

    pub const fn int32(name: &'static str, default: i32) -> Field {
        Field::new(name, WireType::Int32, Placeholder::Int32(default))
    }

    pub const fn cstring(name: &'static str) -> Field {
        Field::new(name, WireType::CString, Placeholder::Str(""))
    }

    pub const fn length_prefixed(name: &'static str) -> Field {
        Field::new(name, WireType::LengthPrefixed, Placeholder::Empty)
    }

    pub const fn remaining(name: &'static str) -> Field {
        Field::new(name, WireType::Remaining, Placeholder::Empty)
    }

    pub const fn repeated16(name: &'static str, children: &'static [Field]) -> Field {
        Field::new(name, WireType::Repeated16(children), Placeholder::Empty)
    }

    pub const fn repeated32(name: &'static str, children: &'static [Field]) -> Field {
        Field::new(name, WireType::Repeated32(children), Placeholder::Empty)
    }

    pub const fn terminated(name: &'static str, children: &'static [Field]) -> Field {
        Field::new(name, WireType::Terminated(children), Placeholder::Empty)
    }

    /// The zero value of this field.
    pub fn zero(&self) -> Value {
        match (self.wire_type, self.default) {
            (WireType::Byte1, Placeholder::Byte(b)) => Value::Byte(b),
            (WireType::Byte1, _) => Value::Byte(0),
            (WireType::Int16, Placeholder::Int16(i)) => Value::Int16(i),
            (WireType::Int16, _) => Value::Int16(0),
            (WireType::Int32, Placeholder::Int32(i)) => Value::Int32(i),
            (WireType::Int32, _) => Value::Int32(0),
            (WireType::CString, Placeholder::Str(s)) => Value::Str(Cow::Borrowed(s)),
            (WireType::CString, _) => Value::Str(Cow::Borrowed("")),
            (WireType::LengthPrefixed, _) => Value::Bytes(None),
            (WireType::Remaining, _) => Value::Raw(Bytes::new()),
            (
                WireType::Repeated16(_) | WireType::Repeated32(_) | WireType::Terminated(_),
                _,
            ) => Value::Group(Vec::new()),
        }
    }
}

fn fields_match(a: &[Field], b: &[Field]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(a, b)| {
            a.name == b.name && a.flags == b.flags && a.wire_type.same_shape(&b.wire_type)
        })
}

/// The full static shape of one message type.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl Schema {
    /// The constant tag byte this message starts with, if it has one.
    pub fn header_tag(&self) -> Option<u8> {
        self.fields
            .iter()
            .find(|f| f.flags == FieldFlags::HeaderTag)
            .map(|f| match f.default {
                Placeholder::Byte(b) => b,
                _ => 0,
            })
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Structural equality over field names, wire types and flags.
    pub fn matches_structure(&self, expected: &Schema) -> Result<(), ProtocolError> {
        if fields_match(self.fields, expected.fields) {
            Ok(())
        } else {
            Err(ProtocolError::SchemaMismatch {
                expected: expected.name,
                actual: self.name,
            })
        }
    }

    /// Checks the flag invariants: at most one header tag (a leading Byte1), at most one
    /// inclusive length (an Int32) and no flags inside groups.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let headers = self
            .fields
            .iter()
            .positions(|f| f.flags == FieldFlags::HeaderTag)
            .collect::<Vec<_>>();
        let lengths = self
            .fields
            .iter()
            .filter(|f| f.flags == FieldFlags::InclusiveLength)
            .collect::<Vec<_>>();

        let header_ok = match headers.as_slice() {
            [] => true,
            [0] => self.fields[0].wire_type == WireType::Byte1,
            _ => false,
        };
        let length_ok = match lengths.as_slice() {
            [] => true,
            [field] => field.wire_type == WireType::Int32,
            _ => false,
        };
        let groups_ok = self
            .fields
            .iter()
            .filter_map(|f| f.wire_type.children())
            .flatten()
            .all(|child| child.flags == FieldFlags::None);

        if header_ok && length_ok && groups_ok {
            Ok(())
        } else {
            Err(ProtocolError::malformed(format!(
                "schema {} violates field flag invariants",
                self.name
            )))
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.name,
            self.fields.iter().map(|field| field.name).join(", ")
        )
    }
}

/// A concrete field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Str(Cow<'static, str>),
    /// Length-prefixed bytes; `None` is SQL NULL.
    Bytes(Option<Bytes>),
    Raw(Bytes),
    /// One entry per repetition, each holding the child field values in order.
    Group(Vec<Vec<Value>>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Cow::Owned(s.into()))
    }

    /// Whether this value can be written as the given wire type.
    pub fn fits(&self, wire_type: &WireType) -> bool {
        match (wire_type, self) {
            (WireType::Byte1, Value::Byte(_))
            | (WireType::Int16, Value::Int16(_))
            | (WireType::Int32, Value::Int32(_))
            | (WireType::LengthPrefixed, Value::Bytes(_))
            | (WireType::Remaining, Value::Raw(_)) => true,
            (WireType::CString, Value::Str(s)) => !s.contains('\0'),
            (
                WireType::Repeated16(children)
                | WireType::Repeated32(children)
                | WireType::Terminated(children),
                Value::Group(rows),
            ) => rows.iter().all(|row| {
                row.len() == children.len()
                    && row.iter().zip(children.iter()).all(|(v, f)| v.fits(&f.wire_type))
            }),
            _ => false,
        }
    }
}

/// A schema paired with one value per field.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFormat {
    schema: &'static Schema,
    values: Vec<Value>,
}

impl MessageFormat {
    /// A zero-value instance of the schema.
    pub fn new(schema: &'static Schema) -> MessageFormat {
        MessageFormat {
            schema,
            values: schema.fields.iter().map(Field::zero).collect(),
        }
    }

    pub(crate) fn from_parts(schema: &'static Schema, values: Vec<Value>) -> MessageFormat {
        MessageFormat { schema, values }
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn matches_structure(&self, expected: &Schema) -> Result<(), ProtocolError> {
        self.schema.matches_structure(expected)
    }

    fn index(&self, name: &'static str) -> Result<usize, ProtocolError> {
        self.schema
            .position(name)
            .ok_or(ProtocolError::InvalidValue { field: name })
    }

    pub fn field(&self, name: &'static str) -> Result<&Value, ProtocolError> {
        let index = self.index(name)?;
        Ok(&self.values[index])
    }

    /// Replaces the value of a field, rejecting values that do not fit its wire type. The
    /// header tag and the inclusive length are owned by the codec and cannot be set.
    pub fn set(&mut self, name: &'static str, value: Value) -> Result<(), ProtocolError> {
        let index = self.index(name)?;
        let field = &self.schema.fields[index];
        if field.flags != FieldFlags::None || !value.fits(&field.wire_type) {
            return Err(ProtocolError::InvalidValue { field: name });
        }
        self.values[index] = value;
        Ok(())
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Result<Self, ProtocolError> {
        self.set(name, value)?;
        Ok(self)
    }

    fn take(&mut self, name: &'static str) -> Result<Value, ProtocolError> {
        let index = self.index(name)?;
        let zero = self.schema.fields[index].zero();
        Ok(mem::replace(&mut self.values[index], zero))
    }

    pub fn byte(&self, name: &'static str) -> Result<u8, ProtocolError> {
        match self.field(name)? {
            Value::Byte(b) => Ok(*b),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }

    pub fn int16(&self, name: &'static str) -> Result<i16, ProtocolError> {
        match self.field(name)? {
            Value::Int16(i) => Ok(*i),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }

    pub fn int32(&self, name: &'static str) -> Result<i32, ProtocolError> {
        match self.field(name)? {
            Value::Int32(i) => Ok(*i),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }

    pub fn take_string(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        match self.take(name)? {
            Value::Str(s) => Ok(s.into_owned()),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }

    pub fn take_raw(&mut self, name: &'static str) -> Result<Bytes, ProtocolError> {
        match self.take(name)? {
            Value::Raw(b) => Ok(b),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }

    pub fn take_group(&mut self, name: &'static str) -> Result<Vec<Vec<Value>>, ProtocolError> {
        match self.take(name)? {
            Value::Group(rows) => Ok(rows),
            _ => Err(ProtocolError::InvalidValue { field: name }),
        }
    }
}
