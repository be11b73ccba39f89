use bytes::Bytes;

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;
use crate::types::Oid;

fn into_i16s(rows: Vec<Vec<Value>>, field: &'static str) -> Result<Vec<i16>, ProtocolError> {
    rows.into_iter()
        .map(|row| match row.as_slice() {
            [Value::Int16(code)] => Ok(*code),
            _ => Err(ProtocolError::InvalidValue { field }),
        })
        .collect()
}

fn into_oids(rows: Vec<Vec<Value>>, field: &'static str) -> Result<Vec<Oid>, ProtocolError> {
    rows.into_iter()
        .map(|row| match row.as_slice() {
            [Value::Int32(oid)] => Ok(*oid as Oid),
            _ => Err(ProtocolError::InvalidValue { field }),
        })
        .collect()
}

fn i16_rows(values: &[i16]) -> Value {
    Value::Group(values.iter().map(|v| vec![Value::Int16(*v)]).collect())
}

fn oid_rows(values: &[Oid]) -> Value {
    Value::Group(values.iter().map(|v| vec![Value::Int32(*v as i32)]).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parse {
    /// Prepared statement name; empty for the unnamed statement.
    pub name: String,
    pub query: String,
    /// Parameter types the client wants to fix. Zero leaves the type unspecified.
    pub parameter_types: Vec<Oid>,
}

static PARSE: Schema = Schema {
    name: "Parse",
    fields: &[
        Field::header(b'P'),
        Field::length(),
        Field::cstring("Name"),
        Field::cstring("Query"),
        Field::repeated16("ParameterTypes", &[Field::int32("ParameterType", 0)]),
    ],
};

impl Message for Parse {
    fn default_schema() -> &'static Schema {
        &PARSE
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&PARSE)
            .with("Name", Value::str(self.name.as_str()))?
            .with("Query", Value::str(self.query.as_str()))?
            .with("ParameterTypes", oid_rows(&self.parameter_types))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: format.take_string("Name")?,
            query: format.take_string("Query")?,
            parameter_types: into_oids(format.take_group("ParameterTypes")?, "ParameterTypes")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bind {
    /// Destination portal; empty for the unnamed portal.
    pub portal: String,
    /// Source prepared statement; empty for the unnamed statement.
    pub statement: String,
    pub parameter_formats: Vec<i16>,
    /// Parameter values; `None` is SQL NULL.
    pub parameters: Vec<Option<Bytes>>,
    pub result_formats: Vec<i16>,
}

static BIND: Schema = Schema {
    name: "Bind",
    fields: &[
        Field::header(b'B'),
        Field::length(),
        Field::cstring("DestinationPortal"),
        Field::cstring("SourcePreparedStatement"),
        Field::repeated16("ParameterFormatCodes", &[Field::int16("FormatCode")]),
        Field::repeated16("ParameterValues", &[Field::length_prefixed("Value")]),
        Field::repeated16("ResultFormatCodes", &[Field::int16("FormatCode")]),
    ],
};

impl Message for Bind {
    fn default_schema() -> &'static Schema {
        &BIND
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        let parameters = self
            .parameters
            .iter()
            .map(|value| vec![Value::Bytes(value.clone())])
            .collect();

        MessageFormat::new(&BIND)
            .with("DestinationPortal", Value::str(self.portal.as_str()))?
            .with("SourcePreparedStatement", Value::str(self.statement.as_str()))?
            .with("ParameterFormatCodes", i16_rows(&self.parameter_formats))?
            .with("ParameterValues", Value::Group(parameters))?
            .with("ResultFormatCodes", i16_rows(&self.result_formats))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        let parameters = format
            .take_group("ParameterValues")?
            .into_iter()
            .map(|row| match <[Value; 1]>::try_from(row) {
                Ok([Value::Bytes(value)]) => Ok(value),
                _ => Err(ProtocolError::InvalidValue {
                    field: "ParameterValues",
                }),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            portal: format.take_string("DestinationPortal")?,
            statement: format.take_string("SourcePreparedStatement")?,
            parameter_formats: into_i16s(
                format.take_group("ParameterFormatCodes")?,
                "ParameterFormatCodes",
            )?,
            parameters,
            result_formats: into_i16s(
                format.take_group("ResultFormatCodes")?,
                "ResultFormatCodes",
            )?,
        })
    }
}

/// What a Describe or Close message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            _ => Err(ProtocolError::InvalidValue { field: "Target" }),
        }
    }
}

/// Declares a message addressing a statement or portal by name.
macro_rules! target_message {
    ($(#[$meta:meta])* $name:ident, $schema:ident, $tag:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub target: Target,
            pub name: String,
        }

        static $schema: Schema = Schema {
            name: stringify!($name),
            fields: &[
                Field::header($tag),
                Field::length(),
                Field::byte1("Target", b'S'),
                Field::cstring("Name"),
            ],
        };

        impl Message for $name {
            fn default_schema() -> &'static Schema {
                &$schema
            }

            fn encode(&self) -> Result<MessageFormat, ProtocolError> {
                MessageFormat::new(&$schema)
                    .with("Target", Value::Byte(self.target.as_byte()))?
                    .with("Name", Value::str(self.name.as_str()))
            }

            fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
                Ok(Self {
                    target: Target::from_byte(format.byte("Target")?)?,
                    name: format.take_string("Name")?,
                })
            }
        }
    };
}

target_message!(
    /// Asks for the parameter and row shape of a statement, or the row shape of a portal.
    Describe,
    DESCRIBE,
    b'D'
);

target_message!(
    /// Drops a statement or portal.
    Close,
    CLOSE,
    b'C'
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub portal: String,
    /// Maximum number of rows to return; zero or less means no limit.
    pub max_rows: i32,
}

static EXECUTE: Schema = Schema {
    name: "Execute",
    fields: &[
        Field::header(b'E'),
        Field::length(),
        Field::cstring("Portal"),
        Field::int32("MaxRows", 0),
    ],
};

impl Message for Execute {
    fn default_schema() -> &'static Schema {
        &EXECUTE
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&EXECUTE)
            .with("Portal", Value::str(self.portal.as_str()))?
            .with("MaxRows", Value::Int32(self.max_rows))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            portal: format.take_string("Portal")?,
            max_rows: format.int32("MaxRows")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterDescription {
    pub types: Vec<Oid>,
}

static PARAMETER_DESCRIPTION: Schema = Schema {
    name: "ParameterDescription",
    fields: &[
        Field::header(b't'),
        Field::length(),
        Field::repeated16("ParameterTypes", &[Field::int32("ParameterType", 0)]),
    ],
};

impl Message for ParameterDescription {
    fn default_schema() -> &'static Schema {
        &PARAMETER_DESCRIPTION
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&PARAMETER_DESCRIPTION).with("ParameterTypes", oid_rows(&self.types))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            types: into_oids(format.take_group("ParameterTypes")?, "ParameterTypes")?,
        })
    }
}

empty_message!(ParseComplete, b'1');
empty_message!(BindComplete, b'2');
empty_message!(CloseComplete, b'3');
empty_message!(
    /// Sent by Describe when the statement or portal returns no rows.
    NoData,
    b'n'
);
empty_message!(
    /// Execute stopped at its row limit before the portal was exhausted.
    PortalSuspended,
    b's'
);
