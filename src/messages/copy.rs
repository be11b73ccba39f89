use bytes::Bytes;

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;
use crate::types::FormatCode;

/// One chunk of copy data. Sent in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyData {
    pub data: Bytes,
}

static COPY_DATA: Schema = Schema {
    name: "CopyData",
    fields: &[Field::header(b'd'), Field::length(), Field::remaining("Data")],
};

impl Message for CopyData {
    fn default_schema() -> &'static Schema {
        &COPY_DATA
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&COPY_DATA).with("Data", Value::Raw(self.data.clone()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            data: format.take_raw("Data")?,
        })
    }
}

empty_message!(CopyDone, b'c');

/// Aborts a copy from the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFail {
    pub message: String,
}

static COPY_FAIL: Schema = Schema {
    name: "CopyFail",
    fields: &[Field::header(b'f'), Field::length(), Field::cstring("Message")],
};

impl Message for CopyFail {
    fn default_schema() -> &'static Schema {
        &COPY_FAIL
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&COPY_FAIL).with("Message", Value::str(self.message.as_str()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            message: format.take_string("Message")?,
        })
    }
}

/// Declares a copy response: an overall format and one format per column.
macro_rules! copy_response {
    ($(#[$meta:meta])* $name:ident, $schema:ident, $tag:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub format: FormatCode,
            pub column_formats: Vec<FormatCode>,
        }

        static $schema: Schema = Schema {
            name: stringify!($name),
            fields: &[
                Field::header($tag),
                Field::length(),
                Field::byte1("OverallFormat", 0),
                Field::repeated16("ColumnFormatCodes", &[Field::int16("FormatCode")]),
            ],
        };

        impl $name {
            /// A text copy of `columns` columns.
            pub fn text(columns: usize) -> Self {
                Self {
                    format: FormatCode::Text,
                    column_formats: vec![FormatCode::Text; columns],
                }
            }
        }

        impl Message for $name {
            fn default_schema() -> &'static Schema {
                &$schema
            }

            fn encode(&self) -> Result<MessageFormat, ProtocolError> {
                let columns = self
                    .column_formats
                    .iter()
                    .map(|format| vec![Value::Int16(format.as_i16())])
                    .collect();

                // The overall format is a single byte on the wire.
                MessageFormat::new(&$schema)
                    .with("OverallFormat", Value::Byte(self.format.as_i16() as u8))?
                    .with("ColumnFormatCodes", Value::Group(columns))
            }

            fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
                let column_formats = format
                    .take_group("ColumnFormatCodes")?
                    .into_iter()
                    .map(|row| match row.as_slice() {
                        [Value::Int16(code)] => FormatCode::try_from(*code).ok(),
                        _ => None,
                    })
                    .collect::<Option<_>>()
                    .ok_or(ProtocolError::InvalidValue {
                        field: "ColumnFormatCodes",
                    })?;

                Ok(Self {
                    format: FormatCode::try_from(i16::from(format.byte("OverallFormat")?))
                        .map_err(|_| ProtocolError::InvalidValue {
                            field: "OverallFormat",
                        })?,
                    column_formats,
                })
            }
        }
    };
}

copy_response!(
    /// The server is ready to receive copy data from the client.
    CopyInResponse,
    COPY_IN_RESPONSE,
    b'G'
);

copy_response!(
    /// The server is about to send copy data to the client.
    CopyOutResponse,
    COPY_OUT_RESPONSE,
    b'H'
);

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec;

    #[test]
    fn copy_data_is_opaque() {
        let mut buf = BytesMut::new();
        let chunk = CopyData {
            data: Bytes::from_static(b"1\tone\n"),
        };

        codec::encode(&chunk.encode().unwrap(), &mut buf).unwrap();

        assert_eq!(&buf[..5], &[b'd', 0, 0, 0, 10]);
        assert_eq!(CopyData::decode_frame(buf.freeze()).unwrap(), chunk);
    }

    #[test]
    fn copy_in_response_layout() {
        let mut buf = BytesMut::new();

        codec::encode(&CopyInResponse::text(2).encode().unwrap(), &mut buf).unwrap();

        assert_eq!(&buf[..], &[b'G', 0, 0, 0, 11, 0, 0, 2, 0, 0, 0, 0]);
    }
}
