use bytes::Bytes;

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;
use crate::types::{FormatCode, Oid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub query: String,
}

static QUERY: Schema = Schema {
    name: "Query",
    fields: &[Field::header(b'Q'), Field::length(), Field::cstring("String")],
};

impl Message for Query {
    fn default_schema() -> &'static Schema {
        &QUERY
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&QUERY).with("String", Value::str(self.query.as_str()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            query: format.take_string("String")?,
        })
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    /// OID of the source table, or zero.
    pub table_oid: Oid,
    /// Attribute number of the source column, or zero.
    pub column_id: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

const FIELD_DESCRIPTION: &[Field] = &[
    Field::cstring("Name"),
    Field::int32("TableOID", 0),
    Field::int16("ColumnAttributeNumber"),
    Field::int32("DataTypeOID", 0),
    Field::int16("DataTypeSize"),
    Field::int32("TypeModifier", -1),
    Field::int16("FormatCode"),
];

impl FieldDescription {
    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::str(self.name.as_str()),
            Value::Int32(self.table_oid as i32),
            Value::Int16(self.column_id),
            Value::Int32(self.type_oid as i32),
            Value::Int16(self.type_size),
            Value::Int32(self.type_modifier),
            Value::Int16(self.format.as_i16()),
        ]
    }

    fn from_row(row: Vec<Value>) -> Result<Self, ProtocolError> {
        match <[Value; 7]>::try_from(row) {
            Ok(
                [
                    Value::Str(name),
                    Value::Int32(table_oid),
                    Value::Int16(column_id),
                    Value::Int32(type_oid),
                    Value::Int16(type_size),
                    Value::Int32(type_modifier),
                    Value::Int16(format),
                ],
            ) => Ok(Self {
                name: name.into_owned(),
                table_oid: table_oid as Oid,
                column_id,
                type_oid: type_oid as Oid,
                type_size,
                type_modifier,
                format: FormatCode::try_from(format).map_err(|_| ProtocolError::InvalidValue {
                    field: "FormatCode",
                })?,
            }),
            _ => Err(ProtocolError::InvalidValue { field: "Fields" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

static ROW_DESCRIPTION: Schema = Schema {
    name: "RowDescription",
    fields: &[
        Field::header(b'T'),
        Field::length(),
        Field::repeated16("Fields", FIELD_DESCRIPTION),
    ],
};

impl Message for RowDescription {
    fn default_schema() -> &'static Schema {
        &ROW_DESCRIPTION
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        let rows = self.fields.iter().map(FieldDescription::to_row).collect();
        MessageFormat::new(&ROW_DESCRIPTION).with("Fields", Value::Group(rows))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        let fields = format
            .take_group("Fields")?
            .into_iter()
            .map(FieldDescription::from_row)
            .collect::<Result<_, _>>()?;
        Ok(Self { fields })
    }
}

/// One row of a result set. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataRow {
    pub values: Vec<Option<Bytes>>,
}

static DATA_ROW: Schema = Schema {
    name: "DataRow",
    fields: &[
        Field::header(b'D'),
        Field::length(),
        Field::repeated16("Columns", &[Field::length_prefixed("Value")]),
    ],
};

impl Message for DataRow {
    fn default_schema() -> &'static Schema {
        &DATA_ROW
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        let rows = self
            .values
            .iter()
            .map(|value| vec![Value::Bytes(value.clone())])
            .collect();
        MessageFormat::new(&DATA_ROW).with("Columns", Value::Group(rows))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        let values = format
            .take_group("Columns")?
            .into_iter()
            .map(|row| match <[Value; 1]>::try_from(row) {
                Ok([Value::Bytes(value)]) => Ok(value),
                _ => Err(ProtocolError::InvalidValue { field: "Columns" }),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { values })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub tag: String,
}

static COMMAND_COMPLETE: Schema = Schema {
    name: "CommandComplete",
    fields: &[Field::header(b'C'), Field::length(), Field::cstring("CommandTag")],
};

impl Message for CommandComplete {
    fn default_schema() -> &'static Schema {
        &COMMAND_COMPLETE
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&COMMAND_COMPLETE).with("CommandTag", Value::str(self.tag.as_str()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            tag: format.take_string("CommandTag")?,
        })
    }
}

empty_message!(
    /// Response to an empty query string, in place of CommandComplete.
    EmptyQueryResponse,
    b'I'
);

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec;
    use crate::types::oid;

    #[test]
    fn data_row_encodes_null_as_negative_length() {
        let mut buf = BytesMut::new();
        let row = DataRow {
            values: vec![Some(Bytes::from_static(b"1")), None],
        };

        codec::encode(&row.encode().unwrap(), &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[b'D', 0, 0, 0, 15, 0, 2, 0, 0, 0, 1, b'1', 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(DataRow::decode_frame(buf.freeze()).unwrap(), row);
    }

    #[test]
    fn row_description_survives_the_wire() {
        let mut buf = BytesMut::new();
        let description = RowDescription {
            fields: vec![FieldDescription {
                name: "?column?".into(),
                table_oid: 0,
                column_id: 0,
                type_oid: oid::INT4,
                type_size: 4,
                type_modifier: -1,
                format: FormatCode::Text,
            }],
        };

        codec::encode(&description.encode().unwrap(), &mut buf).unwrap();

        // tag + length + count + "?column?\0" + 18 bytes of attributes
        assert_eq!(buf.len(), 1 + 4 + 2 + 9 + 18);
        assert_eq!(RowDescription::decode_frame(buf.freeze()).unwrap(), description);
    }
}
