use crate::engine::ExecutionError;
use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;

/// Error and notice field type codes.
///
/// Ref: <https://www.postgresql.org/docs/current/protocol-error-fields.html>
pub mod field_code {
    pub const SEVERITY: u8 = b'S';
    /// Severity, never localized.
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    pub const SQLSTATE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
}

/// Declares a message made of typed fields ended by a zero byte.
macro_rules! field_list_message {
    ($(#[$meta:meta])* $name:ident, $schema:ident, $tag:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name {
            pub fields: Vec<(u8, String)>,
        }

        static $schema: Schema = Schema {
            name: stringify!($name),
            fields: &[
                Field::header($tag),
                Field::length(),
                Field::terminated("Fields", &[Field::byte1("Code", 0), Field::cstring("Value")]),
            ],
        };

        impl $name {
            pub fn new(
                severity: &str,
                code: impl Into<String>,
                message: impl Into<String>,
            ) -> Self {
                Self::default()
                    .with_field(field_code::SEVERITY, severity)
                    .with_field(field_code::SEVERITY_NON_LOCALIZED, severity)
                    .with_field(field_code::SQLSTATE, code)
                    .with_field(field_code::MESSAGE, message)
            }

            pub fn with_field(mut self, code: u8, value: impl Into<String>) -> Self {
                self.fields.push((code, value.into()));
                self
            }

            pub fn get(&self, code: u8) -> Option<&str> {
                self.fields
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map(|(_, v)| v.as_str())
            }

            pub fn severity(&self) -> Option<&str> {
                self.get(field_code::SEVERITY)
            }

            /// The SQLSTATE code.
            pub fn code(&self) -> Option<&str> {
                self.get(field_code::SQLSTATE)
            }

            pub fn message(&self) -> Option<&str> {
                self.get(field_code::MESSAGE)
            }
        }

        impl Message for $name {
            fn default_schema() -> &'static Schema {
                &$schema
            }

            fn encode(&self) -> Result<MessageFormat, ProtocolError> {
                let rows = self
                    .fields
                    .iter()
                    .map(|(code, value)| vec![Value::Byte(*code), Value::str(value.as_str())])
                    .collect();
                MessageFormat::new(&$schema).with("Fields", Value::Group(rows))
            }

            fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
                let fields = format
                    .take_group("Fields")?
                    .into_iter()
                    .map(|row| match <[Value; 2]>::try_from(row) {
                        Ok([Value::Byte(code), Value::Str(value)]) => {
                            Ok((code, value.into_owned()))
                        }
                        _ => Err(ProtocolError::InvalidValue { field: "Fields" }),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Self { fields })
            }
        }
    };
}

field_list_message!(ErrorResponse, ERROR_RESPONSE, b'E');
field_list_message!(
    /// Same layout as ErrorResponse, for warnings and informational messages.
    NoticeResponse,
    NOTICE_RESPONSE,
    b'N'
);

impl From<&ExecutionError> for ErrorResponse {
    fn from(err: &ExecutionError) -> Self {
        let severity = err.severity.to_string();
        let mut response = ErrorResponse::new(&severity, err.code.as_str(), err.message.as_str());
        if let Some(detail) = &err.detail {
            response = response.with_field(field_code::DETAIL, detail.as_str());
        }
        if let Some(hint) = &err.hint {
            response = response.with_field(field_code::HINT, hint.as_str());
        }
        if let Some(position) = err.position {
            response = response.with_field(field_code::POSITION, position.to_string());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec;
    use crate::error::sql_state;

    #[test]
    fn error_response_ends_with_terminator() {
        let mut buf = BytesMut::new();
        let error = ErrorResponse::default().with_field(field_code::MESSAGE, "x");

        codec::encode(&error.encode().unwrap(), &mut buf).unwrap();

        assert_eq!(&buf[..], &[b'E', 0, 0, 0, 8, b'M', b'x', 0, 0]);
    }

    #[test]
    fn execution_errors_carry_code_and_hint() {
        let err = ExecutionError::syntax("syntax error at or near \"FROM\"").with_hint("check it");

        let response = ErrorResponse::from(&err);

        assert_eq!(response.severity(), Some("ERROR"));
        assert_eq!(response.code(), Some(sql_state::SYNTAX_ERROR));
        assert_eq!(response.get(field_code::HINT), Some("check it"));
    }
}
