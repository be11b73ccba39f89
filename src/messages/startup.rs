//! Untagged messages exchanged before the session starts.

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;

/// Protocol version 3.0: major version in the high 16 bits.
pub const PROTOCOL_VERSION_3: i32 = 3 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub protocol_version: i32,
    /// Session parameters in the order the client sent them.
    pub parameters: Vec<(String, String)>,
}

static STARTUP: Schema = Schema {
    name: "StartupMessage",
    fields: &[
        Field::length(),
        Field::int32("ProtocolVersion", PROTOCOL_VERSION_3),
        Field::terminated("Parameters", &[Field::cstring("Name"), Field::cstring("Value")]),
    ],
};

impl Startup {
    pub fn new<K, V>(parameters: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            protocol_version: PROTOCOL_VERSION_3,
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl Message for Startup {
    fn default_schema() -> &'static Schema {
        &STARTUP
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        let pairs = self
            .parameters
            .iter()
            .map(|(k, v)| vec![Value::str(k.as_str()), Value::str(v.as_str())])
            .collect();

        MessageFormat::new(&STARTUP)
            .with("ProtocolVersion", Value::Int32(self.protocol_version))?
            .with("Parameters", Value::Group(pairs))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        let parameters = format
            .take_group("Parameters")?
            .into_iter()
            .map(|row| match <[Value; 2]>::try_from(row) {
                Ok([Value::Str(k), Value::Str(v)]) => Ok((k.into_owned(), v.into_owned())),
                _ => Err(ProtocolError::InvalidValue {
                    field: "Parameters",
                }),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            protocol_version: format.int32("ProtocolVersion")?,
            parameters,
        })
    }
}

/// Declares an untagged request whose payload starts with a fixed request code.
macro_rules! request_code_message {
    ($(#[$meta:meta])* $name:ident, $schema:literal, $code:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl $name {
            pub const CODE: i32 = $code;
        }

        impl Message for $name {
            fn default_schema() -> &'static Schema {
                static SCHEMA: Schema = Schema {
                    name: $schema,
                    fields: &[Field::length(), Field::int32("RequestCode", $code)],
                };
                &SCHEMA
            }

            fn encode(&self) -> Result<MessageFormat, ProtocolError> {
                Ok(MessageFormat::new(Self::default_schema()))
            }

            fn from_format(format: MessageFormat) -> Result<Self, ProtocolError> {
                match format.int32("RequestCode")? {
                    $code => Ok($name),
                    _ => Err(ProtocolError::InvalidValue {
                        field: "RequestCode",
                    }),
                }
            }
        }
    };
}

request_code_message!(
    /// Asks the server to upgrade the connection to TLS.
    SslRequest,
    "SSLRequest",
    80877103
);

request_code_message!(
    /// Asks the server to upgrade the connection to GSSAPI encryption.
    GssEncRequest,
    "GSSENCRequest",
    80877104
);

/// Sent on a fresh connection to interrupt the query running on another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub const CODE: i32 = 80877102;
}

static CANCEL_REQUEST: Schema = Schema {
    name: "CancelRequest",
    fields: &[
        Field::length(),
        Field::int32("RequestCode", CancelRequest::CODE),
        Field::int32("ProcessID", 0),
        Field::int32("SecretKey", 0),
    ],
};

impl Message for CancelRequest {
    fn default_schema() -> &'static Schema {
        &CANCEL_REQUEST
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&CANCEL_REQUEST)
            .with("ProcessID", Value::Int32(self.process_id))?
            .with("SecretKey", Value::Int32(self.secret_key))
    }

    fn from_format(format: MessageFormat) -> Result<Self, ProtocolError> {
        if format.int32("RequestCode")? != Self::CODE {
            return Err(ProtocolError::InvalidValue {
                field: "RequestCode",
            });
        }
        Ok(Self {
            process_id: format.int32("ProcessID")?,
            secret_key: format.int32("SecretKey")?,
        })
    }
}

/// The single byte answer to [`SslRequest`] or [`GssEncRequest`]: `S`/`G` to accept, `N` to
/// decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationResponse {
    pub response: u8,
}

impl NegotiationResponse {
    pub const DECLINE: NegotiationResponse = NegotiationResponse { response: b'N' };
}

static NEGOTIATION_RESPONSE: Schema = Schema {
    name: "NegotiationResponse",
    fields: &[Field::byte1("Response", b'N')],
};

impl Message for NegotiationResponse {
    fn default_schema() -> &'static Schema {
        &NEGOTIATION_RESPONSE
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&NEGOTIATION_RESPONSE).with("Response", Value::Byte(self.response))
    }

    fn from_format(format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            response: format.byte("Response")?,
        })
    }
}
