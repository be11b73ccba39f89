use bytes::Bytes;

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;

/// The `R` family of messages. The sub-type is carried by the `AuthType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
}

static AUTHENTICATION: Schema = Schema {
    name: "Authentication",
    fields: &[
        Field::header(b'R'),
        Field::length(),
        Field::int32("AuthType", 0),
        Field::remaining("Data"),
    ],
};

impl Message for Authentication {
    fn default_schema() -> &'static Schema {
        &AUTHENTICATION
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        let (auth_type, data) = match self {
            Authentication::Ok => (0, Bytes::new()),
            Authentication::CleartextPassword => (3, Bytes::new()),
            Authentication::Md5Password { salt } => (5, Bytes::copy_from_slice(salt)),
        };

        MessageFormat::new(&AUTHENTICATION)
            .with("AuthType", Value::Int32(auth_type))?
            .with("Data", Value::Raw(data))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        let data = format.take_raw("Data")?;
        match (format.int32("AuthType")?, &data[..]) {
            (0, []) => Ok(Authentication::Ok),
            (3, []) => Ok(Authentication::CleartextPassword),
            (5, &[a, b, c, d]) => Ok(Authentication::Md5Password { salt: [a, b, c, d] }),
            _ => Err(ProtocolError::InvalidValue { field: "AuthType" }),
        }
    }
}

/// Password response to an authentication request. Shares the `p` tag with the other
/// authentication responses, which this server never requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    pub password: String,
}

static PASSWORD_MESSAGE: Schema = Schema {
    name: "PasswordMessage",
    fields: &[Field::header(b'p'), Field::length(), Field::cstring("Password")],
};

impl Message for PasswordMessage {
    fn default_schema() -> &'static Schema {
        &PASSWORD_MESSAGE
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&PASSWORD_MESSAGE).with("Password", Value::str(self.password.as_str()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            password: format.take_string("Password")?,
        })
    }
}

/// Identifies the session for later cancel requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

static BACKEND_KEY_DATA: Schema = Schema {
    name: "BackendKeyData",
    fields: &[
        Field::header(b'K'),
        Field::length(),
        Field::int32("ProcessID", 0),
        Field::int32("SecretKey", 0),
    ],
};

impl Message for BackendKeyData {
    fn default_schema() -> &'static Schema {
        &BACKEND_KEY_DATA
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&BACKEND_KEY_DATA)
            .with("ProcessID", Value::Int32(self.process_id))?
            .with("SecretKey", Value::Int32(self.secret_key))
    }

    fn from_format(format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            process_id: format.int32("ProcessID")?,
            secret_key: format.int32("SecretKey")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

static PARAMETER_STATUS: Schema = Schema {
    name: "ParameterStatus",
    fields: &[
        Field::header(b'S'),
        Field::length(),
        Field::cstring("Name"),
        Field::cstring("Value"),
    ],
};

impl Message for ParameterStatus {
    fn default_schema() -> &'static Schema {
        &PARAMETER_STATUS
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&PARAMETER_STATUS)
            .with("Name", Value::str(self.name.as_str()))?
            .with("Value", Value::str(self.value.as_str()))
    }

    fn from_format(mut format: MessageFormat) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: format.take_string("Name")?,
            value: format.take_string("Value")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec;

    #[test]
    fn authentication_ok_is_eight_bytes_after_tag() {
        let mut buf = BytesMut::new();

        codec::encode(&Authentication::Ok.encode().unwrap(), &mut buf).unwrap();

        assert_eq!(&buf[..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn md5_request_carries_salt() {
        let mut buf = BytesMut::new();
        let request = Authentication::Md5Password { salt: [1, 2, 3, 4] };

        codec::encode(&request.encode().unwrap(), &mut buf).unwrap();

        assert_eq!(Authentication::decode_frame(buf.freeze()).unwrap(), request);
    }

    #[test]
    fn unknown_auth_type_is_rejected() {
        let frame = Bytes::from_static(&[b'R', 0, 0, 0, 8, 0, 0, 0, 9]);

        assert!(Authentication::decode_frame(frame).is_err());
    }
}
