//! The closed set of protocol messages.
//!
//! Every message type owns one static [`Schema`] and converts to and from a
//! [`MessageFormat`] through the [`Message`] trait. Inbound frames are dispatched on their
//! tag byte through a [`Registry`]; frontend and backend messages live in separate
//! registries because the same tag means different things in each direction.
//!
//! Ref: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ptr;
use std::sync::OnceLock;

use bytes::Bytes;
use strum_macros::IntoStaticStr;

use crate::codec;
use crate::error::ProtocolError;
use crate::format::{MessageFormat, Schema};

/// Declares a message made of nothing but its tag and length.
macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident, $tag:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl $crate::messages::Message for $name {
            fn default_schema() -> &'static $crate::format::Schema {
                static SCHEMA: $crate::format::Schema = $crate::format::Schema {
                    name: stringify!($name),
                    fields: &[
                        $crate::format::Field::header($tag),
                        $crate::format::Field::length(),
                    ],
                };
                &SCHEMA
            }

            fn encode(
                &self,
            ) -> Result<$crate::format::MessageFormat, $crate::error::ProtocolError> {
                Ok($crate::format::MessageFormat::new(Self::default_schema()))
            }

            fn from_format(
                _: $crate::format::MessageFormat,
            ) -> Result<Self, $crate::error::ProtocolError> {
                Ok($name)
            }
        }
    };
}

mod authentication;
mod control;
mod copy;
mod extended_query;
mod response;
mod simple_query;
mod startup;

pub use authentication::{Authentication, BackendKeyData, ParameterStatus, PasswordMessage};
pub use control::{Flush, ReadyForQuery, Sync, Terminate, TransactionStatus};
pub use copy::{CopyData, CopyDone, CopyFail, CopyInResponse, CopyOutResponse};
pub use extended_query::{
    Bind, BindComplete, Close, CloseComplete, Describe, Execute, NoData, ParameterDescription,
    Parse, ParseComplete, PortalSuspended, Target,
};
pub use response::{field_code, ErrorResponse, NoticeResponse};
pub use simple_query::{
    CommandComplete, DataRow, EmptyQueryResponse, FieldDescription, Query, RowDescription,
};
pub use startup::{
    CancelRequest, GssEncRequest, NegotiationResponse, SslRequest, Startup, PROTOCOL_VERSION_3,
};

/// Capabilities shared by every message variant.
pub trait Message: Sized {
    /// The canonical layout of this message. Built once and never mutated.
    fn default_schema() -> &'static Schema;

    fn encode(&self) -> Result<MessageFormat, ProtocolError>;

    /// Builds the message from a decoded instance already checked against
    /// [`Message::default_schema`].
    fn from_format(format: MessageFormat) -> Result<Self, ProtocolError>;

    fn decode(format: MessageFormat) -> Result<Self, ProtocolError> {
        format.matches_structure(Self::default_schema())?;
        Self::from_format(format)
    }

    /// Decodes one complete frame laid out as this message.
    fn decode_frame(frame: Bytes) -> Result<Self, ProtocolError> {
        Self::decode(codec::decode(frame, Self::default_schema())?)
    }
}

type DecodeFn<M> = fn(Bytes) -> Result<M, ProtocolError>;

struct Prototype<M> {
    schema: &'static Schema,
    decode: DecodeFn<M>,
}

/// Maps header tags to the variant that decodes them.
pub struct Registry<M> {
    by_tag: HashMap<u8, Prototype<M>>,
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            by_tag: HashMap::new(),
        }
    }

    /// Registers a tagged schema. Registering the same schema again is a no-op; a different
    /// schema under an existing tag is rejected.
    pub fn register(
        &mut self,
        schema: &'static Schema,
        decode: DecodeFn<M>,
    ) -> Result<(), ProtocolError> {
        schema.validate()?;
        let tag = schema.header_tag().ok_or_else(|| {
            ProtocolError::malformed(format!("{} has no header tag to register", schema.name))
        })?;

        match self.by_tag.entry(tag) {
            Entry::Occupied(entry) if ptr::eq(entry.get().schema, schema) => Ok(()),
            Entry::Occupied(entry) => Err(ProtocolError::ConflictingRegistration {
                tag,
                existing: entry.get().schema.name,
                incoming: schema.name,
            }),
            Entry::Vacant(entry) => {
                entry.insert(Prototype { schema, decode });
                Ok(())
            }
        }
    }

    pub fn lookup(&self, tag: u8) -> Option<&'static Schema> {
        self.by_tag.get(&tag).map(|prototype| prototype.schema)
    }

    /// Peeks the tag of a complete frame and hands it to the registered variant.
    pub fn decode(&self, frame: Bytes) -> Result<M, ProtocolError> {
        let tag = *frame
            .first()
            .ok_or_else(|| ProtocolError::malformed("empty frame"))?;
        let prototype = self
            .by_tag
            .get(&tag)
            .ok_or(ProtocolError::UnknownMessageType(tag))?;
        (prototype.decode)(frame)
    }
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! message_enum {
    (
        $(#[$meta:meta])*
        $enum:ident {
            tagged: [$($tagged:ident),* $(,)?],
            untagged: [$($untagged:ident),* $(,)?] $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, IntoStaticStr)]
        pub enum $enum {
            $($tagged($tagged),)*
            $($untagged($untagged),)*
        }

        impl $enum {
            pub fn encode(&self) -> Result<MessageFormat, ProtocolError> {
                match self {
                    $($enum::$tagged(message) => message.encode(),)*
                    $($enum::$untagged(message) => message.encode(),)*
                }
            }

            pub fn schema(&self) -> &'static Schema {
                match self {
                    $($enum::$tagged(_) => <$tagged as Message>::default_schema(),)*
                    $($enum::$untagged(_) => <$untagged as Message>::default_schema(),)*
                }
            }

            fn registry() -> Result<Registry<$enum>, ProtocolError> {
                let mut registry = Registry::new();
                $(
                    registry.register(<$tagged as Message>::default_schema(), |frame| {
                        <$tagged as Message>::decode_frame(frame).map($enum::$tagged)
                    })?;
                )*
                Ok(registry)
            }
        }

        $(
            impl From<$tagged> for $enum {
                fn from(message: $tagged) -> Self {
                    $enum::$tagged(message)
                }
            }
        )*
        $(
            impl From<$untagged> for $enum {
                fn from(message: $untagged) -> Self {
                    $enum::$untagged(message)
                }
            }
        )*
    };
}

message_enum! {
    /// Messages sent by the client.
    FrontendMessage {
        tagged: [
            Query, Parse, Bind, Describe, Execute, Sync, Flush, Close, Terminate, CopyData,
            CopyDone, CopyFail, PasswordMessage,
        ],
        untagged: [Startup, SslRequest, GssEncRequest, CancelRequest],
    }
}

message_enum! {
    /// Messages sent by the server.
    BackendMessage {
        tagged: [
            Authentication, BackendKeyData, ParameterStatus, ReadyForQuery, RowDescription,
            DataRow, CommandComplete, EmptyQueryResponse, ErrorResponse, NoticeResponse,
            ParseComplete, BindComplete, CloseComplete, NoData, ParameterDescription,
            PortalSuspended, CopyInResponse, CopyOutResponse, CopyData, CopyDone,
        ],
        untagged: [NegotiationResponse],
    }
}

impl FrontendMessage {
    /// Decodes an untagged startup phase frame, dispatching on its request code.
    pub fn decode_startup(frame: Bytes) -> Result<Self, ProtocolError> {
        let code = frame
            .get(4..8)
            .map(|code| i32::from_be_bytes([code[0], code[1], code[2], code[3]]))
            .ok_or_else(|| ProtocolError::malformed("startup packet too short"))?;

        match code {
            SslRequest::CODE => SslRequest::decode_frame(frame).map(Self::SslRequest),
            GssEncRequest::CODE => GssEncRequest::decode_frame(frame).map(Self::GssEncRequest),
            CancelRequest::CODE => CancelRequest::decode_frame(frame).map(Self::CancelRequest),
            version => {
                let (major, minor) = (version >> 16, version & 0xFFFF);
                if major != 3 {
                    return Err(ProtocolError::UnsupportedProtocolVersion { major, minor });
                }
                Startup::decode_frame(frame).map(Self::Startup)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl BackendMessage {
    /// Decodes the single byte answer to an SSL or GSSAPI encryption request.
    pub fn decode_negotiation(frame: Bytes) -> Result<Self, ProtocolError> {
        NegotiationResponse::decode_frame(frame).map(Self::NegotiationResponse)
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

static FRONTEND: OnceLock<Result<Registry<FrontendMessage>, ProtocolError>> = OnceLock::new();
static BACKEND: OnceLock<Result<Registry<BackendMessage>, ProtocolError>> = OnceLock::new();

fn shared<M>(
    cell: &'static OnceLock<Result<Registry<M>, ProtocolError>>,
    build: fn() -> Result<Registry<M>, ProtocolError>,
) -> Result<&'static Registry<M>, ProtocolError> {
    cell.get_or_init(build).as_ref().map_err(|err| match err {
        ProtocolError::ConflictingRegistration {
            tag,
            existing,
            incoming,
        } => ProtocolError::ConflictingRegistration {
            tag: *tag,
            existing: *existing,
            incoming: *incoming,
        },
        other => ProtocolError::malformed(other.to_string()),
    })
}

/// The process wide registry of client messages.
pub fn frontend() -> Result<&'static Registry<FrontendMessage>, ProtocolError> {
    shared(&FRONTEND, FrontendMessage::registry)
}

/// The process wide registry of server messages.
pub fn backend() -> Result<&'static Registry<BackendMessage>, ProtocolError> {
    shared(&BACKEND, BackendMessage::registry)
}

/// Builds both registries, failing fast on a conflicting registration.
pub fn init() -> Result<(), ProtocolError> {
    frontend()?;
    backend()?;
    Ok(())
}
