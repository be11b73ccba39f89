use std::io;

use thiserror::Error as ThisError;

/// Errors raised while framing, encoding or decoding protocol messages.
#[derive(Debug, ThisError)]
pub enum ProtocolError {
    /// The byte layout violates the declared schema: truncated frame, bad length field or
    /// trailing bytes. The stream can no longer be trusted to be frame aligned.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    /// A decode was attempted against the wrong message variant.
    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("conflicting registration for tag 0x{tag:02x}: {existing} and {incoming}")]
    ConflictingRegistration {
        tag: u8,
        existing: &'static str,
        incoming: &'static str,
    },
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocolVersion { major: i32, minor: i32 },
    #[error("invalid value for field {field}")]
    InvalidValue { field: &'static str },
    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: &'static str },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(reason.into())
    }
}

/// SQLSTATE codes emitted by the protocol layer.
///
/// Ref: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
pub mod sql_state {
    pub const SUCCESSFUL_COMPLETION: &str = "00000";
    pub const CONNECTION_EXCEPTION: &str = "08000";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    pub const BAD_COPY_FILE_FORMAT: &str = "22P04";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const INVALID_BINARY_REPRESENTATION: &str = "22P03";
    pub const INVALID_CURSOR_STATE: &str = "24000";
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
    pub const INVALID_PASSWORD: &str = "28P01";
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
    pub const INVALID_CURSOR_NAME: &str = "34000";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_PARAMETER: &str = "42P02";
    pub const DUPLICATE_CURSOR: &str = "42P03";
    pub const DUPLICATE_PREPARED_STATEMENT: &str = "42P05";
    pub const QUERY_CANCELED: &str = "57014";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const INTERNAL_ERROR: &str = "XX000";
}
