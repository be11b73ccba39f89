use strum_macros::Display;

use crate::error::ProtocolError;
use crate::format::{Field, MessageFormat, Schema, Value};
use crate::messages::Message;

/// Transaction status reported in ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; statements are rejected until it ends.
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

static READY_FOR_QUERY: Schema = Schema {
    name: "ReadyForQuery",
    fields: &[
        Field::header(b'Z'),
        Field::length(),
        Field::byte1("TransactionStatus", b'I'),
    ],
};

impl Message for ReadyForQuery {
    fn default_schema() -> &'static Schema {
        &READY_FOR_QUERY
    }

    fn encode(&self) -> Result<MessageFormat, ProtocolError> {
        MessageFormat::new(&READY_FOR_QUERY)
            .with("TransactionStatus", Value::Byte(self.status.as_byte()))
    }

    fn from_format(format: MessageFormat) -> Result<Self, ProtocolError> {
        let status = TransactionStatus::from_byte(format.byte("TransactionStatus")?).ok_or(
            ProtocolError::InvalidValue {
                field: "TransactionStatus",
            },
        )?;
        Ok(Self { status })
    }
}

empty_message!(
    /// Ends an extended query batch.
    Sync,
    b'S'
);

empty_message!(
    /// Asks the server to deliver pending output without ending the batch.
    Flush,
    b'H'
);

empty_message!(Terminate, b'X');
