//! The query execution collaborator.
//!
//! The connection layer never interprets SQL. It hands statement text and bound parameters to
//! an [`Engine`] and streams back whatever [`QueryResult`] it produces.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::stream::BoxStream;
use strum_macros::Display;
use thiserror::Error as ThisError;

use crate::error::sql_state;
use crate::types::{self, Oid, Value};

pub mod literal;

pub use literal::LiteralEngine;

/// Shape of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    /// Source table and attribute number, zero when the column is computed.
    pub table_oid: Oid,
    pub column_id: i16,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
            type_size: types::type_size(type_oid),
            type_modifier: -1,
            table_oid: 0,
            column_id: 0,
        }
    }
}

/// What a statement takes and returns, known without executing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub parameters: Vec<Oid>,
    /// Empty when the statement returns no rows.
    pub columns: Vec<Column>,
}

pub type Row = Vec<Value>;

/// Lazy, forward only sequence of result rows.
pub type RowStream = BoxStream<'static, Result<Row, ExecutionError>>;

/// Command name plus affected row count, as reported in CommandComplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    pub command: String,
    pub rows: Option<u64>,
}

impl CommandTag {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            rows: None,
        }
    }

    pub fn with_rows(command: impl Into<String>, rows: u64) -> Self {
        Self {
            command: command.into(),
            rows: Some(rows),
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.command.as_str(), self.rows) {
            // INSERT still reports the legacy OID column.
            ("INSERT", Some(rows)) => write!(f, "INSERT 0 {rows}"),
            (command, Some(rows)) => write!(f, "{command} {rows}"),
            (command, None) => f.write_str(command),
        }
    }
}

/// Receives the data of a `COPY ... FROM STDIN`, one chunk at a time.
pub trait CopySink: Send {
    fn write(&mut self, data: Bytes) -> Result<(), ExecutionError>;

    /// All data has arrived.
    fn finish(self: Box<Self>) -> Result<CommandTag, ExecutionError>;

    /// The copy was abandoned; nothing written so far may take effect.
    fn abort(self: Box<Self>, reason: &str);
}

pub enum QueryResult {
    Rows {
        columns: Vec<Column>,
        rows: RowStream,
    },
    Command(CommandTag),
    /// The client sends data next.
    CopyIn {
        columns: usize,
        sink: Box<dyn CopySink>,
    },
    /// The server streams one chunk per row.
    CopyOut {
        columns: usize,
        data: BoxStream<'static, Result<Bytes, ExecutionError>>,
    },
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Rows { columns, .. } => {
                f.debug_struct("Rows").field("columns", columns).finish()
            }
            QueryResult::Command(tag) => f.debug_tuple("Command").field(tag).finish(),
            QueryResult::CopyIn { columns, .. } => {
                f.debug_struct("CopyIn").field("columns", columns).finish()
            }
            QueryResult::CopyOut { columns, .. } => {
                f.debug_struct("CopyOut").field("columns", columns).finish()
            }
        }
    }
}

/// Facts about the session an engine may need.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub process_id: i32,
    pub user: String,
    pub database: String,
    pub application_name: String,
    /// Every startup parameter as sent by the client.
    pub parameters: Vec<(String, String)>,
}

/// Parses and runs SQL on behalf of every connection. Shared by all of them.
pub trait Engine: Send + Sync + 'static {
    /// Describes a statement without running it. `parameter_types` holds the types the client
    /// fixed, zero where it left the choice to the engine.
    fn describe(
        &self,
        session: &SessionInfo,
        query: &str,
        parameter_types: &[Oid],
    ) -> impl Future<Output = Result<Description, ExecutionError>> + Send;

    /// Runs a statement with bound parameter values.
    fn execute(
        &self,
        session: &SessionInfo,
        query: &str,
        parameters: &[Value],
    ) -> impl Future<Output = Result<QueryResult, ExecutionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
}

/// A failure reported to the client as an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{severity}: {message} ({code})")]
pub struct ExecutionError {
    pub severity: Severity,
    /// SQLSTATE code.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character position in the query text.
    pub position: Option<u32>,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            ..Self::new(code, message)
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(sql_state::SYNTAX_ERROR, message)
    }

    pub fn cancelled() -> Self {
        Self::new(
            sql_state::QUERY_CANCELED,
            "canceling statement due to user request",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(sql_state::INTERNAL_ERROR, message)
    }

    pub fn in_failed_transaction() -> Self {
        Self::new(
            sql_state::IN_FAILED_SQL_TRANSACTION,
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == sql_state::QUERY_CANCELED
    }
}
