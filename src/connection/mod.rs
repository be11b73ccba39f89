//! The per connection protocol state machine.
//!
//! A [`Connection`] owns its socket and drives it through startup, authentication and the
//! query loop until the client terminates, the socket fails or the server stops. Messages are
//! processed strictly one at a time and responses are written in request order.

use std::io;

use futures::stream::Peekable;
use futures::{SinkExt, StreamExt};
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::MessageCodec;
use crate::engine::{
    Column, CommandTag, Engine, ExecutionError, QueryResult, Row, RowStream, SessionInfo,
    Severity,
};
use crate::error::{sql_state, ProtocolError};
use crate::messages::{
    BackendMessage, CommandComplete, DataRow, ErrorResponse, FieldDescription, FrontendMessage,
    ReadyForQuery, RowDescription, TransactionStatus,
};
use crate::server::Context;
use crate::session::Session;
use crate::types::{FormatCode, Value};

mod copy;
mod extended;
mod simple;
mod startup;

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error("authentication failed for user \"{0}\"")]
    AuthenticationFailed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A statement failed. Recoverable unless its severity is FATAL.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => ConnectionError::Io(err),
            err => ConnectionError::Protocol(err),
        }
    }
}

pub struct Connection<S, E> {
    id: Uuid,
    framed: Framed<S, MessageCodec>,
    context: Context<E>,
}

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: Engine,
{
    pub fn new(stream: S, context: Context<E>) -> Self {
        let codec = MessageCodec::new(context.config.max_message_size);
        Self {
            id: Uuid::new_v4(),
            framed: Framed::new(stream, codec),
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let Some(mut session) = self.startup().await? else {
            return Ok(());
        };

        let result = self.serve(&mut session).await;
        self.close(&mut session).await;
        result
    }

    async fn serve(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        loop {
            let next = tokio::select! {
                _ = self.context.shutdown.cancelled() => None,
                message = self.framed.next() => Some(message),
            };

            let message = match next {
                None => {
                    self.send_fatal(&admin_shutdown()).await?;
                    return Ok(());
                }
                Some(None) => {
                    debug!("Client closed the connection");
                    return Ok(());
                }
                Some(Some(Ok(message))) => message,
                Some(Some(Err(err))) => return Err(self.protocol_error(err).await),
            };

            debug!(message = message.name(), "Received message");

            if session.is_discarding()
                && !matches!(
                    message,
                    FrontendMessage::Sync(_) | FrontendMessage::Terminate(_)
                )
            {
                debug!(message = message.name(), "Discarded until Sync");
                continue;
            }

            let result = match message {
                FrontendMessage::Query(query) => self.simple_query(session, query.query).await,
                FrontendMessage::Parse(parse) => self.parse(session, parse).await,
                FrontendMessage::Bind(bind) => self.bind(session, bind).await,
                FrontendMessage::Describe(describe) => self.describe(session, describe).await,
                FrontendMessage::Execute(execute) => self.execute(session, execute).await,
                FrontendMessage::Close(close) => self.close_target(session, close).await,
                FrontendMessage::Flush(_) => self.flush().await,
                FrontendMessage::Sync(_) => {
                    let status = session.sync();
                    self.ready(status).await
                }
                FrontendMessage::Terminate(_) => {
                    debug!("Client terminated the session");
                    return Ok(());
                }
                FrontendMessage::CopyData(_)
                | FrontendMessage::CopyDone(_)
                | FrontendMessage::CopyFail(_) => {
                    // Leftovers of a copy that already failed.
                    debug!(message = message.name(), "Ignored copy message");
                    Ok(())
                }
                FrontendMessage::PasswordMessage(_)
                | FrontendMessage::Startup(_)
                | FrontendMessage::SslRequest(_)
                | FrontendMessage::GssEncRequest(_)
                | FrontendMessage::CancelRequest(_) => {
                    let reason = format!("unexpected {} after startup", message.name());
                    let err = ExecutionError::fatal(sql_state::PROTOCOL_VIOLATION, reason.clone());
                    self.send_fatal(&err).await?;
                    return Err(ConnectionError::ProtocolViolation(reason));
                }
            };

            match result {
                Err(ConnectionError::Execution(err)) if err.severity != Severity::Fatal => {
                    // Extended query batch failed: skip everything up to the next Sync.
                    // Flush now: a Flush sent after the failing step is discarded.
                    self.send_error(&err).await?;
                    self.flush().await?;
                    session.fail();
                    session.begin_discard();
                }
                Err(ConnectionError::Execution(err)) => {
                    self.send_fatal(&err).await?;
                    return Err(err.into());
                }
                result => result?,
            }
        }
    }

    /// Ends the session. An open transaction is rolled back, never committed.
    async fn close(&mut self, session: &mut Session) {
        if session.status() != TransactionStatus::Idle {
            debug!(status = %session.status(), "Rolling back open transaction");
            match self
                .context
                .engine
                .execute(&session.info, "ROLLBACK", &[])
                .await
            {
                Ok(QueryResult::Command(tag)) => session.apply(&tag),
                Ok(other) => warn!("Unexpected result from rollback: {:?}", other),
                Err(e) => warn!("Failed to roll back: {}", e),
            }
        }

        session.clear();
        self.context.registry.unregister(session.info.process_id);
        info!("Connection closed");
    }

    /// Queues a message. Written out at the next flush, or earlier once the buffer fills.
    async fn send(&mut self, message: impl Into<BackendMessage>) -> Result<(), ConnectionError> {
        self.framed.feed(message.into()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.framed.flush().await?;
        Ok(())
    }

    async fn ready(&mut self, status: TransactionStatus) -> Result<(), ConnectionError> {
        self.send(ReadyForQuery { status }).await?;
        self.flush().await
    }

    async fn complete(&mut self, tag: CommandTag) -> Result<(), ConnectionError> {
        self.send(CommandComplete {
            tag: tag.to_string(),
        })
        .await
    }

    async fn send_error(&mut self, err: &ExecutionError) -> Result<(), ConnectionError> {
        debug!("Statement failed: {}", err);
        self.send(ErrorResponse::from(err)).await
    }

    /// Reports an error that ends the connection. The caller returns right after.
    async fn send_fatal(&mut self, err: &ExecutionError) -> Result<(), ConnectionError> {
        warn!("Closing connection: {}", err);
        self.send(ErrorResponse::from(err)).await?;
        self.flush().await
    }

    /// The stream can no longer be trusted to be frame aligned. Tells the client why, if the
    /// socket still works, and hands back the error that ends the connection.
    async fn protocol_error(&mut self, err: ProtocolError) -> ConnectionError {
        if !matches!(err, ProtocolError::Io(_)) {
            let response = ExecutionError::fatal(sql_state::PROTOCOL_VIOLATION, err.to_string());
            if let Err(e) = self.send_fatal(&response).await {
                debug!("Failed to report protocol error: {}", e);
            }
        }
        err.into()
    }

    /// Runs a statement on the engine, giving up as soon as `token` is cancelled.
    async fn run_query(
        &self,
        session: &SessionInfo,
        token: &CancellationToken,
        query: &str,
        parameters: &[Value],
    ) -> Result<QueryResult, ExecutionError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ExecutionError::cancelled()),
            result = self.context.engine.execute(session, query, parameters) => result,
        }
    }

    /// Streams rows as DataRow messages until the rows run out or `limit` rows were sent.
    /// Returns the number of rows sent and whether more remain.
    async fn send_rows(
        &mut self,
        token: &CancellationToken,
        columns: &[Column],
        formats: &[FormatCode],
        rows: &mut Peekable<RowStream>,
        limit: Option<u64>,
    ) -> Result<(u64, bool), ConnectionError> {
        let mut sent = 0;
        loop {
            if limit.is_some_and(|limit| sent >= limit) {
                let more = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(ExecutionError::cancelled().into()),
                    next = Pin::new(&mut *rows).peek() => next.is_some(),
                };
                return Ok((sent, more));
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ExecutionError::cancelled().into()),
                next = rows.next() => next,
            };
            let Some(row) = next else {
                return Ok((sent, false));
            };

            let row = self.data_row(columns, formats, row?)?;
            self.send(row).await?;
            sent += 1;
        }
    }

    fn data_row(
        &self,
        columns: &[Column],
        formats: &[FormatCode],
        row: Row,
    ) -> Result<DataRow, ExecutionError> {
        if row.len() != columns.len() {
            return Err(ExecutionError::internal(format!(
                "row has {} values but {} columns were described",
                row.len(),
                columns.len()
            )));
        }

        let values = columns
            .iter()
            .zip(&row)
            .enumerate()
            .map(|(i, (column, value))| {
                let format = formats.get(i).copied().unwrap_or_default();
                self.context.formats.format(column.type_oid, format, value)
            })
            .collect::<Result<_, _>>()?;

        Ok(DataRow { values })
    }
}

fn row_description(columns: &[Column], formats: &[FormatCode]) -> RowDescription {
    let fields = columns
        .iter()
        .enumerate()
        .map(|(i, column)| FieldDescription {
            name: column.name.clone(),
            table_oid: column.table_oid,
            column_id: column.column_id,
            type_oid: column.type_oid,
            type_size: column.type_size,
            type_modifier: column.type_modifier,
            format: formats.get(i).copied().unwrap_or_default(),
        })
        .collect();

    RowDescription { fields }
}

fn admin_shutdown() -> ExecutionError {
    ExecutionError::fatal(
        sql_state::ADMIN_SHUTDOWN,
        "terminating connection due to administrator command",
    )
}

/// Nothing but whitespace and semicolons.
fn is_empty_query(query: &str) -> bool {
    query.split(';').all(|part| part.trim().is_empty())
}
