use std::mem;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{is_empty_query, row_description, Connection, ConnectionError};
use crate::engine::{Column, CommandTag, Description, Engine, ExecutionError, QueryResult};
use crate::error::sql_state;
use crate::messages::{
    Bind, BindComplete, Close, CloseComplete, Describe, EmptyQueryResponse, Execute, NoData,
    ParameterDescription, Parse, ParseComplete, PortalSuspended, Target,
};
use crate::session::{Cursor, Portal, Session, Statement};
use crate::types::FormatCode;

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: Engine,
{
    pub(super) async fn parse(
        &mut self,
        session: &mut Session,
        parse: Parse,
    ) -> Result<(), ConnectionError> {
        session.admit(&parse.query)?;

        let description = if is_empty_query(&parse.query) {
            Description {
                parameters: parse.parameter_types.clone(),
                columns: Vec::new(),
            }
        } else {
            self.context
                .engine
                .describe(&session.info, &parse.query, &parse.parameter_types)
                .await?
        };

        debug!(statement = %parse.name, "Parsed statement");
        session.put_statement(
            parse.name,
            Statement {
                query: parse.query,
                description,
            },
        )?;
        self.send(ParseComplete).await
    }

    pub(super) async fn bind(
        &mut self,
        session: &mut Session,
        bind: Bind,
    ) -> Result<(), ConnectionError> {
        let portal = {
            let statement = session.statement(&bind.statement)?;
            session.admit(&statement.query)?;

            let types = &statement.description.parameters;
            if bind.parameters.len() != types.len() {
                return Err(ExecutionError::new(
                    sql_state::PROTOCOL_VIOLATION,
                    format!(
                        "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                        bind.parameters.len(),
                        bind.statement,
                        types.len()
                    ),
                )
                .into());
            }

            let parameter_formats = FormatCode::expand(&bind.parameter_formats, types.len())?;
            let parameters = types
                .iter()
                .zip(&parameter_formats)
                .zip(&bind.parameters)
                .map(|((type_oid, format), value)| {
                    self.context
                        .formats
                        .parse(*type_oid, *format, value.as_deref())
                })
                .collect::<Result<Vec<_>, _>>()?;

            let columns = statement.description.columns.clone();
            let formats = FormatCode::expand(&bind.result_formats, columns.len())?;

            Portal {
                statement: bind.statement,
                query: statement.query.clone(),
                parameters,
                columns,
                formats,
                cursor: Cursor::Pending,
            }
        };

        debug!(portal = %bind.portal, "Bound portal");
        session.put_portal(bind.portal, portal)?;
        self.send(BindComplete).await
    }

    pub(super) async fn describe(
        &mut self,
        session: &mut Session,
        describe: Describe,
    ) -> Result<(), ConnectionError> {
        let (parameters, columns, formats) = match describe.target {
            Target::Statement => {
                let statement = session.statement(&describe.name)?;
                // Result formats are not known until Bind.
                (
                    Some(statement.description.parameters.clone()),
                    statement.description.columns.clone(),
                    Vec::new(),
                )
            }
            Target::Portal => {
                let portal = session.portal(&describe.name)?;
                (None, portal.columns.clone(), portal.formats.clone())
            }
        };

        if let Some(types) = parameters {
            self.send(ParameterDescription { types }).await?;
        }
        if columns.is_empty() {
            self.send(NoData).await
        } else {
            self.send(row_description(&columns, &formats)).await
        }
    }

    /// Runs a portal, or resumes one a previous Execute suspended. A positive `max_rows`
    /// bounds the rows returned by this call.
    pub(super) async fn execute(
        &mut self,
        session: &mut Session,
        execute: Execute,
    ) -> Result<(), ConnectionError> {
        let limit = u64::try_from(execute.max_rows).ok().filter(|n| *n > 0);

        let (query, parameters, formats, cursor) = {
            let portal = session.portal_mut(&execute.portal)?;
            (
                portal.query.clone(),
                mem::take(&mut portal.parameters),
                portal.formats.clone(),
                // Put back below if rows remain.
                mem::replace(&mut portal.cursor, Cursor::Done),
            )
        };

        let guard = self
            .context
            .registry
            .begin_query(session.info.process_id, &self.context.shutdown);
        let token = guard.token().clone();

        let (columns, mut rows): (Vec<Column>, _) = match cursor {
            Cursor::Rows { columns, rows } => (columns, rows),
            Cursor::Done => {
                debug!(portal = %execute.portal, "Portal already exhausted");
                return self.complete(CommandTag::with_rows("SELECT", 0)).await;
            }
            Cursor::Pending => {
                let query = session.admit(&query)?;
                if is_empty_query(query) {
                    return self.send(EmptyQueryResponse).await;
                }

                match self
                    .run_query(&session.info, &token, query, &parameters)
                    .await?
                {
                    QueryResult::Rows { columns, rows } => (columns, rows.peekable()),
                    QueryResult::Command(tag) => {
                        session.apply(&tag);
                        return self.complete(tag).await;
                    }
                    QueryResult::CopyIn { columns, sink } => {
                        let tag = self.copy_in(columns, sink).await?;
                        return self.complete(tag).await;
                    }
                    QueryResult::CopyOut { columns, data } => {
                        let tag = self.copy_out(&token, columns, data).await?;
                        return self.complete(tag).await;
                    }
                }
            }
        };

        let (sent, more) = self
            .send_rows(&token, &columns, &formats, &mut rows, limit)
            .await?;

        if more {
            self.send(PortalSuspended).await?;
            let portal = session.portal_mut(&execute.portal)?;
            portal.cursor = Cursor::Rows { columns, rows };
            Ok(())
        } else {
            self.complete(CommandTag::with_rows("SELECT", sent)).await
        }
    }

    pub(super) async fn close_target(
        &mut self,
        session: &mut Session,
        close: Close,
    ) -> Result<(), ConnectionError> {
        match close.target {
            Target::Statement => session.close_statement(&close.name),
            Target::Portal => session.close_portal(&close.name),
        }
        self.send(CloseComplete).await
    }
}
