use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{is_empty_query, row_description, Connection, ConnectionError};
use crate::engine::{CommandTag, Engine, QueryResult};
use crate::messages::EmptyQueryResponse;
use crate::session::Session;
use crate::types::FormatCode;

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: Engine,
{
    /// Runs one Query message. Whatever happens, the client gets a ReadyForQuery at the end;
    /// only socket level failures escape.
    pub(super) async fn simple_query(
        &mut self,
        session: &mut Session,
        query: String,
    ) -> Result<(), ConnectionError> {
        session.drop_unnamed();

        if is_empty_query(&query) {
            self.send(EmptyQueryResponse).await?;
        } else {
            match self.run_simple(session, &query).await {
                Ok(()) => {}
                Err(ConnectionError::Execution(err)) => {
                    self.send_error(&err).await?;
                    session.fail();
                }
                Err(err) => return Err(err),
            }
        }

        self.ready(session.status()).await
    }

    async fn run_simple(
        &mut self,
        session: &mut Session,
        query: &str,
    ) -> Result<(), ConnectionError> {
        let query = session.admit(query)?;
        let guard = self
            .context
            .registry
            .begin_query(session.info.process_id, &self.context.shutdown);
        let token = guard.token().clone();

        let tag = match self.run_query(&session.info, &token, query, &[]).await? {
            QueryResult::Rows { columns, rows } => {
                // Simple queries always return text.
                let formats = vec![FormatCode::Text; columns.len()];
                self.send(row_description(&columns, &formats)).await?;
                let (sent, _) = self
                    .send_rows(&token, &columns, &formats, &mut rows.peekable(), None)
                    .await?;
                CommandTag::with_rows("SELECT", sent)
            }
            QueryResult::Command(tag) => {
                session.apply(&tag);
                tag
            }
            QueryResult::CopyIn { columns, sink } => self.copy_in(columns, sink).await?,
            QueryResult::CopyOut { columns, data } => self.copy_out(&token, columns, data).await?,
        };

        self.complete(tag).await
    }
}
