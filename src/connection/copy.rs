use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::engine::{CommandTag, CopySink, Engine, ExecutionError};
use crate::error::sql_state;
use crate::messages::{CopyData, CopyDone, CopyInResponse, CopyOutResponse, FrontendMessage};

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: Engine,
{
    /// `COPY ... FROM STDIN`: hands each CopyData chunk to the sink as it arrives.
    pub(super) async fn copy_in(
        &mut self,
        columns: usize,
        mut sink: Box<dyn CopySink>,
    ) -> Result<CommandTag, ConnectionError> {
        self.send(CopyInResponse::text(columns)).await?;
        self.flush().await?;

        loop {
            let next = tokio::select! {
                _ = self.context.shutdown.cancelled() => None,
                message = self.framed.next() => Some(message),
            };

            let message = match next {
                None => {
                    sink.abort("server shutting down");
                    return Err(ExecutionError::new(
                        sql_state::ADMIN_SHUTDOWN,
                        "COPY from stdin interrupted by server shutdown",
                    )
                    .into());
                }
                Some(Some(Ok(message))) => message,
                Some(Some(Err(err))) => {
                    sink.abort("invalid message during COPY");
                    return Err(self.protocol_error(err).await);
                }
                Some(None) => {
                    sink.abort("client closed the connection");
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            };

            match message {
                FrontendMessage::CopyData(chunk) => {
                    if let Err(err) = sink.write(chunk.data) {
                        sink.abort(&err.message);
                        return Err(err.into());
                    }
                }
                FrontendMessage::CopyDone(_) => return Ok(sink.finish()?),
                FrontendMessage::CopyFail(fail) => {
                    debug!(reason = %fail.message, "Client aborted COPY");
                    sink.abort(&fail.message);
                    return Err(ExecutionError::new(
                        sql_state::QUERY_CANCELED,
                        format!("COPY from stdin failed: {}", fail.message),
                    )
                    .into());
                }
                // Allowed while copying, and meaningless.
                FrontendMessage::Flush(_) | FrontendMessage::Sync(_) => {}
                other => {
                    let reason = format!("unexpected {} during COPY from stdin", other.name());
                    sink.abort(&reason);
                    return Err(ExecutionError::new(sql_state::PROTOCOL_VIOLATION, reason).into());
                }
            }
        }
    }

    /// `COPY ... TO STDOUT`: one CopyData message per chunk the engine produces.
    pub(super) async fn copy_out(
        &mut self,
        token: &CancellationToken,
        columns: usize,
        mut data: BoxStream<'static, Result<Bytes, ExecutionError>>,
    ) -> Result<CommandTag, ConnectionError> {
        self.send(CopyOutResponse::text(columns)).await?;

        let mut rows = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ExecutionError::cancelled().into()),
                next = data.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            self.send(CopyData { data: chunk? }).await?;
            rows += 1;
        }

        self.send(CopyDone).await?;
        Ok(CommandTag::with_rows("COPY", rows))
    }
}
