use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{admin_shutdown, Connection, ConnectionError};
use crate::auth::Credentials;
use crate::codec::Phase;
use crate::engine::{Engine, ExecutionError, SessionInfo};
use crate::error::{sql_state, ProtocolError};
use crate::messages::{
    Authentication, BackendKeyData, FrontendMessage, NegotiationResponse, ParameterStatus,
    Startup,
};
use crate::session::Session;

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: Engine,
{
    /// Negotiates, authenticates and reports the session parameters.
    ///
    /// Returns `None` when the client went away before a session was established, or when the
    /// connection only carried a cancel request.
    pub(super) async fn startup(&mut self) -> Result<Option<Session>, ConnectionError> {
        let startup = loop {
            let next = tokio::select! {
                _ = self.context.shutdown.cancelled() => None,
                message = self.framed.next() => Some(message),
            };

            let message = match next {
                // Nothing negotiated yet, so there is nobody to tell.
                None => {
                    debug!("Server stopping before startup");
                    return Ok(None);
                }
                Some(None) => return Ok(None),
                Some(Some(Ok(message))) => message,
                Some(Some(Err(ProtocolError::UnsupportedProtocolVersion { major, minor }))) => {
                    let err = ExecutionError::fatal(
                        sql_state::FEATURE_NOT_SUPPORTED,
                        format!(
                            "unsupported frontend protocol {major}.{minor}: server supports 3.0 to 3.0"
                        ),
                    );
                    self.send_fatal(&err).await?;
                    return Err(err.into());
                }
                Some(Some(Err(err))) => return Err(err.into()),
            };

            debug!(message = message.name(), "Received message");

            match message {
                // Encryption is not offered; the client continues in plain text.
                FrontendMessage::SslRequest(_) | FrontendMessage::GssEncRequest(_) => {
                    self.send(NegotiationResponse::DECLINE).await?;
                    self.flush().await?;
                }
                FrontendMessage::CancelRequest(request) => {
                    let cancelled = self
                        .context
                        .registry
                        .cancel(request.process_id, request.secret_key);
                    info!(pid = request.process_id, cancelled, "Cancel request");
                    return Ok(None);
                }
                FrontendMessage::Startup(startup) => break startup,
                other => {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "unexpected {} during startup",
                        other.name()
                    )))
                }
            }
        };

        self.framed.codec_mut().set_phase(Phase::Ready);

        let info = self.session_info(&startup).await?;
        if !self.authenticate(&info).await? {
            return Ok(None);
        }

        let pid = self.context.registry.next_pid();
        let secret_key = rand::random::<i32>();
        self.context.registry.register(pid, secret_key);
        tracing::Span::current().record("pid", pid);

        self.send(Authentication::Ok).await?;
        for (name, value) in self.parameter_statuses(&info) {
            self.send(ParameterStatus::new(name, value)).await?;
        }
        self.send(BackendKeyData {
            process_id: pid,
            secret_key,
        })
        .await?;

        info!(user = %info.user, database = %info.database, "Session started");

        let session = Session::new(SessionInfo {
            process_id: pid,
            ..info
        });
        self.ready(session.status()).await?;
        Ok(Some(session))
    }

    /// Validates the startup parameters. Rejections are reported to the client before the
    /// error is returned.
    async fn session_info(&mut self, startup: &Startup) -> Result<SessionInfo, ConnectionError> {
        let user = match startup.parameter("user") {
            Some(user) if !user.is_empty() => user.to_string(),
            _ => {
                let err = ExecutionError::fatal(
                    sql_state::INVALID_AUTHORIZATION_SPECIFICATION,
                    "no PostgreSQL user name specified in startup packet",
                );
                self.send_fatal(&err).await?;
                return Err(err.into());
            }
        };

        if let Some(encoding) = startup.parameter("client_encoding") {
            if !is_utf8(encoding) {
                let err = ExecutionError::fatal(
                    sql_state::INVALID_PARAMETER_VALUE,
                    format!("invalid value for parameter \"client_encoding\": \"{encoding}\""),
                )
                .with_hint("Only UTF8 is supported.");
                self.send_fatal(&err).await?;
                return Err(err.into());
            }
        }

        let database = match startup.parameter("database") {
            Some(database) if !database.is_empty() => database.to_string(),
            _ => user.clone(),
        };

        Ok(SessionInfo {
            process_id: 0,
            user,
            database,
            application_name: startup
                .parameter("application_name")
                .unwrap_or_default()
                .to_string(),
            parameters: startup.parameters.clone(),
        })
    }

    /// Asks for a password when the authenticator wants one, then verifies. Returns `false`
    /// when the client hung up instead of answering, or the server stopped while waiting.
    async fn authenticate(&mut self, info: &SessionInfo) -> Result<bool, ConnectionError> {
        let mut credentials = Credentials {
            user: info.user.clone(),
            database: info.database.clone(),
            password: None,
        };

        if self.context.authenticator.requires_password(&credentials.user) {
            self.send(Authentication::CleartextPassword).await?;
            self.flush().await?;

            let next = tokio::select! {
                _ = self.context.shutdown.cancelled() => None,
                message = self.framed.next() => Some(message),
            };

            match next {
                None => {
                    self.send_fatal(&admin_shutdown()).await?;
                    return Ok(false);
                }
                // Clients commonly hang up here to prompt for a password.
                Some(None) => return Ok(false),
                Some(Some(Ok(FrontendMessage::PasswordMessage(message)))) => {
                    credentials.password = Some(message.password);
                }
                Some(Some(Ok(other))) => {
                    let reason = format!("expected password response, got {}", other.name());
                    let err = ExecutionError::fatal(sql_state::PROTOCOL_VIOLATION, reason.clone());
                    self.send_fatal(&err).await?;
                    return Err(ConnectionError::ProtocolViolation(reason));
                }
                Some(Some(Err(err))) => return Err(self.protocol_error(err).await),
            }
        }

        if let Err(reason) = self.context.authenticator.verify(&credentials) {
            warn!(user = %credentials.user, "Authentication failed");
            let code = if credentials.password.is_some() {
                sql_state::INVALID_PASSWORD
            } else {
                sql_state::INVALID_AUTHORIZATION_SPECIFICATION
            };
            self.send_fatal(&ExecutionError::fatal(code, reason)).await?;
            return Err(ConnectionError::AuthenticationFailed(credentials.user));
        }

        Ok(true)
    }

    fn parameter_statuses(&self, info: &SessionInfo) -> Vec<(&'static str, String)> {
        vec![
            ("server_version", self.context.config.server_version.clone()),
            ("server_encoding", "UTF8".to_string()),
            ("client_encoding", "UTF8".to_string()),
            ("DateStyle", "ISO, MDY".to_string()),
            ("TimeZone", "UTC".to_string()),
            ("integer_datetimes", "on".to_string()),
            ("standard_conforming_strings", "on".to_string()),
            ("application_name", info.application_name.clone()),
        ]
    }
}

/// Accepts the spellings of UTF8 clients send.
fn is_utf8(encoding: &str) -> bool {
    let normalized = encoding
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>();
    normalized.eq_ignore_ascii_case("utf8") || normalized.eq_ignore_ascii_case("unicode")
}
