use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connection::{Connection, ConnectionError};
use crate::engine::Engine;
use crate::messages;
use crate::registry::CancelRegistry;
use crate::types::{DefaultFormat, ValueFormat};
use crate::Error;

/// Everything a connection shares with the rest of the server.
pub struct Context<E> {
    pub engine: Arc<E>,
    pub authenticator: Arc<dyn Authenticator>,
    pub formats: Arc<dyn ValueFormat>,
    pub registry: CancelRegistry,
    pub config: Arc<Config>,
    /// Cancelled when the server stops.
    pub shutdown: CancellationToken,
}

impl<E> Clone for Context<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            authenticator: self.authenticator.clone(),
            formats: self.formats.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub struct Server<E> {
    listener: TcpListener,
    context: Context<E>,
    tracker: TaskTracker,
}

/// Stops a running server from anywhere. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ServerHandle {
    /// Stops accepting connections and asks every live connection to close.
    pub fn stop(&self) {
        info!("Stopping server");
        self.shutdown.cancel();
    }

    /// Resolves once the accept loop has exited and every connection task has finished.
    pub async fn wait_for_stop(&self) {
        self.tracker.wait().await;
    }
}

impl<E: Engine> Server<E> {
    pub async fn bind(
        config: Config,
        engine: E,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, Error> {
        // Fail on a broken message catalog before accepting anyone.
        messages::init()?;

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;

        Ok(Self {
            listener,
            context: Context {
                engine: Arc::new(engine),
                authenticator,
                formats: Arc::new(DefaultFormat),
                registry: CancelRegistry::new(),
                config: Arc::new(config),
                shutdown: CancellationToken::new(),
            },
            tracker: TaskTracker::new(),
        })
    }

    /// Replaces the text and binary formatting of result and parameter values.
    pub fn with_value_format(mut self, formats: impl ValueFormat + 'static) -> Self {
        self.context.formats = Arc::new(formats);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.context.shutdown.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Accepts connections until stopped, running each one on its own task.
    pub async fn serve(self) -> Result<(), Error> {
        info!("PostgreSQL server listening on {}", self.listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.context.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (socket, client_address) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            info!("Accepted connection from {:?}", client_address);

            let context = self.context.clone();
            self.tracker.spawn(async move {
                if let Err(e) = handle_connection(socket, client_address, context).await {
                    error!("Connection ended with error: {}", e);
                }
            });
        }

        self.tracker.close();
        info!("Stopped accepting connections");
        Ok(())
    }
}

#[instrument(
    name = "connection",
    skip(stream, context),
    fields(connection_id, pid, client_address)
)]
async fn handle_connection<E: Engine>(
    stream: TcpStream,
    client_address: SocketAddr,
    context: Context<E>,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true)?;
    let conn = Connection::new(stream, context);

    tracing::Span::current()
        .record("connection_id", conn.id().to_string())
        .record("client_address", client_address.to_string());

    conn.run().await
}
