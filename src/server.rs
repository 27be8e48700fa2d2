//! Listener: accept loop that hands every connection to its own handler thread

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::ServeError;
use crate::logger::Logger;
use crate::receiver::ConnectionHandler;

/// Receiving daemon rooted at a fixed destination directory
pub struct Server {
    handler: ConnectionHandler,
}

impl Server {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            handler: ConnectionHandler::new(destination),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.handler = self.handler.with_logger(logger);
        self
    }

    pub async fn bind(self, address: &str) -> Result<BoundServer, ServeError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServeError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(BoundServer {
            listener,
            handler: self.handler,
        })
    }

    /// Bind every interface on `port` and accept until `cancel` fires.
    pub async fn serve(self, port: u16, cancel: CancellationToken) -> Result<(), ServeError> {
        self.bind(&format!("0.0.0.0:{}", port))
            .await?
            .run(cancel)
            .await
    }
}

/// Listening socket plus the handler template cloned into each connection
pub struct BoundServer {
    listener: TcpListener,
    handler: ConnectionHandler,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled.
    ///
    /// Always ends in an error: [`ServeError::Cancelled`] when `cancel`
    /// fires, [`ServeError::Accept`] when accepting fails. Handlers already
    /// dispatched keep running to their own completion either way.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServeError> {
        tracing::info!(
            address = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            destination = %self.handler.destination().display(),
            "listening"
        );
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("listener cancelled, no longer accepting");
                    return Err(ServeError::Cancelled);
                }
                accepted = self.listener.accept() => accepted.map_err(ServeError::Accept)?,
            };
            self.dispatch(stream, peer);
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let stream = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping connection");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let handler = self.handler.clone();
        let spawned = thread::Builder::new()
            .name(format!("recv-{}", peer))
            .spawn(move || handler.handle(stream));
        if let Err(e) = spawned {
            tracing::error!(peer = %peer, error = %e, "failed to spawn connection handler");
        }
    }
}

/// Serve `destination` on `port` until `cancel` fires.
pub async fn serve(
    port: u16,
    destination: impl Into<PathBuf>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    Server::new(destination).serve(port, cancel).await
}
