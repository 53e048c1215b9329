//! TCP listener and connection dispatcher.
//!
//! Accepts connections, registers each one with the session registry and
//! spawns an independent handler task for it. Connections arriving while
//! the registry is full get a notice and are closed without a handler.
//! When the shutdown future completes the listener stops accepting and
//! every remaining session is told and closed.

use crate::config::Config;
use crate::connection::{handle_connection, ConnState};
use crate::protocol::Reply;
use crate::registry::Registry;
use crate::session::{self, Session};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(config.max_clients);

        Server { config, registry }
    }

    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr, self.config.max_clients)?;
        TcpListener::from_std(listener)
    }

    /// Bind and serve until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        info!(
            address = %listener.local_addr()?,
            max_clients = self.registry.capacity(),
            "Server listening"
        );
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` completes, then
    /// close every session.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer, &mut tasks),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        // Usually out of descriptors; wait for handlers to release some
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        let closed = self.registry.shutdown(Reply::SERVER_SHUTDOWN);
        info!(closed, "Shutting down, closing all sessions");

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
            warn!(remaining = tasks.len(), "Connection tasks still running after grace period");
            tasks.abort_all();
        }

        Ok(())
    }

    /// Register an accepted connection and start its handler, or turn it
    /// away if the registry has no room.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, tasks: &mut JoinSet<()>) {
        trace!(%peer, state = ?ConnState::Connecting, "New connection");

        let (outbox, inbox) = session::channel(self.config.send_queue);
        match self.registry.try_register(Session::new(peer, outbox)) {
            Ok(slot) => {
                trace!(%peer, %slot, state = ?ConnState::Registered, "Connection registered");
                let registry = Arc::clone(&self.registry);
                tasks.spawn(async move {
                    if let Err(e) = handle_connection(stream, slot, inbox, registry).await {
                        debug!(%peer, %slot, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                warn!(%peer, error = %e, "Rejecting connection");
                tasks.spawn(reject(stream, peer));
            }
        }
    }
}

/// Tell a connection the server is full and close it.
async fn reject(mut stream: TcpStream, peer: SocketAddr) {
    trace!(%peer, state = ?ConnState::Closing, "Connection rejected");
    if let Err(e) = stream.write_all(Reply::SERVER_FULL.as_bytes()).await {
        debug!(%peer, error = %e, "Failed to send capacity notice");
    }
    let _ = stream.shutdown().await;
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

fn create_listener(addr: SocketAddr, backlog: usize) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
