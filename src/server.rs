//! TCP server accepting uploads.
//!
//! A single accept loop hands every connection to a `WorkerPool`; each
//! worker runs one receive session to completion. A failed session never
//! stops the loop, only a failure of the listener does.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ServerConfig, SessionConfig};
use crate::pool::{DispatchError, WorkerPool};
use crate::progress::TracingSink;
use crate::receiver::{self, ReceiveOutcome};

/// Pause before accepting again when the process is out of descriptors or
/// memory.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Source of accepted connections for the accept loop.
pub trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// One accepted connection waiting for a worker.
struct Incoming<S> {
    id: u64,
    stream: S,
    peer: SocketAddr,
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The pending connection went away; accept the next one.
    Connection,
    /// Out of descriptors, buffers or memory; back off and retry.
    Resources,
    /// The listening socket itself is unusable.
    Listener,
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    session: Arc<SessionConfig>,
    next_id: AtomicU64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let session = Arc::new(config.session.clone());
        Server {
            config,
            session,
            next_id: AtomicU64::new(1),
        }
    }

    /// Ensure the upload directory exists, bind, and serve forever.
    pub async fn run(&self) -> io::Result<()> {
        let addr: SocketAddr = tokio::net::lookup_host(self.config.listen_addr())
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no listen address"))?;
        let listener = create_listener(addr, self.config.backlog)?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// Returns only when the listener fails. Queued and running sessions
    /// finish before it does.
    pub async fn run_on<L: Accept>(&self, mut listener: L) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.session.upload_dir).await?;

        info!(
            address = %listener.local_addr()?,
            upload_dir = %self.session.upload_dir.display(),
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            overflow = ?self.config.overflow,
            "Server listening"
        );

        let session = Arc::clone(&self.session);
        let pool = WorkerPool::new(
            self.config.workers,
            self.config.queue_capacity,
            move |incoming: Incoming<L::Stream>| {
                let session = Arc::clone(&session);
                let span = info_span!("session", id = incoming.id, peer = %incoming.peer);
                async move { handle_connection(incoming.stream, &session).await }.instrument(span)
            },
        );

        let result = loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Connection => {
                        warn!(error = %e, "Transient accept failure");
                        continue;
                    }
                    AcceptFailure::Resources => {
                        error!(error = %e, "Failed to accept connection, backing off");
                        tokio::time::sleep(RESOURCE_BACKOFF).await;
                        continue;
                    }
                    AcceptFailure::Listener => {
                        error!(error = %e, "Listener failed");
                        break Err(e);
                    }
                },
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            info!(id, peer = %peer, "Accepted connection");

            let incoming = Incoming { id, stream, peer };
            match pool.dispatch(incoming, self.config.overflow).await {
                Ok(()) => {}
                Err(DispatchError::Full(rejected)) => {
                    warn!(id = rejected.id, peer = %rejected.peer, "Queue full, dropping connection");
                }
                Err(DispatchError::Closed(_)) => {
                    break Err(io::Error::new(io::ErrorKind::Other, "worker pool closed"));
                }
            }

            let stats = pool.stats();
            info!(
                active = stats.active,
                queued = stats.queued,
                completed = stats.completed,
                "Pool status"
            );
        };

        info!("Stopping worker pool, running transfers will finish");
        pool.shutdown().await;
        result
    }
}

/// Run one receive session and log its outcome.
async fn handle_connection<S>(stream: S, session: &SessionConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Client handler started");
    match receiver::receive(stream, session, &TracingSink).await {
        Ok(ReceiveOutcome::Complete { path, bytes }) => {
            debug!(path = %path.display(), bytes, "Transfer complete");
        }
        Ok(ReceiveOutcome::ShortTransfer {
            path,
            received,
            declared,
        }) => {
            warn!(path = %path.display(), received, declared, "Short transfer");
        }
        Err(e) if e.is_header_error() => {
            warn!(error = %e, "Rejected frame header");
        }
        Err(e) => {
            error!(error = %e, "Client error");
        }
    }
    debug!("Connection closed");
}

/// Only errors that say the listening socket is broken stop the loop.
fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    if let Some(failure) = e.raw_os_error().and_then(classify_os_error) {
        return failure;
    }

    match e.kind() {
        io::ErrorKind::OutOfMemory => AcceptFailure::Resources,
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => AcceptFailure::Listener,
        _ => AcceptFailure::Connection,
    }
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<AcceptFailure> {
    match code {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => Some(AcceptFailure::Resources),
        libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP => Some(AcceptFailure::Listener),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> Option<AcceptFailure> {
    None
}

/// Create a TCP listener with address reuse and the configured backlog.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
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
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
