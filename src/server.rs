//! TCP server for metrics ingestion.
//!
//! Accepts connections, upgrades them (optionally over TLS), and appends
//! one JSON record per received message to the metrics log.

use crate::append_log::{AppendLog, LogError};
use crate::config::Config;
use crate::record;
use crate::websocket::handshake::{self, HandshakeError};
use crate::websocket::{tls, FrameError, Message, TlsError};
use chrono::Local;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

/// Server setup and runtime errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("connection limiter closed")]
    LimiterClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("TLS accept failed: {0}")]
    TlsAccept(#[source] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("log write failed: {0}")]
    Log(#[from] LogError),

    #[error("log writer task failed: {0}")]
    Join(#[from] JoinError),
}

/// State shared by all connection tasks
struct Shared {
    log: AppendLog,
    tls: Option<TlsAcceptor>,
    max_message_size: usize,
}

/// Server instance
pub struct MonitorServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    connection_limit: Arc<Semaphore>,
}

impl MonitorServer {
    /// Bind to the configured address
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Self::new(listener, config)
    }

    /// Create a server on an already bound listener
    pub fn new(listener: TcpListener, config: &Config) -> Result<Self, ServerError> {
        let log = AppendLog::new(&config.log_path)?;
        let tls = match &config.tls {
            Some(paths) => Some(tls::server_acceptor(&paths.cert, &paths.key)?),
            None => None,
        };

        Ok(MonitorServer {
            listener,
            shared: Arc::new(Shared {
                log,
                tls,
                max_message_size: config.max_message_size,
            }),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Absolute path of the metrics log
    pub fn log_path(&self) -> &Path {
        self.shared.log.path()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), ServerError> {
        info!(address = %self.local_addr()?, tls = self.shared.tls.is_some(), "Server listening");

        loop {
            // Wait for a connection slot
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(|_| ServerError::LimiterClosed)?;

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, &shared).await {
                            match &e {
                                ConnectionError::Frame(_) | ConnectionError::Log(_) => {
                                    warn!(%peer, error = %e, "Connection failed")
                                }
                                _ => debug!(%peer, error = %e, "Connection failed"),
                            }
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Optional TLS, then the upgrade and message loop
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<Shared>,
) -> Result<(), ConnectionError> {
    match &shared.tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::TlsAccept)?;
            handle_client(stream, peer, shared).await
        }
        None => handle_client(stream, peer, shared).await,
    }
}

/// Log every message from one client until it disconnects
async fn handle_client<S>(
    stream: S,
    peer: SocketAddr,
    shared: &Arc<Shared>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = handshake::accept(stream)
        .await?
        .with_max_message_size(shared.max_message_size);
    info!(%peer, "Client connected");

    let mut received = 0u64;
    loop {
        match channel.receive().await? {
            Message::Closed => break,
            Message::Data { payload, .. } => {
                let line = record::record_line(&payload, Local::now());
                let shared = Arc::clone(shared);
                tokio::task::spawn_blocking(move || shared.log.write_line(line)).await??;
                received += 1;
                trace!(%peer, bytes = payload.len(), "Metric logged");
            }
        }
    }

    info!(%peer, messages = received, "Client disconnected");
    Ok(())
}
