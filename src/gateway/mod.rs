//! The process-wide gateway: bound listener, accept loop, session tracking
//! and graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::router::BackendDirectory;
use crate::session::{Session, SessionEnv};
use crate::tls::{TlsAcceptor, TlsConnector, TlsError};

/// How long shutdown waits for live sessions before aborting them.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to listen: {0}")]
    Listen(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Listener plus the read-only state every session shares.
pub struct Gateway {
    listener: TcpListener,
    env: Arc<SessionEnv>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU32,
}

impl Gateway {
    /// Load TLS material, bind the listener and assemble the shared state.
    pub async fn bind(config: GatewayConfig) -> Result<Self, GatewayError> {
        let tls_acceptor = TlsAcceptor::from_settings(&config.tls)?;
        let tls_connector = TlsConnector::new_insecure()?;
        let listener = TcpListener::bind(&config.addr).await?;

        Ok(Self {
            listener,
            env: Arc::new(SessionEnv {
                directory: BackendDirectory::new(config.backends),
                tls_acceptor,
                tls_connector,
                accept_compression: config.compress,
                backend_insecure_transport: config.backend_insecure_transport,
            }),
            shutdown: CancellationToken::new(),
            next_conn_id: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every live relay when
    /// cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires, then drain live
    /// sessions.
    pub async fn serve(self) {
        let mut sessions: JoinSet<()> = JoinSet::new();

        info!("gateway accepting connections");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, closing listener");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                    info!(conn_id = conn_id, peer = %peer, "accepted connection");

                    let session = Session::new(conn_id, self.env.clone(), self.shutdown.clone());
                    sessions.spawn(async move {
                        match session.run(stream).await {
                            Ok(()) => info!(conn_id = conn_id, "session ended"),
                            Err(e) => warn!(conn_id = conn_id, error = %e, "session ended with error"),
                        }
                    });
                }
            }
        }

        drop(self.listener);
        drain_sessions(sessions).await;
        info!("gateway shutdown complete");
    }
}

async fn drain_sessions(mut sessions: JoinSet<()>) {
    if sessions.is_empty() {
        return;
    }

    info!(
        active_sessions = sessions.len(),
        timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
        "waiting for active sessions"
    );
    let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

    while !sessions.is_empty() {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    remaining_sessions = sessions.len(),
                    "graceful shutdown timeout, aborting remaining sessions"
                );
                sessions.abort_all();
                break;
            }

            Some(result) = sessions.join_next() => {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        error!(error = %e, "session task panicked");
                    }
                }
            }
        }
    }
}
