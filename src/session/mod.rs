//! Per-connection state machine: greet, route, dial, pass auth through,
//! then relay until either side closes.

pub mod relay;

pub use relay::RelayError;

use std::sync::Arc;

use bytes::BytesMut;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::{ConnError, PacketConn, Transport};
use crate::protocol::{
    capabilities::*, ErrPacket, HandshakeResponse, InitialHandshake, AUTH_INVALID_METHOD,
    AUTH_NATIVE_PASSWORD, DEFAULT_COLLATION_ID, DEFAULT_HANDSHAKE_VERSION, HEADER_ERR, HEADER_OK,
    SERVER_STATUS_AUTOCOMMIT,
};
use crate::router::{split_user_name, BackendDirectory};
use crate::tls::{TlsAcceptor, TlsConnector, TlsError};

/// Version string presented to clients in the greeting.
const SERVER_VERSION: &str = "5.7.25-TiDB";

/// Read-only state shared by every session.
pub struct SessionEnv {
    pub directory: BackendDirectory,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_connector: TlsConnector,
    /// Accept client-requested compression on the client leg.
    pub accept_compression: bool,
    /// Clear the secure-connection capability in the forwarded response.
    pub backend_insecure_transport: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("client requested TLS but the gateway has none configured")]
    TlsNotEnabled,

    #[error("TLS was already negotiated on this connection")]
    TlsAlreadyActive,

    #[error("failed to connect backend {addr}: {source}")]
    BackendConnect {
        addr: String,
        source: std::io::Error,
    },
}

/// One client connection from accept to close.
pub struct Session {
    conn_id: u32,
    env: Arc<SessionEnv>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(conn_id: u32, env: Arc<SessionEnv>, shutdown: CancellationToken) -> Self {
        Self {
            conn_id,
            env,
            shutdown,
        }
    }

    pub async fn run(self, stream: TcpStream) -> Result<(), SessionError> {
        let mut client = PacketConn::new(stream);

        self.send_greeting(&mut client).await?;

        let mut response: HandshakeResponse = client.recv_packet().await?;

        if response.is_ssl_request() {
            eprintln!("DBG: ssl request seen");
            let Some(acceptor) = self.env.tls_acceptor.clone() else {
                self.send_err(&mut client, "TLS is not enabled on this gateway")
                    .await;
                return Err(SessionError::TlsNotEnabled);
            };
            client = self.upgrade_client(client, &acceptor).await?;
            eprintln!("DBG: client tls upgraded");
            response = client.recv_packet().await?;
            eprintln!("DBG: got full response after tls upgrade");
            debug!(conn_id = self.conn_id, "client connection upgraded to TLS");
        }

        let client_compresses =
            self.env.accept_compression && response.capability & CLIENT_COMPRESS != 0;

        // Route on the user name; the remainder after the cluster prefix is
        // forwarded untouched.
        let (cluster_id, real_user) = split_user_name(&response.user_name);
        let (cluster_id, real_user) = (cluster_id.to_string(), real_user.to_string());
        response.user_name = real_user;
        let backend_addr = self.env.directory.resolve(&cluster_id);

        info!(
            conn_id = self.conn_id,
            cluster = %cluster_id,
            backend = %backend_addr,
            "connecting backend"
        );

        eprintln!("DBG: dialing backend {backend_addr}");
        let mut backend = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => {
                eprintln!("DBG: backend dialed");
                PacketConn::new(stream)
            }
            Err(e) => {
                warn!(conn_id = self.conn_id, backend = %backend_addr, error = %e, "backend dial failed");
                self.send_err(&mut client, &format!("failed to connect backend: {e}"))
                    .await;
                return Err(SessionError::BackendConnect {
                    addr: backend_addr,
                    source: e,
                });
            }
        };

        // The backend's own greeting is irrelevant: auth is end-to-end
        // between client and backend, not negotiated here.
        if let Err(e) = backend.recv_packet::<InitialHandshake>().await {
            self.send_err(&mut client, &e.to_string()).await;
            return Err(e.into());
        }

        // The proxy-backend leg never compresses, even when the client leg
        // does.
        response.capability &= !CLIENT_COMPRESS;
        if self.env.backend_insecure_transport {
            response.capability &= !CLIENT_SECURE_CONNECTION;
        }
        // Force an AuthSwitchRequest out of the backend so the auth
        // dialogue becomes a uniform request/reply stream the relay can
        // copy blindly.
        response.capability |= CLIENT_PLUGIN_AUTH;
        response.auth_plugin = AUTH_INVALID_METHOD.to_string();

        eprintln!("DBG: sending forwarded response to backend (plain)");
        if let Err(e) = backend.send_packet(&response).await {
            self.send_err(&mut client, &e.to_string()).await;
            return Err(e.into());
        }
        eprintln!("DBG: forwarded response sent plain");

        if response.capability & CLIENT_SSL != 0 {
            eprintln!("DBG: upgrading backend to tls");
            backend = match self.upgrade_backend(backend, &backend_addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("DBG: backend tls upgrade failed: {e}");
                    self.send_err(&mut client, &e.to_string()).await;
                    return Err(e);
                }
            };
            eprintln!("DBG: backend tls upgraded");
            // Repeat the response on the now-encrypted stream; the
            // plaintext copy only acted as the SSL request.
            if let Err(e) = backend.send_packet(&response).await {
                self.send_err(&mut client, &e.to_string()).await;
                return Err(e.into());
            }
            debug!(conn_id = self.conn_id, "backend connection upgraded to TLS");
        }

        if let Err(e) = exchange_auth(&mut client, &mut backend).await {
            warn!(conn_id = self.conn_id, error = %e, "auth exchange failed");
            return Err(e.into());
        }

        info!(
            conn_id = self.conn_id,
            compressed = client_compresses,
            "authenticated, relaying"
        );

        let relayed = if client_compresses {
            client = client.enable_compression();
            relay::relay_packets(client, backend, &self.shutdown).await
        } else {
            relay::relay_raw(client, backend, &self.shutdown).await
        };
        match relayed {
            Ok(()) => info!(conn_id = self.conn_id, "connection closed"),
            Err(RelayError::Shutdown) => {
                info!(conn_id = self.conn_id, "relay stopped for shutdown")
            }
            Err(e) => debug!(conn_id = self.conn_id, reason = %e, "connection closed"),
        }
        Ok(())
    }

    async fn send_greeting(&self, client: &mut PacketConn) -> Result<(), ConnError> {
        let mut capability = DEFAULT_CAPABILITIES;
        if self.env.tls_acceptor.is_none() {
            capability &= !CLIENT_SSL;
        }
        if !self.env.accept_compression {
            capability &= !CLIENT_COMPRESS;
        }

        let mut auth_plugin_data = vec![0u8; 20];
        rand::thread_rng().fill_bytes(&mut auth_plugin_data);

        let greeting = InitialHandshake {
            protocol_version: DEFAULT_HANDSHAKE_VERSION,
            server_version: SERVER_VERSION.to_string(),
            connection_id: self.conn_id,
            auth_plugin_data,
            capability,
            character_set: DEFAULT_COLLATION_ID,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
        };
        client.send_packet(&greeting).await
    }

    async fn upgrade_client(
        &self,
        client: PacketConn,
        acceptor: &TlsAcceptor,
    ) -> Result<PacketConn, SessionError> {
        eprintln!("DBG: upgrade_client: into_transport");
        let (transport, sequence) = client.into_transport().await?;
        eprintln!("DBG: upgrade_client: into_tcp");
        let tcp = transport
            .into_tcp()
            .map_err(|_| SessionError::TlsAlreadyActive)?;
        eprintln!("DBG: upgrade_client: accepting tls");
        let tls = acceptor.accept(tcp).await?;
        eprintln!("DBG: upgrade_client: accepted tls");
        Ok(PacketConn::resume(Transport::server_tls(tls), sequence))
    }

    async fn upgrade_backend(
        &self,
        backend: PacketConn,
        backend_addr: &str,
    ) -> Result<PacketConn, SessionError> {
        let host = backend_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(backend_addr);
        let (transport, sequence) = backend.into_transport().await?;
        let tcp = transport
            .into_tcp()
            .map_err(|_| SessionError::TlsAlreadyActive)?;
        let tls = self.env.tls_connector.connect(tcp, host).await?;
        Ok(PacketConn::resume(Transport::client_tls(tls), sequence))
    }

    /// Best-effort ERR toward the client; the session is ending either way.
    async fn send_err(&self, client: &mut PacketConn, message: &str) {
        let err = ErrPacket::unknown(message);
        if let Err(e) = client.send_packet(&err).await {
            debug!(conn_id = self.conn_id, error = %e, "failed to send error packet");
        }
    }
}

/// Shuttle auth packets until the backend settles the dialogue with OK or
/// ERR. The loop shape survives arbitrary-length AuthSwitch dialogues,
/// public-key fetches included.
async fn exchange_auth(
    client: &mut PacketConn,
    backend: &mut PacketConn,
) -> Result<(), ConnError> {
    loop {
        let reply = copy_packet(backend, client).await?;
        if !reply.is_empty() && (reply[0] == HEADER_OK || reply[0] == HEADER_ERR) {
            return Ok(());
        }
        copy_packet(client, backend).await?;
    }
}

async fn copy_packet(src: &mut PacketConn, dst: &mut PacketConn) -> Result<BytesMut, ConnError> {
    let mut b = BytesMut::new();
    src.read_packet(&mut b).await?;
    dst.write_packet(&b).await?;
    dst.flush().await?;
    Ok(b)
}
