//! Bidirectional forwarding after the auth exchange.
//!
//! Two strategies: a raw byte copy when neither side compresses, and a
//! packet-aware copy that re-frames each wire packet and maintains the
//! sequence-reset marks the compressed client leg requires.

use bytes::BytesMut;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::conn::{
    ConnError, PacketConn, PacketReader, PacketWriter, SEQ_RESET_BOTH, SEQ_RESET_ON_READ,
    SEQ_RESET_ON_WRITE,
};
use crate::protocol::{HEADER_EOF, HEADER_ERR, HEADER_OK};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{direction} relay failed: {source}")]
    Direction {
        direction: &'static str,
        #[source]
        source: ConnError,
    },

    #[error("relayer is closed")]
    Shutdown,
}

fn direction(
    name: &'static str,
) -> impl FnOnce(ConnError) -> RelayError {
    move |source| RelayError::Direction {
        direction: name,
        source,
    }
}

/// Wait for the first direction to finish, or for shutdown. Dropping the
/// set aborts whichever direction is still running.
async fn join_first(
    mut directions: JoinSet<Result<(), RelayError>>,
    shutdown: &CancellationToken,
) -> Result<(), RelayError> {
    tokio::select! {
        res = directions.join_next() => match res {
            Some(Ok(result)) => result,
            Some(Err(_)) | None => Ok(()),
        },
        _ = shutdown.cancelled() => Err(RelayError::Shutdown),
    }
}

/// Copy raw bytes in both directions. Only valid while neither side has a
/// compression layer installed.
pub async fn relay_raw(
    client: PacketConn,
    backend: PacketConn,
    shutdown: &CancellationToken,
) -> Result<(), RelayError> {
    client.set_reset_option(SEQ_RESET_BOTH);
    backend.set_reset_option(SEQ_RESET_BOTH);

    let (client_r, client_w) = client.split();
    let (backend_r, backend_w) = backend.split();

    let mut directions = JoinSet::new();
    directions.spawn(async move {
        copy_raw(client_r, backend_w)
            .await
            .map_err(direction("client-to-backend"))
    });
    directions.spawn(async move {
        copy_raw(backend_r, client_w)
            .await
            .map_err(direction("backend-to-client"))
    });

    join_first(directions, shutdown).await
}

async fn copy_raw(mut src: PacketReader, mut dst: PacketWriter) -> Result<(), ConnError> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = src.read_raw(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_raw_all(&buf[..n]).await?;
        dst.flush().await?;
    }
}

/// Copy one wire packet at a time in both directions, restoring sequence
/// numbering across the compression boundary.
pub async fn relay_packets(
    client: PacketConn,
    backend: PacketConn,
    shutdown: &CancellationToken,
) -> Result<(), RelayError> {
    client.set_reset_option(SEQ_RESET_BOTH);
    backend.set_reset_option(SEQ_RESET_BOTH);

    let (client_r, client_w) = client.split();
    let (backend_r, backend_w) = backend.split();

    let mut directions = JoinSet::new();
    directions.spawn(async move {
        copy_inbound(client_r, backend_w)
            .await
            .map_err(direction("client-to-backend"))
    });
    directions.spawn(async move {
        copy_outbound(backend_r, client_w)
            .await
            .map_err(direction("backend-to-client"))
    });

    join_first(directions, shutdown).await
}

async fn copy_inbound(
    mut client: PacketReader,
    mut backend: PacketWriter,
) -> Result<(), ConnError> {
    let mut b = BytesMut::new();
    loop {
        b.clear();
        client.read_partial_packet(&mut b).await?;
        // Each client packet opens a command on the backend side, which
        // expects numbering to restart.
        backend.set_reset_option(SEQ_RESET_ON_WRITE);
        backend.write_packet(&b).await?;
        backend.flush().await?;
    }
}

async fn copy_outbound(
    mut backend: PacketReader,
    mut client: PacketWriter,
) -> Result<(), ConnError> {
    let mut b = BytesMut::new();
    loop {
        b.clear();
        backend.read_partial_packet(&mut b).await?;
        client.set_reset_option(SEQ_RESET_ON_READ);
        client.write_packet(&b).await?;
        // OK/EOF/ERR closes a response; anything else is a mid-result
        // packet and holding the flush batches throughput.
        if b.is_empty() || b[0] == HEADER_OK || b[0] == HEADER_EOF || b[0] == HEADER_ERR {
            client.flush().await?;
        }
    }
}
