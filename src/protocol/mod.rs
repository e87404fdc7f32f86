//! MySQL connection-phase wire types: primitive codec, capability flags and
//! the handshake packets the gateway inspects or rewrites.

pub mod buffer;
pub mod handshake;
pub mod packet;

pub use buffer::WireBuf;
pub use handshake::{ErrPacket, HandshakeResponse, InitialHandshake};
pub use packet::{
    capabilities, DecodePacket, EncodePacket, AUTH_INVALID_METHOD, AUTH_NATIVE_PASSWORD,
    DEFAULT_COLLATION_ID, DEFAULT_HANDSHAKE_VERSION, HEADER_EOF, HEADER_ERR, HEADER_OK,
    SERVER_STATUS_AUTOCOMMIT,
};

/// Failure while decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of packet")]
    UnexpectedEof,

    #[error("invalid length-encoded integer prefix {0:#04x}")]
    InvalidLenenc(u8),

    #[error("unsupported handshake protocol version {0}")]
    UnsupportedHandshakeVersion(u8),
}
