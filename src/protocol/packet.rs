use super::buffer::WireBuf;
use super::DecodeError;

/// First payload byte of an OK packet.
pub const HEADER_OK: u8 = 0x00;
/// First payload byte of an EOF packet.
pub const HEADER_EOF: u8 = 0xFE;
/// First payload byte of an ERR packet.
pub const HEADER_ERR: u8 = 0xFF;

/// SERVER_STATUS_AUTOCOMMIT.
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// utf8_general_ci, the collation advertised in the greeting.
pub const DEFAULT_COLLATION_ID: u8 = 0x21;

/// Protocol version advertised in the greeting.
pub const DEFAULT_HANDSHAKE_VERSION: u8 = 10;

/// Auth plugin advertised to clients.
pub const AUTH_NATIVE_PASSWORD: &str = "mysql_native_password";

/// Auth plugin name deliberately unknown to any backend. Forcing it into the
/// forwarded handshake response makes the backend open with an
/// AuthSwitchRequest, so the whole auth dialogue becomes a uniform
/// request/reply stream the relay can copy blindly.
pub const AUTH_INVALID_METHOD: &str = "invalid_method";

/// MySQL capability flags exchanged during the handshake.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities the gateway offers in its greeting. SSL and COMPRESS are
    /// stripped by the session when TLS material or `--compress` is absent.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_COMPRESS
        | CLIENT_SSL
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// A packet payload the gateway can produce.
pub trait EncodePacket {
    fn encode(&self, b: &mut WireBuf);
}

/// A packet payload the gateway can consume.
pub trait DecodePacket: Sized {
    fn decode(b: &mut WireBuf) -> Result<Self, DecodeError>;
}
