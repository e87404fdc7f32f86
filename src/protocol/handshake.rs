use std::collections::HashMap;

use bytes::Bytes;

use super::buffer::WireBuf;
use super::packet::{capabilities::*, DecodePacket, EncodePacket, HEADER_ERR};
use super::DecodeError;

/// Error code sent when the gateway itself has to reject a connection.
pub const ERR_CODE_UNKNOWN: u16 = 1105;
/// SQL state paired with [`ERR_CODE_UNKNOWN`].
pub const UNKNOWN_SQL_STATE: &str = "HY000";

/// Initial handshake packet, server to client.
///
/// Layout follows Protocol::HandshakeV10; decoding also accepts the ancient
/// V9 form and the short V10 form that ends after the low capability word.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Full scramble, at least 20 bytes; split 8 + rest on the wire.
    pub auth_plugin_data: Vec<u8>,
    pub capability: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl EncodePacket for InitialHandshake {
    fn encode(&self, b: &mut WireBuf) {
        b.put_u8(self.protocol_version);
        b.put_str_null(&self.server_version);
        b.put_u32_le(self.connection_id);
        b.put_bytes(&self.auth_plugin_data[..8]);
        // filler
        b.put_u8(0x00);
        b.put_u16_le((self.capability & 0xFFFF) as u16);
        b.put_u8(self.character_set);
        b.put_u16_le(self.status_flags);
        b.put_u16_le((self.capability >> 16) as u16);
        if self.capability & CLIENT_PLUGIN_AUTH != 0 {
            b.put_u8(self.auth_plugin_data.len() as u8 + 1);
        } else {
            b.put_u8(0x00);
        }
        b.put_zeros(10);
        if self.capability & CLIENT_SECURE_CONNECTION != 0 {
            // part 2 is NUL-padded to 13 bytes
            let part2 = &self.auth_plugin_data[8..];
            b.put_bytes(part2);
            if part2.len() < 13 {
                b.put_zeros(13 - part2.len());
            }
        }
        if self.capability & CLIENT_PLUGIN_AUTH != 0 {
            b.put_str_null(&self.auth_plugin_name);
        }
    }
}

impl DecodePacket for InitialHandshake {
    fn decode(b: &mut WireBuf) -> Result<Self, DecodeError> {
        let mut hs = InitialHandshake {
            protocol_version: b.get_u8()?,
            ..Default::default()
        };
        if hs.protocol_version != 10 && hs.protocol_version != 9 {
            return Err(DecodeError::UnsupportedHandshakeVersion(
                hs.protocol_version,
            ));
        }

        hs.server_version = b.get_str_null()?;
        hs.connection_id = b.get_u32_le()?;

        if hs.protocol_version == 9 {
            // V9 carries only a NUL-terminated scramble.
            hs.auth_plugin_data = b.get_str_null()?.into_bytes();
            return Ok(hs);
        }

        hs.auth_plugin_data = b.get_bytes(8)?.to_vec();
        b.skip(1)?; // filler
        hs.capability = b.get_u16_le()? as u32;

        if b.is_empty() {
            return Ok(hs);
        }

        hs.character_set = b.get_u8()?;
        hs.status_flags = b.get_u16_le()?;
        hs.capability |= (b.get_u16_le()? as u32) << 16;
        let auth_data_len = b.get_u8()?;
        b.skip(10)?; // reserved

        if hs.capability & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = (auth_data_len as usize).saturating_sub(8 + 1);
            let part2 = b.get_bytes(part2_len)?;
            if part2_len < 13 {
                b.skip(13 - part2_len)?;
            }
            hs.auth_plugin_data.extend_from_slice(&part2);
        }

        if hs.capability & CLIENT_PLUGIN_AUTH != 0 {
            hs.auth_plugin_name = b.get_str_null()?;
        }

        Ok(hs)
    }
}

/// Handshake response, client to server.
///
/// The same type decodes the SSLRequest variant: a response truncated right
/// after the reserved filler, sent before a TLS upgrade. Truncation leaves
/// `user_name`, `auth` and the trailing optional fields empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub user_name: String,
    pub db_name: String,
    pub auth: Bytes,
    pub auth_plugin: String,
    pub attrs: HashMap<String, String>,
}

impl HandshakeResponse {
    /// An SSLRequest is a response cut short before the user name.
    pub fn is_ssl_request(&self) -> bool {
        self.capability & CLIENT_SSL != 0 && self.user_name.is_empty()
    }
}

impl EncodePacket for HandshakeResponse {
    fn encode(&self, b: &mut WireBuf) {
        b.put_u32_le(self.capability);

        if self.capability & CLIENT_PROTOCOL_41 == 0 {
            // Pre-4.1 layout (HandshakeResponse320).
            b.put_u24_le(self.max_packet_size);
            b.put_str_null(&self.user_name);
            b.put_bytes(&self.auth);
            if self.capability & CLIENT_CONNECT_WITH_DB != 0 {
                b.put_u8(0x00);
                b.put_bytes(self.db_name.as_bytes());
                b.put_u8(0x00);
            }
            return;
        }

        b.put_u32_le(self.max_packet_size);
        b.put_u8(self.character_set);
        b.put_zeros(23);
        b.put_str_null(&self.user_name);

        if self.capability & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            b.put_lenenc_bytes(&self.auth);
        } else if self.capability & CLIENT_SECURE_CONNECTION != 0 {
            b.put_u8(self.auth.len() as u8);
            b.put_bytes(&self.auth);
        } else {
            b.put_bytes(&self.auth);
            b.put_u8(0x00);
        }

        if self.capability & CLIENT_CONNECT_WITH_DB != 0 {
            b.put_str_null(&self.db_name);
        }
        if self.capability & CLIENT_PLUGIN_AUTH != 0 {
            b.put_str_null(&self.auth_plugin);
        }
        if self.capability & CLIENT_CONNECT_ATTRS != 0 {
            let mut ab = WireBuf::new();
            for (k, v) in &self.attrs {
                ab.put_lenenc_str(k);
                ab.put_lenenc_str(v);
            }
            b.put_lenenc_int(ab.remaining() as u64);
            b.put_bytes(ab.as_slice());
        }
    }
}

impl DecodePacket for HandshakeResponse {
    fn decode(b: &mut WireBuf) -> Result<Self, DecodeError> {
        let mut res = HandshakeResponse {
            capability: b.get_u32_le()?,
            ..Default::default()
        };

        if res.capability & CLIENT_PROTOCOL_41 == 0 {
            res.max_packet_size = b.get_u24_le()?;
            if b.is_empty() {
                // SSLRequest320
                return Ok(res);
            }
            res.user_name = b.get_str_null()?;
            if res.capability & CLIENT_CONNECT_WITH_DB != 0 {
                res.auth = Bytes::from(b.get_str_null()?.into_bytes());
                res.db_name = b.get_str_null()?;
            } else {
                res.auth = b.take_rest();
            }
            return Ok(res);
        }

        res.max_packet_size = b.get_u32_le()?;
        res.character_set = b.get_u8()?;
        b.skip(23)?;

        if b.is_empty() {
            // SSLRequest: everything after the filler is absent.
            return Ok(res);
        }

        res.user_name = b.get_str_null()?;

        if res.capability & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            res.auth = b.get_lenenc_bytes()?;
        } else if res.capability & CLIENT_SECURE_CONNECTION != 0 {
            let len = b.get_u8()? as usize;
            res.auth = b.get_bytes(len)?;
        } else {
            res.auth = Bytes::from(b.get_str_null()?.into_bytes());
        }

        if res.capability & CLIENT_CONNECT_WITH_DB != 0 {
            res.db_name = b.get_str_null()?;
        }
        if res.capability & CLIENT_PLUGIN_AUTH != 0 {
            res.auth_plugin = b.get_str_null()?;
        }
        if res.capability & CLIENT_CONNECT_ATTRS != 0 {
            let len = b.get_lenenc_int()? as usize;
            let mut ab = WireBuf::from_bytes(&b.get_bytes(len)?[..]);
            while !ab.is_empty() {
                let k = ab.get_lenenc_str()?;
                let v = ab.get_lenenc_str()?;
                res.attrs.insert(k, v);
            }
        }

        Ok(res)
    }
}

/// ERR packet. The gateway only produces these, never parses them.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
    pub capability: u32,
}

impl ErrPacket {
    /// An ERR with the generic "unknown" code and state wrapping `message`.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            code: ERR_CODE_UNKNOWN,
            sql_state: UNKNOWN_SQL_STATE.to_string(),
            message: message.into(),
            capability: DEFAULT_CAPABILITIES,
        }
    }
}

impl EncodePacket for ErrPacket {
    fn encode(&self, b: &mut WireBuf) {
        b.put_u8(HEADER_ERR);
        b.put_u16_le(self.code);
        if self.capability & CLIENT_PROTOCOL_41 != 0 {
            b.put_u8(b'#');
            b.put_bytes(self.sql_state.as_bytes());
        }
        b.put_bytes(self.message.as_bytes());
    }
}
