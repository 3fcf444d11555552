use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::warn;

use super::protocol::*;
use crate::error::{FrontendError, Result, SqlError};
use crate::expression::charset::{UTF8MB4_BIN_ID, UTF8MB4_GENERAL_CI_ID};

/// Initial handshake (protocol version 10) sent by the server.
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub server_version: String,
    pub connection_id: u32,
    pub salt: [u8; 20],
    pub capability_flags: u32,
    pub collation: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u8(PROTOCOL_VERSION);
        write_null_terminated_str(&mut buf, &self.server_version);
        buf.put_u32_le(self.connection_id);

        // auth-plugin-data part 1 and filler
        buf.put_slice(&self.salt[0..8]);
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xffff) as u16);
        buf.put_u8(if self.collation == 0 {
            UTF8MB4_BIN_ID
        } else {
            self.collation
        });
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xffff) as u16);

        buf.put_u8(self.salt.len() as u8 + 1);
        buf.put_bytes(0, 10);

        // auth-plugin-data part 2
        buf.put_slice(&self.salt[8..]);
        buf.put_u8(0);

        write_null_terminated_str(&mut buf, &self.auth_plugin_name);

        buf.freeze()
    }
}

/// SSLRequest / HandshakeResponse41 / HandshakeResponse320 from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: String,
    pub db: String,
    pub auth: Vec<u8>,
    pub auth_plugin: String,
    pub attrs: HashMap<String, String>,
    /// Parsed from the pre-4.1 layout.
    pub legacy: bool,
}

impl HandshakeResponse {
    /// Parse the fixed part shared by SSLRequest and the full response.
    /// Returns the response so far and the offset where the body starts.
    pub fn parse_header(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(FrontendError::malformed("handshake response too short"));
        }
        let low = u16::from_le_bytes([data[0], data[1]]) as u32;
        if low & CLIENT_PROTOCOL_41 != 0 {
            Self::parse_header_41(data)
        } else {
            Self::parse_header_320(data)
        }
    }

    /// Re-parse the header after a TLS upgrade, keeping the layout chosen
    /// by the first packet.
    pub fn reparse_header(&self, data: &[u8]) -> Result<(Self, usize)> {
        if self.legacy {
            Self::parse_header_320(data)
        } else {
            Self::parse_header_41(data)
        }
    }

    fn parse_header_41(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = PayloadReader::new(data);
        if r.remaining() < 4 + 4 + 1 + 23 {
            return Err(FrontendError::malformed("handshake response too short"));
        }
        let capability = r.u32_le()?;
        let max_packet_size = r.u32_le()?;
        let collation = r.u8()?;
        r.skip(23)?;
        Ok((
            Self {
                capability,
                max_packet_size,
                collation,
                ..Default::default()
            },
            r.position(),
        ))
    }

    fn parse_header_320(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = PayloadReader::new(data);
        if r.remaining() < 2 + 3 {
            return Err(FrontendError::malformed("handshake response too short"));
        }
        let capability = r.u16_le()? as u32 | CLIENT_PROTOCOL_41;
        let max_packet_size = r.u24_le()?;
        Ok((
            Self {
                capability,
                max_packet_size,
                collation: UTF8MB4_GENERAL_CI_ID,
                legacy: true,
                ..Default::default()
            },
            r.position(),
        ))
    }

    pub fn parse_body(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let body = data
            .get(offset..)
            .ok_or_else(|| FrontendError::malformed("handshake body offset out of range"))?;
        if self.legacy {
            self.parse_body_320(body)
        } else {
            self.parse_body_41(body)
        }
    }

    fn parse_body_320(&mut self, body: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(body);
        self.user = lossy_string(r.null_terminated()?);
        if self.capability & CLIENT_CONNECT_WITH_DB != 0 {
            if !r.is_empty() {
                self.db = lossy_string(r.null_terminated()?);
            }
            if !r.is_empty() {
                self.auth = r.null_terminated()?.to_vec();
            }
        } else {
            self.auth = r.null_terminated()?.to_vec();
        }
        Ok(())
    }

    fn parse_body_41(&mut self, body: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(body);
        self.user = lossy_string(r.null_terminated()?);

        if self.capability & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            // Some clients set this bit even when the server never offered it;
            // a leading 0x01 means "no auth data".
            if r.peek_u8() == Some(0x01) {
                r.skip(2)?;
            } else if let Some(len) = r.lenenc_int()? {
                let len = usize::try_from(len)
                    .map_err(|_| FrontendError::malformed("auth data length"))?;
                self.auth = r.bytes(len)?.to_vec();
            }
        } else if self.capability & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            self.auth = r.bytes(len)?.to_vec();
        } else {
            self.auth = r.null_terminated()?.to_vec();
        }

        if self.capability & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            self.db = lossy_string(r.null_terminated()?);
        }

        if self.capability & CLIENT_PLUGIN_AUTH != 0 {
            // A missing terminator leaves the plugin unset and consumes nothing.
            let rest = r.clone().rest();
            if let Some(end) = rest.iter().position(|&b| b == 0) {
                self.auth_plugin = lossy_string(&rest[..end]);
                r.skip(end + 1)?;
            }
        }

        if self.capability & CLIENT_CONNECT_ATTRS != 0 && !r.is_empty() {
            if let Some(len) = r.lenenc_int()? {
                let len = usize::try_from(len)
                    .map_err(|_| FrontendError::malformed("attribute block length"))?;
                let block = r.bytes(len)?;
                match parse_attrs(block) {
                    Ok(attrs) => self.attrs = attrs,
                    Err(e) => warn!("parse attrs failed: {}", e),
                }
            }
        }
        Ok(())
    }
}

/// Connection attributes: a run of length-encoded key/value pairs.
pub fn parse_attrs(data: &[u8]) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    let mut r = PayloadReader::new(data);
    while !r.is_empty() {
        let key = lossy_string(r.lenenc_bytes()?);
        let value = lossy_string(r.lenenc_bytes()?);
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// OK packet. `info` is written length-encoded, as clients actually expect.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn encode(&self, capability: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.info.len());
        buf.put_u8(OK_HEADER);
        write_lenenc_int(&mut buf, self.affected_rows);
        write_lenenc_int(&mut buf, self.last_insert_id);
        if capability & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        if !self.info.is_empty() {
            write_lenenc_str(&mut buf, &self.info);
        }
        buf.freeze()
    }
}

pub struct ErrPacket<'a> {
    pub error: &'a SqlError,
}

impl<'a> ErrPacket<'a> {
    pub fn new(error: &'a SqlError) -> Self {
        Self { error }
    }

    pub fn encode(&self, capability: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.error.message.len());
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error.code);
        if capability & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.put_slice(self.error.state.as_bytes());
        }
        buf.put_slice(self.error.message.as_bytes());
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn encode(&self, capability: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(EOF_HEADER);
        if capability & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.warnings);
            buf.put_u16_le(self.status_flags);
        }
        buf.freeze()
    }
}

/// `0xFE` + plugin name + NUL + salt + NUL.
pub fn auth_switch_request(plugin: &str, salt: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(plugin.len() + salt.len() + 3);
    buf.put_u8(AUTH_SWITCH_HEADER);
    write_null_terminated_str(&mut buf, plugin);
    buf.put_slice(salt);
    buf.put_u8(0);
    buf.freeze()
}

/// Column Definition (protocol 41).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
    /// Only written for COM_FIELD_LIST responses.
    pub default_value: Option<Vec<u8>>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        let (character_set, flags) = match column_type {
            ColumnType::VarChar
            | ColumnType::VarString
            | ColumnType::String
            | ColumnType::Json
            | ColumnType::Enum
            | ColumnType::Set => (UTF8MB4_BIN_ID as u16, 0),
            _ => (63, BINARY_FLAG),
        };
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            character_set,
            column_length: default_column_length(column_type),
            column_type,
            flags,
            decimals: 0,
            default_value: None,
        }
    }

    pub fn with_table(mut self, schema: &str, table: &str) -> Self {
        self.schema = schema.to_string();
        self.table = table.to_string();
        self.org_table = table.to_string();
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.name.len() * 2);

        write_lenenc_str(&mut buf, "def");
        write_lenenc_str(&mut buf, &self.schema);
        write_lenenc_str(&mut buf, &self.table);
        write_lenenc_str(&mut buf, &self.org_table);
        write_lenenc_str(&mut buf, &self.name);
        write_lenenc_str(&mut buf, &self.org_name);

        // Length of fixed-length fields
        write_lenenc_int(&mut buf, 0x0c);

        buf.put_u16_le(self.character_set);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type as u8);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);

        // Filler
        buf.put_u16(0);

        if let Some(default) = &self.default_value {
            write_lenenc_bytes(&mut buf, default);
        }

        buf.freeze()
    }
}

fn default_column_length(column_type: ColumnType) -> u32 {
    match column_type {
        ColumnType::Tiny => 4,
        ColumnType::Short | ColumnType::Year => 6,
        ColumnType::Int24 => 9,
        ColumnType::Long => 11,
        ColumnType::LongLong => 20,
        ColumnType::Float => 12,
        ColumnType::Double => 22,
        ColumnType::Date => 10,
        ColumnType::Time => 10,
        ColumnType::DateTime | ColumnType::Timestamp => 19,
        ColumnType::NewDecimal | ColumnType::Decimal => 65,
        _ => 1024,
    }
}

/// COM_STMT_PREPARE_OK header.
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(OK_HEADER);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(self.num_columns);
        buf.put_u16_le(self.num_params);
        buf.put_u8(0);
        buf.put_u16_le(self.warnings);
        buf.freeze()
    }
}
