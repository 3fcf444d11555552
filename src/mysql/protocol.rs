use bytes::{BufMut, BytesMut};

use crate::error::{FrontendError, Result};

/// Largest payload a single wire packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

pub const PROTOCOL_VERSION: u8 = 10;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;
pub const AUTH_SWITCH_HEADER: u8 = 0xfe;
pub const NULL_VALUE: u8 = 0xfb;

// caching_sha2_password sub-commands
pub const SHA_COMMAND: u8 = 0x01;
pub const FAST_AUTH_FAIL: u8 = 0x04;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Sleep,
    Quit,
    InitDb,
    Query,
    FieldList,
    CreateDb,
    DropDb,
    Refresh,
    Shutdown,
    Statistics,
    ProcessInfo,
    Connect,
    ProcessKill,
    Debug,
    Ping,
    Time,
    DelayedInsert,
    ChangeUser,
    BinlogDump,
    TableDump,
    ConnectOut,
    RegisterSlave,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    Daemon,
    BinlogDumpGtid,
    ResetConnection,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            b => Command::Unknown(b),
        }
    }
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Sleep => 0x00,
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::CreateDb => 0x05,
            Command::DropDb => 0x06,
            Command::Refresh => 0x07,
            Command::Shutdown => 0x08,
            Command::Statistics => 0x09,
            Command::ProcessInfo => 0x0a,
            Command::Connect => 0x0b,
            Command::ProcessKill => 0x0c,
            Command::Debug => 0x0d,
            Command::Ping => 0x0e,
            Command::Time => 0x0f,
            Command::DelayedInsert => 0x10,
            Command::ChangeUser => 0x11,
            Command::BinlogDump => 0x12,
            Command::TableDump => 0x13,
            Command::ConnectOut => 0x14,
            Command::RegisterSlave => 0x15,
            Command::StmtPrepare => 0x16,
            Command::StmtExecute => 0x17,
            Command::StmtSendLongData => 0x18,
            Command::StmtClose => 0x19,
            Command::StmtReset => 0x1a,
            Command::SetOption => 0x1b,
            Command::StmtFetch => 0x1c,
            Command::Daemon => 0x1d,
            Command::BinlogDumpGtid => 0x1e,
            Command::ResetConnection => 0x1f,
            Command::Unknown(b) => b,
        }
    }
}

// MySQL Capability Flags
pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
pub const CLIENT_FOUND_ROWS: u32 = 0x00000002;
pub const CLIENT_LONG_FLAG: u32 = 0x00000004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
pub const CLIENT_NO_SCHEMA: u32 = 0x00000010;
pub const CLIENT_COMPRESS: u32 = 0x00000020;
pub const CLIENT_ODBC: u32 = 0x00000040;
pub const CLIENT_LOCAL_FILES: u32 = 0x00000080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x00000100;
pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
pub const CLIENT_INTERACTIVE: u32 = 0x00000400;
pub const CLIENT_SSL: u32 = 0x00000800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x00001000;
pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
pub const CLIENT_RESERVED: u32 = 0x00004000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x00010000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x00020000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x00040000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x00100000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x00200000;
pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 0x00400000;
pub const CLIENT_SESSION_TRACK: u32 = 0x00800000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

/// Capabilities advertised in the greeting. CLIENT_SSL is added when TLS is configured.
pub fn server_capabilities(tls_enabled: bool) -> u32 {
    let mut caps = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_FOUND_ROWS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_INTERACTIVE;
    if tls_enabled {
        caps |= CLIENT_SSL;
    }
    caps
}

// Server status flags
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
pub const SERVER_STATUS_NO_BACKSLASH_ESCAPED: u16 = 0x0200;
pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
pub const SERVER_STATUS_WAS_SLOW: u16 = 0x0800;
pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;

// Column definition flags
pub const NOT_NULL_FLAG: u16 = 0x0001;
pub const PRI_KEY_FLAG: u16 = 0x0002;
pub const BINARY_FLAG: u16 = 0x0080;
pub const UNSIGNED_FLAG: u16 = 0x0020;

// COM_STMT_EXECUTE cursor flags
pub const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;
pub const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

// Column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0a => ColumnType::Date,
            0x0b => ColumnType::Time,
            0x0c => ColumnType::DateTime,
            0x0d => ColumnType::Year,
            0x0f => ColumnType::VarChar,
            0x10 => ColumnType::Bit,
            0xf5 => ColumnType::Json,
            0xf6 => ColumnType::NewDecimal,
            0xf7 => ColumnType::Enum,
            0xf8 => ColumnType::Set,
            0xf9 => ColumnType::TinyBlob,
            0xfa => ColumnType::MediumBlob,
            0xfb => ColumnType::LongBlob,
            0xfc => ColumnType::Blob,
            0xfd => ColumnType::VarString,
            0xfe => ColumnType::String,
            0xff => ColumnType::Geometry,
            _ => return None,
        })
    }
}

// Helper functions for length-encoded integers
pub fn write_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xfd);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

pub fn write_lenenc_bytes(buf: &mut BytesMut, b: &[u8]) {
    write_lenenc_int(buf, b.len() as u64);
    buf.put_slice(b);
}

pub fn write_lenenc_str(buf: &mut BytesMut, s: &str) {
    write_lenenc_bytes(buf, s.as_bytes());
}

pub fn write_null_terminated_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Cursor over a received payload. Every read is bounds-checked and a short
/// payload yields `FrontendError::Malformed` instead of a panic.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(FrontendError::malformed(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u24_le(&mut self) -> Result<u32> {
        let b = self.bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Length-encoded integer; `None` is the NULL marker (0xfb).
    pub fn lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.u8()?;
        Ok(match first {
            0xfb => None,
            0xfc => Some(self.u16_le()? as u64),
            0xfd => Some(self.u24_le()? as u64),
            0xfe => Some(self.u64_le()?),
            _ => Some(first as u64),
        })
    }

    pub fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()?.unwrap_or(0);
        let len = usize::try_from(len)
            .map_err(|_| FrontendError::malformed("length-encoded string too long"))?;
        self.bytes(len)
    }

    /// Bytes up to the next NUL; the NUL is consumed. Missing NUL is malformed.
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FrontendError::malformed("missing NUL terminator"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// Bytes up to the next NUL or the end of the payload.
    pub fn null_terminated_or_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

pub fn lossy_string(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}
