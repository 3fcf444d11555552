//! What the protocol layer needs from the SQL engine.
//!
//! A [`QueryExecutor`] opens one [`Session`] per authenticated connection.
//! Sessions parse and run statements and hand back [`ResultSet`]s that the
//! connection streams to the client. Credentials are checked by a separate
//! [`PrivilegeManager`].

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::error::{FrontendError, Result, SqlError};
use crate::expression::charset::CollationContext;
use crate::mysql::auth::AuthPlugin;
use crate::mysql::packet::ColumnDefinition;
use crate::mysql::tls::TlsInfo;

/// A calendar date with an optional time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTimeValue {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

/// A signed duration as MySQL TIME represents it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeValue {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// Exact decimal in its textual form.
    Decimal(String),
    Bytes(Vec<u8>),
    Date(DateTimeValue),
    DateTime(DateTimeValue),
    Time(TimeValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The text-protocol rendering. `None` for NULL.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bytes(b) => Some(b.clone()),
            other => Some(other.to_string().into_bytes()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(v) => f.write_str(v),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Date(d) => write!(f, "{:04}-{:02}-{:02}", d.year, d.month, d.day),
            Value::DateTime(d) => {
                write!(
                    f,
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    d.year, d.month, d.day, d.hour, d.minute, d.second
                )?;
                if d.micros > 0 {
                    write!(f, ".{:06}", d.micros)?;
                }
                Ok(())
            }
            Value::Time(t) => {
                let hours = t.days * 24 + t.hours as u32;
                write!(
                    f,
                    "{}{:02}:{:02}:{:02}",
                    if t.negative { "-" } else { "" },
                    hours,
                    t.minutes,
                    t.seconds
                )?;
                if t.micros > 0 {
                    write!(f, ".{:06}", t.micros)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

pub type Row = Vec<Value>;

/// A batch of rows filled by [`ResultSet::next`].
#[derive(Debug, Clone)]
pub struct Chunk {
    rows: Vec<Row>,
    capacity: usize,
}

pub const DEFAULT_CHUNK_SIZE: usize = 32;

impl Default for Chunk {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Chunk {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// The statement shapes the protocol layer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Use(String),
    Set,
    Show,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Flush,
    Shutdown,
    Other,
}

/// One parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub kind: StatementKind,
}

impl Statement {
    pub fn new(sql: impl Into<String>, kind: StatementKind) -> Self {
        Self {
            sql: sql.into(),
            kind,
        }
    }

    pub fn is_use(&self) -> bool {
        matches!(self.kind, StatementKind::Use(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningLevel {
    Note,
    Warning,
    Error,
}

impl WarningLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningLevel::Note => "Note",
            WarningLevel::Warning => "Warning",
            WarningLevel::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: WarningLevel,
    pub code: u16,
    pub message: String,
}

impl Warning {
    pub fn new(level: WarningLevel, err: &FrontendError) -> Self {
        let SqlError { code, message, .. } = err.to_sql_error();
        Self {
            level,
            code,
            message,
        }
    }
}

/// `user@host` as the client identified itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    pub user: String,
    pub host: String,
}

impl UserIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// Skips init_connect and may connect past max_connections.
    ConnectionAdmin,
    Super,
    Shutdown,
    Reload,
}

/// Everything a new session learns from the handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub conn_id: u64,
    pub identity: UserIdentity,
    pub capability: u32,
    pub collation: CollationContext,
    pub attrs: HashMap<String, String>,
    pub tls: Option<TlsInfo>,
    pub unix_socket: bool,
}

/// The non-row outcome of a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkStatus {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub info: String,
}

pub enum ExecResult {
    Rows(Box<dyn ResultSet>),
    Ok(OkStatus),
}

impl fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecResult::Rows(rs) => write!(f, "Rows({} columns)", rs.columns().len()),
            ExecResult::Ok(status) => write!(f, "Ok({:?})", status),
        }
    }
}

/// Metadata of a prepared statement, as returned to the client.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub sql: String,
    pub params: Vec<ColumnDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

/// A stream of rows.
///
/// `columns` may only be relied on after the first successful `next`.
#[async_trait]
pub trait ResultSet: Send {
    fn columns(&self) -> &[ColumnDefinition];

    /// Fill `chunk` with up to `chunk.capacity()` rows. An empty chunk means
    /// the set is exhausted.
    async fn next(&mut self, chunk: &mut Chunk) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Batch-reads the keys of point statements ahead of a multi-statement run.
#[async_trait]
pub trait PointPrefetcher: Send {
    /// Returns the number of keys fetched.
    async fn prefetch_point_keys(&mut self, stmts: &[Statement]) -> Result<usize>;
}

/// One client's view of the engine.
#[async_trait]
pub trait Session: Send {
    fn conn_id(&self) -> u64;

    fn identity(&self) -> &UserIdentity;

    fn current_db(&self) -> Option<String>;

    /// SERVER_STATUS_* bits for OK and EOF packets.
    fn status(&self) -> u16;

    fn in_transaction(&self) -> bool {
        self.status() & crate::mysql::protocol::SERVER_STATUS_IN_TRANS != 0
    }

    fn collation(&self) -> CollationContext;

    fn session_var(&self, name: &str) -> Option<String>;

    fn set_session_var(&mut self, name: &str, value: &str) -> Result<()>;

    fn set_client_capability(&mut self, capability: u32);

    fn warnings(&self) -> &[Warning];

    fn warning_count(&self) -> u16 {
        u16::try_from(self.warnings().len()).unwrap_or(u16::MAX)
    }

    fn append_warning(&mut self, warning: Warning);

    fn clear_warnings(&mut self);

    async fn parse(&mut self, sql: &str) -> Result<Vec<Statement>>;

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult>;

    async fn field_list(&mut self, table: &str) -> Result<Vec<ColumnDefinition>>;

    async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement>;

    async fn execute_prepared(&mut self, stmt_id: u32, params: &[Value]) -> Result<ExecResult>;

    fn close_prepared(&mut self, stmt_id: u32);

    /// Whether an engine-unavailable failure may be retried on the fallback engine.
    fn allow_engine_fallback(&self) -> bool {
        false
    }

    fn set_engine_fallback(&mut self, _active: bool) {}

    /// The point-key prefetcher, when the engine has one.
    fn point_prefetcher(&mut self) -> Option<&mut dyn PointPrefetcher> {
        None
    }

    async fn close(&mut self) -> Result<()>;
}

/// Capability probe for [`Session::point_prefetcher`].
pub fn point_prefetcher(session: &mut dyn Session) -> Result<&mut dyn PointPrefetcher> {
    session
        .point_prefetcher()
        .ok_or(FrontendError::Unsupported("point key prefetch"))
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn open_session(&self, info: SessionInfo) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait PrivilegeManager: Send + Sync {
    /// The plugin configured for the account. Empty means none configured.
    async fn auth_plugin_for_user(&self, identity: &UserIdentity) -> Result<String>;

    /// Check the auth response the client sent for `plugin` against `salt`.
    /// For auth_socket the response is the OS user name of the peer.
    async fn authenticate(
        &self,
        identity: &UserIdentity,
        plugin: AuthPlugin,
        auth: &[u8],
        salt: &[u8],
    ) -> Result<bool>;

    fn has_privilege(&self, identity: &UserIdentity, privilege: Privilege) -> bool;
}
