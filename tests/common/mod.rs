// Shared helpers for the integration tests: a memory-backed server and a
// minimal MySQL client speaking the wire protocol directly.
#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;

use sqlfe_server::config::{Config, TableConfig, UserConfig};
use sqlfe_server::error::FrontendError;
use sqlfe_server::mysql::auth::scramble_native_password;
use sqlfe_server::mysql::protocol::*;
use sqlfe_server::mysql::{ConnStream, MysqlServer, PacketIo};
use sqlfe_server::query::memory::{MemoryExecutor, StaticPrivilegeManager};
use sqlfe_server::query::{PrivilegeManager, QueryExecutor};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub const ITEM_ROWS: usize = 25;

fn user(name: &str, password: &str, plugin: &str, admin: bool) -> UserConfig {
    UserConfig {
        name: name.to_string(),
        host: "%".to_string(),
        password: password.to_string(),
        plugin: plugin.to_string(),
        connection_admin: admin,
        socket_user: None,
    }
}

/// root (admin, no password), app (native), sha (caching_sha2) and plain
/// (no plugin configured), plus a 25-row `test.items` table.
pub fn test_config() -> Config {
    let rows = (1..=ITEM_ROWS)
        .map(|i| vec![Some(i.to_string()), Some(format!("item-{}", i))])
        .collect();
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        users: vec![
            user("root", "", "mysql_native_password", true),
            user("app", "secret", "mysql_native_password", false),
            user("sha", "sha-pass", "caching_sha2_password", false),
            user("plain", "pw", "", false),
        ],
        tables: vec![TableConfig {
            database: "test".to_string(),
            name: "items".to_string(),
            columns: vec!["id".to_string(), "name".to_string()],
            rows,
        }],
        ..Config::default()
    }
}

pub fn memory_server(config: Config) -> Arc<MysqlServer> {
    let executor = Arc::new(MemoryExecutor::new(&config));
    let privileges = Arc::new(StaticPrivilegeManager::new(&config.users));
    Arc::new(MysqlServer::new(config, executor, privileges).expect("server"))
}

pub fn custom_server(
    config: Config,
    executor: Arc<dyn QueryExecutor>,
) -> Arc<MysqlServer> {
    let privileges: Arc<dyn PrivilegeManager> = Arc::new(StaticPrivilegeManager::new(&config.users));
    Arc::new(MysqlServer::new(config, executor, privileges).expect("server"))
}

pub fn default_capability() -> u32 {
    CLIENT_PROTOCOL_41
        | CLIENT_LONG_PASSWORD
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_RESULTS
        | CLIENT_CONNECT_WITH_DB
}

#[derive(Debug, Clone)]
pub struct Greeting {
    pub server_version: String,
    pub conn_id: u32,
    pub salt: Vec<u8>,
    pub capability: u32,
    pub collation: u8,
    pub auth_plugin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub warnings: u16,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok {
        affected_rows: u64,
        status: u16,
        warnings: u16,
        info: String,
    },
    Err {
        code: u16,
        state: String,
        message: String,
    },
    Rows(Rows),
}

impl Reply {
    pub fn rows(self) -> Rows {
        match self {
            Reply::Rows(rows) => rows,
            other => panic!("expected rows, got {:?}", other),
        }
    }

    pub fn err_code(&self) -> u16 {
        match self {
            Reply::Err { code, .. } => *code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    pub fn assert_ok(&self) {
        assert!(matches!(self, Reply::Ok { .. }), "expected OK, got {:?}", self);
    }

    pub fn status(&self) -> u16 {
        match self {
            Reply::Ok { status, .. } => *status,
            Reply::Rows(rows) => rows.status,
            Reply::Err { .. } => 0,
        }
    }
}

pub struct TestClient<S = DuplexStream> {
    pub io: PacketIo<S>,
    pub greeting: Greeting,
    pub capability: u32,
}

/// Connect to `server` over an in-memory pipe and read the greeting.
pub async fn connect(server: &MysqlServer) -> (TestClient, JoinHandle<()>) {
    let (client, server_side) = tokio::io::duplex(1 << 20);
    let task = server.serve_stream(ConnStream::Memory(server_side), "127.0.0.1");
    let client = TestClient::start(client).await.expect("greeting");
    (client, task)
}

/// Connect and log in as root.
pub async fn connect_root(server: &MysqlServer) -> TestClient {
    let (mut client, _task) = connect(server).await;
    client.login("root", "", None).await.assert_ok();
    client
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn start(stream: S) -> Result<Self, FrontendError> {
        let mut io = PacketIo::new(stream);
        let data = io.read_packet().await?;
        let greeting = parse_greeting(&data)?;
        Ok(Self {
            io,
            greeting,
            capability: default_capability(),
        })
    }

    pub async fn send(&mut self, payload: &[u8]) {
        self.io.write_packet(payload).await.expect("write");
        self.io.flush().await.expect("flush");
    }

    /// Send a command packet, starting a new sequence.
    pub async fn command(&mut self, command: Command, body: &[u8]) {
        self.io.reset_sequence();
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(command.code());
        payload.extend_from_slice(body);
        self.send(&payload).await;
    }

    pub async fn read(&mut self) -> Vec<u8> {
        tokio::time::timeout(TIMEOUT, self.io.read_packet())
            .await
            .expect("timed out waiting for the server")
            .expect("read packet")
    }

    /// Read until the server closes the connection. Returns the packets that
    /// arrived before that.
    pub async fn read_until_closed(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        loop {
            match tokio::time::timeout(TIMEOUT, self.io.read_packet())
                .await
                .expect("server did not close the connection")
            {
                Ok(p) => packets.push(p),
                Err(FrontendError::ConnectionClosed) | Err(FrontendError::Io(_)) => return packets,
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }
    }

    /// Full login with mysql_native_password, following auth switches and
    /// the caching_sha2 fast-auth failure.
    pub async fn login(&mut self, user: &str, password: &str, db: Option<&str>) -> Reply {
        let auth = native_auth(password, &self.greeting.salt);
        let response = handshake_response(self.capability, user, &auth, db, "mysql_native_password");
        self.send(&response).await;
        self.finish_auth(password).await
    }

    pub async fn finish_auth(&mut self, password: &str) -> Reply {
        loop {
            let packet = self.read().await;
            match packet.first() {
                Some(&0xfe) => {
                    let mut r = PayloadReader::new(&packet[1..]);
                    let plugin = lossy_string(r.null_terminated().expect("plugin"));
                    let salt = r.null_terminated_or_rest().to_vec();
                    let auth = match plugin.as_str() {
                        "mysql_native_password" => native_auth(password, &salt),
                        // The fast path always fails; the scramble content is irrelevant.
                        _ => vec![0u8; 32],
                    };
                    self.send(&auth).await;
                }
                Some(&0x01) => {
                    assert_eq!(packet, vec![SHA_COMMAND, FAST_AUTH_FAIL]);
                    let mut cleartext = password.as_bytes().to_vec();
                    cleartext.push(0);
                    self.send(&cleartext).await;
                }
                _ => return parse_simple_reply(&packet),
            }
        }
    }

    pub async fn query(&mut self, sql: &str) -> Reply {
        self.command(Command::Query, sql.as_bytes()).await;
        self.read_reply().await
    }

    /// Read an OK, an ERR or a whole text result set.
    pub async fn read_reply(&mut self) -> Reply {
        let first = self.read().await;
        match first.first() {
            Some(&OK_HEADER) | Some(&ERR_HEADER) => parse_simple_reply(&first),
            _ => {
                let count = PayloadReader::new(&first)
                    .lenenc_int()
                    .expect("column count")
                    .unwrap_or(0) as usize;
                let columns = self.read_columns(count).await;
                let mut rows = Vec::new();
                loop {
                    let packet = self.read().await;
                    if is_eof(&packet) {
                        let (warnings, status) = parse_eof(&packet);
                        return Reply::Rows(Rows {
                            columns,
                            rows,
                            warnings,
                            status,
                        });
                    }
                    rows.push(parse_text_row(&packet, count));
                }
            }
        }
    }

    /// Column definitions followed by EOF. Returns the names.
    pub async fn read_columns(&mut self, count: usize) -> Vec<String> {
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            let def = self.read().await;
            let mut r = PayloadReader::new(&def);
            for _ in 0..4 {
                r.lenenc_bytes().expect("column header");
            }
            names.push(lossy_string(r.lenenc_bytes().expect("column name")));
        }
        let eof = self.read().await;
        assert!(is_eof(&eof), "expected EOF after column definitions");
        names
    }

    /// Raw row packets up to the closing EOF, plus that EOF's status.
    pub async fn read_raw_rows(&mut self) -> (Vec<Vec<u8>>, u16) {
        let mut rows = Vec::new();
        loop {
            let packet = self.read().await;
            if is_eof(&packet) {
                return (rows, parse_eof(&packet).1);
            }
            if packet.first() == Some(&ERR_HEADER) {
                panic!("error while reading rows: {:?}", parse_simple_reply(&packet));
            }
            rows.push(packet);
        }
    }

    /// COM_STMT_PREPARE. Returns (statement id, columns, params).
    pub async fn prepare(&mut self, sql: &str) -> Result<(u32, u16, u16), Reply> {
        self.command(Command::StmtPrepare, sql.as_bytes()).await;
        let first = self.read().await;
        if first.first() == Some(&ERR_HEADER) {
            return Err(parse_simple_reply(&first));
        }
        let mut r = PayloadReader::new(&first[1..]);
        let stmt_id = r.u32_le().unwrap();
        let columns = r.u16_le().unwrap();
        let params = r.u16_le().unwrap();
        if params > 0 {
            self.read_definitions(params as usize).await;
        }
        if columns > 0 {
            self.read_definitions(columns as usize).await;
        }
        Ok((stmt_id, columns, params))
    }

    async fn read_definitions(&mut self, n: usize) {
        for _ in 0..n {
            self.read().await;
        }
        let eof = self.read().await;
        assert!(is_eof(&eof));
    }

    /// COM_STMT_EXECUTE with string parameters.
    pub async fn execute(&mut self, stmt_id: u32, cursor: bool, params: &[Option<&str>]) {
        let mut buf = BytesMut::new();
        buf.put_u32_le(stmt_id);
        buf.put_u8(if cursor { CURSOR_TYPE_READ_ONLY } else { CURSOR_TYPE_NO_CURSOR });
        buf.put_u32_le(1);
        if !params.is_empty() {
            let mut bitmap = vec![0u8; (params.len() + 7) / 8];
            for (i, p) in params.iter().enumerate() {
                if p.is_none() {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            buf.put_slice(&bitmap);
            buf.put_u8(1);
            for _ in params {
                buf.put_u8(ColumnType::VarString as u8);
                buf.put_u8(0);
            }
            for p in params.iter().flatten() {
                write_lenenc_str(&mut buf, p);
            }
        }
        self.command(Command::StmtExecute, &buf).await;
    }

    pub async fn fetch(&mut self, stmt_id: u32, rows: u32) {
        let mut buf = BytesMut::new();
        buf.put_u32_le(stmt_id);
        buf.put_u32_le(rows);
        self.command(Command::StmtFetch, &buf).await;
    }
}

pub fn native_auth(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        Vec::new()
    } else {
        scramble_native_password(password, salt)
    }
}

pub fn handshake_response(
    capability: u32,
    user: &str,
    auth: &[u8],
    db: Option<&str>,
    plugin: &str,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(capability);
    buf.put_u32_le(16 << 20);
    buf.put_u8(46);
    buf.put_slice(&[0u8; 23]);
    write_null_terminated_str(&mut buf, user);
    buf.put_u8(auth.len() as u8);
    buf.put_slice(auth);
    if capability & CLIENT_CONNECT_WITH_DB != 0 {
        write_null_terminated_str(&mut buf, db.unwrap_or(""));
    }
    if capability & CLIENT_PLUGIN_AUTH != 0 {
        write_null_terminated_str(&mut buf, plugin);
    }
    buf.to_vec()
}

pub fn parse_greeting(data: &[u8]) -> Result<Greeting, FrontendError> {
    let mut r = PayloadReader::new(data);
    assert_eq!(r.u8()?, PROTOCOL_VERSION);
    let server_version = lossy_string(r.null_terminated()?);
    let conn_id = r.u32_le()?;
    let mut salt = r.bytes(8)?.to_vec();
    r.skip(1)?;
    let low = r.u16_le()? as u32;
    let collation = r.u8()?;
    r.skip(2)?;
    let high = r.u16_le()? as u32;
    r.skip(1 + 10)?;
    salt.extend_from_slice(r.bytes(12)?);
    r.skip(1)?;
    let auth_plugin = lossy_string(r.null_terminated()?);
    Ok(Greeting {
        server_version,
        conn_id,
        salt,
        capability: low | (high << 16),
        collation,
        auth_plugin,
    })
}

pub fn is_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&EOF_HEADER) && packet.len() < 9
}

pub fn parse_eof(packet: &[u8]) -> (u16, u16) {
    let mut r = PayloadReader::new(&packet[1..]);
    (r.u16_le().unwrap_or(0), r.u16_le().unwrap_or(0))
}

pub fn parse_simple_reply(packet: &[u8]) -> Reply {
    let mut r = PayloadReader::new(&packet[1..]);
    match packet.first() {
        Some(&OK_HEADER) => {
            let affected_rows = r.lenenc_int().unwrap().unwrap_or(0);
            let _last_insert_id = r.lenenc_int().unwrap();
            let status = r.u16_le().unwrap();
            let warnings = r.u16_le().unwrap();
            let info = if r.is_empty() {
                String::new()
            } else {
                lossy_string(r.lenenc_bytes().unwrap())
            };
            Reply::Ok {
                affected_rows,
                status,
                warnings,
                info,
            }
        }
        Some(&ERR_HEADER) => {
            let code = r.u16_le().unwrap();
            let state = if r.peek_u8() == Some(b'#') {
                r.skip(1).unwrap();
                lossy_string(r.bytes(5).unwrap())
            } else {
                String::new()
            };
            Reply::Err {
                code,
                state,
                message: lossy_string(r.rest()),
            }
        }
        other => panic!("unexpected packet header {:?}", other),
    }
}

fn parse_text_row(packet: &[u8], count: usize) -> Vec<Option<String>> {
    let mut r = PayloadReader::new(packet);
    (0..count)
        .map(|_| {
            if r.peek_u8() == Some(NULL_VALUE) {
                r.skip(1).unwrap();
                None
            } else {
                Some(lossy_string(r.lenenc_bytes().unwrap()))
            }
        })
        .collect()
}
