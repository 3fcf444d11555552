use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::auth::{AuthPlugin, SALT_LEN};
use super::codec::PacketIo;
use super::packet::{EofPacket, ErrPacket, OkPacket};
use super::protocol::{Command, SERVER_STATUS_AUTOCOMMIT};
use super::server::ServerContext;
use super::statement::StatementRegistry;
use super::stream::ConnStream;
use crate::error::{ErrorClass, FrontendError, Result};
use crate::query::{OkStatus, Session, UserIdentity};

/// Where the dispatch loop currently is. Stored in [`ConnectionHandle`] so
/// other tasks can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Dispatching = 0,
    Reading = 1,
    Shutdown = 2,
    WaitShutdown = 3,
}

impl ConnStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnStatus::Dispatching,
            1 => ConnStatus::Reading,
            2 => ConnStatus::Shutdown,
            _ => ConnStatus::WaitShutdown,
        }
    }
}

/// The part of a connection that the server registry and admin paths share
/// with the task running it.
pub struct ConnectionHandle {
    conn_id: u64,
    status: AtomicU8,
    in_transaction: AtomicBool,
    /// Cancel handle of the statement in flight, if any.
    cancel: Mutex<Option<CancellationToken>>,
    /// Cancelled to interrupt a connection blocked in read.
    closed: CancellationToken,
    user: Mutex<String>,
    host: String,
    connected_at: Instant,
}

impl ConnectionHandle {
    pub fn new(conn_id: u64, host: impl Into<String>) -> Self {
        Self {
            conn_id,
            status: AtomicU8::new(ConnStatus::Dispatching as u8),
            in_transaction: AtomicBool::new(false),
            cancel: Mutex::new(None),
            closed: CancellationToken::new(),
            user: Mutex::new(String::new()),
            host: host.into(),
            connected_at: Instant::now(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ConnStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Compare-and-swap on the status. Returns whether the swap happened.
    pub fn transition(&self, from: ConnStatus, to: ConnStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_transaction(&self, in_txn: bool) {
        self.in_transaction.store(in_txn, Ordering::Release);
    }

    pub fn user(&self) -> String {
        self.user.lock().clone()
    }

    pub(crate) fn set_user(&self, user: &str) {
        *self.user.lock() = user.to_string();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Install a fresh cancel handle for the statement about to run.
    pub(crate) fn begin_statement(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        token
    }

    pub(crate) fn end_statement(&self) {
        self.cancel.lock().take();
    }

    /// Interrupt the statement in flight. Returns false when nothing is running.
    pub fn cancel_statement(&self) -> bool {
        match self.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Kill the running statement and, unless `query_only`, the connection.
    pub fn kill(&self, query_only: bool) {
        self.cancel_statement();
        if !query_only {
            self.set_status(ConnStatus::Shutdown);
            self.closed.cancel();
        }
    }

    /// Ask the connection to go away at a safe point.
    ///
    /// Returns true when the connection was idle in read and has been shut
    /// down right away. A connection inside a transaction is left alone, and
    /// a dispatching one is flagged so that its loop exits before the next
    /// read.
    pub fn shutdown_or_notify(&self) -> bool {
        if self.in_transaction() {
            return false;
        }
        // The loop flips between Reading and Dispatching on its own, so retry
        // until one of the swaps lands or it is already going away.
        loop {
            if self.transition(ConnStatus::Reading, ConnStatus::Shutdown) {
                self.closed.cancel();
                return true;
            }
            if self.transition(ConnStatus::Dispatching, ConnStatus::WaitShutdown) {
                return false;
            }
            if matches!(self.status(), ConnStatus::Shutdown | ConnStatus::WaitShutdown) {
                return false;
            }
        }
    }
}

/// One client connection, from greeting to close.
pub struct Connection {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) io: PacketIo<ConnStream>,
    pub(crate) handle: Arc<ConnectionHandle>,
    pub(crate) peer_host: String,
    pub(crate) salt: [u8; SALT_LEN],
    /// The plugin the last auth exchange ran under.
    pub(crate) auth_plugin: AuthPlugin,
    pub(crate) capability: u32,
    pub(crate) collation: u8,
    pub(crate) user: String,
    pub(crate) db: String,
    pub(crate) attrs: HashMap<String, String>,
    pub(crate) session: Option<Box<dyn Session>>,
    pub(crate) statements: StatementRegistry,
}

impl Connection {
    pub fn new(ctx: Arc<ServerContext>, stream: ConnStream, handle: Arc<ConnectionHandle>) -> Self {
        let io = PacketIo::new(stream).with_max_allowed_packet(ctx.config.max_allowed_packet);
        let salt = ctx.salts.generate();
        let auth_plugin = ctx.default_auth_plugin();
        Self {
            peer_host: handle.host().to_string(),
            ctx,
            io,
            handle,
            salt,
            auth_plugin,
            capability: 0,
            collation: 0,
            user: String::new(),
            db: String::new(),
            attrs: HashMap::new(),
            session: None,
            statements: StatementRegistry::default(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.handle.conn_id()
    }

    pub fn handle(&self) -> Arc<ConnectionHandle> {
        self.handle.clone()
    }

    /// Handshake, then serve commands until the client leaves or the
    /// connection is shut down.
    pub async fn run(mut self) {
        let conn_id = self.conn_id();
        match self.handshake().await {
            Ok(()) => {
                self.handle.set_user(&self.user);
                info!(conn_id, user = %self.user, host = %self.peer_host, "connection established");
                self.dispatch_loop().await;
            }
            Err(e) => {
                match e.class() {
                    ErrorClass::Timeout | ErrorClass::Disconnect => {
                        debug!(conn_id, "client went away during handshake: {}", e)
                    }
                    ErrorClass::Auth => info!(conn_id, user = %self.user, "handshake rejected: {}", e),
                    _ => warn!(conn_id, "handshake failed: {}", e),
                }
                if !matches!(e, FrontendError::Io(_) | FrontendError::ConnectionClosed) {
                    if self.send_error(&e).await.is_ok() {
                        let _ = self.io.flush().await;
                    }
                }
            }
        }
        self.close().await;
    }

    async fn dispatch_loop(&mut self) {
        let conn_id = self.conn_id();
        let closed = self.handle.closed_token();
        loop {
            if !self.handle.transition(ConnStatus::Dispatching, ConnStatus::Reading) {
                debug!(conn_id, status = ?self.handle.status(), "connection asked to shut down");
                return;
            }

            let wait_timeout = self.wait_timeout();
            self.io.set_read_timeout(Some(wait_timeout));
            let read = tokio::select! {
                r = self.io.read_packet() => r,
                _ = closed.cancelled() => Err(FrontendError::ConnectionClosed),
            };

            if !self.handle.transition(ConnStatus::Reading, ConnStatus::Dispatching) {
                debug!(conn_id, "connection shut down while reading");
                return;
            }

            let payload = match read {
                Ok(payload) => payload,
                Err(FrontendError::Timeout) => {
                    info!(conn_id, ?wait_timeout, "read packet timeout, closing connection");
                    return;
                }
                Err(FrontendError::ConnectionClosed) => {
                    debug!(conn_id, "client closed the connection");
                    return;
                }
                Err(e @ FrontendError::PacketTooLarge) => {
                    warn!(conn_id, "{}", e);
                    if self.send_error(&e).await.is_ok() {
                        let _ = self.io.flush().await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(conn_id, "read packet failed: {}", e);
                    return;
                }
            };

            let command = payload.first().map(|b| Command::from(*b));
            let span = info_span!("dispatch", conn_id, command = ?command);
            let outcome = AssertUnwindSafe(self.dispatch(payload))
                .catch_unwind()
                .instrument(span)
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(FrontendError::ConnectionClosed)) => {
                    debug!(conn_id, "client quit");
                    return;
                }
                Ok(Err(e)) => {
                    let fatal = e.is_fatal();
                    if fatal {
                        error!(conn_id, command = ?command, "command failed, closing connection: {}", e);
                    } else {
                        debug!(conn_id, command = ?command, "command failed: {}", e);
                    }
                    if let Err(write_err) = self.send_error(&e).await {
                        warn!(conn_id, "failed to write error packet: {}", write_err);
                        return;
                    }
                    if fatal {
                        let _ = self.io.flush().await;
                        return;
                    }
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let backtrace = Backtrace::force_capture();
                    error!(conn_id, command = ?command, panic = %message, %backtrace, "connection running loop panic");
                    if self.send_error(&FrontendError::Panic(message)).await.is_ok() {
                        let _ = self.io.flush().await;
                    }
                    return;
                }
            }

            if let Err(e) = self.io.flush().await {
                debug!(conn_id, "flush failed: {}", e);
                return;
            }
            if let Some(session) = self.session.as_ref() {
                self.handle.set_in_transaction(session.in_transaction());
            }
        }
    }

    /// Idle timeout for the next read: the session's `wait_timeout`, else the
    /// configured default.
    fn wait_timeout(&self) -> Duration {
        let fallback = self.ctx.config.wait_timeout_secs;
        let secs = match self.session.as_ref().and_then(|s| s.session_var("wait_timeout")) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(0) => fallback,
                Ok(secs) => secs,
                Err(_) => {
                    warn!(conn_id = self.conn_id(), value = %value, "unparsable wait_timeout, using default");
                    fallback
                }
            },
            None => fallback,
        };
        Duration::from_secs(secs)
    }

    pub(crate) async fn close(&mut self) {
        let conn_id = self.conn_id();
        self.handle.set_status(ConnStatus::Shutdown);
        self.handle.end_statement();
        self.statements.clear().await;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(conn_id, "closing session failed: {}", e);
            }
        }
        let _ = self.io.shutdown().await;
        self.ctx.unregister(conn_id);
        debug!(conn_id, "connection closed");
    }

    pub(crate) fn identity(&self) -> UserIdentity {
        UserIdentity::new(&self.user, &self.peer_host)
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut (dyn Session + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| FrontendError::critical("no session is open on this connection"))
    }

    /// Status flags and warning count for OK and EOF packets.
    pub(crate) fn session_status(&self) -> (u16, u16) {
        match self.session.as_ref() {
            Some(session) => (session.status(), session.warning_count()),
            None => (SERVER_STATUS_AUTOCOMMIT, 0),
        }
    }

    pub(crate) async fn send_ok(&mut self) -> Result<()> {
        let (status, warnings) = self.session_status();
        self.send_ok_status(&OkStatus::default(), status, warnings).await
    }

    pub(crate) async fn send_ok_status(&mut self, ok: &OkStatus, status: u16, warnings: u16) -> Result<()> {
        let packet = OkPacket {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status_flags: status,
            warnings,
            info: ok.info.clone(),
        };
        self.io.write_packet(&packet.encode(self.capability)).await
    }

    pub(crate) async fn send_eof(&mut self) -> Result<()> {
        let (status, warnings) = self.session_status();
        let packet = EofPacket {
            warnings,
            status_flags: status,
        };
        self.io.write_packet(&packet.encode(self.capability)).await
    }

    pub(crate) async fn send_error(&mut self, err: &FrontendError) -> Result<()> {
        let sql_error = err.to_sql_error();
        self.io
            .write_packet(&ErrPacket::new(&sql_error).encode(self.capability))
            .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
