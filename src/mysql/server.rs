use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{AuthPlugin, SaltGenerator};
use super::codec::PacketIo;
use super::connection::{Connection, ConnectionHandle};
use super::packet::ErrPacket;
use super::protocol::server_capabilities;
use super::stream::ConnStream;
use super::tls::TlsAcceptor;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{FrontendError, Result};
use crate::expression::charset::{collation_by_name, UTF8MB4_BIN_ID};
use crate::query::{PrivilegeManager, QueryExecutor, UserIdentity};

/// Live counters behind COM_STATISTICS.
pub struct ServerStats {
    started_at: Instant,
    questions: AtomicU64,
    connections: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            questions: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }
}

impl ServerStats {
    pub fn record_command(&self) {
        self.questions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn questions(&self) -> u64 {
        self.questions.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// State shared by every connection of one server.
pub struct ServerContext {
    pub config: Config,
    pub executor: Arc<dyn QueryExecutor>,
    pub privileges: Arc<dyn PrivilegeManager>,
    /// Auth plugin per account, pulled from `privileges` on miss.
    pub auth_plugins: TtlCache<UserIdentity, String>,
    pub salts: SaltGenerator,
    pub tls: Option<TlsAcceptor>,
    pub stats: ServerStats,
    clients: DashMap<u64, Arc<ConnectionHandle>>,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        config: Config,
        executor: Arc<dyn QueryExecutor>,
        privileges: Arc<dyn PrivilegeManager>,
    ) -> Result<Self> {
        let tls = TlsAcceptor::from_config(&config.tls)?;
        if tls.is_some() {
            info!("TLS enabled");
        }
        Ok(Self {
            auth_plugins: TtlCache::new(Duration::from_secs(config.auth_cache_ttl_secs)),
            config,
            executor,
            privileges,
            salts: SaltGenerator::new(),
            tls,
            stats: ServerStats::default(),
            clients: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Capabilities offered in the greeting.
    pub fn capability(&self) -> u32 {
        server_capabilities(self.tls.is_some())
    }

    pub fn server_collation_id(&self) -> u8 {
        collation_by_name(&self.config.collation_server)
            .map(|c| c.id)
            .unwrap_or(UTF8MB4_BIN_ID)
    }

    pub fn default_auth_plugin(&self) -> AuthPlugin {
        AuthPlugin::from_name(&self.config.default_auth_plugin).unwrap_or(AuthPlugin::NativePassword)
    }

    fn allocate_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, conn_id: u64) -> Option<Arc<ConnectionHandle>> {
        self.clients.get(&conn_id).map(|h| h.value().clone())
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn unregister(&self, conn_id: u64) {
        self.clients.remove(&conn_id);
    }

    /// The COM_STATISTICS string.
    pub fn statistics(&self) -> String {
        let uptime = self.stats.uptime().as_secs();
        let questions = self.stats.questions();
        let qps = if uptime == 0 {
            0.0
        } else {
            questions as f64 / uptime as f64
        };
        format!(
            "Uptime: {}  Threads: {}  Questions: {}  Slow queries: 0  Opens: 0  Flush tables: 0  Open tables: 0  Queries per second avg: {:.3}",
            uptime,
            self.connection_count(),
            questions,
            qps
        )
    }
}

/// MySQL protocol front end: accepts clients and runs one task per connection.
pub struct MysqlServer {
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl MysqlServer {
    pub fn new(
        config: Config,
        executor: Arc<dyn QueryExecutor>,
        privileges: Arc<dyn PrivilegeManager>,
    ) -> Result<Self> {
        let ctx = ServerContext::new(config, executor, privileges)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Cancelled once graceful shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.ctx.config.host, self.ctx.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("MySQL server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind the configured TCP address (and unix socket, if any) and serve
    /// until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        #[cfg(unix)]
        if let Some(path) = self.ctx.config.socket.clone() {
            let unix = self.bind_unix(&path)?;
            let (tcp, unix) = tokio::join!(self.serve(listener), self.serve_unix(unix));
            tcp?;
            return unix;
        }
        self.serve(listener).await
    }

    /// Accept TCP clients until shutdown starts.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = self.shutdown.cancelled() => {
                    debug!("TCP listener stopped");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed: {}", e);
                    }
                    debug!("Accepted connection from {}", addr);
                    self.serve_stream(ConnStream::Tcp(stream), addr.ip().to_string());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(&self, path: &str) -> Result<tokio::net::UnixListener> {
        // A socket file left by a previous run would make bind fail.
        if std::path::Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("MySQL server listening on unix socket {}", path);
        Ok(listener)
    }

    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: tokio::net::UnixListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = self.shutdown.cancelled() => {
                    debug!("unix listener stopped");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, _)) => {
                    self.serve_stream(ConnStream::Unix(stream), "localhost");
                }
                Err(e) => {
                    error!("Failed to accept unix connection: {}", e);
                }
            }
        }
    }

    /// Run a connection over an already accepted stream.
    pub fn serve_stream(&self, stream: ConnStream, peer_host: impl Into<String>) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let conn_id = ctx.allocate_conn_id();
        let handle = Arc::new(ConnectionHandle::new(conn_id, peer_host));

        let max = ctx.config.max_connections;
        if max > 0 && ctx.connection_count() >= max {
            warn!(conn_id, max, "too many connections, rejecting");
            return tokio::spawn(reject(stream));
        }

        ctx.clients.insert(conn_id, handle.clone());
        ctx.stats.record_connection();
        tokio::spawn(async move {
            let conn = Connection::new(ctx, stream, handle);
            conn.run().await;
        })
    }

    /// Interrupt a connection's running statement, or the whole connection.
    /// Returns false when no such connection exists.
    pub fn kill(&self, conn_id: u64, query_only: bool) -> bool {
        match self.ctx.client(conn_id) {
            Some(handle) => {
                info!(conn_id, query_only, "killing connection");
                handle.kill(query_only);
                true
            }
            None => false,
        }
    }

    /// Stop accepting, ask every connection to leave at its next safe point,
    /// and kill whatever is still there when `timeout` runs out.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        let deadline = Instant::now() + timeout;
        info!(connections = self.ctx.connection_count(), ?timeout, "graceful shutdown started");

        loop {
            for entry in self.ctx.clients.iter() {
                if entry.value().shutdown_or_notify() {
                    debug!(conn_id = *entry.key(), "idle connection shut down");
                }
            }
            if self.ctx.clients.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.ctx.client_ids();
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "killing connections still open after shutdown timeout");
            for conn_id in remaining {
                self.kill(conn_id, false);
            }
        }
        info!("graceful shutdown finished");
    }
}

/// Refuse a client over the connection limit with ERR 1040 ahead of any greeting.
async fn reject(stream: ConnStream) {
    let mut io = PacketIo::new(stream);
    let err = FrontendError::TooManyConnections.to_sql_error();
    let written = async {
        io.write_packet(&ErrPacket::new(&err).encode(0)).await?;
        io.flush().await?;
        io.shutdown().await
    }
    .await;
    if let Err(e) = written {
        debug!("failed to reject connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::memory::{MemoryExecutor, StaticPrivilegeManager};

    fn context(config: Config) -> ServerContext {
        let executor = Arc::new(MemoryExecutor::new(&config));
        let privileges = Arc::new(StaticPrivilegeManager::new(&config.users));
        ServerContext::new(config, executor, privileges).unwrap()
    }

    #[test]
    fn test_conn_ids_are_unique() {
        let ctx = context(Config::default());
        let a = ctx.allocate_conn_id();
        let b = ctx.allocate_conn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_statistics_string() {
        let ctx = context(Config::default());
        ctx.stats.record_command();
        let stats = ctx.statistics();
        assert!(stats.starts_with("Uptime: "));
        assert!(stats.contains("Threads: 0"));
        assert!(stats.contains("Questions: 1"));
        assert!(stats.contains("Queries per second avg: "));
    }

    #[test]
    fn test_greeting_collation_follows_config() {
        let config = Config {
            collation_server: "utf8mb4_general_ci".to_string(),
            ..Config::default()
        };
        assert_eq!(context(config).server_collation_id(), 45);
        assert_eq!(context(Config::default()).server_collation_id(), UTF8MB4_BIN_ID);
    }

    #[tokio::test]
    async fn test_kill_unknown_connection() {
        let config = Config::default();
        let executor = Arc::new(MemoryExecutor::new(&config));
        let privileges = Arc::new(StaticPrivilegeManager::new(&config.users));
        let server = MysqlServer::new(config, executor, privileges).unwrap();
        assert!(!server.kill(99, false));
    }
}
