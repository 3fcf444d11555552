//! Connection-phase negotiation: greeting, optional TLS upgrade, auth plugin
//! resolution and credential verification.

use tracing::{debug, info, warn};

use super::auth::{self, AuthPlugin};
use super::connection::Connection;
use super::packet::{auth_switch_request, HandshakePacket, HandshakeResponse, OkPacket};
use super::protocol::*;
use crate::error::{FrontendError, Result};
use crate::expression::charset::CollationContext;
use crate::query::{ExecResult, Privilege, SessionInfo, Statement, StatementKind};

impl Connection {
    /// Run the whole connection phase. On success the client has received
    /// its OK and a session is open.
    pub(crate) async fn handshake(&mut self) -> Result<()> {
        self.send_greeting().await?;

        let mut resp = self.read_handshake_response().await?;
        self.capability = resp.capability & self.ctx.capability();
        self.collation = resp.collation;
        self.user = resp.user.clone();
        self.db = resp.db.clone();
        self.attrs = std::mem::take(&mut resp.attrs);
        debug!(
            conn_id = self.conn_id(),
            user = %self.user,
            db = %self.db,
            capability = format_args!("{:#x}", self.capability),
            legacy = resp.legacy,
            "handshake response parsed"
        );

        let plugin = self.resolve_auth_plugin(&mut resp).await?;
        if plugin == AuthPlugin::CachingSha2Password {
            resp.auth = self.fast_auth_fail().await?;
        }

        self.verify_and_open_session(plugin, &resp.auth).await?;
        if !self.db.is_empty() {
            let db = self.db.clone();
            self.use_database(&db).await?;
        }
        self.run_init_connect().await?;

        let ok = OkPacket {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        };
        self.io.write_packet(&ok.encode(self.capability)).await?;
        self.io.flush().await?;
        self.io.reset_sequence();
        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<()> {
        let greeting = HandshakePacket {
            server_version: self.ctx.config.server_version.clone(),
            connection_id: self.conn_id() as u32,
            salt: self.salt,
            capability_flags: self.ctx.capability(),
            collation: self.ctx.server_collation_id(),
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: self.auth_plugin.name().to_string(),
        };
        self.io.write_packet(&greeting.encode()).await?;
        self.io.flush().await
    }

    /// Read the client's response, upgrading to TLS first when it asked for
    /// it and the server can.
    async fn read_handshake_response(&mut self) -> Result<HandshakeResponse> {
        let mut data = self.io.read_packet().await?;
        let (mut resp, mut offset) = HandshakeResponse::parse_header(&data)?;

        if resp.capability & CLIENT_SSL != 0 {
            if let Some(tls) = self.ctx.tls.clone() {
                self.io.upgrade_to_tls(&tls).await?;
                debug!(conn_id = self.conn_id(), "TLS established");
                data = self.io.read_packet().await?;
                let (reparsed, body_offset) = resp.reparse_header(&data)?;
                resp = reparsed;
                offset = body_offset;
            } else {
                // Nothing to upgrade with; keep reading the same packet in plaintext.
                debug!(conn_id = self.conn_id(), "client requested TLS but none is configured");
            }
        } else if self.ctx.config.require_secure_transport && !self.io.get_ref().is_unix_socket() {
            return Err(FrontendError::SecureTransportRequired);
        }

        resp.parse_body(&data, offset)?;
        Ok(resp)
    }

    /// Decide which plugin the credentials are checked with, switching the
    /// client over when needed.
    async fn resolve_auth_plugin(&mut self, resp: &mut HandshakeResponse) -> Result<AuthPlugin> {
        let conn_id = self.conn_id();
        if self.capability & CLIENT_PLUGIN_AUTH == 0 {
            info!(conn_id, user = %self.user, "client does not support plugin auth");
            return Ok(AuthPlugin::NativePassword);
        }

        let identity = self.identity();
        let privileges = self.ctx.privileges.clone();
        let user_plugin = match self
            .ctx
            .auth_plugins
            .get_or_load(&identity, || async { privileges.auth_plugin_for_user(&identity).await })
            .await
        {
            Ok(plugin) => plugin,
            Err(e) => {
                debug!(conn_id, user = %identity, "auth plugin lookup failed: {}", e);
                String::new()
            }
        };

        if user_plugin == AuthPlugin::AuthSocket.name() {
            let stream = self.io.get_ref();
            let denied = || self.access_denied(false);
            if !stream.is_unix_socket() {
                return Err(denied());
            }
            let os_user = stream
                .peer_uid()
                .and_then(auth::username_for_uid)
                .ok_or_else(denied)?;
            resp.auth = os_user.into_bytes();
            resp.auth_plugin = user_plugin;
            self.auth_plugin = AuthPlugin::AuthSocket;
            return Ok(AuthPlugin::AuthSocket);
        }

        if user_plugin.is_empty() {
            warn!(conn_id, user = %identity, "no auth plugin set for user, assuming mysql_native_password");
            resp.auth_plugin = AuthPlugin::NativePassword.name().to_string();
            return Ok(AuthPlugin::NativePassword);
        }

        let client_plugin = if resp.auth_plugin.is_empty() {
            self.auth_plugin.name().to_string()
        } else {
            resp.auth_plugin.clone()
        };
        let server_plugin = self.auth_plugin.name();
        if server_plugin != user_plugin || server_plugin != client_plugin {
            let plugin = AuthPlugin::from_name(&user_plugin)
                .ok_or_else(|| FrontendError::UnknownAuthPlugin(user_plugin.clone()))?;
            resp.auth = self.auth_switch(plugin).await?;
            resp.auth_plugin = user_plugin;
            return Ok(plugin);
        }

        AuthPlugin::from_name(&client_plugin).ok_or(FrontendError::UnknownAuthPlugin(client_plugin))
    }

    /// Send an AuthSwitchRequest with a fresh salt and read the new auth data.
    async fn auth_switch(&mut self, plugin: AuthPlugin) -> Result<Vec<u8>> {
        debug!(conn_id = self.conn_id(), plugin = %plugin, "switching auth plugin");
        self.salt = self.ctx.salts.generate();
        self.auth_plugin = plugin;
        let request = auth_switch_request(plugin.name(), &self.salt);
        self.io.write_packet(&request).await?;
        self.io.flush().await?;
        self.io.read_packet().await
    }

    /// caching_sha2_password: report the fast path as failed so the client
    /// sends its password, then read it.
    async fn fast_auth_fail(&mut self) -> Result<Vec<u8>> {
        self.io.write_packet(&[SHA_COMMAND, FAST_AUTH_FAIL]).await?;
        self.io.flush().await?;
        let mut data = self.io.read_packet().await?;
        while data.last() == Some(&0) {
            data.pop();
        }
        Ok(data)
    }

    /// Check credentials and open a session for the authenticated user.
    pub(crate) async fn verify_and_open_session(&mut self, plugin: AuthPlugin, auth: &[u8]) -> Result<()> {
        let using_password = !auth.is_empty();
        let identity = self.identity();
        if plugin == AuthPlugin::AuthSocket && !self.io.get_ref().is_unix_socket() {
            return Err(self.access_denied(false));
        }
        let verified = self
            .ctx
            .privileges
            .authenticate(&identity, plugin, auth, &self.salt)
            .await?;
        if !verified {
            info!(conn_id = self.conn_id(), user = %identity, using_password, "access denied");
            return Err(self.access_denied(using_password));
        }
        self.open_session().await
    }

    pub(crate) async fn open_session(&mut self) -> Result<()> {
        let stream = self.io.get_ref();
        let info = SessionInfo {
            conn_id: self.conn_id(),
            identity: self.identity(),
            capability: self.capability,
            collation: CollationContext::from_collation_id(self.collation),
            attrs: self.attrs.clone(),
            tls: stream.tls_info(),
            unix_socket: stream.is_unix_socket(),
        };
        let session = self.ctx.executor.open_session(info).await?;
        self.session = Some(session);
        Ok(())
    }

    pub(crate) async fn use_database(&mut self, db: &str) -> Result<()> {
        let stmt = Statement::new(format!("USE `{}`", db), StatementKind::Use(db.to_string()));
        let session = self.session_mut()?;
        match session.execute(&stmt).await? {
            ExecResult::Rows(mut rs) => rs.close().await?,
            ExecResult::Ok(_) => {}
        }
        self.db = db.to_string();
        Ok(())
    }

    /// Run `init_connect` for ordinary users, discarding any rows it yields.
    async fn run_init_connect(&mut self) -> Result<()> {
        let sql = self.ctx.config.init_connect.trim().to_string();
        if sql.is_empty() {
            return Ok(());
        }
        let identity = self.identity();
        if self.ctx.privileges.has_privilege(&identity, Privilege::ConnectionAdmin) {
            return Ok(());
        }
        if let Err(e) = self.execute_discarding(&sql).await {
            warn!(conn_id = self.conn_id(), user = %identity, "init_connect failed: {}", e);
            return Err(FrontendError::AbortingConnection {
                conn_id: self.conn_id(),
                db: self.db.clone(),
                user: self.user.clone(),
                host: self.peer_host.clone(),
                reason: "init_connect command failed".to_string(),
            });
        }
        Ok(())
    }

    async fn execute_discarding(&mut self, sql: &str) -> Result<()> {
        let session = self.session_mut()?;
        let stmts = session.parse(sql).await?;
        for stmt in &stmts {
            if let ExecResult::Rows(mut rs) = session.execute(stmt).await? {
                let mut chunk = crate::query::Chunk::default();
                let drained = loop {
                    if let Err(e) = rs.next(&mut chunk).await {
                        break Err(e);
                    }
                    if chunk.is_empty() {
                        break Ok(());
                    }
                    chunk.clear();
                };
                rs.close().await?;
                drained?;
            }
        }
        Ok(())
    }

    fn access_denied(&self, using_password: bool) -> FrontendError {
        FrontendError::AccessDenied {
            user: self.user.clone(),
            host: self.peer_host.clone(),
            using_password,
        }
    }
}
