//! Command handlers. One call of [`Connection::dispatch`] serves one command
//! packet and writes its complete response.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::connection::{ConnStatus, Connection};
use super::packet::StmtPrepareOk;
use super::protocol::*;
use super::resultset::{self, Cursor, RowFormat};
use super::statement::{parse_execute, statement_id};
use crate::config::MultiStatementMode;
use crate::error::{FrontendError, Result};
use crate::query::{self, ExecResult, Statement, StatementKind, Value, Warning, WarningLevel};

pub const ER_EMPTY_QUERY: u16 = 1065;

/// How rows produced by a statement go back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    Text,
    Binary,
    /// Park the result in the statement's cursor for COM_STMT_FETCH.
    Cursor(u32),
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Sql(&'a Statement),
    Prepared { stmt_id: u32, params: &'a [Value] },
}

impl Connection {
    pub(crate) async fn dispatch(&mut self, payload: Vec<u8>) -> Result<()> {
        let (&code, data) = payload
            .split_first()
            .ok_or_else(|| FrontendError::malformed("empty command packet"))?;
        let command = Command::from(code);
        self.ctx.stats.record_command();
        debug!(command = ?command, len = data.len(), "dispatching command");

        match command {
            Command::Sleep => Ok(()),
            Command::Quit => Err(FrontendError::ConnectionClosed),
            Command::Query => {
                let sql = query_text(data);
                self.handle_query(&sql).await
            }
            Command::Ping => self.send_ok().await,
            Command::InitDb => {
                let db = lossy_string(strip_trailing_nul(data));
                self.use_database(&db).await?;
                self.send_ok().await
            }
            Command::FieldList => self.handle_field_list(data).await,
            Command::Refresh => self.handle_refresh(data).await,
            Command::Shutdown => {
                self.execute_admin(Statement::new("SHUTDOWN", StatementKind::Shutdown))
                    .await?;
                self.send_ok().await
            }
            Command::Statistics => {
                let stats = self.ctx.statistics();
                self.io.write_packet(stats.as_bytes()).await
            }
            Command::ChangeUser => self.handle_change_user(data).await,
            Command::ResetConnection => self.handle_reset_connection().await,
            Command::SetOption => self.handle_set_option(data).await,
            Command::StmtPrepare => {
                let sql = query_text(data);
                self.handle_stmt_prepare(&sql).await
            }
            Command::StmtExecute => self.handle_stmt_execute(data).await,
            Command::StmtFetch => self.handle_stmt_fetch(data).await,
            Command::StmtClose => self.handle_stmt_close(data).await,
            Command::StmtSendLongData => self.handle_stmt_send_long_data(data),
            Command::StmtReset => {
                let stmt_id = statement_id(data)?;
                self.statements.get_mut(stmt_id, "stmt_reset")?.reset().await?;
                self.send_ok().await
            }
            _ => Err(FrontendError::UnknownCommand(code)),
        }
    }

    async fn handle_query(&mut self, sql: &str) -> Result<()> {
        let mut stmts = self.session_mut()?.parse(sql).await?;
        if stmts.is_empty() {
            return Err(FrontendError::execution(ER_EMPTY_QUERY, "42000", "Query was empty"));
        }

        let mut warnings = Vec::new();
        if stmts.len() > 1 && self.capability & CLIENT_MULTI_STATEMENTS == 0 {
            match self.multi_statement_mode() {
                MultiStatementMode::Off => return Err(FrontendError::MultiStatementDisabled),
                MultiStatementMode::On => {}
                MultiStatementMode::Warn => {
                    stmts.truncate(1);
                    warnings.push(Warning::new(
                        WarningLevel::Warning,
                        &FrontendError::MultiStatementDisabled,
                    ));
                }
            }
        }

        if stmts.len() > 1 {
            self.prefetch_point_keys(&stmts).await?;
        }

        let last = stmts.len() - 1;
        for (i, stmt) in stmts.iter().enumerate() {
            let extra = if i == 0 {
                std::mem::take(&mut warnings)
            } else {
                Vec::new()
            };
            let query_id = Uuid::new_v4();
            let span = info_span!("statement", %query_id);
            self.run_statement(Request::Sql(stmt), ExecMode::Text, i < last, extra)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    fn multi_statement_mode(&self) -> MultiStatementMode {
        let configured = self.ctx.config.multi_statement_mode;
        match self.session.as_ref().and_then(|s| s.session_var("multi_statement_mode")) {
            Some(value) => value.parse().unwrap_or_else(|e| {
                warn!("ignoring session multi_statement_mode: {}", e);
                configured
            }),
            None => configured,
        }
    }

    /// Best-effort batch read of the keys point statements will touch. Only
    /// I/O failures are reported.
    async fn prefetch_point_keys(&mut self, stmts: &[Statement]) -> Result<()> {
        if stmts.iter().any(Statement::is_use) {
            return Ok(());
        }
        let session = self.session_mut()?;
        let prefetcher = match query::point_prefetcher(session) {
            Ok(p) => p,
            Err(e) => {
                debug!("skipping prefetch: {}", e);
                return Ok(());
            }
        };
        match prefetcher.prefetch_point_keys(stmts).await {
            Ok(keys) => debug!(keys, "prefetched point keys"),
            Err(e @ FrontendError::Io(_)) => return Err(e),
            Err(e) => debug!("point key prefetch failed: {}", e),
        }
        Ok(())
    }

    /// Execute one statement and write its response, retrying once on the
    /// fallback engine when the first pull fails with an engine error.
    async fn run_statement(
        &mut self,
        request: Request<'_>,
        mode: ExecMode,
        more: bool,
        mut pending: Vec<Warning>,
    ) -> Result<()> {
        let token = self.handle.begin_statement();
        let mut fallback = false;
        let outcome = loop {
            let (retryable, result) = match self.execute_cancellable(request, &token).await {
                Ok(exec) => self.write_exec_result(exec, mode, more, &pending, &token).await,
                Err(e) => (true, Err(e)),
            };
            match result {
                Ok(()) => break Ok(()),
                Err(e)
                    if retryable
                        && !fallback
                        && e.is_retryable_engine_error()
                        && self.session.as_ref().is_some_and(|s| s.allow_engine_fallback()) =>
                {
                    warn!("engine unavailable, retrying on fallback engine: {}", e);
                    fallback = true;
                    pending.push(Warning::new(WarningLevel::Warning, &e));
                    if let Some(session) = self.session.as_mut() {
                        session.set_engine_fallback(true);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        if fallback {
            if let Some(session) = self.session.as_mut() {
                session.set_engine_fallback(false);
            }
        }
        self.handle.end_statement();
        outcome
    }

    async fn execute_cancellable(
        &mut self,
        request: Request<'_>,
        token: &CancellationToken,
    ) -> Result<ExecResult> {
        let session = self.session_mut()?;
        let fut = match request {
            Request::Sql(stmt) => session.execute(stmt),
            Request::Prepared { stmt_id, params } => session.execute_prepared(stmt_id, params),
        };
        tokio::select! {
            r = fut => r,
            _ = token.cancelled() => Err(FrontendError::QueryInterrupted),
        }
    }

    /// Write an OK or a result set. The flag tells whether the failure
    /// happened before anything reached the client.
    async fn write_exec_result(
        &mut self,
        exec: ExecResult,
        mode: ExecMode,
        more: bool,
        pending: &[Warning],
        token: &CancellationToken,
    ) -> (bool, Result<()>) {
        let (mut status, warnings) = match self.session_mut() {
            Ok(session) => {
                for warning in pending {
                    session.append_warning(warning.clone());
                }
                (session.status(), session.warning_count())
            }
            Err(e) => return (false, Err(e)),
        };
        if more {
            status |= SERVER_MORE_RESULTS_EXISTS;
        }
        let capability = self.capability;

        let mut rs = match exec {
            ExecResult::Ok(ok) => return (false, self.send_ok_status(&ok, status, warnings).await),
            ExecResult::Rows(rs) => rs,
        };
        if self.handle.status() == ConnStatus::Shutdown {
            let _ = rs.close().await;
            return (false, Err(FrontendError::QueryInterrupted));
        }

        match mode {
            ExecMode::Text | ExecMode::Binary => {
                let format = if mode == ExecMode::Text {
                    RowFormat::Text
                } else {
                    RowFormat::Binary
                };
                resultset::write_result(
                    &mut self.io,
                    rs.as_mut(),
                    format,
                    capability,
                    warnings,
                    status,
                    Some(token),
                )
                .await
            }
            ExecMode::Cursor(stmt_id) => {
                let cursor = match Cursor::open(rs, Some(token)).await {
                    Ok(cursor) => cursor,
                    Err(e) => return (true, Err(e)),
                };
                let written = resultset::write_column_info(
                    &mut self.io,
                    capability,
                    cursor.columns(),
                    warnings,
                    status | SERVER_STATUS_CURSOR_EXISTS,
                )
                .await;
                if let Err(e) = written {
                    let _ = cursor.close().await;
                    return (false, Err(e));
                }
                match self.statements.get_mut(stmt_id, "stmt_execute") {
                    Ok(stmt) => {
                        stmt.cursor = Some(cursor);
                        (false, Ok(()))
                    }
                    Err(e) => {
                        let _ = cursor.close().await;
                        (false, Err(e))
                    }
                }
            }
        }
    }

    /// Run an administrative statement and discard its result.
    async fn execute_admin(&mut self, stmt: Statement) -> Result<()> {
        match self.session_mut()?.execute(&stmt).await? {
            ExecResult::Rows(mut rs) => rs.close().await,
            ExecResult::Ok(_) => Ok(()),
        }
    }

    async fn handle_field_list(&mut self, data: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(data);
        let table = lossy_string(r.null_terminated_or_rest());
        let mut columns = self.session_mut()?.field_list(&table).await?;
        for column in &mut columns {
            column.default_value = Some(Vec::new());
        }
        let (status, _) = self.session_status();
        resultset::write_definitions(&mut self.io, self.capability, &columns, status).await
    }

    async fn handle_refresh(&mut self, data: &[u8]) -> Result<()> {
        let sub = data.first().copied().unwrap_or(0);
        if sub & 0x01 != 0 {
            self.execute_admin(Statement::new("FLUSH PRIVILEGES", StatementKind::Flush))
                .await?;
            self.ctx.auth_plugins.clear();
        }
        self.send_ok().await
    }

    async fn handle_change_user(&mut self, data: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(data);
        let user = lossy_string(r.null_terminated()?);
        let pass_len = r.u8()? as usize;
        let auth = r.bytes(pass_len)?.to_vec();
        let db = lossy_string(r.null_terminated_or_rest());

        info!(conn_id = self.conn_id(), from = %self.user, to = %user, "change user");
        self.close_session().await;
        self.user = user;
        self.db = db;
        let plugin = self.auth_plugin;
        self.verify_and_open_session(plugin, &auth).await?;
        self.handle.set_user(&self.user);
        if !self.db.is_empty() {
            let db = self.db.clone();
            self.use_database(&db).await?;
        }
        self.send_ok().await
    }

    async fn handle_reset_connection(&mut self) -> Result<()> {
        self.close_session().await;
        self.open_session().await?;
        if !self.db.is_empty() {
            let db = self.db.clone();
            self.use_database(&db).await?;
        }
        self.send_ok().await
    }

    async fn close_session(&mut self) {
        self.statements.clear().await;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(conn_id = self.conn_id(), "closing session failed: {}", e);
            }
        }
        self.handle.set_in_transaction(false);
    }

    async fn handle_set_option(&mut self, data: &[u8]) -> Result<()> {
        let option = PayloadReader::new(data).u16_le()?;
        match option {
            0 => self.capability |= CLIENT_MULTI_STATEMENTS,
            1 => self.capability &= !CLIENT_MULTI_STATEMENTS,
            _ => return Err(FrontendError::malformed("unknown COM_SET_OPTION value")),
        }
        let capability = self.capability;
        self.session_mut()?.set_client_capability(capability);
        self.send_eof().await
    }

    async fn handle_stmt_prepare(&mut self, sql: &str) -> Result<()> {
        let session = self.session_mut()?;
        let meta = session.prepare(sql).await?;
        let warnings = session.warning_count();
        let (status, _) = self.session_status();

        let ok = StmtPrepareOk {
            statement_id: meta.id,
            num_columns: meta.columns.len() as u16,
            num_params: meta.params.len() as u16,
            warnings,
        };
        self.io.write_packet(&ok.encode()).await?;
        let capability = self.capability;
        if !meta.params.is_empty() {
            resultset::write_definitions(&mut self.io, capability, &meta.params, status).await?;
        }
        if !meta.columns.is_empty() {
            resultset::write_definitions(&mut self.io, capability, &meta.columns, status).await?;
        }
        debug!(stmt_id = meta.id, params = meta.params.len(), "statement prepared");
        self.statements.insert(meta);
        Ok(())
    }

    async fn handle_stmt_execute(&mut self, data: &[u8]) -> Result<()> {
        let stmt_id = statement_id(data)?;
        let stmt = self.statements.get_mut(stmt_id, "stmt_execute")?;
        let req = parse_execute(data, stmt)?;
        if let Some(cursor) = stmt.cursor.take() {
            cursor.close().await?;
        }

        let mode = if req.use_cursor {
            ExecMode::Cursor(stmt_id)
        } else {
            ExecMode::Binary
        };
        let query_id = Uuid::new_v4();
        let span = info_span!("statement", %query_id, stmt_id);
        let request = Request::Prepared {
            stmt_id,
            params: &req.params,
        };
        self.run_statement(request, mode, false, Vec::new())
            .instrument(span)
            .await
    }

    async fn handle_stmt_fetch(&mut self, data: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(data);
        let stmt_id = r.u32_le()?;
        let fetch_size = r.u32_le()? as usize;
        let (status, warnings) = self.session_status();
        let capability = self.capability;

        let stmt = self.statements.get_mut(stmt_id, "stmt_fetch")?;
        let cursor = stmt
            .cursor
            .as_mut()
            .ok_or(FrontendError::CursorNotExist(stmt_id))?;
        let token = self.handle.begin_statement();
        let result = cursor
            .fetch(&mut self.io, fetch_size, capability, warnings, status, &token)
            .await;
        self.handle.end_statement();
        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                stmt.cursor = None;
                Ok(())
            }
            Err(e) => {
                // A page that failed halfway cannot be resumed.
                if let Some(cursor) = stmt.cursor.take() {
                    let _ = cursor.close().await;
                }
                Err(e)
            }
        }
    }

    async fn handle_stmt_close(&mut self, data: &[u8]) -> Result<()> {
        let stmt_id = statement_id(data)?;
        if let Some(mut stmt) = self.statements.remove(stmt_id) {
            stmt.reset().await?;
            self.session_mut()?.close_prepared(stmt_id);
        }
        Ok(())
    }

    fn handle_stmt_send_long_data(&mut self, data: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(data);
        let stmt_id = r.u32_le()?;
        let param_id = r.u16_le()?;
        let chunk = r.rest();
        match self.statements.find_mut(stmt_id) {
            Some(stmt) => stmt.append_long_data(param_id, chunk),
            None => debug!(stmt_id, "long data for unknown statement dropped"),
        }
        Ok(())
    }
}

fn strip_trailing_nul(data: &[u8]) -> &[u8] {
    match data.split_last() {
        Some((0, rest)) => rest,
        _ => data,
    }
}

fn query_text(data: &[u8]) -> String {
    lossy_string(strip_trailing_nul(data))
}
