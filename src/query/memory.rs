//! In-memory engine: tables from the config, a handful of statement shapes,
//! and a privilege manager over the configured users.
//!
//! This is enough to drive real MySQL clients through every protocol path.
//! It is not a SQL engine.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    Chunk, ExecResult, OkStatus, PointPrefetcher, PreparedStatement, PrivilegeManager, Privilege,
    QueryExecutor, ResultSet, Row, Session, SessionInfo, Statement, StatementKind, UserIdentity,
    Value, Warning,
};
use crate::config::{Config, TableConfig, UserConfig};
use crate::error::{FrontendError, Result, ER_NOT_SUPPORTED_YET};
use crate::expression::charset::{self, CollationContext};
use crate::mysql::auth::{self, AuthPlugin};
use crate::mysql::packet::ColumnDefinition;
use crate::mysql::protocol::{
    ColumnType, CLIENT_MULTI_STATEMENTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
};

const ER_BAD_DB: u16 = 1049;
const ER_NO_SUCH_TABLE: u16 = 1146;
const ER_BAD_FIELD: u16 = 1054;
const ER_PARSE: u16 = 1064;
const ER_WRONG_VALUE_COUNT: u16 = 1136;
const ER_NO_DB: u16 = 1046;

const BUILTIN_DATABASES: &[&str] = &["information_schema", "mysql", "test"];

#[derive(Debug, Clone)]
struct MemoryTable {
    database: String,
    name: String,
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl From<&TableConfig> for MemoryTable {
    fn from(t: &TableConfig) -> Self {
        Self {
            database: t.database.clone(),
            name: t.name.clone(),
            columns: t.columns.clone(),
            rows: t
                .rows
                .iter()
                .map(|row| row.iter().map(|cell| Value::from(cell.clone())).collect())
                .collect(),
        }
    }
}

impl MemoryTable {
    fn column_defs(&self) -> Vec<ColumnDefinition> {
        self.columns
            .iter()
            .map(|c| ColumnDefinition::new(c.clone(), ColumnType::VarString).with_table(&self.database, &self.name))
            .collect()
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                FrontendError::execution(
                    ER_BAD_FIELD,
                    "42S22",
                    format!("Unknown column '{}' in 'field list'", name),
                )
            })
    }
}

type Tables = Arc<RwLock<Vec<MemoryTable>>>;

pub struct MemoryExecutor {
    tables: Tables,
    server_version: String,
    wait_timeout_secs: u64,
    multi_statement_mode: String,
    next_stmt_id: Arc<AtomicU32>,
}

impl MemoryExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            tables: Arc::new(RwLock::new(config.tables.iter().map(MemoryTable::from).collect())),
            server_version: config.server_version.clone(),
            wait_timeout_secs: config.wait_timeout_secs,
            multi_statement_mode: format!("{:?}", config.multi_statement_mode).to_uppercase(),
            next_stmt_id: Arc::new(AtomicU32::new(1)),
        }
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn open_session(&self, info: SessionInfo) -> Result<Box<dyn Session>> {
        debug!(conn_id = info.conn_id, user = %info.identity, "opening in-memory session");
        let mut vars = HashMap::new();
        vars.insert("autocommit".to_string(), "1".to_string());
        vars.insert("version".to_string(), self.server_version.clone());
        vars.insert("version_comment".to_string(), "sqlfe in-memory engine".to_string());
        vars.insert("wait_timeout".to_string(), self.wait_timeout_secs.to_string());
        vars.insert("multi_statement_mode".to_string(), self.multi_statement_mode.clone());
        vars.insert("character_set_connection".to_string(), info.collation.charset.clone());
        vars.insert("collation_connection".to_string(), info.collation.collation.clone());
        vars.insert("tidb_allow_fallback_to_tikv".to_string(), String::new());
        Ok(Box::new(MemorySession {
            info,
            tables: self.tables.clone(),
            vars,
            current_db: None,
            status: SERVER_STATUS_AUTOCOMMIT,
            warnings: Vec::new(),
            prepared: HashMap::new(),
            next_stmt_id: self.next_stmt_id.clone(),
            engine_fallback: false,
        }))
    }
}

pub struct MemorySession {
    info: SessionInfo,
    tables: Tables,
    vars: HashMap<String, String>,
    current_db: Option<String>,
    status: u16,
    warnings: Vec<Warning>,
    prepared: HashMap<u32, PreparedStatement>,
    next_stmt_id: Arc<AtomicU32>,
    engine_fallback: bool,
}

impl MemorySession {
    fn database_exists(&self, db: &str) -> bool {
        BUILTIN_DATABASES.iter().any(|d| d.eq_ignore_ascii_case(db))
            || self.tables.read().iter().any(|t| t.database.eq_ignore_ascii_case(db))
    }

    fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = BUILTIN_DATABASES.iter().map(|s| s.to_string()).collect();
        for t in self.tables.read().iter() {
            if !dbs.iter().any(|d| d.eq_ignore_ascii_case(&t.database)) {
                dbs.push(t.database.clone());
            }
        }
        dbs.sort();
        dbs
    }

    /// Resolve `[db.]name` against the current database.
    fn table_ref(&self, reference: &str) -> Result<(String, String)> {
        let reference = reference.trim();
        match reference.split_once('.') {
            Some((db, name)) => Ok((unquote_ident(db), unquote_ident(name))),
            None => {
                let db = self.current_db.clone().ok_or_else(|| {
                    FrontendError::execution(ER_NO_DB, "3D000", "No database selected")
                })?;
                Ok((db, unquote_ident(reference)))
            }
        }
    }

    fn with_table<T>(&self, reference: &str, f: impl FnOnce(&mut MemoryTable) -> Result<T>) -> Result<T> {
        let (db, name) = self.table_ref(reference)?;
        let mut tables = self.tables.write();
        let table = tables
            .iter_mut()
            .find(|t| t.database.eq_ignore_ascii_case(&db) && t.name.eq_ignore_ascii_case(&name))
            .ok_or_else(|| {
                FrontendError::execution(
                    ER_NO_SUCH_TABLE,
                    "42S02",
                    format!("Table '{}.{}' doesn't exist", db, name),
                )
            })?;
        f(table)
    }

    async fn run(&mut self, stmt: &Statement) -> Result<ExecResult> {
        match &stmt.kind {
            StatementKind::Select => self.select(&stmt.sql).await,
            StatementKind::Use(db) => {
                if !self.database_exists(db) {
                    return Err(FrontendError::execution(
                        ER_BAD_DB,
                        "42000",
                        format!("Unknown database '{}'", db),
                    ));
                }
                self.current_db = Some(db.clone());
                Ok(ExecResult::Ok(OkStatus::default()))
            }
            StatementKind::Set => {
                self.set(&stmt.sql)?;
                Ok(ExecResult::Ok(OkStatus::default()))
            }
            StatementKind::Show => self.show(&stmt.sql),
            StatementKind::Insert => self.insert(&stmt.sql),
            StatementKind::Update => self.update(&stmt.sql),
            StatementKind::Delete => self.delete(&stmt.sql),
            StatementKind::Begin => {
                self.status |= SERVER_STATUS_IN_TRANS;
                Ok(ExecResult::Ok(OkStatus::default()))
            }
            StatementKind::Commit | StatementKind::Rollback => {
                self.status &= !SERVER_STATUS_IN_TRANS;
                Ok(ExecResult::Ok(OkStatus::default()))
            }
            StatementKind::Flush | StatementKind::Shutdown => Ok(ExecResult::Ok(OkStatus::default())),
            StatementKind::Other => {
                if strip_keyword(&stmt.sql, "do").is_some() {
                    return Ok(ExecResult::Ok(OkStatus::default()));
                }
                Err(FrontendError::execution(
                    ER_NOT_SUPPORTED_YET,
                    "42000",
                    format!("This version of the in-memory engine doesn't yet support '{}'", stmt.sql),
                ))
            }
        }
    }

    async fn select(&mut self, sql: &str) -> Result<ExecResult> {
        let body = strip_keyword(sql, "select").unwrap_or(sql);
        if let Some(pos) = find_keyword(body, "from") {
            return self.select_from(&body[..pos], &body[pos + 4..]);
        }

        let exprs = split_top_level(body, ',');
        let mut columns = Vec::with_capacity(exprs.len());
        let mut row = Vec::with_capacity(exprs.len());
        for expr in exprs {
            let expr = expr.trim();
            let value = self.eval(expr).await?;
            let column_type = match &value {
                Value::Int(_) | Value::UInt(_) => ColumnType::LongLong,
                Value::Double(_) | Value::Float(_) => ColumnType::Double,
                Value::Null => ColumnType::Null,
                _ => ColumnType::VarString,
            };
            columns.push(ColumnDefinition::new(expr, column_type));
            row.push(value);
        }
        Ok(ExecResult::Rows(Box::new(MemoryResultSet::new(columns, vec![row]))))
    }

    fn select_from(&self, projection: &str, rest: &str) -> Result<ExecResult> {
        let (rest, limit) = match find_keyword(rest, "limit") {
            Some(pos) => {
                let n = rest[pos + 5..].trim().parse::<usize>().map_err(|_| parse_error(rest))?;
                (&rest[..pos], Some(n))
            }
            None => (rest, None),
        };
        let (table_ref, filter) = match find_keyword(rest, "where") {
            Some(pos) => (&rest[..pos], Some(parse_equality(&rest[pos + 5..])?)),
            None => (rest, None),
        };

        self.with_table(table_ref, |table| {
            let all = table.column_defs();
            let projection = projection.trim();
            let picked: Vec<usize> = if projection == "*" {
                (0..table.columns.len()).collect()
            } else {
                split_top_level(projection, ',')
                    .into_iter()
                    .map(|c| table.column_index(&unquote_ident(c.trim())))
                    .collect::<Result<_>>()?
            };
            let filter = match &filter {
                Some((col, value)) => Some((table.column_index(col)?, value.clone())),
                None => None,
            };

            let rows: Vec<Row> = table
                .rows
                .iter()
                .filter(|row| match &filter {
                    Some((idx, value)) => row.get(*idx).map(|v| values_equal(v, value)).unwrap_or(false),
                    None => true,
                })
                .take(limit.unwrap_or(usize::MAX))
                .map(|row| picked.iter().map(|&i| row.get(i).cloned().unwrap_or(Value::Null)).collect())
                .collect();
            let columns = picked.iter().map(|&i| all[i].clone()).collect();
            Ok(ExecResult::Rows(Box::new(MemoryResultSet::new(columns, rows))))
        })
    }

    async fn eval(&self, expr: &str) -> Result<Value> {
        if let Some(v) = parse_literal(expr) {
            return Ok(v);
        }
        let lower = expr.to_ascii_lowercase();
        if let Some(var) = lower.strip_prefix("@@") {
            let var = var
                .strip_prefix("session.")
                .or_else(|| var.strip_prefix("global."))
                .unwrap_or(var);
            return Ok(self.vars.get(var).cloned().map(Value::from).unwrap_or(Value::Null));
        }
        if let Some(arg) = call_arg(&lower, "sleep") {
            let secs: f64 = arg.trim().parse().map_err(|_| parse_error(expr))?;
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
            return Ok(Value::Int(0));
        }
        match lower.as_str() {
            "database()" | "schema()" => Ok(Value::from(self.current_db.clone())),
            "version()" => Ok(Value::from(self.vars.get("version").cloned())),
            "connection_id()" => Ok(Value::UInt(self.info.conn_id)),
            "user()" | "current_user()" => Ok(Value::from(self.info.identity.to_string())),
            _ => Err(parse_error(expr)),
        }
    }

    fn set(&mut self, sql: &str) -> Result<()> {
        let body = strip_keyword(sql, "set").unwrap_or(sql).trim();
        if let Some(names) = strip_keyword(body, "names") {
            let mut parts = names.split_whitespace();
            let cs = parts.next().map(unquote_literal).ok_or_else(|| parse_error(sql))?;
            let collation = match (parts.next(), parts.next()) {
                (Some(kw), Some(c)) if kw.eq_ignore_ascii_case("collate") => unquote_literal(c),
                _ => charset::charset_by_name(&cs)
                    .map(|c| c.default_collation.to_string())
                    .ok_or_else(|| FrontendError::execution(1115, "42000", format!("Unknown character set: '{}'", cs)))?,
            };
            self.set_session_var("character_set_connection", &cs)?;
            return self.set_session_var("collation_connection", &collation);
        }
        for assignment in split_top_level(body, ',') {
            let (name, value) = assignment.split_once('=').ok_or_else(|| parse_error(sql))?;
            let mut name = name.trim().to_ascii_lowercase();
            for prefix in ["@@session.", "@@global.", "@@", "session ", "global "] {
                if let Some(stripped) = name.strip_prefix(prefix) {
                    name = stripped.trim().to_string();
                }
            }
            self.set_session_var(&name, &unquote_literal(value.trim()))?;
        }
        Ok(())
    }

    fn show(&self, sql: &str) -> Result<ExecResult> {
        let body = strip_keyword(sql, "show").unwrap_or(sql).trim().to_ascii_lowercase();
        let single = |name: &str, values: Vec<String>| {
            let columns = vec![ColumnDefinition::new(name, ColumnType::VarString)];
            let rows = values.into_iter().map(|v| vec![Value::from(v)]).collect();
            ExecResult::Rows(Box::new(MemoryResultSet::new(columns, rows)))
        };
        match body.as_str() {
            "databases" => Ok(single("Database", self.databases())),
            "tables" => {
                let db = self.current_db.clone().ok_or_else(|| {
                    FrontendError::execution(ER_NO_DB, "3D000", "No database selected")
                })?;
                let names = self
                    .tables
                    .read()
                    .iter()
                    .filter(|t| t.database.eq_ignore_ascii_case(&db))
                    .map(|t| t.name.clone())
                    .collect();
                Ok(single(&format!("Tables_in_{}", db), names))
            }
            "warnings" => {
                let columns = vec![
                    ColumnDefinition::new("Level", ColumnType::VarString),
                    ColumnDefinition::new("Code", ColumnType::Long),
                    ColumnDefinition::new("Message", ColumnType::VarString),
                ];
                let rows = self
                    .warnings
                    .iter()
                    .map(|w| {
                        vec![
                            Value::from(w.level.as_str()),
                            Value::Int(w.code as i64),
                            Value::from(w.message.clone()),
                        ]
                    })
                    .collect();
                Ok(ExecResult::Rows(Box::new(MemoryResultSet::new(columns, rows))))
            }
            _ => Err(parse_error(sql)),
        }
    }

    fn insert(&mut self, sql: &str) -> Result<ExecResult> {
        let body = strip_keyword(sql, "insert")
            .or_else(|| strip_keyword(sql, "replace"))
            .unwrap_or(sql);
        let body = strip_keyword(body, "into").unwrap_or(body);
        let pos = find_keyword(body, "values").ok_or_else(|| parse_error(sql))?;
        let (table_ref, values) = (&body[..pos], &body[pos + 6..]);

        let mut rows = Vec::new();
        for tuple in split_top_level(values, ',') {
            let inner = tuple
                .trim()
                .strip_prefix('(')
                .and_then(|t| t.strip_suffix(')'))
                .ok_or_else(|| parse_error(sql))?;
            let row = split_top_level(inner, ',')
                .into_iter()
                .map(|v| parse_literal(v.trim()).ok_or_else(|| parse_error(v)))
                .collect::<Result<Row>>()?;
            rows.push(row);
        }

        self.with_table(table_ref, |table| {
            for (i, row) in rows.iter().enumerate() {
                if row.len() != table.columns.len() {
                    return Err(FrontendError::execution(
                        ER_WRONG_VALUE_COUNT,
                        "21S01",
                        format!("Column count doesn't match value count at row {}", i + 1),
                    ));
                }
            }
            let affected = rows.len() as u64;
            table.rows.extend(rows);
            Ok(ExecResult::Ok(OkStatus {
                affected_rows: affected,
                ..OkStatus::default()
            }))
        })
    }

    fn update(&mut self, sql: &str) -> Result<ExecResult> {
        let body = strip_keyword(sql, "update").unwrap_or(sql);
        let set_pos = find_keyword(body, "set").ok_or_else(|| parse_error(sql))?;
        let table_ref = &body[..set_pos];
        let rest = &body[set_pos + 3..];
        let (assignments, filter) = match find_keyword(rest, "where") {
            Some(pos) => (&rest[..pos], Some(parse_equality(&rest[pos + 5..])?)),
            None => (rest, None),
        };
        let assignments = split_top_level(assignments, ',')
            .into_iter()
            .map(parse_equality)
            .collect::<Result<Vec<_>>>()?;

        self.with_table(table_ref, |table| {
            let targets = assignments
                .iter()
                .map(|(col, v)| Ok((table.column_index(col)?, v.clone())))
                .collect::<Result<Vec<_>>>()?;
            let filter = match &filter {
                Some((col, v)) => Some((table.column_index(col)?, v.clone())),
                None => None,
            };
            let mut affected = 0;
            for row in table.rows.iter_mut() {
                if let Some((idx, v)) = &filter {
                    if !row.get(*idx).map(|cell| values_equal(cell, v)).unwrap_or(false) {
                        continue;
                    }
                }
                for (idx, v) in &targets {
                    if let Some(cell) = row.get_mut(*idx) {
                        *cell = v.clone();
                    }
                }
                affected += 1;
            }
            Ok(ExecResult::Ok(OkStatus {
                affected_rows: affected,
                info: format!("Rows matched: {}  Changed: {}  Warnings: 0", affected, affected),
                ..OkStatus::default()
            }))
        })
    }

    fn delete(&mut self, sql: &str) -> Result<ExecResult> {
        let body = strip_keyword(sql, "delete").unwrap_or(sql);
        let body = strip_keyword(body, "from").ok_or_else(|| parse_error(sql))?;
        let (table_ref, filter) = match find_keyword(body, "where") {
            Some(pos) => (&body[..pos], Some(parse_equality(&body[pos + 5..])?)),
            None => (body, None),
        };
        self.with_table(table_ref, |table| {
            let before = table.rows.len();
            match &filter {
                Some((col, v)) => {
                    let idx = table.column_index(col)?;
                    table
                        .rows
                        .retain(|row| !row.get(idx).map(|cell| values_equal(cell, v)).unwrap_or(false));
                }
                None => table.rows.clear(),
            }
            Ok(ExecResult::Ok(OkStatus {
                affected_rows: (before - table.rows.len()) as u64,
                ..OkStatus::default()
            }))
        })
    }

    /// Point lookups: `... FROM|UPDATE table ... WHERE col = literal`.
    fn point_key(&self, stmt: &Statement) -> Option<(String, String, Value)> {
        let body = match stmt.kind {
            StatementKind::Select => {
                let rest = strip_keyword(&stmt.sql, "select")?;
                let pos = find_keyword(rest, "from")?;
                &rest[pos + 4..]
            }
            StatementKind::Update => strip_keyword(&stmt.sql, "update")?,
            _ => return None,
        };
        let where_pos = find_keyword(body, "where")?;
        let table_ref = match find_keyword(&body[..where_pos], "set") {
            Some(set_pos) => &body[..set_pos],
            None => &body[..where_pos],
        };
        let (col, value) = parse_equality(&body[where_pos + 5..]).ok()?;
        let (db, table) = self.table_ref(table_ref).ok()?;
        Some((format!("{}.{}", db, table), col, value))
    }
}

#[async_trait]
impl Session for MemorySession {
    fn conn_id(&self) -> u64 {
        self.info.conn_id
    }

    fn identity(&self) -> &UserIdentity {
        &self.info.identity
    }

    fn current_db(&self) -> Option<String> {
        self.current_db.clone()
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn collation(&self) -> CollationContext {
        let collation = self
            .vars
            .get("collation_connection")
            .map(String::as_str)
            .unwrap_or(charset::DEFAULT_COLLATION);
        CollationContext::from_collation_name(collation).unwrap_or_default()
    }

    fn session_var(&self, name: &str) -> Option<String> {
        self.vars.get(&name.to_ascii_lowercase()).cloned()
    }

    fn set_session_var(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.to_ascii_lowercase();
        if name == "autocommit" {
            match value.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => self.status |= SERVER_STATUS_AUTOCOMMIT,
                "0" | "off" | "false" => self.status &= !SERVER_STATUS_AUTOCOMMIT,
                _ => {
                    return Err(FrontendError::execution(
                        1231,
                        "42000",
                        format!("Variable 'autocommit' can't be set to the value of '{}'", value),
                    ))
                }
            }
        }
        self.vars.insert(name, value.to_string());
        Ok(())
    }

    fn set_client_capability(&mut self, capability: u32) {
        self.info.capability = capability;
        let multi = capability & CLIENT_MULTI_STATEMENTS != 0;
        debug!(conn_id = self.info.conn_id, multi_statements = multi, "client capability updated");
    }

    fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    fn append_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    async fn parse(&mut self, sql: &str) -> Result<Vec<Statement>> {
        Ok(split_statements(sql)
            .into_iter()
            .map(|s| {
                let kind = classify(&s);
                Statement::new(s, kind)
            })
            .collect())
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let keeps_warnings = stmt.kind == StatementKind::Show
            && stmt.sql.to_ascii_lowercase().contains("warnings");
        if !keeps_warnings {
            self.warnings.clear();
        }
        self.run(stmt).await
    }

    async fn field_list(&mut self, table: &str) -> Result<Vec<ColumnDefinition>> {
        self.with_table(table, |t| Ok(t.column_defs()))
    }

    async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        let param_count = count_placeholders(sql);
        let stmt = Statement::new(sql, classify(sql));
        let columns = match stmt.kind {
            StatementKind::Select => {
                let probe = bind_placeholders(sql, &vec![Value::Null; param_count]);
                match self.run(&Statement::new(probe, StatementKind::Select)).await? {
                    ExecResult::Rows(rs) => rs.columns().to_vec(),
                    ExecResult::Ok(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        };
        let id = self.next_stmt_id.fetch_add(1, Ordering::SeqCst);
        let prepared = PreparedStatement {
            id,
            sql: sql.to_string(),
            params: (0..param_count)
                .map(|_| ColumnDefinition::new("?", ColumnType::VarString))
                .collect(),
            columns,
        };
        self.prepared.insert(id, prepared.clone());
        Ok(prepared)
    }

    async fn execute_prepared(&mut self, stmt_id: u32, params: &[Value]) -> Result<ExecResult> {
        let sql = self
            .prepared
            .get(&stmt_id)
            .map(|p| p.sql.clone())
            .ok_or(FrontendError::UnknownStmtHandler(stmt_id, "EXECUTE"))?;
        let bound = bind_placeholders(&sql, params);
        let kind = classify(&bound);
        self.execute(&Statement::new(bound, kind)).await
    }

    fn close_prepared(&mut self, stmt_id: u32) {
        self.prepared.remove(&stmt_id);
    }

    fn allow_engine_fallback(&self) -> bool {
        self.vars
            .get("tidb_allow_fallback_to_tikv")
            .map(|v| v.to_ascii_lowercase().contains("tiflash"))
            .unwrap_or(false)
    }

    fn set_engine_fallback(&mut self, active: bool) {
        self.engine_fallback = active;
    }

    fn point_prefetcher(&mut self) -> Option<&mut dyn PointPrefetcher> {
        Some(self)
    }

    async fn close(&mut self) -> Result<()> {
        self.prepared.clear();
        Ok(())
    }
}

#[async_trait]
impl PointPrefetcher for MemorySession {
    async fn prefetch_point_keys(&mut self, stmts: &[Statement]) -> Result<usize> {
        // Only inside an explicit transaction, where the snapshot is stable.
        if !self.in_transaction() {
            return Ok(0);
        }
        let keys: Vec<_> = stmts.iter().filter_map(|s| self.point_key(s)).collect();
        let mut fetched = 0;
        for (table_ref, col, value) in &keys {
            let hit = self
                .with_table(table_ref, |t| {
                    let idx = t.column_index(col)?;
                    Ok(t.rows.iter().any(|r| r.get(idx).map(|c| values_equal(c, value)).unwrap_or(false)))
                })
                .unwrap_or(false);
            if hit {
                fetched += 1;
            }
        }
        self.vars
            .insert("last_prefetch_keys".to_string(), fetched.to_string());
        Ok(fetched)
    }
}

pub struct MemoryResultSet {
    columns: Vec<ColumnDefinition>,
    rows: VecDeque<Row>,
}

impl MemoryResultSet {
    pub fn new(columns: Vec<ColumnDefinition>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

#[async_trait]
impl ResultSet for MemoryResultSet {
    fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    async fn next(&mut self, chunk: &mut Chunk) -> Result<()> {
        chunk.clear();
        while !chunk.is_full() {
            match self.rows.pop_front() {
                Some(row) => chunk.push(row),
                None => break,
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

struct Account {
    config: UserConfig,
    native_hash: [u8; 20],
    sha2_hash: [u8; 32],
}

/// Accounts from the config file.
pub struct StaticPrivilegeManager {
    accounts: Vec<Account>,
}

impl StaticPrivilegeManager {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            accounts: users
                .iter()
                .map(|u| Account {
                    native_hash: auth::native_password_hash(&u.password),
                    sha2_hash: auth::caching_sha2_hash(&u.password),
                    config: u.clone(),
                })
                .collect(),
        }
    }

    fn find(&self, identity: &UserIdentity) -> Option<&Account> {
        self.accounts
            .iter()
            .find(|a| a.config.name == identity.user && host_matches(&a.config.host, &identity.host))
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern {
        "%" => true,
        "localhost" => matches!(host, "" | "localhost" | "127.0.0.1" | "::1"),
        other => other.eq_ignore_ascii_case(host),
    }
}

#[async_trait]
impl PrivilegeManager for StaticPrivilegeManager {
    async fn auth_plugin_for_user(&self, identity: &UserIdentity) -> Result<String> {
        self.find(identity)
            .map(|a| a.config.plugin.clone())
            .ok_or_else(|| FrontendError::AccessDenied {
                user: identity.user.clone(),
                host: identity.host.clone(),
                using_password: false,
            })
    }

    async fn authenticate(
        &self,
        identity: &UserIdentity,
        plugin: AuthPlugin,
        auth_data: &[u8],
        salt: &[u8],
    ) -> Result<bool> {
        let account = match self.find(identity) {
            Some(a) => a,
            None => return Ok(false),
        };
        let ok = match plugin {
            AuthPlugin::AuthSocket => {
                let expected = account.config.socket_user.as_deref().unwrap_or(&account.config.name);
                auth_data == expected.as_bytes()
            }
            _ if account.config.password.is_empty() => auth_data.is_empty(),
            AuthPlugin::NativePassword => auth::verify_native_password(auth_data, salt, &account.native_hash),
            // After the fast-auth failure the client sends its password in clear.
            AuthPlugin::CachingSha2Password => auth::verify_caching_sha2_cleartext(auth_data, &account.sha2_hash),
        };
        if !ok {
            info!(user = %identity, plugin = %plugin, "credential check failed");
        }
        Ok(ok)
    }

    fn has_privilege(&self, identity: &UserIdentity, privilege: Privilege) -> bool {
        match self.find(identity) {
            Some(a) => match privilege {
                Privilege::ConnectionAdmin | Privilege::Super | Privilege::Shutdown | Privilege::Reload => {
                    a.config.connection_admin
                }
            },
            None => false,
        }
    }
}

fn parse_error(near: &str) -> FrontendError {
    FrontendError::execution(
        ER_PARSE,
        "42000",
        format!("You have an error in your SQL syntax near '{}'", near.trim()),
    )
}

/// Split on `;` outside quotes, dropping empty statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    split_top_level(sql, ';')
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn classify(sql: &str) -> StatementKind {
    let sql = sql.trim_start();
    let word: String = sql
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "select" => StatementKind::Select,
        "use" => {
            let db = sql[3..].trim().trim_end_matches(';');
            StatementKind::Use(unquote_ident(db))
        }
        "set" => StatementKind::Set,
        "show" => StatementKind::Show,
        "insert" | "replace" => StatementKind::Insert,
        "update" => StatementKind::Update,
        "delete" => StatementKind::Delete,
        "begin" | "start" => StatementKind::Begin,
        "commit" => StatementKind::Commit,
        "rollback" => StatementKind::Rollback,
        "flush" => StatementKind::Flush,
        "shutdown" => StatementKind::Shutdown,
        _ => StatementKind::Other,
    }
}

/// Split on `sep` where it is outside quotes and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Byte offset of `keyword` as a whole word outside quotes.
fn find_keyword(s: &str, keyword: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let kw = keyword.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if b == b'\'' || b == b'"' || b == b'`' {
            quote = Some(b);
            i += 1;
            continue;
        }
        let end = i + kw.len();
        if end <= bytes.len()
            && bytes[i..end].eq_ignore_ascii_case(kw)
            && (i == 0 || !is_word_byte(bytes[i - 1]))
            && (end == bytes.len() || !is_word_byte(bytes[end]))
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &s[keyword.len()..];
    match rest.bytes().next() {
        None => Some(rest),
        Some(b) if !is_word_byte(b) => Some(rest),
        _ => None,
    }
}

fn call_arg<'a>(expr: &'a str, func: &str) -> Option<&'a str> {
    expr.strip_prefix(func)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn unquote_ident(s: &str) -> String {
    s.trim().trim_matches('`').to_string()
}

fn unquote_literal(s: &str) -> String {
    match parse_literal(s) {
        Some(Value::Bytes(b)) => String::from_utf8_lossy(&b).into_owned(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => s.trim().to_string(),
    }
}

/// `col = literal`.
fn parse_equality(s: &str) -> Result<(String, Value)> {
    let (col, value) = s.split_once('=').ok_or_else(|| parse_error(s))?;
    let value = parse_literal(value.trim()).ok_or_else(|| parse_error(s))?;
    Ok((unquote_ident(col), value))
}

fn parse_literal(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("null") {
        return Some(Value::Null);
    }
    if let Some(q) = s.chars().next().filter(|c| *c == '\'' || *c == '"') {
        let inner = s.strip_prefix(q)?.strip_suffix(q)?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    '0' => out.push('\0'),
                    other => out.push(other),
                },
                c if c == q => {
                    // doubled quote
                    chars.next();
                    out.push(q);
                }
                c => out.push(c),
            }
        }
        return Some(Value::from(out));
    }
    if let Ok(v) = s.parse::<i64>() {
        return Some(Value::Int(v));
    }
    if let Ok(v) = s.parse::<u64>() {
        return Some(Value::UInt(v));
    }
    if s.bytes().next().map(|b| b.is_ascii_digit() || b == b'-' || b == b'.').unwrap_or(false) {
        if let Ok(v) = s.parse::<f64>() {
            return Some(Value::Double(v));
        }
    }
    None
}

fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.to_text() == b.to_text()
}

fn count_placeholders(sql: &str) -> usize {
    placeholder_positions(sql).len()
}

fn placeholder_positions(sql: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in sql.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '?' => positions.push(i),
            _ => {}
        }
    }
    positions
}

/// Substitute `?` placeholders with SQL literals. Missing params bind NULL.
fn bind_placeholders(sql: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut last = 0;
    for (n, pos) in placeholder_positions(sql).into_iter().enumerate() {
        out.push_str(&sql[last..pos]);
        out.push_str(&sql_literal(params.get(n).unwrap_or(&Value::Null)));
        last = pos + 1;
    }
    out.push_str(&sql[last..]);
    out
}

fn sql_literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Double(_) | Value::Decimal(_) => {
            v.to_string()
        }
        other => format!("'{}'", other.to_string().replace('\\', "\\\\").replace('\'', "''")),
    }
}
