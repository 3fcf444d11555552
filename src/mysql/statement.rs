//! Server-side state of prepared statements: parameter types, long data and
//! open cursors.

use std::collections::HashMap;

use super::protocol::{lossy_string, ColumnType, PayloadReader, CURSOR_TYPE_READ_ONLY};
use super::resultset::Cursor;
use crate::error::{FrontendError, Result};
use crate::query::{DateTimeValue, PreparedStatement, TimeValue, Value};

/// One prepared statement as the connection tracks it.
pub struct StatementState {
    pub meta: PreparedStatement,
    /// Types from the last execute that sent them; clients may omit them on
    /// later executes.
    bound_types: Vec<(ColumnType, bool)>,
    long_data: HashMap<u16, Vec<u8>>,
    pub cursor: Option<Cursor>,
}

impl StatementState {
    pub fn new(meta: PreparedStatement) -> Self {
        Self {
            meta,
            bound_types: Vec::new(),
            long_data: HashMap::new(),
            cursor: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.meta.id
    }

    pub fn num_params(&self) -> usize {
        self.meta.params.len()
    }

    pub fn append_long_data(&mut self, param_id: u16, data: &[u8]) {
        self.long_data.entry(param_id).or_default().extend_from_slice(data);
    }

    /// COM_STMT_RESET: forget long data and close any cursor.
    pub async fn reset(&mut self) -> Result<()> {
        self.long_data.clear();
        if let Some(cursor) = self.cursor.take() {
            cursor.close().await?;
        }
        Ok(())
    }
}

/// Decoded COM_STMT_EXECUTE.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub stmt_id: u32,
    pub use_cursor: bool,
    pub params: Vec<Value>,
}

/// First four bytes of every statement command.
pub fn statement_id(payload: &[u8]) -> Result<u32> {
    PayloadReader::new(payload).u32_le()
}

/// Parse an execute payload (after the command byte) against the statement
/// it targets. Long data already sent for a parameter replaces its value.
pub fn parse_execute(payload: &[u8], stmt: &mut StatementState) -> Result<ExecuteRequest> {
    let mut r = PayloadReader::new(payload);
    let stmt_id = r.u32_le()?;
    let flags = r.u8()?;
    let _iterations = r.u32_le()?;

    let n = stmt.num_params();
    let mut params = Vec::with_capacity(n);
    if n > 0 {
        let null_bitmap = r.bytes((n + 7) / 8)?;
        let new_params_bound = r.u8()?;
        if new_params_bound == 1 {
            let mut types = Vec::with_capacity(n);
            for _ in 0..n {
                let tp = r.u8()?;
                let flag = r.u8()?;
                let column_type = ColumnType::from_u8(tp)
                    .ok_or_else(|| FrontendError::malformed(format!("unknown parameter type {:#x}", tp)))?;
                types.push((column_type, flag & 0x80 != 0));
            }
            stmt.bound_types = types;
        }
        if stmt.bound_types.len() != n {
            return Err(FrontendError::malformed("parameter types were never sent"));
        }

        for i in 0..n {
            if let Some(data) = stmt.long_data.get(&(i as u16)) {
                params.push(Value::Bytes(data.clone()));
                continue;
            }
            if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                params.push(Value::Null);
                continue;
            }
            let (column_type, unsigned) = stmt.bound_types[i];
            params.push(read_binary_value(&mut r, column_type, unsigned)?);
        }
    }

    Ok(ExecuteRequest {
        stmt_id,
        use_cursor: flags & CURSOR_TYPE_READ_ONLY != 0,
        params,
    })
}

fn read_binary_value(r: &mut PayloadReader<'_>, column_type: ColumnType, unsigned: bool) -> Result<Value> {
    Ok(match column_type {
        ColumnType::Null => Value::Null,
        ColumnType::Tiny => {
            let v = r.u8()?;
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i8 as i64)
            }
        }
        ColumnType::Short | ColumnType::Year => {
            let v = r.u16_le()?;
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i16 as i64)
            }
        }
        ColumnType::Long | ColumnType::Int24 => {
            let v = r.u32_le()?;
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i32 as i64)
            }
        }
        ColumnType::LongLong => {
            let v = r.u64_le()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        ColumnType::Float => Value::Float(f32::from_bits(r.u32_le()?)),
        ColumnType::Double => Value::Double(f64::from_bits(r.u64_le()?)),
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            let d = read_binary_datetime(r)?;
            if column_type == ColumnType::Date {
                Value::Date(d)
            } else {
                Value::DateTime(d)
            }
        }
        ColumnType::Time => Value::Time(read_binary_time(r)?),
        ColumnType::Decimal | ColumnType::NewDecimal => Value::Decimal(lossy_string(r.lenenc_bytes()?)),
        _ => Value::Bytes(r.lenenc_bytes()?.to_vec()),
    })
}

fn read_binary_datetime(r: &mut PayloadReader<'_>) -> Result<DateTimeValue> {
    let len = r.u8()?;
    let mut d = DateTimeValue::default();
    match len {
        0 => {}
        4 | 7 | 11 => {
            d.year = r.u16_le()?;
            d.month = r.u8()?;
            d.day = r.u8()?;
            if len >= 7 {
                d.hour = r.u8()?;
                d.minute = r.u8()?;
                d.second = r.u8()?;
            }
            if len == 11 {
                d.micros = r.u32_le()?;
            }
        }
        other => return Err(FrontendError::malformed(format!("datetime length {}", other))),
    }
    Ok(d)
}

fn read_binary_time(r: &mut PayloadReader<'_>) -> Result<TimeValue> {
    let len = r.u8()?;
    let mut t = TimeValue::default();
    match len {
        0 => {}
        8 | 12 => {
            t.negative = r.u8()? == 1;
            t.days = r.u32_le()?;
            t.hours = r.u8()?;
            t.minutes = r.u8()?;
            t.seconds = r.u8()?;
            if len == 12 {
                t.micros = r.u32_le()?;
            }
        }
        other => return Err(FrontendError::malformed(format!("time length {}", other))),
    }
    Ok(t)
}

/// Prepared statements of one connection.
#[derive(Default)]
pub struct StatementRegistry {
    stmts: HashMap<u32, StatementState>,
}

impl StatementRegistry {
    pub fn insert(&mut self, meta: PreparedStatement) {
        self.stmts.insert(meta.id, StatementState::new(meta));
    }

    pub fn get_mut(&mut self, id: u32, command: &'static str) -> Result<&mut StatementState> {
        self.stmts
            .get_mut(&id)
            .ok_or(FrontendError::UnknownStmtHandler(id, command))
    }

    /// Silent lookup for commands that have no reply.
    pub fn find_mut(&mut self, id: u32) -> Option<&mut StatementState> {
        self.stmts.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<StatementState> {
        self.stmts.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Drop every statement, closing open cursors.
    pub async fn clear(&mut self) {
        for (_, stmt) in self.stmts.drain() {
            if let Some(cursor) = stmt.cursor {
                let _ = cursor.close().await;
            }
        }
    }
}
