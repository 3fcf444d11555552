//! Result set streaming in the text and binary row formats.
//!
//! Column metadata is only written after the first successful pull from the
//! result set. If that first pull fails nothing has reached the client yet,
//! so the caller may retry the statement elsewhere.

use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::PacketIo;
use super::packet::{ColumnDefinition, EofPacket};
use super::protocol::*;
use crate::error::{FrontendError, Result};
use crate::query::{Chunk, DateTimeValue, ResultSet, Row, TimeValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY results.
    Text,
    /// COM_STMT_EXECUTE and COM_STMT_FETCH results.
    Binary,
}

/// Pull the next chunk, giving up as soon as `cancel` fires.
async fn pull(
    rs: &mut dyn ResultSet,
    chunk: &mut Chunk,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    chunk.clear();
    match cancel {
        Some(token) => tokio::select! {
            r = rs.next(chunk) => r,
            _ = token.cancelled() => Err(FrontendError::QueryInterrupted),
        },
        None => rs.next(chunk).await,
    }
}

pub async fn write_eof<S>(io: &mut PacketIo<S>, capability: u32, warnings: u16, status: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let eof = EofPacket {
        warnings,
        status_flags: status,
    };
    io.write_packet(&eof.encode(capability)).await
}

/// Column count, one packet per column, then EOF.
pub async fn write_column_info<S>(
    io: &mut PacketIo<S>,
    capability: u32,
    columns: &[ColumnDefinition],
    warnings: u16,
    status: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(9);
    write_lenenc_int(&mut buf, columns.len() as u64);
    io.write_packet(&buf).await?;
    for column in columns {
        io.write_packet(&column.encode()).await?;
    }
    write_eof(io, capability, warnings, status).await
}

/// Definitions followed by EOF, without a count. Used for prepare responses
/// and COM_FIELD_LIST.
pub async fn write_definitions<S>(
    io: &mut PacketIo<S>,
    capability: u32,
    columns: &[ColumnDefinition],
    status: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for column in columns {
        io.write_packet(&column.encode()).await?;
    }
    write_eof(io, capability, 0, status).await
}

/// Stream a whole result set and close it.
///
/// Returns whether a failure is retryable: only when the very first pull
/// failed and therefore nothing was written.
pub async fn write_result<S>(
    io: &mut PacketIo<S>,
    rs: &mut dyn ResultSet,
    format: RowFormat,
    capability: u32,
    warnings: u16,
    status: u16,
    cancel: Option<&CancellationToken>,
) -> (bool, Result<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let outcome = write_chunks(io, rs, format, capability, warnings, status, cancel).await;
    if let Err(e) = rs.close().await {
        warn!("closing result set failed: {}", e);
    }
    outcome
}

async fn write_chunks<S>(
    io: &mut PacketIo<S>,
    rs: &mut dyn ResultSet,
    format: RowFormat,
    capability: u32,
    warnings: u16,
    status: u16,
    cancel: Option<&CancellationToken>,
) -> (bool, Result<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut chunk = Chunk::default();
    if let Err(e) = pull(rs, &mut chunk, cancel).await {
        return (true, Err(e));
    }

    let result: Result<()> = async {
        let columns = rs.columns().to_vec();
        write_column_info(io, capability, &columns, warnings, status).await?;
        let mut rows = 0usize;
        while !chunk.is_empty() {
            for row in chunk.rows() {
                let payload = match format {
                    RowFormat::Text => encode_text_row(row),
                    RowFormat::Binary => encode_binary_row(&columns, row)?,
                };
                io.write_packet(&payload).await?;
            }
            rows += chunk.len();
            pull(rs, &mut chunk, cancel).await?;
        }
        debug!(rows, "result set streamed");
        write_eof(io, capability, warnings, status).await
    }
    .await;
    (false, result)
}

/// Server-side paging buffer behind COM_STMT_FETCH.
pub struct Cursor {
    rs: Box<dyn ResultSet>,
    columns: Vec<ColumnDefinition>,
    buffered: VecDeque<Row>,
    exhausted: bool,
}

impl Cursor {
    /// Performs the first pull. A failure here is as retryable as the first
    /// pull of a streamed result.
    pub async fn open(mut rs: Box<dyn ResultSet>, cancel: Option<&CancellationToken>) -> Result<Self> {
        let mut chunk = Chunk::default();
        if let Err(e) = pull(rs.as_mut(), &mut chunk, cancel).await {
            let _ = rs.close().await;
            return Err(e);
        }
        let exhausted = chunk.is_empty();
        Ok(Self {
            columns: rs.columns().to_vec(),
            buffered: chunk.take_rows().into(),
            exhausted,
            rs,
        })
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    async fn fill(&mut self, want: usize, cancel: &CancellationToken) -> Result<()> {
        let mut chunk = Chunk::default();
        while !self.exhausted && self.buffered.len() < want {
            pull(self.rs.as_mut(), &mut chunk, Some(cancel)).await?;
            if chunk.is_empty() {
                self.exhausted = true;
            } else {
                self.buffered.extend(chunk.take_rows());
            }
        }
        Ok(())
    }

    /// Write up to `fetch_size` binary rows and the closing EOF. Returns true
    /// once the last row has been sent; the result set is closed by then.
    pub async fn fetch<S>(
        &mut self,
        io: &mut PacketIo<S>,
        fetch_size: usize,
        capability: u32,
        warnings: u16,
        status: u16,
        cancel: &CancellationToken,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let fetch_size = fetch_size.max(1);
        // One row past the page tells us whether this page is the last one.
        self.fill(fetch_size + 1, cancel).await?;
        let n = fetch_size.min(self.buffered.len());
        for row in self.buffered.drain(..n) {
            io.write_packet(&encode_binary_row(&self.columns, &row)?).await?;
        }

        let done = self.exhausted && self.buffered.is_empty();
        let mut status = status | SERVER_STATUS_CURSOR_EXISTS;
        if done {
            status &= !SERVER_STATUS_CURSOR_EXISTS;
            status |= SERVER_STATUS_LAST_ROW_SENT;
            self.rs.close().await?;
        }
        write_eof(io, capability, warnings, status).await?;
        Ok(done)
    }

    pub async fn close(mut self) -> Result<()> {
        self.rs.close().await
    }
}

/// Text protocol row: every value length-encoded, NULL as 0xfb.
pub fn encode_text_row(row: &[Value]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(row.len() * 8);
    for value in row {
        match value.to_text() {
            Some(text) => write_lenenc_bytes(&mut buf, &text),
            None => buf.put_u8(NULL_VALUE),
        }
    }
    buf
}

/// Binary protocol row: 0x00, a null bitmap offset by two bits, then each
/// non-NULL value encoded by its column type.
pub fn encode_binary_row(columns: &[ColumnDefinition], row: &[Value]) -> Result<BytesMut> {
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let mut buf = BytesMut::with_capacity(1 + bitmap_len + row.len() * 8);
    buf.put_u8(OK_HEADER);
    let bitmap_at = buf.len();
    buf.put_bytes(0, bitmap_len);

    for (i, column) in columns.iter().enumerate() {
        let value = row.get(i).unwrap_or(&Value::Null);
        if value.is_null() {
            let bit = i + 2;
            buf[bitmap_at + bit / 8] |= 1 << (bit % 8);
            continue;
        }
        encode_binary_value(&mut buf, column, value)?;
    }
    Ok(buf)
}

fn encode_binary_value(buf: &mut BytesMut, column: &ColumnDefinition, value: &Value) -> Result<()> {
    match column.column_type {
        ColumnType::Tiny => buf.put_u8(as_i64(value, column)? as u8),
        ColumnType::Short | ColumnType::Year => buf.put_u16_le(as_i64(value, column)? as u16),
        ColumnType::Long | ColumnType::Int24 => buf.put_u32_le(as_i64(value, column)? as u32),
        ColumnType::LongLong => match value {
            Value::UInt(v) => buf.put_u64_le(*v),
            other => buf.put_u64_le(as_i64(other, column)? as u64),
        },
        ColumnType::Float => buf.put_f32_le(as_f64(value, column)? as f32),
        ColumnType::Double => buf.put_f64_le(as_f64(value, column)?),
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => match value {
            Value::Date(d) | Value::DateTime(d) => write_binary_datetime(buf, d),
            other => write_lenenc_bytes(buf, &other.to_text().unwrap_or_default()),
        },
        ColumnType::Time => match value {
            Value::Time(t) => write_binary_time(buf, t),
            other => write_lenenc_bytes(buf, &other.to_text().unwrap_or_default()),
        },
        _ => write_lenenc_bytes(buf, &value.to_text().unwrap_or_default()),
    }
    Ok(())
}

fn conversion_error(value: &Value, column: &ColumnDefinition) -> FrontendError {
    FrontendError::execution(
        ER_TRUNCATED_WRONG_VALUE,
        "22007",
        format!(
            "Truncated incorrect {:?} value: '{}' for column '{}'",
            column.column_type, value, column.name
        ),
    )
}

const ER_TRUNCATED_WRONG_VALUE: u16 = 1292;

fn as_i64(value: &Value, column: &ColumnDefinition) -> Result<i64> {
    match value {
        Value::Int(v) => Ok(*v),
        Value::UInt(v) => Ok(*v as i64),
        Value::Float(v) => Ok(*v as i64),
        Value::Double(v) => Ok(*v as i64),
        Value::Decimal(s) => s
            .parse::<f64>()
            .map(|v| v as i64)
            .map_err(|_| conversion_error(value, column)),
        Value::Bytes(b) => std::str::from_utf8(b)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| conversion_error(value, column)),
        _ => Err(conversion_error(value, column)),
    }
}

fn as_f64(value: &Value, column: &ColumnDefinition) -> Result<f64> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::UInt(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v as f64),
        Value::Double(v) => Ok(*v),
        Value::Decimal(_) | Value::Bytes(_) => value
            .to_text()
            .and_then(|t| String::from_utf8(t).ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| conversion_error(value, column)),
        _ => Err(conversion_error(value, column)),
    }
}

fn write_binary_datetime(buf: &mut BytesMut, d: &DateTimeValue) {
    let has_time = d.hour != 0 || d.minute != 0 || d.second != 0;
    let len: u8 = if d.micros != 0 {
        11
    } else if has_time {
        7
    } else if d.year != 0 || d.month != 0 || d.day != 0 {
        4
    } else {
        0
    };
    buf.put_u8(len);
    if len >= 4 {
        buf.put_u16_le(d.year);
        buf.put_u8(d.month);
        buf.put_u8(d.day);
    }
    if len >= 7 {
        buf.put_u8(d.hour);
        buf.put_u8(d.minute);
        buf.put_u8(d.second);
    }
    if len == 11 {
        buf.put_u32_le(d.micros);
    }
}

fn write_binary_time(buf: &mut BytesMut, t: &TimeValue) {
    let zero = t.days == 0 && t.hours == 0 && t.minutes == 0 && t.seconds == 0;
    let len: u8 = if t.micros != 0 {
        12
    } else if !zero {
        8
    } else {
        0
    };
    buf.put_u8(len);
    if len >= 8 {
        buf.put_u8(t.negative as u8);
        buf.put_u32_le(t.days);
        buf.put_u8(t.hours);
        buf.put_u8(t.minutes);
        buf.put_u8(t.seconds);
    }
    if len == 12 {
        buf.put_u32_le(t.micros);
    }
}
