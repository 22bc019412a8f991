//! Batch payload decoder
//!
//! Layout, big-endian throughout:
//!
//! ```text
//! u32 row_count
//! row_count x (for each column in schema order):
//!     u8  null indicator (nonzero = null, nothing else follows)
//!     INTEGER  i32
//!     BIGINT   i64
//!     DOUBLE   f64
//!     VARCHAR  u16 length + UTF-8 bytes
//! ```
//!
//! Values are appended straight into per-column Arrow builders as rows are
//! walked, so the output is columnar without an intermediate row form.

use std::sync::Arc;

use arrow_array::builder::{Float64Builder, Int32Builder, Int64Builder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch, RecordBatchOptions};
use bytes::Buf;
use exbridge_common::{BridgeError, Result};

use crate::schema::{ColumnSchema, LogicalType};

/// Sequential reader over a batch payload; every read is bounds-checked.
struct PayloadCursor<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            len: buf.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn require(&self, needed: usize) -> std::result::Result<(), Truncated> {
        if self.buf.remaining() < needed {
            return Err(Truncated {
                needed,
                offset: self.len - self.buf.remaining(),
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> std::result::Result<u8, Truncated> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> std::result::Result<u16, Truncated> {
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> std::result::Result<u32, Truncated> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> std::result::Result<i32, Truncated> {
        self.require(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> std::result::Result<i64, Truncated> {
        self.require(8)?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> std::result::Result<f64, Truncated> {
        self.require(8)?;
        Ok(self.buf.get_f64())
    }

    fn bytes(&mut self, n: usize) -> std::result::Result<&'a [u8], Truncated> {
        self.require(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

#[derive(Debug)]
struct Truncated {
    needed: usize,
    offset: usize,
    remaining: usize,
}

impl Truncated {
    fn into_error(self, context: &str) -> BridgeError {
        BridgeError::BatchDecode(format!(
            "{context}: need {} bytes at offset {}, only {} remaining",
            self.needed, self.offset, self.remaining
        ))
    }
}

/// Builder sizing for a payload declaring `row_count` rows over `columns`
/// columns with `remaining` bytes left: `(rows, string bytes per column)`.
///
/// Each value costs at least its indicator byte, so no column can hold more
/// than `remaining / columns` rows, and the string bytes of all columns
/// together fit in `remaining`.
fn builder_capacity(row_count: usize, remaining: usize, columns: usize) -> (usize, usize) {
    let per_column = remaining / columns.max(1);
    (row_count.min(per_column), per_column)
}

enum ColumnBuilder {
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
}

impl ColumnBuilder {
    fn new(logical_type: LogicalType, rows: usize, string_bytes: usize) -> Self {
        match logical_type {
            LogicalType::Integer => ColumnBuilder::Int32(Int32Builder::with_capacity(rows)),
            LogicalType::BigInt => ColumnBuilder::Int64(Int64Builder::with_capacity(rows)),
            LogicalType::Double => ColumnBuilder::Float64(Float64Builder::with_capacity(rows)),
            LogicalType::Varchar => {
                ColumnBuilder::Utf8(StringBuilder::with_capacity(rows, string_bytes))
            }
        }
    }

    fn append_null(&mut self) {
        match self {
            ColumnBuilder::Int32(b) => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_null(),
            ColumnBuilder::Utf8(b) => b.append_null(),
        }
    }

    fn append_from(&mut self, cursor: &mut PayloadCursor<'_>) -> std::result::Result<(), Truncated> {
        match self {
            ColumnBuilder::Int32(b) => b.append_value(cursor.i32()?),
            ColumnBuilder::Int64(b) => b.append_value(cursor.i64()?),
            ColumnBuilder::Float64(b) => b.append_value(cursor.f64()?),
            ColumnBuilder::Utf8(b) => {
                let len = cursor.u16()? as usize;
                b.append_value(String::from_utf8_lossy(cursor.bytes(len)?));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Int32(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
        }
    }
}

/// Decodes batch payloads against one negotiated schema.
#[derive(Debug, Clone)]
pub struct BatchDecoder {
    schema: Arc<ColumnSchema>,
}

impl BatchDecoder {
    pub fn new(schema: Arc<ColumnSchema>) -> Self {
        Self { schema }
    }

    /// Decode one non-empty batch payload into a record batch whose columns
    /// follow schema order.
    pub fn decode(&self, payload: &[u8]) -> Result<RecordBatch> {
        let mut cursor = PayloadCursor::new(payload);
        let row_count = cursor.u32().map_err(|t| t.into_error("row count"))? as usize;

        tracing::debug!(
            "Parsing batch: {} rows, {} columns",
            row_count,
            self.schema.len()
        );

        let options = RecordBatchOptions::new().with_row_count(Some(row_count));
        if self.schema.is_empty() {
            return Ok(RecordBatch::try_new_with_options(
                self.schema.arrow_schema(),
                vec![],
                &options,
            )?);
        }

        let (rows, string_bytes) =
            builder_capacity(row_count, cursor.remaining(), self.schema.len());
        let mut builders: Vec<ColumnBuilder> = self
            .schema
            .columns()
            .iter()
            .map(|c| ColumnBuilder::new(c.logical_type, rows, string_bytes))
            .collect();

        for row in 0..row_count {
            for (builder, column) in builders.iter_mut().zip(self.schema.columns()) {
                let is_null = cursor.u8().map_err(|t| {
                    t.into_error(&format!("row {row} column '{}' null indicator", column.name))
                })?;
                if is_null != 0 {
                    builder.append_null();
                } else {
                    builder.append_from(&mut cursor).map_err(|t| {
                        t.into_error(&format!(
                            "row {row} column '{}' ({})",
                            column.name, column.logical_type
                        ))
                    })?;
                }
            }
        }

        if cursor.remaining() > 0 {
            tracing::debug!(
                "Ignoring {} trailing bytes after {} rows",
                cursor.remaining(),
                row_count
            );
        }

        let arrays: Vec<ArrayRef> = builders.iter_mut().map(ColumnBuilder::finish).collect();
        Ok(RecordBatch::try_new_with_options(
            self.schema.arrow_schema(),
            arrays,
            &options,
        )?)
    }
}
