//! Client-side batch payload encoding
//!
//! Produces the same layout `BatchDecoder` consumes. Used by `ExportClient`
//! and for generating synthetic export streams.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use exbridge_common::{BridgeError, Result};

use crate::schema::{ColumnSchema, LogicalType};

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Accumulates rows into one batch payload.
pub struct PayloadBuilder {
    schema: Arc<ColumnSchema>,
    rows: u32,
    body: BytesMut,
}

impl PayloadBuilder {
    pub fn new(schema: Arc<ColumnSchema>) -> Self {
        Self {
            schema,
            rows: 0,
            body: BytesMut::new(),
        }
    }

    pub fn num_rows(&self) -> u32 {
        self.rows
    }

    /// Append one row; the builder is left untouched if the row is rejected.
    pub fn push_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.schema.len() {
            return Err(BridgeError::Protocol(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.schema.len()
            )));
        }

        let mut encoded = BytesMut::new();
        for (value, column) in row.iter().zip(self.schema.columns()) {
            match (value, column.logical_type) {
                (Value::Null, _) => encoded.put_u8(1),
                (Value::Int(v), LogicalType::Integer) => {
                    encoded.put_u8(0);
                    encoded.put_i32(*v);
                }
                (Value::BigInt(v), LogicalType::BigInt) => {
                    encoded.put_u8(0);
                    encoded.put_i64(*v);
                }
                (Value::Double(v), LogicalType::Double) => {
                    encoded.put_u8(0);
                    encoded.put_f64(*v);
                }
                (Value::Text(s), LogicalType::Varchar) => {
                    let len = u16::try_from(s.len()).map_err(|_| {
                        BridgeError::Protocol(format!(
                            "column '{}': {} bytes exceed the VARCHAR limit",
                            column.name,
                            s.len()
                        ))
                    })?;
                    encoded.put_u8(0);
                    encoded.put_u16(len);
                    encoded.put_slice(s.as_bytes());
                }
                (other, ty) => {
                    return Err(BridgeError::Protocol(format!(
                        "column '{}' is {ty}, got {other:?}",
                        column.name
                    )));
                }
            }
        }

        self.rows += 1;
        self.body.unsplit(encoded);
        Ok(())
    }

    /// Finish the payload: row count followed by the encoded rows.
    pub fn finish(self) -> Bytes {
        let mut payload = BytesMut::with_capacity(4 + self.body.len());
        payload.put_u32(self.rows);
        payload.put(self.body);
        payload.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;

    fn schema() -> Arc<ColumnSchema> {
        Arc::new(ColumnSchema::new(vec![
            ColumnDef::new("id", LogicalType::Integer),
            ColumnDef::new("v", LogicalType::Varchar),
        ]))
    }

    #[test]
    fn test_encode_layout() {
        let mut builder = PayloadBuilder::new(schema());
        builder.push_row(&[Value::Int(1), "a".into()]).unwrap();
        builder.push_row(&[Value::Null, "b".into()]).unwrap();
        assert_eq!(builder.num_rows(), 2);

        let expected: Vec<u8> = vec![
            0, 0, 0, 2, // rows
            0, 0, 0, 0, 1, // id = 1
            0, 0, 1, b'a', // v = "a"
            1, // id = null
            0, 0, 1, b'b', // v = "b"
        ];
        assert_eq!(&builder.finish()[..], &expected[..]);
    }

    #[test]
    fn test_rejected_row_leaves_builder_unchanged() {
        let mut builder = PayloadBuilder::new(schema());
        assert!(builder.push_row(&[Value::Int(1)]).is_err());
        assert!(builder.push_row(&["x".into(), "y".into()]).is_err());
        assert!(builder
            .push_row(&[Value::Int(1), Value::Text("x".repeat(70_000))])
            .is_err());
        assert_eq!(builder.num_rows(), 0);
        assert_eq!(&builder.finish()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::BigInt(3));
    }
}
