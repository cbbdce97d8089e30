//! Rebuilds arrow blocks from dynamic rows.

use std::sync::Arc;

use arrow_array::{
    builder::{
        BinaryBuilder, Float32Builder, Float64Builder, Int16Builder, Int32Builder, Int64Builder,
        Int8Builder, ListBuilder, StringBuilder, UInt16Builder, UInt32Builder, UInt64Builder,
        UInt8Builder,
    },
    ArrayRef, RecordBatch,
};
use arrow_schema::{ArrowError, DataType, Field, SchemaRef};

use super::value::Value;

enum ColumnBuilder {
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
    ListInt64(ListBuilder<Int64Builder>),
    ListUInt64(ListBuilder<UInt64Builder>),
    ListFloat32(ListBuilder<Float32Builder>),
    ListFloat64(ListBuilder<Float64Builder>),
    ListUtf8(ListBuilder<StringBuilder>),
}

macro_rules! append_primitive {
    ($builder:expr, $value:expr, $variant:path) => {
        match $value {
            Value::Null => $builder.append_null(),
            $variant(v) => $builder.append_value(v.clone()),
            other => {
                return Err(ArrowError::InvalidArgumentError(format!(
                    "cell {other:?} does not fit column"
                )))
            }
        }
    };
}

macro_rules! append_list {
    ($builder:expr, $value:expr, $variant:path) => {
        match $value {
            Value::Null => $builder.append(false),
            Value::List(items) => {
                for item in items {
                    match item {
                        Value::Null => $builder.values().append_null(),
                        $variant(v) => $builder.values().append_value(v.clone()),
                        other => {
                            return Err(ArrowError::InvalidArgumentError(format!(
                                "list element {other:?} does not fit column"
                            )))
                        }
                    }
                }
                $builder.append(true);
            }
            other => {
                return Err(ArrowError::InvalidArgumentError(format!(
                    "cell {other:?} is not a list"
                )))
            }
        }
    };
}

impl ColumnBuilder {
    fn for_type(data_type: &DataType) -> Result<Self, ArrowError> {
        Ok(match data_type {
            DataType::Int8 => ColumnBuilder::Int8(Int8Builder::new()),
            DataType::Int16 => ColumnBuilder::Int16(Int16Builder::new()),
            DataType::Int32 => ColumnBuilder::Int32(Int32Builder::new()),
            DataType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
            DataType::UInt8 => ColumnBuilder::UInt8(UInt8Builder::new()),
            DataType::UInt16 => ColumnBuilder::UInt16(UInt16Builder::new()),
            DataType::UInt32 => ColumnBuilder::UInt32(UInt32Builder::new()),
            DataType::UInt64 => ColumnBuilder::UInt64(UInt64Builder::new()),
            DataType::Float32 => ColumnBuilder::Float32(Float32Builder::new()),
            DataType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            DataType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
            DataType::Binary => ColumnBuilder::Binary(BinaryBuilder::new()),
            DataType::List(field) => match field.data_type() {
                DataType::Int64 => ColumnBuilder::ListInt64(
                    ListBuilder::new(Int64Builder::new()).with_field(list_item_field(field)),
                ),
                DataType::UInt64 => ColumnBuilder::ListUInt64(
                    ListBuilder::new(UInt64Builder::new()).with_field(list_item_field(field)),
                ),
                DataType::Float32 => ColumnBuilder::ListFloat32(
                    ListBuilder::new(Float32Builder::new()).with_field(list_item_field(field)),
                ),
                DataType::Float64 => ColumnBuilder::ListFloat64(
                    ListBuilder::new(Float64Builder::new()).with_field(list_item_field(field)),
                ),
                DataType::Utf8 => ColumnBuilder::ListUtf8(
                    ListBuilder::new(StringBuilder::new()).with_field(list_item_field(field)),
                ),
                other => {
                    return Err(ArrowError::NotYetImplemented(format!(
                        "list element type {other} is not supported"
                    )))
                }
            },
            other => {
                return Err(ArrowError::NotYetImplemented(format!(
                    "column type {other} is not supported"
                )))
            }
        })
    }

    fn append(&mut self, value: &Value) -> Result<(), ArrowError> {
        match self {
            ColumnBuilder::Int8(b) => append_primitive!(b, value, Value::Int8),
            ColumnBuilder::Int16(b) => append_primitive!(b, value, Value::Int16),
            ColumnBuilder::Int32(b) => append_primitive!(b, value, Value::Int32),
            ColumnBuilder::Int64(b) => append_primitive!(b, value, Value::Int64),
            ColumnBuilder::UInt8(b) => append_primitive!(b, value, Value::UInt8),
            ColumnBuilder::UInt16(b) => append_primitive!(b, value, Value::UInt16),
            ColumnBuilder::UInt32(b) => append_primitive!(b, value, Value::UInt32),
            ColumnBuilder::UInt64(b) => append_primitive!(b, value, Value::UInt64),
            ColumnBuilder::Float32(b) => append_primitive!(b, value, Value::Float32),
            ColumnBuilder::Float64(b) => append_primitive!(b, value, Value::Float64),
            ColumnBuilder::Utf8(b) => match value {
                Value::Null => b.append_null(),
                Value::Utf8(v) => b.append_value(v),
                other => {
                    return Err(ArrowError::InvalidArgumentError(format!(
                        "cell {other:?} does not fit string column"
                    )))
                }
            },
            ColumnBuilder::Binary(b) => match value {
                Value::Null => b.append_null(),
                Value::Binary(v) => b.append_value(v),
                other => {
                    return Err(ArrowError::InvalidArgumentError(format!(
                        "cell {other:?} does not fit binary column"
                    )))
                }
            },
            ColumnBuilder::ListInt64(b) => append_list!(b, value, Value::Int64),
            ColumnBuilder::ListUInt64(b) => append_list!(b, value, Value::UInt64),
            ColumnBuilder::ListFloat32(b) => append_list!(b, value, Value::Float32),
            ColumnBuilder::ListFloat64(b) => append_list!(b, value, Value::Float64),
            ColumnBuilder::ListUtf8(b) => append_list!(b, value, Value::Utf8),
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Int8(b) => Arc::new(b.finish()),
            ColumnBuilder::Int16(b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt8(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt16(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt32(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float32(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(b) => Arc::new(b.finish()),
            ColumnBuilder::ListInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::ListUInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::ListFloat32(b) => Arc::new(b.finish()),
            ColumnBuilder::ListFloat64(b) => Arc::new(b.finish()),
            ColumnBuilder::ListUtf8(b) => Arc::new(b.finish()),
        }
    }
}

fn list_item_field(field: &Field) -> Field {
    Field::new_list_field(field.data_type().clone(), field.is_nullable())
}

/// Accumulates dynamic rows and emits them as a [`RecordBatch`].
pub struct BlockBuilder {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl BlockBuilder {
    pub fn new(schema: SchemaRef) -> Result<Self, ArrowError> {
        let builders = schema
            .fields()
            .iter()
            .map(|field| ColumnBuilder::for_type(field.data_type()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema,
            builders,
            rows: 0,
        })
    }

    pub fn push_row(&mut self, row: &[Value]) -> Result<(), ArrowError> {
        debug_assert_eq!(row.len(), self.builders.len());
        for (builder, value) in self.builders.iter_mut().zip(row) {
            builder.append(value)?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Drains accumulated rows into a block; the builder stays reusable.
    pub fn finish(&mut self) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<ArrayRef> = self.builders.iter_mut().map(|b| b.finish()).collect();
        self.rows = 0;
        RecordBatch::try_new(self.schema.clone(), columns)
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::Schema;

    use super::*;

    #[test]
    fn rows_round_trip_through_builder() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let mut builder = BlockBuilder::new(schema.clone()).unwrap();
        builder
            .push_row(&[Value::Int64(1), Value::Utf8("a".into())])
            .unwrap();
        builder.push_row(&[Value::Int64(2), Value::Null]).unwrap();

        let batch = builder.finish().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(crate::block::row_at(&batch, 0), vec![
            Value::Int64(1),
            Value::Utf8("a".into())
        ]);
        assert_eq!(crate::block::row_at(&batch, 1)[1], Value::Null);

        // Builder is reusable after finish.
        assert!(builder.is_empty());
        builder.push_row(&[Value::Int64(3), Value::Null]).unwrap();
        assert_eq!(builder.finish().unwrap().num_rows(), 1);
    }

    #[test]
    fn vector_column_round_trip() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "embedding",
            DataType::List(Arc::new(Field::new_list_field(DataType::Float32, true))),
            true,
        )]));
        let mut builder = BlockBuilder::new(schema).unwrap();
        builder
            .push_row(&[Value::List(vec![Value::Float32(0.5), Value::Float32(1.5)])])
            .unwrap();
        let batch = builder.finish().unwrap();
        assert_eq!(
            crate::block::row_at(&batch, 0),
            vec![Value::List(vec![Value::Float32(0.5), Value::Float32(1.5)])]
        );
    }
}
