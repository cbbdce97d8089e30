//! Owned dynamic cell extracted from an arrow array.

use std::cmp::Ordering;

use arrow_array::{
    Array, BinaryArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    ListArray, StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// A single dynamic cell. Columns are schema-homogeneous, so cross-type
/// comparisons only matter as a total-order fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Extracts the cell at `idx` from an arrow array.
    pub fn from_array(array: &dyn Array, idx: usize) -> Value {
        if array.is_null(idx) {
            return Value::Null;
        }
        match array.data_type() {
            DataType::Int8 => {
                Value::Int8(array.as_any().downcast_ref::<Int8Array>().unwrap().value(idx))
            }
            DataType::Int16 => Value::Int16(
                array
                    .as_any()
                    .downcast_ref::<Int16Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::Int32 => Value::Int32(
                array
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::Int64 => Value::Int64(
                array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::UInt8 => Value::UInt8(
                array
                    .as_any()
                    .downcast_ref::<UInt8Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::UInt16 => Value::UInt16(
                array
                    .as_any()
                    .downcast_ref::<UInt16Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::UInt32 => Value::UInt32(
                array
                    .as_any()
                    .downcast_ref::<UInt32Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::UInt64 => Value::UInt64(
                array
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::Float32 => Value::Float32(
                array
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::Float64 => Value::Float64(
                array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .unwrap()
                    .value(idx),
            ),
            DataType::Utf8 => Value::Utf8(
                array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap()
                    .value(idx)
                    .to_string(),
            ),
            DataType::Binary => Value::Binary(
                array
                    .as_any()
                    .downcast_ref::<BinaryArray>()
                    .unwrap()
                    .value(idx)
                    .to_vec(),
            ),
            DataType::List(_) => {
                let list = array.as_any().downcast_ref::<ListArray>().unwrap();
                let values = list.value(idx);
                Value::List(
                    (0..values.len())
                        .map(|i| Value::from_array(values.as_ref(), i))
                        .collect(),
                )
            }
            other => unimplemented!("unsupported column type {other}"),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int8(_) => 1,
            Value::Int16(_) => 2,
            Value::Int32(_) => 3,
            Value::Int64(_) => 4,
            Value::UInt8(_) => 5,
            Value::UInt16(_) => 6,
            Value::UInt32(_) => 7,
            Value::UInt64(_) => 8,
            Value::Float32(_) => 9,
            Value::Float64(_) => 10,
            Value::Utf8(_) => 11,
            Value::Binary(_) => 12,
            Value::List(_) => 13,
        }
    }

    /// Signed view for sign columns (`+1` / `-1`).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(*v as i64),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned view for version and flag columns.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int8(v) => u64::try_from(*v).ok(),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            Value::UInt8(v) => Some(*v as u64),
            Value::UInt16(v) => Some(*v as u64),
            Value::UInt32(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// True for null, numeric zero, and empty string/binary/list — the
    /// default value of the column type.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int8(v) => *v == 0,
            Value::Int16(v) => *v == 0,
            Value::Int32(v) => *v == 0,
            Value::Int64(v) => *v == 0,
            Value::UInt8(v) => *v == 0,
            Value::UInt16(v) => *v == 0,
            Value::UInt32(v) => *v == 0,
            Value::UInt64(v) => *v == 0,
            Value::Float32(v) => *v == 0.0,
            Value::Float64(v) => *v == 0.0,
            Value::Utf8(v) => v.is_empty(),
            Value::Binary(v) => v.is_empty(),
            Value::List(v) => v.is_empty(),
        }
    }

    /// Numeric addition used by the summing reducer. Null behaves as zero.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, v) | (v, Value::Null) => Some(v.clone()),
            (Value::Int8(a), Value::Int8(b)) => Some(Value::Int8(a.wrapping_add(*b))),
            (Value::Int16(a), Value::Int16(b)) => Some(Value::Int16(a.wrapping_add(*b))),
            (Value::Int32(a), Value::Int32(b)) => Some(Value::Int32(a.wrapping_add(*b))),
            (Value::Int64(a), Value::Int64(b)) => Some(Value::Int64(a.wrapping_add(*b))),
            (Value::UInt8(a), Value::UInt8(b)) => Some(Value::UInt8(a.wrapping_add(*b))),
            (Value::UInt16(a), Value::UInt16(b)) => Some(Value::UInt16(a.wrapping_add(*b))),
            (Value::UInt32(a), Value::UInt32(b)) => Some(Value::UInt32(a.wrapping_add(*b))),
            (Value::UInt64(a), Value::UInt64(b)) => Some(Value::UInt64(a.wrapping_add(*b))),
            (Value::Float32(a), Value::Float32(b)) => Some(Value::Float32(a + b)),
            (Value::Float64(a), Value::Float64(b)) => Some(Value::Float64(a + b)),
            _ => None,
        }
    }

    /// True when the type participates in summing.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int8(_)
                | Value::Int16(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::UInt8(_)
                | Value::UInt16(_)
                | Value::UInt32(_)
                | Value::UInt64(_)
                | Value::Float32(_)
                | Value::Float64(_)
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u8(self.type_rank());
        match self {
            Value::Null => {}
            Value::Int8(v) => v.hash(state),
            Value::Int16(v) => v.hash(state),
            Value::Int32(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::UInt8(v) => v.hash(state),
            Value::UInt16(v) => v.hash(state),
            Value::UInt32(v) => v.hash(state),
            Value::UInt64(v) => v.hash(state),
            Value::Float32(v) => v.to_bits().hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(v) => v.hash(state),
            Value::Binary(v) => v.hash(state),
            Value::List(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int8(a), Value::Int8(b)) => a.cmp(b),
            (Value::Int16(a), Value::Int16(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::UInt8(a), Value::UInt8(b)) => a.cmp(b),
            (Value::UInt16(a), Value::UInt16(b)) => a.cmp(b),
            (Value::UInt32(a), Value::UInt32(b)) => a.cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Float32(a), Value::Float32(b)) => a.total_cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Utf8(a), Value::Utf8(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{Int64Array, StringArray};

    use super::*;

    #[test]
    fn extract_and_compare() {
        let ids = Int64Array::from(vec![3, 1, 2]);
        let a = Value::from_array(&ids, 1);
        let b = Value::from_array(&ids, 2);
        assert_eq!(a, Value::Int64(1));
        assert!(a < b);
    }

    #[test]
    fn null_sorts_first() {
        let names = StringArray::from(vec![Some("x"), None]);
        let null = Value::from_array(&names, 1);
        let x = Value::from_array(&names, 0);
        assert!(null < x);
        assert!(null.is_default());
    }

    #[test]
    fn list_round_trip() {
        use arrow_array::builder::{Int64Builder, ListBuilder};

        let mut builder = ListBuilder::new(Int64Builder::new());
        builder.values().append_value(4);
        builder.values().append_value(5);
        builder.append(true);
        let list: ListArray = builder.finish();
        let arc: Arc<dyn Array> = Arc::new(list);

        assert_eq!(
            Value::from_array(arc.as_ref(), 0),
            Value::List(vec![Value::Int64(4), Value::Int64(5)])
        );
    }

    #[test]
    fn summing_addition() {
        let sum = Value::Int64(2).checked_add(&Value::Int64(40)).unwrap();
        assert_eq!(sum, Value::Int64(42));
        assert!(Value::Utf8("a".into()).checked_add(&Value::Utf8("b".into())).is_none());
    }
}
