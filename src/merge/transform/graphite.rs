//! Graphite rollup merge: time-series rows are folded into retention
//! buckets chosen by a pattern table keyed on the metric name.

use arrow_schema::SchemaRef;
use regex::Regex;

use super::{column_index, GroupRow, MergingAlgorithm};
use crate::{
    block::{Row, Value},
    merge::error::MergeError,
};

/// How rolled-up values fold inside one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphiteAggregation {
    Avg,
    Sum,
    Min,
    Max,
    Last,
}

/// Age bucket: rows older than `age` seconds round their time down to a
/// multiple of `precision`.
#[derive(Debug, Clone, Copy)]
pub struct GraphiteRetention {
    pub age: i64,
    pub precision: i64,
}

/// One rollup rule; `regexp: None` is the catch-all default.
#[derive(Debug, Clone)]
pub struct GraphitePattern {
    pub regexp: Option<String>,
    pub function: GraphiteAggregation,
    /// Sorted by age ascending.
    pub retentions: Vec<GraphiteRetention>,
}

/// Rollup configuration of a Graphite table.
#[derive(Debug, Clone)]
pub struct GraphiteParams {
    pub path_column: String,
    pub time_column: String,
    pub value_column: String,
    pub version_column: String,
    pub patterns: Vec<GraphitePattern>,
}

struct CompiledPattern {
    regex: Option<Regex>,
    function: GraphiteAggregation,
    retentions: Vec<GraphiteRetention>,
}

struct Bucket {
    path: Value,
    rounded_time: i64,
    template: Row,
    function: GraphiteAggregation,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    last: f64,
    version: u64,
}

pub(crate) struct GraphiteRollupAlgorithm {
    path_idx: usize,
    time_idx: usize,
    value_idx: usize,
    version_idx: usize,
    patterns: Vec<CompiledPattern>,
    time_of_merge: i64,
    bucket: Option<Bucket>,
}

impl GraphiteRollupAlgorithm {
    pub(crate) fn new(
        schema: &SchemaRef,
        params: &GraphiteParams,
        time_of_merge: i64,
    ) -> Result<Self, MergeError> {
        let patterns = params
            .patterns
            .iter()
            .map(|pattern| {
                let regex = match &pattern.regexp {
                    Some(expr) => Some(Regex::new(expr).map_err(|err| {
                        MergeError::BadArguments(format!("invalid graphite pattern: {err}"))
                    })?),
                    None => None,
                };
                Ok(CompiledPattern {
                    regex,
                    function: pattern.function,
                    retentions: pattern.retentions.clone(),
                })
            })
            .collect::<Result<Vec<_>, MergeError>>()?;
        Ok(Self {
            path_idx: column_index(schema, &params.path_column)?,
            time_idx: column_index(schema, &params.time_column)?,
            value_idx: column_index(schema, &params.value_column)?,
            version_idx: column_index(schema, &params.version_column)?,
            patterns,
            time_of_merge,
            bucket: None,
        })
    }

    fn select_pattern(&self, path: &Value) -> Option<&CompiledPattern> {
        let path = match path {
            Value::Utf8(path) => path.as_str(),
            _ => "",
        };
        self.patterns.iter().find(|pattern| {
            pattern
                .regex
                .as_ref()
                .map(|regex| regex.is_match(path))
                .unwrap_or(true)
        })
    }

    fn round_time(pattern: &CompiledPattern, time: i64, now: i64) -> i64 {
        let age = now - time;
        let mut precision = 1;
        for retention in &pattern.retentions {
            if age >= retention.age {
                precision = retention.precision;
            } else {
                break;
            }
        }
        if precision <= 1 {
            time
        } else {
            time - time.rem_euclid(precision)
        }
    }

    fn flush(&mut self, out: &mut Vec<Row>) {
        if let Some(bucket) = self.bucket.take() {
            let mut row = bucket.template;
            row[self.time_idx] = match &row[self.time_idx] {
                Value::UInt64(_) => Value::UInt64(bucket.rounded_time as u64),
                _ => Value::Int64(bucket.rounded_time),
            };
            let value = match bucket.function {
                GraphiteAggregation::Avg => {
                    if bucket.count == 0 {
                        0.0
                    } else {
                        bucket.sum / bucket.count as f64
                    }
                }
                GraphiteAggregation::Sum => bucket.sum,
                GraphiteAggregation::Min => bucket.min,
                GraphiteAggregation::Max => bucket.max,
                GraphiteAggregation::Last => bucket.last,
            };
            row[self.value_idx] = match &row[self.value_idx] {
                Value::Float32(_) => Value::Float32(value as f32),
                _ => Value::Float64(value),
            };
            out.push(row);
        }
    }
}

impl MergingAlgorithm for GraphiteRollupAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        for group_row in rows {
            let row = &group_row.row;
            let path = row[self.path_idx].clone();
            let time = row[self.time_idx].as_i64().unwrap_or(0);
            let value = match &row[self.value_idx] {
                Value::Float32(v) => *v as f64,
                Value::Float64(v) => *v,
                other => other.as_i64().unwrap_or(0) as f64,
            };
            let version = row[self.version_idx].as_u64().unwrap_or(0);

            let (function, rounded_time) = match self.select_pattern(&path) {
                Some(pattern) => (
                    pattern.function,
                    Self::round_time(pattern, time, self.time_of_merge),
                ),
                None => (GraphiteAggregation::Last, time),
            };

            let same_bucket = self
                .bucket
                .as_ref()
                .map(|bucket| bucket.path == path && bucket.rounded_time == rounded_time)
                .unwrap_or(false);
            if !same_bucket {
                self.flush(out);
                self.bucket = Some(Bucket {
                    path,
                    rounded_time,
                    template: row.clone(),
                    function,
                    sum: 0.0,
                    count: 0,
                    min: f64::INFINITY,
                    max: f64::NEG_INFINITY,
                    last: 0.0,
                    version: 0,
                });
            }
            let bucket = self.bucket.as_mut().expect("bucket just ensured");
            bucket.sum += value;
            bucket.count += 1;
            bucket.min = bucket.min.min(value);
            bucket.max = bucket.max.max(value);
            bucket.last = value;
            if version >= bucket.version {
                bucket.version = version;
                bucket.template = row.clone();
            }
        }
        Ok(vec![false; rows.len()])
    }

    fn finish(&mut self, out: &mut Vec<Row>) -> Result<(), MergeError> {
        self.flush(out);
        Ok(())
    }
}
