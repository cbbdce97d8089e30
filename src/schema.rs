//! Table schema snapshot consumed by merge tasks.
//!
//! A [`TableSchema`] is an immutable snapshot of everything a merge needs to
//! know about the table: physical columns, sort key, secondary and vector
//! indexes, projections, TTL rules and per-column defaults. Tasks hold it by
//! `Arc` for the whole run, the same way readers hold a storage snapshot.

use std::{collections::HashMap, sync::Arc};

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::merge::MergingParams;

/// Secondary (skip) index over a set of columns. The merge only needs the
/// referenced column names: they are forced into the merging set.
#[derive(Debug, Clone)]
pub struct SecondaryIndexDescription {
    pub name: String,
    pub columns: Vec<String>,
}

/// Vector index attached to one column.
#[derive(Debug, Clone)]
pub struct VectorIndexDescription {
    pub name: String,
    pub column: String,
}

/// Projection co-located with every part; merged recursively.
#[derive(Debug, Clone)]
pub struct ProjectionDescription {
    pub name: String,
    /// Physical columns of the projection, in projection order.
    pub columns: Vec<String>,
    pub sort_key: Vec<String>,
    /// Aggregating projections merge with the Aggregating mode.
    pub aggregating: bool,
}

/// Row-level TTL: a row expires once `time_column + delta_seconds` passes.
#[derive(Debug, Clone)]
pub struct RowTtl {
    pub time_column: String,
    pub delta_seconds: i64,
}

/// Column-level TTL: the target column is dropped from rows whose clock ran
/// out; a fully-expired column disappears from the merged part.
#[derive(Debug, Clone)]
pub struct ColumnTtl {
    pub target_column: String,
    pub time_column: String,
    pub delta_seconds: i64,
}

/// How a column default was declared. Only expression-less plain defaults
/// receive synthetic serialization infos for parts that predate the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultKind {
    Default,
    Materialized,
    Alias,
}

#[derive(Debug, Clone)]
pub struct ColumnDefault {
    pub kind: DefaultKind,
    pub has_expression: bool,
}

/// Immutable schema snapshot for one table (or one projection).
#[derive(Debug, Clone)]
pub struct TableSchema {
    arrow: SchemaRef,
    sort_key: Vec<String>,
    partition_key: Vec<String>,
    secondary_indices: Vec<SecondaryIndexDescription>,
    vector_indices: Vec<VectorIndexDescription>,
    projections: Vec<ProjectionDescription>,
    row_ttl: Option<RowTtl>,
    column_ttls: Vec<ColumnTtl>,
    defaults: HashMap<String, ColumnDefault>,
}

impl TableSchema {
    pub fn new(arrow: SchemaRef, sort_key: Vec<String>) -> Self {
        Self {
            arrow,
            sort_key,
            partition_key: Vec::new(),
            secondary_indices: Vec::new(),
            vector_indices: Vec::new(),
            projections: Vec::new(),
            row_ttl: None,
            column_ttls: Vec::new(),
            defaults: HashMap::new(),
        }
    }

    pub fn with_partition_key(mut self, partition_key: Vec<String>) -> Self {
        self.partition_key = partition_key;
        self
    }

    pub fn with_secondary_index(mut self, index: SecondaryIndexDescription) -> Self {
        self.secondary_indices.push(index);
        self
    }

    pub fn with_vector_index(mut self, index: VectorIndexDescription) -> Self {
        self.vector_indices.push(index);
        self
    }

    pub fn with_projection(mut self, projection: ProjectionDescription) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn with_row_ttl(mut self, ttl: RowTtl) -> Self {
        self.row_ttl = Some(ttl);
        self
    }

    pub fn with_column_ttl(mut self, ttl: ColumnTtl) -> Self {
        self.column_ttls.push(ttl);
        self
    }

    pub fn with_default(mut self, column: impl Into<String>, default: ColumnDefault) -> Self {
        self.defaults.insert(column.into(), default);
        self
    }

    pub fn arrow(&self) -> &SchemaRef {
        &self.arrow
    }

    pub fn sort_key(&self) -> &[String] {
        &self.sort_key
    }

    pub fn partition_key(&self) -> &[String] {
        &self.partition_key
    }

    pub fn secondary_indices(&self) -> &[SecondaryIndexDescription] {
        &self.secondary_indices
    }

    pub fn vector_indices(&self) -> &[VectorIndexDescription] {
        &self.vector_indices
    }

    pub fn projections(&self) -> &[ProjectionDescription] {
        &self.projections
    }

    pub fn row_ttl(&self) -> Option<&RowTtl> {
        self.row_ttl.as_ref()
    }

    pub fn column_ttls(&self) -> &[ColumnTtl] {
        &self.column_ttls
    }

    pub fn default_of(&self, column: &str) -> Option<&ColumnDefault> {
        self.defaults.get(column)
    }

    pub fn has_any_ttl(&self) -> bool {
        self.row_ttl.is_some() || !self.column_ttls.is_empty()
    }

    /// Names of all physical columns in schema order.
    pub fn physical_column_names(&self) -> Vec<String> {
        self.arrow
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.arrow
            .fields()
            .iter()
            .find(|f| f.name() == name)
            .map(|f| f.as_ref())
    }

    pub fn data_type(&self, name: &str) -> Option<&DataType> {
        self.field(name).map(|f| f.data_type())
    }

    /// Builds the schema of one projection, restricted to its columns.
    pub fn projection_schema(&self, projection: &ProjectionDescription) -> TableSchema {
        let fields: Vec<Field> = projection
            .columns
            .iter()
            .filter_map(|name| self.field(name).cloned())
            .collect();
        TableSchema::new(Arc::new(Schema::new(fields)), projection.sort_key.clone())
    }

    /// Schema restricted to a column subset, preserving table order.
    pub fn subset(&self, columns: &[String]) -> SchemaRef {
        let fields: Vec<Field> = columns
            .iter()
            .filter_map(|name| self.field(name).cloned())
            .collect();
        Arc::new(Schema::new(fields))
    }
}

/// Splits storage columns into the merging set (sort key, index-referenced,
/// mode-required) and the gathering set (everything else).
pub(crate) fn extract_merging_and_gathering_columns(
    schema: &TableSchema,
    params: &MergingParams,
) -> (Vec<String>, Vec<String>) {
    let mut key_columns: Vec<String> = schema.sort_key().to_vec();
    for index in schema.secondary_indices() {
        for column in &index.columns {
            if !key_columns.contains(column) {
                key_columns.push(column.clone());
            }
        }
    }
    for column in params.mode_required_columns() {
        if !key_columns.contains(&column) {
            key_columns.push(column);
        }
    }

    let all = schema.physical_column_names();
    // Force at least one merged column when the key set came out empty.
    if key_columns.is_empty() {
        if let Some(first) = all.first() {
            key_columns.push(first.clone());
        }
    }

    let mut merging = Vec::new();
    let mut gathering = Vec::new();
    for column in all {
        if key_columns.contains(&column) {
            merging.push(column);
        } else {
            gathering.push(column);
        }
    }
    (merging, gathering)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeMode;

    fn plain_schema() -> TableSchema {
        let arrow = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("sign", DataType::Int8, false),
            Field::new("a", DataType::Utf8, true),
            Field::new("b", DataType::Float64, true),
        ]));
        TableSchema::new(arrow, vec!["k".into()])
    }

    #[test]
    fn collapsing_forces_sign_into_merging_set() {
        let schema = plain_schema();
        let params = MergingParams::collapsing("sign");
        let (merging, gathering) = extract_merging_and_gathering_columns(&schema, &params);
        assert_eq!(merging, vec!["k".to_string(), "sign".to_string()]);
        assert_eq!(gathering, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_key_falls_back_to_first_column() {
        let arrow = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Int64, false),
        ]));
        let schema = TableSchema::new(arrow, vec![]);
        let params = MergingParams::new(MergeMode::Ordinary);
        let (merging, gathering) = extract_merging_and_gathering_columns(&schema, &params);
        assert_eq!(merging, vec!["x".to_string()]);
        assert_eq!(gathering, vec!["y".to_string()]);
    }

    #[test]
    fn secondary_index_columns_merge() {
        let schema = plain_schema().with_secondary_index(SecondaryIndexDescription {
            name: "by_a".into(),
            columns: vec!["a".into()],
        });
        let params = MergingParams::new(MergeMode::Ordinary);
        let (merging, _) = extract_merging_and_gathering_columns(&schema, &params);
        assert!(merging.contains(&"a".to_string()));
    }
}
