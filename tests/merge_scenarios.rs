//! End-to-end merge scenarios: every merge mode, both algorithms, TTL,
//! deduplication, projections and cancellation.

use std::sync::Arc;

use arrow_array::{
    builder::{Int64Builder, ListBuilder},
    ArrayRef, Float64Array, Int64Array, Int8Array, RecordBatch, StringArray, UInt64Array,
    UInt8Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use coppice::{
    block::row_at,
    merge::{AggregateDescription, AggregateFunction},
    part::{ReadOptions, SequentialPartReader, TtlInfos, TtlRange},
    schema::{ProjectionDescription, RowTtl},
    ActionBlocker, DataPart, FuturePart, MergeProgress, MergeTask, MergeTaskParams, MergeTreeOptions,
    MergeType, MergingParams, PartBuilder, PartType, StorageType, TableData, TableSchema, Value,
};

const TIME_OF_MERGE: i64 = 1_000_000;

fn table(
    dir: &std::path::Path,
    schema: TableSchema,
    params: MergingParams,
    options: MergeTreeOptions,
) -> Arc<TableData> {
    TableData::new(
        Arc::new(schema),
        params,
        options,
        dir.join("data"),
        dir.join("tmp"),
    )
    .unwrap()
}

fn build_part(
    dir: &std::path::Path,
    name: &str,
    schema: &SchemaRef,
    columns: Vec<ArrayRef>,
    sort_key: &[&str],
) -> Arc<DataPart> {
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    let mut builder = PartBuilder::new(
        dir.join(name),
        schema.clone(),
        PartType::Wide,
        sort_key.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap();
    builder.write(&batch).unwrap();
    Arc::new(builder.finish().unwrap())
}

struct MergeRun {
    task: MergeTask,
    progress: Arc<MergeProgress>,
    result: coppice::merge::MergeResultFuture,
}

fn merge_run(data: &Arc<TableData>, parts: Vec<Arc<DataPart>>) -> MergeRun {
    merge_run_with(data, parts, false, false)
}

fn merge_run_with(
    data: &Arc<TableData>,
    parts: Vec<Arc<DataPart>>,
    deduplicate: bool,
    cleanup: bool,
) -> MergeRun {
    let future_part = Arc::new(
        FuturePart::assign(parts, PartType::Wide, StorageType::Full, MergeType::Regular).unwrap(),
    );
    let progress = Arc::new(MergeProgress::for_future_part(&future_part));
    let task = MergeTask::new(MergeTaskParams {
        data: data.clone(),
        future_part,
        progress: progress.clone(),
        merges_blocker: Arc::new(ActionBlocker::new()),
        ttl_merges_blocker: Arc::new(ActionBlocker::new()),
        space_reservation: None,
        deduplicate,
        deduplicate_by_columns: Vec::new(),
        cleanup,
        merging_params: None,
        schema: None,
        time_of_merge: TIME_OF_MERGE,
        need_prefix: true,
    });
    let result = task.result_future();
    MergeRun {
        task,
        progress,
        result,
    }
}

fn drive_to_completion(run: &mut MergeRun) -> Arc<DataPart> {
    while run.task.execute().unwrap() {}
    run.result.try_recv().expect("merge fulfilled its promise")
}

fn read_rows(part: &Arc<DataPart>, columns: &[&str]) -> Vec<Vec<Value>> {
    let mut reader = SequentialPartReader::new(
        part.clone(),
        columns.iter().map(|s| s.to_string()).collect(),
        ReadOptions {
            batch_size: 1024,
            apply_deletes: true,
            ..Default::default()
        },
    )
    .unwrap();
    let mut rows = Vec::new();
    while let Some(block) = reader.next_block().unwrap() {
        for idx in 0..block.num_rows() {
            rows.push(row_at(&block, idx));
        }
    }
    rows
}

fn two_column_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Utf8, true),
    ]))
}

#[test]
fn ordinary_merge_of_two_parts_keeps_insertion_order() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 3])),
            Arc::new(StringArray::from(vec!["a", "c"])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![2, 3])),
            Arc::new(StringArray::from(vec!["b", "c2"])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    assert_eq!(merged.rows_count(), 4);
    let rows = read_rows(&merged, &["k", "v"]);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int64(1), Value::Utf8("a".into())],
            vec![Value::Int64(2), Value::Utf8("b".into())],
            // Equal keys keep ascending source-part order.
            vec![Value::Int64(3), Value::Utf8("c".into())],
            vec![Value::Int64(3), Value::Utf8("c2".into())],
        ]
    );
    assert_eq!(run.progress.rows_written(), 4);
    assert_eq!(run.progress.rows_read(), 4);
}

#[test]
fn collapsing_merge_cancels_sign_pairs() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("sign", DataType::Int8, false),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::collapsing("sign"),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(Int8Array::from(vec![1, 1])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(Int8Array::from(vec![-1, 1])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    let rows = read_rows(&merged, &["k", "sign"]);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int64(2), Value::Int8(1)],
            vec![Value::Int64(2), Value::Int8(1)],
        ]
    );
}

#[test]
fn collapsing_merge_may_collapse_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("sign", DataType::Int8, false),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::collapsing("sign"),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(Int8Array::from(vec![1])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(Int8Array::from(vec![-1])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);
    // The empty output still seals into a valid part.
    assert_eq!(merged.rows_count(), 0);
}

#[test]
fn replacing_merge_with_cleanup_drops_deleted_survivor() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("ver", DataType::UInt64, false),
        Field::new("del", DataType::UInt8, false),
    ]));
    let schema = TableSchema::new(arrow.clone(), vec!["k".into()]);
    let params = MergingParams::replacing_with_is_deleted("ver", "del");

    for cleanup in [true, false] {
        let dir = tmp.path().join(format!("cleanup_{cleanup}"));
        let data = table(&dir, schema.clone(), params.clone(), MergeTreeOptions::new());
        let a = build_part(
            data.parts_dir(),
            "all_1_1_0",
            &arrow,
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(UInt64Array::from(vec![5])),
                Arc::new(UInt8Array::from(vec![0])),
            ],
            &["k"],
        );
        let b = build_part(
            data.parts_dir(),
            "all_2_2_0",
            &arrow,
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(UInt64Array::from(vec![7])),
                Arc::new(UInt8Array::from(vec![1])),
            ],
            &["k"],
        );

        let mut run = merge_run_with(&data, vec![a, b], false, cleanup);
        let merged = drive_to_completion(&mut run);
        if cleanup {
            assert_eq!(merged.rows_count(), 0);
        } else {
            let rows = read_rows(&merged, &["k", "ver", "del"]);
            assert_eq!(
                rows,
                vec![vec![Value::Int64(1), Value::UInt64(7), Value::UInt8(1)]]
            );
        }
    }
}

#[test]
fn summing_merge_sums_and_elides_zero_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("s", DataType::Int64, false),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::summing(Vec::new()),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(Int64Array::from(vec![2, 0])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 3])),
            Arc::new(Int64Array::from(vec![3, 5])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    let rows = read_rows(&merged, &["k", "s"]);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int64(1), Value::Int64(5)],
            // key 2 summed to zero and was elided
            vec![Value::Int64(3), Value::Int64(5)],
        ]
    );
}

#[test]
fn summing_merge_folds_nested_tables_by_key() {
    let tmp = tempfile::tempdir().unwrap();
    let list_type = || DataType::List(Arc::new(Field::new_list_field(DataType::Int64, true)));
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("m.key", list_type(), true),
        Field::new("m.val", list_type(), true),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::summing(Vec::new()),
        MergeTreeOptions::new(),
    );

    let list = |values: Vec<Vec<i64>>| -> ArrayRef {
        let mut builder = ListBuilder::new(Int64Builder::new());
        for row in values {
            for item in row {
                builder.values().append_value(item);
            }
            builder.append(true);
        }
        Arc::new(builder.finish())
    };

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            list(vec![vec![1, 2]]),
            list(vec![vec![10, 20]]),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            list(vec![vec![2, 3]]),
            list(vec![vec![5, 7]]),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    let rows = read_rows(&merged, &["k", "m.key", "m.val"]);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0][1],
        Value::List(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)])
    );
    assert_eq!(
        rows[0][2],
        Value::List(vec![Value::Int64(10), Value::Int64(25), Value::Int64(7)])
    );
}

#[test]
fn aggregating_merge_combines_state_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("cnt", DataType::UInt64, false),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::aggregating(vec![AggregateDescription {
            column: "cnt".into(),
            function: AggregateFunction::Count,
        }]),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(UInt64Array::from(vec![2])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(UInt64Array::from(vec![3, 1])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);
    assert_eq!(
        read_rows(&merged, &["k", "cnt"]),
        vec![
            vec![Value::Int64(1), Value::UInt64(5)],
            vec![Value::Int64(2), Value::UInt64(1)],
        ]
    );
}

#[test]
fn versioned_collapsing_pairs_within_version() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("ver", DataType::UInt64, false),
        Field::new("sign", DataType::Int8, false),
    ]));
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into(), "ver".into()]),
        MergingParams::versioned_collapsing("sign", "ver"),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(UInt64Array::from(vec![1])),
            Arc::new(Int8Array::from(vec![1])),
        ],
        &["k", "ver"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 1])),
            Arc::new(UInt64Array::from(vec![1, 2])),
            Arc::new(Int8Array::from(vec![-1, 1])),
        ],
        &["k", "ver"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);
    assert_eq!(
        read_rows(&merged, &["k", "ver", "sign"]),
        vec![vec![Value::Int64(1), Value::UInt64(2), Value::Int8(1)]]
    );
}

#[test]
fn graphite_merge_rolls_up_time_buckets() {
    use coppice::merge::{GraphiteAggregation, GraphiteParams, GraphitePattern, GraphiteRetention};

    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("path", DataType::Utf8, false),
        Field::new("time", DataType::Int64, false),
        Field::new("value", DataType::Float64, false),
        Field::new("ver", DataType::UInt64, false),
    ]));
    let params = MergingParams::graphite(GraphiteParams {
        path_column: "path".into(),
        time_column: "time".into(),
        value_column: "value".into(),
        version_column: "ver".into(),
        patterns: vec![GraphitePattern {
            regexp: None,
            function: GraphiteAggregation::Sum,
            retentions: vec![GraphiteRetention {
                age: 0,
                precision: 10,
            }],
        }],
    });
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["path".into(), "time".into()]),
        params,
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(StringArray::from(vec!["m", "m"])),
            Arc::new(Int64Array::from(vec![11, 19])),
            Arc::new(Float64Array::from(vec![1.0, 2.0])),
            Arc::new(UInt64Array::from(vec![1, 1])),
        ],
        &["path", "time"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(StringArray::from(vec!["m"])),
            Arc::new(Int64Array::from(vec![25])),
            Arc::new(Float64Array::from(vec![4.0])),
            Arc::new(UInt64Array::from(vec![1])),
        ],
        &["path", "time"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);
    assert_eq!(
        read_rows(&merged, &["path", "time", "value"]),
        vec![
            vec![
                Value::Utf8("m".into()),
                Value::Int64(10),
                Value::Float64(3.0)
            ],
            vec![
                Value::Utf8("m".into()),
                Value::Int64(20),
                Value::Float64(4.0)
            ],
        ]
    );
}

#[test]
fn deduplicate_filters_equal_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new(),
    );

    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(StringArray::from(vec!["a"])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec!["a", "b"])),
        ],
        &["k"],
    );

    let mut run = merge_run_with(&data, vec![a, b], true, false);
    let merged = drive_to_completion(&mut run);
    assert_eq!(
        read_rows(&merged, &["k", "v"]),
        vec![
            vec![Value::Int64(1), Value::Utf8("a".into())],
            vec![Value::Int64(2), Value::Utf8("b".into())],
        ]
    );
}

#[test]
fn row_ttl_drops_expired_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("ts", DataType::Int64, false),
    ]));
    let schema = TableSchema::new(arrow.clone(), vec!["k".into()]).with_row_ttl(RowTtl {
        time_column: "ts".into(),
        delta_seconds: 100,
    });
    let data = table(
        tmp.path(),
        schema,
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new(),
    );

    let batch = RecordBatch::try_new(
        arrow.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(Int64Array::from(vec![TIME_OF_MERGE - 150, TIME_OF_MERGE - 50])),
        ],
    )
    .unwrap();
    let mut builder = PartBuilder::new(
        data.parts_dir().join("all_1_1_0"),
        arrow.clone(),
        PartType::Wide,
        vec!["k".to_string()],
    )
    .unwrap();
    builder.write(&batch).unwrap();
    let part = Arc::new(
        builder
            .with_ttl(TtlInfos {
                part: Some(TtlRange {
                    min: TIME_OF_MERGE - 50,
                    max: TIME_OF_MERGE + 50,
                }),
                columns: Default::default(),
            })
            .finish()
            .unwrap(),
    );

    let mut run = merge_run(&data, vec![part]);
    let merged = drive_to_completion(&mut run);
    assert_eq!(
        read_rows(&merged, &["k", "ts"]),
        vec![vec![Value::Int64(2), Value::Int64(TIME_OF_MERGE - 50)]]
    );
}

fn thousand_row_parts(
    data: &Arc<TableData>,
    arrow: &SchemaRef,
) -> (Arc<DataPart>, Arc<DataPart>) {
    let a_keys: Vec<i64> = (0..1000).map(|i| i * 2).collect();
    let a_vals: Vec<String> = (0..1000).map(|i| format!("a{i}")).collect();
    let b_keys: Vec<i64> = (0..1000).map(|i| i * 2 + 1).collect();
    let b_vals: Vec<String> = (0..1000).map(|i| format!("b{i}")).collect();
    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        arrow,
        vec![
            Arc::new(Int64Array::from(a_keys)),
            Arc::new(StringArray::from(a_vals)),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        arrow,
        vec![
            Arc::new(Int64Array::from(b_keys)),
            Arc::new(StringArray::from(b_vals)),
        ],
        &["k"],
    );
    (a, b)
}

#[test]
fn vertical_merge_gathers_non_key_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new().with_vertical_merge_thresholds(1, 1),
    );
    let (a, b) = thousand_row_parts(&data, &arrow);

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    assert_eq!(merged.rows_count(), 2000);
    // Blocks-are-granules: the key phase recorded one granule per block.
    assert!(!merged.meta().granules.is_empty());
    let rows = read_rows(&merged, &["k", "v"]);
    assert_eq!(rows.len(), 2000);
    for (idx, row) in rows.iter().enumerate() {
        assert_eq!(row[0], Value::Int64(idx as i64));
        let expected = if idx % 2 == 0 {
            format!("a{}", idx / 2)
        } else {
            format!("b{}", idx / 2)
        };
        assert_eq!(row[1], Value::Utf8(expected));
    }
    // The gathered column went through the vertical stage.
    assert_eq!(run.progress.snapshot().columns_written, 2);
}

#[test]
fn horizontal_and_vertical_agree_on_row_content() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let schema = TableSchema::new(arrow.clone(), vec!["k".into()]);
    let params = MergingParams::new(coppice::MergeMode::Ordinary);

    let vertical_data = table(
        &tmp.path().join("vertical"),
        schema.clone(),
        params.clone(),
        MergeTreeOptions::new().with_vertical_merge_thresholds(1, 1),
    );
    let horizontal_data = table(
        &tmp.path().join("horizontal"),
        schema,
        params,
        MergeTreeOptions::new().with_vertical_merge(false),
    );

    let (va, vb) = thousand_row_parts(&vertical_data, &arrow);
    let (ha, hb) = thousand_row_parts(&horizontal_data, &arrow);

    let mut vertical_run = merge_run(&vertical_data, vec![va, vb]);
    let vertical_part = drive_to_completion(&mut vertical_run);
    let mut horizontal_run = merge_run(&horizontal_data, vec![ha, hb]);
    let horizontal_part = drive_to_completion(&mut horizontal_run);

    assert_eq!(
        read_rows(&vertical_part, &["k", "v"]),
        read_rows(&horizontal_part, &["k", "v"])
    );
    // Horizontal writes blocks without the granule alignment.
    assert!(horizontal_part.meta().granules.is_empty());
}

#[test]
fn cancellation_leaves_partial_directory_and_no_part() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new().with_merge_block_size(2),
    );
    let (a, b) = thousand_row_parts(&data, &arrow);

    let future_part = Arc::new(
        FuturePart::assign(
            vec![a, b],
            PartType::Wide,
            StorageType::Full,
            MergeType::Regular,
        )
        .unwrap(),
    );
    let progress = Arc::new(MergeProgress::for_future_part(&future_part));
    let merges_blocker = Arc::new(ActionBlocker::new());
    let mut task = MergeTask::new(MergeTaskParams {
        data: data.clone(),
        future_part,
        progress,
        merges_blocker: merges_blocker.clone(),
        ttl_merges_blocker: Arc::new(ActionBlocker::new()),
        space_reservation: None,
        deduplicate: false,
        deduplicate_by_columns: Vec::new(),
        cleanup: false,
        merging_params: None,
        schema: None,
        time_of_merge: TIME_OF_MERGE,
        need_prefix: true,
    });
    let result = task.result_future();

    // Prepare plus a few merged blocks.
    for _ in 0..5 {
        assert!(task.execute().unwrap());
    }
    let _lock = merges_blocker.cancel();
    let err = loop {
        match task.execute() {
            Ok(true) => continue,
            Ok(false) => panic!("cancelled merge must not finish"),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, coppice::MergeError::Aborted(_)));

    // No part was committed; the temporary directory remains for cleanup.
    assert!(result.try_recv().is_err());
    assert!(data.parts_dir().join("tmp_merge_all_1_2_1").exists());
}

#[test]
fn projections_merge_recursively() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let schema = TableSchema::new(arrow.clone(), vec!["k".into()]).with_projection(
        ProjectionDescription {
            name: "by_v".into(),
            columns: vec!["v".into(), "k".into()],
            sort_key: vec!["v".into()],
            aggregating: false,
        },
    );
    let data = table(
        tmp.path(),
        schema,
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new(),
    );

    let proj_arrow = Arc::new(Schema::new(vec![
        Field::new("v", DataType::Utf8, true),
        Field::new("k", DataType::Int64, false),
    ]));
    let build_with_projection = |name: &str, keys: Vec<i64>, vals: Vec<&str>| {
        let part = build_part(
            data.parts_dir(),
            name,
            &arrow,
            vec![
                Arc::new(Int64Array::from(keys.clone())),
                Arc::new(StringArray::from(vals.clone())),
            ],
            &["k"],
        );
        // Projection rows live pre-sorted by the projection key.
        let mut sorted: Vec<(String, i64)> = vals
            .iter()
            .map(|v| v.to_string())
            .zip(keys.iter().copied())
            .collect();
        sorted.sort();
        let mut builder = PartBuilder::new(
            part.dir().join("by_v.proj"),
            proj_arrow.clone(),
            PartType::Wide,
            vec!["v".to_string()],
        )
        .unwrap();
        let batch = RecordBatch::try_new(
            proj_arrow.clone(),
            vec![
                Arc::new(StringArray::from(
                    sorted.iter().map(|(v, _)| v.clone()).collect::<Vec<_>>(),
                )),
                Arc::new(Int64Array::from(
                    sorted.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap();
        builder.write(&batch).unwrap();
        builder.finish().unwrap();
        // Reload so the projection sub-part is visible on the handle.
        Arc::new(DataPart::load(part.dir().to_path_buf()).unwrap())
    };

    let a = build_with_projection("all_1_1_0", vec![1, 3], vec!["x", "w"]);
    let b = build_with_projection("all_2_2_0", vec![4, 6], vec!["z", "y"]);

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    assert_eq!(merged.meta().projections, vec!["by_v".to_string()]);
    let projection = merged.projection_part("by_v").expect("projection merged");
    assert_eq!(projection.rows_count(), 4);
    let rows = read_rows(&Arc::new(projection), &["v", "k"]);
    assert_eq!(
        rows.iter().map(|row| row[0].clone()).collect::<Vec<_>>(),
        vec![
            Value::Utf8("w".into()),
            Value::Utf8("x".into()),
            Value::Utf8("y".into()),
            Value::Utf8("z".into()),
        ]
    );
}

#[test]
fn merged_part_records_minmax_and_sources() {
    let tmp = tempfile::tempdir().unwrap();
    let arrow = two_column_schema();
    let data = table(
        tmp.path(),
        TableSchema::new(arrow.clone(), vec!["k".into()]),
        MergingParams::new(coppice::MergeMode::Ordinary),
        MergeTreeOptions::new(),
    );
    let a = build_part(
        data.parts_dir(),
        "all_1_1_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![5, 9])),
            Arc::new(StringArray::from(vec!["a", "b"])),
        ],
        &["k"],
    );
    let b = build_part(
        data.parts_dir(),
        "all_2_2_0",
        &arrow,
        vec![
            Arc::new(Int64Array::from(vec![12])),
            Arc::new(StringArray::from(vec!["c"])),
        ],
        &["k"],
    );

    let mut run = merge_run(&data, vec![a, b]);
    let merged = drive_to_completion(&mut run);

    let minmax = &merged.meta().minmax.columns;
    let k_bounds = minmax.iter().find(|c| c.column == "k").unwrap();
    assert_eq!(k_bounds.min, Value::Int64(5));
    assert_eq!(k_bounds.max, Value::Int64(12));

    let sources: Vec<_> = merged
        .meta()
        .merged_source_parts
        .iter()
        .map(|s| (s.name.clone(), s.id, s.non_empty))
        .collect();
    assert_eq!(
        sources,
        vec![
            ("all_1_1_0".to_string(), 0, true),
            ("all_2_2_0".to_string(), 1, true),
        ]
    );
    assert!(!merged.meta().column_sizes.is_empty());
}
