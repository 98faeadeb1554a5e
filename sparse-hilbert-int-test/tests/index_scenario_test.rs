//! End-to-end walk through the canonical three-record fixture: build, sort,
//! sample, persist, reload and query.

use sparse_hilbert::{Bounds, FileRangeSource, IndexResult, LineCodec, SearchOptions, SpatialIndex};
use sparse_hilbert_int_test::test_util::{
    build_csv_index, csv_point, init_logging, scenario_lines,
};

#[test]
fn test_build_sorts_data_and_samples_table() {
    init_logging();
    let (_dir, index, sorted) = build_csv_index(&scenario_lines(), 2, 3);

    assert_eq!(index.count(), 3);
    assert_eq!(index.mins(), &[4.0, 2.0, 100.0]);
    assert_eq!(index.maxes(), &[10.0, 7.0, 600.0]);

    let data = std::fs::read_to_string(&sorted).unwrap();
    assert_eq!(data, "4,5,600\n8,7,100\n10,2,300\n");

    let entries: Vec<(u64, u64)> = index.positions().collect();
    assert_eq!(entries, vec![(17, 0), (35, 8), (56, 16)]);
}

#[test]
fn test_persist_and_reload_round_trip() {
    init_logging();
    let (dir, index, _sorted) = build_csv_index(&scenario_lines(), 2, 3);
    let idx_path = dir.path().join("data.idx");
    index.write_to_path(&idx_path).unwrap();

    let reloaded = SpatialIndex::read_from_path(
        &idx_path,
        LineCodec,
        csv_point as fn(&String) -> Vec<f64>,
    )
    .unwrap();
    assert_eq!(reloaded.count(), index.count());
    assert_eq!(reloaded.mins(), index.mins());
    assert_eq!(reloaded.maxes(), index.maxes());
    assert_eq!(
        reloaded.positions().collect::<Vec<_>>(),
        index.positions().collect::<Vec<_>>()
    );
}

#[test]
fn test_reloaded_index_answers_queries() {
    init_logging();
    let (dir, index, sorted) = build_csv_index(&scenario_lines(), 2, 3);
    let idx_path = dir.path().join("data.idx");
    index.write_to_path(&idx_path).unwrap();
    let reloaded = SpatialIndex::read_from_path(
        &idx_path,
        LineCodec,
        csv_point as fn(&String) -> Vec<f64>,
    )
    .unwrap();

    let source = FileRangeSource::new(&sorted);
    let bounds = Bounds::new(vec![7.0, 6.0, 50.0], vec![9.0, 8.0, 150.0]).unwrap();
    let records: Vec<String> = reloaded
        .search(&bounds, &source, &SearchOptions::default())
        .unwrap()
        .collect::<IndexResult<_>>()
        .unwrap();
    assert_eq!(records, vec!["8,7,100"]);
}

#[test]
fn test_repeated_queries_are_idempotent() {
    init_logging();
    let (_dir, index, sorted) = build_csv_index(&scenario_lines(), 2, 3);
    let source = FileRangeSource::new(&sorted);
    let bounds = Bounds::new(vec![7.0, 6.0, 50.0], vec![9.0, 8.0, 150.0]).unwrap();

    let run = || -> Vec<String> {
        index
            .search(&bounds, &source, &SearchOptions::default())
            .unwrap()
            .collect::<IndexResult<_>>()
            .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first, vec!["8,7,100"]);
}

#[test]
fn test_degenerate_dimension() {
    init_logging();
    // every record shares the second coordinate, so that dimension collapses
    // to ordinate zero and must not break indexing or search
    let lines = vec![
        "1,7,10".to_string(),
        "5,7,20".to_string(),
        "9,7,30".to_string(),
    ];
    let (_dir, index, sorted) = build_csv_index(&lines, 2, 3);
    assert_eq!(index.mins()[1], 7.0);
    assert_eq!(index.maxes()[1], 7.0);

    let source = FileRangeSource::new(&sorted);
    let bounds = Bounds::new(vec![0.0, 7.0, 0.0], vec![10.0, 7.0, 100.0]).unwrap();
    let mut records: Vec<String> = index
        .search(&bounds, &source, &SearchOptions::default())
        .unwrap()
        .collect::<IndexResult<_>>()
        .unwrap();
    records.sort();
    assert_eq!(records, vec!["1,7,10", "5,7,20", "9,7,30"]);
}

#[test]
fn test_single_record_file() {
    init_logging();
    let (_dir, index, sorted) = build_csv_index(&["3,4,5".to_string()], 2, 3);
    assert_eq!(index.count(), 1);
    // one record means degenerate bounds in every dimension
    let source = FileRangeSource::new(&sorted);
    let bounds = Bounds::new(vec![3.0, 4.0, 5.0], vec![3.0, 4.0, 5.0]).unwrap();
    let records: Vec<String> = index
        .search(&bounds, &source, &SearchOptions::default())
        .unwrap()
        .collect::<IndexResult<_>>()
        .unwrap();
    assert_eq!(records, vec!["3,4,5"]);
}
