use petrel::bitmap::Bitmap;
use petrel::column_data::{ColumnData, ColumnLayout, DictColumnData, RawColumnData};
use petrel::exec::filter::{compose_filters, AndFilter, CompareFilter, LoweredClause, RowFilter};
use petrel::exec::kernels::FusedOp;
use petrel::exec::plan::RowGroupRef;
use petrel::query::CmpOp;
use petrel::table::ColumnDesc;
use petrel::types::ColumnType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALL_OPS: [CmpOp; 6] = [
    CmpOp::Eq,
    CmpOp::Ne,
    CmpOp::Lt,
    CmpOp::Le,
    CmpOp::Gt,
    CmpOp::Ge,
];

fn int64_desc() -> ColumnDesc {
    ColumnDesc {
        name: "v".into(),
        ty: ColumnType::Int64,
        layout: ColumnLayout::Raw,
    }
}

fn string_desc() -> ColumnDesc {
    ColumnDesc {
        name: "s".into(),
        ty: ColumnType::String,
        layout: ColumnLayout::Dict,
    }
}

fn group_of(column: &ColumnData) -> RowGroupRef<'_> {
    RowGroupRef {
        columns: vec![column],
        size: column.size(),
        selection: None,
    }
}

fn reference_matches(values: &[i64], bound: i64, op: CmpOp) -> usize {
    values
        .iter()
        .filter(|&&v| match op {
            CmpOp::Eq => v == bound,
            CmpOp::Ne => v != bound,
            CmpOp::Lt => v < bound,
            CmpOp::Le => v <= bound,
            CmpOp::Gt => v > bound,
            CmpOp::Ge => v >= bound,
        })
        .count()
}

fn compare_filter(op: CmpOp, bound: i64, use_simd: bool) -> CompareFilter {
    CompareFilter::new(&int64_desc(), 0, &bound.to_string(), op, None, use_simd)
        .expect("build filter")
}

/// Every storage width, operator, and output mode: the vector and scalar
/// kernels agree with each other and with a plain reference scan.
#[test]
fn vector_and_scalar_paths_are_bit_identical() {
    let mut rng = StdRng::seed_from_u64(7);

    // Value ranges chosen so the builder picks 1, 2, 4, and 8 byte lanes.
    let ranges: [(i64, i64); 4] = [
        (-100, 100),
        (-20_000, 20_000),
        (-1_000_000, 1_000_000),
        (-5_000_000_000, 5_000_000_000),
    ];
    let sizes = [1usize, 63, 64, 65, 1_000];

    for (lo, hi) in ranges {
        for &size in &sizes {
            let values: Vec<i64> = (0..size).map(|_| rng.gen_range(lo..=hi)).collect();
            let column = ColumnData::Raw(RawColumnData::build(&values));
            let group = group_of(&column);

            for op in ALL_OPS {
                let bound = match rng.gen_range(0..3) {
                    0 => values[rng.gen_range(0..size)],
                    1 => rng.gen_range(lo..=hi),
                    _ => hi + rng.gen_range(1..100),
                };

                let expected = reference_matches(&values, bound, op);
                let fast = compare_filter(op, bound, true);
                let slow = compare_filter(op, bound, false);

                assert_eq!(fast.execute_count(&group).unwrap(), expected);
                assert_eq!(slow.execute_count(&group).unwrap(), expected);

                let mut fast_bitmap = Bitmap::new(size);
                let mut slow_bitmap = Bitmap::new(size);
                assert_eq!(fast.execute_set(&group, &mut fast_bitmap).unwrap(), expected);
                assert_eq!(slow.execute_set(&group, &mut slow_bitmap).unwrap(), expected);
                assert_eq!(fast_bitmap, slow_bitmap);
                assert_eq!(fast_bitmap.count_ones(), expected);
            }
        }
    }
}

#[test]
fn and_mode_agrees_across_paths() {
    let mut rng = StdRng::seed_from_u64(11);
    let values: Vec<i64> = (0..500).map(|_| rng.gen_range(-50..50)).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);

    // Seed bitmap from an independent predicate.
    let mut seed = Bitmap::new(values.len());
    compare_filter(CmpOp::Gt, 0, true)
        .execute_set(&group, &mut seed)
        .unwrap();

    for op in ALL_OPS {
        let bound = rng.gen_range(-60..60);
        let mut fast = seed.clone();
        let mut slow = seed.clone();
        let fast_count = compare_filter(op, bound, true)
            .execute_and(&group, &mut fast)
            .unwrap();
        let slow_count = compare_filter(op, bound, false)
            .execute_and(&group, &mut slow)
            .unwrap();

        let expected = (0..values.len())
            .filter(|&i| seed.is_set(i) && reference_matches(&values[i..=i], bound, op) == 1)
            .count();
        assert_eq!(fast_count, expected);
        assert_eq!(slow_count, expected);
        assert_eq!(fast, slow);
        assert_eq!(fast.count_ones(), expected);
    }
}

#[test]
fn fused_ranges_match_two_separate_passes() {
    let mut rng = StdRng::seed_from_u64(13);
    let values: Vec<i64> = (0..2_000).map(|_| rng.gen_range(0..1_000)).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);

    for (primary, fused_op) in [
        (CmpOp::Gt, FusedOp::Lt),
        (CmpOp::Ge, FusedOp::Le),
        (CmpOp::Gt, FusedOp::Le),
        (CmpOp::Ge, FusedOp::Lt),
    ] {
        for _ in 0..20 {
            let a = rng.gen_range(-100..1_100);
            let b = rng.gen_range(-100..1_100);
            let fused = CompareFilter::new(
                &int64_desc(),
                0,
                &a.to_string(),
                primary,
                Some((&b.to_string(), fused_op)),
                true,
            )
            .unwrap();

            let expected = values
                .iter()
                .filter(|&&v| {
                    let low = match primary {
                        CmpOp::Gt => v > a,
                        _ => v >= a,
                    };
                    let high = match fused_op {
                        FusedOp::Lt => v < b,
                        FusedOp::Le => v <= b,
                    };
                    low && high
                })
                .count();
            assert_eq!(
                fused.execute_count(&group).unwrap(),
                expected,
                "{primary:?}/{fused_op:?} bounds ({a}, {b})"
            );
        }
    }
}

#[test]
fn empty_fused_range_never_matches() {
    let values: Vec<i64> = (0..100).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);

    // a >= b in every placement relative to the stored range.
    for (a, b) in [(50, 40), (50, 50), (-10, -20), (200, 150), (120, -5)] {
        let filter = CompareFilter::new(
            &int64_desc(),
            0,
            &a.to_string(),
            CmpOp::Gt,
            Some((&b.to_string(), FusedOp::Lt)),
            true,
        )
        .unwrap();
        assert_eq!(filter.execute_count(&group).unwrap(), 0, "bounds ({a}, {b})");
    }
}

#[test]
fn equality_outside_min_max_short_circuits() {
    let values: Vec<i64> = (10..20).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);

    for bound in [-1_000_000_000_000i64, 9, 21, 1_000_000_000_000] {
        assert_eq!(
            compare_filter(CmpOp::Eq, bound, true)
                .execute_count(&group)
                .unwrap(),
            0
        );
        assert_eq!(
            compare_filter(CmpOp::Ne, bound, true)
                .execute_count(&group)
                .unwrap(),
            values.len()
        );
    }
}

#[test]
fn wide_dictionaries_use_two_byte_indices() {
    let mut rng = StdRng::seed_from_u64(17);
    let entries: Vec<String> = (0..400).map(|i| format!("value_{i:04}")).collect();
    let rows: Vec<String> = (0..5_000)
        .map(|_| entries[rng.gen_range(0..entries.len())].clone())
        .collect();
    let dict = DictColumnData::build_strings(&rows);
    assert_eq!(dict.index_width(), 2);
    let column = ColumnData::Dict(dict);
    let group = group_of(&column);

    for op in ALL_OPS {
        let probe = "value_0200";
        let expected = rows
            .iter()
            .filter(|row| match op {
                CmpOp::Eq => row.as_str() == probe,
                CmpOp::Ne => row.as_str() != probe,
                CmpOp::Lt => row.as_str() < probe,
                CmpOp::Le => row.as_str() <= probe,
                CmpOp::Gt => row.as_str() > probe,
                CmpOp::Ge => row.as_str() >= probe,
            })
            .count();

        for use_simd in [true, false] {
            let filter =
                CompareFilter::new(&string_desc(), 0, probe, op, None, use_simd).unwrap();
            assert_eq!(filter.execute_count(&group).unwrap(), expected, "{op:?}");
        }
    }
}

#[test]
fn dictionary_miss_with_ordering_operator_uses_virtual_index() {
    let rows: Vec<String> = ["AIR", "MAIL", "SHIP", "MAIL", "TRUCK"]
        .into_iter()
        .map(String::from)
        .collect();
    let column = ColumnData::Dict(DictColumnData::build_strings(&rows));
    let group = group_of(&column);

    // FOB is absent; ordering comparisons still see through to values.
    let cases = [
        (CmpOp::Lt, 1),  // AIR
        (CmpOp::Le, 1),
        (CmpOp::Gt, 4),  // MAIL, SHIP, MAIL, TRUCK
        (CmpOp::Ge, 4),
        (CmpOp::Eq, 0),
        (CmpOp::Ne, 5),
    ];
    for (op, expected) in cases {
        let filter = CompareFilter::new(&string_desc(), 0, "FOB", op, None, true).unwrap();
        assert_eq!(filter.execute_count(&group).unwrap(), expected, "{op:?}");
    }
}

/// AND composition produces the same bitmap whatever the child order.
#[test]
fn and_composition_is_order_insensitive() {
    let mut rng = StdRng::seed_from_u64(23);
    let values: Vec<i64> = (0..3_000).map(|_| rng.gen_range(0..100)).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);

    let make = |op: CmpOp, bound: i64| -> Box<dyn RowFilter> {
        Box::new(compare_filter(op, bound, true))
    };

    let forward = AndFilter::new(vec![
        make(CmpOp::Gt, 10),
        make(CmpOp::Lt, 80),
        make(CmpOp::Ne, 42),
    ]);
    let backward = AndFilter::new(vec![
        make(CmpOp::Ne, 42),
        make(CmpOp::Lt, 80),
        make(CmpOp::Gt, 10),
    ]);

    let mut forward_bitmap = Bitmap::new(values.len());
    let mut backward_bitmap = Bitmap::new(values.len());
    let forward_count = forward.execute_set(&group, &mut forward_bitmap).unwrap();
    let backward_count = backward.execute_set(&group, &mut backward_bitmap).unwrap();

    assert_eq!(forward_count, backward_count);
    assert_eq!(forward_bitmap, backward_bitmap);

    let expected = values
        .iter()
        .filter(|&&v| v > 10 && v < 80 && v != 42)
        .count();
    assert_eq!(forward_count, expected);
}

/// The clause composer pairs a lower and an upper bound on one column into
/// a single fused node and leaves other clauses standalone.
#[test]
fn compose_fuses_adjacent_bounds() {
    let values: Vec<i64> = (0..1_000).collect();
    let column = ColumnData::Raw(RawColumnData::build(&values));
    let group = group_of(&column);
    let desc = int64_desc();

    let clauses = [
        LoweredClause {
            column_index: 0,
            desc: &desc,
            op: CmpOp::Lt,
            value: "900",
        },
        LoweredClause {
            column_index: 0,
            desc: &desc,
            op: CmpOp::Gt,
            value: "100",
        },
    ];

    let filter = compose_filters(&clauses, true).unwrap().expect("non-empty");
    let expected = values.iter().filter(|&&v| v > 100 && v < 900).count();
    assert_eq!(filter.execute_count(&group).unwrap(), expected);

    let mut bitmap = Bitmap::new(values.len());
    assert_eq!(filter.execute_set(&group, &mut bitmap).unwrap(), expected);
    assert_eq!(bitmap.count_ones(), expected);
}

#[test]
fn compose_returns_none_for_empty_clause_list() {
    assert!(compose_filters(&[], true).unwrap().is_none());
}
