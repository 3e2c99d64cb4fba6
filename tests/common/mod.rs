#![allow(dead_code)]

use petrel::exec::{execute_query, ExecutionParams, QueryOutput};
use petrel::query::parse_select;
use petrel::table::{TableBuilder, TableRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SHIP_MODES: [&str; 7] = ["AIR", "FOB", "MAIL", "RAIL", "REG AIR", "SHIP", "TRUCK"];

/// Day number of 1996-01-01; ship dates land in the 60 days after it.
pub const SHIPDATE_BASE: i32 = 9496;
pub const SHIPDATE_SPAN: i32 = 60;

/// A deterministic synthetic lineitem table plus the raw vectors it was
/// built from, so tests can compute expectations independently.
pub struct LineitemFixture {
    pub registry: TableRegistry,
    pub orderkey: Vec<i64>,
    pub shipmode: Vec<String>,
    pub shipdate: Vec<i32>,
    pub quantity: Vec<i32>,
    pub discount: Vec<i64>,
}

pub fn lineitem_fixture(rows: usize) -> LineitemFixture {
    let mut rng = StdRng::seed_from_u64(0x11EE);

    let mut orderkey = Vec::with_capacity(rows);
    let mut shipmode = Vec::with_capacity(rows);
    let mut shipdate = Vec::with_capacity(rows);
    let mut quantity = Vec::with_capacity(rows);
    let mut discount = Vec::with_capacity(rows);

    for row in 0..rows {
        orderkey.push((row / 3) as i64);
        shipmode.push(SHIP_MODES[rng.gen_range(0..SHIP_MODES.len())].to_string());
        shipdate.push(SHIPDATE_BASE + rng.gen_range(0..SHIPDATE_SPAN));
        quantity.push(rng.gen_range(1..=50));
        discount.push(rng.gen_range(0..=1000));
    }

    let table = TableBuilder::new("lineitem")
        .column_int64("l_orderkey", orderkey.clone())
        .column_strings("l_shipmode", shipmode.clone())
        .column_dates("l_shipdate", shipdate.clone())
        .column_int32("l_quantity", quantity.clone())
        .column_decimal("l_discount", 2, discount.clone())
        .build()
        .expect("build lineitem fixture");

    let mut registry = TableRegistry::new();
    registry.insert("lineitem".to_string(), table);

    LineitemFixture {
        registry,
        orderkey,
        shipmode,
        shipdate,
        quantity,
        discount,
    }
}

/// Executes one query across the parameter matrix (vector and scalar
/// kernels, one and several workers, both aggregation styles) and checks
/// that every configuration agrees before returning the result.
pub fn run_query(registry: &TableRegistry, sql: &str) -> QueryOutput {
    let mut reference: Option<QueryOutput> = None;
    for use_simd in [true, false] {
        for workers in [1usize, 4] {
            for eliminate_branches in [true, false] {
                let params = ExecutionParams {
                    use_simd,
                    parallel: workers > 1,
                    workers,
                    eliminate_branches,
                };
                let query = parse_select(sql, registry).expect("parse query");
                let output = execute_query(&query, &params).expect("execute query");
                match &reference {
                    None => reference = Some(output),
                    Some(expected) => assert_eq!(
                        &output, expected,
                        "configurations disagree for {sql} \
                         (simd={use_simd}, workers={workers}, \
                         branch_elim={eliminate_branches})"
                    ),
                }
            }
        }
    }
    reference.expect("at least one configuration ran")
}

/// Single-cell result helper for aggregate-only queries.
pub fn run_scalar_query(registry: &TableRegistry, sql: &str) -> String {
    let output = run_query(registry, sql);
    assert_eq!(output.values.len(), 1, "expected one row for {sql}");
    assert_eq!(output.values[0].len(), 1, "expected one column for {sql}");
    output.values[0][0].clone()
}
