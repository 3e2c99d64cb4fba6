//! Query execution: plan building, worker fan-out over row-group
//! partitions, and the reduction into final rows.

pub mod aggregate;
pub mod filter;
pub mod kernels;
pub mod plan;

use crate::error::{EngineError, Result};
use crate::query::{AggregateKind, QueryDesc};
use crate::table::Table;
use aggregate::{AggregateNode, LocalAggState, LoweredAggregate};
use filter::{compose_filters, LoweredClause};
use plan::{FilterNode, ScanNode};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

pub const DEFAULT_WORKERS: usize = 8;

/// Knobs for one query execution. Defaults match production behavior;
/// tests flip them to cover the scalar kernels and single-threaded runs.
#[derive(Clone, Debug)]
pub struct ExecutionParams {
    /// Vectorized kernels when true, the scalar family when false.
    pub use_simd: bool,
    pub parallel: bool,
    pub workers: usize,
    /// Rewrite filtered-out rows to a sentinel group instead of testing
    /// the selection bitmap per row during aggregation.
    pub eliminate_branches: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            use_simd: true,
            parallel: true,
            workers: DEFAULT_WORKERS,
            eliminate_branches: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOutput {
    pub field_names: Vec<String>,
    pub values: Vec<Vec<String>>,
}

/// Runs a lowered query to completion. Any error aborts the whole query;
/// no partial results are returned.
pub fn execute_query(query: &QueryDesc<'_>, params: &ExecutionParams) -> Result<QueryOutput> {
    if query.tables.len() != 1 {
        return Err(EngineError::invalid(format!(
            "queries over {} tables are not supported",
            query.tables.len()
        )));
    }
    if query.aggregate_clauses.is_empty() {
        return Err(EngineError::invalid("query has no aggregates"));
    }
    if query.group_by.len() > 1 {
        return Err(EngineError::invalid(
            "multi-column group by is not supported",
        ));
    }
    let table = query.tables[0];

    debug!(
        table = table.name(),
        filters = query.filter_clauses.len(),
        group_by = query.group_by.len(),
        aggregates = query.aggregate_clauses.len(),
        "executing query"
    );

    if query.filter_clauses.is_empty() && query.group_by.is_empty() {
        return execute_simple_fold(table, query);
    }

    if query.group_by.is_empty()
        && query.aggregate_clauses.len() == 1
        && query.aggregate_clauses[0].kind == AggregateKind::Count
    {
        return execute_filtered_count(table, query, params);
    }

    execute_partitioned(table, query, params)
}

/// Unfiltered, ungrouped aggregates fold directly over the stored groups.
fn execute_simple_fold(table: &Table, query: &QueryDesc<'_>) -> Result<QueryOutput> {
    let mut field_names = Vec::with_capacity(query.aggregate_clauses.len());
    let mut row = Vec::with_capacity(query.aggregate_clauses.len());

    for clause in &query.aggregate_clauses {
        match clause.kind {
            AggregateKind::Count => {
                field_names.push("count".to_string());
                row.push(count_all(table).to_string());
            }
            AggregateKind::Sum => {
                let column_ref = clause
                    .column_ref
                    .ok_or_else(|| EngineError::invalid("sum requires a column"))?;
                let desc = &table.schema()[column_ref.column_idx];
                if desc.layout != crate::column_data::ColumnLayout::Raw {
                    return Err(EngineError::invalid(format!(
                        "sum over dictionary-encoded column {} is not supported",
                        desc.name
                    )));
                }
                let mut total = 0i64;
                for group in table.row_groups() {
                    match &group.columns[column_ref.column_idx] {
                        crate::column_data::ColumnData::Raw(raw) => {
                            total = total.wrapping_add(aggregate::sum_column(raw));
                        }
                        crate::column_data::ColumnData::Dict(_) => {
                            return Err(EngineError::invalid(format!(
                                "sum over dictionary-encoded column {} is not supported",
                                desc.name
                            )));
                        }
                    }
                }
                field_names.push("sum".to_string());
                row.push(desc.ty.format_integer(total));
            }
            AggregateKind::Project => {
                let name = clause
                    .column_ref
                    .map(|column_ref| table.schema()[column_ref.column_idx].name.clone())
                    .unwrap_or_default();
                return Err(EngineError::invalid(format!(
                    "column {name} must appear in GROUP BY"
                )));
            }
        }
    }

    Ok(QueryOutput {
        field_names,
        values: vec![row],
    })
}

/// `count(*)` with filters and no grouping: per-partition count-only
/// filter passes, no bitmap allocated, summed across workers.
fn execute_filtered_count(
    table: &Table,
    query: &QueryDesc<'_>,
    params: &ExecutionParams,
) -> Result<QueryOutput> {
    let (node, _local_of) = build_filtered_scan(table, query, params)?;
    let partitions = node.partition_count();
    let workers = worker_count(params, partitions);

    let total = parallel_fold(
        partitions,
        workers,
        |partition| node.execute_count(partition).map(|count| count as u64),
        || 0u64,
        |acc, count| *acc += count,
    )?;

    Ok(QueryOutput {
        field_names: vec!["count".to_string()],
        values: vec![vec![total.to_string()]],
    })
}

/// The general pipeline: scan, filter bitmaps, partitioned aggregation,
/// merge, finalize.
fn execute_partitioned(
    table: &Table,
    query: &QueryDesc<'_>,
    params: &ExecutionParams,
) -> Result<QueryOutput> {
    let (node, local_of) = build_filtered_scan(table, query, params)?;

    let mut aggregates = Vec::with_capacity(query.aggregate_clauses.len());
    for clause in &query.aggregate_clauses {
        let lowered = match clause.kind {
            AggregateKind::Count => LoweredAggregate::Count,
            AggregateKind::Sum => {
                let column_ref = clause
                    .column_ref
                    .ok_or_else(|| EngineError::invalid("sum requires a column"))?;
                LoweredAggregate::Sum {
                    column_index: local_of[&column_ref.column_idx],
                }
            }
            AggregateKind::Project => {
                let column_ref = clause
                    .column_ref
                    .ok_or_else(|| EngineError::invalid("projection requires a column"))?;
                LoweredAggregate::Project {
                    column_index: local_of[&column_ref.column_idx],
                }
            }
        };
        aggregates.push(lowered);
    }
    let group_by_local = query
        .group_by
        .first()
        .map(|group_by| local_of[&group_by.column_idx]);

    let agg_node = AggregateNode::new(
        node.schema(),
        &aggregates,
        group_by_local,
        params.eliminate_branches,
    )?;

    let partitions = node.partition_count();
    let workers = worker_count(params, partitions);
    debug!(partitions, workers, "fanning out aggregation");

    let merged = parallel_fold(
        partitions,
        workers,
        |partition| {
            let group = node.execute(partition)?;
            agg_node.process_row_group(&group)
        },
        LocalAggState::default,
        |left, right| agg_node.combine(left, right),
    )?;

    Ok(QueryOutput {
        field_names: agg_node.field_names().to_vec(),
        values: agg_node.finalize(&merged),
    })
}

/// Builds the scan over every referenced column plus the composite filter,
/// returning the table-index to scan-index mapping.
fn build_filtered_scan<'a>(
    table: &'a Table,
    query: &'a QueryDesc<'a>,
    params: &ExecutionParams,
) -> Result<(FilterNode<'a>, HashMap<usize, usize>)> {
    let mut referenced: BTreeSet<usize> = BTreeSet::new();
    for clause in &query.filter_clauses {
        referenced.insert(clause.column_ref.column_idx);
    }
    for group_by in &query.group_by {
        referenced.insert(group_by.column_idx);
    }
    for clause in &query.aggregate_clauses {
        if let Some(column_ref) = clause.column_ref {
            referenced.insert(column_ref.column_idx);
        }
    }
    let column_indexes: Vec<usize> = referenced.into_iter().collect();
    let local_of: HashMap<usize, usize> = column_indexes
        .iter()
        .enumerate()
        .map(|(local, &table_idx)| (table_idx, local))
        .collect();

    let lowered: Vec<LoweredClause<'_>> = query
        .filter_clauses
        .iter()
        .map(|clause| LoweredClause {
            column_index: local_of[&clause.column_ref.column_idx],
            desc: &table.schema()[clause.column_ref.column_idx],
            op: clause.op,
            value: &clause.value,
        })
        .collect();

    let scan = ScanNode::new(table, column_indexes)?;
    let filter = compose_filters(&lowered, params.use_simd)?;
    Ok((FilterNode::new(scan, filter), local_of))
}

fn count_all(table: &Table) -> u64 {
    table
        .row_groups()
        .iter()
        .map(|group| {
            debug_assert!(
                group.columns.iter().all(|column| column.size() == group.size),
                "row group columns disagree on size"
            );
            group.size as u64
        })
        .sum()
}

fn worker_count(params: &ExecutionParams, partitions: usize) -> usize {
    if !params.parallel {
        return 1;
    }
    params.workers.clamp(1, partitions.max(1))
}

/// Round-robins partitions across workers, folds worker results in a
/// reducer fed by a channel, and surfaces the first error unchanged.
fn parallel_fold<T, Task, Zero, Merge>(
    partitions: usize,
    workers: usize,
    task: Task,
    zero: Zero,
    merge: Merge,
) -> Result<T>
where
    T: Send,
    Task: Fn(usize) -> Result<T> + Sync,
    Zero: Fn() -> T + Sync,
    Merge: Fn(&mut T, T) + Sync,
{
    let worker_task = |worker: usize| -> Result<T> {
        let mut acc = zero();
        let mut partition = worker;
        while partition < partitions {
            merge(&mut acc, task(partition)?);
            partition += workers;
        }
        Ok(acc)
    };

    if workers <= 1 {
        return worker_task(0);
    }

    std::thread::scope(|scope| {
        let (sender, receiver) = crossbeam::channel::unbounded::<Result<T>>();
        for worker in 0..workers {
            let sender = sender.clone();
            let worker_task = &worker_task;
            scope.spawn(move || {
                let _ = sender.send(worker_task(worker));
            });
        }
        drop(sender);

        let mut merged = zero();
        let mut first_error: Option<EngineError> = None;
        for result in receiver.iter() {
            match result {
                Ok(value) => {
                    if first_error.is_none() {
                        merge(&mut merged, value);
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    })
}
