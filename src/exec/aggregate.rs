//! Partitioned aggregation: per-partition local states keyed by typed
//! group keys, a commutative merge, and a projection-ordered finalize.
//!
//! Group IDs are the dictionary indices of the group-by column widened to
//! 16 bits, so the per-row loops stay on small integers whatever the value
//! type. With no group-by every row lands in one implicit group with an
//! empty key.

use super::plan::RowGroupRef;
use crate::bitmap::Bitmap;
use crate::column_data::{ColumnLayout, RawColumnData};
use crate::error::{EngineError, Result};
use crate::table::ColumnDesc;
use crate::types::{ColumnType, ScalarValue};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// An aggregate clause resolved against the scanned row-group layout.
#[derive(Clone, Copy, Debug)]
pub enum LoweredAggregate {
    Count,
    Sum { column_index: usize },
    Project { column_index: usize },
}

/// Per-group aggregator state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggState {
    Count(u32),
    Sum(i64),
}

/// A worker-local aggregation result: group key to one state per
/// aggregator. Keys order by the group column's typed order.
#[derive(Debug, Default)]
pub struct LocalAggState {
    pub groups: BTreeMap<Vec<ScalarValue>, Vec<AggState>>,
}

trait Aggregator: Send + Sync {
    /// One state per group ID. `ids` may contain the sentinel value
    /// `group_count` for rows removed by branch elimination; those rows
    /// land in an extra bucket that is dropped from the result.
    fn local_aggregate(
        &self,
        group: &RowGroupRef<'_>,
        ids: &[u16],
        group_count: usize,
        selection: Option<&Bitmap>,
    ) -> Result<Vec<AggState>>;

    /// Commutative and associative.
    fn combine(&self, left: &mut AggState, right: &AggState);

    fn finalize(&self, state: &AggState) -> String;
}

struct CountAggregator;

impl Aggregator for CountAggregator {
    fn local_aggregate(
        &self,
        _group: &RowGroupRef<'_>,
        ids: &[u16],
        group_count: usize,
        selection: Option<&Bitmap>,
    ) -> Result<Vec<AggState>> {
        let mut counts = vec![0u32; group_count + 1];
        match selection {
            None => {
                for &g in ids {
                    counts[g as usize] += 1;
                }
            }
            Some(bitmap) => {
                for (i, &g) in ids.iter().enumerate() {
                    if bitmap.is_set(i) {
                        counts[g as usize] += 1;
                    }
                }
            }
        }
        counts.truncate(group_count);
        Ok(counts.into_iter().map(AggState::Count).collect())
    }

    fn combine(&self, left: &mut AggState, right: &AggState) {
        if let (AggState::Count(l), AggState::Count(r)) = (left, right) {
            *l += r;
        }
    }

    fn finalize(&self, state: &AggState) -> String {
        match state {
            AggState::Count(value) => value.to_string(),
            AggState::Sum(value) => value.to_string(),
        }
    }
}

struct SumAggregator {
    column_index: usize,
    ty: ColumnType,
}

impl Aggregator for SumAggregator {
    fn local_aggregate(
        &self,
        group: &RowGroupRef<'_>,
        ids: &[u16],
        group_count: usize,
        selection: Option<&Bitmap>,
    ) -> Result<Vec<AggState>> {
        let column = group.columns.get(self.column_index).ok_or_else(|| {
            EngineError::invalid("sum references a column outside the row group")
        })?;
        let raw = column.as_raw().ok_or_else(|| {
            EngineError::invalid("sum over a dictionary-encoded column is not supported")
        })?;

        let mut sums = vec![0i64; group_count + 1];
        sum_into(raw, ids, selection, &mut sums);
        sums.truncate(group_count);
        Ok(sums.into_iter().map(AggState::Sum).collect())
    }

    fn combine(&self, left: &mut AggState, right: &AggState) {
        if let (AggState::Sum(l), AggState::Sum(r)) = (left, right) {
            *l = l.wrapping_add(*r);
        }
    }

    fn finalize(&self, state: &AggState) -> String {
        match state {
            AggState::Sum(value) => self.ty.format_integer(*value),
            AggState::Count(value) => self.ty.format_integer(i64::from(*value)),
        }
    }
}

/// Widens each stored lane to 64 bits and accumulates per group.
/// Accumulation wraps; overflow is not detected.
pub(crate) fn sum_into(
    raw: &RawColumnData,
    ids: &[u16],
    selection: Option<&Bitmap>,
    sums: &mut [i64],
) {
    match raw.bytes_per_value {
        1 => accumulate(raw.values.lanes::<i8>(), ids, selection, sums),
        2 => accumulate(raw.values.lanes::<i16>(), ids, selection, sums),
        4 => accumulate(raw.values.lanes::<i32>(), ids, selection, sums),
        _ => accumulate(raw.values.lanes::<i64>(), ids, selection, sums),
    }
}

/// Sum of a whole column chunk, for the unfiltered ungrouped fast path.
pub(crate) fn sum_column(raw: &RawColumnData) -> i64 {
    match raw.bytes_per_value {
        1 => sum_lanes(raw.values.lanes::<i8>()),
        2 => sum_lanes(raw.values.lanes::<i16>()),
        4 => sum_lanes(raw.values.lanes::<i32>()),
        _ => sum_lanes(raw.values.lanes::<i64>()),
    }
}

fn sum_lanes<T: Copy + Into<i64>>(lanes: &[T]) -> i64 {
    lanes
        .iter()
        .fold(0i64, |acc, &v| acc.wrapping_add(v.into()))
}

fn accumulate<T: Copy + Into<i64>>(
    lanes: &[T],
    ids: &[u16],
    selection: Option<&Bitmap>,
    sums: &mut [i64],
) {
    match selection {
        None => {
            for (i, &g) in ids.iter().enumerate() {
                let slot = &mut sums[g as usize];
                *slot = slot.wrapping_add(lanes[i].into());
            }
        }
        Some(bitmap) => {
            for (i, &g) in ids.iter().enumerate() {
                if bitmap.is_set(i) {
                    let slot = &mut sums[g as usize];
                    *slot = slot.wrapping_add(lanes[i].into());
                }
            }
        }
    }
}

/// Terminal plan node: derives group IDs, runs every aggregator per
/// partition, merges local states, and projects the final rows.
pub struct AggregateNode {
    aggregators: Vec<Box<dyn Aggregator>>,
    group_by: Option<(usize, ColumnType)>,
    projection: Vec<usize>,
    field_names: Vec<String>,
    eliminate_branches: bool,
}

impl std::fmt::Debug for AggregateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateNode")
            .field("aggregators", &self.aggregators.len())
            .field("group_by", &self.group_by)
            .field("projection", &self.projection)
            .field("field_names", &self.field_names)
            .field("eliminate_branches", &self.eliminate_branches)
            .finish()
    }
}

impl AggregateNode {
    pub fn new(
        schema: &[ColumnDesc],
        aggregates: &[LoweredAggregate],
        group_by: Option<usize>,
        eliminate_branches: bool,
    ) -> Result<Self> {
        let group_by = match group_by {
            None => None,
            Some(idx) => {
                let desc = column_desc(schema, idx)?;
                if desc.layout != ColumnLayout::Dict {
                    return Err(EngineError::invalid(format!(
                        "group by requires a dictionary-encoded column: {}",
                        desc.name
                    )));
                }
                Some((idx, desc.ty.clone()))
            }
        };
        let key_len = usize::from(group_by.is_some());

        let mut aggregators: Vec<Box<dyn Aggregator>> = Vec::new();
        let mut projection = Vec::with_capacity(aggregates.len());
        let mut field_names = Vec::with_capacity(aggregates.len());

        for aggregate in aggregates {
            match *aggregate {
                LoweredAggregate::Count => {
                    aggregators.push(Box::new(CountAggregator));
                    projection.push(key_len + aggregators.len() - 1);
                    field_names.push("count".to_string());
                }
                LoweredAggregate::Sum { column_index } => {
                    let desc = column_desc(schema, column_index)?;
                    if desc.layout != ColumnLayout::Raw {
                        return Err(EngineError::invalid(format!(
                            "sum over dictionary-encoded column {} is not supported",
                            desc.name
                        )));
                    }
                    aggregators.push(Box::new(SumAggregator {
                        column_index,
                        ty: desc.ty.clone(),
                    }));
                    projection.push(key_len + aggregators.len() - 1);
                    field_names.push("sum".to_string());
                }
                LoweredAggregate::Project { column_index } => {
                    let desc = column_desc(schema, column_index)?;
                    match group_by {
                        Some((group_idx, _)) if group_idx == column_index => {
                            projection.push(0);
                        }
                        _ => {
                            return Err(EngineError::invalid(format!(
                                "column {} must appear in GROUP BY",
                                desc.name
                            )));
                        }
                    }
                    field_names.push(desc.name.clone());
                }
            }
        }

        Ok(Self {
            aggregators,
            group_by,
            projection,
            field_names,
            eliminate_branches,
        })
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn process_row_group(&self, group: &RowGroupRef<'_>) -> Result<LocalAggState> {
        let (mut ids, group_count, keys) = self.derive_groups(group)?;

        let selection = match (&group.selection, self.eliminate_branches) {
            (Some(bitmap), true) => {
                // Rows the filter removed are redirected to an extra
                // bucket; the per-row loops below then run without a
                // bitmap test.
                mask_unselected(&mut ids, bitmap, group_count as u16);
                None
            }
            (Some(bitmap), false) => Some(bitmap),
            (None, _) => None,
        };

        let mut local = LocalAggState::default();
        for aggregator in &self.aggregators {
            let states = aggregator.local_aggregate(group, &ids, group_count, selection)?;
            debug_assert_eq!(states.len(), keys.len());
            for (key, state) in keys.iter().zip(states) {
                local.groups.entry(key.clone()).or_default().push(state);
            }
        }
        Ok(local)
    }

    fn derive_groups(
        &self,
        group: &RowGroupRef<'_>,
    ) -> Result<(Vec<u16>, usize, Vec<Vec<ScalarValue>>)> {
        match self.group_by {
            None => Ok((vec![0u16; group.size], 1, vec![Vec::new()])),
            Some((column_index, _)) => {
                let column = group.columns.get(column_index).ok_or_else(|| {
                    EngineError::invalid("group by references a column outside the row group")
                })?;
                let dict = column.as_dict().ok_or_else(|| {
                    EngineError::invalid("group by column is not dictionary-encoded")
                })?;
                let ids = dict.widened_ids();
                let group_count = dict.dict.len();
                let keys = (0..group_count)
                    .map(|g| vec![dict.dict.scalar_at(g)])
                    .collect();
                Ok((ids, group_count, keys))
            }
        }
    }

    /// Moves every group of `right` into `left`, pairwise-combining states
    /// for keys present on both sides.
    pub fn combine(&self, left: &mut LocalAggState, right: LocalAggState) {
        for (key, right_states) in right.groups {
            match left.groups.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(right_states);
                }
                Entry::Occupied(mut slot) => {
                    let left_states = slot.get_mut();
                    for (aggregator, (l, r)) in self
                        .aggregators
                        .iter()
                        .zip(left_states.iter_mut().zip(right_states.iter()))
                    {
                        aggregator.combine(l, r);
                    }
                }
            }
        }
    }

    /// Emits one row per group key: group columns first, then finalized
    /// aggregates, reordered by the projection derived from clause order.
    pub fn finalize(&self, state: &LocalAggState) -> Vec<Vec<String>> {
        let mut rows = Vec::with_capacity(state.groups.len());
        for (key, states) in &state.groups {
            let mut full_row = Vec::with_capacity(1 + self.aggregators.len());
            if let Some((_, ty)) = &self.group_by {
                full_row.push(key[0].format(ty));
            }
            for (aggregator, agg_state) in self.aggregators.iter().zip(states) {
                full_row.push(aggregator.finalize(agg_state));
            }
            rows.push(self.projection.iter().map(|&p| full_row[p].clone()).collect());
        }
        rows
    }
}

fn column_desc(schema: &[ColumnDesc], idx: usize) -> Result<&ColumnDesc> {
    schema
        .get(idx)
        .ok_or_else(|| EngineError::invalid(format!("column index {idx} out of range")))
}

/// Branchless group-ID rewrite: rows with a cleared selection bit move to
/// the sentinel bucket.
fn mask_unselected(ids: &mut [u16], selection: &Bitmap, sentinel: u16) {
    let words = selection.words();
    for (i, id) in ids.iter_mut().enumerate() {
        let bit = (words[i >> 6] >> (i & 63)) & 1;
        let keep = 0u16.wrapping_sub(bit as u16);
        *id = (*id & keep) | (sentinel & !keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_data::{ColumnData, DictColumnData};

    fn view(columns: Vec<&ColumnData>, size: usize) -> RowGroupRef<'_> {
        RowGroupRef {
            columns,
            size,
            selection: None,
        }
    }

    fn string_column(values: &[&str]) -> ColumnData {
        let owned: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        ColumnData::Dict(DictColumnData::build_strings(&owned))
    }

    #[test]
    fn grouped_count_over_dictionary_keys() {
        let column = string_column(&["AIR", "MAIL", "AIR", "SHIP", "AIR"]);
        let schema = vec![ColumnDesc {
            name: "mode".into(),
            ty: ColumnType::String,
            layout: ColumnLayout::Dict,
        }];
        let node =
            AggregateNode::new(&schema, &[LoweredAggregate::Count], Some(0), true).unwrap();

        let local = node.process_row_group(&view(vec![&column], 5)).unwrap();
        let rows = node.finalize(&local);
        assert_eq!(rows, vec![vec!["3".to_string()], vec!["1".into()], vec!["1".into()]]);
    }

    #[test]
    fn branch_elimination_matches_bitmap_gating() {
        let column = string_column(&["AIR", "MAIL", "AIR", "SHIP", "AIR", "MAIL"]);
        let schema = vec![ColumnDesc {
            name: "mode".into(),
            ty: ColumnType::String,
            layout: ColumnLayout::Dict,
        }];

        let mut selection = Bitmap::new(6);
        for idx in [0, 2, 5] {
            selection.set(idx);
        }

        let mut results = Vec::new();
        for eliminate in [true, false] {
            let node =
                AggregateNode::new(&schema, &[LoweredAggregate::Count], Some(0), eliminate)
                    .unwrap();
            let mut group = view(vec![&column], 6);
            group.selection = Some(selection.clone());
            let local = node.process_row_group(&group).unwrap();
            results.push(node.finalize(&local));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], vec![vec!["2".to_string()], vec!["1".into()], vec!["0".into()]]);
    }

    #[test]
    fn combine_moves_missing_keys_and_adds_shared_ones() {
        let column_a = string_column(&["AIR", "AIR", "MAIL"]);
        let column_b = string_column(&["MAIL", "RAIL"]);
        let schema = vec![ColumnDesc {
            name: "mode".into(),
            ty: ColumnType::String,
            layout: ColumnLayout::Dict,
        }];
        let node =
            AggregateNode::new(&schema, &[LoweredAggregate::Count], Some(0), true).unwrap();

        let mut merged = node.process_row_group(&view(vec![&column_a], 3)).unwrap();
        let right = node.process_row_group(&view(vec![&column_b], 2)).unwrap();
        node.combine(&mut merged, right);

        let rows = node.finalize(&merged);
        assert_eq!(
            rows,
            vec![vec!["2".to_string()], vec!["2".into()], vec!["1".into()]]
        );
    }

    #[test]
    fn sum_requires_raw_layout() {
        let schema = vec![ColumnDesc {
            name: "mode".into(),
            ty: ColumnType::String,
            layout: ColumnLayout::Dict,
        }];
        let err = AggregateNode::new(
            &schema,
            &[LoweredAggregate::Sum { column_index: 0 }],
            None,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum over dictionary-encoded column"));
    }

    #[test]
    fn projection_must_reference_the_group_column() {
        let schema = vec![
            ColumnDesc {
                name: "mode".into(),
                ty: ColumnType::String,
                layout: ColumnLayout::Dict,
            },
            ColumnDesc {
                name: "other".into(),
                ty: ColumnType::String,
                layout: ColumnLayout::Dict,
            },
        ];
        let err = AggregateNode::new(
            &schema,
            &[LoweredAggregate::Project { column_index: 1 }],
            Some(0),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must appear in GROUP BY"));
    }
}
