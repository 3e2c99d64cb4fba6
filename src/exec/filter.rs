//! Filter nodes: single-column comparisons and their AND composition.
//!
//! Before any kernel runs, the requested bounds are checked against the
//! column's observable range (min/max for raw columns, the index range for
//! dictionary columns). Predicates that provably match everything or
//! nothing short-circuit, and surviving bounds are always representable at
//! the kernel's lane width.

use super::kernels::{filter_all, filter_lanes, filter_none, FilterMode, FusedOp};
use super::plan::RowGroupRef;
use crate::bitmap::Bitmap;
use crate::column_data::{ColumnData, DictColumnData, DictValues, RawColumnData};
use crate::error::{EngineError, Result};
use crate::query::CmpOp;
use crate::table::ColumnDesc;
use crate::types::ColumnType;
use std::cmp::Ordering;

/// A predicate over one column of a row group, evaluated in one of three
/// output modes.
pub trait RowFilter: Send + Sync {
    fn execute_count(&self, group: &RowGroupRef<'_>) -> Result<usize>;
    fn execute_set(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize>;
    fn execute_and(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize>;
}

/// Filter value parsed with the column's type at build time.
#[derive(Clone, Debug)]
enum FilterValue {
    Int(i64),
    Str(String),
}

impl FilterValue {
    fn parse(ty: &ColumnType, text: &str) -> Result<Self> {
        match ty {
            ColumnType::String => Ok(FilterValue::Str(text.to_string())),
            _ => Ok(FilterValue::Int(ty.parse_integer(text)?)),
        }
    }
}

/// `column (op) value`, optionally fused with an upper bound evaluated in
/// the same kernel pass.
pub struct CompareFilter {
    column_index: usize,
    op: CmpOp,
    value: FilterValue,
    fused: Option<(FilterValue, FusedOp)>,
    use_simd: bool,
}

impl CompareFilter {
    pub fn new(
        desc: &ColumnDesc,
        column_index: usize,
        value: &str,
        op: CmpOp,
        fused: Option<(&str, FusedOp)>,
        use_simd: bool,
    ) -> Result<Self> {
        let value = FilterValue::parse(&desc.ty, value)?;
        let fused = match fused {
            Some((text, fop)) => Some((FilterValue::parse(&desc.ty, text)?, fop)),
            None => None,
        };
        Ok(Self {
            column_index,
            op,
            value,
            fused,
            use_simd,
        })
    }

    fn run(&self, group: &RowGroupRef<'_>, mode: FilterMode<'_>) -> Result<usize> {
        let column = group.columns.get(self.column_index).ok_or_else(|| {
            EngineError::invalid(format!(
                "filter references column {} of a {}-column row group",
                self.column_index,
                group.columns.len()
            ))
        })?;
        if group.size == 0 {
            return Ok(filter_none(mode));
        }
        match column {
            ColumnData::Raw(raw) => self.run_raw(raw, mode),
            ColumnData::Dict(dict) => self.run_dict(dict, mode),
        }
    }

    fn run_raw(&self, raw: &RawColumnData, mode: FilterMode<'_>) -> Result<usize> {
        let FilterValue::Int(bound) = &self.value else {
            return Err(EngineError::invalid(
                "raw column filtered with a string value",
            ));
        };
        let bound = *bound;
        let fused = match &self.fused {
            None => None,
            Some((FilterValue::Int(f), fop)) => Some((*f, *fop)),
            Some((FilterValue::Str(_), _)) => {
                return Err(EngineError::invalid(
                    "raw column filtered with a string value",
                ));
            }
        };

        match reduce_bounds(bound, self.op, fused, raw.min_value, raw.max_value) {
            BoundsPlan::NoRows => Ok(filter_none(mode)),
            BoundsPlan::AllRows => Ok(filter_all(raw.size, mode)),
            BoundsPlan::Eval { bound, op, fused } => Ok(match raw.bytes_per_value {
                1 => filter_lanes(
                    raw.values.lanes::<i8>(),
                    bound as i8,
                    op,
                    fused.map(|(f, fop)| (f as i8, fop)),
                    mode,
                    self.use_simd,
                ),
                2 => filter_lanes(
                    raw.values.lanes::<i16>(),
                    bound as i16,
                    op,
                    fused.map(|(f, fop)| (f as i16, fop)),
                    mode,
                    self.use_simd,
                ),
                4 => filter_lanes(
                    raw.values.lanes::<i32>(),
                    bound as i32,
                    op,
                    fused.map(|(f, fop)| (f as i32, fop)),
                    mode,
                    self.use_simd,
                ),
                _ => filter_lanes(
                    raw.values.lanes::<i64>(),
                    bound,
                    op,
                    fused,
                    mode,
                    self.use_simd,
                ),
            }),
        }
    }

    fn run_dict(&self, dict: &DictColumnData, mode: FilterMode<'_>) -> Result<usize> {
        let dict_len = dict.dict.len();
        if dict_len == 0 {
            return Ok(filter_none(mode));
        }

        let idx = dict_index(&dict.dict, &self.value, self.op)?;
        let fused_idx = match &self.fused {
            None => None,
            Some((value, fop)) => Some((dict_index(&dict.dict, value, fop.as_cmp())?, *fop)),
        };

        match reduce_bounds(idx, self.op, fused_idx, 0, dict_len as i64 - 1) {
            BoundsPlan::NoRows => Ok(filter_none(mode)),
            BoundsPlan::AllRows => Ok(filter_all(dict.size, mode)),
            BoundsPlan::Eval { bound, op, fused } => Ok(match dict.index_width() {
                1 => filter_lanes(
                    dict.values.lanes::<u8>(),
                    bound as u8,
                    op,
                    fused.map(|(f, fop)| (f as u8, fop)),
                    mode,
                    self.use_simd,
                ),
                _ => filter_lanes(
                    dict.values.lanes::<u16>(),
                    bound as u16,
                    op,
                    fused.map(|(f, fop)| (f as u16, fop)),
                    mode,
                    self.use_simd,
                ),
            }),
        }
    }
}

impl RowFilter for CompareFilter {
    fn execute_count(&self, group: &RowGroupRef<'_>) -> Result<usize> {
        self.run(group, FilterMode::CountOnly)
    }

    fn execute_set(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize> {
        self.run(group, FilterMode::Set(bitmap))
    }

    fn execute_and(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize> {
        self.run(group, FilterMode::And(bitmap))
    }
}

/// Conjunction of filter nodes. The first child writes a fresh bitmap and
/// every later child narrows it in place.
pub struct AndFilter {
    children: Vec<Box<dyn RowFilter>>,
}

impl AndFilter {
    pub fn new(children: Vec<Box<dyn RowFilter>>) -> Self {
        Self { children }
    }
}

impl RowFilter for AndFilter {
    fn execute_count(&self, group: &RowGroupRef<'_>) -> Result<usize> {
        let mut scratch = Bitmap::new(group.size);
        self.execute_set(group, &mut scratch)
    }

    fn execute_set(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize> {
        let mut matches = 0;
        for (i, child) in self.children.iter().enumerate() {
            matches = if i == 0 {
                child.execute_set(group, bitmap)?
            } else {
                child.execute_and(group, bitmap)?
            };
        }
        Ok(matches)
    }

    fn execute_and(&self, group: &RowGroupRef<'_>, bitmap: &mut Bitmap) -> Result<usize> {
        let mut matches = bitmap.count_ones();
        for child in &self.children {
            matches = child.execute_and(group, bitmap)?;
        }
        Ok(matches)
    }
}

/// A filter clause resolved against the scanned row-group layout.
pub struct LoweredClause<'a> {
    pub column_index: usize,
    pub desc: &'a ColumnDesc,
    pub op: CmpOp,
    pub value: &'a str,
}

/// Lowers clauses into a composite filter node. Clauses are ordered by
/// (column, operator) and a `>`/`>=` immediately followed by a `<`/`<=` on
/// the same column becomes one fused range node.
pub fn compose_filters(
    clauses: &[LoweredClause<'_>],
    use_simd: bool,
) -> Result<Option<Box<dyn RowFilter>>> {
    if clauses.is_empty() {
        return Ok(None);
    }

    let mut ordered: Vec<&LoweredClause<'_>> = clauses.iter().collect();
    ordered.sort_by_key(|clause| (clause.column_index, fuse_rank(clause.op)));

    let mut nodes: Vec<Box<dyn RowFilter>> = Vec::new();
    let mut i = 0;
    while i < ordered.len() {
        let clause = ordered[i];
        let fused = ordered.get(i + 1).and_then(|next| {
            let lower = matches!(clause.op, CmpOp::Gt | CmpOp::Ge);
            let upper = matches!(next.op, CmpOp::Lt | CmpOp::Le);
            if next.column_index == clause.column_index && lower && upper {
                let fop = if next.op == CmpOp::Lt { FusedOp::Lt } else { FusedOp::Le };
                Some((next.value, fop))
            } else {
                None
            }
        });

        nodes.push(Box::new(CompareFilter::new(
            clause.desc,
            clause.column_index,
            clause.value,
            clause.op,
            fused,
            use_simd,
        )?));
        i += if fused.is_some() { 2 } else { 1 };
    }

    if nodes.len() == 1 {
        Ok(nodes.pop())
    } else {
        Ok(Some(Box::new(AndFilter::new(nodes))))
    }
}

/// Ordering under which fusable bound pairs become adjacent.
fn fuse_rank(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => 0,
        CmpOp::Ne => 1,
        CmpOp::Gt => 2,
        CmpOp::Ge => 3,
        CmpOp::Lt => 4,
        CmpOp::Le => 5,
    }
}

enum BoundsPlan {
    NoRows,
    AllRows,
    Eval {
        bound: i64,
        op: CmpOp,
        fused: Option<(i64, FusedOp)>,
    },
}

/// How much of `[lo, hi]` a single comparison covers.
#[derive(PartialEq, Eq)]
enum Cover {
    All,
    Nothing,
    Partial,
}

fn cover(bound: i64, op: CmpOp, lo: i64, hi: i64) -> Cover {
    match op {
        CmpOp::Eq => {
            if bound < lo || bound > hi {
                Cover::Nothing
            } else {
                Cover::Partial
            }
        }
        CmpOp::Ne => {
            if bound < lo || bound > hi {
                Cover::All
            } else {
                Cover::Partial
            }
        }
        CmpOp::Lt => {
            if bound <= lo {
                Cover::Nothing
            } else if bound > hi {
                Cover::All
            } else {
                Cover::Partial
            }
        }
        CmpOp::Le => {
            if bound < lo {
                Cover::Nothing
            } else if bound >= hi {
                Cover::All
            } else {
                Cover::Partial
            }
        }
        CmpOp::Gt => {
            if bound >= hi {
                Cover::Nothing
            } else if bound < lo {
                Cover::All
            } else {
                Cover::Partial
            }
        }
        CmpOp::Ge => {
            if bound > hi {
                Cover::Nothing
            } else if bound <= lo {
                Cover::All
            } else {
                Cover::Partial
            }
        }
    }
}

/// Combines the skip decisions of the primary and fused bounds. A bound
/// that survives is always within `[lo, hi]`, so narrowing it to the lane
/// width never truncates.
fn reduce_bounds(
    bound: i64,
    op: CmpOp,
    fused: Option<(i64, FusedOp)>,
    lo: i64,
    hi: i64,
) -> BoundsPlan {
    let primary = cover(bound, op, lo, hi);

    match fused {
        None => match primary {
            Cover::Nothing => BoundsPlan::NoRows,
            Cover::All => BoundsPlan::AllRows,
            Cover::Partial => BoundsPlan::Eval {
                bound,
                op,
                fused: None,
            },
        },
        Some((f, fop)) => {
            let secondary = cover(f, fop.as_cmp(), lo, hi);
            match (primary, secondary) {
                (Cover::Nothing, _) | (_, Cover::Nothing) => BoundsPlan::NoRows,
                (Cover::All, Cover::All) => BoundsPlan::AllRows,
                (Cover::All, Cover::Partial) => BoundsPlan::Eval {
                    bound: f,
                    op: fop.as_cmp(),
                    fused: None,
                },
                (Cover::Partial, Cover::All) => BoundsPlan::Eval {
                    bound,
                    op,
                    fused: None,
                },
                (Cover::Partial, Cover::Partial) => BoundsPlan::Eval {
                    bound,
                    op,
                    fused: Some((f, fop)),
                },
            }
        }
    }
}

/// Binary search with an operator-aware miss result.
///
/// On a hit the exact index comes back. On a miss the result is the
/// "virtual" index at which comparisons over dictionary indices reproduce
/// comparisons over the values themselves: for `<`/`>=` the first entry not
/// below the probe, for `<=`/`>` the last entry not above it, and `-1` for
/// `=`/`!=`.
fn dict_index(dict: &DictValues, value: &FilterValue, op: CmpOp) -> Result<i64> {
    let len = dict.len();
    let order: Box<dyn Fn(usize) -> Ordering> = match (dict, value) {
        (DictValues::Str(entries), FilterValue::Str(probe)) => {
            Box::new(move |idx| entries[idx].as_str().cmp(probe.as_str()))
        }
        (DictValues::Int32(entries), FilterValue::Int(probe)) => {
            Box::new(move |idx| i64::from(entries[idx]).cmp(probe))
        }
        (DictValues::Int64(entries), FilterValue::Int(probe)) => {
            Box::new(move |idx| entries[idx].cmp(probe))
        }
        _ => {
            return Err(EngineError::invalid(
                "filter value type does not match the dictionary",
            ));
        }
    };

    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let (mut lo, mut hi) = (0usize, len);
            while lo < hi {
                let mid = (lo + hi) / 2;
                match order(mid) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid,
                    Ordering::Equal => return Ok(mid as i64),
                }
            }
            Ok(-1)
        }
        CmpOp::Lt | CmpOp::Ge => {
            // First index whose entry is >= the probe.
            let (mut lo, mut hi) = (0usize, len);
            while lo < hi {
                let mid = (lo + hi) / 2;
                if order(mid) == Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            Ok(lo as i64)
        }
        CmpOp::Le | CmpOp::Gt => {
            // One past the last index whose entry is <= the probe.
            let (mut lo, mut hi) = (0usize, len);
            while lo < hi {
                let mid = (lo + hi) / 2;
                if order(mid) == Ordering::Greater {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Ok(lo as i64 - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_dict(entries: &[&str]) -> DictValues {
        DictValues::Str(entries.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn dict_index_hits_are_exact() {
        let dict = str_dict(&["AIR", "MAIL", "SHIP"]);
        for op in [CmpOp::Eq, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge] {
            let idx = dict_index(&dict, &FilterValue::Str("MAIL".into()), op).unwrap();
            assert_eq!(idx, 1, "op {op:?}");
        }
    }

    #[test]
    fn dict_index_misses_follow_operator_tie_breaks() {
        let dict = str_dict(&["AIR", "MAIL", "SHIP"]);
        let probe = FilterValue::Str("FOB".into());

        assert_eq!(dict_index(&dict, &probe, CmpOp::Eq).unwrap(), -1);
        // Entries below FOB sit strictly before index 1.
        assert_eq!(dict_index(&dict, &probe, CmpOp::Lt).unwrap(), 1);
        assert_eq!(dict_index(&dict, &probe, CmpOp::Ge).unwrap(), 1);
        // Entries at or below FOB end at index 0.
        assert_eq!(dict_index(&dict, &probe, CmpOp::Le).unwrap(), 0);
        assert_eq!(dict_index(&dict, &probe, CmpOp::Gt).unwrap(), 0);

        let below_all = FilterValue::Str("A".into());
        assert_eq!(dict_index(&dict, &below_all, CmpOp::Lt).unwrap(), 0);
        assert_eq!(dict_index(&dict, &below_all, CmpOp::Le).unwrap(), -1);

        let above_all = FilterValue::Str("ZZZ".into());
        assert_eq!(dict_index(&dict, &above_all, CmpOp::Lt).unwrap(), 3);
        assert_eq!(dict_index(&dict, &above_all, CmpOp::Gt).unwrap(), 2);
    }

    #[test]
    fn bounds_reduce_to_skip_decisions() {
        // Equality outside the range never scans.
        assert!(matches!(
            reduce_bounds(5, CmpOp::Eq, None, 10, 20),
            BoundsPlan::NoRows
        ));
        // Inequality outside the range matches everything.
        assert!(matches!(
            reduce_bounds(5, CmpOp::Ne, None, 10, 20),
            BoundsPlan::AllRows
        ));
        assert!(matches!(
            reduce_bounds(25, CmpOp::Lt, None, 10, 20),
            BoundsPlan::AllRows
        ));
        assert!(matches!(
            reduce_bounds(5, CmpOp::Gt, None, 10, 20),
            BoundsPlan::AllRows
        ));
        assert!(matches!(
            reduce_bounds(15, CmpOp::Gt, None, 10, 20),
            BoundsPlan::Eval { .. }
        ));
    }

    #[test]
    fn empty_ranges_never_scan() {
        // a >= b with both bounds inside the range still evaluates, but a
        // range that sits entirely below or above the column skips.
        assert!(matches!(
            reduce_bounds(25, CmpOp::Gt, Some((30, FusedOp::Lt)), 10, 20),
            BoundsPlan::NoRows
        ));
        assert!(matches!(
            reduce_bounds(2, CmpOp::Gt, Some((5, FusedOp::Lt)), 10, 20),
            BoundsPlan::NoRows
        ));
    }

    #[test]
    fn range_with_low_start_reduces_to_upper_bound_only() {
        match reduce_bounds(2, CmpOp::Gt, Some((15, FusedOp::Le)), 10, 20) {
            BoundsPlan::Eval { bound, op, fused } => {
                assert_eq!(bound, 15);
                assert_eq!(op, CmpOp::Le);
                assert!(fused.is_none());
            }
            _ => panic!("expected an upper-bound-only evaluation"),
        }
    }

    #[test]
    fn range_spanning_whole_column_matches_everything() {
        assert!(matches!(
            reduce_bounds(2, CmpOp::Gt, Some((30, FusedOp::Lt)), 10, 20),
            BoundsPlan::AllRows
        ));
    }
}
