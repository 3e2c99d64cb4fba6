//! Plan nodes with a partition-scoped execution contract. A partition is
//! one row group; scan, filter, and aggregate all agree on the table's
//! row-group count.

use super::filter::RowFilter;
use crate::bitmap::Bitmap;
use crate::column_data::ColumnData;
use crate::error::{EngineError, Result};
use crate::table::{ColumnDesc, Table};

/// A borrowed, read-only view of selected columns of one row group, plus
/// the selection bitmap a filter node attaches.
pub struct RowGroupRef<'a> {
    pub columns: Vec<&'a ColumnData>,
    pub size: usize,
    pub selection: Option<Bitmap>,
}

/// Projects a subset of a table's columns, one partition per row group.
pub struct ScanNode<'a> {
    table: &'a Table,
    column_indexes: Vec<usize>,
    schema: Vec<ColumnDesc>,
}

impl<'a> ScanNode<'a> {
    /// `column_indexes` are positions in the table schema; the scanned row
    /// groups expose them in the given order.
    pub fn new(table: &'a Table, column_indexes: Vec<usize>) -> Result<Self> {
        let mut schema = Vec::with_capacity(column_indexes.len());
        for &idx in &column_indexes {
            let desc = table
                .schema()
                .get(idx)
                .ok_or_else(|| EngineError::invalid(format!("column index {idx} out of range")))?;
            schema.push(desc.clone());
        }
        Ok(Self {
            table,
            column_indexes,
            schema,
        })
    }

    pub fn schema(&self) -> &[ColumnDesc] {
        &self.schema
    }

    pub fn partition_count(&self) -> usize {
        self.table.row_group_count()
    }

    pub fn execute(&self, partition: usize) -> RowGroupRef<'a> {
        let group = self.table.row_group(partition);
        let columns = self
            .column_indexes
            .iter()
            .map(|&idx| &group.columns[idx])
            .collect();
        RowGroupRef {
            columns,
            size: group.size,
            selection: None,
        }
    }
}

/// Wraps a scan with a composite filter; each executed partition carries a
/// freshly evaluated selection bitmap. With no filter clauses the child's
/// output passes through untouched.
pub struct FilterNode<'a> {
    child: ScanNode<'a>,
    filter: Option<Box<dyn RowFilter>>,
}

impl<'a> FilterNode<'a> {
    pub fn new(child: ScanNode<'a>, filter: Option<Box<dyn RowFilter>>) -> Self {
        Self { child, filter }
    }

    pub fn schema(&self) -> &[ColumnDesc] {
        self.child.schema()
    }

    pub fn partition_count(&self) -> usize {
        self.child.partition_count()
    }

    pub fn execute(&self, partition: usize) -> Result<RowGroupRef<'a>> {
        let mut group = self.child.execute(partition);
        if let Some(filter) = &self.filter {
            let mut bitmap = Bitmap::new(group.size);
            filter.execute_set(&group, &mut bitmap)?;
            group.selection = Some(bitmap);
        }
        Ok(group)
    }

    /// Match count for one partition without materializing a bitmap.
    pub fn execute_count(&self, partition: usize) -> Result<usize> {
        let group = self.child.execute(partition);
        match &self.filter {
            Some(filter) => filter.execute_count(&group),
            None => Ok(group.size),
        }
    }
}
