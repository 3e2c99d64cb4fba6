use crate::column_data::{
    default_layout, ColumnData, ColumnLayout, DictColumnData, RawColumnData, ROW_GROUP_SIZE,
};
use crate::error::{EngineError, Result};
use crate::types::ColumnType;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

/// One schema entry: column name, logical type, physical layout.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDesc {
    pub name: String,
    pub ty: ColumnType,
    pub layout: ColumnLayout,
}

/// A horizontal partition of the table, at most `ROW_GROUP_SIZE` rows.
/// Every column of a group holds the same number of rows.
#[derive(Debug, Default)]
pub struct RowGroup {
    pub columns: Vec<ColumnData>,
    pub size: usize,
}

/// Tables known to the query surface, keyed by lowercased name.
pub type TableRegistry = HashMap<String, Table>;

#[derive(Debug)]
pub struct Table {
    name: String,
    schema: Vec<ColumnDesc>,
    row_groups: Vec<RowGroup>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &[ColumnDesc] {
        &self.schema
    }

    pub fn row_group(&self, idx: usize) -> &RowGroup {
        &self.row_groups[idx]
    }

    pub fn row_groups(&self) -> &[RowGroup] {
        &self.row_groups
    }

    pub fn row_group_count(&self) -> usize {
        self.row_groups.len()
    }

    pub fn column_count(&self) -> usize {
        self.schema.len()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema
            .iter()
            .position(|desc| desc.name.eq_ignore_ascii_case(name))
    }

    /// Writes `<path>` (binary column data, column-major) and
    /// `<path>.metadata` (text descriptors with per-column offsets).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut data_out = BufWriter::new(File::create(path)?);
        let metadata_path = metadata_path_for(path);
        let mut metadata_out = BufWriter::new(File::create(&metadata_path)?);
        self.save_to(&mut metadata_out, &mut data_out)?;
        info!(table = %self.name, path = %path.display(), "saved table");
        Ok(())
    }

    pub fn save_to(
        &self,
        metadata_out: &mut dyn Write,
        data_out: &mut dyn Write,
    ) -> Result<()> {
        let mut writer = CountingWriter::new(data_out);
        let mut column_positions = Vec::with_capacity(self.schema.len());

        for (col_idx, desc) in self.schema.iter().enumerate() {
            column_positions.push(writer.position());
            for group in &self.row_groups {
                group.columns[col_idx].save(&desc.ty, &mut writer)?;
            }
        }

        writeln!(metadata_out, "{}", self.schema.len()).map_err(EngineError::from)?;
        for (col_idx, desc) in self.schema.iter().enumerate() {
            write!(
                metadata_out,
                "{} {} {} {}",
                column_positions[col_idx],
                self.row_groups.len(),
                desc.name,
                desc.ty.type_num()
            )?;
            if let ColumnType::Decimal { scale } = desc.ty {
                write!(metadata_out, " {scale}")?;
            }
            writeln!(metadata_out)?;
        }

        Ok(())
    }

    /// Loads a table, restricted to `fields` when given (case-insensitive).
    pub fn load(
        name: &str,
        path: impl AsRef<Path>,
        fields: Option<&[String]>,
    ) -> Result<Table> {
        let path = path.as_ref();
        let data_in = BufReader::new(File::open(path)?);
        let metadata_in = BufReader::new(File::open(metadata_path_for(path))?);
        let table = Self::load_from(name, metadata_in, data_in, fields)?;
        info!(
            table = %table.name,
            path = %path.display(),
            columns = table.column_count(),
            row_groups = table.row_group_count(),
            "loaded table"
        );
        Ok(table)
    }

    pub fn load_from<M, D>(
        name: &str,
        metadata_in: M,
        mut data_in: D,
        fields: Option<&[String]>,
    ) -> Result<Table>
    where
        M: BufRead,
        D: Read + Seek,
    {
        let fields_to_load: Option<HashSet<String>> = fields.map(|names| {
            names.iter().map(|field| field.to_lowercase()).collect()
        });

        let mut lines = metadata_in.lines();
        let num_cols: usize = next_metadata_line(&mut lines)?
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid("malformed metadata header"))?;

        struct PendingColumn {
            position: u64,
            group_count: usize,
            desc: ColumnDesc,
        }

        let mut pending = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            let line = next_metadata_line(&mut lines)?;
            let mut parts = line.split_whitespace();
            let position: u64 = parse_metadata_field(parts.next(), &line)?;
            let group_count: usize = parse_metadata_field(parts.next(), &line)?;
            let column_name = parts
                .next()
                .ok_or_else(|| EngineError::invalid(format!("malformed metadata line: {line}")))?
                .to_lowercase();
            let type_num: i32 = parse_metadata_field(parts.next(), &line)?;
            let scale = match parts.next() {
                Some(text) => Some(text.parse::<u32>().map_err(|_| {
                    EngineError::invalid(format!("malformed metadata line: {line}"))
                })?),
                None => None,
            };
            let ty = ColumnType::from_type_num(type_num, scale)?;
            let layout = default_layout(&ty);
            pending.push(PendingColumn {
                position,
                group_count,
                desc: ColumnDesc {
                    name: column_name,
                    ty,
                    layout,
                },
            });
        }

        let mut table = Table {
            name: name.to_lowercase(),
            schema: Vec::new(),
            row_groups: Vec::new(),
        };

        for column in pending {
            if let Some(wanted) = &fields_to_load {
                if !wanted.contains(&column.desc.name) {
                    continue;
                }
            }

            data_in.seek(SeekFrom::Start(column.position))?;
            while table.row_groups.len() < column.group_count {
                table.row_groups.push(RowGroup::default());
            }

            for group_idx in 0..column.group_count {
                let data = ColumnData::load(&column.desc.ty, &mut data_in)?;
                let group = &mut table.row_groups[group_idx];
                if group.columns.is_empty() {
                    group.size = data.size();
                } else if group.size != data.size() {
                    return Err(EngineError::invalid(format!(
                        "row group {group_idx} size mismatch for column {}",
                        column.desc.name
                    )));
                }
                group.columns.push(data);
            }

            table.schema.push(column.desc);
        }

        Ok(table)
    }
}

fn metadata_path_for(path: &Path) -> std::path::PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".metadata");
    os_string.into()
}

fn next_metadata_line(
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<String> {
    match lines.next() {
        Some(line) => Ok(line?),
        None => Err(EngineError::Io("unexpected end of metadata".into())),
    }
}

fn parse_metadata_field<T: std::str::FromStr>(field: Option<&str>, line: &str) -> Result<T> {
    field
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| EngineError::invalid(format!("malformed metadata line: {line}")))
}

/// Tracks the write position so column offsets land in the metadata stream.
struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    position: u64,
}

impl<'a> CountingWriter<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner, position: 0 }
    }

    fn position(&self) -> u64 {
        self.position
    }
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Assembles a table from in-memory typed column vectors, chunking each
/// column into row groups and applying the layout policy. This is the path
/// the import adapter feeds; tests use it directly.
pub struct TableBuilder {
    name: String,
    columns: Vec<(String, ColumnType, TypedColumn)>,
}

enum TypedColumn {
    Str(Vec<String>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TypedColumn {
    fn len(&self) -> usize {
        match self {
            TypedColumn::Str(v) => v.len(),
            TypedColumn::I32(v) => v.len(),
            TypedColumn::I64(v) => v.len(),
        }
    }
}

impl TableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            columns: Vec::new(),
        }
    }

    pub fn column_strings(mut self, name: &str, values: Vec<String>) -> Self {
        self.columns
            .push((name.to_string(), ColumnType::String, TypedColumn::Str(values)));
        self
    }

    /// Date values are signed day counts since the Unix epoch.
    pub fn column_dates(mut self, name: &str, values: Vec<i32>) -> Self {
        self.columns
            .push((name.to_string(), ColumnType::Date, TypedColumn::I32(values)));
        self
    }

    pub fn column_int32(mut self, name: &str, values: Vec<i32>) -> Self {
        self.columns
            .push((name.to_string(), ColumnType::Int32, TypedColumn::I32(values)));
        self
    }

    pub fn column_int64(mut self, name: &str, values: Vec<i64>) -> Self {
        self.columns
            .push((name.to_string(), ColumnType::Int64, TypedColumn::I64(values)));
        self
    }

    /// Decimal values are pre-scaled integers.
    pub fn column_decimal(mut self, name: &str, scale: u32, values: Vec<i64>) -> Self {
        self.columns.push((
            name.to_string(),
            ColumnType::Decimal { scale },
            TypedColumn::I64(values),
        ));
        self
    }

    pub fn build(self) -> Result<Table> {
        let row_count = match self.columns.first() {
            Some((_, _, values)) => values.len(),
            None => return Err(EngineError::invalid("table has no columns")),
        };
        for (name, _, values) in &self.columns {
            if values.len() != row_count {
                return Err(EngineError::invalid(format!(
                    "column {name} has {} rows, expected {row_count}",
                    values.len()
                )));
            }
        }

        let schema: Vec<ColumnDesc> = self
            .columns
            .iter()
            .map(|(name, ty, _)| ColumnDesc {
                name: name.clone(),
                ty: ty.clone(),
                layout: default_layout(ty),
            })
            .collect();

        let group_count = row_count.div_ceil(ROW_GROUP_SIZE).max(1);
        let mut row_groups = Vec::with_capacity(group_count);
        for group_idx in 0..group_count {
            let start = group_idx * ROW_GROUP_SIZE;
            let end = (start + ROW_GROUP_SIZE).min(row_count);
            let mut group = RowGroup {
                columns: Vec::with_capacity(self.columns.len()),
                size: end - start,
            };
            for (_, ty, values) in &self.columns {
                group.columns.push(build_chunk(ty, values, start, end));
            }
            debug_assert!(group.columns.iter().all(|c| c.size() == group.size));
            row_groups.push(group);
        }

        debug!(
            table = %self.name,
            rows = row_count,
            row_groups = row_groups.len(),
            "built table"
        );

        Ok(Table {
            name: self.name,
            schema,
            row_groups,
        })
    }
}

fn build_chunk(ty: &ColumnType, values: &TypedColumn, start: usize, end: usize) -> ColumnData {
    match (default_layout(ty), values) {
        (ColumnLayout::Dict, TypedColumn::Str(v)) => {
            ColumnData::Dict(DictColumnData::build_strings(&v[start..end]))
        }
        (ColumnLayout::Dict, TypedColumn::I32(v)) => {
            ColumnData::Dict(DictColumnData::build_i32(&v[start..end]))
        }
        (ColumnLayout::Dict, TypedColumn::I64(v)) => {
            ColumnData::Dict(DictColumnData::build_i64(&v[start..end]))
        }
        (ColumnLayout::Raw, TypedColumn::I32(v)) => {
            let widened: Vec<i64> = v[start..end].iter().map(|&x| i64::from(x)).collect();
            ColumnData::Raw(RawColumnData::build(&widened))
        }
        (ColumnLayout::Raw, TypedColumn::I64(v)) => {
            ColumnData::Raw(RawColumnData::build(&v[start..end]))
        }
        (ColumnLayout::Raw, TypedColumn::Str(_)) => {
            unreachable!("string columns always use the dictionary layout")
        }
    }
}
