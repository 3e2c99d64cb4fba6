use crate::error::{EngineError, Result};
use crate::types::{ColumnType, ScalarValue};
use std::alloc::{self, Layout};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::io::{Read, Write};
use std::ptr::NonNull;

/// Rows per row group. Fixed so that dictionary index widths (1 byte under
/// 256 distinct values, 2 bytes otherwise) can always address a full group.
pub const ROW_GROUP_SIZE: usize = 1 << 16;

const DICT_TAG: u8 = 0;
const RAW_TAG: u8 = 1;

/// Buffer alignment. Wide enough for a 512-bit load of any lane width.
const BUFFER_ALIGN: usize = 64;

/// Physical layout of a column's values within a row group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnLayout {
    Dict,
    Raw,
}

/// The default layout for a type. Strings and dates go through the sorted
/// dictionary so their rows carry small integer codes; the integer types
/// store raw values at the narrowest width covering their range.
pub fn default_layout(ty: &ColumnType) -> ColumnLayout {
    match ty {
        ColumnType::String | ColumnType::Date => ColumnLayout::Dict,
        ColumnType::Int32 | ColumnType::Int64 | ColumnType::Decimal { .. } => ColumnLayout::Raw,
    }
}

/// Heap buffer aligned to 64 bytes.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self {
                // Aligned for every lane width the engine casts to.
                ptr: NonNull::<u64>::dangling().cast(),
                len: 0,
            };
        }
        let layout = Layout::from_size_align(len, BUFFER_ALIGN).expect("aligned buffer layout");
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Reinterprets the buffer as a slice of fixed-width lanes.
    /// The buffer length must be a multiple of the lane width.
    pub fn lanes<T: Copy>(&self) -> &[T] {
        let width = std::mem::size_of::<T>();
        debug_assert!(std::mem::align_of::<T>() <= BUFFER_ALIGN);
        assert_eq!(self.len % width, 0, "buffer length not a lane multiple");
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, self.len / width)
        }
    }

    pub fn lanes_mut<T: Copy>(&mut self) -> &mut [T] {
        let width = std::mem::size_of::<T>();
        debug_assert!(std::mem::align_of::<T>() <= BUFFER_ALIGN);
        assert_eq!(self.len % width, 0, "buffer length not a lane multiple");
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, self.len / width)
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let layout = Layout::from_size_align(self.len, BUFFER_ALIGN).expect("aligned buffer layout");
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl Clone for AlignedBuf {
    fn clone(&self) -> Self {
        Self::from_bytes(self.as_slice())
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// Raw-encoded column chunk: values stored at the narrowest signed width
/// that covers the observed `[min_value, max_value]` range.
#[derive(Clone, Debug, PartialEq)]
pub struct RawColumnData {
    pub size: usize,
    pub bytes_per_value: usize,
    pub min_value: i64,
    pub max_value: i64,
    pub values: AlignedBuf,
}

impl RawColumnData {
    /// Builds one chunk (at most `ROW_GROUP_SIZE` values).
    pub fn build(chunk: &[i64]) -> Self {
        debug_assert!(chunk.len() <= ROW_GROUP_SIZE);
        let mut min_value = chunk.first().copied().unwrap_or(0);
        let mut max_value = min_value;
        for &v in chunk {
            min_value = min_value.min(v);
            max_value = max_value.max(v);
        }

        let bytes_per_value = storage_width(min_value, max_value);
        let mut values = AlignedBuf::zeroed(chunk.len() * bytes_per_value);
        match bytes_per_value {
            1 => fill_lanes::<i8>(&mut values, chunk),
            2 => fill_lanes::<i16>(&mut values, chunk),
            4 => fill_lanes::<i32>(&mut values, chunk),
            _ => fill_lanes::<i64>(&mut values, chunk),
        }

        Self {
            size: chunk.len(),
            bytes_per_value,
            min_value,
            max_value,
            values,
        }
    }

    /// Sign-extended value at a row. Row-at-a-time access is for tests and
    /// formatting only; kernels go through `values.lanes`.
    pub fn value_at(&self, row: usize) -> i64 {
        match self.bytes_per_value {
            1 => i64::from(self.values.lanes::<i8>()[row]),
            2 => i64::from(self.values.lanes::<i16>()[row]),
            4 => i64::from(self.values.lanes::<i32>()[row]),
            _ => self.values.lanes::<i64>()[row],
        }
    }

    fn save(&self, ty: &ColumnType, out: &mut dyn Write) -> Result<()> {
        write_i32(out, self.size as i32)?;
        write_i32(out, self.bytes_per_value as i32)?;
        match ty.value_width() {
            4 => {
                write_i32(out, self.min_value as i32)?;
                write_i32(out, self.max_value as i32)?;
            }
            8 => {
                write_i64(out, self.min_value)?;
                write_i64(out, self.max_value)?;
            }
            _ => {
                return Err(EngineError::invalid(format!(
                    "invalid type for raw column data: {}",
                    ty.to_display_string()
                )));
            }
        }
        out.write_all(self.values.as_slice())?;
        Ok(())
    }

    fn load(ty: &ColumnType, input: &mut dyn Read) -> Result<Self> {
        let size = read_i32(input)? as usize;
        let bytes_per_value = read_i32(input)? as usize;
        if !matches!(bytes_per_value, 1 | 2 | 4 | 8) {
            return Err(EngineError::invalid(format!(
                "invalid raw value width: {bytes_per_value}"
            )));
        }
        let (min_value, max_value) = match ty.value_width() {
            4 => (i64::from(read_i32(input)?), i64::from(read_i32(input)?)),
            8 => (read_i64(input)?, read_i64(input)?),
            _ => {
                return Err(EngineError::invalid(format!(
                    "invalid type for raw column data: {}",
                    ty.to_display_string()
                )));
            }
        };
        let mut values = AlignedBuf::zeroed(size * bytes_per_value);
        input.read_exact(values.as_mut_slice())?;
        Ok(Self {
            size,
            bytes_per_value,
            min_value,
            max_value,
            values,
        })
    }
}

/// The smallest signed width, in bytes, holding both bounds.
fn storage_width(min_value: i64, max_value: i64) -> usize {
    if min_value >= i64::from(i8::MIN) && max_value <= i64::from(i8::MAX) {
        1
    } else if min_value >= i64::from(i16::MIN) && max_value <= i64::from(i16::MAX) {
        2
    } else if min_value >= i64::from(i32::MIN) && max_value <= i64::from(i32::MAX) {
        4
    } else {
        8
    }
}

fn fill_lanes<T: Copy + TryFrom<i64>>(buf: &mut AlignedBuf, chunk: &[i64]) {
    let lanes = buf.lanes_mut::<T>();
    for (lane, &v) in lanes.iter_mut().zip(chunk) {
        // The width was chosen to cover [min, max], so this cannot fail.
        match T::try_from(v) {
            Ok(narrowed) => *lane = narrowed,
            Err(_) => unreachable!("value outside chosen storage width"),
        }
    }
}

/// Typed payload of a dictionary. Dates store their day counts, so every
/// non-string dictionary is an integer vector.
#[derive(Clone, Debug, PartialEq)]
pub enum DictValues {
    Str(Vec<String>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
}

impl DictValues {
    pub fn len(&self) -> usize {
        match self {
            DictValues::Str(v) => v.len(),
            DictValues::Int32(v) => v.len(),
            DictValues::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_at(&self, idx: usize) -> ScalarValue {
        match self {
            DictValues::Str(v) => ScalarValue::Str(v[idx].clone()),
            DictValues::Int32(v) => ScalarValue::Int(i64::from(v[idx])),
            DictValues::Int64(v) => ScalarValue::Int(v[idx]),
        }
    }
}

/// Dictionary-encoded column chunk: a sorted deduplicated value vector plus
/// per-row indices at 1 or 2 bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct DictColumnData {
    pub size: usize,
    pub dict: DictValues,
    pub values: AlignedBuf,
}

impl DictColumnData {
    pub fn build_strings(chunk: &[String]) -> Self {
        let (dict, values) = build_dict(chunk);
        Self {
            size: chunk.len(),
            dict: DictValues::Str(dict),
            values,
        }
    }

    pub fn build_i32(chunk: &[i32]) -> Self {
        let (dict, values) = build_dict(chunk);
        Self {
            size: chunk.len(),
            dict: DictValues::Int32(dict),
            values,
        }
    }

    pub fn build_i64(chunk: &[i64]) -> Self {
        let (dict, values) = build_dict(chunk);
        Self {
            size: chunk.len(),
            dict: DictValues::Int64(dict),
            values,
        }
    }

    /// 1 byte while the dictionary stays under 256 entries, 2 bytes after.
    pub fn index_width(&self) -> usize {
        if self.dict.len() < 256 { 1 } else { 2 }
    }

    pub fn index_at(&self, row: usize) -> usize {
        match self.index_width() {
            1 => self.values.lanes::<u8>()[row] as usize,
            _ => self.values.lanes::<u16>()[row] as usize,
        }
    }

    /// Copies the per-row indices into a uniform 16-bit vector. Group-by
    /// uses these directly as group IDs.
    pub fn widened_ids(&self) -> Vec<u16> {
        match self.index_width() {
            1 => self.values.lanes::<u8>().iter().map(|&v| u16::from(v)).collect(),
            _ => self.values.lanes::<u16>().to_vec(),
        }
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_i32(out, self.dict.len() as i32)?;
        match &self.dict {
            DictValues::Str(values) => {
                for value in values {
                    write_i32(out, value.len() as i32)?;
                    out.write_all(value.as_bytes())?;
                }
            }
            DictValues::Int32(values) => {
                for &value in values {
                    write_i32(out, value)?;
                }
            }
            DictValues::Int64(values) => {
                for &value in values {
                    write_i64(out, value)?;
                }
            }
        }
        write_i32(out, self.size as i32)?;
        out.write_all(self.values.as_slice())?;
        Ok(())
    }

    fn load(ty: &ColumnType, input: &mut dyn Read) -> Result<Self> {
        let dict_len = read_i32(input)? as usize;
        let dict = match ty {
            ColumnType::String => {
                let mut values = Vec::with_capacity(dict_len);
                for _ in 0..dict_len {
                    let len = read_i32(input)? as usize;
                    let mut bytes = vec![0u8; len];
                    input.read_exact(&mut bytes)?;
                    let value = String::from_utf8(bytes).map_err(|_| {
                        EngineError::invalid("dictionary entry is not valid utf-8")
                    })?;
                    values.push(value);
                }
                DictValues::Str(values)
            }
            ColumnType::Int32 | ColumnType::Date => {
                let mut values = Vec::with_capacity(dict_len);
                for _ in 0..dict_len {
                    values.push(read_i32(input)?);
                }
                DictValues::Int32(values)
            }
            ColumnType::Int64 | ColumnType::Decimal { .. } => {
                let mut values = Vec::with_capacity(dict_len);
                for _ in 0..dict_len {
                    values.push(read_i64(input)?);
                }
                DictValues::Int64(values)
            }
        };

        let size = read_i32(input)? as usize;
        let index_width = if dict_len < 256 { 1 } else { 2 };
        let mut values = AlignedBuf::zeroed(size * index_width);
        input.read_exact(values.as_mut_slice())?;

        Ok(Self { size, dict, values })
    }
}

fn build_dict<T: Ord + Eq + Hash + Clone>(chunk: &[T]) -> (Vec<T>, AlignedBuf) {
    let distinct: BTreeSet<T> = chunk.iter().cloned().collect();
    let dict: Vec<T> = distinct.into_iter().collect();
    let index_of: HashMap<&T, usize> = dict.iter().enumerate().map(|(i, v)| (v, i)).collect();

    let index_width = if dict.len() < 256 { 1 } else { 2 };
    let mut values = AlignedBuf::zeroed(chunk.len() * index_width);
    if index_width == 1 {
        let lanes = values.lanes_mut::<u8>();
        for (lane, value) in lanes.iter_mut().zip(chunk) {
            *lane = index_of[value] as u8;
        }
    } else {
        let lanes = values.lanes_mut::<u16>();
        for (lane, value) in lanes.iter_mut().zip(chunk) {
            *lane = index_of[value] as u16;
        }
    }

    (dict, values)
}

/// One column of one row group, in either layout.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Dict(DictColumnData),
    Raw(RawColumnData),
}

impl ColumnData {
    pub fn size(&self) -> usize {
        match self {
            ColumnData::Dict(data) => data.size,
            ColumnData::Raw(data) => data.size,
        }
    }

    pub fn layout(&self) -> ColumnLayout {
        match self {
            ColumnData::Dict(_) => ColumnLayout::Dict,
            ColumnData::Raw(_) => ColumnLayout::Raw,
        }
    }

    pub fn as_raw(&self) -> Option<&RawColumnData> {
        match self {
            ColumnData::Raw(data) => Some(data),
            ColumnData::Dict(_) => None,
        }
    }

    pub fn as_dict(&self) -> Option<&DictColumnData> {
        match self {
            ColumnData::Dict(data) => Some(data),
            ColumnData::Raw(_) => None,
        }
    }

    pub fn save(&self, ty: &ColumnType, out: &mut dyn Write) -> Result<()> {
        match self {
            ColumnData::Dict(data) => {
                out.write_all(&[DICT_TAG])?;
                data.save(out)
            }
            ColumnData::Raw(data) => {
                out.write_all(&[RAW_TAG])?;
                data.save(ty, out)
            }
        }
    }

    pub fn load(ty: &ColumnType, input: &mut dyn Read) -> Result<ColumnData> {
        let mut tag = [0u8; 1];
        input.read_exact(&mut tag)?;
        match tag[0] {
            DICT_TAG => Ok(ColumnData::Dict(DictColumnData::load(ty, input)?)),
            RAW_TAG => Ok(ColumnData::Raw(RawColumnData::load(ty, input)?)),
            other => Err(EngineError::invalid(format!(
                "unknown column data tag: {other}"
            ))),
        }
    }
}

fn write_i32(out: &mut dyn Write, value: i32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_i64(out: &mut dyn Write, value: i64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_i32(input: &mut dyn Read) -> Result<i32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_i64(input: &mut dyn Read) -> Result<i64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_build_picks_narrowest_width() {
        assert_eq!(RawColumnData::build(&[0, 1, 127]).bytes_per_value, 1);
        assert_eq!(RawColumnData::build(&[-128, 127]).bytes_per_value, 1);
        assert_eq!(RawColumnData::build(&[0, 128]).bytes_per_value, 2);
        assert_eq!(RawColumnData::build(&[-129, 0]).bytes_per_value, 2);
        assert_eq!(RawColumnData::build(&[0, 40_000]).bytes_per_value, 4);
        assert_eq!(RawColumnData::build(&[0, 3_000_000_000]).bytes_per_value, 8);
    }

    #[test]
    fn raw_build_retains_min_max_and_values() {
        let data = RawColumnData::build(&[5, -3, 900, 12]);
        assert_eq!(data.min_value, -3);
        assert_eq!(data.max_value, 900);
        assert_eq!(data.bytes_per_value, 2);
        for (row, expected) in [5i64, -3, 900, 12].into_iter().enumerate() {
            assert_eq!(data.value_at(row), expected);
            assert!(data.min_value <= expected && expected <= data.max_value);
        }
    }

    #[test]
    fn dict_build_sorts_and_dedups() {
        let chunk: Vec<String> = ["MAIL", "AIR", "MAIL", "SHIP", "AIR"]
            .into_iter()
            .map(String::from)
            .collect();
        let data = DictColumnData::build_strings(&chunk);
        assert_eq!(
            data.dict,
            DictValues::Str(vec!["AIR".into(), "MAIL".into(), "SHIP".into()])
        );
        assert_eq!(data.index_width(), 1);
        assert_eq!(
            (0..data.size).map(|i| data.index_at(i)).collect::<Vec<_>>(),
            vec![1, 0, 1, 2, 0]
        );
        for row in 0..data.size {
            assert!(data.index_at(row) < data.dict.len());
        }
    }

    #[test]
    fn dict_index_width_grows_at_256_entries() {
        let chunk: Vec<i32> = (0..256).collect();
        let data = DictColumnData::build_i32(&chunk);
        assert_eq!(data.index_width(), 2);
        assert_eq!(data.widened_ids()[255], 255);

        let chunk: Vec<i32> = (0..255).collect();
        assert_eq!(DictColumnData::build_i32(&chunk).index_width(), 1);
    }

    #[test]
    fn raw_round_trip() {
        let ty = ColumnType::Int64;
        let data = ColumnData::Raw(RawColumnData::build(&[1, -70_000, 12, 70_000]));
        let mut bytes = Vec::new();
        data.save(&ty, &mut bytes).unwrap();
        let loaded = ColumnData::load(&ty, &mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn dict_round_trip_strings() {
        let ty = ColumnType::String;
        let chunk: Vec<String> = ["FOB", "AIR", "FOB"].into_iter().map(String::from).collect();
        let data = ColumnData::Dict(DictColumnData::build_strings(&chunk));
        let mut bytes = Vec::new();
        data.save(&ty, &mut bytes).unwrap();
        let loaded = ColumnData::load(&ty, &mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn dict_round_trip_dates() {
        let ty = ColumnType::Date;
        let data = ColumnData::Dict(DictColumnData::build_i32(&[9539, 9538, 9539]));
        let mut bytes = Vec::new();
        data.save(&ty, &mut bytes).unwrap();
        let loaded = ColumnData::load(&ty, &mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn dict_round_trip_int64() {
        let ty = ColumnType::Int64;
        let data = ColumnData::Dict(DictColumnData::build_i64(&[12, -4, 12, 900]));
        let mut bytes = Vec::new();
        data.save(&ty, &mut bytes).unwrap();
        let loaded = ColumnData::load(&ty, &mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = [7u8, 0, 0, 0, 0];
        let err = ColumnData::load(&ColumnType::Int32, &mut bytes.as_ref()).unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }

    #[test]
    fn string_raw_layout_is_rejected() {
        let data = RawColumnData::build(&[1, 2, 3]);
        let mut out = Vec::new();
        assert!(data.save(&ColumnType::String, &mut out).is_err());
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let ty = ColumnType::Int32;
        let data = ColumnData::Raw(RawColumnData::build(&[1, 2, 3]));
        let mut bytes = Vec::new();
        data.save(&ty, &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = ColumnData::load(&ty, &mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn aligned_buf_is_64_byte_aligned() {
        let buf = AlignedBuf::zeroed(128);
        assert_eq!(buf.as_slice().as_ptr() as usize % 64, 0);
        assert_eq!(buf.lanes::<i64>().len(), 16);
    }
}
