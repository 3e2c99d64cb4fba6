use crate::error::{EngineError, Result};
use chrono::{Datelike, NaiveDate};
use std::cmp::Ordering;

/// Days from 0001-01-01 (chrono's day 1) to the Unix epoch.
const EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Logical column types supported by the engine.
///
/// Integer-backed types (everything except `String`) parse into an `i64`
/// carrying the underlying representation: Int32/Int64 the value itself,
/// Decimal the scaled integer, Date the signed day count since the Unix
/// epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Int32,
    Int64,
    Decimal { scale: u32 },
    Date,
}

impl ColumnType {
    /// On-disk type code used by the table metadata stream.
    pub fn type_num(&self) -> i32 {
        match self {
            ColumnType::String => 0,
            ColumnType::Int32 => 1,
            ColumnType::Int64 => 2,
            ColumnType::Decimal { .. } => 3,
            ColumnType::Date => 4,
        }
    }

    pub fn from_type_num(num: i32, scale: Option<u32>) -> Result<ColumnType> {
        match num {
            0 => Ok(ColumnType::String),
            1 => Ok(ColumnType::Int32),
            2 => Ok(ColumnType::Int64),
            3 => {
                let scale = scale
                    .ok_or_else(|| EngineError::invalid("decimal type requires a scale"))?;
                Ok(ColumnType::Decimal { scale })
            }
            4 => Ok(ColumnType::Date),
            other => Err(EngineError::invalid(format!("unknown type number: {other}"))),
        }
    }

    /// Width in bytes of the underlying integer representation.
    /// `String` has no fixed-width representation.
    pub fn value_width(&self) -> usize {
        match self {
            ColumnType::String => 0,
            ColumnType::Int32 | ColumnType::Date => 4,
            ColumnType::Int64 | ColumnType::Decimal { .. } => 8,
        }
    }

    /// Parses a literal into the integer representation.
    pub fn parse_integer(&self, text: &str) -> Result<i64> {
        match self {
            ColumnType::String => Err(EngineError::parse(
                "string values have no integer representation",
            )),
            ColumnType::Int32 => text
                .parse::<i32>()
                .map(i64::from)
                .map_err(|_| EngineError::parse(format!("invalid int32 literal: {text}"))),
            ColumnType::Int64 => text
                .parse::<i64>()
                .map_err(|_| EngineError::parse(format!("invalid int64 literal: {text}"))),
            ColumnType::Decimal { scale } => parse_decimal(*scale, text),
            ColumnType::Date => parse_date(text).map(i64::from),
        }
    }

    /// Checks that a literal is parseable with this type.
    pub fn validate_literal(&self, text: &str) -> Result<()> {
        match self {
            ColumnType::String => Ok(()),
            _ => self.parse_integer(text).map(|_| ()),
        }
    }

    /// Formats an integer representation back into its text form.
    /// Round-trips `parse_integer` for every value it produces.
    pub fn format_integer(&self, value: i64) -> String {
        match self {
            ColumnType::String => value.to_string(),
            ColumnType::Int32 | ColumnType::Int64 => value.to_string(),
            ColumnType::Decimal { scale } => format_decimal(*scale, value),
            ColumnType::Date => format_date(value),
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            ColumnType::String => "String".into(),
            ColumnType::Int32 => "Int32".into(),
            ColumnType::Int64 => "Int64".into(),
            ColumnType::Decimal { scale } => format!("Decimal({scale})"),
            ColumnType::Date => "Date".into(),
        }
    }
}

/// Parses `d+[.d+]` into the scaled integer representation: the fractional
/// part is truncated or zero-padded to `scale` digits and concatenated with
/// the whole part.
pub fn parse_decimal(scale: u32, text: &str) -> Result<i64> {
    let err = || EngineError::parse(format!("invalid decimal literal: {text}"));

    let (whole_str, frac_str) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };

    if whole_str.is_empty() || !whole_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    if !frac_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }

    let mut frac = String::from(&frac_str[..frac_str.len().min(scale as usize)]);
    while frac.len() < scale as usize {
        frac.push('0');
    }

    let whole: i64 = whole_str.parse().map_err(|_| err())?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| err())?
    };

    Ok(whole * 10i64.pow(scale) + frac)
}

pub fn format_decimal(scale: u32, value: i64) -> String {
    if scale == 0 {
        return value.to_string();
    }
    let base = 10i64.pow(scale);
    let whole = value / base;
    let frac = (value % base).abs();
    let sign = if value < 0 && whole == 0 { "-" } else { "" };
    format!("{sign}{whole}.{frac:0width$}", width = scale as usize)
}

/// Parses `YYYY-MM-DD` into the signed day count since the Unix epoch.
/// The mapping is calendar-based and independent of the host timezone.
pub fn parse_date(text: &str) -> Result<i32> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| EngineError::parse(format!("invalid date literal: {text}")))?;
    Ok((i64::from(date.num_days_from_ce()) - EPOCH_DAYS_FROM_CE) as i32)
}

pub fn format_date(days: i64) -> String {
    let ce_days = days + EPOCH_DAYS_FROM_CE;
    match i32::try_from(ce_days)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
    {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => days.to_string(),
    }
}

/// A typed group-key value. Keys compare by the column's typed order, not
/// by their formatted text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScalarValue {
    Int(i64),
    Str(String),
}

impl ScalarValue {
    pub fn format(&self, ty: &ColumnType) -> String {
        match self {
            ScalarValue::Int(v) => ty.format_integer(*v),
            ScalarValue::Str(s) => s.clone(),
        }
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a.cmp(b),
            (ScalarValue::Str(a), ScalarValue::Str(b)) => a.cmp(b),
            (ScalarValue::Int(_), ScalarValue::Str(_)) => Ordering::Less,
            (ScalarValue::Str(_), ScalarValue::Int(_)) => Ordering::Greater,
        }
    }
}
