// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Predicate pushdown.
//!
//! Filters are bound to their column's Arrow type when a scan is opened.
//! Afterwards the planner answers three questions, all of them pure:
//!
//! * can a chunk be skipped given its min/max/null statistics
//!   ([`FilterSet::should_skip`])
//! * can a single run of a run-encoded column be skipped
//!   ([`FilterSet::skip_run`])
//! * which rows of a decoded chunk match ([`FilterSet::evaluate`])
//!
//! Statistics and row evaluation share Arrow's ordering, in which NaN is
//! greater than every other float, so a skipped chunk never holds a row that
//! evaluation would have accepted.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use arrow_arith::boolean::{and, is_not_null, is_null};
use arrow_array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, Scalar, StringArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow_buffer::BooleanBufferBuilder;
use arrow_ord::cmp;
use arrow_ord::ord::make_comparator;
use arrow_schema::{DataType, Schema, SortOptions};
use snafu::location;

use h5db_core::{Error, Result};
use h5db_encoding::{ChunkStatistics, RunSequenceEncoding};

/// A single literal value in a filter.
#[derive(Debug, Clone)]
pub struct Literal(ArrayRef);

impl Literal {
    /// Wrap a single-element array.
    pub fn try_new(value: ArrayRef) -> Result<Self> {
        if value.len() != 1 {
            return Err(Error::invalid_input(
                format!("a literal must hold one value, got {}", value.len()),
                location!(),
            ));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> &ArrayRef {
        &self.0
    }
}

macro_rules! literal_from {
    ($($native:ty => $array:ty),* $(,)?) => {
        $(
            impl From<$native> for Literal {
                fn from(value: $native) -> Self {
                    Self(Arc::new(<$array>::from(vec![value])))
                }
            }
        )*
    };
}

literal_from!(
    i8 => Int8Array,
    i16 => Int16Array,
    i32 => Int32Array,
    i64 => Int64Array,
    u8 => UInt8Array,
    u16 => UInt16Array,
    u32 => UInt32Array,
    u64 => UInt64Array,
    f32 => Float32Array,
    f64 => Float64Array,
    &str => StringArray,
    String => StringArray,
);

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Literal),
    NotEq(Literal),
    Lt(Literal),
    LtEq(Literal),
    Gt(Literal),
    GtEq(Literal),
    /// Inclusive on both ends.
    Between {
        low: Literal,
        high: Literal,
    },
    IsNull,
    IsNotNull,
}

/// A predicate over one column.
///
/// A scan keeps the rows that satisfy every filter it was given.
#[derive(Debug, Clone)]
pub struct ColumnFilter {
    pub column: String,
    pub predicate: Predicate,
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            column: column.into(),
            predicate,
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::Eq(value.into()))
    }

    pub fn not_eq(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::NotEq(value.into()))
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::Lt(value.into()))
    }

    pub fn lt_eq(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::LtEq(value.into()))
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::Gt(value.into()))
    }

    pub fn gt_eq(column: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::new(column, Predicate::GtEq(value.into()))
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Literal>,
        high: impl Into<Literal>,
    ) -> Self {
        Self::new(
            column,
            Predicate::Between {
                low: low.into(),
                high: high.into(),
            },
        )
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, Predicate::IsNull)
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, Predicate::IsNotNull)
    }
}

/// What the statistics of a chunk say about a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// No row can match.
    Skip,
    /// Every row matches.
    All,
    /// Rows have to be evaluated.
    Partial,
}

impl ChunkVerdict {
    /// Verdict of two filters that must both hold.
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Skip, _) | (_, Self::Skip) => Self::Skip,
            (Self::All, Self::All) => Self::All,
            _ => Self::Partial,
        }
    }

    /// Verdict of a row range made of two parts.
    pub fn union(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone)]
enum BoundPredicate {
    Compare(Comparison, ArrayRef),
    Between(ArrayRef, ArrayRef),
    IsNull,
    IsNotNull,
}

/// A filter whose literals have been coerced to the column type.
#[derive(Debug, Clone)]
pub struct BoundFilter {
    column: String,
    predicate: BoundPredicate,
}

/// Coerce `literal` to `data_type`, rejecting conversions that lose
/// information.
fn coerce(column: &str, literal: &Literal, data_type: &DataType) -> Result<ArrayRef> {
    let value = literal.value();
    if value.data_type() == data_type {
        return Ok(value.clone());
    }
    let lossy = || {
        Error::invalid_input(
            format!(
                "literal of type {} cannot be compared with column {} of type {}",
                value.data_type(),
                column,
                data_type
            ),
            location!(),
        )
    };
    let cast = arrow_cast::cast(value.as_ref(), data_type).map_err(|_| lossy())?;
    if cast.is_null(0) && value.is_valid(0) {
        return Err(lossy());
    }
    let back = arrow_cast::cast(cast.as_ref(), value.data_type()).map_err(|_| lossy())?;
    if !cmp::not_distinct(&back, value)?.value(0) {
        return Err(lossy());
    }
    Ok(cast)
}

/// Orders the first values of two single-element arrays.
fn compare(left: &ArrayRef, right: &ArrayRef) -> Result<Ordering> {
    let comparator = make_comparator(left.as_ref(), right.as_ref(), SortOptions::default())?;
    Ok(comparator(0, 0))
}

impl BoundFilter {
    pub fn bind(filter: &ColumnFilter, data_type: &DataType) -> Result<Self> {
        if matches!(
            data_type,
            DataType::FixedSizeList(..) | DataType::List(..) | DataType::LargeList(..)
        ) {
            return Err(Error::invalid_input(
                format!(
                    "cannot filter on column {} of nested type {}",
                    filter.column, data_type
                ),
                location!(),
            ));
        }
        let bind = |literal: &Literal| coerce(&filter.column, literal, data_type);
        let comparison = |op, literal: &Literal| -> Result<BoundPredicate> {
            Ok(BoundPredicate::Compare(op, bind(literal)?))
        };
        let predicate = match &filter.predicate {
            Predicate::Eq(v) => comparison(Comparison::Eq, v)?,
            Predicate::NotEq(v) => comparison(Comparison::NotEq, v)?,
            Predicate::Lt(v) => comparison(Comparison::Lt, v)?,
            Predicate::LtEq(v) => comparison(Comparison::LtEq, v)?,
            Predicate::Gt(v) => comparison(Comparison::Gt, v)?,
            Predicate::GtEq(v) => comparison(Comparison::GtEq, v)?,
            Predicate::Between { low, high } => BoundPredicate::Between(bind(low)?, bind(high)?),
            Predicate::IsNull => BoundPredicate::IsNull,
            Predicate::IsNotNull => BoundPredicate::IsNotNull,
        };
        Ok(Self {
            column: filter.column.clone(),
            predicate,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Row-level evaluation. Null rows never satisfy a comparison.
    pub fn evaluate(&self, values: &ArrayRef) -> Result<BooleanArray> {
        Ok(match &self.predicate {
            BoundPredicate::Compare(op, literal) => {
                let literal = Scalar::new(literal.clone());
                match op {
                    Comparison::Eq => cmp::eq(values, &literal)?,
                    Comparison::NotEq => cmp::neq(values, &literal)?,
                    Comparison::Lt => cmp::lt(values, &literal)?,
                    Comparison::LtEq => cmp::lt_eq(values, &literal)?,
                    Comparison::Gt => cmp::gt(values, &literal)?,
                    Comparison::GtEq => cmp::gt_eq(values, &literal)?,
                }
            }
            BoundPredicate::Between(low, high) => and(
                &cmp::gt_eq(values, &Scalar::new(low.clone()))?,
                &cmp::lt_eq(values, &Scalar::new(high.clone()))?,
            )?,
            BoundPredicate::IsNull => is_null(values.as_ref())?,
            BoundPredicate::IsNotNull => is_not_null(values.as_ref())?,
        })
    }

    /// What `stats` allow us to conclude without looking at the rows.
    pub fn verdict(&self, stats: &ChunkStatistics) -> Result<ChunkVerdict> {
        let no_nulls = stats.null_count == 0;
        let all_null = stats.all_null();
        match &self.predicate {
            BoundPredicate::IsNull if no_nulls => return Ok(ChunkVerdict::Skip),
            BoundPredicate::IsNull if all_null => return Ok(ChunkVerdict::All),
            BoundPredicate::IsNotNull if all_null => return Ok(ChunkVerdict::Skip),
            BoundPredicate::IsNotNull if no_nulls => return Ok(ChunkVerdict::All),
            BoundPredicate::IsNull | BoundPredicate::IsNotNull => {
                return Ok(ChunkVerdict::Partial)
            }
            _ if all_null => return Ok(ChunkVerdict::Skip),
            _ => {}
        }
        let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
            return Ok(ChunkVerdict::Partial);
        };

        use Ordering::{Equal, Greater, Less};
        let (skip, all) = match &self.predicate {
            BoundPredicate::Compare(op, literal) => {
                // literal vs min, literal vs max
                let lo = compare(literal, min)?;
                let hi = compare(literal, max)?;
                match op {
                    Comparison::Eq => (lo == Less || hi == Greater, lo == Equal && hi == Equal),
                    Comparison::NotEq => (lo == Equal && hi == Equal, lo == Less || hi == Greater),
                    Comparison::Lt => (lo != Greater, hi == Greater),
                    Comparison::LtEq => (lo == Less, hi != Less),
                    Comparison::Gt => (hi != Less, lo == Less),
                    Comparison::GtEq => (hi == Greater, lo != Greater),
                }
            }
            BoundPredicate::Between(low, high) => {
                let empty = compare(low, high)? == Greater;
                let above = compare(low, max)? == Greater;
                let below = compare(high, min)? == Less;
                let inside = compare(low, min)? != Greater && compare(high, max)? != Less;
                (empty || above || below, inside)
            }
            BoundPredicate::IsNull | BoundPredicate::IsNotNull => (false, false),
        };
        Ok(if skip {
            ChunkVerdict::Skip
        } else if all && no_nulls {
            ChunkVerdict::All
        } else {
            ChunkVerdict::Partial
        })
    }
}

/// The conjunction of filters of a scan.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<BoundFilter>,
}

impl FilterSet {
    /// Bind `filters` against the columns of `schema`.
    pub fn bind(filters: &[ColumnFilter], schema: &Schema) -> Result<Self> {
        let filters = filters
            .iter()
            .map(|filter| {
                let field = schema.field_with_name(&filter.column).map_err(|_| {
                    Error::invalid_input(
                        format!("filter refers to unknown column {}", filter.column),
                        location!(),
                    )
                })?;
                BoundFilter::bind(filter, field.data_type())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundFilter> {
        self.filters.iter()
    }

    /// Filtered column names, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        for filter in &self.filters {
            if !columns.contains(&filter.column()) {
                columns.push(filter.column());
            }
        }
        columns
    }

    pub fn for_column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a BoundFilter> {
        self.filters.iter().filter(move |f| f.column == column)
    }

    /// Combined verdict of the filters on `column`.
    pub fn column_verdict(&self, column: &str, stats: &ChunkStatistics) -> Result<ChunkVerdict> {
        let mut verdict = ChunkVerdict::All;
        for filter in self.for_column(column) {
            verdict = verdict.and(filter.verdict(stats)?);
            if verdict == ChunkVerdict::Skip {
                break;
            }
        }
        Ok(verdict)
    }

    /// True if no row of a chunk with the given per-column statistics can
    /// satisfy every filter. Columns without statistics never cause a skip.
    pub fn should_skip(&self, stats: &HashMap<&str, &ChunkStatistics>) -> Result<bool> {
        for (column, stats) in stats {
            if self.column_verdict(column, stats)? == ChunkVerdict::Skip {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if the single value `run` of a run of `column` cannot satisfy the
    /// filters on that column.
    pub fn skip_run(&self, column: &str, run: &ArrayRef) -> Result<bool> {
        for filter in self.for_column(column) {
            let matched = filter.evaluate(run)?;
            if !matched.is_valid(0) || !matched.value(0) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rows of `values` that satisfy every filter on `column`. Null results
    /// count as not matching.
    pub fn evaluate(&self, column: &str, values: &ArrayRef) -> Result<BooleanArray> {
        let mut mask: Option<BooleanArray> = None;
        for filter in self.for_column(column) {
            let matched = filter.evaluate(values)?;
            mask = Some(match mask {
                Some(mask) => and(&mask, &matched)?,
                None => matched,
            });
        }
        let mask = mask.unwrap_or_else(|| BooleanArray::from(vec![true; values.len()]));
        Ok(match mask.nulls() {
            Some(_) => arrow_select::filter::prep_null_mask_filter(&mask),
            None => mask,
        })
    }

    /// Resolve the filters on a run-encoded column run by run.
    ///
    /// `runs` covers `num_rows` rows; uncovered rows take `fill`, or null.
    /// Returns the matching row ranges and the number of runs that were
    /// skipped.
    pub fn matching_runs(
        &self,
        column: &str,
        runs: &RunSequenceEncoding,
        num_rows: u64,
        fill: Option<&ArrayRef>,
    ) -> Result<(Vec<Range<u64>>, usize)> {
        let matched = self.evaluate(column, runs.values())?;
        let gap = match fill {
            Some(fill) => fill.clone(),
            None => new_null_array(runs.values().data_type(), 1),
        };
        let gap_matches = !self.skip_run(column, &gap)?;

        let mut ranges = RangeList::default();
        let mut cursor = 0;
        for index in 0..runs.num_runs() {
            let run = runs.run_rows(index);
            if gap_matches {
                ranges.push(cursor..run.start);
            }
            if matched.value(index) {
                ranges.push(run.clone());
            }
            cursor = run.end;
        }
        if gap_matches {
            ranges.push(cursor..num_rows);
        }
        let skipped = runs.num_runs() - matched.true_count();
        Ok((ranges.0, skipped))
    }
}

/// Sorted, disjoint, non-empty ranges with adjacent ranges merged.
#[derive(Debug, Default)]
struct RangeList(Vec<Range<u64>>);

impl RangeList {
    fn push(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        match self.0.last_mut() {
            Some(last) if last.end >= range.start => last.end = last.end.max(range.end),
            _ => self.0.push(range),
        }
    }
}

/// Rows present in both `left` and `right`, which must be sorted and
/// disjoint.
pub fn intersect_ranges(left: &[Range<u64>], right: &[Range<u64>]) -> Vec<Range<u64>> {
    let mut out = RangeList::default();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let start = left[i].start.max(right[j].start);
        let end = left[i].end.min(right[j].end);
        out.push(start..end);
        if left[i].end < right[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out.0
}

/// A selection mask of `len` rows with the rows in `ranges` set.
pub fn ranges_to_mask(ranges: &[Range<u64>], len: u64) -> BooleanArray {
    let mut builder = BooleanBufferBuilder::new(len as usize);
    let mut cursor = 0;
    for range in ranges {
        builder.append_n((range.start - cursor) as usize, false);
        builder.append_n((range.end - range.start) as usize, true);
        cursor = range.end;
    }
    builder.append_n((len - cursor) as usize, false);
    BooleanArray::new(builder.finish(), None)
}

#[cfg(test)]
mod tests {
    use arrow_schema::Field;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn stats(values: Vec<Option<i32>>) -> ChunkStatistics {
        ChunkStatistics::compute(&Int32Array::from(values)).unwrap()
    }

    fn bound(filter: ColumnFilter) -> BoundFilter {
        BoundFilter::bind(&filter, &DataType::Int32).unwrap()
    }

    #[rstest]
    #[case::eq_below(ColumnFilter::eq("x", 1), ChunkVerdict::Skip)]
    #[case::eq_inside(ColumnFilter::eq("x", 5), ChunkVerdict::Partial)]
    #[case::not_eq_outside(ColumnFilter::not_eq("x", 42), ChunkVerdict::All)]
    #[case::lt_min(ColumnFilter::lt("x", 3), ChunkVerdict::Skip)]
    #[case::lt_eq_min(ColumnFilter::lt_eq("x", 3), ChunkVerdict::Partial)]
    #[case::lt_above_max(ColumnFilter::lt("x", 10), ChunkVerdict::All)]
    #[case::gt_max(ColumnFilter::gt("x", 9), ChunkVerdict::Skip)]
    #[case::gt_eq_max(ColumnFilter::gt_eq("x", 9), ChunkVerdict::Partial)]
    #[case::gt_below_min(ColumnFilter::gt("x", 2), ChunkVerdict::All)]
    #[case::between_disjoint(ColumnFilter::between("x", 10, 20), ChunkVerdict::Skip)]
    #[case::between_cover(ColumnFilter::between("x", 3, 9), ChunkVerdict::All)]
    #[case::between_empty(ColumnFilter::between("x", 6, 4), ChunkVerdict::Skip)]
    #[case::is_null(ColumnFilter::is_null("x"), ChunkVerdict::Skip)]
    #[case::is_not_null(ColumnFilter::is_not_null("x"), ChunkVerdict::All)]
    fn test_verdicts(#[case] filter: ColumnFilter, #[case] expected: ChunkVerdict) {
        let stats = stats(vec![Some(3), Some(5), Some(9)]);
        assert_eq!(bound(filter).verdict(&stats).unwrap(), expected);
    }

    #[test]
    fn test_nulls_prevent_all_verdict() {
        let stats = stats(vec![Some(3), None]);
        assert_eq!(
            bound(ColumnFilter::gt("x", 0)).verdict(&stats).unwrap(),
            ChunkVerdict::Partial
        );
        let stats = self::stats(vec![None, None]);
        assert_eq!(
            bound(ColumnFilter::not_eq("x", 0)).verdict(&stats).unwrap(),
            ChunkVerdict::Skip
        );
        assert_eq!(
            bound(ColumnFilter::is_null("x")).verdict(&stats).unwrap(),
            ChunkVerdict::All
        );
    }

    #[test]
    fn test_should_skip() {
        let schema = Schema::new(vec![
            Field::new("x", DataType::Int32, true),
            Field::new("y", DataType::Int32, true),
        ]);
        let filters = FilterSet::bind(
            &[ColumnFilter::gt("x", 4), ColumnFilter::lt("y", 0)],
            &schema,
        )
        .unwrap();
        let x = stats(vec![Some(3), Some(5)]);
        let y = stats(vec![Some(1), Some(2)]);
        assert!(!filters.should_skip(&HashMap::from([("x", &x)])).unwrap());
        assert!(filters
            .should_skip(&HashMap::from([("x", &x), ("y", &y)]))
            .unwrap());
        assert!(!filters.should_skip(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_nan_is_greatest() {
        let values: ArrayRef = Arc::new(Float64Array::from(vec![1.0, f64::NAN]));
        let stats = ChunkStatistics::compute(values.as_ref()).unwrap();
        let filter = BoundFilter::bind(&ColumnFilter::gt("x", 5.0), &DataType::Float64).unwrap();
        assert_eq!(filter.verdict(&stats).unwrap(), ChunkVerdict::Partial);
        let matched = filter.evaluate(&values).unwrap();
        assert_eq!(matched, BooleanArray::from(vec![false, true]));
    }

    #[test]
    fn test_literal_coercion() {
        // Widening is fine
        assert!(BoundFilter::bind(&ColumnFilter::eq("x", 3_i8), &DataType::Int64).is_ok());
        assert!(BoundFilter::bind(&ColumnFilter::eq("x", 2.0), &DataType::Int32).is_ok());
        for (filter, data_type) in [
            (ColumnFilter::eq("x", 2.5), DataType::Int32),
            (ColumnFilter::eq("x", 300), DataType::UInt8),
            (ColumnFilter::eq("x", -1), DataType::UInt32),
            (ColumnFilter::eq("x", "abc"), DataType::Int32),
        ] {
            let err = BoundFilter::bind(&filter, &data_type).unwrap_err();
            assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
        }
    }

    #[test]
    fn test_nested_columns_cannot_be_filtered() {
        let item = Arc::new(Field::new("item", DataType::Int32, true));
        let data_type = DataType::FixedSizeList(item, 3);
        let err = BoundFilter::bind(&ColumnFilter::eq("x", 1), &data_type).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
    }

    #[test]
    fn test_unknown_filter_column() {
        let schema = Schema::new(vec![Field::new("x", DataType::Int32, true)]);
        let err = FilterSet::bind(&[ColumnFilter::eq("y", 1)], &schema).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
    }

    #[test]
    fn test_matching_runs_with_fill() {
        let schema = Schema::new(vec![Field::new("flag", DataType::Int32, true)]);
        let runs = RunSequenceEncoding::try_new(
            vec![2, 5, 8],
            vec![3, 2, 1],
            Arc::new(Int32Array::from(vec![1, 2, 1])),
        )
        .unwrap();
        let filters = FilterSet::bind(&[ColumnFilter::eq("flag", 1)], &schema).unwrap();
        let (ranges, skipped) = filters.matching_runs("flag", &runs, 10, None).unwrap();
        assert_eq!(ranges, vec![2..5, 8..9]);
        assert_eq!(skipped, 1);

        let fill: ArrayRef = Arc::new(Int32Array::from(vec![1]));
        let (ranges, _) = filters.matching_runs("flag", &runs, 10, Some(&fill)).unwrap();
        assert_eq!(ranges, vec![0..5, 7..10]);
        assert!(filters.skip_run("flag", &runs.run_value(1)).unwrap());
    }

    #[test]
    fn test_ranges() {
        assert_eq!(
            intersect_ranges(&[0..10, 20..30], &[5..25, 28..40]),
            vec![5..10, 20..25, 28..30]
        );
        assert_eq!(intersect_ranges(&[0..5], &[5..9]), vec![]);
        let mask = ranges_to_mask(&[1..3, 4..5], 6);
        assert_eq!(
            mask,
            BooleanArray::from(vec![false, true, true, false, true, false])
        );
    }

    fn any_filter() -> impl Strategy<Value = ColumnFilter> {
        let literal = -20_i32..20;
        prop_oneof![
            literal.clone().prop_map(|v| ColumnFilter::eq("x", v)),
            literal.clone().prop_map(|v| ColumnFilter::not_eq("x", v)),
            literal.clone().prop_map(|v| ColumnFilter::lt("x", v)),
            literal.clone().prop_map(|v| ColumnFilter::lt_eq("x", v)),
            literal.clone().prop_map(|v| ColumnFilter::gt("x", v)),
            literal.clone().prop_map(|v| ColumnFilter::gt_eq("x", v)),
            (literal.clone(), literal).prop_map(|(a, b)| ColumnFilter::between("x", a, b)),
            Just(ColumnFilter::is_null("x")),
            Just(ColumnFilter::is_not_null("x")),
        ]
    }

    proptest! {
        #[test]
        fn test_verdict_is_sound(
            values in proptest::collection::vec(proptest::option::weighted(0.9, -20_i32..20), 1..64),
            filter in any_filter(),
        ) {
            let filter = bound(filter);
            let array: ArrayRef = Arc::new(Int32Array::from(values));
            let stats = ChunkStatistics::compute(array.as_ref()).unwrap();
            let matched = filter.evaluate(&array).unwrap();
            let matches = (0..matched.len())
                .filter(|i| matched.is_valid(*i) && matched.value(*i))
                .count();
            match filter.verdict(&stats).unwrap() {
                ChunkVerdict::Skip => prop_assert_eq!(matches, 0),
                ChunkVerdict::All => prop_assert_eq!(matches, array.len()),
                ChunkVerdict::Partial => {}
            }
        }
    }
}
