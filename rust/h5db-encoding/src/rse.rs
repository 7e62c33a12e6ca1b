// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! # Run-Sequence Encoding
//!
//! A run-sequence encoded column stores a value only where it changes. Each
//! run is a `(start, length, value)` triple over the rows of a chunk:
//!
//! ```text
//! starts:  [0,   600]
//! lengths: [600, 400]
//! values:  [1,   2  ]
//! ```
//!
//! decodes to 600 copies of `1` followed by 400 copies of `2`. Rows covered by
//! no run take the column's fill value, or null if it declares none.
//!
//! Runs must be sorted, non-overlapping, non-empty and inside the logical
//! extent of the chunk. An encoding that breaks any of these rules is rejected
//! as a whole; the decoder never returns a partially expanded buffer.

use std::ops::Range;

use arrow_array::builder::UInt64Builder;
use arrow_array::{Array, ArrayRef, UInt64Array};
use arrow_select::concat::concat;
use arrow_select::take::take;
use deepsize::DeepSizeOf;
use log::trace;
use snafu::location;

use h5db_core::utils::env::MAX_RUNS;
use h5db_core::{Error, Result};

use crate::statistics::ChunkStatistics;

fn malformed(run_index: usize, reason: String) -> Error {
    Error::MalformedEncoding {
        column: String::new(),
        run_index,
        reason,
        location: location!(),
    }
}

/// The runs of one column (or one chunk of a column).
#[derive(Debug, Clone)]
pub struct RunSequenceEncoding {
    starts: Vec<u64>,
    lengths: Vec<u64>,
    /// One value per run.
    values: ArrayRef,
}

impl DeepSizeOf for RunSequenceEncoding {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        self.starts.deep_size_of_children(context)
            + self.lengths.deep_size_of_children(context)
            + self.values.get_array_memory_size()
    }
}

impl RunSequenceEncoding {
    /// Create an encoding from explicit run starts and lengths.
    ///
    /// Only the arity of the three inputs is checked here; run ordering and
    /// bounds are checked by [`RunSequenceDecoder`].
    pub fn try_new(starts: Vec<u64>, lengths: Vec<u64>, values: ArrayRef) -> Result<Self> {
        if starts.len() != lengths.len() || starts.len() != values.len() {
            let shortest = starts.len().min(lengths.len()).min(values.len());
            return Err(malformed(
                shortest,
                format!(
                    "run arrays disagree in length: {} starts, {} lengths, {} values",
                    starts.len(),
                    lengths.len(),
                    values.len()
                ),
            ));
        }
        Ok(Self {
            starts,
            lengths,
            values,
        })
    }

    /// Create an encoding where every run extends to the start of the next
    /// one and the last run extends to `num_rows`.
    ///
    /// A start that does not increase produces a zero-length run, which the
    /// decoder rejects.
    pub fn from_run_starts(starts: Vec<u64>, values: ArrayRef, num_rows: u64) -> Result<Self> {
        let lengths = starts
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let end = starts.get(i + 1).copied().unwrap_or(num_rows);
                end.saturating_sub(*start)
            })
            .collect();
        Self::try_new(starts, lengths, values)
    }

    pub fn num_runs(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn starts(&self) -> &[u64] {
        &self.starts
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    pub fn values(&self) -> &ArrayRef {
        &self.values
    }

    /// Row range of the `index`-th run.
    pub fn run_rows(&self, index: usize) -> Range<u64> {
        let start = self.starts[index];
        start..start.saturating_add(self.lengths[index])
    }

    /// Single-element array holding the value of the `index`-th run.
    pub fn run_value(&self, index: usize) -> ArrayRef {
        self.values.slice(index, 1)
    }

    /// Number of rows covered by runs.
    pub fn covered_rows(&self) -> u64 {
        self.lengths.iter().sum()
    }

    /// The runs that intersect `rows`, clipped to it and rebased so that
    /// `rows.start` becomes row 0.
    ///
    /// The encoding must already be sorted and non-overlapping.
    pub fn slice_rows(&self, rows: Range<u64>) -> Result<Self> {
        // First run that ends after rows.start
        let first = self
            .starts
            .partition_point(|start| *start < rows.start)
            .saturating_sub(1);
        let mut starts = Vec::new();
        let mut lengths = Vec::new();
        let mut indices = Vec::new();
        for index in first..self.num_runs() {
            let run = self.run_rows(index);
            if run.start >= rows.end {
                break;
            }
            let start = run.start.max(rows.start);
            let end = run.end.min(rows.end);
            if start >= end {
                continue;
            }
            starts.push(start - rows.start);
            lengths.push(end - start);
            indices.push(index as u64);
        }
        let values = take(self.values.as_ref(), &UInt64Array::from(indices), None)?;
        Self::try_new(starts, lengths, values)
    }

    /// Statistics of the encoded rows over a logical extent of `num_rows`,
    /// computed from the runs without expanding them.
    pub fn statistics(&self, num_rows: u64, fill: Option<&ArrayRef>) -> Result<ChunkStatistics> {
        let covered = self.covered_rows();
        ChunkStatistics::from_runs(
            &self.values,
            &self.lengths,
            num_rows.saturating_sub(covered),
            fill,
        )
    }
}

/// Expands [`RunSequenceEncoding`]s into dense arrays.
#[derive(Debug, Clone, Copy)]
pub struct RunSequenceDecoder {
    max_runs: usize,
}

impl Default for RunSequenceDecoder {
    fn default() -> Self {
        Self::new(*MAX_RUNS)
    }
}

impl RunSequenceDecoder {
    /// Create a decoder that rejects encodings with more than `max_runs` runs.
    pub fn new(max_runs: usize) -> Self {
        Self { max_runs }
    }

    pub fn max_runs(&self) -> usize {
        self.max_runs
    }

    /// Check every invariant of `encoding` against a logical extent of
    /// `num_rows`.
    ///
    /// Ordering is checked across the whole sequence before the per-run
    /// checks, so a run that starts before its predecessor ends is reported as
    /// such even if the predecessor itself also overruns the extent.
    pub fn validate(&self, encoding: &RunSequenceEncoding, num_rows: u64) -> Result<()> {
        let num_runs = encoding.num_runs();
        if num_runs > self.max_runs {
            return Err(malformed(
                self.max_runs,
                format!(
                    "{} runs exceed the limit of {} runs",
                    num_runs, self.max_runs
                ),
            ));
        }

        for index in 1..num_runs {
            let previous = encoding.run_rows(index - 1);
            let start = encoding.starts[index];
            if start < previous.end {
                return Err(malformed(
                    index,
                    format!(
                        "run starts at row {} before the previous run [{}, {}) ends",
                        start, previous.start, previous.end
                    ),
                ));
            }
        }

        for index in 0..num_runs {
            let start = encoding.starts[index];
            let length = encoding.lengths[index];
            if length == 0 {
                return Err(malformed(
                    index,
                    format!("run at row {} has zero length", start),
                ));
            }
            match start.checked_add(length) {
                Some(end) if end <= num_rows => {}
                _ => {
                    return Err(malformed(
                        index,
                        format!(
                            "run [{}, {}+{}) exceeds the logical extent of {} rows",
                            start, start, length, num_rows
                        ),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Expand `encoding` into `num_rows` dense values.
    ///
    /// Rows that no run covers take `fill` (a single-element array of the
    /// value type) or null.
    pub fn decode(
        &self,
        encoding: &RunSequenceEncoding,
        num_rows: u64,
        fill: Option<&ArrayRef>,
    ) -> Result<ArrayRef> {
        self.validate(encoding, num_rows)?;
        trace!(
            "Decoding {} runs into {} rows",
            encoding.num_runs(),
            num_rows
        );

        let values = encoding.values();
        let (source, gap_index) = match fill {
            Some(fill) => {
                if fill.len() != 1 || fill.data_type() != values.data_type() {
                    return Err(Error::invalid_input(
                        format!(
                            "fill value must be a single {} value, got {} values of type {}",
                            values.data_type(),
                            fill.len(),
                            fill.data_type()
                        ),
                        location!(),
                    ));
                }
                (
                    concat(&[values.as_ref(), fill.as_ref()])?,
                    Some(values.len() as u64),
                )
            }
            None => (values.clone(), None),
        };

        let mut indices = UInt64Builder::with_capacity(num_rows as usize);
        let gap = |indices: &mut UInt64Builder, rows: u64| match gap_index {
            Some(index) => indices.append_value_n(index, rows as usize),
            None => indices.append_nulls(rows as usize),
        };
        let mut cursor = 0_u64;
        for index in 0..encoding.num_runs() {
            let run = encoding.run_rows(index);
            gap(&mut indices, run.start - cursor);
            indices.append_value_n(index as u64, (run.end - run.start) as usize);
            cursor = run.end;
        }
        gap(&mut indices, num_rows - cursor);

        let indices = indices.finish();
        debug_assert_eq!(indices.len() as u64, num_rows);
        Ok(take(source.as_ref(), &indices, None)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::cast::AsArray;
    use arrow_array::types::Int32Type;
    use arrow_array::{Int32Array, StringArray};
    use proptest::prelude::*;

    use super::*;

    fn ints(values: &[i32]) -> ArrayRef {
        Arc::new(Int32Array::from(values.to_vec()))
    }

    fn encoding(runs: &[(u64, u64, i32)]) -> RunSequenceEncoding {
        RunSequenceEncoding::try_new(
            runs.iter().map(|r| r.0).collect(),
            runs.iter().map(|r| r.1).collect(),
            ints(&runs.iter().map(|r| r.2).collect::<Vec<_>>()),
        )
        .unwrap()
    }

    fn expect_malformed(err: Error) -> (usize, String) {
        match err {
            Error::MalformedEncoding {
                run_index, reason, ..
            } => (run_index, reason),
            other => panic!("expected MalformedEncoding, got {other:?}"),
        }
    }

    // ========== Core Functionality Tests ==========

    #[test]
    fn test_decode_contiguous_runs() {
        let decoded = RunSequenceDecoder::default()
            .decode(&encoding(&[(0, 3, 7), (3, 2, 9)]), 5, None)
            .unwrap();
        let decoded = decoded.as_primitive::<Int32Type>();
        assert_eq!(decoded.values().as_ref(), &[7, 7, 7, 9, 9]);
        assert_eq!(decoded.null_count(), 0);
    }

    #[test]
    fn test_gaps_take_fill_or_null() {
        let enc = encoding(&[(2, 2, 5), (6, 1, 8)]);
        let decoder = RunSequenceDecoder::default();

        let decoded = decoder.decode(&enc, 8, None).unwrap();
        let decoded = decoded.as_primitive::<Int32Type>();
        let expected = Int32Array::from(vec![
            None,
            None,
            Some(5),
            Some(5),
            None,
            None,
            Some(8),
            None,
        ]);
        assert_eq!(decoded, &expected);

        let fill = ints(&[-1]);
        let decoded = decoder.decode(&enc, 8, Some(&fill)).unwrap();
        let decoded = decoded.as_primitive::<Int32Type>();
        assert_eq!(decoded.values().as_ref(), &[-1, -1, 5, 5, -1, -1, 8, -1]);
    }

    #[test]
    fn test_decode_strings() {
        let enc = RunSequenceEncoding::try_new(
            vec![0, 2],
            vec![2, 1],
            Arc::new(StringArray::from(vec!["idle", "armed"])),
        )
        .unwrap();
        let decoded = RunSequenceDecoder::default().decode(&enc, 4, None).unwrap();
        let decoded = decoded.as_string::<i32>();
        assert_eq!(decoded.value(0), "idle");
        assert_eq!(decoded.value(2), "armed");
        assert!(decoded.is_null(3));
    }

    #[test]
    fn test_empty_encoding() {
        let enc = encoding(&[]);
        let decoded = RunSequenceDecoder::default().decode(&enc, 0, None).unwrap();
        assert_eq!(decoded.len(), 0);
        let decoded = RunSequenceDecoder::default().decode(&enc, 3, None).unwrap();
        assert_eq!(decoded.null_count(), 3);
    }

    #[test]
    fn test_from_run_starts() {
        let enc = RunSequenceEncoding::from_run_starts(vec![0, 600], ints(&[1, 2]), 1000).unwrap();
        assert_eq!(enc.lengths(), &[600, 400]);
        RunSequenceDecoder::default().validate(&enc, 1000).unwrap();

        // A repeated start yields an empty run
        let enc = RunSequenceEncoding::from_run_starts(vec![0, 5, 5], ints(&[1, 2, 3]), 10).unwrap();
        let (run_index, reason) =
            expect_malformed(RunSequenceDecoder::default().validate(&enc, 10).unwrap_err());
        assert_eq!(run_index, 1);
        assert!(reason.contains("zero length"), "{reason}");
    }

    #[test]
    fn test_slice_rows_clips_and_rebases() {
        let enc = encoding(&[(0, 600, 1), (600, 400, 2)]);
        let chunk = enc.slice_rows(512..768).unwrap();
        assert_eq!(chunk.starts(), &[0, 88]);
        assert_eq!(chunk.lengths(), &[88, 168]);
        assert_eq!(
            chunk.values().as_primitive::<Int32Type>().values().as_ref(),
            &[1, 2]
        );

        let chunk = enc.slice_rows(0..256).unwrap();
        assert_eq!(chunk.num_runs(), 1);
        assert_eq!(chunk.lengths(), &[256]);

        let sparse = encoding(&[(10, 5, 1), (40, 5, 2)]);
        let chunk = sparse.slice_rows(16..32).unwrap();
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_statistics_without_expanding() {
        let enc = encoding(&[(0, 88, 1), (88, 168, 2)]);
        let stats = enc.statistics(256, None).unwrap();
        assert_eq!(stats.run_count, Some(2));
        assert_eq!(stats.null_count, 0);
        assert_eq!(stats.min.unwrap().as_primitive::<Int32Type>().value(0), 1);
        assert_eq!(stats.max.unwrap().as_primitive::<Int32Type>().value(0), 2);
    }

    // ========== Validation Tests ==========

    #[test]
    fn test_ordering_violation_reported_before_overrun() {
        // The first run overruns a 120-row extent, but the ordering violation
        // of the second run is what gets reported.
        let enc = encoding(&[(100, 50, 1), (90, 10, 2)]);
        let (run_index, reason) = expect_malformed(
            RunSequenceDecoder::default()
                .decode(&enc, 120, None)
                .unwrap_err(),
        );
        assert_eq!(run_index, 1);
        assert!(reason.contains("before the previous run"), "{reason}");
    }

    #[test]
    fn test_overlap_is_rejected() {
        let enc = encoding(&[(0, 10, 1), (9, 2, 2)]);
        let (run_index, _) =
            expect_malformed(RunSequenceDecoder::default().decode(&enc, 20, None).unwrap_err());
        assert_eq!(run_index, 1);
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let enc = encoding(&[(0, 4, 1), (4, 0, 2)]);
        let (run_index, reason) =
            expect_malformed(RunSequenceDecoder::default().decode(&enc, 8, None).unwrap_err());
        assert_eq!(run_index, 1);
        assert!(reason.contains("zero length"));
    }

    #[test]
    fn test_extent_overrun_is_rejected() {
        let enc = encoding(&[(0, 4, 1), (4, 5, 2)]);
        let (run_index, reason) =
            expect_malformed(RunSequenceDecoder::default().decode(&enc, 8, None).unwrap_err());
        assert_eq!(run_index, 1);
        assert!(reason.contains("exceeds"));

        let enc = encoding(&[(u64::MAX - 1, 5, 1)]);
        assert!(RunSequenceDecoder::default().decode(&enc, 8, None).is_err());
    }

    #[test]
    fn test_run_limit() {
        let enc = encoding(&[(0, 1, 1), (1, 1, 2), (2, 1, 3)]);
        let (run_index, reason) =
            expect_malformed(RunSequenceDecoder::new(2).decode(&enc, 3, None).unwrap_err());
        assert_eq!(run_index, 2);
        assert!(reason.contains("limit"));
        RunSequenceDecoder::new(3).decode(&enc, 3, None).unwrap();
    }

    #[test]
    fn test_arity_mismatch() {
        let err = RunSequenceEncoding::try_new(vec![0, 1], vec![1, 1], ints(&[1])).unwrap_err();
        let (run_index, _) = expect_malformed(err);
        assert_eq!(run_index, 1);
    }

    #[test]
    fn test_fill_must_match_value_type() {
        let enc = encoding(&[(0, 1, 1)]);
        let fill: ArrayRef = Arc::new(StringArray::from(vec!["x"]));
        let err = RunSequenceDecoder::default()
            .decode(&enc, 2, Some(&fill))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
    }

    // ========== Property Tests ==========

    /// Sorted, non-overlapping runs inside `0..num_rows`.
    fn valid_runs() -> impl Strategy<Value = (Vec<(u64, u64, i32)>, u64)> {
        prop::collection::vec((0_u64..5, 1_u64..6, -3_i32..3), 0..20).prop_flat_map(|shape| {
            let mut runs = Vec::new();
            let mut cursor = 0;
            for (gap, len, value) in shape {
                let start = cursor + gap;
                runs.push((start, len, value));
                cursor = start + len;
            }
            (Just(runs), cursor..cursor + 5)
        })
    }

    proptest! {
        #[test]
        fn prop_decode_matches_runs((runs, num_rows) in valid_runs(), fill in proptest::option::of(-9_i32..-5)) {
            let enc = encoding(&runs);
            let fill_array = fill.map(|f| ints(&[f]));
            let decoded = RunSequenceDecoder::default()
                .decode(&enc, num_rows, fill_array.as_ref())
                .unwrap();
            prop_assert_eq!(decoded.len() as u64, num_rows);
            let decoded = decoded.as_primitive::<Int32Type>();
            let mut expected = vec![fill; num_rows as usize];
            for (start, len, value) in &runs {
                for row in *start..start + len {
                    expected[row as usize] = Some(*value);
                }
            }
            let actual = decoded.iter().collect::<Vec<_>>();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_invalid_encodings_never_decode(
            (runs, num_rows) in valid_runs(),
            victim in any::<prop::sample::Index>(),
            corruption in 0_u8..3,
        ) {
            prop_assume!(runs.len() >= 2);
            let mut runs = runs;
            let i = victim.index(runs.len() - 1) + 1;
            match corruption {
                // Move the run back onto its predecessor
                0 => runs[i].0 = runs[i - 1].0,
                // Empty run
                1 => runs[i].1 = 0,
                // Past the end
                _ => runs[i].1 += num_rows,
            }
            let enc = encoding(&runs);
            let result = RunSequenceDecoder::default().decode(&enc, num_rows, None);
            let is_malformed = matches!(result, Err(Error::MalformedEncoding { .. }));
            prop_assert!(is_malformed);
        }
    }
}
