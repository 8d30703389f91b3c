//! Incremental CSR assembly
//!
//! Rows are appended one genome at a time. Column indices and values live in
//! two [`GrowableBuffer`]s that always share capacity and length; when a row
//! does not fit they are reallocated to `max(needed, 2 * capacity)`, which
//! keeps the total copy work linear in the final number of entries.

use crate::error::{KmxError, Result};
use crate::resolver::ResolvedRow;
use tracing::debug;

/// Fixed-capacity buffer with an explicit growth step.
///
/// Unlike a plain `Vec`, capacity only changes through [`GrowableBuffer::grow_to`],
/// so the reallocation policy stays visible to the caller.
#[derive(Debug, Clone)]
pub struct GrowableBuffer<T: Copy> {
    data: Vec<T>,
    capacity: usize,
}

impl<T: Copy> GrowableBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self {
            data: allocate(capacity)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Reallocate to `new_capacity`, copying the written prefix. No-op when not larger.
    pub fn grow_to(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity {
            return Ok(());
        }
        let mut grown = allocate(new_capacity)?;
        grown.extend_from_slice(&self.data);
        self.data = grown;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Append without reallocating.
    ///
    /// # Panics
    /// If `items` does not fit in the remaining capacity.
    pub fn extend_within_capacity(&mut self, items: &[T]) {
        assert!(
            items.len() <= self.remaining(),
            "append of {} items exceeds remaining capacity {}",
            items.len(),
            self.remaining()
        );
        self.data.extend_from_slice(items);
    }

    /// Drop unused capacity and hand out exactly the written entries
    pub fn into_trimmed(mut self) -> Vec<T> {
        self.data.shrink_to_fit();
        self.data
    }
}

fn allocate<T>(capacity: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(capacity).map_err(|_| KmxError::OutOfMemory(capacity))?;
    Ok(data)
}

/// Finished matrix in compressed sparse row layout
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    /// Non-zero values
    pub data: Vec<f32>,
    /// Column index of each value
    pub indices: Vec<u32>,
    /// Row pointer, `n_rows + 1` entries
    pub indptr: Vec<u64>,
    pub n_rows: usize,
    pub n_cols: usize,
}

impl CsrMatrix {
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Column indices and values of row `i`
    pub fn row(&self, i: usize) -> (&[u32], &[f32]) {
        let start = self.indptr[i] as usize;
        let end = self.indptr[i + 1] as usize;
        (&self.indices[start..end], &self.data[start..end])
    }

    pub fn row_nnz(&self, i: usize) -> usize {
        (self.indptr[i + 1] - self.indptr[i]) as usize
    }

    /// Value at (row, col), zero when absent
    pub fn get(&self, row: usize, col: u32) -> f32 {
        let (cols, vals) = self.row(row);
        cols.iter().position(|&c| c == col).map(|p| vals[p]).unwrap_or(0.0)
    }
}

/// Owns the growing CSR buffers for one matrix build
#[derive(Debug)]
pub struct CsrAccumulator {
    indptr: Vec<u64>,
    column: GrowableBuffer<u32>,
    value: GrowableBuffer<f32>,
    n_cols: usize,
    growth_events: usize,
}

impl CsrAccumulator {
    pub fn new(initial_capacity: usize, n_cols: usize) -> Result<Self> {
        Ok(Self {
            indptr: vec![0],
            column: GrowableBuffer::with_capacity(initial_capacity)?,
            value: GrowableBuffer::with_capacity(initial_capacity)?,
            n_cols,
            growth_events: 0,
        })
    }

    /// Append `row` as the next matrix row
    pub fn push_row(&mut self, row: &ResolvedRow) -> Result<()> {
        let size = row.len();
        let position = self.column.len();
        let new_size = position + size;

        if new_size > self.column.capacity() {
            let new_capacity = new_size.max(self.column.capacity().saturating_mul(2));
            debug!(
                old_capacity = self.column.capacity(),
                new_capacity,
                row = self.n_rows(),
                "Growing CSR buffers"
            );
            self.column.grow_to(new_capacity)?;
            self.value.grow_to(new_capacity)?;
            self.growth_events += 1;
        }

        debug_assert!(row.columns().iter().all(|&c| (c as usize) < self.n_cols));
        self.column.extend_within_capacity(row.columns());
        self.value.extend_within_capacity(row.values());
        self.indptr.push(new_size as u64);
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Entries written so far, equal to the last row pointer
    pub fn nnz(&self) -> usize {
        self.column.len()
    }

    pub fn capacity(&self) -> usize {
        self.column.capacity()
    }

    pub fn growth_events(&self) -> usize {
        self.growth_events
    }

    pub fn indptr(&self) -> &[u64] {
        &self.indptr
    }

    /// Trim to the used length and return the matrix
    pub fn finish(self) -> CsrMatrix {
        let n_rows = self.n_rows();
        CsrMatrix {
            data: self.value.into_trimmed(),
            indices: self.column.into_trimmed(),
            indptr: self.indptr,
            n_rows,
            n_cols: self.n_cols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(pairs: &[(u32, f32)]) -> ResolvedRow {
        ResolvedRow::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_buffer_growth_preserves_prefix() {
        let mut buf = GrowableBuffer::with_capacity(2).unwrap();
        buf.extend_within_capacity(&[1u32, 2]);
        buf.grow_to(5).unwrap();
        assert_eq!(buf.capacity(), 5);
        assert_eq!(buf.as_slice(), &[1, 2]);
        buf.extend_within_capacity(&[3, 4, 5]);
        assert_eq!(buf.remaining(), 0);

        buf.grow_to(3).unwrap();
        assert_eq!(buf.capacity(), 5);
        assert_eq!(buf.into_trimmed(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "exceeds remaining capacity")]
    fn test_buffer_overflow_panics() {
        let mut buf = GrowableBuffer::with_capacity(1).unwrap();
        buf.extend_within_capacity(&[1u8, 2]);
    }

    #[test]
    fn test_empty_row_repeats_pointer() {
        let mut acc = CsrAccumulator::new(4, 3).unwrap();
        acc.push_row(&row(&[(0, 3.0), (1, 1.0)])).unwrap();
        acc.push_row(&row(&[])).unwrap();

        let m = acc.finish();
        assert_eq!(m.indptr, vec![0, 2, 2]);
        assert_eq!(m.indices.len(), 2);
        assert_eq!(m.data.len(), 2);
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.row_nnz(1), 0);
    }

    #[test]
    fn test_growth_from_small_capacity() {
        let mut acc = CsrAccumulator::new(4, 10).unwrap();
        let pairs: Vec<(u32, f32)> = (0..10).map(|i| (i, (i + 1) as f32)).collect();
        acc.push_row(&row(&pairs)).unwrap();

        assert!(acc.capacity() >= 10);
        assert_eq!(acc.growth_events(), 1);
        let m = acc.finish();
        assert_eq!(m.indices, (0..10).collect::<Vec<u32>>());
        assert_eq!(m.data[9], 10.0);
    }

    #[test]
    fn test_growth_doubles_capacity() {
        let mut acc = CsrAccumulator::new(4, 8).unwrap();
        acc.push_row(&row(&[(0, 1.0), (1, 1.0), (2, 1.0)])).unwrap();
        acc.push_row(&row(&[(3, 1.0), (4, 1.0)])).unwrap();
        assert_eq!(acc.capacity(), 8);
        assert_eq!(acc.nnz(), 5);
    }

    #[test]
    fn test_zero_initial_capacity() {
        let mut acc = CsrAccumulator::new(0, 2).unwrap();
        acc.push_row(&row(&[(1, 2.0)])).unwrap();
        assert_eq!(acc.capacity(), 1);
        let m = acc.finish();
        assert_eq!(m.get(0, 1), 2.0);
        assert_eq!(m.get(0, 0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_indptr_matches_appends(
            sizes in proptest::collection::vec(0usize..40, 0..30),
            initial in 0usize..16,
        ) {
            let n_cols = 64u32;
            let mut acc = CsrAccumulator::new(initial, n_cols as usize).unwrap();
            let mut expected_cols = Vec::new();
            for (r, &size) in sizes.iter().enumerate() {
                let pairs: Vec<(u32, f32)> = (0..size)
                    .map(|j| (((r + j) as u32) % n_cols, (j + 1) as f32))
                    .collect();
                expected_cols.extend(pairs.iter().map(|p| p.0));
                acc.push_row(&row(&pairs)).unwrap();
                prop_assert!(acc.capacity() >= acc.nnz());
            }

            let m = acc.finish();
            prop_assert_eq!(m.indptr.len(), sizes.len() + 1);
            prop_assert_eq!(m.indptr[0], 0);
            prop_assert!(m.indptr.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(*m.indptr.last().unwrap() as usize, m.indices.len());
            prop_assert_eq!(m.indices.len(), m.data.len());
            prop_assert_eq!(m.indices, expected_cols);
            prop_assert!(m.data.iter().all(|&v| v >= 1.0));
        }
    }
}
