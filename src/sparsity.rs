//! Matrix density bookkeeping
//!
//! The configured density constant sizes the initial CSR buffers. The final
//! report carries both that static estimate and the sparsity measured from the
//! entries actually written; reports and files use the measured value.

use crate::error::{KmxError, Result};
use serde::{Deserialize, Serialize};

/// Expected fraction of non-zero genome x k-mer cells
pub const DEFAULT_DENSITY: f64 = 0.001;

#[derive(Debug, Clone, Copy)]
pub struct SparsityTracker {
    density: f64,
    n_rows: usize,
    n_cols: usize,
}

impl SparsityTracker {
    pub fn new(density: f64, n_rows: usize, n_cols: usize) -> Result<Self> {
        if !(density > 0.0 && density <= 1.0) {
            return Err(KmxError::config(format!(
                "Initial density must be in (0, 1], got {}",
                density
            )));
        }
        Ok(Self {
            density,
            n_rows,
            n_cols,
        })
    }

    pub fn density_estimate(&self) -> f64 {
        self.density
    }

    pub fn cells(&self) -> u64 {
        self.n_rows as u64 * self.n_cols as u64
    }

    /// Initial column/value capacity: `floor(density * cols * rows)`
    pub fn initial_capacity(&self) -> usize {
        (self.density * self.n_cols as f64 * self.n_rows as f64) as usize
    }

    /// Density observed after `rows_done` rows holding `nnz` entries
    pub fn running_density(&self, nnz: usize, rows_done: usize) -> f64 {
        let cells = rows_done as f64 * self.n_cols as f64;
        if cells == 0.0 {
            0.0
        } else {
            nnz as f64 / cells
        }
    }

    pub fn report(&self, nnz: usize) -> SparsityReport {
        let cells = self.cells();
        let observed_density = if cells == 0 { 0.0 } else { nnz as f64 / cells as f64 };
        SparsityReport {
            nnz: nnz as u64,
            cells,
            estimated_density: self.density,
            estimated_sparsity_percent: 100.0 * (1.0 - self.density),
            observed_density,
            observed_sparsity_percent: 100.0 * (1.0 - observed_density),
        }
    }
}

/// Final density summary of a built matrix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparsityReport {
    pub nnz: u64,
    pub cells: u64,
    pub estimated_density: f64,
    pub estimated_sparsity_percent: f64,
    pub observed_density: f64,
    pub observed_sparsity_percent: f64,
}
