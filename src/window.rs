//! Decile row windows
//!
//! The training pool is consumed in cumulative 10%-wide prefixes. The table
//! holds the row count for each decile, built once per run from the total
//! row count of the source dataset:
//!
//! ```text
//! T[i]  = i * floor(num_rows * 0.1)   for i in 1..=9
//! T[10] = num_rows
//! T[0]  = T[10]                       (wraparound to the full dataset)
//! ```
//!
//! `T[9]` can fall short of the true 90% boundary by up to 9 rows when
//! `num_rows` is not a multiple of 10. The tolerance bands absorb this.
//!
//! ## Example
//!
//! ```rust
//! use oobe_harness::window::RowWindowTable;
//!
//! let table = RowWindowTable::new(581_012)?;
//! assert_eq!(table.pct10(), 58_101);
//! assert_eq!(table.rows_for_trial(5), 290_505);
//! assert_eq!(table.rows_for_trial(10), 581_012);
//! # Ok::<(), oobe_harness::Error>(())
//! ```

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of entries in the table (`T[0..=10]`)
pub const WINDOW_COUNT: usize = 11;

/// Smallest row count accepted; anything at or below it gives empty deciles.
pub const MIN_ROWS: u64 = 10;

/// Decile row-count boundaries for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWindowTable {
    num_rows: u64,
    windows: [u64; WINDOW_COUNT],
}

impl RowWindowTable {
    /// Build the table from the source dataset's row count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `num_rows <= 10`.
    pub fn new(num_rows: u64) -> Result<Self> {
        if num_rows <= MIN_ROWS {
            return Err(Error::Configuration(format!(
                "dataset has {num_rows} rows, need more than {MIN_ROWS} to build decile windows"
            )));
        }

        // Integer division is floor(num_rows * 0.1) without float rounding.
        let pct10 = num_rows / 10;
        let mut windows = [0u64; WINDOW_COUNT];
        for (i, slot) in windows.iter_mut().enumerate().take(10).skip(1) {
            *slot = i as u64 * pct10;
        }
        windows[10] = num_rows;
        windows[0] = windows[10];

        Ok(Self { num_rows, windows })
    }

    /// Total row count the table was built from.
    #[must_use]
    pub const fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Size of one decile (`T[1]`); also the held-out test set size.
    #[must_use]
    pub const fn pct10(&self) -> u64 {
        self.windows[1]
    }

    /// Size of the training pool (`T[9]`).
    #[must_use]
    pub const fn train_pool_rows(&self) -> u64 {
        self.windows[9]
    }

    /// Raw entry `T[index]`.
    ///
    /// # Panics
    ///
    /// Panics if `index > 10`.
    #[must_use]
    pub const fn get(&self, index: usize) -> u64 {
        self.windows[index]
    }

    /// Rows to train on for a trial; indexes modulo 10 so trial 10 wraps to
    /// the full dataset.
    #[must_use]
    pub const fn rows_for_trial(&self, trial: usize) -> u64 {
        self.windows[trial % 10]
    }

    /// Rows left over after the ninth decile (can be slightly more than 10%).
    #[must_use]
    pub const fn last_window_shortfall(&self) -> u64 {
        self.num_rows - self.windows[9]
    }

    /// Percentage of all rows used by a trial.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pct_of_rows(&self, trial: usize) -> f64 {
        self.rows_for_trial(trial) as f64 * 100.0 / self.num_rows as f64
    }

    /// The full table `T[0..=10]`.
    #[must_use]
    pub const fn as_array(&self) -> &[u64; WINDOW_COUNT] {
        &self.windows
    }
}
