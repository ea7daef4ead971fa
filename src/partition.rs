//! Held-out test set and training pool
//!
//! Both are drawn from the full dataset by the service's seeded random
//! filter, using the same seed:
//!
//! ```text
//! test       = randomFilter(source, T[1], seed)
//! train_pool = randomFilter(source, T[9], seed)
//! ```
//!
//! Nothing here makes the two disjoint. Whether they overlap is up to the
//! sampling primitive; the partition records the service's
//! [`SamplingGuarantee`] so callers can refuse a split that may overlap.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_SEED;
use crate::service::{DatasetHandle, SamplingGuarantee, TrainingService};
use crate::session::Session;
use crate::window::RowWindowTable;
use crate::{Error, Result};

/// Key of the held-out test frame.
pub const TEST_KEY: &str = "rTest";

/// Key of the training pool frame.
pub const TRAIN_POOL_KEY: &str = "rTrain";

/// Test set and training pool for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    test: DatasetHandle,
    train_pool: DatasetHandle,
    seed: u64,
    guarantee: SamplingGuarantee,
}

impl Partition {
    /// Held-out test frame.
    #[must_use]
    pub const fn test(&self) -> &DatasetHandle {
        &self.test
    }

    /// Training pool frame.
    #[must_use]
    pub const fn train_pool(&self) -> &DatasetHandle {
        &self.train_pool
    }

    /// Seed used for both draws.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// The sampling primitive's disjointness promise.
    #[must_use]
    pub const fn guarantee(&self) -> SamplingGuarantee {
        self.guarantee
    }

    /// Fail unless the split is known to be disjoint, when `required`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if disjointness is required but the
    /// service does not guarantee it.
    pub fn check_disjoint(&self, required: bool) -> Result<()> {
        if required && self.guarantee != SamplingGuarantee::Disjoint {
            return Err(Error::Configuration(format!(
                "a disjoint test/train split is required, but the sampling primitive reports {:?} \
                 for a reused seed",
                self.guarantee
            )));
        }
        Ok(())
    }
}

/// Draws the partition with a fixed seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    seed: u64,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl Partitioner {
    /// Partitioner using `seed` for both draws.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Draw `T[1]` rows as the test set and `T[9]` rows as the training pool.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts; returns
    /// [`Error::Configuration`] if the service returns fewer rows than asked.
    pub async fn partition<S: TrainingService>(
        &self,
        session: &Session<S>,
        source: &DatasetHandle,
        table: &RowWindowTable,
    ) -> Result<Partition> {
        let test = session
            .random_filter(source, table.pct10(), self.seed, TEST_KEY)
            .await?;
        let train_pool = session
            .random_filter(source, table.train_pool_rows(), self.seed, TRAIN_POOL_KEY)
            .await?;

        for (name, handle, wanted) in [
            ("test", &test, table.pct10()),
            ("train pool", &train_pool, table.train_pool_rows()),
        ] {
            if handle.num_rows < wanted {
                return Err(Error::Configuration(format!(
                    "{name} frame {} has {} rows, wanted {wanted}",
                    handle.key, handle.num_rows
                )));
            }
        }

        let guarantee = session.sampling_guarantee();
        tracing::info!(
            test_rows = test.num_rows,
            train_pool_rows = train_pool.num_rows,
            seed = self.seed,
            ?guarantee,
            "partitioned {}",
            source.key
        );

        Ok(Partition {
            test,
            train_pool,
            seed: self.seed,
            guarantee,
        })
    }
}
