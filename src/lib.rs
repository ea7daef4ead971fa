//! # oobe-harness: Decile Accuracy Validation for Distributed Random Forests
//!
//! Drives a remote training service through a fixed experiment and checks
//! that its accuracy estimates match known baselines. Each of nine trials
//! trains on one more decile of a training pool, then compares:
//!
//! - the out-of-bag accuracy reported by training, against a train curve
//! - the accuracy scoring a held-out test set, against a score curve
//!
//! The first check outside its tolerance stops the run.
//!
//! ## Layout
//!
//! - [`window`]: decile row counts `T[0..=10]`
//! - [`partition`]: seeded test set and training pool
//! - [`trial`]: slice, train, score and check for each decile
//! - [`validate`]: tolerance checks; [`report`]: observed curves and deltas
//! - [`service`]: the training service contract and its backends
//! - [`session`]: time bounds, score retry and key ownership
//! - [`harness`]: the whole run
//!
//! ## Example
//!
//! ```rust,no_run
//! use oobe_harness::config::HarnessConfig;
//! use oobe_harness::harness::Harness;
//! use oobe_harness::service::HttpService;
//!
//! # async fn example() -> oobe_harness::Result<()> {
//! let config = HarnessConfig::new("home-0xdiag-datasets", "standard/covtype.data", false);
//! let service = HttpService::new(config.cluster.base_url.clone());
//! let report = Harness::new(config)?.run(service).await.into_result()?;
//! println!("{} trials passed", report.trials_completed());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod harness;
pub mod partition;
pub mod report;
pub mod service;
pub mod session;
pub mod trial;
pub mod validate;
pub mod window;

pub use error::{Error, Result};
