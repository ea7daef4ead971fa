//! End-to-end run
//!
//! ```text
//! connect ─> import + parse ─> inspect ─> window table ─> partition
//!                                                            │
//!                         close <─ report <─ trials 1..=N <──┘
//! ```
//!
//! The session is closed and a report is produced whether the run passed or
//! not. A failed run's report holds the trials that passed before the
//! failure.

use chrono::Utc;

use crate::config::HarnessConfig;
use crate::partition::Partitioner;
use crate::report::RunReport;
use crate::service::{ImportRequest, TrainingService};
use crate::session::Session;
use crate::trial::{TrialController, TrialLog};
use crate::validate::Validator;
use crate::window::RowWindowTable;
use crate::{Error, Result};

/// How a run ended, with its report and the service handed back.
#[derive(Debug)]
pub struct RunOutcome<S> {
    report: RunReport,
    error: Option<Error>,
    service: Option<S>,
}

impl<S> RunOutcome<S> {
    /// Report of the run (partial if it failed).
    #[must_use]
    pub const fn report(&self) -> &RunReport {
        &self.report
    }

    /// Error that ended the run, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether every trial passed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The service, unless it was lost before a session was established.
    #[must_use]
    pub const fn service(&self) -> Option<&S> {
        self.service.as_ref()
    }

    /// Report on success, the run's error otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run.
    pub fn into_result(self) -> Result<RunReport> {
        match self.error {
            None => Ok(self.report),
            Some(e) => Err(e),
        }
    }
}

/// Drives one complete run from a validated configuration.
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    /// Create a harness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every step against `service`.
    pub async fn run<S: TrainingService>(&self, service: S) -> RunOutcome<S> {
        let started_at = Utc::now();
        let mut log = TrialLog::new();
        let mut table = None;

        let session = match Session::connect(
            service,
            &self.config.cluster,
            self.config.timeouts,
            self.config.model_timeout(),
            self.config.retry,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => return self.finish(started_at, &log, None, Some(e), None),
        };

        let result = self.drive(&session, &mut table, &mut log).await;
        let service = session.close().await;
        self.finish(started_at, &log, table.as_ref(), result.err(), Some(service))
    }

    async fn drive<S: TrainingService>(
        &self,
        session: &Session<S>,
        table: &mut Option<RowWindowTable>,
        log: &mut TrialLog,
    ) -> Result<()> {
        let dataset = &self.config.dataset;
        let request = ImportRequest::new(
            dataset.bucket.clone(),
            dataset.path.clone(),
            dataset.header,
            dataset.hex_key(),
        );
        let imported = session.import_parse(&request).await?;
        let source = session.inspect(&imported.key).await?;
        tracing::info!(
            cloud = %session.cloud().name,
            rows = source.num_rows,
            cols = source.num_cols,
            "imported {}",
            dataset.full_path().display()
        );

        let table = &*table.insert(RowWindowTable::new(source.num_rows)?);
        tracing::info!(
            shortfall = table.last_window_shortfall(),
            "row windows {:?}",
            table.as_array()
        );

        let partition = Partitioner::new(self.config.seed)
            .partition(session, &source, table)
            .await?;
        partition.check_disjoint(self.config.require_disjoint_partition)?;

        let controller = TrialController::new(
            Validator::new(self.config.expectations.clone(), self.config.tolerances),
            self.config.hyperparameters.clone(),
            self.config.trials,
        )?;
        controller.run(session, table, &partition, log).await
    }

    fn finish<S>(
        &self,
        started_at: chrono::DateTime<Utc>,
        log: &TrialLog,
        table: Option<&RowWindowTable>,
        mut error: Option<Error>,
        service: Option<S>,
    ) -> RunOutcome<S> {
        let mut report = RunReport::from_log(&self.config.expectations, log)
            .with_times(started_at, Utc::now());
        if let Some(table) = table {
            report = report.with_table(table);
        }
        if let Some(e) = &error {
            tracing::error!(trial = ?e.failed_trial(), "{e}");
            report = report.failed(e);
        }
        report.log_summary();

        if let Some(path) = &self.config.report_path {
            if let Err(e) = report.write_json(path) {
                tracing::warn!(error = %e, "failed to write report to {}", path.display());
                error.get_or_insert(e);
            }
        }

        RunOutcome {
            report,
            error,
            service,
        }
    }
}
