//! Experiment driver.
//!
//! Walks the condition list in order. For each value the configuration
//! artifact is rewritten, the client is sampled against a live server, and
//! the samples are reduced to a mean and confidence interval:
//!
//! ```text
//! INIT -> (CONFIGURE -> [BUILD, START] -> RUN_SAMPLES -> [STOP] -> AGGREGATE)* -> SHUTDOWN
//! ```
//!
//! The bracketed steps happen per condition in the `restart` topology and
//! once around the whole loop in the `fixed-server` topology.

use crate::config_store::{ConfigStore, ConfigStoreError, Configuration};
use crate::error::HarnessError;
use crate::interrupt::Interrupt;
use crate::process::Subject;
use crate::sampler::{ClientRunner, FailurePolicy, SampleFailure, SampleSet, Sampler};
use crate::stats::{summarize, SummaryStatistic};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

/// Which side of the system is restarted between conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Rebuild and restart the server for every condition
    #[default]
    Restart,
    /// One server for the whole run; only client-side settings vary
    FixedServer,
}

/// What to run
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    /// Field of the configuration artifact under experimental control
    pub field: String,
    pub conditions: Vec<i64>,
    pub repetitions: usize,
    pub confidence: f64,
    pub topology: Topology,
    pub failure_policy: FailurePolicy,
}

/// How a single condition ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ConditionOutcome {
    Measured { summary: SummaryStatistic },
    /// Ran, but fewer than two usable samples
    NoData { reason: String },
    /// Never measured: configuring or starting the server failed
    Skipped { reason: String },
}

/// Result for one condition value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionReport {
    pub value: i64,
    pub outcome: ConditionOutcome,
    /// Durations that went into the summary
    pub samples: usize,
    pub flagged_samples: usize,
    pub failed_invocations: usize,
    pub failures: Vec<SampleFailure>,
}

impl ConditionReport {
    fn skipped(value: i64, reason: String) -> Self {
        Self {
            value,
            outcome: ConditionOutcome::Skipped { reason },
            samples: 0,
            flagged_samples: 0,
            failed_invocations: 0,
            failures: Vec::new(),
        }
    }

    pub fn summary(&self) -> Option<&SummaryStatistic> {
        match &self.outcome {
            ConditionOutcome::Measured { summary } => Some(summary),
            _ => None,
        }
    }
}

/// Everything the run produced, in condition order
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResult {
    pub field: String,
    pub topology: Topology,
    pub repetitions: usize,
    pub confidence: f64,
    pub failure_policy: FailurePolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub conditions: Vec<ConditionReport>,
}

impl ExperimentResult {
    /// Measured conditions only, in run order
    pub fn measured(&self) -> impl Iterator<Item = (i64, &SummaryStatistic)> {
        self.conditions
            .iter()
            .filter_map(|c| c.summary().map(|s| (c.value, s)))
    }

    /// Conditions that produced no point
    pub fn unmeasured(&self) -> impl Iterator<Item = &ConditionReport> {
        self.conditions.iter().filter(|c| c.summary().is_none())
    }
}

/// Drives a [`Subject`] and a [`ClientRunner`] through an [`ExperimentPlan`]
pub struct ExperimentRunner<S: Subject, C: ClientRunner> {
    plan: ExperimentPlan,
    store: ConfigStore,
    subject: S,
    client: C,
    sampler: Sampler,
    interrupt: Interrupt,
}

impl<S: Subject, C: ClientRunner> ExperimentRunner<S, C> {
    pub fn new(plan: ExperimentPlan, store: ConfigStore, subject: S, client: C) -> Self {
        let sampler = Sampler::new(plan.failure_policy);
        Self {
            plan,
            store,
            subject,
            client,
            sampler,
            interrupt: Interrupt::new(),
        }
    }

    /// Abort with [`HarnessError::Interrupted`] once `interrupt` is raised,
    /// stopping any live server first
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.sampler = self.sampler.with_interrupt(interrupt.clone());
        self.interrupt = interrupt;
        self
    }

    /// Run every condition. Only build failures, an interrupt, and (with a
    /// fixed server) failing to start it end the run early; any live server
    /// is stopped before the error is returned.
    pub fn run(mut self) -> Result<ExperimentResult, HarnessError> {
        let started_at = Utc::now();
        info!(
            field = %self.plan.field,
            conditions = self.plan.conditions.len(),
            repetitions = self.plan.repetitions,
            topology = ?self.plan.topology,
            "Starting experiment"
        );

        let mut reports = Vec::with_capacity(self.plan.conditions.len());
        match self.plan.topology {
            Topology::Restart => self.run_restart(&mut reports)?,
            Topology::FixedServer => self.run_fixed_server(&mut reports)?,
        }

        let measured = reports.iter().filter(|r| r.summary().is_some()).count();
        info!(measured, total = reports.len(), "Experiment finished");

        Ok(ExperimentResult {
            field: self.plan.field,
            topology: self.plan.topology,
            repetitions: self.plan.repetitions,
            confidence: self.plan.confidence,
            failure_policy: self.plan.failure_policy,
            started_at,
            finished_at: Utc::now(),
            conditions: reports,
        })
    }

    fn run_restart(&mut self, reports: &mut Vec<ConditionReport>) -> Result<(), HarnessError> {
        let conditions = self.plan.conditions.clone();
        for value in conditions {
            self.check_interrupt()?;
            let _span = info_span!("condition", field = %self.plan.field, value).entered();
            info!("Running condition");

            let config = match self.configure(value) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Configure failed, skipping condition");
                    reports.push(ConditionReport::skipped(value, e.to_string()));
                    continue;
                }
            };

            self.subject.build_server()?;

            let server = match self.subject.start_server(&config) {
                Ok(server) => server,
                Err(e) => {
                    warn!(error = %e, "Server start failed, skipping condition");
                    reports.push(ConditionReport::skipped(value, e.to_string()));
                    continue;
                }
            };

            let samples = self
                .sampler
                .collect(&mut self.client, self.plan.repetitions);
            self.subject.stop_server(server);
            self.check_interrupt()?;

            reports.push(self.aggregate(value, samples));
        }
        Ok(())
    }

    fn run_fixed_server(&mut self, reports: &mut Vec<ConditionReport>) -> Result<(), HarnessError> {
        let config = self.store.load()?;
        self.subject.build_server()?;
        let server = self.subject.start_server(&config)?;

        let outcome = self.run_fixed_conditions(reports);
        self.subject.stop_server(server);
        outcome
    }

    fn run_fixed_conditions(
        &mut self,
        reports: &mut Vec<ConditionReport>,
    ) -> Result<(), HarnessError> {
        let conditions = self.plan.conditions.clone();
        for value in conditions {
            self.check_interrupt()?;
            let _span = info_span!("condition", field = %self.plan.field, value).entered();
            info!("Running condition");

            if let Err(e) = self.configure(value) {
                warn!(error = %e, "Configure failed, skipping condition");
                reports.push(ConditionReport::skipped(value, e.to_string()));
                continue;
            }

            self.subject.build_client()?;

            let samples = self
                .sampler
                .collect(&mut self.client, self.plan.repetitions);
            self.check_interrupt()?;
            reports.push(self.aggregate(value, samples));
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), HarnessError> {
        if self.interrupt.is_raised() {
            return Err(HarnessError::Interrupted);
        }
        Ok(())
    }

    fn configure(&self, value: i64) -> Result<Configuration, ConfigStoreError> {
        self.store.set_field(&self.plan.field, value)
    }

    fn aggregate(&self, value: i64, samples: SampleSet) -> ConditionReport {
        let outcome = match summarize(samples.durations(), self.plan.confidence) {
            Ok(summary) => {
                info!(
                    mean_s = summary.mean,
                    lower_s = summary.lower_bound,
                    upper_s = summary.upper_bound,
                    confidence = self.plan.confidence,
                    samples = samples.durations().len(),
                    failed = samples.failed_count(),
                    "Condition measured"
                );
                ConditionOutcome::Measured { summary }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    failed = samples.failed_count(),
                    "No data for condition"
                );
                ConditionOutcome::NoData {
                    reason: e.to_string(),
                }
            }
        };

        ConditionReport {
            value,
            outcome,
            samples: samples.durations().len(),
            flagged_samples: samples.flagged_count(),
            failed_invocations: samples.failed_count(),
            failures: samples.failures().to_vec(),
        }
    }
}
