//! Per-phase step accounting.

use std::collections::BTreeMap;

use serde::Serialize;

use super::txn::DrainSummary;

/// Which half of the script a step belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Seed,
    Migration,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Seed => f.write_str("seed"),
            Phase::Migration => f.write_str("migration"),
        }
    }
}

/// How a single step ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Every command of the step succeeded.
    Ok,
    /// At least one command reported a server-side failure.
    Failed,
    /// Nothing was eligible or the step carried no statements.
    Skipped,
    Started,
    Prepared,
    Committed,
    Aborted,
    Pending,
    /// A fault was forwarded to the cluster.
    Injected,
}

/// One executed step, as reported to a `StatsSink`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepEvent {
    pub command_index: usize,
    pub step: &'static str,
    pub outcome: EventOutcome,
}

/// Receives step events and drain summaries for each phase.
pub trait StatsSink: Send {
    fn record_seed(&mut self, event: &StepEvent);

    fn record_migration_event(&mut self, event: &StepEvent);

    fn record_drain(&mut self, _phase: Phase, _summary: &DrainSummary) {}
}

/// Step and outcome counts for one phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub steps: u64,
    pub by_step: BTreeMap<&'static str, u64>,
    pub by_outcome: BTreeMap<EventOutcome, u64>,
    pub drained: DrainSummary,
}

impl PhaseStats {
    pub fn record(&mut self, event: &StepEvent) {
        self.steps += 1;
        *self.by_step.entry(event.step).or_default() += 1;
        *self.by_outcome.entry(event.outcome).or_default() += 1;
    }

    pub fn outcome_count(&self, outcome: EventOutcome) -> u64 {
        self.by_outcome.get(&outcome).copied().unwrap_or(0)
    }
}

/// Seed and migration statistics of one script run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub seed: PhaseStats,
    pub migration: PhaseStats,
}

impl StatsSink for RunStats {
    fn record_seed(&mut self, event: &StepEvent) {
        self.seed.record(event);
    }

    fn record_migration_event(&mut self, event: &StepEvent) {
        self.migration.record(event);
    }

    fn record_drain(&mut self, phase: Phase, summary: &DrainSummary) {
        match phase {
            Phase::Seed => self.seed.drained = *summary,
            Phase::Migration => self.migration.drained = *summary,
        }
    }
}
