//! Tunables for one oracle run.

use anyhow::{Context, Result};

use super::types::Namespace;

/// Resolution mix used when draining transactions at a phase boundary.
///
/// The constants only diversify outcomes; correctness requires just that every
/// transaction ends up terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Prepare every `prepare_every`-th preparable transaction before resolving.
    pub prepare_every: usize,
    /// Commit every `commit_every`-th undecided transaction; abort the rest.
    pub commit_every: usize,
    /// Resolution attempts per transaction before the drain gives up.
    pub max_attempts: usize,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            prepare_every: 3,
            commit_every: 2,
            max_attempts: 3,
        }
    }
}

/// Tunables shared by the state machine, the retry oracle and the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OracleConfig {
    /// Skip post-boundary find-and-modify replays during verification.
    pub relax_find_and_modify: bool,
    /// Failover/rollback replay mode: track majority-committed snapshots and
    /// only commit prepared transactions whose baseline was prepared.
    pub failover_replay: bool,
    pub drain: DrainPolicy,
    /// Pre-sharded collection read by forced-abort recovery.
    pub scratch_namespace: Namespace,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            relax_find_and_modify: false,
            failover_replay: false,
            drain: DrainPolicy::default(),
            scratch_namespace: Namespace::new("oracle", "scratch"),
        }
    }
}

impl OracleConfig {
    /// Load overrides from `HOLO_ORACLE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let relax_find_and_modify = parse_bool(
            std::env::var("HOLO_ORACLE_RELAX_FIND_AND_MODIFY").ok(),
            defaults.relax_find_and_modify,
        )?;
        let failover_replay = parse_bool(
            std::env::var("HOLO_ORACLE_FAILOVER_REPLAY").ok(),
            defaults.failover_replay,
        )?;
        let prepare_every = parse_usize(
            std::env::var("HOLO_ORACLE_DRAIN_PREPARE_EVERY").ok(),
            defaults.drain.prepare_every,
        )?
        .max(1);
        let commit_every = parse_usize(
            std::env::var("HOLO_ORACLE_DRAIN_COMMIT_EVERY").ok(),
            defaults.drain.commit_every,
        )?
        .max(1);
        let max_attempts = parse_usize(
            std::env::var("HOLO_ORACLE_DRAIN_MAX_ATTEMPTS").ok(),
            defaults.drain.max_attempts,
        )?
        .max(1);
        let scratch_namespace = match std::env::var("HOLO_ORACLE_SCRATCH_NAMESPACE").ok() {
            Some(raw) => Namespace::parse(&raw)
                .with_context(|| format!("invalid scratch namespace: {raw}"))?,
            None => defaults.scratch_namespace,
        };

        Ok(Self {
            relax_find_and_modify,
            failover_replay,
            drain: DrainPolicy {
                prepare_every,
                commit_every,
                max_attempts,
            },
            scratch_namespace,
        })
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => raw
            .parse::<bool>()
            .with_context(|| format!("invalid bool value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_helpers_fall_back_and_reject_garbage() {
        assert!(parse_bool(None, true).expect("default"));
        assert!(!parse_bool(Some("false".to_string()), true).expect("parsed"));
        assert!(parse_bool(Some("yes".to_string()), true).is_err());
        assert_eq!(parse_usize(Some("7".to_string()), 3).expect("parsed"), 7);
        assert!(parse_usize(Some("-1".to_string()), 3).is_err());
    }

    #[test]
    fn default_drain_policy_mixes_outcomes() {
        let policy = DrainPolicy::default();
        assert_eq!(policy.prepare_every, 3);
        assert_eq!(policy.commit_every, 2);
        assert!(policy.max_attempts >= 1);
    }
}
