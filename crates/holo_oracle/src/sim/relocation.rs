use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use super::cluster::Shared;
use crate::oracle::{ClusterTime, Relocation};

/// When the simulated relocation captures its consistent snapshot.
///
/// With neither knob set the boundary is captured when it is first awaited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelocationOptions {
    /// Capture after this many routed commands once started.
    pub capture_after_ops: Option<u64>,
    /// Capture this long after `start`, from a background task.
    pub capture_delay: Option<Duration>,
}

/// Background relocation of a `SimCluster`.
///
/// Awaiting the boundary also completes the relocation: ownership rotates to
/// new shards, which may lose pre-boundary retry history.
pub struct SimRelocation {
    shared: Arc<Shared>,
    options: RelocationOptions,
}

impl SimRelocation {
    pub(super) fn new(shared: Arc<Shared>, options: RelocationOptions) -> Self {
        Self { shared, options }
    }
}

#[async_trait]
impl Relocation for SimRelocation {
    async fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state();
            anyhow::ensure!(!state.relocation.started, "relocation already started");
            state.relocation.started = true;
            state.relocation.capture_after_ops = self.options.capture_after_ops;
        }
        if self.options.capture_after_ops == Some(0) {
            self.shared.capture_boundary();
        }
        if let Some(delay) = self.options.capture_delay {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let boundary = shared.capture_boundary();
                tracing::debug!(boundary = %boundary, "sim relocation captured boundary");
            });
        }
        tracing::info!(
            capture_after_ops = ?self.options.capture_after_ops,
            capture_delay = ?self.options.capture_delay,
            "sim relocation started"
        );
        Ok(())
    }

    async fn await_boundary_clock(&self) -> anyhow::Result<ClusterTime> {
        anyhow::ensure!(
            self.shared.state().relocation.started,
            "relocation was never started"
        );
        if self.options.capture_delay.is_some() {
            let mut rx = self.shared.boundary_tx.subscribe();
            rx.wait_for(Option::is_some)
                .await
                .context("relocation stopped before capturing its boundary")?;
        }
        let boundary = self.shared.capture_boundary();
        self.shared.state().complete_relocation();
        Ok(boundary)
    }
}
