//! Where prepared forward jobs go.

use async_trait::async_trait;

use super::forwarder::Forwarder;
use super::types::ForwardJob;

#[async_trait]
pub trait ForwardSink: Send + Sync {
    /// Hand a job off for delivery. May wait for delivery capacity but never
    /// for the job's own outcome.
    async fn submit(&self, job: ForwardJob) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// Delivers in-process: one spawned task per job, at most
/// `max_concurrency` of them alive at once.
#[derive(Clone)]
pub struct DirectSink {
    forwarder: Forwarder,
}

impl DirectSink {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl ForwardSink for DirectSink {
    async fn submit(&self, job: ForwardJob) -> anyhow::Result<()> {
        // Held until the spawned delivery finishes, so a slow fan-out backs
        // up into the dispatch queue instead of piling up tasks.
        let permit = self.forwarder.reserve().await;
        let forwarder = self.forwarder.clone();
        tokio::spawn(async move {
            // Outcome is logged by the forwarder.
            let _ = forwarder.deliver_reserved(&job, permit).await;
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
