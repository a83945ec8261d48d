//! In-process notifications emitted when the cascade resolves an issue.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueResolved {
    pub organization_id: i64,
    pub project_id: i64,
    pub group_id: i64,
    pub release_id: i64,
    pub actor_id: Option<i64>,
    pub resolution_type: &'static str,
}

impl IssueResolved {
    pub const WITH_COMMIT: &'static str = "with_commit";
}

#[async_trait]
pub trait ResolutionListener: Send + Sync {
    async fn on_issue_resolved(&self, event: &IssueResolved) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct SignalBus {
    listeners: Vec<Arc<dyn ResolutionListener>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn ResolutionListener>) {
        self.listeners.push(listener);
    }

    /// Delivers to every listener. Failures are logged and counted, never
    /// propagated.
    pub async fn send_robust(&self, event: &IssueResolved) -> usize {
        let mut failures = 0;
        for listener in &self.listeners {
            if let Err(e) = listener.on_issue_resolved(event).await {
                failures += 1;
                tracing::error!(
                    group_id = event.group_id,
                    release_id = event.release_id,
                    error = %e,
                    "Issue resolution listener failed"
                );
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<i64>>);

    #[async_trait]
    impl ResolutionListener for Recorder {
        async fn on_issue_resolved(&self, event: &IssueResolved) -> anyhow::Result<()> {
            self.0.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.push(event.group_id);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ResolutionListener for Failing {
        async fn on_issue_resolved(&self, _event: &IssueResolved) -> anyhow::Result<()> {
            anyhow::bail!("listener down")
        }
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let recorder = Arc::new(Recorder::default());
        let mut bus = SignalBus::new();
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(recorder.clone());

        let event = IssueResolved {
            organization_id: 1,
            project_id: 2,
            group_id: 3,
            release_id: 4,
            actor_id: None,
            resolution_type: IssueResolved::WITH_COMMIT,
        };
        assert_eq!(bus.send_robust(&event).await, 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec![3]);
    }
}
