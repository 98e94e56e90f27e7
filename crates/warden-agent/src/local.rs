use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::agent::{NodeAgent, RecoveryTask, TaskId, TaskOutcome};
use crate::error::AgentError;

/// A stub executor that simulates node-agents locally.
///
/// - Every submit succeeds and returns a synthetic task id.
/// - Every wait completes immediately, unless the compute node has been
///   marked failing via [`fail_cn`](LocalAgent::fail_cn).
/// - Performs no I/O.
#[derive(Debug, Default)]
pub struct LocalAgent {
    failing: Mutex<HashSet<Uuid>>,
}

impl LocalAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every task for `cn_uuid` end in a failed terminal state.
    pub fn fail_cn(&self, cn_uuid: Uuid) {
        self.failing.lock().expect("lock poisoned").insert(cn_uuid);
    }

    /// Let `cn_uuid` succeed again.
    pub fn heal_cn(&self, cn_uuid: Uuid) {
        self.failing.lock().expect("lock poisoned").remove(&cn_uuid);
    }

    fn is_failing(&self, cn_uuid: Uuid) -> bool {
        self.failing.lock().expect("lock poisoned").contains(&cn_uuid)
    }
}

#[async_trait]
impl NodeAgent for LocalAgent {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, cn_uuid: Uuid, task: &RecoveryTask) -> Result<TaskId, AgentError> {
        debug!(cn_uuid = %cn_uuid, action = %task.action, "LocalAgent: submit");
        Ok(TaskId(Uuid::new_v4().to_string()))
    }

    async fn wait(
        &self,
        cn_uuid: Uuid,
        task_id: &TaskId,
        _deadline: Duration,
    ) -> Result<TaskOutcome, AgentError> {
        debug!(cn_uuid = %cn_uuid, task_id = %task_id, "LocalAgent: wait");
        if self.is_failing(cn_uuid) {
            Ok(TaskOutcome::Failed(format!("simulated failure on {}", cn_uuid)))
        } else {
            Ok(TaskOutcome::Complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::{Guid, TransitionName};

    fn task() -> RecoveryTask {
        RecoveryTask {
            action: TransitionName::Stage,
            pivtoken: Guid::parse("97496DD1C8F053DE7450CD854D9C95B4").unwrap(),
            recovery_uuid: Uuid::new_v4(),
            template: "AAAA==".into(),
            token: "00ff".into(),
        }
    }

    #[tokio::test]
    async fn healthy_cn_completes() {
        let agent = LocalAgent::new();
        let cn = Uuid::new_v4();
        let id = agent.submit(cn, &task()).await.unwrap();
        let outcome = agent.wait(cn, &id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Complete);
    }

    #[tokio::test]
    async fn failing_cn_reports_failed_outcome() {
        let agent = LocalAgent::new();
        let cn = Uuid::new_v4();
        agent.fail_cn(cn);
        let id = agent.submit(cn, &task()).await.unwrap();
        let outcome = agent.wait(cn, &id, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed(_)));

        agent.heal_cn(cn);
        let outcome = agent.wait(cn, &id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Complete);
    }
}
