use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_domain::{Guid, TransitionName};

use crate::error::AgentError;

/// Payload of one per-node recovery-configuration task. This is everything
/// the on-node agent needs to write (or remove) key material for one
/// (PIV token, configuration) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTask {
    pub action: TransitionName,
    pub pivtoken: Guid,
    pub recovery_uuid: Uuid,
    pub template: String,
    /// Hex recovery-token body for this node.
    pub token: String,
}

/// Opaque task id issued by the executor on submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Complete,
    /// Any non-complete terminal state, with the executor's message.
    Failed(String),
}

/// The external RPC executor running on each compute node, modelled as a
/// submit + wait-for-completion interface. Implementations must be safe to
/// call concurrently; the orchestrator fans out one batch at a time.
#[async_trait]
pub trait NodeAgent: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Submit a task to the node-agent of `cn_uuid`. Returns its task id.
    async fn submit(&self, cn_uuid: Uuid, task: &RecoveryTask) -> Result<TaskId, AgentError>;

    /// Wait for a previously submitted task to reach a terminal state,
    /// giving up after `deadline`.
    async fn wait(
        &self,
        cn_uuid: Uuid,
        task_id: &TaskId,
        deadline: Duration,
    ) -> Result<TaskOutcome, AgentError>;
}
