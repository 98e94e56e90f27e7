use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{NodeAgent, RecoveryTask, TaskId, TaskOutcome};
use crate::error::AgentError;

/// How often [`HttpAgent::wait`] polls for a terminal state.
const POLL_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// Production executor: talks to the per-node agent endpoints over HTTP.
///
/// `POST {base}/cn/{cn_uuid}/recovery-tasks` submits a task and returns its
/// id; `GET {base}/cn/{cn_uuid}/recovery-tasks/{id}` reports `running`,
/// `complete`, or a failure status.
pub struct HttpAgent {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn task_url(&self, cn_uuid: Uuid, task_id: Option<&TaskId>) -> String {
        match task_id {
            Some(id) => format!("{}/cn/{}/recovery-tasks/{}", self.base_url, cn_uuid, id),
            None => format!("{}/cn/{}/recovery-tasks", self.base_url, cn_uuid),
        }
    }
}

#[async_trait]
impl NodeAgent for HttpAgent {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn submit(&self, cn_uuid: Uuid, task: &RecoveryTask) -> Result<TaskId, AgentError> {
        debug!(cn_uuid = %cn_uuid, action = %task.action, "HttpAgent: submit");
        let resp = self
            .client
            .post(self.task_url(cn_uuid, None))
            .json(task)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AgentError::SubmitFailed(format!(
                "node-agent returned {}",
                resp.status()
            )));
        }
        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::BadResponse(e.to_string()))?;
        Ok(TaskId(body.id))
    }

    async fn wait(
        &self,
        cn_uuid: Uuid,
        task_id: &TaskId,
        deadline: Duration,
    ) -> Result<TaskOutcome, AgentError> {
        let give_up = tokio::time::Instant::now() + deadline;
        loop {
            let resp = self
                .client
                .get(self.task_url(cn_uuid, Some(task_id)))
                .send()
                .await
                .map_err(|e| AgentError::Transport(e.to_string()))?;

            if resp.status().is_success() {
                let status: TaskStatus = resp
                    .json()
                    .await
                    .map_err(|e| AgentError::BadResponse(e.to_string()))?;
                match status.status.as_str() {
                    "complete" => return Ok(TaskOutcome::Complete),
                    "running" | "queued" => {}
                    terminal => {
                        return Ok(TaskOutcome::Failed(
                            status
                                .message
                                .unwrap_or_else(|| format!("task ended '{}'", terminal)),
                        ));
                    }
                }
            } else {
                // Transient poll failure: keep trying until the deadline.
                warn!(cn_uuid = %cn_uuid, task_id = %task_id, status = %resp.status(), "task poll failed");
            }

            if tokio::time::Instant::now() + POLL_EVERY >= give_up {
                return Err(AgentError::DeadlineExceeded {
                    task_id: task_id.to_string(),
                    seconds: deadline.as_secs(),
                });
            }
            tokio::time::sleep(POLL_EVERY).await;
        }
    }
}
