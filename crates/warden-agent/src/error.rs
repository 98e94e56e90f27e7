use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("task submit failed: {0}")]
    SubmitFailed(String),

    #[error("task {task_id} did not finish within {seconds}s")]
    DeadlineExceeded { task_id: String, seconds: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected agent response: {0}")]
    BadResponse(String),
}
