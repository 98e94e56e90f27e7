pub mod agent;
pub mod error;
pub mod http;
pub mod local;

pub use agent::{NodeAgent, RecoveryTask, TaskId, TaskOutcome};
pub use error::AgentError;
pub use http::HttpAgent;
pub use local::LocalAgent;
