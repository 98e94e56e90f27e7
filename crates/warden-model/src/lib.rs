pub mod error;
pub mod gateway;
pub mod pivtoken;
pub mod recovery_config;
pub mod recovery_token;
pub mod transition;

pub use error::ModelError;
pub use gateway::{run_action, ActionOutcome, ActionRequest};
pub use pivtoken::{CreatePivParams, PivCreateOutcome};
pub use recovery_config::ConfigCreateOutcome;
