pub mod error;
pub mod fsm;
pub mod ids;
pub mod types;
pub mod validate;

pub use error::DomainError;
pub use fsm::{allowed_actions, Action, ConfigState, TransitionName};
pub use ids::{derive_uuid, Guid};
pub use types::{
    Attestation, Document, PivToken, PivTokenHistory, PubKeys, RecoveryConfiguration,
    RecoveryToken, TargetError, Transition, RECOVERY_TOKEN_BYTES, SCHEMA_VERSION,
};
pub use validate::{validate, Check, FieldError, Schema};
