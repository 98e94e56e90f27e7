pub mod error;
pub mod pruner;
pub mod worker;

pub use error::TransitionerError;
pub use worker::Transitioner;
