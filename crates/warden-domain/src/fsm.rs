use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::RecoveryToken;

// ── States ───────────────────────────────────────────────────────────────────

/// Derived lifecycle state of a recovery configuration.
///
/// Transitions:
///   created --stage-->      staging      --ok--> staged
///   staged  --unstage-->    unstaging    --ok--> created
///   staged  --activate-->   activating   --ok--> active
///   active  --deactivate--> deactivating --ok--> staged
///   active  --expire-->     expired          (no transition record)
///   expired --reactivate--> created          (no transition record)
///
/// The transient forms (staging, unstaging, …) are never persisted; they are
/// inferred from the presence of an unfinished transition row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigState {
    Created,
    Staged,
    Active,
    Expired,
}

impl std::fmt::Display for ConfigState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigState::Created => "created",
            ConfigState::Staged => "staged",
            ConfigState::Active => "active",
            ConfigState::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// An operator-requested action on a recovery configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Stage,
    Unstage,
    Activate,
    Deactivate,
    Expire,
    Reactivate,
    Cancel,
}

impl Action {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "stage" => Ok(Action::Stage),
            "unstage" => Ok(Action::Unstage),
            "activate" => Ok(Action::Activate),
            "deactivate" => Ok(Action::Deactivate),
            "expire" => Ok(Action::Expire),
            "reactivate" => Ok(Action::Reactivate),
            "cancel" => Ok(Action::Cancel),
            other => Err(DomainError::UnknownAction(other.to_string())),
        }
    }

    /// The fan-out this action schedules, if it is not a trivial or meta
    /// action. `expire`, `reactivate` and `cancel` mutate rows directly and
    /// never create a transition.
    pub fn transition_name(&self) -> Option<TransitionName> {
        match self {
            Action::Stage => Some(TransitionName::Stage),
            Action::Unstage => Some(TransitionName::Unstage),
            Action::Activate => Some(TransitionName::Activate),
            Action::Deactivate => Some(TransitionName::Deactivate),
            Action::Expire | Action::Reactivate | Action::Cancel => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Stage => "stage",
            Action::Unstage => "unstage",
            Action::Activate => "activate",
            Action::Deactivate => "deactivate",
            Action::Expire => "expire",
            Action::Reactivate => "reactivate",
            Action::Cancel => "cancel",
        };
        write!(f, "{}", s)
    }
}

/// Static allow-table: which actions each state admits. `cancel` is a
/// meta-action checked against the transition table, not the state.
pub fn allowed_actions(state: ConfigState) -> &'static [Action] {
    match state {
        ConfigState::Created => &[Action::Stage],
        ConfigState::Staged => &[Action::Unstage, Action::Activate],
        ConfigState::Active => &[Action::Deactivate, Action::Expire],
        ConfigState::Expired => &[Action::Reactivate],
    }
}

// ── Transition names ─────────────────────────────────────────────────────────

/// The four fan-out operations the orchestrator executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionName {
    Stage,
    Unstage,
    Activate,
    Deactivate,
}

impl TransitionName {
    /// Whether a recovery token already sits in this transition's target
    /// state, allowing the orchestrator to skip its compute node entirely.
    pub fn satisfied_by(&self, token: &RecoveryToken) -> bool {
        match self {
            TransitionName::Stage => token.staged.is_some(),
            TransitionName::Activate => token.staged.is_some() && token.activated.is_some(),
            TransitionName::Deactivate => token.staged.is_some() && token.activated.is_none(),
            TransitionName::Unstage => token.staged.is_none(),
        }
    }
}

impl std::fmt::Display for TransitionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionName::Stage => "stage",
            TransitionName::Unstage => "unstage",
            TransitionName::Activate => "activate",
            TransitionName::Deactivate => "deactivate",
        };
        write!(f, "{}", s)
    }
}
