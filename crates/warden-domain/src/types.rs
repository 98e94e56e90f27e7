use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::fsm::{ConfigState, TransitionName};
use crate::ids::{derive_uuid, Guid};

/// Current schema version stamped into every persisted row.
pub const SCHEMA_VERSION: u32 = 1;

/// Number of random bytes in a generated recovery token body.
pub const RECOVERY_TOKEN_BYTES: usize = 40;

// ── Document trait ───────────────────────────────────────────────────────────

/// A persistable row: knows its bucket and its primary key.
///
/// The store hands back a server-issued etag alongside each document; the
/// etag is never part of the document itself.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const BUCKET: &'static str;
    fn key(&self) -> String;
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ── PIV token ────────────────────────────────────────────────────────────────

/// Public keys held by a PIV token. `9e` is the authentication key and is
/// mandatory; `9a` and `9d` may be absent on partially-provisioned tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeys {
    #[serde(rename = "9a", skip_serializing_if = "Option::is_none")]
    pub key_9a: Option<String>,
    #[serde(rename = "9d", skip_serializing_if = "Option::is_none")]
    pub key_9d: Option<String>,
    #[serde(rename = "9e")]
    pub key_9e: String,
}

/// Optional attestation certificates, one per key slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(rename = "9a", skip_serializing_if = "Option::is_none")]
    pub cert_9a: Option<String>,
    #[serde(rename = "9d", skip_serializing_if = "Option::is_none")]
    pub cert_9d: Option<String>,
    #[serde(rename = "9e", skip_serializing_if = "Option::is_none")]
    pub cert_9e: Option<String>,
}

/// One hardware token on one compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivToken {
    pub v: u32,
    pub guid: Guid,
    pub cn_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub pubkeys: PubKeys,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    pub pin: String,
    pub created: DateTime<Utc>,
}

impl Document for PivToken {
    const BUCKET: &'static str = "pivtokens";
    fn key(&self) -> String {
        self.guid.as_str().to_string()
    }
}

// ── Recovery token ───────────────────────────────────────────────────────────

/// One shared secret in the per-PIV chain, tied to a recovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub v: u32,
    pub uuid: Uuid,
    pub pivtoken: Guid,
    pub recovery_configuration: Uuid,
    /// Token body, stored hex.
    pub token: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<DateTime<Utc>>,
}

impl RecoveryToken {
    /// Generate a fresh token for (pivtoken, configuration).
    ///
    /// The body is 40 uniformly random bytes; the uuid is derived by hashing
    /// the body, so identity is stable across re-serialization. `staged` and
    /// `activated` are copied from the configuration's current state: a token
    /// minted under an already-active configuration is itself born active.
    pub fn generate(pivtoken: Guid, config: &RecoveryConfiguration, now: DateTime<Utc>) -> Self {
        let mut body = [0u8; RECOVERY_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut body);
        RecoveryToken {
            v: SCHEMA_VERSION,
            uuid: derive_uuid(&body),
            pivtoken,
            recovery_configuration: config.uuid,
            token: hex::encode(body),
            created: now,
            staged: config.staged.map(|_| now),
            activated: config.activated.map(|_| now),
            expired: None,
        }
    }

    /// Decode the hex body back into key material.
    pub fn token_bytes(&self) -> Result<Vec<u8>, DomainError> {
        hex::decode(&self.token).map_err(|e| DomainError::InvalidTokenBody(e.to_string()))
    }

    pub fn is_expired(&self) -> bool {
        self.expired.is_some()
    }

    /// Staged and not yet superseded.
    pub fn is_staged(&self) -> bool {
        self.staged.is_some() && self.expired.is_none()
    }

    /// Activated and not yet superseded.
    pub fn is_active(&self) -> bool {
        self.activated.is_some() && self.expired.is_none()
    }

    /// Neither staged nor activated nor expired: a freshly minted token the
    /// fleet has not picked up yet.
    pub fn is_untouched(&self) -> bool {
        self.staged.is_none() && self.activated.is_none() && self.expired.is_none()
    }
}

impl Document for RecoveryToken {
    const BUCKET: &'static str = "recovery_tokens";
    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

// ── Recovery configuration ───────────────────────────────────────────────────

/// A fleet-wide eBox template. Identity is the hash of the template, so
/// posting the same template twice converges on one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfiguration {
    pub v: u32,
    pub uuid: Uuid,
    /// Base64 blob; newlines are stripped on ingress.
    pub template: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<DateTime<Utc>>,
}

impl RecoveryConfiguration {
    /// Build a configuration from a raw template blob.
    ///
    /// Newlines are stripped before hashing so that the uuid does not depend
    /// on how the template was wrapped in transit.
    pub fn from_template(raw: &str, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let template: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        if template.is_empty() {
            return Err(DomainError::InvalidTemplate("empty template".into()));
        }
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(template.as_bytes())
            .map_err(|e| DomainError::InvalidTemplate(e.to_string()))?;
        Ok(RecoveryConfiguration {
            v: SCHEMA_VERSION,
            uuid: derive_uuid(template.as_bytes()),
            template,
            created: now,
            staged: None,
            activated: None,
            expired: None,
        })
    }

    /// Lifecycle state derived from the timestamp fields. There is no stored
    /// state column; the timestamps are the single source of truth.
    pub fn state(&self) -> ConfigState {
        if self.expired.is_some() {
            ConfigState::Expired
        } else if self.activated.is_some() {
            ConfigState::Active
        } else if self.staged.is_some() {
            ConfigState::Staged
        } else {
            ConfigState::Created
        }
    }
}

impl Document for RecoveryConfiguration {
    const BUCKET: &'static str = "recovery_configurations";
    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

// ── Transition ───────────────────────────────────────────────────────────────

/// A structured per-target failure recorded during a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetError {
    pub cn_uuid: Uuid,
    pub message: String,
}

/// Durable record of one fan-out driving a configuration between states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub v: u32,
    pub uuid: Uuid,
    pub recovery_config_uuid: Uuid,
    pub name: TransitionName,
    /// Compute nodes this transition must reach, in order.
    pub targets: Vec<Uuid>,
    /// Subset of `targets` already processed (successfully or not; `errs`
    /// is the source of truth for failure).
    pub completed: Vec<Uuid>,
    /// External task ids issued by the node-agent, one per dispatched target.
    pub taskids: Vec<String>,
    pub errs: Vec<TargetError>,
    pub concurrency: u32,
    /// Do not advance the configuration when this transition completes.
    pub standalone: bool,
    /// Activation was forced despite incomplete staging.
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<Uuid>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub aborted: bool,
}

impl Transition {
    pub fn new(
        config: &RecoveryConfiguration,
        name: TransitionName,
        targets: Vec<Uuid>,
        concurrency: u32,
        standalone: bool,
        forced: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Transition {
            v: SCHEMA_VERSION,
            uuid: Uuid::new_v4(),
            recovery_config_uuid: config.uuid,
            name,
            targets,
            completed: Vec::new(),
            taskids: Vec::new(),
            errs: Vec::new(),
            concurrency,
            standalone,
            forced,
            locked_by: None,
            created: now,
            started: None,
            finished: None,
            aborted: false,
        }
    }

    /// Still running or waiting to run.
    pub fn is_unfinished(&self) -> bool {
        self.finished.is_none() && !self.aborted
    }

    /// Targets not yet processed.
    pub fn pending(&self) -> Vec<Uuid> {
        self.targets
            .iter()
            .filter(|t| !self.completed.contains(t))
            .copied()
            .collect()
    }

    /// True when every dispatched target succeeded.
    pub fn succeeded(&self) -> bool {
        self.errs.iter().all(|e| e.message.is_empty())
    }
}

impl Document for Transition {
    const BUCKET: &'static str = "recovery_configuration_transitions";
    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

// ── PIV token history ────────────────────────────────────────────────────────

/// Append-only snapshot taken when a PIV token is deleted. `active_start`
/// and `active_end` bound the interval the token was live, for retention
/// queries and accidental-delete recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivTokenHistory {
    pub v: u32,
    pub uuid: Uuid,
    pub guid: Guid,
    pub token: PivToken,
    pub active_start: DateTime<Utc>,
    pub active_end: DateTime<Utc>,
}

impl PivTokenHistory {
    pub fn archive(token: PivToken, now: DateTime<Utc>) -> Self {
        PivTokenHistory {
            v: SCHEMA_VERSION,
            uuid: Uuid::new_v4(),
            guid: token.guid.clone(),
            active_start: token.created,
            active_end: now,
            token,
        }
    }
}

impl Document for PivTokenHistory {
    const BUCKET: &'static str = "pivtoken_history";
    fn key(&self) -> String {
        self.uuid.to_string()
    }
}
