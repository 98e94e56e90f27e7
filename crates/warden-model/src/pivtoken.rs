use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;
use warden_domain::{
    Attestation, Document, Guid, PivToken, PivTokenHistory, PubKeys, RecoveryConfiguration,
    RecoveryToken, SCHEMA_VERSION,
};
use warden_store::{
    fetch, put_op, query, BatchOp, Filter, ListQuery, Sort, Store, Stored,
};

use crate::error::ModelError;
use crate::recovery_config::{active_config, get_config};
use crate::recovery_token::{create_token, list_for_piv, newest_active};

/// Validated body of a create / replace request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePivParams {
    pub guid: Guid,
    pub cn_uuid: Uuid,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub pubkeys: PubKeys,
    #[serde(default)]
    pub attestation: Option<Attestation>,
    pub pin: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recovery_configuration: Option<Uuid>,
}

impl CreatePivParams {
    fn into_token(self, now: DateTime<Utc>) -> PivToken {
        PivToken {
            v: SCHEMA_VERSION,
            guid: self.guid,
            cn_uuid: self.cn_uuid,
            serial: self.serial,
            model: self.model,
            pubkeys: self.pubkeys,
            attestation: self.attestation,
            pin: self.pin,
            created: self.created.unwrap_or(now),
        }
    }
}

/// Result of a create request against `POST /pivtokens`.
#[derive(Debug)]
pub enum PivCreateOutcome {
    /// First-time provisioning: 201.
    Created { piv: PivToken, tokens: Vec<RecoveryToken> },
    /// Re-create within `recovery_token_duration` of the newest token: the
    /// chain is untouched, 200.
    Unchanged { piv: PivToken, tokens: Vec<RecoveryToken> },
    /// Re-create after the window (or against another configuration): a new
    /// token was appended to the chain, 200.
    Refreshed { piv: PivToken, tokens: Vec<RecoveryToken> },
}

/// Resolve the configuration a new recovery token must bind to: the one the
/// caller names, or the unique active one. A PIV token cannot exist without
/// an active recovery configuration.
async fn resolve_config(
    store: &dyn Store,
    requested: Option<Uuid>,
) -> Result<Stored<RecoveryConfiguration>, ModelError> {
    match requested {
        Some(uuid) => get_config(store, uuid).await,
        None => active_config(store)
            .await?
            .ok_or_else(|| ModelError::MissingParameter("recovery_configuration".into())),
    }
}

async fn chain(store: &dyn Store, guid: &Guid) -> Result<Vec<RecoveryToken>, ModelError> {
    Ok(list_for_piv(store, guid).await?.into_iter().map(|s| s.doc).collect())
}

/// Create a PIV token, or refresh an existing one.
///
/// First-time create writes the token row and its first recovery token in
/// one batch. A repeated create inside the refresh window is a no-op; past
/// the window it appends a fresh recovery token to the chain.
pub async fn create_piv(
    store: &dyn Store,
    params: CreatePivParams,
    recovery_token_duration_secs: i64,
    now: DateTime<Utc>,
) -> Result<PivCreateOutcome, ModelError> {
    let config = resolve_config(store, params.recovery_configuration).await?;

    if let Some(existing) = fetch::<PivToken>(store, params.guid.as_str()).await? {
        let newest = newest_active(store, &existing.doc.guid).await?;
        let fresh_enough = newest.as_ref().map_or(false, |t| {
            now - t.doc.created < Duration::seconds(recovery_token_duration_secs)
                && t.doc.recovery_configuration == config.doc.uuid
        });
        if fresh_enough {
            let tokens = chain(store, &existing.doc.guid).await?;
            return Ok(PivCreateOutcome::Unchanged { piv: existing.doc, tokens });
        }
        create_token(store, &existing.doc, &config.doc, now).await?;
        info!(guid = %existing.doc.guid, "recovery token chain refreshed");
        let tokens = chain(store, &existing.doc.guid).await?;
        return Ok(PivCreateOutcome::Refreshed { piv: existing.doc, tokens });
    }

    let piv = params.into_token(now);
    let token = RecoveryToken::generate(piv.guid.clone(), &config.doc, now);
    store
        .batch(vec![put_op(&piv, None)?, put_op(&token, None)?])
        .await?;
    info!(guid = %piv.guid, cn_uuid = %piv.cn_uuid, "pivtoken created");
    Ok(PivCreateOutcome::Created { piv, tokens: vec![token] })
}

pub async fn get_piv(store: &dyn Store, guid: &Guid) -> Result<Stored<PivToken>, ModelError> {
    fetch(store, guid.as_str())
        .await?
        .ok_or_else(|| ModelError::NotFound(format!("pivtoken {}", guid)))
}

/// A token with its full recovery-token chain, oldest first.
pub async fn get_piv_with_tokens(
    store: &dyn Store,
    guid: &Guid,
) -> Result<(Stored<PivToken>, Vec<RecoveryToken>), ModelError> {
    let piv = get_piv(store, guid).await?;
    let tokens = chain(store, guid).await?;
    Ok((piv, tokens))
}

pub async fn list_pivs(
    store: &dyn Store,
    limit: Option<u64>,
    offset: u64,
) -> Result<Vec<Stored<PivToken>>, ModelError> {
    Ok(query(
        store,
        ListQuery { filter: Filter::True, sort: Some(Sort::asc("guid")), limit, offset },
    )
    .await?)
}

/// Tokens whose compute node is in the given set.
pub async fn list_by_cn(
    store: &dyn Store,
    cn_uuids: &[Uuid],
) -> Result<Vec<Stored<PivToken>>, ModelError> {
    let values = cn_uuids.iter().map(|u| Value::from(u.to_string())).collect();
    Ok(query(
        store,
        ListQuery::sorted(Filter::is_in("cn_uuid", values), Sort::asc("guid")),
    )
    .await?)
}

/// Apply a partial update. Only `cn_uuid` is mutable (chassis swap);
/// anything else in the body is an invalid update.
pub async fn update_piv(
    store: &dyn Store,
    guid: &Guid,
    changes: &Map<String, Value>,
) -> Result<PivToken, ModelError> {
    for field in changes.keys() {
        if field != "cn_uuid" {
            return Err(ModelError::InvalidUpdate(field.clone()));
        }
    }
    let cn_uuid = changes
        .get("cn_uuid")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ModelError::invalid("cn_uuid", "must be a UUID"))?;

    let stored = get_piv(store, guid).await?;
    let mut updated = stored.doc.clone();
    updated.cn_uuid = cn_uuid;
    warden_store::update(store, &updated, &stored.etag).await?;
    Ok(updated)
}

/// Delete a token: archive it into history, remove the row, and drop every
/// recovery token it owned, all in one batch.
pub async fn delete_piv(
    store: &dyn Store,
    guid: &Guid,
    now: DateTime<Utc>,
) -> Result<(), ModelError> {
    let stored = get_piv(store, guid).await?;
    let history = PivTokenHistory::archive(stored.doc.clone(), now);
    store
        .batch(vec![
            put_op(&history, None)?,
            warden_store::delete_op(&stored.doc, Some(stored.etag.clone())),
            BatchOp::DeleteMany {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: Filter::eq("pivtoken", guid.as_str()),
            },
        ])
        .await?;
    info!(guid = %guid, "pivtoken deleted and archived");
    Ok(())
}

/// Atomic replacement after a physical token swap: the old token is
/// archived and removed, the new one created with a fresh recovery token,
/// all in a single batch. The caller has already proven possession of the
/// old token's recovery token (HMAC).
pub async fn replace_piv(
    store: &dyn Store,
    replaced_guid: &Guid,
    params: CreatePivParams,
    now: DateTime<Utc>,
) -> Result<(PivToken, RecoveryToken), ModelError> {
    let old = get_piv(store, replaced_guid).await?;
    if fetch::<PivToken>(store, params.guid.as_str()).await?.is_some() {
        return Err(ModelError::invalid("guid", "replacement token already exists"));
    }
    let config = resolve_config(store, params.recovery_configuration).await?;

    let piv = params.into_token(now);
    let token = RecoveryToken::generate(piv.guid.clone(), &config.doc, now);
    let history = PivTokenHistory::archive(old.doc.clone(), now);

    store
        .batch(vec![
            put_op(&history, None)?,
            warden_store::delete_op(&old.doc, Some(old.etag.clone())),
            BatchOp::DeleteMany {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: Filter::eq("pivtoken", replaced_guid.as_str()),
            },
            put_op(&piv, None)?,
            put_op(&token, None)?,
        ])
        .await?;
    info!(old = %replaced_guid, new = %piv.guid, "pivtoken replaced");
    Ok((piv, token))
}
