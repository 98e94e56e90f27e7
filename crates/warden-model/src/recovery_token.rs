use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use warden_domain::{Document, Guid, PivToken, RecoveryConfiguration, RecoveryToken};
use warden_store::{fetch, put_op, query, BatchOp, Filter, ListQuery, Sort, Store, Stored};

use crate::error::ModelError;

fn by_piv(guid: &Guid) -> Filter {
    Filter::eq("pivtoken", guid.as_str())
}

/// All recovery tokens of one PIV token, oldest first.
pub async fn list_for_piv(
    store: &dyn Store,
    guid: &Guid,
) -> Result<Vec<Stored<RecoveryToken>>, ModelError> {
    Ok(query(store, ListQuery::sorted(by_piv(guid), Sort::asc("created"))).await?)
}

/// All recovery tokens referencing one configuration.
pub async fn list_for_config(
    store: &dyn Store,
    config_uuid: uuid::Uuid,
) -> Result<Vec<Stored<RecoveryToken>>, ModelError> {
    Ok(query(
        store,
        ListQuery::sorted(
            Filter::eq("recovery_configuration", config_uuid.to_string()),
            Sort::asc("created"),
        ),
    )
    .await?)
}

/// The newest not-yet-expired token of a PIV token, selected strictly by
/// `created` ordering. This is the HMAC key for token replacement; picking
/// by storage position instead would let a stale token authenticate.
pub async fn newest_active(
    store: &dyn Store,
    guid: &Guid,
) -> Result<Option<Stored<RecoveryToken>>, ModelError> {
    let rows = query::<RecoveryToken>(
        store,
        ListQuery::sorted(
            Filter::and(vec![by_piv(guid), Filter::absent("expired")]),
            Sort::asc("created"),
        ),
    )
    .await?;
    Ok(rows.into_iter().last())
}

pub async fn get(
    store: &dyn Store,
    uuid: uuid::Uuid,
) -> Result<Stored<RecoveryToken>, ModelError> {
    fetch(store, &uuid.to_string())
        .await?
        .ok_or_else(|| ModelError::NotFound(format!("recovery token {}", uuid)))
}

/// Mint a new token for (PIV, configuration) and persist it.
///
/// A previous token that was never staged, activated, or expired is
/// superseded in the same batch, keeping the per-PIV chain free of dead
/// heads.
pub async fn create_token(
    store: &dyn Store,
    piv: &PivToken,
    config: &RecoveryConfiguration,
    now: DateTime<Utc>,
) -> Result<RecoveryToken, ModelError> {
    let token = RecoveryToken::generate(piv.guid.clone(), config, now);
    let mut set = BTreeMap::new();
    set.insert("expired".to_string(), Some(json!(now)));
    store
        .batch(vec![
            BatchOp::Update {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: Filter::and(vec![
                    by_piv(&piv.guid),
                    Filter::absent("staged"),
                    Filter::absent("activated"),
                    Filter::absent("expired"),
                ]),
                set,
            },
            put_op(&token, None)?,
        ])
        .await?;
    Ok(token)
}

/// Siblings of `token` within the same PIV matching `filter`, read with
/// their etags so state changes can be CAS-guarded.
async fn siblings(
    store: &dyn Store,
    token: &RecoveryToken,
    filter: Filter,
) -> Result<Vec<Stored<RecoveryToken>>, ModelError> {
    let rows = query::<RecoveryToken>(
        store,
        ListQuery::filtered(Filter::and(vec![by_piv(&token.pivtoken), filter])),
    )
    .await?;
    Ok(rows.into_iter().filter(|s| s.doc.uuid != token.uuid).collect())
}

/// Stage a token. Any sibling that is staged-but-not-activated is expired in
/// the same batch (invariant: at most one staged, unexpired token per PIV and
/// configuration).
pub async fn stage(
    store: &dyn Store,
    stored: &Stored<RecoveryToken>,
    now: DateTime<Utc>,
) -> Result<RecoveryToken, ModelError> {
    let displaced = siblings(
        store,
        &stored.doc,
        Filter::and(vec![
            Filter::present("staged"),
            Filter::absent("activated"),
            Filter::absent("expired"),
        ]),
    )
    .await?;

    let mut updated = stored.doc.clone();
    updated.staged = Some(now);

    let mut ops = vec![put_op(&updated, Some(stored.etag.clone()))?];
    for sib in displaced {
        let mut expired = sib.doc.clone();
        expired.expired = Some(now);
        ops.push(put_op(&expired, Some(sib.etag.clone()))?);
    }
    store.batch(ops).await?;
    Ok(updated)
}

/// Activate a token. Any currently active sibling is expired in the same
/// batch (invariant: at most one activated, unexpired token per PIV and
/// configuration).
pub async fn activate(
    store: &dyn Store,
    stored: &Stored<RecoveryToken>,
    now: DateTime<Utc>,
) -> Result<RecoveryToken, ModelError> {
    let displaced = siblings(
        store,
        &stored.doc,
        Filter::and(vec![Filter::present("activated"), Filter::absent("expired")]),
    )
    .await?;

    let mut updated = stored.doc.clone();
    if updated.staged.is_none() {
        updated.staged = Some(now);
    }
    updated.activated = Some(now);

    let mut ops = vec![put_op(&updated, Some(stored.etag.clone()))?];
    for sib in displaced {
        let mut expired = sib.doc.clone();
        expired.expired = Some(now);
        ops.push(put_op(&expired, Some(sib.etag.clone()))?);
    }
    store.batch(ops).await?;
    Ok(updated)
}

/// Drop a token back from active to staged.
pub async fn deactivate(
    store: &dyn Store,
    stored: &Stored<RecoveryToken>,
) -> Result<RecoveryToken, ModelError> {
    let mut updated = stored.doc.clone();
    updated.activated = None;
    warden_store::update(store, &updated, &stored.etag).await?;
    Ok(updated)
}

/// Drop a token back from staged to untouched.
pub async fn unstage(
    store: &dyn Store,
    stored: &Stored<RecoveryToken>,
) -> Result<RecoveryToken, ModelError> {
    let mut updated = stored.doc.clone();
    updated.staged = None;
    warden_store::update(store, &updated, &stored.etag).await?;
    Ok(updated)
}

/// Mark a token expired.
pub async fn expire(
    store: &dyn Store,
    stored: &Stored<RecoveryToken>,
    now: DateTime<Utc>,
) -> Result<RecoveryToken, ModelError> {
    let mut updated = stored.doc.clone();
    updated.expired = Some(now);
    warden_store::update(store, &updated, &stored.etag).await?;
    Ok(updated)
}

/// The unexpired token of (PIV, configuration), minting one if the pair has
/// none yet. Used by the orchestrator when resolving a transition's targets.
pub async fn get_or_create_for(
    store: &dyn Store,
    piv: &PivToken,
    config: &RecoveryConfiguration,
    now: DateTime<Utc>,
) -> Result<Stored<RecoveryToken>, ModelError> {
    let rows = query::<RecoveryToken>(
        store,
        ListQuery::sorted(
            Filter::and(vec![
                by_piv(&piv.guid),
                Filter::eq("recovery_configuration", config.uuid.to_string()),
                Filter::absent("expired"),
            ]),
            Sort::asc("created"),
        ),
    )
    .await?;
    if let Some(existing) = rows.into_iter().last() {
        return Ok(existing);
    }
    let token = create_token(store, piv, config, now).await?;
    fetch(store, &token.key())
        .await?
        .ok_or_else(|| ModelError::NotFound(format!("recovery token {}", token.uuid)))
}
