use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use warden_domain::{
    ConfigState, Document, PivToken, RecoveryConfiguration, RecoveryToken, Transition,
    TransitionName,
};
use warden_store::{
    fetch, put_op, query, BatchOp, Filter, ListQuery, Sort, Store, Stored,
};

use crate::error::ModelError;

fn by_config(uuid: Uuid) -> Filter {
    Filter::eq("recovery_configuration", uuid.to_string())
}

/// Result of a create request: the template hash makes duplicate posts
/// converge on the pre-existing row.
#[derive(Debug)]
pub enum ConfigCreateOutcome {
    Created(RecoveryConfiguration),
    Duplicate(RecoveryConfiguration),
}

/// Create a configuration from a raw template blob.
///
/// When the fleet holds no PIV tokens and no other configuration exists,
/// the new configuration is born staged and activated: there is nothing to
/// fan out to, and the first enrolled token must find an active
/// configuration waiting.
pub async fn create_config(
    store: &dyn Store,
    raw_template: &str,
    now: DateTime<Utc>,
) -> Result<ConfigCreateOutcome, ModelError> {
    let mut config = RecoveryConfiguration::from_template(raw_template, now)?;

    if let Some(existing) = fetch::<RecoveryConfiguration>(store, &config.key()).await? {
        return Ok(ConfigCreateOutcome::Duplicate(existing.doc));
    }

    let fleet = store.count(PivToken::BUCKET, Filter::True).await?;
    let configs = store.count(RecoveryConfiguration::BUCKET, Filter::True).await?;
    if fleet == 0 && configs == 0 {
        info!(uuid = %config.uuid, "bootstrap: configuration born staged+activated");
        config.staged = Some(now);
        config.activated = Some(now);
    }

    warden_store::create(store, &config).await?;
    Ok(ConfigCreateOutcome::Created(config))
}

pub async fn get_config(
    store: &dyn Store,
    uuid: Uuid,
) -> Result<Stored<RecoveryConfiguration>, ModelError> {
    fetch(store, &uuid.to_string())
        .await?
        .ok_or_else(|| ModelError::NotFound(format!("recovery configuration {}", uuid)))
}

pub async fn list_configs(
    store: &dyn Store,
    q: ListQuery,
) -> Result<Vec<Stored<RecoveryConfiguration>>, ModelError> {
    Ok(query(store, q).await?)
}

/// The unique configuration with `activated` set and `expired` unset, if
/// any. New PIV tokens enrol against this one when the caller names none.
pub async fn active_config(
    store: &dyn Store,
) -> Result<Option<Stored<RecoveryConfiguration>>, ModelError> {
    let rows = query::<RecoveryConfiguration>(
        store,
        ListQuery::sorted(
            Filter::and(vec![Filter::present("activated"), Filter::absent("expired")]),
            Sort::asc("created"),
        ),
    )
    .await?;
    Ok(rows.into_iter().last())
}

/// Remove a configuration. Only `created` and `expired` configurations may
/// go; anything staged or active must be expired first.
pub async fn delete_config(store: &dyn Store, uuid: Uuid) -> Result<(), ModelError> {
    let stored = get_config(store, uuid).await?;
    match stored.doc.state() {
        ConfigState::Created | ConfigState::Expired => {}
        state => {
            return Err(ModelError::PreconditionFailed(format!(
                "cannot delete configuration in state '{}'; expire it first",
                state
            )));
        }
    }
    // The row, its transition history, and its (already expired or never
    // distributed) recovery tokens leave together.
    store
        .batch(vec![
            warden_store::delete_op(&stored.doc, Some(stored.etag.clone())),
            BatchOp::DeleteMany {
                bucket: Transition::BUCKET.to_string(),
                filter: Filter::eq("recovery_config_uuid", uuid.to_string()),
            },
            BatchOp::DeleteMany {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: by_config(uuid),
            },
        ])
        .await?;
    Ok(())
}

/// Trivial `expire`: stamp the configuration and every not-yet-expired
/// recovery token referencing it, in one batch.
pub async fn expire_config(
    store: &dyn Store,
    stored: &Stored<RecoveryConfiguration>,
    now: DateTime<Utc>,
) -> Result<RecoveryConfiguration, ModelError> {
    let mut updated = stored.doc.clone();
    updated.expired = Some(now);

    let mut set = BTreeMap::new();
    set.insert("expired".to_string(), Some(json!(now)));

    store
        .batch(vec![
            put_op(&updated, Some(stored.etag.clone()))?,
            BatchOp::Update {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: Filter::and(vec![by_config(updated.uuid), Filter::absent("expired")]),
                set,
            },
        ])
        .await?;
    Ok(updated)
}

/// Trivial `reactivate`: clear the lifecycle timestamps on the configuration
/// and all of its recovery tokens, and drop its transition history, in one
/// batch. The configuration lands back in `created`.
pub async fn reactivate_config(
    store: &dyn Store,
    stored: &Stored<RecoveryConfiguration>,
) -> Result<RecoveryConfiguration, ModelError> {
    let mut updated = stored.doc.clone();
    updated.staged = None;
    updated.activated = None;
    updated.expired = None;

    let mut clear = BTreeMap::new();
    clear.insert("staged".to_string(), None);
    clear.insert("activated".to_string(), None);
    clear.insert("expired".to_string(), None);

    store
        .batch(vec![
            put_op(&updated, Some(stored.etag.clone()))?,
            BatchOp::DeleteMany {
                bucket: Transition::BUCKET.to_string(),
                filter: Filter::eq("recovery_config_uuid", updated.uuid.to_string()),
            },
            BatchOp::Update {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: by_config(updated.uuid),
                set: clear,
            },
        ])
        .await?;
    Ok(updated)
}

/// The configuration as it should look after a transition named `name`
/// completes across the whole fleet.
pub fn advanced(
    config: &RecoveryConfiguration,
    name: TransitionName,
    now: DateTime<Utc>,
) -> RecoveryConfiguration {
    let mut next = config.clone();
    match name {
        TransitionName::Stage => next.staged = Some(now),
        TransitionName::Unstage => next.staged = None,
        TransitionName::Activate => next.activated = Some(now),
        TransitionName::Deactivate => next.activated = None,
    }
    next
}

/// Expire configurations nobody can unlock with anymore: `activated` set,
/// `expired` unset, and every recovery token referencing them already
/// expired. Configurations with no tokens at all are left alone, or the
/// bootstrap configuration would expire before the first token enrols.
pub async fn expire_unused_configs(
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, ModelError> {
    let candidates = query::<RecoveryConfiguration>(
        store,
        ListQuery::filtered(Filter::and(vec![
            Filter::present("activated"),
            Filter::absent("expired"),
        ])),
    )
    .await?;

    let mut expired = Vec::new();
    for stored in candidates {
        let tokens = crate::recovery_token::list_for_config(store, stored.doc.uuid).await?;
        if tokens.is_empty() || !tokens.iter().all(|t| t.doc.is_expired()) {
            continue;
        }
        // Per-config batch: a CAS conflict on one candidate must not stall
        // the sweep; it will be retried next cycle.
        match expire_config(store, &stored, now).await {
            Ok(_) => {
                info!(uuid = %stored.doc.uuid, "auto-expired unused configuration");
                expired.push(stored.doc.uuid);
            }
            Err(ModelError::Store(warden_store::StoreError::EtagMismatch { .. })) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::{Guid, PubKeys, SCHEMA_VERSION};
    use warden_store::InMemoryStore;

    async fn seed_piv(store: &dyn Store) -> PivToken {
        let piv = PivToken {
            v: SCHEMA_VERSION,
            guid: Guid::parse("97496DD1C8F053DE7450CD854D9C95B4").unwrap(),
            cn_uuid: Uuid::new_v4(),
            serial: None,
            model: None,
            pubkeys: PubKeys { key_9a: None, key_9d: None, key_9e: "ssh-rsa AAAA".into() },
            attestation: None,
            pin: "123456".into(),
            created: Utc::now(),
        };
        warden_store::create(store, &piv).await.unwrap();
        piv
    }

    #[tokio::test]
    async fn empty_fleet_create_is_bootstrap() {
        let store = InMemoryStore::new();
        let out = create_config(&store, "AAAA==\n", Utc::now()).await.unwrap();
        let config = match out {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!("expected fresh create"),
        };
        assert_eq!(config.uuid.to_string(), "10bee382-52ce-552c-95b8-f7bc40cce8dc");
        assert_eq!(config.staged, Some(config.created));
        assert_eq!(config.activated, Some(config.created));
        assert_eq!(config.state(), ConfigState::Active);
    }

    #[tokio::test]
    async fn duplicate_create_returns_existing_row() {
        let store = InMemoryStore::new();
        let first = match create_config(&store, "AAAA==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        match create_config(&store, "AAAA==\n", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Duplicate(c) => assert_eq!(c, first),
            _ => panic!("expected duplicate"),
        }
    }

    #[tokio::test]
    async fn second_config_is_not_bootstrap() {
        let store = InMemoryStore::new();
        create_config(&store, "AAAA==", Utc::now()).await.unwrap();
        let second = match create_config(&store, "BBBB==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        assert_eq!(second.state(), ConfigState::Created);
    }

    #[tokio::test]
    async fn config_with_fleet_present_is_not_bootstrap() {
        let store = InMemoryStore::new();
        seed_piv(&store).await;
        let config = match create_config(&store, "AAAA==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        assert_eq!(config.state(), ConfigState::Created);
    }

    #[tokio::test]
    async fn delete_guard_blocks_active_configuration() {
        let store = InMemoryStore::new();
        let config = match create_config(&store, "AAAA==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        // Bootstrap: active.
        let err = delete_config(&store, config.uuid).await.unwrap_err();
        assert!(matches!(err, ModelError::PreconditionFailed(_)));

        let stored = get_config(&store, config.uuid).await.unwrap();
        expire_config(&store, &stored, Utc::now()).await.unwrap();
        delete_config(&store, config.uuid).await.unwrap();
        assert!(matches!(
            get_config(&store, config.uuid).await,
            Err(ModelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expire_stamps_config_and_all_unexpired_tokens() {
        let store = InMemoryStore::new();
        let config = match create_config(&store, "AAAA==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        let piv = seed_piv(&store).await;
        crate::recovery_token::create_token(&store, &piv, &config, Utc::now())
            .await
            .unwrap();

        let stored = get_config(&store, config.uuid).await.unwrap();
        let now = Utc::now();
        let updated = expire_config(&store, &stored, now).await.unwrap();
        assert_eq!(updated.state(), ConfigState::Expired);

        let tokens = crate::recovery_token::list_for_config(&store, config.uuid)
            .await
            .unwrap();
        assert!(!tokens.is_empty());
        assert!(tokens.iter().all(|t| t.doc.is_expired()));
    }

    #[tokio::test]
    async fn expire_then_reactivate_restores_created_state() {
        let store = InMemoryStore::new();
        let config = match create_config(&store, "AAAA==", Utc::now()).await.unwrap() {
            ConfigCreateOutcome::Created(c) => c,
            _ => panic!(),
        };
        let piv = seed_piv(&store).await;
        crate::recovery_token::create_token(&store, &piv, &config, Utc::now())
            .await
            .unwrap();

        let stored = get_config(&store, config.uuid).await.unwrap();
        expire_config(&store, &stored, Utc::now()).await.unwrap();

        let stored = get_config(&store, config.uuid).await.unwrap();
        let back = reactivate_config(&store, &stored).await.unwrap();
        assert_eq!(back.state(), ConfigState::Created);

        let tokens = crate::recovery_token::list_for_config(&store, config.uuid)
            .await
            .unwrap();
        assert!(tokens
            .iter()
            .all(|t| t.doc.staged.is_none() && t.doc.activated.is_none() && t.doc.expired.is_none()));
    }

    #[tokio::test]
    async fn unused_sweep_expires_only_fully_expired_configs() {
        let store = InMemoryStore::new();
        let piv = seed_piv(&store).await;

        // c1: active, token expired -> swept. c2: active, token live -> kept.
        // c3: active, no tokens -> kept (bootstrap-shaped).
        let mut c1 = RecoveryConfiguration::from_template("AAAA==", Utc::now()).unwrap();
        c1.staged = Some(c1.created);
        c1.activated = Some(c1.created);
        warden_store::create(&store, &c1).await.unwrap();
        let t1 = crate::recovery_token::create_token(&store, &piv, &c1, Utc::now())
            .await
            .unwrap();
        let t1 = crate::recovery_token::get(&store, t1.uuid).await.unwrap();
        crate::recovery_token::expire(&store, &t1, Utc::now()).await.unwrap();

        let mut c2 = RecoveryConfiguration::from_template("BBBB==", Utc::now()).unwrap();
        c2.staged = Some(c2.created);
        c2.activated = Some(c2.created);
        warden_store::create(&store, &c2).await.unwrap();
        crate::recovery_token::create_token(&store, &piv, &c2, Utc::now())
            .await
            .unwrap();

        let mut c3 = RecoveryConfiguration::from_template("CCCC==", Utc::now()).unwrap();
        c3.staged = Some(c3.created);
        c3.activated = Some(c3.created);
        warden_store::create(&store, &c3).await.unwrap();

        let swept = expire_unused_configs(&store, Utc::now()).await.unwrap();
        assert_eq!(swept, vec![c1.uuid]);
        assert_eq!(
            get_config(&store, c2.uuid).await.unwrap().doc.state(),
            ConfigState::Active
        );
        assert_eq!(
            get_config(&store, c3.uuid).await.unwrap().doc.state(),
            ConfigState::Active
        );
    }

    #[tokio::test]
    async fn advanced_adjusts_the_right_timestamp() {
        let now = Utc::now();
        let mut c = RecoveryConfiguration::from_template("AAAA==", now).unwrap();
        let staged = advanced(&c, TransitionName::Stage, now);
        assert_eq!(staged.staged, Some(now));

        c.staged = Some(now);
        let active = advanced(&c, TransitionName::Activate, now);
        assert_eq!(active.state(), ConfigState::Active);

        let back = advanced(&active, TransitionName::Deactivate, now);
        assert_eq!(back.state(), ConfigState::Staged);

        let cleared = advanced(&back, TransitionName::Unstage, now);
        assert_eq!(cleared.state(), ConfigState::Created);
    }
}
