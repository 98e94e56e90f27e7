use serde_json::json;
use uuid::Uuid;
use warden_domain::{Transition, TransitionName};
use warden_store::{fetch, query, Filter, ListQuery, Sort, Store, Stored};

use crate::error::ModelError;

fn by_config(config_uuid: Uuid) -> Filter {
    Filter::eq("recovery_config_uuid", config_uuid.to_string())
}

fn unfinished() -> Filter {
    Filter::and(vec![Filter::absent("finished"), Filter::absent("aborted")])
}

pub async fn get(store: &dyn Store, uuid: Uuid) -> Result<Stored<Transition>, ModelError> {
    fetch(store, &uuid.to_string())
        .await?
        .ok_or_else(|| ModelError::NotFound(format!("transition {}", uuid)))
}

/// The single unfinished transition of a configuration, optionally narrowed
/// to one name. The per-(configuration, name) uniqueness invariant makes
/// "the first one" well-defined.
pub async fn find_unfinished(
    store: &dyn Store,
    config_uuid: Uuid,
    name: Option<TransitionName>,
) -> Result<Option<Stored<Transition>>, ModelError> {
    let mut clauses = vec![by_config(config_uuid), unfinished()];
    if let Some(name) = name {
        clauses.push(Filter::Eq("name".to_string(), json!(name)));
    }
    let rows = query::<Transition>(
        store,
        ListQuery::sorted(Filter::and(clauses), Sort::asc("created")),
    )
    .await?;
    Ok(rows.into_iter().next())
}

/// The most recent transition of a given name for a configuration,
/// regardless of completion. Backs the `action=watch` view.
pub async fn latest_named(
    store: &dyn Store,
    config_uuid: Uuid,
    name: TransitionName,
) -> Result<Option<Stored<Transition>>, ModelError> {
    let rows = query::<Transition>(
        store,
        ListQuery::sorted(
            Filter::and(vec![
                by_config(config_uuid),
                Filter::Eq("name".to_string(), json!(name)),
            ]),
            Sort::desc("created"),
        ),
    )
    .await?;
    Ok(rows.into_iter().next())
}

/// Oldest unfinished transition across all configurations: the
/// orchestrator's next unit of work.
pub async fn next_runnable(store: &dyn Store) -> Result<Option<Stored<Transition>>, ModelError> {
    let rows = query::<Transition>(
        store,
        ListQuery {
            filter: Filter::absent("finished"),
            sort: Some(Sort::asc("created")),
            limit: Some(1),
            offset: 0,
        },
    )
    .await?;
    Ok(rows.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_domain::RecoveryConfiguration;
    use warden_store::InMemoryStore;

    fn config() -> RecoveryConfiguration {
        RecoveryConfiguration::from_template("AAAA==", Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn find_unfinished_filters_by_name_and_state() {
        let store = InMemoryStore::new();
        let cfg = config();
        let now = Utc::now();

        let mut done = Transition::new(&cfg, TransitionName::Stage, vec![], 1, false, false, now);
        done.finished = Some(now);
        warden_store::create(&store, &done).await.unwrap();

        let open = Transition::new(&cfg, TransitionName::Activate, vec![], 1, false, false, now);
        warden_store::create(&store, &open).await.unwrap();

        assert!(find_unfinished(&store, cfg.uuid, Some(TransitionName::Stage))
            .await
            .unwrap()
            .is_none());
        let got = find_unfinished(&store, cfg.uuid, Some(TransitionName::Activate))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.doc.uuid, open.uuid);
        assert_eq!(
            find_unfinished(&store, cfg.uuid, None).await.unwrap().unwrap().doc.uuid,
            open.uuid
        );
    }

    #[tokio::test]
    async fn aborted_transitions_are_not_unfinished_but_are_runnable() {
        let store = InMemoryStore::new();
        let cfg = config();
        let now = Utc::now();

        let mut t = Transition::new(&cfg, TransitionName::Stage, vec![], 1, false, false, now);
        t.aborted = true;
        warden_store::create(&store, &t).await.unwrap();

        // Aborted: no longer claimable by a new action of the same name…
        assert!(find_unfinished(&store, cfg.uuid, Some(TransitionName::Stage))
            .await
            .unwrap()
            .is_none());
        // …but the orchestrator must still pick it up to stamp `finished`.
        let picked = next_runnable(&store).await.unwrap().unwrap();
        assert_eq!(picked.doc.uuid, t.uuid);
    }

    #[tokio::test]
    async fn next_runnable_returns_oldest_first() {
        let store = InMemoryStore::new();
        let cfg = config();
        let base = Utc::now();

        let mut newer = Transition::new(&cfg, TransitionName::Stage, vec![], 1, false, false, base);
        newer.created = base + chrono::Duration::seconds(10);
        warden_store::create(&store, &newer).await.unwrap();

        let older = Transition::new(&cfg, TransitionName::Unstage, vec![], 1, false, false, base);
        warden_store::create(&store, &older).await.unwrap();

        assert_eq!(next_runnable(&store).await.unwrap().unwrap().doc.uuid, older.uuid);
    }
}
