use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;
use warden_domain::{
    allowed_actions, Action, Document, FieldError, Guid, PivToken, RecoveryConfiguration,
    RecoveryToken, Transition,
};
use warden_store::{put_op, query, Filter, ListQuery, Store, Stored};

use crate::error::ModelError;
use crate::recovery_config::{advanced, expire_config, get_config, reactivate_config};
use crate::transition::find_unfinished;

/// Default per-batch fan-out width when the caller does not pick one.
pub const DEFAULT_CONCURRENCY: u32 = 10;

/// An operator action request against one configuration.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: Action,
    /// Restrict the fan-out to this PIV token's compute node. Only a forced
    /// `activate` may target a subset of the fleet.
    pub pivtoken: Option<Guid>,
    pub force: bool,
    pub concurrency: u32,
}

impl ActionRequest {
    pub fn new(action: Action) -> Self {
        ActionRequest { action, pivtoken: None, force: false, concurrency: DEFAULT_CONCURRENCY }
    }
}

/// What the gateway did with the request.
#[derive(Debug)]
pub enum ActionOutcome {
    /// A transition row was created; the orchestrator will drive it.
    Scheduled { transition: Transition, config: RecoveryConfiguration },
    /// The request completed inline: a trivial action (`expire`,
    /// `reactivate`, `cancel`) or an empty-fleet transition that was born
    /// finished.
    Completed { config: RecoveryConfiguration },
}

fn invalid(field: &str, message: impl Into<String>) -> ModelError {
    ModelError::InvalidParams(vec![FieldError {
        field: field.to_string(),
        code: "InvalidParameter".to_string(),
        message: message.into(),
    }])
}

/// Validate and execute one FSM action. This only *schedules* fan-out work;
/// the orchestrator is the sole writer of transition progress.
pub async fn run_action(
    store: &dyn Store,
    config_uuid: Uuid,
    req: ActionRequest,
    now: DateTime<Utc>,
) -> Result<ActionOutcome, ModelError> {
    let stored = get_config(store, config_uuid).await?;
    let state = stored.doc.state();

    // `cancel` is a meta-action: it targets the unfinished transition, not
    // the configuration state.
    if req.action == Action::Cancel {
        let open = find_unfinished(store, config_uuid, None)
            .await?
            .ok_or_else(|| invalid("action", "no transition in progress to cancel"))?;
        let mut aborted = open.doc.clone();
        aborted.aborted = true;
        warden_store::update(store, &aborted, &open.etag).await?;
        info!(config = %config_uuid, transition = %aborted.uuid, "transition cancelled");
        return Ok(ActionOutcome::Completed { config: stored.doc });
    }

    if !allowed_actions(state).contains(&req.action) {
        return Err(ModelError::ActionNotAllowed {
            action: req.action.to_string(),
            state: state.to_string(),
        });
    }

    match req.action.transition_name() {
        None => {
            // Trivial state changes mutate rows directly; no transition row.
            let config = match req.action {
                Action::Expire => expire_config(store, &stored, now).await?,
                Action::Reactivate => reactivate_config(store, &stored).await?,
                _ => unreachable!("only expire/reactivate lack a transition name"),
            };
            Ok(ActionOutcome::Completed { config })
        }
        Some(name) => {
            let fleet: Vec<Stored<PivToken>> =
                query(store, ListQuery::default()).await?;
            let fleet_size = fleet.len();

            // Resolve targets: the whole fleet, or one forced-activate node.
            let (targets, standalone) = match &req.pivtoken {
                Some(guid) => {
                    let piv = fleet
                        .iter()
                        .find(|p| &p.doc.guid == guid)
                        .ok_or_else(|| ModelError::NotFound(format!("pivtoken {}", guid)))?;
                    let subset = vec![piv.doc.cn_uuid];
                    let standalone = subset.len() != fleet_size;
                    if standalone && !(req.action == Action::Activate && req.force) {
                        return Err(invalid(
                            "pivtoken",
                            "partial targets require action=activate with force",
                        ));
                    }
                    (subset, standalone)
                }
                None => (fleet.iter().map(|p| p.doc.cn_uuid).collect(), false),
            };

            // Activation needs the whole fleet staged first.
            if req.action == Action::Activate && !req.force {
                let staged = store
                    .count(
                        RecoveryToken::BUCKET,
                        Filter::and(vec![
                            Filter::eq("recovery_configuration", config_uuid.to_string()),
                            Filter::present("staged"),
                            Filter::absent("expired"),
                        ]),
                    )
                    .await?;
                if (staged as usize) < fleet_size {
                    return Err(invalid(
                        "action",
                        format!(
                            "only {} of {} compute nodes have this configuration staged",
                            staged, fleet_size
                        ),
                    ));
                }
            }

            if let Some(existing) = find_unfinished(store, config_uuid, Some(name)).await? {
                return Err(ModelError::TransitionAlreadyExists {
                    name: name.to_string(),
                    transition: Box::new(existing.doc),
                    config: Box::new(stored.doc),
                });
            }

            let mut transition = Transition::new(
                &stored.doc,
                name,
                targets,
                req.concurrency.max(1),
                standalone,
                req.force,
                now,
            );

            if transition.targets.is_empty() {
                // Empty fleet: nothing to fan out. The transition is born
                // finished and the configuration advances in the same batch.
                transition.started = Some(now);
                transition.finished = Some(now);
                let config = advanced(&stored.doc, name, now);
                store
                    .batch(vec![
                        put_op(&transition, None)?,
                        put_op(&config, Some(stored.etag.clone()))?,
                    ])
                    .await?;
                info!(config = %config_uuid, name = %name, "empty fleet; transition completed inline");
                return Ok(ActionOutcome::Completed { config });
            }

            warden_store::create(store, &transition).await?;
            info!(
                config = %config_uuid,
                transition = %transition.uuid,
                name = %name,
                targets = transition.targets.len(),
                "transition scheduled"
            );
            Ok(ActionOutcome::Scheduled { transition, config: stored.doc })
        }
    }
}
