use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_agent::{NodeAgent, RecoveryTask, TaskOutcome};
use warden_domain::{
    PivToken, RecoveryConfiguration, TargetError, Transition, TransitionName,
};
use warden_model::{pivtoken, recovery_config, recovery_token, transition, ModelError};
use warden_store::{Store, StoreError, Stored};

use crate::error::TransitionerError;
use crate::pruner::prune;

/// Fixed per-task deadline for node-agent waits.
pub const TASK_DEADLINE: Duration = Duration::from_secs(300);

/// The long-running worker that drives recovery-configuration transitions
/// across the fleet.
///
/// The loop is serial: one transition at a time, batches of `concurrency`
/// targets inside it. All coordination with other instances goes through
/// etag-conditional writes on the transition row; there are no in-process
/// locks.
pub struct Transitioner {
    store: Arc<dyn Store>,
    agent: Arc<dyn NodeAgent>,
    instance_uuid: Uuid,
    poll_interval: Duration,
    history_duration_secs: i64,
    task_deadline: Duration,
}

impl Transitioner {
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<dyn NodeAgent>,
        instance_uuid: Uuid,
        poll_interval: Duration,
        history_duration_secs: i64,
    ) -> Self {
        Self {
            store,
            agent,
            instance_uuid,
            poll_interval,
            history_duration_secs,
            task_deadline: TASK_DEADLINE,
        }
    }

    /// Override the node-agent wait deadline (tests).
    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline = deadline;
        self
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(instance = %self.instance_uuid, "transition orchestrator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let worked = match self.tick().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(error = %e, "orchestrator iteration failed");
                    false
                }
            };
            if worked {
                // More work may be queued behind the one we just finished.
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("transition orchestrator stopped");
    }

    /// One iteration: prune, drive at most one transition, sweep unused
    /// configurations. Returns whether a transition was driven.
    pub async fn tick(&self) -> Result<bool, TransitionerError> {
        prune(self.store.as_ref(), self.history_duration_secs, Utc::now()).await?;

        let worked = match transition::next_runnable(self.store.as_ref()).await? {
            Some(picked) => {
                self.drive(picked).await?;
                true
            }
            None => false,
        };

        recovery_config::expire_unused_configs(self.store.as_ref(), Utc::now()).await?;
        Ok(worked)
    }

    /// Conditional transition write. `Ok(None)` means another instance got
    /// there first.
    async fn cas_put(
        &self,
        t: &Transition,
        etag: &str,
    ) -> Result<Option<String>, TransitionerError> {
        match warden_store::update(self.store.as_ref(), t, etag).await {
            Ok(new_etag) => Ok(Some(new_etag)),
            Err(StoreError::EtagMismatch { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn drive(&self, picked: Stored<Transition>) -> Result<(), TransitionerError> {
        let now = Utc::now();
        let mut t = picked.doc.clone();

        // Aborted-but-unfinished: nothing to run, just close the row out.
        if t.aborted {
            t.finished = Some(now);
            self.cas_put(&t, &picked.etag).await?;
            debug!(transition = %t.uuid, "closed aborted transition");
            return Ok(());
        }

        // The configuration can disappear underneath us (reactivate deletes
        // transition history; destroy removes the row). Close the orphan.
        let config =
            match recovery_config::get_config(self.store.as_ref(), t.recovery_config_uuid).await {
                Ok(c) => c,
                Err(ModelError::NotFound(_)) => {
                    warn!(transition = %t.uuid, "configuration gone; closing transition");
                    t.finished = Some(now);
                    self.cas_put(&t, &picked.etag).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

        // Resolve pending targets to (PIV, recovery token) pairs. Targets
        // already in the transition's end state are short-circuited, which
        // is what makes crash-resume idempotent.
        let pending = t.pending();
        let pivs = pivtoken::list_by_cn(self.store.as_ref(), &pending).await?;
        let mut work: Vec<(PivToken, Uuid, String)> = Vec::new();
        let mut short_circuit: Vec<Uuid> = Vec::new();
        for cn in &pending {
            let Some(piv) = pivs.iter().find(|p| p.doc.cn_uuid == *cn) else {
                t.errs.push(TargetError {
                    cn_uuid: *cn,
                    message: format!("no pivtoken for compute node {}", cn),
                });
                short_circuit.push(*cn);
                continue;
            };
            let token =
                recovery_token::get_or_create_for(self.store.as_ref(), &piv.doc, &config.doc, now)
                    .await?;
            if t.name.satisfied_by(&token.doc) {
                debug!(cn_uuid = %cn, "target already in end state; skipping");
                short_circuit.push(*cn);
            } else {
                work.push((piv.doc.clone(), token.doc.uuid, token.doc.token.clone()));
            }
        }

        // Lock. This conditional put is the contention gate between
        // orchestrator instances; losing it means backing off entirely.
        t.locked_by = Some(self.instance_uuid);
        if t.started.is_none() {
            t.started = Some(now);
        }
        for cn in &short_circuit {
            if !t.completed.contains(cn) {
                t.completed.push(*cn);
            }
        }
        if work.is_empty() {
            t.finished = Some(now);
        }
        if self.cas_put(&t, &picked.etag).await?.is_none() {
            debug!(transition = %t.uuid, "lost lock race; backing off");
            return Ok(());
        }

        if t.finished.is_none() {
            let width = t.concurrency.max(1) as usize;
            for slice in work.chunks(width) {
                let outcomes = join_all(slice.iter().map(|(piv, token_uuid, token_hex)| {
                    run_target(
                        self.store.clone(),
                        self.agent.clone(),
                        t.name,
                        config.doc.clone(),
                        piv.clone(),
                        *token_uuid,
                        token_hex.clone(),
                        self.task_deadline,
                    )
                }))
                .await;

                // Progress lands at batch boundaries only; the re-read row is
                // the authoritative source for the aborted flag.
                let current = transition::get(self.store.as_ref(), t.uuid).await?;
                let mut fresh = current.doc.clone();
                for outcome in outcomes {
                    if let Some(id) = outcome.taskid {
                        fresh.taskids.push(id);
                    }
                    if !fresh.completed.contains(&outcome.cn_uuid) {
                        fresh.completed.push(outcome.cn_uuid);
                    }
                    if let Some(message) = outcome.error {
                        if !message.is_empty() {
                            fresh.errs.push(TargetError { cn_uuid: outcome.cn_uuid, message });
                        }
                    }
                }
                if self.cas_put(&fresh, &current.etag).await?.is_none() {
                    return Err(TransitionerError::LockLost(t.uuid.to_string()));
                }
                t = fresh;
                if t.aborted {
                    info!(transition = %t.uuid, "abort observed at batch boundary");
                    return Ok(());
                }
            }

            let current = transition::get(self.store.as_ref(), t.uuid).await?;
            let mut fresh = current.doc.clone();
            fresh.finished = Some(Utc::now());
            if self.cas_put(&fresh, &current.etag).await?.is_none() {
                return Err(TransitionerError::LockLost(t.uuid.to_string()));
            }
            t = fresh;
        }

        info!(
            transition = %t.uuid,
            name = %t.name,
            completed = t.completed.len(),
            errors = t.errs.len(),
            "transition finished"
        );

        // The configuration advances strictly after `finished`, and only
        // when every target succeeded.
        if !t.standalone && t.succeeded() {
            self.advance(&t).await?;
        }
        Ok(())
    }

    async fn advance(&self, t: &Transition) -> Result<(), TransitionerError> {
        // One retry: a concurrent writer (e.g. an operator expire) bumping
        // the etag between read and write is not fatal, just stale.
        for _ in 0..2 {
            let stored =
                recovery_config::get_config(self.store.as_ref(), t.recovery_config_uuid).await?;
            let next = recovery_config::advanced(&stored.doc, t.name, Utc::now());
            match warden_store::update(self.store.as_ref(), &next, &stored.etag).await {
                Ok(_) => {
                    info!(config = %next.uuid, state = %next.state(), "configuration advanced");
                    return Ok(());
                }
                Err(StoreError::EtagMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        warn!(config = %t.recovery_config_uuid, "could not advance configuration; will not retry");
        Ok(())
    }
}

struct TargetOutcome {
    cn_uuid: Uuid,
    taskid: Option<String>,
    error: Option<String>,
}

/// Drive one target: submit the task, wait for its terminal state, and on
/// success move the target's recovery token into the transition's end state.
async fn run_target(
    store: Arc<dyn Store>,
    agent: Arc<dyn NodeAgent>,
    name: TransitionName,
    config: RecoveryConfiguration,
    piv: PivToken,
    token_uuid: Uuid,
    token_hex: String,
    deadline: Duration,
) -> TargetOutcome {
    let cn_uuid = piv.cn_uuid;
    let task = RecoveryTask {
        action: name,
        pivtoken: piv.guid.clone(),
        recovery_uuid: config.uuid,
        template: config.template.clone(),
        token: token_hex,
    };

    let taskid = match agent.submit(cn_uuid, &task).await {
        Ok(id) => id,
        Err(e) => {
            return TargetOutcome { cn_uuid, taskid: None, error: Some(e.to_string()) };
        }
    };

    let error = match agent.wait(cn_uuid, &taskid, deadline).await {
        Ok(TaskOutcome::Complete) => apply_token_state(store.as_ref(), name, token_uuid)
            .await
            .err()
            .map(|e| e.to_string()),
        Ok(TaskOutcome::Failed(message)) => Some(message),
        Err(e) => Some(e.to_string()),
    };

    TargetOutcome { cn_uuid, taskid: Some(taskid.0), error }
}

async fn apply_token_state(
    store: &dyn Store,
    name: TransitionName,
    token_uuid: Uuid,
) -> Result<(), ModelError> {
    let now = Utc::now();
    let stored = recovery_token::get(store, token_uuid).await?;
    match name {
        TransitionName::Stage => recovery_token::stage(store, &stored, now).await?,
        TransitionName::Activate => recovery_token::activate(store, &stored, now).await?,
        TransitionName::Deactivate => recovery_token::deactivate(store, &stored).await?,
        TransitionName::Unstage => recovery_token::unstage(store, &stored).await?,
    };
    Ok(())
}
