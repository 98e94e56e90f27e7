use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use warden_domain::validate::{validate, Check, Schema, MAX_LIMIT};
use warden_domain::{
    Action, Document, Guid, PivToken, RecoveryConfiguration, RecoveryToken, Transition,
    TransitionName,
};
use warden_model::{
    gateway, pivtoken, recovery_config, recovery_token, transition, ActionOutcome, ActionRequest,
    ConfigCreateOutcome, PivCreateOutcome,
};

use crate::auth::{authenticate, AuthScheme};
use crate::error::ApiError;
use crate::state::AppState;

// ── Views ────────────────────────────────────────────────────────────────────
// Public views strip secrets (pin, raw token bodies); authenticated views
// carry everything the compute node needs.

pub(crate) fn token_summary(t: &RecoveryToken) -> Value {
    json!({
        "uuid": t.uuid,
        "recovery_configuration": t.recovery_configuration,
        "created": t.created,
        "staged": t.staged,
        "activated": t.activated,
        "expired": t.expired,
    })
}

pub(crate) fn token_full(t: &RecoveryToken) -> Value {
    let mut v = token_summary(t);
    v["pivtoken"] = json!(t.pivtoken);
    v["token"] = json!(t.token);
    v
}

pub(crate) fn piv_public(piv: &PivToken, tokens: &[RecoveryToken]) -> Value {
    json!({
        "guid": piv.guid,
        "cn_uuid": piv.cn_uuid,
        "serial": piv.serial,
        "model": piv.model,
        "pubkeys": piv.pubkeys,
        "attestation": piv.attestation,
        "created": piv.created,
        "recovery_tokens": tokens.iter().map(token_summary).collect::<Vec<_>>(),
    })
}

pub(crate) fn piv_full(piv: &PivToken, tokens: &[RecoveryToken]) -> Value {
    let mut v = piv_public(piv, tokens);
    v["pin"] = json!(piv.pin);
    v["recovery_tokens"] = json!(tokens.iter().map(token_full).collect::<Vec<_>>());
    v
}

pub(crate) fn config_view(c: &RecoveryConfiguration) -> Value {
    json!({
        "uuid": c.uuid,
        "template": c.template,
        "created": c.created,
        "staged": c.staged,
        "activated": c.activated,
        "expired": c.expired,
        "state": c.state().to_string(),
    })
}

pub(crate) fn transition_view(t: &Transition) -> Value {
    json!({
        "uuid": t.uuid,
        "recovery_config_uuid": t.recovery_config_uuid,
        "name": t.name,
        "targets": t.targets,
        "completed": t.completed,
        "taskids": t.taskids,
        "errs": t.errs,
        "concurrency": t.concurrency,
        "standalone": t.standalone,
        "forced": t.forced,
        "locked_by": t.locked_by,
        "created": t.created,
        "started": t.started,
        "finished": t.finished,
        "aborted": t.aborted,
    })
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn parse_guid(raw: &str) -> Result<Guid, ApiError> {
    Guid::parse(raw).map_err(|_| ApiError::not_found(format!("pivtoken {} not found", raw)))
}

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::not_found(format!("resource {} not found", raw)))
}

fn checked(schema: &Schema, body: &Value) -> Result<(), ApiError> {
    let errors = validate(schema, body);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::invalid_params(errors))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Comma-separated compute-node UUID filter.
    pub cn_uuid: Option<String>,
}

impl ListParams {
    fn bounds(&self) -> Result<(Option<u64>, u64), ApiError> {
        match self.limit {
            Some(l) if l > MAX_LIMIT => Err(ApiError::invalid_params(vec![
                warden_domain::FieldError {
                    field: "limit".into(),
                    code: "InvalidParameter".into(),
                    message: format!("must be ≤ {}", MAX_LIMIT),
                },
            ])),
            limit => Ok((limit, self.offset.unwrap_or(0))),
        }
    }
}

// ── Ping ─────────────────────────────────────────────────────────────────────

pub async fn ping() -> Json<Value> {
    Json(json!({
        "name": "warden",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

// ── PIV tokens ───────────────────────────────────────────────────────────────

const CREATE_PIV: Schema = Schema {
    required: &[
        ("guid", Check::Guid),
        ("cn_uuid", Check::Uuid),
        ("pubkeys", Check::PubKeys),
        ("pin", Check::NonEmptyString),
    ],
    optional: &[
        ("created", Check::Iso8601),
        ("recovery_configuration", Check::Uuid),
        ("serial", Check::NonEmptyString),
        ("model", Check::NonEmptyString),
    ],
};

pub async fn list_pivtokens(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = params.bounds()?;

    let pivs = match &params.cn_uuid {
        Some(raw) => {
            let cns: Vec<Uuid> = raw
                .split(',')
                .map(|s| parse_uuid(s.trim()))
                .collect::<Result<_, _>>()?;
            pivtoken::list_by_cn(state.store.as_ref(), &cns).await?
        }
        None => pivtoken::list_pivs(state.store.as_ref(), limit, offset).await?,
    };

    let mut out = Vec::with_capacity(pivs.len());
    for p in pivs {
        let tokens = recovery_token::list_for_piv(state.store.as_ref(), &p.doc.guid).await?;
        let tokens: Vec<RecoveryToken> = tokens.into_iter().map(|s| s.doc).collect();
        out.push(piv_public(&p.doc, &tokens));
    }
    Ok(Json(json!(out)))
}

pub async fn create_pivtoken(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    checked(&CREATE_PIV, &body)?;
    let params: pivtoken::CreatePivParams =
        serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    // Anonymous only on first contact: a re-create must prove possession of
    // the token being refreshed.
    if let Ok(existing) = pivtoken::get_piv(state.store.as_ref(), &params.guid).await {
        authenticate(&state, &existing.doc, &headers, None).await?;
    }

    let outcome = pivtoken::create_piv(
        state.store.as_ref(),
        params,
        state.config.recovery_token_duration_secs,
        Utc::now(),
    )
    .await?;

    let (status, piv, tokens) = match outcome {
        PivCreateOutcome::Created { piv, tokens } => (StatusCode::CREATED, piv, tokens),
        PivCreateOutcome::Unchanged { piv, tokens } => (StatusCode::OK, piv, tokens),
        PivCreateOutcome::Refreshed { piv, tokens } => (StatusCode::OK, piv, tokens),
    };
    Ok((status, Json(piv_full(&piv, &tokens))))
}

pub async fn get_pivtoken(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let guid = parse_guid(&guid)?;
    let (piv, tokens) = pivtoken::get_piv_with_tokens(state.store.as_ref(), &guid).await?;
    Ok(Json(piv_public(&piv.doc, &tokens)))
}

pub async fn get_pivtoken_pin(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let guid = parse_guid(&guid)?;
    let (piv, tokens) = pivtoken::get_piv_with_tokens(state.store.as_ref(), &guid).await?;
    authenticate(&state, &piv.doc, &headers, None).await?;
    Ok(Json(piv_full(&piv.doc, &tokens)))
}

pub async fn update_pivtoken(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let guid = parse_guid(&guid)?;
    let piv = pivtoken::get_piv(state.store.as_ref(), &guid).await?;
    authenticate(&state, &piv.doc, &headers, None).await?;

    let changes = body
        .as_object()
        .ok_or_else(|| ApiError::bad_request("body must be an object"))?;
    let updated = pivtoken::update_piv(state.store.as_ref(), &guid, changes).await?;
    let tokens = recovery_token::list_for_piv(state.store.as_ref(), &guid).await?;
    let tokens: Vec<RecoveryToken> = tokens.into_iter().map(|s| s.doc).collect();
    Ok(Json(piv_public(&updated, &tokens)))
}

pub async fn delete_pivtoken(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let guid = parse_guid(&guid)?;
    let piv = pivtoken::get_piv(state.store.as_ref(), &guid).await?;
    authenticate(&state, &piv.doc, &headers, None).await?;
    pivtoken::delete_piv(state.store.as_ref(), &guid, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_pivtoken(
    State(state): State<AppState>,
    Path(replaced): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let replaced = parse_guid(&replaced)?;
    let old = pivtoken::get_piv(state.store.as_ref(), &replaced).await?;
    // Replacement proves possession of the shared recovery token, not of the
    // (possibly destroyed) hardware key.
    authenticate(&state, &old.doc, &headers, Some(AuthScheme::Hmac)).await?;

    checked(&CREATE_PIV, &body)?;
    let params: pivtoken::CreatePivParams =
        serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let (piv, token) =
        pivtoken::replace_piv(state.store.as_ref(), &replaced, params, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(piv_full(&piv, &[token]))))
}

// ── Recovery tokens (per PIV) ────────────────────────────────────────────────

const UPDATE_RECOVERY_TOKEN: Schema = Schema {
    required: &[(
        "action",
        Check::Enum(&["stage", "activate", "deactivate", "unstage", "expire"]),
    )],
    optional: &[],
};

async fn authed_piv(
    state: &AppState,
    guid: &str,
    headers: &HeaderMap,
) -> Result<PivToken, ApiError> {
    let guid = parse_guid(guid)?;
    let piv = pivtoken::get_piv(state.store.as_ref(), &guid).await?;
    authenticate(state, &piv.doc, headers, None).await?;
    Ok(piv.doc)
}

/// Fetch a recovery token and check it belongs to the named PIV token.
async fn owned_token(
    state: &AppState,
    piv: &PivToken,
    uuid: &str,
) -> Result<warden_store::Stored<RecoveryToken>, ApiError> {
    let uuid = parse_uuid(uuid)?;
    let stored = recovery_token::get(state.store.as_ref(), uuid).await?;
    if stored.doc.pivtoken != piv.guid {
        return Err(ApiError::not_found(format!("recovery token {} not found", uuid)));
    }
    Ok(stored)
}

pub async fn list_recovery_tokens(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;
    let tokens = recovery_token::list_for_piv(state.store.as_ref(), &piv.guid).await?;
    Ok(Json(json!(tokens.iter().map(|s| token_full(&s.doc)).collect::<Vec<_>>())))
}

pub async fn create_recovery_token(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;

    let requested = body
        .as_ref()
        .and_then(|Json(b)| b.get("recovery_configuration"))
        .and_then(|v| v.as_str())
        .map(parse_uuid)
        .transpose()?;
    let config = match requested {
        Some(uuid) => recovery_config::get_config(state.store.as_ref(), uuid).await?,
        None => recovery_config::active_config(state.store.as_ref())
            .await?
            .ok_or_else(|| ApiError::missing_param("recovery_configuration"))?,
    };

    let token =
        recovery_token::create_token(state.store.as_ref(), &piv, &config.doc, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(token_full(&token))))
}

/// Bulk state update: apply one action to several of a PIV token's recovery
/// tokens (all of them when `uuids` is absent). Sibling invariants apply per
/// step, exactly as for the single-token endpoint.
pub async fn bulk_update_recovery_tokens(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;
    checked(&UPDATE_RECOVERY_TOKEN, &body)?;
    let action = body["action"].as_str().unwrap_or_default().to_string();

    let uuids: Vec<Uuid> = match body.get("uuids") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(parse_uuid).unwrap_or_else(|| {
                Err(ApiError::invalid_params(vec![warden_domain::FieldError {
                    field: "uuids".into(),
                    code: "InvalidParameter".into(),
                    message: "entries must be UUID strings".into(),
                }]))
            }))
            .collect::<Result<_, _>>()?,
        _ => recovery_token::list_for_piv(state.store.as_ref(), &piv.guid)
            .await?
            .into_iter()
            .map(|s| s.doc.uuid)
            .collect(),
    };

    let now = Utc::now();
    let store = state.store.as_ref();
    let mut out = Vec::with_capacity(uuids.len());
    for uuid in uuids {
        // Re-fetch per step: an earlier step may have expired a sibling.
        let stored = owned_token(&state, &piv, &uuid.to_string()).await?;
        let updated = match action.as_str() {
            "stage" => recovery_token::stage(store, &stored, now).await?,
            "activate" => recovery_token::activate(store, &stored, now).await?,
            "deactivate" => recovery_token::deactivate(store, &stored).await?,
            "unstage" => recovery_token::unstage(store, &stored).await?,
            "expire" => recovery_token::expire(store, &stored, now).await?,
            other => {
                return Err(ApiError::invalid_argument(format!("unknown action '{}'", other)))
            }
        };
        out.push(token_full(&updated));
    }
    Ok(Json(json!(out)))
}

pub async fn get_recovery_token(
    State(state): State<AppState>,
    Path((guid, uuid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;
    let stored = owned_token(&state, &piv, &uuid).await?;
    Ok(Json(token_full(&stored.doc)))
}

pub async fn update_recovery_token(
    State(state): State<AppState>,
    Path((guid, uuid)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;
    checked(&UPDATE_RECOVERY_TOKEN, &body)?;
    let stored = owned_token(&state, &piv, &uuid).await?;

    let now = Utc::now();
    let store = state.store.as_ref();
    let updated = match body["action"].as_str().unwrap_or_default() {
        "stage" => recovery_token::stage(store, &stored, now).await?,
        "activate" => recovery_token::activate(store, &stored, now).await?,
        "deactivate" => recovery_token::deactivate(store, &stored).await?,
        "unstage" => recovery_token::unstage(store, &stored).await?,
        "expire" => recovery_token::expire(store, &stored, now).await?,
        other => return Err(ApiError::invalid_argument(format!("unknown action '{}'", other))),
    };
    Ok(Json(token_full(&updated)))
}

pub async fn delete_recovery_token(
    State(state): State<AppState>,
    Path((guid, uuid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let piv = authed_piv(&state, &guid, &headers).await?;
    let stored = owned_token(&state, &piv, &uuid).await?;
    state
        .store
        .delete(
            RecoveryToken::BUCKET,
            &stored.doc.uuid.to_string(),
            Some(&stored.etag),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Recovery configurations ──────────────────────────────────────────────────

const CREATE_CONFIG: Schema = Schema {
    required: &[("template", Check::NonEmptyString)],
    optional: &[],
};

pub async fn list_configs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = params.bounds()?;
    let configs = recovery_config::list_configs(
        state.store.as_ref(),
        warden_store::ListQuery {
            filter: warden_store::Filter::True,
            sort: Some(warden_store::Sort::asc("created")),
            limit,
            offset,
        },
    )
    .await?;
    Ok(Json(json!(configs.iter().map(|s| config_view(&s.doc)).collect::<Vec<_>>())))
}

pub async fn create_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    checked(&CREATE_CONFIG, &body)?;
    let template = body["template"].as_str().unwrap_or_default();

    match recovery_config::create_config(state.store.as_ref(), template, Utc::now()).await? {
        ConfigCreateOutcome::Created(c) => Ok((StatusCode::CREATED, Json(config_view(&c)))),
        ConfigCreateOutcome::Duplicate(c) => Ok((StatusCode::ACCEPTED, Json(config_view(&c)))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ShowConfigParams {
    pub action: Option<String>,
    pub transition: Option<String>,
}

pub async fn get_config(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(params): Query<ShowConfigParams>,
) -> Result<Json<Value>, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    let stored = recovery_config::get_config(state.store.as_ref(), uuid).await?;
    let mut view = config_view(&stored.doc);

    if params.action.as_deref() == Some("watch") {
        let name = params
            .transition
            .as_deref()
            .and_then(|t| serde_json::from_value::<TransitionName>(json!(t)).ok())
            .ok_or_else(|| ApiError::missing_param("transition"))?;
        let t = transition::latest_named(state.store.as_ref(), uuid, name)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("no '{}' transition for {}", name, uuid)))?;
        view["transition"] = transition_view(&t.doc);
    } else if let Some(open) = transition::find_unfinished(state.store.as_ref(), uuid, None).await? {
        // Transient FSM states (staging, unstaging, …) are inferred from the
        // unfinished transition row, never persisted.
        view["state"] = json!(match open.doc.name {
            TransitionName::Stage => "staging",
            TransitionName::Unstage => "unstaging",
            TransitionName::Activate => "activating",
            TransitionName::Deactivate => "deactivating",
        });
        view["transition"] = transition_view(&open.doc);
    }
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct ConfigActionParams {
    pub action: Option<String>,
    pub pivtoken: Option<String>,
    pub force: Option<bool>,
    pub concurrency: Option<u32>,
}

pub async fn config_action(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(params): Query<ConfigActionParams>,
) -> Result<Response, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    let action = params
        .action
        .as_deref()
        .ok_or_else(|| ApiError::missing_param("action"))?;
    let action = Action::parse(action)
        .map_err(|e| ApiError::invalid_params(vec![warden_domain::FieldError {
            field: "action".into(),
            code: "InvalidParameter".into(),
            message: e.to_string(),
        }]))?;

    let mut req = ActionRequest::new(action);
    req.force = params.force.unwrap_or(false);
    req.concurrency = params.concurrency.unwrap_or(gateway::DEFAULT_CONCURRENCY);
    if let Some(raw) = &params.pivtoken {
        req.pivtoken =
            Some(Guid::parse(raw).map_err(|_| {
                ApiError::not_found(format!("pivtoken {} not found", raw))
            })?);
    }

    match gateway::run_action(state.store.as_ref(), uuid, req, Utc::now()).await? {
        ActionOutcome::Scheduled { transition, .. } => {
            let location = format!(
                "/recovery-configurations/{}?action=watch&transition={}",
                uuid, transition.name
            );
            Ok((StatusCode::NO_CONTENT, [(header::LOCATION, location)]).into_response())
        }
        ActionOutcome::Completed { .. } => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn delete_config(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    recovery_config::delete_config(state.store.as_ref(), uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fleet distribution: where this configuration's tokens sit, per PIV token,
/// without revealing token bodies.
pub async fn config_recovery_tokens(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    // 404 on unknown configuration, not an empty list.
    recovery_config::get_config(state.store.as_ref(), uuid).await?;
    let tokens = recovery_token::list_for_config(state.store.as_ref(), uuid).await?;
    let out: Vec<Value> = tokens
        .iter()
        .map(|s| {
            let mut v = token_summary(&s.doc);
            v["pivtoken"] = json!(s.doc.pivtoken);
            v
        })
        .collect();
    Ok(Json(json!(out)))
}
