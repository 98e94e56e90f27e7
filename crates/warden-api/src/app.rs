use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use warden_config::WardenConfig;
use warden_store::Store;

use crate::error::ApiError;
use crate::handlers;
use crate::state::AppState;

const SERVER_HEADER: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Accept `Accept-Version` values that admit major version 1 (`~1`, `1`,
/// `1.x`, `*`). Absent means "anything".
fn version_acceptable(v: &str) -> bool {
    let v = v.trim();
    v == "*" || v == "~1" || v == "1" || v.starts_with("1.") || v.starts_with("~1.")
}

async fn check_accept_version(request: Request, next: Next) -> Response {
    if let Some(v) = request
        .headers()
        .get("accept-version")
        .and_then(|v| v.to_str().ok())
    {
        if !version_acceptable(v) {
            return ApiError::bad_request(format!("unsupported Accept-Version '{}'", v))
                .into_response();
        }
    }
    next.run(request).await
}

async fn decorate_response(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{}ms", started.elapsed().as_millis())) {
        headers.insert("x-response-time", v);
    }
    if let Ok(v) = HeaderValue::from_str(&state.config.instance_uuid.to_string()) {
        headers.insert("x-server-name", v);
    }
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    response
}

pub fn build_app(store: Arc<dyn Store>, config: Arc<WardenConfig>) -> Router {
    let state = AppState { store, config };

    Router::new()
        .route("/ping", get(handlers::ping))
        // PIV tokens
        .route(
            "/pivtokens",
            get(handlers::list_pivtokens).post(handlers::create_pivtoken),
        )
        .route(
            "/pivtokens/:guid",
            get(handlers::get_pivtoken)
                .put(handlers::update_pivtoken)
                .delete(handlers::delete_pivtoken),
        )
        .route("/pivtokens/:guid/pin", get(handlers::get_pivtoken_pin))
        .route("/pivtokens/:guid/replace", post(handlers::replace_pivtoken))
        // Recovery tokens
        .route(
            "/pivtokens/:guid/recovery-tokens",
            get(handlers::list_recovery_tokens)
                .post(handlers::create_recovery_token)
                .put(handlers::bulk_update_recovery_tokens),
        )
        .route(
            "/pivtokens/:guid/recovery-tokens/:uuid",
            get(handlers::get_recovery_token)
                .put(handlers::update_recovery_token)
                .delete(handlers::delete_recovery_token),
        )
        // Recovery configurations
        .route(
            "/recovery-configurations",
            get(handlers::list_configs).post(handlers::create_config),
        )
        .route(
            "/recovery-configurations/:uuid",
            get(handlers::get_config)
                .put(handlers::config_action)
                .delete(handlers::delete_config),
        )
        .route(
            "/recovery-configurations/:uuid/recovery-tokens",
            get(handlers::config_recovery_tokens),
        )
        .route_layer(middleware::from_fn(check_accept_version))
        .layer(middleware::from_fn_with_state(state.clone(), decorate_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use base64::Engine as _;
    use chrono::Utc;
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::util::ServiceExt;
    use warden_store::InMemoryStore;

    fn test_app() -> Router {
        build_app(
            Arc::new(InMemoryStore::new()),
            Arc::new(WardenConfig::default()),
        )
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send_json(app: &Router, method: Method, uri: &str, body: Value) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn send(app: &Router, method: Method, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn pubkey_line() -> String {
        use russh_keys::PublicKeyBase64;
        format!(
            "ssh-ed25519 {} cn@test",
            russh_keys::key::KeyPair::generate_ed25519().public_key_base64()
        )
    }

    fn piv_body(guid: &str, cn: &str) -> Value {
        json!({
            "guid": guid,
            "cn_uuid": cn,
            "pin": "123456",
            "pubkeys": { "9a": pubkey_line(), "9d": pubkey_line(), "9e": pubkey_line() },
        })
    }

    fn hmac_auth(guid: &str, token_hex: &str, date: &str) -> String {
        let key = hex::decode(token_hex).unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
        mac.update(date.as_bytes());
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        format!(
            "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
            guid, sig
        )
    }

    const GUID: &str = "97496DD1C8F053DE7450CD854D9C95B4";
    const CN: &str = "15966912-8fad-41cd-bd82-abe6468354b5";

    #[tokio::test]
    async fn ping_returns_version_and_decorated_headers() {
        let app = test_app();
        let resp = send(&app, Method::GET, "/ping").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        assert!(resp.headers().contains_key("x-response-time"));
        assert!(resp.headers().contains_key("x-server-name"));
        assert_eq!(
            resp.headers().get(header::SERVER).unwrap().to_str().unwrap(),
            SERVER_HEADER
        );
    }

    #[tokio::test]
    async fn accept_version_gate() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("accept-version", "~2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("accept-version", "~1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bootstrap_configuration_create() {
        let app = test_app();
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==\n" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["uuid"], "10bee382-52ce-552c-95b8-f7bc40cce8dc");
        assert_eq!(body["state"], "active");
        assert_eq!(body["created"], body["staged"]);
        assert_eq!(body["created"], body["activated"]);

        // Same template again: 202 with the pre-existing row.
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let dup = body_json(resp).await;
        assert_eq!(dup["uuid"], "10bee382-52ce-552c-95b8-f7bc40cce8dc");
    }

    #[tokio::test]
    async fn create_piv_then_authenticated_refresh() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;

        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["recovery_tokens"].as_array().unwrap().len(), 1);
        assert!(body["recovery_tokens"][0]["activated"].is_string());
        let token_hex = body["recovery_tokens"][0]["token"].as_str().unwrap().to_string();

        // Unauthenticated repeat is rejected: the token now exists.
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // HMAC-signed repeat inside the refresh window: 200, chain unchanged.
        let date = Utc::now().to_rfc2822();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/pivtokens")
                    .header("content-type", "application/json")
                    .header("date", &date)
                    .header(header::AUTHORIZATION, hmac_auth(GUID, &token_hex, &date))
                    .body(Body::from(piv_body(GUID, CN).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["recovery_tokens"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_piv_validation_failure_lists_fields() {
        let app = test_app();
        let resp = send_json(&app, Method::POST, "/pivtokens", json!({})).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "InvalidParameters");
        assert_eq!(body["errors"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn create_piv_without_active_config_is_422() {
        let app = test_app();
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "MissingParameter");
    }

    #[tokio::test]
    async fn public_views_hide_secrets() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;

        let resp = send(&app, Method::GET, &format!("/pivtokens/{}", GUID)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body.get("pin").is_none());
        assert!(body["recovery_tokens"][0].get("token").is_none());

        let resp = send(&app, Method::GET, "/pivtokens").await;
        let list = body_json(resp).await;
        assert!(list[0].get("pin").is_none());
    }

    #[tokio::test]
    async fn pin_endpoint_requires_signature() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        let token_hex = body_json(resp).await["recovery_tokens"][0]["token"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = send(&app, Method::GET, &format!("/pivtokens/{}/pin", GUID)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let date = Utc::now().to_rfc2822();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/pivtokens/{}/pin", GUID))
                    .header("date", &date)
                    .header(header::AUTHORIZATION, hmac_auth(GUID, &token_hex, &date))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["pin"], "123456");
    }

    #[tokio::test]
    async fn missing_resources_return_404() {
        let app = test_app();
        let resp = send(&app, Method::GET, &format!("/pivtokens/{}", GUID)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(
            &app,
            Method::GET,
            "/recovery-configurations/10bee382-52ce-552c-95b8-f7bc40cce8dc",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "ResourceNotFound");
    }

    #[tokio::test]
    async fn delete_guard_requires_expire_first() {
        let app = test_app();
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==" }),
        )
        .await;
        let uuid = body_json(resp).await["uuid"].as_str().unwrap().to_string();

        // Bootstrap configuration is active: deletion refused.
        let resp = send(&app, Method::DELETE, &format!("/recovery-configurations/{}", uuid)).await;
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

        let resp = send(
            &app,
            Method::PUT,
            &format!("/recovery-configurations/{}?action=expire", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(&app, Method::DELETE, &format!("/recovery-configurations/{}", uuid)).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn empty_fleet_stage_completes_inline() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "BBBB==" }),
        )
        .await;
        let uuid = body_json(resp).await["uuid"].as_str().unwrap().to_string();

        let resp = send(
            &app,
            Method::PUT,
            &format!("/recovery-configurations/{}?action=stage", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(&app, Method::GET, &format!("/recovery-configurations/{}", uuid)).await;
        let body = body_json(resp).await;
        assert_eq!(body["state"], "staged");
    }

    #[tokio::test]
    async fn invalid_action_is_422_and_wrong_state_409() {
        let app = test_app();
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==" }),
        )
        .await;
        let uuid = body_json(resp).await["uuid"].as_str().unwrap().to_string();

        let resp = send(
            &app,
            Method::PUT,
            &format!("/recovery-configurations/{}?action=fly", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // Bootstrap config is active; `stage` is not in the allow-list.
        let resp = send(
            &app,
            Method::PUT,
            &format!("/recovery-configurations/{}?action=stage", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "InvalidArgument");
    }

    #[tokio::test]
    async fn watch_without_transition_history_is_404() {
        let app = test_app();
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==" }),
        )
        .await;
        let uuid = body_json(resp).await["uuid"].as_str().unwrap().to_string();

        let resp = send(
            &app,
            Method::GET,
            &format!("/recovery-configurations/{}?action=watch&transition=stage", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fleet_distribution_lists_sanitized_tokens() {
        let app = test_app();
        let resp = send_json(
            &app,
            Method::POST,
            "/recovery-configurations",
            json!({ "template": "AAAA==" }),
        )
        .await;
        let uuid = body_json(resp).await["uuid"].as_str().unwrap().to_string();
        send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;

        let resp = send(
            &app,
            Method::GET,
            &format!("/recovery-configurations/{}/recovery-tokens", uuid),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["pivtoken"], GUID);
        assert!(list[0].get("token").is_none());
    }

    #[tokio::test]
    async fn delete_pivtoken_requires_auth_and_archives() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        let token_hex = body_json(resp).await["recovery_tokens"][0]["token"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = send(&app, Method::DELETE, &format!("/pivtokens/{}", GUID)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let date = Utc::now().to_rfc2822();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/pivtokens/{}", GUID))
                    .header("date", &date)
                    .header(header::AUTHORIZATION, hmac_auth(GUID, &token_hex, &date))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(&app, Method::GET, &format!("/pivtokens/{}", GUID)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bulk_recovery_token_update_expires_chain() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        let token_hex = body_json(resp).await["recovery_tokens"][0]["token"]
            .as_str()
            .unwrap()
            .to_string();

        let date = Utc::now().to_rfc2822();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(format!("/pivtokens/{}/recovery-tokens", GUID))
                    .header("content-type", "application/json")
                    .header("date", &date)
                    .header(header::AUTHORIZATION, hmac_auth(GUID, &token_hex, &date))
                    .body(Body::from(json!({ "action": "expire" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body
            .as_array()
            .unwrap()
            .iter()
            .all(|t| t["expired"].is_string()));
    }

    #[tokio::test]
    async fn replace_requires_hmac_and_swaps_guid() {
        let app = test_app();
        send_json(&app, Method::POST, "/recovery-configurations", json!({ "template": "AAAA==" }))
            .await;
        let resp = send_json(&app, Method::POST, "/pivtokens", piv_body(GUID, CN)).await;
        let token_hex = body_json(resp).await["recovery_tokens"][0]["token"]
            .as_str()
            .unwrap()
            .to_string();

        const NEW_GUID: &str = "0102030405060708090A0B0C0D0E0F10";
        let resp = send_json(
            &app,
            Method::POST,
            &format!("/pivtokens/{}/replace", GUID),
            piv_body(NEW_GUID, CN),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let date = Utc::now().to_rfc2822();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/pivtokens/{}/replace", GUID))
                    .header("content-type", "application/json")
                    .header("date", &date)
                    .header(header::AUTHORIZATION, hmac_auth(GUID, &token_hex, &date))
                    .body(Body::from(piv_body(NEW_GUID, CN).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["guid"], NEW_GUID);

        let resp = send(&app, Method::GET, &format!("/pivtokens/{}", GUID)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, Method::GET, &format!("/pivtokens/{}", NEW_GUID)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
