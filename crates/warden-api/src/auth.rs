use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use warden_domain::validate::parse_pubkey_line;
use warden_domain::PivToken;
use warden_model::recovery_token;

use crate::error::ApiError;
use crate::state::AppState;

/// Maximum allowed clock skew between the signed `date` header and now.
const MAX_SKEW_SECS: i64 = 300;

/// Restriction a route can place on the verification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// 9E public key or operator admin key.
    Pubkey,
    /// The token's most recent unexpired recovery token.
    Hmac,
}

// ── Signature header ─────────────────────────────────────────────────────────

/// Parsed `Authorization: Signature keyId="..",algorithm="..",headers="..",
/// signature=".."` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    pub fn is_hmac(&self) -> bool {
        self.algorithm.starts_with("hmac-")
    }
}

/// Parse the Authorization header. The scheme MUST be `Signature`.
pub fn parse_authorization(value: &str) -> Result<SignatureHeader, ApiError> {
    let params = value
        .strip_prefix("Signature ")
        .ok_or_else(|| ApiError::unauthorized("authorization scheme must be Signature"))?;

    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = Vec::new();
    let mut signature = None;

    for part in params.split(',') {
        let Some((name, raw)) = part.trim().split_once('=') else {
            continue;
        };
        let val = raw.trim().trim_matches('"');
        match name {
            "keyId" => key_id = Some(val.to_string()),
            "algorithm" => algorithm = Some(val.to_string()),
            "headers" => {
                headers = val.split_whitespace().map(|h| h.to_ascii_lowercase()).collect();
            }
            "signature" => signature = Some(val.to_string()),
            _ => {}
        }
    }

    let signature = signature
        .ok_or_else(|| ApiError::unauthorized("signature parameter missing"))?;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(signature.as_bytes())
        .map_err(|_| ApiError::unauthorized("signature is not valid base64"))?;

    Ok(SignatureHeader {
        key_id: key_id.unwrap_or_default(),
        algorithm: algorithm
            .ok_or_else(|| ApiError::unauthorized("algorithm parameter missing"))?,
        headers,
        signature,
    })
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized(format!("signed header '{}' missing", name)))
}

/// Build the string the client signed. With no `headers` parameter the
/// Date header value alone is signed; otherwise one `name: value` line per
/// named header.
pub fn signing_string(parsed: &SignatureHeader, headers: &HeaderMap) -> Result<String, ApiError> {
    if parsed.headers.is_empty() {
        return Ok(header_value(headers, "date")?.to_string());
    }
    let mut lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        lines.push(format!("{}: {}", name, header_value(headers, name)?));
    }
    Ok(lines.join("\n"))
}

/// Reject requests whose signed date has drifted too far; a replayed
/// signature goes stale within the skew window.
fn check_date_skew(headers: &HeaderMap, now: DateTime<Utc>) -> Result<(), ApiError> {
    let raw = header_value(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map_err(|_| ApiError::unauthorized("date header is not a valid date"))?;
    if (now - date.with_timezone(&Utc)).num_seconds().abs() > MAX_SKEW_SECS {
        return Err(ApiError::unauthorized("date header outside clock-skew window"));
    }
    Ok(())
}

// ── Verification ─────────────────────────────────────────────────────────────

fn verify_hmac(algorithm: &str, key: &[u8], data: &[u8], sig: &[u8]) -> Result<(), ApiError> {
    let ok = match algorithm {
        "hmac-sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(ApiError::internal)?;
            mac.update(data);
            mac.verify_slice(sig).is_ok()
        }
        "hmac-sha512" => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(ApiError::internal)?;
            mac.update(data);
            mac.verify_slice(sig).is_ok()
        }
        other => {
            return Err(ApiError::unauthorized(format!(
                "unsupported hmac algorithm '{}'",
                other
            )));
        }
    };
    if ok {
        Ok(())
    } else {
        Err(ApiError::unauthorized("hmac verification failed"))
    }
}

fn verify_pubkey(key_line: &str, data: &[u8], sig: &[u8]) -> bool {
    match parse_pubkey_line(key_line) {
        Ok(key) => key.verify_detached(data, sig),
        Err(_) => false,
    }
}

/// Authenticate a request against a loaded PIV token.
///
/// HMAC algorithms verify against the token's newest unexpired recovery
/// token, selected by `created` ordering. Anything else verifies against
/// the 9E public key, then falls back to the configured operator admin
/// keys.
pub async fn authenticate(
    state: &AppState,
    piv: &PivToken,
    headers: &HeaderMap,
    require: Option<AuthScheme>,
) -> Result<(), ApiError> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("authorization header required"))?;
    let parsed = parse_authorization(raw)?;

    let now = Utc::now();
    check_date_skew(headers, now)?;
    let signing = signing_string(&parsed, headers)?;

    match (parsed.is_hmac(), require) {
        (false, Some(AuthScheme::Hmac)) => {
            return Err(ApiError::unauthorized("this endpoint requires an hmac signature"));
        }
        (true, Some(AuthScheme::Pubkey)) => {
            return Err(ApiError::unauthorized("this endpoint requires a key signature"));
        }
        _ => {}
    }

    if parsed.is_hmac() {
        let newest = recovery_token::newest_active(state.store.as_ref(), &piv.guid)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::unauthorized("no recovery token available for hmac"))?;
        let key = newest
            .doc
            .token_bytes()
            .map_err(ApiError::internal)?;
        return verify_hmac(&parsed.algorithm, &key, signing.as_bytes(), &parsed.signature);
    }

    if verify_pubkey(&piv.pubkeys.key_9e, signing.as_bytes(), &parsed.signature) {
        return Ok(());
    }
    for admin in &state.config.admin_keys {
        if verify_pubkey(admin, signing.as_bytes(), &parsed.signature) {
            return Ok(());
        }
    }
    Err(ApiError::unauthorized("signature verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use warden_config::WardenConfig;
    use warden_domain::{Guid, PubKeys, RecoveryConfiguration, SCHEMA_VERSION};
    use warden_store::InMemoryStore;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(InMemoryStore::new()),
            config: Arc::new(WardenConfig::default()),
        }
    }

    fn piv() -> PivToken {
        PivToken {
            v: SCHEMA_VERSION,
            guid: Guid::parse("97496DD1C8F053DE7450CD854D9C95B4").unwrap(),
            cn_uuid: uuid::Uuid::new_v4(),
            serial: None,
            model: None,
            pubkeys: PubKeys {
                key_9a: None,
                key_9d: None,
                // Well-formed line; signatures against it will simply fail.
                key_9e: format!(
                    "ssh-ed25519 {} cn@example",
                    {
                        use russh_keys::PublicKeyBase64;
                        russh_keys::key::KeyPair::generate_ed25519().public_key_base64()
                    }
                ),
            },
            attestation: None,
            pin: "123456".into(),
            created: Utc::now(),
        }
    }

    fn hmac_sign(key: &[u8], data: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn headers_with(date: &str, authorization: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("date", date.parse().unwrap());
        h.insert(AUTHORIZATION, authorization.parse().unwrap());
        h
    }

    async fn seed_recovery_token(state: &AppState, piv: &PivToken) -> Vec<u8> {
        let config = RecoveryConfiguration::from_template("AAAA==", Utc::now()).unwrap();
        let token =
            recovery_token::create_token(state.store.as_ref(), piv, &config, Utc::now())
                .await
                .unwrap();
        token.token_bytes().unwrap()
    }

    #[test]
    fn parse_authorization_extracts_parameters() {
        let parsed = parse_authorization(
            "Signature keyId=\"/piv/keys/9e\",algorithm=\"hmac-sha256\",headers=\"date\",signature=\"AAAA\"",
        )
        .unwrap();
        assert_eq!(parsed.key_id, "/piv/keys/9e");
        assert_eq!(parsed.algorithm, "hmac-sha256");
        assert_eq!(parsed.headers, vec!["date"]);
        assert!(parsed.is_hmac());
    }

    #[test]
    fn parse_authorization_rejects_other_schemes() {
        assert!(parse_authorization("Bearer abc").is_err());
        assert!(parse_authorization("Signature algorithm=\"rsa-sha256\"").is_err());
    }

    #[tokio::test]
    async fn missing_authorization_header_is_unauthorized() {
        let state = test_state();
        let mut headers = HeaderMap::new();
        headers.insert("date", Utc::now().to_rfc2822().parse().unwrap());
        let err = authenticate(&state, &piv(), &headers, None).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hmac_with_newest_recovery_token_succeeds() {
        let state = test_state();
        let piv = piv();
        let key = seed_recovery_token(&state, &piv).await;

        let date = Utc::now().to_rfc2822();
        let auth = format!(
            "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
            piv.guid,
            hmac_sign(&key, &date),
        );
        authenticate(&state, &piv, &headers_with(&date, &auth), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hmac_with_wrong_key_fails() {
        let state = test_state();
        let piv = piv();
        seed_recovery_token(&state, &piv).await;

        let date = Utc::now().to_rfc2822();
        let auth = format!(
            "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
            piv.guid,
            hmac_sign(b"not the right key", &date),
        );
        let err = authenticate(&state, &piv, &headers_with(&date, &auth), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hmac_uses_newest_token_not_an_expired_one() {
        let state = test_state();
        let piv = piv();
        // First token (later expired by the second create's sibling rule).
        let old_key = seed_recovery_token(&state, &piv).await;
        let new_key = seed_recovery_token(&state, &piv).await;
        assert_ne!(old_key, new_key);

        let date = Utc::now().to_rfc2822();
        let auth = |key: &[u8]| {
            format!(
                "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
                piv.guid,
                hmac_sign(key, &date),
            )
        };

        // The expired first token no longer authenticates…
        assert!(authenticate(&state, &piv, &headers_with(&date, &auth(&old_key)), None)
            .await
            .is_err());
        // …the newest one does.
        authenticate(&state, &piv, &headers_with(&date, &auth(&new_key)), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_date_is_rejected_even_with_valid_hmac() {
        let state = test_state();
        let piv = piv();
        let key = seed_recovery_token(&state, &piv).await;

        let stale = (Utc::now() - Duration::seconds(3600)).to_rfc2822();
        let auth = format!(
            "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
            piv.guid,
            hmac_sign(&key, &stale),
        );
        let err = authenticate(&state, &piv, &headers_with(&stale, &auth), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hmac_required_rejects_pubkey_signature() {
        let state = test_state();
        let piv = piv();
        seed_recovery_token(&state, &piv).await;

        let date = Utc::now().to_rfc2822();
        let auth = "Signature keyId=\"x\",algorithm=\"rsa-sha256\",signature=\"AAAA\"";
        let err = authenticate(
            &state,
            &piv,
            &headers_with(&date, auth),
            Some(AuthScheme::Hmac),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bogus_pubkey_signature_is_rejected() {
        let state = test_state();
        let piv = piv();
        let date = Utc::now().to_rfc2822();
        let auth = "Signature keyId=\"x\",algorithm=\"rsa-sha256\",signature=\"AAAA\"";
        let err = authenticate(&state, &piv, &headers_with(&date, auth), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn signing_string_joins_named_headers() {
        let parsed = SignatureHeader {
            key_id: String::new(),
            algorithm: "hmac-sha256".into(),
            headers: vec!["date".into(), "host".into()],
            signature: vec![],
        };
        let mut h = HeaderMap::new();
        h.insert("date", "D".parse().unwrap());
        h.insert("host", "H".parse().unwrap());
        assert_eq!(signing_string(&parsed, &h).unwrap(), "date: D\nhost: H");

        let bare = SignatureHeader { headers: vec![], ..parsed };
        assert_eq!(signing_string(&bare, &h).unwrap(), "D");
    }
}
