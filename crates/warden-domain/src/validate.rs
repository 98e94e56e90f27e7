use serde_json::Value;

use crate::error::DomainError;
use crate::ids::Guid;

/// Upper bound accepted for `limit` on list endpoints.
pub const MAX_LIMIT: u64 = 1000;

// ── Field errors ─────────────────────────────────────────────────────────────

/// One entry of the `errors` array in an invalid-params response body.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    fn missing(field: &str) -> Self {
        FieldError {
            field: field.to_string(),
            code: "MissingParameter".to_string(),
            message: format!("'{}' is required", field),
        }
    }

    fn invalid(field: &str, message: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            code: "InvalidParameter".to_string(),
            message: message.into(),
        }
    }
}

// ── Checks ───────────────────────────────────────────────────────────────────

/// A per-field validation rule.
#[derive(Debug, Clone, Copy)]
pub enum Check {
    /// RFC 4122 UUID string.
    Uuid,
    /// PIV token GUID: 32 hex digits.
    Guid,
    /// ISO-8601 / RFC 3339 timestamp string.
    Iso8601,
    /// Any non-null value.
    Present,
    /// Non-empty string.
    NonEmptyString,
    /// Object with at least a `9e` entry; every entry a parseable SSH
    /// public-key line.
    PubKeys,
    Bool,
    /// Integer ≥ 1.
    PositiveInt,
    /// Integer in [0, max].
    BoundedInt { max: u64 },
    /// One of a fixed set of strings.
    Enum(&'static [&'static str]),
    /// Array of strings, each drawn from a whitelist. Used for `fields`
    /// projection parameters.
    FieldsArray(&'static [&'static str]),
}

/// Declarative request schema: required fields fail when absent, optional
/// fields are checked only when present. Unknown fields are ignored on
/// purpose, for forward compatibility.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub required: &'static [(&'static str, Check)],
    pub optional: &'static [(&'static str, Check)],
}

/// Validate `body` against `schema`, collecting every failure rather than
/// stopping at the first.
pub fn validate(schema: &Schema, body: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for (field, check) in schema.required {
        match body.get(*field) {
            None | Some(Value::Null) => errors.push(FieldError::missing(field)),
            Some(v) => {
                if let Err(e) = run_check(check, field, v) {
                    errors.push(e);
                }
            }
        }
    }

    for (field, check) in schema.optional {
        if let Some(v) = body.get(*field) {
            if v.is_null() {
                continue;
            }
            if let Err(e) = run_check(check, field, v) {
                errors.push(e);
            }
        }
    }

    errors
}

fn run_check(check: &Check, field: &str, value: &Value) -> Result<(), FieldError> {
    match check {
        Check::Present => Ok(()),
        Check::Uuid => {
            let s = as_str(field, value)?;
            uuid::Uuid::parse_str(s)
                .map(|_| ())
                .map_err(|_| FieldError::invalid(field, format!("'{}' is not a UUID", s)))
        }
        Check::Guid => {
            let s = as_str(field, value)?;
            Guid::parse(s)
                .map(|_| ())
                .map_err(|_| FieldError::invalid(field, format!("'{}' is not a GUID", s)))
        }
        Check::Iso8601 => {
            let s = as_str(field, value)?;
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|_| ())
                .map_err(|_| FieldError::invalid(field, format!("'{}' is not a timestamp", s)))
        }
        Check::NonEmptyString => {
            let s = as_str(field, value)?;
            if s.is_empty() {
                Err(FieldError::invalid(field, "must not be empty"))
            } else {
                Ok(())
            }
        }
        Check::PubKeys => check_pubkeys(field, value),
        Check::Bool => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(FieldError::invalid(field, "must be a boolean"))
            }
        }
        Check::PositiveInt => match value.as_u64() {
            Some(n) if n >= 1 => Ok(()),
            _ => Err(FieldError::invalid(field, "must be a positive integer")),
        },
        Check::BoundedInt { max } => match value.as_u64() {
            Some(n) if n <= *max => Ok(()),
            _ => Err(FieldError::invalid(field, format!("must be an integer ≤ {}", max))),
        },
        Check::Enum(allowed) => {
            let s = as_str(field, value)?;
            if allowed.contains(&s) {
                Ok(())
            } else {
                Err(FieldError::invalid(
                    field,
                    format!("must be one of: {}", allowed.join(", ")),
                ))
            }
        }
        Check::FieldsArray(whitelist) => {
            let items = value
                .as_array()
                .ok_or_else(|| FieldError::invalid(field, "must be an array"))?;
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| FieldError::invalid(field, "entries must be strings"))?;
                if !whitelist.contains(&s) {
                    return Err(FieldError::invalid(field, format!("unknown field '{}'", s)));
                }
            }
            Ok(())
        }
    }
}

fn as_str<'v>(field: &str, value: &'v Value) -> Result<&'v str, FieldError> {
    value
        .as_str()
        .ok_or_else(|| FieldError::invalid(field, "must be a string"))
}

fn check_pubkeys(field: &str, value: &Value) -> Result<(), FieldError> {
    let obj = value
        .as_object()
        .ok_or_else(|| FieldError::invalid(field, "must be an object"))?;
    if !obj.contains_key("9e") {
        return Err(FieldError::invalid(field, "'9e' key is required"));
    }
    for (slot, line) in obj {
        let line = line
            .as_str()
            .ok_or_else(|| FieldError::invalid(field, format!("'{}' must be a string", slot)))?;
        if parse_pubkey_line(line).is_err() {
            return Err(FieldError::invalid(
                field,
                format!("'{}' is not a valid public key line", slot),
            ));
        }
    }
    Ok(())
}

/// Parse one `<algo> <base64> [comment]` SSH public-key line.
pub fn parse_pubkey_line(line: &str) -> Result<russh_keys::key::PublicKey, DomainError> {
    let mut parts = line.split_whitespace();
    let _algo = parts
        .next()
        .ok_or_else(|| DomainError::InvalidPublicKey("empty line".into()))?;
    let b64 = parts
        .next()
        .ok_or_else(|| DomainError::InvalidPublicKey("missing key material".into()))?;
    russh_keys::parse_public_key_base64(b64)
        .map_err(|e| DomainError::InvalidPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;
    use serde_json::json;

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

    fn key_line() -> String {
        let key = KeyPair::generate_ed25519();
        format!("ssh-ed25519 {} test@warden", key.public_key_base64())
    }

    #[test]
    fn valid_body_passes() {
        let body = json!({
            "guid": "97496DD1C8F053DE7450CD854D9C95B4",
            "cn_uuid": "15966912-8fad-41cd-bd82-abe6468354b5",
            "pubkeys": { "9e": key_line() },
            "pin": "123456",
            "ignored_unknown_field": 42,
        });
        assert!(validate(&CREATE_PIV, &body).is_empty());
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let errs = validate(&CREATE_PIV, &json!({}));
        assert_eq!(errs.len(), 4);
        assert!(errs.iter().all(|e| e.code == "MissingParameter"));
    }

    #[test]
    fn bad_guid_and_uuid_are_flagged() {
        let body = json!({
            "guid": "nope",
            "cn_uuid": "nope",
            "pubkeys": { "9e": key_line() },
            "pin": "123456",
        });
        let errs = validate(&CREATE_PIV, &body);
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| e.code == "InvalidParameter"));
    }

    #[test]
    fn pubkeys_requires_9e() {
        let body = json!({
            "guid": "97496DD1C8F053DE7450CD854D9C95B4",
            "cn_uuid": "15966912-8fad-41cd-bd82-abe6468354b5",
            "pubkeys": { "9a": key_line() },
            "pin": "123456",
        });
        let errs = validate(&CREATE_PIV, &body);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "pubkeys");
    }

    #[test]
    fn pubkeys_rejects_garbage_key_material() {
        let body = json!({ "pubkeys": { "9e": "ssh-ed25519 not!base64" } });
        let schema = Schema { required: &[("pubkeys", Check::PubKeys)], optional: &[] };
        assert_eq!(validate(&schema, &body).len(), 1);
    }

    #[test]
    fn optional_fields_checked_only_when_present() {
        let schema = Schema {
            required: &[],
            optional: &[("created", Check::Iso8601), ("limit", Check::BoundedInt { max: MAX_LIMIT })],
        };
        assert!(validate(&schema, &json!({})).is_empty());
        assert!(validate(&schema, &json!({ "created": "2025-06-01T00:00:00Z" })).is_empty());
        assert_eq!(validate(&schema, &json!({ "created": "yesterday" })).len(), 1);
        assert_eq!(validate(&schema, &json!({ "limit": 100000 })).len(), 1);
    }

    #[test]
    fn enum_check_matches_fixed_set() {
        let schema = Schema {
            required: &[("action", Check::Enum(&["stage", "activate"]))],
            optional: &[],
        };
        assert!(validate(&schema, &json!({ "action": "stage" })).is_empty());
        assert_eq!(validate(&schema, &json!({ "action": "destroy" })).len(), 1);
    }

    #[test]
    fn fields_array_enforces_whitelist() {
        let schema = Schema {
            required: &[],
            optional: &[("fields", Check::FieldsArray(&["guid", "cn_uuid"]))],
        };
        assert!(validate(&schema, &json!({ "fields": ["guid"] })).is_empty());
        assert_eq!(validate(&schema, &json!({ "fields": ["pin"] })).len(), 1);
        assert_eq!(validate(&schema, &json!({ "fields": "guid" })).len(), 1);
    }

    #[test]
    fn parse_pubkey_line_accepts_generated_key() {
        assert!(parse_pubkey_line(&key_line()).is_ok());
        assert!(parse_pubkey_line("ssh-ed25519").is_err());
        assert!(parse_pubkey_line("").is_err());
    }
}
