use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha512};
use uuid::{Builder, Uuid, Variant, Version};

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// A PIV token GUID: 32 upper-case hex digits, as printed on the token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Guid(String);

// Deserialization goes through `parse` so a GUID read back from storage or a
// request body is always normalized and well-formed.
impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Guid::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Guid {
    /// Parse and normalize a GUID. Lower-case input is accepted and
    /// upper-cased; anything that is not 32 hex digits is rejected.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidGuid(s.to_string()));
        }
        Ok(Guid(s.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Hash-derived UUIDs ───────────────────────────────────────────────────────

/// Derive a stable UUID from arbitrary bytes: the first 16 bytes of
/// SHA-512(input), stamped with RFC 4122 version 5 and variant bits `10`.
///
/// The bit layout matters: stored identifiers must round-trip, and duplicate
/// inputs must collapse to the same id.
pub fn derive_uuid(input: &[u8]) -> Uuid {
    let digest = Sha512::digest(input);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_bytes(bytes)
        .with_variant(Variant::RFC4122)
        .with_version(Version::Sha1)
        .into_uuid()
}
