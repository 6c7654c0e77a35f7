//! On-disk JSON schemas (§3 of the specification). Every struct derives
//! `Serialize`/`Deserialize` with `#[serde(default)]` on optional fields so
//! unknown or missing fields round-trip without a schema version bump.
//!
//! `access_token`/`refresh_token`/`client_secret` are held as `SecretString`
//! so they're redacted from `Debug` output in logs, with a custom
//! serialize/deserialize pair (grounded on
//! `turbomcp-auth::config::OAuth2Config`'s `client_secret` field) so the
//! on-disk JSON still stores them as plain strings.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(SecretString::new(s))
}

fn serialize_optional_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(s.map(SecretString::new))
}

fn secrets_eq(a: &SecretString, b: &SecretString) -> bool {
    a.expose_secret() == b.expose_secret()
}

fn optional_secrets_eq(a: &Option<SecretString>, b: &Option<SecretString>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => secrets_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub client_secret: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: String,
}

impl PartialEq for ClientInfo {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
            && optional_secrets_eq(&self.client_secret, &other.client_secret)
            && self.client_id_issued_at == other.client_id_issued_at
            && self.client_secret_expires_at == other.client_secret_expires_at
            && self.redirect_uris == other.redirect_uris
            && self.token_endpoint_auth_method == other.token_endpoint_auth_method
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
    pub token_type: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub refresh_token: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl PartialEq for Tokens {
    fn eq(&self, other: &Self) -> bool {
        secrets_eq(&self.access_token, &other.access_token)
            && self.token_type == other.token_type
            && optional_secrets_eq(&self.refresh_token, &other.refresh_token)
            && self.expires_in == other.expires_in
            && self.expires_at == other.expires_at
            && self.scope == other.scope
    }
}

impl Tokens {
    /// A token is expired when `now + 30s >= expires_at`, or when
    /// `expires_at` is absent.
    pub fn is_expired(&self, now_unix_secs: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => now_unix_secs + 30 >= expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub port: u16,
    pub timestamp_ms: u64,
}
