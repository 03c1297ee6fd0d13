//! Environment-supplied configuration for uploads.
//!
//! Identity and credentials arrive through the environment so the tool can
//! run unattended from capture harnesses; anything missing or malformed is
//! a configuration error reported before any work starts.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use std::env;

pub const DEFAULT_BUCKET: &str = "traceship-uploads";
pub const DEFAULT_CHECK_URL: &str = "https://traceship.example.com/check_credentials";

const USER_VAR: &str = "TRACESHIP_USER";
const GROUP_VAR: &str = "TRACESHIP_GROUP";
const SECRET_VAR: &str = "TRACESHIP_USER_SECRET_KEY";
const BUCKET_VAR: &str = "TRACESHIP_BUCKET";
const CHECK_URL_VAR: &str = "TRACESHIP_CHECK_URL";

/// Upload identity plus the secret bundle from `TRACESHIP_USER_SECRET_KEY`:
/// a comma-joined triple `key-id,secret-key,base64(pkcs8-der signing key)`.
pub struct Config {
    pub user: String,
    pub group: String,
    pub key_id: String,
    pub secret_key: String,
    pub signing_key_der: Vec<u8>,
    pub bucket: String,
    pub check_url: String,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let user = require_var(USER_VAR)?;
        let group = require_var(GROUP_VAR)?;
        let secret = require_var(SECRET_VAR)?;
        let (key_id, secret_key, signing_key_der) = parse_secret_bundle(&secret)?;
        Ok(Config {
            user,
            group,
            key_id,
            secret_key,
            signing_key_der,
            bucket: env::var(BUCKET_VAR).unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            check_url: env::var(CHECK_URL_VAR).unwrap_or_else(|_| DEFAULT_CHECK_URL.to_string()),
        })
    }
}

fn require_var(name: &str) -> Result<String> {
    let value = env::var(name).map_err(|_| anyhow!("{name} is not set"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("{name} is empty"));
    }
    Ok(value)
}

fn parse_secret_bundle(raw: &str) -> Result<(String, String, Vec<u8>)> {
    let mut parts = raw.splitn(3, ',');
    let key_id = parts.next().unwrap_or_default();
    let secret_key = parts.next().unwrap_or_default();
    let signing_key = parts.next().unwrap_or_default();
    if key_id.is_empty() || secret_key.is_empty() || signing_key.is_empty() {
        return Err(anyhow!(
            "{SECRET_VAR} must be `key-id,secret-key,base64-signing-key`"
        ));
    }
    let der = base64::engine::general_purpose::STANDARD
        .decode(signing_key.trim())
        .context("decode signing key from secret bundle")?;
    Ok((key_id.to_string(), secret_key.to_string(), der))
}
