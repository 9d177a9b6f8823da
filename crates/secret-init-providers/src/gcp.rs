//! Google Cloud Secret Manager provider.
//!
//! Authentication follows the Application Default Credentials order the
//! loader can support without an SDK: a service-account key file named by
//! `GOOGLE_APPLICATION_CREDENTIALS` (exchanged for an access token via a
//! signed JWT), falling back to the GCE metadata server.

use crate::provider::{split_pair, Provider, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PROVIDER_NAME: &str = "gcp";

const REFERENCE_PREFIX: &str = "gcp:secretmanager:";
const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

static VERSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*/versions/(latest|\d+)$").expect("valid version regex"));

/// Returns true when the value is a GCP Secret Manager reference.
pub fn valid(env_value: &str) -> bool {
    env_value.starts_with(REFERENCE_PREFIX)
}

pub struct GcpProvider {
    http: reqwest::Client,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    data: String,
}

#[derive(serde::Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

impl GcpProvider {
    pub async fn from_env() -> Result<Self> {
        let http = reqwest::Client::new();
        let access_token = match std::env::var(CREDENTIALS_ENV) {
            Ok(key_file) => service_account_token(&http, &key_file).await?,
            Err(_) => metadata_token(&http).await?,
        };

        Ok(Self { http, access_token })
    }

    async fn access_secret_version(&self, name: &str) -> Result<String> {
        let url = format!("{SECRET_MANAGER_ENDPOINT}/{name}:access");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to access secret version {name}: {status} - {text}");
        }

        let parsed: AccessSecretVersionResponse =
            response.json().await.context("failed to parse response")?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&parsed.payload.data)
            .context("failed to decode secret payload")?;

        String::from_utf8(bytes).context("secret payload is not valid UTF-8")
    }
}

#[async_trait]
impl Provider for GcpProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn load_secrets(
        &self,
        cancel: &CancellationToken,
        refs: &[String],
    ) -> Result<Vec<Secret>> {
        let mut secrets = Vec::with_capacity(refs.len());

        for pair in refs {
            if cancel.is_cancelled() {
                anyhow::bail!("gcp secret load cancelled");
            }

            let (key, secret_id) = split_pair(pair)?;
            let secret_id = secret_id.trim_start_matches(REFERENCE_PREFIX);
            let secret_id = normalize_version(secret_id)?;
            debug!(key, secret_id = %secret_id, "loading GCP secret");

            let value = self.access_secret_version(&secret_id).await?;
            secrets.push(Secret::new(key, value));
        }

        Ok(secrets)
    }
}

/// Exchange a service-account key for an access token via a signed JWT.
async fn service_account_token(http: &reqwest::Client, key_file: &str) -> Result<String> {
    let key_json = std::fs::read_to_string(key_file)
        .with_context(|| format!("failed to read service account key {key_file}"))?;
    let key: ServiceAccountKey =
        serde_json::from_str(&key_json).context("failed to parse service account key")?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    let claims = JwtClaims {
        iss: &key.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + 3600,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .context("failed to parse service account private key")?;
    let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .context("failed to sign token request")?;

    let response = http
        .post(&key.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await
        .context("token exchange request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("token exchange failed: {status} - {text}");
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("failed to parse token response")?;
    Ok(token.access_token)
}

/// Fetch an access token from the GCE metadata server.
async fn metadata_token(http: &reqwest::Client) -> Result<String> {
    let response = http
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .context("metadata server request failed (set GOOGLE_APPLICATION_CREDENTIALS outside GCP)")?;

    if !response.status().is_success() {
        anyhow::bail!("metadata server returned {}", response.status());
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("failed to parse metadata token response")?;
    Ok(token.access_token)
}

/// Normalize a secret id to `projects/P/secrets/S/versions/V`.
///
/// Missing versions default to `latest`; garbage after the secret name is
/// dropped and replaced with `versions/latest`.
fn normalize_version(secret_id: &str) -> Result<String> {
    if VERSION_SUFFIX.is_match(secret_id) {
        return Ok(secret_id.to_string());
    }

    let slashes = secret_id.matches('/').count();
    match slashes {
        3 => Ok(format!("{secret_id}/versions/latest")),
        n if n >= 4 => {
            let head: Vec<&str> = secret_id.split('/').take(4).collect();
            Ok(format!("{}/versions/latest", head.join("/")))
        }
        _ => anyhow::bail!("invalid secret ID format: {secret_id}"),
    }
}
