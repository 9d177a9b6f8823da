//! Bitwarden Secrets Manager provider.

use crate::provider::{split_pair, Provider, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "bitwarden";

const REFERENCE_PREFIX: &str = "bitwarden:";
const ACCESS_TOKEN_ENV: &str = "BITWARDEN_ACCESS_TOKEN";
const ORGANIZATION_ID_ENV: &str = "BITWARDEN_ORGANIZATION_ID";
const API_URL_ENV: &str = "BITWARDEN_API_URL";
const IDENTITY_URL_ENV: &str = "BITWARDEN_IDENTITY_URL";
const STATE_PATH_ENV: &str = "BITWARDEN_STATE_PATH";

const DEFAULT_API_URL: &str = "127.0.0.1:8400";
const DEFAULT_IDENTITY_URL: &str = "https://identity.bitwarden.com";

/// Returns true when the value is a Bitwarden reference.
pub fn valid(env_value: &str) -> bool {
    env_value.starts_with(REFERENCE_PREFIX)
}

#[derive(Debug, Clone)]
pub struct BitwardenConfig {
    pub access_token: String,
    pub organization_id: Option<Uuid>,
    pub api_url: String,
    pub identity_url: String,
    pub state_path: Option<String>,
}

impl BitwardenConfig {
    pub fn load() -> Result<Self> {
        let access_token =
            std::env::var(ACCESS_TOKEN_ENV).context("BITWARDEN_ACCESS_TOKEN not provided")?;

        let organization_id = match std::env::var(ORGANIZATION_ID_ENV) {
            Ok(raw) => Some(
                Uuid::parse_str(&raw)
                    .with_context(|| format!("failed to parse organization id {raw}"))?,
            ),
            Err(_) => None,
        };

        let api_url = std::env::var(API_URL_ENV).unwrap_or_else(|_| {
            warn!(api_url = DEFAULT_API_URL, "BITWARDEN_API_URL not provided, using default");
            DEFAULT_API_URL.to_string()
        });
        let identity_url =
            std::env::var(IDENTITY_URL_ENV).unwrap_or_else(|_| DEFAULT_IDENTITY_URL.to_string());

        Ok(Self {
            access_token,
            organization_id,
            api_url: ensure_scheme(&api_url),
            identity_url: ensure_scheme(&identity_url),
            state_path: std::env::var(STATE_PATH_ENV).ok().filter(|p| !p.is_empty()),
        })
    }
}

pub struct BitwardenProvider {
    http: reqwest::Client,
    config: BitwardenConfig,
    bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct SecretResponse {
    id: String,
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SecretIdentifiersResponse {
    #[serde(default)]
    secrets: Vec<SecretIdentifier>,
}

#[derive(Debug, Deserialize)]
struct SecretIdentifier {
    id: String,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct SecretsBundleResponse {
    #[serde(default)]
    data: Vec<SecretResponse>,
}

impl BitwardenProvider {
    pub async fn from_env() -> Result<Self> {
        let config = BitwardenConfig::load()?;
        let http = reqwest::Client::new();

        let bearer_token = access_token_login(&http, &config).await?;

        // SDK-style state persistence: remember the machine token so repeat
        // invocations can be debugged against the same session.
        if let Some(state_path) = &config.state_path
            && let Err(e) = std::fs::write(state_path, &bearer_token)
        {
            warn!(state_path = %state_path, error = %e, "failed to persist bitwarden state");
        }

        Ok(Self {
            http,
            config,
            bearer_token,
        })
    }

    async fn get_secret(&self, id: &str) -> Result<SecretResponse> {
        let url = format!("{}/secrets/{id}", self.config.api_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context("request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("failed to get secret {id}: {status}");
        }

        response.json().await.context("failed to parse secret response")
    }

    /// Fetch every secret in the organization and bundle them as one JSON
    /// document.
    async fn organization_bundle(&self, organization_id: &Uuid) -> Result<String> {
        let url = format!(
            "{}/organizations/{organization_id}/secrets",
            self.config.api_url
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context("request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("failed to list secrets: {}", response.status());
        }

        let identifiers: SecretIdentifiersResponse = response
            .json()
            .await
            .context("failed to parse secret identifiers")?;
        let ids: Vec<String> = identifiers.secrets.into_iter().map(|s| s.id).collect();

        let url = format!("{}/secrets/get-by-ids", self.config.api_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .context("request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("failed to get secrets by ids: {}", response.status());
        }

        let bundle: SecretsBundleResponse = response
            .json()
            .await
            .context("failed to parse secrets bundle")?;
        serde_json::to_string_pretty(&bundle).context("failed to serialize secrets bundle")
    }
}

#[async_trait]
impl Provider for BitwardenProvider {
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
                anyhow::bail!("bitwarden secret load cancelled");
            }

            let (key, reference) = split_pair(pair)?;
            let secret_id = reference.trim_start_matches(REFERENCE_PREFIX);
            debug!(key, secret_id, "loading Bitwarden secret");

            // The organization id as secret id is the bulk sentinel: the
            // whole organization's secrets come back as one JSON bundle
            // under the referencing variable.
            if let Some(organization_id) = &self.config.organization_id
                && secret_id == organization_id.to_string()
            {
                let bundle = self.organization_bundle(organization_id).await?;
                secrets.push(Secret::new(key, bundle));
                continue;
            }

            let secret = self.get_secret(secret_id).await?;
            secrets.push(Secret::new(key, secret.value));
        }

        Ok(secrets)
    }
}

/// Exchange the machine access token for a bearer token.
///
/// Access tokens have the shape `0.<client_id>.<client_secret>:<enc_key>`;
/// the credential part before the colon drives a client-credentials login
/// against the identity service.
async fn access_token_login(
    http: &reqwest::Client,
    config: &BitwardenConfig,
) -> Result<String> {
    let (client_id, client_secret) = parse_access_token(&config.access_token)?;

    let url = format!("{}/connect/token", config.identity_url);
    let response = http
        .post(&url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("scope", "api.secrets"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .context("failed to login to bitwarden")?;

    if !response.status().is_success() {
        let status = response.status();
        anyhow::bail!("bitwarden login failed: {status}");
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("failed to parse login response")?;
    Ok(token.access_token)
}

fn parse_access_token(token: &str) -> Result<(&str, &str)> {
    let credentials = token.split(':').next().unwrap_or(token);
    let mut parts = credentials.splitn(3, '.');
    let _version = parts.next();
    let client_id = parts.next();
    let client_secret = parts.next();

    match (client_id, client_secret) {
        (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
        _ => anyhow::bail!("malformed bitwarden access token"),
    }
}

fn ensure_scheme(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
