//! Azure Key Vault provider.

use crate::provider::{split_pair, Provider, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PROVIDER_NAME: &str = "azure";

const REFERENCE_PREFIX: &str = "azure:keyvault:";
const KEY_VAULT_URL_ENV: &str = "AZURE_KEY_VAULT_URL";
const TENANT_ID_ENV: &str = "AZURE_TENANT_ID";
const CLIENT_ID_ENV: &str = "AZURE_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "AZURE_CLIENT_SECRET";
const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const API_VERSION: &str = "7.4";

/// Returns true when the value is an Azure Key Vault reference.
pub fn valid(env_value: &str) -> bool {
    env_value.starts_with(REFERENCE_PREFIX)
}

pub struct AzureProvider {
    http: reqwest::Client,
    vault_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

impl AzureProvider {
    pub async fn from_env() -> Result<Self> {
        let vault_url = std::env::var(KEY_VAULT_URL_ENV)
            .context("AZURE_KEY_VAULT_URL not set")?
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::new();
        let access_token = acquire_token(&http).await?;

        Ok(Self {
            http,
            vault_url,
            access_token,
        })
    }

    async fn get_secret(&self, name: &str, version: &str) -> Result<String> {
        let url = format!(
            "{}/secrets/{}/{}?api-version={API_VERSION}",
            self.vault_url, name, version
        );
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
            anyhow::bail!("failed to get secret {name}: {status} - {text}");
        }

        let bundle: SecretBundle = response.json().await.context("failed to parse response")?;
        Ok(bundle.value)
    }
}

#[async_trait]
impl Provider for AzureProvider {
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
                anyhow::bail!("azure secret load cancelled");
            }

            let (key, reference) = split_pair(pair)?;
            let (name, version) = parse_reference(reference);
            debug!(key, name, "loading Azure Key Vault secret");

            let value = self.get_secret(name, version).await?;
            secrets.push(Secret::new(key, value));
        }

        Ok(secrets)
    }
}

/// `azure:keyvault:<name>[/<version>]`; no version addresses the latest.
fn parse_reference(reference: &str) -> (&str, &str) {
    let rest = reference.trim_start_matches(REFERENCE_PREFIX);
    match rest.split_once('/') {
        Some((name, version)) => (name, version),
        None => (rest, ""),
    }
}

/// Client-credentials flow when the service principal env trio is present,
/// IMDS managed identity otherwise.
async fn acquire_token(http: &reqwest::Client) -> Result<String> {
    if let (Ok(tenant), Ok(client_id), Ok(client_secret)) = (
        std::env::var(TENANT_ID_ENV),
        std::env::var(CLIENT_ID_ENV),
        std::env::var(CLIENT_SECRET_ENV),
    ) {
        let url = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token");
        let response = http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", KEY_VAULT_SCOPE),
            ])
            .send()
            .await
            .context("token request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("client credentials login failed: {status} - {text}");
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("failed to parse token response")?;
        return Ok(token.access_token);
    }

    let response = http
        .get(IMDS_TOKEN_URL)
        .query(&[("api-version", "2018-02-01"), ("resource", KEY_VAULT_RESOURCE)])
        .header("Metadata", "true")
        .send()
        .await
        .context("managed identity request failed (set AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET outside Azure)")?;

    if !response.status().is_success() {
        anyhow::bail!("managed identity endpoint returned {}", response.status());
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("failed to parse managed identity token response")?;
    Ok(token.access_token)
}
