//! Vault/OpenBao HTTP client with retry logic.

use crate::vault::config::VaultConfig;
use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{ClientBuilder, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const KUBERNETES_SA_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Vault/Bao HTTP client.
///
/// Handles authentication, token management, and API requests against one
/// server. The token is fixed for the lifetime of the client: it is either
/// supplied directly (token / token file) or acquired once through the
/// role-based login flow during construction.
pub struct VaultClient {
    http: reqwest::Client,
    address: String,
    token: String,
    namespace: Option<String>,
    max_retries: u32,
}

/// Generic Vault API response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub lease_duration: Option<u64>,
    #[serde(default)]
    pub renewable: Option<bool>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
}

/// Authentication info from a login response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfo {
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

impl VaultClient {
    /// Build a client from the flavor configuration, logging in when the
    /// role trio is configured.
    pub async fn new(config: &VaultConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(config.client_timeout)
            .pool_max_idle_per_host(4);

        if let Some(ref ca_path) = config.ca_cert {
            let ca_cert = std::fs::read(ca_path)
                .with_context(|| format!("failed to read CA file {ca_path}"))?;
            let cert = reqwest::Certificate::from_pem(&ca_cert)
                .context("failed to parse CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("failed to build HTTP client")?;

        let mut client = Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            namespace: config.namespace.clone(),
            max_retries: config.max_retries.max(1),
        };

        if client.token.is_empty() {
            client.login(config).await?;
        }

        info!(address = %client.address, flavor = config.flavor.scheme(), "connected to secret store");

        Ok(client)
    }

    /// The token currently in use (needed for login passthrough).
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Authenticate through `auth/<path>/login` using the configured role.
    ///
    /// For the kubernetes/jwt methods the pod service-account token is
    /// attached as the `jwt` field; other server-side methods take the bare
    /// role and leave method-specific extras to the server mount.
    async fn login(&mut self, config: &VaultConfig) -> Result<()> {
        let role = config
            .role
            .as_deref()
            .context("login requested without a role")?;
        let auth_path = config
            .auth_path
            .as_deref()
            .context("login requested without an auth path")?;
        let auth_method = config
            .auth_method
            .as_deref()
            .context("login requested without an auth method")?;

        let mut body = serde_json::json!({ "role": role });
        if matches!(auth_method, "kubernetes" | "jwt") {
            let jwt = std::fs::read_to_string(KUBERNETES_SA_TOKEN)
                .with_context(|| format!("failed to read service account token {KUBERNETES_SA_TOKEN}"))?;
            body["jwt"] = serde_json::Value::String(jwt.trim_end().to_string());
        }

        let url = format!("{}/v1/auth/{}/login", self.address, auth_path.trim_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to send login request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("login failed: {status} - {text}");
        }

        let api_response: ApiResponse =
            response.json().await.context("failed to parse login response")?;
        let auth = api_response
            .auth
            .context("no auth info in login response")?;

        debug!(
            auth_method,
            lease_duration_secs = auth.lease_duration,
            renewable = auth.renewable,
            "authenticated with secret store"
        );
        self.token = auth.client_token;

        Ok(())
    }

    /// Read a secret, optionally pinned to a KV v2 version.
    ///
    /// Returns `None` when the path does not exist.
    pub async fn read(&self, path: &str, version: Option<&str>) -> Result<Option<ApiResponse>> {
        let path = match version {
            Some(v) => format!("{}?version={}", path.trim_start_matches('/'), v),
            None => path.trim_start_matches('/').to_string(),
        };
        self.request_with_retry(Method::GET, &path).await
    }

    /// Write to a path with an empty body. Dynamic endpoints (PKI issuance,
    /// database credentials) generate a fresh secret on each write.
    pub async fn write(&self, path: &str) -> Result<Option<ApiResponse>> {
        self.request_with_retry(Method::POST, path.trim_start_matches('/'))
            .await
    }

    /// Renew a lease through `sys/leases/renew`.
    pub async fn renew_lease(&self, lease_id: &str, increment_secs: u64) -> Result<ApiResponse> {
        let body = serde_json::json!({ "lease_id": lease_id, "increment": increment_secs });
        let url = format!("{}/v1/sys/leases/renew", self.address);
        let response = self.apply_headers(self.http.put(&url)).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("lease renewal failed: {status} - {text}");
        }

        response
            .json()
            .await
            .context("failed to parse lease renewal response")
    }

    /// Revoke our own token (`auth/token/revoke-self`).
    pub async fn revoke_self(&self) -> Result<()> {
        let url = format!("{}/v1/auth/token/revoke-self", self.address);
        let response = self.apply_headers(self.http.post(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("token revocation failed: {status}");
        }

        Ok(())
    }

    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
    ) -> Result<Option<ApiResponse>> {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.do_request(&method, path).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempts >= self.max_retries || !is_retryable(&e) {
                        return Err(e);
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                error = %e,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                "retrying request after transient failure"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }

    async fn do_request(&self, method: &Method, path: &str) -> Result<Option<ApiResponse>> {
        let url = format!("{}/v1/{}", self.address, path);
        let request = self.apply_headers(self.http.request(method.clone(), &url));

        let response = request.send().await.context("request failed")?;

        match response.status() {
            StatusCode::OK => {
                let api_response: ApiResponse =
                    response.json().await.context("failed to parse response")?;
                Ok(Some(api_response))
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => {
                anyhow::bail!("forbidden: token may be invalid or insufficient permissions")
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("request failed: {status} - {text}")
            }
        }
    }

    fn apply_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("X-Vault-Token", &self.token);
        match &self.namespace {
            Some(ns) => request.header("X-Vault-Namespace", ns),
            None => request,
        }
    }
}

fn is_retryable(e: &anyhow::Error) -> bool {
    let text = e.to_string();
    text.contains("connection")
        || text.contains("timeout")
        || text.contains("502")
        || text.contains("503")
}
