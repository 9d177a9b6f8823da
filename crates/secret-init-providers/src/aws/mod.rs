//! AWS provider: Secrets Manager and SSM Parameter Store.

mod config;
mod sign;

pub use config::{AwsConfig, Credentials};

use crate::provider::{split_pair, Provider, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PROVIDER_NAME: &str = "aws";

const SECRETS_MANAGER_PREFIX: &str = "arn:aws:secretsmanager:";
const SSM_PREFIX: &str = "arn:aws:ssm:";

/// Returns true when the value is an AWS Secrets Manager or SSM ARN.
pub fn valid(env_value: &str) -> bool {
    env_value.starts_with(SECRETS_MANAGER_PREFIX) || env_value.starts_with(SSM_PREFIX)
}

pub struct AwsProvider {
    http: reqwest::Client,
    config: AwsConfig,
}

#[derive(Debug, Deserialize)]
struct GetSecretValueResponse {
    #[serde(rename = "SecretString")]
    secret_string: Option<String>,
    #[serde(rename = "SecretBinary")]
    secret_binary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetParameterResponse {
    #[serde(rename = "Parameter")]
    parameter: Parameter,
}

#[derive(Debug, Deserialize)]
struct Parameter {
    #[serde(rename = "Value")]
    value: String,
}

impl AwsProvider {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            config: AwsConfig::load()?,
        })
    }

    async fn json_rpc<T: serde::de::DeserializeOwned>(
        &self,
        service: &str,
        target: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let host = format!("{service}.{}.amazonaws.com", self.config.region);
        let payload = serde_json::to_vec(&body)?;

        let signed = sign::sign_post(
            &host,
            &self.config.region,
            service,
            &[
                ("content-type", "application/x-amz-json-1.1"),
                ("x-amz-target", target),
            ],
            &payload,
            &self.config.credentials,
            OffsetDateTime::now_utc(),
        );

        let mut request = self
            .http
            .post(format!("https://{host}/"))
            .header("content-type", "application/x-amz-json-1.1")
            .header("x-amz-target", target)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(payload);
        if let Some(token) = &self.config.credentials.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await.context("request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{target} failed: {status} - {text}");
        }

        response.json().await.context("failed to parse response")
    }

    async fn secrets_manager_value(&self, secret_id: &str) -> Result<String> {
        let response: GetSecretValueResponse = self
            .json_rpc(
                "secretsmanager",
                "secretsmanager.GetSecretValue",
                serde_json::json!({ "SecretId": secret_id }),
            )
            .await
            .context("failed to get secret from AWS secrets manager")?;

        let bytes = extract_secret_value(&response)?;
        parse_secret_value(bytes)
    }

    async fn ssm_parameter_value(&self, parameter: &str) -> Result<String> {
        let response: GetParameterResponse = self
            .json_rpc(
                "ssm",
                "AmazonSSM.GetParameter",
                serde_json::json!({ "Name": parameter, "WithDecryption": true }),
            )
            .await
            .context("failed to get secret from AWS SSM")?;

        Ok(response.parameter.value)
    }
}

#[async_trait]
impl Provider for AwsProvider {
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
                anyhow::bail!("aws secret load cancelled");
            }

            let (key, secret_id) = split_pair(pair)?;
            debug!(key, secret_id, "loading AWS secret");

            if secret_id.contains("secretsmanager:") {
                let value = self.secrets_manager_value(secret_id).await?;
                secrets.push(Secret::new(key, value));
            } else if secret_id.contains("ssm:") {
                let value = self.ssm_parameter_value(secret_id).await?;
                secrets.push(Secret::new(key, value));
            }
        }

        Ok(secrets)
    }
}

/// A secret arrives either as a string or as base64 binary. Binary secrets
/// must decode to valid UTF-8; anything else fails rather than smuggling
/// replacement characters into the child environment.
fn extract_secret_value(response: &GetSecretValueResponse) -> Result<Vec<u8>> {
    if let Some(text) = &response.secret_string {
        return Ok(text.as_bytes().to_vec());
    }

    let encoded = response
        .secret_binary
        .as_deref()
        .context("secret has neither SecretString nor SecretBinary")?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("failed to decode binary secret")
}

/// Non-JSON payloads pass through verbatim. JSON payloads must be objects:
/// a single-key object unwraps to that key's value, a multi-key object is
/// returned whole, and any other JSON shape is an error.
fn parse_secret_value(bytes: Vec<u8>) -> Result<String> {
    let text = String::from_utf8(bytes).context("secret value is not valid UTF-8")?;

    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
        return Ok(text);
    };

    let serde_json::Value::Object(object) = value else {
        anyhow::bail!("failed to unmarshal secret from AWS Secrets Manager: not a JSON object");
    };

    if object.len() == 1 {
        let value = object.values().next().expect("single entry");
        return serde_json::to_string(value).context("failed to serialize secret value");
    }

    serde_json::to_string(&object).context("failed to serialize secret value")
}
