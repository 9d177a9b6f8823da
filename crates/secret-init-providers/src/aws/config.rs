//! AWS provider configuration.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const REGION_ENV: &str = "AWS_REGION";
const DEFAULT_REGION_ENV: &str = "AWS_DEFAULT_REGION";
const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";
const LOAD_FROM_SHARED_CONFIG_ENV: &str = "AWS_LOAD_FROM_SHARED_CONFIG";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub credentials: Credentials,
}

impl AwsConfig {
    pub fn load() -> Result<Self> {
        let region = std::env::var(REGION_ENV)
            .or_else(|_| std::env::var(DEFAULT_REGION_ENV))
            .context("AWS region not configured (AWS_REGION / AWS_DEFAULT_REGION)")?;

        let shared = std::env::var(LOAD_FROM_SHARED_CONFIG_ENV)
            .map(|v| matches!(v.trim(), "1" | "t" | "true" | "TRUE" | "True"))
            .unwrap_or(false);

        let credentials = if shared {
            let home = std::env::var("HOME").context("HOME not set for shared AWS config")?;
            parse_shared_credentials(&Path::new(&home).join(".aws").join("credentials"))?
        } else {
            Credentials {
                access_key_id: std::env::var(ACCESS_KEY_ID_ENV)
                    .context("AWS_ACCESS_KEY_ID not set")?,
                secret_access_key: std::env::var(SECRET_ACCESS_KEY_ENV)
                    .context("AWS_SECRET_ACCESS_KEY not set")?,
                session_token: std::env::var(SESSION_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
            }
        };

        Ok(Self {
            region,
            credentials,
        })
    }
}

/// Read the `[default]` profile of an AWS shared credentials file.
fn parse_shared_credentials(path: &PathBuf) -> Result<Credentials> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read shared credentials file {}", path.display()))?;

    let mut in_default = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(profile) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_default = profile.trim() == "default";
            continue;
        }
        if !in_default {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Ok(Credentials {
        access_key_id: access_key_id
            .with_context(|| format!("aws_access_key_id missing in {}", path.display()))?,
        secret_access_key: secret_access_key
            .with_context(|| format!("aws_secret_access_key missing in {}", path.display()))?,
        session_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_shared_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "# comment\n[other]\naws_access_key_id = WRONG\n\n[default]\naws_access_key_id = AKID\naws_secret_access_key = SECRET\naws_session_token = TOKEN"
        )
        .unwrap();

        let credentials = parse_shared_credentials(&file.path().to_path_buf()).unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
        assert_eq!(credentials.secret_access_key, "SECRET");
        assert_eq!(credentials.session_token.as_deref(), Some("TOKEN"));
    }

    #[test]
    fn test_parse_shared_credentials_missing_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[default]\naws_access_key_id = AKID").unwrap();

        assert!(parse_shared_credentials(&file.path().to_path_buf()).is_err());
    }
}
