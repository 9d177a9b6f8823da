//! File-based provider for secrets mounted into the container filesystem.

use crate::provider::{split_pair, Provider, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PROVIDER_NAME: &str = "file";

const REFERENCE_PREFIX: &str = "file:";
const MOUNT_PATH_ENV: &str = "FILE_MOUNT_PATH";

/// Returns true when the value is a `file:` reference.
pub fn valid(env_value: &str) -> bool {
    env_value.starts_with(REFERENCE_PREFIX)
}

pub struct FileProvider {
    mount_path: PathBuf,
}

impl FileProvider {
    /// Create a provider rooted at `FILE_MOUNT_PATH` (default "/").
    pub fn from_env() -> Result<Self> {
        let mount_path =
            PathBuf::from(std::env::var(MOUNT_PATH_ENV).unwrap_or_else(|_| "/".to_string()));
        Self::new(mount_path)
    }

    pub fn new(mount_path: PathBuf) -> Result<Self> {
        let metadata = std::fs::metadata(&mount_path)
            .with_context(|| format!("failed to access path {}", mount_path.display()))?;
        if !metadata.is_dir() {
            anyhow::bail!("provided path {} is not a directory", mount_path.display());
        }

        Ok(Self { mount_path })
    }

    async fn secret_from_file(&self, value_path: &str) -> Result<String> {
        let relative = value_path.trim_start_matches('/');
        let full_path: PathBuf = Path::new(&self.mount_path).join(relative);
        let content = tokio::fs::read_to_string(&full_path)
            .await
            .with_context(|| format!("failed to read file {}", full_path.display()))?;
        debug!(path = %full_path.display(), "read secret from file");

        Ok(content)
    }
}

#[async_trait]
impl Provider for FileProvider {
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
                anyhow::bail!("file secret load cancelled");
            }

            let (key, reference) = split_pair(pair)?;
            let value_path = reference.trim_start_matches(REFERENCE_PREFIX);
            let value = self.secret_from_file(value_path).await?;
            secrets.push(Secret::new(key, value));
        }

        Ok(secrets)
    }
}
