//! Vault/OpenBao provider.
//!
//! One implementation serves both flavors: the `vault:` and `bao:` reference
//! schemes share the wire protocol and differ only in the environment
//! namespace they are configured from.

mod client;
mod config;
mod injector;
mod renewer;

pub use client::{ApiResponse, VaultClient};
pub use config::{sanitize_set, Flavor, VaultConfig};
pub use injector::{InjectorConfig, SecretInjector};
pub use renewer::{Lease, Renewer};

use crate::provider::{split_pair, Provider, ProviderOptions, Secret};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

static VAULT_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(vault:)(.*)#(.*)").expect("valid vault reference regex"));
static BAO_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(bao:)(.*)#(.*)").expect("valid bao reference regex"));

/// Returns true when the value looks like a reference of the given flavor.
pub fn valid(flavor: Flavor, env_value: &str) -> bool {
    match flavor {
        Flavor::Vault => VAULT_REFERENCE.is_match(env_value),
        Flavor::Bao => BAO_REFERENCE.is_match(env_value),
    }
}

/// The env var that triggers provider instantiation even without direct
/// references (`VAULT_FROM_PATH` / `BAO_FROM_PATH`).
pub fn from_path_env(flavor: Flavor) -> String {
    flavor.env_name("FROM_PATH")
}

pub struct VaultProvider {
    config: VaultConfig,
    client: Arc<VaultClient>,
    injector_config: InjectorConfig,
    renewer: Option<Renewer>,
}

impl VaultProvider {
    /// Create a provider for one flavor, performing the login flow when the
    /// role trio is configured. In daemon mode a renewer is attached to the
    /// dispatcher's renewal channel.
    pub async fn new(flavor: Flavor, options: &ProviderOptions) -> Result<Self> {
        let config = VaultConfig::load(flavor)?;
        let client = Arc::new(VaultClient::new(&config).await?);

        let injector_config = InjectorConfig {
            ignore_missing_secrets: config.ignore_missing_secrets,
            daemon: options.daemon,
        };

        let renewer = if options.daemon {
            let sigs = options
                .renewal
                .clone()
                .context("daemon mode requires a renewal channel")?;
            info!(
                flavor = flavor.scheme(),
                "daemon mode enabled, will renew secrets in the background"
            );
            Some(Renewer::new(client.clone(), sigs))
        } else {
            None
        };

        Ok(Self {
            config,
            client,
            injector_config,
            renewer,
        })
    }

    async fn load_secrets_inner(&self, refs: &[String]) -> Result<Vec<Secret>> {
        let entries = refs
            .iter()
            .map(|pair| split_pair(pair).map(|(k, v)| (k.to_string(), v.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let mut injector = SecretInjector::new(
            self.config.flavor,
            self.injector_config,
            self.client.as_ref(),
            self.renewer.as_ref(),
        );

        let mut secrets = injector.inject_refs(&entries).await?;

        if !self.config.from_paths.is_empty() {
            secrets.extend(injector.inject_from_paths(&self.config.from_paths).await?);
        }

        // Provider-internal keys stay out of the dispatcher's result unless
        // login or passthrough rules retain them.
        secrets.retain(|s| self.config.allows_secret_key(&s.key));

        if self.config.is_login {
            secrets.push(Secret::new(
                self.config.flavor.env_name("TOKEN"),
                self.client.token(),
            ));
        }

        if self.config.revoke_token {
            // Revocation can be denied by policy; that is not fatal.
            if let Err(e) = self.client.revoke_self().await {
                warn!(error = %e, "failed to revoke token");
            }
        }

        Ok(secrets)
    }
}

#[async_trait]
impl Provider for VaultProvider {
    fn name(&self) -> &'static str {
        self.config.flavor.scheme()
    }

    async fn load_secrets(
        &self,
        cancel: &CancellationToken,
        refs: &[String],
    ) -> Result<Vec<Secret>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("{} secret load cancelled", self.config.flavor.scheme())
            }
            result = self.load_secrets_inner(refs) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_matches_reference_shapes() {
        assert!(valid(Flavor::Vault, "vault:secret/data/test#password"));
        assert!(valid(Flavor::Vault, ">>vault:pki/root/generate/internal#certificate"));
        assert!(valid(
            Flavor::Vault,
            "scheme://${vault:secret/data/acct#user}:${vault:secret/data/acct#pass}@h"
        ));
        assert!(!valid(Flavor::Vault, "vault:no-field-selector"));
        assert!(!valid(Flavor::Vault, "bao:secret/data/test#password"));

        assert!(valid(Flavor::Bao, "bao:secret/data/test#password"));
        assert!(!valid(Flavor::Bao, "vault:secret/data/test#password"));
    }

    #[test]
    fn test_from_path_env_names() {
        assert_eq!(from_path_env(Flavor::Vault), "VAULT_FROM_PATH");
        assert_eq!(from_path_env(Flavor::Bao), "BAO_FROM_PATH");
    }
}
