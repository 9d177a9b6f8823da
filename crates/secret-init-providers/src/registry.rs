//! The closed set of supported providers.

use crate::provider::{Provider, ProviderOptions};
use crate::vault::Flavor;
use crate::{aws, azure, bitwarden, file, gcp, vault};
use anyhow::{Context, Result};

/// A provider registration: its registry name and the predicate deciding
/// whether an environment value is one of its references.
pub struct Registration {
    pub name: &'static str,
    pub matches: fn(&str) -> bool,
}

fn vault_matches(value: &str) -> bool {
    vault::valid(Flavor::Vault, value)
}

fn bao_matches(value: &str) -> bool {
    vault::valid(Flavor::Bao, value)
}

/// All supported providers, in deterministic iteration order.
pub static REGISTRY: &[Registration] = &[
    Registration {
        name: file::PROVIDER_NAME,
        matches: file::valid,
    },
    Registration {
        name: Flavor::Vault.scheme(),
        matches: vault_matches,
    },
    Registration {
        name: Flavor::Bao.scheme(),
        matches: bao_matches,
    },
    Registration {
        name: aws::PROVIDER_NAME,
        matches: aws::valid,
    },
    Registration {
        name: gcp::PROVIDER_NAME,
        matches: gcp::valid,
    },
    Registration {
        name: azure::PROVIDER_NAME,
        matches: azure::valid,
    },
    Registration {
        name: bitwarden::PROVIDER_NAME,
        matches: bitwarden::valid,
    },
];

/// Providers an environment value belongs to. A value may match more than
/// one predicate; each matching provider is expected to parse only its own
/// references.
pub fn matching_providers(value: &str) -> Vec<&'static str> {
    REGISTRY
        .iter()
        .filter(|registration| (registration.matches)(value))
        .map(|registration| registration.name)
        .collect()
}

/// Construct a live provider by registry name. The set is closed; an
/// unknown name is an error.
pub async fn new_provider(
    name: &str,
    options: &ProviderOptions,
) -> Result<Box<dyn Provider>> {
    match name {
        file::PROVIDER_NAME => {
            let provider =
                file::FileProvider::from_env().context("failed to create file provider")?;
            Ok(Box::new(provider))
        }
        "vault" => {
            let provider = vault::VaultProvider::new(Flavor::Vault, options)
                .await
                .context("failed to create vault provider")?;
            Ok(Box::new(provider))
        }
        "bao" => {
            let provider = vault::VaultProvider::new(Flavor::Bao, options)
                .await
                .context("failed to create bao provider")?;
            Ok(Box::new(provider))
        }
        aws::PROVIDER_NAME => {
            let provider = aws::AwsProvider::from_env().context("failed to create aws provider")?;
            Ok(Box::new(provider))
        }
        gcp::PROVIDER_NAME => {
            let provider = gcp::GcpProvider::from_env()
                .await
                .context("failed to create gcp provider")?;
            Ok(Box::new(provider))
        }
        azure::PROVIDER_NAME => {
            let provider = azure::AzureProvider::from_env()
                .await
                .context("failed to create azure provider")?;
            Ok(Box::new(provider))
        }
        bitwarden::PROVIDER_NAME => {
            let provider = bitwarden::BitwardenProvider::from_env()
                .await
                .context("failed to create bitwarden provider")?;
            Ok(Box::new(provider))
        }
        other => anyhow::bail!("provider {other} is not supported"),
    }
}
