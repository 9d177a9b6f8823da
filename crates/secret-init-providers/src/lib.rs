//! Secret store loaders for secret-init.
//!
//! This crate provides a unified loader interface over the supported secret
//! backends:
//! - File-based secrets mounted into the container
//! - HashiCorp Vault / OpenBao (references, templates, dynamic secrets,
//!   background lease renewal)
//! - AWS Secrets Manager and SSM Parameter Store
//! - Google Cloud Secret Manager
//! - Azure Key Vault
//! - Bitwarden Secrets Manager
//!
//! # Example
//!
//! ```no_run
//! use secret_init_providers::{registry, ProviderOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = registry::new_provider("file", &ProviderOptions::default()).await?;
//! let secrets = provider
//!     .load_secrets(
//!         &CancellationToken::new(),
//!         &["PASSWORD=file:/etc/secrets/password".to_string()],
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod aws;
pub mod azure;
pub mod bitwarden;
pub mod file;
pub mod gcp;
pub mod provider;
pub mod registry;
pub mod vault;

// Re-exports for convenience
pub use provider::{Provider, ProviderOptions, Secret, TerminationSignal};
pub use registry::{matching_providers, new_provider, Registration, REGISTRY};
