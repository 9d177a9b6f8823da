//! Provider trait and the types shared by every loader.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A resolved secret, keyed by the environment variable name it will occupy
/// in the child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub key: String,
    pub value: String,
}

impl Secret {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Signal the renewer asks the supervisor to deliver to the child when a
/// lease can no longer be kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Term,
    Kill,
}

/// Options handed to provider factories by the dispatcher.
///
/// `renewal` is only populated in daemon mode; it is the channel the
/// Vault/Bao renewer uses to request child termination. The supervisor stays
/// the sole writer to the child's pid.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub daemon: bool,
    pub renewal: Option<mpsc::Sender<TerminationSignal>>,
}

/// Trait for secret providers.
///
/// A provider receives the references that matched its predicate, formatted
/// as `NAME=reference` pairs. It parses its own prefix, performs the fetch,
/// and returns destination-keyed secrets. Apart from Vault/Bao from-path
/// mode, a provider must not emit keys that were absent from its input.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider's registry name (e.g. "vault").
    fn name(&self) -> &'static str;

    /// Fetch all secrets for the given `NAME=reference` pairs.
    ///
    /// May block on network I/O; implementations observe `cancel` so the
    /// dispatcher can interrupt in-flight loads.
    async fn load_secrets(
        &self,
        cancel: &CancellationToken,
        refs: &[String],
    ) -> Result<Vec<Secret>>;
}

/// Split a `NAME=reference` pair as produced by the env store.
pub(crate) fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("malformed reference pair (expected NAME=reference): {pair}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pair() {
        let (key, reference) = split_pair("FOO=file:/etc/secret").unwrap();
        assert_eq!(key, "FOO");
        assert_eq!(reference, "file:/etc/secret");
    }

    #[test]
    fn test_split_pair_keeps_later_equals() {
        let (key, reference) = split_pair("DSN=scheme://u:p@h?a=b").unwrap();
        assert_eq!(key, "DSN");
        assert_eq!(reference, "scheme://u:p@h?a=b");
    }

    #[test]
    fn test_split_pair_malformed() {
        assert!(split_pair("NOEQUALS").is_err());
    }
}
