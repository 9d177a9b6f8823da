// SPDX-License-Identifier: AGPL-3.0-only

//! The environment store: a snapshot of the inherited environment, its
//! classification into per-provider secret references, the concurrent load
//! across providers, and the assembly of the child environment.

use anyhow::{Context, Result};
use secret_init_providers::vault::{self, Flavor};
use secret_init_providers::{matching_providers, new_provider, ProviderOptions, Secret};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Immutable snapshot of the process environment taken at startup.
pub struct EnvStore {
    data: HashMap<String, String>,
}

impl EnvStore {
    pub fn from_env() -> Self {
        Self {
            data: std::env::vars().collect(),
        }
    }

    #[cfg(test)]
    fn with_data(data: HashMap<String, String>) -> Self {
        Self { data }
    }

    /// Group environment entries into per-provider reference lists.
    ///
    /// An entry is appended as `NAME=value` to every provider whose
    /// predicate accepts the value; entries matching nothing are ignored.
    /// A configured `VAULT_FROM_PATH` / `BAO_FROM_PATH` forces its provider
    /// into the result even with no direct references, so the dispatcher
    /// still instantiates it.
    pub fn secret_references(&self) -> HashMap<&'static str, Vec<String>> {
        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();

        for (name, value) in &self.data {
            for provider in matching_providers(value) {
                references
                    .entry(provider)
                    .or_default()
                    .push(format!("{name}={value}"));
            }
        }

        for flavor in [Flavor::Vault, Flavor::Bao] {
            let has_from_path = self
                .data
                .get(&vault::from_path_env(flavor))
                .is_some_and(|v| !v.is_empty());
            if has_from_path {
                references.entry(flavor.scheme()).or_default();
            }
        }

        references
    }

    /// Load secrets from every detected provider.
    ///
    /// Providers run concurrently; one failure does not cancel its peers,
    /// and all workers are joined before errors are reported. The result is
    /// all-or-nothing: any provider failure discards every loaded secret.
    pub async fn load_provider_secrets(
        &self,
        cancel: &CancellationToken,
        mut references: HashMap<&'static str, Vec<String>>,
        options: &ProviderOptions,
    ) -> Result<Vec<Secret>> {
        let mut secrets = Vec::new();

        // The Bao client still reads VAULT_ADDR, so the two providers cannot
        // share process state concurrently: load Vault first, serially.
        // Remove once the Bao client reads only BAO_ADDR.
        if needs_vault_barrier(&references) {
            let refs = references.remove(Flavor::Vault.scheme()).expect("vault group present");
            let provider = new_provider(Flavor::Vault.scheme(), options)
                .await
                .context("failed to create provider vault")?;
            secrets = provider
                .load_secrets(cancel, &refs)
                .await
                .context("failed to load secrets for provider vault")?;
        }

        let error_capacity = references.len().max(1);
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(error_capacity);
        let sink = Arc::new(Mutex::new(secrets));
        let mut workers = JoinSet::new();

        for (name, refs) in references {
            let cancel = cancel.clone();
            let options = options.clone();
            let sink = sink.clone();
            let err_tx = err_tx.clone();

            workers.spawn(async move {
                debug!(provider = name, references = refs.len(), "loading provider secrets");
                let provider = match new_provider(name, &options).await {
                    Ok(provider) => provider,
                    Err(e) => {
                        let _ = err_tx
                            .send(e.context(format!("failed to create provider {name}")))
                            .await;
                        return;
                    }
                };

                match provider.load_secrets(&cancel, &refs).await {
                    Ok(mut secrets) => sink.lock().await.append(&mut secrets),
                    Err(e) => {
                        let _ = err_tx
                            .send(e.context(format!("failed to load secrets for provider {name}")))
                            .await;
                    }
                }
            });
        }
        drop(err_tx);

        while workers.join_next().await.is_some() {}

        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            errors.push(e);
        }
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|e| format!("{e:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("{joined}");
        }

        let sink = Arc::try_unwrap(sink).expect("all workers joined").into_inner();
        Ok(sink)
    }

    /// Assemble the child environment: the inherited snapshot minus secret
    /// references and provider-internal keys, merged with the resolved
    /// secrets. The same destination key resolved twice is an error rather
    /// than last-writer-wins.
    pub fn to_child_env(&self, secrets: Vec<Secret>) -> Result<Vec<(String, String)>> {
        let mut sanitize: HashSet<String> = vault::sanitize_set(Flavor::Vault);
        sanitize.extend(vault::sanitize_set(Flavor::Bao));

        let mut environment: BTreeMap<String, String> = self
            .data
            .iter()
            .filter(|(name, _)| !sanitize.contains(name.as_str()))
            .filter(|(_, value)| matching_providers(value).is_empty())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut resolved_keys = HashSet::new();
        for secret in secrets {
            if !resolved_keys.insert(secret.key.clone()) {
                anyhow::bail!(
                    "duplicate secret key {} resolved by more than one provider",
                    secret.key
                );
            }
            environment.insert(secret.key, secret.value);
        }

        Ok(environment.into_iter().collect())
    }
}

/// Whether the serial Vault-first workaround applies: only when both a
/// Vault group and a Bao group are present.
fn needs_vault_barrier(references: &HashMap<&'static str, Vec<String>>) -> bool {
    references.contains_key(Flavor::Vault.scheme())
        && references.contains_key(Flavor::Bao.scheme())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex as StdMutex, MutexGuard};
    use std::time::Duration;

    static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    fn scoped_env(vars: &[(&str, &str)]) -> MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for name in [
            "VAULT_TOKEN",
            "VAULT_ADDR",
            "VAULT_PASSTHROUGH",
            "VAULT_FROM_PATH",
            "BAO_TOKEN",
            "BAO_ADDR",
            "BAO_PASSTHROUGH",
            "BAO_FROM_PATH",
        ] {
            unsafe { std::env::remove_var(name) };
        }
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        guard
    }

    fn store(entries: &[(&str, &str)]) -> EnvStore {
        EnvStore::with_data(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn sorted(mut refs: Vec<String>) -> Vec<String> {
        refs.sort();
        refs
    }

    #[test]
    fn test_secret_references_classification() {
        let _guard = scoped_env(&[]);
        let store = store(&[
            ("AWS_SECRET_ACCESS_KEY_ID", "file:secret/data/test/aws"),
            ("MYSQL_PASSWORD", "vault:secret/data/test/mysql#MYSQL_PASSWORD"),
            ("ROOT_CERT", ">>vault:pki/root/generate/internal#certificate"),
            (
                "INLINE_SECRET",
                "scheme://${vault:secret/data/account#username}:${vault:secret/data/account#password}@127.0.0.1:8080",
            ),
            ("RABBITMQ_USERNAME", "bao:secret/data/test/rabbitmq#RABBITMQ_USERNAME"),
            ("AWS_SECRET1", "arn:aws:secretsmanager:us-west-2:123456789012:secret:my-secret"),
            ("AWS_SECRET2", "arn:aws:ssm:us-west-2:123456789012:parameter/my-parameter"),
            ("GCP_SECRET1", "gcp:secretmanager:projects/my-project/secrets/my-secret/versions/1"),
            ("AZURE_SECRET1", "azure:keyvault:my-keyvault/my-secret"),
            ("BITWARDEN_SECRET", "bitwarden:6c8c7b33-7bd8-4d4f-9e62-1a2b3c4d5e6f"),
            ("PLAIN", "just a value"),
        ]);

        let references = store.secret_references();

        assert_eq!(
            sorted(references["file"].clone()),
            vec!["AWS_SECRET_ACCESS_KEY_ID=file:secret/data/test/aws"]
        );
        assert_eq!(
            sorted(references["vault"].clone()),
            vec![
                "INLINE_SECRET=scheme://${vault:secret/data/account#username}:${vault:secret/data/account#password}@127.0.0.1:8080",
                "MYSQL_PASSWORD=vault:secret/data/test/mysql#MYSQL_PASSWORD",
                "ROOT_CERT=>>vault:pki/root/generate/internal#certificate",
            ]
        );
        assert_eq!(
            sorted(references["bao"].clone()),
            vec!["RABBITMQ_USERNAME=bao:secret/data/test/rabbitmq#RABBITMQ_USERNAME"]
        );
        assert_eq!(references["aws"].len(), 2);
        assert_eq!(references["gcp"].len(), 1);
        assert_eq!(references["azure"].len(), 1);
        assert_eq!(references["bitwarden"].len(), 1);
        assert!(!references.contains_key("PLAIN"));
    }

    #[test]
    fn test_entry_appears_once_per_matching_provider() {
        let _guard = scoped_env(&[]);
        let store = store(&[("MYSQL_PASSWORD", "vault:secret/data/test#password")]);
        let references = store.secret_references();
        assert_eq!(references["vault"].len(), 1);
        assert_eq!(references.len(), 1);
    }

    #[test]
    fn test_from_path_forces_provider_instantiation() {
        let _guard = scoped_env(&[]);
        let store = store(&[
            ("VAULT_FROM_PATH", "secret/data/app"),
            ("PLAIN", "value"),
        ]);

        let references = store.secret_references();
        assert_eq!(references["vault"], Vec::<String>::new());
    }

    #[test]
    fn test_from_path_does_not_duplicate_existing_group() {
        let _guard = scoped_env(&[]);
        let store = store(&[
            ("BAO_FROM_PATH", "secret/data/app"),
            ("PASSWORD", "bao:secret/data/test#password"),
        ]);

        let references = store.secret_references();
        assert_eq!(references["bao"], vec!["PASSWORD=bao:secret/data/test#password"]);
    }

    #[test]
    fn test_vault_barrier_only_with_both_groups() {
        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();
        references.insert("vault", vec![]);
        assert!(!needs_vault_barrier(&references));

        references.insert("bao", vec![]);
        assert!(needs_vault_barrier(&references));

        references.remove("vault");
        assert!(!needs_vault_barrier(&references));
    }

    #[tokio::test]
    async fn test_load_provider_secrets_from_file() {
        let _guard = scoped_env(&[]);
        let dir = tempfile::tempdir().unwrap();
        let secret_file = dir.path().join("secret");
        std::fs::write(&secret_file, "secretId").unwrap();

        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();
        references.insert(
            "file",
            vec![format!("AWS_SECRET_ACCESS_KEY_ID=file:{}", secret_file.display())],
        );

        let store = store(&[]);
        let secrets = store
            .load_provider_secrets(
                &CancellationToken::new(),
                references,
                &ProviderOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            secrets,
            vec![Secret::new("AWS_SECRET_ACCESS_KEY_ID", "secretId")]
        );
    }

    #[tokio::test]
    async fn test_failing_provider_fails_the_load_and_names_itself() {
        let _guard = scoped_env(&[]);
        let dir = tempfile::tempdir().unwrap();
        let secret_file = dir.path().join("secret");
        std::fs::write(&secret_file, "ok").unwrap();

        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();
        references.insert(
            "file",
            vec![format!("GOOD=file:{}", secret_file.display())],
        );
        references.insert("invalid", vec!["BAD=invalid:ref".to_string()]);

        let store = store(&[]);
        let err = store
            .load_provider_secrets(
                &CancellationToken::new(),
                references,
                &ProviderOptions::default(),
            )
            .await
            .unwrap_err();

        let text = format!("{err:#}");
        assert!(text.contains("failed to create provider invalid"), "{text}");
        assert!(text.contains("provider invalid is not supported"), "{text}");
    }

    #[tokio::test]
    async fn test_all_provider_failures_are_reported() {
        let _guard = scoped_env(&[]);
        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();
        references.insert("invalid", vec![]);
        // A file reference to a missing path fails during load, after
        // provider creation succeeded.
        references.insert("file", vec!["MISSING=file:/no/such/path".to_string()]);

        let store = store(&[]);
        let err = store
            .load_provider_secrets(
                &CancellationToken::new(),
                references,
                &ProviderOptions::default(),
            )
            .await
            .unwrap_err();

        let text = format!("{err:#}");
        assert!(text.contains("invalid"), "{text}");
        assert!(text.contains("failed to load secrets for provider file"), "{text}");
    }

    #[tokio::test]
    async fn test_vault_loads_before_bao_when_both_are_present() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let vault_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(200))
                    .set_body_json(serde_json::json!({
                        "data": { "data": { "A": "from-vault" }, "metadata": { "version": 1 } }
                    })),
            )
            .mount(&vault_server)
            .await;

        let bao_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "B": "from-bao" }, "metadata": { "version": 1 } }
            })))
            .mount(&bao_server)
            .await;

        let vault_uri = vault_server.uri();
        let bao_uri = bao_server.uri();
        let _guard = scoped_env(&[
            ("VAULT_ADDR", vault_uri.as_str()),
            ("VAULT_TOKEN", "root"),
            ("BAO_ADDR", bao_uri.as_str()),
            ("BAO_TOKEN", "root"),
        ]);

        let mut references: HashMap<&'static str, Vec<String>> = HashMap::new();
        references.insert("vault", vec!["VAULT_SECRET=vault:secret/data/test#A".to_string()]);
        references.insert("bao", vec!["BAO_SECRET=bao:secret/data/test#B".to_string()]);

        let store = store(&[]);
        let secrets = store
            .load_provider_secrets(
                &CancellationToken::new(),
                references,
                &ProviderOptions::default(),
            )
            .await
            .unwrap();

        // Vault is slower here, yet its secrets come first: it must have
        // finished loading before the Bao worker was even started.
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[0], Secret::new("VAULT_SECRET", "from-vault"));
        assert_eq!(secrets[1], Secret::new("BAO_SECRET", "from-bao"));
    }

    #[test]
    fn test_to_child_env_replaces_references_and_strips_internals() {
        let _guard = scoped_env(&[("VAULT_TOKEN", "root")]);
        let store = store(&[
            ("MYSQL_PASSWORD", "vault:secret/data/test/mysql#MYSQL_PASSWORD"),
            ("VAULT_TOKEN", "root"),
            ("VAULT_ADDR", "https://vault:8200"),
            ("HOME", "/root"),
        ]);

        let child_env = store
            .to_child_env(vec![Secret::new("MYSQL_PASSWORD", "3xtr3ms3cr3t")])
            .unwrap();

        let env: HashMap<_, _> = child_env.into_iter().collect();
        assert_eq!(env.get("MYSQL_PASSWORD").map(String::as_str), Some("3xtr3ms3cr3t"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/root"));
        assert!(!env.contains_key("VAULT_TOKEN"));
        assert!(!env.contains_key("VAULT_ADDR"));
    }

    #[test]
    fn test_to_child_env_passthrough_retains_internals() {
        let _guard = scoped_env(&[
            ("VAULT_TOKEN", "root"),
            ("VAULT_PASSTHROUGH", "VAULT_ADDR"),
        ]);
        let store = store(&[
            ("VAULT_ADDR", "https://vault:8200"),
            ("VAULT_TOKEN", "root"),
        ]);

        let child_env = store.to_child_env(vec![]).unwrap();
        let env: HashMap<_, _> = child_env.into_iter().collect();
        assert_eq!(
            env.get("VAULT_ADDR").map(String::as_str),
            Some("https://vault:8200")
        );
        assert!(!env.contains_key("VAULT_TOKEN"));
    }

    #[test]
    fn test_to_child_env_login_retains_login_class_keys() {
        let _guard = scoped_env(&[("VAULT_TOKEN", "vault:login")]);
        let store = store(&[
            ("VAULT_ADDR", "https://vault:8200"),
            ("VAULT_ROLE", "app"),
        ]);

        let child_env = store.to_child_env(vec![]).unwrap();
        let env: HashMap<_, _> = child_env.into_iter().collect();
        assert_eq!(
            env.get("VAULT_ADDR").map(String::as_str),
            Some("https://vault:8200")
        );
        assert!(!env.contains_key("VAULT_ROLE"));
    }

    #[test]
    fn test_to_child_env_duplicate_key_is_an_error() {
        let _guard = scoped_env(&[]);
        let store = store(&[]);
        let err = store
            .to_child_env(vec![
                Secret::new("PASSWORD", "from-vault"),
                Secret::new("PASSWORD", "from-aws"),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate secret key PASSWORD"));
    }

    #[test]
    fn test_to_child_env_secret_overrides_plain_value() {
        let _guard = scoped_env(&[]);
        let store = store(&[("API_KEY", "placeholder")]);
        let child_env = store
            .to_child_env(vec![Secret::new("API_KEY", "real")])
            .unwrap();
        assert_eq!(child_env, vec![("API_KEY".to_string(), "real".to_string())]);
    }
}
