//! Configuration for the Vault/Bao provider family.
//!
//! Vault and OpenBao share the reference grammar and the client wire
//! protocol; only the reference scheme and the environment namespace differ.
//! `Flavor` captures that difference so the rest of the module is written
//! once.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::time::Duration;

/// Which member of the Vault family a provider instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    Vault,
    Bao,
}

impl Flavor {
    /// Registry name and reference scheme ("vault" / "bao").
    pub const fn scheme(self) -> &'static str {
        match self {
            Flavor::Vault => "vault",
            Flavor::Bao => "bao",
        }
    }

    /// Environment variable namespace prefix ("VAULT" / "BAO").
    pub const fn env_prefix(self) -> &'static str {
        match self {
            Flavor::Vault => "VAULT",
            Flavor::Bao => "BAO",
        }
    }

    /// Full environment variable name for a namespaced suffix.
    pub fn env_name(self, suffix: &str) -> String {
        format!("{}_{}", self.env_prefix(), suffix)
    }

    /// The token value that requests a login exchange whose acquired token
    /// is passed through to the child ("vault:login" / "bao:login").
    pub fn login_sentinel(self) -> &'static str {
        match self {
            Flavor::Vault => "vault:login",
            Flavor::Bao => "bao:login",
        }
    }

    fn env(self, suffix: &str) -> Option<String> {
        std::env::var(self.env_name(suffix)).ok().filter(|v| !v.is_empty())
    }
}

/// Provider-internal environment variable suffixes and whether each one is
/// login-class. Login-class keys are retained in the child environment when
/// the login sentinel is active, so the child can reuse the acquired token
/// against the same server. Everything listed here is otherwise stripped.
const SANITIZE_SUFFIXES: &[(&str, bool)] = &[
    ("TOKEN", true),
    ("ADDR", true),
    ("AGENT_ADDR", true),
    ("CACERT", true),
    ("CAPATH", true),
    ("CLIENT_CERT", true),
    ("CLIENT_KEY", true),
    ("CLIENT_TIMEOUT", true),
    ("SRV_LOOKUP", true),
    ("SKIP_VERIFY", true),
    ("NAMESPACE", true),
    ("TLS_SERVER_NAME", true),
    ("WRAP_TTL", true),
    ("MFA", true),
    ("MAX_RETRIES", true),
    ("CLUSTER_ADDR", false),
    ("REDIRECT_ADDR", false),
    ("CLI_NO_COLOR", false),
    ("RATE_LIMIT", false),
    ("ROLE", false),
    ("PATH", false),
    ("AUTH_METHOD", false),
    ("TRANSIT_KEY_ID", false),
    ("TRANSIT_PATH", false),
    ("TRANSIT_BATCH_SIZE", false),
    ("IGNORE_MISSING_SECRETS", false),
    ("PASSTHROUGH", false),
    ("LOG_LEVEL", false),
    ("REVOKE_TOKEN", false),
    ("FROM_PATH", false),
];

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub flavor: Flavor,
    /// True when the token carried the login sentinel.
    pub is_login: bool,
    pub address: String,
    /// Directly usable token, if any. Empty when the role trio is used.
    pub token: String,
    /// Role / auth mount path / auth method for server-side login.
    pub role: Option<String>,
    pub auth_path: Option<String>,
    pub auth_method: Option<String>,
    pub ca_cert: Option<String>,
    pub skip_verify: bool,
    pub namespace: Option<String>,
    pub client_timeout: Duration,
    pub max_retries: u32,
    pub transit_key_id: Option<String>,
    pub transit_path: Option<String>,
    pub transit_batch_size: usize,
    pub ignore_missing_secrets: bool,
    pub from_paths: Vec<String>,
    pub revoke_token: bool,
    pub passthrough: Vec<String>,
}

impl VaultConfig {
    /// Load the configuration for one flavor from the environment.
    pub fn load(flavor: Flavor) -> Result<Self> {
        let raw_token = flavor.env("TOKEN").unwrap_or_default();
        let is_login = raw_token == flavor.login_sentinel();

        let mut token = if is_login { String::new() } else { raw_token };
        let mut role = None;
        let mut auth_path = None;
        let mut auth_method = None;

        if let Some(token_file) = flavor.env("TOKEN_FILE") {
            let content = std::fs::read_to_string(&token_file)
                .with_context(|| format!("failed to read token file {token_file}"))?;
            token = content.trim_end().to_string();
        } else if token.is_empty() {
            // Server-side login: the role / auth-path / auth-method trio is
            // required as a whole.
            role = Some(require(flavor, "ROLE")?);
            auth_path = Some(require(flavor, "PATH")?);
            auth_method = Some(require(flavor, "AUTH_METHOD")?);
        }

        let mut passthrough: Vec<String> = flavor
            .env("PASSTHROUGH")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if is_login {
            passthrough.push(flavor.env_name("TOKEN"));
        }

        let from_paths = flavor
            .env("FROM_PATH")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            flavor,
            is_login,
            address: flavor
                .env("ADDR")
                .unwrap_or_else(|| "https://127.0.0.1:8200".to_string()),
            token,
            role,
            auth_path,
            auth_method,
            ca_cert: flavor.env("CACERT"),
            skip_verify: parse_bool(flavor.env("SKIP_VERIFY")),
            namespace: flavor.env("NAMESPACE"),
            client_timeout: flavor
                .env("CLIENT_TIMEOUT")
                .and_then(|v| humantime_compat(&v))
                .unwrap_or(Duration::from_secs(60)),
            max_retries: flavor
                .env("MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            transit_key_id: flavor.env("TRANSIT_KEY_ID"),
            transit_path: flavor.env("TRANSIT_PATH"),
            transit_batch_size: flavor
                .env("TRANSIT_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            ignore_missing_secrets: parse_bool(flavor.env("IGNORE_MISSING_SECRETS")),
            from_paths,
            revoke_token: parse_bool(flavor.env("REVOKE_TOKEN")),
            passthrough,
        })
    }

    /// Whether a secret with this destination key may be returned to the
    /// dispatcher. Provider-internal keys are held back unless the key was
    /// passed through or we are in a login scenario and the key is
    /// login-class.
    pub fn allows_secret_key(&self, key: &str) -> bool {
        if self.passthrough.iter().any(|p| p == key) {
            return true;
        }
        match classify(self.flavor, key) {
            Some(login_class) => self.is_login && login_class,
            None => true,
        }
    }
}

/// The set of provider-internal environment names to strip from the child
/// environment for one flavor, honoring the current passthrough list and
/// login sentinel. Used by the env store when assembling the child
/// environment.
pub fn sanitize_set(flavor: Flavor) -> HashSet<String> {
    let is_login =
        flavor.env("TOKEN").as_deref() == Some(flavor.login_sentinel());
    let mut passthrough: Vec<String> = flavor
        .env("PASSTHROUGH")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if is_login {
        passthrough.push(flavor.env_name("TOKEN"));
    }

    SANITIZE_SUFFIXES
        .iter()
        .filter(|(_, login_class)| !(is_login && *login_class))
        .map(|(suffix, _)| flavor.env_name(suffix))
        .filter(|name| !passthrough.iter().any(|p| p == name))
        .collect()
}

fn classify(flavor: Flavor, key: &str) -> Option<bool> {
    let suffix = key.strip_prefix(flavor.env_prefix())?.strip_prefix('_')?;
    SANITIZE_SUFFIXES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map(|(_, login_class)| *login_class)
}

fn require(flavor: Flavor, suffix: &str) -> Result<String> {
    flavor.env(suffix).ok_or_else(|| {
        anyhow::anyhow!(
            "incomplete authentication configuration: {} missing",
            flavor.env_name(suffix)
        )
    })
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True")
    )
}

/// `VAULT_CLIENT_TIMEOUT` accepts either Go-style durations ("60s") or a
/// bare number of seconds.
fn humantime_compat(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value.parse::<humantime::Duration>().ok().map(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};

    // Config loading reads the process environment, so tests serialize.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn scoped_env(vars: &[(&str, &str)]) -> (MutexGuard<'static, ()>, Vec<String>) {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for suffix in SANITIZE_SUFFIXES.iter().map(|(s, _)| s).chain(["TOKEN_FILE"].iter()) {
            unsafe {
                std::env::remove_var(format!("VAULT_{suffix}"));
                std::env::remove_var(format!("BAO_{suffix}"));
            }
        }
        let mut set = Vec::new();
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
            set.push(k.to_string());
        }
        (guard, set)
    }

    #[test]
    fn test_direct_token() {
        let (_guard, _set) = scoped_env(&[("VAULT_TOKEN", "root")]);
        let config = VaultConfig::load(Flavor::Vault).unwrap();
        assert!(!config.is_login);
        assert_eq!(config.token, "root");
        assert!(config.role.is_none());
    }

    #[test]
    fn test_token_file_trims_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "file-token").unwrap();
        let (_guard, _set) = scoped_env(&[(
            "VAULT_TOKEN_FILE",
            file.path().to_str().unwrap(),
        )]);

        let config = VaultConfig::load(Flavor::Vault).unwrap();
        assert_eq!(config.token, "file-token");
    }

    #[test]
    fn test_incomplete_role_trio() {
        let (_guard, _set) = scoped_env(&[
            ("VAULT_ROLE", "app"),
            ("VAULT_PATH", "kubernetes"),
        ]);
        let err = VaultConfig::load(Flavor::Vault).unwrap_err();
        assert!(err.to_string().contains("VAULT_AUTH_METHOD"));
    }

    #[test]
    fn test_login_sentinel_adds_token_passthrough() {
        let (_guard, _set) = scoped_env(&[
            ("VAULT_TOKEN", "vault:login"),
            ("VAULT_ROLE", "app"),
            ("VAULT_PATH", "kubernetes"),
            ("VAULT_AUTH_METHOD", "kubernetes"),
        ]);
        let config = VaultConfig::load(Flavor::Vault).unwrap();
        assert!(config.is_login);
        assert!(config.passthrough.iter().any(|p| p == "VAULT_TOKEN"));
        assert!(config.allows_secret_key("VAULT_TOKEN"));
        assert!(config.allows_secret_key("VAULT_ADDR"));
        assert!(!config.allows_secret_key("VAULT_ROLE"));
    }

    #[test]
    fn test_allows_plain_keys() {
        let (_guard, _set) = scoped_env(&[("VAULT_TOKEN", "root")]);
        let config = VaultConfig::load(Flavor::Vault).unwrap();
        assert!(config.allows_secret_key("MYSQL_PASSWORD"));
        assert!(!config.allows_secret_key("VAULT_ADDR"));
    }

    #[test]
    fn test_sanitize_set_strips_operational_keys() {
        let (_guard, _set) = scoped_env(&[("VAULT_TOKEN", "root")]);
        let set = sanitize_set(Flavor::Vault);
        assert!(set.contains("VAULT_TOKEN"));
        assert!(set.contains("VAULT_ADDR"));
        assert!(set.contains("VAULT_ROLE"));
        assert!(!set.contains("MYSQL_PASSWORD"));
    }

    #[test]
    fn test_sanitize_set_login_keeps_login_class() {
        let (_guard, _set) = scoped_env(&[("VAULT_TOKEN", "vault:login")]);
        let set = sanitize_set(Flavor::Vault);
        assert!(!set.contains("VAULT_ADDR"));
        assert!(!set.contains("VAULT_TOKEN"));
        assert!(set.contains("VAULT_ROLE"));
    }

    #[test]
    fn test_sanitize_set_passthrough_wins() {
        let (_guard, _set) = scoped_env(&[
            ("VAULT_TOKEN", "root"),
            ("VAULT_PASSTHROUGH", "VAULT_ADDR, VAULT_NAMESPACE"),
        ]);
        let set = sanitize_set(Flavor::Vault);
        assert!(!set.contains("VAULT_ADDR"));
        assert!(!set.contains("VAULT_NAMESPACE"));
        assert!(set.contains("VAULT_TOKEN"));
    }

    #[test]
    fn test_bao_namespace_is_independent() {
        let (_guard, _set) = scoped_env(&[("BAO_TOKEN", "bao-root")]);
        let config = VaultConfig::load(Flavor::Bao).unwrap();
        assert_eq!(config.token, "bao-root");
        assert_eq!(config.flavor.scheme(), "bao");
        assert_eq!(config.flavor.login_sentinel(), "bao:login");
    }

    #[test]
    fn test_from_path_list() {
        let (_guard, _set) = scoped_env(&[
            ("VAULT_TOKEN", "root"),
            ("VAULT_FROM_PATH", "secret/data/app, secret/data/common"),
        ]);
        let config = VaultConfig::load(Flavor::Vault).unwrap();
        assert_eq!(
            config.from_paths,
            vec!["secret/data/app".to_string(), "secret/data/common".to_string()]
        );
    }
}
