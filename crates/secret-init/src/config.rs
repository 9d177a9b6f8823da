// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide configuration, sourced from the environment.

use std::time::Duration;

pub const LOG_LEVEL_ENV: &str = "SECRET_INIT_LOG_LEVEL";
pub const JSON_LOG_ENV: &str = "SECRET_INIT_JSON_LOG";
pub const LOG_SERVER_ENV: &str = "SECRET_INIT_LOG_SERVER";
pub const DAEMON_ENV: &str = "SECRET_INIT_DAEMON";
pub const DELAY_ENV: &str = "SECRET_INIT_DELAY";
pub const PROVIDER_ENV: &str = "SECRET_INIT_PROVIDER";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub log_level: String,
    pub json_log: bool,
    pub log_server: Option<String>,
    pub daemon: bool,
    pub delay: Duration,
}

impl Config {
    /// Load the configuration. Parsing is tolerant: a malformed field takes
    /// its zero value and is reported in the returned warning list, to be
    /// logged once the subscriber is installed.
    pub fn from_env() -> (Self, Vec<String>) {
        let mut warnings = Vec::new();

        let json_log = parse_bool_env(JSON_LOG_ENV, &mut warnings);
        let daemon = parse_bool_env(DAEMON_ENV, &mut warnings);

        let delay = match std::env::var(DELAY_ENV) {
            Ok(raw) if !raw.trim().is_empty() => match parse_duration(raw.trim()) {
                Some(delay) => delay,
                None => {
                    warnings.push(format!("failed to parse {DELAY_ENV}={raw}, using no delay"));
                    Duration::ZERO
                }
            },
            _ => Duration::ZERO,
        };

        if std::env::var(PROVIDER_ENV).is_ok() {
            warnings.push(format!(
                "{PROVIDER_ENV} is deprecated and ignored; providers are selected per reference"
            ));
        }

        let config = Self {
            log_level: std::env::var(LOG_LEVEL_ENV).unwrap_or_default(),
            json_log,
            log_server: std::env::var(LOG_SERVER_ENV).ok().filter(|s| !s.is_empty()),
            daemon,
            delay,
        };

        (config, warnings)
    }
}

fn parse_bool_env(name: &str, warnings: &mut Vec<String>) -> bool {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match parse_bool(raw.trim()) {
            Some(value) => value,
            None => {
                warnings.push(format!("failed to parse {name}={raw}, assuming false"));
                false
            }
        },
        _ => false,
    }
}

/// Boolean forms accepted by common CLI tooling.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Durations accept human forms ("250ms", "2s") or a bare number of seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    raw.parse::<humantime::Duration>().ok().map(Into::into)
}
