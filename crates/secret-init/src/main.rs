// SPDX-License-Identifier: AGPL-3.0-only

//! secret-init: resolve secret references in the inherited environment,
//! then hand off to the real entrypoint.

use crate::config::Config;
use crate::entrypoint::extract_entrypoint;
use crate::env_store::EnvStore;
use anyhow::Result;
use secret_init_providers::{ProviderOptions, TerminationSignal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod entrypoint;
mod env_store;
mod logging;
mod supervisor;

#[tokio::main]
async fn main() {
    let (config, warnings) = Config::from_env();
    if let Err(e) = logging::init_logging(&config) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }
    for warning in warnings {
        warn!("{warning}");
    }

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let (binary, binary_args) = extract_entrypoint(&args)?;

    let store = EnvStore::from_env();
    let references = store.secret_references();

    let cancel = CancellationToken::new();
    let (renewal_tx, renewal_rx) = mpsc::channel::<TerminationSignal>(2);
    let options = ProviderOptions {
        daemon: config.daemon,
        renewal: config.daemon.then_some(renewal_tx),
    };

    let secrets = store
        .load_provider_secrets(&cancel, references, &options)
        .await?;

    if !config.delay.is_zero() {
        info!(delay = %humantime::format_duration(config.delay), "delaying execution");
        tokio::time::sleep(config.delay).await;
    }

    let child_env = store.to_child_env(secrets)?;

    info!(entrypoint = %binary.display(), args = ?binary_args, "spawning process");

    if config.daemon {
        info!("in daemon mode...");
        supervisor::run_daemon(&binary, &binary_args, child_env, renewal_rx).await
    } else {
        // exec only returns on failure.
        Err(supervisor::exec_child(&binary, &binary_args, child_env))
    }
}
