//! Background lease renewal for daemon mode.
//!
//! Every renewable secret handed out by the server gets its own watcher
//! task. A watcher keeps renewing until the server refuses, then asks the
//! supervisor to terminate the child: the workload's credentials are about
//! to stop working, and restarting is the only way to pick up fresh ones.

use crate::provider::TerminationSignal;
use crate::vault::client::VaultClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// A lease attached to a resolved secret.
#[derive(Debug, Clone)]
pub struct Lease {
    pub path: String,
    pub lease_id: String,
    pub duration: Duration,
    pub renewable: bool,
}

/// Spawns and owns lease watcher tasks.
pub struct Renewer {
    client: Arc<VaultClient>,
    sigs: mpsc::Sender<TerminationSignal>,
    grace: Duration,
}

impl Renewer {
    pub fn new(client: Arc<VaultClient>, sigs: mpsc::Sender<TerminationSignal>) -> Self {
        Self {
            client,
            sigs,
            grace: TERMINATION_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start watching a lease. The task runs until the lease is lost, then
    /// drives the SIGTERM → grace → SIGKILL sequence through the renewal
    /// channel.
    pub fn watch(&self, lease: Lease) {
        let client = self.client.clone();
        let sigs = self.sigs.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            run_watcher(client, lease, sigs, grace).await;
        });
    }
}

async fn run_watcher(
    client: Arc<VaultClient>,
    lease: Lease,
    sigs: mpsc::Sender<TerminationSignal>,
    grace: Duration,
) {
    if lease.renewable {
        let mut duration = lease.duration;
        loop {
            // Renew at two thirds of the lease lifetime, leaving headroom
            // for retries before the lease actually expires.
            tokio::time::sleep(duration * 2 / 3).await;

            match client.renew_lease(&lease.lease_id, duration.as_secs()).await {
                Ok(response) if response.renewable.unwrap_or(false) => {
                    duration = response
                        .lease_duration
                        .map(Duration::from_secs)
                        .filter(|d| !d.is_zero())
                        .unwrap_or(duration);
                    info!(
                        path = %lease.path,
                        lease_duration_secs = duration.as_secs(),
                        "secret renewed"
                    );
                }
                Ok(_) => {
                    info!(path = %lease.path, "secret is no longer renewable");
                    break;
                }
                Err(e) => {
                    warn!(path = %lease.path, error = %e, "secret renewal failed");
                    break;
                }
            }
        }
    } else {
        // Nothing to renew; let the secret live out its TTL, then stop the
        // child before it keeps using expired credentials.
        tokio::time::sleep(lease.duration).await;
        info!(
            path = %lease.path,
            lease_duration_secs = lease.duration.as_secs(),
            "secret lease has expired"
        );
    }

    info!(path = %lease.path, "secret renewal has stopped, sending SIGTERM to process");
    let _ = sigs.send(TerminationSignal::Term).await;

    tokio::time::sleep(grace).await;
    info!(path = %lease.path, "killing process due to SIGTERM timeout");
    let _ = sigs.send(TerminationSignal::Kill).await;
}
