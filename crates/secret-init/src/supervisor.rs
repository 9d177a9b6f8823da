// SPDX-License-Identifier: AGPL-3.0-only

//! Process supervision: one-shot exec replacement, or daemon-mode spawn
//! with signal forwarding and exit-code fidelity.

use anyhow::{Context, Result};
use secret_init_providers::TerminationSignal;
use std::path::Path;
use std::process::Stdio;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Replace the current process image with the child. Only returns on
/// failure.
pub fn exec_child(binary: &Path, args: &[String], env: Vec<(String, String)>) -> anyhow::Error {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(binary)
        .args(args)
        .env_clear()
        .envs(env)
        .exec();

    anyhow::Error::new(err).context("failed to exec process")
}

/// Spawn the child and supervise it until exit.
///
/// Every deliverable signal received by this process is forwarded to the
/// child; termination requests from the renewal channel are delivered the
/// same way. Returns the child's exit code: the code itself on normal exit,
/// `128 + signal` when signal-killed, -1 when the status is unreadable.
pub async fn run_daemon(
    binary: &Path,
    args: &[String],
    env: Vec<(String, String)>,
    mut renewal_rx: mpsc::Receiver<TerminationSignal>,
) -> Result<i32> {
    // Handlers go in before the spawn so nothing is missed in between.
    let (forward_tx, mut forward_rx) = mpsc::channel::<i32>(16);
    let mut listeners = JoinSet::new();
    for (kind, signo) in forwardable_signals() {
        let forward_tx = forward_tx.clone();
        match signal(kind) {
            Ok(mut stream) => {
                listeners.spawn(async move {
                    while stream.recv().await.is_some() {
                        if forward_tx.send(signo).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => warn!(signal = signo, error = %e, "failed to install signal handler"),
        }
    }
    drop(forward_tx);

    let mut child = tokio::process::Command::new(binary)
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context("failed to start process")?;

    let pid = child.id().context("spawned process has no pid")? as libc::pid_t;

    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.context("failed to wait for process")?;
            }
            signo = recv_or_pending(&mut forward_rx) => {
                info!(signal = signo, "received signal");
                deliver_signal(pid, signo);
            }
            termination = recv_or_pending(&mut renewal_rx) => {
                let signo = match termination {
                    TerminationSignal::Term => libc::SIGTERM,
                    TerminationSignal::Kill => libc::SIGKILL,
                };
                info!(signal = signo, "delivering termination signal from renewer");
                deliver_signal(pid, signo);
            }
        }
    };

    // Dropping the listener set tears the handler tasks down; signals
    // arriving after child exit are not forwarded anywhere.
    drop(listeners);

    Ok(exit_code(status))
}

/// The deliverable set: everything a container runtime or operator sends
/// that the child should observe. SIGCHLD stays with us (it is how we learn
/// about the child itself), and SIGKILL/SIGSTOP cannot be caught.
fn forwardable_signals() -> Vec<(SignalKind, i32)> {
    vec![
        (SignalKind::hangup(), libc::SIGHUP),
        (SignalKind::interrupt(), libc::SIGINT),
        (SignalKind::quit(), libc::SIGQUIT),
        (SignalKind::terminate(), libc::SIGTERM),
        (SignalKind::user_defined1(), libc::SIGUSR1),
        (SignalKind::user_defined2(), libc::SIGUSR2),
        (SignalKind::alarm(), libc::SIGALRM),
        (SignalKind::pipe(), libc::SIGPIPE),
        (SignalKind::io(), libc::SIGIO),
        (SignalKind::window_change(), libc::SIGWINCH),
        (SignalKind::from_raw(libc::SIGCONT), libc::SIGCONT),
    ]
}

fn deliver_signal(pid: libc::pid_t, signo: i32) {
    // We never signal a process we did not spawn; the pid is our child's
    // until wait() has returned.
    let rc = unsafe { libc::kill(pid, signo) };
    if rc != 0 {
        warn!(
            signal = signo,
            error = %std::io::Error::last_os_error(),
            "failed to signal process"
        );
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| 128 + s).unwrap_or(-1),
    }
}

async fn recv_or_pending<T>(rx: &mut mpsc::Receiver<T>) -> T {
    match rx.recv().await {
        Some(value) => value,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn idle_renewal() -> (mpsc::Sender<TerminationSignal>, mpsc::Receiver<TerminationSignal>) {
        mpsc::channel(2)
    }

    #[tokio::test]
    async fn test_exit_code_is_propagated() {
        let (_tx, rx) = idle_renewal();
        let code = run_daemon(&sh(), &args(&["-c", "exit 3"]), vec![], rx)
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_zero_exit() {
        let (_tx, rx) = idle_renewal();
        let code = run_daemon(&sh(), &args(&["-c", "exit 0"]), vec![], rx)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_signal_killed_child_maps_to_128_plus_signal() {
        let (_tx, rx) = idle_renewal();
        let code = run_daemon(&sh(), &args(&["-c", "kill -TERM $$"]), vec![], rx)
            .await
            .unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_child_sees_exactly_the_given_environment() {
        let (_tx, rx) = idle_renewal();
        let env = vec![("MARKER".to_string(), "42".to_string())];
        let code = run_daemon(
            &sh(),
            &args(&["-c", r#"[ "$MARKER" = "42" ] && [ -z "$HOME" ]"#]),
            env,
            rx,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_renewal_termination_stops_the_child() {
        let (tx, rx) = idle_renewal();

        let supervisor = tokio::spawn(async move {
            run_daemon(&sh(), &args(&["-c", "sleep 30"]), vec![], rx).await
        });

        // Let the child start, then ask for termination the way the renewer
        // does.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(TerminationSignal::Term).await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(10), supervisor)
            .await
            .expect("supervisor did not exit after termination request")
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[test]
    fn test_exec_child_failure_returns_error() {
        let err = exec_child(Path::new("/no/such/binary"), &[], vec![]);
        assert!(format!("{err:#}").contains("failed to exec process"));
    }
}
