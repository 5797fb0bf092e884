//! Session lifecycle
//!
//! Ties the supervisor, transport, and connection together: launch the
//! worker, wait for its readiness handshake, watch for unexpected exit, and
//! tear everything down again on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::registry::RemoteRegistry;
use crate::supervisor::{StderrTail, WorkerConfig, WorkerProcess};
use crate::transport::PipeTransport;

/// How long to wait for the worker's readiness handshake.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a deliberate shutdown waits before force-killing the worker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq)]
enum ExitState {
    Running,
    Exited { code: Option<i32> },
}

/// A live worker process plus the connection talking to it.
///
/// Dropping a `Session` force-kills the worker; use
/// [`shutdown`](Self::shutdown) to let it exit on its own terms.
pub struct Session {
    connection: Arc<Connection>,
    registry: Arc<RemoteRegistry>,
    expected_exit: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: watch::Receiver<ExitState>,
}

/// Launch a worker and establish a ready connection to it.
///
/// This will:
/// 1. Resolve and version-check the worker executable
/// 2. Spawn the process with piped stdio
/// 3. Wire the pipes into a framed transport and start the connection loop
/// 4. Start the exit monitor
/// 5. Wait for the worker's readiness handshake
///
/// # Errors
///
/// Returns the resolution or launch error, `Error::ProcessCrashed` if the
/// worker dies before reporting ready, or `Error::Timeout` if the handshake
/// never arrives.
pub async fn launch_session(config: &WorkerConfig) -> Result<Session> {
    let mut worker = WorkerProcess::launch(config).await?;
    let (stdin, stdout) = worker.take_stdio()?;

    let (transport, event_rx) = PipeTransport::new(stdin, stdout);
    let parts = transport.into_transport_parts(event_rx);
    let registry = Arc::new(RemoteRegistry::new());
    let connection = Arc::new(Connection::new(parts, Arc::clone(&registry)));

    let run = Arc::clone(&connection);
    tokio::spawn(async move { run.run().await });

    let (child, stderr_tail, expected_exit) = worker.into_parts();
    let launch_tail = stderr_tail.clone();
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(ExitState::Running);
    spawn_exit_monitor(
        Arc::clone(&connection),
        child,
        stderr_tail,
        Arc::clone(&expected_exit),
        kill_rx,
        exited_tx,
    );

    let mut exited = exited_rx.clone();
    tokio::select! {
        ready = connection.wait_ready(DEFAULT_READY_TIMEOUT) => {
            if let Err(error) = ready {
                expected_exit.store(true, Ordering::SeqCst);
                let _ = kill_tx.send(());
                return Err(error);
            }
        }
        state = exited.wait_for(|state| matches!(state, ExitState::Exited { .. })) => {
            let state = state.map_err(|_| Error::ChannelClosed)?;
            let code = match *state {
                ExitState::Exited { code } => code,
                ExitState::Running => None,
            };
            return Err(Error::ProcessCrashed {
                code,
                stderr_tail: launch_tail.snapshot(),
            });
        }
    }

    tracing::debug!("session established");
    Ok(Session {
        connection,
        registry,
        expected_exit,
        kill_tx: Some(kill_tx),
        exited_rx,
    })
}

fn spawn_exit_monitor(
    connection: Arc<Connection>,
    mut child: Child,
    stderr_tail: StderrTail,
    expected_exit: Arc<AtomicBool>,
    mut kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<ExitState>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                tracing::debug!("force-killing worker");
                let _ = child.start_kill();
                child.wait().await
            }
        };

        let code = status.as_ref().ok().and_then(|s| s.code());
        if expected_exit.load(Ordering::SeqCst) {
            tracing::debug!(?code, "worker exited");
            connection.handle_disconnect("worker exited").await;
        } else {
            tracing::error!(?code, "worker exited unexpectedly");
            connection.handle_crash(code, stderr_tail.snapshot()).await;
        }
        let _ = exited_tx.send(ExitState::Exited { code });
    });
}

impl Session {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<RemoteRegistry> {
        &self.registry
    }

    /// Send an action-convention command over this session's connection.
    pub async fn send(&self, action: &str, params: Value) -> Result<Value> {
        self.connection.send(action, params).await
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&self) -> bool {
        *self.exited_rx.borrow() == ExitState::Running
    }

    /// Resolve once the worker process has exited, with its exit code if it
    /// exited normally.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut exited = self.exited_rx.clone();
        match exited
            .wait_for(|state| matches!(state, ExitState::Exited { .. }))
            .await
        {
            Ok(state) => match *state {
                ExitState::Exited { code } => code,
                ExitState::Running => None,
            },
            Err(_) => None,
        }
    }

    /// Shut the worker down deliberately.
    ///
    /// Cancels pending requests, sends the `exit` command (the worker
    /// closes its browsers and leaves on its own), and waits briefly before
    /// force-killing.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for surfacing
    /// shutdown problems without breaking callers.
    pub async fn shutdown(mut self) -> Result<()> {
        self.expected_exit.store(true, Ordering::SeqCst);
        self.connection.cancel_pending_requests().await;

        if let Err(error) = self.connection.send_async("exit", json!({})) {
            tracing::debug!(%error, "could not send exit command");
        }

        let mut exited = self.exited_rx.clone();
        let timed_out = tokio::time::timeout(
            SHUTDOWN_GRACE,
            exited.wait_for(|state| matches!(state, ExitState::Exited { .. })),
        )
        .await
        .is_err();

        if timed_out {
            tracing::warn!("worker did not exit in time; force-killing");
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            let _ = tokio::time::timeout(
                Duration::from_secs(2),
                exited.wait_for(|state| matches!(state, ExitState::Exited { .. })),
            )
            .await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("exit_state", &*self.exited_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            self.expected_exit.store(true, Ordering::SeqCst);
            let _ = kill_tx.send(());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    const READY_FRAME: &str =
        "Content-Length: 34\\r\\n\\r\\n{\"type\":\"ready\",\"message\":\"READY\"}";

    fn write_worker_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("drover-worker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn script_config(exe: PathBuf) -> WorkerConfig {
        WorkerConfig {
            executable: Some(exe),
            skip_version_check: true,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn launch_ready_shutdown_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        // Report ready, then exit as soon as anything arrives on stdin.
        let exe = write_worker_script(
            dir.path(),
            &format!("printf '{READY_FRAME}'\nhead -c 1 > /dev/null\nexit 0"),
        );

        let session = launch_session(&script_config(exe)).await.unwrap();
        assert!(session.is_alive());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn crash_after_ready_fails_pending_requests() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_worker_script(
            dir.path(),
            &format!("printf '{READY_FRAME}'\nsleep 1\necho dying >&2\nexit 7"),
        );

        let session = launch_session(&script_config(exe)).await.unwrap();

        let error = session
            .send("page.navigate", json!({ "url": "https://example.com" }))
            .await
            .unwrap_err();
        assert!(error.is_disconnect(), "got {error:?}");

        assert_eq!(session.wait_exit().await, Some(7));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn death_before_ready_surfaces_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        // Survive the spawn grace period, then die without ever reporting
        // ready.
        let exe = write_worker_script(dir.path(), "echo no handshake >&2\nsleep 0.5\nexit 2");

        let error = launch_session(&script_config(exe)).await.unwrap_err();
        let Error::ProcessCrashed { code, stderr_tail } = error else {
            panic!("expected ProcessCrashed");
        };
        assert_eq!(code, Some(2));
        assert!(stderr_tail.contains("no handshake"));
    }
}
