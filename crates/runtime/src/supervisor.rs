//! Worker process management
//!
//! Handles locating the drover worker executable, checking its version, and
//! spawning it with captured stdio.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use crate::error::{Error, Result};

/// Environment variable naming the worker executable (runtime override).
pub const WORKER_EXE_ENV: &str = "DROVER_WORKER_EXE";

/// Oldest worker version this client can talk to.
pub const MIN_WORKER_VERSION: &str = "0.3.0";

/// Number of trailing stderr lines kept for crash reports.
const STDERR_TAIL_LINES: usize = 20;

/// Launch configuration for the worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Explicit path to the worker executable.
    pub executable: Option<PathBuf>,
    /// Minimum version to accept instead of [`MIN_WORKER_VERSION`].
    pub minimum_version: Option<String>,
    /// Skip the `--version` probe entirely.
    pub skip_version_check: bool,
    /// Extra environment variables passed to the worker.
    pub env: Vec<(String, String)>,
}

/// Locate the worker executable.
///
/// Candidates are probed in the following order:
/// 1. `DROVER_WORKER_EXE` environment variable (runtime override)
/// 2. `executable` from the launch configuration
/// 3. `drover-worker` next to the current executable
/// 4. `drover-worker` on `PATH`
///
/// A candidate that is set but points at nothing is logged and skipped.
///
/// # Errors
///
/// Returns `Error::WorkerNotFound` if no candidate exists.
pub fn resolve_worker_executable(config: &WorkerConfig) -> Result<PathBuf> {
    let env_exe = std::env::var_os(WORKER_EXE_ENV).map(PathBuf::from);
    let sibling = sibling_candidate();
    let path_var = std::env::var_os("PATH");
    resolve_with(
        config,
        env_exe.as_deref(),
        sibling.as_deref(),
        path_var.as_deref(),
    )
}

fn resolve_with(
    config: &WorkerConfig,
    env_exe: Option<&Path>,
    sibling: Option<&Path>,
    path_var: Option<&OsStr>,
) -> Result<PathBuf> {
    if let Some(exe) = env_exe {
        if exe.exists() {
            return Ok(exe.to_path_buf());
        }
        warn!(
            exe = %exe.display(),
            "DROVER_WORKER_EXE is set but does not exist; falling back"
        );
    }

    if let Some(exe) = config.executable.as_deref() {
        if exe.exists() {
            return Ok(exe.to_path_buf());
        }
        warn!(
            exe = %exe.display(),
            "configured worker executable does not exist; falling back"
        );
    }

    if let Some(exe) = sibling {
        if exe.exists() {
            return Ok(exe.to_path_buf());
        }
    }

    if let Some(exe) = search_path(path_var) {
        return Ok(exe);
    }

    Err(Error::WorkerNotFound)
}

fn worker_file_name() -> &'static str {
    if cfg!(windows) {
        "drover-worker.exe"
    } else {
        "drover-worker"
    }
}

fn sibling_candidate() -> Option<PathBuf> {
    let current = std::env::current_exe().ok()?;
    Some(current.parent()?.join(worker_file_name()))
}

fn search_path(path_var: Option<&OsStr>) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_var?) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(worker_file_name());
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Probe the worker's version and enforce the minimum.
///
/// A worker that cannot be probed, or that prints something that is not a
/// version, is let through with a warning. Only a version that parses and
/// compares below the minimum aborts the launch.
///
/// # Errors
///
/// Returns `Error::WorkerVersionTooLow` when the probed version is older
/// than the required minimum.
pub async fn check_worker_version(exe: &Path, config: &WorkerConfig) -> Result<()> {
    if config.skip_version_check {
        return Ok(());
    }
    let minimum = config
        .minimum_version
        .as_deref()
        .unwrap_or(MIN_WORKER_VERSION);

    let output = match Command::new(exe).arg("--version").output().await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(status = %output.status, "worker --version probe failed; skipping version check");
            return Ok(());
        }
        Err(error) => {
            warn!(%error, "could not run worker --version; skipping version check");
            return Ok(());
        }
    };

    let raw = String::from_utf8_lossy(&output.stdout);
    let Some(found) = extract_version(&raw) else {
        warn!(
            output = %raw.trim(),
            "worker --version output is not a version; skipping version check"
        );
        return Ok(());
    };

    if !version_at_least(&found, minimum) {
        return Err(Error::WorkerVersionTooLow {
            found,
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}

/// Pull a `major.minor.patch` triple out of probe output such as
/// `drover-worker 0.3.1`.
fn extract_version(output: &str) -> Option<String> {
    for token in output.split_whitespace() {
        let token = token.trim_start_matches('v');
        if parse_triple(token).is_some() {
            return Some(token.to_string());
        }
    }
    None
}

fn parse_triple(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    // Tolerate suffixes such as `0.3.1-beta.2`.
    let patch = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or_default()
        .parse()
        .ok()?;
    Some((major, minor, patch))
}

fn version_at_least(found: &str, minimum: &str) -> bool {
    match (parse_triple(found), parse_triple(minimum)) {
        (Some(found), Some(minimum)) => found >= minimum,
        _ => true,
    }
}

/// Bounded ring of the worker's most recent stderr lines.
#[derive(Clone, Debug, Default)]
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// A running worker process with stdin/stdout piped and stderr drained into
/// a bounded tail buffer.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    stderr_tail: StderrTail,
    expected_exit: Arc<AtomicBool>,
}

impl WorkerProcess {
    /// Resolve, version-check, and spawn the worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::WorkerNotFound`, `Error::WorkerVersionTooLow`, or
    /// `Error::LaunchFailed` depending on which step went wrong.
    pub async fn launch(config: &WorkerConfig) -> Result<Self> {
        let exe = resolve_worker_executable(config)?;
        check_worker_version(&exe, config).await?;
        Self::spawn(&exe, config).await
    }

    /// Spawn a specific executable without resolution or version checks.
    pub async fn spawn(exe: &Path, config: &WorkerConfig) -> Result<Self> {
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("failed to spawn worker: {e}")))?;

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(line = %line, "worker stderr");
                    tail.push(line);
                }
            });
        }

        // Give the process a moment; a bad executable often dies right away.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                let tail = stderr_tail.snapshot();
                let detail = if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {tail}")
                };
                Err(Error::LaunchFailed(format!(
                    "worker exited immediately with status {status}{detail}"
                )))
            }
            Ok(None) => Ok(Self {
                child,
                stderr_tail,
                expected_exit: Arc::new(AtomicBool::new(false)),
            }),
            Err(e) => Err(Error::LaunchFailed(format!(
                "failed to check worker status: {e}"
            ))),
        }
    }

    /// Take the stdio pipes for the transport layer. Each pipe can be taken
    /// once.
    ///
    /// # Errors
    ///
    /// Returns `Error::LaunchFailed` if a pipe was not captured or was
    /// already taken.
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout)> {
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| Error::LaunchFailed("worker stdin not captured".to_string()))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| Error::LaunchFailed("worker stdout not captured".to_string()))?;
        Ok((stdin, stdout))
    }

    /// Mark the next exit as deliberate so it is not reported as a crash.
    pub fn mark_exit_expected(&self) {
        self.expected_exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_expected(&self) -> bool {
        self.expected_exit.load(Ordering::SeqCst)
    }

    /// The last captured stderr lines, oldest first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Force kill the worker process.
    ///
    /// This should only be used when graceful shutdown fails.
    ///
    /// # Errors
    ///
    /// Returns `Error::LaunchFailed` if the kill signal cannot be delivered.
    pub async fn kill(mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| Error::LaunchFailed(format!("failed to kill worker: {e}")))?;

        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            self.child.wait(),
        )
        .await;

        Ok(())
    }

    /// Split into the raw child and the shared pieces the session monitor
    /// needs.
    pub(crate) fn into_parts(self) -> (Child, StderrTail, Arc<AtomicBool>) {
        (self.child, self.stderr_tail, self.expected_exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn env_override_wins_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let from_env = dir.path().join("env-worker");
        let from_config = dir.path().join("config-worker");
        std::fs::write(&from_env, "").unwrap();
        std::fs::write(&from_config, "").unwrap();

        let config = WorkerConfig {
            executable: Some(from_config),
            ..WorkerConfig::default()
        };
        let resolved = resolve_with(&config, Some(&from_env), None, None).unwrap();
        assert_eq!(resolved, from_env);
    }

    #[test]
    fn missing_env_override_falls_back_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let from_config = dir.path().join("config-worker");
        std::fs::write(&from_config, "").unwrap();

        let config = WorkerConfig {
            executable: Some(from_config.clone()),
            ..WorkerConfig::default()
        };
        let missing = dir.path().join("not-there");
        let resolved = resolve_with(&config, Some(&missing), None, None).unwrap();
        assert_eq!(resolved, from_config);
    }

    #[test]
    fn path_walk_finds_the_worker() {
        let empty = tempfile::tempdir().unwrap();
        let populated = tempfile::tempdir().unwrap();
        let worker = populated.path().join(worker_file_name());
        std::fs::write(&worker, "").unwrap();

        let path_var =
            std::env::join_paths([empty.path(), populated.path()]).unwrap();
        let resolved =
            resolve_with(&WorkerConfig::default(), None, None, Some(&path_var)).unwrap();
        assert_eq!(resolved, worker);
    }

    #[test]
    fn nothing_found_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-there");
        let config = WorkerConfig {
            executable: Some(missing.clone()),
            ..WorkerConfig::default()
        };
        let error = resolve_with(&config, Some(&missing), None, None).unwrap_err();
        assert!(matches!(error, Error::WorkerNotFound));
    }

    #[test]
    fn version_triples_compare_numerically() {
        assert!(version_at_least("0.3.0", "0.3.0"));
        assert!(version_at_least("0.3.1", "0.3.0"));
        assert!(version_at_least("1.0.0", "0.9.9"));
        assert!(version_at_least("0.10.0", "0.9.0"));
        assert!(!version_at_least("0.2.9", "0.3.0"));
        assert!(!version_at_least("0.3.0", "1.0.0"));
    }

    #[test]
    fn versions_are_extracted_from_probe_output() {
        assert_eq!(
            extract_version("drover-worker 0.3.1").as_deref(),
            Some("0.3.1")
        );
        assert_eq!(extract_version("v1.2.3\n").as_deref(), Some("1.2.3"));
        assert_eq!(
            extract_version("worker 0.3.1-beta.2 (linux)").as_deref(),
            Some("0.3.1-beta.2")
        );
        assert_eq!(extract_version("no version here"), None);
    }

    #[test]
    fn prerelease_suffix_does_not_break_parsing() {
        assert_eq!(parse_triple("0.3.1-beta.2"), Some((0, 3, 1)));
        assert_eq!(parse_triple("0.3"), None);
        assert_eq!(parse_triple("banana"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn old_worker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "worker", r#"echo "drover-worker 0.1.0""#);

        let error = check_worker_version(&exe, &WorkerConfig::default())
            .await
            .unwrap_err();
        let Error::WorkerVersionTooLow { found, minimum } = error else {
            panic!("expected WorkerVersionTooLow");
        };
        assert_eq!(found, "0.1.0");
        assert_eq!(minimum, MIN_WORKER_VERSION);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_check_can_be_skipped_or_lowered() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "worker", r#"echo "drover-worker 0.1.0""#);

        let skip = WorkerConfig {
            skip_version_check: true,
            ..WorkerConfig::default()
        };
        check_worker_version(&exe, &skip).await.unwrap();

        let lowered = WorkerConfig {
            minimum_version: Some("0.1.0".to_string()),
            ..WorkerConfig::default()
        };
        check_worker_version(&exe, &lowered).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unversioned_probe_output_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "worker", "echo hello");
        check_worker_version(&exe, &WorkerConfig::default())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_and_kill_a_live_worker() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "worker", "sleep 30");

        let mut worker = WorkerProcess::spawn(&exe, &WorkerConfig::default())
            .await
            .unwrap();
        let (_stdin, _stdout) = worker.take_stdio().unwrap();
        worker.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_exit_is_a_launch_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "worker", "echo boom >&2\nexit 3");

        let error = WorkerProcess::spawn(&exe, &WorkerConfig::default())
            .await
            .unwrap_err();
        let Error::LaunchFailed(message) = error else {
            panic!("expected LaunchFailed");
        };
        assert!(message.contains("boom"), "{message}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(
            dir.path(),
            "worker",
            "i=0\nwhile [ $i -lt 100 ]; do echo line-$i >&2; i=$((i+1)); done\nsleep 30",
        );

        let worker = WorkerProcess::spawn(&exe, &WorkerConfig::default())
            .await
            .unwrap();
        // The drain task has had the 100ms launch grace period to catch up.
        let tail = worker.stderr_tail();
        let lines: Vec<&str> = tail.lines().collect();
        assert!(lines.len() <= super::STDERR_TAIL_LINES);
        assert_eq!(*lines.last().unwrap(), "line-99");
        worker.kill().await.unwrap();
    }
}
