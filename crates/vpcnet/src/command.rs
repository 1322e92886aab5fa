//! External command execution.
//!
//! Every kernel mutation goes through one [`Executor`] as a pre-tokenized
//! argv; nothing is ever passed through a shell. Live mode runs the tool and
//! captures its outcome; dry-run mode emits mutating commands to the trace
//! sink and succeeds without side effect.

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Default upper bound on one link/filter command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Run commands against the host kernel.
    Live,
    /// Trace mutating commands without executing them.
    DryRun,
}

/// Runs privileged external tools with a wall-clock bound.
pub struct Executor {
    mode: ExecMode,
    timeout: Duration,
    traced: Mutex<Vec<String>>,
}

impl Executor {
    pub fn new(mode: ExecMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            traced: Mutex::new(Vec::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == ExecMode::DryRun
    }

    /// Execute a mutating command and return its trimmed stdout.
    ///
    /// In dry-run mode the command is printed and recorded instead.
    pub async fn run(&self, argv: &[String]) -> Result<String> {
        let cmd_str = argv.join(" ");
        if self.is_dry_run() {
            println!("dry-run: {cmd_str}");
            if let Ok(mut traced) = self.traced.lock() {
                traced.push(cmd_str);
            }
            return Ok(String::new());
        }
        self.invoke(argv, &cmd_str).await
    }

    /// Existence probe: true when the command exits zero.
    ///
    /// Dry-run reports the target as absent without executing, so the
    /// mutation that depends on the probe is traced.
    pub async fn probe(&self, argv: &[String]) -> Result<bool> {
        if self.is_dry_run() {
            return Ok(false);
        }
        let cmd_str = argv.join(" ");
        match self.invoke(argv, &cmd_str).await {
            Ok(_) => Ok(true),
            Err(Error::Exec { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read-only query; executes in both modes.
    pub async fn query(&self, argv: &[String]) -> Result<String> {
        let cmd_str = argv.join(" ");
        self.invoke(argv, &cmd_str).await
    }

    async fn invoke(&self, argv: &[String], cmd_str: &str) -> Result<String> {
        trace!(command = %cmd_str, "exec");
        let (program, args) = argv.split_first().ok_or_else(|| Error::Exec {
            command: String::new(),
            stderr: "empty command".to_string(),
        })?;

        let output = tokio::time::timeout(self.timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| Error::Timeout {
                command: cmd_str.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| Error::Exec {
                command: cmd_str.to_string(),
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::Exec {
                command: cmd_str.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Start a long-lived child detached from the orchestrator, stdout and
    /// stderr appended to `log_path`. Returns the child pid; 0 in dry-run.
    ///
    /// The child is deliberately not awaited and not killed on drop.
    pub async fn spawn_detached(&self, argv: &[String], log_path: &Path) -> Result<u32> {
        let cmd_str = argv.join(" ");
        if self.is_dry_run() {
            println!("dry-run: {cmd_str}");
            if let Ok(mut traced) = self.traced.lock() {
                traced.push(cmd_str);
            }
            return Ok(0);
        }

        debug!(command = %cmd_str, log = %log_path.display(), "spawning detached");
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::options()
            .create(true)
            .append(true)
            .open(log_path)?;
        let err_log = log.try_clone()?;
        let (program, args) = argv.split_first().ok_or_else(|| Error::Exec {
            command: String::new(),
            stderr: "empty command".to_string(),
        })?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
            .map_err(|e| Error::Exec {
                command: cmd_str.clone(),
                stderr: e.to_string(),
            })?;
        child.id().ok_or_else(|| Error::Exec {
            command: cmd_str,
            stderr: "child exited before a pid could be read".to_string(),
        })
    }

    /// Commands traced in dry-run mode, in emission order.
    pub fn traced(&self) -> Vec<String> {
        self.traced.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

/// Build an owned argv from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> Executor {
        Executor::new(ExecMode::Live, DEFAULT_TIMEOUT)
    }

    fn dry() -> Executor {
        Executor::new(ExecMode::DryRun, DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn run_returns_trimmed_stdout() {
        let out = live().run(&argv(&["echo", "hello"])).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn run_error_carries_command_and_stderr() {
        let err = live()
            .run(&argv(&["ls", "/definitely/not/a/path"]))
            .await
            .unwrap_err();
        match err {
            Error::Exec { command, stderr } => {
                assert!(command.starts_with("ls "), "command was: {command}");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Exec, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_times_out() {
        let exec = Executor::new(ExecMode::Live, Duration::from_millis(100));
        let err = exec.run(&argv(&["sleep", "5"])).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = live().run(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Exec { .. }));
    }

    #[tokio::test]
    async fn dry_run_traces_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("should-not-exist");
        let exec = dry();
        exec.run(&argv(&["touch", &target.to_string_lossy()]))
            .await
            .unwrap();
        assert!(!target.exists());
        let traced = exec.traced();
        assert_eq!(traced.len(), 1);
        assert!(traced.first().unwrap().starts_with("touch "));
    }

    #[tokio::test]
    async fn dry_run_probe_reports_absent() {
        assert!(!dry().probe(&argv(&["true"])).await.unwrap());
    }

    #[tokio::test]
    async fn probe_maps_exit_status() {
        assert!(live().probe(&argv(&["true"])).await.unwrap());
        assert!(!live().probe(&argv(&["false"])).await.unwrap());
    }

    #[tokio::test]
    async fn query_executes_in_dry_run() {
        let out = dry().query(&argv(&["echo", "probe"])).await.unwrap();
        assert_eq!(out, "probe");
        assert!(dry().traced().is_empty());
    }

    #[tokio::test]
    async fn spawn_detached_writes_log_and_returns_pid() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("app.log");
        let pid = live()
            .spawn_detached(&argv(&["sh", "-c", "echo started"]), &log)
            .await
            .unwrap();
        assert!(pid > 0);
        // Give the child a moment to run and flush.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("started"));
    }

    #[tokio::test]
    async fn spawn_detached_dry_run_returns_zero_pid() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let exec = dry();
        let pid = exec
            .spawn_detached(&argv(&["sleep", "60"]), &log)
            .await
            .unwrap();
        assert_eq!(pid, 0);
        assert!(!log.exists());
        assert_eq!(exec.traced().len(), 1);
    }
}
