//! Execution envelope around one shell command.
//!
//! The executor owns everything between "claimed" and "outcome": spawning the
//! subshell, capturing output, enforcing the per-job timeout, and translating
//! exit status into an [`ExecOutcome`]. It never touches the store.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Classified result of one execution.
///
/// `Success`/`Failure` always carry captured output (empty strings when the
/// command produced none). `Timeout` carries whatever partial output the
/// pipes yielded before the process group was killed, `None` when nothing
/// was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success {
        stdout: String,
        stderr: String,
    },
    Failure {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    Timeout {
        stdout: Option<String>,
        stderr: Option<String>,
    },
    SpawnError {
        message: String,
    },
}

/// Runs job commands under the system shell.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: String,
    shell_flag: String,
}

impl Default for Executor {
    fn default() -> Self {
        #[cfg(unix)]
        let (shell, flag) = ("/bin/sh", "-c");
        #[cfg(windows)]
        let (shell, flag) = ("cmd", "/C");
        Self::with_shell(shell, flag)
    }
}

impl Executor {
    /// Use a specific shell binary and command flag instead of the platform
    /// default.
    pub fn with_shell(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            shell_flag: flag.into(),
        }
    }

    /// Run `command` under the shell, waiting at most `timeout_secs` wall
    /// clock when given. On timeout the child's whole process group is
    /// killed before the outcome is reported.
    pub async fn run(&self, command: &str, timeout_secs: Option<i64>) -> ExecOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.shell_flag)
            .arg(command)
            // No stdin: commands probing for input must not hang the worker.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecOutcome::SpawnError {
                    message: err.to_string(),
                }
            }
        };

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = match timeout_secs {
            Some(secs) if secs > 0 => {
                match tokio::time::timeout(Duration::from_secs(secs as u64), child.wait()).await {
                    Ok(waited) => waited,
                    Err(_) => {
                        terminate(&mut child).await;
                        let stdout = collect(stdout).await;
                        let stderr = collect(stderr).await;
                        return ExecOutcome::Timeout {
                            stdout: non_empty(stdout),
                            stderr: non_empty(stderr),
                        };
                    }
                }
            }
            _ => child.wait().await,
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        match waited {
            Ok(status) if status.success() => ExecOutcome::Success { stdout, stderr },
            Ok(status) => ExecOutcome::Failure {
                stdout,
                stderr,
                // None means the child was taken down by a signal.
                exit_code: status.code().unwrap_or(-1),
            },
            Err(err) => ExecOutcome::SpawnError {
                message: err.to_string(),
            },
        }
    }
}

/// Kill the child and everything it spawned. The group kill reaches shell
/// descendants that a plain `Child::kill` would orphan.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).trim_end().to_string()
    })
}

async fn collect(reader: JoinHandle<String>) -> String {
    reader.await.unwrap_or_default()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn success_captures_trimmed_output() {
        let outcome = Executor::default().run("echo hi", None).await;
        assert_eq!(
            outcome,
            ExecOutcome::Success {
                stdout: "hi".into(),
                stderr: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn failure_reports_exit_code_and_stderr() {
        let outcome = Executor::default()
            .run("echo oops >&2; exit 3", None)
            .await;
        assert_eq!(
            outcome,
            ExecOutcome::Failure {
                stdout: String::new(),
                stderr: "oops".into(),
                exit_code: 3,
            }
        );
    }

    #[tokio::test]
    async fn timeout_kills_promptly_and_keeps_partial_output() {
        let started = Instant::now();
        let outcome = Executor::default()
            .run("echo partial; sleep 30", Some(1))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        match outcome {
            ExecOutcome::Timeout { stdout, stderr } => {
                assert_eq!(stdout.as_deref(), Some("partial"));
                assert_eq!(stderr, None);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_timeout_means_no_timeout() {
        let outcome = Executor::default().run("echo done", Some(0)).await;
        assert!(matches!(outcome, ExecOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let outcome = Executor::with_shell("/nonexistent/shell", "-c")
            .run("echo hi", None)
            .await;
        assert!(matches!(outcome, ExecOutcome::SpawnError { .. }));
    }
}
