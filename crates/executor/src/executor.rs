use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::capture::{StreamCapture, StreamOutput};
use crate::process_group::ProcessGroup;

pub const EXIT_FAILURE: i32 = 1;
/// Conventional shell exit codes: 124 for timeouts (and kills that left
/// no status behind), 126 for spawn permission errors, 127 for missing
/// binaries.
pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_PERMISSION_DENIED: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;

/// Contract violations by the caller. Everything that goes wrong with
/// the command itself is reported inside `ExecOutcome` instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("timeout must be positive")]
    ZeroTimeout,
    #[error("output cap must be positive")]
    ZeroOutputCap,
}

/// One command to run, with its limits resolved.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the inherited one.
    pub env: BTreeMap<String, String>,
    /// Address-space limit applied in the child before exec.
    pub memory_limit_mb: Option<u64>,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            max_output_bytes,
            cwd: None,
            env: BTreeMap::new(),
            memory_limit_mb: None,
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if self.timeout.is_zero() {
            return Err(ExecError::ZeroTimeout);
        }
        if self.max_output_bytes == 0 {
            return Err(ExecError::ZeroOutputCap);
        }
        Ok(())
    }
}

/// What happened to one command. `success` means a clean zero exit
/// within the timeout; every other shape of failure still comes back
/// through this struct rather than as an `Err`.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: StreamOutput,
    pub stderr: StreamOutput,
    pub duration_ms: u64,
}

/// Runs commands in their own process group under a wall-clock timeout,
/// with bounded output capture and an optional memory rlimit.
#[derive(Debug, Clone)]
pub struct ResourceExecutor {
    term_grace: Duration,
    collect_grace: Duration,
}

impl Default for ResourceExecutor {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_millis(500),
            collect_grace: Duration::from_millis(250),
        }
    }
}

impl ResourceExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, spec: ExecSpec) -> Result<ExecOutcome, ExecError> {
        spec.validate()?;
        let started = Instant::now();

        let mut command = Command::new(&spec.argv[0]);
        command
            .args(&spec.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(limit_mb) = spec.memory_limit_mb {
                let bytes = limit_mb.saturating_mul(1024 * 1024);
                unsafe {
                    command.pre_exec(move || {
                        rlimit::setrlimit(rlimit::Resource::AS, bytes, bytes)
                    });
                }
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(Self::spawn_failure(&spec.argv[0], e, started)),
        };
        let group = ProcessGroup::of(&child);
        let stdout = StreamCapture::spawn(child.stdout.take(), spec.max_output_bytes);
        let stderr = StreamCapture::spawn(child.stderr.take(), spec.max_output_bytes);

        let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
            // a None code means the child died to a signal; report it
            // like a kill since no real exit status exists
            Ok(Ok(status)) => (status.code().unwrap_or(EXIT_TIMEOUT), false),
            Ok(Err(e)) => {
                warn!(command = %spec.argv[0], error = %e, "failed waiting on child");
                (EXIT_FAILURE, false)
            }
            Err(_) => {
                warn!(
                    command = %spec.argv[0],
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "command timed out, terminating process group"
                );
                self.kill_group(&mut child, &group).await;
                (EXIT_TIMEOUT, true)
            }
        };

        let stdout = stdout.finish(self.collect_grace, "stdout").await;
        let stderr = stderr.finish(self.collect_grace, "stderr").await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let success = !timed_out && exit_code == 0;
        debug!(
            command = %spec.argv[0],
            exit_code,
            timed_out,
            duration_ms,
            stdout_bytes = stdout.original_bytes,
            stderr_bytes = stderr.original_bytes,
            "command finished"
        );

        Ok(ExecOutcome { success, exit_code, timed_out, stdout, stderr, duration_ms })
    }

    /// SIGTERM the whole group, give it a short grace to die, then
    /// SIGKILL. Does not return until the group is confirmed dead or
    /// the post-SIGKILL grace has elapsed.
    async fn kill_group(&self, child: &mut Child, group: &ProcessGroup) {
        group.terminate();
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        if tokio::time::timeout(self.term_grace, child.wait()).await.is_err() {
            warn!("process group survived SIGTERM, escalating to SIGKILL");
            group.force_kill();
            let _ = tokio::time::timeout(self.term_grace, child.wait()).await;
        }
    }

    fn spawn_failure(program: &str, error: std::io::Error, started: Instant) -> ExecOutcome {
        let exit_code = match error.kind() {
            std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
            std::io::ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
            _ => EXIT_FAILURE,
        };
        warn!(command = %program, exit_code, error = %error, "failed to spawn command");
        let message = format!("{program}: {error}");
        let stderr = StreamOutput {
            original_bytes: message.len() as u64,
            text: message,
            truncated: false,
            dropped_bytes: 0,
        };
        ExecOutcome {
            success: false,
            exit_code,
            timed_out: false,
            stdout: StreamOutput::default(),
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(argv: &[&str]) -> ExecSpec {
        ExecSpec::new(
            argv.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(10),
            10_000,
        )
    }

    #[tokio::test]
    async fn test_simple_command_succeeds() {
        let outcome = ResourceExecutor::new().run(spec(&["echo", "hello"])).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout.text.trim(), "hello");
        assert!(!outcome.stdout.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let outcome = ResourceExecutor::new().run(spec(&["sh", "-c", "exit 3"])).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let outcome = ResourceExecutor::new()
            .run(spec(&["sh", "-c", "echo out; echo oops >&2; exit 1"]))
            .await
            .unwrap();
        assert_eq!(outcome.stdout.text.trim(), "out");
        assert_eq!(outcome.stderr.text.trim(), "oops");
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_127() {
        let outcome = ResourceExecutor::new()
            .run(spec(&["definitely-not-a-real-binary-toolgate"]))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, EXIT_NOT_FOUND);
        assert!(outcome.stderr.text.contains("definitely-not-a-real-binary-toolgate"));
    }

    #[tokio::test]
    async fn test_timeout_kills_promptly() {
        let mut s = spec(&["sleep", "30"]);
        s.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_children_in_group() {
        // the shell spawns a grandchild; killing the group takes out both
        let mut s = spec(&["sh", "-c", "sleep 30 & sleep 30"]);
        s.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_window_is_tight() {
        // a one second budget against a five second sleep: the call
        // returns just past the budget, never near the sleep's length
        let mut s = spec(&["sleep", "5"]);
        s.timeout = Duration::from_secs(1);
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(
            (900..1500).contains(&outcome.duration_ms),
            "duration {}ms outside the expected window",
            outcome.duration_ms
        );
    }

    #[tokio::test]
    async fn test_no_survivors_after_group_kill() {
        // the grandchild outlives the kill window only if the group kill
        // missed it, in which case it drops a marker file
        let dir = tempfile::tempdir().unwrap();
        let spy = dir.path().join("survivor");
        let script = format!("(sleep 2 && touch {}) & sleep 30", spy.display());
        let mut s = spec(&["sh", "-c", script.as_str()]);
        s.timeout = Duration::from_secs(1);
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert!(outcome.timed_out);
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!spy.exists(), "a process survived the group kill");
    }

    #[tokio::test]
    async fn test_exiting_parent_with_lingering_child_does_not_wedge() {
        // the parent exits immediately but the backgrounded child holds
        // the stdout pipe open; collection must still return promptly
        let started = Instant::now();
        let outcome = ResourceExecutor::new()
            .run(spec(&["sh", "-c", "echo early; sleep 30 &"]))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.text.contains("early"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_timeout_code() {
        let outcome = ResourceExecutor::new()
            .run(spec(&["sh", "-c", "kill -KILL $$"]))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_large_output_truncated() {
        let mut s = spec(&["sh", "-c", "head -c 50000 /dev/zero | tr '\\0' 'a'"]);
        s.max_output_bytes = 1000;
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.truncated);
        assert!(outcome.stdout.text.contains(crate::capture::TRUNCATION_MARKER_PREFIX));
        assert!(outcome.stdout.text.len() <= 1000);
        assert_eq!(outcome.stdout.original_bytes, 50_000);
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let err = ResourceExecutor::new()
            .run(ExecSpec::new(vec![], Duration::from_secs(1), 100))
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::EmptyCommand);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let mut s = spec(&["echo"]);
        s.timeout = Duration::ZERO;
        let err = ResourceExecutor::new().run(s).await.unwrap_err();
        assert_eq!(err, ExecError::ZeroTimeout);
    }

    #[tokio::test]
    async fn test_zero_cap_rejected() {
        let mut s = spec(&["echo"]);
        s.max_output_bytes = 0;
        let err = ResourceExecutor::new().run(s).await.unwrap_err();
        assert_eq!(err, ExecError::ZeroOutputCap);
    }

    #[tokio::test]
    async fn test_cwd_respected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec(&["pwd"]);
        s.cwd = Some(dir.path().to_path_buf());
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        let reported = std::fs::canonicalize(outcome.stdout.text.trim()).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn test_env_overlay() {
        let mut s = spec(&["sh", "-c", "echo $TOOLGATE_TEST_MARKER"]);
        s.env.insert("TOOLGATE_TEST_MARKER".to_string(), "zap".to_string());
        let outcome = ResourceExecutor::new().run(s).await.unwrap();
        assert_eq!(outcome.stdout.text.trim(), "zap");
    }
}
