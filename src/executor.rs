//! Runs validated commands inside an instance's sandbox directory.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::validator::ValidatedCommand;

/// Exit code reported when a command is killed for running too long.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a program cannot be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const TRUNCATED_NOTICE: &str = "[output truncated]";

/// Bounds applied to a single command run.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    /// Per-stream cap on captured bytes.
    pub max_output_bytes: usize,
}

/// Result of running a command. Failures are folded in here rather than
/// returned as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    fn failure(exit_code: i32, stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            exit_code,
        }
    }
}

/// Run `command` directly (no shell) with its working directory pinned to
/// `sandbox_dir`.
pub async fn execute(
    command: &ValidatedCommand,
    sandbox_dir: &Path,
    limits: ExecLimits,
) -> ExecOutput {
    info!(program = command.program, args = ?command.args, "Running command");

    let mut child = match Command::new(command.program)
        .args(&command.args)
        .current_dir(sandbox_dir)
        .env_clear()
        .env("PATH", CHILD_PATH)
        .env("HOME", sandbox_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = command.program, error = %e, "Failed to spawn command");
            return ExecOutput::failure(
                SPAWN_FAILURE_EXIT_CODE,
                format!("{}: failed to start: {}", command.program, e),
            );
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        return ExecOutput::failure(1, "output pipes unavailable".to_string());
    };

    let cap = limits.max_output_bytes;
    let run = async {
        tokio::join!(
            read_bounded(stdout, cap),
            read_bounded(stderr, cap),
            child.wait()
        )
    };

    let finished = tokio::time::timeout(limits.timeout, run).await;
    match finished {
        Ok((out, err, status)) => {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(program = command.program, error = %e, "Failed to wait for command");
                    return ExecOutput::failure(1, format!("{}: {}", command.program, e));
                }
            };
            let output = finish(out, err, status);
            info!(program = command.program, exit_code = output.exit_code, "Command finished");
            output
        }
        Err(_) => {
            warn!(
                program = command.program,
                timeout_ms = limits.timeout.as_millis() as u64,
                "Command timed out"
            );
            if let Err(e) = child.kill().await {
                warn!(program = command.program, error = %e, "Failed to kill timed-out command");
            }
            ExecOutput::failure(TIMEOUT_EXIT_CODE, "Command timed out.".to_string())
        }
    }
}

/// Captured bytes from one stream, and whether anything was dropped.
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read at most `cap` bytes, then drain and discard the rest so the child
/// never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Captured {
    let mut bytes = Vec::new();
    let mut limited = (&mut reader).take(cap as u64);
    if let Err(e) = limited.read_to_end(&mut bytes).await {
        warn!(error = %e, "Failed reading command output");
    }
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink())
        .await
        .unwrap_or(0);
    Captured {
        bytes,
        truncated: discarded > 0,
    }
}

fn finish(out: Captured, err: Captured, status: ExitStatus) -> ExecOutput {
    let stdout = String::from_utf8_lossy(&out.bytes).into_owned();
    let mut stderr = String::from_utf8_lossy(&err.bytes).into_owned();

    let exit_code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);

    if exit_code != 0 && stderr.is_empty() {
        stderr = format!("Command failed with exit code {}", exit_code);
    }
    if out.truncated || err.truncated {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(TRUNCATED_NOTICE);
    }

    ExecOutput {
        stdout,
        stderr,
        exit_code,
    }
}
