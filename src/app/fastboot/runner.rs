use std::io::Read;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::app::interrupt::InterruptGate;
use crate::app::models::{CommandResult, CommandStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed to poll {program}: {reason}")]
    Poll { program: String, reason: String },

    #[error("{program} was interrupted")]
    Interrupted { program: String },
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run_command(
    program: &str,
    args: &[String],
    trace_id: &str,
) -> Result<CommandResult, RunnerError> {
    run_command_with_timeout(program, args, Duration::from_secs(10), None, trace_id)
}

fn drain<R: Read + Send + 'static>(reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn collect(
    stdout_handle: JoinHandle<Vec<u8>>,
    stderr_handle: JoinHandle<Vec<u8>>,
) -> (String, String) {
    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Runs `program`, killing it on timeout or when `gate` allows a pending interrupt.
///
/// A timeout is reported as a `TimedOut` result rather than an error, since for
/// fastboot it usually means the device dropped off the bus.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    gate: Option<&InterruptGate>,
    trace_id: &str,
) -> Result<CommandResult, RunnerError> {
    debug!(trace_id = %trace_id, program = %program, args = ?args, "running host command");
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| RunnerError::Spawn {
            program: program.to_string(),
            reason: err.to_string(),
        })?;

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let stdout: Option<ChildStdout> = child.stdout.take();
    let stderr: Option<ChildStderr> = child.stderr.take();
    let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(RunnerError::Spawn {
            program: program.to_string(),
            reason: "failed to capture output pipes".to_string(),
        });
    };
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if gate.is_some_and(|gate| gate.should_interrupt()) {
                    warn!(trace_id = %trace_id, program = %program, "killing command on interrupt");
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = collect(stdout_handle, stderr_handle);
                    return Err(RunnerError::Interrupted {
                        program: program.to_string(),
                    });
                }
                if start.elapsed() > timeout {
                    warn!(
                        trace_id = %trace_id,
                        program = %program,
                        timeout_ms = timeout.as_millis() as u64,
                        "command timed out"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    let (stdout, stderr) = collect(stdout_handle, stderr_handle);
                    return Ok(CommandResult {
                        status: CommandStatus::TimedOut,
                        stdout,
                        stderr,
                        exit_code: None,
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = collect(stdout_handle, stderr_handle);
                return Err(RunnerError::Poll {
                    program: program.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    };

    let (stdout, stderr) = collect(stdout_handle, stderr_handle);
    let status = if exit_code == Some(0) {
        CommandStatus::Success
    } else {
        CommandStatus::Failed
    };
    Ok(CommandResult {
        status,
        stdout,
        stderr,
        exit_code,
    })
}
