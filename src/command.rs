use std::{process::Stdio, time::Duration};

use tracing::debug;

/// Most of a failing tool's stderr that ends up in an error message.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug)]
pub enum CommandError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Timeout {
        program: String,
        timeout: Duration,
    },
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "spawn {program}: {source}"),
            Self::Timeout { program, timeout } => {
                write!(f, "timeout running {program} after {}s", timeout.as_secs())
            }
            Self::Failed {
                program,
                status,
                stderr,
            } => {
                if stderr.is_empty() {
                    write!(f, "{program} exited with {status}")
                } else {
                    write!(f, "{program} exited with {status}: {stderr}")
                }
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Runs `program args..` to completion and returns its stdout.
///
/// The child is killed if `timeout` elapses or the returned future is dropped.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, CommandError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!(program, ?args, "running command");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
    };

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: stderr_tail(&output.stderr),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_command("sh", &args(&["-c", "echo hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = run_command(
            "sh",
            &args(&["-c", "echo boom >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match &err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_command(
            "/nonexistent/cloudscale-test-binary",
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let err = run_command("sh", &args(&["-c", "sleep 5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[test]
    fn long_stderr_is_truncated_from_the_front() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 10);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }
}
