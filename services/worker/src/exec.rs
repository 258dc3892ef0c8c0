//! Single seam for every external tool invocation: spawn, wait under a
//! soft deadline, kill on timeout, and fold exit status plus truncated
//! stderr into a structured error.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use shared::error::JobError;

/// Stderr excerpts beyond this are cut; full tool output stays in the
/// tool's own logs, not in job rows.
const STDERR_LIMIT: usize = 400;

/// Runs `program args..` to completion. Arguments are deliberately not
/// logged: qpdf invocations carry user passwords.
pub async fn run_tool(
    tool: &'static str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), JobError> {
    debug!(tool, program, "spawning external tool");
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| JobError::ToolProcess {
        tool,
        code: "spawn".into(),
        stderr: err.to_string(),
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|err| JobError::ToolProcess {
            tool,
            code: "wait".into(),
            stderr: err.to_string(),
        })?,
        // The dropped future kills the child via kill_on_drop.
        Err(_) => {
            return Err(JobError::ToolTimeout {
                tool,
                seconds: timeout.as_secs(),
            })
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".into());
    Err(JobError::ToolProcess {
        tool,
        code,
        stderr: truncate_output(&output.stderr),
    })
}

/// Lossy stderr decode trimmed to [`STDERR_LIMIT`] characters.
pub fn truncate_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    truncate_message(text.trim(), STDERR_LIMIT)
}

/// Cuts `text` at a char boundary, appending an ellipsis when shortened.
pub fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        assert_eq!(truncate_output(b"  GPL Ghostscript 10.0\n"), "GPL Ghostscript 10.0");
    }

    #[test]
    fn long_output_is_cut_at_char_boundary() {
        let noisy = "ä".repeat(1000);
        let cut = truncate_message(&noisy, 400);
        assert_eq!(cut.chars().count(), 401);
        assert!(cut.ends_with('…'));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let err = run_tool(
            "gs",
            "/nonexistent/definitely-not-a-binary",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        match err {
            JobError::ToolProcess { tool, code, .. } => {
                assert_eq!(tool, "gs");
                assert_eq!(code, "spawn");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let err = run_tool(
            "qpdf",
            "/bin/sh",
            &["-c".into(), "echo boom >&2; exit 3".into()],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            JobError::ToolProcess { code, stderr, .. } => {
                assert_eq!(code, "3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_kills_and_reports_timeout() {
        let err = run_tool(
            "soffice",
            "/bin/sh",
            &["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::ToolTimeout { tool: "soffice", .. }));
    }
}
