//! Local terminal command execution.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::message::ToolResultPart;
use crate::tools::RunTerminalCommandInput;
use crate::tools::render::unescape_command;

/// Default command timeout when the input does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Combined stdout/stderr cap before truncation.
pub const OUTPUT_LIMIT: usize = 50 * 1024;

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // CSI and simple escape sequences; colors are the common case.
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]")
            .unwrap_or_else(|_| Regex::new("$^").expect("fallback regex"))
    })
}

/// Strip ANSI escape sequences from command output.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Truncate output to [`OUTPUT_LIMIT`] bytes on a char boundary.
#[must_use]
pub fn truncate_output(text: &str) -> (String, bool) {
    if text.len() <= OUTPUT_LIMIT {
        return (text.to_owned(), false);
    }
    let mut end = OUTPUT_LIMIT;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_owned();
    truncated.push_str("\n[output truncated]");
    (truncated, true)
}

/// Run a shell command under the project root and collect its output.
///
/// The timeout comes from the input (`timeout_seconds < 0` disables it);
/// timed-out commands are killed and reported as an error part.
pub async fn run_command(root: &Path, input: &RunTerminalCommandInput) -> Vec<ToolResultPart> {
    let command_line = unescape_command(&input.command);
    let cwd = match &input.cwd {
        Some(relative) => root.join(relative),
        None => root.to_path_buf(),
    };

    let timeout = match input.timeout_seconds {
        Some(secs) if secs < 0.0 => None,
        Some(secs) => Some(Duration::from_secs_f64(secs)),
        None => Some(DEFAULT_COMMAND_TIMEOUT),
    };

    debug!(command = %command_line, cwd = %cwd.display(), "running terminal command");

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&command_line)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return vec![ToolResultPart::error(format!(
                "could not spawn command: {e}"
            ))];
        }
    };

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result,
            Err(_) => {
                return vec![ToolResultPart::error(format!(
                    "command timed out after {}s: {command_line}",
                    limit.as_secs_f64()
                ))];
            }
        },
        None => child.wait_with_output().await,
    };

    match output {
        Ok(output) => {
            let stdout = strip_ansi(&String::from_utf8_lossy(&output.stdout));
            let stderr = strip_ansi(&String::from_utf8_lossy(&output.stderr));
            let (stdout, stdout_truncated) = truncate_output(&stdout);
            let (stderr, stderr_truncated) = truncate_output(&stderr);
            vec![ToolResultPart::json(json!({
                "command": input.command,
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": output.status.code(),
                "truncated": stdout_truncated || stderr_truncated,
            }))]
        }
        Err(e) => vec![ToolResultPart::error(format!("command failed to run: {e}"))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> RunTerminalCommandInput {
        RunTerminalCommandInput {
            command: line.to_owned(),
            cwd: None,
            timeout_seconds: None,
        }
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn truncate_output_marks_truncation() {
        let (out, truncated) = truncate_output(&"x".repeat(OUTPUT_LIMIT + 10));
        assert!(truncated);
        assert!(out.ends_with("[output truncated]"));

        let (out, truncated) = truncate_output("short");
        assert!(!truncated);
        assert_eq!(out, "short");
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parts = run_command(dir.path(), &command("echo hello; exit 3")).await;
        let ToolResultPart::Json { value } = &parts[0] else {
            panic!("expected json part");
        };
        assert_eq!(value["stdout"], "hello\n");
        assert_eq!(value["exitCode"], 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = RunTerminalCommandInput {
            command: "sleep 5".into(),
            cwd: None,
            timeout_seconds: Some(0.1),
        };
        let parts = run_command(dir.path(), &input).await;
        assert!(parts[0].is_error());
        let message = parts[0].error_message().expect("error message");
        assert!(message.contains("timed out"));
    }

    #[tokio::test]
    async fn ampersands_are_unescaped_before_dispatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parts = run_command(dir.path(), &command("true &amp;&amp; echo chained")).await;
        let ToolResultPart::Json { value } = &parts[0] else {
            panic!("expected json part");
        };
        assert_eq!(value["stdout"], "chained\n");
    }
}
