use std::ffi::OsStr;

use tokio::process::Command;

const MAX_CAPTURE_BYTES: usize = 8 * 1024;

/// Captured result of a finished helper process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// One-line summary for error messages.
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }
    }
}

fn capture(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    if text.len() <= MAX_CAPTURE_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_CAPTURE_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(truncated)", &text[..end])
}

/// Runs `program` with `args` to completion, without a shell.
///
/// Returns `Err` only when the program could not be started at all; a
/// non-zero exit is reported through [`CommandOutput::code`].
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> std::io::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let out = cmd.output().await?;
    Ok(CommandOutput {
        code: out.status.code(),
        stdout: capture(&out.stdout),
        stderr: capture(&out.stderr),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let out = run("/bin/sh", ["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.describe(), "exit status 3: err");
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let out = run("/bin/echo", ["a; rm -rf /", "$HOME"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "a; rm -rf / $HOME");
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let err = run("/definitely/not/here", Vec::<String>::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn long_output_is_truncated() {
        let s = capture(&vec![b'x'; MAX_CAPTURE_BYTES * 2]);
        assert!(s.ends_with("…(truncated)"));
    }
}
