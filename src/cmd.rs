use std::{ffi::OsStr, path::Path, process::Output};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Whether invocations are echoed at `info` level or only at `debug`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Echo {
    #[default]
    Quiet,
    Verbose,
}

/// Runs `program` to completion and returns its stdout.
///
/// A non-zero exit status becomes [`Error::Command`] carrying the trimmed
/// stderr, so callers can match on the tool's own diagnostics.
pub async fn run<I, S>(program: &Path, args: I, echo: Echo) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    let rendered = render_args(&args);
    match echo {
        Echo::Verbose => info!(program = %program.display(), args = %rendered, "exec"),
        Echo::Quiet => debug!(program = %program.display(), args = %rendered, "exec"),
    }

    let output = run_inner(program, &args).await?;
    debug!(status = %output.status, stdout_len = output.stdout.len(), "exit");

    if !output.status.success() {
        return Err(Error::Command {
            program: program.display().to_string(),
            args: rendered,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_inner<S>(program: &Path, args: &[S]) -> std::io::Result<Output>
where
    S: AsRef<OsStr>,
{
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
}

fn render_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|s| s.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run(Path::new("echo"), ["hello", "world"], Echo::Quiet)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[tokio::test]
    async fn failing_status_carries_stderr() {
        let err = run(
            Path::new("sh"),
            ["-c", "echo 'Could not find a registered machine' >&2; exit 1"],
            Echo::Quiet,
        )
        .await
        .unwrap_err();

        match err {
            Error::Command { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "Could not find a registered machine");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let err = run(Path::new("/nonexistent/VBoxManage"), ["list", "vms"], Echo::Quiet)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
