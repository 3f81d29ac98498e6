//! Child process execution shared by the CLI adapters.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::types::ExecOutput;

/// Run `program` with `args`, capturing stdout and stderr.
///
/// A non-zero exit status is returned in the output, not as an error.
pub async fn run(program: &str, args: &[String]) -> ProviderResult<ExecOutput> {
    debug!(%program, ?args, "running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProviderError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(ExecOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and require success, returning its stdout.
///
/// Failures whose stderr reports a missing resource map to
/// [`ProviderError::NotFound`] with `what` as the subject.
pub async fn run_checked(program: &str, args: &[String], what: &str) -> ProviderResult<String> {
    let output = run(program, args).await?;
    check(program, output, what)
}

pub(crate) fn check(program: &str, output: ExecOutput, what: &str) -> ProviderResult<String> {
    if output.success() {
        return Ok(output.stdout);
    }
    if is_not_found(&output.stderr) {
        return Err(ProviderError::NotFound(what.to_string()));
    }
    Err(ProviderError::CommandFailed {
        program: program.to_string(),
        code: output.code,
        stderr: output.stderr.trim().to_string(),
    })
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("was not found")
        || stderr.contains("notFound")
        || stderr.contains("No such container")
}
