use tokio::process::Command;

use crate::prelude::*;

/// Run a command to completion and return its trimmed stdout.
///
/// A non-zero exit status is reported as [`Error::ExecError`]; stderr is logged at debug
/// level since callers here routinely probe for things that may not exist.
pub async fn exec(cmd: &mut Command) -> Result<String> {
    let cmd_str = format!("{:?}", cmd);
    trace!("Executing command: {}", cmd_str);

    let output = cmd.output().await?;
    let status = output.status;
    if !status.success() {
        for line in String::from_utf8_lossy(&output.stderr).trim().lines() {
            debug!("{}", line);
        }
        return Err(Error::ExecError {
            cmd: cmd_str,
            status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
