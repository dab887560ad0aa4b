//! Host command execution
//!
//! [`OsExec`] runs commands on this host with an upper-bound timeout; the
//! child is killed when the timeout fires. [`ErrorExec`] stands in for an
//! executor that could not be set up and fails every call.

use super::{Exec, ExecResult};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs commands as child processes of this process
#[derive(Debug, Clone, Default)]
pub struct OsExec;

impl OsExec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Exec for OsExec {
    async fn run(&self, command: &str, args: &[String], timeout: Duration) -> Result<ExecResult> {
        debug!("Exec: {} {:?}", command, args);

        let mut cmd = Command::new(command);
        cmd.args(args).kill_on_drop(true);

        let output = if timeout.is_zero() {
            cmd.output().await
        } else {
            match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(output) => output,
                Err(_) => {
                    // Dropping the output future killed the child
                    warn!("Command {} {:?} timed out after {:?}", command, args, timeout);
                    return Err(Error::ExecTimeout {
                        command: command.to_string(),
                        timeout,
                    });
                }
            }
        };

        let output = output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ExecutableNotFound {
                    command: command.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        Ok(ExecResult {
            stdout: output.stdout,
            stderr: output.stderr,
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Executor that always fails with a stored error message
#[derive(Debug, Clone)]
pub struct ErrorExec {
    message: String,
}

impl ErrorExec {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Exec for ErrorExec {
    async fn run(&self, command: &str, _args: &[String], _timeout: Duration) -> Result<ExecResult> {
        Err(Error::Rpc(format!(
            "cannot execute {}: {}",
            command, self.message
        )))
    }
}
