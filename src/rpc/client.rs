//! Exec client over a helper socket

use super::{channel, recv_message, send_message, ExecSyncReply, ExecSyncRequest};
use crate::error::{Error, Result};
use crate::mount::{Exec, ExecResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Whole seconds sent to the server, rounded up; zero means no timeout
fn timeout_secs(timeout: Duration) -> i64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Runs commands through the exec server listening on a Unix socket
#[derive(Debug, Clone)]
pub struct SocketExec {
    socket_path: PathBuf,
}

impl SocketExec {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Connect once to check that a server is accepting on `socket_path`
    pub fn probe(socket_path: &Path) -> Result<Self> {
        std::os::unix::net::UnixStream::connect(socket_path).map_err(|e| {
            Error::Rpc(format!(
                "cannot connect to {}: {}",
                socket_path.display(),
                e
            ))
        })?;
        Ok(Self::new(socket_path))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn exec_sync(&self, request: ExecSyncRequest) -> Result<ExecResult> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Rpc(format!(
                "cannot connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let mut channel = channel(stream);

        send_message(&mut channel, &request).await?;
        match recv_message::<ExecSyncReply>(&mut channel).await? {
            Some(ExecSyncReply::Response(resp)) => Ok(ExecResult {
                stdout: resp.stdout,
                stderr: resp.stderr,
                exit_code: resp.exit_code,
            }),
            Some(ExecSyncReply::Error { message }) => Err(Error::Rpc(message)),
            None => Err(Error::Rpc("connection closed before reply".into())),
        }
    }
}

#[async_trait]
impl Exec for SocketExec {
    async fn run(&self, command: &str, args: &[String], timeout: Duration) -> Result<ExecResult> {
        let mut cmd = vec![command.to_string()];
        cmd.extend(args.iter().cloned());
        debug!("Exec via {}: {:?}", self.socket_path.display(), cmd);

        let request = ExecSyncRequest {
            cmd,
            timeout: timeout_secs(timeout),
        };
        if timeout.is_zero() {
            return self.exec_sync(request).await;
        }

        // The server enforces the same timeout; this bounds the whole exchange
        tokio::time::timeout(timeout, self.exec_sync(request))
            .await
            .map_err(|_| Error::ExecTimeout {
                command: command.to_string(),
                timeout,
            })?
    }
}
