//! Helper-process exec RPC
//!
//! A single call, `ExecSync(cmd, timeout) -> {exit_code, stdout, stderr}`,
//! served on a Unix socket per volume plugin under
//! `<root>/plugin-sockets/<escaped plugin name>`. Messages are JSON documents
//! in length-delimited frames.

pub mod client;
pub mod server;

pub use client::SocketExec;
pub use server::{run_exec_servers, ExecServer, ExecServerConfig};

use crate::error::{Error, Result};
use crate::volume::escape_plugin_name;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Directory under the root dir holding helper sockets
pub const PLUGIN_SOCKETS_DIR: &str = "plugin-sockets";

// =============================================================================
// Messages
// =============================================================================

/// Run a command to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSyncRequest {
    /// Program followed by its arguments
    pub cmd: Vec<String>,
    /// Timeout in seconds; zero or negative means no timeout
    pub timeout: i64,
}

/// Outcome of a command that ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSyncResponse {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Reply frame: a response, or an error for requests that could not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecSyncReply {
    Response(ExecSyncResponse),
    Error { message: String },
}

// =============================================================================
// Framing
// =============================================================================

pub type ExecChannel = Framed<UnixStream, LengthDelimitedCodec>;

pub fn channel(stream: UnixStream) -> ExecChannel {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send_message<T: Serialize>(channel: &mut ExecChannel, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    channel
        .send(Bytes::from(payload))
        .await
        .map_err(|e| Error::Rpc(format!("send failed: {}", e)))
}

/// Next message, or `None` once the peer closed the connection
pub async fn recv_message<T: DeserializeOwned>(channel: &mut ExecChannel) -> Result<Option<T>> {
    match channel.next().await {
        Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
        Some(Err(e)) => Err(Error::Rpc(format!("receive failed: {}", e))),
        None => Ok(None),
    }
}

// =============================================================================
// Socket Paths
// =============================================================================

/// Socket path for `plugin_name` under `root_dir`
pub fn volume_plugin_socket_path(root_dir: &Path, plugin_name: &str) -> PathBuf {
    root_dir
        .join(PLUGIN_SOCKETS_DIR)
        .join(escape_plugin_name(plugin_name))
}
