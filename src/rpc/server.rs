//! Exec server
//!
//! One listener per plugin name. Each request runs the command on this host
//! with the requested timeout; the child is killed when the timeout expires.

use super::{
    channel, recv_message, send_message, volume_plugin_socket_path, ExecSyncReply,
    ExecSyncRequest, ExecSyncResponse,
};
use crate::error::{Error, Result};
use crate::mount::{Exec, ExecRef, OsExec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mode of the socket directory
const SOCKET_DIR_MODE: u32 = 0o700;

/// Configuration for the exec servers
#[derive(Debug, Clone)]
pub struct ExecServerConfig {
    /// Root directory sockets are derived from
    pub root_dir: PathBuf,
}

impl Default for ExecServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(crate::volume::DEFAULT_ROOT_DIR),
        }
    }
}

/// Exec server for a single plugin
pub struct ExecServer {
    plugin_name: String,
    socket_path: PathBuf,
    exec: ExecRef,
}

impl ExecServer {
    pub fn new(config: &ExecServerConfig, plugin_name: &str) -> Self {
        Self::with_exec(config, plugin_name, Arc::new(OsExec::new()))
    }

    pub fn with_exec(config: &ExecServerConfig, plugin_name: &str, exec: ExecRef) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            socket_path: volume_plugin_socket_path(&config.root_dir, plugin_name),
            exec,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Create the socket directory, drop a stale socket and listen
    pub fn bind(&self) -> Result<UnixListener> {
        use std::os::unix::fs::DirBuilderExt;

        if let Some(dir) = self.socket_path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(SOCKET_DIR_MODE)
                .create(dir)?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            "Exec server for {} listening on {}",
            self.plugin_name,
            self.socket_path.display()
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Exec server for {} shutting down", self.plugin_name);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!("Exec connection for {} failed: {}", server.plugin_name, e);
                        }
                    });
                }
            }
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.socket_path.display(), e);
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let mut channel = channel(stream);
        while let Some(request) = recv_message::<ExecSyncRequest>(&mut channel).await? {
            let reply = exec_sync(self.exec.as_ref(), request).await;
            send_message(&mut channel, &reply).await?;
        }
        Ok(())
    }
}

/// Serve one request
pub async fn exec_sync(exec: &dyn Exec, request: ExecSyncRequest) -> ExecSyncReply {
    let Some((program, args)) = request.cmd.split_first() else {
        return ExecSyncReply::Error {
            message: "missing command".into(),
        };
    };
    let timeout = if request.timeout > 0 {
        Duration::from_secs(request.timeout as u64)
    } else {
        Duration::ZERO
    };

    debug!("ExecSync: {} {:?} (timeout {:?})", program, args, timeout);
    match exec.run(program, args, timeout).await {
        Ok(result) => ExecSyncReply::Response(ExecSyncResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        }),
        Err(Error::ExecTimeout { timeout, .. }) => ExecSyncReply::Response(ExecSyncResponse {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: format!("command timed out after {:?}", timeout).into_bytes(),
        }),
        Err(e) => ExecSyncReply::Error {
            message: e.to_string(),
        },
    }
}

/// Run one exec server per plugin until one stops or `shutdown` fires
///
/// All sockets are removed before returning.
pub async fn run_exec_servers(
    config: ExecServerConfig,
    plugin_names: Vec<String>,
    shutdown: CancellationToken,
) -> Result<()> {
    if plugin_names.is_empty() {
        return Err(Error::Configuration("no plugin names given".into()));
    }

    let mut servers: Vec<Arc<ExecServer>> = Vec::new();
    let mut tasks = JoinSet::new();
    for name in &plugin_names {
        let server = Arc::new(ExecServer::new(&config, name));
        let listener = match server.bind() {
            Ok(l) => l,
            Err(e) => {
                shutdown.cancel();
                for server in &servers {
                    server.cleanup();
                }
                return Err(e);
            }
        };
        servers.push(server.clone());
        tasks.spawn(server.serve(listener, shutdown.clone()));
    }

    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown.cancelled() => {}
        finished = tasks.join_next() => {
            match finished {
                Some(Ok(Err(e))) => {
                    error!("Exec server failed: {}", e);
                    outcome = Err(e);
                }
                Some(Err(e)) => {
                    error!("Exec server task panicked: {}", e);
                    outcome = Err(Error::Internal(e.to_string()));
                }
                _ => {}
            }
        }
    }

    // One server ending stops the rest
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    for server in &servers {
        server.cleanup();
    }
    info!("All exec servers stopped");
    outcome
}
