//! Exec inside a mount pod
//!
//! Runs a command in the first container of a helper pod through the pod
//! `exec` subresource, the way `kubectl exec` does.

use super::{Exec, ExecResult};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Executor bound to one helper pod
pub struct PodExec {
    pod: Pod,
    client: Client,
}

impl PodExec {
    pub fn new(pod: Pod, client: Client) -> Self {
        Self { pod, client }
    }

    async fn exec_in_pod(&self, cmdline: Vec<String>) -> Result<ExecResult> {
        let name = self.pod.metadata.name.clone().unwrap_or_default();
        let namespace = self.pod.metadata.namespace.clone().unwrap_or_default();
        let container = self
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                Error::Configuration(format!("mount pod {}/{} has no containers", namespace, name))
            })?;

        debug!("Running {:?} in pod {}/{}", cmdline.join(" "), namespace, name);

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = pods.exec(&name, cmdline, &params).await?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let read_stdout = async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = stdout {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = stderr {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: exit_code_from_status(status.as_ref()),
        })
    }
}

#[async_trait]
impl Exec for PodExec {
    async fn run(&self, command: &str, args: &[String], timeout: Duration) -> Result<ExecResult> {
        let mut cmdline = vec![command.to_string()];
        cmdline.extend(args.iter().cloned());

        if timeout.is_zero() {
            return self.exec_in_pod(cmdline).await;
        }
        // Dropping the exec future closes the websocket, which ends the remote command
        tokio::time::timeout(timeout, self.exec_in_pod(cmdline))
            .await
            .map_err(|_| Error::ExecTimeout {
                command: command.to_string(),
                timeout,
            })?
    }
}

/// Exit code reported by the exec status channel
///
/// Success is 0; a failure carries the code in an `ExitCode` cause. A missing
/// or unparseable status counts as a generic failure.
fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return 1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse().ok())
        })
        .unwrap_or(1)
}
