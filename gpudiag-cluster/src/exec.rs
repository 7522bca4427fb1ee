//! Remote-exec streaming into an agent pod.
//!
//! The exec transport mode tunnels a synthesized JSON-RPC conversation
//! through the cluster API server's attach/exec channel
//! instead of a direct pod-to-pod HTTP call, trading latency for
//! tolerance of restrictive CNI policies. This module is JSON-RPC-agnostic:
//! it writes whatever line-delimited messages it's given to the remote
//! process's stdin and returns whatever came back on stdout; constructing
//! the handshake+tool-call messages and splitting the (possibly
//! newline-free, concatenated) reply is `gpudiag-dispatch`'s job.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// The binary + flags an agent pod runs its diagnostics process with in
/// stdio mode, invoked over exec rather than started as the pod's own
/// entrypoint override.
const AGENT_STDIO_COMMAND: &[&str] = &["gpudiag", "--stdio"];

/// Stream `messages` (each one JSON-RPC request, newline-terminated) to the
/// agent pod's stdin over a single exec session and return everything
/// written to stdout before the process exits.
pub async fn exec_messages(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    container: Option<&str>,
    messages: &[String],
    token: &CancellationToken,
) -> Result<String> {
    if token.is_cancelled() {
        anyhow::bail!("operation cancelled");
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut params = AttachParams::default().stdin(true).stdout(true).stderr(false);
    if let Some(container) = container {
        params = params.container(container);
    }

    let command: Vec<String> = AGENT_STDIO_COMMAND.iter().map(|s| s.to_string()).collect();
    let mut process = pods
        .exec(pod_name, command, &params)
        .await
        .with_context(|| format!("failed to exec into agent pod {pod_name}"))?;

    let mut stdin = process
        .stdin()
        .context("exec stream did not provide stdin")?;
    let mut stdout = process
        .stdout()
        .context("exec stream did not provide stdout")?;

    let write = async {
        for message in messages {
            stdin.write_all(message.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        stdin.shutdown().await
    };

    let read = async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    };

    let (write_result, read_result) = tokio::join!(write, read);
    write_result.context("failed to write to agent pod stdin")?;
    let buf = read_result.context("failed to read agent pod stdout")?;

    if let Some(status) = process.take_status() {
        // Surface the terminal status for observability; a non-exec-channel
        // error here does not discard whatever output was already captured.
        if let Some(status) = status.await {
            tracing::debug!(pod = pod_name, ?status, "agent exec session ended");
        }
    }

    Ok(String::from_utf8_lossy(&buf).to_string())
}

#[cfg(test)]
mod tests {
    use super::AGENT_STDIO_COMMAND;

    #[test]
    fn stdio_command_is_well_formed() {
        assert_eq!(AGENT_STDIO_COMMAND, &["gpudiag", "--stdio"]);
    }
}
