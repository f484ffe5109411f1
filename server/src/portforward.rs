//! Client-side TCP tunnel to a pod inside the target cluster, built on the
//! apiserver's `pods/portforward` subresource.
use std::net::SocketAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline for establishing the first tunnel.
const START_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from setting up a port forward.
#[derive(Debug, thiserror::Error)]
pub enum PortForwardError {
    /// Request against the apiserver failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),
    /// The target pod is not running.
    #[error("unable to forward port because pod {pod} is not running (status={phase})")]
    NotRunning {
        /// The target pod.
        pod: String,
        /// Its current phase.
        phase: String,
    },
    /// The tunnel did not come up within the deadline.
    #[error("timeout starting port forward to {0}")]
    StartTimeout(String),
    /// The local listener could not be created.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Forwards a random local port to one TCP port of a pod.
pub struct PodPortForwarder {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl PodPortForwarder {
    /// Verify the pod is running, open the tunnel, and start accepting
    /// local connections. Every accepted connection gets its own forwarded
    /// stream.
    pub async fn start(
        client: Client,
        namespace: &str,
        pod_name: &str,
        target_port: u16,
    ) -> Result<Self, PortForwardError> {
        let pods: Api<Pod> = Api::namespaced(client, namespace);

        let pod = pods.get(pod_name).await?;
        let phase = pod
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Unknown".to_owned());
        if phase != "Running" {
            return Err(PortForwardError::NotRunning {
                pod: pod_name.to_owned(),
                phase,
            });
        }

        // Establish one tunnel up front so a broken subresource fails the
        // start instead of the first local connection.
        let probe = tokio::time::timeout(START_TIMEOUT, pods.portforward(pod_name, &[target_port]))
            .await
            .map_err(|_| PortForwardError::StartTimeout(pod_name.to_owned()))??;
        drop(probe);

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, pod = pod_name, target_port, "port forward ready");

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let pod_name = pod_name.to_owned();
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    conn = listener.accept() => conn,
                };
                let (mut conn, peer) = match conn {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%err, "failed to accept port forward connection");
                        continue;
                    }
                };

                let pods = pods.clone();
                let pod_name = pod_name.clone();
                let cancel = accept_cancel.clone();
                tokio::spawn(async move {
                    let mut forwarder = match pods.portforward(&pod_name, &[target_port]).await {
                        Ok(forwarder) => forwarder,
                        Err(err) => {
                            warn!(%err, pod = pod_name, "failed to open port forward stream");
                            return;
                        }
                    };
                    let Some(mut upstream) = forwarder.take_stream(target_port) else {
                        warn!(pod = pod_name, target_port, "no stream for forwarded port");
                        return;
                    };

                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        res = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
                            if let Err(err) = res {
                                debug!(%err, %peer, "port forward stream closed");
                            }
                        }
                    }
                });
            }
        });

        Ok(Self { local_addr, cancel })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tear down the accept loop and all forwarded streams.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PodPortForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
