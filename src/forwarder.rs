//! Port Forwarder Primitive (§4.3): opens one SPDY tunnel to one pod and
//! copies bytes between a local `127.0.0.1` listener and the remote pod
//! port until torn down. One-shot — it does not own reconnection.
//!
//! Grounded on `kube/listener.rs`'s `PortForwarder` (the accept loop that
//! creates a fresh `kube::api::Portforwarder` per incoming TCP connection
//! via `Api<Pod>::portforward`) and `kube/tcp_forwarder.rs`'s bidirectional
//! byte-copy loop, trimmed to what §4.3 asks for: this crate's Worker owns
//! reconnection, so the teacher's pre-warmed "next portforwarder" swap
//! (an optimization to avoid a connection-setup stall on the *next*
//! incoming TCP connection) is dropped — noted in DESIGN.md.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::KubeClientPool;

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared with the Worker's watchdog so it can read last-activity and
/// total-bytes-seen without locking.
#[derive(Default)]
pub struct TunnelActivity {
    pub last_activity_millis: AtomicU64,
    pub bytes_total: AtomicU64,
}

impl TunnelActivity {
    pub fn touch(&self, bytes: u64) {
        self.last_activity_millis.store(now_millis(), Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity_millis.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelOptions {
    pub tcp_keepalive: Duration,
    pub dial_timeout: Duration,
}

/// Resolves a `"service/<name>"` or `"pod/<name>"` string (as produced by
/// [`crate::resolver::ResourceResolver::resolve`]) to a concrete, currently
/// running pod name, per §4.3 steps 2-3.
async fn dereference_to_running_pod(pod_api: &Api<Pod>, svc_api: &Api<Service>, target: &str) -> Result<String> {
    let (kind, name) = target.split_once('/').unwrap_or((target, ""));

    match kind {
        "service" => {
            let service = svc_api.get(name).await?;
            let selector = service
                .spec
                .and_then(|spec| spec.selector)
                .ok_or_else(|| Error::ServiceHasNoSelector(name.to_string()))?;

            if selector.is_empty() {
                return Err(Error::ServiceHasNoSelector(name.to_string()));
            }

            let label_selector = format_label_selector(&selector);
            let pods = pod_api
                .list(&kube::api::ListParams::default().labels(&label_selector))
                .await?;

            pods.items
                .into_iter()
                .find(pod_is_running)
                .and_then(|p| p.metadata.name)
                .ok_or_else(|| Error::NoRunningPodsForService(name.to_string()))
        }
        "pod" => {
            let pod = pod_api.get(name).await?;
            if !pod_is_running(&pod) {
                return Err(Error::PodNotRunning(name.to_string()));
            }
            Ok(name.to_string())
        }
        other => Err(Error::UnsupportedResource(other.to_string())),
    }
}

fn format_label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Opens one SPDY portforward connection scoped to a single accepted TCP
/// connection, and copies bytes in both directions until either end
/// closes or `stop` fires. Returns once the connection is done; errors
/// here do not end the overall tunnel, only that one connection.
async fn serve_connection(
    pod_api: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    mut client_conn: tokio::net::TcpStream,
    activity: Arc<TunnelActivity>,
) {
    let mut portforwarder = match pod_api.portforward(&pod_name, &[remote_port]).await {
        Ok(pf) => pf,
        Err(e) => {
            warn!(pod = %pod_name, error = %e, "failed to open portforward stream for connection");
            return;
        }
    };

    let Some(mut upstream) = portforwarder.take_stream(remote_port) else {
        warn!(pod = %pod_name, remote_port, "portforwarder produced no stream for port");
        return;
    };

    client_conn.set_nodelay(true).ok();

    match copy_bidirectional(&mut client_conn, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            activity.touch(to_upstream + to_client);
            debug!(pod = %pod_name, to_upstream, to_client, "connection closed normally");
        }
        Err(e) => {
            debug!(pod = %pod_name, error = %e, "connection closed with error");
        }
    }

    let _ = upstream.shutdown().await;
}

/// Runs one forward's tunnel: resolves `target` to a running pod, binds
/// the local listener, signals `ready` once both succeed, then accepts
/// connections until `stop` is cancelled. This is the function the
/// Forward Worker's tunnel task calls and blocks on (§4.4's "spawn a
/// tunnel task that calls the Forwarder Primitive and blocks").
#[allow(clippy::too_many_arguments)]
pub async fn run_tunnel(
    pool: Arc<KubeClientPool>,
    context: String,
    namespace: String,
    target: String,
    local_port: u16,
    remote_port: u16,
    opts: TunnelOptions,
    stop: CancellationToken,
    ready: oneshot::Sender<()>,
    activity: Arc<TunnelActivity>,
) -> Result<()> {
    let client = pool.get_client(&context).await?;
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let svc_api: Api<Service> = Api::namespaced(client, &namespace);

    let pod_name = dereference_to_running_pod(&pod_api, &svc_api, &target).await?;

    let listener = tokio::time::timeout(
        opts.dial_timeout,
        bind_listener(local_port, opts.tcp_keepalive),
    )
    .await
    .map_err(|_| Error::Tunnel(format!("timed out binding local listener on {local_port}")))??;

    // Validate pod reachability before declaring ready, so `Starting ->
    // Active` only happens once the tunnel can actually serve a connection.
    // The upgrade itself (API server -> kubelet -> pod) is enough of a
    // check; the stream is dropped immediately rather than served.
    pod_api
        .portforward(&pod_name, &[remote_port])
        .await
        .map_err(|e| Error::Tunnel(format!("initial portforward to {pod_name} failed: {e}")))?;

    let _ = ready.send(());
    info!(pod = %pod_name, local_port, remote_port, "tunnel ready, accepting connections");

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(local_port, "tunnel stop requested, tearing down listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (client_conn, peer) = accepted.map_err(|e| Error::Tunnel(format!("accept failed: {e}")))?;
                debug!(%peer, local_port, "accepted local connection");
                tokio::spawn(serve_connection(
                    pod_api.clone(),
                    pod_name.clone(),
                    remote_port,
                    client_conn,
                    Arc::clone(&activity),
                ));
            }
        }
    }
}

/// Binds the local listener with the TCP keepalive tunable from §6's
/// defaults table applied. `std::net`/`tokio` expose no way to set a
/// keepalive interval directly, so the socket is built with `socket2` and
/// handed to tokio once listening — the same crate the teacher's workspace
/// already depends on for this exact knob.
async fn bind_listener(local_port: u16, tcp_keepalive: Duration) -> Result<TcpListener> {
    let addr = format!("127.0.0.1:{local_port}");
    let sock_addr: std::net::SocketAddr = addr
        .parse()
        .expect("127.0.0.1:<u16> always parses as a socket address");

    let bind = || -> std::io::Result<std::net::TcpListener> {
        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&sock_addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let keepalive = socket2::TcpKeepalive::new().with_time(tcp_keepalive);
        socket.set_tcp_keepalive(&keepalive)?;
        Ok(socket.into())
    };

    let std_listener = bind().map_err(|source| Error::ListenerBind { addr: addr.clone(), source })?;
    TcpListener::from_std(std_listener).map_err(|source| Error::ListenerBind { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_label_selector_joins_sorted_pairs() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "backend".to_string());
        selector.insert("tier".to_string(), "web".to_string());
        assert_eq!(format_label_selector(&selector), "app=backend,tier=web");
    }

    #[tokio::test]
    async fn bind_listener_reports_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = bind_listener(port, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, Error::ListenerBind { .. }));
    }

    #[tokio::test]
    async fn tunnel_activity_tracks_touches() {
        let activity = TunnelActivity::default();
        assert_eq!(activity.bytes_total(), 0);
        activity.touch(128);
        assert_eq!(activity.bytes_total(), 128);
        assert!(activity.last_activity_millis() > 0);
    }
}
