//! Forward Worker (§4.4): the per-forward supervisor. Owns the lifecycle
//! state machine, the health probe, the watchdog, and the reconnection
//! backoff for exactly one declared forward.
//!
//! Grounded on `kube/proxy_recovery.rs`'s `ProxyRecoveryManager` for the
//! cancellation-token-driven recovery loop shape, and
//! `kftray-network-monitor`'s `HealthChecker`/`NetworkMonitorController`
//! pair for the probe/watchdog split — generalized from "periodically poll
//! every config and restart the unhealthy ones" to one dedicated probe +
//! watchdog pair per forward, as §4.4 requires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, RESET_AFTER_ACTIVE};
use crate::config::{DeclaredForward, ForwardId, HealthCheckConfig, HealthCheckMethod, Protocol, ReliabilityConfig};
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind};
use crate::forwarder::{run_tunnel, TunnelActivity, TunnelOptions};
use crate::pool::KubeClientPool;
use crate::resolver::ResourceResolver;

/// Backoff floor/ceiling per §4.4 ("a floor (initial ~1 s) and a ceiling
/// (e.g. 60 s)").
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Bounded wait when joining a cancelled task, per §5's "Cancellation"
/// (default 5 s; logs but does not fail if a task overstays).
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive probe failures before the tunnel is declared unhealthy,
/// per §4.4's probe task description.
const CONSECUTIVE_FAILURES_TO_FAIL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Active,
    Reconnecting,
    Disabled,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub last_error: Option<String>,
    pub restart_attempts: u32,
    pub tunnel_opened_at: Option<Instant>,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            state: WorkerState::Starting,
            last_error: None,
            restart_attempts: 0,
            tunnel_opened_at: None,
        }
    }
}

pub enum ControlCommand {
    Enable,
    Disable,
    Terminate,
}

/// What a signal from the probe/watchdog/tunnel tasks tells the
/// supervisor during an `Active` sojourn.
enum Signal {
    HealthDegraded,
    HealthFailed,
    Stale,
    Hung,
}

/// Handle the Manager keeps for one worker. The worker's internal state
/// is never shared mutably — this handle only carries the means to send
/// it commands, observe its status, and join its supervisor task.
pub struct WorkerHandle {
    pub id: ForwardId,
    control_tx: mpsc::Sender<ControlCommand>,
    status_rx: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        declared: DeclaredForward,
        pool: Arc<KubeClientPool>,
        resolver: Arc<ResourceResolver>,
        health_check: HealthCheckConfig,
        reliability: ReliabilityConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let id = declared.id.clone();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(WorkerStatus::new());

        let supervisor = Supervisor {
            declared,
            pool,
            resolver,
            health_check,
            reliability,
            events,
            control_rx,
            status_tx,
            cancel: cancel.clone(),
        };

        let join = tokio::spawn(supervisor.run());

        Self { id, control_tx, status_rx, cancel, join }
    }

    pub async fn enable(&self) {
        let _ = self.control_tx.send(ControlCommand::Enable).await;
    }

    pub async fn disable(&self) {
        let _ = self.control_tx.send(ControlCommand::Disable).await;
    }

    /// Requests termination and does not wait — callers that need to wait
    /// should use [`WorkerHandle::join`].
    pub async fn terminate(&self) {
        let _ = self.control_tx.send(ControlCommand::Terminate).await;
        self.cancel.cancel();
    }

    pub fn status(&self) -> WorkerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status_rx.clone()
    }

    /// Waits for the supervisor task to finish, up to `timeout`. Per §4.5's
    /// `stop()`: "after the timeout, leave zombie tasks but return."
    pub async fn join(self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.join).await.is_err() {
            warn!(id = %self.id, "worker supervisor task did not exit within timeout, abandoning");
        }
    }
}

struct Supervisor {
    declared: DeclaredForward,
    pool: Arc<KubeClientPool>,
    resolver: Arc<ResourceResolver>,
    health_check: HealthCheckConfig,
    reliability: ReliabilityConfig,
    events: Arc<EventBus>,
    control_rx: mpsc::Receiver<ControlCommand>,
    status_tx: watch::Sender<WorkerStatus>,
    cancel: CancellationToken,
}

enum SessionOutcome {
    Reconnect(String),
    Disable,
    Terminate,
}

impl Supervisor {
    async fn emit(&self, kind: EventKind) {
        self.events.publish(Event::new(self.declared.id.clone(), kind)).await;
    }

    async fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.set_error(Some(message.clone()));
        self.events
            .publish(Event::new(self.declared.id.clone(), EventKind::Error).with_field("message", message))
            .await;
    }

    fn set_state(&self, state: WorkerState) {
        self.status_tx.send_modify(|s| s.state = state);
    }

    fn set_error(&self, error: Option<String>) {
        self.status_tx.send_modify(|s| s.last_error = error);
    }

    async fn run(mut self) {
        if self.declared.protocol != Protocol::Tcp {
            self.emit_error("udp not supported").await;
            self.set_state(WorkerState::Terminated);
            self.emit(EventKind::ForwardRemoved).await;
            return;
        }

        let mut backoff = Backoff::new(BACKOFF_FLOOR, BACKOFF_CEILING);
        let mut state = WorkerState::Starting;

        loop {
            match state {
                WorkerState::Starting => {
                    self.set_state(WorkerState::Starting);
                    self.emit(EventKind::ForwardStarting).await;
                    self.resolver.invalidate(&self.declared.context, &self.declared.namespace);

                    match self.run_session(&mut backoff).await {
                        SessionOutcome::Reconnect(reason) => {
                            self.emit_error(reason).await;
                            state = WorkerState::Reconnecting;
                        }
                        SessionOutcome::Disable => state = WorkerState::Disabled,
                        SessionOutcome::Terminate => state = WorkerState::Terminated,
                    }
                }
                WorkerState::Reconnecting => {
                    self.set_state(WorkerState::Reconnecting);
                    self.status_tx.send_modify(|s| s.restart_attempts = backoff.attempt() + 1);
                    self.emit(EventKind::ForwardReconnecting).await;

                    // A plain cancellable sleep only reacts to `terminate`/
                    // `stop`. Racing the (pinned, so it keeps counting down
                    // across loop iterations) timer against `control_rx` as
                    // well keeps `disable` prompt too, per §9's "Backoff
                    // cancellation" note.
                    let delay = backoff.next_delay();
                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);

                    state = loop {
                        tokio::select! {
                            _ = &mut sleep => {
                                break match self.try_recv_control() {
                                    Some(ControlCommand::Disable) => WorkerState::Disabled,
                                    Some(ControlCommand::Terminate) => WorkerState::Terminated,
                                    _ => WorkerState::Starting,
                                };
                            }
                            cmd = self.control_rx.recv() => {
                                match cmd {
                                    Some(ControlCommand::Disable) => break WorkerState::Disabled,
                                    Some(ControlCommand::Terminate) | None => break WorkerState::Terminated,
                                    // Already enabled, nothing to do — keep
                                    // waiting out the remaining backoff.
                                    Some(ControlCommand::Enable) => continue,
                                }
                            }
                            _ = self.cancel.cancelled() => break self.drain_for_cancellation().await,
                        }
                    };
                }
                WorkerState::Disabled => {
                    self.set_state(WorkerState::Disabled);
                    self.emit(EventKind::ForwardDisabled).await;
                    state = self.wait_while_disabled().await;
                }
                WorkerState::Terminated => {
                    self.set_state(WorkerState::Terminated);
                    self.emit(EventKind::ForwardRemoved).await;
                    return;
                }
            }
        }
    }

    fn try_recv_control(&mut self) -> Option<ControlCommand> {
        self.control_rx.try_recv().ok()
    }

    async fn drain_for_cancellation(&mut self) -> WorkerState {
        match self.control_rx.try_recv() {
            Ok(ControlCommand::Disable) => WorkerState::Disabled,
            _ => WorkerState::Terminated,
        }
    }

    async fn wait_while_disabled(&mut self) -> WorkerState {
        loop {
            tokio::select! {
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Enable) => return WorkerState::Starting,
                        Some(ControlCommand::Terminate) | None => return WorkerState::Terminated,
                        Some(ControlCommand::Disable) => continue,
                    }
                }
                _ = self.cancel.cancelled() => return WorkerState::Terminated,
            }
        }
    }

    /// Resolves the target, opens the tunnel, and — once ready — runs the
    /// `Active` sojourn until something forces a reconnect, disable, or
    /// terminate. On success entry to `Active`, this is the single place
    /// the "Starting is preceded by Active" / "Active preceded by Starting"
    /// invariant (§8) is realised in code.
    async fn run_session(&mut self, backoff: &mut Backoff) -> SessionOutcome {
        let target = match self
            .resolver
            .resolve(
                &self.declared.context,
                &self.declared.namespace,
                &self.declared.resource,
                self.declared.selector.as_deref(),
            )
            .await
        {
            Ok(target) => target,
            Err(e) => return SessionOutcome::Reconnect(e.to_string()),
        };

        let session_cancel = self.cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let activity = Arc::new(TunnelActivity::default());

        let opts = TunnelOptions {
            tcp_keepalive: self.reliability.tcp_keepalive,
            dial_timeout: self.reliability.dial_timeout,
        };

        let tunnel_handle: JoinHandle<Result<()>> = tokio::spawn(run_tunnel(
            self.pool.clone(),
            self.declared.context.clone(),
            self.declared.namespace.clone(),
            target,
            self.declared.local_port,
            self.declared.remote_port,
            opts,
            session_cancel.clone(),
            ready_tx,
            Arc::clone(&activity),
        ));

        let outcome = self.drive_session(tunnel_handle, ready_rx, activity, backoff, &session_cancel).await;

        session_cancel.cancel();
        outcome
    }

    async fn drive_session(
        &mut self,
        mut tunnel_handle: JoinHandle<Result<()>>,
        ready_rx: oneshot::Receiver<()>,
        activity: Arc<TunnelActivity>,
        backoff: &mut Backoff,
        session_cancel: &CancellationToken,
    ) -> SessionOutcome {
        let mut ready_rx = ready_rx;

        // Wait for the tunnel to signal ready, exit early, or for the
        // worker to be told to disable/terminate while still Starting.
        let became_active = loop {
            tokio::select! {
                res = &mut ready_rx => {
                    break res.is_ok();
                }
                res = &mut tunnel_handle => {
                    return SessionOutcome::Reconnect(describe_tunnel_exit(res));
                }
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Disable) => { session_cancel.cancel(); return SessionOutcome::Disable; }
                        Some(ControlCommand::Terminate) | None => { session_cancel.cancel(); return SessionOutcome::Terminate; }
                        Some(ControlCommand::Enable) => continue,
                    }
                }
                _ = self.cancel.cancelled() => {
                    session_cancel.cancel();
                    return SessionOutcome::Terminate;
                }
            }
        };

        if !became_active {
            return SessionOutcome::Reconnect("tunnel exited before signalling ready".to_string());
        }

        self.set_state(WorkerState::Active);
        self.set_error(None);
        self.status_tx.send_modify(|s| {
            s.tunnel_opened_at = Some(Instant::now());
            s.restart_attempts = 0;
        });
        self.emit(EventKind::ForwardActive).await;

        let active_since = Instant::now();
        // Seed activity at the tunnel-open time so a young, quiet tunnel
        // isn't mistaken for one that's been idle since the epoch.
        activity.touch(0);

        let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(8);
        let heartbeat = Arc::new(AtomicU64::new(now_millis()));

        let probe_task = tokio::spawn(run_probe(
            self.declared.local_port,
            self.health_check.clone(),
            session_cancel.clone(),
            signal_tx.clone(),
            Arc::clone(&heartbeat),
        ));
        let watchdog_task = tokio::spawn(run_watchdog(
            self.reliability.watchdog_period,
            self.health_check.max_connection_age,
            self.health_check.max_idle_time,
            self.reliability.retry_on_stale,
            session_cancel.clone(),
            signal_tx,
            Arc::clone(&heartbeat),
            Arc::clone(&activity),
            active_since,
        ));

        let outcome = loop {
            tokio::select! {
                res = &mut tunnel_handle => {
                    break SessionOutcome::Reconnect(describe_tunnel_exit(res));
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Some(Signal::HealthDegraded) => { self.emit(EventKind::HealthDegraded).await; }
                        Some(Signal::HealthFailed) => {
                            self.emit(EventKind::HealthFailed).await;
                            break SessionOutcome::Reconnect("health check failed".to_string());
                        }
                        Some(Signal::Stale) => {
                            self.emit(EventKind::Stale).await;
                            break SessionOutcome::Reconnect("tunnel recycled: stale".to_string());
                        }
                        Some(Signal::Hung) => {
                            self.emit(EventKind::WorkerHung).await;
                            break SessionOutcome::Reconnect("worker hung: probe heartbeat stale".to_string());
                        }
                        None => break SessionOutcome::Reconnect("signal channel closed unexpectedly".to_string()),
                    }
                }
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Disable) => break SessionOutcome::Disable,
                        Some(ControlCommand::Terminate) | None => break SessionOutcome::Terminate,
                        Some(ControlCommand::Enable) => {}
                    }
                }
                _ = self.cancel.cancelled() => break SessionOutcome::Terminate,
            }
        };

        session_cancel.cancel();
        join_bounded(probe_task).await;
        join_bounded(watchdog_task).await;
        if !tunnel_handle.is_finished() {
            join_bounded(tunnel_handle).await;
        }

        if matches!(outcome, SessionOutcome::Reconnect(_)) && active_since.elapsed() >= RESET_AFTER_ACTIVE {
            backoff.reset();
        }

        outcome
    }
}

fn describe_tunnel_exit(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> String {
    match res {
        Ok(Ok(())) => "tunnel closed".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_cancelled() => "tunnel task cancelled".to_string(),
        Err(e) => format!("tunnel task panicked: {e}"),
    }
}

async fn join_bounded(handle: JoinHandle<()>) {
    if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
        warn!("auxiliary task did not exit within the join timeout");
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Probe task (§4.4): dials the local listener every `interval`, declaring
/// the tunnel unhealthy after two consecutive failures.
async fn run_probe(
    local_port: u16,
    config: HealthCheckConfig,
    cancel: CancellationToken,
    signal_tx: mpsc::Sender<Signal>,
    heartbeat: Arc<AtomicU64>,
) {
    let mut consecutive_failures = 0u32;
    let addr = format!("127.0.0.1:{local_port}");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = cancel.cancelled() => return,
        }

        let healthy = probe_once(&addr, config.method, config.timeout).await;
        heartbeat.store(now_millis(), Ordering::Relaxed);

        if healthy {
            consecutive_failures = 0;
            continue;
        }

        consecutive_failures += 1;
        debug!(local_port, consecutive_failures, "health probe failed");

        if consecutive_failures >= CONSECUTIVE_FAILURES_TO_FAIL {
            let _ = signal_tx.send(Signal::HealthFailed).await;
            return;
        }

        let _ = signal_tx.send(Signal::HealthDegraded).await;
    }
}

async fn probe_once(addr: &str, method: HealthCheckMethod, timeout: Duration) -> bool {
    let connect = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await;
    let Ok(Ok(mut stream)) = connect else {
        return false;
    };

    match method {
        HealthCheckMethod::TcpDial => true,
        HealthCheckMethod::DataTransfer => {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            // Exercises the full tunnel rather than just the local listener:
            // each accepted connection gets a fresh portforward, so a dead
            // tunnel surfaces as an immediate write error or EOF on read,
            // while a live one either echoes something or just times out.
            if tokio::time::timeout(timeout, stream.write_all(&[0u8])).await.is_err() {
                return false;
            }
            let mut buf = [0u8; 1];
            match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                Ok(Ok(0)) => false,
                Ok(Ok(_)) => true,
                Ok(Err(_)) => false,
                Err(_) => true,
            }
        }
    }
}

/// Watchdog task (§4.4): verifies the probe's heartbeat, and declares
/// staleness on connection age or idle time.
#[allow(clippy::too_many_arguments)]
async fn run_watchdog(
    period: Duration,
    max_connection_age: Duration,
    max_idle_time: Duration,
    retry_on_stale: bool,
    cancel: CancellationToken,
    signal_tx: mpsc::Sender<Signal>,
    heartbeat: Arc<AtomicU64>,
    activity: Arc<TunnelActivity>,
    active_since: Instant,
) {
    let mut last_seen_bytes = activity.bytes_total();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => return,
        }

        let now = now_millis();
        let heartbeat_age_millis = now.saturating_sub(heartbeat.load(Ordering::Relaxed));
        if heartbeat_age_millis > (period * 2).as_millis() as u64 {
            warn!("probe heartbeat stale, declaring worker hung");
            let _ = signal_tx.send(Signal::Hung).await;
            return;
        }

        if !retry_on_stale {
            continue;
        }

        if active_since.elapsed() >= max_connection_age {
            info!("tunnel exceeded max connection age, recycling");
            let _ = signal_tx.send(Signal::Stale).await;
            return;
        }

        let bytes_now = activity.bytes_total();
        let idle_this_period = bytes_now == last_seen_bytes;
        last_seen_bytes = bytes_now;

        let last_activity_age_millis = now.saturating_sub(activity.last_activity_millis());
        let idle_over_threshold = last_activity_age_millis > max_idle_time.as_millis() as u64
            && active_since.elapsed() >= max_idle_time;

        if idle_this_period && idle_over_threshold {
            info!("tunnel idle past max idle time, recycling");
            let _ = signal_tx.send(Signal::Stale).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_once_tcp_dial_succeeds_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });
        let healthy = probe_once(&format!("127.0.0.1:{port}"), HealthCheckMethod::TcpDial, Duration::from_secs(1)).await;
        assert!(healthy);
    }

    #[tokio::test]
    async fn probe_once_fails_when_nothing_listens() {
        let healthy = probe_once("127.0.0.1:1", HealthCheckMethod::TcpDial, Duration::from_millis(200)).await;
        assert!(!healthy);
    }

    #[tokio::test]
    async fn probe_once_data_transfer_times_out_healthy_on_silent_peer() {
        // A live but quiet peer (accepts, never echoes) must still count as
        // healthy: the probe should time out waiting for a reply, not fail.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(stream);
            }
        });
        let healthy =
            probe_once(&format!("127.0.0.1:{port}"), HealthCheckMethod::DataTransfer, Duration::from_millis(100)).await;
        assert!(healthy);
    }

    #[tokio::test]
    async fn probe_once_data_transfer_fails_when_peer_closes_immediately() {
        // A dead tunnel: the local listener accepts (TCP connect succeeds)
        // but the remote side is gone, so the probe's write/read sees the
        // connection close right away.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let healthy =
            probe_once(&format!("127.0.0.1:{port}"), HealthCheckMethod::DataTransfer, Duration::from_millis(200)).await;
        assert!(!healthy);
    }

    #[tokio::test]
    async fn watchdog_declares_hung_when_heartbeat_stale() {
        let (tx, mut rx) = mpsc::channel(1);
        let heartbeat = Arc::new(AtomicU64::new(0));
        let activity = Arc::new(TunnelActivity::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_watchdog(
            Duration::from_millis(20),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            true,
            cancel.clone(),
            tx,
            heartbeat,
            activity,
            Instant::now(),
        ));

        let signal = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(signal, Some(Signal::Hung)));
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn watchdog_declares_stale_past_max_connection_age() {
        let (tx, mut rx) = mpsc::channel(1);
        let heartbeat = Arc::new(AtomicU64::new(now_millis()));
        let activity = Arc::new(TunnelActivity::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_watchdog(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_secs(3600),
            true,
            cancel.clone(),
            tx,
            heartbeat,
            activity,
            Instant::now() - Duration::from_secs(1),
        ));

        let signal = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(signal, Some(Signal::Stale)));
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn watchdog_does_not_recycle_a_young_quiet_tunnel() {
        // A tunnel seeded with activity at open time, with no traffic since,
        // must survive several watchdog periods below max_idle_time.
        let (tx, mut rx) = mpsc::channel(1);
        let heartbeat = Arc::new(AtomicU64::new(now_millis()));
        let activity = Arc::new(TunnelActivity::default());
        activity.touch(0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_watchdog(
            Duration::from_millis(20),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            true,
            cancel.clone(),
            tx,
            heartbeat,
            activity,
            Instant::now(),
        ));

        let signal = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(signal.is_err(), "a quiet young tunnel should not be recycled yet");
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn watchdog_recycles_tunnel_idle_past_max_idle_time() {
        let (tx, mut rx) = mpsc::channel(1);
        let heartbeat = Arc::new(AtomicU64::new(now_millis()));
        let activity = Arc::new(TunnelActivity::default());
        activity.touch(0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_watchdog(
            Duration::from_millis(20),
            Duration::from_secs(3600),
            Duration::from_millis(10),
            true,
            cancel.clone(),
            tx,
            heartbeat,
            activity,
            Instant::now() - Duration::from_secs(1),
        ));

        let signal = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(signal, Some(Signal::Stale)));
        cancel.cancel();
        let _ = handle.await;
    }
}
