//! Forward Manager (§4.5): owns the worker set, applies diffs on
//! configuration reload, and aggregates status for observers.
//!
//! Grounded on `kftray-network-monitor`'s `NetworkMonitorController`
//! (a `tokio::sync::Mutex`-guarded running/not-running flag wrapping a
//! single background task) generalized from one task to a whole worker
//! map, plus the Manager-level reload mutex and remove-before-add ordering
//! §4.5 specifies by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{DeclaredForward, ForwardId, HealthCheckConfig, ReliabilityConfig, RootConfig};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::pool::KubeClientPool;
use crate::resolver::ResourceResolver;
use crate::worker::{WorkerHandle, WorkerStatus};

/// Per-forward cache TTL (§3's "Resolved Target ... with a resolution
/// timestamp and TTL (default 30s)").
const RESOLVER_CACHE_TTL: Duration = Duration::from_secs(30);

/// Bounded join wait for `stop()`'s broadcast-terminate-then-join, per
/// §4.5: "join them with a bounded timeout; after the timeout, leave
/// zombie tasks but return."
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ForwardManager {
    pool: Arc<KubeClientPool>,
    resolver: Arc<ResourceResolver>,
    events: Arc<EventBus>,
    health_check: Mutex<HealthCheckConfig>,
    reliability: Mutex<ReliabilityConfig>,
    /// Each entry keeps the `DeclaredForward` it was spawned with
    /// alongside the handle, so `reload` can tell "identical" (no-op,
    /// leave running) from "same identifier, fields changed" (update:
    /// remove+add) without re-deriving it from the handle.
    workers: Mutex<HashMap<ForwardId, (DeclaredForward, WorkerHandle)>>,
    /// Serialises `reload` per §5: "a reload in progress blocks a
    /// subsequent reload." `enable`/`disable` deliberately do not take
    /// this lock — they are non-blocking per §4.5.
    reload_lock: Mutex<()>,
}

impl ForwardManager {
    pub fn new(pool: Arc<KubeClientPool>, events: Arc<EventBus>) -> Self {
        let resolver = Arc::new(ResourceResolver::new(Arc::clone(&pool), RESOLVER_CACHE_TTL));
        Self {
            pool,
            resolver,
            events,
            health_check: Mutex::new(HealthCheckConfig::default()),
            reliability: Mutex::new(ReliabilityConfig::default()),
            workers: Mutex::new(HashMap::new()),
            reload_lock: Mutex::new(()),
        }
    }

    /// Computes the initial worker set and launches one supervisor per
    /// declared forward. Fails atomically only when the whole document is
    /// invalid; individual worker failures are reported through the Event
    /// Bus, never by failing `start` (§4.5).
    pub async fn start(&self, root: &RootConfig) -> Result<()> {
        let forwards = crate::config::flatten(root).map_err(|problems| Error::config(problems.join("; ")))?;

        *self.health_check.lock().await = root.health_check.clone();
        *self.reliability.lock().await = root.reliability.clone();

        if root.health_check.method == crate::config::HealthCheckMethod::TcpDial {
            warn!(
                "healthCheck.method=tcp-dial only verifies the local listener, not the tunnel; \
                 this weakens stale detection"
            );
        }

        let _guard = self.reload_lock.lock().await;
        let mut workers = self.workers.lock().await;
        for declared in forwards {
            self.spawn_worker(&mut workers, declared).await;
        }
        Ok(())
    }

    async fn spawn_worker(
        &self,
        workers: &mut HashMap<ForwardId, (DeclaredForward, WorkerHandle)>,
        declared: DeclaredForward,
    ) {
        let id = declared.id.clone();
        let handle = WorkerHandle::spawn(
            declared.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.resolver),
            self.health_check.lock().await.clone(),
            self.reliability.lock().await.clone(),
            Arc::clone(&self.events),
        );
        if let Some((_, previous)) = workers.insert(id.clone(), (declared, handle)) {
            previous.terminate().await;
            info!(id = %id, "replaced existing worker during spawn");
        }
    }

    /// Diffs `new_root` against the current worker set and applies
    /// **remove**, then **update** (as remove+add), then **add** — the
    /// ordering §4.5 calls out as "the invariant that prevents local-port
    /// collisions during reload." Rejects the whole reload (leaving the
    /// old configuration active) if `new_root` fails validation.
    pub async fn reload(&self, new_root: &RootConfig) -> Result<()> {
        let forwards = crate::config::flatten(new_root).map_err(|problems| Error::config(problems.join("; ")))?;

        let _guard = self.reload_lock.lock().await;
        *self.health_check.lock().await = new_root.health_check.clone();
        *self.reliability.lock().await = new_root.reliability.clone();

        let mut desired: HashMap<ForwardId, DeclaredForward> =
            forwards.into_iter().map(|f| (f.id.clone(), f)).collect();

        let mut workers = self.workers.lock().await;

        let current_ids: Vec<ForwardId> = workers.keys().cloned().collect();
        let mut to_remove = Vec::new();
        let mut to_update = Vec::new();

        for id in &current_ids {
            match desired.get(id) {
                None => to_remove.push(id.clone()),
                Some(new_fwd) => {
                    let (current_fwd, _) = &workers[id];
                    if current_fwd != new_fwd {
                        to_update.push(id.clone());
                    }
                    // else: identical — leave the running worker untouched
                    // and drop it from `desired` so the add pass skips it.
                }
            }
        }

        // remove: both forwards gone from the new config, and forwards
        // whose fields changed (removed here, re-added below).
        for id in to_remove.iter().chain(to_update.iter()) {
            if let Some((_, handle)) = workers.remove(id) {
                handle.terminate().await;
            }
        }

        // update (as remove+add): re-add with the new fields now that the
        // old worker's local-port listener is guaranteed closed.
        for id in &to_update {
            if let Some(declared) = desired.remove(id) {
                self.spawn_worker(&mut workers, declared).await;
            }
        }

        // add: anything left in `desired` that wasn't already running
        // (identical forwards were removed from `desired` above).
        for id in &current_ids {
            desired.remove(id);
        }
        for (_, declared) in desired {
            self.spawn_worker(&mut workers, declared).await;
        }

        Ok(())
    }

    pub async fn enable(&self, id: &ForwardId) -> Result<()> {
        let workers = self.workers.lock().await;
        match workers.get(id) {
            Some((_, handle)) => {
                handle.enable().await;
                Ok(())
            }
            None => Err(Error::config(format!("no such forward {id}"))),
        }
    }

    pub async fn disable(&self, id: &ForwardId) -> Result<()> {
        let workers = self.workers.lock().await;
        match workers.get(id) {
            Some((_, handle)) => {
                handle.disable().await;
                Ok(())
            }
            None => Err(Error::config(format!("no such forward {id}"))),
        }
    }

    /// Broadcasts terminate to every worker and joins them with a bounded
    /// timeout each; the process is expected to exit shortly after.
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        let handles: Vec<WorkerHandle> = workers.drain().map(|(_, (_, h))| h).collect();
        drop(workers);

        for handle in &handles {
            handle.terminate().await;
        }
        for handle in handles {
            handle.join(STOP_JOIN_TIMEOUT).await;
        }
        self.events.close();
    }

    pub async fn status(&self) -> HashMap<ForwardId, WorkerStatus> {
        let workers = self.workers.lock().await;
        workers.iter().map(|(id, (_, handle))| (id.clone(), handle.status())).collect()
    }

    pub async fn worker_ids(&self) -> Vec<ForwardId> {
        self.workers.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::{parse, ContextConfig, NamespaceConfig};
    use crate::events::EventKind;

    // No real cluster is reachable from these tests: every declared context
    // is absent from the kubeconfig, so each worker's tunnel task fails
    // fast with `ContextNotFound` before ever touching the network. That's
    // enough to exercise the Manager's diffing and control-plane behaviour
    // without a fake forwarder.
    fn root_with(forwards: &[(&str, &str, u16, u16)]) -> RootConfig {
        let contexts: Vec<ContextConfig> = forwards
            .iter()
            .map(|(ctx, resource, port, local_port)| {
                ContextConfig {
                    name: ctx.to_string(),
                    namespaces: vec![NamespaceConfig {
                        name: "default".to_string(),
                        forwards: vec![serde_yaml::from_str(&format!(
                            "resource: {resource}\nprotocol: tcp\nport: {port}\nlocalPort: {local_port}\n"
                        ))
                        .unwrap()],
                    }],
                }
            })
            .collect();

        RootConfig {
            contexts,
            ..parse("contexts: []").unwrap()
        }
    }

    fn ids(raw: &[&str]) -> HashSet<ForwardId> {
        raw.iter().map(|s| ForwardId::new(*s)).collect()
    }

    fn new_manager() -> ForwardManager {
        let pool = Arc::new(KubeClientPool::new(kube::config::Kubeconfig::default()));
        let events = Arc::new(EventBus::new());
        ForwardManager::new(pool, events)
    }

    #[tokio::test]
    async fn start_creates_one_worker_per_declared_forward() {
        let manager = new_manager();
        let root = root_with(&[("missing", "service/a", 80, 18080), ("missing", "service/b", 80, 18081)]);
        manager.start(&root).await.unwrap();

        let got: HashSet<ForwardId> = manager.worker_ids().await.into_iter().collect();
        assert_eq!(got, ids(&["missing/default/service/a:18080", "missing/default/service/b:18081"]));
    }

    #[tokio::test]
    async fn reload_atomicity_worker_ids_match_new_config() {
        let manager = new_manager();
        let initial = root_with(&[("missing", "service/a", 80, 18080), ("missing", "service/b", 80, 18081)]);
        manager.start(&initial).await.unwrap();

        let updated = root_with(&[("missing", "service/a", 80, 18080), ("missing", "service/c", 80, 18082)]);
        manager.reload(&updated).await.unwrap();

        let got: HashSet<ForwardId> = manager.worker_ids().await.into_iter().collect();
        assert_eq!(got, ids(&["missing/default/service/a:18080", "missing/default/service/c:18082"]));
    }

    #[tokio::test]
    async fn repeated_identical_reload_is_a_no_op_for_the_worker_set() {
        let manager = new_manager();
        let root = root_with(&[("missing", "service/a", 80, 18080)]);
        manager.start(&root).await.unwrap();
        let before: HashSet<ForwardId> = manager.worker_ids().await.into_iter().collect();

        manager.reload(&root).await.unwrap();
        manager.reload(&root).await.unwrap();
        let after: HashSet<ForwardId> = manager.worker_ids().await.into_iter().collect();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn invalid_reload_is_rejected_and_old_config_stays_active() {
        let manager = new_manager();
        let root = root_with(&[("missing", "service/a", 80, 18080), ("missing", "service/b", 80, 18081)]);
        manager.start(&root).await.unwrap();

        // Two forwards sharing the same local port: invalid.
        let bad = root_with(&[("missing", "service/c", 80, 19000), ("missing", "service/d", 80, 19000)]);
        assert!(manager.reload(&bad).await.is_err());

        let got: HashSet<ForwardId> = manager.worker_ids().await.into_iter().collect();
        assert_eq!(got, ids(&["missing/default/service/a:18080", "missing/default/service/b:18081"]));
    }

    #[tokio::test]
    async fn disable_then_enable_returns_worker_towards_starting() {
        let manager = new_manager();
        let root = root_with(&[("missing", "service/a", 80, 18080)]);
        manager.start(&root).await.unwrap();
        let id = ForwardId::new("missing/default/service/a:18080");

        let mut events = manager.events.subscribe_by_kind(vec![EventKind::ForwardDisabled]).await;
        manager.disable(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("forward-disabled event within timeout")
            .unwrap();

        let status = manager.status().await;
        assert_eq!(status[&id].state, crate::worker::WorkerState::Disabled);

        let mut starting = manager.events.subscribe_by_kind(vec![EventKind::ForwardStarting]).await;
        manager.enable(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), starting.recv())
            .await
            .expect("forward-starting event within timeout")
            .unwrap();
    }

    #[tokio::test]
    async fn enable_on_unknown_id_is_an_error() {
        let manager = new_manager();
        let err = manager.enable(&ForwardId::new("nope:1")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
