//! Resource Resolver — turns a symbolic target into a concrete pod name.
//!
//! Grounded on `kube/pod_finder.rs`'s `TargetPodFinder` (service → selector
//! → pod lookup, falling back to an `app=<name>` label match) and
//! `kube/target_cache.rs`'s cache-around-a-slow-lookup shape, combined per
//! §4.2 of the spec: the cache sits in front of pod-by-prefix and
//! pod-by-selector lookups; `service/<name>` resolution is a pass-through
//! with no caching, since the Forwarder Primitive dereferences the service
//! to a pod at connect time on its own.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};

use crate::error::{Error, Result};
use crate::pool::KubeClientPool;

use super::cache::{cache_key, ResolverCache};

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

fn creation_timestamp(pod: &Pod) -> i64 {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .unwrap_or(0)
}

pub struct ResourceResolver {
    pool: Arc<KubeClientPool>,
    cache: ResolverCache,
}

impl ResourceResolver {
    pub fn new(pool: Arc<KubeClientPool>, cache_ttl: std::time::Duration) -> Self {
        Self {
            pool,
            cache: ResolverCache::new(cache_ttl),
        }
    }

    /// Resolves `resource` (e.g. `"pod/my-app-"`, `"pod"`, `"service/backend"`)
    /// against `context`/`namespace`, returning a `"pod/<name>"` or
    /// `"service/<name>"` string per §4.2's contract.
    pub async fn resolve(
        &self,
        context: &str,
        namespace: &str,
        resource: &str,
        selector: Option<&str>,
    ) -> Result<String> {
        let (kind, name) = resource.split_once('/').unwrap_or((resource, ""));

        match kind {
            "service" => {
                if name.is_empty() {
                    return Err(Error::config(format!("empty service name in {resource:?}")));
                }
                Ok(format!("service/{name}"))
            }
            "pod" if !name.is_empty() => {
                self.resolve_by_prefix(context, namespace, name).await
            }
            "pod" => {
                let selector = selector
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| Error::config(format!("pod resource {resource:?} has no name or selector")))?;
                self.resolve_by_selector(context, namespace, selector).await
            }
            other => Err(Error::UnsupportedResource(other.to_string())),
        }
    }

    async fn resolve_by_prefix(&self, context: &str, namespace: &str, prefix: &str) -> Result<String> {
        let key = cache_key(context, namespace, &format!("pod/{prefix}"), None);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(format!("pod/{}", cached.pod_name));
        }

        let client = self.pool.get_client(context).await?;
        let api: Api<Pod> = Api::namespaced(client, namespace);
        let pods = api.list(&ListParams::default()).await?;

        let newest = pods
            .items
            .into_iter()
            .filter(|p| {
                p.metadata
                    .name
                    .as_deref()
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
                    && pod_is_running(p)
            })
            .max_by_key(creation_timestamp)
            .ok_or(Error::NoRunningPodsForPrefix)?;

        let pod_name = newest.metadata.name.expect("listed pod always has a name");
        self.cache.put(key, pod_name.clone());
        Ok(format!("pod/{pod_name}"))
    }

    async fn resolve_by_selector(&self, context: &str, namespace: &str, selector: &str) -> Result<String> {
        let key = cache_key(context, namespace, "pod", Some(selector));
        if let Some(cached) = self.cache.get(&key) {
            return Ok(format!("pod/{}", cached.pod_name));
        }

        let client = self.pool.get_client(context).await?;
        let api: Api<Pod> = Api::namespaced(client, namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await?;

        let chosen = pods
            .items
            .into_iter()
            .find(pod_is_running)
            .ok_or(Error::NoRunningPodsForSelector)?;

        let pod_name = chosen.metadata.name.expect("listed pod always has a name");
        self.cache.put(key, pod_name.clone());
        Ok(format!("pod/{pod_name}"))
    }

    /// Purges every cached resolution under `context/namespace`, forcing a
    /// fresh lookup on the next `resolve` call. Used by the Forward Worker
    /// when a rebuilt tunnel immediately fails — the cached name may be
    /// stale.
    pub fn invalidate(&self, context: &str, namespace: &str) {
        self.cache.invalidate_prefix(&format!("{context}/{namespace}/"));
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
