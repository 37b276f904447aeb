//! Kube Client Pool — caches per-context API clients and REST configs.
//!
//! Grounded on `kube/shared_client.rs`'s `SharedClientManager` (the same
//! cache-per-context role) but expressed with an explicit
//! `tokio::sync::RwLock` double-checked-locking pattern instead of a
//! `DashMap`, because §4.1 of the spec calls that construction path out by
//! name: "readers take the read side; the construction path upgrades to
//! the write side and re-checks under the write lock to avoid duplicate
//! construction". Errors during construction are never cached, so the next
//! call simply retries — also per §4.1.

use std::collections::HashMap;
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::error::{Error, Result};

struct PoolEntry {
    client: Client,
    rest_config: Config,
}

pub struct KubeClientPool {
    kubeconfig: Kubeconfig,
    entries: tokio::sync::RwLock<HashMap<String, Arc<PoolEntry>>>,
}

impl KubeClientPool {
    /// Reads the merged kubeconfig (respecting `$KUBECONFIG`) once at
    /// construction; contexts are resolved against this snapshot for the
    /// pool's lifetime.
    pub fn new(kubeconfig: Kubeconfig) -> Self {
        Self {
            kubeconfig,
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn from_default() -> Result<Self> {
        Ok(Self::new(Kubeconfig::read()?))
    }

    fn require_context(&self, context: &str) -> Result<()> {
        if self.kubeconfig.contexts.iter().any(|c| c.name == context) {
            Ok(())
        } else {
            Err(Error::ContextNotFound(context.to_string()))
        }
    }

    pub async fn get_client(&self, context: &str) -> Result<Client> {
        Ok(self.get_entry(context).await?.client.clone())
    }

    pub async fn get_rest_config(&self, context: &str) -> Result<Config> {
        Ok(self.get_entry(context).await?.rest_config.clone())
    }

    async fn get_entry(&self, context: &str) -> Result<Arc<PoolEntry>> {
        if let Some(entry) = self.entries.read().await.get(context) {
            debug!(context, "kube client pool hit");
            return Ok(Arc::clone(entry));
        }

        self.require_context(context)?;

        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get(context) {
            debug!(context, "kube client pool hit after lock upgrade");
            return Ok(Arc::clone(entry));
        }

        info!(context, "constructing kube client for context");
        let rest_config = Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::config(format!("failed to build config for {context}: {e}")))?;

        let client = Client::try_from(rest_config.clone())?;
        let entry = Arc::new(PoolEntry { client, rest_config });
        guard.insert(context.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    pub fn list_contexts(&self) -> Vec<String> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn current_context(&self) -> Option<String> {
        self.kubeconfig.current_context.clone()
    }

    pub async fn default_namespace(&self, context: &str) -> Result<String> {
        Ok(self.get_entry(context).await?.rest_config.default_namespace.clone())
    }

    pub async fn invalidate(&self, context: &str) {
        self.entries.write().await.remove(context);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kubeconfig_with_context(name: &str) -> Kubeconfig {
        Kubeconfig {
            contexts: vec![kube::config::NamedContext {
                name: name.to_string(),
                context: Some(kube::config::Context {
                    cluster: "test-cluster".to_string(),
                    user: "test-user".to_string(),
                    namespace: None,
                    extensions: None,
                }),
            }],
            clusters: vec![kube::config::NamedCluster {
                name: "test-cluster".to_string(),
                cluster: Some(kube::config::Cluster {
                    server: Some("https://example.invalid".to_string()),
                    insecure_skip_tls_verify: Some(true),
                    certificate_authority: None,
                    certificate_authority_data: None,
                    proxy_url: None,
                    tls_server_name: None,
                    extensions: None,
                }),
            }],
            auth_infos: vec![kube::config::NamedAuthInfo {
                name: "test-user".to_string(),
                auth_info: Some(kube::config::AuthInfo::default()),
            }],
            current_context: Some(name.to_string()),
            ..Kubeconfig::default()
        }
    }

    #[tokio::test]
    async fn unknown_context_is_a_stable_error() {
        let pool = KubeClientPool::new(kubeconfig_with_context("known"));
        let err = pool.get_client("unknown").await.unwrap_err();
        assert!(matches!(err, Error::ContextNotFound(ctx) if ctx == "unknown"));
    }

    #[tokio::test]
    async fn list_and_current_context_reflect_kubeconfig() {
        let pool = KubeClientPool::new(kubeconfig_with_context("prod"));
        assert_eq!(pool.list_contexts(), vec!["prod".to_string()]);
        assert_eq!(pool.current_context(), Some("prod".to_string()));
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let pool = KubeClientPool::new(kubeconfig_with_context("prod"));
        let first = pool.get_client("prod").await.unwrap();
        let second = pool.get_client("prod").await.unwrap();
        assert_eq!(
            format!("{:?}", first.default_namespace()),
            format!("{:?}", second.default_namespace())
        );
    }

    #[tokio::test]
    async fn invalidate_forces_reconstruction() {
        let pool = KubeClientPool::new(kubeconfig_with_context("prod"));
        pool.get_client("prod").await.unwrap();
        assert!(pool.entries.read().await.contains_key("prod"));
        pool.invalidate("prod").await;
        assert!(!pool.entries.read().await.contains_key("prod"));
    }
}
