use thiserror::Error;

/// Crate-wide error type.
///
/// Variants map onto the error kinds the supervisor distinguishes for
/// retry purposes: configuration errors are fatal at load time, resolution
/// and tunnel errors are retried by the owning worker with backoff, and
/// local errors (port already in use) are retried with a longer ceiling.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("context {0:?} not found in kubeconfig")]
    ContextNotFound(String),

    #[error("no running pods matching prefix")]
    NoRunningPodsForPrefix,

    #[error("no running pods matching selector")]
    NoRunningPodsForSelector,

    #[error("no running pods for service {0}")]
    NoRunningPodsForService(String),

    #[error("service {0} has no selector")]
    ServiceHasNoSelector(String),

    #[error("unsupported resource kind {0:?}")]
    UnsupportedResource(String),

    #[error("pod not running: {0}")]
    PodNotRunning(String),

    #[error("listener bind failed on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("worker hung: probe heartbeat stale")]
    WorkerHung,

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for errors the Forward Worker should retry with backoff rather
    /// than surface as fatal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::UnsupportedResource(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_unsupported_are_not_retryable() {
        assert!(!Error::config("bad").is_retryable());
        assert!(!Error::UnsupportedResource("configmap".into()).is_retryable());
    }

    #[test]
    fn resolution_and_tunnel_errors_are_retryable() {
        assert!(Error::NoRunningPodsForPrefix.is_retryable());
        assert!(Error::NoRunningPodsForService("backend".into()).is_retryable());
        assert!(Error::Tunnel("stream reset".into()).is_retryable());
    }
}
