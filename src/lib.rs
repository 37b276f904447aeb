//! Supervises a declared set of Kubernetes port forwards: resolves
//! targets, opens tunnels, and reconnects on failure. See `SPEC_FULL.md`
//! for the full component breakdown; the short version is three
//! cooperating subsystems — [`pool::KubeClientPool`],
//! [`resolver::ResourceResolver`], and [`worker::WorkerHandle`] — wired
//! together by [`manager::ForwardManager`].

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod manager;
pub mod pool;
pub mod resolver;
pub mod worker;

pub use config::{DeclaredForward, ForwardId, RootConfig};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use manager::ForwardManager;
pub use pool::KubeClientPool;
pub use worker::{WorkerState, WorkerStatus};
