//! Optional peer-to-peer topology hook.
//!
//! When `[p2p] enable = true` the server hands the section to an injected
//! [`TopologyInitializer`] after it starts serving. The proxy itself ships no
//! topology implementation; a failure is logged and does not stop serving.

use sqlgate_core::P2pConfig;
use sqlgate_pool::BoxFuture;

use crate::error::TopologyError;

pub trait TopologyInitializer: Send + Sync + 'static {
    /// Join or form the topology described by `config`. Called at most once
    /// per server run.
    fn initialize<'a>(&'a self, config: &'a P2pConfig) -> BoxFuture<'a, Result<(), TopologyError>>;
}
