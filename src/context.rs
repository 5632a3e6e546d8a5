//! Shared handles wired together by the orchestrator and threaded through
//! the radio link, the client registry, and the command pipeline. Kept in
//! its own module (rather than folded into `orchestrator.rs`) so `radio.rs`
//! and `interceptor.rs` can depend on it without a cycle back to the
//! orchestrator itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::radio::RadioLink;
use crate::registry::ClientRegistry;

/// Default bound on concurrently in-flight `/gem` response jobs. Resolves
/// the "unbounded response jobs" open question in favor of a bound (see
/// DESIGN.md).
pub const MAX_CONCURRENT_RESPONSE_JOBS: usize = 8;

pub struct AppContext {
    pub radio: Arc<RadioLink>,
    pub registry: Arc<ClientRegistry>,
    pub default_channel: u32,
    pub response_delay: Duration,
    pub response_semaphore: Arc<Semaphore>,
}

impl AppContext {
    pub fn new(config: &Config, radio: Arc<RadioLink>, registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(Self {
            radio,
            registry,
            default_channel: config.channel,
            response_delay: Duration::from_secs_f64(config.response_delay),
            response_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_RESPONSE_JOBS)),
        })
    }
}
