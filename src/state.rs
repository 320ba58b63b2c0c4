//! Shared server state — broker and identity resolver.

use std::sync::Arc;

use crate::broker::MemoryBroker;
use crate::config::Config;
use crate::identity::{self, IdentityResolver};

/// Shared state accessible from all handlers.
pub struct AppState {
    /// Presence broker all sessions publish through. In-process for a
    /// single-node deployment; swap for an external-broker channel to
    /// span nodes.
    pub broker: MemoryBroker,
    /// Principal → descriptor mapping applied at connection time.
    pub resolver: IdentityResolver,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_resolver(config, identity::default_resolver())
    }

    /// State with a custom identity mapping.
    pub fn with_resolver(config: Config, resolver: IdentityResolver) -> Arc<Self> {
        Arc::new(Self {
            broker: MemoryBroker::new(),
            resolver,
            config,
        })
    }
}
