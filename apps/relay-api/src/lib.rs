pub mod access;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use access::AccessControl;
use config::Config;
use gateway::dispatcher::BroadcastDispatcher;
use gateway::lifecycle::ConnectionLifecycleManager;
use gateway::registry::SubscriptionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub access: Arc<AccessControl>,
    pub registry: Arc<SubscriptionRegistry>,
    pub lifecycle: Arc<ConnectionLifecycleManager>,
    pub dispatcher: Arc<BroadcastDispatcher>,
}

impl AppState {
    /// Wire up the core from configuration. Starts the sweep task, so this
    /// must run inside a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let lifecycle = ConnectionLifecycleManager::new(registry.clone(), config.sweep_config());
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        let access = Arc::new(AccessControl::from_config(&config));

        Self {
            config: Arc::new(config),
            access,
            registry,
            lifecycle,
            dispatcher,
        }
    }
}
