use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::host::LocalHost;
use crate::core::orchestrator::MigrationRequest;
use crate::core::remote::RemoteConnector;
use crate::core::transfer_engine::TransferEngine;

/// Everything a migration run talks to.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub host: Arc<dyn LocalHost>,
    pub connector: Arc<dyn RemoteConnector>,
    pub engine: Arc<dyn TransferEngine>,
}

impl AppContext {
    /// Real adapters, or a seeded rehearsal when `simulation` is set.
    pub fn new(config: AppConfig, request: &MigrationRequest) -> Self {
        let adapters = adapters::get_adapters(&config, request);
        Self::with_adapters(config, adapters.host, adapters.connector, adapters.engine)
    }

    pub fn with_adapters(
        config: AppConfig,
        host: Arc<dyn LocalHost>,
        connector: Arc<dyn RemoteConnector>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            host,
            connector,
            engine,
        }
    }
}
