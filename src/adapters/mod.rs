use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::host::LocalHost;
use crate::core::orchestrator::MigrationRequest;
use crate::core::remote::RemoteConnector;
use crate::core::transfer_engine::{TransferEngine, TransferEngineType, get_engine};

pub mod linux;
pub mod simulated;
pub mod ssh;

pub struct Adapters {
    pub host: Arc<dyn LocalHost>,
    pub connector: Arc<dyn RemoteConnector>,
    pub engine: Arc<dyn TransferEngine>,
}

pub fn get_adapters(config: &AppConfig, request: &MigrationRequest) -> Adapters {
    if config.simulation {
        let (host, session) = simulated::rehearsal(&request.root_device, &request.key_file, &config.source_mount);
        return Adapters {
            host,
            connector: Arc::new(simulated::SimulatedConnector::new(session)),
            engine: get_engine(TransferEngineType::Simulated),
        };
    }

    Adapters {
        host: Arc::new(linux::LinuxHost),
        connector: Arc::new(ssh::SshConnector::new(config)),
        engine: get_engine(TransferEngineType::Rsync),
    }
}
