//! Bulk copy of the mounted source tree to the target's data partition.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

pub mod rsync;
pub mod simulated;

pub use rsync::RsyncEngine;
pub use simulated::SimulatedEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEngineType {
    Rsync,
    Simulated,
}

/// One copy of a local tree to a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Local root whose contents are copied (not the directory itself).
    pub source: PathBuf,
    /// `user@host:/path` on the target.
    pub destination: String,
    /// Remote shell the copy tunnels through, as rsync's `-e` value.
    pub transport: String,
}

impl TransferRequest {
    pub fn new(
        source: impl Into<PathBuf>,
        user: &str,
        host: &str,
        target: &std::path::Path,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: format!("{}@{}:{}", user, host, target.display()),
            transport: transport.into(),
        }
    }

    /// The source with a trailing slash, so the contents are copied.
    pub fn source_contents(&self) -> String {
        let source = self.source.to_string_lossy();
        format!("{}/", source.trim_end_matches('/'))
    }
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Copy everything under the source, preserving hard links, ACLs,
    /// extended attributes and sparseness. Fails with
    /// `MigrationError::Transfer`.
    async fn transfer(&self, request: &TransferRequest) -> Result<()>;
}

pub fn get_engine(engine: TransferEngineType) -> std::sync::Arc<dyn TransferEngine> {
    match engine {
        TransferEngineType::Rsync => std::sync::Arc::new(RsyncEngine::default()),
        TransferEngineType::Simulated => std::sync::Arc::new(SimulatedEngine::default()),
    }
}
