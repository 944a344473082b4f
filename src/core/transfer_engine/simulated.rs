use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::info;

use crate::core::transfer_engine::{TransferEngine, TransferRequest};
use crate::error::{MigrationError, Result};

/// Records transfer requests instead of copying. Can be told to fail.
pub struct SimulatedEngine {
    delay: Duration,
    requests: Mutex<Vec<TransferRequest>>,
    failure: Mutex<Option<String>>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }
}

impl SimulatedEngine {
    /// Take `delay` per transfer, standing in for a long copy.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make every following transfer fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(reason.into());
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferEngine for SimulatedEngine {
    async fn transfer(&self, request: &TransferRequest) -> Result<()> {
        info!(
            source = %request.source_contents(),
            destination = %request.destination,
            "(Simulated) Transferring files"
        );

        self.requests.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(reason) => Err(MigrationError::Transfer(reason)),
            None => Ok(()),
        }
    }
}
