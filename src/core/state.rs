//! Shared record of what a migration run has touched.
//!
//! The run and its cleanup see the same tracker. Cleanup decides what to undo
//! purely from what is recorded here, so every mutation is recorded as soon
//! as it succeeds.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::models::{FilesystemEntry, Stage};
use super::remote::RemoteSession;

#[derive(Default)]
struct MigrationState {
    stage: Option<Stage>,
    /// Filesystems mounted under the source root, in mount order.
    mounted: Vec<FilesystemEntry>,
    /// Whether a target mount may exist on the remote side.
    target_touched: bool,
    session: Option<Arc<dyn RemoteSession>>,
}

#[derive(Clone, Default)]
pub struct MigrationTracker {
    inner: Arc<Mutex<MigrationState>>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stage(&self) -> Stage {
        self.inner.lock().await.stage.unwrap_or(Stage::Init)
    }

    pub async fn advance(&self, stage: Stage) {
        let mut state = self.inner.lock().await;
        let from = state.stage.unwrap_or(Stage::Init);
        info!(from = %from, to = %stage, "Stage transition");
        state.stage = Some(stage);
    }

    pub async fn set_session(&self, session: Arc<dyn RemoteSession>) {
        self.inner.lock().await.session = Some(session);
    }

    pub async fn session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.inner.lock().await.session.clone()
    }

    pub async fn record_mount(&self, entry: FilesystemEntry) {
        self.inner.lock().await.mounted.push(entry);
    }

    /// Take the mounted list, leaving the tracker empty, so cleanup only
    /// ever acts on it once.
    pub async fn take_mounted(&self) -> Vec<FilesystemEntry> {
        std::mem::take(&mut self.inner.lock().await.mounted)
    }

    pub async fn mounted(&self) -> Vec<FilesystemEntry> {
        self.inner.lock().await.mounted.clone()
    }

    pub async fn mark_target_touched(&self) {
        self.inner.lock().await.target_touched = true;
    }

    pub async fn target_touched(&self) -> bool {
        self.inner.lock().await.target_touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_in_init() {
        let tracker = MigrationTracker::new();
        assert_eq!(tracker.stage().await, Stage::Init);
        assert!(tracker.mounted().await.is_empty());
        assert!(tracker.session().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let tracker = MigrationTracker::new();
        let other = tracker.clone();

        other.advance(Stage::Connected).await;
        other
            .record_mount(FilesystemEntry::new("/dev/sda1", "/"))
            .await;

        assert_eq!(tracker.stage().await, Stage::Connected);
        assert_eq!(tracker.mounted().await.len(), 1);
    }

    #[tokio::test]
    async fn take_mounted_empties_the_list() {
        let tracker = MigrationTracker::new();
        tracker.record_mount(FilesystemEntry::new("/dev/sda1", "/")).await;
        tracker.record_mount(FilesystemEntry::new("/dev/sda2", "/usr")).await;

        let taken = tracker.take_mounted().await;
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].mount_point, "/usr");
        assert!(tracker.take_mounted().await.is_empty());
    }
}
