// Synchronization phases for headers-first initial block download

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sync activity yet.
    Idle,
    /// Downloading headers in batches.
    Headers,
    /// Headers complete, backfilling block bodies oldest-first.
    Bodies,
    /// Fully caught up; mining and relay are enabled.
    Synced,
}

impl SyncState {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }
}
