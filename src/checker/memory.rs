use super::Shared;
use crate::store::HeartbeatRecord;
use anyhow::Result;
use std::sync::Arc;

/// Single-node checker keeping every record in the local store.
pub(super) struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(super) fn put(&self, key: String, record: HeartbeatRecord) -> Result<()> {
        self.shared.store.put([(key, record)]);

        Ok(())
    }

    pub(super) fn get(&self, key: &str) -> Option<HeartbeatRecord> {
        self.shared.store.get_one(key)
    }

    pub(super) fn del(&self, key: &str) -> Result<()> {
        self.shared.store.del(&[key.to_string()]);

        Ok(())
    }
}
