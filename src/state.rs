use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::IeeeAddr;
use crate::payload::{self, Payload};

/// Last known state of every device, shared between the engine and the hosting process.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    entries: Arc<RwLock<HashMap<IeeeAddr, Payload>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the cached state, empty when nothing is known yet.
    pub fn get(&self, addr: &IeeeAddr) -> Payload {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(addr).cloned().unwrap_or_default()
    }

    /// Merges `update` into the cached state, it never replaces it.
    pub fn set(&self, addr: &IeeeAddr, update: &Payload) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        payload::merge(entries.entry(*addr).or_default(), update.clone());
    }
}
