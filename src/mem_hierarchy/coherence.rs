use std::str::FromStr;
use std::sync::Mutex;

use ahash::{AHashMap, AHashSet};

use crate::mem_hierarchy::error::MemSysError;
use crate::mem_hierarchy::memory_device::{Address, MemoryRequestType};

/// Requester/cache index inside one hierarchy level.
pub type CacheId = usize;

/// Hooks a coherence protocol gets at each point of the cache access path.
/// One protocol instance is shared by every cache of a level.
///
/// The cache units do not call these yet: the hit/miss path stays protocol-agnostic
/// and a real protocol plugs in here without touching the set lookup.
pub trait CoherenceProtocol: Send + Sync {
    fn lock_addr(&self, address: Address);
    fn unlock_addr(&self, address: Address);
    fn add_sharer(&self, address: Address, id: CacheId);
    fn remove_sharer(&self, address: Address, id: CacheId);
    fn on_hit(&self, id: CacheId, address: Address, request_type: MemoryRequestType);
    fn on_miss(&self, id: CacheId, address: Address, request_type: MemoryRequestType);
    fn on_evict(&self, id: CacheId, address: Address);
}

/// For levels that take no action to maintain coherence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProtocol;

impl CoherenceProtocol for NullProtocol {
    fn lock_addr(&self, _address: Address) {}
    fn unlock_addr(&self, _address: Address) {}
    fn add_sharer(&self, _address: Address, _id: CacheId) {}
    fn remove_sharer(&self, _address: Address, _id: CacheId) {}
    fn on_hit(&self, _id: CacheId, _address: Address, _request_type: MemoryRequestType) {}
    fn on_miss(&self, _id: CacheId, _address: Address, _request_type: MemoryRequestType) {}
    fn on_evict(&self, _id: CacheId, _address: Address) {}
}

/// Directory based MOESI protocol, not implemented beyond the sharer directory.
/// It keeps track of which caches hold each address; no state transitions are modelled.
#[derive(Debug, Default)]
pub struct DirectoryMoesi {
    directory: Mutex<AHashMap<Address, AHashSet<CacheId>>>,
}

impl DirectoryMoesi {
    pub fn new() -> Self {
        Self::default()
    }

    /// caches currently registered as holding `address`, in ascending id order
    pub fn sharers(&self, address: Address) -> Vec<CacheId> {
        let directory = self.directory.lock().unwrap();
        let mut sharers: Vec<CacheId> = directory
            .get(&address)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        sharers.sort_unstable();
        sharers
    }

    #[cfg(test)]
    fn tracked_addresses(&self) -> usize {
        self.directory.lock().unwrap().len()
    }
}

impl CoherenceProtocol for DirectoryMoesi {
    fn lock_addr(&self, _address: Address) {}
    fn unlock_addr(&self, _address: Address) {}

    fn add_sharer(&self, address: Address, id: CacheId) {
        self.directory
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .insert(id);
    }

    fn remove_sharer(&self, address: Address, id: CacheId) {
        let mut directory = self.directory.lock().unwrap();
        if let Some(ids) = directory.get_mut(&address) {
            ids.remove(&id);
            if ids.is_empty() {
                directory.remove(&address);
            }
        }
    }

    fn on_hit(&self, _id: CacheId, _address: Address, _request_type: MemoryRequestType) {}
    fn on_miss(&self, _id: CacheId, _address: Address, _request_type: MemoryRequestType) {}
    fn on_evict(&self, _id: CacheId, _address: Address) {}
}

/// Protocol selector as written in hierarchy configuration files.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    #[default]
    Null,
    DirectoryMoesi,
}

impl FromStr for ProtocolKind {
    type Err = MemSysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" | "none" => Ok(Self::Null),
            "dir_moesi" | "directory" => Ok(Self::DirectoryMoesi),
            other => Err(MemSysError::InvalidConfig(format!(
                "unknown coherence protocol \"{other}\""
            ))),
        }
    }
}
