use std::fmt::Display;
use std::sync::Arc;

use crate::mem_hierarchy::error::MemSysResult;

pub type Address = u64;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MemoryRequestType {
    READ,
    WRITE,
}

impl MemoryRequestType {
    pub fn from_is_write(is_write: bool) -> Self {
        if is_write { Self::WRITE } else { Self::READ }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        *self == Self::WRITE
    }

    /// single letter code used by the trace sinks and trace files
    pub fn code(&self) -> char {
        match self {
            Self::READ => 'R',
            Self::WRITE => 'W',
        }
    }
}

impl Display for MemoryRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every level in the memory hierarchy is one of these: a cache, a trace sink, or anything else
/// that can take an access and forward it further down.
/// Devices are shared between requester threads, so all of them must be `Send + Sync`.
pub trait MemoryDevice: Send + Sync {
    /// serve an access; on a miss a cache forwards it to its lower level before returning
    fn access(&self, address: Address, request_type: MemoryRequestType);

    /// drop any copy of `address` held by this device, without touching lower levels
    /// devices with no notion of residency answer with `MemSysError::InvalidOperation`
    fn invalidate(&self, address: Address) -> MemSysResult<()>;
}

/// A set of parallel devices at one level, indexed by requester (core) id.
/// Used to chain per-core partitions: the i-th device of one level feeds from the i-th of another.
pub trait MemoryDeviceSet {
    /// panics if `index` is out of range
    fn get_memory_device(&self, index: usize) -> Arc<dyn MemoryDevice>;

    fn num_devices(&self) -> usize;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_codes() {
        assert_eq!(MemoryRequestType::from_is_write(false), MemoryRequestType::READ);
        assert_eq!(MemoryRequestType::from_is_write(true), MemoryRequestType::WRITE);
        assert!(MemoryRequestType::WRITE.is_write());
        assert_eq!(MemoryRequestType::READ.to_string(), "R");
        assert_eq!(MemoryRequestType::WRITE.to_string(), "W");
    }
}
