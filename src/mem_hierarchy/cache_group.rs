use std::io::Write;
use std::sync::Arc;

use crate::mem_hierarchy::cache::{CacheConfig, CacheStats, CacheUnit};
use crate::mem_hierarchy::coherence::CoherenceProtocol;
use crate::mem_hierarchy::error::{MemSysError, MemSysResult};
use crate::mem_hierarchy::memory_device::{MemoryDevice, MemoryDeviceSet};

/// Group of caches at the same level of the hierarchy, one per requester index.
/// All units share the level's geometry and coherence protocol instance.
pub struct CacheGroup<P: CoherenceProtocol> {
    caches: Vec<Arc<CacheUnit<P>>>,
    protocol: Arc<P>,
}

impl<P: CoherenceProtocol + 'static> CacheGroup<P> {
    /// `n` caches all feeding the same lower level device (or nothing, for a last level)
    pub fn with_lower_device(
        n: usize,
        config: &CacheConfig,
        lower_level: Option<Arc<dyn MemoryDevice>>,
        protocol: Arc<P>,
    ) -> MemSysResult<Self> {
        Self::build(n, config, protocol, |_| lower_level.clone())
    }

    /// `n` caches where the i-th one feeds the i-th device of `lower_level`
    pub fn with_lower_set(
        n: usize,
        config: &CacheConfig,
        lower_level: &dyn MemoryDeviceSet,
        protocol: Arc<P>,
    ) -> MemSysResult<Self> {
        if lower_level.num_devices() < n {
            return Err(MemSysError::InvalidConfig(format!(
                "{}: {} caches cannot feed a lower level of {} devices",
                config.name,
                n,
                lower_level.num_devices()
            )));
        }
        Self::build(n, config, protocol, |i| Some(lower_level.get_memory_device(i)))
    }

    fn build(
        n: usize,
        config: &CacheConfig,
        protocol: Arc<P>,
        lower_level_of: impl Fn(usize) -> Option<Arc<dyn MemoryDevice>>,
    ) -> MemSysResult<Self> {
        if n == 0 {
            return Err(MemSysError::InvalidConfig(format!(
                "{}: a cache group needs at least one cache",
                config.name
            )));
        }
        let caches = (0..n)
            .map(|i| CacheUnit::new(config, i, lower_level_of(i), protocol.clone()).map(Arc::new))
            .collect::<MemSysResult<Vec<_>>>()?;
        tracing::debug!("Configured cache group {} with {} caches", config.name, n);
        Ok(Self { caches, protocol })
    }
}

impl<P: CoherenceProtocol> CacheGroup<P> {
    pub fn get_cache(&self, index: usize) -> &Arc<CacheUnit<P>> {
        &self.caches[index]
    }

    pub fn caches(&self) -> &[Arc<CacheUnit<P>>] {
        &self.caches
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    /// counters summed over every cache of the group
    pub fn total_stats(&self) -> CacheStats {
        self.caches.iter().fold(CacheStats::default(), |total, cache| {
            let stats = cache.stats();
            CacheStats {
                accesses: total.accesses + stats.accesses,
                misses: total.misses + stats.misses,
            }
        })
    }

    pub fn report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for cache in &self.caches {
            cache.report(out)?;
        }
        Ok(())
    }
}

impl<P: CoherenceProtocol + 'static> MemoryDeviceSet for CacheGroup<P> {
    fn get_memory_device(&self, index: usize) -> Arc<dyn MemoryDevice> {
        self.caches[index].clone()
    }

    fn num_devices(&self) -> usize {
        self.caches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_hierarchy::coherence::{DirectoryMoesi, NullProtocol};
    use crate::mem_hierarchy::memory_device::MemoryRequestType;
    use crate::mem_hierarchy::memory_device::test_devices::RecordingDevice;

    const READ: MemoryRequestType = MemoryRequestType::READ;

    #[test]
    fn private_caches_feed_one_shared_cache() {
        let memory = Arc::new(RecordingDevice::default());
        let llc_config = CacheConfig::new("L3", 8, 64, 64).shared(true);
        let llc = CacheGroup::with_lower_device(1, &llc_config, Some(memory.clone()), Arc::new(NullProtocol))
            .unwrap();
        let l1_config = CacheConfig::new("L1", 2, 16, 64);
        let l1 = CacheGroup::with_lower_device(
            4,
            &l1_config,
            Some(llc.get_memory_device(0)),
            Arc::new(NullProtocol),
        )
        .unwrap();

        for core in 0..4 {
            l1.get_memory_device(core).access(0x4000, READ);
        }
        // each private cache misses once, the shared one fetches from memory once
        assert_eq!(l1.total_stats().misses, 4);
        assert_eq!(llc.get_cache(0).stats().accesses, 4);
        assert_eq!(llc.get_cache(0).stats().misses, 1);
        assert_eq!(memory.recorded().len(), 1);
    }

    #[test]
    fn chained_private_levels_stay_partitioned() {
        let memory = Arc::new(RecordingDevice::default());
        let l2 = CacheGroup::with_lower_device(
            2,
            &CacheConfig::new("L2", 4, 32, 64),
            Some(memory.clone()),
            Arc::new(NullProtocol),
        )
        .unwrap();
        let l1 = CacheGroup::with_lower_set(2, &CacheConfig::new("L1", 1, 4, 64), &l2, Arc::new(NullProtocol))
            .unwrap();

        l1.get_memory_device(1).access(0x80, READ);
        l1.get_memory_device(1).access(0x80, READ);
        assert_eq!(l2.get_cache(0).stats().accesses, 0);
        assert_eq!(l2.get_cache(1).stats().accesses, 1);
        assert!(l2.get_cache(1).is_resident(0x80));
        assert!(!l2.get_cache(0).is_resident(0x80));
    }

    #[test]
    fn lower_set_must_cover_every_cache() {
        let l2 = CacheGroup::with_lower_device(2, &CacheConfig::new("L2", 4, 32, 64), None, Arc::new(NullProtocol))
            .unwrap();
        let result = CacheGroup::with_lower_set(4, &CacheConfig::new("L1", 1, 4, 64), &l2, Arc::new(NullProtocol));
        assert!(matches!(result, Err(MemSysError::InvalidConfig(_))));

        let result = CacheGroup::with_lower_device(0, &CacheConfig::new("L1", 1, 4, 64), None, Arc::new(NullProtocol));
        assert!(matches!(result, Err(MemSysError::InvalidConfig(_))));
    }

    #[test]
    fn caches_are_numbered_and_share_the_protocol() {
        let group = CacheGroup::with_lower_device(
            3,
            &CacheConfig::new("L1", 2, 4, 64),
            None,
            Arc::new(DirectoryMoesi::new()),
        )
        .unwrap();
        assert_eq!(group.num_devices(), 3);
        for (i, cache) in group.caches().iter().enumerate() {
            assert_eq!(cache.id(), i);
            assert!(Arc::ptr_eq(cache.protocol(), group.protocol()));
        }
    }

    #[test]
    fn group_report_skips_idle_caches() {
        let group = CacheGroup::with_lower_device(3, &CacheConfig::new("L1", 2, 4, 64), None, Arc::new(NullProtocol))
            .unwrap();
        group.get_memory_device(0).access(0x0, READ);
        group.get_memory_device(2).access(0x0, READ);
        group.get_memory_device(2).access(0x0, READ);

        let mut out = vec![];
        group.report(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "L1, 0, 1, 1\nL1, 2, 2, 1\n");
    }
}
