use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use spin::Mutex;

use crate::mem_hierarchy::coherence::{CacheId, CoherenceProtocol, NullProtocol};
use crate::mem_hierarchy::error::{MemSysError, MemSysResult};
use crate::mem_hierarchy::line_store::{CacheSet, Tag};
use crate::mem_hierarchy::memory_device::{Address, MemoryDevice, MemoryRequestType};

/// Upper bound on `ways * sets` for a single unit.
pub const MAX_LINE_SLOTS: usize = 1 << 32;

/// Geometry and identity of one cache unit, fixed for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// human readable name, printed in the final report
    pub name: String,
    /// lines per set
    pub ways: usize,
    /// number of sets, power of two
    pub sets: usize,
    /// line size in bytes, power of two
    pub line_size: usize,
    /// accessed concurrently by several requesters (ex. a last level cache)
    pub shared: bool,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, ways: usize, sets: usize, line_size: usize) -> Self {
        Self {
            name: name.into(),
            ways,
            sets,
            line_size,
            shared: false,
        }
    }

    /// derive the set count from a total capacity in bytes
    pub fn from_capacity(
        name: impl Into<String>,
        size_bytes: usize,
        ways: usize,
        line_size: usize,
    ) -> MemSysResult<Self> {
        let name = name.into();
        if line_size == 0 || !line_size.is_power_of_two() {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: line size {line_size} is not a power of two"
            )));
        }
        if ways == 0 {
            return Err(MemSysError::InvalidConfig(format!("{name}: ways must be at least 1")));
        }
        if size_bytes == 0 || size_bytes % line_size != 0 {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: capacity {size_bytes} is not a multiple of the line size {line_size}"
            )));
        }
        let lines = size_bytes / line_size;
        if ways > lines {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: {ways} ways do not fit in {lines} lines of capacity"
            )));
        }
        if lines % ways != 0 {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: {lines} lines cannot be split evenly into {ways} ways"
            )));
        }
        let config = Self::new(name, ways, lines / ways, line_size);
        config.validate()?;
        Ok(config)
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn validate(&self) -> MemSysResult<()> {
        let name = &self.name;
        if self.ways == 0 {
            return Err(MemSysError::InvalidConfig(format!("{name}: ways must be at least 1")));
        }
        if self.sets == 0 || !self.sets.is_power_of_two() {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: set count {} is not a power of two",
                self.sets
            )));
        }
        if self.line_size == 0 || !self.line_size.is_power_of_two() {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: line size {} is not a power of two",
                self.line_size
            )));
        }
        // at least one tag bit has to remain above offset and index
        if self.line_size_log2() + self.sets_log2() >= Address::BITS {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: {} sets of {} byte lines cover the whole address space",
                self.sets, self.line_size
            )));
        }
        let slots = self.ways.checked_mul(self.sets).filter(|&n| n <= MAX_LINE_SLOTS);
        let bytes = slots.and_then(|n| n.checked_mul(self.line_size));
        if slots.is_none() || bytes.is_none() {
            return Err(MemSysError::InvalidConfig(format!(
                "{name}: {} ways x {} sets of {} byte lines is too large (at most {MAX_LINE_SLOTS} line slots)",
                self.ways, self.sets, self.line_size
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn sets_log2(&self) -> u32 {
        self.sets.trailing_zeros()
    }

    #[inline]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    /// Size in bytes; saturates for configurations that fail `validate`.
    pub fn capacity(&self) -> usize {
        self.ways
            .saturating_mul(self.sets)
            .saturating_mul(self.line_size)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub accesses: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.accesses - self.misses
    }
}

/// A set-associative cache of any dimension, private or shared.
///
/// Each set sits behind its own spin lock, so requests to different sets run in parallel.
/// A shared unit additionally holds a unit-wide lock for the whole access, including the
/// forwarded request on a miss, which serializes all requesters going through it.
/// Locks are only ever taken downwards through the hierarchy.
pub struct CacheUnit<P: CoherenceProtocol = NullProtocol> {
    name: String,
    id: CacheId,
    ways: usize,
    sets_log2: u32,
    line_size_log2: u32,
    sets: Box<[CachePadded<Mutex<CacheSet>>]>,
    /// only present on shared units
    access_lock: Option<Mutex<()>>,
    lower_level: Option<Arc<dyn MemoryDevice>>,
    protocol: Arc<P>,
    accesses: AtomicU64,
    misses: AtomicU64,
}

impl<P: CoherenceProtocol> CacheUnit<P> {
    pub fn new(
        config: &CacheConfig,
        id: CacheId,
        lower_level: Option<Arc<dyn MemoryDevice>>,
        protocol: Arc<P>,
    ) -> MemSysResult<Self> {
        config.validate()?;

        let sets = (0..config.sets)
            .map(|_| CachePadded::new(Mutex::new(CacheSet::new(config.ways))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::debug!(
            "Created cache {}#{}: {} sets x {} ways x {} bytes ({} bytes){}",
            config.name,
            id,
            config.sets,
            config.ways,
            config.line_size,
            config.capacity(),
            if config.shared { ", shared" } else { "" }
        );

        Ok(Self {
            name: config.name.clone(),
            id,
            ways: config.ways,
            sets_log2: config.sets_log2(),
            line_size_log2: config.line_size_log2(),
            sets,
            access_lock: config.shared.then(|| Mutex::new(())),
            lower_level,
            protocol,
            accesses: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn line_size(&self) -> usize {
        1 << self.line_size_log2
    }

    pub fn is_shared(&self) -> bool {
        self.access_lock.is_some()
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// split an address into (set index, tag)
    #[inline]
    fn decompose(&self, address: Address) -> (usize, Tag) {
        let block = address >> self.line_size_log2;
        let set = (block & ((1 << self.sets_log2) - 1)) as usize;
        (set, block >> self.sets_log2)
    }

    #[inline]
    fn block_address(&self, set: usize, tag: Tag) -> Address {
        ((tag << self.sets_log2) | set as Address) << self.line_size_log2
    }

    /// Whether a valid copy of `address` is resident. Does not count as an access
    /// and leaves the replacement state untouched.
    pub fn is_resident(&self, address: Address) -> bool {
        let _unit = self.access_lock.as_ref().map(Mutex::lock);
        let (set, tag) = self.decompose(address);
        self.sets[set].lock().find_match(tag).is_some()
    }

    /// block aligned addresses of every valid line, set by set
    pub fn resident_blocks(&self) -> Vec<Address> {
        let _unit = self.access_lock.as_ref().map(Mutex::lock);
        let mut blocks = vec![];
        for (index, set) in self.sets.iter().enumerate() {
            let set = set.lock();
            blocks.extend(set.resident_tags().into_iter().map(|tag| self.block_address(index, tag)));
        }
        blocks
    }

    /// Write the final `name, id, accesses, misses` line.
    /// Units that never served an access stay silent.
    pub fn report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let stats = self.stats();
        if stats.accesses == 0 {
            return Ok(());
        }
        writeln!(out, "{}, {}, {}, {}", self.name, self.id, stats.accesses, stats.misses)
    }
}

impl<P: CoherenceProtocol> MemoryDevice for CacheUnit<P> {
    fn access(&self, address: Address, request_type: MemoryRequestType) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let _unit = self.access_lock.as_ref().map(Mutex::lock);

        let (set_index, tag) = self.decompose(address);
        let mut set = self.sets[set_index].lock();

        if let Some(way) = set.find_match(tag) {
            set.touch(way);
            tracing::trace!(cache = %self.name, id = self.id, address, "hit");
            return;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let block = self.block_address(set_index, tag);
        tracing::trace!(cache = %self.name, id = self.id, address, block, "miss");

        if let Some(lower_level) = &self.lower_level {
            lower_level.access(block, request_type);
        }

        let way = set.find_victim();
        set.touch(way);
        if let Some(evicted) = set.install(way, tag) {
            tracing::trace!(
                cache = %self.name,
                id = self.id,
                evicted = self.block_address(set_index, evicted),
                "evict"
            );
        }
    }

    fn invalidate(&self, address: Address) -> MemSysResult<()> {
        let _unit = self.access_lock.as_ref().map(Mutex::lock);
        let (set, tag) = self.decompose(address);
        let dropped = self.sets[set].lock().invalidate_tag(tag);
        tracing::trace!(cache = %self.name, id = self.id, address, dropped, "invalidate");
        Ok(())
    }
}
