use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use json::JsonValue;

use crate::mem_hierarchy::cache::{CacheConfig, CacheStats};
use crate::mem_hierarchy::cache_group::CacheGroup;
use crate::mem_hierarchy::coherence::{CoherenceProtocol, DirectoryMoesi, NullProtocol, ProtocolKind};
use crate::mem_hierarchy::error::{MemSysError, MemSysResult};
use crate::mem_hierarchy::memory_device::{Address, MemoryDevice, MemoryDeviceSet};

const DEFAULT_LINE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelConfig {
    pub cache: CacheConfig,
    pub protocol: ProtocolKind,
}

/// Shape of a whole hierarchy: the number of requesters and the cache levels from the one
/// closest to the cores down to the last level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyConfig {
    pub cores: usize,
    pub levels: Vec<LevelConfig>,
}

impl HierarchyConfig {
    /// Parse a hierarchy description such as
    /// ```json
    /// { "cores": 4,
    ///   "levels": [
    ///     { "name": "L1", "ways": 8, "size": 32768, "line_size": 64 },
    ///     { "name": "L2", "ways": 16, "sets": 8192, "shared": true, "protocol": "null" } ] }
    /// ```
    pub fn from_json_str(text: &str) -> MemSysResult<Self> {
        let root = json::parse(text)?;

        let cores = match &root["cores"] {
            JsonValue::Null => 1,
            value => value
                .as_usize()
                .ok_or_else(|| invalid("\"cores\" must be a non-negative integer"))?,
        };

        if !root["levels"].is_array() {
            return Err(invalid("\"levels\" must be an array"));
        }
        let levels = root["levels"]
            .members()
            .enumerate()
            .map(|(i, level)| parse_level(i, level))
            .collect::<MemSysResult<Vec<_>>>()?;

        let config = Self { cores, levels };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> MemSysResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn validate(&self) -> MemSysResult<()> {
        if self.cores == 0 {
            return Err(invalid("at least one core is required"));
        }
        if self.levels.is_empty() {
            return Err(invalid("at least one cache level is required"));
        }
        for level in &self.levels {
            level.cache.validate()?;
        }
        // a single shared cache cannot feed one device per core
        for pair in self.levels.windows(2) {
            if pair[0].cache.shared && !pair[1].cache.shared {
                return Err(invalid(&format!(
                    "shared level {} cannot sit above private level {}",
                    pair[0].cache.name, pair[1].cache.name
                )));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> MemSysError {
    MemSysError::InvalidConfig(reason.to_string())
}

fn parse_level(index: usize, level: &JsonValue) -> MemSysResult<LevelConfig> {
    if !level.is_object() {
        return Err(invalid(&format!("level {index} must be an object")));
    }

    let name = match &level["name"] {
        JsonValue::Null => format!("L{}", index + 1),
        value => value
            .as_str()
            .ok_or_else(|| invalid(&format!("level {index}: \"name\" must be a string")))?
            .to_string(),
    };
    let usize_field = |key: &str| -> MemSysResult<Option<usize>> {
        match &level[key] {
            JsonValue::Null => Ok(None),
            value => value
                .as_usize()
                .map(Some)
                .ok_or_else(|| invalid(&format!("{name}: \"{key}\" must be a non-negative integer"))),
        }
    };

    let ways = usize_field("ways")?.ok_or_else(|| invalid(&format!("{name}: \"ways\" is required")))?;
    let line_size = usize_field("line_size")?.unwrap_or(DEFAULT_LINE_SIZE);
    let cache = match (usize_field("sets")?, usize_field("size")?) {
        (Some(sets), None) => CacheConfig::new(name.clone(), ways, sets, line_size),
        (None, Some(size)) => CacheConfig::from_capacity(name.clone(), size, ways, line_size)?,
        (Some(_), Some(_)) => {
            return Err(invalid(&format!("{name}: give either \"sets\" or \"size\", not both")));
        }
        (None, None) => return Err(invalid(&format!("{name}: one of \"sets\" or \"size\" is required"))),
    };

    let shared = match &level["shared"] {
        JsonValue::Null => false,
        value => value
            .as_bool()
            .ok_or_else(|| invalid(&format!("{name}: \"shared\" must be a boolean")))?,
    };
    let protocol = match &level["protocol"] {
        JsonValue::Null => ProtocolKind::default(),
        value => value
            .as_str()
            .ok_or_else(|| invalid(&format!("{name}: \"protocol\" must be a string")))?
            .parse::<ProtocolKind>()?,
    };

    Ok(LevelConfig {
        cache: cache.shared(shared),
        protocol,
    })
}

/// One built level, whatever coherence protocol it was configured with.
pub enum CacheLevel {
    Null(CacheGroup<NullProtocol>),
    DirectoryMoesi(CacheGroup<DirectoryMoesi>),
}

impl CacheLevel {
    pub fn device_set(&self) -> &dyn MemoryDeviceSet {
        match self {
            Self::Null(group) => group,
            Self::DirectoryMoesi(group) => group,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Null(group) => group.get_cache(0).name(),
            Self::DirectoryMoesi(group) => group.get_cache(0).name(),
        }
    }

    pub fn total_stats(&self) -> CacheStats {
        match self {
            Self::Null(group) => group.total_stats(),
            Self::DirectoryMoesi(group) => group.total_stats(),
        }
    }

    pub fn report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Self::Null(group) => group.report(out),
            Self::DirectoryMoesi(group) => group.report(out),
        }
    }
}

/// What the level being built hands its misses to.
enum Below {
    /// one device for every cache of the level, or nothing past the last level
    Device(Option<Arc<dyn MemoryDevice>>),
    /// the per-core caches of the previously built level, by index into the levels
    Level(usize),
}

/// A complete hierarchy of cache levels over an optional last-level device
/// (ex. a `Tracer`), with one entry point per core.
pub struct MemoryHierarchy {
    cores: usize,
    /// closest to the cores first
    levels: Vec<CacheLevel>,
}

impl MemoryHierarchy {
    pub fn build(config: &HierarchyConfig, last_level: Option<Arc<dyn MemoryDevice>>) -> MemSysResult<Self> {
        config.validate()?;

        let mut built: Vec<CacheLevel> = Vec::with_capacity(config.levels.len());
        let mut below = Below::Device(last_level);
        for level_config in config.levels.iter().rev() {
            let cache = &level_config.cache;
            let n = if cache.shared { 1 } else { config.cores };
            let level = match level_config.protocol {
                ProtocolKind::Null => {
                    CacheLevel::Null(new_group(n, cache, &below, &built, Arc::new(NullProtocol))?)
                }
                ProtocolKind::DirectoryMoesi => CacheLevel::DirectoryMoesi(new_group(
                    n,
                    cache,
                    &below,
                    &built,
                    Arc::new(DirectoryMoesi::new()),
                )?),
            };
            tracing::debug!(
                "Built level {} with {} cache(s) of {} bytes",
                cache.name,
                n,
                cache.capacity()
            );
            below = if cache.shared {
                Below::Device(Some(level.device_set().get_memory_device(0)))
            } else {
                Below::Level(built.len())
            };
            built.push(level);
        }
        built.reverse();

        tracing::info!(
            "Configured memory hierarchy for {} core(s): {}",
            config.cores,
            built.iter().map(CacheLevel::name).collect::<Vec<_>>().join(" -> ")
        );
        Ok(Self { cores: config.cores, levels: built })
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn levels(&self) -> &[CacheLevel] {
        &self.levels
    }

    /// Entry device of `core`, i.e. its first level cache. Panics if `core` is out of range.
    pub fn core_device(&self, core: usize) -> Arc<dyn MemoryDevice> {
        assert!(core < self.cores, "core {} out of range ({} cores)", core, self.cores);
        let top = self.levels[0].device_set();
        // a shared first level serves every core with its single cache
        top.get_memory_device(core.min(top.num_devices() - 1))
    }

    /// Drop `address` from every cache of every level. The last-level device is not involved.
    pub fn invalidate(&self, address: Address) -> MemSysResult<()> {
        for level in &self.levels {
            let set = level.device_set();
            for i in 0..set.num_devices() {
                set.get_memory_device(i).invalidate(address)?;
            }
        }
        Ok(())
    }

    /// Write the `name, id, accesses, misses` line of every cache that served an access,
    /// level by level from the cores down. Called once at simulation teardown.
    pub fn finalize(&self, out: &mut dyn Write) -> MemSysResult<()> {
        for level in &self.levels {
            let stats = level.total_stats();
            tracing::info!(
                "Level {}: {} accesses, {} misses",
                level.name(),
                stats.accesses,
                stats.misses
            );
            level.report(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

fn new_group<P: CoherenceProtocol + 'static>(
    n: usize,
    cache: &CacheConfig,
    below: &Below,
    built: &[CacheLevel],
    protocol: Arc<P>,
) -> MemSysResult<CacheGroup<P>> {
    match below {
        Below::Device(device) => CacheGroup::with_lower_device(n, cache, device.clone(), protocol),
        Below::Level(index) => CacheGroup::with_lower_set(n, cache, built[*index].device_set(), protocol),
    }
}
