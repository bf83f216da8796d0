pub mod cache;
pub mod cache_group;
pub mod coherence;
pub mod error;
pub mod hierarchy;
pub mod line_store;
pub mod memory_device;
pub mod tracer;
