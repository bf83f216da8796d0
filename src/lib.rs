pub mod mem_hierarchy;
pub mod trace_replay;
