use std::io::Write;
use std::sync::Mutex;

use crate::mem_hierarchy::error::{MemSysError, MemSysResult};
use crate::mem_hierarchy::memory_device::{Address, MemoryDevice, MemoryRequestType};

/// Place one of these at any level in the hierarchy to get a read/write trace at that level.
/// Each access becomes one `<decimal address> <R|W>` line.
pub struct Tracer<W: Write + Send> {
    trace_file: Mutex<W>,
}

impl<W: Write + Send> Tracer<W> {
    pub fn new(trace_file: W) -> Self {
        Self {
            trace_file: Mutex::new(trace_file),
        }
    }

    pub fn flush(&self) -> MemSysResult<()> {
        self.trace_file.lock().unwrap().flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.trace_file.into_inner().unwrap()
    }
}

impl<W: Write + Send> MemoryDevice for Tracer<W> {
    fn access(&self, address: Address, request_type: MemoryRequestType) {
        let mut trace_file = self.trace_file.lock().unwrap();
        // access has no error path, losing a trace line is only worth a warning
        if let Err(e) = writeln!(trace_file, "{} {}", address, request_type.code()) {
            tracing::warn!("Failed to write trace record for address {:#x}: {}", address, e);
        }
    }

    fn invalidate(&self, address: Address) -> MemSysResult<()> {
        Err(MemSysError::InvalidOperation(format!(
            "cannot invalidate {address:#x} on a trace sink"
        )))
    }
}
