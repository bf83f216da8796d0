use std::io::BufRead;

use crossbeam_channel::{Sender, bounded};

use crate::mem_hierarchy::error::{MemSysError, MemSysResult};
use crate::mem_hierarchy::hierarchy::MemoryHierarchy;
use crate::mem_hierarchy::memory_device::{Address, MemoryRequestType};

/// records in flight per core before the reader blocks
const REPLAY_QUEUE_DEPTH: usize = 1024;
const PROGRESS_INTERVAL: u64 = 1_000_000;

/// One memory access issued by a core, as read from a `<core> <address> <R|W>` trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub line: usize,
    pub core: usize,
    pub address: Address,
    pub request_type: MemoryRequestType,
}

fn parse_error(line: usize, reason: impl Into<String>) -> MemSysError {
    MemSysError::TraceParse { line, reason: reason.into() }
}

fn parse_address(text: &str) -> Option<Address> {
    // `from_str_radix` and `parse` both accept a leading '+'
    if text.starts_with(['+', '-']) {
        return None;
    }
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => Address::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Parse one trace line. Blank lines and `#` comments give `None`.
pub fn parse_line(line: usize, text: &str) -> MemSysResult<Option<TraceRecord>> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = text.split_whitespace().collect();
    let [core, address, kind] = fields[..] else {
        return Err(parse_error(line, format!("expected 3 fields, found {}", fields.len())));
    };

    let core = core
        .parse()
        .map_err(|_| parse_error(line, format!("invalid core index \"{core}\"")))?;
    let address = parse_address(address)
        .ok_or_else(|| parse_error(line, format!("invalid address \"{address}\"")))?;
    let request_type = match kind {
        "R" | "r" => MemoryRequestType::READ,
        "W" | "w" => MemoryRequestType::WRITE,
        other => return Err(parse_error(line, format!("access type must be R or W, found \"{other}\""))),
    };

    Ok(Some(TraceRecord { line, core, address, request_type }))
}

/// Lazily parse a whole trace, line numbers starting at 1.
/// A line that cannot be read (e.g. invalid UTF-8) is reported as a parse error on that line.
pub fn parse_trace<R: BufRead>(reader: R) -> impl Iterator<Item = MemSysResult<TraceRecord>> {
    reader.lines().enumerate().filter_map(|(i, line)| match line {
        Ok(text) => parse_line(i + 1, &text).transpose(),
        Err(e) => Some(Err(parse_error(i + 1, e.to_string()))),
    })
}

/// Feed `records` into the hierarchy with one requester thread per core.
/// Accesses of a core are issued in trace order; different cores run concurrently.
/// Returns how many accesses were replayed. Stops at the first bad record.
pub fn replay(
    hierarchy: &MemoryHierarchy,
    records: impl IntoIterator<Item = MemSysResult<TraceRecord>>,
) -> MemSysResult<u64> {
    let cores = hierarchy.cores();
    std::thread::scope(|s| {
        let mut senders = Vec::with_capacity(cores);
        let mut workers = Vec::with_capacity(cores);
        for core in 0..cores {
            let (sender, receiver) = bounded::<TraceRecord>(REPLAY_QUEUE_DEPTH);
            let device = hierarchy.core_device(core);
            workers.push(s.spawn(move || {
                let mut served = 0u64;
                for record in receiver.iter() {
                    device.access(record.address, record.request_type);
                    served += 1;
                }
                tracing::debug!("Core {} replayed {} accesses", core, served);
            }));
            senders.push(sender);
        }

        let fed = feed(&senders, records);

        // dropping the senders lets every worker drain and exit
        drop(senders);
        let mut stopped = None;
        for (core, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() && stopped.is_none() {
                stopped = Some(core);
            }
        }
        match stopped {
            Some(core) => Err(MemSysError::ReplayWorker { core, reason: "worker thread panicked".to_string() }),
            None => fed,
        }
    })
}

fn feed(
    senders: &[Sender<TraceRecord>],
    records: impl IntoIterator<Item = MemSysResult<TraceRecord>>,
) -> MemSysResult<u64> {
    let mut replayed = 0u64;
    for record in records {
        let record = record?;
        let Some(sender) = senders.get(record.core) else {
            return Err(parse_error(
                record.line,
                format!("core {} out of range ({} cores)", record.core, senders.len()),
            ));
        };
        sender.send(record).map_err(|e| MemSysError::ReplayWorker {
            core: record.core,
            reason: e.to_string(),
        })?;

        replayed += 1;
        if replayed % PROGRESS_INTERVAL == 0 {
            tracing::info!("{} million accesses replayed", replayed / PROGRESS_INTERVAL);
        }
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::mem_hierarchy::cache::CacheStats;
    use crate::mem_hierarchy::hierarchy::HierarchyConfig;
    use crate::mem_hierarchy::memory_device::MemoryDevice;

    /// backing store that brings down whichever requester reaches it
    struct FailingMemory;

    impl MemoryDevice for FailingMemory {
        fn access(&self, address: Address, _request_type: MemoryRequestType) {
            panic!("backing store unavailable for {address:#x}");
        }

        fn invalidate(&self, _address: Address) -> MemSysResult<()> {
            Ok(())
        }
    }

    fn two_core_hierarchy() -> MemoryHierarchy {
        let config = HierarchyConfig::from_json_str(
            r#"{ "cores": 2, "levels": [
                { "name": "L1", "ways": 1, "sets": 1, "line_size": 64 },
                { "name": "LLC", "ways": 4, "sets": 16, "shared": true } ] }"#,
        )
        .unwrap();
        MemoryHierarchy::build(&config, None).unwrap()
    }

    #[test]
    fn parses_records() {
        assert_eq!(
            parse_line(7, "1 0x40 W").unwrap(),
            Some(TraceRecord { line: 7, core: 1, address: 0x40, request_type: MemoryRequestType::WRITE })
        );
        assert_eq!(parse_line(1, "  0 4096 r ").unwrap().unwrap().address, 4096);
        assert_eq!(parse_line(1, "").unwrap(), None);
        assert_eq!(parse_line(1, "# core address kind").unwrap(), None);
    }

    #[test]
    fn reports_malformed_lines() {
        for text in ["0 0x40", "x 0x40 R", "0 0xzz R", "0 64 X", "0 64 R extra", "-1 64 R", "0 +64 R", "0 -64 R", "0 +0x40 R"] {
            assert!(
                matches!(parse_line(3, text), Err(MemSysError::TraceParse { line: 3, .. })),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn parse_trace_numbers_lines() {
        let records: Vec<_> = parse_trace(Cursor::new("# header\n0 0 R\n\n1 64 W\n")).collect();
        let lines: Vec<usize> = records.iter().map(|r| r.as_ref().unwrap().line).collect();
        assert_eq!(lines, vec![2, 4]);
    }

    #[test]
    fn replays_single_core_in_order() {
        let hierarchy = two_core_hierarchy();
        let replayed = replay(&hierarchy, parse_trace(Cursor::new("0 0 R\n0 0 R\n0 64 R\n0 0 R\n"))).unwrap();
        assert_eq!(replayed, 4);
        assert_eq!(hierarchy.levels()[0].total_stats(), CacheStats { accesses: 4, misses: 3 });
        assert_eq!(hierarchy.levels()[1].total_stats(), CacheStats { accesses: 3, misses: 2 });
    }

    #[test]
    fn replays_every_core() {
        let hierarchy = two_core_hierarchy();
        let trace: String = (0..2_000u64).map(|i| format!("{} {} R\n", i % 2, (i % 32) * 64)).collect();
        let replayed = replay(&hierarchy, parse_trace(Cursor::new(trace))).unwrap();
        assert_eq!(replayed, 2_000);
        assert_eq!(hierarchy.levels()[0].total_stats().accesses, 2_000);
        assert_eq!(hierarchy.levels()[1].total_stats().misses, 32);
    }

    #[test]
    fn stops_at_bad_records() {
        let hierarchy = two_core_hierarchy();
        let result = replay(&hierarchy, parse_trace(Cursor::new("0 0 R\n2 0 R\n0 64 R\n")));
        assert!(matches!(result, Err(MemSysError::TraceParse { line: 2, .. })));

        let result = replay(&hierarchy, parse_trace(Cursor::new("0 0 R\nbogus\n")));
        assert!(matches!(result, Err(MemSysError::TraceParse { line: 2, .. })));
    }

    #[test]
    fn unreadable_lines_carry_their_line_number() {
        let records: Vec<_> = parse_trace(Cursor::new(b"0 0 R\n\xff\xfe\n".to_vec())).collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(matches!(records[1], Err(MemSysError::TraceParse { line: 2, .. })));
    }

    #[test]
    fn disconnected_worker_is_reported() {
        let (sender, receiver) = bounded::<TraceRecord>(1);
        drop(receiver);
        let trace = parse_trace(Cursor::new("0 64 W\n"));
        assert!(matches!(
            feed(&[sender], trace),
            Err(MemSysError::ReplayWorker { core: 0, .. })
        ));
    }

    #[test]
    fn panicking_worker_is_reported() {
        let config = HierarchyConfig::from_json_str(r#"{ "cores": 2, "levels": [ { "ways": 1, "sets": 1 } ] }"#)
            .unwrap();
        let hierarchy = MemoryHierarchy::build(&config, Some(Arc::new(FailingMemory))).unwrap();
        let result = replay(&hierarchy, parse_trace(Cursor::new("1 0x40 R\n")));
        assert!(matches!(result, Err(MemSysError::ReplayWorker { core: 1, .. })));
    }
}
