use crate::mem_hierarchy::error::invariant_violation;

/// per-set timestamp used for recency ordering
pub type Recency = u32;

pub type Tag = u64;

/// State of a single line slot.
/// Only valid/invalid is modelled for now; coherence states would extend this enum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    #[default]
    Invalid,
    Valid,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheLine {
    pub tag: Tag,
    pub state: LineState,
    /// last value of the owning set's timestamp counter stamped on this line
    pub recency: Recency,
}

impl CacheLine {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state != LineState::Invalid
    }
}

/// One set of a set-associative cache: `ways` line slots plus the set's timestamp counter.
/// The set is always accessed under its owner's per-set lock, so nothing here is synchronized.
#[derive(Debug)]
pub struct CacheSet {
    lines: Box<[CacheLine]>,
    max_recency: Recency,
}

impl CacheSet {
    pub fn new(ways: usize) -> Self {
        assert!(ways > 0);
        Self {
            lines: vec![CacheLine::default(); ways].into_boxed_slice(),
            max_recency: 0,
        }
    }

    #[inline]
    pub fn ways(&self) -> usize {
        self.lines.len()
    }

    /// way holding a valid copy of `tag`, if any
    pub fn find_match(&self, tag: Tag) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.is_valid() && line.tag == tag)
    }

    /// Way to fill on a miss: the first empty way, otherwise the least recently touched one.
    pub fn find_victim(&self) -> usize {
        if let Some(way) = self.lines.iter().position(|line| !line.is_valid()) {
            return way;
        }
        let mut victim = 0;
        for (way, line) in self.lines.iter().enumerate().skip(1) {
            if line.recency < self.lines[victim].recency {
                victim = way;
            }
        }
        victim
    }

    /// stamp `way` as the most recently used line of this set
    pub fn touch(&mut self, way: usize) {
        if self.max_recency == Recency::MAX {
            invariant_violation("per-set recency counter overflow");
        }
        self.max_recency += 1;
        self.lines[way].recency = self.max_recency;
    }

    /// Fill `way` with `tag`. The caller stamps recency separately.
    /// Returns the tag that was evicted, if the way held a valid line.
    pub fn install(&mut self, way: usize, tag: Tag) -> Option<Tag> {
        let line = &mut self.lines[way];
        let evicted = line.is_valid().then_some(line.tag);
        line.tag = tag;
        line.state = LineState::Valid;
        evicted
    }

    /// Clear every slot whose tag matches, valid or not.
    /// Returns how many valid lines were dropped.
    pub fn invalidate_tag(&mut self, tag: Tag) -> usize {
        let mut dropped = 0;
        for line in self.lines.iter_mut().filter(|line| line.tag == tag) {
            dropped += usize::from(line.is_valid());
            *line = CacheLine::default();
        }
        dropped
    }

    pub fn resident_tags(&self) -> Vec<Tag> {
        self.lines
            .iter()
            .filter(|line| line.is_valid())
            .map(|line| line.tag)
            .collect()
    }
}
