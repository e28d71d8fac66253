//! Guest Physical Address Space
//!
//! The engine tracks guest memory as an ordered list of non-overlapping
//! segments. Segment contents and host backing pages are owned by the
//! memory-map manager outside the engine; the engine only needs to answer
//! "is this GPA RAM?" when classifying a nested-page fault, and to hand
//! out the host-physical ranges the caller registered.

use std::fmt;

/// Page size constants
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
pub const PAGE_SIZE_1G: u64 = 1024 * 1024 * 1024;

/// Guest physical address
pub type Gpa = u64;
/// Host physical address
pub type Hpa = u64;

/// Memory map errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Segment overlaps an existing segment
    Overlap,
    /// Segment length is zero or not page-aligned
    BadAlignment,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap => write!(f, "segment overlaps existing mapping"),
            Self::BadAlignment => write!(f, "segment not page-aligned"),
        }
    }
}

impl std::error::Error for MemError {}

pub type MemResult<T> = Result<T, MemError>;

/// One guest memory segment: a contiguous GPA range backed by host RAM
/// starting at `hpa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSegment {
    pub gpa: Gpa,
    pub hpa: Hpa,
    pub len: u64,
}

impl MemSegment {
    pub fn new(gpa: Gpa, hpa: Hpa, len: u64) -> Self {
        Self { gpa, hpa, len }
    }

    pub fn end(&self) -> Gpa {
        self.gpa + self.len
    }

    pub fn contains(&self, gpa: Gpa) -> bool {
        gpa >= self.gpa && gpa < self.end()
    }
}

/// Ordered, non-overlapping set of guest memory segments.
#[derive(Debug, Default)]
pub struct GuestMemoryMap {
    segments: Vec<MemSegment>,
}

impl GuestMemoryMap {
    pub fn new() -> Self {
        Self { segments: Vec::new() }
    }

    /// Register a RAM segment. Segments are kept sorted by GPA.
    pub fn insert(&mut self, seg: MemSegment) -> MemResult<()> {
        if seg.len == 0
            || seg.gpa % PAGE_SIZE != 0
            || seg.hpa % PAGE_SIZE != 0
            || seg.len % PAGE_SIZE != 0
        {
            return Err(MemError::BadAlignment);
        }
        if self.segments.iter().any(|s| seg.gpa < s.end() && s.gpa < seg.end()) {
            return Err(MemError::Overlap);
        }
        let pos = self.segments.partition_point(|s| s.gpa < seg.gpa);
        self.segments.insert(pos, seg);
        Ok(())
    }

    /// Remove the segment starting at `gpa`, returning it if present.
    pub fn remove(&mut self, gpa: Gpa) -> Option<MemSegment> {
        let pos = self.segments.iter().position(|s| s.gpa == gpa)?;
        Some(self.segments.remove(pos))
    }

    /// True if `gpa` falls inside a registered RAM segment.
    pub fn is_ram(&self, gpa: Gpa) -> bool {
        self.find(gpa).is_some()
    }

    /// Segment containing `gpa`, if any.
    pub fn find(&self, gpa: Gpa) -> Option<&MemSegment> {
        let idx = self.segments.partition_point(|s| s.end() <= gpa);
        self.segments.get(idx).filter(|s| s.contains(gpa))
    }

    /// Host address backing `gpa`, if RAM.
    pub fn gpa_to_hpa(&self, gpa: Gpa) -> Option<Hpa> {
        self.find(gpa).map(|s| s.hpa + (gpa - s.gpa))
    }

    pub fn segments(&self) -> &[MemSegment] {
        &self.segments
    }

    /// Drop every segment (VM reinit).
    pub fn clear_all(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_ordering() {
        let mut map = GuestMemoryMap::new();
        map.insert(MemSegment::new(0x10_0000, 0x20_0000, 0x1000)).unwrap();
        map.insert(MemSegment::new(0x0, 0x10_0000, 0x1000)).unwrap();
        assert_eq!(map.segments()[0].gpa, 0x0);
        assert_eq!(map.segments()[1].gpa, 0x10_0000);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut map = GuestMemoryMap::new();
        map.insert(MemSegment::new(0x1000, 0x5000, 0x2000)).unwrap();
        assert_eq!(
            map.insert(MemSegment::new(0x2000, 0x9000, 0x1000)),
            Err(MemError::Overlap)
        );
    }

    #[test]
    fn test_alignment_rejected() {
        let mut map = GuestMemoryMap::new();
        assert_eq!(
            map.insert(MemSegment::new(0x800, 0, 0x1000)),
            Err(MemError::BadAlignment)
        );
    }

    #[test]
    fn test_translate() {
        let mut map = GuestMemoryMap::new();
        map.insert(MemSegment::new(0x1000, 0x8000, 0x2000)).unwrap();
        assert_eq!(map.gpa_to_hpa(0x1123), Some(0x8123));
        assert_eq!(map.gpa_to_hpa(0x3000), None);
        assert!(map.is_ram(0x2FFF));
        assert!(!map.is_ram(0xFEE0_0000));
    }
}
