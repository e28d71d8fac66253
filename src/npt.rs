//! Nested Page Tables
//!
//! Per-VM 4-level radix map from guest-physical to host-physical
//! addresses. Interior nodes live in an arena owned exclusively by the
//! table and are addressed by index, never by raw physical pointer.
//! Leaf entries use the architecture's encoding (EPT on Intel, long-mode
//! PTE format on AMD) so the bit layout the hardware would walk is what
//! the tests see.

use bitflags::bitflags;
use x86_64::structures::paging::PageTableFlags as PteFlags;

use crate::memory::{Gpa, Hpa, PAGE_SIZE, PAGE_SIZE_1G, PAGE_SIZE_2M};

const ENTRIES_PER_NODE: usize = 512;
const LEVELS: usize = 4;
/// Index bits covered by one level
const LEVEL_SHIFT: u64 = 9;
const NODE_IDX_NONE: u32 = u32::MAX;

bitflags! {
    /// Architecture-independent access protection for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    pub const RWX: Prot = Prot::READ.union(Prot::WRITE).union(Prot::EXEC);
}

/// Leaf/table entry encoding, fixed per backend at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// Intel EPT: R/W/X in bits 0..2, memory type in bits 3..5
    Ept,
    /// AMD nested paging: standard long-mode PTE (P/RW/US/NX)
    Npt,
}

/// EPT entry bits
mod ept {
    pub const READ: u64 = 1 << 0;
    pub const WRITE: u64 = 1 << 1;
    pub const EXEC: u64 = 1 << 2;
    /// Write-back memory type in bits 5:3
    pub const MT_WB: u64 = 6 << 3;
    pub const LARGE: u64 = 1 << 7;
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Hardware page sizes usable for leaf entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCaps {
    pub superpage_2m: bool,
    pub superpage_1g: bool,
}

impl Default for PageCaps {
    fn default() -> Self {
        Self { superpage_2m: true, superpage_1g: true }
    }
}

#[derive(Clone)]
struct Node {
    entries: Box<[u64; ENTRIES_PER_NODE]>,
    /// Arena index of the child table per slot; NODE_IDX_NONE for leaves
    /// and absent entries
    children: Box<[u32; ENTRIES_PER_NODE]>,
}

impl Node {
    fn new() -> Self {
        Self {
            entries: Box::new([0; ENTRIES_PER_NODE]),
            children: Box::new([NODE_IDX_NONE; ENTRIES_PER_NODE]),
        }
    }
}

/// A resolved translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub hpa: Hpa,
    pub prot: Prot,
    pub page_size: u64,
}

/// Per-VM nested page table.
pub struct NestedPageTable {
    format: TableFormat,
    caps: PageCaps,
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    root: u32,
}

impl NestedPageTable {
    pub fn new(format: TableFormat, caps: PageCaps) -> Self {
        let mut table = Self {
            format,
            caps,
            nodes: Vec::new(),
            free: Vec::new(),
            root: 0,
        };
        table.root = table.alloc_node();
        table
    }

    pub fn format(&self) -> TableFormat {
        self.format
    }

    /// Opaque root pointer in the form the hardware control block wants
    /// (node index shifted into the address field).
    pub fn root_ptr(&self) -> u64 {
        (self.root as u64) << 12
    }

    fn alloc_node(&mut self) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(Node::new());
            idx
        } else {
            self.nodes.push(Some(Node::new()));
            (self.nodes.len() - 1) as u32
        }
    }

    fn free_node(&mut self, idx: u32) {
        self.nodes[idx as usize] = None;
        self.free.push(idx);
    }

    fn encode_leaf(&self, hpa: Hpa, prot: Prot, large: bool) -> u64 {
        match self.format {
            TableFormat::Ept => {
                let mut e = (hpa & ADDR_MASK) | ept::MT_WB;
                if prot.contains(Prot::READ) {
                    e |= ept::READ;
                }
                if prot.contains(Prot::WRITE) {
                    e |= ept::WRITE;
                }
                if prot.contains(Prot::EXEC) {
                    e |= ept::EXEC;
                }
                if large {
                    e |= ept::LARGE;
                }
                e
            }
            TableFormat::Npt => {
                // Nested paging walks guest accesses as user-mode
                let mut f = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
                if prot.contains(Prot::WRITE) {
                    f |= PteFlags::WRITABLE;
                }
                if !prot.contains(Prot::EXEC) {
                    f |= PteFlags::NO_EXECUTE;
                }
                if large {
                    f |= PteFlags::HUGE_PAGE;
                }
                (hpa & ADDR_MASK) | f.bits()
            }
        }
    }

    fn decode_prot(&self, entry: u64) -> Prot {
        match self.format {
            TableFormat::Ept => {
                let mut p = Prot::empty();
                if entry & ept::READ != 0 {
                    p |= Prot::READ;
                }
                if entry & ept::WRITE != 0 {
                    p |= Prot::WRITE;
                }
                if entry & ept::EXEC != 0 {
                    p |= Prot::EXEC;
                }
                p
            }
            TableFormat::Npt => {
                let f = PteFlags::from_bits_truncate(entry);
                let mut p = Prot::READ;
                if f.contains(PteFlags::WRITABLE) {
                    p |= Prot::WRITE;
                }
                if !f.contains(PteFlags::NO_EXECUTE) {
                    p |= Prot::EXEC;
                }
                p
            }
        }
    }

    fn entry_present(&self, entry: u64) -> bool {
        match self.format {
            TableFormat::Ept => entry & (ept::READ | ept::WRITE | ept::EXEC) != 0,
            TableFormat::Npt => entry & PteFlags::PRESENT.bits() != 0,
        }
    }

    fn table_entry(&self) -> u64 {
        // Interior entries allow everything; permissions live in leaves.
        match self.format {
            TableFormat::Ept => ept::READ | ept::WRITE | ept::EXEC,
            TableFormat::Npt => {
                (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER_ACCESSIBLE).bits()
            }
        }
    }

    fn slot(gpa: Gpa, level: usize) -> usize {
        // level 0 is the root (PML4-equivalent)
        let shift = 12 + LEVEL_SHIFT * (LEVELS - 1 - level) as u64;
        ((gpa >> shift) & 0x1FF) as usize
    }

    fn page_size_at(level: usize) -> u64 {
        match level {
            1 => PAGE_SIZE_1G,
            2 => PAGE_SIZE_2M,
            3 => PAGE_SIZE,
            _ => unreachable!("no leaf at level {}", level),
        }
    }

    /// Largest page size usable for this (gpa, hpa, remaining) triple.
    fn pick_page_size(&self, gpa: Gpa, hpa: Hpa, remaining: u64, allow_superpages: bool) -> u64 {
        if allow_superpages {
            if self.caps.superpage_1g
                && gpa % PAGE_SIZE_1G == 0
                && hpa % PAGE_SIZE_1G == 0
                && remaining >= PAGE_SIZE_1G
            {
                return PAGE_SIZE_1G;
            }
            if self.caps.superpage_2m
                && gpa % PAGE_SIZE_2M == 0
                && hpa % PAGE_SIZE_2M == 0
                && remaining >= PAGE_SIZE_2M
            {
                return PAGE_SIZE_2M;
            }
        }
        PAGE_SIZE
    }

    fn leaf_level(page_size: u64) -> usize {
        match page_size {
            PAGE_SIZE_1G => 1,
            PAGE_SIZE_2M => 2,
            _ => 3,
        }
    }

    /// Install translations covering `[gpa, gpa+len)` → `[hpa, hpa+len)`.
    ///
    /// Panics if any page in the range is already mapped: re-mapping an
    /// occupied GPA is a caller bug, not a recoverable condition.
    pub fn map(&mut self, mut gpa: Gpa, mut hpa: Hpa, mut len: u64, prot: Prot, allow_superpages: bool) {
        assert!(gpa % PAGE_SIZE == 0 && hpa % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        while len > 0 {
            let size = self.pick_page_size(gpa, hpa, len, allow_superpages);
            self.map_one(gpa, hpa, size, prot);
            gpa += size;
            hpa += size;
            len -= size;
        }
    }

    fn map_one(&mut self, gpa: Gpa, hpa: Hpa, page_size: u64, prot: Prot) {
        let leaf_level = Self::leaf_level(page_size);
        let mut node = self.root;
        for level in 0..leaf_level {
            let slot = Self::slot(gpa, level);
            let cur = self.nodes[node as usize].as_ref().unwrap();
            if self.entry_present(cur.entries[slot]) {
                let child = cur.children[slot];
                if child == NODE_IDX_NONE {
                    // Existing superpage leaf in the middle of the walk
                    panic!("npt: remap of gpa {:#x} (superpage leaf at level {})", gpa, level);
                }
                node = child;
            } else {
                let child = self.alloc_node();
                let table = self.table_entry();
                let cur = self.nodes[node as usize].as_mut().unwrap();
                cur.entries[slot] = table | ((child as u64) << 12);
                cur.children[slot] = child;
                node = child;
            }
        }
        let slot = Self::slot(gpa, leaf_level);
        let large = page_size != PAGE_SIZE;
        let entry = self.encode_leaf(hpa, prot, large);
        let existing = self.nodes[node as usize].as_ref().unwrap().entries[slot];
        if self.entry_present(existing) {
            panic!("npt: remap of already-mapped gpa {:#x}", gpa);
        }
        let cur = self.nodes[node as usize].as_mut().unwrap();
        cur.entries[slot] = entry;
        cur.children[slot] = NODE_IDX_NONE;
    }

    /// Remove the translations covering `[gpa, gpa+len)`. Absent pages
    /// are skipped; interior tables are left in place (freed only at
    /// teardown, matching hardware behavior of sparse radix trees).
    pub fn unmap(&mut self, mut gpa: Gpa, mut len: u64) {
        assert!(gpa % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        while len > 0 {
            let cleared = self.unmap_one(gpa);
            let step = cleared.max(PAGE_SIZE).min(len);
            gpa += step;
            len = len.saturating_sub(step);
        }
    }

    /// Clear the leaf covering `gpa`; returns the page size cleared
    /// (0 if nothing was mapped there).
    fn unmap_one(&mut self, gpa: Gpa) -> u64 {
        let mut node = self.root;
        for level in 0..LEVELS {
            let slot = Self::slot(gpa, level);
            let cur = self.nodes[node as usize].as_ref().unwrap();
            let entry = cur.entries[slot];
            if !self.entry_present(entry) {
                return 0;
            }
            let child = cur.children[slot];
            if child == NODE_IDX_NONE {
                // Leaf (superpage or 4K at the last level)
                let cur = self.nodes[node as usize].as_mut().unwrap();
                cur.entries[slot] = 0;
                return Self::page_size_at(level.max(1));
            }
            node = child;
        }
        0
    }

    /// Walk to a present leaf; absent entries report unmapped.
    pub fn translate(&self, gpa: Gpa) -> Option<Translation> {
        let mut node = self.root;
        for level in 0..LEVELS {
            let slot = Self::slot(gpa, level);
            let cur = self.nodes[node as usize].as_ref().unwrap();
            let entry = cur.entries[slot];
            if !self.entry_present(entry) {
                return None;
            }
            let child = cur.children[slot];
            if child == NODE_IDX_NONE {
                let page_size = Self::page_size_at(level.max(1));
                let base = entry & ADDR_MASK;
                return Some(Translation {
                    hpa: base | (gpa & (page_size - 1)),
                    prot: self.decode_prot(entry),
                    page_size,
                });
            }
            node = child;
        }
        None
    }

    /// Free every interior node and leaf, leaving an empty root.
    /// Superpage leaves own no child table and are simply cleared.
    pub fn teardown(&mut self) {
        let root = self.root;
        self.teardown_node(root);
        self.nodes[root as usize] = Some(Node::new());
    }

    fn teardown_node(&mut self, idx: u32) {
        let children: Vec<u32> = {
            let node = self.nodes[idx as usize].as_ref().unwrap();
            node.children.iter().copied().filter(|&c| c != NODE_IDX_NONE).collect()
        };
        for child in children {
            self.teardown_node(child);
            self.free_node(child);
        }
    }

    /// Number of live arena nodes (for leak checks in tests).
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

impl Drop for NestedPageTable {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(format: TableFormat) -> NestedPageTable {
        NestedPageTable::new(format, PageCaps::default())
    }

    #[test]
    fn test_map_translate_4k() {
        let mut npt = table(TableFormat::Ept);
        npt.map(0x1000, 0x8000, 0x1000, Prot::RWX, false);
        let t = npt.translate(0x1234).unwrap();
        assert_eq!(t.hpa, 0x8234);
        assert_eq!(t.prot, Prot::RWX);
        assert_eq!(t.page_size, PAGE_SIZE);
        assert!(npt.translate(0x2000).is_none());
    }

    #[test]
    fn test_superpage_selection() {
        // 3 GiB + 4 KiB starting at zero: three 1 GiB leaves + one 4 KiB
        let mut npt = table(TableFormat::Ept);
        npt.map(0, 0, 3 * PAGE_SIZE_1G + PAGE_SIZE, Prot::RWX, true);

        for i in 0..3u64 {
            let t = npt.translate(i * PAGE_SIZE_1G + 0x555).unwrap();
            assert_eq!(t.page_size, PAGE_SIZE_1G, "leaf {} should be 1 GiB", i);
            assert_eq!(t.hpa, i * PAGE_SIZE_1G + 0x555);
        }
        let tail = npt.translate(3 * PAGE_SIZE_1G).unwrap();
        assert_eq!(tail.page_size, PAGE_SIZE);
    }

    #[test]
    fn test_superpage_requires_joint_alignment() {
        // GPA aligned to 2 MiB but HPA only to 4 KiB: no superpage allowed
        let mut npt = table(TableFormat::Ept);
        npt.map(PAGE_SIZE_2M, 0x1000, PAGE_SIZE_2M, Prot::RWX, true);
        let t = npt.translate(PAGE_SIZE_2M).unwrap();
        assert_eq!(t.page_size, PAGE_SIZE);
    }

    #[test]
    fn test_no_superpages_without_cap() {
        let mut npt = NestedPageTable::new(
            TableFormat::Ept,
            PageCaps { superpage_2m: false, superpage_1g: false },
        );
        npt.map(0, 0, PAGE_SIZE_2M, Prot::RWX, true);
        assert_eq!(npt.translate(0).unwrap().page_size, PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn test_remap_panics() {
        let mut npt = table(TableFormat::Ept);
        npt.map(0x1000, 0x8000, 0x1000, Prot::RWX, false);
        npt.map(0x1000, 0x9000, 0x1000, Prot::RWX, false);
    }

    #[test]
    fn test_unmap() {
        let mut npt = table(TableFormat::Npt);
        npt.map(0x0, 0x10_0000, 0x3000, Prot::RWX, false);
        npt.unmap(0x1000, 0x1000);
        assert!(npt.translate(0x0).is_some());
        assert!(npt.translate(0x1000).is_none());
        assert!(npt.translate(0x2000).is_some());
        // Unmapped page may be mapped again
        npt.map(0x1000, 0x20_0000, 0x1000, Prot::READ, false);
        let t = npt.translate(0x1000).unwrap();
        assert_eq!(t.hpa, 0x20_0000);
        assert_eq!(t.prot, Prot::READ);
    }

    #[test]
    fn test_npt_encoding() {
        let mut npt = table(TableFormat::Npt);
        npt.map(0x0, 0x4000, 0x1000, Prot::READ | Prot::WRITE, false);
        let t = npt.translate(0x0).unwrap();
        // NPT read implies present; no exec means NX set, decoded back out
        assert!(t.prot.contains(Prot::READ | Prot::WRITE));
        assert!(!t.prot.contains(Prot::EXEC));
    }

    #[test]
    fn test_teardown_frees_interior_nodes() {
        let mut npt = table(TableFormat::Ept);
        npt.map(0x0, 0x0, 0x1000, Prot::RWX, false);
        npt.map(0x4000_0000, 0x0, 0x1000, Prot::RWX, false);
        assert!(npt.node_count() > 1);
        npt.teardown();
        assert_eq!(npt.node_count(), 1);
        assert!(npt.translate(0x0).is_none());
    }

    #[test]
    fn test_superpage_leaf_owns_no_child() {
        let mut npt = table(TableFormat::Ept);
        npt.map(0, 0, PAGE_SIZE_1G, Prot::RWX, true);
        let nodes_with_superpage = npt.node_count();
        npt.teardown();
        // Only interior nodes above the superpage leaf existed
        assert!(nodes_with_superpage <= 2);
        assert_eq!(npt.node_count(), 1);
    }
}
