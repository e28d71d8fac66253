//! TLB Consistency Domain
//!
//! Hardware tags TLB entries with an ASID (AMD) or VPID (Intel) so guest
//! translations can survive world switches. Tags are a per-host-CPU
//! resource handed out by a process-wide registry; each vCPU caches the
//! tag it last ran with plus the nested-page-table generation it last
//! observed.
//!
//! The two-axis check at resume time:
//! - tag generation differs from the host CPU's current generation
//!   (first run, migration, or rollover) → allocate a fresh tag;
//! - only the mapping generation differs → a selective flush of that
//!   tag's entries is enough.
//!
//! Under-flushing is never acceptable; over-flushing is a performance
//! bug only.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::Arc;

/// Generation sentinel forcing fresh allocation.
pub const TAG_GEN_INVALID: u64 = 0;

/// First usable tag number. Tag 0 is reserved for the host.
const TAG_NUM_MIN: u32 = 1;

/// A TLB tag as cached by a vCPU: (host-CPU generation, tag number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTag {
    pub gen: u64,
    pub num: u32,
}

impl CpuTag {
    pub const INVALID: CpuTag = CpuTag { gen: TAG_GEN_INVALID, num: 0 };

    pub fn is_valid(&self) -> bool {
        self.gen != TAG_GEN_INVALID
    }
}

/// Flush the hardware must perform before the next entry with the
/// decided tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbOp {
    /// Translations are still coherent
    None,
    /// Flush only entries carrying this tag
    FlushTag,
    /// Flush the entire TLB (no selective flush support)
    FlushAll,
}

/// Outcome of the resume-time check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbDecision {
    pub tag: CpuTag,
    pub op: TlbOp,
    pub fresh: bool,
}

struct HostCpuTlb {
    gen: u64,
    next_num: u32,
}

/// Process-wide per-host-CPU tag state.
pub struct HostCpuRegistry {
    cpus: Mutex<Vec<HostCpuTlb>>,
    max_tag: u32,
}

impl HostCpuRegistry {
    /// `ncpus` host CPUs, tags in `TAG_NUM_MIN..=max_tag` per CPU.
    pub fn new(ncpus: usize, max_tag: u32) -> Self {
        assert!(max_tag >= TAG_NUM_MIN);
        let cpus = (0..ncpus)
            .map(|_| HostCpuTlb { gen: 1, next_num: TAG_NUM_MIN })
            .collect();
        Self { cpus: Mutex::new(cpus), max_tag }
    }

    pub fn ncpus(&self) -> usize {
        self.cpus.lock().len()
    }

    /// Resume-time tag check for one vCPU landing on `hostcpu`.
    ///
    /// `cached` is the vCPU's cached tag (INVALID after migration or on
    /// first run), `seen_gen`/`cur_gen` the nested-page-table generation
    /// it last observed vs. the current one, and `flush_by_tag` whether
    /// the hardware can flush a single tag's entries.
    pub fn activate(
        &self,
        hostcpu: usize,
        cached: CpuTag,
        seen_gen: u64,
        cur_gen: u64,
        flush_by_tag: bool,
    ) -> TlbDecision {
        let mut cpus = self.cpus.lock();
        let cpu = &mut cpus[hostcpu];

        let mut alloc = !cached.is_valid() || cached.gen != cpu.gen;
        let mut op = TlbOp::None;

        if !alloc && seen_gen != cur_gen {
            // Same tag, stale mappings: selective flush if the hardware
            // can do it, otherwise retire the tag.
            if flush_by_tag {
                op = TlbOp::FlushTag;
            } else {
                alloc = true;
            }
        }

        if !alloc {
            return TlbDecision { tag: cached, op, fresh: false };
        }

        if cpu.next_num > self.max_tag {
            // Rollover: a new generation invalidates every tag handed
            // out on this CPU so reuse cannot alias stale entries.
            cpu.gen += 1;
            cpu.next_num = TAG_NUM_MIN;
            log::debug!("tlb: hostcpu {} tag generation rolled to {}", hostcpu, cpu.gen);
        }
        let tag = CpuTag { gen: cpu.gen, num: cpu.next_num };
        cpu.next_num += 1;

        // A reused tag number may still have entries from a previous
        // generation in the TLB.
        op = if flush_by_tag { TlbOp::FlushTag } else { TlbOp::FlushAll };
        TlbDecision { tag, op, fresh: true }
    }
}

lazy_static! {
    static ref HOST_REGISTRY: Arc<HostCpuRegistry> = {
        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        // SVM exposes at least 8 ASID bits on all shipping parts.
        Arc::new(HostCpuRegistry::new(ncpus, 255))
    };
}

/// Process-wide registry instance.
pub fn host_registry() -> Arc<HostCpuRegistry> {
    HOST_REGISTRY.clone()
}
