//! Local APIC Emulation
//!
//! One per vCPU. Holds the IRR/ISR/TMR bitmaps, the in-service priority
//! stack, the task/processor priority logic, the local vector table, and
//! the APIC timer. MMIO base: 0xFEE0_0000 (relocatable via IA32_APIC_BASE).
//!
//! Invariant: the set of vectors on the in-service stack always equals
//! the set bits in ISR, with strictly increasing priority bottom to top.
//! A mismatch is an engine bug and panics.

use crate::cpu::msr::apic_base;
use crate::memory::Gpa;

/// LAPIC register offsets
pub mod reg {
    pub const ID: usize = 0x020;
    pub const VERSION: usize = 0x030;
    pub const TPR: usize = 0x080;
    pub const APR: usize = 0x090;
    pub const PPR: usize = 0x0A0;
    pub const EOI: usize = 0x0B0;
    pub const LDR: usize = 0x0D0;
    pub const DFR: usize = 0x0E0;
    pub const SVR: usize = 0x0F0;
    pub const ISR_BASE: usize = 0x100;
    pub const TMR_BASE: usize = 0x180;
    pub const IRR_BASE: usize = 0x200;
    pub const ESR: usize = 0x280;
    pub const ICR_LOW: usize = 0x300;
    pub const ICR_HIGH: usize = 0x310;
    pub const TIMER_LVT: usize = 0x320;
    pub const THERMAL_LVT: usize = 0x330;
    pub const PERF_LVT: usize = 0x340;
    pub const LINT0_LVT: usize = 0x350;
    pub const LINT1_LVT: usize = 0x360;
    pub const ERROR_LVT: usize = 0x370;
    pub const TIMER_ICR: usize = 0x380;
    pub const TIMER_CCR: usize = 0x390;
    pub const TIMER_DCR: usize = 0x3E0;
}

/// LVT entry bits
pub mod lvt {
    pub const VECTOR_MASK: u32 = 0xFF;
    pub const DELIVERY_MODE_MASK: u32 = 0x700;
    pub const DELIVERY_MODE_FIXED: u32 = 0x000;
    pub const DELIVERY_MODE_NMI: u32 = 0x400;
    pub const DELIVERY_MODE_EXTINT: u32 = 0x700;
    pub const MASKED: u32 = 0x10000;
    pub const TIMER_PERIODIC: u32 = 0x20000;
}

/// ICR fields
pub mod icr {
    pub const VECTOR_MASK: u64 = 0xFF;
    pub const MODE_MASK: u64 = 0x700;
    pub const MODE_FIXED: u64 = 0x000;
    pub const MODE_NMI: u64 = 0x400;
    pub const MODE_INIT: u64 = 0x500;
    pub const MODE_STARTUP: u64 = 0x600;
    pub const LEVEL_ASSERT: u64 = 1 << 14;
    pub const SHORTHAND_MASK: u64 = 3 << 18;
    pub const SHORTHAND_SELF: u64 = 1 << 18;
    pub const SHORTHAND_ALL_INCL: u64 = 2 << 18;
    pub const SHORTHAND_ALL_EXCL: u64 = 3 << 18;
    pub const DEST_SHIFT: u64 = 56;
}

/// ESR bits
pub mod esr {
    pub const SEND_ILLEGAL_VECTOR: u32 = 1 << 5;
    pub const RECEIVE_ILLEGAL_VECTOR: u32 = 1 << 6;
}

/// Outbound IPI decoded from an ICR write, routed by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiRequest {
    pub target: IpiTarget,
    pub kind: IpiKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    /// Physical destination APIC id
    Apic(u32),
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    Fixed { vector: u8 },
    Nmi,
    Init,
    Startup { vector: u8 },
}

/// Local delivery decoded from an LVT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvtDelivery {
    /// Interrupt latched in IRR; injection pipeline will pick it up
    Fixed,
    /// Caller must raise NMI on the owning vCPU
    Nmi,
    /// Caller must raise the ExtINT line on the owning vCPU
    ExtInt,
    /// Entry masked; nothing delivered
    Masked,
}

/// Local vector table entries addressable by `trigger_lvt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvtEntry {
    Timer,
    Thermal,
    Perf,
    Lint0,
    Lint1,
    Error,
}

/// Local APIC, one per vCPU.
pub struct LocalApic {
    id: u32,
    apic_base: u64,
    tpr: u32,
    svr: u32,
    ldr: u32,
    dfr: u32,
    esr: u32,
    /// Errors accumulated since the last ESR write
    esr_pending: u32,
    icr: u64,

    irr: [u32; 8],
    isr: [u32; 8],
    tmr: [u32; 8],
    /// In-service vectors, strictly increasing priority bottom to top
    isrvec_stk: Vec<u8>,

    lvt_timer: u32,
    lvt_thermal: u32,
    lvt_perf: u32,
    lvt_lint0: u32,
    lvt_lint1: u32,
    lvt_error: u32,

    timer_initial: u32,
    timer_current: u32,
    timer_dcr: u32,
    timer_residue: u64,
}

impl LocalApic {
    pub const DEFAULT_BASE: Gpa = 0xFEE0_0000;
    pub const SIZE: u64 = 0x1000;
    /// Version 0x14, 6 LVT entries (max index 5)
    const VERSION: u32 = 0x0005_0014;

    pub fn new(id: u32) -> Self {
        let mut apic = Self {
            id,
            apic_base: 0,
            tpr: 0,
            svr: 0,
            ldr: 0,
            dfr: 0,
            esr: 0,
            esr_pending: 0,
            icr: 0,
            irr: [0; 8],
            isr: [0; 8],
            tmr: [0; 8],
            isrvec_stk: Vec::new(),
            lvt_timer: 0,
            lvt_thermal: 0,
            lvt_perf: 0,
            lvt_lint0: 0,
            lvt_lint1: 0,
            lvt_error: 0,
            timer_initial: 0,
            timer_current: 0,
            timer_dcr: 0,
            timer_residue: 0,
        };
        apic.reset();
        apic
    }

    pub fn reset(&mut self) {
        let id = self.id;
        *self = Self {
            id,
            apic_base: Self::DEFAULT_BASE
                | apic_base::ENABLED
                | if id == 0 { apic_base::BSP } else { 0 },
            tpr: 0,
            // Software-enabled out of reset; the guest (or control
            // layer) clears the SVR enable bit to mask the APIC.
            svr: 0x1FF,
            ldr: 0,
            dfr: 0xFFFF_FFFF,
            esr: 0,
            esr_pending: 0,
            icr: 0,
            irr: [0; 8],
            isr: [0; 8],
            tmr: [0; 8],
            isrvec_stk: Vec::new(),
            lvt_timer: lvt::MASKED,
            lvt_thermal: lvt::MASKED,
            lvt_perf: lvt::MASKED,
            lvt_lint0: lvt::MASKED,
            lvt_lint1: lvt::MASKED,
            lvt_error: lvt::MASKED,
            timer_initial: 0,
            timer_current: 0,
            timer_dcr: 0,
            timer_residue: 0,
        };
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mmio_base(&self) -> Gpa {
        self.apic_base & apic_base::ADDR_MASK
    }

    pub fn apic_base_msr(&self) -> u64 {
        self.apic_base
    }

    pub fn set_apic_base_msr(&mut self, value: u64) {
        self.apic_base = value & (apic_base::ADDR_MASK | apic_base::ENABLED | apic_base::BSP);
    }

    fn software_enabled(&self) -> bool {
        self.apic_base & apic_base::ENABLED != 0 && self.svr & 0x100 != 0
    }

    // ------------------------------------------------------------------
    // Priority logic
    // ------------------------------------------------------------------

    fn vec_prio(vector: u8) -> u8 {
        vector >> 4
    }

    /// Processor priority: max of TPR and the highest in-service class.
    pub fn ppr(&self) -> u8 {
        let isr_prio = self
            .isrvec_stk
            .last()
            .map(|&v| Self::vec_prio(v) << 4)
            .unwrap_or(0);
        let tpr = (self.tpr & 0xFF) as u8;
        if Self::vec_prio(tpr) >= Self::vec_prio(isr_prio) {
            tpr
        } else {
            isr_prio
        }
    }

    fn highest_irr(&self) -> Option<u8> {
        for word in (0..8).rev() {
            let bits = self.irr[word];
            if bits != 0 {
                let bit = 31 - bits.leading_zeros();
                return Some((word as u32 * 32 + bit) as u8);
            }
        }
        None
    }

    /// Highest-priority deliverable vector: IRR masked by the processor
    /// priority. `None` when nothing beats PPR.
    pub fn pending_vector(&self) -> Option<u8> {
        if !self.software_enabled() {
            return None;
        }
        let vec = self.highest_irr()?;
        if Self::vec_prio(vec) > Self::vec_prio(self.ppr()) {
            Some(vec)
        } else {
            None
        }
    }

    /// Move `vector` from IRR to ISR and push it in service. Must only
    /// be called with the vector `pending_vector` reported.
    pub fn accept(&mut self, vector: u8) {
        let word = (vector / 32) as usize;
        let bit = 1u32 << (vector % 32);
        assert!(self.irr[word] & bit != 0, "lapic: accepting vector {:#x} not in IRR", vector);

        self.irr[word] &= !bit;
        self.isr[word] |= bit;
        if let Some(&top) = self.isrvec_stk.last() {
            assert!(
                Self::vec_prio(vector) > Self::vec_prio(top),
                "lapic: in-service stack priority order violated ({:#x} after {:#x})",
                vector,
                top
            );
        }
        self.isrvec_stk.push(vector);
        self.check_isr_integrity();
    }

    /// End-of-interrupt: retire the highest in-service vector.
    /// Returns the vector and whether it was level-triggered (the VM
    /// forwards level EOIs to the I/O APIC).
    pub fn eoi(&mut self) -> Option<(u8, bool)> {
        let vector = self.isrvec_stk.pop()?;
        let word = (vector / 32) as usize;
        let bit = 1u32 << (vector % 32);
        assert!(self.isr[word] & bit != 0, "lapic: EOI for vector {:#x} not in ISR", vector);
        self.isr[word] &= !bit;
        let level = self.tmr[word] & bit != 0;
        self.tmr[word] &= !bit;
        self.check_isr_integrity();
        Some((vector, level))
    }

    /// The stack and ISR must describe the same set, ordered by priority.
    fn check_isr_integrity(&self) {
        let isr_count: u32 = self.isr.iter().map(|w| w.count_ones()).sum();
        assert_eq!(
            isr_count as usize,
            self.isrvec_stk.len(),
            "lapic: ISR population does not match in-service stack"
        );
        let mut last_prio: Option<u8> = None;
        for &vec in &self.isrvec_stk {
            let word = (vec / 32) as usize;
            let bit = 1u32 << (vec % 32);
            assert!(self.isr[word] & bit != 0, "lapic: stack vector {:#x} missing from ISR", vec);
            if let Some(p) = last_prio {
                assert!(Self::vec_prio(vec) > p, "lapic: stack priorities not increasing");
            }
            last_prio = Some(Self::vec_prio(vec));
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Latch a fixed interrupt. Returns false (and records an ESR error)
    /// for illegal vectors or a disabled APIC.
    pub fn fire(&mut self, vector: u8, level: bool) -> bool {
        if vector < 16 {
            self.esr_pending |= esr::RECEIVE_ILLEGAL_VECTOR;
            return false;
        }
        if !self.software_enabled() {
            return false;
        }
        let word = (vector / 32) as usize;
        let bit = 1u32 << (vector % 32);
        self.irr[word] |= bit;
        if level {
            self.tmr[word] |= bit;
        } else {
            self.tmr[word] &= !bit;
        }
        true
    }

    /// Deliver through a local vector table entry.
    pub fn trigger_lvt(&mut self, entry: LvtEntry) -> LvtDelivery {
        let lvt_val = match entry {
            LvtEntry::Timer => self.lvt_timer,
            LvtEntry::Thermal => self.lvt_thermal,
            LvtEntry::Perf => self.lvt_perf,
            LvtEntry::Lint0 => self.lvt_lint0,
            LvtEntry::Lint1 => self.lvt_lint1,
            LvtEntry::Error => self.lvt_error,
        };
        if lvt_val & lvt::MASKED != 0 {
            return LvtDelivery::Masked;
        }
        match lvt_val & lvt::DELIVERY_MODE_MASK {
            lvt::DELIVERY_MODE_NMI => LvtDelivery::Nmi,
            lvt::DELIVERY_MODE_EXTINT => LvtDelivery::ExtInt,
            _ => {
                let vector = (lvt_val & lvt::VECTOR_MASK) as u8;
                self.fire(vector, false);
                LvtDelivery::Fixed
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    fn timer_divisor(&self) -> u64 {
        match self.timer_dcr & 0x0B {
            0x00 => 2,
            0x01 => 4,
            0x02 => 8,
            0x03 => 16,
            0x08 => 32,
            0x09 => 64,
            0x0A => 128,
            _ => 1,
        }
    }

    /// Advance the timer by `ticks` input clocks. Expiry latches the LVT
    /// timer vector (if unmasked) and re-arms in periodic mode.
    pub fn advance_timer(&mut self, ticks: u64) {
        if self.timer_current == 0 {
            return;
        }
        self.timer_residue += ticks;
        let div = self.timer_divisor();
        let mut counts = self.timer_residue / div;
        self.timer_residue %= div;

        while counts > 0 && self.timer_current > 0 {
            if (self.timer_current as u64) > counts {
                self.timer_current -= counts as u32;
                break;
            }
            counts -= self.timer_current as u64;
            self.trigger_lvt(LvtEntry::Timer);
            if self.lvt_timer & lvt::TIMER_PERIODIC != 0 {
                self.timer_current = self.timer_initial;
                if self.timer_current == 0 {
                    break;
                }
            } else {
                self.timer_current = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Register file
    // ------------------------------------------------------------------

    fn read_register(&mut self, offset: usize) -> u32 {
        match offset {
            reg::ID => self.id << 24,
            reg::VERSION => Self::VERSION,
            reg::TPR => self.tpr,
            reg::APR => 0,
            reg::PPR => self.ppr() as u32,
            reg::LDR => self.ldr,
            reg::DFR => self.dfr,
            reg::SVR => self.svr,
            o if (reg::ISR_BASE..reg::ISR_BASE + 0x80).contains(&o) => {
                self.isr[(o - reg::ISR_BASE) / 0x10]
            }
            o if (reg::TMR_BASE..reg::TMR_BASE + 0x80).contains(&o) => {
                self.tmr[(o - reg::TMR_BASE) / 0x10]
            }
            o if (reg::IRR_BASE..reg::IRR_BASE + 0x80).contains(&o) => {
                self.irr[(o - reg::IRR_BASE) / 0x10]
            }
            reg::ESR => self.esr,
            reg::ICR_LOW => self.icr as u32,
            reg::ICR_HIGH => (self.icr >> 32) as u32,
            reg::TIMER_LVT => self.lvt_timer,
            reg::THERMAL_LVT => self.lvt_thermal,
            reg::PERF_LVT => self.lvt_perf,
            reg::LINT0_LVT => self.lvt_lint0,
            reg::LINT1_LVT => self.lvt_lint1,
            reg::ERROR_LVT => self.lvt_error,
            reg::TIMER_ICR => self.timer_initial,
            reg::TIMER_CCR => self.timer_current,
            reg::TIMER_DCR => self.timer_dcr,
            _ => 0,
        }
    }

    /// Register write; an ICR low write may produce an outbound IPI for
    /// the VM to route.
    fn write_register(&mut self, offset: usize, value: u32) -> Option<IpiRequest> {
        match offset {
            reg::TPR => self.tpr = value & 0xFF,
            reg::EOI => {
                // EOI forwarding is driven through LocalApic::eoi() by
                // the dispatcher; MMIO writes land there too.
            }
            reg::LDR => self.ldr = value & 0xFF00_0000,
            reg::DFR => self.dfr = value | 0x0FFF_FFFF,
            reg::SVR => self.svr = value & 0x1FF,
            reg::ESR => {
                self.esr = self.esr_pending;
                self.esr_pending = 0;
            }
            reg::ICR_LOW => {
                self.icr = (self.icr & 0xFFFF_FFFF_0000_0000) | value as u64;
                return self.decode_icr();
            }
            reg::ICR_HIGH => {
                self.icr = (self.icr & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
            }
            reg::TIMER_LVT => self.lvt_timer = value,
            reg::THERMAL_LVT => self.lvt_thermal = value,
            reg::PERF_LVT => self.lvt_perf = value,
            reg::LINT0_LVT => self.lvt_lint0 = value,
            reg::LINT1_LVT => self.lvt_lint1 = value,
            reg::ERROR_LVT => self.lvt_error = value,
            reg::TIMER_ICR => {
                self.timer_initial = value;
                self.timer_current = value;
                self.timer_residue = 0;
            }
            reg::TIMER_DCR => self.timer_dcr = value & 0x0B,
            _ => {}
        }
        None
    }

    fn decode_icr(&mut self) -> Option<IpiRequest> {
        let vector = (self.icr & icr::VECTOR_MASK) as u8;
        let kind = match self.icr & icr::MODE_MASK {
            icr::MODE_NMI => IpiKind::Nmi,
            icr::MODE_INIT => IpiKind::Init,
            icr::MODE_STARTUP => IpiKind::Startup { vector },
            _ => {
                if vector < 16 {
                    self.esr_pending |= esr::SEND_ILLEGAL_VECTOR;
                    return None;
                }
                IpiKind::Fixed { vector }
            }
        };
        let target = match self.icr & icr::SHORTHAND_MASK {
            icr::SHORTHAND_SELF => IpiTarget::SelfOnly,
            icr::SHORTHAND_ALL_INCL => IpiTarget::AllIncludingSelf,
            icr::SHORTHAND_ALL_EXCL => IpiTarget::AllExcludingSelf,
            _ => IpiTarget::Apic(((self.icr >> icr::DEST_SHIFT) & 0xFF) as u32),
        };
        Some(IpiRequest { target, kind })
    }

    // ------------------------------------------------------------------
    // MMIO
    // ------------------------------------------------------------------

    pub fn handles(&self, gpa: Gpa) -> bool {
        gpa >= self.mmio_base() && gpa < self.mmio_base() + Self::SIZE
    }

    pub fn mmio_read(&mut self, gpa: Gpa) -> u32 {
        let offset = (gpa - self.mmio_base()) as usize;
        self.read_register(offset)
    }

    pub fn mmio_write(&mut self, gpa: Gpa, value: u32) -> Option<IpiRequest> {
        let offset = (gpa - self.mmio_base()) as usize;
        self.write_register(offset, value)
    }

    /// True if an EOI MMIO write landed at this offset; the dispatcher
    /// routes those through `eoi()` for I/O APIC forwarding.
    pub fn is_eoi_offset(&self, gpa: Gpa) -> bool {
        self.handles(gpa) && (gpa - self.mmio_base()) as usize == reg::EOI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_lapic() -> LocalApic {
        let mut apic = LocalApic::new(0);
        apic.write_register(reg::SVR, 0x1FF);
        apic
    }

    #[test]
    fn test_fire_and_pending() {
        let mut apic = enabled_lapic();
        assert!(apic.fire(0x30, false));
        assert_eq!(apic.pending_vector(), Some(0x30));
    }

    #[test]
    fn test_illegal_vector_sets_esr() {
        let mut apic = enabled_lapic();
        assert!(!apic.fire(0x5, false));
        apic.write_register(reg::ESR, 0);
        assert_eq!(apic.read_register(reg::ESR) & esr::RECEIVE_ILLEGAL_VECTOR, esr::RECEIVE_ILLEGAL_VECTOR);
    }

    #[test]
    fn test_tpr_masks_delivery() {
        let mut apic = enabled_lapic();
        apic.fire(0x30, false);
        apic.write_register(reg::TPR, 0x40);
        assert_eq!(apic.pending_vector(), None);
        apic.write_register(reg::TPR, 0x20);
        assert_eq!(apic.pending_vector(), Some(0x30));
    }

    #[test]
    fn test_accept_eoi_cycle() {
        let mut apic = enabled_lapic();
        apic.fire(0x30, false);
        apic.accept(0x30);
        assert_eq!(apic.pending_vector(), None, "in-service masks same priority");
        assert_eq!(apic.read_register(reg::PPR), 0x30);
        assert_eq!(apic.eoi(), Some((0x30, false)));
        assert_eq!(apic.read_register(reg::PPR), 0);
    }

    #[test]
    fn test_nested_service_stack() {
        let mut apic = enabled_lapic();
        apic.fire(0x22, false);
        apic.accept(0x22);
        // Higher priority arrives while 0x22 is in service
        apic.fire(0x81, false);
        assert_eq!(apic.pending_vector(), Some(0x81));
        apic.accept(0x81);
        // Lower priority latched but not deliverable
        apic.fire(0x35, false);
        assert_eq!(apic.pending_vector(), None);
        // Unwind in LIFO order
        assert_eq!(apic.eoi(), Some((0x81, false)));
        assert_eq!(apic.pending_vector(), Some(0x35));
    }

    #[test]
    fn test_stack_matches_isr_property() {
        // Random fire/accept/eoi sequences keep the invariant; the
        // integrity check inside accept/eoi panics on violation.
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut apic = enabled_lapic();
        for _ in 0..2000 {
            match rng.gen_range(0..3) {
                0 => {
                    let v = rng.gen_range(0x20..=0xFE) as u8;
                    apic.fire(v, rng.gen_bool(0.3));
                }
                1 => {
                    if let Some(v) = apic.pending_vector() {
                        apic.accept(v);
                    }
                }
                _ => {
                    let _ = apic.eoi();
                }
            }
        }
    }

    #[test]
    fn test_level_tmr_reported_on_eoi() {
        let mut apic = enabled_lapic();
        apic.fire(0x44, true);
        apic.accept(0x44);
        assert_eq!(apic.eoi(), Some((0x44, true)));
    }

    #[test]
    fn test_icr_fixed_ipi() {
        let mut apic = enabled_lapic();
        apic.write_register(reg::ICR_HIGH, 3 << 24);
        let req = apic.write_register(reg::ICR_LOW, 0x45 | icr::LEVEL_ASSERT as u32);
        assert_eq!(
            req,
            Some(IpiRequest { target: IpiTarget::Apic(3), kind: IpiKind::Fixed { vector: 0x45 } })
        );
    }

    #[test]
    fn test_icr_shorthands() {
        let mut apic = enabled_lapic();
        let req = apic.write_register(reg::ICR_LOW, (icr::SHORTHAND_ALL_EXCL as u32) | 0x50);
        assert_eq!(req.unwrap().target, IpiTarget::AllExcludingSelf);
        let req = apic.write_register(reg::ICR_LOW, (icr::MODE_NMI | icr::SHORTHAND_ALL_EXCL) as u32);
        assert_eq!(req.unwrap().kind, IpiKind::Nmi);
    }

    #[test]
    fn test_timer_oneshot() {
        let mut apic = enabled_lapic();
        apic.write_register(reg::TIMER_LVT, 0xE0); // unmasked, one-shot
        apic.write_register(reg::TIMER_DCR, 0x0B); // divide by 1
        apic.write_register(reg::TIMER_ICR, 100);
        apic.advance_timer(99);
        assert_eq!(apic.pending_vector(), None);
        apic.advance_timer(1);
        assert_eq!(apic.pending_vector(), Some(0xE0));
        assert_eq!(apic.read_register(reg::TIMER_CCR), 0);
    }

    #[test]
    fn test_timer_periodic_rearms() {
        let mut apic = enabled_lapic();
        apic.write_register(reg::TIMER_LVT, 0xE0 | lvt::TIMER_PERIODIC);
        apic.write_register(reg::TIMER_DCR, 0x0B);
        apic.write_register(reg::TIMER_ICR, 10);
        apic.advance_timer(10);
        assert_eq!(apic.pending_vector(), Some(0xE0));
        assert_eq!(apic.read_register(reg::TIMER_CCR), 10);
        // Accept and expire again
        apic.accept(0xE0);
        apic.eoi();
        apic.advance_timer(10);
        assert_eq!(apic.pending_vector(), Some(0xE0));
    }

    #[test]
    fn test_masked_timer_suppressed() {
        let mut apic = enabled_lapic();
        apic.write_register(reg::TIMER_LVT, 0xE0 | lvt::MASKED);
        apic.write_register(reg::TIMER_DCR, 0x0B);
        apic.write_register(reg::TIMER_ICR, 5);
        apic.advance_timer(5);
        assert_eq!(apic.pending_vector(), None);
    }

    #[test]
    fn test_disabled_apic_drops_interrupts() {
        let mut apic = LocalApic::new(0);
        apic.write_register(reg::SVR, 0xFF); // software-disabled
        assert!(!apic.fire(0x30, false));
        assert_eq!(apic.pending_vector(), None);
    }
}
