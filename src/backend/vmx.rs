//! Intel VT-x Backend
//!
//! Owns the VMCS model for each vCPU: execution controls, the VM-entry
//! interruption-information field, exit information, and the VPID tag.
//! Interrupt/NMI windows map onto the primary processor-based controls;
//! TLB maintenance maps onto INVVPID/INVEPT.

use bitflags::bitflags;
use parking_lot::Mutex;

use super::{
    BackendError, BackendResult, EntryParams, GuestCtx, HostFeatures, RawExit, RawExitReason,
    VmCap,
};
use crate::cpu::Vcpu;
use crate::events::{EventKind, IntInfo};
use crate::tlb::TlbOp;

/// Basic exit reasons (Intel SDM vol. 3, appendix C)
pub mod exit_reason {
    pub const EXCEPTION_OR_NMI: u32 = 0;
    pub const EXTERNAL_INTERRUPT: u32 = 1;
    pub const INTERRUPT_WINDOW: u32 = 7;
    pub const NMI_WINDOW: u32 = 8;
    pub const CPUID: u32 = 10;
    pub const HLT: u32 = 12;
    pub const VMXON: u32 = 27;
    pub const IO_INSTRUCTION: u32 = 30;
    pub const MSR_READ: u32 = 31;
    pub const MSR_WRITE: u32 = 32;
    pub const INVALID_GUEST_STATE: u32 = 33;
    pub const MWAIT: u32 = 36;
    pub const MONITOR: u32 = 39;
    pub const PAUSE: u32 = 40;
    pub const EPT_VIOLATION: u32 = 48;
    /// Set in the exit reason when VM entry itself failed
    pub const ENTRY_FAILURE: u32 = 1 << 31;
}

bitflags! {
    /// Primary processor-based VM-execution controls (the subset the
    /// engine drives at runtime).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcCtls: u32 {
        const INT_WINDOW_EXITING = 1 << 2;
        const HLT_EXITING = 1 << 7;
        const MWAIT_EXITING = 1 << 10;
        const RDTSC_EXITING = 1 << 12;
        const NMI_WINDOW_EXITING = 1 << 22;
        const PAUSE_EXITING = 1 << 24;
        const USE_MSR_BITMAP = 1 << 28;
        const SECONDARY_CTLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcCtls2: u32 {
        const ENABLE_EPT = 1 << 1;
        const ENABLE_RDTSCP = 1 << 3;
        const ENABLE_VPID = 1 << 5;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRT = 1 << 8;
        const VIRTUAL_INTR_DELIVERY = 1 << 9;
    }
}

/// VM-entry / exit interruption information format.
mod intinfo {
    pub const VALID: u32 = 1 << 31;
    pub const ERRCODE_VALID: u32 = 1 << 11;
    pub const TYPE_SHIFT: u32 = 8;
    pub const TYPE_EXTINT: u32 = 0;
    pub const TYPE_NMI: u32 = 2;
    pub const TYPE_HWEXCEPTION: u32 = 3;
}

/// Encode an event into the VMX interruption-information format
/// (info word, error code).
pub fn encode_intinfo(info: IntInfo) -> (u32, u32) {
    let ty = match info.kind {
        EventKind::ExtInt => intinfo::TYPE_EXTINT,
        EventKind::Nmi => intinfo::TYPE_NMI,
        EventKind::HwException => intinfo::TYPE_HWEXCEPTION,
    };
    let mut word = intinfo::VALID | (ty << intinfo::TYPE_SHIFT) | info.vector as u32;
    let mut err = 0;
    if let Some(e) = info.error_code {
        word |= intinfo::ERRCODE_VALID;
        err = e;
    }
    (word, err)
}

/// Decode the VMX interruption-information format.
pub fn decode_intinfo(word: u32, err: u32) -> Option<IntInfo> {
    if word & intinfo::VALID == 0 {
        return None;
    }
    let kind = match (word >> intinfo::TYPE_SHIFT) & 0x7 {
        intinfo::TYPE_NMI => EventKind::Nmi,
        intinfo::TYPE_HWEXCEPTION => EventKind::HwException,
        _ => EventKind::ExtInt,
    };
    let error_code = (word & intinfo::ERRCODE_VALID != 0).then_some(err);
    Some(IntInfo { kind, vector: (word & 0xFF) as u8, error_code })
}

/// Virtual machine control structure, modeled with typed fields.
#[derive(Debug, Clone)]
pub struct Vmcs {
    pub proc_ctls: ProcCtls,
    pub proc_ctls2: ProcCtls2,
    pub vpid: u16,
    pub ept_pointer: u64,
    pub entry_intr_info: u32,
    pub entry_exception_errcode: u32,
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub guest_physical_addr: u64,
    pub idt_vectoring_info: u32,
    pub idt_vectoring_errcode: u32,
    pub instruction_error: u32,
    pub launched: bool,
}

impl Vmcs {
    fn new() -> Self {
        Self {
            proc_ctls: ProcCtls::HLT_EXITING
                | ProcCtls::MWAIT_EXITING
                | ProcCtls::USE_MSR_BITMAP
                | ProcCtls::SECONDARY_CTLS,
            proc_ctls2: ProcCtls2::ENABLE_EPT | ProcCtls2::ENABLE_VPID,
            vpid: 0,
            ept_pointer: 0,
            entry_intr_info: 0,
            entry_exception_errcode: 0,
            exit_reason: 0,
            exit_qualification: 0,
            guest_physical_addr: 0,
            idt_vectoring_info: 0,
            idt_vectoring_errcode: 0,
            instruction_error: 0,
            launched: false,
        }
    }
}

struct VmxVcpu {
    ctx: GuestCtx,
    vmcs: Vmcs,
    unrestricted: bool,
    apicv: bool,
}

/// TLB maintenance statistics (observable in tests and diagnostics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxStats {
    pub entries: u64,
    pub invvpid_single: u64,
    pub invvpid_all: u64,
}

pub struct VmxBackend {
    features: HostFeatures,
    msr_perms: super::MsrPermissions,
    vcpus: Vec<Mutex<VmxVcpu>>,
    stats: Mutex<VmxStats>,
}

impl VmxBackend {
    /// Allocate per-VM hardware structures and verify mandatory features.
    pub fn init(features: HostFeatures, maxcpus: usize) -> BackendResult<Self> {
        if !features.nested_paging {
            return Err(BackendError::HardwareUnsupported("EPT"));
        }
        if !features.vpid {
            return Err(BackendError::HardwareUnsupported("VPID"));
        }
        let msr_perms = super::MsrPermissions::new();
        let vcpus = (0..maxcpus)
            .map(|_| Mutex::new(Self::fresh_vcpu(&msr_perms)))
            .collect();
        Ok(Self { features, msr_perms, vcpus, stats: Mutex::new(VmxStats::default()) })
    }

    fn fresh_vcpu(perms: &super::MsrPermissions) -> VmxVcpu {
        let mut ctx = GuestCtx::new();
        perms.seed_guest_msrs(&mut ctx);
        VmxVcpu { ctx, vmcs: Vmcs::new(), unrestricted: false, apicv: false }
    }

    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn stats(&self) -> VmxStats {
        *self.stats.lock()
    }

    pub fn vcpu_reset(&self, id: usize) {
        let mut vcpu = self.vcpus[id].lock();
        vcpu.ctx.reset();
        self.msr_perms.seed_guest_msrs(&mut vcpu.ctx);
        vcpu.vmcs = Vmcs::new();
    }

    pub fn with_ctx<R>(&self, id: usize, f: impl FnOnce(&GuestCtx) -> R) -> R {
        f(&self.vcpus[id].lock().ctx)
    }

    pub fn with_ctx_mut<R>(&self, id: usize, f: impl FnOnce(&mut GuestCtx) -> R) -> R {
        f(&mut self.vcpus[id].lock().ctx)
    }

    /// Control-block snapshot for diagnostics and tests.
    pub fn vmcs(&self, id: usize) -> Vmcs {
        self.vcpus[id].lock().vmcs.clone()
    }

    pub fn get_capability(&self, id: usize, cap: VmCap) -> BackendResult<bool> {
        let vcpu = self.vcpus[id].lock();
        match cap {
            VmCap::HaltExit => Ok(vcpu.ctx.caps.halt_exit),
            VmCap::PauseExit => Ok(vcpu.ctx.caps.pause_exit),
            VmCap::MwaitExit => Ok(vcpu.ctx.caps.mwait_exit),
            VmCap::RdtscpPassthrough => Ok(vcpu.ctx.caps.rdtscp),
            VmCap::UnrestrictedGuest => {
                if self.features.unrestricted_guest {
                    Ok(vcpu.unrestricted)
                } else {
                    Err(BackendError::Unsupported)
                }
            }
            VmCap::ApicVirtualization => {
                if self.features.apic_virtualization {
                    Ok(vcpu.apicv)
                } else {
                    Err(BackendError::Unsupported)
                }
            }
        }
    }

    pub fn set_capability(&self, id: usize, cap: VmCap, enable: bool) -> BackendResult<()> {
        let mut vcpu = self.vcpus[id].lock();
        match cap {
            VmCap::HaltExit => {
                vcpu.ctx.caps.halt_exit = enable;
                // The intercept stays armed either way; the cap decides
                // whether the dispatcher surfaces or idles.
                vcpu.vmcs.proc_ctls.insert(ProcCtls::HLT_EXITING);
            }
            VmCap::PauseExit => {
                vcpu.ctx.caps.pause_exit = enable;
                vcpu.vmcs.proc_ctls.set(ProcCtls::PAUSE_EXITING, enable);
            }
            VmCap::MwaitExit => vcpu.ctx.caps.mwait_exit = enable,
            VmCap::RdtscpPassthrough => {
                vcpu.ctx.caps.rdtscp = enable;
                vcpu.vmcs.proc_ctls2.set(ProcCtls2::ENABLE_RDTSCP, enable);
            }
            VmCap::UnrestrictedGuest => {
                if !self.features.unrestricted_guest {
                    return Err(BackendError::Unsupported);
                }
                vcpu.unrestricted = enable;
                vcpu.vmcs.proc_ctls2.set(ProcCtls2::UNRESTRICTED_GUEST, enable);
            }
            VmCap::ApicVirtualization => {
                if !self.features.apic_virtualization {
                    return Err(BackendError::Unsupported);
                }
                vcpu.apicv = enable;
                vcpu.vmcs.proc_ctls2.set(ProcCtls2::APIC_REGISTER_VIRT, enable);
            }
        }
        Ok(())
    }

    /// One VMLAUNCH/VMRESUME round trip.
    pub fn enter(&self, vcpu: &Vcpu, params: EntryParams<'_>) -> RawExit {
        let id = vcpu.id();
        let mut this = self.vcpus[id].lock();
        let unrestricted = this.unrestricted;

        // TLB tag upkeep decided by the consistency domain.
        this.vmcs.vpid = params.tlb.tag.num as u16;
        this.ctx.tlb_tag = params.tlb.tag;
        {
            let mut stats = self.stats.lock();
            stats.entries += 1;
            match params.tlb.op {
                TlbOp::FlushTag => stats.invvpid_single += 1,
                TlbOp::FlushAll => stats.invvpid_all += 1,
                TlbOp::None => {}
            }
        }
        this.vmcs.ept_pointer = params.npt.root_ptr();

        // Mirror the arbitrated event into the entry interruption field.
        if let Some((info, _)) = params.plan.inject {
            let (word, err) = encode_intinfo(info);
            this.vmcs.entry_intr_info = word;
            this.vmcs.entry_exception_errcode = err;
        }
        let intr_win = params.plan.request_intr_window || this.ctx.intr_window_req;
        let nmi_win = params.plan.request_nmi_window || this.ctx.nmi_window_req;
        this.vmcs.proc_ctls.set(ProcCtls::INT_WINDOW_EXITING, intr_win);
        this.vmcs.proc_ctls.set(ProcCtls::NMI_WINDOW_EXITING, nmi_win);

        let exit = this.ctx.run(vcpu, &params.plan, params.npt, unrestricted, false);
        this.vmcs.launched = true;

        // Entry info drains unless the event is still latched.
        if this.ctx.event_slot.is_none() {
            this.vmcs.entry_intr_info = 0;
            this.vmcs.entry_exception_errcode = 0;
        }
        let intr_win = this.ctx.intr_window_req;
        let nmi_win = this.ctx.nmi_window_req;
        this.vmcs.proc_ctls.set(ProcCtls::INT_WINDOW_EXITING, intr_win);
        this.vmcs.proc_ctls.set(ProcCtls::NMI_WINDOW_EXITING, nmi_win);

        Self::record_exit(&mut this.vmcs, &exit);
        exit
    }

    fn record_exit(vmcs: &mut Vmcs, exit: &RawExit) {
        vmcs.idt_vectoring_info = 0;
        vmcs.idt_vectoring_errcode = 0;
        vmcs.instruction_error = 0;
        vmcs.exit_reason = match &exit.reason {
            RawExitReason::HostInterrupt => exit_reason::EXTERNAL_INTERRUPT,
            RawExitReason::IntrWindow => exit_reason::INTERRUPT_WINDOW,
            RawExitReason::NmiWindow => exit_reason::NMI_WINDOW,
            RawExitReason::Exception { idt_vectoring, .. } => {
                if let Some(v) = idt_vectoring {
                    let (word, err) = encode_intinfo(*v);
                    vmcs.idt_vectoring_info = word;
                    vmcs.idt_vectoring_errcode = err;
                }
                exit_reason::EXCEPTION_OR_NMI
            }
            RawExitReason::Cpuid => exit_reason::CPUID,
            RawExitReason::Hlt => exit_reason::HLT,
            RawExitReason::Pause => exit_reason::PAUSE,
            RawExitReason::Mwait => exit_reason::MWAIT,
            RawExitReason::Monitor => exit_reason::MONITOR,
            RawExitReason::VirtInstr => exit_reason::VMXON,
            RawExitReason::InOut { port, write, .. } => {
                vmcs.exit_qualification =
                    ((*port as u64) << 16) | if *write { 0 } else { 1 << 3 };
                exit_reason::IO_INSTRUCTION
            }
            RawExitReason::Msr { write, .. } => {
                if *write {
                    exit_reason::MSR_WRITE
                } else {
                    exit_reason::MSR_READ
                }
            }
            RawExitReason::NptFault { gpa, write, idt_vectoring, .. } => {
                if let Some(v) = idt_vectoring {
                    let (word, err) = encode_intinfo(*v);
                    vmcs.idt_vectoring_info = word;
                    vmcs.idt_vectoring_errcode = err;
                }
                vmcs.exit_qualification = if *write { 1 << 1 } else { 1 << 0 };
                vmcs.guest_physical_addr = *gpa;
                exit_reason::EPT_VIOLATION
            }
            RawExitReason::InvalidEntry { error } => {
                vmcs.instruction_error = *error;
                exit_reason::INVALID_GUEST_STATE | exit_reason::ENTRY_FAILURE
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{idt, GuestOp};
    use crate::events::InjectPlan;
    use crate::npt::{NestedPageTable, PageCaps, TableFormat};
    use crate::tlb::{CpuTag, TlbDecision};

    fn backend() -> VmxBackend {
        VmxBackend::init(HostFeatures::intel_default(), 1).unwrap()
    }

    fn params(npt: &NestedPageTable) -> EntryParams<'_> {
        EntryParams {
            plan: InjectPlan::default(),
            npt,
            tlb: TlbDecision { tag: CpuTag { gen: 1, num: 3 }, op: TlbOp::None, fresh: false },
        }
    }

    #[test]
    fn test_intinfo_roundtrip() {
        for info in [
            IntInfo::interrupt(0x30),
            IntInfo::nmi(),
            IntInfo::exception(idt::GP, Some(0x18)),
            IntInfo::exception(idt::UD, None),
        ] {
            let (word, err) = encode_intinfo(info);
            assert_eq!(decode_intinfo(word, err), Some(info));
        }
        assert_eq!(decode_intinfo(0, 0), None);
    }

    #[test]
    fn test_missing_ept_rejected() {
        let mut f = HostFeatures::intel_default();
        f.nested_paging = false;
        assert_eq!(
            VmxBackend::init(f, 1).err(),
            Some(BackendError::HardwareUnsupported("EPT"))
        );
    }

    #[test]
    fn test_vpid_applied_from_tlb_decision() {
        let b = backend();
        let vcpu = Vcpu::new(0);
        let npt = NestedPageTable::new(TableFormat::Ept, PageCaps::default());
        vcpu.push_op(GuestOp::Hlt);
        let exit = b.enter(&vcpu, params(&npt));
        assert_eq!(exit.reason, RawExitReason::Hlt);
        assert_eq!(b.vmcs(0).vpid, 3);
        assert_eq!(b.vmcs(0).exit_reason, exit_reason::HLT);
    }

    #[test]
    fn test_flush_ops_counted() {
        let b = backend();
        let vcpu = Vcpu::new(0);
        let npt = NestedPageTable::new(TableFormat::Ept, PageCaps::default());
        let mut p = params(&npt);
        p.tlb.op = TlbOp::FlushTag;
        b.enter(&vcpu, p);
        assert_eq!(b.stats().invvpid_single, 1);
    }

    #[test]
    fn test_unrestricted_guest_capability() {
        let b = backend();
        assert_eq!(b.get_capability(0, VmCap::UnrestrictedGuest), Ok(false));
        b.set_capability(0, VmCap::UnrestrictedGuest, true).unwrap();
        assert_eq!(b.get_capability(0, VmCap::UnrestrictedGuest), Ok(true));

        let mut f = HostFeatures::intel_default();
        f.unrestricted_guest = false;
        let b = VmxBackend::init(f, 1).unwrap();
        assert_eq!(
            b.set_capability(0, VmCap::UnrestrictedGuest, true),
            Err(BackendError::Unsupported)
        );
    }

    #[test]
    fn test_entry_failure_records_instruction_error() {
        let b = backend();
        let vcpu = Vcpu::new(0);
        let npt = NestedPageTable::new(TableFormat::Ept, PageCaps::default());
        b.with_ctx_mut(0, |ctx| ctx.rflags = 0);
        let exit = b.enter(&vcpu, params(&npt));
        assert!(matches!(exit.reason, RawExitReason::InvalidEntry { .. }));
        assert_ne!(b.vmcs(0).exit_reason & exit_reason::ENTRY_FAILURE, 0);
        assert_eq!(b.vmcs(0).instruction_error, 33);
    }

    #[test]
    fn test_protected_mode_required_without_unrestricted() {
        let b = backend();
        let vcpu = Vcpu::new(0);
        let npt = NestedPageTable::new(TableFormat::Ept, PageCaps::default());
        // Guest in real mode (PE clear), unrestricted guest off
        b.with_ctx_mut(0, |ctx| ctx.cr0 = 0);
        let exit = b.enter(&vcpu, params(&npt));
        assert!(matches!(exit.reason, RawExitReason::InvalidEntry { .. }));
        // With unrestricted guest enabled the same state is accepted
        b.set_capability(0, VmCap::UnrestrictedGuest, true).unwrap();
        vcpu.push_op(GuestOp::Hlt);
        let exit = b.enter(&vcpu, params(&npt));
        assert_eq!(exit.reason, RawExitReason::Hlt);
    }

    #[test]
    fn test_ept_violation_records_gpa() {
        let b = backend();
        let vcpu = Vcpu::new(0);
        let npt = NestedPageTable::new(TableFormat::Ept, PageCaps::default());
        vcpu.push_op(GuestOp::MemRead { gpa: 0xFEC0_0000, bytes: 4 });
        let exit = b.enter(&vcpu, params(&npt));
        assert!(matches!(exit.reason, RawExitReason::NptFault { .. }));
        assert_eq!(b.vmcs(0).exit_reason, exit_reason::EPT_VIOLATION);
        assert_eq!(b.vmcs(0).guest_physical_addr, 0xFEC0_0000);
    }
}
