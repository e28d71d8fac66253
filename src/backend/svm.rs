//! AMD SVM Backend
//!
//! Owns the VMCB model for each vCPU: intercept vectors, the event
//! injection field, exit codes, the guest ASID, and TLB control. The
//! interrupt window maps onto V_IRQ (VINTR exiting); the NMI window maps
//! onto the IRET intercept. Nested-page faults carry captured
//! instruction bytes when decode assist is present.

use bitflags::bitflags;
use parking_lot::Mutex;

use super::{
    BackendError, BackendResult, EntryParams, GuestCtx, HostFeatures, RawExit, RawExitReason,
    VmCap,
};
use crate::cpu::Vcpu;
use crate::events::{EventKind, IntInfo};
use crate::exits::InstBytes;
use crate::tlb::TlbOp;

/// VMCB exit codes (AMD APM vol. 2, appendix C)
pub mod exitcode {
    pub const EXCP_BASE: u64 = 0x40;
    pub const INTR: u64 = 0x60;
    pub const NMI: u64 = 0x61;
    pub const VINTR: u64 = 0x64;
    pub const CPUID: u64 = 0x72;
    pub const IRET: u64 = 0x74;
    pub const PAUSE: u64 = 0x77;
    pub const HLT: u64 = 0x78;
    pub const IO: u64 = 0x7B;
    pub const MSR: u64 = 0x7C;
    pub const SHUTDOWN: u64 = 0x7F;
    pub const VMRUN: u64 = 0x80;
    pub const MONITOR: u64 = 0x8A;
    pub const MWAIT: u64 = 0x8B;
    pub const NPF: u64 = 0x400;
    pub const INVALID: u64 = u64::MAX;
}

bitflags! {
    /// Intercept vector (the subset the engine drives). These are armed
    /// statically at vcpu init for events the hypervisor must always
    /// see, plus the dynamic window intercepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intercept: u32 {
        const INTR = 1 << 0;
        const NMI = 1 << 1;
        const VINTR = 1 << 4;
        const CPUID = 1 << 5;
        const HLT = 1 << 6;
        const IO = 1 << 7;
        const MSR = 1 << 8;
        const IRET = 1 << 9;
        const PAUSE = 1 << 10;
        const SHUTDOWN = 1 << 11;
        const VMRUN = 1 << 12;
        const MONITOR = 1 << 13;
        const MWAIT = 1 << 14;
        const MC_EXCEPTION = 1 << 15;
        const DF_EXCEPTION = 1 << 16;
    }
}

/// TLB_CONTROL encodings
pub mod tlb_ctrl {
    pub const NOTHING: u8 = 0;
    pub const FLUSH_ALL: u8 = 1;
    pub const FLUSH_GUEST_ASID: u8 = 3;
}

/// EVENTINJ / EXITINTINFO format.
mod eventinj {
    pub const VALID: u64 = 1 << 31;
    pub const ERRCODE_VALID: u64 = 1 << 11;
    pub const TYPE_SHIFT: u64 = 8;
    pub const TYPE_EXTINT: u64 = 0;
    pub const TYPE_NMI: u64 = 2;
    pub const TYPE_EXCEPTION: u64 = 3;
}

/// Encode an event into the SVM EVENTINJ format.
pub fn encode_eventinj(info: IntInfo) -> u64 {
    let ty = match info.kind {
        EventKind::ExtInt => eventinj::TYPE_EXTINT,
        EventKind::Nmi => eventinj::TYPE_NMI,
        EventKind::HwException => eventinj::TYPE_EXCEPTION,
    };
    let mut word = eventinj::VALID | (ty << eventinj::TYPE_SHIFT) | info.vector as u64;
    if let Some(e) = info.error_code {
        word |= eventinj::ERRCODE_VALID | ((e as u64) << 32);
    }
    word
}

/// Decode the SVM EVENTINJ / EXITINTINFO format.
pub fn decode_eventinj(word: u64) -> Option<IntInfo> {
    if word & eventinj::VALID == 0 {
        return None;
    }
    let kind = match (word >> eventinj::TYPE_SHIFT) & 0x7 {
        eventinj::TYPE_NMI => EventKind::Nmi,
        eventinj::TYPE_EXCEPTION => EventKind::HwException,
        _ => EventKind::ExtInt,
    };
    let error_code = (word & eventinj::ERRCODE_VALID != 0).then_some((word >> 32) as u32);
    Some(IntInfo { kind, vector: (word & 0xFF) as u8, error_code })
}

/// VMCB control area, modeled with typed fields.
#[derive(Debug, Clone)]
pub struct Vmcb {
    pub intercepts: Intercept,
    pub guest_asid: u32,
    pub tlb_control: u8,
    /// V_IRQ: virtual interrupt pending (interrupt window request)
    pub v_irq: bool,
    pub np_enable: bool,
    pub ncr3: u64,
    pub exitcode: u64,
    pub exitinfo1: u64,
    pub exitinfo2: u64,
    pub exit_int_info: u64,
    pub event_inj: u64,
    pub nrip: u64,
    pub inst_bytes: InstBytes,
}

impl Vmcb {
    fn new() -> Self {
        Self {
            // Static intercepts: everything the top layer must always see
            intercepts: Intercept::INTR
                | Intercept::NMI
                | Intercept::CPUID
                | Intercept::HLT
                | Intercept::IO
                | Intercept::MSR
                | Intercept::SHUTDOWN
                | Intercept::VMRUN
                | Intercept::MONITOR
                | Intercept::MWAIT
                | Intercept::MC_EXCEPTION
                | Intercept::DF_EXCEPTION,
            guest_asid: 0,
            tlb_control: tlb_ctrl::NOTHING,
            v_irq: false,
            np_enable: true,
            ncr3: 0,
            exitcode: 0,
            exitinfo1: 0,
            exitinfo2: 0,
            exit_int_info: 0,
            event_inj: 0,
            nrip: 0,
            inst_bytes: InstBytes::default(),
        }
    }
}

struct SvmVcpu {
    ctx: GuestCtx,
    vmcb: Vmcb,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmStats {
    pub entries: u64,
    pub flush_asid: u64,
    pub flush_all: u64,
}

pub struct SvmBackend {
    features: HostFeatures,
    msr_perms: super::MsrPermissions,
    vcpus: Vec<Mutex<SvmVcpu>>,
    stats: Mutex<SvmStats>,
}

impl SvmBackend {
    /// Allocate per-VM hardware structures (I/O and MSR permission maps)
    /// and verify mandatory features.
    pub fn init(features: HostFeatures, maxcpus: usize) -> BackendResult<Self> {
        if !features.nested_paging {
            return Err(BackendError::HardwareUnsupported("nested paging"));
        }
        if !features.next_rip {
            return Err(BackendError::HardwareUnsupported("NRIP save"));
        }
        if features.nasid < 2 {
            return Err(BackendError::HardwareUnsupported("ASIDs"));
        }
        let msr_perms = super::MsrPermissions::new();
        let vcpus = (0..maxcpus)
            .map(|_| {
                let mut ctx = GuestCtx::new();
                msr_perms.seed_guest_msrs(&mut ctx);
                Mutex::new(SvmVcpu { ctx, vmcb: Vmcb::new() })
            })
            .collect();
        Ok(Self { features, msr_perms, vcpus, stats: Mutex::new(SvmStats::default()) })
    }

    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn stats(&self) -> SvmStats {
        *self.stats.lock()
    }

    pub fn vcpu_reset(&self, id: usize) {
        let mut vcpu = self.vcpus[id].lock();
        vcpu.ctx.reset();
        self.msr_perms.seed_guest_msrs(&mut vcpu.ctx);
        vcpu.vmcb = Vmcb::new();
    }

    pub fn with_ctx<R>(&self, id: usize, f: impl FnOnce(&GuestCtx) -> R) -> R {
        f(&self.vcpus[id].lock().ctx)
    }

    pub fn with_ctx_mut<R>(&self, id: usize, f: impl FnOnce(&mut GuestCtx) -> R) -> R {
        f(&mut self.vcpus[id].lock().ctx)
    }

    /// Control-block snapshot for diagnostics and tests.
    pub fn vmcb(&self, id: usize) -> Vmcb {
        self.vcpus[id].lock().vmcb.clone()
    }

    pub fn get_capability(&self, id: usize, cap: VmCap) -> BackendResult<bool> {
        let vcpu = self.vcpus[id].lock();
        match cap {
            VmCap::HaltExit => Ok(vcpu.ctx.caps.halt_exit),
            VmCap::PauseExit => Ok(vcpu.ctx.caps.pause_exit),
            VmCap::MwaitExit => Ok(vcpu.ctx.caps.mwait_exit),
            VmCap::RdtscpPassthrough => Ok(vcpu.ctx.caps.rdtscp),
            // Real-mode guests run natively under SVM; AVIC not modeled.
            VmCap::UnrestrictedGuest | VmCap::ApicVirtualization => {
                Err(BackendError::Unsupported)
            }
        }
    }

    pub fn set_capability(&self, id: usize, cap: VmCap, enable: bool) -> BackendResult<()> {
        let mut vcpu = self.vcpus[id].lock();
        match cap {
            VmCap::HaltExit => vcpu.ctx.caps.halt_exit = enable,
            VmCap::PauseExit => {
                vcpu.ctx.caps.pause_exit = enable;
                vcpu.vmcb.intercepts.set(Intercept::PAUSE, enable);
            }
            VmCap::MwaitExit => vcpu.ctx.caps.mwait_exit = enable,
            VmCap::RdtscpPassthrough => vcpu.ctx.caps.rdtscp = enable,
            VmCap::UnrestrictedGuest | VmCap::ApicVirtualization => {
                return Err(BackendError::Unsupported);
            }
        }
        Ok(())
    }

    /// One VMRUN round trip.
    pub fn enter(&self, vcpu: &Vcpu, params: EntryParams<'_>) -> RawExit {
        let id = vcpu.id();
        let decode_assist = self.features.decode_assist;
        let mut this = self.vcpus[id].lock();

        // ASID and TLB control from the consistency domain's decision.
        this.vmcb.guest_asid = params.tlb.tag.num;
        this.ctx.tlb_tag = params.tlb.tag;
        this.vmcb.tlb_control = {
            let mut stats = self.stats.lock();
            stats.entries += 1;
            match params.tlb.op {
                TlbOp::None => tlb_ctrl::NOTHING,
                TlbOp::FlushTag => {
                    stats.flush_asid += 1;
                    tlb_ctrl::FLUSH_GUEST_ASID
                }
                TlbOp::FlushAll => {
                    stats.flush_all += 1;
                    tlb_ctrl::FLUSH_ALL
                }
            }
        };
        this.vmcb.ncr3 = params.npt.root_ptr();

        if let Some((info, _)) = params.plan.inject {
            this.vmcb.event_inj = encode_eventinj(info);
        }
        let v_irq = params.plan.request_intr_window || this.ctx.intr_window_req;
        this.vmcb.v_irq = v_irq;
        this.vmcb.intercepts.set(Intercept::VINTR, v_irq);
        // NMI window: regain control when the guest retires an IRET.
        let iret_icpt = params.plan.request_nmi_window || this.ctx.nmi_window_req;
        this.vmcb.intercepts.set(Intercept::IRET, iret_icpt);

        // SVM runs real-mode guests natively; no unrestricted check.
        let exit = this.ctx.run(vcpu, &params.plan, params.npt, true, decode_assist);

        if this.ctx.event_slot.is_none() {
            this.vmcb.event_inj = 0;
        }
        let v_irq = this.ctx.intr_window_req;
        this.vmcb.v_irq = v_irq;
        this.vmcb.intercepts.set(Intercept::VINTR, v_irq);
        let iret_icpt = this.ctx.nmi_window_req;
        this.vmcb.intercepts.set(Intercept::IRET, iret_icpt);
        this.vmcb.nrip = this.ctx.rip + exit.inst_len;

        Self::record_exit(&mut this.vmcb, &exit);
        exit
    }

    fn record_exit(vmcb: &mut Vmcb, exit: &RawExit) {
        vmcb.exit_int_info = 0;
        vmcb.exitinfo1 = 0;
        vmcb.exitinfo2 = 0;
        vmcb.inst_bytes = InstBytes::default();
        vmcb.exitcode = match &exit.reason {
            RawExitReason::HostInterrupt => exitcode::INTR,
            RawExitReason::IntrWindow => exitcode::VINTR,
            RawExitReason::NmiWindow => exitcode::IRET,
            RawExitReason::Exception { vector, error_code, idt_vectoring } => {
                if let Some(v) = idt_vectoring {
                    vmcb.exit_int_info = encode_eventinj(*v);
                }
                vmcb.exitinfo1 = error_code.unwrap_or(0) as u64;
                exitcode::EXCP_BASE + *vector as u64
            }
            RawExitReason::Cpuid => exitcode::CPUID,
            RawExitReason::Hlt => exitcode::HLT,
            RawExitReason::Pause => exitcode::PAUSE,
            RawExitReason::Mwait => exitcode::MWAIT,
            RawExitReason::Monitor => exitcode::MONITOR,
            RawExitReason::VirtInstr => exitcode::VMRUN,
            RawExitReason::InOut { port, write, .. } => {
                vmcb.exitinfo1 = ((*port as u64) << 16) | if *write { 0 } else { 1 };
                exitcode::IO
            }
            RawExitReason::Msr { write, .. } => {
                vmcb.exitinfo1 = *write as u64;
                exitcode::MSR
            }
            RawExitReason::NptFault { gpa, write, idt_vectoring, inst, .. } => {
                if let Some(v) = idt_vectoring {
                    vmcb.exit_int_info = encode_eventinj(*v);
                }
                // Fault error code in exitinfo1, faulting GPA in exitinfo2
                vmcb.exitinfo1 = (1 << 0) | if *write { 1 << 1 } else { 0 };
                vmcb.exitinfo2 = *gpa;
                vmcb.inst_bytes = *inst;
                exitcode::NPF
            }
            RawExitReason::InvalidEntry { .. } => exitcode::INVALID,
        };
    }
}
