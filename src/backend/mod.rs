//! Architecture Backends
//!
//! The two concrete implementations of the execution interface: Intel
//! VT-x (`vmx`) and AMD SVM (`svm`). The backend owns the hardware
//! control block for each vCPU, performs the VM-entry, and exposes the
//! typed register/descriptor/capability accessors the device-control
//! layer uses while a vCPU is frozen.
//!
//! The virtualization hardware itself is modeled in software behind the
//! same seam the kernel build replaces with VMLAUNCH/VMRUN: guest
//! progress between intercepts comes from the vCPU's scripted activity
//! stream, while the interruptibility, injection-slot, and TLB-tag state
//! machines are real.

use std::collections::HashMap;

use crate::cpu::{GuestOp, Registers, SegReg, SegmentDescriptor, Vcpu, VcpuReg};
use crate::cpu::{msr, rflags};
use crate::events::{EventKind, InjectPlan, IntInfo};
use crate::exits::InstBytes;
use crate::memory::Gpa;
use crate::npt::{NestedPageTable, Prot};
use crate::tlb::{CpuTag, TlbDecision};

pub mod svm;
pub mod vmx;

pub use svm::SvmBackend;
pub use vmx::VmxBackend;

// ============================================================================
// Probing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// Host virtualization features, probed once at module load. The kernel
/// build fills this from CPUID and capability MSRs; tests construct the
/// exact hardware they want.
#[derive(Debug, Clone)]
pub struct HostFeatures {
    pub vendor: CpuVendor,
    /// EPT / nested paging (mandatory)
    pub nested_paging: bool,
    /// SVM: next sequential instruction pointer saved on exit
    pub next_rip: bool,
    /// SVM: instruction bytes captured on nested-page faults
    pub decode_assist: bool,
    /// SVM: flush by ASID instead of flush-all
    pub flush_by_asid: bool,
    /// SVM: number of ASIDs
    pub nasid: u32,
    /// VMX: VPID tagging + INVVPID
    pub vpid: bool,
    /// VMX: real-mode guests without emulation
    pub unrestricted_guest: bool,
    /// APIC register virtualization / posted interrupts
    pub apic_virtualization: bool,
    pub superpage_2m: bool,
    pub superpage_1g: bool,
}

impl HostFeatures {
    /// Modeled Intel part with the full feature set.
    pub fn intel_default() -> Self {
        Self {
            vendor: CpuVendor::Intel,
            nested_paging: true,
            next_rip: true,
            decode_assist: false,
            flush_by_asid: true,
            nasid: 0,
            vpid: true,
            unrestricted_guest: true,
            apic_virtualization: true,
            superpage_2m: true,
            superpage_1g: true,
        }
    }

    /// Modeled AMD part with the full feature set.
    pub fn amd_default() -> Self {
        Self {
            vendor: CpuVendor::Amd,
            nested_paging: true,
            next_rip: true,
            decode_assist: true,
            flush_by_asid: true,
            nasid: 256,
            vpid: false,
            unrestricted_guest: true,
            apic_virtualization: false,
            superpage_2m: true,
            superpage_1g: true,
        }
    }
}

// ============================================================================
// Errors and capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// Mandatory CPU feature absent; the backend cannot be used at all
    HardwareUnsupported(&'static str),
    /// Optional capability absent on this hardware
    Unsupported,
    /// Unknown register id, descriptor, or out-of-range value
    InvalidArgument,
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardwareUnsupported(what) => write!(f, "hardware lacks {}", what),
            Self::Unsupported => write!(f, "capability not supported"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// Optional per-vCPU behaviors togglable by the device-control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCap {
    /// Surface HLT to the caller instead of idling in-kernel
    HaltExit,
    /// Surface PAUSE to the caller
    PauseExit,
    /// Surface MWAIT/MONITOR to the caller
    MwaitExit,
    /// Run real-mode guest code without emulation (VMX)
    UnrestrictedGuest,
    /// Let the guest execute RDTSCP without an exit
    RdtscpPassthrough,
    /// Hardware APIC register virtualization
    ApicVirtualization,
}

/// Per-vCPU capability switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapSet {
    pub halt_exit: bool,
    pub pause_exit: bool,
    pub mwait_exit: bool,
    pub rdtscp: bool,
}

// ============================================================================
// Raw exits
// ============================================================================

/// Architecture-neutral exit produced by one hardware entry, before the
/// dispatcher classifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExit {
    pub reason: RawExitReason,
    /// Decoded length for fault-like exits; 0 for trap-like ones
    pub inst_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawExitReason {
    /// Host interrupt fired during guest execution; handled locally
    HostInterrupt,
    /// Interrupt-window exiting armed and the window opened
    IntrWindow,
    /// NMI-window exiting armed and NMI blocking ended
    NmiWindow,
    Exception {
        vector: u8,
        error_code: Option<u32>,
        /// Event that was being delivered when this exception hit
        idt_vectoring: Option<IntInfo>,
    },
    Cpuid,
    Hlt,
    Pause,
    Mwait,
    Monitor,
    /// Guest attempted a VMX/SVM instruction
    VirtInstr,
    InOut {
        port: u16,
        bytes: u8,
        write: bool,
        value: u32,
    },
    Msr {
        write: bool,
        num: u32,
        value: u64,
    },
    NptFault {
        gpa: Gpa,
        write: bool,
        /// Access operands captured by the modeled hardware (the kernel
        /// build recovers these through decode assist / emulation)
        bytes: u8,
        value: u64,
        idt_vectoring: Option<IntInfo>,
        inst: InstBytes,
    },
    /// Hardware rejected the entry (inconsistent control block)
    InvalidEntry { error: u32 },
}

// ============================================================================
// MSR permission bitmap
// ============================================================================

/// Which MSRs the guest may touch without an exit. Built once at VM
/// creation (the hardware artifact is a 4 KiB bitmap page) and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct MsrPermissions {
    passthrough: Vec<u32>,
}

impl MsrPermissions {
    pub fn new() -> Self {
        Self {
            passthrough: vec![
                msr::IA32_FS_BASE,
                msr::IA32_GS_BASE,
                msr::IA32_KERNEL_GS_BASE,
                msr::IA32_STAR,
                msr::IA32_LSTAR,
                msr::IA32_CSTAR,
                msr::IA32_FMASK,
                msr::IA32_SYSENTER_CS,
                msr::IA32_SYSENTER_ESP,
                msr::IA32_SYSENTER_EIP,
                msr::IA32_PAT,
            ],
        }
    }

    pub fn allow(&mut self, num: u32) {
        if !self.passthrough.contains(&num) {
            self.passthrough.push(num);
        }
    }

    pub fn is_passthrough(&self, num: u32) -> bool {
        self.passthrough.contains(&num)
    }

    /// Install the passthrough set into a guest context so accesses to
    /// those MSRs complete without an exit.
    pub fn seed_guest_msrs(&self, ctx: &mut GuestCtx) {
        for &m in &self.passthrough {
            ctx.msrs.entry(m).or_insert(0);
        }
    }
}

impl Default for MsrPermissions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Guest execution context
// ============================================================================

/// Architecture-independent slice of the guest context: register file,
/// interruptibility state, the single event-injection slot, and window
/// requests. Each backend wraps one of these per vCPU and layers its
/// control-block encoding on top.
#[derive(Debug)]
pub struct GuestCtx {
    pub regs: Registers,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub segs: [SegmentDescriptor; 10],

    /// STI/MOV-SS shadow
    pub intr_shadow: bool,
    /// Shadow expires when the next instruction retires
    shadow_armed: bool,
    /// No IRET retired since the last NMI delivery
    pub nmi_blocked: bool,
    /// Latched, not yet delivered event
    pub event_slot: Option<IntInfo>,
    pub intr_window_req: bool,
    pub nmi_window_req: bool,

    pub msrs: HashMap<u32, u64>,
    pub caps: CapSet,

    /// Cached TLB tag + the mapping generation it last observed
    pub tlb_tag: CpuTag,
    pub seen_gen: u64,
    pub last_hostcpu: Option<usize>,
}

impl GuestCtx {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            rip: 0,
            rflags: rflags::RESERVED1,
            cr0: 0x0000_0011, // PE | ET
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            efer: 0,
            segs: [SegmentDescriptor::default(); 10],
            intr_shadow: false,
            shadow_armed: false,
            nmi_blocked: false,
            event_slot: None,
            intr_window_req: false,
            nmi_window_req: false,
            msrs: HashMap::new(),
            caps: CapSet::default(),
            tlb_tag: CpuTag::INVALID,
            seen_gen: 0,
            last_hostcpu: None,
        }
    }

    pub fn reset(&mut self) {
        let caps = self.caps;
        *self = Self::new();
        self.caps = caps;
    }

    pub fn intr_enabled(&self) -> bool {
        self.rflags & rflags::IF != 0
    }

    pub fn read_reg(&self, reg: VcpuReg) -> u64 {
        match reg {
            VcpuReg::Rax => self.regs.rax,
            VcpuReg::Rbx => self.regs.rbx,
            VcpuReg::Rcx => self.regs.rcx,
            VcpuReg::Rdx => self.regs.rdx,
            VcpuReg::Rsi => self.regs.rsi,
            VcpuReg::Rdi => self.regs.rdi,
            VcpuReg::Rbp => self.regs.rbp,
            VcpuReg::Rsp => self.regs.rsp,
            VcpuReg::R8 => self.regs.r8,
            VcpuReg::R9 => self.regs.r9,
            VcpuReg::R10 => self.regs.r10,
            VcpuReg::R11 => self.regs.r11,
            VcpuReg::R12 => self.regs.r12,
            VcpuReg::R13 => self.regs.r13,
            VcpuReg::R14 => self.regs.r14,
            VcpuReg::R15 => self.regs.r15,
            VcpuReg::Rip => self.rip,
            VcpuReg::Rflags => self.rflags,
            VcpuReg::Cr0 => self.cr0,
            VcpuReg::Cr2 => self.cr2,
            VcpuReg::Cr3 => self.cr3,
            VcpuReg::Cr4 => self.cr4,
            VcpuReg::Efer => self.efer,
            VcpuReg::IntrShadow => self.intr_shadow as u64,
            VcpuReg::Tpr => self.cr8,
        }
    }

    pub fn write_reg(&mut self, reg: VcpuReg, value: u64) {
        match reg {
            VcpuReg::Rax => self.regs.rax = value,
            VcpuReg::Rbx => self.regs.rbx = value,
            VcpuReg::Rcx => self.regs.rcx = value,
            VcpuReg::Rdx => self.regs.rdx = value,
            VcpuReg::Rsi => self.regs.rsi = value,
            VcpuReg::Rdi => self.regs.rdi = value,
            VcpuReg::Rbp => self.regs.rbp = value,
            VcpuReg::Rsp => self.regs.rsp = value,
            VcpuReg::R8 => self.regs.r8 = value,
            VcpuReg::R9 => self.regs.r9 = value,
            VcpuReg::R10 => self.regs.r10 = value,
            VcpuReg::R11 => self.regs.r11 = value,
            VcpuReg::R12 => self.regs.r12 = value,
            VcpuReg::R13 => self.regs.r13 = value,
            VcpuReg::R14 => self.regs.r14 = value,
            VcpuReg::R15 => self.regs.r15 = value,
            VcpuReg::Rip => self.rip = value,
            VcpuReg::Rflags => self.rflags = value | rflags::RESERVED1,
            VcpuReg::Cr0 => self.cr0 = value,
            VcpuReg::Cr2 => self.cr2 = value,
            VcpuReg::Cr3 => self.cr3 = value,
            VcpuReg::Cr4 => self.cr4 = value,
            VcpuReg::Efer => self.efer = value,
            VcpuReg::IntrShadow => {
                self.intr_shadow = value != 0;
                self.shadow_armed = self.intr_shadow;
            }
            VcpuReg::Tpr => self.cr8 = value & 0xF,
        }
    }

    pub fn seg_index(seg: SegReg) -> usize {
        match seg {
            SegReg::Es => 0,
            SegReg::Cs => 1,
            SegReg::Ss => 2,
            SegReg::Ds => 3,
            SegReg::Fs => 4,
            SegReg::Gs => 5,
            SegReg::Ldtr => 6,
            SegReg::Tr => 7,
            SegReg::Gdtr => 8,
            SegReg::Idtr => 9,
        }
    }

    /// Dispatcher advanced RIP past an emulated instruction: it retired,
    /// so an armed STI shadow expires.
    pub fn advance_rip(&mut self, nextrip: u64) {
        self.rip = nextrip;
        if self.shadow_armed {
            self.intr_shadow = false;
            self.shadow_armed = false;
        }
    }

    fn instruction_retired(&mut self) {
        if self.shadow_armed {
            self.intr_shadow = false;
            self.shadow_armed = false;
        } else if self.intr_shadow {
            // Shadow set externally (MOV SS); expires after one instruction
            self.shadow_armed = true;
        }
    }

    /// Validate guest state the way the hardware does at entry. Returns
    /// the VM-instruction-error / exit code on inconsistency.
    fn entry_check(&self, unrestricted: bool) -> Option<u32> {
        if self.rflags & rflags::RESERVED1 == 0 {
            return Some(33); // invalid guest state
        }
        const CR0_PE: u64 = 1 << 0;
        const CR0_PG: u64 = 1 << 31;
        if !unrestricted && self.cr0 & CR0_PE == 0 {
            return Some(33);
        }
        if self.efer & msr::efer::LMA != 0 && self.cr0 & CR0_PG == 0 {
            return Some(33);
        }
        None
    }

    /// The modeled hardware entry: deliver any latched event, then run
    /// the guest's activity stream until something intercepts.
    ///
    /// Global interrupts are disabled across the real-world equivalent
    /// of this window, so host kicks are observed exactly here, never
    /// asynchronously inside it.
    pub fn run(
        &mut self,
        vcpu: &Vcpu,
        plan: &InjectPlan,
        npt: &NestedPageTable,
        unrestricted: bool,
        decode_assist: bool,
    ) -> RawExit {
        if let Some(err) = self.entry_check(unrestricted) {
            return RawExit { reason: RawExitReason::InvalidEntry { error: err }, inst_len: 0 };
        }

        // Latch the arbitrated event into the (single) injection slot.
        if let Some((info, _)) = plan.inject {
            assert!(self.event_slot.is_none(), "injection slot already occupied");
            self.event_slot = Some(info);
            if plan.starts_nmi_blocking {
                self.nmi_blocked = true;
            }
            if plan.clears_shadow {
                self.intr_shadow = false;
                self.shadow_armed = false;
            }
        }
        if plan.request_intr_window {
            self.intr_window_req = true;
        }
        if plan.request_nmi_window {
            self.nmi_window_req = true;
        }

        // A host interrupt pending at entry kicks us straight back out;
        // the latched event stays in the slot for the next entry.
        if vcpu.take_kick() {
            return RawExit { reason: RawExitReason::HostInterrupt, inst_len: 0 };
        }

        // Event delivery happens before the first guest instruction. A
        // fault raised by the stream's first step is a delivery fault
        // and chains into IDT-vectoring info.
        let mut in_delivery = self.event_slot.take();
        let mut first_step = in_delivery.is_some();
        if let Some(info) = in_delivery {
            if matches!(info.kind, EventKind::ExtInt | EventKind::Nmi) {
                // Interrupt-gate delivery clears IF; IRET restores it.
                self.rflags &= !rflags::IF;
            }
        }

        loop {
            // Window exits fire at instruction boundaries, highest first.
            if self.nmi_window_req && !self.nmi_blocked && !self.intr_shadow {
                self.nmi_window_req = false;
                return RawExit { reason: RawExitReason::NmiWindow, inst_len: 0 };
            }
            if self.intr_window_req && self.intr_enabled() && !self.intr_shadow {
                self.intr_window_req = false;
                return RawExit { reason: RawExitReason::IntrWindow, inst_len: 0 };
            }

            let Some(op) = vcpu.take_op() else {
                // Idle guest: architecturally halted at RIP.
                return RawExit { reason: RawExitReason::Hlt, inst_len: 0 };
            };
            let len = op.inst_len();
            let vectoring = if first_step { in_delivery.take() } else { None };
            first_step = false;

            match op {
                GuestOp::Sti => {
                    self.rflags |= rflags::IF;
                    self.intr_shadow = true;
                    self.shadow_armed = true;
                    self.rip += len;
                    continue;
                }
                GuestOp::Cli => {
                    self.rflags &= !rflags::IF;
                    self.rip += len;
                    self.instruction_retired();
                    continue;
                }
                GuestOp::Iret => {
                    // Retiring IRET re-enables NMI delivery and restores
                    // the interrupted context's IF (which permitted the
                    // delivery in the first place).
                    self.nmi_blocked = false;
                    self.rflags |= rflags::IF;
                    self.rip += len;
                    self.instruction_retired();
                    continue;
                }
                GuestOp::Hlt => {
                    return RawExit { reason: RawExitReason::Hlt, inst_len: len };
                }
                GuestOp::Pause => {
                    if self.caps.pause_exit {
                        return RawExit { reason: RawExitReason::Pause, inst_len: len };
                    }
                    self.rip += len;
                    self.instruction_retired();
                    continue;
                }
                GuestOp::Cpuid => {
                    return RawExit { reason: RawExitReason::Cpuid, inst_len: len };
                }
                GuestOp::Mwait => {
                    return RawExit { reason: RawExitReason::Mwait, inst_len: len };
                }
                GuestOp::Monitor => {
                    return RawExit { reason: RawExitReason::Monitor, inst_len: len };
                }
                GuestOp::VirtInstr => {
                    return RawExit { reason: RawExitReason::VirtInstr, inst_len: len };
                }
                GuestOp::Rdmsr { msr: num } => {
                    if self.msr_passthrough(num) {
                        self.rip += len;
                        self.instruction_retired();
                        continue;
                    }
                    return RawExit {
                        reason: RawExitReason::Msr { write: false, num, value: 0 },
                        inst_len: len,
                    };
                }
                GuestOp::Wrmsr { msr: num, value } => {
                    if self.msr_passthrough(num) {
                        self.msrs.insert(num, value);
                        self.rip += len;
                        self.instruction_retired();
                        continue;
                    }
                    return RawExit {
                        reason: RawExitReason::Msr { write: true, num, value },
                        inst_len: len,
                    };
                }
                GuestOp::In { port, bytes } => {
                    return RawExit {
                        reason: RawExitReason::InOut { port, bytes, write: false, value: 0 },
                        inst_len: len,
                    };
                }
                GuestOp::Out { port, bytes, value } => {
                    return RawExit {
                        reason: RawExitReason::InOut { port, bytes, write: true, value },
                        inst_len: len,
                    };
                }
                GuestOp::MemRead { gpa, bytes } => {
                    match npt.translate(gpa) {
                        Some(t) if t.prot.contains(Prot::READ) => {
                            self.rip += len;
                            self.instruction_retired();
                            continue;
                        }
                        _ => {
                            return RawExit {
                                reason: RawExitReason::NptFault {
                                    gpa,
                                    write: false,
                                    bytes,
                                    value: 0,
                                    idt_vectoring: vectoring,
                                    inst: Self::capture_inst(decode_assist, false),
                                },
                                inst_len: len,
                            };
                        }
                    }
                }
                GuestOp::MemWrite { gpa, bytes, value } => {
                    match npt.translate(gpa) {
                        Some(t) if t.prot.contains(Prot::WRITE) => {
                            self.rip += len;
                            self.instruction_retired();
                            continue;
                        }
                        _ => {
                            return RawExit {
                                reason: RawExitReason::NptFault {
                                    gpa,
                                    write: true,
                                    bytes,
                                    value,
                                    idt_vectoring: vectoring,
                                    inst: Self::capture_inst(decode_assist, true),
                                },
                                inst_len: len,
                            };
                        }
                    }
                }
                GuestOp::Exception { vector, error_code } => {
                    return RawExit {
                        reason: RawExitReason::Exception {
                            vector,
                            error_code,
                            idt_vectoring: vectoring,
                        },
                        inst_len: 0,
                    };
                }
            }
        }
    }

    fn msr_passthrough(&self, num: u32) -> bool {
        // RDTSCP's TSC_AUX follows the capability toggle; the rest of
        // the passthrough set is consulted by the backends at init and
        // folded into `msrs` here.
        if num == msr::IA32_TSC_AUX {
            return self.caps.rdtscp;
        }
        self.msrs.contains_key(&num)
    }

    fn capture_inst(decode_assist: bool, write: bool) -> InstBytes {
        if !decode_assist {
            return InstBytes::default();
        }
        // Modeled decode assist: a representative MOV encoding.
        let mut inst = InstBytes { bytes: [0; 15], num_valid: 3 };
        inst.bytes[..3].copy_from_slice(if write {
            &[0x89, 0x04, 0x25]
        } else {
            &[0x8B, 0x04, 0x25]
        });
        inst
    }
}

impl Default for GuestCtx {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Backend dispatch
// ============================================================================

/// Per-vCPU entry parameters computed by the dispatcher.
pub struct EntryParams<'a> {
    pub plan: InjectPlan,
    pub npt: &'a NestedPageTable,
    pub tlb: TlbDecision,
}

/// The execution interface, selected once at VM creation from the
/// probed CPU vendor and never re-probed per call.
pub enum ArchBackend {
    Vmx(VmxBackend),
    Svm(SvmBackend),
}

impl ArchBackend {
    /// Probe the (modeled) host CPU and build the matching backend.
    pub fn probe(features: HostFeatures, maxcpus: usize) -> BackendResult<Self> {
        match features.vendor {
            CpuVendor::Intel => Ok(Self::Vmx(VmxBackend::init(features, maxcpus)?)),
            CpuVendor::Amd => Ok(Self::Svm(SvmBackend::init(features, maxcpus)?)),
        }
    }

    pub fn vendor(&self) -> CpuVendor {
        match self {
            Self::Vmx(_) => CpuVendor::Intel,
            Self::Svm(_) => CpuVendor::Amd,
        }
    }

    pub fn table_format(&self) -> crate::npt::TableFormat {
        match self {
            Self::Vmx(_) => crate::npt::TableFormat::Ept,
            Self::Svm(_) => crate::npt::TableFormat::Npt,
        }
    }

    pub fn page_caps(&self) -> crate::npt::PageCaps {
        let f = self.features();
        crate::npt::PageCaps { superpage_2m: f.superpage_2m, superpage_1g: f.superpage_1g }
    }

    pub fn features(&self) -> &HostFeatures {
        match self {
            Self::Vmx(b) => b.features(),
            Self::Svm(b) => b.features(),
        }
    }

    pub fn vcpu_reset(&self, id: usize) {
        match self {
            Self::Vmx(b) => b.vcpu_reset(id),
            Self::Svm(b) => b.vcpu_reset(id),
        }
    }

    pub fn with_ctx<R>(&self, id: usize, f: impl FnOnce(&GuestCtx) -> R) -> R {
        match self {
            Self::Vmx(b) => b.with_ctx(id, f),
            Self::Svm(b) => b.with_ctx(id, f),
        }
    }

    pub fn with_ctx_mut<R>(&self, id: usize, f: impl FnOnce(&mut GuestCtx) -> R) -> R {
        match self {
            Self::Vmx(b) => b.with_ctx_mut(id, f),
            Self::Svm(b) => b.with_ctx_mut(id, f),
        }
    }

    /// Interruptibility snapshot for the injection pipeline.
    pub fn window_state(&self, id: usize) -> crate::events::WindowState {
        self.with_ctx(id, |ctx| crate::events::WindowState {
            intr_shadow: ctx.intr_shadow,
            nmi_blocked: ctx.nmi_blocked,
            intr_enabled: ctx.intr_enabled(),
            slot_occupied: ctx.event_slot.is_some(),
        })
    }

    /// One hardware entry/exit round trip.
    pub fn enter(&self, vcpu: &Vcpu, params: EntryParams<'_>) -> RawExit {
        match self {
            Self::Vmx(b) => b.enter(vcpu, params),
            Self::Svm(b) => b.enter(vcpu, params),
        }
    }

    pub fn get_register(&self, id: usize, reg: VcpuReg) -> u64 {
        self.with_ctx(id, |ctx| ctx.read_reg(reg))
    }

    pub fn set_register(&self, id: usize, reg: VcpuReg, value: u64) {
        self.with_ctx_mut(id, |ctx| ctx.write_reg(reg, value));
    }

    pub fn get_descriptor(&self, id: usize, seg: SegReg) -> SegmentDescriptor {
        self.with_ctx(id, |ctx| ctx.segs[GuestCtx::seg_index(seg)])
    }

    pub fn set_descriptor(&self, id: usize, seg: SegReg, desc: SegmentDescriptor) {
        self.with_ctx_mut(id, |ctx| ctx.segs[GuestCtx::seg_index(seg)] = desc);
    }

    pub fn get_capability(&self, id: usize, cap: VmCap) -> BackendResult<bool> {
        match self {
            Self::Vmx(b) => b.get_capability(id, cap),
            Self::Svm(b) => b.get_capability(id, cap),
        }
    }

    pub fn set_capability(&self, id: usize, cap: VmCap, enable: bool) -> BackendResult<()> {
        match self {
            Self::Vmx(b) => b.set_capability(id, cap, enable),
            Self::Svm(b) => b.set_capability(id, cap, enable),
        }
    }
}
