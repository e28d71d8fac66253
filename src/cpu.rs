//! Virtual CPU State
//!
//! Per-vCPU identity and the architecture-independent event state the
//! injection pipeline arbitrates over: pending exception, NMI count,
//! ExtINT request, and the event that was in flight when the previous
//! exit occurred. The register file itself lives in the backend-private
//! execution context (VMCS/VMCB guest area); this module only defines
//! the typed ids used to address it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::devices::lapic::LocalApic;
use crate::events::IntInfo;
use crate::memory::Gpa;
use crate::sched::VcpuSched;

/// RFLAGS register bits
pub mod rflags {
    pub const CF: u64 = 1 << 0;
    pub const PF: u64 = 1 << 2;
    pub const AF: u64 = 1 << 4;
    pub const ZF: u64 = 1 << 6;
    pub const SF: u64 = 1 << 7;
    pub const TF: u64 = 1 << 8; // Trap flag (single-step)
    pub const IF: u64 = 1 << 9; // Interrupt enable flag
    pub const DF: u64 = 1 << 10;
    pub const OF: u64 = 1 << 11;
    pub const IOPL: u64 = 3 << 12;
    pub const NT: u64 = 1 << 14;
    pub const RF: u64 = 1 << 16;
    pub const VM: u64 = 1 << 17;
    pub const AC: u64 = 1 << 18;
    pub const ID: u64 = 1 << 21;
    /// Bit 1 is always set
    pub const RESERVED1: u64 = 1 << 1;
}

/// MSR addresses the engine intercepts or virtualizes
pub mod msr {
    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_APIC_BASE: u32 = 0x1B;
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const IA32_PAT: u32 = 0x277;
    pub const IA32_TSC_DEADLINE: u32 = 0x6E0;
    pub const IA32_EFER: u32 = 0xC000_0080;
    pub const IA32_STAR: u32 = 0xC000_0081;
    pub const IA32_LSTAR: u32 = 0xC000_0082;
    pub const IA32_CSTAR: u32 = 0xC000_0083;
    pub const IA32_FMASK: u32 = 0xC000_0084;
    pub const IA32_FS_BASE: u32 = 0xC000_0100;
    pub const IA32_GS_BASE: u32 = 0xC000_0101;
    pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
    pub const IA32_TSC_AUX: u32 = 0xC000_0103;

    /// EFER bits
    pub mod efer {
        pub const SCE: u64 = 1 << 0;
        pub const LME: u64 = 1 << 8;
        pub const LMA: u64 = 1 << 10;
        pub const NXE: u64 = 1 << 11;
        pub const SVME: u64 = 1 << 12;
    }

    /// IA32_APIC_BASE bits
    pub mod apic_base {
        pub const BSP: u64 = 1 << 8;
        pub const X2APIC: u64 = 1 << 10;
        pub const ENABLED: u64 = 1 << 11;
        pub const ADDR_MASK: u64 = 0xF_FFFF_F000;
    }
}

/// Exception vectors
pub mod idt {
    pub const DE: u8 = 0; // Divide error
    pub const DB: u8 = 1; // Debug
    pub const NMI: u8 = 2;
    pub const BP: u8 = 3; // Breakpoint
    pub const OF: u8 = 4; // Overflow
    pub const BR: u8 = 5; // Bound range
    pub const UD: u8 = 6; // Invalid opcode
    pub const NM: u8 = 7; // Device not available
    pub const DF: u8 = 8; // Double fault
    pub const TS: u8 = 10; // Invalid TSS
    pub const NP: u8 = 11; // Segment not present
    pub const SS: u8 = 12; // Stack fault
    pub const GP: u8 = 13; // General protection
    pub const PF: u8 = 14; // Page fault
    pub const MF: u8 = 16; // x87 floating point
    pub const AC: u8 = 17; // Alignment check
    pub const MC: u8 = 18; // Machine check
    pub const XF: u8 = 19; // SIMD floating point
}

/// Double-fault derivation classes per the x86 exception taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

/// Classify an exception vector for double-fault derivation.
pub fn exception_class(vector: u8) -> ExceptionClass {
    match vector {
        idt::DE | idt::TS | idt::NP | idt::SS | idt::GP => ExceptionClass::Contributory,
        idt::PF => ExceptionClass::PageFault,
        _ => ExceptionClass::Benign,
    }
}

/// True if the architecture defines an error code for this vector.
pub fn vector_has_errcode(vector: u8) -> bool {
    matches!(
        vector,
        idt::DF | idt::TS | idt::NP | idt::SS | idt::GP | idt::PF | idt::AC
    )
}

/// Typed ids over the full x86 register file, including synthetic
/// pseudo-registers that map onto hardware-specific control-block bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcpuReg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Efer,
    /// Interrupt shadow (STI/MOV-SS blocking window); synthetic
    IntrShadow,
    /// Task priority (CR8 / lapic TPR); synthetic
    Tpr,
}

/// Segment/descriptor-table register ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
    Gdtr,
    Idtr,
}

/// Cached segment descriptor (base, limit, access rights).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
    pub attrib: u32,
}

/// x86-64 general purpose register file.
#[derive(Debug, Clone, Default)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

// ============================================================================
// Guest activity stream
// ============================================================================

/// One intercept-granularity step of modeled guest execution.
///
/// The engine does not decode instructions; guest behavior between exits is
/// scripted by the device-control layer at the granularity the hardware
/// would intercept it. An empty stream is architectural HLT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestOp {
    Hlt,
    Pause,
    Cpuid,
    Rdmsr { msr: u32 },
    Wrmsr { msr: u32, value: u64 },
    In { port: u16, bytes: u8 },
    Out { port: u16, bytes: u8, value: u32 },
    MemRead { gpa: Gpa, bytes: u8 },
    MemWrite { gpa: Gpa, bytes: u8, value: u64 },
    Sti,
    Cli,
    Iret,
    Mwait,
    Monitor,
    /// Guest attempt to execute a VMX/SVM instruction (always intercepted)
    VirtInstr,
    /// Guest raises a hardware exception
    Exception { vector: u8, error_code: Option<u32> },
}

impl GuestOp {
    /// Decoded instruction length, as the hardware would report it for
    /// fault-like exits with next-RIP support. Trap-like steps report 0.
    pub fn inst_len(&self) -> u64 {
        match self {
            GuestOp::Hlt | GuestOp::Sti | GuestOp::Cli => 1,
            GuestOp::In { .. } | GuestOp::Out { .. } => 1,
            GuestOp::Pause | GuestOp::Cpuid => 2,
            GuestOp::Rdmsr { .. } | GuestOp::Wrmsr { .. } => 2,
            GuestOp::Iret => 1,
            GuestOp::MemRead { .. } | GuestOp::MemWrite { .. } => 3,
            GuestOp::Mwait | GuestOp::Monitor | GuestOp::VirtInstr => 3,
            GuestOp::Exception { .. } => 0,
        }
    }
}

// ============================================================================
// Pending event state
// ============================================================================

/// An exception queued for injection by instruction emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingException {
    pub vector: u8,
    pub error_code: Option<u32>,
}

/// Event state arbitrated by the injection pipeline, one instance per vCPU.
#[derive(Debug, Default)]
pub struct VcpuEvents {
    /// Exception pending injection (from emulation or reflection)
    pub exception: Option<PendingException>,
    /// NMIs pending; a count because NMIs coalesce (at most one in
    /// service plus one latched, so the counter saturates at 2)
    pub nmi_pending: u8,
    /// Legacy PIC ExtINT request line asserted
    pub extint_pending: bool,
    /// Event that was in flight when the previous exit occurred
    pub exit_intinfo: Option<IntInfo>,
    /// Address at which the vCPU resumes on the next entry
    pub nextrip: u64,
}

/// Vcpu errors (caller errors; never fatal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuError {
    /// Exception vector out of range or error code mismatch
    InvalidArgument,
}

impl std::fmt::Display for VcpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for VcpuError {}

/// A virtual CPU.
///
/// Created once per index at VM construction; reinitialized, never
/// destroyed, on VM reset. The run loop executes on a dedicated host
/// thread; the lapic and event fields may be poked from other threads
/// (IPIs, timer, host notifications) and are individually locked.
pub struct Vcpu {
    id: usize,
    lapic: Mutex<LocalApic>,
    events: Mutex<VcpuEvents>,
    stream: Mutex<VecDeque<GuestOp>>,
    /// Host notification: force the next entry straight back out
    kick: AtomicBool,
    /// Host asked this vCPU to idle (freeze) at the next boundary
    reqidle: AtomicBool,
    sched: VcpuSched,
}

impl Vcpu {
    pub const MAX_NMI_PENDING: u8 = 2;

    pub fn new(id: usize) -> Self {
        Self {
            id,
            lapic: Mutex::new(LocalApic::new(id as u32)),
            events: Mutex::new(VcpuEvents::default()),
            stream: Mutex::new(VecDeque::new()),
            kick: AtomicBool::new(false),
            reqidle: AtomicBool::new(false),
            sched: VcpuSched::new(),
        }
    }

    /// Ask the run loop to return a ReqIdle record at its next boundary.
    pub fn request_idle(&self) {
        self.reqidle.store(true, Ordering::SeqCst);
        self.kick();
    }

    pub fn take_reqidle(&self) -> bool {
        self.reqidle.swap(false, Ordering::SeqCst)
    }

    pub fn kicked(&self) -> bool {
        self.kick.load(Ordering::SeqCst)
    }

    pub fn sched(&self) -> &VcpuSched {
        &self.sched
    }

    /// Interrupt the vCPU's next (or current) hardware entry and wake it
    /// if it is sleeping. In the kernel build this is a host IPI to the
    /// CPU running the guest.
    pub fn kick(&self) {
        self.kick.store(true, Ordering::SeqCst);
        self.sched.unpark();
    }

    pub fn take_kick(&self) -> bool {
        self.kick.swap(false, Ordering::SeqCst)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lapic(&self) -> &Mutex<LocalApic> {
        &self.lapic
    }

    pub fn events(&self) -> &Mutex<VcpuEvents> {
        &self.events
    }

    /// Reset event state and the lapic; the backend resets its own
    /// control-block state separately.
    pub fn reinit(&self) {
        *self.events.lock() = VcpuEvents::default();
        self.stream.lock().clear();
        self.lapic.lock().reset();
        self.kick.store(false, Ordering::SeqCst);
        self.reqidle.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Guest activity stream
    // ------------------------------------------------------------------

    /// Append one step of modeled guest execution.
    pub fn push_op(&self, op: GuestOp) {
        self.stream.lock().push_back(op);
    }

    /// Append several steps.
    pub fn push_ops<I: IntoIterator<Item = GuestOp>>(&self, ops: I) {
        self.stream.lock().extend(ops);
    }

    /// Consume the next step; `None` means the guest is idle (HLT).
    pub fn take_op(&self) -> Option<GuestOp> {
        self.stream.lock().pop_front()
    }

    /// Peek without consuming (used for window-exit ordering).
    pub fn peek_op(&self) -> Option<GuestOp> {
        self.stream.lock().front().cloned()
    }

    pub fn stream_len(&self) -> usize {
        self.stream.lock().len()
    }

    // ------------------------------------------------------------------
    // Event sources
    // ------------------------------------------------------------------

    /// Latch an NMI. Coalesces: at most one in service plus one pending.
    pub fn inject_nmi(&self) {
        {
            let mut ev = self.events.lock();
            if ev.nmi_pending < Self::MAX_NMI_PENDING {
                ev.nmi_pending += 1;
            }
        }
        self.sched.unpark();
    }

    /// Assert the ExtINT request line (legacy PIC INTR).
    pub fn set_extint_pending(&self, pending: bool) {
        self.events.lock().extint_pending = pending;
        if pending {
            self.sched.unpark();
        }
    }

    /// Queue a hardware exception from instruction emulation.
    ///
    /// Merging with an already-pending exception (double-fault
    /// derivation) happens at injection time, not here.
    pub fn inject_exception(
        &self,
        vector: u8,
        error_code: Option<u32>,
    ) -> Result<(), VcpuError> {
        if vector >= 32 || vector == idt::NMI {
            return Err(VcpuError::InvalidArgument);
        }
        if error_code.is_some() != vector_has_errcode(vector) {
            return Err(VcpuError::InvalidArgument);
        }
        let mut ev = self.events.lock();
        ev.exception = Some(PendingException { vector, error_code });
        Ok(())
    }

    /// True if any wakeable condition is pending (used at HLT sleep).
    pub fn wakeable(&self) -> bool {
        let ev = self.events.lock();
        if ev.nmi_pending > 0 || ev.extint_pending || ev.exception.is_some() {
            return true;
        }
        drop(ev);
        self.lapic.lock().pending_vector().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_class() {
        assert_eq!(exception_class(idt::GP), ExceptionClass::Contributory);
        assert_eq!(exception_class(idt::PF), ExceptionClass::PageFault);
        assert_eq!(exception_class(idt::UD), ExceptionClass::Benign);
        assert_eq!(exception_class(idt::DE), ExceptionClass::Contributory);
    }

    #[test]
    fn test_inject_exception_validation() {
        let vcpu = Vcpu::new(0);
        // #GP requires an error code
        assert_eq!(
            vcpu.inject_exception(idt::GP, None),
            Err(VcpuError::InvalidArgument)
        );
        // #UD must not carry one
        assert_eq!(
            vcpu.inject_exception(idt::UD, Some(0)),
            Err(VcpuError::InvalidArgument)
        );
        // NMI is not injectable as an exception
        assert_eq!(
            vcpu.inject_exception(idt::NMI, None),
            Err(VcpuError::InvalidArgument)
        );
        vcpu.inject_exception(idt::UD, None).unwrap();
        assert_eq!(
            vcpu.events().lock().exception,
            Some(PendingException { vector: idt::UD, error_code: None })
        );
    }

    #[test]
    fn test_nmi_coalescing() {
        let vcpu = Vcpu::new(0);
        vcpu.inject_nmi();
        vcpu.inject_nmi();
        vcpu.inject_nmi();
        assert_eq!(vcpu.events().lock().nmi_pending, Vcpu::MAX_NMI_PENDING);
    }

    #[test]
    fn test_stream_order() {
        let vcpu = Vcpu::new(0);
        vcpu.push_ops([GuestOp::Sti, GuestOp::Hlt]);
        assert_eq!(vcpu.take_op(), Some(GuestOp::Sti));
        assert_eq!(vcpu.take_op(), Some(GuestOp::Hlt));
        assert_eq!(vcpu.take_op(), None);
    }
}
