//! VM Exit Records
//!
//! A tagged record produced fresh on every exit that reaches the caller.
//! Exits the dispatcher handles in-kernel (CPUID, lapic MMIO, interrupt
//! windows) never surface here; everything else carries exactly the
//! payload its reason class needs.

use crate::memory::Gpa;

/// Why the whole VM was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Reset,
    PowerOff,
    Halt,
    /// Guest took a fault while a double fault was being delivered
    TripleFault,
}

/// Access flavor for a nested-page fault surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NptFaultType {
    Read,
    Write,
    Exec,
}

/// Captured instruction bytes for emulation-required exits, when the
/// hardware supplies them (SVM decode assist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstBytes {
    pub bytes: [u8; 15],
    pub num_valid: u8,
}

/// One VM exit surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    /// I/O port access the in-kernel devices did not claim
    InOut {
        port: u16,
        bytes: u8,
        write: bool,
        /// Value for writes; register target for reads is implied (AL/AX/EAX)
        value: u32,
    },
    /// MSR read not owned by the lapic or the backend
    Rdmsr { msr: u32 },
    /// MSR write not owned by the lapic or the backend
    Wrmsr { msr: u32, value: u64 },
    /// Nested-page fault on RAM-backed GPA with no installed translation:
    /// a true paging error for the memory-map manager
    Paging { gpa: Gpa, fault: NptFaultType },
    /// Nested-page fault on an unbacked GPA no in-kernel device claimed:
    /// instruction emulation required
    InstEmul {
        gpa: Gpa,
        write: bool,
        inst: InstBytes,
    },
    /// Guest executed HLT with halt-exiting enabled
    Hlt { rflags: u64 },
    /// Guest executed PAUSE with pause-exiting enabled
    Pause,
    /// MWAIT/MONITOR surfaced for idle-policy decisions
    Mwait,
    Monitor,
    /// VM-wide suspend requested (or derived, e.g. triple fault)
    Suspended { reason: SuspendReason },
    /// This vCPU must service a rendezvous before continuing
    Rendezvous,
    /// Host asked this vCPU to idle (freeze for topology/register access)
    ReqIdle,
    /// Hardware rejected the VM entry; diagnostic, not guest-recoverable
    InstructionError { error: u32 },
    /// Exit was consumed locally; returned only in diagnostic paths
    Bogus,
}

impl VmExit {
    /// True for exit reasons the caller can resume from directly.
    pub fn resumable(&self) -> bool {
        !matches!(
            self,
            VmExit::Suspended { .. } | VmExit::InstructionError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        assert!(VmExit::Hlt { rflags: 0x202 }.resumable());
        assert!(VmExit::Rendezvous.resumable());
        assert!(!VmExit::Suspended { reason: SuspendReason::TripleFault }.resumable());
        assert!(!VmExit::InstructionError { error: 7 }.resumable());
    }
}
