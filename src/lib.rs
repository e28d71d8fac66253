//! hvcore - Hardware-Assisted Hypervisor Execution Engine
//!
//! The kernel component of a type-2 hypervisor: it multiplexes one
//! physical x86-64 CPU's virtualization extensions (Intel VT-x or AMD
//! SVM) across many guest virtual CPUs, emulates the minimal chipset
//! needed to deliver interrupts (local APIC, I/O APIC, legacy PIC), and
//! maintains the nested page tables translating guest-physical to
//! host-physical addresses.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        VirtualMachine                            │
//! │  ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌─────────────┐  │
//! │  │  Vcpu[n]   │ │   IoApic   │ │  LegacyPic  │ │  MMIO bus   │  │
//! │  │  LocalApic │ │  (shared)  │ │  (shared)   │ │ (registered)│  │
//! │  └─────┬──────┘ └────────────┘ └─────────────┘ └─────────────┘  │
//! │        │                                                         │
//! │  ┌─────▼──────────────────────────────────────────────────────┐  │
//! │  │ ExitDispatcher: poll -> inject -> enter -> classify        │  │
//! │  └─────┬──────────────────────────────────────────────────────┘  │
//! │  ┌─────▼──────────┐  ┌──────────────────┐  ┌────────────────┐    │
//! │  │  ArchBackend   │  │ NestedPageTable  │  │ TLB domain     │    │
//! │  │  (VMX | SVM)   │  │ (EPT | NPT)      │  │ (VPID | ASID)  │    │
//! │  └────────────────┘  └──────────────────┘  └────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The virtualization hardware is modeled in software behind the same
//! seam the kernel build fills with VMLAUNCH/VMRUN and the INV* family:
//! every state machine above it (event injection, interrupt priority,
//! TLB generations, rendezvous) is the real thing and is exercised by
//! the test suite.

// Core modules
pub mod cpu;
pub mod memory;
pub mod npt;
pub mod tlb;

// Interrupt controllers and in-kernel MMIO devices
pub mod devices;

// Event injection and exit handling
pub mod events;
pub mod exits;

// Architecture backends (Intel VT-x / AMD SVM)
pub mod backend;

// Execution engine
pub mod dispatch;
pub mod sched;
pub mod vm;

pub use backend::{ArchBackend, BackendError, BackendResult, CpuVendor, HostFeatures, VmCap};
pub use cpu::{GuestOp, SegReg, SegmentDescriptor, Vcpu, VcpuReg};
pub use exits::{SuspendReason, VmExit};
pub use memory::{Gpa, Hpa, MemSegment};
pub use npt::{NestedPageTable, Prot, TableFormat};
pub use sched::{CpuSet, RunState};
pub use vm::{VirtualMachine, VmConfig};

/// Engine-level error: every typed failure a caller can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HvError {
    #[error(transparent)]
    Backend(#[from] backend::BackendError),
    #[error(transparent)]
    Memory(#[from] memory::MemError),
    #[error(transparent)]
    Vcpu(#[from] cpu::VcpuError),
}

pub type HvResult<T> = Result<T, HvError>;

/// Engine version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
