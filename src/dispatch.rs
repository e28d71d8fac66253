//! Exit Dispatcher
//!
//! Drives a vCPU's entry/exit loop: polls cancellation and rendezvous at
//! every boundary, runs the injection pipeline, performs the hardware
//! entry, then classifies the exit. Handled exits advance the resume
//! point and loop; unhandled exits surface a typed record to the caller.

use std::sync::Arc;

use crate::backend::{CpuVendor, EntryParams, RawExitReason, VmCap};
use crate::cpu::{idt, msr, Vcpu, VcpuReg};
use crate::events::{self, TripleFault};
use crate::exits::{NptFaultType, SuspendReason, VmExit};
use crate::memory::Gpa;
use crate::sched::RunState;
use crate::tlb::CpuTag;
use crate::vm::VirtualMachine;

/// Run one vCPU until an exit must surface. The vCPU must be FROZEN.
pub fn run_vcpu(vm: &VirtualMachine, vcpuid: usize, hostcpu: usize) -> VmExit {
    let vcpu = vm.vcpu(vcpuid).clone();
    vcpu.sched().set_state(RunState::Running, Some(hostcpu));
    let exit = run_loop(vm, &vcpu, hostcpu);
    // Never leave a rendezvous initiator waiting on a vCPU that is
    // about to stop running.
    vm.rendezvous().service(vcpuid);
    vcpu.sched().set_state(RunState::Frozen, None);
    log::trace!("vm {} vcpu {}: exit {:?}", vm.name(), vcpuid, exit);
    exit
}

fn run_loop(vm: &VirtualMachine, vcpu: &Arc<Vcpu>, hostcpu: usize) -> VmExit {
    let vcpuid = vcpu.id();
    let backend = vm.backend();
    let flush_by_tag = match backend.vendor() {
        CpuVendor::Intel => true, // INVVPID
        CpuVendor::Amd => backend.features().flush_by_asid,
    };

    loop {
        // Coordination polls come first; none of these may be delayed
        // into the hardware-entry window.
        if let Some(reason) = vm.suspended() {
            return VmExit::Suspended { reason };
        }
        if vm.rendezvous().pending_for(vcpuid) {
            vm.rendezvous().service(vcpuid);
            return VmExit::Rendezvous;
        }
        if vcpu.take_reqidle() {
            return VmExit::ReqIdle;
        }

        // Two-axis TLB check: migration invalidates the cached tag; a
        // mapping-generation change forces at least a selective flush.
        let (cached, seen) =
            backend.with_ctx(vcpuid, |c| {
                (if c.last_hostcpu == Some(hostcpu) { c.tlb_tag } else { CpuTag::INVALID }, c.seen_gen)
            });
        if !cached.is_valid() {
            log::trace!("vm {} vcpu {}: fresh TLB tag on hostcpu {}", vm.name(), vcpuid, hostcpu);
        }
        let cur_gen = vm.map_gen();
        let tlb = vm.registry().activate(hostcpu, cached, seen, cur_gen, flush_by_tag);
        backend.with_ctx_mut(vcpuid, |c| {
            c.last_hostcpu = Some(hostcpu);
            c.seen_gen = cur_gen;
        });

        // Injection pipeline, once per iteration, right before entry.
        let window = backend.window_state(vcpuid);
        let plan = {
            let mut ev = vcpu.events().lock();
            let mut lapic = vcpu.lapic().lock();
            let mut pic = vm.pic().lock();
            events::arbitrate(&mut ev, &mut lapic, Some(&mut *pic), window)
        };
        let plan = match plan {
            Ok(p) => p,
            Err(TripleFault) => {
                vm.suspend(SuspendReason::TripleFault);
                continue;
            }
        };

        // Hardware entry. Host interrupts are masked around the real
        // entry; the model observes kicks only at this boundary.
        let raw = {
            let npt = vm.npt().lock();
            backend.enter(vcpu, EntryParams { plan, npt: &npt, tlb })
        };

        match raw.reason {
            // Handled locally: the host interrupt already ran, or the
            // window exit exists only to re-run the pipeline.
            RawExitReason::HostInterrupt
            | RawExitReason::IntrWindow
            | RawExitReason::NmiWindow => continue,

            RawExitReason::Cpuid => {
                emulate_cpuid(vm, vcpuid);
                advance(vm, vcpuid, raw.inst_len);
                continue;
            }

            RawExitReason::Hlt => {
                advance(vm, vcpuid, raw.inst_len);
                if backend.get_capability(vcpuid, VmCap::HaltExit).unwrap_or(false) {
                    let rflags = backend.get_register(vcpuid, VcpuReg::Rflags);
                    return VmExit::Hlt { rflags };
                }
                idle_sleep(vm, vcpu, hostcpu);
                continue;
            }

            RawExitReason::Pause => {
                advance(vm, vcpuid, raw.inst_len);
                return VmExit::Pause;
            }

            RawExitReason::Mwait => {
                if backend.get_capability(vcpuid, VmCap::MwaitExit).unwrap_or(false) {
                    return VmExit::Mwait;
                }
                // Without the cap, MWAIT retires as a NOP.
                advance(vm, vcpuid, raw.inst_len);
                continue;
            }

            RawExitReason::Monitor => {
                if backend.get_capability(vcpuid, VmCap::MwaitExit).unwrap_or(false) {
                    return VmExit::Monitor;
                }
                advance(vm, vcpuid, raw.inst_len);
                continue;
            }

            RawExitReason::VirtInstr => {
                // Guest nesting is statically intercepted: reflect #UD.
                vcpu.inject_exception(idt::UD, None).expect("#UD injection");
                continue;
            }

            RawExitReason::Exception { vector, error_code, idt_vectoring } => {
                if let Some(v) = idt_vectoring {
                    events::record_exit_intinfo(&mut vcpu.events().lock(), v);
                }
                if vector == idt::MC {
                    // Machine checks re-vector to the host handler; the
                    // guest never sees them.
                    vm.note_host_machine_check();
                    continue;
                }
                let reflected = events::reflect_exception(
                    &mut vcpu.events().lock(),
                    vector,
                    error_code,
                );
                if reflected.is_err() {
                    vm.suspend(SuspendReason::TripleFault);
                }
                continue;
            }

            RawExitReason::InOut { port, bytes, write, value } => {
                if crate::devices::pic::DualPic::handles_port(port) {
                    emulate_pic_port(vm, vcpuid, port, write, value);
                    advance(vm, vcpuid, raw.inst_len);
                    continue;
                }
                return VmExit::InOut { port, bytes, write, value };
            }

            RawExitReason::Msr { write, num, value } => {
                match emulate_msr(vm, vcpuid, write, num, value) {
                    MsrOutcome::Handled => {
                        advance(vm, vcpuid, raw.inst_len);
                        continue;
                    }
                    MsrOutcome::GpFault => {
                        vcpu.inject_exception(idt::GP, Some(0)).expect("#GP injection");
                        continue;
                    }
                    MsrOutcome::Surface => {
                        return if write {
                            VmExit::Wrmsr { msr: num, value }
                        } else {
                            VmExit::Rdmsr { msr: num }
                        };
                    }
                }
            }

            RawExitReason::NptFault { gpa, write, bytes, value, idt_vectoring, inst } => {
                if vm.is_ram(gpa) {
                    // RAM-backed but untranslated: a genuine paging error
                    // for the memory-map manager. An event that was in
                    // flight must be preserved for re-injection.
                    if let Some(v) = idt_vectoring {
                        events::record_exit_intinfo(&mut vcpu.events().lock(), v);
                    }
                    let fault = if write { NptFaultType::Write } else { NptFaultType::Read };
                    return VmExit::Paging { gpa, fault };
                }
                if emulate_mmio(vm, vcpu, gpa, write, bytes, value) {
                    // Emulation completed the instruction, so delivery of
                    // any injected event completed too; nothing to chain.
                    advance(vm, vcpuid, raw.inst_len);
                    continue;
                }
                if let Some(v) = idt_vectoring {
                    events::record_exit_intinfo(&mut vcpu.events().lock(), v);
                }
                return VmExit::InstEmul { gpa, write, inst };
            }

            RawExitReason::InvalidEntry { error } => {
                // Diagnostic: the control block was inconsistent. Not
                // guest-recoverable.
                return VmExit::InstructionError { error };
            }
        }
    }
}

/// Advance the resume point past a fully-handled instruction.
fn advance(vm: &VirtualMachine, vcpuid: usize, inst_len: u64) {
    let next = vm.backend().with_ctx_mut(vcpuid, |c| {
        let next = c.rip + inst_len;
        c.advance_rip(next);
        next
    });
    vm.vcpu(vcpuid).events().lock().nextrip = next;
}

/// In-kernel HLT: park until something can wake the guest.
fn idle_sleep(vm: &VirtualMachine, vcpu: &Arc<Vcpu>, hostcpu: usize) {
    let sched = vcpu.sched();
    sched.set_state(RunState::Frozen, None);
    sched.set_state(RunState::Sleeping, None);
    sched.park(|| {
        vcpu.wakeable()
            || vcpu.kicked()
            || vm.suspended().is_some()
            || vm.rendezvous().pending_for(vcpu.id())
    });
    sched.set_state(RunState::Frozen, None);
    sched.set_state(RunState::Running, Some(hostcpu));
}

// ============================================================================
// CPUID emulation
// ============================================================================

/// Hypervisor identification leaf range base.
pub const CPUID_HV_BASE: u32 = 0x4000_0000;

fn emulate_cpuid(vm: &VirtualMachine, vcpuid: usize) {
    let backend = vm.backend();
    let leaf = backend.get_register(vcpuid, VcpuReg::Rax) as u32;
    let subleaf = backend.get_register(vcpuid, VcpuReg::Rcx) as u32;
    let (a, b, c, d) = cpuid_leaf(backend.vendor(), leaf, subleaf, vcpuid, vm.vcpu_count());
    backend.set_register(vcpuid, VcpuReg::Rax, a as u64);
    backend.set_register(vcpuid, VcpuReg::Rbx, b as u64);
    backend.set_register(vcpuid, VcpuReg::Rcx, c as u64);
    backend.set_register(vcpuid, VcpuReg::Rdx, d as u64);
}

fn vendor_string(vendor: CpuVendor) -> [u32; 3] {
    // CPUID.0: EBX:EDX:ECX byte order
    let s: &[u8; 12] = match vendor {
        CpuVendor::Intel => b"GenuineIntel",
        CpuVendor::Amd => b"AuthenticAMD",
    };
    [
        u32::from_le_bytes([s[0], s[1], s[2], s[3]]),
        u32::from_le_bytes([s[8], s[9], s[10], s[11]]),
        u32::from_le_bytes([s[4], s[5], s[6], s[7]]),
    ]
}

/// CPUID feature bits the engine reports in leaf 1.
mod cpuid_bits {
    // EDX
    pub const FPU: u32 = 1 << 0;
    pub const TSC: u32 = 1 << 4;
    pub const MSR: u32 = 1 << 5;
    pub const PAE: u32 = 1 << 6;
    pub const CX8: u32 = 1 << 8;
    pub const APIC: u32 = 1 << 9;
    pub const PGE: u32 = 1 << 13;
    pub const CMOV: u32 = 1 << 15;
    pub const FXSR: u32 = 1 << 24;
    pub const SSE: u32 = 1 << 25;
    pub const SSE2: u32 = 1 << 26;
    // ECX
    pub const SSE3: u32 = 1 << 0;
    pub const CX16: u32 = 1 << 13;
    pub const POPCNT: u32 = 1 << 23;
    pub const HYPERVISOR: u32 = 1 << 31;
}

fn cpuid_leaf(
    vendor: CpuVendor,
    leaf: u32,
    _subleaf: u32,
    vcpuid: usize,
    ncpus: usize,
) -> (u32, u32, u32, u32) {
    use cpuid_bits::*;
    let vs = vendor_string(vendor);
    match leaf {
        0x0 => (0xD, vs[0], vs[1], vs[2]),
        0x1 => {
            // Family 6 model 0x3F-ish signature; initial APIC id in EBX
            let eax = 0x000_3_06_F0;
            let ebx = ((vcpuid as u32) << 24) | ((ncpus as u32) << 16) | (8 << 8);
            let ecx = SSE3 | CX16 | POPCNT | HYPERVISOR;
            let edx = FPU | TSC | MSR | PAE | CX8 | APIC | PGE | CMOV | FXSR | SSE | SSE2;
            (eax, ebx, ecx, edx)
        }
        CPUID_HV_BASE => {
            let sig: &[u8; 12] = b"hvcorehvcore";
            (
                CPUID_HV_BASE,
                u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]]),
                u32::from_le_bytes([sig[4], sig[5], sig[6], sig[7]]),
                u32::from_le_bytes([sig[8], sig[9], sig[10], sig[11]]),
            )
        }
        0x8000_0000 => (0x8000_0008, vs[0], vs[1], vs[2]),
        0x8000_0008 => {
            // Physical/linear address widths
            (0x0000_3028, 0, (ncpus as u32 - 1) & 0xFF, 0)
        }
        _ => (0, 0, 0, 0),
    }
}

// ============================================================================
// MSR emulation
// ============================================================================

enum MsrOutcome {
    Handled,
    GpFault,
    Surface,
}

const EFER_KNOWN: u64 =
    msr::efer::SCE | msr::efer::LME | msr::efer::LMA | msr::efer::NXE | msr::efer::SVME;

fn emulate_msr(vm: &VirtualMachine, vcpuid: usize, write: bool, num: u32, value: u64) -> MsrOutcome {
    let backend = vm.backend();
    match num {
        // Lapic-owned
        msr::IA32_APIC_BASE => {
            if write {
                vm.vcpu(vcpuid).lapic().lock().set_apic_base_msr(value);
            } else {
                let v = vm.vcpu(vcpuid).lapic().lock().apic_base_msr();
                set_msr_result(vm, vcpuid, v);
            }
            MsrOutcome::Handled
        }
        // Backend-owned
        msr::IA32_EFER => {
            if write {
                if value & !EFER_KNOWN != 0 {
                    return MsrOutcome::GpFault;
                }
                backend.with_ctx_mut(vcpuid, |c| c.efer = value);
            } else {
                let v = backend.with_ctx(vcpuid, |c| c.efer);
                set_msr_result(vm, vcpuid, v);
            }
            MsrOutcome::Handled
        }
        _ => MsrOutcome::Surface,
    }
}

fn set_msr_result(vm: &VirtualMachine, vcpuid: usize, value: u64) {
    let backend = vm.backend();
    backend.set_register(vcpuid, VcpuReg::Rax, value & 0xFFFF_FFFF);
    backend.set_register(vcpuid, VcpuReg::Rdx, value >> 32);
}

// ============================================================================
// Port I/O and MMIO fallback
// ============================================================================

fn emulate_pic_port(vm: &VirtualMachine, vcpuid: usize, port: u16, write: bool, value: u32) {
    if write {
        vm.pic().lock().port_write(port, value as u8);
    } else {
        let v = vm.pic().lock().port_read(port);
        vm.backend().set_register(vcpuid, VcpuReg::Rax, v as u64);
    }
    vm.refresh_extint();
}

/// Route a faulting access to the in-kernel MMIO devices. Returns false
/// if no device claims the address (instruction emulation required).
fn emulate_mmio(
    vm: &VirtualMachine,
    vcpu: &Arc<Vcpu>,
    gpa: Gpa,
    write: bool,
    bytes: u8,
    value: u64,
) -> bool {
    let vcpuid = vcpu.id();

    // Per-vCPU local APIC window
    let lapic_claims = vcpu.lapic().lock().handles(gpa);
    if lapic_claims {
        if write {
            let is_eoi = vcpu.lapic().lock().is_eoi_offset(gpa);
            if is_eoi {
                let retired = vcpu.lapic().lock().eoi();
                if let Some((vector, level)) = retired {
                    if level {
                        let redeliver = vm.ioapic().lock().eoi(vector);
                        for d in redeliver {
                            vm.route_ioapic(d);
                        }
                    }
                }
            } else {
                let ipi = vcpu.lapic().lock().mmio_write(gpa, value as u32);
                if let Some(req) = ipi {
                    vm.route_ipi(vcpuid, req);
                }
            }
        } else {
            let v = vcpu.lapic().lock().mmio_read(gpa);
            vm.backend().set_register(vcpuid, VcpuReg::Rax, v as u64);
        }
        return true;
    }

    // Shared I/O APIC window
    let ioapic_claims = vm.ioapic().lock().handles(gpa);
    if ioapic_claims {
        if write {
            let delivery = vm.ioapic().lock().mmio_write(gpa, value as u32);
            if let Some(d) = delivery {
                vm.route_ioapic(d);
            }
        } else {
            let v = vm.ioapic().lock().mmio_read(gpa);
            vm.backend().set_register(vcpuid, VcpuReg::Rax, v as u64);
        }
        return true;
    }

    // Externally registered in-kernel devices
    let mmio = vm.mmio().read();
    if mmio.claims(gpa) {
        if write {
            mmio.write(gpa, bytes, value);
        } else if let Some(v) = mmio.read(gpa, bytes) {
            vm.backend().set_register(vcpuid, VcpuReg::Rax, v);
        }
        return true;
    }
    false
}
