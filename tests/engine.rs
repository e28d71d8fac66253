//! End-to-end engine scenarios driven through the public API: multiple
//! vCPU threads, cross-vCPU rendezvous on mapping changes, TLB tag
//! behavior across migrations, and the SVM backend path.

use std::sync::Arc;
use std::time::Duration;

use hvcore::backend::HostFeatures;
use hvcore::sched::RunState;
use hvcore::tlb::HostCpuRegistry;
use hvcore::vm::{VirtualMachine, VmConfig};
use hvcore::{GuestOp, MemSegment, Prot, SuspendReason, VcpuReg, VmCap, VmExit};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_vm(maxcpus: usize, features: HostFeatures) -> Arc<VirtualMachine> {
    let registry = Arc::new(HostCpuRegistry::new(8, 255));
    let cfg = VmConfig::new("itest", maxcpus).with_features(features);
    let vm = VirtualMachine::with_registry(cfg, registry).unwrap();
    for id in 0..maxcpus {
        vm.activate_vcpu(id);
    }
    vm
}

fn wait_for_state(vm: &VirtualMachine, vcpuid: usize, state: RunState) {
    for _ in 0..500 {
        if vm.vcpu(vcpuid).sched().state() == state {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("vcpu {} never reached {:?}", vcpuid, state);
}

/// A mapping change while vCPUs execute guest code must rendezvous all
/// of them through an exit boundary before it completes.
#[test]
fn test_map_change_rendezvous_all_running_vcpus() {
    init_logging();
    let vm = new_vm(2, HostFeatures::intel_default());

    let mut handles = Vec::new();
    for id in 0..2 {
        let vm2 = vm.clone();
        handles.push(std::thread::spawn(move || vm2.run(id, id)));
    }
    // Idle guests park in-kernel (halt-exit off by default).
    wait_for_state(&vm, 0, RunState::Sleeping);
    wait_for_state(&vm, 1, RunState::Sleeping);

    // This blocks until every active vCPU has passed an exit boundary.
    vm.map_memory(MemSegment::new(0, 0x100_0000, 0x10_0000), Prot::RWX, false).unwrap();

    for h in handles {
        assert_eq!(h.join().unwrap(), VmExit::Rendezvous);
    }
}

/// Migrating a vCPU to a different host CPU retires its TLB tag; the
/// next entry allocates a fresh one.
#[test]
fn test_migration_allocates_fresh_tag() {
    init_logging();
    let vm = new_vm(1, HostFeatures::amd_default());
    vm.set_capability(0, VmCap::HaltExit, true).unwrap();

    vm.vcpu(0).push_op(GuestOp::Hlt);
    assert!(matches!(vm.run(0, 0), VmExit::Hlt { .. }));
    let tag_on_cpu0 = vm.backend().with_ctx(0, |c| c.tlb_tag);

    // Same host CPU: the tag survives.
    vm.vcpu(0).push_op(GuestOp::Hlt);
    assert!(matches!(vm.run(0, 0), VmExit::Hlt { .. }));
    assert_eq!(vm.backend().with_ctx(0, |c| c.tlb_tag), tag_on_cpu0);

    // Migrate: a fresh tag must be allocated on the new CPU.
    vm.vcpu(0).push_op(GuestOp::Hlt);
    assert!(matches!(vm.run(0, 3), VmExit::Hlt { .. }));
    let tag_on_cpu3 = vm.backend().with_ctx(0, |c| c.tlb_tag);
    assert!(tag_on_cpu3.is_valid());
    assert_eq!(vm.backend().with_ctx(0, |c| c.last_hostcpu), Some(3));
}

/// A mapping change between runs triggers a selective flush (SVM with
/// flush-by-ASID) rather than a new tag.
#[test]
fn test_map_change_selective_flush() {
    init_logging();
    let vm = new_vm(1, HostFeatures::amd_default());
    vm.set_capability(0, VmCap::HaltExit, true).unwrap();

    vm.vcpu(0).push_op(GuestOp::Hlt);
    vm.run(0, 0);
    let tag = vm.backend().with_ctx(0, |c| c.tlb_tag);

    vm.map_memory(MemSegment::new(0, 0x100_0000, 0x1000), Prot::RWX, false).unwrap();

    vm.vcpu(0).push_op(GuestOp::Hlt);
    vm.run(0, 0);
    // Tag kept, but the guest ASID's entries were flushed.
    assert_eq!(vm.backend().with_ctx(0, |c| c.tlb_tag), tag);
    let stats = match vm.backend() {
        hvcore::ArchBackend::Svm(b) => b.stats(),
        _ => unreachable!(),
    };
    assert!(stats.flush_asid >= 1);
}

/// SVM path: an MMIO touch outside every in-kernel device surfaces as
/// instruction-emulation-required with captured bytes (decode assist).
#[test]
fn test_svm_inst_emul_carries_bytes() {
    init_logging();
    let vm = new_vm(1, HostFeatures::amd_default());
    vm.vcpu(0).push_op(GuestOp::MemWrite { gpa: 0xE000_0000, bytes: 4, value: 0xAA });
    match vm.run(0, 0) {
        VmExit::InstEmul { gpa, write, inst } => {
            assert_eq!(gpa, 0xE000_0000);
            assert!(write);
            assert!(inst.num_valid > 0);
        }
        other => panic!("unexpected exit {:?}", other),
    }
}

/// Guest-driven APIC timer tick delivers through the full loop.
#[test]
fn test_timer_interrupt_delivery() {
    init_logging();
    let vm = new_vm(1, HostFeatures::intel_default());
    vm.set_capability(0, VmCap::HaltExit, true).unwrap();
    vm.set_register(0, VcpuReg::Rflags, (1 << 1) | (1 << 9)); // reserved | IF

    {
        let mut lapic = vm.vcpu(0).lapic().lock();
        use hvcore::devices::lapic::reg;
        let base = hvcore::devices::lapic::LocalApic::DEFAULT_BASE;
        lapic.mmio_write(base + reg::TIMER_LVT as u64, 0xE0);
        lapic.mmio_write(base + reg::TIMER_DCR as u64, 0x0B);
        lapic.mmio_write(base + reg::TIMER_ICR as u64, 100);
    }
    vm.advance_timers(100);

    // Handler acknowledges via MMIO EOI and halts.
    let eoi_gpa = hvcore::devices::lapic::LocalApic::DEFAULT_BASE + 0xB0;
    vm.vcpu(0).push_ops([
        GuestOp::MemWrite { gpa: eoi_gpa, bytes: 4, value: 0 },
        GuestOp::Iret,
        GuestOp::Hlt,
    ]);
    let exit = vm.run(0, 0);
    assert!(matches!(exit, VmExit::Hlt { .. }));
    // Vector 0xE0 was delivered and retired.
    let mut lapic = vm.vcpu(0).lapic().lock();
    assert_eq!(lapic.pending_vector(), None);
    assert_eq!(lapic.eoi(), None, "EOI already retired the vector");
}

/// Suspending a VM from another thread pulls a sleeping vCPU out of its
/// in-kernel HLT.
#[test]
fn test_suspend_wakes_sleeping_vcpu() {
    init_logging();
    let vm = new_vm(1, HostFeatures::intel_default());
    let vm2 = vm.clone();
    let runner = std::thread::spawn(move || vm2.run(0, 0));
    wait_for_state(&vm, 0, RunState::Sleeping);
    vm.suspend(SuspendReason::PowerOff);
    assert_eq!(
        runner.join().unwrap(),
        VmExit::Suspended { reason: SuspendReason::PowerOff }
    );
}
