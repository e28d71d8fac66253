//! Virtual Machine Container
//!
//! Owns the guest physical address space, the nested page table, the
//! shared interrupt controllers, the vCPU array, and the suspend and
//! rendezvous coordination blocks. Created empty; memory segments and
//! vCPUs are activated lazily; destroyed only after every vCPU is back
//! in a frozen or idle state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{ArchBackend, BackendResult, HostFeatures, VmCap};
use crate::HvResult;
use crate::cpu::{SegReg, SegmentDescriptor, Vcpu, VcpuReg};
use crate::devices::ioapic::{IoApic, IoApicDelivery, IoApicDeliveryKind};
use crate::devices::lapic::{IpiKind, IpiRequest, IpiTarget};
use crate::devices::pic::DualPic;
use crate::devices::MmioBus;
use crate::exits::{SuspendReason, VmExit};
use crate::memory::{Gpa, GuestMemoryMap, MemSegment};
use crate::npt::{NestedPageTable, Prot};
use crate::sched::{CpuSet, Rendezvous, RunState};
use crate::tlb::{host_registry, HostCpuRegistry};

/// VM construction parameters.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    pub maxcpus: usize,
    pub features: HostFeatures,
}

impl VmConfig {
    pub fn new(name: &str, maxcpus: usize) -> Self {
        Self {
            name: name.to_string(),
            maxcpus,
            features: HostFeatures::intel_default(),
        }
    }

    pub fn with_features(mut self, features: HostFeatures) -> Self {
        self.features = features;
        self
    }
}

/// One virtual machine.
pub struct VirtualMachine {
    name: String,
    backend: ArchBackend,
    vcpus: Vec<Arc<Vcpu>>,
    mem: RwLock<GuestMemoryMap>,
    npt: Mutex<NestedPageTable>,
    /// Bumped on every map/unmap; the TLB consistency check keys off it
    map_gen: AtomicU64,
    ioapic: Mutex<IoApic>,
    pic: Mutex<DualPic>,
    mmio: RwLock<MmioBus>,
    rendezvous: Rendezvous,
    suspend: Mutex<Option<SuspendReason>>,
    active: Mutex<CpuSet>,
    registry: Arc<HostCpuRegistry>,
    /// Machine-check exits re-vectored to the host handler
    host_mce_count: AtomicU64,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> HvResult<Arc<Self>> {
        Self::with_registry(config, host_registry())
    }

    /// Construction with an explicit host-CPU registry (tests use a
    /// private registry for deterministic tag generations).
    pub fn with_registry(
        config: VmConfig,
        registry: Arc<HostCpuRegistry>,
    ) -> HvResult<Arc<Self>> {
        assert!(config.maxcpus >= 1 && config.maxcpus <= 64);
        let backend = ArchBackend::probe(config.features, config.maxcpus)?;
        let npt = NestedPageTable::new(backend.table_format(), backend.page_caps());
        let vcpus = (0..config.maxcpus).map(|id| Arc::new(Vcpu::new(id))).collect();
        log::debug!("vm {}: created with {} vcpus", config.name, config.maxcpus);
        Ok(Arc::new(Self {
            name: config.name,
            backend,
            vcpus,
            mem: RwLock::new(GuestMemoryMap::new()),
            npt: Mutex::new(npt),
            map_gen: AtomicU64::new(0),
            ioapic: Mutex::new(IoApic::new(0)),
            pic: Mutex::new(DualPic::new()),
            mmio: RwLock::new(MmioBus::new()),
            rendezvous: Rendezvous::new(),
            suspend: Mutex::new(None),
            active: Mutex::new(CpuSet::EMPTY),
            registry,
            host_mce_count: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &ArchBackend {
        &self.backend
    }

    pub fn vcpu(&self, id: usize) -> &Arc<Vcpu> {
        &self.vcpus[id]
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn ioapic(&self) -> &Mutex<IoApic> {
        &self.ioapic
    }

    pub fn pic(&self) -> &Mutex<DualPic> {
        &self.pic
    }

    pub fn mmio(&self) -> &RwLock<MmioBus> {
        &self.mmio
    }

    pub fn npt(&self) -> &Mutex<NestedPageTable> {
        &self.npt
    }

    pub fn registry(&self) -> &Arc<HostCpuRegistry> {
        &self.registry
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    // ------------------------------------------------------------------
    // vCPU lifecycle
    // ------------------------------------------------------------------

    /// Bring a vCPU out of IDLE; it joins the active set targeted by
    /// rendezvous and broadcast IPIs.
    pub fn activate_vcpu(&self, id: usize) {
        self.vcpus[id].sched().set_state(RunState::Frozen, None);
        self.active.lock().set(id);
    }

    pub fn active_cpus(&self) -> CpuSet {
        *self.active.lock()
    }

    /// Reinitialize for reboot: every vCPU must be frozen or idle.
    pub fn reinit(&self) {
        for (id, vcpu) in self.vcpus.iter().enumerate() {
            let state = vcpu.sched().state();
            assert!(
                state == RunState::Frozen || state == RunState::Idle,
                "vm reinit with vcpu {} in {:?}",
                id,
                state
            );
            vcpu.reinit();
            self.backend.vcpu_reset(id);
        }
        self.npt.lock().teardown();
        self.mem.write().clear_all();
        self.map_gen.fetch_add(1, Ordering::SeqCst);
        self.ioapic.lock().reset();
        self.pic.lock().reset();
        *self.suspend.lock() = None;
    }

    // ------------------------------------------------------------------
    // Guest physical memory
    // ------------------------------------------------------------------

    pub fn map_gen(&self) -> u64 {
        self.map_gen.load(Ordering::SeqCst)
    }

    /// Register a RAM segment and install its translations.
    pub fn map_memory(&self, seg: MemSegment, prot: Prot, superpages: bool) -> HvResult<()> {
        self.mem.write().insert(seg)?;
        self.npt.lock().map(seg.gpa, seg.hpa, seg.len, prot, superpages);
        self.invalidate_mappings();
        Ok(())
    }

    /// Drop the segment starting at `gpa` and its translations.
    pub fn unmap_memory(&self, gpa: Gpa) -> Option<MemSegment> {
        let seg = self.mem.write().remove(gpa)?;
        self.npt.lock().unmap(seg.gpa, seg.len);
        self.invalidate_mappings();
        Some(seg)
    }

    pub fn is_ram(&self, gpa: Gpa) -> bool {
        self.mem.read().is_ram(gpa)
    }

    /// Bump the mapping generation and force every running vCPU through
    /// an exit boundary so none keeps executing on stale translations.
    fn invalidate_mappings(&self) {
        self.map_gen.fetch_add(1, Ordering::SeqCst);
        let mut targets = CpuSet::EMPTY;
        for (id, vcpu) in self.vcpus.iter().enumerate() {
            match vcpu.sched().state() {
                RunState::Running | RunState::Sleeping => targets.set(id),
                _ => {}
            }
        }
        if targets.is_empty() {
            // Nobody is executing guest code; the resume-time generation
            // check picks the change up.
            return;
        }
        self.rendezvous.initiate(targets, Arc::new(|_id| {}));
        for id in targets.iter() {
            self.vcpus[id].kick();
        }
        self.rendezvous.wait_complete();
    }

    // ------------------------------------------------------------------
    // Interrupt sources
    // ------------------------------------------------------------------

    /// Latch a fixed interrupt straight into a vCPU's local APIC.
    pub fn lapic_fire(&self, vcpuid: usize, vector: u8, level: bool) -> bool {
        let accepted = self.vcpus[vcpuid].lapic().lock().fire(vector, level);
        if accepted {
            self.vcpus[vcpuid].sched().unpark();
        }
        accepted
    }

    pub fn inject_nmi(&self, vcpuid: usize) {
        self.vcpus[vcpuid].inject_nmi();
        self.vcpus[vcpuid].kick();
    }

    /// I/O APIC pin operations.
    pub fn ioapic_assert(&self, pin: usize) {
        let delivery = self.ioapic.lock().assert_pin(pin);
        if let Some(d) = delivery {
            self.route_ioapic(d);
        }
    }

    pub fn ioapic_deassert(&self, pin: usize) {
        self.ioapic.lock().deassert_pin(pin);
    }

    pub fn ioapic_pulse(&self, pin: usize) {
        let delivery = self.ioapic.lock().pulse_pin(pin);
        if let Some(d) = delivery {
            self.route_ioapic(d);
        }
    }

    pub(crate) fn route_ioapic(&self, d: IoApicDelivery) {
        let Some(vcpu) = self.vcpus.get(d.dest as usize) else {
            log::warn!("vm {}: ioapic delivery to unknown apic {}", self.name, d.dest);
            return;
        };
        match d.kind {
            IoApicDeliveryKind::Fixed { vector, level } => {
                vcpu.lapic().lock().fire(vector, level);
                vcpu.sched().unpark();
            }
            IoApicDeliveryKind::Nmi => vcpu.inject_nmi(),
        }
    }

    /// Legacy PIC line operations; INTR routes to the BSP's ExtINT pin.
    pub fn pic_assert(&self, irq: u8) {
        let pending = {
            let mut pic = self.pic.lock();
            pic.assert_irq(irq);
            pic.has_pending()
        };
        self.vcpus[0].set_extint_pending(pending);
    }

    pub fn pic_deassert(&self, irq: u8) {
        let pending = {
            let mut pic = self.pic.lock();
            pic.deassert_irq(irq);
            pic.has_pending()
        };
        self.vcpus[0].set_extint_pending(pending);
    }

    pub fn pic_pulse(&self, irq: u8) {
        let pending = {
            let mut pic = self.pic.lock();
            pic.pulse_irq(irq);
            pic.has_pending()
        };
        self.vcpus[0].set_extint_pending(pending);
    }

    /// Re-evaluate the PIC INTR line after port I/O touched it.
    pub(crate) fn refresh_extint(&self) {
        let pending = self.pic.lock().has_pending();
        self.vcpus[0].set_extint_pending(pending);
    }

    /// Deliver an IPI decoded from an ICR write on `from`'s lapic.
    pub(crate) fn route_ipi(&self, from: usize, req: IpiRequest) {
        let mut targets = CpuSet::EMPTY;
        match req.target {
            IpiTarget::Apic(id) => {
                if (id as usize) < self.vcpus.len() {
                    targets.set(id as usize);
                }
            }
            IpiTarget::SelfOnly => targets.set(from),
            IpiTarget::AllIncludingSelf => targets = self.active_cpus(),
            IpiTarget::AllExcludingSelf => {
                targets = self.active_cpus();
                targets.clear(from);
            }
        }
        for id in targets.iter() {
            match req.kind {
                IpiKind::Fixed { vector } => {
                    self.vcpus[id].lapic().lock().fire(vector, false);
                    self.vcpus[id].sched().unpark();
                }
                IpiKind::Nmi => self.inject_nmi(id),
                IpiKind::Init | IpiKind::Startup { .. } => {
                    // vCPU spin-up belongs to the device-control layer.
                    log::debug!("vm {}: dropping INIT/SIPI to vcpu {}", self.name, id);
                }
            }
        }
    }

    /// Advance every local APIC timer by `ticks` input clocks.
    pub fn advance_timers(&self, ticks: u64) {
        for vcpu in &self.vcpus {
            vcpu.lapic().lock().advance_timer(ticks);
            vcpu.sched().unpark();
        }
    }

    // ------------------------------------------------------------------
    // Suspend / resume
    // ------------------------------------------------------------------

    /// Suspend the whole VM. The first reason sticks; every vCPU is
    /// kicked so its run loop returns a Suspended record.
    pub fn suspend(&self, reason: SuspendReason) {
        {
            let mut s = self.suspend.lock();
            if s.is_some() {
                return;
            }
            *s = Some(reason);
        }
        log::debug!("vm {}: suspending ({:?})", self.name, reason);
        for vcpu in &self.vcpus {
            vcpu.kick();
        }
    }

    pub fn suspended(&self) -> Option<SuspendReason> {
        *self.suspend.lock()
    }

    // ------------------------------------------------------------------
    // Device-control surface (vCPU must be FROZEN)
    // ------------------------------------------------------------------

    fn assert_frozen(&self, vcpuid: usize) {
        debug_assert!(
            self.vcpus[vcpuid].sched().state() != RunState::Running,
            "register access to a running vcpu"
        );
    }

    pub fn get_register(&self, vcpuid: usize, reg: VcpuReg) -> u64 {
        self.assert_frozen(vcpuid);
        match reg {
            // TPR shadows the lapic task-priority register
            VcpuReg::Tpr => (self.vcpus[vcpuid].lapic().lock().ppr() >> 4) as u64,
            _ => self.backend.get_register(vcpuid, reg),
        }
    }

    pub fn set_register(&self, vcpuid: usize, reg: VcpuReg, value: u64) {
        self.assert_frozen(vcpuid);
        self.backend.set_register(vcpuid, reg, value);
    }

    pub fn get_descriptor(&self, vcpuid: usize, seg: SegReg) -> SegmentDescriptor {
        self.assert_frozen(vcpuid);
        self.backend.get_descriptor(vcpuid, seg)
    }

    pub fn set_descriptor(&self, vcpuid: usize, seg: SegReg, desc: SegmentDescriptor) {
        self.assert_frozen(vcpuid);
        self.backend.set_descriptor(vcpuid, seg, desc);
    }

    pub fn get_capability(&self, vcpuid: usize, cap: VmCap) -> BackendResult<bool> {
        self.backend.get_capability(vcpuid, cap)
    }

    pub fn set_capability(&self, vcpuid: usize, cap: VmCap, enable: bool) -> BackendResult<()> {
        self.backend.set_capability(vcpuid, cap, enable)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run one vCPU until an exit surfaces to the caller. The vCPU must
    /// be FROZEN (activated); `hostcpu` is the host CPU this thread is
    /// bound to.
    pub fn run(&self, vcpuid: usize, hostcpu: usize) -> VmExit {
        crate::dispatch::run_vcpu(self, vcpuid, hostcpu)
    }

    pub(crate) fn note_host_machine_check(&self) {
        self.host_mce_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Machine-check exits re-vectored to the host handler so far.
    pub fn host_machine_checks(&self) -> u64 {
        self.host_mce_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn vm() -> Arc<VirtualMachine> {
        VirtualMachine::new(VmConfig::new("test", 2)).unwrap()
    }

    #[test]
    fn test_create_and_activate() {
        let vm = vm();
        assert_eq!(vm.vcpu_count(), 2);
        assert!(vm.active_cpus().is_empty());
        vm.activate_vcpu(0);
        assert!(vm.active_cpus().contains(0));
        assert_eq!(vm.vcpu(0).sched().state(), RunState::Frozen);
    }

    #[test]
    fn test_map_memory_bumps_generation() {
        let vm = vm();
        let g0 = vm.map_gen();
        vm.map_memory(MemSegment::new(0, 0x10_0000, 0x4000), Prot::RWX, false).unwrap();
        assert!(vm.map_gen() > g0);
        assert!(vm.is_ram(0x2000));
        assert_eq!(vm.npt().lock().translate(0x2000).unwrap().hpa, 0x10_2000);

        let g1 = vm.map_gen();
        vm.unmap_memory(0).unwrap();
        assert!(vm.map_gen() > g1);
        assert!(!vm.is_ram(0x2000));
        assert!(vm.npt().lock().translate(0x2000).is_none());
    }

    #[test]
    fn test_suspend_first_reason_sticks() {
        let vm = vm();
        vm.suspend(SuspendReason::TripleFault);
        vm.suspend(SuspendReason::PowerOff);
        assert_eq!(vm.suspended(), Some(SuspendReason::TripleFault));
    }

    #[test]
    fn test_pic_routes_extint_to_bsp() {
        let vm = vm();
        {
            let mut pic = vm.pic().lock();
            pic.port_write(0x20, 0x11);
            pic.port_write(0x21, 0x20);
            pic.port_write(0x21, 0x04);
            pic.port_write(0x21, 0x01);
        }
        vm.pic_pulse(1);
        assert!(vm.vcpu(0).events().lock().extint_pending);
        assert!(!vm.vcpu(1).events().lock().extint_pending);
    }

    #[test]
    fn test_ioapic_routes_to_dest_lapic() {
        let vm = vm();
        {
            // Pin 3 -> vector 0x33, dest apic 1, edge
            let mut ioapic = vm.ioapic().lock();
            use crate::devices::ioapic::{indirect, reg};
            ioapic.mmio_write(IoApic::DEFAULT_BASE + reg::IOREGSEL as u64, (indirect::REDTBL_BASE + 6) as u32);
            ioapic.mmio_write(IoApic::DEFAULT_BASE + reg::IOWIN as u64, 0x33);
            ioapic.mmio_write(IoApic::DEFAULT_BASE + reg::IOREGSEL as u64, (indirect::REDTBL_BASE + 7) as u32);
            ioapic.mmio_write(IoApic::DEFAULT_BASE + reg::IOWIN as u64, 1 << 24);
        }
        vm.ioapic_pulse(3);
        assert_eq!(vm.vcpu(1).lapic().lock().pending_vector(), Some(0x33));
        assert_eq!(vm.vcpu(0).lapic().lock().pending_vector(), None);
    }

    #[test]
    fn test_ipi_broadcast_excluding_self() {
        let vm = vm();
        vm.activate_vcpu(0);
        vm.activate_vcpu(1);
        vm.route_ipi(
            0,
            IpiRequest { target: IpiTarget::AllExcludingSelf, kind: IpiKind::Fixed { vector: 0x55 } },
        );
        assert_eq!(vm.vcpu(0).lapic().lock().pending_vector(), None);
        assert_eq!(vm.vcpu(1).lapic().lock().pending_vector(), Some(0x55));
    }

    #[test]
    fn test_reinit_resets_state() {
        let vm = vm();
        vm.activate_vcpu(0);
        vm.map_memory(MemSegment::new(0, 0, PAGE_SIZE), Prot::RWX, false).unwrap();
        vm.lapic_fire(0, 0x40, false);
        vm.suspend(SuspendReason::Reset);
        vm.reinit();
        assert_eq!(vm.suspended(), None);
        assert!(!vm.is_ram(0));
        assert_eq!(vm.vcpu(0).lapic().lock().pending_vector(), None);
    }
}
