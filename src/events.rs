//! Event Injection Pipeline
//!
//! Arbitrates NMI, hardware exceptions, and external interrupts into the
//! single pending-event slot the hardware offers per entry, honoring the
//! guest's blocking state. Runs once per loop iteration, immediately
//! before the hardware VM-entry.
//!
//! Priority order:
//! 1. An event in flight at the previous exit, merged with any pending
//!    exception under the double-fault rules. Bypasses blocking checks:
//!    it is guest state that must be preserved exactly.
//! 2. NMI, unless blocked (no IRET retired since the last NMI), in an
//!    interrupt shadow, or the slot is occupied.
//! 3. Local APIC vector, then legacy-PIC ExtINT, requiring RFLAGS.IF,
//!    no shadow, and an empty slot; otherwise interrupt-window exiting
//!    is requested so injection is retried the instant it becomes legal.

use crate::cpu::{
    self, exception_class, idt, vector_has_errcode, ExceptionClass, PendingException, VcpuEvents,
};
use crate::devices::lapic::LocalApic;
use crate::devices::pic::DualPic;

/// Event classes the hardware injection slot distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ExtInt,
    Nmi,
    HwException,
}

/// One injectable event, architecture-neutral. The backends encode this
/// into their VM-entry interruption-information format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntInfo {
    pub kind: EventKind,
    pub vector: u8,
    pub error_code: Option<u32>,
}

impl IntInfo {
    pub fn interrupt(vector: u8) -> Self {
        Self { kind: EventKind::ExtInt, vector, error_code: None }
    }

    pub fn nmi() -> Self {
        Self { kind: EventKind::Nmi, vector: idt::NMI, error_code: None }
    }

    pub fn exception(vector: u8, error_code: Option<u32>) -> Self {
        debug_assert_eq!(error_code.is_some(), vector_has_errcode(vector));
        Self { kind: EventKind::HwException, vector, error_code }
    }

    fn class(&self) -> ExceptionClass {
        match self.kind {
            // Interrupt and NMI delivery faults are benign pairings
            EventKind::ExtInt | EventKind::Nmi => ExceptionClass::Benign,
            EventKind::HwException => exception_class(self.vector),
        }
    }
}

/// The guest entered triple-fault shutdown; the VM must be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripleFault;

/// Merge the event in flight at the previous exit with a newly pending
/// exception, per the double-fault derivation table (Intel SDM vol. 3,
/// "Conditions for Generating a Double Fault").
pub fn nested_fault(prior: IntInfo, new: PendingException) -> Result<IntInfo, TripleFault> {
    if prior.kind == EventKind::HwException && prior.vector == idt::DF {
        // A fault while delivering a double fault shuts the guest down.
        return Err(TripleFault);
    }
    let c1 = prior.class();
    let c2 = exception_class(new.vector);
    let double = (c1 == ExceptionClass::Contributory && c2 == ExceptionClass::Contributory)
        || (c1 == ExceptionClass::PageFault && c2 != ExceptionClass::Benign);
    if double {
        Ok(IntInfo::exception(idt::DF, Some(0)))
    } else {
        // Benign pairing: the second fault is delivered serially.
        Ok(IntInfo::exception(new.vector, new.error_code))
    }
}

/// Guest blocking state sampled from the hardware control block.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowState {
    /// STI/MOV-SS interrupt shadow active
    pub intr_shadow: bool,
    /// NMI blocked: no IRET retired since the last NMI delivery
    pub nmi_blocked: bool,
    /// RFLAGS.IF
    pub intr_enabled: bool,
    /// An event is already latched in the hardware injection slot
    pub slot_occupied: bool,
}

/// Where an injected event came from, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    ReInject,
    Exception,
    Nmi,
    Lapic,
    ExtInt,
}

/// Outcome of one arbitration pass. `inject` goes into the hardware
/// slot; the window requests tell the backend which exiting controls to
/// arm before entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectPlan {
    pub inject: Option<(IntInfo, EventSource)>,
    /// Injected event starts the NMI blocking window
    pub starts_nmi_blocking: bool,
    /// Injected exception collapses any interrupt shadow
    pub clears_shadow: bool,
    pub request_intr_window: bool,
    pub request_nmi_window: bool,
}

/// One arbitration pass over a vCPU's pending events.
///
/// Commits side effects for the event it selects: pending counters are
/// decremented, an accepted lapic vector moves IRR->ISR, an ExtINT runs
/// the PIC INTA cycle. Events that cannot be injected yet stay pending
/// and a window exit is requested instead.
pub fn arbitrate(
    events: &mut VcpuEvents,
    lapic: &mut LocalApic,
    mut pic: Option<&mut DualPic>,
    window: WindowState,
) -> Result<InjectPlan, TripleFault> {
    let mut plan = InjectPlan::default();

    // Step 1: re-inject in-flight state, merged with a pending exception.
    let prior = events.exit_intinfo.take();
    let pending_exc = events.exception.take();
    let merged = match (prior, pending_exc) {
        (Some(p), Some(e)) => Some((nested_fault(p, e)?, EventSource::ReInject)),
        (Some(p), None) => Some((p, EventSource::ReInject)),
        (None, Some(e)) => Some((
            IntInfo::exception(e.vector, e.error_code),
            EventSource::Exception,
        )),
        (None, None) => None,
    };
    if let Some((info, source)) = merged {
        // An occupied slot here means two sources raced into the single
        // hardware slot: an engine bug, not a guest condition.
        assert!(
            !window.slot_occupied,
            "event injection slot occupied while re-injecting {:?}",
            info
        );
        log::trace!("inject {:?} from {:?}", info, source);
        plan.inject = Some((info, source));
        plan.starts_nmi_blocking = info.kind == EventKind::Nmi;
        // Exception delivery tears down any STI shadow.
        plan.clears_shadow = info.kind == EventKind::HwException;
        // Leave interrupts for the next entry; ask for a window if any wait.
        if interrupt_waiting(events, lapic) {
            plan.request_intr_window = true;
        }
        return Ok(plan);
    }

    // Step 2: NMI.
    if events.nmi_pending > 0 {
        if window.nmi_blocked || window.intr_shadow {
            // Retry once the guest retires an IRET / leaves the shadow.
            plan.request_nmi_window = true;
        } else if window.slot_occupied {
            // Slot already carries an event; ask to be called back at
            // the earliest opportunity after it delivers.
            plan.request_nmi_window = true;
        } else {
            events.nmi_pending -= 1;
            plan.inject = Some((IntInfo::nmi(), EventSource::Nmi));
            plan.starts_nmi_blocking = true;
            if interrupt_waiting(events, lapic) {
                plan.request_intr_window = true;
            }
            return Ok(plan);
        }
    }

    // Step 3: external interrupts, lapic first, then legacy ExtINT.
    let lapic_vec = lapic.pending_vector();
    let extint = events.extint_pending;
    if lapic_vec.is_none() && !extint {
        return Ok(plan);
    }
    if !window.intr_enabled || window.intr_shadow || window.slot_occupied {
        plan.request_intr_window = true;
        return Ok(plan);
    }

    if let Some(vector) = lapic_vec {
        lapic.accept(vector);
        plan.inject = Some((IntInfo::interrupt(vector), EventSource::Lapic));
    } else {
        let pic = pic
            .as_deref_mut()
            .expect("extint pending without a PIC wired to this vcpu");
        let vector = pic.intack();
        events.extint_pending = pic.has_pending();
        plan.inject = Some((IntInfo::interrupt(vector), EventSource::ExtInt));
    }
    // More work queued behind this one: take a window exit right after.
    if interrupt_waiting(events, lapic) {
        plan.request_intr_window = true;
    }
    Ok(plan)
}

/// Another interrupt is already waiting behind the injected one.
fn interrupt_waiting(events: &VcpuEvents, lapic: &LocalApic) -> bool {
    lapic.pending_vector().is_some() || events.extint_pending
}

/// Queue an exception produced by in-kernel emulation, merging with any
/// exception already pending under the double-fault rules.
pub fn reflect_exception(
    events: &mut VcpuEvents,
    vector: u8,
    error_code: Option<u32>,
) -> Result<(), TripleFault> {
    let new = PendingException { vector, error_code };
    match events.exception {
        None => {
            events.exception = Some(new);
            Ok(())
        }
        Some(prior) => {
            let prior_info = IntInfo::exception(prior.vector, prior.error_code);
            let merged = nested_fault(prior_info, new)?;
            events.exception = Some(PendingException {
                vector: merged.vector,
                error_code: merged.error_code,
            });
            Ok(())
        }
    }
}

/// Record the event the hardware reported in flight at exit (IDT
/// vectoring / EXITINTINFO); re-injected with top priority next entry.
pub fn record_exit_intinfo(events: &mut VcpuEvents, info: IntInfo) {
    debug_assert!(
        events.exit_intinfo.is_none(),
        "exit intinfo already recorded for this exit"
    );
    events.exit_intinfo = Some(info);
}

/// Convenience for tests and emulation paths.
pub fn page_fault(error_code: u32) -> PendingException {
    PendingException { vector: idt::PF, error_code: Some(error_code) }
}

pub fn gp_fault() -> PendingException {
    PendingException { vector: cpu::idt::GP, error_code: Some(0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::lapic::reg;

    fn lapic() -> LocalApic {
        let mut l = LocalApic::new(0);
        l.mmio_write(LocalApic::DEFAULT_BASE + reg::SVR as u64, 0x1FF);
        l
    }

    fn open_window() -> WindowState {
        WindowState {
            intr_shadow: false,
            nmi_blocked: false,
            intr_enabled: true,
            slot_occupied: false,
        }
    }

    #[test]
    fn test_double_fault_derivation_table() {
        // (Contributory, Contributory) -> #DF
        let gp = IntInfo::exception(idt::GP, Some(0));
        let out = nested_fault(gp, PendingException { vector: idt::GP, error_code: Some(0) }).unwrap();
        assert_eq!(out.vector, idt::DF);
        assert_eq!(out.error_code, Some(0));

        // (PageFault, PageFault) -> #DF
        let pf = IntInfo::exception(idt::PF, Some(2));
        let out = nested_fault(pf, page_fault(4)).unwrap();
        assert_eq!(out.vector, idt::DF);

        // (PageFault, Benign) -> second fault delivered serially
        let out = nested_fault(pf, PendingException { vector: idt::UD, error_code: None }).unwrap();
        assert_eq!(out.vector, idt::UD);

        // (Benign, Contributory) -> serial as well
        let ud = IntInfo::exception(idt::UD, None);
        let out = nested_fault(ud, PendingException { vector: idt::GP, error_code: Some(0) }).unwrap();
        assert_eq!(out.vector, idt::GP);

        // Anything during #DF delivery -> triple fault
        let df = IntInfo::exception(idt::DF, Some(0));
        assert_eq!(nested_fault(df, page_fault(0)), Err(TripleFault));
    }

    #[test]
    fn test_reinject_has_top_priority() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        l.fire(0x80, false);
        ev.nmi_pending = 1;
        record_exit_intinfo(&mut ev, IntInfo::interrupt(0x30));

        let plan = arbitrate(&mut ev, &mut l, None, open_window()).unwrap();
        let (info, source) = plan.inject.unwrap();
        assert_eq!(source, EventSource::ReInject);
        assert_eq!(info.vector, 0x30);
        // NMI and lapic vector stay pending
        assert_eq!(ev.nmi_pending, 1);
        assert_eq!(l.pending_vector(), Some(0x80));
        assert!(plan.request_intr_window);
    }

    #[test]
    fn test_reinject_bypasses_blocking() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        record_exit_intinfo(&mut ev, IntInfo::nmi());
        let window = WindowState {
            intr_shadow: true,
            nmi_blocked: true,
            intr_enabled: false,
            slot_occupied: false,
        };
        let plan = arbitrate(&mut ev, &mut l, None, window).unwrap();
        assert_eq!(plan.inject.unwrap().0.kind, EventKind::Nmi);
        assert!(plan.starts_nmi_blocking);
    }

    #[test]
    fn test_nmi_blocked_requests_window() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        ev.nmi_pending = 1;
        let window = WindowState { nmi_blocked: true, ..open_window() };
        let plan = arbitrate(&mut ev, &mut l, None, window).unwrap();
        assert!(plan.inject.is_none());
        assert!(plan.request_nmi_window);
        assert_eq!(ev.nmi_pending, 1);
    }

    #[test]
    fn test_nmi_injects_and_sets_blocking() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        ev.nmi_pending = 2;
        let plan = arbitrate(&mut ev, &mut l, None, open_window()).unwrap();
        assert_eq!(plan.inject.unwrap().1, EventSource::Nmi);
        assert!(plan.starts_nmi_blocking);
        assert_eq!(ev.nmi_pending, 1);
    }

    #[test]
    fn test_nmi_in_shadow_deferred() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        ev.nmi_pending = 1;
        let window = WindowState { intr_shadow: true, ..open_window() };
        let plan = arbitrate(&mut ev, &mut l, None, window).unwrap();
        assert!(plan.inject.is_none());
        assert!(plan.request_nmi_window);
    }

    #[test]
    fn test_lapic_vector_accepted() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        l.fire(0x42, false);
        let plan = arbitrate(&mut ev, &mut l, None, open_window()).unwrap();
        let (info, source) = plan.inject.unwrap();
        assert_eq!(source, EventSource::Lapic);
        assert_eq!(info.vector, 0x42);
        // Accepted: moved from IRR into service
        assert_eq!(l.pending_vector(), None);
        assert_eq!(l.eoi(), Some((0x42, false)));
    }

    #[test]
    fn test_interrupt_needs_if_flag() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        l.fire(0x42, false);
        let window = WindowState { intr_enabled: false, ..open_window() };
        let plan = arbitrate(&mut ev, &mut l, None, window).unwrap();
        assert!(plan.inject.is_none());
        assert!(plan.request_intr_window);
        assert_eq!(l.pending_vector(), Some(0x42), "vector must stay pending");
    }

    #[test]
    fn test_extint_after_lapic() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        let mut pic = DualPic::new();
        pic.port_write(0x20, 0x11);
        pic.port_write(0x21, 0x20);
        pic.port_write(0x21, 0x04);
        pic.port_write(0x21, 0x01);
        pic.pulse_irq(1);
        ev.extint_pending = true;

        let plan = arbitrate(&mut ev, &mut l, Some(&mut pic), open_window()).unwrap();
        let (info, source) = plan.inject.unwrap();
        assert_eq!(source, EventSource::ExtInt);
        assert_eq!(info.vector, 0x21);
        assert!(!ev.extint_pending);
    }

    #[test]
    fn test_exception_priority_over_interrupt() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        l.fire(0x42, false);
        ev.exception = Some(gp_fault());
        let plan = arbitrate(&mut ev, &mut l, None, open_window()).unwrap();
        let (info, source) = plan.inject.unwrap();
        assert_eq!(source, EventSource::Exception);
        assert_eq!(info.vector, idt::GP);
        assert!(plan.clears_shadow);
        assert!(plan.request_intr_window);
    }

    #[test]
    #[should_panic(expected = "slot occupied")]
    fn test_slot_collision_is_fatal() {
        let mut ev = VcpuEvents::default();
        let mut l = lapic();
        ev.exception = Some(gp_fault());
        let window = WindowState { slot_occupied: true, ..open_window() };
        let _ = arbitrate(&mut ev, &mut l, None, window);
    }

    #[test]
    fn test_reflect_merges_to_double_fault() {
        let mut ev = VcpuEvents::default();
        reflect_exception(&mut ev, idt::GP, Some(0)).unwrap();
        reflect_exception(&mut ev, idt::GP, Some(0)).unwrap();
        assert_eq!(ev.exception.unwrap().vector, idt::DF);
        // Third contributory fault during #DF: shutdown
        assert_eq!(reflect_exception(&mut ev, idt::GP, Some(0)), Err(TripleFault));
    }
}
