//! vCPU Scheduling Glue
//!
//! The per-vCPU run-state machine, the sleep/wakeup primitive used for
//! in-kernel HLT idling, and the all-vCPU rendezvous barrier. Guest
//! execution is never interrupted mid-instruction: rendezvous requests
//! are noticed only at exit boundaries and at sleep entry.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Scheduling state of one vCPU.
///
/// All transitions pass through FROZEN: the device-control layer freezes
/// a vCPU before touching its registers or topology, and the run loop
/// moves FROZEN -> RUNNING / SLEEPING around guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Frozen,
    Running,
    Sleeping,
}

fn transition_ok(from: RunState, to: RunState) -> bool {
    use RunState::*;
    matches!(
        (from, to),
        (Idle, Frozen) | (Frozen, Idle) | (Frozen, Running) | (Frozen, Sleeping)
            | (Running, Frozen) | (Sleeping, Frozen)
    )
}

struct SchedInner {
    state: RunState,
    /// Host CPU currently running this vCPU; valid only while RUNNING
    hostcpu: Option<usize>,
}

/// Run-state plus the condition variable HLT sleeping parks on.
pub struct VcpuSched {
    inner: Mutex<SchedInner>,
    cv: Condvar,
}

impl VcpuSched {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedInner { state: RunState::Idle, hostcpu: None }),
            cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn hostcpu(&self) -> Option<usize> {
        self.inner.lock().hostcpu
    }

    /// Transition the run state. An invalid transition is an engine or
    /// locking-protocol bug and panics.
    pub fn set_state(&self, to: RunState, hostcpu: Option<usize>) {
        let mut inner = self.inner.lock();
        assert!(
            transition_ok(inner.state, to),
            "invalid vcpu state transition {:?} -> {:?}",
            inner.state,
            to
        );
        inner.state = to;
        inner.hostcpu = if to == RunState::Running { hostcpu } else { None };
        self.cv.notify_all();
    }

    /// Park until `wakeable` holds. The closure is evaluated under the
    /// scheduling lock, so a wakeup between the check and the wait
    /// cannot be lost.
    pub fn park<F: Fn() -> bool>(&self, wakeable: F) {
        let mut inner = self.inner.lock();
        while !wakeable() {
            self.cv.wait(&mut inner);
        }
    }

    /// Wake a parked vCPU so it re-evaluates its pending conditions.
    pub fn unpark(&self) {
        let _guard = self.inner.lock();
        self.cv.notify_all();
    }
}

impl Default for VcpuSched {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CPU sets
// ============================================================================

/// Small-set bitmap over vCPU indices (up to 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(pub u64);

impl CpuSet {
    pub const EMPTY: CpuSet = CpuSet(0);

    pub fn single(id: usize) -> Self {
        CpuSet(1 << id)
    }

    pub fn first_n(n: usize) -> Self {
        if n >= 64 {
            CpuSet(u64::MAX)
        } else {
            CpuSet((1u64 << n) - 1)
        }
    }

    pub fn set(&mut self, id: usize) {
        self.0 |= 1 << id;
    }

    pub fn clear(&mut self, id: usize) {
        self.0 &= !(1 << id);
    }

    pub fn contains(&self, id: usize) -> bool {
        self.0 & (1 << id) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |&i| self.contains(i))
    }
}

// ============================================================================
// Rendezvous
// ============================================================================

type RendezvousFn = Arc<dyn Fn(usize) + Send + Sync>;

struct RendezvousReq {
    targets: CpuSet,
    done: CpuSet,
    func: RendezvousFn,
}

/// Cooperative all-vCPU barrier.
///
/// Each target vCPU notices the request at an exit boundary (or sleep
/// entry), runs the callback exactly once, and marks itself done; every
/// waiter blocks until the done-set equals the target set. Only one
/// rendezvous is in flight at a time.
pub struct Rendezvous {
    inner: Mutex<Option<RendezvousReq>>,
    cv: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None), cv: Condvar::new() }
    }

    /// True if a request is pending that `vcpuid` has not serviced yet.
    pub fn pending_for(&self, vcpuid: usize) -> bool {
        match &*self.inner.lock() {
            Some(req) => req.targets.contains(vcpuid) && !req.done.contains(vcpuid),
            None => false,
        }
    }

    pub fn active(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Install a new request. Blocks while a previous one is still in
    /// flight. An empty target set completes immediately.
    pub fn initiate(&self, targets: CpuSet, func: RendezvousFn) {
        let mut inner = self.inner.lock();
        while inner.is_some() {
            self.cv.wait(&mut inner);
        }
        if targets.is_empty() {
            return;
        }
        *inner = Some(RendezvousReq { targets, done: CpuSet::EMPTY, func });
        self.cv.notify_all();
    }

    /// Called by a vCPU at an exit boundary: execute the callback once
    /// if this vCPU is a target. Returns true if work was done.
    pub fn service(&self, vcpuid: usize) -> bool {
        let func = {
            let mut inner = self.inner.lock();
            match inner.as_mut() {
                Some(req) if req.targets.contains(vcpuid) && !req.done.contains(vcpuid) => {
                    req.func.clone()
                }
                _ => return false,
            }
        };
        // Run the callback without holding the lock: it may take VM
        // locks of its own (TLB invalidation, mapping updates).
        func(vcpuid);
        let mut inner = self.inner.lock();
        if let Some(req) = inner.as_mut() {
            req.done.set(vcpuid);
            if req.done == req.targets {
                *inner = None;
                self.cv.notify_all();
            }
        }
        true
    }

    /// Block until the in-flight request (if any) completes.
    pub fn wait_complete(&self) {
        let mut inner = self.inner.lock();
        while inner.is_some() {
            self.cv.wait(&mut inner);
        }
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let sched = VcpuSched::new();
        assert_eq!(sched.state(), RunState::Idle);
        sched.set_state(RunState::Frozen, None);
        sched.set_state(RunState::Running, Some(2));
        assert_eq!(sched.hostcpu(), Some(2));
        sched.set_state(RunState::Frozen, None);
        assert_eq!(sched.hostcpu(), None);
        sched.set_state(RunState::Sleeping, None);
        sched.set_state(RunState::Frozen, None);
        sched.set_state(RunState::Idle, None);
    }

    #[test]
    #[should_panic(expected = "invalid vcpu state transition")]
    fn test_invalid_transition_panics() {
        let sched = VcpuSched::new();
        sched.set_state(RunState::Running, Some(0));
    }

    #[test]
    fn test_park_unpark() {
        let sched = Arc::new(VcpuSched::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let s2 = sched.clone();
        let w2 = woken.clone();
        let handle = std::thread::spawn(move || {
            s2.park(|| w2.load(Ordering::SeqCst) > 0);
        });
        std::thread::sleep(Duration::from_millis(20));
        woken.store(1, Ordering::SeqCst);
        sched.unpark();
        handle.join().unwrap();
    }

    #[test]
    fn test_cpuset() {
        let mut set = CpuSet::first_n(3);
        assert_eq!(set.count(), 3);
        assert!(set.contains(0) && set.contains(2));
        set.clear(1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_rendezvous_completes_when_all_service() {
        let rdv = Arc::new(Rendezvous::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        rdv.initiate(
            CpuSet::first_n(2),
            Arc::new(move |_id| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(rdv.active());
        assert!(rdv.pending_for(0));
        assert!(rdv.service(0));
        // Servicing twice is a no-op
        assert!(!rdv.service(0));
        assert!(rdv.active(), "still waiting on vcpu 1");
        assert!(rdv.service(1));
        assert!(!rdv.active());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        rdv.wait_complete();
    }

    #[test]
    fn test_rendezvous_cross_thread() {
        let rdv = Arc::new(Rendezvous::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        rdv.initiate(
            CpuSet::first_n(4),
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut handles = Vec::new();
        for id in 0..4 {
            let r = rdv.clone();
            handles.push(std::thread::spawn(move || {
                r.service(id);
            }));
        }
        rdv.wait_complete();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_non_target_not_pending() {
        let rdv = Rendezvous::new();
        rdv.initiate(CpuSet::single(1), Arc::new(|_| {}));
        assert!(!rdv.pending_for(0));
        assert!(!rdv.service(0));
        assert!(rdv.service(1));
        assert!(!rdv.active());
    }
}
