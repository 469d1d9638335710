//! Scheduler
//!
//! Task scheduling and the cooperative phase machinery. The interface is
//! what the rest of the core consumes: `spawn` against a task count and
//! wait guards that block until the count drains back to zero. The
//! implementation runs closures on a tokio blocking pool; nothing async
//! leaks out of this module.

use std::sync::{Arc, Condvar, Mutex};

use tokio::runtime::{Builder, Runtime};

/// Counts outstanding tasks belonging to one logical group.
#[derive(Clone, Default)]
pub struct TaskCount {
    inner: Arc<CountInner>,
}

#[derive(Default)]
struct CountInner {
    count: Mutex<usize>,
    cv: Condvar,
}

impl TaskCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a task started outside `Scheduler::spawn` (scoped
    /// dispatch).
    pub fn start(&self) {
        *self.inner.count.lock().unwrap() += 1;
    }

    /// Mark a started task finished.
    pub fn finish(&self) {
        let mut c = self.inner.count.lock().unwrap();
        *c -= 1;
        if *c == 0 {
            self.inner.cv.notify_all();
        }
    }

    pub fn current(&self) -> usize {
        *self.inner.count.lock().unwrap()
    }

    /// Block until the count returns to zero.
    pub fn wait(&self) {
        let mut c = self.inner.count.lock().unwrap();
        while *c != 0 {
            c = self.inner.cv.wait(c).unwrap();
        }
    }
}

/// Blocks on drop until the associated task count drains.
pub struct WaitGuard {
    count: TaskCount,
    waited: bool,
}

impl WaitGuard {
    pub fn new(count: TaskCount) -> Self {
        Self {
            count,
            waited: false,
        }
    }

    pub fn wait(mut self) {
        self.count.wait();
        self.waited = true;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.waited {
            self.count.wait();
        }
    }
}

/// The task scheduler.
pub struct Scheduler {
    rt: Runtime,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_threads(0)
    }

    /// Create with an explicit worker thread cap (0 = runtime default).
    pub fn with_threads(threads: usize) -> Self {
        let mut b = Builder::new_multi_thread();
        if threads != 0 {
            b.max_blocking_threads(threads);
        }
        let rt = b.build().expect("scheduler runtime");
        Self { rt }
    }

    /// Dispatch a task against the given count.
    pub fn spawn(&self, count: &TaskCount, f: impl FnOnce() + Send + 'static) {
        count.start();
        let count = count.clone();
        self.rt.spawn_blocking(move || {
            f();
            count.finish();
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Build context phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Match,
    Execute,
}

/// Counter-protected phase barrier.
///
/// Threads lock the current phase; a thread that needs a different phase
/// blocks until all holders of the current one reach a quiescent point.
/// No thread may hold a target match in progress across a boundary.
pub struct PhaseMutex {
    state: Mutex<PhaseState>,
    cv: Condvar,
}

struct PhaseState {
    phase: Phase,
    holders: usize,
}

impl PhaseMutex {
    pub fn new(initial: Phase) -> Self {
        Self {
            state: Mutex::new(PhaseState {
                phase: initial,
                holders: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    /// Acquire the given phase, switching once the previous phase has
    /// quiesced.
    pub fn lock(&self, phase: Phase) -> PhaseGuard<'_> {
        let mut s = self.state.lock().unwrap();
        while s.phase != phase && s.holders != 0 {
            s = self.cv.wait(s).unwrap();
        }
        s.phase = phase;
        s.holders += 1;
        PhaseGuard { mutex: self, phase }
    }
}

impl Default for PhaseMutex {
    fn default() -> Self {
        Self::new(Phase::Load)
    }
}

/// Holds a phase; released on drop.
pub struct PhaseGuard<'a> {
    mutex: &'a PhaseMutex,
    phase: Phase,
}

impl<'a> PhaseGuard<'a> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Temporarily switch to another phase (for example match → execute
    /// to force an update of a generated header), restoring the original
    /// phase when the returned guard drops.
    pub fn switch(&self, phase: Phase) -> PhaseSwitch<'_> {
        self.release();
        let inner = self.mutex.lock(phase);
        PhaseSwitch {
            outer: self,
            inner: Some(inner),
        }
    }

    fn release(&self) {
        let mut s = self.mutex.state.lock().unwrap();
        s.holders -= 1;
        if s.holders == 0 {
            self.mutex.cv.notify_all();
        }
    }

    fn reacquire(&self) {
        let mut s = self.mutex.state.lock().unwrap();
        while s.phase != self.phase && s.holders != 0 {
            s = self.mutex.cv.wait(s).unwrap();
        }
        s.phase = self.phase;
        s.holders += 1;
    }
}

impl<'a> Drop for PhaseGuard<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Restores the outer phase on drop.
pub struct PhaseSwitch<'a> {
    outer: &'a PhaseGuard<'a>,
    inner: Option<PhaseGuard<'a>>,
}

impl<'a> Drop for PhaseSwitch<'a> {
    fn drop(&mut self) {
        // Release the temporary phase before taking the outer one back.
        self.inner.take();
        self.outer.reacquire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_spawn_and_wait() {
        let s = Scheduler::new();
        let count = TaskCount::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let hits = hits.clone();
            s.spawn(&count, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        WaitGuard::new(count.clone()).wait();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert_eq!(count.current(), 0);
    }

    #[test]
    fn test_wait_guard_drop_waits() {
        let s = Scheduler::new();
        let count = TaskCount::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            s.spawn(&count, move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                hits.fetch_add(1, Ordering::SeqCst);
            });
            let _g = WaitGuard::new(count.clone());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_phase_lock_same_phase_concurrent() {
        let pm = PhaseMutex::new(Phase::Match);
        let g1 = pm.lock(Phase::Match);
        let g2 = pm.lock(Phase::Match);
        assert_eq!(g1.phase(), Phase::Match);
        drop(g2);
        drop(g1);
        assert_eq!(pm.current(), Phase::Match);
    }

    #[test]
    fn test_phase_switch_restores() {
        let pm = PhaseMutex::new(Phase::Match);
        let g = pm.lock(Phase::Match);
        {
            let _sw = g.switch(Phase::Execute);
            assert_eq!(pm.current(), Phase::Execute);
        }
        assert_eq!(pm.current(), Phase::Match);
        drop(g);
    }

    #[test]
    fn test_phase_transition_waits_for_quiescence() {
        let pm = Arc::new(PhaseMutex::new(Phase::Load));
        let g = pm.lock(Phase::Load);

        let pm2 = pm.clone();
        let t = std::thread::spawn(move || {
            let _g = pm2.lock(Phase::Match);
            assert_eq!(pm2.current(), Phase::Match);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        // Still in load while we hold it.
        assert_eq!(pm.current(), Phase::Load);
        drop(g);
        t.join().unwrap();
    }
}
