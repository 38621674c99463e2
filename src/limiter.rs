// src/limiter.rs
//
// =============================================================================
// GRAPHLOOM: PROCESS LIMITER
// =============================================================================
//
// Two gates, one escape hatch.
//
// The engine caps the number of one-shot subprocesses and persistent
// subprocesses that items may hold at any moment. A plain semaphore is not
// enough: the caps change at runtime (settings may say "unlimited") and a
// task that blocks waiting for *another* task's side effect must be able to
// park its permit for the duration of the wait, or two writers ordering
// their commits against each other deadlock with both permits held.

use crate::core::AppSettings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Maximum number of concurrently held permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLimit {
    Bounded(usize),
    Unlimited,
}

struct SemaphoreState {
    limit: ProcessLimit,
    count: usize,
}

/// A semaphore whose limit can change while permits are held. Raising the
/// limit (or switching to unlimited) wakes every waiter.
pub struct ProcessSemaphore {
    state: Mutex<SemaphoreState>,
    available: Condvar,
}

impl Default for ProcessSemaphore {
    fn default() -> Self {
        Self::new(ProcessLimit::Bounded(1))
    }
}

impl ProcessSemaphore {
    pub fn new(limit: ProcessLimit) -> Self {
        Self {
            state: Mutex::new(SemaphoreState { limit, count: 0 }),
            available: Condvar::new(),
        }
    }

    /// Waits until the permit count drops below the limit. Returns false if
    /// the timeout elapsed first.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if Self::try_bump(&mut state) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                }
                None => {
                    state = self.available.wait(state).unwrap();
                }
            }
        }
    }

    fn try_bump(state: &mut SemaphoreState) -> bool {
        match state.limit {
            ProcessLimit::Unlimited => {
                state.count += 1;
                true
            }
            ProcessLimit::Bounded(limit) if state.count < limit => {
                state.count += 1;
                true
            }
            ProcessLimit::Bounded(_) => false,
        }
    }

    /// Returns a permit and notifies one waiter.
    pub fn release(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.count == 0 {
                // Logic error upstream, do not wrap below zero.
                log::error!("process semaphore released more times than acquired");
                return;
            }
            state.count -= 1;
        }
        self.available.notify_one();
    }

    /// Changes the limit. A larger or unlimited cap wakes every waiter.
    pub fn set_limit(&self, limit: ProcessLimit) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            if state.limit == limit {
                return;
            }
            let previous = state.limit;
            state.limit = limit;
            previous
        };
        let grew = match (previous, limit) {
            (_, ProcessLimit::Unlimited) => true,
            (ProcessLimit::Unlimited, _) => false,
            (ProcessLimit::Bounded(old), ProcessLimit::Bounded(new)) => new > old,
        };
        if grew {
            self.available.notify_all();
        }
    }

    pub fn held_permits(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// Parks the caller's permit while it waits for another task to make
    /// progress. The permit is reacquired (blocking) when the guard drops.
    pub fn maybe_idle(&self) -> IdleGuard<'_> {
        self.release();
        IdleGuard { semaphore: self }
    }
}

/// Guard produced by [`ProcessSemaphore::maybe_idle`].
pub struct IdleGuard<'a> {
    semaphore: &'a ProcessSemaphore,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.acquire(None);
    }
}

// ============================================================================
// THE ENGINE'S LIMITS
// ============================================================================

/// The two process gates owned by one engine, plus the flag that stops new
/// persistent processes from being created after a user stop.
pub struct ProcessLimits {
    pub one_shot: ProcessSemaphore,
    pub persistent: ProcessSemaphore,
    persistent_creation_enabled: AtomicBool,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            one_shot: ProcessSemaphore::new(ProcessLimit::Bounded(1)),
            persistent: ProcessSemaphore::new(ProcessLimit::Bounded(1)),
            persistent_creation_enabled: AtomicBool::new(true),
        }
    }
}

impl ProcessLimits {
    /// Applies the limiter settings:
    /// `engineSettings/processLimiter` = "auto" | "unlimited" | anything,
    /// with `engineSettings/maxProcesses` as the explicit cap (and the
    /// matching pair for persistent processes).
    pub fn configure(&self, settings: &AppSettings) {
        let one_shot = limit_from_settings(
            settings,
            "engineSettings/processLimiter",
            "engineSettings/maxProcesses",
            "auto",
        );
        self.one_shot.set_limit(one_shot);
        let persistent = limit_from_settings(
            settings,
            "engineSettings/persistentLimiter",
            "engineSettings/maxPersistentProcesses",
            "unlimited",
        );
        self.persistent.set_limit(persistent);
    }

    pub fn enable_persistent_process_creation(&self) {
        self.persistent_creation_enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_persistent_process_creation(&self) {
        self.persistent_creation_enabled.store(false, Ordering::SeqCst);
    }

    pub fn persistent_process_creation_enabled(&self) -> bool {
        self.persistent_creation_enabled.load(Ordering::SeqCst)
    }
}

fn limit_from_settings(
    settings: &AppSettings,
    limiter_key: &str,
    max_key: &str,
    default: &str,
) -> ProcessLimit {
    match settings.str_value(limiter_key, default).as_str() {
        "unlimited" => ProcessLimit::Unlimited,
        "auto" => ProcessLimit::Bounded(num_cpus::get()),
        _ => {
            let fallback = num_cpus::get();
            let max = settings
                .str_value(max_key, &fallback.to_string())
                .parse()
                .unwrap_or(fallback);
            ProcessLimit::Bounded(max)
        }
    }
}
