//! Keeps an asynchronous checkpoint out of the window between a
//! descriptor-creating syscall and the registry update that follows it.
//!
//! Everything here is a plain atomic or a thread-local: `disable()`/`enable()`
//! run inside intercepted libc calls and `suspend()` may run in a signal
//! handler. Waiting is done by sleeping, never by taking a lock.

use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

const WAIT_INTERVAL: Duration = Duration::from_micros(200);

thread_local! {
    /// Brackets open on this thread. A thread brackets through one gate at a
    /// time.
    static THREAD_DEPTH: Cell<usize> = Cell::new(0);
    /// A suspension this thread could not take inside its own bracket.
    static THREAD_PENDING: Cell<bool> = Cell::new(false);
}

pub struct CkptGate {
    /// Open brackets, all threads.
    depth: AtomicUsize,
    /// Set from the moment a suspension is granted until `resume()`. No new
    /// bracket opens while it is set.
    suspended: AtomicBool,
    /// A `fn()` stored as usize; 0 when unset.
    on_suspend: AtomicUsize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Suspension {
    /// No bracket is open anywhere; the caller may be stopped now.
    Granted,
    /// The calling thread is inside a bracket itself. The suspension handler
    /// runs when that bracket's outermost level exits.
    Deferred,
}

/// Checkpointing stays disabled while this is alive.
#[must_use]
pub struct CkptDisabled<'a> {
    gate: &'a CkptGate,
}

impl Drop for CkptDisabled<'_> {
    fn drop(&mut self) {
        self.gate.enable();
    }
}

impl CkptGate {
    pub const fn new() -> CkptGate {
        CkptGate {
            depth: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
            on_suspend: AtomicUsize::new(0),
        }
    }

    /// Waits while a granted suspension is in force, unless this thread
    /// already holds a bracket.
    pub fn disable(&self) -> CkptDisabled<'_> {
        let nested = THREAD_DEPTH.with(|d| d.get() > 0);
        loop {
            self.depth.fetch_add(1, Ordering::SeqCst);
            if nested || !self.suspended.load(Ordering::SeqCst) {
                break;
            }
            // Back off so the suspender sees the counter drain.
            self.depth.fetch_sub(1, Ordering::SeqCst);
            while self.suspended.load(Ordering::SeqCst) {
                thread::sleep(WAIT_INTERVAL);
            }
        }
        THREAD_DEPTH.with(|d| d.set(d.get() + 1));
        CkptDisabled { gate: self }
    }

    fn enable(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            fatal!("Checkpoint gate enabled more often than disabled");
        }
        let outermost = THREAD_DEPTH.with(|d| {
            let n = d.get().saturating_sub(1);
            d.set(n);
            n == 0
        });
        if outermost && THREAD_PENDING.with(|p| p.replace(false)) {
            self.deliver();
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.depth() == 0
    }

    /// Called on a thread about to be stopped for a checkpoint. Returns once
    /// every bracket of every other thread has closed; from then on new
    /// brackets wait for `resume()`.
    pub fn suspend(&self) -> Suspension {
        if THREAD_DEPTH.with(|d| d.get() > 0) {
            THREAD_PENDING.with(|p| p.set(true));
            return Suspension::Deferred;
        }
        self.suspended.store(true, Ordering::SeqCst);
        while self.depth.load(Ordering::SeqCst) > 0 {
            thread::sleep(WAIT_INTERVAL);
        }
        Suspension::Granted
    }

    /// Threads run again: brackets may open.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Whether this thread has a deferred suspension waiting for its bracket
    /// to exit.
    pub fn suspend_pending(&self) -> bool {
        THREAD_PENDING.with(|p| p.get())
    }

    pub fn set_suspend_handler(&self, handler: fn()) {
        self.on_suspend.store(handler as usize, Ordering::SeqCst);
    }

    fn deliver(&self) {
        let addr = self.on_suspend.load(Ordering::SeqCst);
        if addr != 0 {
            let handler: fn() = unsafe { std::mem::transmute(addr) };
            handler();
        }
    }

    /// fork() child: only the forking thread survives, so no bracket can be
    /// open in it except the one around fork() itself.
    pub fn reset(&self) {
        self.depth.store(0, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
        THREAD_DEPTH.with(|d| d.set(0));
        THREAD_PENDING.with(|p| p.set(false));
    }
}

impl Default for CkptGate {
    fn default() -> Self {
        CkptGate::new()
    }
}
