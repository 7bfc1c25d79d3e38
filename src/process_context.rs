//! Per-process state of the agent: the registry, the checkpoint gate and the
//! lifecycle latches around them.

use crate::{
    ckpt_gate::CkptGate,
    flags::Flags,
    log::LogLevel::{LogDebug, LogError, LogInfo},
    registry::ConnectionRegistry,
};
use libc::pid_t;
use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

lazy_static! {
    static ref PROCESS: Arc<ProcessContext> = {
        let flags = Flags::get();
        Arc::new(ProcessContext::new(
            nix::unistd::getpid().as_raw(),
            flags.strict_registry,
            flags.adopt_inherited,
        ))
    };
}

thread_local! {
    /// The registry lock held by the thread calling fork(), from the prepare
    /// handler until the parent/child handler.
    static FORK_GUARD: RefCell<Option<MutexGuard<'static, Option<ConnectionRegistry>>>> =
        RefCell::new(None);

    /// Nonzero while this thread runs agent code. The exported wrappers pass
    /// such calls straight to libc: the agent's own file handling must not
    /// come back into the registry it is holding.
    static AGENT_DEPTH: Cell<usize> = Cell::new(0);
}

struct AgentScope;

impl AgentScope {
    fn enter() -> AgentScope {
        AGENT_DEPTH.with(|d| d.set(d.get() + 1));
        AgentScope
    }
}

impl Drop for AgentScope {
    fn drop(&mut self) {
        AGENT_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Is this thread already inside the agent?
pub fn in_agent() -> bool {
    AGENT_DEPTH.with(|d| d.get() > 0)
}

/// Run `f` as agent code; see `in_agent`.
pub fn agent_scope<R, F: FnOnce() -> R>(f: F) -> R {
    let _scope = AgentScope::enter();
    f()
}

pub struct ProcessContext {
    pid: AtomicI32,
    initialized: AtomicBool,
    gate: CkptGate,
    strict: bool,
    adopt: bool,
    /// Created on first use.
    registry: Mutex<Option<ConnectionRegistry>>,
}

impl ProcessContext {
    pub fn new(pid: pid_t, strict: bool, adopt: bool) -> ProcessContext {
        ProcessContext {
            pid: AtomicI32::new(pid),
            initialized: AtomicBool::new(false),
            gate: CkptGate::new(),
            strict,
            adopt,
            registry: Mutex::new(None),
        }
    }

    /// A process that starts out with `registry`, e.g. the child side of a
    /// fork.
    pub fn from_registry(registry: ConnectionRegistry) -> ProcessContext {
        let ctx = ProcessContext::new(registry.pid(), true, false);
        ctx.initialized.store(true, Ordering::SeqCst);
        *ctx.lock_registry() = Some(registry);
        ctx
    }

    pub fn global() -> &'static Arc<ProcessContext> {
        &*PROCESS
    }

    pub fn pid(&self) -> pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn gate(&self) -> &CkptGate {
        &self.gate
    }

    fn lock_registry(&self) -> MutexGuard<'_, Option<ConnectionRegistry>> {
        // Interceptors run inside arbitrary application code; a panic in one
        // of them must not wedge every later close().
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_registry<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut ConnectionRegistry) -> R,
    {
        let _scope = AgentScope::enter();
        let mut guard = self.lock_registry();
        let pid = self.pid();
        let strict = self.strict;
        f(guard.get_or_insert_with(|| ConnectionRegistry::new(pid, strict)))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The registry already describes every descriptor we care about, e.g.
    /// right after a restart rebuilt it.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// First touch: pick up descriptors inherited across exec().
    pub fn ensure_initialized(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.adopt {
            return;
        }
        match self.with_registry(|r| r.adopt_inherited()) {
            Ok(0) => (),
            Ok(n) => log!(LogInfo, "Adopted {} inherited descriptors", n),
            Err(e) => log!(LogError, "Scanning inherited descriptors failed: {}", e),
        }
    }

    pub fn atfork_prepare(&'static self) {
        let guard = self.lock_registry();
        FORK_GUARD.with(|g| *g.borrow_mut() = Some(guard));
    }

    fn release_fork_guard(&self) {
        FORK_GUARD.with(|g| g.borrow_mut().take());
    }

    /// Every connection that existed at fork() time is now held by both
    /// processes.
    pub fn atfork_parent(&self) {
        self.release_fork_guard();
        self.with_registry(|r| r.mark_all_shared());
    }

    pub fn atfork_child(&self) {
        self.release_fork_guard();
        let pid = nix::unistd::getpid().as_raw();
        self.atfork_child_with_pid(pid);
    }

    pub(crate) fn atfork_child_with_pid(&self, pid: pid_t) {
        self.pid.store(pid, Ordering::SeqCst);
        self.gate.reset();
        self.initialized.store(false, Ordering::SeqCst);
        self.with_registry(|r| {
            r.set_pid(pid);
            r.mark_all_shared();
        });
        log!(LogDebug, "Registry attached to forked child {}", pid);
    }

    /// Process exit.
    pub fn teardown(&self) {
        if let Some(r) = self.lock_registry().take() {
            log!(
                LogDebug,
                "Tearing down registry with {} connections",
                r.live_count()
            );
        }
    }

    /// Swap in a registry rebuilt from a checkpoint image.
    pub fn replace_registry(&self, registry: ConnectionRegistry) {
        *self.lock_registry() = Some(registry);
    }
}
