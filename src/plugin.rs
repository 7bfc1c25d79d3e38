//! What the checkpoint coordinator sees of the agent: plugin descriptors with
//! their barrier tables and event hooks.

use crate::{
    ckpt_gate::Suspension,
    ckpt_image::{FileImageStore, ImageStore, MemoryImageStore},
    flags::Flags,
    interceptor,
    kernel_metadata::signal_name,
    log::LogLevel::{LogDebug, LogError, LogInfo},
    namespace::{FsTransport, LocalTransport, NamespaceExchange, NsTransport},
    orchestrator::{CheckpointOrchestrator, Phase},
    process_context::{agent_scope, ProcessContext},
};
use libc::{c_int, c_long};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierScope {
    /// Every process of the computation reaches it before any moves on.
    Global,
    /// Ordered with the other barriers of this process only.
    Local,
    /// Run by this process alone, without the coordinator waiting on it.
    Private,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierStage {
    PreCkpt,
    Resume,
    Restart,
}

#[derive(Copy, Clone, Debug)]
pub struct Barrier {
    pub scope: BarrierScope,
    pub stage: BarrierStage,
    pub name: &'static str,
    pub callback: fn(),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Init,
    /// About to exit.
    Exit,
    AtforkPrepare,
    AtforkParent,
    AtforkChild,
    WaitForCkpt,
    PreSuspendUserThread,
    ResumeUserThread { is_restart: bool },
}

pub struct PluginDescriptor {
    pub name: &'static str,
    pub vendor: &'static str,
    pub description: &'static str,
    /// In the order the coordinator runs them.
    pub barriers: Vec<Barrier>,
    pub event_hook: fn(Event),
}

lazy_static! {
    static ref ORCHESTRATOR: Mutex<CheckpointOrchestrator> = Mutex::new(global_orchestrator());
    /// Why the current checkpoint was abandoned, if it was.
    static ref CYCLE_FAILURE: Mutex<Option<String>> = Mutex::new(None);
}

fn global_orchestrator() -> CheckpointOrchestrator {
    let flags = Flags::get();
    let ctx = ProcessContext::global().clone();
    let transport: Arc<dyn NsTransport> = match &flags.ns_dir {
        Some(dir) => match FsTransport::new(dir) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                log!(
                    LogError,
                    "Can't use {:?} for namespace records ({}); only this process will see them",
                    dir,
                    e
                );
                Arc::new(LocalTransport::new())
            }
        },
        None => Arc::new(LocalTransport::new()),
    };
    let store: Arc<dyn ImageStore> = match &flags.image_dir {
        Some(dir) => Arc::new(FileImageStore::new(dir, ctx.pid())),
        None => Arc::new(MemoryImageStore::new()),
    };
    let exchange = NamespaceExchange::new(transport, flags.ns_retry_policy.clone());
    CheckpointOrchestrator::new(ctx, exchange, store)
}

fn orchestrator() -> MutexGuard<'static, CheckpointOrchestrator> {
    ORCHESTRATOR.lock().unwrap_or_else(|e| e.into_inner())
}

fn cycle_failure() -> MutexGuard<'static, Option<String>> {
    CYCLE_FAILURE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Set when a pre-checkpoint barrier failed; the coordinator reports the
/// checkpoint of this process as failed. Cleared by the next saveOptions.
pub fn last_checkpoint_failure() -> Option<String> {
    cycle_failure().clone()
}

type PhaseFn = fn(&mut CheckpointOrchestrator) -> crate::error::Result<()>;

/// Pre-checkpoint and resume barriers. A failure abandons the checkpoint; the
/// remaining barriers of the cycle then have nothing to do.
fn checkpoint_barrier(phase: Phase, f: PhaseFn) {
    run_checkpoint_phase(&ORCHESTRATOR, &CYCLE_FAILURE, phase, f)
}

fn run_checkpoint_phase(
    orchestrator: &Mutex<CheckpointOrchestrator>,
    failure: &Mutex<Option<String>>,
    phase: Phase,
    f: PhaseFn,
) {
    let mut failure = failure.lock().unwrap_or_else(|e| e.into_inner());
    if phase == Phase::SaveOptions {
        *failure = None;
    } else if failure.is_some() {
        log!(LogDebug, "Skipping {}: checkpoint abandoned", phase.name());
        return;
    }
    let result = agent_scope(|| {
        let mut o = orchestrator.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut o)
    });
    if let Err(e) = result {
        log!(LogError, "Checkpoint failed in {}: {}", phase.name(), e);
        *failure = Some(format!("{}: {}", phase.name(), e));
    }
}

/// There is no process to go back to once a restart has begun.
fn restart_barrier(phase: Phase, f: PhaseFn) {
    if let Err(e) = agent_scope(|| f(&mut orchestrator())) {
        fatal!("Restart failed in {}: {}", phase.name(), e);
    }
}

fn save_options() {
    checkpoint_barrier(Phase::SaveOptions, CheckpointOrchestrator::save_options)
}

fn leader_election() {
    checkpoint_barrier(Phase::LeaderElection, CheckpointOrchestrator::leader_election)
}

fn drain_fd() {
    checkpoint_barrier(Phase::DrainFd, CheckpointOrchestrator::drain_fd)
}

fn ckpt() {
    checkpoint_barrier(Phase::Ckpt, CheckpointOrchestrator::ckpt)
}

fn resume_refill() {
    checkpoint_barrier(Phase::ResumeRefill, CheckpointOrchestrator::resume_refill)
}

fn resume_resume() {
    checkpoint_barrier(Phase::ResumeResume, CheckpointOrchestrator::resume_resume)
}

fn post_restart() {
    restart_barrier(Phase::PostRestart, CheckpointOrchestrator::post_restart)
}

fn restart_register_ns_data() {
    restart_barrier(
        Phase::RestartRegisterNsData,
        CheckpointOrchestrator::restart_register_ns_data,
    )
}

fn restart_send_queries() {
    restart_barrier(
        Phase::RestartSendQueries,
        CheckpointOrchestrator::restart_send_queries,
    )
}

fn restart_refill() {
    restart_barrier(Phase::RestartRefill, CheckpointOrchestrator::restart_refill)
}

fn restart_resume() {
    restart_barrier(Phase::RestartResume, CheckpointOrchestrator::restart_resume)
}

fn event_hook(event: Event) {
    let ctx: &'static ProcessContext = ProcessContext::global();
    match event {
        Event::Init => {
            ctx.gate().set_suspend_handler(raise_ckpt_signal);
            ctx.ensure_initialized();
            log!(LogInfo, "event plugin initialized in {}", ctx.pid());
        }
        Event::Exit => ctx.teardown(),
        Event::AtforkPrepare => ctx.atfork_prepare(),
        Event::AtforkParent => ctx.atfork_parent(),
        Event::AtforkChild => ctx.atfork_child(),
        // The suspension itself is the coordinator's; it must not land inside
        // a bracket. Returning here lets the coordinator stop this thread.
        Event::PreSuspendUserThread => match ctx.gate().suspend() {
            Suspension::Granted => (),
            Suspension::Deferred => {
                log!(LogDebug, "Suspension deferred until the open bracket exits")
            }
        },
        Event::ResumeUserThread { is_restart } => {
            log!(LogDebug, "Threads resumed (restart: {})", is_restart);
            ctx.gate().resume();
        }
        Event::WaitForCkpt => (),
    }
}

/// A thread whose suspension was deferred asks the coordinator again once its
/// bracket is closed.
fn raise_ckpt_signal() {
    let sig = Flags::get().ckpt_signal;
    if unsafe { libc::raise(sig) } != 0 {
        log!(
            LogError,
            "Could not raise {} for a deferred suspension",
            signal_name(sig)
        );
    }
}

pub fn event_plugin_descriptor() -> PluginDescriptor {
    use BarrierScope::*;
    use BarrierStage::*;
    let barrier = |scope, stage, name, callback| Barrier {
        scope,
        stage,
        name,
        callback,
    };
    PluginDescriptor {
        name: "event",
        vendor: "ckpt-agent",
        description: "Checkpoints epoll, eventfd, signalfd and inotify descriptors",
        barriers: vec![
            barrier(Private, PreCkpt, "PRE_CKPT", save_options as fn()),
            barrier(Local, PreCkpt, "LEADER_ELECTION", leader_election),
            barrier(Local, PreCkpt, "DRAIN", drain_fd),
            barrier(Local, PreCkpt, "WRITE_CKPT", ckpt),
            barrier(Private, Resume, "RESUME_REFILL", resume_refill),
            barrier(Local, Resume, "RESUME_RESUME", resume_resume),
            barrier(Private, Restart, "RESTART_POST_RESTART", post_restart),
            barrier(Local, Restart, "RESTART_NS_REGISTER_DATA", restart_register_ns_data),
            barrier(Local, Restart, "RESTART_NS_SEND_QUERIES", restart_send_queries),
            barrier(Local, Restart, "RESTART_REFILL", restart_refill),
            barrier(Local, Restart, "RESTART_RESUME", restart_resume),
        ],
        event_hook,
    }
}

/// For the generic syscall wrappers: `event` is SYS_close or SYS_dup.
pub fn process_fd_event(event: c_long, a: c_int, b: c_int) {
    interceptor::process_fd_event(ProcessContext::global(), event, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{ops, ConnFlags, ConnectionKind},
        fdinfo::FdInfo,
        namespace::RetryPolicy,
        orchestrator::OrchestratorState,
    };
    use std::{
        ffi::CString,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    /// An orchestrator whose ckpt phase fails: it tracks an inotify
    /// descriptor whose watches could not be recovered.
    fn failing_orchestrator() -> (Mutex<CheckpointOrchestrator>, RawFdGuard) {
        let ctx = Arc::new(ProcessContext::new(340, true, false));
        let ifd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        assert!(ifd >= 0);
        let dir = CString::new(std::env::temp_dir().to_str().unwrap()).unwrap();
        assert!(unsafe { libc::inotify_add_watch(ifd, dir.as_ptr(), libc::IN_CREATE) } >= 0);
        let (params, flags) = (ops(ConnectionKind::Inotify).adopt)(ifd, &FdInfo::read(ifd).unwrap());
        assert!(flags.contains(ConnFlags::PARAMS_INCOMPLETE));
        ctx.with_registry(|r| r.track_with_flags(ifd, params, flags)).unwrap();
        let exchange = NamespaceExchange::new(
            Arc::new(LocalTransport::new()),
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
        );
        let o = CheckpointOrchestrator::new(ctx, exchange, Arc::new(MemoryImageStore::new()));
        (Mutex::new(o), RawFdGuard(ifd))
    }

    struct RawFdGuard(libc::c_int);

    impl Drop for RawFdGuard {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    fn state(o: &Mutex<CheckpointOrchestrator>) -> OrchestratorState {
        o.lock().unwrap().state()
    }

    #[test]
    fn failed_phase_is_recorded_and_skips_the_rest_of_the_cycle() {
        let (o, _ifd) = failing_orchestrator();
        let failure = Mutex::new(None);
        let run = |phase, f: PhaseFn| run_checkpoint_phase(&o, &failure, phase, f);

        run(Phase::SaveOptions, CheckpointOrchestrator::save_options);
        run(Phase::LeaderElection, CheckpointOrchestrator::leader_election);
        run(Phase::DrainFd, CheckpointOrchestrator::drain_fd);
        assert!(failure.lock().unwrap().is_none());
        run(Phase::Ckpt, CheckpointOrchestrator::ckpt);
        let recorded = failure.lock().unwrap().clone().unwrap();
        assert!(recorded.starts_with("ckpt: "), "{}", recorded);
        assert_eq!(OrchestratorState::Idle, state(&o));

        // Run for real, these would fail on phase order and overwrite the
        // record.
        run(Phase::ResumeRefill, CheckpointOrchestrator::resume_refill);
        run(Phase::ResumeResume, CheckpointOrchestrator::resume_resume);
        assert_eq!(Some(recorded), failure.lock().unwrap().clone());
        assert_eq!(OrchestratorState::Idle, state(&o));

        // The next cycle starts clean.
        run(Phase::SaveOptions, CheckpointOrchestrator::save_options);
        assert!(failure.lock().unwrap().is_none());
        assert_eq!(OrchestratorState::SavedOptions, state(&o));
    }

    #[test]
    fn global_barriers_report_through_last_checkpoint_failure() {
        save_options();
        assert_eq!(None, last_checkpoint_failure());
        // Out of order: leaderElection has not run.
        drain_fd();
        let recorded = last_checkpoint_failure().unwrap();
        assert!(recorded.starts_with("drainFd: "), "{}", recorded);
        ckpt();
        resume_refill();
        assert_eq!(Some(recorded), last_checkpoint_failure());
    }

    static DEFERRED_DELIVERIES: AtomicUsize = AtomicUsize::new(0);

    fn count_deferred() {
        DEFERRED_DELIVERIES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn pre_suspend_waits_for_open_brackets_until_resume() {
        let gate = ProcessContext::global().gate();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let holder = {
            let closed = closed.clone();
            thread::spawn(move || {
                let g = ProcessContext::global().gate().disable();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                closed.store(true, Ordering::SeqCst);
                drop(g);
            })
        };
        rx.recv().unwrap();
        event_hook(Event::PreSuspendUserThread);
        assert!(closed.load(Ordering::SeqCst));
        assert!(gate.is_suspended());
        holder.join().unwrap();

        let opened = Arc::new(AtomicBool::new(false));
        let late = {
            let opened = opened.clone();
            thread::spawn(move || {
                let _g = ProcessContext::global().gate().disable();
                opened.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!opened.load(Ordering::SeqCst));
        event_hook(Event::ResumeUserThread { is_restart: false });
        late.join().unwrap();
        assert!(opened.load(Ordering::SeqCst));
        assert!(!gate.is_suspended());
    }

    #[test]
    fn pre_suspend_inside_a_bracket_is_delivered_at_its_exit() {
        let gate = ProcessContext::global().gate();
        gate.set_suspend_handler(count_deferred);
        let before = DEFERRED_DELIVERIES.load(Ordering::SeqCst);
        {
            let _g = gate.disable();
            event_hook(Event::PreSuspendUserThread);
            assert!(gate.suspend_pending());
            assert_eq!(before, DEFERRED_DELIVERIES.load(Ordering::SeqCst));
        }
        assert_eq!(before + 1, DEFERRED_DELIVERIES.load(Ordering::SeqCst));
        assert!(!gate.suspend_pending());
    }

    #[test]
    fn barrier_table() {
        let d = event_plugin_descriptor();
        let names: Vec<&str> = d.barriers.iter().map(|b| b.name).collect();
        assert_eq!(
            vec![
                "PRE_CKPT",
                "LEADER_ELECTION",
                "DRAIN",
                "WRITE_CKPT",
                "RESUME_REFILL",
                "RESUME_RESUME",
                "RESTART_POST_RESTART",
                "RESTART_NS_REGISTER_DATA",
                "RESTART_NS_SEND_QUERIES",
                "RESTART_REFILL",
                "RESTART_RESUME"
            ],
            names
        );
        assert_eq!(BarrierScope::Private, d.barriers[0].scope);
        assert_eq!(BarrierScope::Private, d.barriers[4].scope);
        assert_eq!(BarrierScope::Private, d.barriers[6].scope);
        assert!(d.barriers[7..]
            .iter()
            .all(|b| b.scope == BarrierScope::Local && b.stage == BarrierStage::Restart));
    }
}
