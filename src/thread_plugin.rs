//! The thread plugin. Suspending user threads belongs to the checkpoint
//! coordinator; this plugin only takes part in its global barriers and keeps
//! track of whether the process is still in its original startup.

use crate::{
    log::LogLevel::{LogDebug, LogInfo},
    plugin::{Barrier, BarrierScope, BarrierStage, Event, PluginDescriptor},
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Stops the application's threads around the drain and lets them go again
/// once the cycle is over.
pub trait ThreadSuspender: Send + Sync {
    fn suspend_all_threads(&self);
    fn resume_all_threads(&self);
}

/// Threads are already parked by the coordinator when the drain runs.
pub struct InertThreadSuspender;

impl ThreadSuspender for InertThreadSuspender {
    fn suspend_all_threads(&self) {
        log!(LogDebug, "suspend: threads held by the coordinator");
    }

    fn resume_all_threads(&self) {
        log!(LogDebug, "resume: threads released by the coordinator");
    }
}

/// True from process start (or fork) until the first checkpoint request.
static ORIGINAL_STARTUP: AtomicBool = AtomicBool::new(true);

pub fn is_original_startup() -> bool {
    ORIGINAL_STARTUP.load(Ordering::SeqCst)
}

fn event_hook(event: Event) {
    match event {
        Event::AtforkChild => ORIGINAL_STARTUP.store(true, Ordering::SeqCst),
        Event::WaitForCkpt => {
            if !ORIGINAL_STARTUP.swap(false, Ordering::SeqCst) {
                log!(LogDebug, "waiting for checkpoint after a restart");
            }
        }
        _ => (),
    }
}

fn checkpoint() {
    log!(LogDebug, "thread barrier: checkpoint");
}

fn resume() {
    log!(LogDebug, "thread barrier: resume");
}

fn restart() {
    log!(LogInfo, "thread barrier: restart");
}

pub fn thread_plugin_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: "thread",
        vendor: "ckpt-agent",
        description: "Global thread barriers",
        barriers: vec![
            Barrier {
                scope: BarrierScope::Global,
                stage: BarrierStage::PreCkpt,
                name: "checkpoint",
                callback: checkpoint,
            },
            Barrier {
                scope: BarrierScope::Global,
                stage: BarrierStage::Resume,
                name: "resume",
                callback: resume,
            },
            Barrier {
                scope: BarrierScope::Global,
                stage: BarrierStage::Restart,
                name: "restart",
                callback: restart,
            },
        ],
        event_hook,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_latch() {
        let d = thread_plugin_descriptor();
        (d.event_hook)(Event::AtforkChild);
        assert!(is_original_startup());
        (d.event_hook)(Event::WaitForCkpt);
        assert!(!is_original_startup());
        (d.event_hook)(Event::WaitForCkpt);
        assert!(!is_original_startup());
        (d.event_hook)(Event::AtforkChild);
        assert!(is_original_startup());
    }

    #[test]
    fn global_barriers() {
        let d = thread_plugin_descriptor();
        assert!(d.barriers.iter().all(|b| b.scope == BarrierScope::Global));
        let names: Vec<_> = d.barriers.iter().map(|b| b.name).collect();
        assert_eq!(vec!["checkpoint", "resume", "restart"], names);
        for b in &d.barriers {
            (b.callback)();
        }
    }
}
