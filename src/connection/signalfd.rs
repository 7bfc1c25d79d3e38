use super::{
    creation_flags_from_status, ConnFlags, CreationParams, DrainedState, KindOps, RecreationData,
};
use crate::{
    error::Result,
    fdinfo::FdInfo,
    log::LogLevel::{LogDebug, LogInfo},
    real,
    remap::RemapTable,
    sig::SigMask,
};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignalFdParams {
    pub mask: SigMask,
    /// SFD_CLOEXEC | SFD_NONBLOCK
    pub flags: i32,
}

pub static SIGNALFD_OPS: KindOps = KindOps {
    name: "signalfd",
    create,
    drain,
    restore,
    check_reconstructable,
    adopt,
};

fn params_of(params: &CreationParams) -> SignalFdParams {
    match params {
        CreationParams::SignalFd(p) => *p,
        other => fatal!("signalfd ops called with {:?}", other.kind()),
    }
}

fn create(data: &RecreationData) -> nix::Result<RawFd> {
    let params = params_of(&data.params);
    let set = params.mask.to_raw_sigset();
    Errno::result(unsafe { real::signalfd(-1, &set, params.flags) })
}

/// A signalfd has no queue of its own: it reads from the pending signals of
/// the reading thread and process. Record the pending ones it would report.
fn drain(fd: RawFd, params: &CreationParams) -> Result<Option<DrainedState>> {
    let params = params_of(params);
    let pending = SigMask::pending()?.intersect(params.mask);
    if !pending.is_empty() {
        log!(LogDebug, "signalfd {} has {} pending", fd, pending);
    }
    Ok(Some(DrainedState::SignalFd { pending }))
}

/// Pending signals died with the old process. Queue them again so the new
/// signalfd reports them. Each process re-raises its own.
fn restore(
    fd: RawFd,
    _params: &CreationParams,
    drained: Option<&DrainedState>,
    _remap: &RemapTable,
) -> Result<()> {
    let pending = match drained {
        Some(DrainedState::SignalFd { pending }) => *pending,
        _ => return Ok(()),
    };
    let pid = nix::unistd::getpid().as_raw();
    for sig in pending.iter() {
        log!(LogInfo, "Re-raising {} for signalfd {}", sig, fd);
        Errno::result(unsafe { libc::kill(pid, sig.as_raw()) })?;
    }
    Ok(())
}

fn check_reconstructable(params: &CreationParams, flags: ConnFlags) -> std::result::Result<(), String> {
    if flags.contains(ConnFlags::PARAMS_INCOMPLETE) {
        return Err("signal mask could not be read back".into());
    }
    if params_of(params).mask.is_empty() {
        // Legal, but it can never report anything. Nothing to lose either.
        log!(LogDebug, "signalfd with an empty mask");
    }
    Ok(())
}

fn adopt(_fd: RawFd, info: &FdInfo) -> (CreationParams, ConnFlags) {
    let flags = creation_flags_from_status(info.flags);
    match info.signalfd_mask() {
        Some(mask) => (
            CreationParams::SignalFd(SignalFdParams { mask, flags }),
            ConnFlags::ADOPTED,
        ),
        None => (
            CreationParams::SignalFd(SignalFdParams {
                mask: SigMask::empty(),
                flags,
            }),
            ConnFlags::ADOPTED | ConnFlags::PARAMS_INCOMPLETE,
        ),
    }
}
