use super::{
    creation_flags_from_status, ConnFlags, ConnectionKind, CreationParams, DrainedState, KindOps,
    RecreationData,
};
use crate::{
    error::{ConnError, Result},
    fdinfo::FdInfo,
    log::LogLevel::LogDebug,
    real,
    remap::RemapTable,
    scoped_fd::ScopedFd,
};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, os::unix::io::RawFd};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventFdParams {
    pub initval: u32,
    /// EFD_CLOEXEC | EFD_NONBLOCK | EFD_SEMAPHORE
    pub flags: i32,
}

pub static EVENTFD_OPS: KindOps = KindOps {
    name: "eventfd",
    create,
    drain,
    restore,
    check_reconstructable,
    adopt,
};

/// The counter is carried over: a recreated eventfd starts at the value the
/// checkpointed object had when it was drained, or at its creation value if it never was.
fn create(data: &RecreationData) -> nix::Result<RawFd> {
    let params = match &data.params {
        CreationParams::EventFd(p) => *p,
        other => fatal!("eventfd ops called with {:?}", other.kind()),
    };
    let count = match data.drained {
        Some(DrainedState::EventFd { count }) => count,
        _ => params.initval as u64,
    };
    // eventfd(2) only takes a 32 bit initial value.
    let initval = u32::try_from(count).unwrap_or(0);
    let mut fd = ScopedFd::from_raw(Errno::result(unsafe {
        real::eventfd(initval, params.flags)
    })?);
    if count != initval as u64 {
        let written = nix::unistd::write(fd.as_raw(), &count.to_ne_bytes())?;
        if written != 8 {
            return Err(Errno::EIO);
        }
    }
    Ok(fd.extract())
}

fn drain(fd: RawFd, _params: &CreationParams) -> Result<Option<DrainedState>> {
    let info = FdInfo::read(fd)?;
    match info.eventfd_count() {
        Some(count) => {
            log!(LogDebug, "eventfd {} holds {}", fd, count);
            Ok(Some(DrainedState::EventFd { count }))
        }
        None => Err(ConnError::UnreconstructableConnection {
            fd,
            kind: ConnectionKind::EventFd,
            reason: "fdinfo shows no eventfd-count".into(),
        }),
    }
}

fn restore(
    _fd: RawFd,
    _params: &CreationParams,
    _drained: Option<&DrainedState>,
    _remap: &RemapTable,
) -> Result<()> {
    Ok(())
}

fn check_reconstructable(_params: &CreationParams, _flags: ConnFlags) -> std::result::Result<(), String> {
    Ok(())
}

/// Kernels before 6.6 don't report EFD_SEMAPHORE; such descriptors are
/// adopted as plain counters.
fn adopt(_fd: RawFd, info: &FdInfo) -> (CreationParams, ConnFlags) {
    let mut flags = creation_flags_from_status(info.flags);
    if info.eventfd_semaphore().unwrap_or(false) {
        flags |= libc::EFD_SEMAPHORE;
    }
    let initval = info
        .eventfd_count()
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(0);
    (
        CreationParams::EventFd(EventFdParams { initval, flags }),
        ConnFlags::ADOPTED,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_counter(fd: RawFd) -> Option<u64> {
        let mut buf = [0u8; 8];
        match nix::unistd::read(fd, &mut buf) {
            Ok(8) => Some(u64::from_ne_bytes(buf)),
            _ => None,
        }
    }

    fn data(initval: u32, flags: i32, drained: Option<u64>) -> RecreationData {
        RecreationData {
            params: CreationParams::EventFd(EventFdParams { initval, flags }),
            drained: drained.map(|count| DrainedState::EventFd { count }),
        }
    }

    #[test]
    fn create_uses_drained_count() {
        let fd = create(&data(1, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC, Some(5))).unwrap();
        assert_eq!(Some(5), read_counter(fd));
        assert_eq!(None, read_counter(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn create_beyond_u32() {
        let big = u32::MAX as u64 + 10;
        let fd = create(&data(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC, Some(big))).unwrap();
        assert_eq!(Some(big), read_counter(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn drain_does_not_consume() {
        let fd = unsafe { libc::eventfd(3, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        let params = data(3, libc::EFD_NONBLOCK, None).params;
        assert_eq!(
            Some(DrainedState::EventFd { count: 3 }),
            drain(fd, &params).unwrap()
        );
        assert_eq!(Some(3), read_counter(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn semaphore_survives_recreation() {
        let flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE;
        let fd = create(&data(2, flags, None)).unwrap();
        assert_eq!(Some(1), read_counter(fd));
        assert_eq!(Some(1), read_counter(fd));
        assert_eq!(None, read_counter(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn adopt_reads_back_parameters() {
        let fd = unsafe { libc::eventfd(9, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        let (params, flags) = adopt(fd, &FdInfo::read(fd).unwrap());
        match params {
            CreationParams::EventFd(p) => {
                assert_eq!(9, p.initval);
                assert_eq!(libc::EFD_NONBLOCK | libc::EFD_CLOEXEC, p.flags & !libc::EFD_SEMAPHORE);
            }
            _ => panic!("not an eventfd"),
        }
        assert!(flags.contains(ConnFlags::ADOPTED));
        unsafe { libc::close(fd) };
    }
}
