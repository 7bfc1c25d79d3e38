use super::{
    creation_flags_from_status, ConnFlags, CreationParams, DrainedState, KindOps, RecreationData,
};
use crate::{
    error::Result,
    fdinfo::FdInfo,
    kernel_metadata::epoll_op_name,
    log::LogLevel::{LogDebug, LogWarn},
    real,
    remap::RemapTable,
};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EpollInterest {
    pub fd: RawFd,
    pub events: u32,
    pub data: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EpollParams {
    /// EPOLL_CLOEXEC
    pub flags: i32,
    /// Set when created through the obsolete epoll_create(size).
    pub size: Option<i32>,
    pub interest: Vec<EpollInterest>,
}

impl EpollParams {
    /// Mirror a successful epoll_ctl().
    pub fn apply_ctl(&mut self, op: i32, fd: RawFd, event: Option<(u32, u64)>) {
        match (op, event) {
            (libc::EPOLL_CTL_ADD, Some((events, data))) | (libc::EPOLL_CTL_MOD, Some((events, data))) => {
                match self.interest.iter_mut().find(|i| i.fd == fd) {
                    Some(i) => {
                        i.events = events;
                        i.data = data;
                    }
                    None => self.interest.push(EpollInterest { fd, events, data }),
                }
            }
            (libc::EPOLL_CTL_DEL, _) => self.interest.retain(|i| i.fd != fd),
            _ => log!(LogWarn, "Ignoring {} on epoll target {}", epoll_op_name(op), fd),
        }
    }

    /// A closed target leaves the kernel's interest list on its own, so after
    /// the drain barrier the kernel's view wins.
    fn effective_interest<'a>(&'a self, drained: Option<&'a DrainedState>) -> &'a [EpollInterest] {
        match drained {
            Some(DrainedState::Epoll { interest }) => interest,
            _ => &self.interest,
        }
    }
}

pub static EPOLL_OPS: KindOps = KindOps {
    name: "epoll",
    create,
    drain,
    restore,
    check_reconstructable,
    adopt,
};

fn params_of(params: &CreationParams) -> &EpollParams {
    match params {
        CreationParams::Epoll(p) => p,
        other => fatal!("epoll ops called with {:?}", other.kind()),
    }
}

/// Creates an empty epoll set. The interest list is registered later by
/// `restore`, once every target has been recreated and remapped.
fn create(data: &RecreationData) -> nix::Result<RawFd> {
    let params = params_of(&data.params);
    let fd = match params.size {
        Some(size) if params.flags == 0 => unsafe { real::epoll_create(size) },
        _ => unsafe { real::epoll_create1(params.flags) },
    };
    Errno::result(fd)
}

fn interest_from(info: &FdInfo) -> Vec<EpollInterest> {
    info.epoll_targets()
        .into_iter()
        .map(|t| EpollInterest {
            fd: t.fd,
            events: t.events,
            data: t.data,
        })
        .collect()
}

/// Registered targets of a live epoll set as the kernel sees them.
pub fn live_interest(fd: RawFd) -> Result<Vec<EpollInterest>> {
    Ok(interest_from(&FdInfo::read(fd)?))
}

fn drain(fd: RawFd, params: &CreationParams) -> Result<Option<DrainedState>> {
    let tracked = &params_of(params).interest;
    let interest = live_interest(fd)?;
    if interest.len() != tracked.len() {
        log!(
            LogDebug,
            "epoll {}: kernel lists {} targets, {} were registered through us",
            fd,
            interest.len(),
            tracked.len()
        );
    }
    Ok(Some(DrainedState::Epoll { interest }))
}

fn restore(
    fd: RawFd,
    params: &CreationParams,
    drained: Option<&DrainedState>,
    remap: &RemapTable,
) -> Result<()> {
    let params = params_of(params);
    for i in params.effective_interest(drained) {
        let target = remap.get(&i.fd).copied().unwrap_or(i.fd);
        let mut ev = libc::epoll_event {
            events: i.events,
            u64: i.data,
        };
        let ret = unsafe { real::epoll_ctl(fd, libc::EPOLL_CTL_ADD, target, &mut ev) };
        match Errno::result(ret) {
            Ok(_) => log!(LogDebug, "epoll {}: re-added target {} (was {})", fd, target, i.fd),
            Err(Errno::EEXIST) => (),
            // The target is owned by some other subsystem that did not bring it back.
            Err(e) => log!(LogWarn, "epoll {}: could not re-add target {}: {}", fd, target, e),
        }
    }
    Ok(())
}

fn check_reconstructable(_params: &CreationParams, _flags: ConnFlags) -> std::result::Result<(), String> {
    Ok(())
}

fn adopt(_fd: RawFd, info: &FdInfo) -> (CreationParams, ConnFlags) {
    (
        CreationParams::Epoll(EpollParams {
            flags: creation_flags_from_status(info.flags) & libc::EPOLL_CLOEXEC,
            size: None,
            interest: interest_from(info),
        }),
        ConnFlags::ADOPTED,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoped_fd::ScopedFd;

    fn scoped(fd: RawFd) -> ScopedFd {
        assert!(fd >= 0);
        ScopedFd::from_raw(fd)
    }

    #[test]
    fn ctl_bookkeeping() {
        let mut p = EpollParams {
            flags: 0,
            size: None,
            interest: Vec::new(),
        };
        p.apply_ctl(libc::EPOLL_CTL_ADD, 5, Some((libc::EPOLLIN as u32, 5)));
        p.apply_ctl(libc::EPOLL_CTL_ADD, 6, Some((libc::EPOLLOUT as u32, 6)));
        p.apply_ctl(libc::EPOLL_CTL_MOD, 5, Some((libc::EPOLLIN as u32 | libc::EPOLLET as u32, 50)));
        assert_eq!(2, p.interest.len());
        assert_eq!(50, p.interest[0].data);
        p.apply_ctl(libc::EPOLL_CTL_DEL, 6, None);
        assert_eq!(1, p.interest.len());
        assert_eq!(5, p.interest[0].fd);
    }

    #[test]
    fn interest_list_survives_recreation() {
        let target = scoped(unsafe { libc::eventfd(1, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) });
        let mut params = EpollParams {
            flags: libc::EPOLL_CLOEXEC,
            size: None,
            interest: Vec::new(),
        };
        params.apply_ctl(
            libc::EPOLL_CTL_ADD,
            target.as_raw(),
            Some((libc::EPOLLIN as u32, 0xabcd)),
        );
        let data = RecreationData {
            params: CreationParams::Epoll(params),
            drained: None,
        };
        let epfd = scoped(create(&data).unwrap());
        restore(epfd.as_raw(), &data.params, None, &RemapTable::new()).unwrap();

        let live = live_interest(epfd.as_raw()).unwrap();
        assert_eq!(1, live.len());
        assert_eq!(target.as_raw(), live[0].fd);
        assert_eq!(0xabcd, live[0].data);

        // The eventfd is readable, so the recreated set reports it.
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        let n = unsafe { libc::epoll_wait(epfd.as_raw(), events.as_mut_ptr(), 2, 0) };
        assert_eq!(1, n);
        let reported = events[0].u64;
        assert_eq!(0xabcd, reported);
    }

    #[test]
    fn restore_follows_remap() {
        let old = scoped(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) });
        let new = scoped(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) });
        let params = CreationParams::Epoll(EpollParams {
            flags: libc::EPOLL_CLOEXEC,
            size: Some(1),
            interest: vec![EpollInterest {
                fd: old.as_raw(),
                events: libc::EPOLLIN as u32,
                data: 7,
            }],
        });
        let data = RecreationData {
            params,
            drained: None,
        };
        let epfd = scoped(create(&data).unwrap());
        let mut remap = RemapTable::new();
        remap.insert(old.as_raw(), new.as_raw());
        restore(epfd.as_raw(), &data.params, None, &remap).unwrap();
        let live = live_interest(epfd.as_raw()).unwrap();
        assert_eq!(vec![new.as_raw()], live.iter().map(|i| i.fd).collect::<Vec<_>>());
    }
}
