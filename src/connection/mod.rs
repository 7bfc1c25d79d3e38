use crate::{error::Result, fdinfo::FdInfo, remap::RemapTable, sig::SigMask};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, os::unix::io::RawFd};

pub mod epoll;
pub mod eventfd;
pub mod inotify;
pub mod signalfd;

pub use epoll::{EpollInterest, EpollParams};
pub use eventfd::EventFdParams;
pub use inotify::{InotifyParams, InotifyWatch};
pub use signalfd::SignalFdParams;

/// Kernel objects whose state a memory snapshot does not capture. A new
/// event-notification primitive gets a variant here and an entry in `ops()`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    Epoll,
    EventFd,
    SignalFd,
    Inotify,
}

/// Identifies one kernel object across all the processes that reference it.
/// A forked child inherits its parent's ids, which is what makes them usable
/// as shared keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub creator: pid_t,
    pub serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.creator, self.serial)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CreationParams {
    Epoll(EpollParams),
    EventFd(EventFdParams),
    SignalFd(SignalFdParams),
    Inotify(InotifyParams),
}

impl CreationParams {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            CreationParams::Epoll(_) => ConnectionKind::Epoll,
            CreationParams::EventFd(_) => ConnectionKind::EventFd,
            CreationParams::SignalFd(_) => ConnectionKind::SignalFd,
            CreationParams::Inotify(_) => ConnectionKind::Inotify,
        }
    }
}

/// Kernel state recorded by the drain barrier. Nothing is consumed to get it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DrainedState {
    /// The kernel's view of the interest list, which also drops entries whose
    /// target was closed behind our back.
    Epoll { interest: Vec<EpollInterest> },
    EventFd { count: u64 },
    /// Pending signals covered by the signalfd's mask.
    SignalFd { pending: SigMask },
    /// Bytes of inotify events queued but not read yet.
    Inotify { queued_bytes: u32 },
}

/// `fcntl()` state captured by the saveOptions barrier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SavedOptions {
    /// F_GETFL
    pub status_flags: i32,
    /// F_GETFD
    pub fd_flags: i32,
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct ConnFlags: u32 {
        /// Inherited across exec(): parameters were read back from fdinfo.
        const ADOPTED = 0b01;
        /// Part of the parameters could not be read back.
        const PARAMS_INCOMPLETE = 0b10;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower { leader: pid_t },
}

/// Everything needed to create a kernel object equivalent to the one that
/// existed at checkpoint time. Leaders publish this for their followers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecreationData {
    pub params: CreationParams,
    pub drained: Option<DrainedState>,
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) params: CreationParams,
    pub(crate) shared_key: Option<ConnectionId>,
    /// Every descriptor of this process aliasing the object. The reference
    /// count is its length.
    pub(crate) fds: BTreeSet<RawFd>,
    pub(crate) flags: ConnFlags,
    pub(crate) role: Option<Role>,
    pub(crate) drained: Option<DrainedState>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, fd: RawFd, params: CreationParams) -> Connection {
        let mut fds = BTreeSet::new();
        fds.insert(fd);
        Connection {
            id,
            params,
            shared_key: None,
            fds,
            flags: ConnFlags::empty(),
            role: None,
            drained: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.params.kind()
    }

    pub fn params(&self) -> &CreationParams {
        &self.params
    }

    pub fn shared_key(&self) -> Option<ConnectionId> {
        self.shared_key
    }

    pub fn ref_count(&self) -> usize {
        self.fds.len()
    }

    pub fn fds(&self) -> &BTreeSet<RawFd> {
        &self.fds
    }

    /// Lowest aliasing descriptor; the one the kind-specific operations use.
    pub fn primary_fd(&self) -> RawFd {
        match self.fds.iter().next() {
            Some(fd) => *fd,
            None => fatal!("Connection {} has no descriptors left", self.id),
        }
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        // Private connections are their own leader.
        !matches!(self.role, Some(Role::Follower { .. }))
    }

    pub fn drained(&self) -> Option<&DrainedState> {
        self.drained.as_ref()
    }

    pub fn recreation_data(&self) -> RecreationData {
        RecreationData {
            params: self.params.clone(),
            drained: self.drained.clone(),
        }
    }
}

/// The kind-specific half of the checkpoint protocol. One static table per
/// kind, selected by `ops()`.
pub struct KindOps {
    pub name: &'static str,
    /// Create a fresh kernel object through the real (un-intercepted) libc.
    pub create: fn(&RecreationData) -> nix::Result<RawFd>,
    /// Record state that would otherwise be lost across a restart.
    pub drain: fn(RawFd, &CreationParams) -> Result<Option<DrainedState>>,
    /// Reattach what creation alone does not bring back. `drained` is this
    /// process's own drained state, which for followers differs from the one
    /// in the leader's recreation data.
    pub restore: fn(RawFd, &CreationParams, Option<&DrainedState>, &RemapTable) -> Result<()>,
    /// Err(reason) if a checkpoint image entry would not be enough to bring the
    /// object back.
    pub check_reconstructable: fn(&CreationParams, ConnFlags) -> std::result::Result<(), String>,
    /// Rebuild parameters for a descriptor we did not see being created.
    pub adopt: fn(RawFd, &FdInfo) -> (CreationParams, ConnFlags),
}

pub fn ops(kind: ConnectionKind) -> &'static KindOps {
    match kind {
        ConnectionKind::Epoll => &epoll::EPOLL_OPS,
        ConnectionKind::EventFd => &eventfd::EVENTFD_OPS,
        ConnectionKind::SignalFd => &signalfd::SIGNALFD_OPS,
        ConnectionKind::Inotify => &inotify::INOTIFY_OPS,
    }
}

/// The NONBLOCK/CLOEXEC creation flags of all four kinds share their values
/// with O_NONBLOCK/O_CLOEXEC, which is what fdinfo reports.
pub(crate) fn creation_flags_from_status(status: Option<i32>) -> i32 {
    status.unwrap_or(0) & (libc::O_NONBLOCK | libc::O_CLOEXEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_flag_values_agree() {
        assert_eq!(libc::EFD_NONBLOCK, libc::O_NONBLOCK);
        assert_eq!(libc::EFD_CLOEXEC, libc::O_CLOEXEC);
        assert_eq!(libc::SFD_NONBLOCK, libc::O_NONBLOCK);
        assert_eq!(libc::IN_CLOEXEC, libc::O_CLOEXEC);
        assert_eq!(libc::EPOLL_CLOEXEC, libc::O_CLOEXEC);
        assert_eq!(
            libc::O_NONBLOCK,
            creation_flags_from_status(Some(libc::O_RDWR | libc::O_NONBLOCK))
        );
    }

    #[test]
    fn ops_table_covers_every_kind() {
        for kind in &[
            ConnectionKind::Epoll,
            ConnectionKind::EventFd,
            ConnectionKind::SignalFd,
            ConnectionKind::Inotify,
        ] {
            assert!(!ops(*kind).name.is_empty());
        }
        assert_eq!("eventfd", ops(ConnectionKind::EventFd).name);
    }

    #[test]
    fn private_connections_lead() {
        let id = ConnectionId {
            creator: 1,
            serial: 0,
        };
        let mut c = Connection::new(
            id,
            3,
            CreationParams::EventFd(EventFdParams {
                initval: 0,
                flags: 0,
            }),
        );
        assert!(c.is_leader());
        c.role = Some(Role::Follower { leader: 0 });
        assert!(!c.is_leader());
        assert_eq!("1-0", id.to_string());
    }
}
