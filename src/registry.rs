//! The process-wide authority on which virtualized kernel objects exist.
//!
//! Descriptor numbers are the only handle anything outside this module keeps
//! across a checkpoint; every access goes through the registry again.

use crate::{
    ckpt_image::ConnectionRecord,
    connection::{ops, ConnFlags, Connection, ConnectionId, CreationParams, SavedOptions},
    error::{ConnError, Result},
    fdinfo::{anon_inode_kind, open_fds, FdInfo},
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    remap::RemapTable,
    sig::SigMask,
};
use libc::pid_t;
use std::{
    collections::{BTreeMap, BTreeSet},
    os::unix::io::RawFd,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub fd: RawFd,
}

#[derive(Clone, Debug)]
pub struct ConnectionRegistry {
    pid: pid_t,
    next_serial: u64,
    fd_to_conn: BTreeMap<RawFd, ConnectionId>,
    conns: BTreeMap<ConnectionId, Connection>,
    /// Reject a second track() of a live descriptor instead of overwriting.
    strict: bool,
    /// Ascending by descriptor. Captured by saveOptions.
    saved_options: Vec<(RawFd, SavedOptions)>,
    /// Published by restartRefill.
    remap: RemapTable,
}

impl ConnectionRegistry {
    pub fn new(pid: pid_t, strict: bool) -> ConnectionRegistry {
        ConnectionRegistry {
            pid,
            next_serial: 0,
            fd_to_conn: BTreeMap::new(),
            conns: BTreeMap::new(),
            strict,
            saved_options: Vec::new(),
            remap: RemapTable::new(),
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// After fork(): new connections are created by the child.
    pub fn set_pid(&mut self, pid: pid_t) {
        self.pid = pid;
    }

    pub fn track(&mut self, fd: RawFd, params: CreationParams) -> Result<ConnectionHandle> {
        self.track_with_flags(fd, params, ConnFlags::empty())
    }

    pub fn track_with_flags(
        &mut self,
        fd: RawFd,
        params: CreationParams,
        flags: ConnFlags,
    ) -> Result<ConnectionHandle> {
        if let Some(existing) = self.lookup(fd).map(|c| c.kind()) {
            if self.strict {
                return Err(ConnError::DuplicateDescriptor { fd, existing });
            }
            // The kernel handed out a number we still consider live: we must
            // have missed its close().
            log!(
                LogWarn,
                "fd {} is already tracked as {:?}; overwriting",
                fd,
                existing
            );
            self.release(fd);
        }

        let id = ConnectionId {
            creator: self.pid,
            serial: self.next_serial,
        };
        self.next_serial += 1;
        let kind = params.kind();
        let mut conn = Connection::new(id, fd, params);
        conn.flags = flags;
        self.conns.insert(id, conn);
        self.fd_to_conn.insert(fd, id);
        log!(LogDebug, "Tracking {:?} fd {} as {}", kind, fd, id);
        Ok(ConnectionHandle { id, fd })
    }

    /// `new_fd` now refers to the same object as `old_fd`. Returns false when
    /// `old_fd` is not virtualized, which is the common case.
    pub fn alias(&mut self, old_fd: RawFd, new_fd: RawFd) -> bool {
        let id = match self.fd_to_conn.get(&old_fd) {
            Some(id) => *id,
            None => {
                // dup2() of an untracked fd over a tracked one still closes it.
                self.release(new_fd);
                return false;
            }
        };
        if old_fd == new_fd {
            return true;
        }
        self.release(new_fd);
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.fds.insert(new_fd);
            log!(
                LogDebug,
                "fd {} aliases {} (ref count {})",
                new_fd,
                id,
                conn.ref_count()
            );
        }
        self.fd_to_conn.insert(new_fd, id);
        true
    }

    /// Forget `fd`. Destroys the connection with its last descriptor. Unknown
    /// descriptors are ignored, so releasing twice is harmless.
    pub fn release(&mut self, fd: RawFd) -> bool {
        let id = match self.fd_to_conn.remove(&fd) {
            Some(id) => id,
            None => return false,
        };
        let now_unused = match self.conns.get_mut(&id) {
            Some(conn) => {
                conn.fds.remove(&fd);
                conn.fds.is_empty()
            }
            None => false,
        };
        if now_unused {
            self.conns.remove(&id);
            log!(LogDebug, "Connection {} destroyed with fd {}", id, fd);
        }
        registry_assert!(self.fd_to_conn.values().all(|i| self.conns.contains_key(i)));
        true
    }

    pub fn lookup(&self, fd: RawFd) -> Option<&Connection> {
        self.fd_to_conn.get(&fd).and_then(|id| self.conns.get(id))
    }

    pub fn lookup_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let id = *self.fd_to_conn.get(&fd)?;
        self.conns.get_mut(&id)
    }

    pub fn live_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn tracked_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fd_to_conn.keys().copied()
    }

    fn ids_in_fd_order(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<(RawFd, ConnectionId)> = self
            .conns
            .values()
            .map(|c| (c.primary_fd(), c.id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Visits connections by ascending primary descriptor. Stops at the first
    /// error.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Connection) -> Result<()>,
    {
        for id in self.ids_in_fd_order() {
            f(&self.conns[&id])?;
        }
        Ok(())
    }

    pub fn for_each_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Connection) -> Result<()>,
    {
        for id in self.ids_in_fd_order() {
            if let Some(conn) = self.conns.get_mut(&id) {
                f(conn)?;
            }
        }
        Ok(())
    }

    /// The object behind `fd` is (or may be) referenced by another process.
    pub fn mark_shared(&mut self, fd: RawFd) -> Result<ConnectionId> {
        let conn = self
            .lookup_mut(fd)
            .ok_or(ConnError::UntrackedDescriptor(fd))?;
        conn.shared_key = Some(conn.id);
        Ok(conn.id)
    }

    /// Every connection alive at fork() time is now referenced by both sides.
    pub fn mark_all_shared(&mut self) {
        for conn in self.conns.values_mut() {
            conn.shared_key = Some(conn.id);
        }
    }

    pub fn update_epoll_interest(
        &mut self,
        epfd: RawFd,
        op: i32,
        fd: RawFd,
        event: Option<(u32, u64)>,
    ) -> bool {
        match self.lookup_mut(epfd).map(|c| &mut c.params) {
            Some(CreationParams::Epoll(p)) => {
                p.apply_ctl(op, fd, event);
                true
            }
            _ => false,
        }
    }

    /// signalfd() on an existing signalfd changes its mask in place.
    pub fn update_signalfd_mask(&mut self, fd: RawFd, mask: SigMask, flags: i32) -> bool {
        match self.lookup_mut(fd).map(|c| &mut c.params) {
            Some(CreationParams::SignalFd(p)) => {
                p.mask = mask;
                p.flags = flags;
                true
            }
            _ => false,
        }
    }

    pub fn add_inotify_watch(&mut self, fd: RawFd, wd: i32, path: &[u8], mask: u32) -> bool {
        match self.lookup_mut(fd).map(|c| &mut c.params) {
            Some(CreationParams::Inotify(p)) => {
                p.add_watch(wd, path, mask);
                true
            }
            _ => false,
        }
    }

    pub fn remove_inotify_watch(&mut self, fd: RawFd, wd: i32) -> bool {
        match self.lookup_mut(fd).map(|c| &mut c.params) {
            Some(CreationParams::Inotify(p)) => p.remove_watch(wd),
            _ => false,
        }
    }

    /// Track supported descriptors that were already open when the agent
    /// started, i.e. inherited across exec(). Returns how many were adopted.
    pub fn adopt_inherited(&mut self) -> Result<usize> {
        let mut adopted = 0;
        for fd in open_fds()? {
            if self.fd_to_conn.contains_key(&fd) {
                continue;
            }
            let kind = match anon_inode_kind(fd) {
                Some(kind) => kind,
                None => continue,
            };
            // Gone between listing and reading: nothing to adopt.
            let info = match FdInfo::read(fd) {
                Ok(info) => info,
                Err(_) => continue,
            };
            let (params, flags) = (ops(kind).adopt)(fd, &info);
            self.track_with_flags(fd, params, flags)?;
            log!(LogInfo, "Adopted inherited {:?} fd {}", kind, fd);
            adopted += 1;
        }
        Ok(adopted)
    }

    pub fn set_saved_options(&mut self, options: Vec<(RawFd, SavedOptions)>) {
        self.saved_options = options;
    }

    pub fn saved_options(&self) -> &[(RawFd, SavedOptions)] {
        &self.saved_options
    }

    pub fn saved_options_for(&self, fd: RawFd) -> Option<SavedOptions> {
        self.saved_options
            .iter()
            .find(|(f, _)| *f == fd)
            .map(|(_, o)| *o)
    }

    pub fn remap_table(&self) -> &RemapTable {
        &self.remap
    }

    /// Moves every connection to its post-restart descriptors and publishes
    /// `remap`. Descriptors missing from `remap` keep their number.
    pub fn rebind(&mut self, remap: RemapTable) {
        let translate = |fd: RawFd| remap.get(&fd).copied().unwrap_or(fd);
        self.fd_to_conn.clear();
        for conn in self.conns.values_mut() {
            let fds: BTreeSet<RawFd> = conn.fds.iter().map(|fd| translate(*fd)).collect();
            for fd in &fds {
                self.fd_to_conn.insert(*fd, conn.id);
            }
            conn.fds = fds;
        }
        self.saved_options = self
            .saved_options
            .iter()
            .map(|(fd, o)| (translate(*fd), *o))
            .collect();
        self.remap = remap;
    }

    /// End of a checkpoint/restart cycle.
    pub fn clear_cycle_state(&mut self) {
        for conn in self.conns.values_mut() {
            conn.role = None;
            conn.drained = None;
        }
        self.saved_options.clear();
    }

    /// Restart: whatever was tracked belonged to the process image being
    /// replaced. Connections come back exactly as they were checkpointed.
    pub fn replace_from_records(&mut self, records: &[ConnectionRecord]) {
        self.fd_to_conn.clear();
        self.conns.clear();
        self.saved_options.clear();
        self.remap.clear();
        for r in records {
            let mut fds: BTreeSet<RawFd> = r.aliases.iter().copied().collect();
            fds.insert(r.fd);
            registry_assert!(
                fds.len() == r.ref_count,
                "record for fd {} has {} descriptors but ref count {}",
                r.fd,
                fds.len(),
                r.ref_count
            );
            let conn = Connection {
                id: r.id,
                params: r.params.clone(),
                shared_key: r.shared_key,
                fds,
                flags: r.flags,
                role: r.role,
                drained: r.drained.clone(),
            };
            for fd in &conn.fds {
                self.fd_to_conn.insert(*fd, conn.id);
            }
            self.next_serial = self.next_serial.max(r.id.serial + 1);
            self.conns.insert(conn.id, conn);
            for (fd, o) in &r.saved_options {
                self.saved_options.push((*fd, *o));
            }
        }
        self.saved_options.sort_by_key(|(fd, _)| *fd);
    }

    /// By ascending primary descriptor.
    pub fn connections(&self) -> Vec<&Connection> {
        self.ids_in_fd_order()
            .into_iter()
            .map(|id| &self.conns[&id])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        ConnectionKind, EpollParams, EventFdParams, InotifyParams, SignalFdParams,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    fn eventfd_params() -> CreationParams {
        CreationParams::EventFd(EventFdParams {
            initval: 0,
            flags: libc::EFD_NONBLOCK,
        })
    }

    #[test]
    fn dup_then_close_both() {
        let mut r = ConnectionRegistry::new(100, true);
        r.track(3, eventfd_params()).unwrap();
        assert!(r.alias(3, 4));
        assert_eq!(2, r.lookup(4).unwrap().ref_count());
        assert_eq!(1, r.live_count());

        assert!(r.release(3));
        assert_eq!(1, r.lookup(4).unwrap().ref_count());
        assert_eq!(4, r.lookup(4).unwrap().primary_fd());
        assert!(r.release(4));
        assert_eq!(0, r.live_count());
        assert!(!r.release(4));
        assert!(!r.release(4));
    }

    #[test]
    fn alias_of_untracked_is_a_no_op() {
        let mut r = ConnectionRegistry::new(100, true);
        assert!(!r.alias(10, 11));
        assert_eq!(0, r.live_count());
    }

    #[test]
    fn dup2_over_tracked_fd_releases_it() {
        let mut r = ConnectionRegistry::new(100, true);
        r.track(3, eventfd_params()).unwrap();
        r.track(
            5,
            CreationParams::Epoll(EpollParams {
                flags: 0,
                size: None,
                interest: Vec::new(),
            }),
        )
        .unwrap();
        assert!(r.alias(3, 5));
        assert_eq!(1, r.live_count());
        assert_eq!(ConnectionKind::EventFd, r.lookup(5).unwrap().kind());

        // dup2(untracked, 5) closes the eventfd alias too.
        assert!(!r.alias(40, 5));
        assert!(r.lookup(5).is_none());
        assert_eq!(1, r.lookup(3).unwrap().ref_count());
    }

    #[test]
    fn duplicate_track() {
        let mut strict = ConnectionRegistry::new(100, true);
        strict.track(3, eventfd_params()).unwrap();
        match strict.track(3, eventfd_params()) {
            Err(ConnError::DuplicateDescriptor { fd: 3, existing }) => {
                assert_eq!(ConnectionKind::EventFd, existing)
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut lenient = ConnectionRegistry::new(100, false);
        let first = lenient.track(3, eventfd_params()).unwrap();
        let second = lenient
            .track(
                3,
                CreationParams::SignalFd(SignalFdParams {
                    mask: SigMask::empty(),
                    flags: 0,
                }),
            )
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(1, lenient.live_count());
        assert_eq!(ConnectionKind::SignalFd, lenient.lookup(3).unwrap().kind());
    }

    #[test]
    fn for_each_is_ordered_by_descriptor() {
        let mut r = ConnectionRegistry::new(100, true);
        for fd in &[9, 4, 7] {
            r.track(*fd, eventfd_params()).unwrap();
        }
        r.alias(9, 2);
        let mut seen = Vec::new();
        r.for_each(|c| {
            seen.push(c.primary_fd());
            Ok(())
        })
        .unwrap();
        assert_eq!(vec![2, 4, 7], seen);
    }

    #[test]
    fn fork_marks_everything_shared() {
        let mut r = ConnectionRegistry::new(100, true);
        let h = r.track(3, eventfd_params()).unwrap();
        assert_eq!(None, r.lookup(3).unwrap().shared_key());
        let mut child = r.clone();
        child.set_pid(101);
        child.mark_all_shared();
        r.mark_all_shared();
        assert_eq!(Some(h.id), r.lookup(3).unwrap().shared_key());
        assert_eq!(
            r.lookup(3).unwrap().shared_key(),
            child.lookup(3).unwrap().shared_key()
        );
        // New objects in the child are the child's own.
        let h2 = child.track(4, eventfd_params()).unwrap();
        assert_eq!(101, h2.id.creator);
    }

    #[test]
    fn sharing_an_untracked_descriptor() {
        let mut r = ConnectionRegistry::new(100, true);
        let h = r.track(3, eventfd_params()).unwrap();
        assert_eq!(h.id, r.mark_shared(3).unwrap());
        match r.mark_shared(4) {
            Err(ConnError::UntrackedDescriptor(4)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn kind_specific_updates() {
        let mut r = ConnectionRegistry::new(100, true);
        r.track(
            3,
            CreationParams::Inotify(InotifyParams {
                flags: 0,
                watches: Vec::new(),
            }),
        )
        .unwrap();
        assert!(r.add_inotify_watch(3, 1, b"/tmp", libc::IN_CREATE));
        assert!(!r.add_inotify_watch(4, 1, b"/tmp", libc::IN_CREATE));
        assert!(!r.update_signalfd_mask(3, SigMask(1), 0));
        assert!(!r.update_epoll_interest(3, libc::EPOLL_CTL_ADD, 5, Some((1, 1))));
        assert!(r.remove_inotify_watch(3, 1));
        assert!(!r.remove_inotify_watch(3, 1));
    }

    #[test]
    fn rebind_moves_descriptors() {
        let mut r = ConnectionRegistry::new(100, true);
        r.track(3, eventfd_params()).unwrap();
        r.alias(3, 4);
        let mut remap = RemapTable::new();
        remap.insert(3, 30);
        remap.insert(4, 40);
        r.rebind(remap);
        assert!(r.lookup(3).is_none());
        assert_eq!(2, r.lookup(40).unwrap().ref_count());
        assert_eq!(Some(&30), r.remap_table().get(&3));
    }

    /// Random track/dup/dup2/close sequences against a model of the kernel's
    /// descriptor table.
    #[test]
    fn randomized_sequences_keep_one_connection_per_object() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut r = ConnectionRegistry::new(100, true);
            // fd -> object
            let mut model: HashMap<RawFd, u32> = HashMap::new();
            let mut next_object = 0;
            for _ in 0..200 {
                let fd = rng.gen_range(0..24);
                match rng.gen_range(0..4) {
                    0 => {
                        if !model.contains_key(&fd) {
                            r.track(fd, eventfd_params()).unwrap();
                            model.insert(fd, next_object);
                            next_object += 1;
                        }
                    }
                    1 => {
                        let new_fd = rng.gen_range(0..24);
                        let tracked = r.alias(fd, new_fd);
                        assert_eq!(model.contains_key(&fd), tracked);
                        match model.get(&fd).copied() {
                            Some(obj) => {
                                model.insert(new_fd, obj);
                            }
                            None => {
                                model.remove(&new_fd);
                            }
                        }
                    }
                    _ => {
                        assert_eq!(model.remove(&fd).is_some(), r.release(fd));
                    }
                }

                let objects: BTreeSet<u32> = model.values().copied().collect();
                assert_eq!(objects.len(), r.live_count());
                for (fd, obj) in &model {
                    let conn = r.lookup(*fd).unwrap();
                    let same: BTreeSet<RawFd> = model
                        .iter()
                        .filter(|(_, o)| *o == obj)
                        .map(|(f, _)| *f)
                        .collect();
                    assert_eq!(&same, conn.fds());
                }
                assert_eq!(model.len(), r.tracked_fds().count());
            }
        }
    }

    #[test]
    fn adopts_inherited_descriptors() {
        let fd = unsafe { libc::eventfd(5, libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        let mut r = ConnectionRegistry::new(100, false);
        assert!(r.adopt_inherited().unwrap() >= 1);
        let conn = r.lookup(fd).unwrap();
        assert!(conn.flags().contains(ConnFlags::ADOPTED));
        match conn.params() {
            CreationParams::EventFd(p) => assert_eq!(5, p.initval),
            other => panic!("unexpected {:?}", other),
        }
        unsafe { libc::close(fd) };
    }
}
