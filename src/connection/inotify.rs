use super::{
    creation_flags_from_status, ConnFlags, CreationParams, DrainedState, KindOps, RecreationData,
};
use crate::{
    error::Result,
    fdinfo::FdInfo,
    log::LogLevel::{LogDebug, LogError, LogWarn},
    real,
    remap::RemapTable,
};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::{ffi::CString, os::unix::io::RawFd};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InotifyWatch {
    pub wd: i32,
    /// Raw bytes: paths need not be UTF-8. Empty when adopted from fdinfo,
    /// which only knows the inode.
    pub path: Vec<u8>,
    pub mask: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InotifyParams {
    /// IN_CLOEXEC | IN_NONBLOCK
    pub flags: i32,
    pub watches: Vec<InotifyWatch>,
}

impl InotifyParams {
    /// inotify_add_watch() on an already watched inode returns the existing
    /// wd and replaces (or with IN_MASK_ADD extends) its mask.
    pub fn add_watch(&mut self, wd: i32, path: &[u8], mask: u32) {
        match self.watches.iter_mut().find(|w| w.wd == wd) {
            Some(w) => {
                if mask & libc::IN_MASK_ADD != 0 {
                    w.mask |= mask & !libc::IN_MASK_ADD;
                } else {
                    w.mask = mask;
                }
            }
            None => self.watches.push(InotifyWatch {
                wd,
                path: path.to_vec(),
                mask: mask & !libc::IN_MASK_ADD,
            }),
        }
    }

    pub fn remove_watch(&mut self, wd: i32) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| w.wd != wd);
        before != self.watches.len()
    }
}

pub static INOTIFY_OPS: KindOps = KindOps {
    name: "inotify",
    create,
    drain,
    restore,
    check_reconstructable,
    adopt,
};

fn params_of(params: &CreationParams) -> &InotifyParams {
    match params {
        CreationParams::Inotify(p) => p,
        other => fatal!("inotify ops called with {:?}", other.kind()),
    }
}

fn create(data: &RecreationData) -> nix::Result<RawFd> {
    let params = params_of(&data.params);
    Errno::result(unsafe { real::inotify_init1(params.flags) })
}

/// Queued events cannot be read without consuming them, and a resumed process
/// still needs them. Only their size is recorded.
fn drain(fd: RawFd, _params: &CreationParams) -> Result<Option<DrainedState>> {
    let mut queued: libc::c_int = 0;
    Errno::result(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut queued as *mut libc::c_int) })?;
    Ok(Some(DrainedState::Inotify {
        queued_bytes: queued.max(0) as u32,
    }))
}

/// Watches come back through inotify_add_watch(). The kernel picks the wd, so
/// it matches the old one only if watches are re-added in creation order into
/// a fresh instance, which is what we do.
fn restore(
    fd: RawFd,
    params: &CreationParams,
    drained: Option<&DrainedState>,
    _remap: &RemapTable,
) -> Result<()> {
    if let Some(DrainedState::Inotify { queued_bytes }) = drained {
        if *queued_bytes > 0 {
            log!(
                LogWarn,
                "{} bytes of queued inotify events on fd {} are lost",
                queued_bytes,
                fd
            );
        }
    }
    for w in &params_of(params).watches {
        let path = match CString::new(w.path.clone()) {
            Ok(p) => p,
            Err(_) => {
                log!(LogError, "inotify watch {} has an unusable path", w.wd);
                continue;
            }
        };
        let wd = unsafe { real::inotify_add_watch(fd, path.as_ptr(), w.mask) };
        if wd < 0 {
            // The watched file may legitimately be gone by now.
            log!(
                LogError,
                "Could not re-add inotify watch on {:?}: {}",
                path,
                Errno::last()
            );
        } else if wd != w.wd {
            log!(
                LogWarn,
                "inotify watch on {:?} came back as wd {} instead of {}",
                path,
                wd,
                w.wd
            );
        } else {
            log!(LogDebug, "inotify watch {} on {:?} restored", wd, path);
        }
    }
    Ok(())
}

fn check_reconstructable(params: &CreationParams, flags: ConnFlags) -> std::result::Result<(), String> {
    if flags.contains(ConnFlags::PARAMS_INCOMPLETE) {
        let wds: Vec<String> = params_of(params)
            .watches
            .iter()
            .filter(|w| w.path.is_empty())
            .map(|w| w.wd.to_string())
            .collect();
        return Err(format!("paths of watches {} are unknown", wds.join(",")));
    }
    Ok(())
}

fn adopt(_fd: RawFd, info: &FdInfo) -> (CreationParams, ConnFlags) {
    let watches: Vec<InotifyWatch> = info
        .inotify_marks()
        .into_iter()
        .map(|m| InotifyWatch {
            wd: m.wd,
            path: Vec::new(),
            mask: m.mask,
        })
        .collect();
    let mut flags = ConnFlags::ADOPTED;
    if !watches.is_empty() {
        flags |= ConnFlags::PARAMS_INCOMPLETE;
    }
    (
        CreationParams::Inotify(InotifyParams {
            flags: creation_flags_from_status(info.flags),
            watches,
        }),
        flags,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_bookkeeping() {
        let mut p = InotifyParams {
            flags: 0,
            watches: Vec::new(),
        };
        p.add_watch(1, b"/tmp", libc::IN_CREATE);
        p.add_watch(1, b"/tmp", libc::IN_DELETE | libc::IN_MASK_ADD);
        assert_eq!(1, p.watches.len());
        assert_eq!(libc::IN_CREATE | libc::IN_DELETE, p.watches[0].mask);
        p.add_watch(1, b"/tmp", libc::IN_MODIFY);
        assert_eq!(libc::IN_MODIFY, p.watches[0].mask);
        assert!(p.remove_watch(1));
        assert!(!p.remove_watch(1));
    }

    #[test]
    fn watches_are_replayed() {
        let dir = std::env::temp_dir();
        let mut params = InotifyParams {
            flags: libc::IN_NONBLOCK | libc::IN_CLOEXEC,
            watches: Vec::new(),
        };
        params.add_watch(1, dir.to_str().unwrap().as_bytes(), libc::IN_CREATE);
        let data = RecreationData {
            params: CreationParams::Inotify(params),
            drained: Some(DrainedState::Inotify { queued_bytes: 0 }),
        };
        let fd = create(&data).unwrap();
        restore(fd, &data.params, data.drained.as_ref(), &RemapTable::new()).unwrap();
        let marks = FdInfo::read(fd).unwrap().inotify_marks();
        assert_eq!(1, marks.len());
        assert_eq!(1, marks[0].wd);
        assert_ne!(0, marks[0].mask & libc::IN_CREATE);
        assert_eq!(
            Some(DrainedState::Inotify { queued_bytes: 0 }),
            drain(fd, &data.params).unwrap()
        );
        unsafe { libc::close(fd) };
    }

    #[test]
    fn adopted_watches_are_not_reconstructable() {
        let info = FdInfo::parse(
            "pos:\t0\nflags:\t02000000\ninotify wd:2 ino:a2 sdev:800011 mask:100 ignored_mask:0\n",
        );
        let (params, flags) = adopt(-1, &info);
        assert!(check_reconstructable(&params, flags).is_err());
        let (params, flags) = adopt(-1, &FdInfo::parse("pos:\t0\nflags:\t00\n"));
        assert!(check_reconstructable(&params, flags).is_ok());
    }
}
