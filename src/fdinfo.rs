//! Reading kernel state we cannot otherwise observe without consuming it:
//! `/proc/self/fdinfo/<fd>` and the `/proc/self/fd/<fd>` link target.

use crate::{connection::ConnectionKind, sig::SigMask};
use regex::Regex;
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    os::unix::io::RawFd,
};

lazy_static! {
    static ref EPOLL_TFD_RE: Regex =
        Regex::new(r"^tfd:\s*(\d+)\s+events:\s*([0-9a-f]+)\s+data:\s*([0-9a-f]+)").unwrap();
    static ref INOTIFY_WD_RE: Regex =
        Regex::new(r"^inotify wd:([0-9a-f]+) ino:([0-9a-f]+) sdev:([0-9a-f]+) mask:([0-9a-f]+)")
            .unwrap();
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EpollTarget {
    pub fd: RawFd,
    pub events: u32,
    pub data: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InotifyMark {
    pub wd: i32,
    pub ino: u64,
    pub mask: u32,
}

/// One parsed fdinfo file. Unknown keys are kept; lines without a `key:`
/// prefix (epoll `tfd:` and inotify lines do have one) are ignored.
#[derive(Clone, Debug, Default)]
pub struct FdInfo {
    pub flags: Option<i32>,
    lines: Vec<(String, String)>,
}

impl FdInfo {
    pub fn read(fd: RawFd) -> io::Result<FdInfo> {
        let fdinfo_path = format!("/proc/self/fdinfo/{}", fd);
        let f = BufReader::new(File::open(&fdinfo_path)?);
        let mut text = String::new();
        for line in f.lines() {
            text.push_str(&line?);
            text.push('\n');
        }
        Ok(FdInfo::parse(&text))
    }

    pub fn parse(text: &str) -> FdInfo {
        let mut info = FdInfo::default();
        for line in text.lines() {
            let (key, value) = match line.find(':') {
                Some(loc) => (&line[..loc], line[loc + 1..].trim()),
                None => continue,
            };
            if key == "flags" {
                info.flags = i32::from_str_radix(value, 8).ok();
            }
            info.lines.push((key.trim().to_owned(), value.to_owned()));
        }
        info
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The kernel prints the counter in hex.
    pub fn eventfd_count(&self) -> Option<u64> {
        self.value("eventfd-count")
            .and_then(|v| u64::from_str_radix(v.trim(), 16).ok())
    }

    /// Only printed by recent kernels.
    pub fn eventfd_semaphore(&self) -> Option<bool> {
        self.value("eventfd-semaphore")
            .and_then(|v| v.parse::<u32>().ok())
            .map(|v| v != 0)
    }

    pub fn signalfd_mask(&self) -> Option<SigMask> {
        self.value("sigmask")
            .and_then(|v| u64::from_str_radix(v, 16).ok())
            .map(SigMask)
    }

    pub fn epoll_targets(&self) -> Vec<EpollTarget> {
        self.lines
            .iter()
            .filter(|(k, _)| k == "tfd")
            .filter_map(|(k, v)| {
                let line = format!("{}: {}", k, v);
                let caps = EPOLL_TFD_RE.captures(&line)?;
                Some(EpollTarget {
                    fd: caps[1].parse().ok()?,
                    events: u32::from_str_radix(&caps[2], 16).ok()?,
                    data: u64::from_str_radix(&caps[3], 16).ok()?,
                })
            })
            .collect()
    }

    pub fn inotify_marks(&self) -> Vec<InotifyMark> {
        self.lines
            .iter()
            .filter(|(k, _)| k == "inotify wd")
            .filter_map(|(k, v)| {
                let line = format!("{}:{}", k, v);
                let caps = INOTIFY_WD_RE.captures(&line)?;
                Some(InotifyMark {
                    wd: i32::from_str_radix(&caps[1], 16).ok()?,
                    ino: u64::from_str_radix(&caps[2], 16).ok()?,
                    mask: u32::from_str_radix(&caps[4], 16).ok()?,
                })
            })
            .collect()
    }
}

/// Which virtualizable kind, if any, `fd` currently refers to.
pub fn anon_inode_kind(fd: RawFd) -> Option<ConnectionKind> {
    let target = fs::read_link(format!("/proc/self/fd/{}", fd)).ok()?;
    kind_from_link_target(&target.to_string_lossy())
}

pub fn kind_from_link_target(target: &str) -> Option<ConnectionKind> {
    match target {
        "anon_inode:[eventpoll]" => Some(ConnectionKind::Epoll),
        "anon_inode:[eventfd]" => Some(ConnectionKind::EventFd),
        "anon_inode:[signalfd]" => Some(ConnectionKind::SignalFd),
        "anon_inode:inotify" => Some(ConnectionKind::Inotify),
        _ => None,
    }
}

/// Every open descriptor of this process, ascending.
pub fn open_fds() -> io::Result<Vec<RawFd>> {
    let mut fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTFD_INFO: &str = "pos:\t0\nflags:\t02004002\nmnt_id:\t15\nino:\t1057\neventfd-count:               2a\neventfd-id: 3\n";

    const EPOLL_INFO: &str = "pos:\t0\nflags:\t02\nmnt_id:\t15\nino:\t1057\n\
tfd:        5 events:       19 data:                5  pos:0 ino:1f3 sdev:f\n\
tfd:        7 events: 80000001 data:       deadbeef  pos:0 ino:1f4 sdev:f\n";

    const INOTIFY_INFO: &str = "pos:\t0\nflags:\t00\nmnt_id:\t15\nino:\t1057\n\
inotify wd:1 ino:a2 sdev:800011 mask:fce ignored_mask:0 fhandle-bytes:8 fhandle-type:1 f_handle:a200000035d2cc13\n";

    #[test]
    fn eventfd_fields() {
        let info = FdInfo::parse(EVENTFD_INFO);
        assert_eq!(Some(0o2004002), info.flags);
        assert_eq!(Some(42), info.eventfd_count());
        assert_eq!(None, info.eventfd_semaphore());
    }

    #[test]
    fn epoll_targets() {
        let info = FdInfo::parse(EPOLL_INFO);
        let targets = info.epoll_targets();
        assert_eq!(2, targets.len());
        assert_eq!(
            EpollTarget {
                fd: 5,
                events: 0x19,
                data: 5
            },
            targets[0]
        );
        assert_eq!(0x8000_0001, targets[1].events);
        assert_eq!(0xdeadbeef, targets[1].data);
    }

    #[test]
    fn inotify_marks() {
        let marks = FdInfo::parse(INOTIFY_INFO).inotify_marks();
        assert_eq!(
            vec![InotifyMark {
                wd: 1,
                ino: 0xa2,
                mask: 0xfce
            }],
            marks
        );
    }

    #[test]
    fn signalfd_mask() {
        let info = FdInfo::parse("pos:\t0\nflags:\t02\nsigmask:\t0000000000000200\n");
        assert_eq!(Some(SigMask(0x200)), info.signalfd_mask());
    }

    #[test]
    fn live_eventfd() {
        let fd = unsafe { libc::eventfd(7, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd >= 0);
        let info = FdInfo::read(fd).unwrap();
        assert_eq!(Some(7), info.eventfd_count());
        assert_ne!(0, info.flags.unwrap() & libc::O_NONBLOCK);
        assert_eq!(Some(ConnectionKind::EventFd), anon_inode_kind(fd));
        assert!(open_fds().unwrap().contains(&fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn link_targets() {
        assert_eq!(None, kind_from_link_target("/dev/null"));
        assert_eq!(
            Some(ConnectionKind::Inotify),
            kind_from_link_target("anon_inode:inotify")
        );
    }
}
