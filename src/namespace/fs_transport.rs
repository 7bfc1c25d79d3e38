use super::{NsRecord, NsTransport};
use crate::{
    connection::ConnectionId,
    error::Result,
    log::LogLevel::{LogDebug, LogWarn},
};
use libc::pid_t;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Longest single sleep while polling for a record.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Records shared through a directory every cooperating process can see.
///
/// ```text
/// <dir>/records/<creator>-<serial>.json
/// <dir>/participants/<creator>-<serial>/<pid>
/// ```
///
/// Records are written to a temporary name and renamed into place, so a
/// reader sees either nothing or a complete record.
pub struct FsTransport {
    dir: PathBuf,
}

impl FsTransport {
    pub fn new(dir: &Path) -> io::Result<FsTransport> {
        fs::create_dir_all(dir.join("records"))?;
        fs::create_dir_all(dir.join("participants"))?;
        Ok(FsTransport {
            dir: dir.to_owned(),
        })
    }

    fn record_path(&self, key: ConnectionId) -> PathBuf {
        self.dir.join("records").join(format!("{}.json", key))
    }

    fn participant_dir(&self, key: ConnectionId) -> PathBuf {
        self.dir.join("participants").join(key.to_string())
    }

    fn read_record(path: &Path) -> Result<Option<NsRecord>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl NsTransport for FsTransport {
    fn register_participant(&self, key: ConnectionId, pid: pid_t) -> Result<()> {
        let dir = self.participant_dir(key);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(pid.to_string()), b"")?;
        Ok(())
    }

    fn participants(&self, key: ConnectionId) -> Result<Vec<pid_t>> {
        let entries = match fs::read_dir(self.participant_dir(key)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut pids = Vec::new();
        for entry in entries {
            let entry = entry?;
            match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                Some(pid) => pids.push(pid),
                None => log!(LogWarn, "Stray file {:?} among participants", entry.path()),
            }
        }
        Ok(pids)
    }

    fn publish(&self, key: ConnectionId, record: NsRecord) -> Result<Option<NsRecord>> {
        let path = self.record_path(key);
        let prev = Self::read_record(&path)?;
        let tmp = self
            .dir
            .join("records")
            .join(format!(".{}.{}.tmp", key, record.owner));
        fs::write(&tmp, serde_json::to_vec(&record)?)?;
        fs::rename(&tmp, &path)?;
        log!(LogDebug, "Wrote {:?}", path);
        Ok(prev)
    }

    fn lookup(&self, key: ConnectionId, wait: Duration) -> Result<Option<NsRecord>> {
        let path = self.record_path(key);
        let deadline = Instant::now() + wait;
        loop {
            if let Some(record) = Self::read_record(&path)? {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn clear(&self, owner: pid_t) -> Result<()> {
        for entry in fs::read_dir(self.dir.join("records"))? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path)? {
                if record.owner == owner {
                    fs::remove_file(&path)?;
                }
            }
        }
        for entry in fs::read_dir(self.dir.join("participants"))? {
            let mine = entry?.path().join(owner.to_string());
            match fs::remove_file(&mine) {
                Ok(()) => (),
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{CreationParams, RecreationData, SignalFdParams},
        sig::SigMask,
    };
    use rand::Rng;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> TempDir {
            let dir = std::env::temp_dir().join(format!(
                "ckpt-agent-ns-{}-{:x}",
                std::process::id(),
                rand::thread_rng().gen::<u64>()
            ));
            fs::create_dir_all(&dir).unwrap();
            TempDir(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn record(owner: pid_t) -> NsRecord {
        NsRecord {
            owner,
            data: RecreationData {
                params: CreationParams::SignalFd(SignalFdParams {
                    mask: SigMask(1 << 9),
                    flags: libc::SFD_CLOEXEC,
                }),
                drained: None,
            },
        }
    }

    #[test]
    fn records_cross_transport_instances() {
        let tmp = TempDir::new();
        let key = ConnectionId {
            creator: 7,
            serial: 2,
        };
        let leader = FsTransport::new(&tmp.0).unwrap();
        let follower = FsTransport::new(&tmp.0).unwrap();
        assert_eq!(None, follower.lookup(key, Duration::from_millis(1)).unwrap());
        assert_eq!(None, leader.publish(key, record(7)).unwrap());
        assert_eq!(
            Some(record(7)),
            follower.lookup(key, Duration::from_millis(1)).unwrap()
        );
        assert_eq!(Some(record(7)), leader.publish(key, record(8)).unwrap());

        leader.register_participant(key, 7).unwrap();
        follower.register_participant(key, 9).unwrap();
        let mut pids = follower.participants(key).unwrap();
        pids.sort_unstable();
        assert_eq!(vec![7, 9], pids);

        leader.clear(8).unwrap();
        leader.clear(7).unwrap();
        assert_eq!(None, follower.lookup(key, Duration::from_millis(0)).unwrap());
        assert_eq!(vec![9], follower.participants(key).unwrap());
    }
}
