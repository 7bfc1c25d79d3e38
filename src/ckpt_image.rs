//! The connection section of a checkpoint image.

use crate::{
    connection::{
        ops, ConnFlags, ConnectionId, ConnectionKind, CreationParams, DrainedState, Role,
        SavedOptions,
    },
    error::{ConnError, Result},
    log::LogLevel::LogDebug,
    registry::ConnectionRegistry,
};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    sync::Mutex,
};

pub const IMAGE_VERSION: u32 = 1;

/// One connection as checkpointed, keyed by its pre-checkpoint descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    /// Primary descriptor.
    pub fd: RawFd,
    /// The other descriptors aliasing the object.
    pub aliases: Vec<RawFd>,
    pub kind: ConnectionKind,
    pub params: CreationParams,
    pub shared_key: Option<ConnectionId>,
    pub ref_count: usize,
    pub role: Option<Role>,
    pub flags: ConnFlags,
    pub drained: Option<DrainedState>,
    pub saved_options: Vec<(RawFd, SavedOptions)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub version: u32,
    pub pid: pid_t,
    pub records: Vec<ConnectionRecord>,
    /// CRC32 of the serialized records.
    pub crc32: u32,
}

fn checksum(records: &[ConnectionRecord]) -> Result<u32> {
    Ok(crc32fast::hash(&serde_json::to_vec(records)?))
}

impl CheckpointImage {
    /// Fails on the first connection that could not be brought back from its
    /// record.
    pub fn capture(registry: &ConnectionRegistry) -> Result<CheckpointImage> {
        let mut records = Vec::with_capacity(registry.live_count());
        registry.for_each(|conn| {
            let fd = conn.primary_fd();
            (ops(conn.kind()).check_reconstructable)(conn.params(), conn.flags()).map_err(
                |reason| ConnError::UnreconstructableConnection {
                    fd,
                    kind: conn.kind(),
                    reason,
                },
            )?;
            let saved_options = conn
                .fds()
                .iter()
                .filter_map(|f| registry.saved_options_for(*f).map(|o| (*f, o)))
                .collect();
            records.push(ConnectionRecord {
                id: conn.id(),
                fd,
                aliases: conn.fds().iter().copied().filter(|f| *f != fd).collect(),
                kind: conn.kind(),
                params: conn.params().clone(),
                shared_key: conn.shared_key(),
                ref_count: conn.ref_count(),
                role: conn.role(),
                flags: conn.flags(),
                drained: conn.drained().cloned(),
                saved_options,
            });
            Ok(())
        })?;
        Ok(CheckpointImage {
            version: IMAGE_VERSION,
            pid: registry.pid(),
            crc32: checksum(&records)?,
            records,
        })
    }

    pub fn verify(&self) -> Result<()> {
        if self.version != IMAGE_VERSION {
            return Err(ConnError::Image(format!(
                "unsupported version {}",
                self.version
            )));
        }
        let actual = checksum(&self.records)?;
        if actual != self.crc32 {
            return Err(ConnError::Image(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                self.crc32, actual
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<CheckpointImage> {
        let image: CheckpointImage = serde_json::from_slice(bytes)?;
        image.verify()?;
        Ok(image)
    }
}

/// Where `ckpt` puts the image and `postRestart` finds it.
pub trait ImageStore: Send + Sync {
    fn write(&self, image: &CheckpointImage) -> Result<()>;
    fn read(&self) -> Result<CheckpointImage>;
}

/// Keeps the image in process memory, which the memory snapshot carries over
/// to the restarted process.
#[derive(Default)]
pub struct MemoryImageStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemoryImageStore {
    pub fn new() -> MemoryImageStore {
        MemoryImageStore::default()
    }
}

impl ImageStore for MemoryImageStore {
    fn write(&self, image: &CheckpointImage) -> Result<()> {
        let bytes = image.to_bytes()?;
        *self.bytes.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
        Ok(())
    }

    fn read(&self) -> Result<CheckpointImage> {
        match &*self.bytes.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(bytes) => CheckpointImage::from_bytes(bytes),
            None => Err(ConnError::Image("no image was written".into())),
        }
    }
}

pub struct FileImageStore {
    path: PathBuf,
}

impl FileImageStore {
    /// The file name is fixed from the pid at construction, so a restarted
    /// process with a different pid still finds it.
    pub fn new(dir: &Path, pid: pid_t) -> FileImageStore {
        FileImageStore {
            path: dir.join(format!("ckpt-connections-{}.json", pid)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageStore for FileImageStore {
    fn write(&self, image: &CheckpointImage) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, image.to_bytes()?)?;
        fs::rename(&tmp, &self.path)?;
        log!(
            LogDebug,
            "Wrote {} connection records to {:?}",
            image.records.len(),
            self.path
        );
        Ok(())
    }

    fn read(&self) -> Result<CheckpointImage> {
        match fs::read(&self.path) {
            Ok(bytes) => CheckpointImage::from_bytes(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ConnError::Image(format!("{:?} does not exist", self.path)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EventFdParams, InotifyParams, InotifyWatch};

    fn registry() -> ConnectionRegistry {
        let mut r = ConnectionRegistry::new(42, true);
        r.track(
            5,
            CreationParams::EventFd(EventFdParams {
                initval: 0,
                flags: libc::EFD_NONBLOCK,
            }),
        )
        .unwrap();
        r.alias(5, 8);
        r.set_saved_options(vec![(
            5,
            SavedOptions {
                status_flags: libc::O_RDWR | libc::O_NONBLOCK,
                fd_flags: 0,
            },
        )]);
        r
    }

    #[test]
    fn capture_records_aliases() {
        let image = CheckpointImage::capture(&registry()).unwrap();
        assert_eq!(1, image.records.len());
        let rec = &image.records[0];
        assert_eq!(5, rec.fd);
        assert_eq!(vec![8], rec.aliases);
        assert_eq!(2, rec.ref_count);
        assert_eq!(1, rec.saved_options.len());
        image.verify().unwrap();
    }

    #[test]
    fn memory_store_restores_registry() {
        let store = MemoryImageStore::new();
        assert!(store.read().is_err());
        store
            .write(&CheckpointImage::capture(&registry()).unwrap())
            .unwrap();
        let image = store.read().unwrap();
        let mut restored = ConnectionRegistry::new(99, true);
        restored.replace_from_records(&image.records);
        assert_eq!(1, restored.live_count());
        assert_eq!(2, restored.lookup(8).unwrap().ref_count());
        assert!(restored.saved_options_for(5).is_some());
    }

    #[test]
    fn tampered_image_is_rejected() {
        let mut image = CheckpointImage::capture(&registry()).unwrap();
        image.records[0].ref_count = 1;
        let bytes = image.to_bytes().unwrap();
        match CheckpointImage::from_bytes(&bytes) {
            Err(ConnError::Image(msg)) => assert!(msg.contains("checksum")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unreconstructable_connection_fails_capture() {
        let mut r = ConnectionRegistry::new(42, false);
        r.track_with_flags(
            4,
            CreationParams::Inotify(InotifyParams {
                flags: 0,
                watches: vec![InotifyWatch {
                    wd: 1,
                    path: Vec::new(),
                    mask: libc::IN_CREATE,
                }],
            }),
            ConnFlags::ADOPTED | ConnFlags::PARAMS_INCOMPLETE,
        )
        .unwrap();
        match CheckpointImage::capture(&r) {
            Err(ConnError::UnreconstructableConnection { fd: 4, kind, .. }) => {
                assert_eq!(ConnectionKind::Inotify, kind)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn file_store() {
        let dir = std::env::temp_dir();
        let store = FileImageStore::new(&dir, -(std::process::id() as pid_t));
        let image = CheckpointImage::capture(&registry()).unwrap();
        store.write(&image).unwrap();
        assert_eq!(image, store.read().unwrap());
        fs::remove_file(store.path()).unwrap();
        assert!(store.read().is_err());
    }
}
