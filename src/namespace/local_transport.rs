use super::{NsRecord, NsTransport};
use crate::{connection::ConnectionId, error::Result};
use libc::pid_t;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

#[derive(Default)]
struct Tables {
    records: BTreeMap<ConnectionId, NsRecord>,
    participants: BTreeMap<ConnectionId, BTreeSet<pid_t>>,
}

/// Records shared through memory: one process, or several simulated ones.
#[derive(Default)]
pub struct LocalTransport {
    tables: Mutex<Tables>,
    published: Condvar,
}

impl LocalTransport {
    pub fn new() -> LocalTransport {
        LocalTransport::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // A panicking holder cannot leave the maps half updated.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NsTransport for LocalTransport {
    fn register_participant(&self, key: ConnectionId, pid: pid_t) -> Result<()> {
        self.tables().participants.entry(key).or_default().insert(pid);
        Ok(())
    }

    fn participants(&self, key: ConnectionId) -> Result<Vec<pid_t>> {
        Ok(self
            .tables()
            .participants
            .get(&key)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default())
    }

    fn publish(&self, key: ConnectionId, record: NsRecord) -> Result<Option<NsRecord>> {
        let prev = self.tables().records.insert(key, record);
        self.published.notify_all();
        Ok(prev)
    }

    fn lookup(&self, key: ConnectionId, wait: Duration) -> Result<Option<NsRecord>> {
        let guard = self.tables();
        let (guard, _) = self
            .published
            .wait_timeout_while(guard, wait, |t| !t.records.contains_key(&key))
            .unwrap_or_else(|e| e.into_inner());
        Ok(guard.records.get(&key).cloned())
    }

    fn clear(&self, owner: pid_t) -> Result<()> {
        let mut t = self.tables();
        t.records.retain(|_, r| r.owner != owner);
        for pids in t.participants.values_mut() {
            pids.remove(&owner);
        }
        t.participants.retain(|_, pids| !pids.is_empty());
        Ok(())
    }
}
