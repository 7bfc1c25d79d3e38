//! Restart-time exchange of recreation data between the processes that share
//! a kernel object, and the participant bookkeeping leader election uses.

use crate::{
    connection::{ConnectionId, RecreationData},
    error::{ConnError, Result},
    log::LogLevel::{LogDebug, LogWarn},
};
use libc::pid_t;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

mod fs_transport;
mod local_transport;

pub use fs_transport::FsTransport;
pub use local_transport::LocalTransport;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NsRecord {
    pub owner: pid_t,
    pub data: RecreationData,
}

/// How the records travel between processes.
pub trait NsTransport: Send + Sync {
    /// `pid` references the object `key` in this checkpoint cycle.
    fn register_participant(&self, key: ConnectionId, pid: pid_t) -> Result<()>;

    fn participants(&self, key: ConnectionId) -> Result<Vec<pid_t>>;

    /// Returns the record that was replaced, if any.
    fn publish(&self, key: ConnectionId, record: NsRecord) -> Result<Option<NsRecord>>;

    /// Wait at most `wait` for a record for `key` to show up.
    fn lookup(&self, key: ConnectionId, wait: Duration) -> Result<Option<NsRecord>>;

    /// Drop the records and participations of `owner`.
    fn clear(&self, owner: pid_t) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Wait before giving up on attempt `attempt` (0 based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Upper bound on the time a failing query takes.
    pub fn worst_case(&self) -> Duration {
        (0..self.max_attempts)
            .map(|a| self.backoff(a) + self.backoff(a) / 4)
            .sum()
    }
}

/// Lowest pid wins. Every participant computes this on the same set, so they
/// all agree without talking to each other.
pub fn elect_leader(participants: &[pid_t]) -> Option<pid_t> {
    participants.iter().copied().min()
}

#[derive(Clone)]
pub struct NamespaceExchange {
    transport: Arc<dyn NsTransport>,
    policy: RetryPolicy,
}

impl NamespaceExchange {
    pub fn new(transport: Arc<dyn NsTransport>, policy: RetryPolicy) -> NamespaceExchange {
        NamespaceExchange { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn register_participant(&self, key: ConnectionId, pid: pid_t) -> Result<()> {
        self.transport.register_participant(key, pid)
    }

    pub fn participants(&self, key: ConnectionId) -> Result<Vec<pid_t>> {
        let mut pids = self.transport.participants(key)?;
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Last writer wins. Two leaders for one key means election went wrong
    /// somewhere, but the data is equivalent so we carry on.
    pub fn publish(&self, key: ConnectionId, owner: pid_t, data: RecreationData) -> Result<()> {
        let replaced = self.transport.publish(key, NsRecord { owner, data })?;
        match replaced {
            Some(prev) if prev.owner != owner => log!(
                LogWarn,
                "Record for {} published by {} replaces the one from {}",
                key,
                owner,
                prev.owner
            ),
            Some(_) => log!(LogWarn, "Record for {} published twice by {}", key, owner),
            None => log!(LogDebug, "Published record for {}", key),
        }
        Ok(())
    }

    /// Blocks until the leader for `key` has published, within the retry
    /// budget.
    pub fn query(&self, key: ConnectionId) -> Result<NsRecord> {
        let mut rng = rand::thread_rng();
        for attempt in 0..self.policy.max_attempts {
            let base = self.policy.backoff(attempt);
            let jitter_ms = rng.gen_range(0..=base.as_millis() as u64 / 4);
            let wait = base + Duration::from_millis(jitter_ms);
            if let Some(record) = self.transport.lookup(key, wait)? {
                log!(
                    LogDebug,
                    "Record for {} from {} after {} attempts",
                    key,
                    record.owner,
                    attempt + 1
                );
                return Ok(record);
            }
        }
        Err(ConnError::PeerUnavailable(key, self.policy.max_attempts))
    }

    pub fn clear(&self, owner: pid_t) -> Result<()> {
        self.transport.clear(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CreationParams, EventFdParams};
    use std::{thread, time::Instant};

    fn key(serial: u64) -> ConnectionId {
        ConnectionId {
            creator: 10,
            serial,
        }
    }

    fn data(initval: u32) -> RecreationData {
        RecreationData {
            params: CreationParams::EventFd(EventFdParams { initval, flags: 0 }),
            drained: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn exchange() -> NamespaceExchange {
        NamespaceExchange::new(Arc::new(LocalTransport::new()), fast_policy())
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = RetryPolicy::default();
        assert_eq!(Duration::from_millis(10), p.backoff(0));
        assert_eq!(Duration::from_millis(80), p.backoff(3));
        assert_eq!(Duration::from_millis(1000), p.backoff(7));
        assert_eq!(Duration::from_millis(1000), p.backoff(40));
    }

    #[test]
    fn query_after_publish() {
        let ex = exchange();
        ex.publish(key(1), 10, data(4)).unwrap();
        let start = Instant::now();
        let record = ex.query(key(1)).unwrap();
        assert_eq!(10, record.owner);
        assert_eq!(data(4), record.data);
        assert!(start.elapsed() < fast_policy().worst_case());
    }

    #[test]
    fn query_without_publish_gives_up() {
        let ex = exchange();
        let start = Instant::now();
        match ex.query(key(2)) {
            Err(ConnError::PeerUnavailable(k, 3)) => assert_eq!(key(2), k),
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() <= fast_policy().worst_case() + Duration::from_secs(1));
    }

    #[test]
    fn late_publish_wakes_the_query() {
        let ex = NamespaceExchange::new(
            Arc::new(LocalTransport::new()),
            RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(400),
            },
        );
        let publisher = ex.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            publisher.publish(key(3), 11, data(1)).unwrap();
        });
        assert_eq!(11, ex.query(key(3)).unwrap().owner);
        t.join().unwrap();
    }

    #[test]
    fn last_publish_wins() {
        let ex = exchange();
        ex.publish(key(4), 10, data(1)).unwrap();
        ex.publish(key(4), 12, data(2)).unwrap();
        assert_eq!(data(2), ex.query(key(4)).unwrap().data);
    }

    #[test]
    fn election_is_deterministic() {
        let ex = exchange();
        for pid in &[30, 12, 55, 12] {
            ex.register_participant(key(5), *pid).unwrap();
        }
        let pids = ex.participants(key(5)).unwrap();
        assert_eq!(vec![12, 30, 55], pids);
        let mut shuffled = pids.clone();
        shuffled.reverse();
        assert_eq!(elect_leader(&pids), elect_leader(&shuffled));
        assert_eq!(Some(12), elect_leader(&pids));
        assert_eq!(None, elect_leader(&[]));
    }

    #[test]
    fn clear_only_drops_own_records() {
        let ex = exchange();
        ex.publish(key(6), 10, data(1)).unwrap();
        ex.publish(key(7), 20, data(1)).unwrap();
        ex.register_participant(key(6), 10).unwrap();
        ex.register_participant(key(6), 20).unwrap();
        ex.clear(10).unwrap();
        assert!(ex.query(key(6)).is_err());
        assert_eq!(20, ex.query(key(7)).unwrap().owner);
        assert_eq!(vec![20], ex.participants(key(6)).unwrap());
    }
}
