//! Drives the registry through one checkpoint, and then either a resume or a
//! restart. The coordinator calls one method per barrier; anything out of
//! sequence is refused.

use crate::{
    ckpt_image::{CheckpointImage, ImageStore},
    connection::{
        ops, Connection, ConnectionId, ConnectionKind, RecreationData, Role, SavedOptions,
    },
    error::{ConnError, Result},
    fdinfo::anon_inode_kind,
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    namespace::{elect_leader, NamespaceExchange, NsRecord},
    process_context::ProcessContext,
    registry::ConnectionRegistry,
    remap::{DescriptorRemap, InPlaceRemap, RemapTable},
    thread_plugin::{InertThreadSuspender, ThreadSuspender},
};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::{collections::BTreeMap, os::unix::io::RawFd, sync::Arc};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    SaveOptions,
    LeaderElection,
    DrainFd,
    Ckpt,
    ResumeRefill,
    ResumeResume,
    PostRestart,
    RestartRegisterNsData,
    RestartSendQueries,
    RestartRefill,
    RestartResume,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::SaveOptions => "saveOptions",
            Phase::LeaderElection => "leaderElection",
            Phase::DrainFd => "drainFd",
            Phase::Ckpt => "ckpt",
            Phase::ResumeRefill => "resumeRefill",
            Phase::ResumeResume => "resumeResume",
            Phase::PostRestart => "postRestart",
            Phase::RestartRegisterNsData => "restartRegisterNSData",
            Phase::RestartSendQueries => "restartSendQueries",
            Phase::RestartRefill => "restartRefill",
            Phase::RestartResume => "restartResume",
        }
    }

    pub fn is_restart(self) -> bool {
        matches!(
            self,
            Phase::PostRestart
                | Phase::RestartRegisterNsData
                | Phase::RestartSendQueries
                | Phase::RestartRefill
                | Phase::RestartResume
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OrchestratorState {
    Idle,
    SavedOptions,
    LeaderElected,
    Drained,
    /// The image is written; the process is either snapshotted and resumed
    /// next, or it never runs again and a restarted copy takes over.
    Quiesced,
    ResumeRefilled,
    Restarted,
    NsRegistered,
    QueriesSent,
    RestartRefilled,
}

impl Phase {
    fn may_start_from(self, s: OrchestratorState) -> bool {
        use OrchestratorState::*;
        match self {
            Phase::SaveOptions => s == Idle,
            Phase::LeaderElection => s == SavedOptions,
            Phase::DrainFd => s == LeaderElected,
            Phase::Ckpt => s == Drained,
            Phase::ResumeRefill => s == Quiesced,
            Phase::ResumeResume => s == ResumeRefilled,
            // A restarted process has run no phase in its new life, unless
            // its memory snapshot was taken after ckpt.
            Phase::PostRestart => matches!(s, Idle | Quiesced),
            Phase::RestartRegisterNsData => s == Restarted,
            Phase::RestartSendQueries => s == NsRegistered,
            Phase::RestartRefill => s == QueriesSent,
            Phase::RestartResume => s == RestartRefilled,
        }
    }

    fn leaves(self) -> OrchestratorState {
        use OrchestratorState::*;
        match self {
            Phase::SaveOptions => SavedOptions,
            Phase::LeaderElection => LeaderElected,
            Phase::DrainFd => Drained,
            Phase::Ckpt => Quiesced,
            Phase::ResumeRefill => ResumeRefilled,
            Phase::ResumeResume | Phase::RestartResume => Idle,
            Phase::PostRestart => Restarted,
            Phase::RestartRegisterNsData => NsRegistered,
            Phase::RestartSendQueries => QueriesSent,
            Phase::RestartRefill => RestartRefilled,
        }
    }
}

pub struct CheckpointOrchestrator {
    ctx: Arc<ProcessContext>,
    exchange: NamespaceExchange,
    store: Arc<dyn ImageStore>,
    remap: Box<dyn DescriptorRemap>,
    suspender: Box<dyn ThreadSuspender>,
    state: OrchestratorState,
    threads_suspended: bool,
    /// Recreation data obtained by restartSendQueries.
    received: BTreeMap<ConnectionId, NsRecord>,
}

impl CheckpointOrchestrator {
    pub fn new(
        ctx: Arc<ProcessContext>,
        exchange: NamespaceExchange,
        store: Arc<dyn ImageStore>,
    ) -> CheckpointOrchestrator {
        CheckpointOrchestrator {
            ctx,
            exchange,
            store,
            remap: Box::new(InPlaceRemap),
            suspender: Box::new(InertThreadSuspender),
            state: OrchestratorState::Idle,
            threads_suspended: false,
            received: BTreeMap::new(),
        }
    }

    pub fn with_remap(mut self, remap: Box<dyn DescriptorRemap>) -> Self {
        self.remap = remap;
        self
    }

    pub fn with_suspender(mut self, suspender: Box<dyn ThreadSuspender>) -> Self {
        self.suspender = suspender;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    /// What restartRefill moved where.
    pub fn remap_table(&self) -> RemapTable {
        self.ctx.with_registry(|r| r.remap_table().clone())
    }

    fn run<F>(&mut self, phase: Phase, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if !phase.may_start_from(self.state) {
            return Err(ConnError::PhaseOrder {
                phase: phase.name(),
                state: format!("{:?}", self.state),
            });
        }
        log!(LogDebug, "{} in {:?}", phase.name(), self.state);
        match f(self) {
            Ok(()) => {
                self.state = phase.leaves();
                Ok(())
            }
            Err(e) if phase.is_restart() => Err(e),
            Err(e) => {
                log!(LogWarn, "{} failed, abandoning this checkpoint: {}", phase.name(), e);
                self.abandon_cycle();
                Err(e)
            }
        }
    }

    fn abandon_cycle(&mut self) {
        self.ctx.with_registry(|r| r.clear_cycle_state());
        if let Err(e) = self.exchange.clear(self.ctx.pid()) {
            log!(LogWarn, "Could not withdraw namespace records: {}", e);
        }
        self.resume_threads();
        self.state = OrchestratorState::Idle;
    }

    fn resume_threads(&mut self) {
        if self.threads_suspended {
            self.suspender.resume_all_threads();
            self.threads_suspended = false;
        }
    }

    pub fn save_options(&mut self) -> Result<()> {
        self.run(Phase::SaveOptions, |o| {
            let pid = o.ctx.pid();
            let shared = o.ctx.with_registry(|r| {
                let mut options = Vec::new();
                for fd in r.tracked_fds() {
                    match saved_options_of(fd) {
                        Ok(saved) => options.push((fd, saved)),
                        // Closed behind our back through a raw syscall.
                        Err(e) => log!(LogWarn, "Can't read options of fd {}: {}", fd, e),
                    }
                }
                r.set_saved_options(options);
                shared_keys(r)
            });
            for key in shared {
                o.exchange.register_participant(key, pid)?;
            }
            Ok(())
        })
    }

    pub fn leader_election(&mut self) -> Result<()> {
        self.run(Phase::LeaderElection, |o| {
            let pid = o.ctx.pid();
            let mut roles = BTreeMap::new();
            for key in o.ctx.with_registry(|r| shared_keys(r)) {
                let participants = o.exchange.participants(key)?;
                let role = match elect_leader(&participants) {
                    Some(leader) if leader != pid => Role::Follower { leader },
                    _ => Role::Leader,
                };
                log!(LogDebug, "{}: {:?} among {:?}", key, role, participants);
                roles.insert(key, role);
            }
            o.ctx.with_registry(|r| {
                r.for_each_mut(|c| {
                    if let Some(key) = c.shared_key {
                        c.role = roles.get(&key).copied();
                    }
                    Ok(())
                })
            })
        })
    }

    pub fn drain_fd(&mut self) -> Result<()> {
        self.run(Phase::DrainFd, |o| {
            o.suspender.suspend_all_threads();
            o.threads_suspended = true;
            o.ctx.with_registry(|r| {
                r.for_each_mut(|c| {
                    c.drained = (ops(c.kind()).drain)(c.primary_fd(), &c.params)?;
                    Ok(())
                })
            })
        })
    }

    pub fn ckpt(&mut self) -> Result<()> {
        self.run(Phase::Ckpt, |o| {
            let image = o.ctx.with_registry(|r| CheckpointImage::capture(r))?;
            o.store.write(&image)?;
            log!(LogInfo, "Checkpointed {} connections", image.records.len());
            if is_logging!(LogDebug) {
                for rec in &image.records {
                    log!(
                        LogDebug,
                        "  {} {:?} fd {} aliases {:?} role {:?}",
                        rec.id,
                        rec.kind,
                        rec.fd,
                        rec.aliases,
                        rec.role
                    );
                }
            }
            Ok(())
        })
    }

    pub fn resume_refill(&mut self) -> Result<()> {
        self.run(Phase::ResumeRefill, |o| {
            let stale = o.ctx.with_registry(|r| revalidate(r));
            if stale > 0 {
                log!(LogWarn, "Released {} stale descriptors on resume", stale);
            }
            Ok(())
        })
    }

    pub fn resume_resume(&mut self) -> Result<()> {
        self.run(Phase::ResumeResume, |o| {
            o.finish_cycle();
            Ok(())
        })
    }

    fn finish_cycle(&mut self) {
        self.ctx.with_registry(|r| r.clear_cycle_state());
        self.received.clear();
        if let Err(e) = self.exchange.clear(self.ctx.pid()) {
            log!(LogWarn, "Could not withdraw namespace records: {}", e);
        }
        self.resume_threads();
    }

    pub fn post_restart(&mut self) -> Result<()> {
        self.run(Phase::PostRestart, |o| {
            let image = o.store.read()?;
            let mut registry = o.ctx.with_registry(|r| r.clone());
            registry.replace_from_records(&image.records);
            o.ctx.replace_registry(registry);
            o.ctx.gate().reset();
            o.ctx.mark_initialized();
            // Threads were suspended when the snapshot was taken.
            o.threads_suspended = true;
            o.received.clear();
            log!(
                LogInfo,
                "Restarting {} connections checkpointed by {}",
                image.records.len(),
                image.pid
            );
            Ok(())
        })
    }

    pub fn restart_register_ns_data(&mut self) -> Result<()> {
        self.run(Phase::RestartRegisterNsData, |o| {
            let pid = o.ctx.pid();
            let to_publish: Vec<(ConnectionId, RecreationData)> = o.ctx.with_registry(|r| {
                r.connections()
                    .into_iter()
                    .filter(|c| c.is_leader())
                    .filter_map(|c| c.shared_key().map(|k| (k, c.recreation_data())))
                    .collect()
            });
            for (key, data) in to_publish {
                o.exchange.publish(key, pid, data)?;
            }
            Ok(())
        })
    }

    pub fn restart_send_queries(&mut self) -> Result<()> {
        self.run(Phase::RestartSendQueries, |o| {
            let wanted: Vec<(ConnectionId, Option<Role>)> = o.ctx.with_registry(|r| {
                r.connections()
                    .into_iter()
                    .filter(|c| !c.is_leader())
                    .filter_map(|c| c.shared_key().map(|k| (k, c.role())))
                    .collect()
            });
            for (key, role) in wanted {
                let record = o.exchange.query(key)?;
                if let Some(Role::Follower { leader }) = role {
                    if leader != record.owner {
                        log!(
                            LogWarn,
                            "{} was published by {}, expected {}",
                            key,
                            record.owner,
                            leader
                        );
                    }
                }
                o.received.insert(key, record);
            }
            Ok(())
        })
    }

    pub fn restart_refill(&mut self) -> Result<()> {
        self.run(Phase::RestartRefill, |o| {
            let conns: Vec<Connection> = o
                .ctx
                .with_registry(|r| r.connections().into_iter().cloned().collect());

            let mut table = RemapTable::new();
            let mut recreated = Vec::with_capacity(conns.len());
            for c in &conns {
                let data = o.recreation_data_for(c)?;
                let old = c.primary_fd();
                let created = (ops(c.kind()).create)(&data).map_err(|source| {
                    ConnError::RecreationFailed {
                        fd: old,
                        kind: c.kind(),
                        source,
                    }
                })?;
                let bound = o.remap.bind(created, old)?;
                table.insert(old, bound);
                for alias in c.fds().iter().filter(|fd| **fd != old) {
                    table.insert(*alias, o.remap.alias(bound, *alias)?);
                }
                log!(LogDebug, "{:?} {} recreated as fd {}", c.kind(), c.id(), bound);
                recreated.push((bound, data));
            }

            let saved = o.ctx.with_registry(|r| {
                r.rebind(table.clone());
                r.saved_options().to_vec()
            });
            for (fd, options) in saved {
                fcntl(fd, FcntlArg::F_SETFL(OFlag::from_bits_truncate(options.status_flags)))?;
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::from_bits_truncate(options.fd_flags)))?;
            }

            // Epoll last: its targets have to exist under their new numbers.
            let (epolls, others): (Vec<_>, Vec<_>) = conns
                .iter()
                .zip(recreated.iter())
                .partition(|(c, _)| c.kind() == ConnectionKind::Epoll);
            for (c, (fd, data)) in others.into_iter().chain(epolls) {
                (ops(c.kind()).restore)(*fd, &data.params, c.drained(), &table)?;
            }
            log!(LogInfo, "Recreated {} connections", conns.len());
            Ok(())
        })
    }

    /// A follower gets an object of its own built from the leader's data.
    /// After restart the processes no longer share it: an eventfd counter,
    /// for one, exists once per process from then on.
    fn recreation_data_for(&self, c: &Connection) -> Result<RecreationData> {
        if c.is_leader() {
            return Ok(c.recreation_data());
        }
        match c.shared_key().and_then(|k| self.received.get(&k)) {
            Some(record) => Ok(record.data.clone()),
            None => Err(ConnError::PeerUnavailable(
                c.shared_key().unwrap_or_else(|| c.id()),
                0,
            )),
        }
    }

    pub fn restart_resume(&mut self) -> Result<()> {
        self.run(Phase::RestartResume, |o| {
            o.finish_cycle();
            Ok(())
        })
    }
}

fn shared_keys(r: &ConnectionRegistry) -> Vec<ConnectionId> {
    r.connections()
        .into_iter()
        .filter_map(|c| c.shared_key())
        .collect()
}

fn saved_options_of(fd: RawFd) -> Result<SavedOptions> {
    Ok(SavedOptions {
        status_flags: fcntl(fd, FcntlArg::F_GETFL)?,
        fd_flags: fcntl(fd, FcntlArg::F_GETFD)?,
    })
}

/// Release every tracked descriptor that no longer refers to an object of
/// the kind we think it does. Returns how many were released.
pub(crate) fn revalidate(r: &mut ConnectionRegistry) -> usize {
    let stale: Vec<(RawFd, ConnectionKind)> = r
        .tracked_fds()
        .filter_map(|fd| {
            let kind = r.lookup(fd)?.kind();
            if anon_inode_kind(fd) == Some(kind) {
                None
            } else {
                Some((fd, kind))
            }
        })
        .collect();
    for (fd, kind) in &stale {
        log!(LogWarn, "fd {} is no longer a {:?}; releasing it", fd, kind);
        r.release(*fd);
    }
    stale.len()
}
