use crate::connection::{ConnectionId, ConnectionKind};
use std::{io, os::unix::io::RawFd};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnError {
    #[error("descriptor {fd} is already tracked as {existing:?}")]
    DuplicateDescriptor { fd: RawFd, existing: ConnectionKind },

    /// Expected for most descriptors; callers that can see one ignore it.
    #[error("descriptor {0} is not tracked")]
    UntrackedDescriptor(RawFd),

    #[error("{kind:?} connection on fd {fd} cannot be reconstructed: {reason}")]
    UnreconstructableConnection {
        fd: RawFd,
        kind: ConnectionKind,
        reason: String,
    },

    #[error("no peer published recreation data for shared connection {0} (gave up after {1} attempts)")]
    PeerUnavailable(ConnectionId, u32),

    #[error("recreating {kind:?} connection for fd {fd} failed: {source}")]
    RecreationFailed {
        fd: RawFd,
        kind: ConnectionKind,
        #[source]
        source: nix::Error,
    },

    #[error("barrier `{phase}' invoked while in state {state}")]
    PhaseOrder { phase: &'static str, state: String },

    #[error("checkpoint image: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConnError>;
