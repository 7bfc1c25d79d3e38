//! Binding recreated kernel objects to the descriptor numbers the application
//! knows them by.

use crate::{
    error::Result,
    log::LogLevel::{LogDebug, LogWarn},
    real,
};
use nix::errno::Errno;
use std::{collections::BTreeMap, os::unix::io::RawFd};

/// Descriptor number at checkpoint time -> descriptor number now.
pub type RemapTable = BTreeMap<RawFd, RawFd>;

pub trait DescriptorRemap: Send + Sync {
    /// `created` is a fresh descriptor for the object that was known as `old`.
    /// Consumes `created` and returns the descriptor that now refers to it.
    fn bind(&self, created: RawFd, old: RawFd) -> Result<RawFd>;

    /// Make the further alias `old` refer to the same object as `bound`.
    fn alias(&self, bound: RawFd, old: RawFd) -> Result<RawFd>;
}

/// Puts the recreated object back under its old number.
#[derive(Copy, Clone, Debug, Default)]
pub struct InPlaceRemap;

impl DescriptorRemap for InPlaceRemap {
    fn bind(&self, created: RawFd, old: RawFd) -> Result<RawFd> {
        if created == old {
            return Ok(old);
        }
        Errno::result(unsafe { real::dup2(created, old) })?;
        if unsafe { real::close(created) } < 0 {
            log!(LogWarn, "Closing temporary fd {} failed: {}", created, Errno::last());
        }
        log!(LogDebug, "Bound recreated fd {} onto {}", created, old);
        Ok(old)
    }

    fn alias(&self, bound: RawFd, old: RawFd) -> Result<RawFd> {
        if bound != old {
            Errno::result(unsafe { real::dup2(bound, old) })?;
        }
        Ok(old)
    }
}

/// Leaves recreated objects wherever the kernel put them. Used when the old
/// numbers are not ours to take, e.g. several restarts simulated in one
/// process.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityRemap;

impl DescriptorRemap for IdentityRemap {
    fn bind(&self, created: RawFd, _old: RawFd) -> Result<RawFd> {
        Ok(created)
    }

    fn alias(&self, bound: RawFd, _old: RawFd) -> Result<RawFd> {
        Ok(Errno::result(unsafe { real::dup(bound) })?)
    }
}
