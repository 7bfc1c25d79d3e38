use crate::real;
use std::os::unix::io::RawFd;

/// Owns a descriptor the agent created for itself (a recreated connection that
/// has not been bound to the application's descriptor number yet). Closed on
/// drop through the real close(2) so the registry never sees it.
// We DON'T want this to be Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            unsafe { real::close(self.fd) };
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
