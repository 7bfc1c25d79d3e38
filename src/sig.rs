use crate::kernel_metadata::signal_name;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    mem::MaybeUninit,
};

pub const SIGUSR1: Sig = Sig(libc::SIGUSR1);
pub const SIGUSR2: Sig = Sig(libc::SIGUSR2);
pub const SIGTERM: Sig = Sig(libc::SIGTERM);
pub const SIGCHLD: Sig = Sig(libc::SIGCHLD);
pub const SIGIO: Sig = Sig(libc::SIGIO);

/// Highest signal number the kernel's 64 bit sigmask can describe.
const MAX_SIG: i32 = 64;

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sig(i32);

impl Sig {
    pub fn as_str(&self) -> String {
        signal_name(self.0)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for Sig {
    type Error = io::Error;

    fn try_from(sig: i32) -> Result<Self, Self::Error> {
        if sig > 0 && sig <= MAX_SIG {
            Ok(Sig(sig))
        } else {
            Err(io::Error::new(
                ErrorKind::Other,
                format!("Invalid signal `{}`", sig),
            ))
        }
    }
}

impl Display for Sig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signal set in the kernel's layout: bit `n - 1` is set for signal `n`.
/// This is also how `/proc/<pid>/fdinfo/<fd>` prints a signalfd's `sigmask:`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SigMask(pub u64);

impl SigMask {
    pub fn empty() -> SigMask {
        SigMask(0)
    }

    pub fn add(&mut self, sig: Sig) {
        self.0 |= 1u64 << (sig.as_raw() - 1);
    }

    pub fn contains(&self, sig: Sig) -> bool {
        self.0 & (1u64 << (sig.as_raw() - 1)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersect(&self, other: SigMask) -> SigMask {
        SigMask(self.0 & other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Sig> + '_ {
        (1..=MAX_SIG).map(Sig).filter(move |s| self.contains(*s))
    }

    /// # Safety
    ///
    /// `set` must point to a valid, initialized sigset_t.
    pub unsafe fn from_raw_sigset(set: *const libc::sigset_t) -> SigMask {
        let mut mask = SigMask::empty();
        for sig in 1..=MAX_SIG {
            if libc::sigismember(set, sig) == 1 {
                mask.add(Sig(sig));
            }
        }
        mask
    }

    pub fn to_raw_sigset(&self) -> libc::sigset_t {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            for sig in self.iter() {
                libc::sigaddset(set.as_mut_ptr(), sig.as_raw());
            }
            set.assume_init()
        }
    }

    /// Signals pending for the calling thread or the whole process.
    pub fn pending() -> io::Result<SigMask> {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        let ret = unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            libc::sigpending(set.as_mut_ptr())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { SigMask::from_raw_sigset(set.as_ptr()) })
    }
}

impl Display for SigMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|s| s.as_str()).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}
