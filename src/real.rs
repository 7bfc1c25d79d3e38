//! The real libc entry points.
//!
//! With the `preload` feature this crate exports `open`, `eventfd`, `close`,
//! ... itself, so calling `libc::eventfd` (or anything in nix that does) from
//! inside the agent would come straight back into our own wrapper. Code in
//! this crate that needs the un-intercepted behaviour must go through here.

use libc::{c_char, c_int, c_uint, mode_t, sigset_t, FILE};
#[cfg(feature = "preload")]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "preload")]
fn next_symbol(cache: &AtomicUsize, name: &'static str) -> usize {
    let mut addr = cache.load(Ordering::Acquire);
    if addr == 0 {
        addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) } as usize;
        if addr == 0 {
            fatal!("dlsym(RTLD_NEXT, {}) found nothing", name.trim_end_matches('\0'));
        }
        cache.store(addr, Ordering::Release);
    }
    addr
}

macro_rules! real_entry_point {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        pub unsafe fn $name($($arg: $ty),*) -> $ret {
            #[cfg(feature = "preload")]
            {
                static ADDR: AtomicUsize = AtomicUsize::new(0);
                let f: unsafe extern "C" fn($($ty),*) -> $ret =
                    std::mem::transmute(next_symbol(&ADDR, concat!(stringify!($name), "\0")));
                f($($arg),*)
            }
            #[cfg(not(feature = "preload"))]
            {
                libc::$name($($arg),*)
            }
        }
    };
}

real_entry_point!(eventfd(initval: c_uint, flags: c_int) -> c_int);
real_entry_point!(signalfd(fd: c_int, mask: *const sigset_t, flags: c_int) -> c_int);
real_entry_point!(epoll_create(size: c_int) -> c_int);
real_entry_point!(epoll_create1(flags: c_int) -> c_int);
real_entry_point!(epoll_ctl(epfd: c_int, op: c_int, fd: c_int, event: *mut libc::epoll_event) -> c_int);
real_entry_point!(inotify_init() -> c_int);
real_entry_point!(inotify_init1(flags: c_int) -> c_int);
real_entry_point!(inotify_add_watch(fd: c_int, path: *const c_char, mask: u32) -> c_int);
real_entry_point!(inotify_rm_watch(fd: c_int, wd: c_int) -> c_int);
real_entry_point!(close(fd: c_int) -> c_int);
real_entry_point!(dup(fd: c_int) -> c_int);
real_entry_point!(dup2(oldfd: c_int, newfd: c_int) -> c_int);
real_entry_point!(dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int);
real_entry_point!(fopen(path: *const c_char, mode: *const c_char) -> *mut FILE);
real_entry_point!(freopen(path: *const c_char, mode: *const c_char, stream: *mut FILE) -> *mut FILE);

/// open(2) and openat(2) are variadic in libc, so they get spelled out.
pub unsafe fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    #[cfg(feature = "preload")]
    {
        static ADDR: AtomicUsize = AtomicUsize::new(0);
        let f: unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int =
            std::mem::transmute(next_symbol(&ADDR, "open\0"));
        f(path, flags, mode as c_uint)
    }
    #[cfg(not(feature = "preload"))]
    {
        libc::open(path, flags, mode as c_uint)
    }
}

pub unsafe fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    #[cfg(feature = "preload")]
    {
        static ADDR: AtomicUsize = AtomicUsize::new(0);
        let f: unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int =
            std::mem::transmute(next_symbol(&ADDR, "openat\0"));
        f(dirfd, path, flags, mode as c_uint)
    }
    #[cfg(not(feature = "preload"))]
    {
        libc::openat(dirfd, path, flags, mode as c_uint)
    }
}
