//! The wrapped libc calls, independent of how they get called. `preload`
//! exports them under their libc names; tests call them directly.
//!
//! Every wrapper runs the real call with checkpointing disabled and, if it
//! succeeded, updates the registry before enabling it again. The registry
//! lock is held from before the real call until after the update, so no other
//! thread can close and reuse the descriptor number in between. A checkpoint
//! can therefore never see a descriptor table the registry disagrees with.
//! Return values and errno are those of the real call.

use crate::{
    connection::{CreationParams, EpollParams, EventFdParams, InotifyParams, SignalFdParams},
    kernel_metadata::fd_event_name,
    log::LogLevel::LogDebug,
    process_context::ProcessContext,
    real,
    registry::ConnectionRegistry,
    sig::SigMask,
};
use libc::{c_char, c_int, c_long, c_uint, mode_t, sigset_t, FILE};
use std::{ffi::CStr, os::unix::io::RawFd};

fn set_errno(errno: c_int) {
    unsafe { *libc::__errno_location() = errno };
}

/// The gate is closed before the lock is taken: a suspending thread waits on
/// the gate and never on the lock.
fn bracket<T, C, A>(ctx: &ProcessContext, call: C, after: A) -> T
where
    C: FnOnce() -> T,
    A: FnOnce(&T, &mut ConnectionRegistry),
{
    ctx.ensure_initialized();
    let (ret, errno) = {
        let _disabled = ctx.gate().disable();
        ctx.with_registry(|r| {
            let ret = call();
            let errno = nix::errno::errno();
            after(&ret, r);
            (ret, errno)
        })
    };
    // Registry updates and a deferred suspension may both touch errno.
    set_errno(errno);
    ret
}

/// For calls that create nothing we track.
fn gate_only<T, C: FnOnce() -> T>(ctx: &ProcessContext, call: C) -> T {
    ctx.ensure_initialized();
    let (ret, errno) = {
        let _disabled = ctx.gate().disable();
        let ret = call();
        (ret, nix::errno::errno())
    };
    set_errno(errno);
    ret
}

fn track(r: &mut ConnectionRegistry, fd: RawFd, params: CreationParams) {
    if let Err(e) = r.track(fd, params) {
        fatal!("Tracking new fd {}: {}", fd, e);
    }
}

pub fn eventfd(ctx: &ProcessContext, initval: c_uint, flags: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::eventfd(initval, flags) },
        |fd, r| {
            if *fd >= 0 {
                track(r, *fd, CreationParams::EventFd(EventFdParams { initval, flags }));
            }
        },
    )
}

/// # Safety
///
/// `mask` must point to a valid sigset_t.
pub unsafe fn signalfd(ctx: &ProcessContext, fd: c_int, mask: *const sigset_t, flags: c_int) -> c_int {
    let sigmask = SigMask::from_raw_sigset(mask);
    bracket(
        ctx,
        || real::signalfd(fd, mask, flags),
        |ret, r| {
            if *ret < 0 {
                return;
            }
            let params = SignalFdParams {
                mask: sigmask,
                flags,
            };
            // signalfd(existing, ...) changes the mask of `existing`.
            if fd == -1 || !r.update_signalfd_mask(*ret, sigmask, flags) {
                track(r, *ret, CreationParams::SignalFd(params));
            }
        },
    )
}

fn epoll_params(flags: c_int, size: Option<c_int>) -> CreationParams {
    CreationParams::Epoll(EpollParams {
        flags,
        size,
        interest: Vec::new(),
    })
}

pub fn epoll_create(ctx: &ProcessContext, size: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::epoll_create(size) },
        |fd, r| {
            if *fd >= 0 {
                track(r, *fd, epoll_params(0, Some(size)));
            }
        },
    )
}

pub fn epoll_create1(ctx: &ProcessContext, flags: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::epoll_create1(flags) },
        |fd, r| {
            if *fd >= 0 {
                track(r, *fd, epoll_params(flags, None));
            }
        },
    )
}

/// # Safety
///
/// `event` must be null or point to a valid epoll_event.
pub unsafe fn epoll_ctl(
    ctx: &ProcessContext,
    epfd: c_int,
    op: c_int,
    fd: c_int,
    event: *mut libc::epoll_event,
) -> c_int {
    let ev = if event.is_null() {
        None
    } else {
        let e = *event;
        Some((e.events, e.u64))
    };
    bracket(
        ctx,
        || real::epoll_ctl(epfd, op, fd, event),
        |ret, r| {
            if *ret == 0 {
                r.update_epoll_interest(epfd, op, fd, ev);
            }
        },
    )
}

pub fn inotify_init(ctx: &ProcessContext) -> c_int {
    inotify_init_common(ctx, || unsafe { real::inotify_init() }, 0)
}

pub fn inotify_init1(ctx: &ProcessContext, flags: c_int) -> c_int {
    inotify_init_common(ctx, || unsafe { real::inotify_init1(flags) }, flags)
}

fn inotify_init_common<C: FnOnce() -> c_int>(ctx: &ProcessContext, call: C, flags: c_int) -> c_int {
    bracket(ctx, call, |fd, r| {
        if *fd >= 0 {
            track(
                r,
                *fd,
                CreationParams::Inotify(InotifyParams {
                    flags,
                    watches: Vec::new(),
                }),
            );
        }
    })
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn inotify_add_watch(ctx: &ProcessContext, fd: c_int, path: *const c_char, mask: u32) -> c_int {
    bracket(
        ctx,
        || real::inotify_add_watch(fd, path, mask),
        |wd, r| {
            if *wd >= 0 {
                let bytes = CStr::from_ptr(path).to_bytes();
                r.add_inotify_watch(fd, *wd, bytes, mask);
            }
        },
    )
}

pub fn inotify_rm_watch(ctx: &ProcessContext, fd: c_int, wd: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::inotify_rm_watch(fd, wd) },
        |ret, r| {
            if *ret == 0 {
                r.remove_inotify_watch(fd, wd);
            }
        },
    )
}

pub fn close(ctx: &ProcessContext, fd: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::close(fd) },
        |ret, r| {
            if *ret == 0 {
                apply_fd_event(r, libc::SYS_close, fd, -1);
            }
        },
    )
}

pub fn dup(ctx: &ProcessContext, oldfd: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::dup(oldfd) },
        |newfd, r| {
            if *newfd >= 0 {
                apply_fd_event(r, libc::SYS_dup, oldfd, *newfd);
            }
        },
    )
}

/// dup2(fd, fd) is a no-op; otherwise a tracked `newfd` was closed by the
/// kernel, which `alias` accounts for.
fn dup_onto(r: &mut ConnectionRegistry, oldfd: c_int, newfd: c_int) {
    if oldfd != newfd {
        apply_fd_event(r, libc::SYS_dup, oldfd, newfd);
    }
}

pub fn dup2(ctx: &ProcessContext, oldfd: c_int, newfd: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::dup2(oldfd, newfd) },
        |ret, r| {
            if *ret >= 0 {
                dup_onto(r, oldfd, *ret);
            }
        },
    )
}

pub fn dup3(ctx: &ProcessContext, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    bracket(
        ctx,
        || unsafe { real::dup3(oldfd, newfd, flags) },
        |ret, r| {
            if *ret >= 0 {
                dup_onto(r, oldfd, *ret);
            }
        },
    )
}

/// Keeps the registry in step with the descriptor table after a successful
/// close (`a` closed) or dup (`b` now aliases `a`).
pub fn process_fd_event(ctx: &ProcessContext, event: c_long, a: c_int, b: c_int) {
    ctx.with_registry(|r| apply_fd_event(r, event, a, b))
}

fn apply_fd_event(r: &mut ConnectionRegistry, event: c_long, a: c_int, b: c_int) {
    log!(LogDebug, "{}({}, {})", fd_event_name(event), a, b);
    match event {
        libc::SYS_close => {
            r.release(a);
        }
        libc::SYS_dup => {
            r.alias(a, b);
        }
        _ => fatal!("Unexpected fd event {}", fd_event_name(event)),
    }
}

// The open family creates nothing we track; it only must not overlap a
// checkpoint.

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn open(ctx: &ProcessContext, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    gate_only(ctx, || real::open(path, flags, mode))
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn open64(ctx: &ProcessContext, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open(ctx, path, flags | libc::O_LARGEFILE, mode)
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn creat(ctx: &ProcessContext, path: *const c_char, mode: mode_t) -> c_int {
    open(ctx, path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn creat64(ctx: &ProcessContext, path: *const c_char, mode: mode_t) -> c_int {
    open64(ctx, path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn openat(
    ctx: &ProcessContext,
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    gate_only(ctx, || real::openat(dirfd, path, flags, mode))
}

/// # Safety
///
/// `path` must be a valid C string.
pub unsafe fn openat64(
    ctx: &ProcessContext,
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    openat(ctx, dirfd, path, flags | libc::O_LARGEFILE, mode)
}

/// # Safety
///
/// `path` and `mode` must be valid C strings.
pub unsafe fn fopen(ctx: &ProcessContext, path: *const c_char, mode: *const c_char) -> *mut FILE {
    gate_only(ctx, || real::fopen(path, mode))
}

/// # Safety
///
/// `path` and `mode` must be valid C strings, `stream` a valid FILE.
pub unsafe fn freopen(
    ctx: &ProcessContext,
    path: *const c_char,
    mode: *const c_char,
    stream: *mut FILE,
) -> *mut FILE {
    gate_only(ctx, || real::freopen(path, mode, stream))
}
