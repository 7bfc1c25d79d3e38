//! The symbols an LD_PRELOADed agent exports in place of libc's.
//!
//! Calls made while this thread is already inside the agent go straight to
//! libc.

use crate::{
    interceptor,
    plugin::{self, Event},
    process_context::{in_agent, ProcessContext},
    real,
};
use libc::{c_char, c_int, c_long, c_uint, mode_t, sigset_t, FILE};

fn ctx() -> &'static ProcessContext {
    ProcessContext::global()
}

extern "C" fn atfork_prepare() {
    (plugin::event_plugin_descriptor().event_hook)(Event::AtforkPrepare);
}

extern "C" fn atfork_parent() {
    (plugin::event_plugin_descriptor().event_hook)(Event::AtforkParent);
}

extern "C" fn atfork_child() {
    (plugin::event_plugin_descriptor().event_hook)(Event::AtforkChild);
    (crate::thread_plugin::thread_plugin_descriptor().event_hook)(Event::AtforkChild);
}

extern "C" fn agent_init() {
    let ret = unsafe { libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child)) };
    if ret != 0 {
        fatal!("pthread_atfork failed: {}", ret);
    }
    (plugin::event_plugin_descriptor().event_hook)(Event::Init);
}

#[used]
#[link_section = ".init_array"]
static AGENT_INIT: extern "C" fn() = agent_init;

// open(2) and friends are variadic; `mode` is only read when the flags ask
// for it, as libc itself does.

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    if in_agent() {
        return real::open(path, flags, mode);
    }
    interceptor::open(ctx(), path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open(path, flags | libc::O_LARGEFILE, mode)
}

/// The fortified variants never take a mode.
#[no_mangle]
pub unsafe extern "C" fn __open_2(path: *const c_char, flags: c_int) -> c_int {
    open(path, flags, 0)
}

#[no_mangle]
pub unsafe extern "C" fn __open64_2(path: *const c_char, flags: c_int) -> c_int {
    open64(path, flags, 0)
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    if in_agent() {
        return real::openat(dirfd, path, flags, mode);
    }
    interceptor::openat(ctx(), dirfd, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    openat(dirfd, path, flags | libc::O_LARGEFILE, mode)
}

#[no_mangle]
pub unsafe extern "C" fn __openat_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    openat(dirfd, path, flags, 0)
}

#[no_mangle]
pub unsafe extern "C" fn __openat64_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    openat64(dirfd, path, flags, 0)
}

#[no_mangle]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    open(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
}

#[no_mangle]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    open64(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    if in_agent() {
        return real::fopen(path, mode);
    }
    interceptor::fopen(ctx(), path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    fopen(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn freopen(path: *const c_char, mode: *const c_char, stream: *mut FILE) -> *mut FILE {
    if in_agent() {
        return real::freopen(path, mode, stream);
    }
    interceptor::freopen(ctx(), path, mode, stream)
}

#[no_mangle]
pub unsafe extern "C" fn freopen64(path: *const c_char, mode: *const c_char, stream: *mut FILE) -> *mut FILE {
    freopen(path, mode, stream)
}

#[no_mangle]
pub unsafe extern "C" fn eventfd(initval: c_uint, flags: c_int) -> c_int {
    if in_agent() {
        return real::eventfd(initval, flags);
    }
    interceptor::eventfd(ctx(), initval, flags)
}

#[no_mangle]
pub unsafe extern "C" fn signalfd(fd: c_int, mask: *const sigset_t, flags: c_int) -> c_int {
    if in_agent() {
        return real::signalfd(fd, mask, flags);
    }
    interceptor::signalfd(ctx(), fd, mask, flags)
}

#[no_mangle]
pub unsafe extern "C" fn epoll_create(size: c_int) -> c_int {
    if in_agent() {
        return real::epoll_create(size);
    }
    interceptor::epoll_create(ctx(), size)
}

#[no_mangle]
pub unsafe extern "C" fn epoll_create1(flags: c_int) -> c_int {
    if in_agent() {
        return real::epoll_create1(flags);
    }
    interceptor::epoll_create1(ctx(), flags)
}

#[no_mangle]
pub unsafe extern "C" fn epoll_ctl(epfd: c_int, op: c_int, fd: c_int, event: *mut libc::epoll_event) -> c_int {
    if in_agent() {
        return real::epoll_ctl(epfd, op, fd, event);
    }
    interceptor::epoll_ctl(ctx(), epfd, op, fd, event)
}

#[no_mangle]
pub unsafe extern "C" fn inotify_init() -> c_int {
    if in_agent() {
        return real::inotify_init();
    }
    interceptor::inotify_init(ctx())
}

#[no_mangle]
pub unsafe extern "C" fn inotify_init1(flags: c_int) -> c_int {
    if in_agent() {
        return real::inotify_init1(flags);
    }
    interceptor::inotify_init1(ctx(), flags)
}

#[no_mangle]
pub unsafe extern "C" fn inotify_add_watch(fd: c_int, path: *const c_char, mask: u32) -> c_int {
    if in_agent() {
        return real::inotify_add_watch(fd, path, mask);
    }
    interceptor::inotify_add_watch(ctx(), fd, path, mask)
}

#[no_mangle]
pub unsafe extern "C" fn inotify_rm_watch(fd: c_int, wd: c_int) -> c_int {
    if in_agent() {
        return real::inotify_rm_watch(fd, wd);
    }
    interceptor::inotify_rm_watch(ctx(), fd, wd)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if in_agent() {
        return real::close(fd);
    }
    interceptor::close(ctx(), fd)
}

#[no_mangle]
pub unsafe extern "C" fn dup(oldfd: c_int) -> c_int {
    if in_agent() {
        return real::dup(oldfd);
    }
    interceptor::dup(ctx(), oldfd)
}

#[no_mangle]
pub unsafe extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    if in_agent() {
        return real::dup2(oldfd, newfd);
    }
    interceptor::dup2(ctx(), oldfd, newfd)
}

#[no_mangle]
pub unsafe extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    if in_agent() {
        return real::dup3(oldfd, newfd, flags);
    }
    interceptor::dup3(ctx(), oldfd, newfd, flags)
}

/// Called by the generic syscall() wrapper after a raw close or dup.
#[no_mangle]
pub extern "C" fn ckpt_process_fd_event(event: c_long, a: c_int, b: c_int) {
    if in_agent() {
        return;
    }
    plugin::process_fd_event(event, a, b)
}
