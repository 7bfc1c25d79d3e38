//! Human readable names for the kernel constants that show up in our logs.

pub fn signal_name(sig: i32) -> String {
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

/// Only the errnos the descriptor-creating and descriptor-mutating calls can
/// produce get a name. Everything else is printed numerically.
pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::EBADF => "EBADF".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::ENOTTY => "ENOTTY".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::EROFS => "EROFS".into(),
        libc::ELOOP => "ELOOP".into(),
        libc::ENAMETOOLONG => "ENAMETOOLONG".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::EOVERFLOW => "EOVERFLOW".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        libc::ENOTSUP => "ENOTSUP".into(),
        _ => format!("errno({})", err),
    }
}

/// The syscall numbers `process_fd_event()` is fed with.
pub fn fd_event_name(event: libc::c_long) -> String {
    match event {
        libc::SYS_close => "SYS_close".into(),
        libc::SYS_dup => "SYS_dup".into(),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_dup2 => "SYS_dup2".into(),
        libc::SYS_dup3 => "SYS_dup3".into(),
        _ => format!("syscall({})", event),
    }
}

pub fn epoll_op_name(op: i32) -> String {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD".into(),
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD".into(),
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL".into(),
        _ => format!("EPOLL_CTL({})", op),
    }
}
