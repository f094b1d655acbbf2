//! Detaching from the invoking terminal.
//!
//! Must run before any thread is started: after `fork` only the calling
//! thread survives in the child.

use std::{env, io};

use crate::error::{Error, Result};

/// Turns the current process into a daemon.
///
/// Forks twice so the daemon is neither a session leader nor able to
/// reacquire a controlling terminal, ignores `SIGCHLD` and `SIGHUP`, clears
/// the umask, moves to `/`, closes every inherited descriptor and points
/// stdin, stdout and stderr at `/dev/null`. Only the final grandchild
/// returns from this function.
pub fn daemonize() -> Result<()> {
    fork_and_exit_parent()?;

    if unsafe { libc::setsid() } < 0 {
        return Err(Error::Daemon(io::Error::last_os_error()));
    }

    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    fork_and_exit_parent()?;

    unsafe { libc::umask(0) };
    env::set_current_dir("/").map_err(Error::Daemon)?;

    close_inherited_fds();
    redirect_stdio()
}

fn fork_and_exit_parent() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(Error::Daemon(io::Error::last_os_error())),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

fn close_inherited_fds() {
    let first = (libc::STDERR_FILENO + 1) as libc::c_uint;

    // One call on kernels that have close_range (5.9+).
    if unsafe { libc::syscall(libc::SYS_close_range, first, libc::c_uint::MAX, 0) } == 0 {
        return;
    }

    let max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(libc::c_int::MAX as libc::c_long) as libc::c_int,
        _ => 1024,
    };

    for fd in (libc::STDERR_FILENO + 1)..max {
        unsafe { libc::close(fd) };
    }
}

fn redirect_stdio() -> Result<()> {
    const DEV_NULL: &[u8] = b"/dev/null\0";

    let null = unsafe {
        libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDWR)
    };
    if null < 0 {
        return Err(Error::Daemon(io::Error::last_os_error()));
    }

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(null, fd) } < 0 {
            return Err(Error::Daemon(io::Error::last_os_error()));
        }
    }

    if null > libc::STDERR_FILENO {
        unsafe { libc::close(null) };
    }
    Ok(())
}
