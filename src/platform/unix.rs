//! Unix process signalling via libc

use std::io;

use super::Signal;

fn raw_signal(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Int => libc::SIGINT,
        Signal::Hup => libc::SIGHUP,
        Signal::Quit => libc::SIGQUIT,
        Signal::Usr1 => libc::SIGUSR1,
        Signal::Usr2 => libc::SIGUSR2,
        Signal::Kill => libc::SIGKILL,
    }
}

/// Pid 0 and values beyond `pid_t` would address process groups.
fn target(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Send `signal` to a single process
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let Some(target) = target(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    };

    unsafe {
        let result = libc::kill(target, raw_signal(signal));
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    let Some(target) = target(pid) else {
        return false;
    };

    unsafe {
        // kill with signal 0 checks if process exists without sending a signal
        if libc::kill(target, 0) == 0 {
            return true;
        }
    }
    // EPERM: the process exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// True when the error means the target no longer exists
pub fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}
