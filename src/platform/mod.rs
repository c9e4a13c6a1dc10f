//! Platform-specific process signalling

#[cfg(unix)]
pub mod unix;

use std::fmt;
use std::io;
use std::str::FromStr;

/// Signals the supervisor knows how to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Signal {
    #[default]
    Term,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Hup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Kill => "SIGKILL",
        }
    }

    /// Signal number as numbered on Linux
    pub fn number(&self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Quit => 3,
            Self::Kill => 9,
            Self::Usr1 => 10,
            Self::Usr2 => 12,
            Self::Term => 15,
        }
    }

    fn all() -> &'static [Signal] {
        &[
            Signal::Term,
            Signal::Int,
            Signal::Hup,
            Signal::Quit,
            Signal::Usr1,
            Signal::Usr2,
            Signal::Kill,
        ]
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts `SIGTERM`, `TERM`, `term` or `15`.
impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(number) = trimmed.parse::<i32>() {
            return Self::all()
                .iter()
                .copied()
                .find(|sig| sig.number() == number)
                .ok_or_else(|| trimmed.to_string());
        }

        let upper = trimmed.to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        Self::all()
            .iter()
            .copied()
            .find(|sig| &sig.name()[3..] == bare)
            .ok_or_else(|| trimmed.to_string())
    }
}

/// Send a signal to a process
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::send_signal(pid, signal)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Err(io::Error::new(io::ErrorKind::Unsupported, "Unsupported platform"))
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// True when a signalling error means the process is already gone
pub fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        unix::is_no_such_process(err)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
