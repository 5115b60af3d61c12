use std::io;
use std::os::fd::RawFd;

use anyhow::Result;
use nix::libc;
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};

/// RAII guard that saves terminal settings and restores them on drop.
///
/// Also remembers the original file status flags of stdin if
/// [`TerminalGuard::set_stdin_nonblocking`] changed them, since those flags
/// are shared with the parent shell.
pub struct TerminalGuard {
    original: Option<Termios>,
    stdin_flags: Option<libc::c_int>,
}

impl Default for TerminalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalGuard {
    pub fn new() -> Self {
        let stdin = io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        Self {
            original,
            stdin_flags: None,
        }
    }

    /// Whether stdin is a terminal whose settings were captured.
    pub fn is_terminal(&self) -> bool {
        self.original.is_some()
    }

    /// No echo, no line discipline, no signal keys: every byte goes to the PTY.
    pub fn enter_raw_mode(&self) {
        if let Some(ref original) = self.original {
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, &raw);
        }
    }

    /// Only disable echo and canonical input, keeping signal keys working.
    pub fn enter_minimal_mode(&self) {
        if let Some(ref original) = self.original {
            let mut minimal = original.clone();
            minimal
                .local_flags
                .remove(LocalFlags::ECHO | LocalFlags::ICANON);
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, &minimal);
        }
    }

    /// Line editing stays on, typed characters are not shown.
    pub fn disable_echo(&self) {
        if let Some(ref original) = self.original {
            let mut quiet = original.clone();
            quiet.local_flags.remove(LocalFlags::ECHO);
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, &quiet);
        }
    }

    pub fn set_stdin_nonblocking(&mut self) -> io::Result<()> {
        let previous = set_nonblocking(libc::STDIN_FILENO)?;
        self.stdin_flags.get_or_insert(previous);
        Ok(())
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(flags) = self.stdin_flags.take() {
            unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags) };
        }
        if let Some(ref original) = self.original {
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, original);
        }
    }
}

/// Put `fd` in non-blocking mode, returning its previous status flags.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

/// Get the current terminal size (rows, cols).
pub fn get_terminal_size() -> Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 {
        anyhow::bail!("ioctl TIOCGWINSZ failed");
    }
    if ws.ws_row == 0 || ws.ws_col == 0 {
        anyhow::bail!("terminal reported an empty size");
    }
    Ok((ws.ws_row, ws.ws_col))
}
