//! Local transport: a shell on a PTY with frames tunneled through its output.
//!
//! The user keeps an ordinary interactive shell. Keystrokes go to the PTY
//! unchanged, PTY output goes back to the real terminal with server frames
//! stripped out and pushed to the [`Inbox`].

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use nix::libc;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::codec::{Direction, Scanner};
use crate::config::LocalConfig;
use crate::error::LinkError;
use crate::inbox::Inbox;
use crate::io::{is_transient, poll_fds, read_fd, write_all_retrying, write_available};
use crate::signals;
use crate::task::{ReaderTask, StopFlag};
use crate::terminal::{self, TerminalGuard};
use crate::transport::{Transport, client_frame};

const BANNER: &[u8] =
    b"OSCLink activated. Run the server application locally or remotely in this terminal.\r\n";
const CLOSED: &[u8] = b"OSCLink closed.\n";

type SharedWriter = Arc<Mutex<Outbound>>;
type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// PTY passthrough transport.
pub struct LocalLink {
    config: LocalConfig,
    inbox: Arc<Inbox>,
    session: Option<Session>,
}

/// Bytes bound for the PTY. Keystrokes and frames share one queue so typed
/// input never lands inside a frame.
struct Outbound {
    writer: Box<dyn Write + Send>,
    pending: Vec<u8>,
}

impl Outbound {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            pending: Vec::new(),
        }
    }

    /// Queue `data` and write whatever the PTY accepts right now.
    fn push(&mut self, data: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(data);
        self.flush_available()
    }

    fn flush_available(&mut self) -> io::Result<()> {
        let result = write_available(&mut self.writer, &mut self.pending);
        if result.is_err() {
            self.pending.clear();
        }
        result
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

struct Session {
    reader: ReaderTask,
    writer: SharedWriter,
    master: SharedMaster,
    child: Box<dyn Child + Send + Sync>,
    guard: Option<TerminalGuard>,
}

impl LocalLink {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            inbox: Arc::new(Inbox::new()),
            session: None,
        }
    }

    /// The queue decoded server payloads are pushed to.
    pub fn inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }

    /// Shell resolution order: configured, `$SHELL`, login shell, `/bin/sh`.
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = self.config.shell.as_ref().filter(|s| !s.is_empty()) {
            return shell.clone();
        }
        if let Ok(shell) = std::env::var("SHELL")
            && !shell.is_empty()
        {
            return shell;
        }
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.shell.to_string_lossy().into_owned())
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    fn spawn_session(&self) -> Result<Session, LinkError> {
        signals::install()?;

        let interactive = self.config.interactive;
        // Created before anything can fail so an early return restores the terminal.
        let guard = if interactive {
            let mut guard = TerminalGuard::new();
            guard.enter_raw_mode();
            guard.set_stdin_nonblocking()?;
            Some(guard)
        } else {
            None
        };

        let (rows, cols) = if interactive {
            terminal::get_terminal_size().unwrap_or((self.config.rows, self.config.cols))
        } else {
            (self.config.rows, self.config.cols)
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let shell = self.resolve_shell();
        let mut cmd = CommandBuilder::new(&shell);
        for arg in &self.config.args {
            cmd.arg(arg);
        }
        if let Ok(dir) = std::env::current_dir() {
            cmd.cwd(dir);
        }
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        info!(shell = %shell, args = ?self.config.args, rows, cols, "spawning shell");
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {shell}"))?;
        info!(pid = ?child.process_id(), "shell started");
        // Only the child holds the replica side from here on.
        drop(pair.slave);

        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| LinkError::CreateFailed("PTY has no master descriptor".into()))?;
        terminal::set_nonblocking(master_fd)?;

        let pty_reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer: SharedWriter = Arc::new(Mutex::new(Outbound::new(
            pair.master
                .take_writer()
                .context("Failed to take PTY writer")?,
        )));
        let master: SharedMaster = Arc::new(Mutex::new(pair.master));

        if interactive {
            write_all_retrying(&mut io::stdout().lock(), BANNER)?;
        }

        let pump = Pump {
            pty_reader,
            master_fd,
            master: master.clone(),
            writer: writer.clone(),
            scanner: Scanner::new(Direction::ServerToClient),
            inbox: self.inbox.clone(),
            interactive,
            poll_interval: self.config.poll_interval,
        };
        let reader = ReaderTask::spawn("osclink-local", move |stop| pump.run(stop))?;

        Ok(Session {
            reader,
            writer,
            master,
            child,
            guard,
        })
    }
}

impl Transport for LocalLink {
    /// Put the terminal in raw mode, spawn the shell and start forwarding.
    fn start(&mut self) -> Result<(), LinkError> {
        if self.session.is_some() {
            return Err(LinkError::AlreadyStarted);
        }
        self.session = Some(self.spawn_session()?);
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotRunning)?;
        let frame = client_frame(payload);
        let mut outbound = lock(&session.writer);
        outbound.push(&frame).map_err(LinkError::WriteFailed)?;
        if outbound.has_pending() {
            // The reader thread finishes the write once the PTY drains.
            debug!(queued = outbound.pending.len(), "PTY input full, frame queued");
        } else {
            debug!(bytes = payload.len(), "frame sent to PTY");
        }
        Ok(())
    }

    fn try_pull(&self) -> Option<Vec<u8>> {
        self.inbox.try_pop()
    }

    fn finish(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Session {
            mut reader,
            writer,
            master,
            mut child,
            guard,
        } = session;

        reader.stop_and_join();
        // Closing the master hangs up the shell.
        drop(writer);
        drop(master);

        match child.try_wait() {
            Ok(Some(status)) => info!(?status, "shell exited"),
            _ => {
                if let Err(e) = child.kill() {
                    debug!(error = %e, "shell already gone");
                }
                match child.wait() {
                    Ok(status) => info!(?status, "shell reaped"),
                    Err(e) => warn!(error = %e, "failed to reap shell"),
                }
            }
        }

        if let Some(guard) = guard {
            drop(guard);
            let _ = write_all_retrying(&mut io::stdout().lock(), CLOSED);
        }
    }

    fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.reader.is_finished())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.finish();
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State owned by the background reader thread.
struct Pump {
    pty_reader: Box<dyn Read + Send>,
    master_fd: RawFd,
    master: SharedMaster,
    writer: SharedWriter,
    scanner: Scanner,
    inbox: Arc<Inbox>,
    interactive: bool,
    poll_interval: Duration,
}

const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

impl Pump {
    fn run(mut self, stop: StopFlag) {
        let stdin_fd = if self.interactive {
            libc::STDIN_FILENO
        } else {
            -1
        };
        let mut fds = [
            libc::pollfd {
                fd: stdin_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.master_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let mut buf = [0u8; 4096];
        let mut stdin_open = self.interactive;

        while !stop.is_set() && !signals::termination_requested() {
            if self.interactive && signals::take_window_change() {
                self.propagate_size();
            }

            // While the PTY is full, stop reading keystrokes and wait for room.
            let backlog = lock(&self.writer).has_pending();
            fds[0].fd = if stdin_open && !backlog {
                stdin_fd
            } else {
                -1
            };
            fds[1].events = if backlog {
                libc::POLLIN | libc::POLLOUT
            } else {
                libc::POLLIN
            };

            match poll_fds(&mut fds, self.poll_interval) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    break;
                }
            }

            let stdin_events = fds[0].revents;
            if stdin_events & libc::POLLIN != 0 {
                if !self.forward_input(&mut buf) {
                    debug!("stdin closed, no longer forwarding input");
                    stdin_open = false;
                }
            } else if stdin_events & HANGUP != 0 {
                info!("stdin hung up");
                break;
            }

            let pty_events = fds[1].revents;
            if pty_events & libc::POLLOUT != 0 {
                self.flush_input();
            }
            if pty_events & libc::POLLIN != 0 {
                if !self.drain_pty(&mut buf) {
                    break;
                }
            } else if pty_events & HANGUP != 0 {
                info!("shell hung up");
                break;
            }
        }

        let tail = self.scanner.finish();
        if self.interactive && !tail.is_empty() {
            let _ = write_all_retrying(&mut io::stdout().lock(), &tail);
        }
    }

    /// Copy pending keystrokes to the PTY. Returns false once stdin is done.
    fn forward_input(&self, buf: &mut [u8]) -> bool {
        loop {
            match read_fd(libc::STDIN_FILENO, buf) {
                Ok(0) => return false,
                Ok(n) => {
                    let mut outbound = lock(&self.writer);
                    if let Err(e) = outbound.push(&buf[..n]) {
                        warn!(error = %e, "failed to forward input to PTY");
                    }
                    if outbound.has_pending() {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    return false;
                }
            }
        }
    }

    fn flush_input(&self) {
        if let Err(e) = lock(&self.writer).flush_available() {
            warn!(error = %e, "failed to write to PTY");
        }
    }

    /// Read everything the PTY has buffered. Returns false once the shell is gone.
    fn drain_pty(&mut self, buf: &mut [u8]) -> bool {
        loop {
            match self.pty_reader.read(buf) {
                Ok(0) => {
                    info!("PTY EOF detected - shell has exited");
                    return false;
                }
                Ok(n) => self.handle_output(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    // Linux reports EIO once the replica side is closed.
                    debug!(error = %e, "PTY read ended");
                    return false;
                }
            }
        }
    }

    fn handle_output(&mut self, chunk: &[u8]) {
        let feed = self.scanner.feed(chunk);
        if self.interactive && !feed.passthrough.is_empty() {
            if let Err(e) = write_all_retrying(&mut io::stdout().lock(), &feed.passthrough) {
                warn!(error = %e, "failed to write shell output");
            }
        }
        for payload in feed.frames {
            debug!(bytes = payload.len(), "frame received from PTY");
            self.inbox.push(payload);
        }
    }

    fn propagate_size(&self) {
        let Ok((rows, cols)) = terminal::get_terminal_size() else {
            return;
        };
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match lock(&self.master).resize(size) {
            Ok(()) => debug!(rows, cols, "PTY resized"),
            Err(e) => warn!(error = %e, "failed to resize PTY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_shell_wins() {
        let link = LocalLink::new(LocalConfig {
            shell: Some("/bin/dash".into()),
            ..Default::default()
        });
        assert_eq!(link.resolve_shell(), "/bin/dash");
    }

    #[test]
    fn empty_configured_shell_falls_back() {
        let link = LocalLink::new(LocalConfig {
            shell: Some(String::new()),
            ..Default::default()
        });
        assert!(!link.resolve_shell().is_empty());
    }

    #[test]
    fn send_before_start_is_rejected() {
        let mut link = LocalLink::new(LocalConfig::default());
        assert!(matches!(link.send(b"x"), Err(LinkError::NotRunning)));
        assert!(!link.is_running());
        assert_eq!(link.try_pull(), None);
        // finish on an idle link is a no-op
        link.finish();
    }
}
