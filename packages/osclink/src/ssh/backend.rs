use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RemoteBinaryError, SshError};

/// Whether the server's host key was found in `known_hosts`.
///
/// A key that contradicts `known_hosts` never gets this far: `connect`
/// fails with [`SshError::HostKeyChanged`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyStatus {
    Known,
    Unknown,
}

/// Blocking SSH primitives the [`SshLink`](super::SshLink) state machine drives.
///
/// The backend owns at most one session. Every call is made from the
/// thread that owns the link.
pub trait SshBackend {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<HostKeyStatus, SshError>;

    /// Try each identity file in order until the server accepts one.
    fn authenticate_publickey(
        &mut self,
        user: &str,
        identity_files: &[PathBuf],
    ) -> Result<(), SshError>;

    fn authenticate_password(&mut self, user: &str, password: &[u8]) -> Result<(), SshError>;

    /// Persist the host key seen by the last `connect`.
    fn write_known_host(&mut self) -> Result<(), SshError>;

    fn open_sftp(&mut self) -> Result<Box<dyn SftpProbe>, SshError>;

    fn open_exec(&mut self) -> Result<Arc<dyn ExecChannel>, SshError>;

    /// Drop the session. Safe to call when not connected.
    fn disconnect(&mut self);
}

/// An SFTP subsystem channel, used only to check the remote binary.
pub trait SftpProbe: Send {
    fn stat(&mut self, path: &str) -> Result<(), RemoteBinaryError>;

    /// Send EOF and close the channel. Idempotent.
    fn close(&mut self);
}

/// Outcome of one bounded read from an exec channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelRead {
    Data(Vec<u8>),
    Timeout,
    Eof,
}

/// Session channel running the remote collector.
///
/// Shared between the link (writes) and its reader thread (reads).
pub trait ExecChannel: Send + Sync {
    fn exec(&self, command: &str) -> Result<(), SshError>;

    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Wait at most `timeout` for output from the remote command.
    fn read(&self, timeout: Duration) -> io::Result<ChannelRead>;

    /// Send EOF and close the channel. Idempotent.
    fn close(&self);
}

/// Adapts an [`ExecChannel`] to [`io::Write`] for the retrying frame writer.
pub(crate) struct ChannelWriter<'a>(pub(crate) &'a dyn ExecChannel);

impl io::Write for ChannelWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
