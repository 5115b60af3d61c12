use std::fmt;
use std::io;

/// Errors raised by the tunnel transports.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Failed to set up the PTY, shell or terminal
    #[error("Failed to create tunnel: {0}")]
    CreateFailed(String),
    /// `start` was called on a transport that is already running
    #[error("Transport already started")]
    AlreadyStarted,
    /// The transport has no live channel to write to
    #[error("Transport is not running")]
    NotRunning,
    /// A frame write hit a hard I/O error
    #[error("Failed to write frame: {0}")]
    WriteFailed(#[source] io::Error),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<anyhow::Error> for LinkError {
    fn from(err: anyhow::Error) -> Self {
        LinkError::CreateFailed(format!("{err:#}"))
    }
}

/// Lifecycle state of an [`SshLink`](crate::ssh::SshLink).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Init,
    Connected,
    Authenticated,
    Attached,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Init => "INIT",
            LinkState::Connected => "CONNECTED",
            LinkState::Authenticated => "AUTHENTICATED",
            LinkState::Attached => "ATTACHED",
        };
        f.write_str(name)
    }
}

/// Errors raised while connecting, authenticating or attaching over SSH.
///
/// The `Display` text is what the link records as its last-error string.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("{0}")]
    Connect(String),
    #[error("host key for {host} does not match known_hosts")]
    HostKeyChanged { host: String },
    #[error("{0}")]
    Auth(String),
    #[error("failed to update known_hosts: {0}")]
    KnownHosts(String),
    #[error("{0}")]
    Channel(String),
    #[error("failed to execute remote command: {0}")]
    Exec(String),
    #[error(transparent)]
    RemoteBinary(#[from] RemoteBinaryError),
    #[error("operation requires state {expected}, link is {actual}")]
    InvalidState {
        expected: LinkState,
        actual: LinkState,
    },
    #[error("link is not attached")]
    NotAttached,
}

/// Why the remote collector binary could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteBinaryError {
    #[error("{path}: no such file")]
    Missing { path: String },
    #[error("{path}: permission denied")]
    PermissionDenied { path: String },
    #[error("{path}: unknown error {reason}")]
    Other { path: String, reason: String },
}
