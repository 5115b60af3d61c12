//! SSH transport: frames written to and read from a remote command's
//! exec channel.

mod backend;
mod link;
mod password;
mod russh_backend;

pub use backend::{ChannelRead, ExecChannel, HostKeyStatus, SftpProbe, SshBackend};
pub use link::SshLink;
pub use password::Password;
pub use russh_backend::RusshBackend;
