//! OSCLink - message tunnel over an interactive terminal stream
//!
//! Frames ride inside the byte stream of a shell session as private OSC
//! escape sequences, so a front end can talk to a collector process that is
//! only reachable through a terminal (a local shell, or a host behind SSH)
//! without opening a socket.
//!
//! # Example
//!
//! ```no_run
//! use osclink::{LocalConfig, LocalLink, Transport};
//!
//! let mut link = LocalLink::new(LocalConfig::default());
//! link.start().unwrap();
//!
//! // The user runs the server inside the tunneled shell.
//! loop {
//!     if let Some(payload) = link.try_pull() {
//!         if payload == b"SERVER-CONNECT" {
//!             link.send(b"REQUEST/TOPOLOGY").unwrap();
//!         }
//!     }
//!     if !link.is_running() {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! link.finish();
//! ```

pub mod codec;
pub mod config;
mod error;
pub mod inbox;
mod io;
pub mod local;
pub mod logging;
pub mod message;
pub mod server;
pub mod signals;
pub mod ssh;
mod task;
pub mod terminal;
mod transport;

pub use codec::{Direction, Feed, Scanner};
pub use config::{FileConfig, LocalConfig, SshSettings};
pub use error::{LinkError, LinkState, RemoteBinaryError, SshError};
pub use inbox::Inbox;
pub use local::LocalLink;
pub use message::Message;
pub use server::ServerLink;
pub use ssh::{Password, SshLink};
pub use transport::Transport;
