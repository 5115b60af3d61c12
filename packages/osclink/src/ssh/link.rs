use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::backend::{ChannelRead, ChannelWriter, ExecChannel, HostKeyStatus, SftpProbe, SshBackend};
use super::password::Password;
use super::russh_backend::RusshBackend;
use crate::codec::{Direction, Scanner};
use crate::config::SshSettings;
use crate::error::{LinkError, LinkState, SshError};
use crate::inbox::Inbox;
use crate::io::{is_transient, write_all_retrying};
use crate::task::{ReaderTask, StopFlag};
use crate::transport::{Transport, client_frame};

/// SSH transport: a managed session moving through
/// `INIT → CONNECTED → AUTHENTICATED → ATTACHED`.
///
/// Every state-changing operation clears [`SshLink::last_error`] first and
/// sets it when the operation fails. Only `disconnect` moves backwards, and
/// it always lands in `INIT`.
pub struct SshLink<B: SshBackend = RusshBackend> {
    backend: B,
    settings: SshSettings,
    state: LinkState,
    pub user: String,
    pub host: String,
    /// Consumed and scrubbed by [`SshLink::authenticate_with_password`].
    pub password: Password,
    known_host: bool,
    last_error: String,
    sftp: Option<Box<dyn SftpProbe>>,
    exec: Option<Arc<dyn ExecChannel>>,
    inbox: Arc<Inbox>,
    reader: Option<ReaderTask>,
}

impl SshLink<RusshBackend> {
    pub fn new(settings: SshSettings) -> Result<Self, LinkError> {
        Ok(Self::with_backend(RusshBackend::new()?, settings))
    }
}

impl<B: SshBackend> SshLink<B> {
    pub fn with_backend(backend: B, settings: SshSettings) -> Self {
        Self {
            backend,
            user: settings.user.clone(),
            host: settings.host.clone(),
            settings,
            state: LinkState::Init,
            password: Password::default(),
            known_host: false,
            last_error: String::new(),
            sftp: None,
            exec: None,
            inbox: Arc::new(Inbox::new()),
            reader: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Human-readable reason the last operation failed, empty after success.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn is_host_known(&self) -> bool {
        self.known_host
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }

    pub fn connect(&mut self) -> Result<(), SshError> {
        self.last_error.clear();
        self.expect_state(LinkState::Init)?;
        info!(user = %self.user, host = %self.host, port = self.settings.port, "connecting");
        match self
            .backend
            .connect(&self.host, self.settings.port, self.settings.connect_timeout)
        {
            Ok(status) => {
                self.known_host = status == HostKeyStatus::Known;
                self.state = LinkState::Connected;
                info!(known_host = self.known_host, "connected");
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Key-based authentication. On failure the link stays `CONNECTED` so
    /// the caller can fall back to a password.
    pub fn try_authenticate_with_publickey(&mut self) -> Result<(), SshError> {
        self.last_error.clear();
        self.expect_state(LinkState::Connected)?;
        match self
            .backend
            .authenticate_publickey(&self.user, &self.settings.identity_files)
        {
            Ok(()) => {
                self.state = LinkState::Authenticated;
                info!(user = %self.user, "authenticated with public key");
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Password authentication with the contents of [`SshLink::password`],
    /// which is scrubbed whatever the outcome.
    pub fn authenticate_with_password(&mut self) -> Result<(), SshError> {
        self.last_error.clear();
        let result = match self.check_state(LinkState::Connected) {
            Ok(()) => self
                .backend
                .authenticate_password(&self.user, self.password.expose()),
            Err(e) => Err(e),
        };
        self.password.scrub();
        match result {
            Ok(()) => {
                self.state = LinkState::Authenticated;
                info!(user = %self.user, "authenticated with password");
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Verify the remote binary, launch the remote command and start reading
    /// its output. Any failure tears down what was opened and leaves the
    /// link `AUTHENTICATED`.
    pub fn start(&mut self) -> Result<(), SshError> {
        self.last_error.clear();
        self.expect_state(LinkState::Authenticated)?;
        match self.attach() {
            Ok(()) => {
                self.state = LinkState::Attached;
                info!(command = %self.settings.remote_command, "attached");
                Ok(())
            }
            Err(e) => {
                self.close_channels();
                self.fail(e)
            }
        }
    }

    fn attach(&mut self) -> Result<(), SshError> {
        let probe = self.sftp.insert(self.backend.open_sftp()?);
        probe.stat(&self.settings.remote_binary)?;
        probe.close();
        self.sftp = None;
        debug!(path = %self.settings.remote_binary, "remote binary present");

        let exec = self.backend.open_exec()?;
        self.exec = Some(exec.clone());
        exec.exec(&self.settings.remote_command)?;

        let inbox = self.inbox.clone();
        let poll_interval = self.settings.poll_interval;
        let reader = ReaderTask::spawn("osclink-ssh", move |stop| {
            read_channel(exec, inbox, poll_interval, stop)
        })
        .map_err(|e| SshError::Channel(format!("failed to start reader: {e}")))?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Write one frame to the remote command's stdin.
    ///
    /// Transient failures are retried. A hard failure is returned without
    /// changing state; the caller decides when to `disconnect`.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let exec = match (&self.exec, self.state) {
            (Some(exec), LinkState::Attached) => exec,
            _ => return Err(SshError::NotAttached.into()),
        };
        let frame = client_frame(payload);
        write_all_retrying(&mut ChannelWriter(exec.as_ref()), &frame)
            .map_err(LinkError::WriteFailed)?;
        debug!(bytes = payload.len(), "frame sent over exec channel");
        Ok(())
    }

    pub fn try_pull(&self) -> Option<Vec<u8>> {
        self.inbox.try_pop()
    }

    /// True while attached with a live reader.
    pub fn is_running(&self) -> bool {
        self.state == LinkState::Attached
            && self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Tear everything down and return to `INIT`. Idempotent.
    ///
    /// User and host are kept so the caller can reconnect.
    pub fn disconnect(&mut self) {
        if self.state != LinkState::Init {
            info!(host = %self.host, state = %self.state, "disconnecting");
        }
        self.close_channels();
        self.backend.disconnect();
        let dropped = self.inbox.clear();
        if dropped > 0 {
            debug!(dropped, "discarding payloads from the closed session");
        }
        self.known_host = false;
        self.last_error.clear();
        self.password.scrub();
        self.state = LinkState::Init;
    }

    /// Trust the current host key for this session only.
    pub fn ignore_unknown_host(&mut self) {
        self.known_host = true;
    }

    /// Add the current host key to `known_hosts`. Trust is only marked
    /// established if the write succeeds.
    pub fn write_known_hosts(&mut self) -> Result<(), SshError> {
        self.last_error.clear();
        if self.state == LinkState::Init {
            let err = SshError::InvalidState {
                expected: LinkState::Connected,
                actual: self.state,
            };
            return self.fail(err);
        }
        match self.backend.write_known_host() {
            Ok(()) => {
                self.known_host = true;
                info!(host = %self.host, "host key saved");
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn close_channels(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.stop_and_join();
        }
        if let Some(mut sftp) = self.sftp.take() {
            sftp.close();
        }
        if let Some(exec) = self.exec.take() {
            exec.close();
        }
    }

    fn check_state(&self, expected: LinkState) -> Result<(), SshError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SshError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn expect_state(&mut self, expected: LinkState) -> Result<(), SshError> {
        match self.check_state(expected) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    fn fail<T>(&mut self, err: SshError) -> Result<T, SshError> {
        warn!(state = %self.state, error = %err, "ssh operation failed");
        self.last_error = err.to_string();
        Err(err)
    }
}

impl<B: SshBackend> Transport for SshLink<B> {
    fn start(&mut self) -> Result<(), LinkError> {
        Ok(SshLink::start(self)?)
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        SshLink::send(self, payload)
    }

    fn try_pull(&self) -> Option<Vec<u8>> {
        SshLink::try_pull(self)
    }

    fn finish(&mut self) {
        self.disconnect();
    }

    fn is_running(&self) -> bool {
        SshLink::is_running(self)
    }
}

impl<B: SshBackend> Drop for SshLink<B> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reader loop: SSH output carries no interactive bytes, so anything
/// outside a frame is dropped.
fn read_channel(
    exec: Arc<dyn ExecChannel>,
    inbox: Arc<Inbox>,
    poll_interval: Duration,
    stop: StopFlag,
) {
    let mut scanner = Scanner::new(Direction::ServerToClient);
    while !stop.is_set() {
        match exec.read(poll_interval) {
            Ok(ChannelRead::Data(chunk)) => {
                let feed = scanner.feed(&chunk);
                if !feed.passthrough.is_empty() {
                    trace!(bytes = feed.passthrough.len(), "ignoring non-frame output");
                }
                for payload in feed.frames {
                    debug!(bytes = payload.len(), "frame received over exec channel");
                    inbox.push(payload);
                }
            }
            Ok(ChannelRead::Timeout) => {}
            Ok(ChannelRead::Eof) => {
                info!("remote command closed its output");
                break;
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                warn!(error = %e, "exec channel read failed");
                break;
            }
        }
    }
    scanner.reset();
}
