use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{ChannelRead, ExecChannel, HostKeyStatus, SftpProbe, SshBackend};
use crate::error::{RemoteBinaryError, SshError};

/// [`SshBackend`] over russh. Owns a small tokio runtime so the state
/// machine above it stays synchronous.
pub struct RusshBackend {
    runtime: Runtime,
    session: Option<client::Handle<HostKeyCheck>>,
    seen: Arc<Mutex<Option<SeenKey>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Known,
    Unknown,
    Changed,
}

struct SeenKey {
    host: String,
    port: u16,
    key: PublicKey,
    verdict: Verdict,
}

/// Handler that checks the server key against `~/.ssh/known_hosts`.
struct HostKeyCheck {
    host: String,
    port: u16,
    seen: Arc<Mutex<Option<SeenKey>>>,
}

#[async_trait::async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let verdict = match russh_keys::check_known_hosts(&self.host, self.port, server_public_key)
        {
            Ok(true) => Verdict::Known,
            Ok(false) => Verdict::Unknown,
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(host = %self.host, line, "host key does not match known_hosts");
                Verdict::Changed
            }
            Err(e) => {
                debug!(error = %e, "could not read known_hosts");
                Verdict::Unknown
            }
        };
        *lock(&self.seen) = Some(SeenKey {
            host: self.host.clone(),
            port: self.port,
            key: server_public_key.clone(),
            verdict,
        });
        Ok(verdict != Verdict::Changed)
    }
}

impl RusshBackend {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("osclink-ssh-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            session: None,
            seen: Arc::new(Mutex::new(None)),
        })
    }

    fn session(&self) -> Result<&client::Handle<HostKeyCheck>, SshError> {
        self.session
            .as_ref()
            .ok_or_else(|| SshError::Channel("not connected".into()))
    }
}

impl SshBackend for RusshBackend {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<HostKeyStatus, SshError> {
        self.disconnect();

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: host.to_string(),
            port,
            seen: self.seen.clone(),
        };

        let result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, client::connect(config, (host.to_string(), port), handler))
                .await
        });
        let verdict = lock(&self.seen).as_ref().map(|seen| seen.verdict);

        match result {
            Err(_) => Err(SshError::Connect(format!(
                "connection to {host}:{port} timed out"
            ))),
            Ok(Err(_)) if verdict == Some(Verdict::Changed) => Err(SshError::HostKeyChanged {
                host: host.to_string(),
            }),
            Ok(Err(e)) => Err(SshError::Connect(format!(
                "failed to connect to {host}:{port}: {e}"
            ))),
            Ok(Ok(handle)) => {
                self.session = Some(handle);
                Ok(match verdict {
                    Some(Verdict::Known) => HostKeyStatus::Known,
                    _ => HostKeyStatus::Unknown,
                })
            }
        }
    }

    fn authenticate_publickey(
        &mut self,
        user: &str,
        identity_files: &[PathBuf],
    ) -> Result<(), SshError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SshError::Auth("not connected".into()))?;

        let mut offered = 0;
        for path in identity_files.iter().filter(|p| p.exists()) {
            let key = match russh_keys::load_secret_key(path, None) {
                Ok(key) => key,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping identity file");
                    continue;
                }
            };
            offered += 1;
            let accepted = self
                .runtime
                .block_on(session.authenticate_publickey(user, Arc::new(key)))
                .map_err(|e| SshError::Auth(format!("public key authentication failed: {e}")))?;
            if accepted {
                info!(path = %path.display(), "public key accepted");
                return Ok(());
            }
            debug!(path = %path.display(), "public key rejected");
        }

        Err(SshError::Auth(if offered == 0 {
            "no usable identity files".to_string()
        } else {
            "public key authentication failed".to_string()
        }))
    }

    fn authenticate_password(&mut self, user: &str, password: &[u8]) -> Result<(), SshError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SshError::Auth("not connected".into()))?;
        let password = std::str::from_utf8(password)
            .map_err(|_| SshError::Auth("password is not valid UTF-8".into()))?;
        let accepted = self
            .runtime
            .block_on(session.authenticate_password(user, password))
            .map_err(|e| SshError::Auth(format!("password authentication failed: {e}")))?;
        if accepted {
            Ok(())
        } else {
            Err(SshError::Auth("Permission denied, please try again".into()))
        }
    }

    fn write_known_host(&mut self) -> Result<(), SshError> {
        let seen = lock(&self.seen);
        let seen = seen
            .as_ref()
            .ok_or_else(|| SshError::KnownHosts("no host key has been seen".into()))?;
        russh_keys::learn_known_hosts(&seen.host, seen.port, &seen.key)
            .map_err(|e| SshError::KnownHosts(e.to_string()))
    }

    fn open_sftp(&mut self) -> Result<Box<dyn SftpProbe>, SshError> {
        let session = self.session()?;
        let sftp = self.runtime.block_on(async {
            let channel = session
                .channel_open_session()
                .await
                .map_err(|e| SshError::Channel(format!("failed to open sftp channel: {e}")))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| SshError::Channel(format!("failed to request sftp: {e}")))?;
            SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| SshError::Channel(format!("failed to start sftp: {e}")))
        })?;
        Ok(Box::new(RusshSftp {
            runtime: self.runtime.handle().clone(),
            sftp: Some(sftp),
        }))
    }

    fn open_exec(&mut self) -> Result<Arc<dyn ExecChannel>, SshError> {
        let session = self.session()?;
        let channel = self
            .runtime
            .block_on(session.channel_open_session())
            .map_err(|e| SshError::Channel(format!("failed to open exec channel: {e}")))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = std_mpsc::channel();
        let actor = ChannelActor {
            channel,
            commands: commands_rx,
            state: ChannelState {
                output: Some(output_tx),
                pending_exec: None,
            },
        };
        self.runtime.spawn(actor.run());

        Ok(Arc::new(RusshExec {
            commands: commands_tx,
            output: Mutex::new(output_rx),
            closed: AtomicBool::new(false),
        }))
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let result = self
                .runtime
                .block_on(session.disconnect(Disconnect::ByApplication, "", "English"));
            if let Err(e) = result {
                debug!(error = %e, "ssh disconnect");
            }
        }
        *lock(&self.seen) = None;
    }
}

impl Drop for RusshBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// SFTP probe
// =============================================================================

struct RusshSftp {
    runtime: Handle,
    sftp: Option<SftpSession>,
}

impl SftpProbe for RusshSftp {
    fn stat(&mut self, path: &str) -> Result<(), RemoteBinaryError> {
        let Some(sftp) = self.sftp.as_ref() else {
            return Err(RemoteBinaryError::Other {
                path: path.to_string(),
                reason: "sftp channel closed".into(),
            });
        };
        match self.runtime.block_on(sftp.metadata(path)) {
            Ok(_) => Ok(()),
            Err(russh_sftp::client::error::Error::Status(status)) => {
                Err(status_error(path, status.status_code))
            }
            Err(e) => Err(RemoteBinaryError::Other {
                path: path.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn close(&mut self) {
        if let Some(sftp) = self.sftp.take()
            && let Err(e) = self.runtime.block_on(sftp.close())
        {
            debug!(error = %e, "sftp close");
        }
    }
}

fn status_error(path: &str, code: StatusCode) -> RemoteBinaryError {
    let path = path.to_string();
    match code {
        StatusCode::NoSuchFile => RemoteBinaryError::Missing { path },
        StatusCode::PermissionDenied => RemoteBinaryError::PermissionDenied { path },
        code => RemoteBinaryError::Other {
            path,
            reason: format!("{code:?}"),
        },
    }
}

impl Drop for RusshSftp {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Exec channel actor
// =============================================================================

type Reply = oneshot::Sender<Result<(), String>>;

/// Messages that can be sent to the channel actor
enum ChannelCommand {
    Exec { command: String, respond_to: Reply },
    Write { data: Vec<u8>, respond_to: Reply },
    Close { respond_to: oneshot::Sender<()> },
}

/// Owns the russh channel. Forwards remote output to a std channel so the
/// blocking reader thread can wait on it with a timeout.
struct ChannelActor {
    channel: Channel<Msg>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    state: ChannelState,
}

/// What the actor does with server messages, apart from the channel itself.
struct ChannelState {
    /// Dropped once the remote side is done, which the reader sees as EOF.
    output: Option<std_mpsc::Sender<Vec<u8>>>,
    pending_exec: Option<Reply>,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Exec { command, respond_to }) => {
                        match self.channel.exec(true, command).await {
                            // The server's verdict arrives as Success/Failure.
                            Ok(()) => self.state.pending_exec = Some(respond_to),
                            Err(e) => {
                                let _ = respond_to.send(Err(e.to_string()));
                            }
                        }
                    }
                    Some(ChannelCommand::Write { data, respond_to }) => {
                        let result = self.channel.data(&data[..]).await.map_err(|e| e.to_string());
                        let _ = respond_to.send(result);
                    }
                    Some(ChannelCommand::Close { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                message = self.channel.wait(), if self.state.output.is_some() => self.state.handle(message),
            }
        }
        debug!("exec channel actor exiting");
    }

    async fn shutdown(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        self.state.output = None;
    }
}

impl ChannelState {
    fn handle(&mut self, message: Option<ChannelMsg>) {
        match message {
            Some(ChannelMsg::Data { data }) => {
                if let Some(output) = &self.output
                    && output.send(data.to_vec()).is_err()
                {
                    self.output = None;
                }
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                debug!(stderr = %String::from_utf8_lossy(&data), "remote stderr");
            }
            Some(ChannelMsg::Success) => {
                if let Some(reply) = self.pending_exec.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Some(ChannelMsg::Failure) => {
                if let Some(reply) = self.pending_exec.take() {
                    let _ = reply.send(Err("remote refused exec request".into()));
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                info!(exit_status, "remote command exited");
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                if let Some(reply) = self.pending_exec.take() {
                    let _ = reply.send(Err("channel closed".into()));
                }
                // Dropping the sender reports EOF to the reader.
                self.output = None;
            }
            _ => {}
        }
    }
}

/// Blocking handle to a [`ChannelActor`].
struct RusshExec {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    output: Mutex<std_mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl RusshExec {
    fn request(&self, make: impl FnOnce(Reply) -> ChannelCommand) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| "exec channel is closed".to_string())?;
        rx.blocking_recv()
            .map_err(|_| "exec channel is closed".to_string())?
    }
}

impl ExecChannel for RusshExec {
    fn exec(&self, command: &str) -> Result<(), SshError> {
        let command = command.to_string();
        self.request(|respond_to| ChannelCommand::Exec {
            command,
            respond_to,
        })
        .map_err(SshError::Exec)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let data = data.to_vec();
        let len = data.len();
        self.request(|respond_to| ChannelCommand::Write { data, respond_to })
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(len)
    }

    fn read(&self, timeout: Duration) -> io::Result<ChannelRead> {
        match lock(&self.output).recv_timeout(timeout) {
            Ok(data) => Ok(ChannelRead::Data(data)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(ChannelRead::Timeout),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Ok(ChannelRead::Eof),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(ChannelCommand::Close { respond_to: tx })
            .is_ok()
        {
            let _ = rx.blocking_recv();
        }
    }
}

impl Drop for RusshExec {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    fn state() -> (ChannelState, std_mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = std_mpsc::channel();
        let state = ChannelState {
            output: Some(tx),
            pending_exec: None,
        };
        (state, rx)
    }

    fn exec_pending(state: &mut ChannelState) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        state.pending_exec = Some(tx);
        rx
    }

    /// A handle whose actor is already gone.
    fn exec_handle(output: std_mpsc::Receiver<Vec<u8>>) -> RusshExec {
        let (commands, _) = mpsc::unbounded_channel();
        RusshExec {
            commands,
            output: Mutex::new(output),
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn exec_reply_follows_server_verdict() {
        let (mut state, _rx) = state();
        let mut reply = exec_pending(&mut state);
        state.handle(Some(ChannelMsg::Success));
        assert_eq!(reply.try_recv().unwrap(), Ok(()));
        assert!(state.pending_exec.is_none());

        let mut reply = exec_pending(&mut state);
        state.handle(Some(ChannelMsg::Failure));
        assert_eq!(
            reply.try_recv().unwrap(),
            Err("remote refused exec request".to_string())
        );
        assert!(state.output.is_some());
    }

    #[test]
    fn channel_end_fails_a_pending_exec() {
        for end in [Some(ChannelMsg::Eof), Some(ChannelMsg::Close), None] {
            let (mut state, _rx) = state();
            let mut reply = exec_pending(&mut state);
            state.handle(end);
            assert_eq!(reply.try_recv().unwrap(), Err("channel closed".to_string()));
            assert!(state.output.is_none());
        }
    }

    #[test]
    fn output_reaches_the_reader_until_eof() {
        let (mut state, rx) = state();
        let exec = exec_handle(rx);

        state.handle(Some(ChannelMsg::Data {
            data: CryptoVec::from_slice(b"\x1b]9998;T0s=\x07"),
        }));
        state.handle(Some(ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"sudo: warning"),
            ext: 1,
        }));
        state.handle(Some(ChannelMsg::Eof));

        let timeout = Duration::from_millis(100);
        match exec.read(timeout).unwrap() {
            ChannelRead::Data(data) => assert_eq!(data, b"\x1b]9998;T0s=\x07"),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(exec.read(timeout).unwrap(), ChannelRead::Eof));
    }

    #[test]
    fn quiet_channel_times_out() {
        let (_state, rx) = state();
        let exec = exec_handle(rx);
        assert!(matches!(
            exec.read(Duration::from_millis(10)).unwrap(),
            ChannelRead::Timeout
        ));
    }

    #[test]
    fn writes_fail_once_the_actor_is_gone() {
        let (_state, rx) = state();
        let exec = exec_handle(rx);
        let err = exec.write(b"frame").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(exec.exec("true"), Err(SshError::Exec(_))));
        exec.close();
        exec.close();
    }

    #[test]
    fn sftp_status_maps_to_remote_binary_error() {
        let path = "osclink/build/server";
        assert_eq!(
            status_error(path, StatusCode::NoSuchFile).to_string(),
            "osclink/build/server: no such file"
        );
        assert_eq!(
            status_error(path, StatusCode::PermissionDenied).to_string(),
            "osclink/build/server: permission denied"
        );
        assert!(matches!(
            status_error(path, StatusCode::Failure),
            RemoteBinaryError::Other { reason, .. } if reason == "Failure"
        ));
    }
}
