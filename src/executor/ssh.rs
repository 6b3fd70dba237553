// SSH transport: key-based sessions, remote script execution and SFTP script push

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session};
use tracing::{debug, info};

use super::{CommandResult, Connection, Connector, ScriptUpload};
use crate::inventory::HostConfig;
use crate::output::errors::{suggest_fix, MonitorError};

/// libssh2 "would block" return code
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// libssh2 "socket disconnected" return code
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;

/// Back-off between polls of a non-blocking session
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit code recorded when the remote command ended without an exit status
const NO_EXIT_STATUS: i32 = -1;

const SCRIPT_MODE: i32 = 0o755;

/// Dials key-authenticated SSH sessions to one host
#[derive(Clone)]
pub struct SshConnector {
    host_name: String,
    target: String,
    user: String,
    key: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Fails when the private key cannot be read, which makes the host unusable
    pub fn new(host: &HostConfig, connect_timeout: Duration) -> Result<Self, MonitorError> {
        std::fs::read(&host.key).map_err(|e| MonitorError::Io {
            message: format!("Unable to read private key: {}", e),
            path: Some(host.key.clone()),
        })?;

        Ok(SshConnector {
            host_name: host.name.clone(),
            target: host.target(),
            user: host.user.clone(),
            key: host.key.clone(),
            connect_timeout,
        })
    }

    /// Open an authenticated, blocking session
    fn dial(&self) -> Result<Session, MonitorError> {
        let address = self
            .target
            .to_socket_addrs()
            .map_err(|e| self.error(format!("Invalid address {}: {}", self.target, e)))?
            .next()
            .ok_or_else(|| self.error(format!("No address found for {}", self.target)))?;

        let tcp = TcpStream::connect_timeout(&address, self.connect_timeout)
            .map_err(|e| self.error(format!("Connection failed: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| self.error(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session
            .handshake()
            .map_err(|e| self.error(format!("SSH handshake failed: {}", e)))?;

        session
            .userauth_pubkey_file(&self.user, None, &self.key, None)
            .map_err(|e| self.error(format!("Public key authentication failed: {}", e)))?;

        if !session.authenticated() {
            return Err(self.error("Authentication failed".to_string()));
        }

        Ok(session)
    }

    fn error(&self, message: String) -> MonitorError {
        let mut err = MonitorError::ssh(self.host_name.clone(), message);
        let hint = suggest_fix(&err);
        if let MonitorError::Ssh { suggestion, .. } = &mut err {
            *suggestion = hint;
        }
        err
    }

    fn push_blocking(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError> {
        let session = self.dial()?;
        let sftp = session
            .sftp()
            .map_err(|e| self.error(format!("Failed to open SFTP: {}", e)))?;

        for script in scripts {
            let content = std::fs::read(&script.local).map_err(|e| MonitorError::Io {
                message: format!("Failed to read check script: {}", e),
                path: Some(script.local.clone()),
            })?;

            let remote = Path::new(&script.remote);
            let mut file = sftp
                .open_mode(
                    remote,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    SCRIPT_MODE,
                    OpenType::File,
                )
                .map_err(|e| self.error(format!("Failed to create {}: {}", script.remote, e)))?;
            file.write_all(&content)
                .map_err(|e| self.error(format!("Failed to write {}: {}", script.remote, e)))?;
            drop(file);

            // open_mode only applies the mode to new files
            sftp.setstat(
                remote,
                FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(SCRIPT_MODE as u32),
                    atime: None,
                    mtime: None,
                },
            )
            .map_err(|e| self.error(format!("Failed to chmod {}: {}", script.remote, e)))?;

            info!(host = %self.host_name, script = %script.remote, "Pushed check script");
        }

        session.disconnect(None, "scripts pushed", None).ok();
        Ok(())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, MonitorError> {
        let dialer = self.clone();
        let host_name = self.host_name.clone();

        let session = tokio::task::spawn_blocking(move || dialer.dial())
            .await
            .map_err(|e| MonitorError::ssh(host_name.clone(), format!("Dial task failed: {}", e)))??;

        // Every check on the host shares this session, so nothing may hold its
        // lock while waiting on the network.
        session.set_blocking(false);
        debug!(host = %self.host_name, "SSH session established");

        Ok(Arc::new(SshConnection::new(self.host_name.clone(), session)))
    }

    async fn push_scripts(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError> {
        if scripts.is_empty() {
            return Ok(());
        }
        let pusher = self.clone();
        let scripts = scripts.to_vec();
        let host_name = self.host_name.clone();

        tokio::task::spawn_blocking(move || pusher.push_blocking(&scripts))
            .await
            .map_err(|e| MonitorError::ssh(host_name, format!("Push task failed: {}", e)))?
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// A shared, non-blocking SSH session to one host
pub struct SshConnection {
    inner: Arc<SessionHandle>,
}

struct SessionHandle {
    session: Session,
    host_name: String,
    closed: AtomicBool,
}

impl SshConnection {
    fn new(host_name: String, session: Session) -> Self {
        SshConnection {
            inner: Arc::new(SessionHandle {
                session,
                host_name,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, MonitorError> {
        let inner = self.inner.clone();
        let cmd = cmd.to_string();

        tokio::task::spawn_blocking(move || inner.exec(&cmd))
            .await
            .map_err(|e| MonitorError::ssh(self.inner.host_name.clone(), format!("Exec task failed: {}", e)))?
    }

    fn is_alive(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.session.authenticated()
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            // Best effort: a dead peer cannot be told goodbye
            self.inner.session.disconnect(None, "closing", None).ok();
        }
    }

    fn host_name(&self) -> &str {
        &self.inner.host_name
    }
}

impl SessionHandle {
    /// Run one command. The session is in non-blocking mode, so every libssh2
    /// call is retried on EAGAIN and the two output streams are drained side by
    /// side: a command that fills one stream's window must never stall the other.
    /// Closing the session ends every wait with an error.
    fn exec(&self, command: &str) -> Result<CommandResult, MonitorError> {
        let closed = &self.closed;
        let mut channel = retry(closed, || self.session.channel_session())
            .map_err(|e| self.error(format!("Unable to open session: {}", e)))?;

        retry(closed, || channel.exec(command))
            .map_err(|e| self.error(format!("Failed to execute command: {}", e)))?;

        let (stdout, stderr) = {
            let mut out_stream = channel.stream(0);
            let mut err_stream = channel.stderr();
            drain_both(&mut out_stream, &mut err_stream, closed).map_err(|e| self.error(e))?
        };

        retry(closed, || channel.wait_close())
            .map_err(|e| self.error(format!("Failed waiting for command: {}", e)))?;

        let killed_by = channel
            .exit_signal()
            .ok()
            .and_then(|signal| signal.exit_signal);
        let exit_code = match killed_by {
            Some(signal) => {
                debug!(host = %self.host_name, %signal, "Command terminated by signal");
                NO_EXIT_STATUS
            }
            None => channel
                .exit_status()
                .map_err(|e| self.error(format!("No exit status: {}", e)))?,
        };

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn error(&self, message: String) -> MonitorError {
        MonitorError::Ssh {
            host: self.host_name.clone(),
            message,
            suggestion: Some("The connection will be re-established".to_string()),
        }
    }
}

/// Accumulates one output stream until EOF
#[derive(Default)]
struct Drain {
    buf: Vec<u8>,
    done: bool,
}

impl Drain {
    /// Read whatever is available. Returns true if any bytes arrived.
    fn poll(&mut self, reader: &mut impl Read) -> std::io::Result<bool> {
        if self.done {
            return Ok(false);
        }

        let mut chunk = [0u8; 4096];
        let mut progressed = false;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    self.done = true;
                    return Ok(progressed);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(progressed),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read stdout and stderr to EOF, alternating between them
fn drain_both(
    out: &mut impl Read,
    err: &mut impl Read,
    closed: &AtomicBool,
) -> Result<(Vec<u8>, Vec<u8>), String> {
    let mut stdout = Drain::default();
    let mut stderr = Drain::default();

    while !(stdout.done && stderr.done) {
        if closed.load(Ordering::Acquire) {
            return Err("Session closed while reading output".to_string());
        }

        let progressed_out = stdout
            .poll(out)
            .map_err(|e| format!("Failed reading stdout: {}", e))?;
        let progressed_err = stderr
            .poll(err)
            .map_err(|e| format!("Failed reading stderr: {}", e))?;

        if !progressed_out && !progressed_err {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    Ok((stdout.buf, stderr.buf))
}

fn would_block(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Repeat a libssh2 call until it stops returning EAGAIN or the session is closed
fn retry<T>(
    closed: &AtomicBool,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(ref e) if would_block(e) => {
                if closed.load(Ordering::Acquire) {
                    return Err(ssh2::Error::new(
                        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT),
                        "session closed",
                    ));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            other => return other,
        }
    }
}
