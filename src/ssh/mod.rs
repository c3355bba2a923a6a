//! SSH client side of a session.
//!
//! - [`Connector`] logs in with a password, opens the interactive shell and
//!   detects the server encoding. Used by `POST /`.
//! - [`SshConnection`] is the authenticated connection. Besides the shell it
//!   runs one-off commands on sibling channels (`locale charmap`, file
//!   transfer).
//! - [`SshChannel`] adapts the shell channel to the non-blocking
//!   [`RemoteChannel`](crate::bridge::io::RemoteChannel) the bridge drives.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::bridge::Endpoint;
use crate::config::SshConfig;
use crate::util::shell_quote;

pub mod channel;

pub use channel::SshChannel;

/// Cap on captured output of side commands.
pub const MAX_EXEC_OUTPUT: usize = 64 * 1024;

/// Credentials and target of a login request.
#[derive(Debug, Clone)]
pub struct LoginArgs {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl LoginArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.hostname.clone(), self.port)
    }
}

/// Why a login did not produce a shell.
#[derive(Debug)]
pub enum LoginError {
    /// TCP connect failed or timed out.
    Unreachable { host: String, port: u16 },
    /// The server rejected the password.
    AuthFailed,
    /// Key exchange or protocol failure after connecting.
    Handshake(String),
    /// Authenticated, but the PTY or shell request failed.
    Shell(String),
}

impl LoginError {
    /// The target could not be reached at all, so any proxy entry for it is
    /// stale.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { host, port } => write!(f, "Unable to connect to {host}:{port}"),
            Self::AuthFailed => f.write_str("Authentication failed."),
            Self::Handshake(e) => write!(f, "SSH handshake failed: {e}"),
            Self::Shell(e) => write!(f, "Failed to open shell: {e}"),
        }
    }
}

/// A freshly opened interactive shell.
pub struct ShellLogin {
    pub connection: Arc<SshConnection>,
    pub channel: SshChannel,
    pub encoding: String,
}

/// Accepts any host key: the gateway logs into hosts the operator names, with
/// no known-hosts store to check against.
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens shells. Cheap to share; holds the client config and a limit on
/// concurrent handshakes.
pub struct Connector {
    client: Arc<client::Config>,
    timeout: Duration,
    logins: Semaphore,
    encoding: Option<String>,
    rows: u16,
    cols: u16,
}

impl Connector {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            client: Arc::new(client::Config::default()),
            timeout: Duration::from_secs(config.connect_timeout_secs),
            logins: Semaphore::new(config.max_concurrent_logins.max(1)),
            encoding: config.encoding.clone(),
            rows: config.default_terminal_rows,
            cols: config.default_terminal_cols,
        }
    }

    /// Log in and open a PTY shell with `TERM=term`.
    pub async fn open_shell(&self, args: &LoginArgs, term: &str) -> Result<ShellLogin, LoginError> {
        let _permit = self
            .logins
            .acquire()
            .await
            .map_err(|e| LoginError::Handshake(e.to_string()))?;

        info!("Connecting to {}:{}", args.hostname, args.port);
        let connection = Arc::new(self.connect(args).await?);
        let channel = connection
            .open_shell(term, self.rows, self.cols)
            .await
            .map_err(|e| LoginError::Shell(e.to_string()))?;
        let encoding = match &self.encoding {
            Some(encoding) => encoding.clone(),
            None => connection.probe_encoding().await,
        };
        Ok(ShellLogin {
            connection,
            channel,
            encoding,
        })
    }

    async fn connect(&self, args: &LoginArgs) -> Result<SshConnection, LoginError> {
        let unreachable = || LoginError::Unreachable {
            host: args.hostname.clone(),
            port: args.port,
        };
        let addr = (args.hostname.as_str(), args.port);
        let mut handle = match tokio::time::timeout(
            self.timeout,
            client::connect(Arc::clone(&self.client), addr, ClientHandler),
        )
        .await
        {
            Err(_) => return Err(unreachable()),
            Ok(Err(russh::Error::IO(e))) => {
                warn!("Connect to {}:{} failed: {e}", args.hostname, args.port);
                return Err(unreachable());
            }
            Ok(Err(e)) => return Err(LoginError::Handshake(e.to_string())),
            Ok(Ok(handle)) => handle,
        };

        let auth = tokio::time::timeout(
            self.timeout,
            handle.authenticate_password(args.username.as_str(), args.password.as_str()),
        )
        .await
        .map_err(|_| LoginError::Handshake("authentication timed out".to_string()))?
        .map_err(|e| LoginError::Handshake(e.to_string()))?;
        if !auth.success() {
            return Err(LoginError::AuthFailed);
        }

        Ok(SshConnection {
            handle: Mutex::new(handle),
            endpoint: args.endpoint(),
        })
    }
}

/// Output of a side command.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    handle: Mutex<Handle<ClientHandler>>,
    endpoint: Endpoint,
}

impl SshConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open_session(&self) -> Result<Channel<Msg>, russh::Error> {
        self.handle.lock().await.channel_open_session().await
    }

    /// Open the interactive shell channel. The returned channel disconnects
    /// this connection when it closes.
    pub async fn open_shell(
        self: &Arc<Self>,
        term: &str,
        rows: u16,
        cols: u16,
    ) -> Result<SshChannel, russh::Error> {
        let channel = self.open_session().await?;
        channel
            .request_pty(false, term, u32::from(cols), u32::from(rows), 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("Shell opened on {} with TERM={term}", self.endpoint);
        Ok(SshChannel::spawn(channel, Arc::clone(self)))
    }

    /// Start `command` on a new channel. The caller reads the channel.
    pub async fn exec(&self, command: &str) -> Result<Channel<Msg>, russh::Error> {
        let channel = self.open_session().await?;
        channel.exec(true, command).await?;
        Ok(channel)
    }

    /// Run `command` to completion and capture its stdout.
    pub async fn run(&self, command: &str) -> Result<ExecOutput, russh::Error> {
        let channel = self.exec(command).await?;
        Ok(collect(channel).await)
    }

    /// Append `data` to the remote file at `path`.
    pub async fn append_file(&self, path: &str, data: &[u8]) -> Result<ExecOutput, russh::Error> {
        let channel = self.exec(&format!("cat >> {}", shell_quote(path))).await?;
        channel.data(data).await?;
        channel.eof().await?;
        Ok(collect(channel).await)
    }

    /// Server charset from `locale charmap`, or `UTF-8` if that fails.
    pub async fn probe_encoding(&self) -> String {
        match self.run("locale charmap").await {
            Ok(out) => {
                let charmap = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if !charmap.is_empty() {
                    return charmap;
                }
            }
            Err(e) => warn!("Encoding probe on {} failed: {e}", self.endpoint),
        }
        warn!("Unable to detect encoding of {}, assuming UTF-8", self.endpoint);
        "UTF-8".to_string()
    }

    pub async fn disconnect(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Disconnect from {} failed: {e}", self.endpoint);
        }
    }
}

/// Drain a command channel: stdout (capped) and exit status.
async fn collect(mut channel: Channel<Msg>) -> ExecOutput {
    let mut out = ExecOutput::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                let room = MAX_EXEC_OUTPUT.saturating_sub(out.stdout.len());
                out.stdout.extend_from_slice(&data[..data.len().min(room)]);
            }
            ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_error_messages() {
        let err = LoginError::Unreachable {
            host: "10.1.1.1".to_string(),
            port: 2222,
        };
        assert_eq!(err.to_string(), "Unable to connect to 10.1.1.1:2222");
        assert!(err.is_unreachable());
        assert_eq!(LoginError::AuthFailed.to_string(), "Authentication failed.");
        assert!(!LoginError::AuthFailed.is_unreachable());
    }

    #[test]
    fn test_exec_output_success() {
        let mut out = ExecOutput::default();
        assert!(!out.succeeded());
        out.exit_status = Some(0);
        assert!(out.succeeded());
        out.exit_status = Some(2);
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Connector::new(&SshConfig::default());
        let args = LoginArgs {
            hostname: "127.0.0.1".to_string(),
            port,
            username: "root".to_string(),
            password: "x".to_string(),
        };
        let err = connector.open_shell(&args, "xterm").await.err().unwrap();
        assert!(err.is_unreachable(), "{err}");
    }
}
