//! Remote shell sessions.
//!
//! The backup engine only relies on [SessionProvider] and [Session].
//! [OpenSsh] implements them with the system `ssh` client.

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use derive_more::{Display, Error, From};

pub mod openssh;

pub use openssh::OpenSsh;

/// Authentication method of a session.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private key, optionally protected by a passphrase.
    Key {
        key_path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key { key_path, .. } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .finish_non_exhaustive(),
            Self::Password(_) => f.write_str("Password"),
        }
    }
}

/// Everything needed to open a [Session].
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthMethod,
}

impl fmt::Display for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Exit status of a remote command.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum ExitStatus {
    Successful,
    /// The command failed. The code is missing if it was killed by a signal.
    Failed(Option<i32>),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self == &ExitStatus::Successful
    }

    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitStatus::Successful,
            code => ExitStatus::Failed(code),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Successful => f.write_str("exited successfully"),
            ExitStatus::Failed(Some(code)) => write!(f, "exited with status {code}"),
            ExitStatus::Failed(None) => f.write_str("exited with unknown status"),
        }
    }
}

/// Opens authenticated sessions to remote hosts.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Session;

    /// Dials `params.host` and authenticates.
    async fn connect(&self, params: &ConnectParams) -> Result<Self::Session, SessionError>;
}

/// An authenticated connection to one host.
///
/// Commands may run concurrently on the same session.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Runs `command` through the remote shell.
    ///
    /// `input` is fed to the standard input of the command, which is how
    /// secrets reach it without showing up in any argument list. An empty
    /// `input` leaves standard input closed.
    ///
    /// Standard output is streamed into `stdout` while the command runs, its
    /// diagnostics into `stderr`. Returns once the command exited and both
    /// streams are drained, or as soon as writing into a sink failed.
    async fn run(
        &self,
        command: &str,
        input: &[u8],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<ExitStatus, SessionError>;

    /// Closes the session.
    async fn close(self) -> Result<(), SessionError>;
}

#[derive(Debug, Display, Error, From)]
/// Errors of [SessionProvider] and [Session].
pub enum SessionError {
    /// The transport process can't be started.
    #[display("Starting ssh failed: {_0}")]
    Spawn(io::Error),
    /// Dialing or authentication failed.
    #[display("Connecting to {target} failed: {error}")]
    Connect {
        #[error(ignore)]
        target: String,
        #[error(ignore)]
        error: String,
    },
    /// Reading the remote output or writing it into the sink failed.
    #[display("Transferring command output failed: {_0}")]
    #[from]
    Io(io::Error),
    /// The session is no longer usable.
    #[display("Session closed")]
    Closed,
}
