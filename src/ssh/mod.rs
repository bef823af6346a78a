/// Remote command execution over SSH with password authentication
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use ssh2::{ExtendedData, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use crate::robot::error::{Result, RobotError};
use crate::utils::probe::SSH_PORT;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Where and as whom to run a command
#[derive(Debug)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
}

impl SshTarget {
    /// `root@host:22`, the login of a Robot rescue system
    pub fn root(host: impl Into<String>, password: SecretString) -> Self {
        Self {
            host: host.into(),
            port: SSH_PORT,
            user: "root".to_string(),
            password,
        }
    }
}

/// Runs one command on a remote host and returns its combined output
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String>;
}

/// [`RemoteExecutor`] backed by libssh2. Host keys are not verified.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Owned copy of a target, movable onto the blocking pool
struct Job {
    host: String,
    port: u16,
    user: String,
    password: SecretString,
    command: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Job {
    fn error(&self, message: impl std::fmt::Display) -> RobotError {
        RobotError::Ssh {
            host: self.host.clone(),
            message: message.to_string(),
        }
    }

    fn run(self) -> Result<String> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.error(format!("failed to resolve: {e}")))?
            .next()
            .ok_or_else(|| self.error("no address"))?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| self.error(format!("failed to connect: {e}")))?;

        let mut session = Session::new().map_err(|e| self.error(e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| self.error(format!("handshake failed: {e}")))?;
        session
            .userauth_password(&self.user, self.password.expose_secret())
            .map_err(|e| self.error(format!("authentication failed: {e}")))?;

        session.set_timeout(self.command_timeout.as_millis().min(u32::MAX as u128) as u32);
        let mut channel = session.channel_session().map_err(|e| self.error(e))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| self.error(e))?;
        channel.exec(&self.command).map_err(|e| self.error(e))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| self.error(format!("failed to read output: {e}")))?;
        channel.wait_close().map_err(|e| self.error(e))?;
        let status = channel.exit_status().map_err(|e| self.error(e))?;

        if status != 0 {
            return Err(self.error(format!(
                "command exited with status {status}: {}",
                output.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String> {
        info!(host = %target.host, user = %target.user, "Running remote command");
        debug!(host = %target.host, command = %command, "SSH command");

        let job = Job {
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
            password: SecretString::from(target.password.expose_secret().to_owned()),
            command: command.to_string(),
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
        };
        let host = target.host.clone();
        let deadline = self.connect_timeout + self.command_timeout;

        match tokio::time::timeout(deadline, tokio::task::spawn_blocking(move || job.run())).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(RobotError::Ssh {
                host,
                message: format!("SSH task failed: {join_error}"),
            }),
            Err(_) => Err(RobotError::Timeout {
                secs: deadline.as_secs(),
                what: format!("SSH command on {host}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_root_target_defaults() {
        let target = SshTarget::root("10.0.0.1", SecretString::from("pw".to_string()));
        assert_eq!(target.user, "root");
        assert_eq!(target.port, 22);
        assert!(!format!("{target:?}").contains("pw\""));
    }

    #[tokio::test]
    async fn test_connection_refused_is_ssh_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = SshTarget {
            port,
            ..SshTarget::root("127.0.0.1", SecretString::from("pw".to_string()))
        };
        let executor = SshExecutor::new().with_connect_timeout(Duration::from_secs(2));

        match executor.run(&target, "true").await {
            Err(RobotError::Ssh { host, message }) => {
                assert_eq!(host, "127.0.0.1");
                assert!(message.contains("failed to connect"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_server_fails_handshake_within_deadline() {
        // Accepts TCP but never speaks SSH
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = SshTarget {
            port,
            ..SshTarget::root("127.0.0.1", SecretString::from("pw".to_string()))
        };
        let executor = SshExecutor::new()
            .with_connect_timeout(Duration::from_millis(300))
            .with_command_timeout(Duration::from_millis(300));

        let result = executor.run(&target, "true").await;
        assert!(result.is_err());
        drop(listener);
    }
}
