//! Remote execution contract
//!
//! Every pipeline step talks to a node only through [`RemoteExecutor`]. The
//! provider obtains executors from an [`ExecutorFactory`] so tests can hand
//! out mocks instead of opening SSH sessions.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use keel_common::crd::MachineAccess;
use keel_common::{Error, Result};

/// Number of trailing output lines kept in error messages
pub const ERROR_TAIL_LINES: usize = 20;

/// Captured result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status
    pub exit_code: u32,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: u32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// True when the command exited 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of stderr, falling back to stdout when stderr is empty
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail_lines(source, lines)
    }
}

/// Keep the last `lines` lines of `text`
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Command and file operations against one host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and capture its output
    async fn execute(&self, command: &str) -> Result<CommandOutput>;

    /// Run a command, forwarding output line by line; returns the exit code
    async fn execute_streaming(
        &self,
        command: &str,
        stdout: mpsc::Sender<String>,
        stderr: mpsc::Sender<String>,
    ) -> Result<u32>;

    /// Write `content` to `remote_path`, creating parent directories
    async fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()>;

    /// Copy a local file to `remote_path`
    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Whether `remote_path` exists
    async fn exists(&self, remote_path: &str) -> Result<bool>;

    /// Host this executor is bound to
    fn host_identifier(&self) -> String;
}

/// Authentication material for a node
#[derive(Clone, PartialEq, Eq)]
pub enum NodeAuth {
    /// Password authentication
    Password(String),
    /// Public key authentication with a PEM/OpenSSH encoded key
    PrivateKey {
        /// Encoded private key
        pem: String,
        /// Optional passphrase
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for NodeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::PrivateKey { .. } => f.write_str("PrivateKey(***)"),
        }
    }
}

/// Where and how to open a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTarget {
    /// Host name or IP
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Credentials
    pub auth: NodeAuth,
}

impl NodeTarget {
    /// Build a target from a Machine descriptor; a private key wins over a password
    pub fn from_access(access: &MachineAccess) -> Result<Self> {
        let auth = match (&access.private_key, &access.password) {
            (Some(pem), _) if !pem.is_empty() => NodeAuth::PrivateKey {
                pem: pem.clone(),
                passphrase: access.passphrase.clone(),
            },
            (_, Some(pw)) => NodeAuth::Password(pw.clone()),
            _ => {
                return Err(Error::validation(format!(
                    "machine {} has neither password nor privateKey",
                    access.ip
                )))
            }
        };
        Ok(Self {
            host: access.ip.clone(),
            port: access.port,
            username: access.username.clone(),
            auth,
        })
    }
}

/// Opens executors for nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Open a session to `target`
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn RemoteExecutor>>;
}

/// Run `command`, turning a non-zero exit into a provisioning error for `step`
pub async fn run_checked(
    exec: &dyn RemoteExecutor,
    step: &str,
    command: &str,
) -> Result<CommandOutput> {
    let output = exec.execute(command).await?;
    if !output.success() {
        return Err(Error::provisioning(
            exec.host_identifier(),
            step,
            format!(
                "`{}` exited {}: {}",
                first_line(command),
                output.exit_code,
                output.tail(ERROR_TAIL_LINES)
            ),
        ));
    }
    Ok(output)
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or_default().trim()
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed bytes and return every line completed by them
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ends
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
