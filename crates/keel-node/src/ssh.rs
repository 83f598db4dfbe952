//! SSH implementation of [`RemoteExecutor`]
//!
//! One russh session per executor. Commands run through `bash -c` on a fresh
//! channel each; files are streamed to `cat > path` so the node needs no
//! SFTP subsystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use russh::{ChannelMsg, Preferred};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use keel_common::retry::{retry_transient, RetryPolicy};
use keel_common::{Error, Result};

use crate::executor::{
    shell_quote, CommandOutput, ExecutorFactory, LineBuffer, NodeAuth, NodeTarget,
    RemoteExecutor,
};

/// Timeouts and retry behavior for SSH sessions
#[derive(Clone, Debug)]
pub struct SshOptions {
    /// Bound on TCP connect, handshake and authentication
    pub connect_timeout: Duration,
    /// Bound on a single command
    pub command_timeout: Duration,
    /// Close idle sessions after this long
    pub inactivity_timeout: Duration,
    /// Retries for session establishment
    pub connect_retry: RetryPolicy,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            inactivity_timeout: Duration::from_secs(900),
            connect_retry: RetryPolicy::attempts(3),
        }
    }
}

struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    // Nodes are addressed by IP from a desired-state object; there is no
    // known_hosts to check against.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Executor bound to one authenticated SSH session
pub struct SshExecutor {
    host: String,
    session: Handle<ClientHandler>,
    command_timeout: Duration,
}

impl SshExecutor {
    /// Connect and authenticate
    #[instrument(skip(target, options), fields(host = %target.host))]
    pub async fn connect(target: &NodeTarget, options: &SshOptions) -> Result<Self> {
        let host = target.host.clone();
        let session = tokio::time::timeout(options.connect_timeout, open_session(target, options))
            .await
            .map_err(|_| {
                Error::remote(
                    &host,
                    format!("connect timed out after {:?}", options.connect_timeout),
                )
            })??;

        debug!("ssh session established");
        Ok(Self {
            host,
            session,
            command_timeout: options.command_timeout,
        })
    }

    async fn run(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        sinks: Option<(&mpsc::Sender<String>, &mpsc::Sender<String>)>,
    ) -> Result<CommandOutput> {
        let work = async {
            let mut channel = self
                .session
                .channel_open_session()
                .await
                .map_err(|e| self.remote_err(e))?;
            let wrapped = format!("bash -c {}", shell_quote(command));
            channel
                .exec(true, wrapped)
                .await
                .map_err(|e| self.remote_err(e))?;

            if let Some(content) = stdin {
                channel.data(content).await.map_err(|e| self.remote_err(e))?;
                channel.eof().await.map_err(|e| self.remote_err(e))?;
            }

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut out_lines = LineBuffer::default();
            let mut err_lines = LineBuffer::default();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.extend_from_slice(data);
                        if let Some((out, _)) = sinks {
                            for line in out_lines.push(data) {
                                let _ = out.send(line).await;
                            }
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data);
                        if let Some((_, err)) = sinks {
                            for line in err_lines.push(data) {
                                let _ = err.send(line).await;
                            }
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status);
                    }
                    _ => {}
                }
            }

            if let Some((out, err)) = sinks {
                if let Some(line) = out_lines.finish() {
                    let _ = out.send(line).await;
                }
                if let Some(line) = err_lines.finish() {
                    let _ = err.send(line).await;
                }
            }

            let exit_code = exit_code.ok_or_else(|| {
                Error::remote(&self.host, "channel closed without an exit status")
            })?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            })
        };

        tokio::time::timeout(self.command_timeout, work)
            .await
            .map_err(|_| {
                Error::remote(
                    &self.host,
                    format!(
                        "command timed out after {:?}: {}",
                        self.command_timeout,
                        command.lines().next().unwrap_or_default()
                    ),
                )
            })?
    }

    fn remote_err(&self, e: russh::Error) -> Error {
        Error::remote(&self.host, e.to_string())
    }
}

async fn open_session(target: &NodeTarget, options: &SshOptions) -> Result<Handle<ClientHandler>> {
    let config = Config {
        inactivity_timeout: Some(options.inactivity_timeout),
        preferred: Preferred::default(),
        ..<_>::default()
    };

    let host = target.host.as_str();
    let remote = |e: russh::Error| Error::remote(host, e.to_string());

    let mut session = client::connect(Arc::new(config), (host, target.port), ClientHandler)
        .await
        .map_err(remote)?;

    let auth = match &target.auth {
        NodeAuth::Password(password) => session
            .authenticate_password(&target.username, password)
            .await
            .map_err(remote)?,
        NodeAuth::PrivateKey { pem, passphrase } => {
            let key = russh::keys::decode_secret_key(pem, passphrase.as_deref())
                .map_err(|e| Error::validation(format!("private key for {host}: {e}")))?;
            let hash = session.best_supported_rsa_hash().await.map_err(remote)?;
            session
                .authenticate_publickey(
                    &target.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash.flatten()),
                )
                .await
                .map_err(remote)?
        }
    };

    if !auth.success() {
        return Err(Error::remote(
            host,
            format!("authentication failed for user {}", target.username),
        ));
    }
    Ok(session)
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.run(command, None, None).await
    }

    async fn execute_streaming(
        &self,
        command: &str,
        stdout: mpsc::Sender<String>,
        stderr: mpsc::Sender<String>,
    ) -> Result<u32> {
        let output = self.run(command, None, Some((&stdout, &stderr))).await?;
        Ok(output.exit_code)
    }

    async fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()> {
        let path = shell_quote(remote_path);
        let command = format!("mkdir -p \"$(dirname {path})\" && cat > {path}");
        let output = self.run(&command, Some(content), None).await?;
        if !output.success() {
            return Err(Error::remote(
                &self.host,
                format!("writing {remote_path} failed: {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            Error::internal_with_context(
                "ssh-copy",
                format!("reading {}: {e}", local_path.display()),
            )
        })?;
        self.write_file(&content, remote_path).await
    }

    async fn exists(&self, remote_path: &str) -> Result<bool> {
        let output = self
            .run(&format!("test -e {}", shell_quote(remote_path)), None, None)
            .await?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(Error::remote(
                &self.host,
                format!("test -e {remote_path} exited {code}"),
            )),
        }
    }

    fn host_identifier(&self) -> String {
        self.host.clone()
    }
}

/// Opens [`SshExecutor`]s with shared options
#[derive(Clone, Debug, Default)]
pub struct SshExecutorFactory {
    options: SshOptions,
}

impl SshExecutorFactory {
    /// Factory using `options` for every session
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ExecutorFactory for SshExecutorFactory {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn RemoteExecutor>> {
        let operation = format!("ssh-connect {}:{}", target.host, target.port);
        let executor = retry_transient(&self.options.connect_retry, &operation, || {
            SshExecutor::connect(target, &self.options)
        })
        .await?;
        Ok(Arc::new(executor))
    }
}
