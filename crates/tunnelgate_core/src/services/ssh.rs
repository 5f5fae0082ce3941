//! russh-backed tunnel transport.
//!
//! One authenticated [`client::Handle`] per session. Each forward binds a
//! local listener and carries every accepted connection over its own
//! `direct-tcpip` channel of that handle.

use crate::error::TunnelError;
use crate::models::{ForwardTarget, KeySource, SshCredentials, TunnelConfig};
use crate::services::tunnel::{ForwardedStream, TunnelConnector, TunnelSession};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use secrecy::ExposeSecret;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

type SshHandle = Arc<client::Handle<SshClientHandler>>;

/// Default bound on opening one channel and on the disconnect handshake.
const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SSH client handler for russh.
struct SshClientHandler {
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.expected_fingerprint else {
            tracing::debug!("No host key fingerprint configured, accepting server key");
            return Ok(true);
        };

        let actual = server_public_key.fingerprint();
        if &actual == expected {
            Ok(true)
        } else {
            tracing::error!(expected = %expected, actual = %actual, "SSH host key mismatch");
            Ok(false)
        }
    }
}

/// Connects to the configured SSH host.
pub struct SshConnector {
    config: TunnelConfig,
    channel_timeout: Duration,
}

impl SshConnector {
    /// Create a connector for the given tunnel configuration.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config, channel_timeout: DEFAULT_CHANNEL_TIMEOUT }
    }

    /// Bound every channel open and the disconnect of sessions from this connector.
    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Authenticate on a freshly connected handle.
    async fn authenticate(&self, handle: &mut client::Handle<SshClientHandler>) -> Result<bool, TunnelError> {
        let username = &self.config.username;

        match &self.config.credentials {
            SshCredentials::Password(password) => handle
                .authenticate_password(username, password.expose_secret())
                .await
                .map_err(|e| TunnelError::auth_with_source("SSH password authentication failed", e)),
            SshCredentials::PrivateKey { key, passphrase } => {
                let key = load_private_key(key, passphrase.as_ref().map(|p| p.expose_secret())).await?;
                handle
                    .authenticate_publickey(username, key)
                    .await
                    .map_err(|e| TunnelError::auth_with_source("SSH key authentication failed", e))
            }
            SshCredentials::Agent => authenticate_with_agent(handle, username).await,
        }
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let address = self.config.address();
        tracing::info!(
            address = %address,
            username = %self.config.username,
            method = self.config.credentials.method_name(),
            "Establishing SSH tunnel"
        );

        let ssh_config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            expected_fingerprint: self.config.host_key_fingerprint.clone(),
        };

        let mut handle =
            client::connect(ssh_config, (self.config.host.as_str(), self.config.port), handler)
                .await
                .map_err(|e| {
                    TunnelError::auth_with_source(
                        format!("Failed to connect to SSH server at {address}"),
                        e,
                    )
                })?;

        if !self.authenticate(&mut handle).await? {
            return Err(TunnelError::auth_with_hint(
                format!("SSH server rejected user '{}'", self.config.username),
                "Check SSH_USERNAME and the configured credentials",
            ));
        }

        tracing::info!(address = %address, "SSH authentication successful");

        Ok(Arc::new(SshSession {
            handle: Arc::new(handle),
            channel_timeout: self.channel_timeout,
            cancel_token: CancellationToken::new(),
        }))
    }
}

/// An authenticated russh session.
pub struct SshSession {
    handle: SshHandle,
    channel_timeout: Duration,
    cancel_token: CancellationToken,
}

#[async_trait]
impl TunnelSession for SshSession {
    fn is_healthy(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.handle.is_closed()
    }

    async fn open_forward(
        &self,
        local_bind: SocketAddr,
        target: &ForwardTarget,
    ) -> Result<ForwardedStream, TunnelError> {
        if self.cancel_token.is_cancelled() {
            return Err(TunnelError::Closed);
        }

        let listener = TcpListener::bind(local_bind).await.map_err(|e| {
            TunnelError::forward_with_source(
                target.to_string(),
                format!("failed to bind local endpoint {local_bind}"),
                e,
            )
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            TunnelError::forward_with_source(target.to_string(), "failed to read local address", e)
        })?;

        // Surface a refusing or firewalled target now rather than on first query.
        let check = open_channel(&self.handle, target, local_addr, self.channel_timeout).await?;
        if let Err(e) = check.close().await {
            tracing::debug!(error = %e, "Failed to close reachability check channel");
        }

        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(run_forward(
            listener,
            self.handle.clone(),
            target.clone(),
            self.channel_timeout,
            cancel_token.clone(),
        ));

        tracing::info!(local_addr = %local_addr, target = %target, "SSH forward listening");
        Ok(ForwardedStream::new(local_addr, target.clone(), cancel_token))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.cancel_token.is_cancelled() {
            return Ok(());
        }
        self.cancel_token.cancel();

        if self.handle.is_closed() {
            return Ok(());
        }
        bounded("disconnect", self.channel_timeout, async {
            self.handle
                .disconnect(russh::Disconnect::ByApplication, "idle", "en")
                .await
                .map_err(|e| TunnelError::session_with_source("Failed to disconnect SSH session", e))
        })
        .await
    }
}

/// Run `operation`, failing with [`TunnelError::Timeout`] after `limit`.
async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, TunnelError>>,
) -> Result<T, TunnelError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| TunnelError::timeout(operation, limit))?
}

/// Open a `direct-tcpip` channel to `target`.
async fn open_channel(
    handle: &client::Handle<SshClientHandler>,
    target: &ForwardTarget,
    origin: SocketAddr,
    limit: Duration,
) -> Result<russh::Channel<client::Msg>, TunnelError> {
    bounded("channel open", limit, async {
        handle
            .channel_open_direct_tcpip(
                target.host.as_str(),
                target.port as u32,
                origin.ip().to_string(),
                origin.port() as u32,
            )
            .await
            .map_err(|e| {
                TunnelError::forward_with_source(
                    target.to_string(),
                    "remote side refused the channel",
                    e,
                )
            })
    })
    .await
}

/// Load a private key from inline text or a file.
async fn load_private_key(
    source: &KeySource,
    passphrase: Option<&str>,
) -> Result<Arc<KeyPair>, TunnelError> {
    let key = match source {
        KeySource::Inline(pem) => russh_keys::decode_secret_key(pem.expose_secret(), passphrase),
        KeySource::File(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                TunnelError::auth_with_source(
                    format!("Failed to read SSH key file {}", path.display()),
                    e,
                )
            })?;
            russh_keys::decode_secret_key(&text, passphrase)
        }
    };

    key.map(Arc::new).map_err(|e| {
        if passphrase.is_some() {
            TunnelError::auth_with_source("Failed to decrypt SSH key; check SSH_KEY_PASSPHRASE", e)
        } else {
            TunnelError::auth_with_source("Failed to parse SSH key; it may need a passphrase", e)
        }
    })
}

/// Authenticate with identities from the local SSH agent.
#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
) -> Result<bool, TunnelError> {
    use russh_keys::agent::client::AgentClient;
    use tokio::net::UnixStream;

    let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
        TunnelError::auth_with_hint(
            "SSH agent not available (SSH_AUTH_SOCK not set)",
            "Start an agent with: eval $(ssh-agent)",
        )
    })?;

    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| TunnelError::auth_with_source("Failed to connect to SSH agent", e))?;

    let mut agent = AgentClient::connect(stream);
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| TunnelError::auth_with_source("Failed to list SSH agent identities", e))?;

    if identities.is_empty() {
        return Err(TunnelError::auth_with_hint(
            "No identities available in SSH agent",
            "Add a key to the agent with: ssh-add",
        ));
    }

    for identity in identities {
        let (returned_agent, result) = handle.authenticate_future(username, identity, agent).await;
        agent = returned_agent;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
            Err(e) => tracing::debug!(error = %e, "SSH agent signing failed, trying next"),
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut client::Handle<SshClientHandler>,
    _username: &str,
) -> Result<bool, TunnelError> {
    Err(TunnelError::auth_with_hint(
        "SSH agent authentication is only supported on Unix",
        "Use SSH_PASSWORD or SSH_PRIVATE_KEY_PATH instead",
    ))
}

/// Accept local connections until the forward is stopped.
async fn run_forward(
    listener: TcpListener,
    handle: SshHandle,
    target: ForwardTarget,
    channel_timeout: Duration,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((local_stream, peer_addr)) => {
                    tracing::trace!(peer = %peer_addr, target = %target, "Forwarding connection");
                    let handle = handle.clone();
                    let target = target.clone();
                    let cancel = cancel_token.clone();
                    tokio::spawn(async move {
                        let forwarded = forward_connection(
                            local_stream,
                            peer_addr,
                            &handle,
                            &target,
                            channel_timeout,
                            cancel,
                        );
                        if let Err(e) = forwarded.await {
                            tracing::warn!(error = %e, "Tunnel forwarding error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept tunnel connection");
                    if !accept_backoff(&cancel_token).await {
                        tracing::debug!(target = %target, "Forward accept loop stopped");
                        break;
                    }
                }
            },
            _ = cancel_token.cancelled() => {
                tracing::debug!(target = %target, "Forward accept loop stopped");
                break;
            }
        }
    }
}

/// Wait out [`ACCEPT_BACKOFF`]. Returns `false` if the forward was stopped meanwhile.
async fn accept_backoff(cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        _ = cancel_token.cancelled() => false,
    }
}

/// Pump bytes between one local connection and its channel.
async fn forward_connection(
    mut local_stream: TcpStream,
    peer_addr: SocketAddr,
    handle: &client::Handle<SshClientHandler>,
    target: &ForwardTarget,
    channel_timeout: Duration,
    cancel_token: CancellationToken,
) -> Result<(), TunnelError> {
    let channel = open_channel(handle, target, peer_addr, channel_timeout).await?;
    let mut channel = channel.into_stream();
    let mut buf_local = [0u8; 8192];
    let mut buf_remote = [0u8; 8192];

    loop {
        tokio::select! {
            n = local_stream.read(&mut buf_local) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if channel.write_all(&buf_local[..n]).await.is_err() {
                        break;
                    }
                }
            },
            n = channel.read(&mut buf_remote) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}
