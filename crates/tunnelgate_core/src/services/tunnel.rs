//! Secure tunnel: one authenticated session shared by every forwarded stream.
//!
//! [`SecureTunnel`] owns at most one [`TunnelSession`] and drives it through
//! the [`TunnelPhase`] state machine. The transport itself sits behind the
//! [`TunnelConnector`] trait; [`crate::services::ssh::SshConnector`] is the
//! russh implementation.

use crate::error::TunnelError;
use crate::models::{ForwardTarget, GatewaySettings, TunnelPhase};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Establishes authenticated sessions.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Connect and authenticate a new session.
    async fn connect(&self) -> Result<Arc<dyn TunnelSession>, TunnelError>;
}

/// A live authenticated session.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Whether the underlying transport is still open.
    fn is_healthy(&self) -> bool;

    /// Listen on `local_bind` and forward every accepted connection to
    /// `target` through this session.
    async fn open_forward(
        &self,
        local_bind: SocketAddr,
        target: &ForwardTarget,
    ) -> Result<ForwardedStream, TunnelError>;

    /// Terminate the session and every forward derived from it.
    ///
    /// Calling this on an already-closed session is a no-op.
    async fn close(&self) -> Result<(), TunnelError>;
}

/// Local endpoint whose connections are carried to one remote target.
///
/// Dropping the stream stops its accept loop and every channel it opened.
#[derive(Debug)]
pub struct ForwardedStream {
    local_addr: SocketAddr,
    target: ForwardTarget,
    cancel_token: CancellationToken,
}

impl ForwardedStream {
    /// Wrap a running forward.
    pub fn new(local_addr: SocketAddr, target: ForwardTarget, cancel_token: CancellationToken) -> Self {
        Self { local_addr, target, cancel_token }
    }

    /// Address drivers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint this stream reaches.
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Stop forwarding.
    pub fn stop(&self) {
        if !self.cancel_token.is_cancelled() {
            self.cancel_token.cancel();
            tracing::debug!(local_addr = %self.local_addr, target = %self.target, "Forward stopped");
        }
    }

    /// Check if the forward was stopped, directly or by closing its session.
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ForwardedStream {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Holder of the single process-wide tunnel session.
///
/// Not internally synchronized: the pool registry serializes every call under
/// its own lock. The current phase is readable without that lock.
pub struct SecureTunnel {
    connector: Arc<dyn TunnelConnector>,
    session: Option<Arc<dyn TunnelSession>>,
    phase: Arc<RwLock<TunnelPhase>>,
    auth_timeout: Duration,
    forward_timeout: Duration,
    local_bind: SocketAddr,
}

impl SecureTunnel {
    /// Create an idle tunnel.
    pub fn new(connector: Arc<dyn TunnelConnector>, settings: &GatewaySettings) -> Self {
        Self {
            connector,
            session: None,
            phase: Arc::new(RwLock::new(TunnelPhase::Idle)),
            auth_timeout: settings.auth_timeout,
            forward_timeout: settings.forward_timeout,
            local_bind: settings.local_bind,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> TunnelPhase {
        *self.phase.read()
    }

    /// Shared view of the phase, readable without the registry lock.
    pub(crate) fn phase_handle(&self) -> Arc<RwLock<TunnelPhase>> {
        self.phase.clone()
    }

    /// Whether a session is held and reports healthy.
    pub fn is_healthy(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_healthy())
    }

    fn set_phase(&self, phase: TunnelPhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), phase);
        if previous != phase {
            tracing::trace!(from = %previous, to = %phase, "Tunnel phase changed");
        }
    }

    /// Return the live session, authenticating a new one if needed.
    pub async fn ensure_connected(&mut self) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        if let Some(session) = &self.session {
            if session.is_healthy() {
                return Ok(session.clone());
            }
            tracing::warn!("SSH session is no longer healthy, replacing it");
            self.close().await;
        }

        self.set_phase(TunnelPhase::Connecting);
        let started = std::time::Instant::now();

        match tokio::time::timeout(self.auth_timeout, self.connector.connect()).await {
            Ok(Ok(session)) => {
                self.session = Some(session.clone());
                self.set_phase(TunnelPhase::Ready);
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "SSH tunnel ready");
                Ok(session)
            }
            Ok(Err(e)) => {
                self.set_phase(TunnelPhase::Idle);
                tracing::warn!(error = %e, "SSH tunnel authentication failed");
                Err(e)
            }
            Err(_) => {
                self.set_phase(TunnelPhase::Idle);
                tracing::warn!(
                    timeout_ms = self.auth_timeout.as_millis() as u64,
                    "SSH tunnel authentication timed out"
                );
                Err(TunnelError::timeout("authentication", self.auth_timeout))
            }
        }
    }

    /// Open a forward to `target` over the current session.
    pub async fn open_forward(
        &mut self,
        target: &ForwardTarget,
    ) -> Result<ForwardedStream, TunnelError> {
        let session = self.ensure_connected().await?;

        match tokio::time::timeout(
            self.forward_timeout,
            session.open_forward(self.local_bind, target),
        )
        .await
        {
            Ok(Ok(stream)) => {
                tracing::debug!(
                    local_addr = %stream.local_addr(),
                    target = %target,
                    "Forward opened"
                );
                Ok(stream)
            }
            Ok(Err(e)) => {
                tracing::warn!(target = %target, error = %e, "Forward setup failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(target = %target, "Forward setup timed out");
                Err(TunnelError::timeout("forward setup", self.forward_timeout))
            }
        }
    }

    /// Terminate the session. Idempotent and best-effort: a failing or stalled
    /// close is logged and the session is discarded anyway.
    ///
    /// Bounded by the forward timeout, since callers hold the registry lock.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            self.set_phase(TunnelPhase::Idle);
            return;
        };

        self.set_phase(TunnelPhase::Closing);
        match tokio::time::timeout(self.forward_timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Suppressed error while closing SSH session"),
            Err(_) => tracing::warn!(
                timeout_ms = self.forward_timeout.as_millis() as u64,
                "SSH session close timed out, discarding it"
            ),
        }
        self.set_phase(TunnelPhase::Idle);
        tracing::info!("SSH tunnel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;

    fn target() -> ForwardTarget {
        ForwardTarget { host: "10.0.0.5".to_string(), port: 5432 }
    }

    #[tokio::test]
    async fn test_ensure_connected_reuses_healthy_session() {
        let connector = FakeConnector::new();
        let mut tunnel = SecureTunnel::new(connector.clone(), &GatewaySettings::default());
        assert_eq!(tunnel.phase(), TunnelPhase::Idle);

        let first = tunnel.ensure_connected().await.unwrap();
        let second = tunnel.ensure_connected().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
        assert_eq!(tunnel.phase(), TunnelPhase::Ready);
    }

    #[tokio::test]
    async fn test_unhealthy_session_is_replaced() {
        let connector = FakeConnector::new();
        let mut tunnel = SecureTunnel::new(connector.clone(), &GatewaySettings::default());

        tunnel.ensure_connected().await.unwrap();
        connector.break_sessions();
        assert!(!tunnel.is_healthy());

        tunnel.ensure_connected().await.unwrap();
        assert_eq!(connector.connects(), 2);
        assert!(tunnel.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_authentication_returns_to_idle() {
        let connector = FakeConnector::new();
        connector.fail_auth(true);
        let mut tunnel = SecureTunnel::new(connector.clone(), &GatewaySettings::default());

        let err = tunnel.ensure_connected().await.err().unwrap();

        assert!(matches!(err, TunnelError::Auth { .. }));
        assert_eq!(tunnel.phase(), TunnelPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_is_bounded() {
        let connector = FakeConnector::new();
        connector.set_connect_delay(Duration::from_secs(60));
        let settings = GatewaySettings { auth_timeout: Duration::from_secs(2), ..Default::default() };
        let mut tunnel = SecureTunnel::new(connector, &settings);

        let err = tunnel.ensure_connected().await.err().unwrap();

        assert!(matches!(err, TunnelError::Timeout { operation: "authentication", .. }));
        assert_eq!(tunnel.phase(), TunnelPhase::Idle);
    }

    #[tokio::test]
    async fn test_refused_forward_surfaces_forward_error() {
        let connector = FakeConnector::new();
        connector.refuse_forwards(true);
        let mut tunnel = SecureTunnel::new(connector, &GatewaySettings::default());

        let err = tunnel.open_forward(&target()).await.unwrap_err();

        assert!(matches!(err, TunnelError::Forward { .. }));
        assert_eq!(tunnel.phase(), TunnelPhase::Ready);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_forwards() {
        let connector = FakeConnector::new();
        let mut tunnel = SecureTunnel::new(connector.clone(), &GatewaySettings::default());
        let stream = tunnel.open_forward(&target()).await.unwrap();
        assert!(!stream.is_stopped());

        tunnel.close().await;
        tunnel.close().await;

        assert!(stream.is_stopped());
        assert_eq!(connector.closes(), 1);
        assert_eq!(tunnel.phase(), TunnelPhase::Idle);
    }

    #[tokio::test]
    async fn test_close_discards_session_even_when_close_fails() {
        let connector = FakeConnector::new();
        connector.fail_close(true);
        let mut tunnel = SecureTunnel::new(connector.clone(), &GatewaySettings::default());
        tunnel.ensure_connected().await.unwrap();

        tunnel.close().await;

        assert_eq!(tunnel.phase(), TunnelPhase::Idle);
        assert!(!tunnel.is_healthy());
        tunnel.ensure_connected().await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_close_is_bounded() {
        let connector = FakeConnector::new();
        connector.hang_close(true);
        let settings = GatewaySettings { forward_timeout: Duration::from_secs(3), ..Default::default() };
        let mut tunnel = SecureTunnel::new(connector.clone(), &settings);
        let stream = tunnel.open_forward(&target()).await.unwrap();

        let started = tokio::time::Instant::now();
        tunnel.close().await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(stream.is_stopped());
        assert_eq!(tunnel.phase(), TunnelPhase::Idle);
        tunnel.ensure_connected().await.unwrap();
        assert_eq!(connector.connects(), 2);
    }
}
