//! Exit server
//!
//! Two nested accept loops: sessions from the listener, then streams from
//! each session. Every stream gets its own task, so a loop ending never
//! touches relays already running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tunnelmux_core::TunnelError;
use tunnelmux_network::{NetworkError, SessionAcceptor, TunnelSession};

use crate::{dispatch_stream, ExitError, ExitStats, Result};

/// Exit node configuration
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Destination TCP connect timeout
    pub dial_timeout: Duration,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Exit server
pub struct ExitServer {
    config: ExitConfig,
    config_updates: Option<watch::Receiver<ExitConfig>>,
    stats: Arc<ExitStats>,
}

impl ExitServer {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            config,
            config_updates: None,
            stats: Arc::new(ExitStats::new()),
        }
    }

    /// Take the configuration for each new session from `updates`.
    /// Sessions already running keep the configuration they started with.
    pub fn with_config_updates(mut self, updates: watch::Receiver<ExitConfig>) -> Self {
        self.config_updates = Some(updates);
        self
    }

    /// Configuration the next accepted session will use
    pub fn config(&self) -> ExitConfig {
        match &self.config_updates {
            Some(updates) => updates.borrow().clone(),
            None => self.config.clone(),
        }
    }

    pub fn stats(&self) -> Arc<ExitStats> {
        self.stats.clone()
    }

    /// Serve every session `acceptor` yields.
    ///
    /// Returns `Ok` once the listener closes.
    pub async fn run<A: SessionAcceptor>(&self, mut acceptor: A) -> Result<()> {
        info!("Exit server accepting sessions on {}", acceptor.local_addr());
        loop {
            let session = match acceptor.accept().await {
                Ok(session) => session,
                Err(NetworkError::ListenerClosed) => {
                    info!("Exit listener on {} closed", acceptor.local_addr());
                    return Ok(());
                }
                Err(e) => return Err(ExitError::Network(e)),
            };

            self.stats.session_accepted();
            info!("Tunnel session from {} accepted", session.remote_id());
            tokio::spawn(serve_session(session, self.config(), self.stats.clone()));
        }
    }
}

/// Accept streams on one session until it terminates
pub async fn serve_session(session: Arc<dyn TunnelSession>, config: ExitConfig, stats: Arc<ExitStats>) {
    let remote = session.remote_id();
    let config = Arc::new(config);

    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(NetworkError::SessionTerminated) => break,
            Err(e) => {
                warn!("Accept on session {} failed: {}", remote, e);
                break;
            }
        };

        stats.stream_accepted();
        let config = config.clone();
        let stats = stats.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            let stream_id = stream.id();
            match dispatch_stream(stream, &config, &stats).await {
                Ok(_) => {}
                Err(ExitError::Tunnel(e @ TunnelError::MalformedAddress(_))) => {
                    warn!("Stream {} from {} sent a bad header: {}", stream_id, remote, e)
                }
                Err(e) => debug!("Stream {} from {} ended: {}", stream_id, remote, e),
            }
        });
    }

    info!("Tunnel session from {} ended", remote);
}
