//! Client tunnel session ownership
//!
//! `SessionHandle` is the read side every SOCKS5 connection snapshots at
//! start. `SessionSupervisor` is the only writer: it publishes a new session
//! after a reconnect or a configuration change. A published session is never
//! mutated; replacing it leaves relays on the old one untouched.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use tunnelmux_network::{SessionDialer, TunnelSession};

use crate::{ClientError, ReconnectPolicy, Result};

/// Shared pointer to the current client session
#[derive(Clone)]
pub struct SessionHandle {
    tx: Arc<watch::Sender<Arc<dyn TunnelSession>>>,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn TunnelSession>) -> Self {
        let (tx, _rx) = watch::channel(session);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the session new connections should use
    pub fn current(&self) -> Arc<dyn TunnelSession> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, session: Arc<dyn TunnelSession>) {
        self.tx.send_replace(session);
    }

    /// Receiver notified whenever a new session is published
    pub fn subscribe(&self) -> watch::Receiver<Arc<dyn TunnelSession>> {
        self.tx.subscribe()
    }
}

/// Keeps the client's session alive according to a `ReconnectPolicy`
pub struct SessionSupervisor {
    dialer: Arc<dyn SessionDialer>,
    policy: Box<dyn ReconnectPolicy>,
    handle: SessionHandle,
    dialer_updates: Option<watch::Receiver<Arc<dyn SessionDialer>>>,
}

impl SessionSupervisor {
    /// Dial the first session. Failure here is fatal to the caller; the
    /// policy only governs sessions lost later.
    pub async fn connect(
        dialer: Arc<dyn SessionDialer>,
        policy: Box<dyn ReconnectPolicy>,
    ) -> Result<Self> {
        let session = dialer.dial().await?;
        info!("Connected to tunnel server {}", dialer.remote());
        Ok(Self {
            dialer,
            policy,
            handle: SessionHandle::new(session),
            dialer_updates: None,
        })
    }

    /// Redial with a new dialer whenever one is published on `updates`
    pub fn with_dialer_updates(mut self, updates: watch::Receiver<Arc<dyn SessionDialer>>) -> Self {
        self.dialer_updates = Some(updates);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Supervise until the policy gives up and no new dialer can arrive.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let current = self.handle.current();
            tokio::select! {
                _ = current.closed() => {
                    warn!("Tunnel session with {} lost", current.remote_id());
                    if let Err(exhausted) = self.reconnect().await {
                        if !self.await_new_dialer().await {
                            return Err(exhausted);
                        }
                    }
                }
                update = next_dialer(&mut self.dialer_updates) => match update {
                    Some(dialer) => self.switch_dialer(dialer).await,
                    None => self.dialer_updates = None,
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let mut attempt = 1;
        while let Some(delay) = self.policy.next_delay(attempt) {
            tokio::time::sleep(delay).await;
            match self.dialer.dial().await {
                Ok(session) => {
                    info!(
                        "Reconnected to {} after {} attempt(s)",
                        self.dialer.remote(),
                        attempt
                    );
                    self.handle.replace(session);
                    return Ok(());
                }
                Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt, self.dialer.remote(), e),
            }
            attempt += 1;
        }
        warn!("Giving up on tunnel server {}", self.dialer.remote());
        Err(ClientError::ReconnectExhausted(attempt - 1))
    }

    /// After the policy gave up, park until a published dialer yields a live
    /// session. Returns false once no further dialers can arrive.
    async fn await_new_dialer(&mut self) -> bool {
        if self.dialer_updates.is_some() {
            info!("Waiting for new tunnel settings");
        }
        while self.dialer_updates.is_some() {
            match next_dialer(&mut self.dialer_updates).await {
                Some(dialer) => {
                    self.switch_dialer(dialer).await;
                    if !self.handle.current().is_closed() {
                        return true;
                    }
                }
                None => self.dialer_updates = None,
            }
        }
        false
    }

    async fn switch_dialer(&mut self, dialer: Arc<dyn SessionDialer>) {
        info!("Tunnel server changed to {}", dialer.remote());
        match dialer.dial().await {
            Ok(session) => {
                self.dialer = dialer;
                self.handle.replace(session);
            }
            Err(e) => warn!("Keeping current session, dial to {} failed: {}", dialer.remote(), e),
        }
    }
}

async fn next_dialer(
    updates: &mut Option<watch::Receiver<Arc<dyn SessionDialer>>>,
) -> Option<Arc<dyn SessionDialer>> {
    match updates {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tunnelmux_network::memory::memory_transport;
    use tunnelmux_network::SessionAcceptor;

    use crate::{FixedRetries, NeverReconnect};

    #[tokio::test]
    async fn test_handle_replace() {
        let (dialer, mut acceptor) = memory_transport("handle");
        let first = dialer.dial().await.unwrap();
        let _first_server = acceptor.accept().await.unwrap();
        let second = dialer.dial().await.unwrap();

        let handle = SessionHandle::new(first.clone());
        let mut rx = handle.subscribe();
        assert!(Arc::ptr_eq(&handle.current(), &first));

        handle.replace(second.clone());
        rx.changed().await.unwrap();
        assert!(Arc::ptr_eq(&handle.current(), &second));
    }

    #[tokio::test]
    async fn test_supervisor_reconnects_after_loss() {
        let (dialer, mut acceptor) = memory_transport("reconnect");
        let dialer = Arc::new(dialer);

        let supervisor = SessionSupervisor::connect(
            dialer.clone(),
            Box::new(FixedRetries {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            }),
        )
        .await
        .unwrap();
        let handle = supervisor.handle();
        let mut updates = handle.subscribe();
        let _server = acceptor.accept().await.unwrap();

        let first = handle.current();
        tokio::spawn(supervisor.run());
        first.close();

        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .expect("supervisor should publish a new session")
            .unwrap();
        let second = handle.current();
        assert!(!second.is_closed());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_supervisor_gives_up() {
        let (dialer, _acceptor) = memory_transport("never");
        let supervisor = SessionSupervisor::connect(Arc::new(dialer), Box::new(NeverReconnect))
            .await
            .unwrap();
        let handle = supervisor.handle();
        handle.current().close();

        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .expect("supervisor should stop");
        assert!(matches!(result, Err(ClientError::ReconnectExhausted(0))));
        assert!(handle.current().is_closed());
    }

    #[tokio::test]
    async fn test_exhausted_supervisor_recovers_on_new_dialer() {
        let (first_dialer, _first_acceptor) = memory_transport("lost");
        let (second_dialer, mut second_acceptor) = memory_transport("fixed");

        let initial: Arc<dyn SessionDialer> = Arc::new(first_dialer);
        let (tx, rx) = watch::channel(initial.clone());
        let supervisor = SessionSupervisor::connect(initial, Box::new(NeverReconnect))
            .await
            .unwrap()
            .with_dialer_updates(rx);
        let handle = supervisor.handle();
        let mut updates = handle.subscribe();
        let task = tokio::spawn(supervisor.run());

        handle.current().close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert!(handle.current().is_closed());

        tx.send(Arc::new(second_dialer)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .expect("supervisor should dial the new settings")
            .unwrap();
        let recovered = handle.current();
        assert!(!recovered.is_closed());
        assert_eq!(recovered.remote_id(), "fixed/server");
        assert!(second_acceptor.accept().await.is_ok());

        // Supervision resumes: a second loss is handled the same way
        recovered.close();
        drop(tx);
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("supervisor should stop once no settings can arrive")
            .unwrap();
        assert!(matches!(result, Err(ClientError::ReconnectExhausted(0))));
    }

    #[tokio::test]
    async fn test_supervisor_switches_dialer() {
        let (first_dialer, _first_acceptor) = memory_transport("old");
        let (second_dialer, mut second_acceptor) = memory_transport("new");

        let initial: Arc<dyn SessionDialer> = Arc::new(first_dialer);
        let (tx, rx) = watch::channel(initial.clone());
        let supervisor = SessionSupervisor::connect(initial, Box::new(NeverReconnect))
            .await
            .unwrap()
            .with_dialer_updates(rx);
        let handle = supervisor.handle();
        let mut updates = handle.subscribe();
        let old = handle.current();
        tokio::spawn(supervisor.run());

        tx.send(Arc::new(second_dialer)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .expect("supervisor should switch")
            .unwrap();

        assert_eq!(handle.current().remote_id(), "new/server");
        assert!(!old.is_closed());
        assert!(second_acceptor.accept().await.is_ok());
    }
}
