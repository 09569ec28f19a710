use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};

use crate::{protocol, session::SessionManager};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Public-side tunnel server: accepts agent connections, validates the
/// handshake against the allowed-ClientID set, and installs sessions.
pub struct Gateway {
    listen_addr: String,
    allowed: Arc<ArcSwap<HashSet<String>>>,
    sessions: Arc<SessionManager>,
    local_addr: OnceLock<SocketAddr>,
}

impl Gateway {
    pub fn new(listen_addr: String, sessions: Arc<SessionManager>) -> Self {
        Self {
            listen_addr,
            allowed: Arc::new(ArcSwap::from_pointee(HashSet::new())),
            sessions,
            local_addr: OnceLock::new(),
        }
    }

    /// Replaces the allowed set wholesale; in-flight handshakes see either
    /// the old set or the new one, never a partial state.
    pub fn set_allowed_client_ids(&self, client_ids: HashSet<String>) {
        self.allowed.store(Arc::new(client_ids));
    }

    /// Bound address, available once `listen_and_serve` has bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub async fn listen_and_serve(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = TcpListener::bind(self.listen_addr.as_str())
            .await
            .with_context(|| format!("bind tunnel listener {}", self.listen_addr))?;
        if let Ok(addr) = ln.local_addr() {
            let _ = self.local_addr.set(addr);
        }

        tracing::info!(addr = %self.listen_addr, "gateway: listening for tunnel clients");

        let probe = tokio::spawn(check_online_loop(
            self.sessions.clone(),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = res?;
                    let sessions = self.sessions.clone();
                    let allowed = self.allowed.clone();
                    tokio::spawn(async move {
                        handle_conn(sessions, allowed, conn, peer).await;
                    });
                }
            }
        }

        probe.abort();
        Ok(())
    }
}

/// One inbound tunnel connection: handshake, allow-list check, session
/// install. Every failure closes only this connection.
async fn handle_conn(
    sessions: Arc<SessionManager>,
    allowed: Arc<ArcSwap<HashSet<String>>>,
    mut conn: TcpStream,
    peer: SocketAddr,
) {
    let req = match tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::read_handshake(&mut conn))
        .await
    {
        Ok(Ok(req)) => req,
        Ok(Err(err)) => {
            tracing::warn!(peer = %peer, err = %err, "gateway: decode handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "gateway: handshake timed out");
            return;
        }
    };

    if !allowed.load().contains(&req.client_id) {
        tracing::warn!(peer = %peer, client_id = %req.client_id, "gateway: client is not configured");
        return;
    }

    tracing::debug!(peer = %peer, client_id = %req.client_id, "gateway: handshake");

    if let Err(err) = sessions.create_session(&req.client_id, conn).await {
        tracing::warn!(peer = %peer, client_id = %req.client_id, err = %err, "gateway: create session failed");
    }
}

/// Drops sessions whose underlying connection has gone away.
async fn check_online_loop(
    sessions: Arc<SessionManager>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(PROBE_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                sessions
                    .retain(|client_id, sess| {
                        if sess.is_closed() {
                            tracing::info!(client_id = %client_id, "gateway: session is offline");
                            return false;
                        }
                        true
                    })
                    .await;
            }
        }
    }
}
