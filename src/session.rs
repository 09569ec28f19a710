use std::{collections::HashMap, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::mux::{MuxSession, TunnelStream};

/// One registered tunnel client: its ID and the multiplexed connection.
pub struct Session {
    pub client_id: String,
    mux: Arc<MuxSession>,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }
}

/// ClientID -> live tunnel session. At most one session per ClientID; a
/// second handshake with the same ID is rejected while the first is alive.
///
/// All operations are serialized by the one table mutex. Entries are only
/// removed by `retain`, which the gateway's liveness probe drives.
pub struct SessionManager {
    sessions: tokio::sync::Mutex<HashMap<String, Session>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Installs a server-role multiplexed session over `conn`.
    ///
    /// The duplicate check runs before any multiplexing state is built, so a
    /// rejected connection leaves nothing behind and the existing session
    /// keeps running.
    pub async fn create_session<T>(&self, client_id: &str, conn: T) -> anyhow::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(client_id) {
            anyhow::bail!("client {client_id} is already online");
        }

        sessions.insert(
            client_id.to_string(),
            Session {
                client_id: client_id.to_string(),
                mux: Arc::new(MuxSession::server(conn)),
            },
        );
        Ok(())
    }

    /// Opens a fresh substream on `client_id`'s session. The caller owns the
    /// stream and must close it.
    pub async fn open_stream(&self, client_id: &str) -> anyhow::Result<TunnelStream> {
        let sessions = self.sessions.lock().await;
        let sess = sessions
            .get(client_id)
            .ok_or_else(|| anyhow::anyhow!("client {client_id} not connected"))?;
        sess.mux.open_stream().await
    }

    /// Iterates entries under the table mutex, dropping those for which `f`
    /// returns false.
    pub async fn retain(&self, mut f: impl FnMut(&str, &Session) -> bool) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|id, sess| f(id, sess));
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.sessions.lock().await.contains_key(client_id)
    }
}
