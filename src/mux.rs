use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

/// One multiplexed substream; the holder owns and closes it.
pub type TunnelStream = Box<dyn AsyncStream + Unpin + Send>;

/// One multiplexed tunnel session over a single byte stream.
///
/// A driver task pumps the yamux state machine and feeds inbound substreams
/// into a channel; `open_stream`/`accept_stream` are the only operations the
/// rest of the system needs. When the underlying connection dies the driver
/// exits and the session reports closed.
pub struct MuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    closed: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MuxSession {
    /// Server role: the gateway side. Substreams are opened locally and
    /// accepted remotely.
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(tokio_yamux::Session::new_server(
            io,
            tokio_yamux::Config::default(),
        ))
    }

    /// Client role: the agent side.
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(tokio_yamux::Session::new_client(
            io,
            tokio_yamux::Config::default(),
        ))
    }

    fn from_session<T>(mut session: tokio_yamux::Session<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = {
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(next) = session.next().await {
                    match next {
                        Ok(st) => {
                            if tx.send(st).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                closed.store(true, Ordering::Relaxed);
            })
        };

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            closed,
            task,
        }
    }

    pub async fn open_stream(&self) -> anyhow::Result<TunnelStream> {
        if self.is_closed() {
            anyhow::bail!("tunnel: session closed");
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    pub async fn accept_stream(&self) -> anyhow::Result<TunnelStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    /// True once the underlying connection is gone. The liveness probe polls
    /// this to drop dead sessions.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        let _ = ctrl.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn open_and_accept_carry_bytes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(MuxSession::server(a));
        let client = Arc::new(MuxSession::client(b));

        let echo = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut st = client.accept_stream().await.unwrap();
                let mut buf = [0u8; 5];
                st.read_exact(&mut buf).await.unwrap();
                st.write_all(&buf).await.unwrap();
                st.flush().await.unwrap();
            })
        };

        let mut st = server.open_stream().await.unwrap();
        st.write_all(b"hello").await.unwrap();
        st.flush().await.unwrap();
        let mut buf = [0u8; 5];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_observed_by_the_peer() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(MuxSession::server(a));
        let client = Arc::new(MuxSession::client(b));

        assert!(!server.is_closed());

        client.close().await;

        // The server side driver notices the dead transport.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !server.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(server.is_closed());
        assert!(server.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn accept_fails_once_session_is_gone() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(a);
        drop(b);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !server.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(server.accept_stream().await.is_err());
    }
}
