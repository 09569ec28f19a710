use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
};

use crate::{
    datagram::DatagramConn,
    mux::{MuxSession, TunnelStream},
    protocol::{self, HandshakeReq},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub server_addr: String,
}

/// The agent behind NAT: keeps one tunnel to the gateway alive and bridges
/// every substream the gateway opens to a local backend.
pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.client_id.trim().is_empty() {
            anyhow::bail!("client: client_id is required");
        }
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("client: server_addr is required");
        }
        Ok(Self { opts })
    }

    /// Runs until shutdown. Any failure below the accept loop tears the
    /// tunnel down, and a fresh connection is attempted after a fixed
    /// delay; the gateway going away is routine, not fatal.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    tracing::info!(server = %self.opts.server_addr, "client: tunnel closed");
                }
                Err(err) => {
                    tracing::warn!(server = %self.opts.server_addr, err = %err, "client: tunnel failed");
                }
            }

            tracing::info!(
                server = %self.opts.server_addr,
                delay = %humantime::format_duration(RECONNECT_DELAY),
                "client: reconnecting"
            );
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// One tunnel lifetime: dial, handshake, then accept substreams until
    /// the session dies. A clean session end returns Ok; EOF is expected.
    async fn run_once(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut conn = TcpStream::connect(&self.opts.server_addr)
            .await
            .with_context(|| format!("dial {}", self.opts.server_addr))?;

        let req = HandshakeReq {
            client_id: self.opts.client_id.clone(),
        };
        tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::write_handshake(&mut conn, &req))
            .await
            .context("write handshake timed out")??;

        let sess = MuxSession::client(conn);
        tracing::info!(
            server = %self.opts.server_addr,
            client_id = %self.opts.client_id,
            "client: connected"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        sess.close().await;
                        return Ok(());
                    }
                }
                st = sess.accept_stream() => {
                    let Ok(st) = st else {
                        // Session gone; reconnect without alarm.
                        return Ok(());
                    };
                    tokio::spawn(async move {
                        if let Err(err) = handle_stream(st).await {
                            tracing::warn!(err = %err, "client: stream ended");
                        }
                    });
                }
            }
        }
    }
}

/// One substream: read the routing header, dial the named backend, bridge.
pub(crate) async fn handle_stream(mut st: TunnelStream) -> anyhow::Result<()> {
    let pp = protocol::read_proxy_protocol(&mut st)
        .await
        .context("decode pp")?;
    tracing::debug!(
        client_id = %pp.client_id,
        protocol = %pp.internal_protocol,
        backend = %pp.internal_addr(),
        "client: stream opened"
    );

    match pp.internal_protocol.as_str() {
        "tcp" => bridge_tcp(st, &pp.internal_addr()).await,
        "udp" => bridge_udp(st, &pp.internal_addr()).await,
        other => {
            tracing::warn!(protocol = %other, "client: unsupported internal protocol");
            Ok(())
        }
    }
}

async fn bridge_tcp(mut st: TunnelStream, backend: &str) -> anyhow::Result<()> {
    let mut local = TcpStream::connect(backend)
        .await
        .with_context(|| format!("connect to local {backend}"))?;

    let _ = tokio::io::copy_bidirectional(&mut *st, &mut local).await;
    let _ = local.shutdown().await;
    let _ = (&mut *st).shutdown().await;
    Ok(())
}

/// The substream carries length-framed datagrams; the backend socket speaks
/// real datagrams. Each pump converts one direction and dies on the first
/// error, taking its counterpart with it.
async fn bridge_udp(st: TunnelStream, backend: &str) -> anyhow::Result<()> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(backend)
        .await
        .with_context(|| format!("connect to local {backend}"))?;
    let sock = Arc::new(sock);

    let (rd, wr) = tokio::io::split(st);

    let mut to_backend = {
        let sock = sock.clone();
        tokio::spawn(async move {
            let mut rd = DatagramConn::new(rd);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = rd.read_datagram(&mut buf).await?;
                sock.send(&buf[..n]).await?;
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        })
    };

    let mut from_backend = tokio::spawn(async move {
        let mut wr = DatagramConn::new(wr);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = sock.recv(&mut buf).await?;
            if n == 0 {
                continue;
            }
            wr.write_datagram(&buf[..n]).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    // First failure on either side ends the bridge and tears down its
    // counterpart.
    tokio::select! {
        _ = &mut to_backend => { from_backend.abort(); }
        _ = &mut from_backend => { to_backend.abort(); }
    }
    Ok(())
}
