use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream, UdpSocket},
    time::Instant,
};

use crate::{
    config::ListenerConfig,
    datagram::{DatagramConn, MAX_DATAGRAM_BYTES},
    http_route::RouteRegistry,
    mux::TunnelStream,
    protocol::{self, ProxyProtocol},
    session::SessionManager,
};

const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// How long a UDP flow may stay silent before it is evicted.
    pub udp_idle_timeout: Duration,
    /// How often idle flows are swept.
    pub udp_sweep_interval: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            udp_idle_timeout: Duration::from_secs(30),
            udp_sweep_interval: Duration::from_secs(10),
        }
    }
}

/// One serving public endpoint. Owns its socket through the serve task;
/// closing aborts the task, which drops the socket and refuses new traffic.
/// `close` is idempotent; a closed Listener never serves again.
pub struct Listener {
    id: String,
    local_addr: SocketAddr,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop: tokio::sync::watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Listener {
    /// Binds the public socket and starts serving. Bind and route-adapter
    /// errors surface here so startup can treat them as fatal while the
    /// watcher merely logs them.
    pub async fn start(
        cfg: ListenerConfig,
        sessions: Arc<SessionManager>,
        routes: &RouteRegistry,
        opts: ListenerOptions,
    ) -> anyhow::Result<Listener> {
        let bind = cfg.public_bind_addr();
        let pp = proxy_protocol_for(&cfg);
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

        let (local_addr, task) = match cfg.public_protocol.as_str() {
            "tcp" | "http" | "https" => {
                if cfg.public_protocol != "tcp" {
                    install_http_route(&cfg, routes).await?;
                }

                let ln = TcpListener::bind(&bind)
                    .await
                    .with_context(|| format!("listener {}: bind tcp {bind}", cfg.id))?;
                let local_addr = ln.local_addr()?;
                let id = cfg.id.clone();
                let task = tokio::spawn(async move {
                    if let Err(err) = serve_tcp(ln, pp, sessions, stop_rx).await {
                        tracing::warn!(id = %id, err = %err, "listener: tcp serve ended");
                    }
                });
                (local_addr, task)
            }
            "udp" => {
                let sock = UdpSocket::bind(&bind)
                    .await
                    .with_context(|| format!("listener {}: bind udp {bind}", cfg.id))?;
                let local_addr = sock.local_addr()?;
                let id = cfg.id.clone();
                let task = tokio::spawn(async move {
                    if let Err(err) = serve_udp(sock, pp, sessions, opts, stop_rx).await {
                        tracing::warn!(id = %id, err = %err, "listener: udp serve ended");
                    }
                });
                (local_addr, task)
            }
            other => anyhow::bail!("listener {}: unsupported public protocol {other}", cfg.id),
        };

        tracing::info!(
            id = %cfg.id,
            protocol = %cfg.public_protocol,
            addr = %local_addr,
            client_id = %cfg.client_id,
            "listener: serving"
        );

        Ok(Listener {
            id: cfg.id,
            local_addr,
            task: tokio::sync::Mutex::new(Some(task)),
            stop: stop_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops serving and releases the public socket. Idempotent; returns
    /// once the socket is guaranteed closed so the address is free to
    /// rebind.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        tracing::info!(id = %self.id, addr = %self.local_addr, "listener: closed");
    }
}

fn proxy_protocol_for(cfg: &ListenerConfig) -> ProxyProtocol {
    ProxyProtocol {
        client_id: cfg.client_id.clone(),
        public_protocol: cfg.public_protocol.clone(),
        public_ip: cfg.public_ip.clone(),
        public_port: cfg.public_port,
        internal_protocol: cfg.internal_protocol.clone(),
        internal_ip: cfg.internal_ip.clone(),
        internal_port: cfg.internal_port,
    }
}

/// http/https endpoints are plain TCP here; TLS and HTTP routing live in
/// the external router, which gets one route rule per listener.
async fn install_http_route(cfg: &ListenerConfig, routes: &RouteRegistry) -> anyhow::Result<()> {
    let Some(route_type) = cfg.http_route_type.as_deref() else {
        return Ok(());
    };
    let route = routes
        .get(route_type)
        .with_context(|| format!("listener {}: route type {route_type} not configured", cfg.id))?;
    let params = cfg
        .http_param
        .clone()
        .with_context(|| format!("listener {}: http_param is required", cfg.id))?;
    route
        .update_route(&params)
        .await
        .with_context(|| format!("listener {}: update route", cfg.id))
}

async fn serve_tcp(
    ln: TcpListener,
    pp: ProxyProtocol,
    sessions: Arc<SessionManager>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let pp = pp.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_conn(conn, pp, sessions).await {
                        tracing::warn!(peer = %peer, err = %err, "listener: tcp conn ended");
                    }
                });
            }
        }
    }
    Ok(())
}

/// Bridges one external TCP connection over a fresh substream. The
/// ProxyProtocol frame goes first; after that it is plain byte splicing
/// with cross-shutdown.
async fn handle_tcp_conn(
    mut conn: TcpStream,
    pp: ProxyProtocol,
    sessions: Arc<SessionManager>,
) -> anyhow::Result<()> {
    let mut st = sessions
        .open_stream(&pp.client_id)
        .await
        .with_context(|| format!("get session for client {}", pp.client_id))?;

    tokio::time::timeout(WRITE_TIMEOUT, protocol::write_proxy_protocol(&mut st, &pp))
        .await
        .context("write pp timed out")??;

    let _ = tokio::io::copy_bidirectional(&mut conn, &mut *st).await;
    let _ = conn.shutdown().await;
    let _ = (&mut *st).shutdown().await;
    Ok(())
}

/// One NAT-style connection-tracking entry: a remote source address bound
/// to its own substream for the flow's lifetime.
struct UdpFlow {
    wr: DatagramConn<WriteHalf<TunnelStream>>,
    reader: tokio::task::JoinHandle<()>,
    last_active: Instant,
}

impl UdpFlow {
    fn close(self) {
        // Aborting the reader drops the read half; the write half goes with
        // the entry, which closes the substream.
        self.reader.abort();
    }
}

async fn serve_udp(
    sock: UdpSocket,
    pp: ProxyProtocol,
    sessions: Arc<SessionManager>,
    opts: ListenerOptions,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sock = Arc::new(sock);
    let mut flows: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut sweep = tokio::time::interval(opts.udp_sweep_interval);
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let dead: Vec<SocketAddr> = flows
                    .iter()
                    .filter(|(_, f)| now.duration_since(f.last_active) > opts.udp_idle_timeout)
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in dead {
                    if let Some(f) = flows.remove(&peer) {
                        tracing::debug!(peer = %peer, "listener: udp flow idle, evicting");
                        f.close();
                    }
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = res?;
                if n == 0 || n > MAX_DATAGRAM_BYTES {
                    continue;
                }

                if !flows.contains_key(&peer) {
                    match open_udp_flow(&pp, &sessions, sock.clone(), peer).await {
                        Ok(flow) => {
                            tracing::debug!(peer = %peer, "listener: udp flow created");
                            flows.insert(peer, flow);
                        }
                        Err(err) => {
                            tracing::warn!(peer = %peer, err = %err, "listener: open udp flow failed");
                            continue;
                        }
                    }
                }

                if let Some(flow) = flows.get_mut(&peer) {
                    flow.last_active = Instant::now();
                    if let Err(err) = flow.wr.write_datagram(&buf[..n]).await {
                        tracing::warn!(peer = %peer, err = %err, "listener: udp flow write failed");
                        if let Some(f) = flows.remove(&peer) {
                            f.close();
                        }
                    }
                }
            }
        }
    }

    for (_, f) in flows.drain() {
        f.close();
    }
    Ok(())
}

/// First datagram from a new remote: fresh substream, one ProxyProtocol
/// frame, then a reader task pumping framed datagrams back out the public
/// socket to that remote.
async fn open_udp_flow(
    pp: &ProxyProtocol,
    sessions: &SessionManager,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
) -> anyhow::Result<UdpFlow> {
    let mut st = sessions
        .open_stream(&pp.client_id)
        .await
        .with_context(|| format!("get session for client {}", pp.client_id))?;

    tokio::time::timeout(WRITE_TIMEOUT, protocol::write_proxy_protocol(&mut st, pp))
        .await
        .context("write pp timed out")??;

    let (rd, wr) = tokio::io::split(st);
    let reader = tokio::spawn(async move {
        if let Err(err) = udp_flow_reader(rd, sock, peer).await {
            tracing::debug!(peer = %peer, err = %err, "listener: udp flow reader ended");
        }
    });

    Ok(UdpFlow {
        wr: DatagramConn::new(wr),
        reader,
        last_active: Instant::now(),
    })
}

async fn udp_flow_reader(
    rd: ReadHalf<TunnelStream>,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let mut rd = DatagramConn::new(rd);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = rd.read_datagram(&mut buf).await?;
        sock.send_to(&buf[..n], peer).await?;
    }
}
