//! UDP endpoint plumbing: one demux task routes datagrams to per-conv KCP
//! state machines, one tick task drives their retransmit clocks and reaps
//! closed sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kcp::Kcp;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::session::{KcpSession, SessionShared, UdpOutput};
use crate::{KcpConfig, TransportError};

/// Every KCP segment starts with a 24-byte header.
const KCP_HEADER_SIZE: usize = 24;

/// Largest raw datagram we expect; anything bigger than the MTU is bogus but
/// a generous buffer costs nothing.
const RECV_BUFFER_SIZE: usize = 2048;

/// How often session clocks are ticked for retransmits and acks.
const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Pending sessions the accept loop has not collected yet.
const ACCEPT_BACKLOG: usize = 64;

struct SessionEntry {
    shared: Arc<SessionShared>,
    inbox: mpsc::Sender<Bytes>,
}

struct Endpoint {
    socket: Arc<UdpSocket>,
    config: KcpConfig,
    sessions: Mutex<HashMap<u32, SessionEntry>>,
    accept_tx: mpsc::Sender<KcpSession>,
}

/// A listening reliable-UDP endpoint yielding one [`KcpSession`] per
/// previously-unseen conv.
pub struct KcpListener {
    accept_rx: Mutex<mpsc::Receiver<KcpSession>>,
    local_addr: SocketAddr,
    _endpoint: Arc<Endpoint>,
}

impl KcpListener {
    pub async fn bind(addr: SocketAddr, config: KcpConfig) -> Result<KcpListener, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let endpoint = Arc::new(Endpoint {
            socket,
            config,
            sessions: Mutex::new(HashMap::new()),
            accept_tx,
        });
        tokio::spawn(demux_loop(endpoint.clone()));
        tokio::spawn(update_loop(endpoint.clone()));

        Ok(KcpListener {
            accept_rx: Mutex::new(accept_rx),
            local_addr,
            _endpoint: endpoint,
        })
    }

    /// The next fresh session. Pends until a datagram with an unknown conv
    /// arrives.
    pub async fn accept(&self) -> Result<KcpSession, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Client end of a session; used by tests and tooling that speak to the
/// server over the real transport.
pub async fn connect(
    addr: SocketAddr,
    conv: u32,
    config: KcpConfig,
) -> Result<KcpSession, TransportError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("fixed addr")
    } else {
        "[::]:0".parse().expect("fixed addr")
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

    let kcp = new_kcp(conv, &config, socket.clone(), addr);
    let shared = Arc::new(SessionShared::new(conv, kcp));
    let (inbox_tx, inbox_rx) = mpsc::channel(config.rcv_wnd as usize);

    tokio::spawn(client_loop(socket, shared.clone(), inbox_tx));
    Ok(KcpSession::new(shared, inbox_rx, config.snd_wnd))
}

fn new_kcp(conv: u32, config: &KcpConfig, socket: Arc<UdpSocket>, peer: SocketAddr) -> Kcp<UdpOutput> {
    let mut kcp = Kcp::new(conv, UdpOutput { socket, peer });
    if let Err(err) = kcp.set_mtu(config.mtu) {
        tracing::warn!(conv, mtu = config.mtu, error = %err, "mtu rejected, keeping default");
    }
    kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
    // Fast mode: 10 ms internal clock, resend after 2 duplicate acks, no
    // congestion window.
    kcp.set_nodelay(true, 10, 2, true);
    kcp
}

async fn demux_loop(endpoint: Arc<Endpoint>) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, peer) = match endpoint.socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(error = %err, "udp receive failed");
                continue;
            }
        };
        if len < KCP_HEADER_SIZE {
            continue;
        }
        handle_datagram(&endpoint, &buffer[..len], peer).await;
    }
}

async fn handle_datagram(endpoint: &Arc<Endpoint>, data: &[u8], peer: SocketAddr) {
    // The conv is the first header field of every KCP segment, little endian.
    let conv = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

    let mut sessions = endpoint.sessions.lock().await;
    if !sessions.contains_key(&conv) {
        let kcp = new_kcp(conv, &endpoint.config, endpoint.socket.clone(), peer);
        let shared = Arc::new(SessionShared::new(conv, kcp));
        let (inbox_tx, inbox_rx) = mpsc::channel(endpoint.config.rcv_wnd as usize);
        let session = KcpSession::new(shared.clone(), inbox_rx, endpoint.config.snd_wnd);

        if endpoint.accept_tx.try_send(session).is_err() {
            tracing::warn!(conv, %peer, "accept backlog full, dropping session");
            return;
        }
        sessions.insert(
            conv,
            SessionEntry {
                shared,
                inbox: inbox_tx,
            },
        );
        tracing::debug!(conv, %peer, "session opened");
    }

    let Some(entry) = sessions.get(&conv) else {
        return;
    };
    let shared = entry.shared.clone();
    let inbox = entry.inbox.clone();
    drop(sessions);

    feed_session(&shared, &inbox, data).await;
}

/// Pushes one raw datagram into a session and drains whole messages into its
/// inbox. When the inbox is full the data stays queued inside KCP and the
/// receive window throttles the peer.
async fn feed_session(shared: &Arc<SessionShared>, inbox: &mpsc::Sender<Bytes>, data: &[u8]) {
    let mut kcp = shared.kcp.lock().await;
    if let Err(err) = kcp.input(data) {
        tracing::debug!(conv = shared.conv, error = %err, "kcp rejected datagram");
        return;
    }
    if let Err(err) = kcp.update(shared.now_ms()) {
        tracing::debug!(conv = shared.conv, error = %err, "kcp update failed");
    }

    while let Ok(size) = kcp.peeksize() {
        let Ok(permit) = inbox.try_reserve() else {
            break;
        };
        let mut message = vec![0u8; size];
        let Ok(read) = kcp.recv(&mut message) else {
            break;
        };
        message.truncate(read);
        permit.send(Bytes::from(message));
    }
}

async fn update_loop(endpoint: Arc<Endpoint>) {
    let mut tick = tokio::time::interval(UPDATE_INTERVAL);
    loop {
        tick.tick().await;

        let mut sessions = endpoint.sessions.lock().await;
        let mut dead = Vec::new();
        for (conv, entry) in sessions.iter() {
            if entry.shared.is_closed() {
                dead.push(*conv);
                continue;
            }
            let mut kcp = entry.shared.kcp.lock().await;
            if let Err(err) = kcp.update(entry.shared.now_ms()) {
                tracing::debug!(conv = *conv, error = %err, "kcp update failed");
            }
        }
        for conv in dead {
            sessions.remove(&conv);
            tracing::debug!(conv, "session reaped");
        }
    }
}

/// Drives the client end of a single session: demuxes its socket and ticks
/// its clock until the session is closed.
async fn client_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<SessionShared>,
    inbox: mpsc::Sender<Bytes>,
) {
    let mut tick = tokio::time::interval(UPDATE_INTERVAL);
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        if shared.is_closed() {
            return;
        }
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                match received {
                    Ok((len, _)) if len >= KCP_HEADER_SIZE => {
                        feed_session(&shared, &inbox, &buffer[..len]).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(conv = shared.conv, error = %err, "udp receive failed");
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                let mut kcp = shared.kcp.lock().await;
                if let Err(err) = kcp.update(shared.now_ms()) {
                    tracing::debug!(conv = shared.conv, error = %err, "kcp update failed");
                }
            }
        }
    }
}
