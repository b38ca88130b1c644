//! Per-conv session objects. A [`KcpSession`] owns the receiving half of its
//! inbox; the KCP state machine itself is shared with the endpoint tasks that
//! feed and tick it.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kcp::Kcp;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::TransportError;

/// What the room core needs from a reliable-UDP session.
#[async_trait]
pub trait Session: Send {
    /// The 32-bit connection id the transport multiplexes on.
    fn conv(&self) -> u32;

    /// One whole inbound message. Cancel-safe, so it can sit in a select
    /// next to a mailbox and a deadline.
    async fn recv(&mut self) -> Result<Bytes, TransportError>;

    /// Queues one message, waiting for send-window room until `deadline`.
    async fn send(&mut self, data: &[u8], deadline: Instant) -> Result<usize, TransportError>;

    /// Queues several messages under one deadline, returns total bytes.
    async fn send_batch(
        &mut self,
        buffers: &[Bytes],
        deadline: Instant,
    ) -> Result<usize, TransportError>;

    /// Flushes what the window allows and releases the conv. Exactly once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Datagram sink handed to the KCP state machine. A full socket buffer drops
/// the datagram; KCP retransmission recovers it.
pub(crate) struct UdpOutput {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) peer: SocketAddr,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.socket.try_send_to(buf, self.peer) {
            Ok(sent) => Ok(sent),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(buf.len()),
            Err(err) => Err(err),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// State shared between a session handle and the endpoint tasks.
pub(crate) struct SessionShared {
    pub(crate) conv: u32,
    pub(crate) kcp: Mutex<Kcp<UdpOutput>>,
    pub(crate) closed: AtomicBool,
    epoch: Instant,
}

impl SessionShared {
    pub(crate) fn new(conv: u32, kcp: Kcp<UdpOutput>) -> Self {
        SessionShared {
            conv,
            kcp: Mutex::new(kcp),
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    /// Millisecond clock for `Kcp::update`; wrapping is fine, KCP compares
    /// timestamps with wrapping arithmetic.
    pub(crate) fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A reliable, ordered message stream for one conv.
pub struct KcpSession {
    shared: Arc<SessionShared>,
    inbox: mpsc::Receiver<Bytes>,
    snd_wnd: u16,
}

impl KcpSession {
    pub(crate) fn new(shared: Arc<SessionShared>, inbox: mpsc::Receiver<Bytes>, snd_wnd: u16) -> Self {
        KcpSession {
            shared,
            inbox,
            snd_wnd,
        }
    }

    async fn send_one(&self, data: &[u8], deadline: Instant) -> Result<usize, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        loop {
            {
                let mut kcp = self.shared.kcp.lock().await;
                // Twice the window of queued segments is as much credit as a
                // session gets before its writer has to wait.
                if kcp.wait_snd() < self.snd_wnd as usize * 2 {
                    let sent = kcp.send(data)?;
                    kcp.flush()?;
                    return Ok(sent);
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Session for KcpSession {
    fn conv(&self) -> u32 {
        self.shared.conv
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        match self.inbox.recv().await {
            Some(data) => Ok(data),
            None => Err(TransportError::Closed),
        }
    }

    async fn send(&mut self, data: &[u8], deadline: Instant) -> Result<usize, TransportError> {
        self.send_one(data, deadline).await
    }

    async fn send_batch(
        &mut self,
        buffers: &[Bytes],
        deadline: Instant,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        for buffer in buffers {
            sent += self.send_one(buffer, deadline).await?;
        }
        Ok(sent)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::Release);
        let mut kcp = self.shared.kcp.lock().await;
        kcp.flush()?;
        Ok(())
    }
}

impl Drop for KcpSession {
    /// A session dropped without an explicit close still frees its conv;
    /// the endpoint reaps it on the next tick.
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
