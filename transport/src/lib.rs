//! Reliable-UDP transport for the relay server, KCP over a tokio UDP socket.
//! The server core only sees the [`Session`] trait: a conv id, whole-message
//! receive, deadline-bounded send and batch-send, and close. The endpoint
//! demultiplexes datagrams onto per-conv KCP state machines and drives their
//! retransmit clocks.

mod endpoint;
mod session;

pub use endpoint::{connect, KcpListener};
pub use session::{KcpSession, Session};

/// KCP tuning knobs. Defaults match the deployment the protocol constants
/// assume: MTU 470, window 160, fast retransmit, no FEC, no encryption.
#[derive(Clone, Copy, Debug)]
pub struct KcpConfig {
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            mtu: 470,
            snd_wnd: 160,
            rcv_wnd: 160,
        }
    }
}

/// Transport failures as seen by the server core.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The session or the endpoint behind it is gone.
    #[error("session closed")]
    Closed,
    /// The send window stayed full past the write deadline.
    #[error("write deadline exceeded")]
    Timeout,
    #[error("kcp: {0}")]
    Protocol(#[from] kcp::Error),
}
