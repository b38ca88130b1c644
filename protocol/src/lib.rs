//! The wire protocol shared between the relay server and its game clients.
//! Every packet is one framed message: a type tag, a big-endian u16 payload
//! size and a postcard-encoded payload. Command packets additionally carry an
//! opaque trailer (the player's input bytes) which the server relays without
//! interpreting it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod codec;
mod heap;

pub use codec::{decode_message, encode_message, transform_command};
pub use heap::{CommandBuffer, CommandHeap};

/// Simulation frames per second. One frame lasts exactly 100 ms.
pub const FPS: u32 = 10;

/// KCP window size in packets. Also sizes the intra-room mailboxes so a
/// stalled player exerts backpressure instead of buffering without bound.
pub const KCP_WINDOW_SIZE: usize = 160;

/// MTU of the reliable-UDP transport.
pub const MTU: usize = 470;

/// A packet is at least the bare header: type tag plus u16 size.
pub const MIN_PACKET_SIZE: usize = 3;

/// Upper bound for a whole packet including the command trailer.
pub const MAX_PACKET_SIZE: usize = 4 * MTU;

/// Commands flushed from the reorder heap are batched up to this many.
pub const SEND_BATCH_SIZE: usize = 16;

/// How long the accept loop blocks before it wakes to reap dead rooms.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

/// A player has this long after room creation to open its session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// All players have this long after room creation to authenticate.
pub const START_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum lag of a player behind its expected wall-clock position.
pub const SYNC_LOW_LIMIT: Duration = Duration::from_secs(5);

/// Maximum lead of a player ahead of its expected wall-clock position.
pub const SYNC_HIGH_LIMIT: Duration = Duration::from_secs(2);

// Message type tags.

/// Client -> Server, authentication. Payload: [`Connect`].
pub const MSG_CONNECT: u8 = 1;
/// Server -> Client, authentication succeeded. Empty payload.
pub const MSG_ACCEPT: u8 = 2;
/// Server -> Client broadcast of a peer state change. Payload: [`State`].
pub const MSG_STATE: u8 = 3;
/// Server -> Client broadcast, the start barrier fired. Empty payload.
pub const MSG_START: u8 = 4;
/// Bidirectional, session termination. Payload: [`Finish`].
pub const MSG_FINISH: u8 = 5;
/// Bidirectional, one per-frame input. Payload: [`Command`] plus trailer.
pub const MSG_COMMAND: u8 = 6;
/// Client -> Server, simulation state digest. Payload: [`Hash`].
pub const MSG_HASH: u8 = 7;

/// Highest team number a player config may carry.
pub const MAX_TEAM: u8 = 4;

/// Lifecycle of a player session as observed by its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    /// Session open, not yet authenticated.
    Initing,
    /// Authenticated, waiting for the start barrier.
    Waiting,
    /// Exchanging per-frame commands.
    Running,
    /// Terminal.
    Stopped,
}

impl PlayerState {
    /// Mapping for the atomic mirror peers read without locking.
    pub fn from_u32(value: u32) -> Option<PlayerState> {
        match value {
            0 => Some(PlayerState::Initing),
            1 => Some(PlayerState::Waiting),
            2 => Some(PlayerState::Running),
            3 => Some(PlayerState::Stopped),
            _ => None,
        }
    }
}

/// Why a session ended. Carried by [`Finish`] in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishCause {
    ServerError,
    NetworkBroken,
    InvalidPacket,
    AuthFailed,
    TimeOutOfSync,
    DataOutOfSync,
    /// Another player in the room failed before the game started.
    OtherPlayer,
}

/// Authentication request. All three fields must match the player config the
/// session's conv was created for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connect {
    pub room_id: String,
    pub player_id: String,
    pub password: String,
}

/// A peer's state change, mirrored to every other player in the room.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub conv: u32,
    pub state: PlayerState,
}

/// Session termination notice.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finish {
    pub frame: u32,
    pub cause: FinishCause,
}

/// Per-frame input header. The opaque input payload follows the encoded
/// struct in the same packet; the server rewrites `conv` to the originator
/// when relaying and never touches the trailer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub frame: u32,
    pub conv: u32,
}

/// Simulation digest for desync detection. Parsed and currently discarded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hash {
    pub frame: u32,
    pub digest: Vec<u8>,
}

/// The closed set of messages that travel over a session.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Connect(Connect),
    Accept,
    State(State),
    Start,
    Finish(Finish),
    Command(Command),
    Hash(Hash),
}

/// Codec failures. Anything that makes a packet unusable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Total or framed length outside the allowed range.
    #[error("packet size out of range")]
    PacketSize,
    /// Unknown type tag or payload that does not unmarshal.
    #[error("packet broken")]
    PacketBroken,
    /// An outbound message would exceed [`MAX_PACKET_SIZE`].
    #[error("message too large")]
    MessageSize,
}

/// Wall-clock duration covered by `frame` frames.
pub fn frame_to_duration(frame: u32) -> Duration {
    Duration::from_millis(frame as u64 * 100)
}

/// How many whole frames fit into `duration`.
pub fn duration_to_frame(duration: Duration) -> u32 {
    (duration.as_millis() / 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_round_trip() {
        assert_eq!(frame_to_duration(0), Duration::ZERO);
        assert_eq!(frame_to_duration(FPS), Duration::from_secs(1));
        assert_eq!(duration_to_frame(Duration::from_secs(1)), FPS);
        assert_eq!(duration_to_frame(Duration::from_millis(250)), 2);
    }

    #[test]
    fn player_state_atomic_mapping() {
        for state in [
            PlayerState::Initing,
            PlayerState::Waiting,
            PlayerState::Running,
            PlayerState::Stopped,
        ] {
            assert_eq!(PlayerState::from_u32(state as u32), Some(state));
        }
        assert_eq!(PlayerState::from_u32(99), None);
    }
}
