//! One error taxonomy for the whole server. Player loops funnel every
//! failure through [`ServerError::finish_cause`] to pick the cause written
//! into the terminal Finish packet.

use protocol::{CodecError, FinishCause};
use transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A required input was missing or empty.
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("room existed")]
    RoomExisted,
    #[error("room not found")]
    RoomNotFound,
    /// The room no longer admits players.
    #[error("room state")]
    RoomState,
    #[error("player not found")]
    PlayerNotFound,
    /// A second session arrived for a conv that already has a player.
    #[error("player existed")]
    PlayerExisted,
    #[error("auth failed")]
    AuthFailed,
    /// The client went silent before the game was running.
    #[error("network broken")]
    NetworkBroken,
    /// A frame arrived out of order or outside the sync window.
    #[error("time out of sync")]
    TimeOutOfSync,
    /// Reserved for the desync check on Hash messages.
    #[error("data out of sync")]
    DataOutOfSync,
    /// The client sent its own Finish.
    #[error("remote finish, cause {0:?}")]
    RemoteFinish(FinishCause),
    /// A Finish from the room was forwarded to the client.
    #[error("local finish, cause {0:?}")]
    LocalFinish(FinishCause),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An internal invariant did not hold.
    #[error("unexpected error")]
    Unexpected,
}

impl ServerError {
    /// True for the quiet teardown paths that need no Finish to the client.
    pub fn is_finish(&self) -> bool {
        matches!(
            self,
            ServerError::RemoteFinish(_) | ServerError::LocalFinish(_)
        )
    }

    /// The cause reported to the client when this error ends the session.
    pub fn finish_cause(&self) -> FinishCause {
        match self {
            ServerError::NetworkBroken => FinishCause::NetworkBroken,
            ServerError::Codec(_) => FinishCause::InvalidPacket,
            ServerError::AuthFailed => FinishCause::AuthFailed,
            ServerError::TimeOutOfSync => FinishCause::TimeOutOfSync,
            ServerError::DataOutOfSync => FinishCause::DataOutOfSync,
            _ => FinishCause::ServerError,
        }
    }
}
