//! Lockstep relay server: authenticated clients in a room exchange one input
//! command per fixed simulation frame over reliable UDP. The server admits
//! players, barriers the game start, relays per-frame commands with ordering
//! and team-visibility rules, and tears rooms down synchronously.

pub mod error;
pub mod flags;
pub mod http;
pub mod manager;
pub mod player;
pub mod room;

pub use error::ServerError;
pub use manager::{PlayerBasic, RoomManager};
pub use player::{Player, PlayerConfig, RoomEvent};
pub use room::{Room, RoomState};
