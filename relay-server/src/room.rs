//! One room per session: owns the players, coordinates the admission
//! barrier and reports its own death to the manager. The room is purely a
//! synchronization object; all I/O happens in the player loops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use protocol::{Finish, FinishCause, FPS, KCP_WINDOW_SIZE};
use transport::Session;

use crate::error::ServerError;
use crate::flags;
use crate::player::{Player, PlayerConfig, PlayerLoop, RoomEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomState {
    /// Accepting sessions and authentications.
    Initing,
    /// The barrier fired; no further admission.
    Running,
    /// The last player left. Terminal.
    Stopped,
}

pub(crate) struct RoomInner {
    pub(crate) state: RoomState,
    pub(crate) ready: HashSet<u32>,
    pub(crate) players: HashMap<u32, Arc<Player>>,
}

pub struct Room {
    room_id: String,
    created_at: Instant,
    duration: Duration,
    max_frame: u32,
    configs: HashMap<u32, Arc<PlayerConfig>>,
    finish_tx: mpsc::Sender<String>,
    /// Milliseconds after `created_at`, 0 while the barrier has not fired.
    started_at_ms: AtomicU64,
    pub(crate) inner: RwLock<RoomInner>,
}

impl Room {
    pub fn new(
        room_id: String,
        duration: Duration,
        configs: HashMap<u32, Arc<PlayerConfig>>,
        finish_tx: mpsc::Sender<String>,
    ) -> Arc<Room> {
        tracing::info!(
            source = "Room",
            room_id = %room_id,
            duration = ?duration,
            configs = ?configs,
            "create room"
        );
        let max_players = configs.len();
        Arc::new(Room {
            room_id,
            created_at: Instant::now(),
            duration,
            max_frame: duration.as_secs() as u32 * FPS,
            configs,
            finish_tx,
            started_at_ms: AtomicU64::new(0),
            inner: RwLock::new(RoomInner {
                state: RoomState::Initing,
                ready: HashSet::with_capacity(max_players),
                players: HashMap::with_capacity(max_players),
            }),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    pub fn max_players(&self) -> usize {
        self.configs.len()
    }

    pub async fn state(&self) -> RoomState {
        self.inner.read().await.state
    }

    /// When the barrier fired, readable on the per-frame path without the
    /// room lock.
    pub fn started_at(&self) -> Option<Instant> {
        let ms = self.started_at_ms.load(Ordering::Acquire);
        (ms != 0).then(|| self.created_at + Duration::from_millis(ms))
    }

    pub(crate) fn mark_started(&self) {
        // At least 1 ms so a zero value keeps meaning "not started".
        let elapsed = self.created_at.elapsed().as_millis().max(1) as u64;
        self.started_at_ms.store(elapsed, Ordering::Release);
    }

    /// Admits a session and launches its player loop. `UNIT_TEST` inhibits
    /// the spawn so tests can drive the loop by hand.
    pub async fn enter<S: Session + 'static>(
        self: &Arc<Self>,
        session: S,
    ) -> Result<(), ServerError> {
        tracing::info!(
            source = "Room",
            room_id = %self.room_id,
            conv = session.conv(),
            "enter room"
        );
        let driver = self.admit(session).await?;
        if !flags::in_unit_test() {
            tokio::spawn(driver.run());
        }
        Ok(())
    }

    pub(crate) async fn admit<S: Session + 'static>(
        self: &Arc<Self>,
        session: S,
    ) -> Result<PlayerLoop<S>, ServerError> {
        let conv = session.conv();
        let mut inner = self.inner.write().await;

        if inner.state != RoomState::Initing {
            return Err(ServerError::RoomState);
        }
        let config = self.configs.get(&conv).ok_or(ServerError::PlayerNotFound)?;
        if inner.players.contains_key(&conv) {
            return Err(ServerError::PlayerExisted);
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(KCP_WINDOW_SIZE);
        let player = Arc::new(Player::new(self.clone(), config.clone(), mailbox_tx));
        inner.players.insert(conv, player.clone());
        Ok(PlayerLoop::new(player, session, mailbox_rx))
    }

    /// Records an authenticated player. Returns true exactly once, for the
    /// authentication that completes the set; `started_at` is stored at
    /// that same instant, still under the lock.
    pub async fn connect(&self, conv: u32) -> Result<bool, ServerError> {
        tracing::info!(
            source = "Room",
            room_id = %self.room_id,
            conv,
            "connect room"
        );
        let mut inner = self.inner.write().await;

        if inner.state != RoomState::Initing {
            return Err(ServerError::RoomState);
        }
        if !inner.players.contains_key(&conv) {
            return Err(ServerError::PlayerNotFound);
        }

        inner.ready.insert(conv);
        if inner.ready.len() == self.configs.len() {
            inner.state = RoomState::Running;
            self.mark_started();
            return Ok(true);
        }
        Ok(false)
    }

    /// Drops a player. The last one out stops the room and emits the
    /// room id on the manager's finish channel, exactly once.
    pub async fn leave(&self, conv: u32) -> Result<(), ServerError> {
        tracing::info!(
            source = "Room",
            room_id = %self.room_id,
            conv,
            "leave room"
        );
        let stopped = {
            let mut inner = self.inner.write().await;
            if inner.players.remove(&conv).is_none() {
                return Err(ServerError::PlayerNotFound);
            }
            inner.ready.remove(&conv);
            if inner.players.is_empty() {
                inner.state = RoomState::Stopped;
                true
            } else {
                false
            }
        };
        if stopped {
            let _ = self.finish_tx.send(self.room_id.clone()).await;
        }
        Ok(())
    }

    /// Snapshot of the current players into a caller-provided scratch
    /// buffer. Callers must not hold the references across the room lock.
    pub async fn players_into(&self, out: &mut Vec<Arc<Player>>) {
        let inner = self.inner.read().await;
        out.extend(inner.players.values().cloned());
    }

    /// Best-effort graceful shutdown: every player gets a ServerError
    /// Finish in its mailbox and tears down on its own.
    pub async fn close(&self) {
        tracing::info!(source = "Room", room_id = %self.room_id, "close room");
        let mut players = Vec::new();
        self.players_into(&mut players).await;
        for player in players {
            player
                .post(RoomEvent::Finish(Finish {
                    frame: 0,
                    cause: FinishCause::ServerError,
                }))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::testing::RecordingSession;

    fn test_configs() -> HashMap<u32, Arc<PlayerConfig>> {
        let mut configs = HashMap::new();
        configs.insert(
            123,
            Arc::new(PlayerConfig {
                player_id: "player-1".into(),
                team: 1,
                password: "password-1".into(),
                conv: 123,
            }),
        );
        configs.insert(
            456,
            Arc::new(PlayerConfig {
                player_id: "player-2".into(),
                team: 2,
                password: "password-2".into(),
                conv: 456,
            }),
        );
        configs
    }

    fn test_room() -> (Arc<Room>, mpsc::Receiver<String>) {
        let (finish_tx, finish_rx) = mpsc::channel(10);
        let room = Room::new(
            "mock-room-id".into(),
            Duration::from_secs(15 * 60),
            test_configs(),
            finish_tx,
        );
        (room, finish_rx)
    }

    #[tokio::test]
    async fn new_room_is_initing() {
        let (room, _finish_rx) = test_room();
        assert!(room.created_at().elapsed() < Duration::from_millis(100));
        assert_eq!(room.max_frame(), 15 * 60 * FPS);
        assert_eq!(room.max_players(), 2);
        assert_eq!(room.state().await, RoomState::Initing);
        assert!(room.started_at().is_none());
    }

    #[tokio::test]
    async fn enter_checks_config_and_uniqueness() {
        let (room, _finish_rx) = test_room();

        room.admit(RecordingSession::new(123)).await.expect("admit");
        assert!(room.inner.read().await.players.contains_key(&123));

        let err = room.admit(RecordingSession::new(123)).await.unwrap_err();
        assert!(matches!(err, ServerError::PlayerExisted));

        let err = room.admit(RecordingSession::new(999)).await.unwrap_err();
        assert!(matches!(err, ServerError::PlayerNotFound));

        room.inner.write().await.state = RoomState::Running;
        let err = room.admit(RecordingSession::new(456)).await.unwrap_err();
        assert!(matches!(err, ServerError::RoomState));
    }

    #[tokio::test]
    async fn connect_fires_barrier_on_last_player() {
        let (room, _finish_rx) = test_room();
        room.admit(RecordingSession::new(123)).await.expect("admit");

        let err = room.connect(777).await.unwrap_err();
        assert!(matches!(err, ServerError::PlayerNotFound));

        let running = room.connect(123).await.expect("connect");
        assert!(!running);
        assert!(room.started_at().is_none());
        assert_eq!(room.state().await, RoomState::Initing);

        room.admit(RecordingSession::new(456)).await.expect("admit");
        let running = room.connect(456).await.expect("connect");
        assert!(running);
        let started_at = room.started_at().expect("started");
        assert!(started_at.elapsed() < Duration::from_millis(100));
        assert_eq!(room.state().await, RoomState::Running);

        let err = room.connect(456).await.unwrap_err();
        assert!(matches!(err, ServerError::RoomState));
    }

    #[tokio::test]
    async fn leave_stops_room_and_reports_once() {
        let (room, mut finish_rx) = test_room();
        room.admit(RecordingSession::new(123)).await.expect("admit");
        room.connect(123).await.expect("connect");
        room.admit(RecordingSession::new(456)).await.expect("admit");
        room.connect(456).await.expect("connect");

        room.leave(123).await.expect("leave");
        assert_eq!(room.state().await, RoomState::Running);
        {
            let inner = room.inner.read().await;
            assert_eq!(inner.players.len(), 1);
            assert_eq!(inner.ready.len(), 1);
        }
        assert!(finish_rx.try_recv().is_err());

        room.leave(456).await.expect("leave");
        assert_eq!(room.state().await, RoomState::Stopped);
        assert_eq!(finish_rx.try_recv().ok(), Some("mock-room-id".into()));

        let err = room.leave(456).await.unwrap_err();
        assert!(matches!(err, ServerError::PlayerNotFound));
    }

    #[tokio::test]
    async fn close_posts_server_error_finish() {
        let (room, _finish_rx) = test_room();
        let mut driver = room.admit(RecordingSession::new(123)).await.expect("admit");
        room.close().await;
        let event = driver.take_event().await.expect("event");
        assert!(matches!(
            event,
            RoomEvent::Finish(Finish {
                frame: 0,
                cause: FinishCause::ServerError,
            })
        ));
    }
}
