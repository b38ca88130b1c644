//! The room manager: accepts inbound sessions, routes them by conv to the
//! owning room, reaps finished rooms and stale conv reservations, and vends
//! fresh credentials for newly created rooms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use protocol::{CONNECT_TIMEOUT, LISTEN_TIMEOUT};
use transport::{KcpConfig, KcpListener, KcpSession, Session};

use crate::error::ServerError;
use crate::player::PlayerConfig;
use crate::room::Room;

/// Finished room ids queue up here until the next accept-timeout wake.
const FINISH_CHANNEL_SIZE: usize = 1024;

/// NanoID-style URL-safe password length.
const PASSWORD_LEN: usize = 21;

const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// What the control plane supplies per player when creating a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerBasic {
    pub player_id: String,
    pub team: u8,
}

struct Index {
    rooms: HashMap<String, Arc<Room>>,
    convs: HashMap<u32, Arc<Room>>,
}

pub struct RoomManager {
    listener: KcpListener,
    finish_tx: mpsc::Sender<String>,
    finish_rx: Mutex<mpsc::Receiver<String>>,
    index: Mutex<Index>,
}

impl RoomManager {
    pub async fn bind(addr: SocketAddr) -> Result<RoomManager, ServerError> {
        let listener = KcpListener::bind(addr, KcpConfig::default()).await?;
        let (finish_tx, finish_rx) = mpsc::channel(FINISH_CHANNEL_SIZE);
        Ok(RoomManager {
            listener,
            finish_tx,
            finish_rx: Mutex::new(finish_rx),
            index: Mutex::new(Index {
                rooms: HashMap::new(),
                convs: HashMap::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Creates a room with a fresh password and conv per player and returns
    /// the credentials for the control plane to hand out.
    pub async fn create_room(
        &self,
        room_id: String,
        duration: Duration,
        players: &[PlayerBasic],
    ) -> Result<Vec<Arc<PlayerConfig>>, ServerError> {
        let mut index = self.index.lock().await;
        if index.rooms.contains_key(&room_id) {
            return Err(ServerError::RoomExisted);
        }

        let mut configs = HashMap::with_capacity(players.len());
        let mut handout = Vec::with_capacity(players.len());
        for player in players {
            // The generator is only probabilistically unique; the index
            // decides.
            let conv = loop {
                let conv = gen_conv();
                if !index.convs.contains_key(&conv) && !configs.contains_key(&conv) {
                    break conv;
                }
            };
            let config = Arc::new(PlayerConfig {
                player_id: player.player_id.clone(),
                team: player.team,
                password: gen_password(),
                conv,
            });
            configs.insert(conv, config.clone());
            handout.push(config);
        }

        let room = Room::new(room_id.clone(), duration, configs, self.finish_tx.clone());
        for config in &handout {
            index.convs.insert(config.conv, room.clone());
        }
        index.rooms.insert(room_id, room);
        Ok(handout)
    }

    /// Asks every player of the room to stop; the room reports itself
    /// finished once the last loop has returned.
    pub async fn delete_room(&self, room_id: &str) -> Result<(), ServerError> {
        let room = {
            let index = self.index.lock().await;
            index.rooms.get(room_id).cloned()
        }
        .ok_or(ServerError::RoomNotFound)?;
        room.close().await;
        Ok(())
    }

    /// The accept loop. Periodically wakes to reap; any accept error other
    /// than the timeout is fatal.
    pub async fn listen(&self) -> Result<(), ServerError> {
        loop {
            match tokio::time::timeout(LISTEN_TIMEOUT, self.listener.accept()).await {
                Ok(Ok(session)) => self.handle_session(session).await,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => self.handle_timeout().await,
            }
        }
    }

    async fn handle_session(&self, mut session: KcpSession) {
        let conv = session.conv();
        let room = {
            let index = self.index.lock().await;
            index.convs.get(&conv).cloned()
        };
        let Some(room) = room else {
            tracing::warn!(source = "RoomManager", conv, "no room for conv");
            if let Err(err) = session.close().await {
                tracing::warn!(source = "RoomManager", conv, error = %err, "close failed");
            }
            return;
        };
        if let Err(err) = room.enter(session).await {
            tracing::warn!(source = "RoomManager", conv, error = %err, "enter room failed");
        }
    }

    /// Reap pass: drop finished rooms and conv routes nobody claimed within
    /// the connect window.
    async fn handle_timeout(&self) {
        let now = Instant::now();

        let mut finished = Vec::new();
        {
            let mut finish_rx = self.finish_rx.lock().await;
            while let Ok(room_id) = finish_rx.try_recv() {
                finished.push(room_id);
            }
        }

        let mut index = self.index.lock().await;
        for room_id in &finished {
            tracing::info!(source = "RoomManager", room_id = %room_id, "reap room");
            index.rooms.remove(room_id);
        }
        index
            .convs
            .retain(|_, room| now - room.created_at() <= CONNECT_TIMEOUT);
    }

    /// The built-in debug room: `r1` with p1/team 1/conv 100 and
    /// p2/team 2/conv 200, empty passwords.
    pub async fn create_test_room(&self) {
        let mut configs = HashMap::new();
        configs.insert(
            100,
            Arc::new(PlayerConfig {
                player_id: "p1".into(),
                team: 1,
                password: String::new(),
                conv: 100,
            }),
        );
        configs.insert(
            200,
            Arc::new(PlayerConfig {
                player_id: "p2".into(),
                team: 2,
                password: String::new(),
                conv: 200,
            }),
        );

        let mut index = self.index.lock().await;
        if index.rooms.contains_key("r1") {
            tracing::error!(source = "RoomManager", "test room already exists");
            return;
        }
        let room = Room::new(
            "r1".into(),
            Duration::from_secs(40 * 60),
            configs,
            self.finish_tx.clone(),
        );
        index.convs.insert(100, room.clone());
        index.convs.insert(200, room.clone());
        index.rooms.insert("r1".into(), room);
    }
}

static CONV_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Upper 15 bits from a process-wide counter stepped by 7, lower 17 bits
/// from wall-clock seconds. A design seed, not a guarantee; callers must
/// check the index before use.
fn gen_conv() -> u32 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0) as u32;
    let count = CONV_COUNTER.fetch_add(7, Ordering::Relaxed).wrapping_add(7);
    (count & 0x7FFF) << 17 | seconds & 0x1FFFF
}

/// 21 URL-safe characters from an OS-seeded CSPRNG.
fn gen_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}
