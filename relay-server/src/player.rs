//! Per-player session handling. Every admitted player runs one loop that
//! multiplexes its transport session, the intra-room mailbox and the current
//! deadline, walks the Initing -> Waiting -> Running -> Stopped state machine
//! and funnels every failure into a single terminal handler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use protocol::{
    Command, CommandBuffer, CommandHeap, Connect, Finish, FinishCause, Hash, Message, PlayerState,
    CONNECT_TIMEOUT, MAX_PACKET_SIZE, SEND_BATCH_SIZE, START_TIMEOUT, SYNC_HIGH_LIMIT,
    SYNC_LOW_LIMIT,
};
use transport::Session;

use crate::error::ServerError;
use crate::room::Room;

/// Write deadline for a single relayed or protocol message.
const SEND_DEADLINE: Duration = Duration::from_millis(5);

/// Write deadline for a batch flushed from the reorder heap.
const BATCH_DEADLINE: Duration = Duration::from_millis(10);

/// Grace period for the reliable transport to deliver a terminal Finish.
const FINISH_LINGER: Duration = Duration::from_secs(5);

/// Immutable identity of one player slot, created with the room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerConfig {
    pub player_id: String,
    pub team: u8,
    pub password: String,
    pub conv: u32,
}

/// Intra-room traffic between player loops.
#[derive(Clone, Debug)]
pub enum RoomEvent {
    /// A peer changed state.
    State(protocol::State),
    /// The admission barrier fired.
    Start,
    /// The room is tearing down; forward to the client and stop.
    Finish(Finish),
    /// A peer's per-frame command, already rewritten to its conv.
    Command(CommandBuffer),
}

/// The handle peers and the room hold on a player. The loop-owned half
/// lives in [`PlayerLoop`].
pub struct Player {
    room: Arc<Room>,
    config: Arc<PlayerConfig>,
    mailbox: mpsc::Sender<RoomEvent>,
    state: AtomicU32,
}

impl Player {
    pub(crate) fn new(
        room: Arc<Room>,
        config: Arc<PlayerConfig>,
        mailbox: mpsc::Sender<RoomEvent>,
    ) -> Self {
        Player {
            room,
            config,
            mailbox,
            state: AtomicU32::new(PlayerState::Initing as u32),
        }
    }

    pub fn conv(&self) -> u32 {
        self.config.conv
    }

    pub fn player_id(&self) -> &str {
        &self.config.player_id
    }

    pub fn team(&self) -> u8 {
        self.config.team
    }

    pub fn room_id(&self) -> &str {
        self.room.room_id()
    }

    /// Peer-visible state, readable without any lock.
    pub fn state(&self) -> PlayerState {
        PlayerState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(PlayerState::Stopped)
    }

    fn set_state(&self, state: PlayerState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Delivers one event into this player's mailbox. Blocks briefly when
    /// the mailbox is full; a gone receiver only means the loop already
    /// stopped.
    pub(crate) async fn post(&self, event: RoomEvent) {
        let _ = self.mailbox.send(event).await;
    }
}

/// What woke the loop up.
enum Wakeup {
    Packet(Result<Bytes, transport::TransportError>),
    Event(Option<RoomEvent>),
    Deadline,
}

/// The loop-owned half of a player: session, mailbox receiver and all
/// mutable lockstep state. Consumed by [`PlayerLoop::run`].
pub struct PlayerLoop<S> {
    player: Arc<Player>,
    session: S,
    inbox: mpsc::Receiver<RoomEvent>,
    state: PlayerState,
    frame: u32,
    deadline: Instant,
    heap: CommandHeap,
    batch: Vec<Bytes>,
    peers: Vec<Arc<Player>>,
    send_buf: BytesMut,
}

impl<S> std::fmt::Debug for PlayerLoop<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerLoop")
            .field("state", &self.state)
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl<S: Session> PlayerLoop<S> {
    pub(crate) fn new(player: Arc<Player>, session: S, inbox: mpsc::Receiver<RoomEvent>) -> Self {
        let max_players = player.room.max_players();
        PlayerLoop {
            player,
            session,
            inbox,
            state: PlayerState::Initing,
            frame: 0,
            deadline: Instant::now(),
            heap: CommandHeap::with_capacity(protocol::KCP_WINDOW_SIZE),
            batch: Vec::with_capacity(SEND_BATCH_SIZE),
            peers: Vec::with_capacity(max_players),
            send_buf: BytesMut::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Runs the session to completion: drive until the terminal error,
    /// drain, close the session and leave the room. Every exit path comes
    /// through here exactly once.
    pub async fn run(mut self) {
        self.log_info("start");

        self.deadline = self.player.room.created_at() + CONNECT_TIMEOUT;
        let err = self.drive().await;
        self.handle_error(&err).await;

        tokio::time::sleep_until(self.deadline).await;
        if let Err(err) = self.session.close().await {
            tracing::error!(
                source = "Player",
                room_id = %self.player.room_id(),
                player_id = %self.player.player_id(),
                conv = self.player.conv(),
                error = %err,
                "close session failed"
            );
        }
        if let Err(err) = self.player.room.leave(self.player.conv()).await {
            tracing::error!(
                source = "Player",
                room_id = %self.player.room_id(),
                player_id = %self.player.player_id(),
                conv = self.player.conv(),
                error = %err,
                "leave room failed"
            );
        }

        self.log_info("finish");
    }

    /// Blocks on whichever of the session, the mailbox or the deadline is
    /// ready first, until a handler reports the terminal error.
    async fn drive(&mut self) -> ServerError {
        loop {
            let wakeup = tokio::select! {
                received = self.session.recv() => Wakeup::Packet(received),
                event = self.inbox.recv() => Wakeup::Event(event),
                _ = tokio::time::sleep_until(self.deadline) => Wakeup::Deadline,
            };

            let result = match wakeup {
                Wakeup::Packet(Ok(data)) => self.handle_packet(&data).await,
                Wakeup::Packet(Err(err)) => Err(err.into()),
                Wakeup::Event(Some(event)) => self.handle_event(event).await,
                // The room holds our mailbox sender for as long as we are a
                // member, so a closed inbox is an invariant violation.
                Wakeup::Event(None) => Err(ServerError::Unexpected),
                Wakeup::Deadline => Err(if self.state == PlayerState::Running {
                    ServerError::TimeOutOfSync
                } else {
                    ServerError::NetworkBroken
                }),
            };
            if let Err(err) = result {
                return err;
            }
        }
    }

    /// One inbound packet from the client, dispatched by state.
    async fn handle_packet(&mut self, buffer: &[u8]) -> Result<(), ServerError> {
        let (message, offset) = protocol::decode_message(buffer)?;
        tracing::debug!(
            source = "Player",
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            message = ?message,
            "recv"
        );

        match self.state {
            PlayerState::Initing => match message {
                Message::Connect(connect) => {
                    self.on_connect(&connect).await?;
                    self.update_state(PlayerState::Waiting).await;
                    self.deadline =
                        self.player.room.created_at() + START_TIMEOUT + SYNC_LOW_LIMIT;
                    Ok(())
                }
                Message::Finish(finish) => Err(ServerError::RemoteFinish(finish.cause)),
                _ => Err(protocol::CodecError::PacketBroken.into()),
            },

            PlayerState::Waiting => match message {
                Message::Finish(finish) => Err(ServerError::RemoteFinish(finish.cause)),
                _ => Err(protocol::CodecError::PacketBroken.into()),
            },

            PlayerState::Running => match message {
                Message::Hash(hash) => self.on_hash(&hash),
                Message::Command(command) => {
                    self.on_command(&command, offset, buffer).await?;
                    self.deadline = self.next_deadline()?;
                    Ok(())
                }
                Message::Finish(finish) => Err(ServerError::RemoteFinish(finish.cause)),
                _ => Err(protocol::CodecError::PacketBroken.into()),
            },

            PlayerState::Stopped => Ok(()),
        }
    }

    /// One event from the room mailbox, dispatched by state.
    async fn handle_event(&mut self, event: RoomEvent) -> Result<(), ServerError> {
        match self.state {
            PlayerState::Initing => match event {
                RoomEvent::State(_) => Ok(()),
                RoomEvent::Finish(finish) => {
                    self.send_to_client(&Message::Finish(finish)).await?;
                    Err(ServerError::LocalFinish(finish.cause))
                }
                _ => Err(ServerError::Unexpected),
            },

            PlayerState::Waiting => match event {
                RoomEvent::State(state) => self.send_to_client(&Message::State(state)).await,
                RoomEvent::Start => {
                    self.send_to_client(&Message::Start).await?;
                    self.update_state(PlayerState::Running).await;
                    let started_at = self
                        .player
                        .room
                        .started_at()
                        .ok_or(ServerError::Unexpected)?;
                    self.deadline = started_at + SYNC_LOW_LIMIT;
                    Ok(())
                }
                RoomEvent::Finish(finish) => {
                    self.send_to_client(&Message::Finish(finish)).await?;
                    Err(ServerError::LocalFinish(finish.cause))
                }
                RoomEvent::Command(_) => Err(ServerError::Unexpected),
            },

            PlayerState::Running => match event {
                RoomEvent::State(state) => self.send_to_client(&Message::State(state)).await,
                RoomEvent::Command(buffer) => self.on_peer_command(buffer).await,
                RoomEvent::Finish(finish) => {
                    self.send_to_client(&Message::Finish(finish)).await?;
                    Err(ServerError::LocalFinish(finish.cause))
                }
                RoomEvent::Start => Err(ServerError::Unexpected),
            },

            PlayerState::Stopped => Ok(()),
        }
    }

    /// Verifies the credential triple, catches the client up on peer states
    /// and trips the room barrier when this player was the last one missing.
    async fn on_connect(&mut self, connect: &Connect) -> Result<(), ServerError> {
        if self.player.room_id() != connect.room_id {
            return Err(ServerError::AuthFailed);
        }
        if self.player.player_id() != connect.player_id {
            return Err(ServerError::AuthFailed);
        }
        if self.player.config.password != connect.password {
            return Err(ServerError::AuthFailed);
        }

        self.send_to_client(&Message::Accept).await?;

        let mut peers = std::mem::take(&mut self.peers);
        peers.clear();
        self.player.room.players_into(&mut peers).await;
        for peer in &peers {
            if peer.conv() == self.player.conv() {
                continue;
            }
            let state = peer.state();
            if state != PlayerState::Initing {
                self.send_to_client(&Message::State(protocol::State {
                    conv: peer.conv(),
                    state,
                }))
                .await?;
            }
        }
        peers.clear();
        self.peers = peers;

        let running = self.player.room.connect(self.player.conv()).await?;
        if running {
            self.publish(true, RoomEvent::Start).await;
        }
        Ok(())
    }

    /// Accepts the next own frame, fans it out and flushes whatever the
    /// reorder heap has become ready to deliver.
    async fn on_command(
        &mut self,
        command: &Command,
        offset: usize,
        buffer: &[u8],
    ) -> Result<(), ServerError> {
        if command.frame != self.frame + 1 {
            return Err(ServerError::TimeOutOfSync);
        }
        self.frame = command.frame;

        let rewritten = protocol::transform_command(command, offset, buffer, self.player.conv())?;
        self.publish(
            false,
            RoomEvent::Command(CommandBuffer {
                frame: command.frame,
                team: self.player.team(),
                buffer: rewritten,
            }),
        )
        .await;

        loop {
            self.batch.clear();
            while self.batch.len() < SEND_BATCH_SIZE {
                match self.heap.peek() {
                    Some(top) if top.frame <= self.frame => {}
                    _ => break,
                }
                if let Some(entry) = self.heap.pop() {
                    self.batch.push(entry.buffer);
                }
            }
            if self.batch.is_empty() {
                break;
            }
            self.session
                .send_batch(&self.batch, Instant::now() + BATCH_DEADLINE)
                .await?;
        }
        Ok(())
    }

    /// A peer's command: same-team commands and already-committed frames go
    /// out immediately, future opposing-team frames wait in the heap.
    async fn on_peer_command(&mut self, buffer: CommandBuffer) -> Result<(), ServerError> {
        if buffer.team == self.player.team() || buffer.frame <= self.frame {
            let sent = self
                .session
                .send(&buffer.buffer, Instant::now() + SEND_DEADLINE)
                .await?;
            if sent != buffer.buffer.len() {
                return Err(ServerError::Unexpected);
            }
        } else {
            self.heap.push(buffer);
        }
        Ok(())
    }

    /// Desync check hook. The framing is validated, the digest discarded.
    fn on_hash(&mut self, _hash: &Hash) -> Result<(), ServerError> {
        Ok(())
    }

    /// Rejects the frame when `now - expected_remote` falls outside
    /// [-SYNC_LOW_LIMIT, +SYNC_HIGH_LIMIT], boundaries included; otherwise
    /// the next wake is one full lag window out.
    fn next_deadline(&self) -> Result<Instant, ServerError> {
        let started_at = self
            .player
            .room
            .started_at()
            .ok_or(ServerError::Unexpected)?;
        let remote = started_at + protocol::frame_to_duration(self.frame);
        let now = Instant::now();
        if remote > now + SYNC_LOW_LIMIT || remote + SYNC_HIGH_LIMIT < now {
            return Err(ServerError::TimeOutOfSync);
        }
        Ok(now + SYNC_LOW_LIMIT)
    }

    /// Commits a state transition and mirrors it to the peers.
    async fn update_state(&mut self, state: PlayerState) {
        tracing::info!(
            source = "Player",
            room_id = %self.player.room_id(),
            player_id = %self.player.player_id(),
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            new_state = ?state,
            "state change"
        );
        self.state = state;
        self.player.set_state(state);
        self.publish(
            false,
            RoomEvent::State(protocol::State {
                conv: self.player.conv(),
                state,
            }),
        )
        .await;
    }

    /// Encodes and writes one message to this player's client.
    async fn send_to_client(&mut self, message: &Message) -> Result<(), ServerError> {
        tracing::debug!(
            source = "Player",
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            message = ?message,
            "send"
        );
        self.send_buf.clear();
        protocol::encode_message(message, &mut self.send_buf)?;
        let sent = self
            .session
            .send(&self.send_buf, Instant::now() + SEND_DEADLINE)
            .await?;
        if sent != self.send_buf.len() {
            return Err(ServerError::Unexpected);
        }
        Ok(())
    }

    /// Fans an event out to the room, optionally including this player's
    /// own mailbox.
    async fn publish(&mut self, include_self: bool, event: RoomEvent) {
        let mut peers = std::mem::take(&mut self.peers);
        peers.clear();
        self.player.room.players_into(&mut peers).await;
        for peer in &peers {
            if include_self || peer.conv() != self.player.conv() {
                peer.post(event.clone()).await;
            }
        }
        peers.clear();
        self.peers = peers;
    }

    /// The single terminal handler: log, stop, tell the client why, and
    /// give the peers their cue.
    async fn handle_error(&mut self, err: &ServerError) {
        tracing::error!(
            source = "Player",
            room_id = %self.player.room_id(),
            player_id = %self.player.player_id(),
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            error = %err,
            "player loop failed"
        );
        tracing::info!(
            source = "Player",
            room_id = %self.player.room_id(),
            player_id = %self.player.player_id(),
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            new_state = ?PlayerState::Stopped,
            "state change"
        );

        let old_state = self.state;
        self.state = PlayerState::Stopped;
        self.player.set_state(PlayerState::Stopped);

        if err.is_finish() {
            // The Finish already crossed the wire in one direction or the
            // other; nothing to flush.
            self.deadline = Instant::now();
            return;
        }

        let finish = Finish {
            frame: self.frame,
            cause: err.finish_cause(),
        };
        match self.send_to_client(&Message::Finish(finish)).await {
            Ok(()) => self.deadline = Instant::now() + FINISH_LINGER,
            Err(send_err) => {
                self.deadline = Instant::now();
                tracing::error!(
                    source = "Player",
                    room_id = %self.player.room_id(),
                    player_id = %self.player.player_id(),
                    conv = self.player.conv(),
                    error = %send_err,
                    "send finish failed"
                );
            }
        }

        if old_state == PlayerState::Initing || old_state == PlayerState::Waiting {
            // The room cannot start anymore; take everyone down with us.
            self.publish(
                false,
                RoomEvent::Finish(Finish {
                    frame: 0,
                    cause: FinishCause::OtherPlayer,
                }),
            )
            .await;
        } else {
            self.publish(
                false,
                RoomEvent::State(protocol::State {
                    conv: self.player.conv(),
                    state: PlayerState::Stopped,
                }),
            )
            .await;
        }
    }

    fn log_info(&self, message: &str) {
        tracing::info!(
            source = "Player",
            room_id = %self.player.room_id(),
            player_id = %self.player.player_id(),
            conv = self.player.conv(),
            state = ?self.state,
            frame = self.frame,
            "{message}"
        );
    }
}

#[cfg(test)]
impl<S: Session> PlayerLoop<S> {
    pub(crate) async fn take_event(&mut self) -> Option<RoomEvent> {
        self.inbox.recv().await
    }
}
