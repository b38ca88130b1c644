//! End-to-end lockstep scenarios: real player loops driven over channel-backed
//! sessions, plus one smoke test across the actual KCP transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::Instant;

use protocol::{
    decode_message, encode_message, Command, Connect, Finish, FinishCause, Message, PlayerState,
};
use relay_server::{PlayerConfig, Room, RoomManager, RoomState};
use transport::{Session, TransportError};

/// How long any single expectation may pend. Generous; paused-clock tests
/// fast-forward through it.
const WAIT: Duration = Duration::from_secs(30);

struct ChannelSession {
    conv: u32,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
}

struct ClientHandle {
    to_server: mpsc::Sender<Bytes>,
    from_server: mpsc::Receiver<Bytes>,
}

fn session_pair(conv: u32) -> (ChannelSession, ClientHandle) {
    let (to_server, inbound) = mpsc::channel(256);
    let (outbound, from_server) = mpsc::channel(256);
    (
        ChannelSession {
            conv,
            inbound,
            outbound,
        },
        ClientHandle {
            to_server,
            from_server,
        },
    )
}

#[async_trait]
impl Session for ChannelSession {
    fn conv(&self) -> u32 {
        self.conv
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    async fn send(&mut self, data: &[u8], _deadline: Instant) -> Result<usize, TransportError> {
        self.outbound
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(data.len())
    }

    async fn send_batch(
        &mut self,
        buffers: &[Bytes],
        _deadline: Instant,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        for buffer in buffers {
            self.outbound
                .send(buffer.clone())
                .await
                .map_err(|_| TransportError::Closed)?;
            sent += buffer.len();
        }
        Ok(sent)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl ClientHandle {
    async fn send(&self, message: &Message) {
        let mut buffer = BytesMut::new();
        encode_message(message, &mut buffer).expect("encode");
        self.to_server
            .send(buffer.freeze())
            .await
            .expect("send to server");
    }

    async fn send_command(&self, frame: u32, trailer: &[u8]) {
        let mut buffer = BytesMut::new();
        encode_message(&Message::Command(Command { frame, conv: 0 }), &mut buffer)
            .expect("encode");
        buffer.extend_from_slice(trailer);
        self.to_server
            .send(buffer.freeze())
            .await
            .expect("send to server");
    }

    async fn recv_raw(&mut self) -> Bytes {
        tokio::time::timeout(WAIT, self.from_server.recv())
            .await
            .expect("recv timed out")
            .expect("server hung up")
    }

    async fn recv(&mut self) -> Message {
        let raw = self.recv_raw().await;
        decode_message(&raw).expect("decode").0
    }

    /// The next relayed command, skipping State broadcasts.
    async fn recv_command(&mut self) -> (Command, Bytes) {
        loop {
            let raw = self.recv_raw().await;
            let (message, offset) = decode_message(&raw).expect("decode");
            match message {
                Message::Command(command) => return (command, raw.slice(offset..)),
                Message::State(_) => continue,
                other => panic!("expected command, got {other:?}"),
            }
        }
    }

    /// The next Finish, skipping State broadcasts.
    async fn recv_finish(&mut self) -> Finish {
        loop {
            match self.recv().await {
                Message::Finish(finish) => return finish,
                Message::State(_) => continue,
                other => panic!("expected finish, got {other:?}"),
            }
        }
    }
}

fn config(player_id: &str, team: u8, password: &str, conv: u32) -> Arc<PlayerConfig> {
    Arc::new(PlayerConfig {
        player_id: player_id.into(),
        team,
        password: password.into(),
        conv,
    })
}

fn two_player_room() -> (Arc<Room>, mpsc::Receiver<String>) {
    let (finish_tx, finish_rx) = mpsc::channel(10);
    let mut configs = HashMap::new();
    configs.insert(100, config("p1", 1, "pw-1", 100));
    configs.insert(200, config("p2", 2, "pw-2", 200));
    let room = Room::new(
        "r1".into(),
        Duration::from_secs(600),
        configs,
        finish_tx,
    );
    (room, finish_rx)
}

fn connect(room_id: &str, player_id: &str, password: &str) -> Message {
    Message::Connect(Connect {
        room_id: room_id.into(),
        player_id: player_id.into(),
        password: password.into(),
    })
}

#[tokio::test(start_paused = true)]
async fn two_player_happy_path() {
    let (room, _finish_rx) = two_player_room();
    let (s1, mut c1) = session_pair(100);
    let (s2, mut c2) = session_pair(200);
    room.enter(s1).await.expect("enter p1");
    room.enter(s2).await.expect("enter p2");

    c1.send(&connect("r1", "p1", "pw-1")).await;
    assert_eq!(c1.recv().await, Message::Accept);

    c2.send(&connect("r1", "p2", "pw-2")).await;
    assert_eq!(c2.recv().await, Message::Accept);
    // Catch-up: p1 already authenticated.
    match c2.recv().await {
        Message::State(state) => {
            assert_eq!(state.conv, 100);
            assert_eq!(state.state, PlayerState::Waiting);
        }
        other => panic!("expected state, got {other:?}"),
    }
    assert_eq!(c2.recv().await, Message::Start);

    assert_eq!(c1.recv().await, Message::Start);
    assert_eq!(room.state().await, RoomState::Running);

    // Both commit frame 1; each receives the other's command with the
    // originator's conv stamped in and the trailer intact.
    c1.send_command(1, &[9, 8, 7, 6, 5]).await;
    c2.send_command(1, &[1, 2, 3]).await;

    let (command, trailer) = c2.recv_command().await;
    assert_eq!(command.conv, 100);
    assert_eq!(command.frame, 1);
    assert_eq!(&trailer[..], &[9, 8, 7, 6, 5]);

    let (command, trailer) = c1.recv_command().await;
    assert_eq!(command.conv, 200);
    assert_eq!(command.frame, 1);
    assert_eq!(&trailer[..], &[1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_tears_the_room_down() {
    let (room, mut finish_rx) = two_player_room();
    let (s1, mut c1) = session_pair(100);
    let (s2, mut c2) = session_pair(200);
    room.enter(s1).await.expect("enter p1");
    room.enter(s2).await.expect("enter p2");

    c1.send(&connect("r1", "p1", "wrong-password")).await;
    let finish = c1.recv_finish().await;
    assert_eq!(finish.cause, FinishCause::AuthFailed);
    assert_eq!(finish.frame, 0);

    let finish = c2.recv_finish().await;
    assert_eq!(finish.cause, FinishCause::OtherPlayer);

    // Both loops return, the room stops and reports exactly once.
    let reported = tokio::time::timeout(WAIT, finish_rx.recv())
        .await
        .expect("finish timed out")
        .expect("finish channel");
    assert_eq!(reported, "r1");
    assert_eq!(room.state().await, RoomState::Stopped);
    assert!(finish_rx.try_recv().is_err());

    // Both server ends hang up.
    assert!(
        tokio::time::timeout(WAIT, c1.from_server.recv())
            .await
            .expect("close timed out")
            .is_none()
    );
    assert!(
        tokio::time::timeout(WAIT, c2.from_server.recv())
            .await
            .expect("close timed out")
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn non_monotonic_frame_is_rejected() {
    let (room, mut finish_rx) = two_player_room();
    let (s1, mut c1) = session_pair(100);
    let (s2, mut c2) = session_pair(200);
    room.enter(s1).await.expect("enter p1");
    room.enter(s2).await.expect("enter p2");

    c1.send(&connect("r1", "p1", "pw-1")).await;
    c2.send(&connect("r1", "p2", "pw-2")).await;
    assert_eq!(c1.recv().await, Message::Accept);
    assert_eq!(c2.recv().await, Message::Accept);
    loop {
        if c1.recv().await == Message::Start {
            break;
        }
    }

    // Frame 0 is not last-accepted + 1.
    c1.send_command(0, &[]).await;
    let finish = c1.recv_finish().await;
    assert_eq!(finish.cause, FinishCause::TimeOutOfSync);
    assert_eq!(finish.frame, 0);

    // The survivor rides out its own sync window, then the room stops.
    let reported = tokio::time::timeout(WAIT, finish_rx.recv())
        .await
        .expect("finish timed out")
        .expect("finish channel");
    assert_eq!(reported, "r1");
}

#[tokio::test]
async fn end_to_end_over_kcp() {
    let manager = Arc::new(
        RoomManager::bind("127.0.0.1:0".parse().expect("fixed addr"))
            .await
            .expect("bind"),
    );
    let configs = manager
        .create_room(
            "e2e".into(),
            Duration::from_secs(600),
            &[
                relay_server::PlayerBasic {
                    player_id: "p1".into(),
                    team: 1,
                },
                relay_server::PlayerBasic {
                    player_id: "p2".into(),
                    team: 2,
                },
            ],
        )
        .await
        .expect("create room");
    let addr = manager.local_addr();
    let accept_manager = manager.clone();
    tokio::spawn(async move {
        let _ = accept_manager.listen().await;
    });

    let mut clients = Vec::new();
    for config in &configs {
        let mut client = transport::connect(addr, config.conv, transport::KcpConfig::default())
            .await
            .expect("connect");
        let mut buffer = BytesMut::new();
        encode_message(
            &connect("e2e", &config.player_id, &config.password),
            &mut buffer,
        )
        .expect("encode");
        client
            .send(&buffer, Instant::now() + Duration::from_secs(1))
            .await
            .expect("send connect");
        clients.push(client);
    }

    // Every client sees Accept and then Start.
    for client in &mut clients {
        let mut started = false;
        while !started {
            let raw = tokio::time::timeout(Duration::from_secs(5), client.recv())
                .await
                .expect("recv timed out")
                .expect("recv");
            let (message, _) = decode_message(&raw).expect("decode");
            match message {
                Message::Accept | Message::State(_) => {}
                Message::Start => started = true,
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    // One relayed command across the real transport.
    let mut buffer = BytesMut::new();
    encode_message(&Message::Command(Command { frame: 1, conv: 0 }), &mut buffer).expect("encode");
    buffer.extend_from_slice(&[9, 8, 7, 6, 5]);
    clients[0]
        .send(&buffer, Instant::now() + Duration::from_secs(1))
        .await
        .expect("send command");

    let mut buffer = BytesMut::new();
    encode_message(&Message::Command(Command { frame: 1, conv: 0 }), &mut buffer).expect("encode");
    buffer.extend_from_slice(&[1, 2, 3]);
    clients[1]
        .send(&buffer, Instant::now() + Duration::from_secs(1))
        .await
        .expect("send command");

    let expect_conv = configs[0].conv;
    let client = &mut clients[1];
    loop {
        let raw = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("recv timed out")
            .expect("recv");
        let (message, offset) = decode_message(&raw).expect("decode");
        match message {
            Message::Command(command) => {
                assert_eq!(command.conv, expect_conv);
                assert_eq!(command.frame, 1);
                assert_eq!(&raw[offset..], &[9, 8, 7, 6, 5]);
                break;
            }
            Message::State(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }

    for client in &mut clients {
        client.close().await.expect("close");
    }
}
