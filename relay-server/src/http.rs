//! Control-plane HTTP endpoints: create-room vends per-player credentials,
//! delete-room asks a room to shut down. JSON in, JSON out, no protocol-level
//! side effects on errors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use protocol::MAX_TEAM;

use crate::error::ServerError;
use crate::manager::{PlayerBasic, RoomManager};

#[derive(Debug, Deserialize)]
pub struct CreateArgs {
    pub room_id: String,
    /// Session length in seconds.
    pub duration: u64,
    pub players: Vec<PlayerBasic>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteArgs {
    pub room_id: String,
}

pub fn router(manager: Arc<RoomManager>) -> Router {
    Router::new()
        .route("/create-room", post(create_room))
        .route("/delete-room", post(delete_room))
        .with_state(manager)
}

/// Binds the control plane and serves it until the process exits.
pub async fn serve(manager: Arc<RoomManager>, addr: SocketAddr) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(source = "Http", %addr, "start HTTP");
    axum::serve(listener, router(manager)).await
}

fn failure() -> Json<Value> {
    Json(json!({ "success": false }))
}

pub(crate) async fn create_room(
    State(manager): State<Arc<RoomManager>>,
    payload: Result<Json<CreateArgs>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Ok(Json(args)) = payload else {
        tracing::error!(source = "Http", "create-room: malformed body");
        return (StatusCode::BAD_REQUEST, failure());
    };
    if let Err(err) = validate_create(&args) {
        tracing::error!(source = "Http", room_id = %args.room_id, error = %err, "create-room rejected");
        return (StatusCode::BAD_REQUEST, failure());
    }

    match manager
        .create_room(
            args.room_id.clone(),
            Duration::from_secs(args.duration),
            &args.players,
        )
        .await
    {
        Ok(configs) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "room_id": args.room_id,
                "duration": args.duration,
                "configs": configs,
            })),
        ),
        Err(err) => {
            tracing::error!(source = "Http", room_id = %args.room_id, error = %err, "create-room failed");
            (StatusCode::INTERNAL_SERVER_ERROR, failure())
        }
    }
}

pub(crate) async fn delete_room(
    State(manager): State<Arc<RoomManager>>,
    payload: Result<Json<DeleteArgs>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Ok(Json(args)) = payload else {
        tracing::error!(source = "Http", "delete-room: malformed body");
        return (StatusCode::BAD_REQUEST, failure());
    };

    match manager.delete_room(&args.room_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(err) => {
            tracing::error!(source = "Http", room_id = %args.room_id, error = %err, "delete-room failed");
            (StatusCode::INTERNAL_SERVER_ERROR, failure())
        }
    }
}

fn validate_create(args: &CreateArgs) -> Result<(), ServerError> {
    if args.room_id.is_empty() || args.players.is_empty() {
        return Err(ServerError::InvalidArguments);
    }
    for player in &args.players {
        if player.player_id.is_empty() || player.team > MAX_TEAM {
            return Err(ServerError::InvalidArguments);
        }
    }
    Ok(())
}
