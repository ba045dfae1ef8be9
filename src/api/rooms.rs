use crate::api::middleware::RequireAuth;
use crate::error::Result;
use crate::models::{
    AddSongRequest, CreateRoomRequest, DisbandRoomRequest, GrantControlRequest, JoinRoomRequest,
    LeaveRoomRequest, PlaybackState, Room, RoomMember, RoomMessage, RoomPlaylistItem,
    SwitchModeRequest, TransferOwnerRequest,
};
use crate::services::room_manager::RoomSnapshot;
use crate::services::{AuthService, RoomManager, StreamProcessor};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

pub struct AppState {
    pub auth: Arc<AuthService>,
    pub manager: Arc<RoomManager>,
    pub streams: Arc<StreamProcessor>,
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    room: Room,
    member: RoomMember,
}

#[derive(Debug, Deserialize)]
struct MessageWindow {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub fn room_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/my", get(my_rooms)) // must precede the :id route
        .route("/rooms/join", post(join_room))
        .route("/rooms/leave", post(leave_room))
        .route("/rooms/disband", post(disband_room))
        .route("/rooms/mode", post(switch_mode))
        .route("/rooms/transfer", post(transfer_owner))
        .route("/rooms/control", post(grant_control))
        .route("/rooms/:id", get(room_snapshot))
        .route("/rooms/:id/playlist", get(get_playlist).post(add_song))
        .route("/rooms/:id/playback", get(get_playback))
        .route("/rooms/:id/messages", get(get_messages))
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<Room>> {
    req.validate()
        .map_err(|e| crate::error::AppError::Validation(e.to_string()))?;
    let (room, _member) = state.manager.create_room(&claims, &req.name).await?;
    Ok(Json(room))
}

async fn my_rooms(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
) -> Result<Json<Vec<Room>>> {
    let rooms = state.manager.rooms_for_user(&claims).await?;
    Ok(Json(rooms))
}

async fn join_room(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<JoinRoomRequest>,
) -> Result<Json<JoinResponse>> {
    let (room, member) = state.manager.join_room(&claims, &req.room_id).await?;
    Ok(Json(JoinResponse { room, member }))
}

async fn leave_room(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<LeaveRoomRequest>,
) -> Result<StatusCode> {
    state
        .manager
        .leave_room(&claims, &req.room_id, req.transfer_to)
        .await?;
    Ok(StatusCode::OK)
}

async fn disband_room(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<DisbandRoomRequest>,
) -> Result<StatusCode> {
    state.manager.disband_room(&claims, &req.room_id).await?;
    Ok(StatusCode::OK)
}

async fn switch_mode(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<SwitchModeRequest>,
) -> Result<StatusCode> {
    state
        .manager
        .switch_mode(&claims, &req.room_id, req.mode)
        .await?;
    Ok(StatusCode::OK)
}

async fn transfer_owner(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<TransferOwnerRequest>,
) -> Result<StatusCode> {
    state
        .manager
        .transfer_owner(&claims, &req.room_id, req.target_user_id)
        .await?;
    Ok(StatusCode::OK)
}

async fn grant_control(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<GrantControlRequest>,
) -> Result<StatusCode> {
    state
        .manager
        .grant_control(&claims, &req.room_id, req.target_user_id, req.can_control)
        .await?;
    Ok(StatusCode::OK)
}

async fn room_snapshot(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>> {
    let snapshot = state.manager.room_snapshot(&claims, &room_id).await?;
    Ok(Json(snapshot))
}

async fn get_playlist(
    State(state): State<Arc<AppState>>,
    RequireAuth(_claims): RequireAuth,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<RoomPlaylistItem>>> {
    let items = state.manager.playlist(&room_id).await?;
    Ok(Json(items))
}

async fn add_song(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Path(room_id): Path<String>,
    Json(req): Json<AddSongRequest>,
) -> Result<Json<RoomPlaylistItem>> {
    req.validate()
        .map_err(|e| crate::error::AppError::Validation(e.to_string()))?;
    let item = state.manager.add_song(&claims, &room_id, req).await?;
    Ok(Json(item))
}

async fn get_playback(
    State(state): State<Arc<AppState>>,
    RequireAuth(_claims): RequireAuth,
    Path(room_id): Path<String>,
) -> Result<Json<Option<PlaybackState>>> {
    let playback = state.manager.playback(&room_id).await?;
    Ok(Json(playback))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Path(room_id): Path<String>,
    Query(window): Query<MessageWindow>,
) -> Result<Json<Vec<RoomMessage>>> {
    let messages = state
        .manager
        .messages(
            &claims,
            &room_id,
            window.limit.unwrap_or(50),
            window.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(messages))
}
