use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    #[sqlx(rename = "owner")]
    Owner,
    #[sqlx(rename = "admin")]
    Admin,
    #[sqlx(rename = "member")]
    Member,
}

/// Per-member mode: chatting only, or following the room master's playback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum MemberMode {
    #[sqlx(rename = "chat")]
    Chat,
    #[sqlx(rename = "listen")]
    Listen,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub owner_id: i64,
    pub mode: MemberMode,
    pub created_at: DateTime<Utc>,
    pub disbanded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub room_id: String,
    pub user_id: i64,
    pub username: String,
    pub role: RoomRole,
    pub mode: MemberMode,
    pub can_control: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RoomMember {
    /// Whether this member is allowed to drive playback for the room.
    pub fn controls_playback(&self) -> bool {
        self.role == RoomRole::Owner || self.can_control
    }
}

/// A currently-connected member, as tracked in the cache and the hub roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineMember {
    pub user_id: i64,
    pub username: String,
    pub role: RoomRole,
    pub mode: MemberMode,
    pub can_control: bool,
}

impl From<&RoomMember> for OnlineMember {
    fn from(m: &RoomMember) -> Self {
        Self {
            user_id: m.user_id,
            username: m.username.clone(),
            role: m.role,
            mode: m.mode,
            can_control: m.can_control,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoomRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomRequest {
    pub room_id: String,
    /// Optional explicit ownership transfer target when the owner leaves.
    pub transfer_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisbandRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchModeRequest {
    pub room_id: String,
    pub mode: MemberMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOwnerRequest {
    pub room_id: String,
    pub target_user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantControlRequest {
    pub room_id: String,
    pub target_user_id: i64,
    pub can_control: bool,
}
