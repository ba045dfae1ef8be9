//! Room WebSocket wire types.
//!
//! Every frame is a flat JSON envelope whose `data` field is itself a
//! stringified JSON payload, parsed once at dispatch based on `type`.
//! Unknown type tags fail deserialization and are surfaced to the sender
//! as a validation error.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{MemberMode, OnlineMember, RoomPlaylistItem};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomWsMessageType {
    Join,
    Leave,
    MemberList,
    Chat,
    Sync,
    Playback,
    Playlist,
    SongAdd,
    SongDel,
    SongSearch,
    RoleUpdate,
    GrantControl,
    Ping,
    Pong,
    Error,
    MasterSync,
    MasterRequest,
    MasterMode,
    SongChange,
    RoomDisband,
    ModeSync,
    TransferOwner,
    Play,
    Pause,
    Seek,
    Next,
    Prev,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: RoomWsMessageType,
    pub room_id: String,
    pub user_id: i64,
    pub username: String,
    /// Stringified JSON payload; shape depends on `kind`.
    #[serde(default)]
    pub data: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl WsFrame {
    /// Build a server-stamped frame with a serialized payload.
    pub fn server<T: Serialize>(kind: RoomWsMessageType, room_id: &str, payload: &T) -> Self {
        let data = serde_json::to_string(payload).expect("payload serializes");
        Self {
            kind,
            room_id: room_id.to_string(),
            user_id: 0,
            username: "server".to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Parse the `data` field into a typed payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_str(&self.data)
            .map_err(|e| AppError::Validation(format!("malformed {:?} payload: {e}", self.kind)))
    }

    /// Like [`WsFrame::payload`], but an empty `data` field yields the
    /// payload's default.
    pub fn payload_or_default<T: for<'de> Deserialize<'de> + Default>(&self) -> Result<T> {
        if self.data.trim().is_empty() {
            return Ok(T::default());
        }
        self.payload()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub content: String,
}

/// Master playback report, as sent by the master and re-broadcast to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterSyncData {
    pub song_id: Option<String>,
    pub position: f64,
    pub is_playing: bool,
    /// Master-local epoch milliseconds at capture time.
    pub timestamp: i64,
    /// Server-assigned epoch milliseconds; authoritative for ordering.
    #[serde(default)]
    pub server_timestamp: i64,
    #[serde(default)]
    pub master_id: i64,
    #[serde(default)]
    pub master_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongChangeData {
    pub song_id: String,
    pub name: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub is_playing: bool,
    /// Server-assigned epoch milliseconds, stamped at broadcast time.
    #[serde(default)]
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberListData {
    pub members: Vec<OnlineMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinLeaveData {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub items: Vec<RoomPlaylistItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongDelData {
    pub position: i32,
}

/// Inbound `playlist` frame payload: both fields present means a reorder,
/// both absent means a snapshot request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistOpData {
    #[serde(default)]
    pub from: Option<i32>,
    #[serde(default)]
    pub to: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongSearchData {
    pub keyword: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSyncData {
    pub user_id: i64,
    pub mode: MemberMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleUpdateData {
    pub user_id: i64,
    pub role: crate::models::RoomRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantControlData {
    pub target_user_id: i64,
    pub can_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOwnerData {
    pub target_user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekData {
    pub position: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = WsFrame {
            kind: RoomWsMessageType::Chat,
            room_id: "r1".to_string(),
            user_id: 42,
            username: "alice".to_string(),
            data: r#"{"content":"hello"}"#.to_string(),
            timestamp: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"chat""#));
        assert!(json.contains(r#""roomId":"r1""#));

        let back: WsFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, RoomWsMessageType::Chat);
        let chat: ChatData = back.payload().unwrap();
        assert_eq!(chat.content, "hello");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"bogus","roomId":"r1","userId":1,"username":"a","data":"","timestamp":0}"#;
        assert!(serde_json::from_str::<WsFrame>(raw).is_err());
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let frame = WsFrame {
            kind: RoomWsMessageType::MasterSync,
            room_id: "r1".to_string(),
            user_id: 1,
            username: "a".to_string(),
            data: "not json".to_string(),
            timestamp: 0,
        };
        match frame.payload::<MasterSyncData>() {
            Err(AppError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn message_type_tags_are_snake_case() {
        let cases = [
            (RoomWsMessageType::MemberList, "member_list"),
            (RoomWsMessageType::SongAdd, "song_add"),
            (RoomWsMessageType::SongDel, "song_del"),
            (RoomWsMessageType::SongSearch, "song_search"),
            (RoomWsMessageType::RoleUpdate, "role_update"),
            (RoomWsMessageType::GrantControl, "grant_control"),
            (RoomWsMessageType::MasterSync, "master_sync"),
            (RoomWsMessageType::MasterRequest, "master_request"),
            (RoomWsMessageType::MasterMode, "master_mode"),
            (RoomWsMessageType::SongChange, "song_change"),
            (RoomWsMessageType::RoomDisband, "room_disband"),
            (RoomWsMessageType::ModeSync, "mode_sync"),
            (RoomWsMessageType::TransferOwner, "transfer_owner"),
            (RoomWsMessageType::Ping, "ping"),
            (RoomWsMessageType::Pong, "pong"),
            (RoomWsMessageType::Next, "next"),
            (RoomWsMessageType::Prev, "prev"),
        ];
        for (kind, tag) in cases {
            assert_eq!(serde_json::to_value(kind).unwrap(), tag, "{kind:?}");
        }
    }

    #[test]
    fn empty_payload_defaults() {
        let frame = WsFrame {
            kind: RoomWsMessageType::Playlist,
            room_id: "r1".to_string(),
            user_id: 1,
            username: "a".to_string(),
            data: String::new(),
            timestamp: 0,
        };
        let op: PlaylistOpData = frame.payload_or_default().unwrap();
        assert!(op.from.is_none() && op.to.is_none());

        let frame = WsFrame {
            data: r#"{"from":1,"to":0}"#.to_string(),
            ..frame
        };
        let op: PlaylistOpData = frame.payload_or_default().unwrap();
        assert_eq!((op.from, op.to), (Some(1), Some(0)));
    }

    #[test]
    fn master_sync_defaults_server_fields() {
        let data: MasterSyncData =
            serde_json::from_str(r#"{"songId":"local_1","position":30.0,"isPlaying":true,"timestamp":1000}"#)
                .unwrap();
        assert_eq!(data.server_timestamp, 0);
        assert_eq!(data.master_id, 0);
    }
}
