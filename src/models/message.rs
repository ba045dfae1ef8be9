use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[sqlx(rename = "chat")]
    Chat,
    #[sqlx(rename = "system")]
    System,
    #[sqlx(rename = "song_search_result")]
    SongSearchResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: i64,
    pub room_id: String,
    pub user_id: i64,
    pub username: String,
    pub kind: MessageKind,
    pub content: String,
    /// Structured payload for non-chat kinds (e.g. search result candidates).
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A candidate song embedded in a `song_search_result` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongCandidate {
    pub id: String,
    pub name: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hls_url: Option<String>,
    pub source: String,
}
