use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum SongSource {
    #[sqlx(rename = "local")]
    Local,
    #[sqlx(rename = "external")]
    External,
}

impl SongSource {
    pub fn is_external(&self) -> bool {
        matches!(self, SongSource::External)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPlaylistItem {
    pub room_id: String,
    /// Contiguous 0..n-1 within the room, maintained by the store.
    pub position: i32,
    /// `{source}_{catalogId}` for catalog songs, upload id for local files.
    pub song_id: String,
    pub name: String,
    pub artist: String,
    pub cover: Option<String>,
    pub duration: Option<i32>,
    pub source: SongSource,
    pub added_by: i64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub room_id: String,
    pub current_song_id: Option<String>,
    /// Playback position in seconds.
    pub position: f64,
    pub is_playing: bool,
    pub master_id: i64,
    pub master_name: String,
    pub updated_at: DateTime<Utc>,
    /// Server-assigned epoch milliseconds; followers order frames by this.
    pub server_timestamp: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddSongRequest {
    #[validate(length(min = 1, max = 128))]
    pub song_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 255))]
    pub artist: String,
    pub cover: Option<String>,
    pub duration: Option<i32>,
    pub source: Option<SongSource>,
    /// Origin URL for external sources, registered for the transcode pipeline.
    pub hls_url: Option<String>,
}
