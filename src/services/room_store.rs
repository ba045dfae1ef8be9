//! Durable room persistence.
//!
//! All multi-row playlist mutations run inside a transaction that first takes
//! a row lock on the room (`SELECT ... FOR UPDATE`), making the store the
//! serialization point for `song_add`/`song_del` ordering. Positions are kept
//! a contiguous 0..n-1 permutation; the unique `(room_id, position)`
//! constraint is deferred so the close-the-gap update can shift rows freely.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    MemberMode, MessageKind, PlaybackState, Room, RoomMember, RoomMessage, RoomPlaylistItem,
    SongSource,
};

/// Maximum chat history window per read.
pub const MAX_MESSAGE_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct RoomStore {
    db: PgPool,
}

pub struct NewPlaylistItem {
    pub song_id: String,
    pub name: String,
    pub artist: String,
    pub cover: Option<String>,
    pub duration: Option<i32>,
    pub source: SongSource,
    pub added_by: i64,
}

impl RoomStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    // ---- rooms ----

    pub async fn create_room(
        &self,
        name: &str,
        owner_id: i64,
        owner_name: &str,
    ) -> Result<(Room, RoomMember)> {
        let room_id = Uuid::new_v4().simple().to_string();
        let mut tx = self.db.begin().await?;

        let room = sqlx::query_as::<_, Room>(
            r#"
            INSERT INTO rooms (id, name, owner_id, mode)
            VALUES ($1, $2, $3, 'chat')
            RETURNING *
            "#,
        )
        .bind(&room_id)
        .bind(name)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;

        let member = sqlx::query_as::<_, RoomMember>(
            r#"
            INSERT INTO room_members (room_id, user_id, username, role, mode, can_control)
            VALUES ($1, $2, $3, 'owner', 'chat', false)
            RETURNING *
            "#,
        )
        .bind(&room_id)
        .bind(owner_id)
        .bind(owner_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((room, member))
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Room> {
        sqlx::query_as::<_, Room>("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("Room not found".to_string()))
    }

    pub async fn rooms_for_user(&self, user_id: i64) -> Result<Vec<Room>> {
        let rooms = sqlx::query_as::<_, Room>(
            r#"
            SELECT r.* FROM rooms r
            JOIN room_members m ON m.room_id = r.id
            WHERE m.user_id = $1 AND r.disbanded = false
            ORDER BY r.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rooms)
    }

    pub async fn disband_room(&self, room_id: &str, by_user_id: i64) -> Result<()> {
        let room = self.get_room(room_id).await?;
        if room.owner_id != by_user_id {
            return Err(AppError::NotOwner);
        }
        sqlx::query("UPDATE rooms SET disbanded = true WHERE id = $1")
            .bind(room_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ---- membership ----

    /// Idempotent join: inserts on first join, otherwise refreshes
    /// `last_seen` and returns the existing membership unchanged.
    pub async fn ensure_member(
        &self,
        room_id: &str,
        user_id: i64,
        username: &str,
    ) -> Result<RoomMember> {
        let member = sqlx::query_as::<_, RoomMember>(
            r#"
            INSERT INTO room_members (room_id, user_id, username, role, mode, can_control)
            VALUES ($1, $2, $3, 'member', 'chat', false)
            ON CONFLICT (room_id, user_id)
            DO UPDATE SET last_seen = NOW()
            RETURNING *
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(username)
        .fetch_one(&self.db)
        .await?;
        Ok(member)
    }

    pub async fn get_member(&self, room_id: &str, user_id: i64) -> Result<Option<RoomMember>> {
        let member = sqlx::query_as::<_, RoomMember>(
            "SELECT * FROM room_members WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(member)
    }

    /// Membership required by nearly every room operation.
    pub async fn require_member(&self, room_id: &str, user_id: i64) -> Result<RoomMember> {
        self.get_member(room_id, user_id)
            .await?
            .ok_or(AppError::NotMember)
    }

    pub async fn list_members(&self, room_id: &str) -> Result<Vec<RoomMember>> {
        let members = sqlx::query_as::<_, RoomMember>(
            "SELECT * FROM room_members WHERE room_id = $1 ORDER BY joined_at ASC",
        )
        .bind(room_id)
        .fetch_all(&self.db)
        .await?;
        Ok(members)
    }

    pub async fn remove_member(&self, room_id: &str, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Heartbeat bookkeeping.
    pub async fn touch_member(&self, room_id: &str, user_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE room_members SET last_seen = NOW() WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn member_count(&self, room_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM room_members WHERE room_id = $1")
                .bind(room_id)
                .fetch_one(&self.db)
                .await?;
        Ok(count)
    }

    /// Earliest-joined member other than `excluding`, the auto-transfer
    /// target when the owner leaves.
    pub async fn earliest_member(
        &self,
        room_id: &str,
        excluding: i64,
    ) -> Result<Option<RoomMember>> {
        let member = sqlx::query_as::<_, RoomMember>(
            r#"
            SELECT * FROM room_members
            WHERE room_id = $1 AND user_id != $2
            ORDER BY joined_at ASC
            LIMIT 1
            "#,
        )
        .bind(room_id)
        .bind(excluding)
        .fetch_optional(&self.db)
        .await?;
        Ok(member)
    }

    pub async fn update_member_mode(
        &self,
        room_id: &str,
        user_id: i64,
        mode: MemberMode,
    ) -> Result<RoomMember> {
        sqlx::query_as::<_, RoomMember>(
            r#"
            UPDATE room_members SET mode = $3, last_seen = NOW()
            WHERE room_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(mode)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::NotMember)
    }

    pub async fn set_can_control(
        &self,
        room_id: &str,
        target_user_id: i64,
        can_control: bool,
    ) -> Result<RoomMember> {
        sqlx::query_as::<_, RoomMember>(
            r#"
            UPDATE room_members SET can_control = $3
            WHERE room_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(room_id)
        .bind(target_user_id)
        .bind(can_control)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::Conflict("Target is not a member of this room".to_string()))
    }

    /// Atomic ownership transfer: demotes the current owner, promotes the
    /// target, and repoints the room, all under the room row lock.
    pub async fn transfer_owner(
        &self,
        room_id: &str,
        from_user_id: i64,
        to_user_id: i64,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let owner_id: Option<i64> =
            sqlx::query_scalar("SELECT owner_id FROM rooms WHERE id = $1 FOR UPDATE")
                .bind(room_id)
                .fetch_optional(&mut *tx)
                .await?;
        match owner_id {
            None => return Err(AppError::NotFound("Room not found".to_string())),
            Some(id) if id != from_user_id => return Err(AppError::NotOwner),
            Some(_) => {}
        }

        let target_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(room_id)
        .bind(to_user_id)
        .fetch_one(&mut *tx)
        .await?;
        if !target_exists {
            return Err(AppError::Conflict(
                "Transfer target is not a member of this room".to_string(),
            ));
        }

        sqlx::query(
            "UPDATE room_members SET role = 'member' WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(from_user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE room_members SET role = 'owner', can_control = false WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(to_user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE rooms SET owner_id = $2 WHERE id = $1")
            .bind(room_id)
            .bind(to_user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- messages ----

    pub async fn append_message(
        &self,
        room_id: &str,
        user_id: i64,
        username: &str,
        kind: MessageKind,
        content: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<RoomMessage> {
        let message = sqlx::query_as::<_, RoomMessage>(
            r#"
            INSERT INTO room_messages (room_id, user_id, username, kind, content, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(username)
        .bind(kind)
        .bind(content)
        .bind(payload)
        .fetch_one(&self.db)
        .await?;
        Ok(message)
    }

    /// Windowed history read: offset 0 is the newest message; the returned
    /// page is in ascending id order for display.
    pub async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMessage>> {
        let limit = limit.clamp(1, MAX_MESSAGE_LIMIT);
        let mut messages = sqlx::query_as::<_, RoomMessage>(
            r#"
            SELECT * FROM room_messages
            WHERE room_id = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;
        messages.reverse();
        Ok(messages)
    }

    // ---- playlist ----

    /// Appends at `max + 1` under the room row lock; returns the stored item
    /// with its assigned position.
    pub async fn add_playlist_item(
        &self,
        room_id: &str,
        item: NewPlaylistItem,
    ) -> Result<RoomPlaylistItem> {
        let mut tx = self.db.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound("Room not found".to_string()));
        }

        let stored = sqlx::query_as::<_, RoomPlaylistItem>(
            r#"
            INSERT INTO room_playlist
                (room_id, position, song_id, name, artist, cover, duration, source, added_by)
            SELECT $1, COALESCE(MAX(position) + 1, 0), $2, $3, $4, $5, $6, $7, $8
            FROM room_playlist WHERE room_id = $1
            RETURNING *
            "#,
        )
        .bind(room_id)
        .bind(&item.song_id)
        .bind(&item.name)
        .bind(&item.artist)
        .bind(&item.cover)
        .bind(item.duration)
        .bind(item.source)
        .bind(item.added_by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    /// Deletes at `position` and closes the gap, keeping positions a
    /// contiguous 0..n-1 permutation. Returns the removed item.
    pub async fn remove_playlist_item(
        &self,
        room_id: &str,
        position: i32,
    ) -> Result<RoomPlaylistItem> {
        let mut tx = self.db.begin().await?;

        sqlx::query("SELECT id FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Room not found".to_string()))?;

        let removed = sqlx::query_as::<_, RoomPlaylistItem>(
            "DELETE FROM room_playlist WHERE room_id = $1 AND position = $2 RETURNING *",
        )
        .bind(room_id)
        .bind(position)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No playlist item at position {position}")))?;

        sqlx::query(
            "UPDATE room_playlist SET position = position - 1 WHERE room_id = $1 AND position > $2",
        )
        .bind(room_id)
        .bind(position)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed)
    }

    /// Moves the item at `from` to `to`, shifting everything in between by
    /// one. Returns the playlist in its new order.
    pub async fn move_playlist_item(
        &self,
        room_id: &str,
        from: i32,
        to: i32,
    ) -> Result<Vec<RoomPlaylistItem>> {
        let mut tx = self.db.begin().await?;

        sqlx::query("SELECT id FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Room not found".to_string()))?;

        let len: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM room_playlist WHERE room_id = $1")
                .bind(room_id)
                .fetch_one(&mut *tx)
                .await?;
        if from < 0 || to < 0 || from as i64 >= len || to as i64 >= len {
            return Err(AppError::Validation(format!(
                "Reorder {from} -> {to} is out of range for {len} items"
            )));
        }
        if from != to {
            // Park the moving row one past the end so the window shift sees
            // exactly the rows between the two positions. Duplicate songs
            // are legal, so rows are addressed by position only.
            sqlx::query(
                "UPDATE room_playlist SET position = $3 WHERE room_id = $1 AND position = $2",
            )
            .bind(room_id)
            .bind(from)
            .bind(len as i32)
            .execute(&mut *tx)
            .await?;

            if from < to {
                sqlx::query(
                    "UPDATE room_playlist SET position = position - 1
                     WHERE room_id = $1 AND position > $2 AND position <= $3",
                )
                .bind(room_id)
                .bind(from)
                .bind(to)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE room_playlist SET position = position + 1
                     WHERE room_id = $1 AND position >= $3 AND position < $2",
                )
                .bind(room_id)
                .bind(from)
                .bind(to)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                "UPDATE room_playlist SET position = $3 WHERE room_id = $1 AND position = $2",
            )
            .bind(room_id)
            .bind(len as i32)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        }

        let items = sqlx::query_as::<_, RoomPlaylistItem>(
            "SELECT * FROM room_playlist WHERE room_id = $1 ORDER BY position ASC",
        )
        .bind(room_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(items)
    }

    pub async fn list_playlist(&self, room_id: &str) -> Result<Vec<RoomPlaylistItem>> {
        let items = sqlx::query_as::<_, RoomPlaylistItem>(
            "SELECT * FROM room_playlist WHERE room_id = $1 ORDER BY position ASC",
        )
        .bind(room_id)
        .fetch_all(&self.db)
        .await?;
        Ok(items)
    }

    // ---- playback ----

    pub async fn upsert_playback(&self, state: &PlaybackState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO room_playback
                (room_id, current_song_id, position, is_playing, master_id, master_name,
                 updated_at, server_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7)
            ON CONFLICT (room_id) DO UPDATE SET
                current_song_id = EXCLUDED.current_song_id,
                position = EXCLUDED.position,
                is_playing = EXCLUDED.is_playing,
                master_id = EXCLUDED.master_id,
                master_name = EXCLUDED.master_name,
                updated_at = NOW(),
                server_timestamp = EXCLUDED.server_timestamp
            "#,
        )
        .bind(&state.room_id)
        .bind(&state.current_song_id)
        .bind(state.position)
        .bind(state.is_playing)
        .bind(state.master_id)
        .bind(&state.master_name)
        .bind(state.server_timestamp)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_playback(&self, room_id: &str) -> Result<Option<PlaybackState>> {
        let state = sqlx::query_as::<_, PlaybackState>(
            "SELECT * FROM room_playback WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(state)
    }

}
