//! Shared room cache.
//!
//! Hot-path reads (member roster, playlist, playback, master frames) and the
//! cross-instance pub/sub channel live here. Everything durable is owned by
//! the store; the cache is authoritative only for the lowest-latency reads
//! and for ephemeral state like the current master frame.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{MemberMode, OnlineMember, PlaybackState, RoomPlaylistItem, WsFrame};

/// A master frame older than this is considered gone; followers render
/// "no master" until a fresh one arrives.
pub const MASTER_FRAME_TTL_SECS: u64 = 10;
/// Cross-instance advisory lock TTL for a stream transcode.
const STREAM_LOCK_TTL_SECS: usize = 15 * 60;
/// Registered source URLs for external streams.
const STREAM_SOURCE_TTL_SECS: u64 = 24 * 60 * 60;

const ACTIVE_ROOMS_KEY: &str = "rooms:active";

/// Envelope carried on `room:{id}:events` so instances that do not own a
/// connection can still deliver to their local members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Instance that originated the broadcast; used to skip self-delivery.
    pub origin: String,
    pub room_id: String,
    pub frame: WsFrame,
    pub except: Option<i64>,
    /// When set, deliver to this user only (wherever they are connected).
    pub only: Option<i64>,
    pub mode_filter: Option<MemberMode>,
}

#[derive(Clone)]
pub struct RoomCache {
    redis: ConnectionManager,
    client: redis::Client,
    instance_id: String,
}

fn members_key(room_id: &str) -> String {
    format!("room:{room_id}:members")
}

fn playlist_key(room_id: &str) -> String {
    format!("room:{room_id}:playlist")
}

fn playback_key(room_id: &str) -> String {
    format!("room:{room_id}:playback")
}

fn master_key(room_id: &str) -> String {
    format!("room:{room_id}:master")
}

fn events_channel(room_id: &str) -> String {
    format!("room:{room_id}:events")
}

fn stream_source_key(stream_id: &str) -> String {
    format!("stream:{stream_id}:source")
}

fn stream_lock_key(stream_id: &str) -> String {
    format!("stream:{stream_id}:lock")
}

impl RoomCache {
    pub fn new(redis: ConnectionManager, client: redis::Client, instance_id: String) -> Self {
        Self {
            redis,
            client,
            instance_id,
        }
    }

    // ---- online member roster ----

    pub async fn member_online(&self, room_id: &str, member: &OnlineMember) -> Result<()> {
        let mut con = self.redis.clone();
        let json = serde_json::to_string(member).expect("member serializes");
        let _: () = con.hset(members_key(room_id), member.user_id, json).await?;
        let _: () = con.sadd(ACTIVE_ROOMS_KEY, room_id).await?;
        Ok(())
    }

    pub async fn member_offline(&self, room_id: &str, user_id: i64) -> Result<()> {
        let mut con = self.redis.clone();
        let _: () = con.hdel(members_key(room_id), user_id).await?;
        let remaining: i64 = con.hlen(members_key(room_id)).await?;
        if remaining == 0 {
            let _: () = con.srem(ACTIVE_ROOMS_KEY, room_id).await?;
        }
        Ok(())
    }

    /// Refresh a roster entry after a role/mode/control change, but only if
    /// the member is currently online.
    pub async fn update_member_if_online(
        &self,
        room_id: &str,
        member: &OnlineMember,
    ) -> Result<()> {
        let mut con = self.redis.clone();
        let online: bool = con.hexists(members_key(room_id), member.user_id).await?;
        if online {
            let json = serde_json::to_string(member).expect("member serializes");
            let _: () = con.hset(members_key(room_id), member.user_id, json).await?;
        }
        Ok(())
    }

    pub async fn online_members(&self, room_id: &str) -> Result<Vec<OnlineMember>> {
        let mut con = self.redis.clone();
        let raw: Vec<String> = con.hvals(members_key(room_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }

    pub async fn active_rooms(&self) -> Result<Vec<String>> {
        let mut con = self.redis.clone();
        Ok(con.smembers(ACTIVE_ROOMS_KEY).await?)
    }

    // ---- playlist mirror ----

    pub async fn playlist_append(&self, room_id: &str, item: &RoomPlaylistItem) -> Result<()> {
        let mut con = self.redis.clone();
        let json = serde_json::to_string(item).expect("playlist item serializes");
        let _: () = con.rpush(playlist_key(room_id), json).await?;
        Ok(())
    }

    /// Atomic full replace, used after removals and reorders so the mirror
    /// always matches the store's contiguous positions.
    pub async fn playlist_replace(&self, room_id: &str, items: &[RoomPlaylistItem]) -> Result<()> {
        let mut con = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(playlist_key(room_id));
        for item in items {
            let json = serde_json::to_string(item).expect("playlist item serializes");
            pipe.rpush(playlist_key(room_id), json);
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    pub async fn playlist(&self, room_id: &str) -> Result<Vec<RoomPlaylistItem>> {
        let mut con = self.redis.clone();
        let raw: Vec<String> = con.lrange(playlist_key(room_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }

    // ---- playback / master frames ----

    pub async fn set_playback(&self, room_id: &str, state: &PlaybackState) -> Result<()> {
        let mut con = self.redis.clone();
        let json = serde_json::to_string(state).expect("playback serializes");
        let _: () = con.set(playback_key(room_id), json).await?;
        Ok(())
    }

    pub async fn playback(&self, room_id: &str) -> Result<Option<PlaybackState>> {
        let mut con = self.redis.clone();
        let raw: Option<String> = con.get(playback_key(room_id)).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Write the master frame with a short TTL; a master that stops
    /// reporting (or disconnects) ages out automatically.
    pub async fn set_master_frame(&self, room_id: &str, frame_json: &str) -> Result<()> {
        let mut con = self.redis.clone();
        let _: () = con
            .set_ex(master_key(room_id), frame_json, MASTER_FRAME_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn master_frame(&self, room_id: &str) -> Result<Option<String>> {
        let mut con = self.redis.clone();
        Ok(con.get(master_key(room_id)).await?)
    }

    pub async fn clear_room(&self, room_id: &str) -> Result<()> {
        let mut con = self.redis.clone();
        let keys = [
            members_key(room_id),
            playlist_key(room_id),
            playback_key(room_id),
            master_key(room_id),
        ];
        let _: () = con.del(&keys[..]).await?;
        let _: () = con.srem(ACTIVE_ROOMS_KEY, room_id).await?;
        Ok(())
    }

    // ---- stream coordination ----

    pub async fn register_stream_source(&self, stream_id: &str, url: &str) -> Result<()> {
        let mut con = self.redis.clone();
        let _: () = con
            .set_ex(stream_source_key(stream_id), url, STREAM_SOURCE_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn stream_source(&self, stream_id: &str) -> Result<Option<String>> {
        let mut con = self.redis.clone();
        Ok(con.get(stream_source_key(stream_id)).await?)
    }

    /// Cross-instance advisory lock: true when this instance should drive
    /// the transcode for `stream_id`.
    pub async fn try_lock_stream(&self, stream_id: &str) -> Result<bool> {
        let mut con = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(stream_lock_key(stream_id))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(STREAM_LOCK_TTL_SECS)
            .query_async(&mut con)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn unlock_stream(&self, stream_id: &str) -> Result<()> {
        let mut con = self.redis.clone();
        let _: () = con.del(stream_lock_key(stream_id)).await?;
        Ok(())
    }

    // ---- cross-instance fan-out ----

    pub async fn publish_event(
        &self,
        room_id: &str,
        frame: &WsFrame,
        except: Option<i64>,
        only: Option<i64>,
        mode_filter: Option<MemberMode>,
    ) -> Result<()> {
        let envelope = EventEnvelope {
            origin: self.instance_id.clone(),
            room_id: room_id.to_string(),
            frame: frame.clone(),
            except,
            only,
            mode_filter,
        };
        let mut con = self.redis.clone();
        let json = serde_json::to_string(&envelope).expect("envelope serializes");
        let _: () = con.publish(events_channel(room_id), json).await?;
        Ok(())
    }

    /// Long-running pub/sub listener. Envelopes originated elsewhere are
    /// forwarded to `tx` (the hub turns them into local broadcasts).
    /// Reconnects with a flat backoff on connection loss.
    pub fn spawn_event_listener(&self, tx: mpsc::UnboundedSender<EventEnvelope>) {
        let client = self.client.clone();
        let own_instance = self.instance_id.clone();
        tokio::spawn(async move {
            loop {
                match Self::listen(&client, &own_instance, &tx).await {
                    Ok(()) => break, // receiver dropped, shutting down
                    Err(e) => {
                        warn!("room event listener lost connection: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    async fn listen(
        client: &redis::Client,
        own_instance: &str,
        tx: &mpsc::UnboundedSender<EventEnvelope>,
    ) -> std::result::Result<(), redis::RedisError> {
        use futures::StreamExt;

        let con = client.get_async_connection().await?;
        let mut pubsub = con.into_pubsub();
        pubsub.psubscribe("room:*:events").await?;
        debug!("subscribed to room event channels");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!("undecodable room event payload: {e}");
                    continue;
                }
            };
            let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                Ok(env) => env,
                Err(e) => {
                    warn!("malformed room event envelope: {e}");
                    continue;
                }
            };
            // Local broadcasts were already delivered by the originating hub.
            if envelope.origin == own_instance {
                continue;
            }
            if tx.send(envelope).is_err() {
                return Ok(());
            }
        }
        Err(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "pub/sub stream ended",
        )))
    }
}
