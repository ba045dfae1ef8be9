//! Room business rules.
//!
//! Every operation takes the caller's verified identity, mutates the store
//! and cache, and hands broadcast envelopes to the hub (local delivery) and
//! the cache pub/sub channel (other instances). The WebSocket read pump
//! funnels inbound frames through [`RoomManager::handle_frame`].

use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::ws::{
    ChatData, GrantControlData, JoinLeaveData, MasterSyncData, MemberListData, ModeSyncData,
    PlaylistData, PlaylistOpData, RoleUpdateData, SeekData, SongChangeData, SongDelData,
    SongSearchData, TransferOwnerData,
};
use crate::models::{
    AddSongRequest, MemberMode, MessageKind, OnlineMember, PlaybackState, Room, RoomMember,
    RoomMessage, RoomPlaylistItem, RoomRole, RoomWsMessageType, SongSource, WsFrame,
};
use crate::services::auth::Claims;
use crate::services::catalog::CatalogClient;
use crate::services::room_cache::RoomCache;
use crate::services::room_hub::RoomHub;
use crate::services::room_store::{NewPlaylistItem, RoomStore};
use crate::services::stream_processor::StreamProcessor;

/// Chat posting quota per user.
const CHAT_QUOTA_PER_MINUTE: u32 = 30;
/// Longest accepted chat message.
const MAX_CHAT_LENGTH: usize = 2000;
/// Search results requested from the catalog.
const SEARCH_RESULT_LIMIT: usize = 20;

type ChatLimiter = RateLimiter<i64, DefaultKeyedStateStore<i64>, DefaultClock>;

/// One connected WebSocket, as seen by the dispatch path.
#[derive(Clone)]
pub struct ClientCtx {
    pub room_id: String,
    pub user_id: i64,
    pub username: String,
    pub conn_id: u64,
    pub out: mpsc::Sender<WsFrame>,
}

/// Full room view for REST snapshot reads.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub members: Vec<RoomMember>,
    pub playlist: Vec<RoomPlaylistItem>,
    pub playback: Option<PlaybackState>,
}

pub struct RoomManager {
    store: RoomStore,
    cache: RoomCache,
    hub: Arc<RoomHub>,
    streams: Arc<StreamProcessor>,
    catalog: Option<Arc<CatalogClient>>,
    chat_limiter: ChatLimiter,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A member may write master frames when they control playback and are
/// themselves listening.
fn is_master_eligible(member: &RoomMember) -> bool {
    member.controls_playback() && member.mode == MemberMode::Listen
}

/// Followers and the server both drop frames older than the newest applied.
fn frame_is_stale(latest_server_ts: i64, incoming_server_ts: i64) -> bool {
    incoming_server_ts < latest_server_ts
}

/// Index of the playlist entry adjacent to the current song. `step` is +1
/// for next, -1 for prev. An empty playlist or an unknown current song with
/// a backwards step yields nothing.
fn adjacent_song<'a>(
    playlist: &'a [RoomPlaylistItem],
    current_song_id: Option<&str>,
    step: i32,
) -> Option<&'a RoomPlaylistItem> {
    if playlist.is_empty() {
        return None;
    }
    let current = current_song_id.and_then(|id| playlist.iter().position(|i| i.song_id == id));
    let target = match current {
        Some(idx) => idx as i32 + step,
        // No current song: "next" starts from the top, "prev" has nowhere
        // to go.
        None if step > 0 => 0,
        None => return None,
    };
    if target < 0 {
        return None;
    }
    playlist.get(target as usize)
}

impl RoomManager {
    pub fn new(
        store: RoomStore,
        cache: RoomCache,
        hub: Arc<RoomHub>,
        streams: Arc<StreamProcessor>,
        catalog: Option<Arc<CatalogClient>>,
    ) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(CHAT_QUOTA_PER_MINUTE).expect("nonzero"));
        Self {
            store,
            cache,
            hub,
            streams,
            catalog,
            chat_limiter: RateLimiter::keyed(quota),
        }
    }

    /// Local broadcast plus cross-instance fan-out.
    async fn broadcast(
        &self,
        room_id: &str,
        frame: WsFrame,
        except: Option<i64>,
        mode_filter: Option<MemberMode>,
    ) {
        self.hub
            .broadcast(room_id, frame.clone(), except, mode_filter);
        if let Err(e) = self
            .cache
            .publish_event(room_id, &frame, except, None, mode_filter)
            .await
        {
            warn!(room_id, "cross-instance publish failed: {e}");
        }
    }

    async fn send_to(&self, room_id: &str, user_id: i64, frame: WsFrame) {
        self.hub.send_to(room_id, user_id, frame.clone());
        if let Err(e) = self
            .cache
            .publish_event(room_id, &frame, None, Some(user_id), None)
            .await
        {
            warn!(room_id, "cross-instance publish failed: {e}");
        }
    }

    async fn system_message(&self, room_id: &str, content: &str) {
        match self
            .store
            .append_message(room_id, 0, "system", MessageKind::System, content, None)
            .await
        {
            Ok(message) => {
                let frame = WsFrame::server(RoomWsMessageType::Chat, room_id, &message);
                self.broadcast(room_id, frame, None, None).await;
            }
            Err(e) => warn!(room_id, "failed to append system message: {e}"),
        }
    }

    // ---- room lifecycle ----

    pub async fn create_room(&self, claims: &Claims, name: &str) -> Result<(Room, RoomMember)> {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(AppError::Validation(
                "Room name must be 1-100 characters".to_string(),
            ));
        }
        let (room, member) = self
            .store
            .create_room(name, claims.sub, &claims.username)
            .await?;
        info!(room_id = %room.id, owner = claims.sub, "room created");
        Ok((room, member))
    }

    /// Idempotent join: an existing member gets their current membership
    /// back; a new member is announced to the room.
    pub async fn join_room(&self, claims: &Claims, room_id: &str) -> Result<(Room, RoomMember)> {
        let room = self.store.get_room(room_id).await?;
        if room.disbanded {
            return Err(AppError::Disbanded);
        }

        let already_member = self.store.get_member(room_id, claims.sub).await?.is_some();
        let member = self
            .store
            .ensure_member(room_id, claims.sub, &claims.username)
            .await?;

        if !already_member {
            let frame = WsFrame::server(
                RoomWsMessageType::Join,
                room_id,
                &JoinLeaveData {
                    user_id: claims.sub,
                    username: claims.username.clone(),
                },
            );
            self.broadcast(room_id, frame, Some(claims.sub), None).await;
            self.system_message(room_id, &format!("{} joined the room", claims.username))
                .await;
        }
        Ok((room, member))
    }

    pub async fn leave_room(
        &self,
        claims: &Claims,
        room_id: &str,
        transfer_to: Option<i64>,
    ) -> Result<()> {
        let member = self.store.require_member(room_id, claims.sub).await?;

        if member.role == RoomRole::Owner {
            let others = self.store.member_count(room_id).await? - 1;
            if others == 0 {
                // Last member out: the room is gone.
                return self.disband_room(claims, room_id).await;
            }
            let target = match transfer_to {
                Some(user_id) => user_id,
                None => {
                    self.store
                        .earliest_member(room_id, claims.sub)
                        .await?
                        .ok_or_else(|| {
                            AppError::Conflict("No member available for transfer".to_string())
                        })?
                        .user_id
                }
            };
            self.transfer_owner_inner(room_id, claims.sub, target).await?;
        }

        self.store.remove_member(room_id, claims.sub).await?;
        self.cache.member_offline(room_id, claims.sub).await?;
        self.hub.kick(
            room_id,
            claims.sub,
            Some(WsFrame::server(
                RoomWsMessageType::Leave,
                room_id,
                &JoinLeaveData {
                    user_id: claims.sub,
                    username: claims.username.clone(),
                },
            )),
        );

        let frame = WsFrame::server(
            RoomWsMessageType::Leave,
            room_id,
            &JoinLeaveData {
                user_id: claims.sub,
                username: claims.username.clone(),
            },
        );
        self.broadcast(room_id, frame, Some(claims.sub), None).await;
        self.system_message(room_id, &format!("{} left the room", claims.username))
            .await;
        Ok(())
    }

    pub async fn disband_room(&self, claims: &Claims, room_id: &str) -> Result<()> {
        self.store.disband_room(room_id, claims.sub).await?;

        let frame = WsFrame::server(
            RoomWsMessageType::RoomDisband,
            room_id,
            &serde_json::json!({ "roomId": room_id }),
        );
        // Other instances see a normal broadcast; their clients close on the
        // disband frame and unregister themselves.
        if let Err(e) = self
            .cache
            .publish_event(room_id, &frame, None, None, None)
            .await
        {
            warn!(room_id, "cross-instance publish failed: {e}");
        }
        self.hub.disband(room_id, frame);
        self.cache.clear_room(room_id).await?;
        info!(room_id, by = claims.sub, "room disbanded");
        Ok(())
    }

    // ---- membership state ----

    pub async fn switch_mode(
        &self,
        claims: &Claims,
        room_id: &str,
        mode: MemberMode,
    ) -> Result<RoomMember> {
        let member = self
            .store
            .update_member_mode(room_id, claims.sub, mode)
            .await?;
        let online = OnlineMember::from(&member);
        self.cache.update_member_if_online(room_id, &online).await?;
        self.hub
            .update_client(room_id, claims.sub, None, Some(mode), None);

        let mode_frame = WsFrame::server(
            RoomWsMessageType::ModeSync,
            room_id,
            &ModeSyncData {
                user_id: claims.sub,
                mode,
            },
        );
        self.broadcast(room_id, mode_frame, None, None).await;
        self.broadcast_member_list(room_id).await;
        Ok(member)
    }

    async fn broadcast_member_list(&self, room_id: &str) {
        match self.cache.online_members(room_id).await {
            Ok(members) => {
                let frame = WsFrame::server(
                    RoomWsMessageType::MemberList,
                    room_id,
                    &MemberListData { members },
                );
                self.broadcast(room_id, frame, None, None).await;
            }
            Err(e) => warn!(room_id, "failed to load online members: {e}"),
        }
    }

    pub async fn transfer_owner(
        &self,
        claims: &Claims,
        room_id: &str,
        target_user_id: i64,
    ) -> Result<()> {
        self.transfer_owner_inner(room_id, claims.sub, target_user_id)
            .await?;
        self.system_message(room_id, "Room ownership was transferred")
            .await;
        Ok(())
    }

    async fn transfer_owner_inner(
        &self,
        room_id: &str,
        from_user_id: i64,
        to_user_id: i64,
    ) -> Result<()> {
        self.store
            .transfer_owner(room_id, from_user_id, to_user_id)
            .await?;

        for (user_id, role) in [(from_user_id, RoomRole::Member), (to_user_id, RoomRole::Owner)] {
            self.hub
                .update_client(room_id, user_id, Some(role), None, None);
            if let Some(member) = self.store.get_member(room_id, user_id).await? {
                self.cache
                    .update_member_if_online(room_id, &OnlineMember::from(&member))
                    .await?;
            }
            let frame = WsFrame::server(
                RoomWsMessageType::RoleUpdate,
                room_id,
                &RoleUpdateData { user_id, role },
            );
            self.broadcast(room_id, frame, None, None).await;
        }
        info!(room_id, from = from_user_id, to = to_user_id, "ownership transferred");
        Ok(())
    }

    pub async fn grant_control(
        &self,
        claims: &Claims,
        room_id: &str,
        target_user_id: i64,
        can_control: bool,
    ) -> Result<()> {
        let room = self.store.get_room(room_id).await?;
        if room.owner_id != claims.sub {
            return Err(AppError::NotOwner);
        }
        let member = self
            .store
            .set_can_control(room_id, target_user_id, can_control)
            .await?;

        self.hub
            .update_client(room_id, target_user_id, None, None, Some(can_control));
        self.cache
            .update_member_if_online(room_id, &OnlineMember::from(&member))
            .await?;

        let frame = WsFrame::server(
            RoomWsMessageType::GrantControl,
            room_id,
            &GrantControlData {
                target_user_id,
                can_control,
            },
        );
        self.broadcast(room_id, frame, None, None).await;
        Ok(())
    }

    // ---- playlist ----

    pub async fn add_song(
        &self,
        claims: &Claims,
        room_id: &str,
        req: AddSongRequest,
    ) -> Result<RoomPlaylistItem> {
        self.store.require_member(room_id, claims.sub).await?;

        let source = req.source.unwrap_or(SongSource::Local);
        let item = self
            .store
            .add_playlist_item(
                room_id,
                NewPlaylistItem {
                    song_id: req.song_id.clone(),
                    name: req.name,
                    artist: req.artist,
                    cover: req.cover,
                    duration: req.duration,
                    source,
                    added_by: claims.sub,
                },
            )
            .await?;
        self.cache.playlist_append(room_id, &item).await?;

        if let Some(url) = req.hls_url {
            if let Err(e) = self.cache.register_stream_source(&req.song_id, &url).await {
                warn!(room_id, song_id = %req.song_id, "failed to register source url: {e}");
            }
        }

        let frame = WsFrame::server(RoomWsMessageType::SongAdd, room_id, &item);
        self.broadcast(room_id, frame, None, None).await;

        // Preheat hint: warming the new song is best-effort.
        let streams = Arc::clone(&self.streams);
        let song_id = item.song_id.clone();
        let is_external = item.source.is_external();
        tokio::spawn(async move {
            if let Err(e) = streams.preheat(&song_id, is_external).await {
                tracing::debug!(%song_id, "preheat hint skipped: {e}");
            }
        });

        Ok(item)
    }

    pub async fn remove_song(
        &self,
        claims: &Claims,
        room_id: &str,
        position: i32,
    ) -> Result<RoomPlaylistItem> {
        self.store.require_member(room_id, claims.sub).await?;

        let removed = self.store.remove_playlist_item(room_id, position).await?;
        let playlist = self.store.list_playlist(room_id).await?;
        self.cache.playlist_replace(room_id, &playlist).await?;

        let del_frame = WsFrame::server(
            RoomWsMessageType::SongDel,
            room_id,
            &SongDelData { position },
        );
        self.broadcast(room_id, del_frame, None, None).await;

        // Authoritative post-mutation state, so clients that missed the
        // incremental frame converge anyway.
        let playlist_frame = WsFrame::server(
            RoomWsMessageType::Playlist,
            room_id,
            &PlaylistData { items: playlist },
        );
        self.broadcast(room_id, playlist_frame, None, None).await;
        Ok(removed)
    }

    pub async fn reorder_song(
        &self,
        claims: &Claims,
        room_id: &str,
        from: i32,
        to: i32,
    ) -> Result<Vec<RoomPlaylistItem>> {
        self.store.require_member(room_id, claims.sub).await?;

        let playlist = self.store.move_playlist_item(room_id, from, to).await?;
        self.cache.playlist_replace(room_id, &playlist).await?;

        let frame = WsFrame::server(
            RoomWsMessageType::Playlist,
            room_id,
            &PlaylistData {
                items: playlist.clone(),
            },
        );
        self.broadcast(room_id, frame, None, None).await;
        Ok(playlist)
    }

    pub async fn playlist(&self, room_id: &str) -> Result<Vec<RoomPlaylistItem>> {
        let cached = self.cache.playlist(room_id).await.unwrap_or_default();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.store.list_playlist(room_id).await
    }

    // ---- chat ----

    pub async fn post_chat(
        &self,
        claims: &Claims,
        room_id: &str,
        content: &str,
    ) -> Result<RoomMessage> {
        self.store.require_member(room_id, claims.sub).await?;

        let content = content.trim();
        if content.is_empty() || content.len() > MAX_CHAT_LENGTH {
            return Err(AppError::Validation(format!(
                "Message must be 1-{MAX_CHAT_LENGTH} characters"
            )));
        }
        self.chat_limiter
            .check_key(&claims.sub)
            .map_err(|_| AppError::RateLimited)?;

        let message = self
            .store
            .append_message(
                room_id,
                claims.sub,
                &claims.username,
                MessageKind::Chat,
                content,
                None,
            )
            .await?;

        let frame = WsFrame::server(RoomWsMessageType::Chat, room_id, &message);
        self.broadcast(room_id, frame, None, None).await;
        Ok(message)
    }

    pub async fn messages(
        &self,
        claims: &Claims,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMessage>> {
        self.store.require_member(room_id, claims.sub).await?;
        self.store.list_messages(room_id, limit, offset).await
    }

    // ---- playback synchronization ----

    /// Accept a master frame: only the current master (owner or delegated
    /// controller, in listen mode) may report, frames are server-stamped,
    /// and anything older than the latest applied frame is dropped.
    pub async fn report_master_playback(
        &self,
        claims: &Claims,
        room_id: &str,
        mut data: MasterSyncData,
    ) -> Result<()> {
        let member = self.store.require_member(room_id, claims.sub).await?;
        if !is_master_eligible(&member) {
            return Err(AppError::NotMaster);
        }

        data.server_timestamp = now_ms();
        data.master_id = member.user_id;
        data.master_name = member.username.clone();

        if let Some(existing) = self.cache.master_frame(room_id).await? {
            if let Ok(previous) = serde_json::from_str::<MasterSyncData>(&existing) {
                if frame_is_stale(previous.server_timestamp, data.server_timestamp) {
                    return Ok(());
                }
            }
        }

        let json = serde_json::to_string(&data).expect("master frame serializes");
        self.cache.set_master_frame(room_id, &json).await?;
        self.cache
            .set_playback(
                room_id,
                &PlaybackState {
                    room_id: room_id.to_string(),
                    current_song_id: data.song_id.clone(),
                    position: data.position,
                    is_playing: data.is_playing,
                    master_id: data.master_id,
                    master_name: data.master_name.clone(),
                    updated_at: Utc::now(),
                    server_timestamp: data.server_timestamp,
                },
            )
            .await?;

        let frame = WsFrame::server(RoomWsMessageType::MasterSync, room_id, &data);
        self.broadcast(room_id, frame, Some(claims.sub), Some(MemberMode::Listen))
            .await;
        Ok(())
    }

    /// Ask the current master to report immediately (e.g. a just-joined
    /// follower wants a position fix).
    pub async fn request_master_playback(&self, claims: &Claims, room_id: &str) -> Result<()> {
        self.store.require_member(room_id, claims.sub).await?;

        let master = self
            .cache
            .master_frame(room_id)
            .await?
            .and_then(|json| serde_json::from_str::<MasterSyncData>(&json).ok())
            .ok_or_else(|| AppError::NotFound("No active master".to_string()))?;

        let frame = WsFrame::server(
            RoomWsMessageType::MasterRequest,
            room_id,
            &JoinLeaveData {
                user_id: claims.sub,
                username: claims.username.clone(),
            },
        );
        self.send_to(room_id, master.master_id, frame).await;
        Ok(())
    }

    /// Song switch from the master/controller; stamped and broadcast to
    /// every member, and persisted as the room's playback state.
    pub async fn song_change(
        &self,
        claims: &Claims,
        room_id: &str,
        mut data: SongChangeData,
    ) -> Result<()> {
        let member = self.store.require_member(room_id, claims.sub).await?;
        if !member.controls_playback() {
            return Err(AppError::NotMaster);
        }

        data.server_timestamp = now_ms();
        let state = PlaybackState {
            room_id: room_id.to_string(),
            current_song_id: Some(data.song_id.clone()),
            position: data.position,
            is_playing: data.is_playing,
            master_id: member.user_id,
            master_name: member.username.clone(),
            updated_at: Utc::now(),
            server_timestamp: data.server_timestamp,
        };
        self.store.upsert_playback(&state).await?;
        self.cache.set_playback(room_id, &state).await?;

        let frame = WsFrame::server(RoomWsMessageType::SongChange, room_id, &data);
        self.broadcast(room_id, frame, None, None).await;
        Ok(())
    }

    /// play / pause / seek from the master, rebroadcast to the room and
    /// persisted so snapshots agree.
    async fn playback_command(
        &self,
        claims: &Claims,
        room_id: &str,
        kind: RoomWsMessageType,
        position: Option<f64>,
    ) -> Result<()> {
        let member = self.store.require_member(room_id, claims.sub).await?;
        if !member.controls_playback() {
            return Err(AppError::NotMaster);
        }

        let previous = self.playback(room_id).await?;
        let is_playing = match kind {
            RoomWsMessageType::Play => true,
            RoomWsMessageType::Pause => false,
            _ => previous.as_ref().map(|p| p.is_playing).unwrap_or(false),
        };
        let state = PlaybackState {
            room_id: room_id.to_string(),
            current_song_id: previous.as_ref().and_then(|p| p.current_song_id.clone()),
            position: position
                .or_else(|| previous.as_ref().map(|p| p.position))
                .unwrap_or(0.0),
            is_playing,
            master_id: member.user_id,
            master_name: member.username.clone(),
            updated_at: Utc::now(),
            server_timestamp: now_ms(),
        };
        self.store.upsert_playback(&state).await?;
        self.cache.set_playback(room_id, &state).await?;

        let frame = WsFrame::server(kind, room_id, &state);
        self.broadcast(room_id, frame, Some(claims.sub), None).await;
        Ok(())
    }

    /// next / prev from the master. An empty playlist (or stepping before
    /// the first item) changes nothing and broadcasts nothing.
    async fn step_song(&self, claims: &Claims, room_id: &str, step: i32) -> Result<()> {
        let member = self.store.require_member(room_id, claims.sub).await?;
        if !member.controls_playback() {
            return Err(AppError::NotMaster);
        }

        let playlist = self.playlist(room_id).await?;
        let playback = self.playback(room_id).await?;
        let current = playback.as_ref().and_then(|p| p.current_song_id.as_deref());

        let Some(next) = adjacent_song(&playlist, current, step) else {
            return Ok(());
        };
        let data = SongChangeData {
            song_id: next.song_id.clone(),
            name: next.name.clone(),
            artist: next.artist.clone(),
            cover: next.cover.clone(),
            position: 0.0,
            is_playing: true,
            server_timestamp: 0,
        };
        self.song_change(claims, room_id, data).await
    }

    pub async fn playback(&self, room_id: &str) -> Result<Option<PlaybackState>> {
        if let Some(state) = self.cache.playback(room_id).await? {
            return Ok(Some(state));
        }
        self.store.get_playback(room_id).await
    }

    // ---- search ----

    async fn search_songs(&self, claims: &Claims, room_id: &str, keyword: &str) -> Result<()> {
        self.store.require_member(room_id, claims.sub).await?;
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| AppError::Validation("Song search is not configured".to_string()))?;

        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(AppError::Validation("Search keyword is empty".to_string()));
        }

        let candidates = catalog.search(keyword, SEARCH_RESULT_LIMIT).await?;
        let payload = serde_json::to_value(&candidates).expect("candidates serialize");
        let message = self
            .store
            .append_message(
                room_id,
                claims.sub,
                &claims.username,
                MessageKind::SongSearchResult,
                keyword,
                Some(payload),
            )
            .await?;

        // Results go back to the searcher only; the message is in history
        // for everyone.
        let frame = WsFrame::server(RoomWsMessageType::SongSearch, room_id, &message);
        self.send_to(room_id, claims.sub, frame).await;
        Ok(())
    }

    // ---- snapshots ----

    pub async fn rooms_for_user(&self, claims: &Claims) -> Result<Vec<Room>> {
        self.store.rooms_for_user(claims.sub).await
    }

    pub async fn room_snapshot(&self, claims: &Claims, room_id: &str) -> Result<RoomSnapshot> {
        self.store.require_member(room_id, claims.sub).await?;
        let room = self.store.get_room(room_id).await?;
        let members = self.store.list_members(room_id).await?;
        let playlist = self.playlist(room_id).await?;
        let playback = self.playback(room_id).await?;
        Ok(RoomSnapshot {
            room,
            members,
            playlist,
            playback,
        })
    }

    // ---- connection lifecycle ----

    /// Attach an authenticated WebSocket to its room: membership check,
    /// roster update, hub registration. The hub sends the roster snapshot
    /// and announces the join.
    pub async fn connect(
        &self,
        claims: &Claims,
        room_id: &str,
        out: mpsc::Sender<WsFrame>,
    ) -> Result<ClientCtx> {
        let room = self.store.get_room(room_id).await?;
        if room.disbanded {
            return Err(AppError::Disbanded);
        }
        let member = self.store.require_member(room_id, claims.sub).await?;

        let online = OnlineMember::from(&member);
        self.cache.member_online(room_id, &online).await?;

        let conn_id = self.hub.next_conn_id();
        self.hub.register(room_id, online, conn_id, out.clone());

        Ok(ClientCtx {
            room_id: room_id.to_string(),
            user_id: claims.sub,
            username: claims.username.clone(),
            conn_id,
            out,
        })
    }

    /// Detach a closed WebSocket. Membership is untouched: rooms are
    /// persistent and a drop is not a leave.
    pub async fn disconnect(&self, ctx: &ClientCtx) {
        self.hub.unregister(&ctx.room_id, ctx.user_id, ctx.conn_id);
        if let Err(e) = self.cache.member_offline(&ctx.room_id, ctx.user_id).await {
            warn!(room_id = %ctx.room_id, "failed to mark member offline: {e}");
        }
    }

    // ---- frame dispatch ----

    /// Route one inbound frame. Errors are returned to the read pump, which
    /// relays them to the offending client only.
    pub async fn handle_frame(&self, ctx: &ClientCtx, frame: WsFrame) -> Result<()> {
        if frame.room_id != ctx.room_id {
            return Err(AppError::Validation("Frame for a different room".to_string()));
        }
        if frame.user_id != ctx.user_id {
            return Err(AppError::Validation("Frame user mismatch".to_string()));
        }
        let claims = Claims {
            sub: ctx.user_id,
            username: ctx.username.clone(),
            exp: 0,
        };
        let room_id = &ctx.room_id;

        match frame.kind {
            RoomWsMessageType::Ping => {
                let pong = WsFrame::server(RoomWsMessageType::Pong, room_id, &serde_json::json!({}));
                let _ = ctx.out.try_send(pong);
                if let Err(e) = self.store.touch_member(room_id, ctx.user_id).await {
                    warn!(room_id, user_id = ctx.user_id, "heartbeat touch failed: {e}");
                }
                Ok(())
            }
            RoomWsMessageType::Chat => {
                let data: ChatData = frame.payload()?;
                self.post_chat(&claims, room_id, &data.content).await?;
                Ok(())
            }
            RoomWsMessageType::SongAdd => {
                let data: AddSongRequest = frame.payload()?;
                self.add_song(&claims, room_id, data).await?;
                Ok(())
            }
            RoomWsMessageType::SongDel => {
                let data: SongDelData = frame.payload()?;
                self.remove_song(&claims, room_id, data.position).await?;
                Ok(())
            }
            RoomWsMessageType::SongSearch => {
                let data: SongSearchData = frame.payload()?;
                self.search_songs(&claims, room_id, &data.keyword).await
            }
            RoomWsMessageType::MasterSync => {
                let data: MasterSyncData = frame.payload()?;
                self.report_master_playback(&claims, room_id, data).await
            }
            RoomWsMessageType::MasterRequest => {
                self.request_master_playback(&claims, room_id).await
            }
            RoomWsMessageType::SongChange => {
                let data: SongChangeData = frame.payload()?;
                self.song_change(&claims, room_id, data).await
            }
            RoomWsMessageType::Play => {
                self.playback_command(&claims, room_id, RoomWsMessageType::Play, None)
                    .await
            }
            RoomWsMessageType::Pause => {
                self.playback_command(&claims, room_id, RoomWsMessageType::Pause, None)
                    .await
            }
            RoomWsMessageType::Seek => {
                let data: SeekData = frame.payload()?;
                self.playback_command(
                    &claims,
                    room_id,
                    RoomWsMessageType::Seek,
                    Some(data.position),
                )
                .await
            }
            RoomWsMessageType::Next => self.step_song(&claims, room_id, 1).await,
            RoomWsMessageType::Prev => self.step_song(&claims, room_id, -1).await,
            RoomWsMessageType::ModeSync => {
                let data: ModeSyncData = frame.payload()?;
                self.switch_mode(&claims, room_id, data.mode).await?;
                Ok(())
            }
            RoomWsMessageType::MasterMode => {
                // Master announcing listen-session state; relayed verbatim
                // to listeners with a server stamp.
                let member = self.store.require_member(room_id, claims.sub).await?;
                if !member.controls_playback() {
                    return Err(AppError::NotMaster);
                }
                let mut relayed = frame.clone();
                relayed.timestamp = now_ms();
                self.broadcast(room_id, relayed, Some(claims.sub), Some(MemberMode::Listen))
                    .await;
                Ok(())
            }
            RoomWsMessageType::TransferOwner => {
                let data: TransferOwnerData = frame.payload()?;
                self.transfer_owner(&claims, room_id, data.target_user_id)
                    .await
            }
            RoomWsMessageType::GrantControl => {
                let data: GrantControlData = frame.payload()?;
                self.grant_control(&claims, room_id, data.target_user_id, data.can_control)
                    .await
            }
            RoomWsMessageType::Leave => {
                self.leave_room(&claims, room_id, None).await
            }
            RoomWsMessageType::RoomDisband => self.disband_room(&claims, room_id).await,
            RoomWsMessageType::MemberList => {
                let members = self.cache.online_members(room_id).await?;
                let reply = WsFrame::server(
                    RoomWsMessageType::MemberList,
                    room_id,
                    &MemberListData { members },
                );
                let _ = ctx.out.try_send(reply);
                Ok(())
            }
            RoomWsMessageType::Playlist => {
                let op: PlaylistOpData = frame.payload_or_default()?;
                match (op.from, op.to) {
                    (Some(from), Some(to)) => {
                        self.reorder_song(&claims, room_id, from, to).await?;
                        Ok(())
                    }
                    (None, None) => {
                        let items = self.playlist(room_id).await?;
                        let reply = WsFrame::server(
                            RoomWsMessageType::Playlist,
                            room_id,
                            &PlaylistData { items },
                        );
                        let _ = ctx.out.try_send(reply);
                        Ok(())
                    }
                    _ => Err(AppError::Validation(
                        "Reorder needs both from and to".to_string(),
                    )),
                }
            }
            RoomWsMessageType::Playback => {
                let playback = self.playback(room_id).await?;
                let reply =
                    WsFrame::server(RoomWsMessageType::Playback, room_id, &playback);
                let _ = ctx.out.try_send(reply);
                Ok(())
            }
            RoomWsMessageType::Sync => {
                // Late joiner asking for the freshest position fix.
                let reply = match self.cache.master_frame(room_id).await? {
                    Some(json) => {
                        let data: MasterSyncData = serde_json::from_str(&json)
                            .map_err(|e| AppError::Internal(anyhow::anyhow!("master frame: {e}")))?;
                        WsFrame::server(RoomWsMessageType::MasterSync, room_id, &data)
                    }
                    None => {
                        let playback = self.playback(room_id).await?;
                        WsFrame::server(RoomWsMessageType::Playback, room_id, &playback)
                    }
                };
                let _ = ctx.out.try_send(reply);
                Ok(())
            }
            // Server-originated types are not valid inbound.
            RoomWsMessageType::Join
            | RoomWsMessageType::Pong
            | RoomWsMessageType::Error
            | RoomWsMessageType::RoleUpdate => Err(AppError::Validation(format!(
                "{:?} frames are not accepted from clients",
                frame.kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member(role: RoomRole, mode: MemberMode, can_control: bool) -> RoomMember {
        RoomMember {
            room_id: "r1".to_string(),
            user_id: 7,
            username: "u".to_string(),
            role,
            mode,
            can_control,
            joined_at: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    fn item(position: i32, song_id: &str) -> RoomPlaylistItem {
        RoomPlaylistItem {
            room_id: "r1".to_string(),
            position,
            song_id: song_id.to_string(),
            name: song_id.to_string(),
            artist: "a".to_string(),
            cover: None,
            duration: None,
            source: SongSource::Local,
            added_by: 1,
            added_at: Utc::now(),
        }
    }

    #[test]
    fn master_eligibility() {
        // Owner in listen mode is the implicit master.
        assert!(is_master_eligible(&member(RoomRole::Owner, MemberMode::Listen, false)));
        // An owner chatting is not currently mastering.
        assert!(!is_master_eligible(&member(RoomRole::Owner, MemberMode::Chat, false)));
        // A delegated controller in listen mode may take over.
        assert!(is_master_eligible(&member(RoomRole::Member, MemberMode::Listen, true)));
        // Plain members never master.
        assert!(!is_master_eligible(&member(RoomRole::Member, MemberMode::Listen, false)));
    }

    #[test]
    fn stale_frames_are_detected() {
        assert!(frame_is_stale(2000, 1500));
        assert!(!frame_is_stale(2000, 2000));
        assert!(!frame_is_stale(2000, 2500));
    }

    #[test]
    fn adjacent_song_steps_through_playlist() {
        let playlist = vec![item(0, "s1"), item(1, "s2"), item(2, "s3")];

        let next = adjacent_song(&playlist, Some("s1"), 1).unwrap();
        assert_eq!(next.song_id, "s2");
        let prev = adjacent_song(&playlist, Some("s2"), -1).unwrap();
        assert_eq!(prev.song_id, "s1");

        // Off either end: nothing happens.
        assert!(adjacent_song(&playlist, Some("s3"), 1).is_none());
        assert!(adjacent_song(&playlist, Some("s1"), -1).is_none());
    }

    #[test]
    fn adjacent_song_edge_cases() {
        // Empty playlist: next/prev are no-ops.
        assert!(adjacent_song(&[], Some("s1"), 1).is_none());
        assert!(adjacent_song(&[], None, 1).is_none());

        let playlist = vec![item(0, "s1"), item(1, "s2")];
        // No current song: next starts from the top.
        assert_eq!(adjacent_song(&playlist, None, 1).unwrap().song_id, "s1");
        assert!(adjacent_song(&playlist, None, -1).is_none());
        // Unknown current song behaves like none.
        assert_eq!(
            adjacent_song(&playlist, Some("gone"), 1).unwrap().song_id,
            "s1"
        );
    }
}
