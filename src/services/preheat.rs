//! Preheat loop.
//!
//! Periodically scans rooms with connected members and warms the HLS
//! pipeline for the song that would play next, so a track change lands on
//! already-published segments. Strictly best-effort: failures are logged
//! and never surfaced.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::services::room_cache::RoomCache;
use crate::services::room_store::RoomStore;
use crate::services::stream_processor::StreamProcessor;

pub struct PreheatService {
    cache: RoomCache,
    store: RoomStore,
    streams: Arc<StreamProcessor>,
    interval: Duration,
}

impl PreheatService {
    pub fn new(
        cache: RoomCache,
        store: RoomStore,
        streams: Arc<StreamProcessor>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            streams,
            interval,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        });
    }

    async fn scan(&self) {
        let rooms = match self.cache.active_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!("preheat scan could not list active rooms: {e}");
                return;
            }
        };

        for room_id in rooms {
            if let Err(e) = self.preheat_room(&room_id).await {
                debug!(%room_id, "preheat pass skipped: {e}");
            }
        }
    }

    async fn preheat_room(&self, room_id: &str) -> crate::error::Result<()> {
        let playlist = {
            let cached = self.cache.playlist(room_id).await.unwrap_or_default();
            if cached.is_empty() {
                self.store.list_playlist(room_id).await?
            } else {
                cached
            }
        };
        if playlist.is_empty() {
            return Ok(());
        }

        let current_song = self
            .cache
            .playback(room_id)
            .await
            .ok()
            .flatten()
            .and_then(|p| p.current_song_id);

        // The upcoming item: right after the current song, or the head of
        // the queue when nothing is playing yet.
        let upcoming = match current_song.as_deref() {
            Some(current) => playlist
                .iter()
                .position(|item| item.song_id == current)
                .and_then(|idx| playlist.get(idx + 1)),
            None => playlist.first(),
        };
        let Some(item) = upcoming else {
            return Ok(());
        };

        if self
            .streams
            .preheat(&item.song_id, item.source.is_external())
            .await?
        {
            debug!(room_id, song_id = %item.song_id, "preheating upcoming song");
        }
        Ok(())
    }
}
