//! Progressive HLS state manager.
//!
//! Process-wide map of per-stream generation state. The first caller of
//! [`ProgressiveHlsManager::start_if_absent`] becomes responsible for driving
//! the transcode; everyone else observes the shared state. Readers may render
//! the playlist at any time mid-transcode and always get a valid, playable
//! document containing the segments known so far.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// How long terminal states stay resident after their last access, so late
/// followers can still fetch the finalized playlist.
pub const TERMINAL_STATE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegmentInfo {
    pub index: u32,
    pub duration: f64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HlsOutcome {
    Success { duration: f64 },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct ProgressiveHlsState {
    pub stream_id: String,
    pub segments: Vec<HlsSegmentInfo>,
    pub is_processing: bool,
    pub outcome: Option<HlsOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressiveHlsState {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            segments: Vec::new(),
            is_processing: true,
            outcome: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Some(HlsOutcome::Success { .. }))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(HlsOutcome::Failed { .. }))
    }
}

struct StreamSlot {
    state: Mutex<ProgressiveHlsState>,
    /// Bumped on every state change; waiters watch this.
    changed: watch::Sender<u64>,
    last_access: Mutex<Instant>,
}

impl StreamSlot {
    fn new(stream_id: &str) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(ProgressiveHlsState::new(stream_id)),
            changed,
            last_access: Mutex::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        *self.last_access.lock().await = Instant::now();
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v += 1);
    }
}

#[derive(Default)]
pub struct ProgressiveHlsManager {
    streams: RwLock<HashMap<String, Arc<StreamSlot>>>,
}

impl ProgressiveHlsManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, stream_id: &str) -> Option<Arc<StreamSlot>> {
        self.streams.read().await.get(stream_id).cloned()
    }

    /// O(1) snapshot of the current state, if any.
    pub async fn get_state(&self, stream_id: &str) -> Option<ProgressiveHlsState> {
        let slot = self.slot(stream_id).await?;
        slot.touch().await;
        let state = slot.state.lock().await.clone();
        Some(state)
    }

    /// Atomic single-flight entry point. The caller that receives
    /// `acquired = true` must drive the transcode to a terminal state.
    /// A previously failed terminal state is replaced so a fresh attempt
    /// can run.
    pub async fn start_if_absent(&self, stream_id: &str) -> (ProgressiveHlsState, bool) {
        let mut streams = self.streams.write().await;
        if let Some(slot) = streams.get(stream_id) {
            let state = slot.state.lock().await.clone();
            if !state.is_failed() {
                slot.touch().await;
                return (state, false);
            }
            debug!(stream_id, "replacing failed HLS state for a fresh attempt");
        }
        let slot = Arc::new(StreamSlot::new(stream_id));
        let state = slot.state.lock().await.clone();
        streams.insert(stream_id.to_string(), slot);
        (state, true)
    }

    /// Monotonic append; the next index must be exactly `segments.len()`.
    pub async fn append_segment(&self, stream_id: &str, segment: HlsSegmentInfo) -> Result<()> {
        let slot = self
            .slot(stream_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("no HLS state for {stream_id}")))?;
        let mut state = slot.state.lock().await;
        if !state.is_processing {
            return Err(AppError::Conflict(format!(
                "stream {stream_id} is frozen, cannot append"
            )));
        }
        let expected = state.segments.len() as u32;
        if segment.index != expected {
            return Err(AppError::Conflict(format!(
                "segment index {} out of order, expected {expected}",
                segment.index
            )));
        }
        state.segments.push(segment);
        drop(state);
        slot.bump();
        Ok(())
    }

    /// Terminal success: freezes the segment list.
    pub async fn complete(&self, stream_id: &str, duration: f64) -> Result<()> {
        let slot = self
            .slot(stream_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("no HLS state for {stream_id}")))?;
        let mut state = slot.state.lock().await;
        state.is_processing = false;
        state.outcome = Some(HlsOutcome::Success { duration });
        state.completed_at = Some(Utc::now());
        let segments = state.segments.len();
        drop(state);
        slot.bump();
        info!(stream_id, segments, duration, "HLS generation complete");
        Ok(())
    }

    /// Terminal failure: freezes state; a later `start_if_absent` replaces it.
    pub async fn fail(&self, stream_id: &str, error: &str) -> Result<()> {
        let slot = self
            .slot(stream_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("no HLS state for {stream_id}")))?;
        let mut state = slot.state.lock().await;
        state.is_processing = false;
        state.outcome = Some(HlsOutcome::Failed {
            error: error.to_string(),
        });
        state.completed_at = Some(Utc::now());
        drop(state);
        slot.bump();
        Ok(())
    }

    pub async fn has_minimum_segments(&self, stream_id: &str, k: usize) -> bool {
        match self.get_state(stream_id).await {
            Some(state) => state.segments.len() >= k,
            None => false,
        }
    }

    /// Render the playlist for the current state. Mid-transcode this lists
    /// every segment known so far with no end marker; after a successful
    /// terminal transition it carries `#EXT-X-ENDLIST`.
    pub async fn generate_m3u8(&self, stream_id: &str) -> Option<String> {
        let state = self.get_state(stream_id).await?;
        Some(render_m3u8(&state))
    }

    /// Wait until the stream has at least `min_segments` segments or has
    /// reached a terminal state. Returns the state observed at that point,
    /// or the latest state at timeout.
    pub async fn wait_ready(
        &self,
        stream_id: &str,
        min_segments: usize,
        timeout: Duration,
    ) -> Option<ProgressiveHlsState> {
        let slot = self.slot(stream_id).await?;
        let mut rx = slot.changed.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let state = slot.state.lock().await;
                if state.segments.len() >= min_segments || !state.is_processing {
                    return Some(state.clone());
                }
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped or deadline hit: report whatever we have.
                Ok(Err(_)) | Err(_) => return Some(slot.state.lock().await.clone()),
            }
        }
    }

    /// Drop terminal entries not accessed within `ttl`. Returns the number
    /// of evicted streams.
    pub async fn cleanup_expired(&self, ttl: Duration) -> usize {
        let mut streams = self.streams.write().await;
        let mut expired = Vec::new();
        for (id, slot) in streams.iter() {
            let state = slot.state.lock().await;
            if state.is_processing {
                continue;
            }
            if slot.last_access.lock().await.elapsed() >= ttl {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            streams.remove(id);
            debug!(stream_id = %id, "evicted terminal HLS state");
        }
        expired.len()
    }

    /// Background janitor evicting stale terminal states.
    pub fn spawn_janitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = manager.cleanup_expired(TERMINAL_STATE_TTL).await;
                if evicted > 0 {
                    debug!(evicted, "HLS janitor pass");
                }
            }
        });
    }
}

/// Deterministic playlist rendering for a state snapshot.
pub fn render_m3u8(state: &ProgressiveHlsState) -> String {
    let target = state
        .segments
        .iter()
        .map(|s| s.duration)
        .fold(0.0f64, f64::max)
        .ceil() as u32;

    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");
    playlist.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target.max(1)));
    playlist.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");

    for segment in &state.segments {
        playlist.push_str(&format!("#EXTINF:{:.6},\n", segment.duration));
        playlist.push_str(&segment.uri);
        playlist.push('\n');
    }

    if state.is_success() {
        playlist.push_str("#EXT-X-ENDLIST\n");
    }

    playlist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: u32, duration: f64) -> HlsSegmentInfo {
        HlsSegmentInfo {
            index,
            duration,
            uri: format!("segment_{index:03}.ts"),
        }
    }

    #[tokio::test]
    async fn start_if_absent_is_single_flight() {
        let mgr = ProgressiveHlsManager::new();
        let (_, first) = mgr.start_if_absent("s1").await;
        let (state, second) = mgr.start_if_absent("s1").await;
        assert!(first);
        assert!(!second);
        assert!(state.is_processing);
    }

    #[tokio::test]
    async fn failed_state_allows_a_fresh_attempt() {
        let mgr = ProgressiveHlsManager::new();
        let (_, acquired) = mgr.start_if_absent("s1").await;
        assert!(acquired);
        mgr.fail("s1", "encoder crashed").await.unwrap();

        let (state, acquired) = mgr.start_if_absent("s1").await;
        assert!(acquired);
        assert!(state.is_processing);
        assert!(state.segments.is_empty());
    }

    #[tokio::test]
    async fn append_rejects_gaps_and_duplicates() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;

        mgr.append_segment("s1", seg(0, 10.0)).await.unwrap();
        assert!(mgr.append_segment("s1", seg(0, 10.0)).await.is_err());
        assert!(mgr.append_segment("s1", seg(2, 10.0)).await.is_err());
        mgr.append_segment("s1", seg(1, 10.0)).await.unwrap();

        assert!(mgr.has_minimum_segments("s1", 2).await);
        assert!(!mgr.has_minimum_segments("s1", 3).await);
    }

    #[tokio::test]
    async fn append_after_terminal_is_rejected() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;
        mgr.append_segment("s1", seg(0, 10.0)).await.unwrap();
        mgr.complete("s1", 10.0).await.unwrap();
        assert!(mgr.append_segment("s1", seg(1, 10.0)).await.is_err());
    }

    #[tokio::test]
    async fn progressive_playlist_has_no_endlist() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;
        mgr.append_segment("s1", seg(0, 10.005)).await.unwrap();
        mgr.append_segment("s1", seg(1, 9.984)).await.unwrap();

        let playlist = mgr.generate_m3u8("s1").await.unwrap();
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:11\n"));
        assert!(playlist.contains("segment_000.ts\n"));
        assert!(playlist.contains("segment_001.ts\n"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
        assert_eq!(playlist.matches("#EXTINF").count(), 2);
    }

    #[tokio::test]
    async fn final_playlist_has_endlist() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;
        mgr.append_segment("s1", seg(0, 10.0)).await.unwrap();
        mgr.complete("s1", 10.0).await.unwrap();

        let playlist = mgr.generate_m3u8("s1").await.unwrap();
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn failed_playlist_has_no_endlist() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;
        mgr.append_segment("s1", seg(0, 10.0)).await.unwrap();
        mgr.fail("s1", "boom").await.unwrap();

        let playlist = mgr.generate_m3u8("s1").await.unwrap();
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn wait_ready_returns_on_segment_arrival() {
        let mgr = Arc::new(ProgressiveHlsManager::new());
        mgr.start_if_absent("s1").await;

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_ready("s1", 1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.append_segment("s1", seg(0, 10.0)).await.unwrap();

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.segments.len(), 1);
    }

    #[tokio::test]
    async fn wait_ready_times_out_with_latest_state() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("s1").await;
        let state = mgr
            .wait_ready("s1", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(state.segments.is_empty());
        assert!(state.is_processing);
    }

    #[tokio::test]
    async fn janitor_evicts_only_terminal_states() {
        let mgr = ProgressiveHlsManager::new();
        mgr.start_if_absent("done").await;
        mgr.complete("done", 1.0).await.unwrap();
        mgr.start_if_absent("live").await;

        let evicted = mgr.cleanup_expired(Duration::ZERO).await;
        assert_eq!(evicted, 1);
        assert!(mgr.get_state("done").await.is_none());
        assert!(mgr.get_state("live").await.is_some());
    }
}
