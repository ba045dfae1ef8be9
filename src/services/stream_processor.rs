//! Stream processor.
//!
//! Orchestrates "fetch source -> transcode -> publish" for one stream id and
//! serves stream files to the HTTP layer. Publication is idempotent under
//! concurrent callers: in-process single-flight comes from the HLS manager,
//! and a cache advisory lock keeps multiple replicas from transcoding the
//! same stream at once.

use bytes::Bytes;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::hls::{HlsSegmentInfo, ProgressiveHlsManager};
use crate::services::room_cache::RoomCache;
use crate::services::storage::{self, ObjectStorage, SOURCE_EXTENSIONS};
use crate::services::transcode::{self, SegmentEvent, TranscodeError, TranscodeWorker};

/// Hard cap on a single transcode, including source download.
pub const TRANSCODE_HARD_CAP: Duration = Duration::from_secs(10 * 60);
/// Upper bound for one object-storage put.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for downloading an external source.
const SOURCE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a playlist request waits for the first segment.
const FIRST_SEGMENT_WAIT: Duration = Duration::from_secs(5);
/// Poll cadence while another replica drives the transcode.
const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the source audio for a stream lives.
enum SourceLocation {
    /// An object under `audio/`.
    Object(String),
    /// A remote URL registered when the song was added.
    Remote(String),
}

pub struct StreamProcessor {
    hls: Arc<ProgressiveHlsManager>,
    storage: Arc<dyn ObjectStorage>,
    cache: RoomCache,
    worker: TranscodeWorker,
    http: reqwest::Client,
}

impl StreamProcessor {
    pub fn new(
        hls: Arc<ProgressiveHlsManager>,
        storage: Arc<dyn ObjectStorage>,
        cache: RoomCache,
        worker: TranscodeWorker,
    ) -> Self {
        // Client-level timeout bounds the whole source download, body
        // included.
        let http = reqwest::Client::builder()
            .timeout(SOURCE_DOWNLOAD_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        Self {
            hls,
            storage,
            cache,
            worker,
            http,
        }
    }

    /// Serve one stream file. The playlist falls back to a live render of
    /// the in-progress state when the final object is not published yet.
    pub async fn stream_get(
        &self,
        stream_id: &str,
        file_name: &str,
        is_external: bool,
    ) -> Result<(Bytes, &'static str)> {
        let content_type = storage::stream_content_type(file_name);

        if file_name == "playlist.m3u8" {
            let key = storage::playlist_key(stream_id, is_external);
            if let Some(bytes) = self.storage.get(&key).await? {
                return Ok((bytes, content_type));
            }
            if let Some(state) = self.hls.get_state(stream_id).await {
                // A playlist with no segments is useless to a player; let
                // the caller fall through to the bounded first-segment wait.
                if !state.segments.is_empty() || state.is_success() {
                    let playlist = crate::services::hls::render_m3u8(&state);
                    return Ok((Bytes::from(playlist), content_type));
                }
            }
            return Err(AppError::NotFound(format!("stream {stream_id} not found")));
        }

        let index = transcode::segment_index(file_name)
            .ok_or_else(|| AppError::Validation(format!("invalid stream file: {file_name}")))?;
        let key = storage::segment_key(stream_id, is_external, index);
        match self.storage.get(&key).await? {
            Some(bytes) => Ok((bytes, content_type)),
            None => Err(AppError::NotFound(format!(
                "segment {index} of stream {stream_id} not found"
            ))),
        }
    }

    /// Playlist read that bootstraps generation on a miss: start processing
    /// if possible, wait a bounded time for the first segment, and return
    /// the progressive playlist.
    pub async fn get_playlist_or_start(
        self: &Arc<Self>,
        stream_id: &str,
        is_external: bool,
    ) -> Result<(Bytes, &'static str)> {
        match self.stream_get(stream_id, "playlist.m3u8", is_external).await {
            Ok(found) => return Ok(found),
            Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Nothing published and no live state: try to begin processing.
        self.resolve_source(stream_id, is_external).await?;
        self.stream_process(stream_id, is_external);

        let state = self
            .hls
            .wait_ready(stream_id, 1, FIRST_SEGMENT_WAIT)
            .await
            .ok_or_else(|| AppError::Transient("stream state lost".to_string()))?;
        if state.is_failed() {
            return Err(AppError::Transient(
                "stream generation failed, retry later".to_string(),
            ));
        }
        if state.segments.is_empty() {
            return Err(AppError::Transient(
                "stream is still warming up, retry shortly".to_string(),
            ));
        }
        let playlist = crate::services::hls::render_m3u8(&state);
        Ok((
            Bytes::from(playlist),
            storage::stream_content_type("playlist.m3u8"),
        ))
    }

    /// Fire-and-forget processing in a detached task with its own timeout;
    /// a disconnecting client must not cancel a transcode other members
    /// are waiting on.
    pub fn stream_process(self: &Arc<Self>, stream_id: &str, is_external: bool) {
        let processor = Arc::clone(self);
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = processor.stream_process_sync(&stream_id, is_external).await {
                warn!(%stream_id, "stream processing failed: {e}");
            }
        });
    }

    /// Blocks until the stream is fully published (or this caller has
    /// observed someone else's in-flight generation reach its first
    /// segment / terminal state).
    pub async fn stream_process_sync(&self, stream_id: &str, is_external: bool) -> Result<()> {
        let (_, acquired) = self.hls.start_if_absent(stream_id).await;
        if !acquired {
            // Someone in this process is driving; wait for usable output.
            let state = self
                .hls
                .wait_ready(stream_id, 1, TRANSCODE_HARD_CAP)
                .await
                .ok_or_else(|| AppError::Transient("stream state lost".to_string()))?;
            if state.is_failed() {
                return Err(AppError::Transient("stream generation failed".to_string()));
            }
            return Ok(());
        }

        if !self.cache.try_lock_stream(stream_id).await? {
            // Another replica is transcoding; adopt its published result.
            return self.adopt_remote_result(stream_id, is_external).await;
        }

        let result = self.drive_transcode(stream_id, is_external).await;
        if let Err(ref e) = result {
            self.discard_published_segments(stream_id, is_external).await;
            let _ = self.hls.fail(stream_id, &e.to_string()).await;
        }
        if let Err(e) = self.cache.unlock_stream(stream_id).await {
            warn!(stream_id, "failed to release stream lock: {e}");
        }
        result
    }

    /// A failed generation leaves no orphaned segment objects behind; the
    /// next attempt starts from a clean prefix.
    async fn discard_published_segments(&self, stream_id: &str, is_external: bool) {
        let Some(state) = self.hls.get_state(stream_id).await else {
            return;
        };
        for segment in &state.segments {
            let key = storage::segment_key(stream_id, is_external, segment.index);
            if let Err(e) = self.storage.delete(&key).await {
                warn!(stream_id, "failed to delete orphaned segment {key}: {e}");
            }
        }
    }

    /// The acquirer's path: download, transcode, publish each segment as it
    /// closes, then finalize.
    async fn drive_transcode(&self, stream_id: &str, is_external: bool) -> Result<()> {
        let work_dir =
            std::env::temp_dir().join(format!("soundroom-hls-{}", Uuid::new_v4().simple()));
        let result = self
            .drive_transcode_in(stream_id, is_external, &work_dir)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(stream_id, "failed to remove work dir {work_dir:?}: {e}");
            }
        }
        result
    }

    async fn drive_transcode_in(
        &self,
        stream_id: &str,
        is_external: bool,
        work_dir: &PathBuf,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        let source_path = self
            .materialize_source(stream_id, is_external, work_dir)
            .await?;

        let out_dir = work_dir.join("hls");
        let (tx, mut rx) = mpsc::channel::<SegmentEvent>(8);
        let mut worker_fut = pin!(tokio::time::timeout(
            TRANSCODE_HARD_CAP,
            self.worker.run(&source_path, &out_dir, tx),
        ));

        let mut worker_result: Option<std::result::Result<f64, TranscodeError>> = None;
        loop {
            tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => self.publish_segment(stream_id, is_external, &event).await?,
                    // Worker dropped its sender: all segments reported.
                    None => break,
                },
                res = &mut worker_fut, if worker_result.is_none() => {
                    worker_result = Some(res.unwrap_or(Err(TranscodeError::Cancelled)));
                }
            }
        }
        // The sender only drops once the worker future has resolved, so by
        // the time the event stream ends the result is in hand.
        let duration = worker_result
            .unwrap_or(Err(TranscodeError::Cancelled))
            .map_err(|e| match e {
                TranscodeError::Cancelled => AppError::Cancelled,
                other => AppError::Transcode(other),
            })?;

        self.hls.complete(stream_id, duration).await?;
        let playlist = self
            .hls
            .generate_m3u8(stream_id)
            .await
            .ok_or_else(|| AppError::Transient("stream state lost".to_string()))?;
        self.put_with_timeout(
            &storage::playlist_key(stream_id, is_external),
            Bytes::from(playlist),
        )
        .await?;

        info!(
            stream_id,
            duration,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stream published"
        );
        Ok(())
    }

    async fn publish_segment(
        &self,
        stream_id: &str,
        is_external: bool,
        event: &SegmentEvent,
    ) -> Result<()> {
        let data = tokio::fs::read(&event.path)
            .await
            .map_err(|e| AppError::Storage(format!("read segment {:?}: {e}", event.path)))?;
        self.put_with_timeout(
            &storage::segment_key(stream_id, is_external, event.index),
            Bytes::from(data),
        )
        .await?;
        self.hls
            .append_segment(
                stream_id,
                HlsSegmentInfo {
                    index: event.index,
                    duration: event.duration,
                    uri: event.file_name.clone(),
                },
            )
            .await
    }

    async fn put_with_timeout(&self, key: &str, data: Bytes) -> Result<()> {
        tokio::time::timeout(UPLOAD_TIMEOUT, self.storage.put(key, data))
            .await
            .map_err(|_| AppError::Transient(format!("storage put timed out: {key}")))?
    }

    /// Download or copy the source audio into the work directory.
    async fn materialize_source(
        &self,
        stream_id: &str,
        is_external: bool,
        work_dir: &PathBuf,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| AppError::Storage(format!("mkdir {work_dir:?}: {e}")))?;

        match self.resolve_source(stream_id, is_external).await? {
            SourceLocation::Object(key) => {
                let data = self
                    .storage
                    .get(&key)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("source object {key} vanished")))?;
                let ext = key.rsplit('.').next().unwrap_or("mp3");
                let path = work_dir.join(format!("source.{ext}"));
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|e| AppError::Storage(format!("write {path:?}: {e}")))?;
                Ok(path)
            }
            SourceLocation::Remote(url) => {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            AppError::Transient(format!("source download timed out: {url}"))
                        } else {
                            AppError::Transient(format!("source download failed: {e}"))
                        }
                    })?;
                if !response.status().is_success() {
                    return Err(AppError::Transient(format!(
                        "source download returned {}: {url}",
                        response.status()
                    )));
                }
                let data = response
                    .bytes()
                    .await
                    .map_err(|e| AppError::Transient(format!("source download failed: {e}")))?;
                let path = work_dir.join("source.audio");
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|e| AppError::Storage(format!("write {path:?}: {e}")))?;
                Ok(path)
            }
        }
    }

    async fn resolve_source(&self, stream_id: &str, is_external: bool) -> Result<SourceLocation> {
        if !is_external {
            for ext in SOURCE_EXTENSIONS {
                let key = format!("audio/{stream_id}.{ext}");
                if self.storage.exists(&key).await? {
                    return Ok(SourceLocation::Object(key));
                }
            }
        }
        if let Some(url) = self.cache.stream_source(stream_id).await? {
            return Ok(SourceLocation::Remote(url));
        }
        Err(AppError::NotFound(format!(
            "no source available for stream {stream_id}"
        )))
    }

    /// Poll the shared store for another replica's published playlist and
    /// mirror it into local state so this instance's readers see it.
    async fn adopt_remote_result(&self, stream_id: &str, is_external: bool) -> Result<()> {
        let key = storage::playlist_key(stream_id, is_external);
        let deadline = tokio::time::Instant::now() + TRANSCODE_HARD_CAP;

        loop {
            if let Some(bytes) = self.storage.get(&key).await? {
                let progress = transcode::parse_progress(&bytes)
                    .map_err(|e| AppError::Storage(format!("published playlist unreadable: {e}")))?;
                if progress.ended {
                    let mut total = 0.0;
                    for seg in &progress.segments {
                        total += seg.duration;
                        self.hls
                            .append_segment(
                                stream_id,
                                HlsSegmentInfo {
                                    index: seg.index,
                                    duration: seg.duration,
                                    uri: seg.uri.clone(),
                                },
                            )
                            .await?;
                    }
                    self.hls.complete(stream_id, total).await?;
                    info!(stream_id, "adopted stream published by another instance");
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self
                    .hls
                    .fail(stream_id, "remote transcode did not complete in time")
                    .await;
                return Err(AppError::Transient(
                    "stream is being generated elsewhere and is not ready yet".to_string(),
                ));
            }
            tokio::time::sleep(REMOTE_POLL_INTERVAL).await;
        }
    }

    /// Preheat hook: start generation only when nothing exists yet.
    pub async fn preheat(self: &Arc<Self>, stream_id: &str, is_external: bool) -> Result<bool> {
        if self.hls.get_state(stream_id).await.is_some() {
            return Ok(false);
        }
        if self
            .storage
            .exists(&storage::playlist_key(stream_id, is_external))
            .await?
        {
            return Ok(false);
        }
        // Only preheat when a source is actually resolvable.
        self.resolve_source(stream_id, is_external).await?;
        self.stream_process(stream_id, is_external);
        Ok(true)
    }
}
