//! Transcode worker.
//!
//! Runs the external encoder (ffmpeg) with the HLS muxer against a local
//! temp directory and reports each finished segment as it appears. The
//! encoder only appends a segment entry to its own playlist after closing
//! the segment file, so the local playlist is the close signal: everything
//! listed there is safe to publish.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Output playlist name inside the work directory.
const LOCAL_PLAYLIST: &str = "playlist.m3u8";
/// How often the work directory playlist is re-read while encoding.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("source missing or unreadable: {0}")]
    Input(String),

    #[error("encoder exited with {status}: {stderr}")]
    Encoder { status: i32, stderr: String },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcode cancelled")]
    Cancelled,
}

/// A segment the encoder has finished writing.
#[derive(Debug, Clone)]
pub struct SegmentEvent {
    pub index: u32,
    pub duration: f64,
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    /// Audio bitrate in kbps.
    pub bitrate: u32,
    /// Target segment duration in seconds.
    pub segment_seconds: u32,
}

#[derive(Debug, Clone)]
pub struct TranscodeWorker {
    config: TranscodeConfig,
}

impl TranscodeWorker {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    /// Transcode `source` into HLS segments under `out_dir`, sending a
    /// [`SegmentEvent`] per finished segment. Returns the total audio
    /// duration in seconds on success. No internal retries; dropping the
    /// returned future kills the encoder process.
    pub async fn run(
        &self,
        source: &Path,
        out_dir: &Path,
        events: mpsc::Sender<SegmentEvent>,
    ) -> Result<f64, TranscodeError> {
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(TranscodeError::Input(format!("{} is not a file", source.display()))),
            Err(e) => return Err(TranscodeError::Input(format!("{}: {e}", source.display()))),
        }
        tokio::fs::create_dir_all(out_dir).await?;

        let segment_pattern = out_dir.join("segment_%03d.ts");
        let playlist_path = out_dir.join(LOCAL_PLAYLIST);

        let mut child = Command::new(&self.config.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-vn")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg(format!("{}k", self.config.bitrate))
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(self.config.segment_seconds.to_string())
            .arg("-hls_list_size")
            .arg("0")
            .arg("-hls_segment_filename")
            .arg(&segment_pattern)
            .arg(&playlist_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr = child.stderr.take();
        let mut emitted = 0usize;
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        let status = loop {
            interval.tick().await;

            emitted += self
                .emit_new_segments(&playlist_path, out_dir, emitted, &events)
                .await?;

            if let Some(status) = child.try_wait()? {
                break status;
            }
        };

        // Final playlist read: anything the encoder closed right before exit.
        self.emit_new_segments(&playlist_path, out_dir, emitted, &events)
            .await?;

        if !status.success() {
            let mut buf = String::new();
            if let Some(ref mut err) = stderr {
                let _ = err.read_to_string(&mut buf).await;
            }
            return Err(TranscodeError::Encoder {
                status: status.code().unwrap_or(-1),
                stderr: buf.trim().to_string(),
            });
        }

        let playlist = tokio::fs::read(&playlist_path).await?;
        let progress = parse_progress(&playlist)
            .map_err(|e| TranscodeError::Input(format!("encoder playlist unreadable: {e}")))?;
        Ok(progress.segments.iter().map(|s| s.duration).sum())
    }

    /// Read the encoder's playlist and emit any segments not yet reported.
    /// Returns the number of newly-emitted segments.
    async fn emit_new_segments(
        &self,
        playlist_path: &Path,
        out_dir: &Path,
        already_emitted: usize,
        events: &mpsc::Sender<SegmentEvent>,
    ) -> Result<usize, TranscodeError> {
        let bytes = match tokio::fs::read(playlist_path).await {
            Ok(bytes) => bytes,
            // The encoder has not produced the playlist yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let progress = match parse_progress(&bytes) {
            Ok(progress) => progress,
            Err(e) => {
                // A torn read mid-rewrite; the next poll will see a full file.
                debug!("skipping unparseable encoder playlist: {e}");
                return Ok(0);
            }
        };

        let mut emitted = 0usize;
        for seg in progress.segments.iter().skip(already_emitted) {
            let event = SegmentEvent {
                index: seg.index,
                duration: seg.duration,
                file_name: seg.uri.clone(),
                path: out_dir.join(&seg.uri),
            };
            if events.send(event).await.is_err() {
                warn!("segment receiver dropped, abandoning transcode watch");
                return Err(TranscodeError::Cancelled);
            }
            emitted += 1;
        }
        Ok(emitted)
    }
}

/// A parsed view of the encoder's own playlist.
#[derive(Debug)]
pub struct EncoderProgress {
    pub segments: Vec<ParsedSegment>,
    pub ended: bool,
}

#[derive(Debug)]
pub struct ParsedSegment {
    pub index: u32,
    pub duration: f64,
    pub uri: String,
}

/// Parse the encoder's media playlist. Segment indices come from the
/// `segment_NNN.ts` file names so gaps in the encoder output are visible
/// to the caller rather than silently renumbered.
pub fn parse_progress(bytes: &[u8]) -> Result<EncoderProgress, String> {
    let playlist = m3u8_rs::parse_media_playlist_res(bytes)
        .map_err(|e| format!("media playlist parse failed: {e:?}"))?;

    let mut segments = Vec::with_capacity(playlist.segments.len());
    for seg in &playlist.segments {
        let index = segment_index(&seg.uri)
            .ok_or_else(|| format!("unexpected segment uri: {}", seg.uri))?;
        segments.push(ParsedSegment {
            index,
            duration: seg.duration as f64,
            uri: seg.uri.clone(),
        });
    }
    Ok(EncoderProgress {
        segments,
        ended: playlist.end_list,
    })
}

/// Extract the numeric index from a `segment_NNN.ts` file name.
pub fn segment_index(uri: &str) -> Option<u32> {
    uri.strip_prefix("segment_")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MID_TRANSCODE: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:10.005333,\n\
segment_000.ts\n\
#EXTINF:9.984000,\n\
segment_001.ts\n";

    #[test]
    fn parses_progressive_playlist() {
        let progress = parse_progress(MID_TRANSCODE.as_bytes()).unwrap();
        assert_eq!(progress.segments.len(), 2);
        assert!(!progress.ended);
        assert_eq!(progress.segments[0].index, 0);
        assert_eq!(progress.segments[1].index, 1);
        assert!((progress.segments[0].duration - 10.005333).abs() < 1e-6);
    }

    #[test]
    fn parses_final_playlist() {
        let text = format!("{MID_TRANSCODE}#EXT-X-ENDLIST\n");
        let progress = parse_progress(text.as_bytes()).unwrap();
        assert!(progress.ended);
        let total: f64 = progress.segments.iter().map(|s| s.duration).sum();
        assert!((total - 19.989333).abs() < 1e-6);
    }

    #[test]
    fn segment_index_parsing() {
        assert_eq!(segment_index("segment_007.ts"), Some(7));
        assert_eq!(segment_index("segment_123.ts"), Some(123));
        assert_eq!(segment_index("seg7.ts"), None);
        assert_eq!(segment_index("segment_xyz.ts"), None);
    }

    #[tokio::test]
    async fn emits_only_new_segments_as_playlist_grows() {
        let dir = std::env::temp_dir().join(format!("transcode-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let playlist = dir.join(LOCAL_PLAYLIST);
        let worker = TranscodeWorker::new(TranscodeConfig {
            ffmpeg_path: "ffmpeg".to_string(),
            bitrate: 128,
            segment_seconds: 10,
        });
        let (tx, mut rx) = mpsc::channel(8);

        // No playlist on disk yet: nothing to report.
        let emitted = worker
            .emit_new_segments(&playlist, &dir, 0, &tx)
            .await
            .unwrap();
        assert_eq!(emitted, 0);

        tokio::fs::write(&playlist, MID_TRANSCODE).await.unwrap();
        let emitted = worker
            .emit_new_segments(&playlist, &dir, 0, &tx)
            .await
            .unwrap();
        assert_eq!(emitted, 2);
        assert_eq!(rx.recv().await.unwrap().index, 0);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.path, dir.join("segment_001.ts"));

        // One more segment closes: only the new entry is reported.
        let grown = format!("{MID_TRANSCODE}#EXTINF:5.000000,\nsegment_002.ts\n");
        tokio::fs::write(&playlist, grown).await.unwrap();
        let emitted = worker
            .emit_new_segments(&playlist, &dir, 2, &tx)
            .await
            .unwrap();
        assert_eq!(emitted, 1);
        assert_eq!(rx.recv().await.unwrap().index, 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
