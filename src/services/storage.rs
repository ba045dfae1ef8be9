//! Object storage seam.
//!
//! Keys follow a flat namespace:
//!   audio/{name}.{ext}                        uploaded source files
//!   covers/{name}.{ext}                       cover art
//!   streams/{streamId}/playlist.m3u8          progressive/final playlist
//!   streams/{streamId}/segment_NNN.ts         zero-padded segment index
//!   streams/external/{streamId}/...           catalog-sourced streams

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Extensions probed when resolving an uploaded source by stream id.
pub const SOURCE_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "m4a", "ogg", "aac"];

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Key of the playlist object for a stream.
pub fn playlist_key(stream_id: &str, is_external: bool) -> String {
    format!("{}/playlist.m3u8", stream_prefix(stream_id, is_external))
}

/// Key of a numbered segment object for a stream.
pub fn segment_key(stream_id: &str, is_external: bool, index: u32) -> String {
    format!("{}/segment_{:03}.ts", stream_prefix(stream_id, is_external), index)
}

pub fn stream_prefix(stream_id: &str, is_external: bool) -> String {
    if is_external {
        format!("streams/external/{stream_id}")
    } else {
        format!("streams/{stream_id}")
    }
}

/// Content type for a stream file name, per the HLS contract.
pub fn stream_content_type(file_name: &str) -> &'static str {
    if file_name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/MP2T"
    }
}

/// Filesystem-backed store rooted at a configured directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are server-generated, but reject traversal anyway.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(AppError::Storage(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("mkdir {parent:?}: {e}")))?;
        }
        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| AppError::Storage(format!("write {tmp:?}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::Storage(format!("rename {tmp:?}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Storage(format!("read {path:?}: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AppError::Storage(format!("stat {path:?}: {e}")))?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("remove {path:?}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FsStorage {
        let dir = std::env::temp_dir().join(format!("soundroom-test-{}", uuid::Uuid::new_v4()));
        FsStorage::new(dir)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = temp_store();
        let key = segment_key("local_42", false, 7);
        assert_eq!(key, "streams/local_42/segment_007.ts");

        assert!(store.get(&key).await.unwrap().is_none());
        store.put(&key, Bytes::from_static(b"ts-data")).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap(), Bytes::from_static(b"ts-data"));

        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let store = temp_store();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("streams//x").await.is_err());
    }

    #[test]
    fn external_prefix_and_content_types() {
        assert_eq!(playlist_key("ext_9", true), "streams/external/ext_9/playlist.m3u8");
        assert_eq!(stream_content_type("playlist.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(stream_content_type("segment_000.ts"), "video/MP2T");
    }
}
