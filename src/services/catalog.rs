//! External music catalog client.
//!
//! Thin search client over the configured catalog API; results feed
//! `song_search_result` room messages. The catalog is optional — without a
//! configured base URL, song search is disabled and the rest of the service
//! is unaffected.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::SongCandidate;

/// Upper bound for a catalog round trip.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CatalogClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    songs: Vec<CatalogSong>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogSong {
    id: String,
    name: String,
    artist: String,
    #[serde(default)]
    cover: Option<String>,
    #[serde(default)]
    duration: Option<i32>,
    #[serde(default)]
    url: Option<String>,
}

impl CatalogClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(CATALOG_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        Self { base_url, client }
    }

    /// Search the catalog. Song ids are namespaced `external_{id}` so the
    /// rest of the system can route them through the catalog stream path.
    pub async fn search(&self, keyword: &str, limit: usize) -> Result<Vec<SongCandidate>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("keyword", keyword), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Transient("catalog search timed out".to_string())
                } else {
                    AppError::Transient(format!("catalog unreachable: {e}"))
                }
            })?;

        if response.status().is_server_error() {
            return Err(AppError::Transient(format!(
                "catalog returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(AppError::Validation(format!(
                "catalog rejected search: {}",
                response.status()
            )));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("catalog response unreadable: {e}")))?;

        Ok(body
            .songs
            .into_iter()
            .map(|song| SongCandidate {
                id: format!("external_{}", song.id),
                name: song.name,
                artist: song.artist,
                cover: song.cover,
                duration: song.duration,
                hls_url: song.url,
                source: "external".to_string(),
            })
            .collect())
    }
}
