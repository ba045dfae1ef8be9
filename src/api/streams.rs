use crate::api::rooms::AppState;
use crate::error::Result;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;

pub fn stream_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/streams/:stream_id/playlist.m3u8", get(local_playlist))
        .route("/streams/:stream_id/:segment", get(local_segment))
        .route(
            "/streams/external/:stream_id/playlist.m3u8",
            get(external_playlist),
        )
        .route("/streams/external/:stream_id/:segment", get(external_segment))
}

async fn local_playlist(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Response> {
    serve_playlist(&state, &stream_id, false).await
}

async fn external_playlist(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Response> {
    serve_playlist(&state, &stream_id, true).await
}

async fn local_segment(
    State(state): State<Arc<AppState>>,
    Path((stream_id, segment)): Path<(String, String)>,
) -> Result<Response> {
    serve_segment(&state, &stream_id, &segment, false).await
}

async fn external_segment(
    State(state): State<Arc<AppState>>,
    Path((stream_id, segment)): Path<(String, String)>,
) -> Result<Response> {
    serve_segment(&state, &stream_id, &segment, true).await
}

/// The playlist route bootstraps transcoding on a miss and waits a bounded
/// time for the first segment, so first listeners start playing while the
/// rest of the track encodes.
async fn serve_playlist(state: &AppState, stream_id: &str, is_external: bool) -> Result<Response> {
    let (bytes, content_type) = state
        .streams
        .get_playlist_or_start(stream_id, is_external)
        .await?;

    // A finalized playlist never changes again; a progressive one must not
    // be cached at all.
    let cache_control = if bytes.windows(14).any(|w| w == b"#EXT-X-ENDLIST") {
        "public, max-age=86400"
    } else {
        "no-cache, no-store"
    };

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(bytes))
        .expect("response builds"))
}

async fn serve_segment(
    state: &AppState,
    stream_id: &str,
    segment: &str,
    is_external: bool,
) -> Result<Response> {
    let (bytes, content_type) = state
        .streams
        .stream_get(stream_id, segment, is_external)
        .await?;

    // Segments are immutable once published.
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=86400, immutable")
        .body(Body::from(bytes))
        .expect("response builds"))
}
