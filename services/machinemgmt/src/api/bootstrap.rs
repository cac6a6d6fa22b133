//! Bootstrap image delivery.
//!
//! `GET /bootstrap/image/{id}` serves a verified image. The response carries
//! the content hash as a strong entity tag, so clients can revalidate with
//! `If-None-Match` and get a 304 instead of the body.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use infra_bootimage::ImageRequest;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::api::error::ApiError;
use crate::state::AppState;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Create bootstrap image routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/image", get(missing_image_id))
        .route("/image/", get(missing_image_id))
        .route("/image/{id}", get(get_image))
}

async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_image_id(&id)?;

    let cancel = state.shutdown().child_token();
    let request = ImageRequest::new(id);
    let image = state.images().get_bootstrap_image(&request, &cancel).await?;

    let etag = format!("\"{}\"", image.etag());
    if etag_matches(&headers, &etag) {
        image.body.close();
        info!(image_id = %request.id, "Bootstrap image not modified");
        return Ok((StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response());
    }

    let length = image.body.len();
    info!(
        image_id = %request.id,
        size_bytes = length,
        generation = image.metadata.generation,
        "Serving bootstrap image"
    );

    // The stream owns the body; the buffer goes back to the pool once the
    // response is fully sent or the client goes away.
    let stream = ReaderStream::with_capacity(image.body, STREAM_CHUNK_BYTES);
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, length.to_string()),
            (ETAG, etag),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn missing_image_id() -> ApiError {
    ApiError::bad_request("invalid_image_id", "Image id must not be empty")
}

/// Reject ids that cannot name an object inside the namespace.
fn validate_image_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(ApiError::bad_request(
            "invalid_image_id",
            format!("Invalid image id: {id:?}"),
        ));
    }
    if id.contains('/') || id.contains('\0') {
        return Err(ApiError::bad_request(
            "invalid_image_id",
            "Image id must be a single path segment",
        ));
    }
    Ok(())
}

/// True if any `If-None-Match` entry matches `etag` (weak comparison).
fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_validate_image_id() {
        assert!(validate_image_id("golden.img").is_ok());
        assert!(validate_image_id("..golden").is_ok());
        assert!(validate_image_id("").is_err());
        assert!(validate_image_id(".").is_err());
        assert!(validate_image_id("..").is_err());
        assert!(validate_image_id("a/b").is_err());
    }

    #[test]
    fn test_etag_matches() {
        let etag = "\"sha256/abc=\"";
        let mut headers = HeaderMap::new();
        assert!(!etag_matches(&headers, etag));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"sha256/other=\""));
        assert!(!etag_matches(&headers, etag));

        headers.insert(
            IF_NONE_MATCH,
            HeaderValue::from_static("\"sha256/other=\", W/\"sha256/abc=\""),
        );
        assert!(etag_matches(&headers, etag));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(etag_matches(&headers, etag));
    }
}
