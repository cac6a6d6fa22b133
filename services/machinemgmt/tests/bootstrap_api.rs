use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use infra_bootimage::store::{SidecarMetadata, SIDECAR_SUFFIX};
use infra_bootimage::{
    BootstrapImageService, BufferPool, InMemoryObjectStore, IntegrityAlgorithm, RetryPolicy,
    ServiceConfig,
};
use infra_machinemgmt::{api, build_state, config::Config, state::AppState};
use rstest::rstest;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const GOLDEN: &[u8] = b"hello world";
const GOLDEN_ETAG: &str = "\"sha256/uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek=\"";

struct ApiFixture {
    base_url: String,
    state: AppState,
    store: InMemoryObjectStore,
}

fn test_state() -> (AppState, InMemoryObjectStore) {
    let store = InMemoryObjectStore::new();
    store.insert("bootstrap/golden.img", GOLDEN);

    let config = ServiceConfig {
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        ..Default::default()
    };
    let images =
        BootstrapImageService::new(config, Arc::new(store.clone()), BufferPool::default())
            .unwrap();

    (AppState::new(images, CancellationToken::new()), store)
}

async fn start_api() -> ApiFixture {
    let (state, store) = test_state();
    let app = api::create_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ApiFixture {
        base_url: format!("http://{addr}"),
        state,
        store,
    }
}

#[tokio::test]
async fn test_get_golden_image() {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/bootstrap/image/golden.img", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
    assert_eq!(resp.headers().get("content-length").unwrap(), "11");
    assert_eq!(resp.headers().get("etag").unwrap(), GOLDEN_ETAG);

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], GOLDEN);
}

#[tokio::test]
async fn test_body_returns_buffer_to_pool() {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let body = client
            .get(format!("{}/bootstrap/image/golden.img", fixture.base_url))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], GOLDEN);
    }

    // The server may still be dropping the last response body.
    for _ in 0..50 {
        if fixture.state.images().pool().stats().outstanding == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fixture.state.images().pool().stats().outstanding, 0);
}

#[rstest]
#[case::exact(GOLDEN_ETAG, StatusCode::NOT_MODIFIED)]
#[case::weak("W/\"sha256/uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek=\"", StatusCode::NOT_MODIFIED)]
#[case::wildcard("*", StatusCode::NOT_MODIFIED)]
#[case::stale("\"sha256/stale=\"", StatusCode::OK)]
#[tokio::test]
async fn test_if_none_match(#[case] if_none_match: &str, #[case] expected: StatusCode) {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/bootstrap/image/golden.img", fixture.base_url))
        .header("if-none-match", if_none_match)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), expected);
    assert_eq!(resp.headers().get("etag").unwrap(), GOLDEN_ETAG);
    if expected == StatusCode::NOT_MODIFIED {
        assert!(resp.bytes().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_missing_image_is_404() {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/bootstrap/image/missing.img", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "image_not_found");
    assert_eq!(body["status"], 404);
    assert_eq!(fixture.store.metadata_calls(), 1);
}

#[tokio::test]
async fn test_checksum_mismatch_is_502() {
    let fixture = start_api().await;
    let checksum = IntegrityAlgorithm::Crc32c.checksum(GOLDEN);
    fixture
        .store
        .insert_with_checksum("bootstrap/corrupt.img", GOLDEN, checksum ^ 0xff);
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/bootstrap/image/corrupt.img", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "checksum_mismatch");
    assert_eq!(body["retryable"], false);
    assert_eq!(fixture.state.images().pool().stats().outstanding, 0);
}

#[tokio::test]
async fn test_backend_outage_is_502() {
    let fixture = start_api().await;
    fixture.store.fail_next_metadata(10);
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/bootstrap/image/golden.img", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "object_read_failed");
    assert_eq!(body["retryable"], true);
    assert_eq!(fixture.store.metadata_calls(), 3);
}

#[rstest]
#[case::with_id("/bootstrap/image/golden.img")]
#[case::without_id("/bootstrap/image")]
#[tokio::test]
async fn test_post_is_405(#[case] path: &str) {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}{path}", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(fixture.store.metadata_calls(), 0);
}

#[tokio::test]
async fn test_health_endpoints() {
    let fixture = start_api().await;
    let client = reqwest::Client::new();

    for path in ["startup", "liveness", "readiness"] {
        let resp = client
            .get(format!("{}/health/{path}", fixture.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "/health/{path}");

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "machinemgmt");
    }
}

// Dot segments are normalized away by HTTP clients, so these go straight to
// the router with a raw request URI.
#[rstest]
#[case::dot("/bootstrap/image/.")]
#[case::dot_dot("/bootstrap/image/..")]
#[case::empty("/bootstrap/image/")]
#[case::no_id("/bootstrap/image")]
#[case::encoded_slash("/bootstrap/image/a%2Fb")]
#[tokio::test]
async fn test_invalid_ids_are_400(#[case] uri: &str) {
    let (state, store) = test_state();
    let app = api::create_router(state);

    let resp = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.metadata_calls(), 0);
}

#[tokio::test]
async fn test_shutdown_drains() {
    let (state, _store) = test_state();
    state.shutdown().cancel();
    let app = api::create_router(state);

    let readiness = app
        .clone()
        .oneshot(Request::get("/health/readiness").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(readiness.status(), StatusCode::SERVICE_UNAVAILABLE);

    let image = app
        .oneshot(
            Request::get("/bootstrap/image/golden.img")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(image.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_serves_from_image_root() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("bootstrap/golden.img");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, GOLDEN).unwrap();
    let mut sidecar_path = path.into_os_string();
    sidecar_path.push(SIDECAR_SUFFIX);
    let sidecar = SidecarMetadata {
        generation: 1,
        checksum: IntegrityAlgorithm::Crc32c.checksum(GOLDEN),
    };
    std::fs::write(sidecar_path, serde_json::to_vec(&sidecar).unwrap()).unwrap();

    let root = dir.path().to_string_lossy().into_owned();
    let config = Config::from_lookup(|name| match name {
        "MACHINEMGMT_IMAGE_ROOT" => Some(root.clone()),
        _ => None,
    })
    .unwrap();
    let app = api::create_router(build_state(&config, CancellationToken::new()).unwrap());

    let resp = app
        .oneshot(
            Request::get("/bootstrap/image/golden.img")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("etag").unwrap(), GOLDEN_ETAG);
    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], GOLDEN);
}
