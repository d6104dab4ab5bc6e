//! Updates over HTTP against a local axum server.

use appcache::{AppCacheEvent, AppCacheService, RecordingFrontend, ServiceContext, UpdateConfig};
use appcache_cli::{PrintingFrontend, Runtime};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use resource_fetcher::{FetcherOptions, HttpFetcher};
use response_storage::MemoryStorage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, sync::oneshot};
use url::Url;

#[derive(Default)]
struct Site {
    /// Current manifest and its version; `None` answers 410.
    manifest: Mutex<Option<(u32, String)>>,
    files: Mutex<HashMap<String, String>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl Site {
    fn publish(&self, version: u32, manifest: &str) {
        *self.manifest.lock() = Some((version, manifest.to_string()));
    }

    fn withdraw(&self) {
        *self.manifest.lock() = None;
    }

    fn put(&self, name: &str, body: &str) {
        self.files.lock().insert(name.to_string(), body.to_string());
    }

    fn hits(&self, name: &str) -> usize {
        self.hits.lock().get(name).copied().unwrap_or_default()
    }

    fn hit(&self, name: &str) {
        *self.hits.lock().entry(name.to_string()).or_default() += 1;
    }
}

struct TestServer {
    base_url: Url,
    site: Arc<Site>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = Url::parse(&format!("http://127.0.0.1:{}/app/", addr.port())).unwrap();
        let site = Arc::new(Site::default());

        let app = Router::new()
            .route("/app/manifest", get(manifest_endpoint))
            .route("/app/:name", get(file_endpoint))
            .with_state(site.clone());

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            base_url,
            site,
            shutdown: Some(tx),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn manifest_endpoint(State(site): State<Arc<Site>>, headers: HeaderMap) -> Response {
    site.hit("manifest");
    let Some((version, body)) = site.manifest.lock().clone() else {
        return StatusCode::GONE.into_response();
    };
    let etag = format!("\"v{}\"", version);
    if headers
        .get(header::IF_NONE_MATCH)
        .is_some_and(|v| v.as_bytes() == etag.as_bytes())
    {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }
    (
        [
            (header::CONTENT_TYPE, "text/cache-manifest".to_string()),
            (header::ETAG, etag),
        ],
        body,
    )
        .into_response()
}

async fn file_endpoint(State(site): State<Arc<Site>>, Path(name): Path<String>) -> Response {
    site.hit(&name);
    match site.files.lock().get(&name).cloned() {
        Some(body) => body.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn service() -> AppCacheService {
    let fetcher = HttpFetcher::new(FetcherOptions::default().with_request_timeout(Duration::from_secs(5)))
        .unwrap();
    let context = ServiceContext::builder(Arc::new(MemoryStorage::new()), Arc::new(fetcher))
        .config(UpdateConfig::default())
        .build()
        .unwrap();
    AppCacheService::new(context)
}

#[tokio::test]
async fn test_first_download_and_revalidation() {
    let server = TestServer::new().await;
    server.site.publish(1, "CACHE MANIFEST\nstyle.css\napp.js\n");
    server.site.put("style.css", "body {}");
    server.site.put("app.js", "run()");
    server.site.put("index.html", "<html manifest=manifest>");

    let service = service();
    let frontend = RecordingFrontend::new();
    let host = service.create_host(frontend.clone());
    let group = service
        .start_update(Some(&host), &server.url("manifest"), Some(server.url("index.html")))
        .await
        .unwrap();
    group.wait_for_idle().await;

    assert_eq!(frontend.event_names_for(host.host_id()).last(), Some(&"cached"));
    let cache = host.associated_cache().unwrap();
    assert_eq!(cache.entry_count(), 4);
    // Initial fetch plus the 304 re-validation.
    assert_eq!(server.site.hits("manifest"), 2);
    assert!(service
        .can_handle_main_resource_offline(&server.url("index.html"))
        .await
        .unwrap());

    // Unchanged manifest: a conditional request answered 304.
    group.start_update(None, None);
    group.wait_for_idle().await;
    assert_eq!(frontend.event_names_for(host.host_id()).last(), Some(&"noupdate"));
    assert_eq!(server.site.hits("manifest"), 3);
    assert_eq!(server.site.hits("style.css"), 1);
}

#[tokio::test]
async fn test_new_manifest_version_is_picked_up() {
    let server = TestServer::new().await;
    server.site.publish(1, "CACHE MANIFEST\nstyle.css\n");
    server.site.put("style.css", "body {}");
    server.site.put("extra.js", "more()");

    let service = service();
    let frontend = RecordingFrontend::new();
    let host = service.create_host(frontend.clone());
    let group = service
        .start_update(Some(&host), &server.url("manifest"), None)
        .await
        .unwrap();
    group.wait_for_idle().await;
    let first = group.newest_complete_cache().unwrap();
    host.associate_cache(Some(first.clone()));

    server.site.publish(2, "CACHE MANIFEST\nstyle.css\nextra.js\n");
    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(
        frontend.event_names_for(host.host_id()).last(),
        Some(&"updateready")
    );
    assert!(host.swap_cache());
    let second = host.associated_cache().unwrap();
    assert_ne!(second.cache_id(), first.cache_id());
    assert!(second.entry(&server.url("extra.js")).is_some());
}

#[tokio::test]
async fn test_withdrawn_manifest_makes_group_obsolete() {
    let server = TestServer::new().await;
    server.site.publish(1, "CACHE MANIFEST\nstyle.css\n");
    server.site.put("style.css", "body {}");

    let service = service();
    let frontend = RecordingFrontend::new();
    let host = service.create_host(frontend.clone());
    let group = service
        .start_update(Some(&host), &server.url("manifest"), Some(server.url("style.css")))
        .await
        .unwrap();
    group.wait_for_idle().await;
    assert!(host.associated_cache().is_some());

    server.site.withdraw();
    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(frontend.events_for(host.host_id()).last(), Some(&AppCacheEvent::Obsolete));
    assert!(group.is_obsolete());
    assert!(service.get_all_info().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cli_runtime_over_http() {
    let server = TestServer::new().await;
    server.site.publish(1, "CACHE MANIFEST\nstyle.css\n");
    server.site.put("style.css", "body {}");
    server.site.put("index.html", "<html>");

    let fetcher = HttpFetcher::new(FetcherOptions::default()).unwrap();
    let runtime = Runtime::with_parts(
        Arc::new(MemoryStorage::new()),
        Arc::new(fetcher),
        UpdateConfig::default(),
        PrintingFrontend::new(Box::new(std::io::sink())),
    )
    .unwrap();

    let outcome = runtime
        .update(&server.url("manifest"), Some(server.url("index.html")))
        .await
        .unwrap();
    assert_eq!(outcome, AppCacheEvent::Cached);
    let found = runtime.lookup(&server.url("index.html")).await.unwrap();
    assert!(found.is_some());
    assert!(runtime.lookup(&server.url("other.html")).await.unwrap().is_none());
}
