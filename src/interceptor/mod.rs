//! Cache Interceptor
//!
//! Serves a fixed manifest of static resources from a named cache.
//! A hit is answered from the cache and refreshed in the background; a miss
//! (including a stored 404) is fetched, cached, then answered.

pub mod events;
pub mod lifecycle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use reqwest::Url;
use tracing::{debug, error, info, trace, warn};

use crate::cache::{Cache, CacheError, CacheMatch, CacheStorage};
use crate::net::{Fetcher, NetworkError, Request, Response};

pub use events::FetchEvent;
pub use lifecycle::{ClientId, ClientRegistry, WorkerState};

/// Name of the cache holding the manifest
pub const CACHE_NAME: &str = "storage-testing";

/// Resources cached at install time
pub const MANIFEST: &[&str] = &["index.html", "storage.js"];

/// Interceptor errors
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkerState,
    },

    #[error("Invalid resource path '{0}'")]
    InvalidPath(String),
}

/// What the interceptor did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Answered by the interceptor
    Respond(Response),
    /// Not intercepted; the host handles it as usual
    Passthrough,
}

/// Request interceptor backed by a named cache
pub struct CacheInterceptor {
    /// Opens the cache by name on every use
    caches: Arc<dyn CacheStorage>,
    /// Network access
    fetcher: Arc<dyn Fetcher>,
    /// Base URL manifest paths are resolved against
    origin: Url,
    cache_name: String,
    manifest: Vec<String>,
    state: RwLock<WorkerState>,
    /// Set at install so activation never waits for older versions
    skip_waiting: AtomicBool,
    clients: Arc<ClientRegistry>,
}

impl CacheInterceptor {
    /// Create an interceptor for a named cache and its manifest
    pub fn with_manifest(
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        origin: Url,
        clients: Arc<ClientRegistry>,
        cache_name: impl Into<String>,
        manifest: Vec<String>,
    ) -> Self {
        Self {
            caches,
            fetcher,
            origin,
            cache_name: cache_name.into(),
            manifest,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            clients,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
        debug!(state = %state, "Interceptor state changed");
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Resolve a resource path against the origin
    pub fn resolve(&self, path: &str) -> Result<Url, InterceptError> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        // Dot segments would climb out of the origin directory
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(InterceptError::InvalidPath(path.to_string()));
        }
        let encoded = segments
            .iter()
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        self.origin
            .join(&encoded)
            .map_err(|_| InterceptError::InvalidPath(path.to_string()))
    }

    async fn open_cache(&self) -> Result<Arc<dyn Cache>, CacheError> {
        self.caches.open(&self.cache_name).await
    }

    /// Fetch and cache every manifest entry.
    ///
    /// All-or-nothing: any failed entry fails installation and the
    /// interceptor becomes redundant.
    pub async fn install(&self) -> Result<(), InterceptError> {
        self.set_state(WorkerState::Installing);
        self.skip_waiting.store(true, Ordering::SeqCst);

        let result = self.populate_manifest().await;
        match result {
            Ok(()) => {
                self.set_state(WorkerState::Installed);
                info!(
                    cache = %self.cache_name,
                    entries = self.manifest.len(),
                    "Interceptor installed"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant);
                error!(cache = %self.cache_name, error = %e, "Interceptor installation failed");
                Err(e)
            }
        }
    }

    async fn populate_manifest(&self) -> Result<(), InterceptError> {
        let requests = self
            .manifest
            .iter()
            .map(|path| self.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>, _>>()?;
        let cache = self.open_cache().await?;
        cache.add_all(&requests, self.fetcher.as_ref()).await?;
        Ok(())
    }

    /// Take control of every open client immediately.
    ///
    /// Returns the number of newly claimed clients.
    pub async fn activate(&self) -> Result<usize, InterceptError> {
        let state = self.state();
        if state != WorkerState::Installed || !self.skip_waiting.load(Ordering::SeqCst) {
            return Err(InterceptError::InvalidState {
                operation: "activate",
                state,
            });
        }

        self.set_state(WorkerState::Activating);
        let claimed = self.clients.claim();
        self.set_state(WorkerState::Activated);

        info!(claimed = claimed, "Interceptor activated");
        Ok(claimed)
    }

    /// Handle an intercepted request.
    ///
    /// Background revalidation is registered on `event`; await
    /// [`FetchEvent::settled`] before dropping the event's work.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Result<FetchOutcome, InterceptError> {
        let request = event.request();
        if !request.is_get() {
            trace!(method = %request.method, url = %request.url, "Not intercepting");
            return Ok(FetchOutcome::Passthrough);
        }

        match self.lookup(request).await {
            CacheMatch::Found(response) => {
                debug!(url = %request.url, "Cache HIT");
                self.revalidate(event);
                Ok(FetchOutcome::Respond(response))
            }
            CacheMatch::NotFound => {
                debug!(url = %request.url, "Cache MISS, fetching");
                let response = self.fill(request).await?;
                Ok(FetchOutcome::Respond(response))
            }
        }
    }

    /// Cached response for `request`; a stored 404 counts as absent
    async fn lookup(&self, request: &Request) -> CacheMatch {
        let found = match self.open_cache().await {
            Ok(cache) => cache.match_request(request).await,
            Err(e) => Err(e),
        };
        match found {
            Ok(CacheMatch::Found(response)) if response.status != 404 => {
                CacheMatch::Found(response)
            }
            Ok(_) => CacheMatch::NotFound,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed, using network");
                CacheMatch::NotFound
            }
        }
    }

    /// Fetch from the network and store the result before returning it
    async fn fill(&self, request: &Request) -> Result<Response, InterceptError> {
        let response = match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    url = %request.url,
                    error = %e,
                    "Could not fetch resource from cache or network"
                );
                return Err(e.into());
            }
        };

        trace!(
            url = %request.url,
            status = response.status,
            content_type = response.header("content-type").unwrap_or("-"),
            "Fetched from network"
        );
        let cache = self.open_cache().await?;
        cache.put(request, &response).await?;
        Ok(response)
    }

    /// Refresh the cached entry in the background
    fn revalidate(&self, event: &FetchEvent) {
        let request = event.request().clone();
        let caches = Arc::clone(&self.caches);
        let fetcher = Arc::clone(&self.fetcher);
        let cache_name = self.cache_name.clone();

        event.wait_until(async move {
            let response = match fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(
                        url = %request.url,
                        error = %e,
                        "Could not update resource from network"
                    );
                    return;
                }
            };

            let stored = match caches.open(&cache_name).await {
                Ok(cache) => cache.put(&request, &response).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => debug!(url = %request.url, "Revalidated cache entry"),
                Err(e) => error!(url = %request.url, error = %e, "Could not update cached resource"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DiskCacheStorage, MemoryCacheStorage};
    use crate::storage_root::StorageRoot;
    use async_trait::async_trait;
    use reqwest::Method;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const ORIGIN: &str = "http://origin.test/";

    fn interceptor(
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        origin: Url,
    ) -> CacheInterceptor {
        CacheInterceptor::with_manifest(
            caches,
            fetcher,
            origin,
            Arc::new(ClientRegistry::new()),
            CACHE_NAME,
            MANIFEST.iter().map(|p| p.to_string()).collect(),
        )
    }

    /// Answers from a table keyed by URL path; unknown paths fail
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, Result<Response, NetworkError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn respond(&self, path: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(path.to_string(), Ok(Response::new(status, body)));
        }

        fn fail(&self, path: &str) {
            self.responses.lock().unwrap().insert(
                path.to_string(),
                Err(NetworkError::Transport("connection refused".to_string())),
            );
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(request.url.path())
                .cloned()
                .unwrap_or_else(|| Err(NetworkError::Transport("no route".to_string())))
        }
    }

    struct Fixture {
        interceptor: CacheInterceptor,
        caches: Arc<MemoryCacheStorage>,
        fetcher: Arc<ScriptedFetcher>,
    }

    impl Fixture {
        fn new() -> Self {
            let caches = Arc::new(MemoryCacheStorage::new());
            let fetcher = Arc::new(ScriptedFetcher::default());
            let interceptor = interceptor(
                caches.clone(),
                fetcher.clone(),
                Url::parse(ORIGIN).unwrap(),
            );
            Self {
                interceptor,
                caches,
                fetcher,
            }
        }

        fn request(&self, path: &str) -> Request {
            Request::get(self.interceptor.resolve(path).unwrap())
        }

        async fn cached(&self, path: &str) -> CacheMatch {
            self.caches
                .open(CACHE_NAME)
                .await
                .unwrap()
                .match_request(&self.request(path))
                .await
                .unwrap()
        }

        async fn seed(&self, path: &str, response: Response) {
            self.caches
                .open(CACHE_NAME)
                .await
                .unwrap()
                .put(&self.request(path), &response)
                .await
                .unwrap();
        }

        async fn fetch(&self, path: &str) -> Result<FetchOutcome, InterceptError> {
            let event = FetchEvent::new(self.request(path));
            let outcome = self.interceptor.handle_fetch(&event).await;
            event.settled().await;
            outcome
        }
    }

    fn body(outcome: FetchOutcome) -> Vec<u8> {
        match outcome {
            FetchOutcome::Respond(response) => response.body,
            FetchOutcome::Passthrough => panic!("Expected a response"),
        }
    }

    #[tokio::test]
    async fn test_install_caches_manifest() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");
        fx.fetcher.respond("/storage.js", 200, "js");

        fx.interceptor.install().await.unwrap();

        assert_eq!(fx.interceptor.state(), WorkerState::Installed);
        assert!(matches!(fx.cached("index.html").await, CacheMatch::Found(_)));
        assert!(matches!(fx.cached("storage.js").await, CacheMatch::Found(_)));
    }

    #[tokio::test]
    async fn test_failed_install_stores_nothing() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");
        fx.fetcher.fail("/storage.js");

        assert!(fx.interceptor.install().await.is_err());
        assert_eq!(fx.interceptor.state(), WorkerState::Redundant);
        assert_eq!(fx.cached("index.html").await, CacheMatch::NotFound);

        let err = fx.interceptor.activate().await.unwrap_err();
        assert!(matches!(err, InterceptError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_activate_claims_open_clients() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");
        fx.fetcher.respond("/storage.js", 200, "js");
        let client = fx.interceptor.clients().register();

        // Not installed yet
        assert!(fx.interceptor.activate().await.is_err());

        fx.interceptor.install().await.unwrap();
        assert_eq!(fx.interceptor.activate().await.unwrap(), 1);
        assert_eq!(fx.interceptor.state(), WorkerState::Activated);
        assert!(fx.interceptor.clients().is_controlled(client));
    }

    #[tokio::test]
    async fn test_miss_fills_cache() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");

        let outcome = fx.fetch("index.html").await.unwrap();
        assert_eq!(body(outcome), b"<html>");
        assert_eq!(
            fx.cached("index.html").await,
            CacheMatch::Found(Response::new(200, "<html>"))
        );
        assert_eq!(fx.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_fetch_is_served_from_cache() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");
        fx.fetch("index.html").await.unwrap();

        // Network is gone; the hit still answers and revalidation only logs
        fx.fetcher.fail("/index.html");
        let outcome = fx.fetch("index.html").await.unwrap();

        assert_eq!(body(outcome), b"<html>");
        assert_eq!(
            fx.cached("index.html").await,
            CacheMatch::Found(Response::new(200, "<html>"))
        );
    }

    #[tokio::test]
    async fn test_hit_serves_stale_and_revalidates() {
        let fx = Fixture::new();
        fx.seed("index.html", Response::new(200, "old")).await;
        fx.fetcher.respond("/index.html", 200, "new");

        let event = FetchEvent::new(fx.request("index.html"));
        let outcome = fx.interceptor.handle_fetch(&event).await.unwrap();
        assert_eq!(body(outcome), b"old");
        assert_eq!(event.pending_count(), 1);

        event.settled().await;
        assert_eq!(fx.fetcher.calls(), 1);
        assert_eq!(
            fx.cached("index.html").await,
            CacheMatch::Found(Response::new(200, "new"))
        );
    }

    #[tokio::test]
    async fn test_stored_404_is_a_miss() {
        let fx = Fixture::new();
        fx.seed("index.html", Response::new(404, "not found")).await;
        fx.fetcher.respond("/index.html", 200, "<html>");

        let event = FetchEvent::new(fx.request("index.html"));
        let outcome = fx.interceptor.handle_fetch(&event).await.unwrap();

        assert_eq!(body(outcome), b"<html>");
        // Filled synchronously, nothing left in the background
        assert_eq!(event.pending_count(), 0);
        assert_eq!(fx.fetcher.calls(), 1);
        assert_eq!(
            fx.cached("index.html").await,
            CacheMatch::Found(Response::new(200, "<html>"))
        );
    }

    #[tokio::test]
    async fn test_miss_network_failure_propagates() {
        let fx = Fixture::new();
        fx.fetcher.fail("/index.html");

        let err = fx.fetch("index.html").await.unwrap_err();
        assert!(matches!(err, InterceptError::Network(_)));
        assert_eq!(fx.cached("index.html").await, CacheMatch::NotFound);
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let fx = Fixture::new();
        fx.fetcher.respond("/index.html", 200, "<html>");
        let url = fx.interceptor.resolve("index.html").unwrap();
        let event = FetchEvent::new(Request::new(Method::POST, url));

        let outcome = fx.interceptor.handle_fetch(&event).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Passthrough);
        assert_eq!(event.pending_count(), 0);
        assert_eq!(fx.fetcher.calls(), 0);
        assert_eq!(fx.cached("index.html").await, CacheMatch::NotFound);
    }

    #[test]
    fn test_resolve_against_origin() {
        let fx = Fixture::new();
        assert_eq!(
            fx.interceptor.resolve("/index.html").unwrap().as_str(),
            "http://origin.test/index.html"
        );
        assert_eq!(
            fx.interceptor.resolve("assets/a b.js").unwrap().as_str(),
            "http://origin.test/assets/a%20b.js"
        );
    }

    #[test]
    fn test_resolve_rejects_dot_segments() {
        let fx = Fixture::new();
        for path in ["../x", "assets/../../x", "./index.html", "a/."] {
            assert!(matches!(
                fx.interceptor.resolve(path),
                Err(InterceptError::InvalidPath(_))
            ));
        }
        // Dots inside a name are fine
        assert!(fx.interceptor.resolve("a..b/c.js").is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_against_http_origin() {
        use crate::net::HttpFetcher;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string("js"))
            .mount(&mock_server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let origin = Url::parse(&format!("{}/", mock_server.uri())).unwrap();
        let interceptor = interceptor(
            Arc::new(DiskCacheStorage::new(StorageRoot::new(tmp.path()))),
            Arc::new(HttpFetcher::new().unwrap()),
            origin,
        );

        interceptor.install().await.unwrap();
        interceptor.activate().await.unwrap();

        for _ in 0..2 {
            let event = FetchEvent::new(Request::get(interceptor.resolve("index.html").unwrap()));
            let outcome = interceptor.handle_fetch(&event).await.unwrap();
            assert_eq!(body(outcome), b"<html>");
            event.settled().await;
        }

        // Install fetched both entries once; each hit revalidated index.html
        let received = mock_server.received_requests().await.unwrap();
        let index_fetches = received
            .iter()
            .filter(|r| r.url.path() == "/index.html")
            .count();
        assert_eq!(index_fetches, 3);
    }
}
