use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::state::CacheState;
use crate::cache::store::{CacheEntry, CacheStore, EntryIdGenerator};
use crate::config::{AppConfig, ConfigStore, Mode};
use crate::images::{transcode, FetchError, ImageSource, Located};

/// Where the image handed to a client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
    /// Cached entry, cache considered fresh (or local mode).
    Cache,
    /// Cached entry, a background refresh was requested.
    CacheRefreshing,
    /// Fetched from a remote while the client waited.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub url: String,
    pub entry: CacheEntry,
    pub source: ServeSource,
}

/// Decides per request whether to serve from the cache folder, fetch from a
/// remote, or both. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CachePolicy {
    inner: Arc<PolicyInner>,
}

struct PolicyInner {
    config: Arc<ConfigStore>,
    state: CacheState,
    source: Arc<dyn ImageSource>,
    ids: EntryIdGenerator,
    // Serialises remote fetches, background and synchronous alike.
    fetch_gate: AsyncMutex<()>,
    refresh_tx: mpsc::Sender<()>,
}

impl CachePolicy {
    /// Creates the engine and starts its background refresher on the current
    /// tokio runtime. Outside a runtime refresh requests are dropped.
    pub fn new(config: Arc<ConfigStore>, source: Arc<dyn ImageSource>) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let inner = Arc::new(PolicyInner {
            config,
            state: CacheState::new(),
            source,
            ids: EntryIdGenerator::new(),
            fetch_gate: AsyncMutex::new(()),
            refresh_tx,
        });

        spawn_refresher(Arc::downgrade(&inner), refresh_rx);

        Self { inner }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn state(&self) -> &CacheState {
        &self.inner.state
    }

    pub fn store(&self, config: &AppConfig) -> CacheStore {
        CacheStore::new(self.inner.config.base_dir(), config)
    }

    /// Prunes invalid entries and picks a random valid one. An unreadable
    /// cache folder counts as empty.
    async fn serve_local(&self, store: &CacheStore) -> Option<CacheEntry> {
        let scan = store.clone();
        let entries = match tokio::task::spawn_blocking(move || scan.prune_invalid()).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!("Cannot read cache folder {}: {}", store.dir().display(), e);
                return None;
            }
            Err(e) => {
                error!("Cache folder scan failed: {}", e);
                return None;
            }
        };

        CacheStore::pick_random(&entries).cloned()
    }

    /// Produces an image URL for a client request addressed to `host`.
    pub async fn serve(&self, host: &str) -> Result<Served, FetchError> {
        let config = self.inner.config.snapshot();
        let store = self.store(&config);

        if let Some(entry) = self.serve_local(&store).await {
            let url = store.url_for(&entry, host);
            if config.mode == Mode::Local || self.inner.state.is_fresh(config.update_interval) {
                info!("Serving local image: {}", entry.name());
                return Ok(Served {
                    url,
                    entry,
                    source: ServeSource::Cache,
                });
            }

            info!("Serving local image {} and scheduling a refresh", entry.name());
            self.request_refresh();
            return Ok(Served {
                url,
                entry,
                source: ServeSource::CacheRefreshing,
            });
        }

        info!("No image found in cache folder, retrieving from remote");
        let _gate = self.inner.fetch_gate.lock().await;

        // Another request may have filled the cache while this one waited.
        let config = self.inner.config.snapshot();
        let store = self.store(&config);
        if let Some(entry) = self.serve_local(&store).await {
            info!("Serving image cached by a concurrent fetch: {}", entry.name());
            return Ok(Served {
                url: store.url_for(&entry, host),
                entry,
                source: ServeSource::Cache,
            });
        }

        let entry = self.fetch_locked(&config, &store).await?;
        Ok(Served {
            url: store.url_for(&entry, host),
            entry,
            source: ServeSource::Remote,
        })
    }

    /// Fetches one image from a random remote into the cache.
    pub async fn fetch_and_cache(&self) -> Result<CacheEntry, FetchError> {
        let _gate = self.inner.fetch_gate.lock().await;
        let config = self.inner.config.snapshot();
        let store = self.store(&config);
        self.fetch_locked(&config, &store).await
    }

    /// Queues a background refresh. At most one is pending at any time.
    pub fn request_refresh(&self) {
        match self.inner.refresh_tx.try_send(()) {
            Ok(()) => debug!("Background refresh queued"),
            Err(TrySendError::Full(())) => debug!("Background refresh already pending"),
            Err(TrySendError::Closed(())) => warn!("Background refresher is not running"),
        }
    }

    async fn refresh_if_stale(&self) -> Result<Option<CacheEntry>, FetchError> {
        let _gate = self.inner.fetch_gate.lock().await;
        let config = self.inner.config.snapshot();
        if config.mode == Mode::Local || self.inner.state.is_fresh(config.update_interval) {
            debug!("Cache already fresh, skipping background refresh");
            return Ok(None);
        }

        let store = self.store(&config);
        self.fetch_locked(&config, &store).await.map(Some)
    }

    // Caller holds the fetch gate.
    async fn fetch_locked(&self, config: &AppConfig, store: &CacheStore) -> Result<CacheEntry, FetchError> {
        info!("--- Starting remote retrieval ---");

        let remote = config
            .remotes
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(FetchError::NoRemotes)?;
        info!("Retrieving remote: {}", remote);

        let located = self.inner.source.locate(&remote).await.map_err(|e| {
            error!("Failed to query remote {}: {}", remote, e);
            e
        })?;

        store
            .ensure_dirs()
            .map_err(|e| FetchError::filesystem(store.dir(), e))?;

        let id = self.inner.ids.next_id();
        let temp_path = store.temp_path(id, located.extension());
        info!("Downloading image to: {}", temp_path.display());

        match located {
            Located::Inline { data, .. } => {
                tokio::fs::write(&temp_path, &data)
                    .await
                    .map_err(|e| FetchError::filesystem(&temp_path, e))?;
            }
            Located::Link { url, .. } => {
                info!("Retrieving from URL: {}", url);
                self.inner.source.download(&url, &temp_path).await.map_err(|e| {
                    error!("Failed to download {}: {}", url, e);
                    e
                })?;
            }
        }

        let raw = tokio::fs::read(&temp_path)
            .await
            .map_err(|e| FetchError::filesystem(&temp_path, e))?;
        let quality = config.image_quality;
        let data = tokio::task::spawn_blocking(move || transcode(raw, quality))
            .await?
            .map_err(|e| {
                error!("Failed to transcode {}: {}", temp_path.display(), e);
                e
            })?;

        // Written aside and renamed in, so concurrent scans never see a
        // partial entry.
        let entry = store.entry_for_id(id);
        let staged = store.staging_path(id);
        info!("Compressing image to: {}", entry.path().display());
        tokio::fs::write(&staged, &data)
            .await
            .map_err(|e| FetchError::filesystem(&staged, e))?;
        tokio::fs::rename(&staged, entry.path())
            .await
            .map_err(|e| FetchError::filesystem(entry.path(), e))?;

        tokio::fs::remove_file(&temp_path)
            .await
            .map_err(|e| FetchError::filesystem(&temp_path, e))?;
        debug!("Removed uncompressed image: {}", temp_path.display());

        self.inner.state.mark_updated();
        self.enforce_cache_limit(config, store);

        info!("--- Finished remote retrieval ---");
        Ok(entry)
    }

    fn enforce_cache_limit(&self, config: &AppConfig, store: &CacheStore) {
        if config.max_cache_size == 0 {
            return;
        }

        match store.count() {
            Ok(count) if count >= config.max_cache_size => {
                info!(
                    "Limit of MaxCacheSize ({}) reached, switching mode to local",
                    config.max_cache_size
                );
                if let Err(e) = self.inner.config.switch_to_local() {
                    error!("Failed to persist local mode: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Cannot count cache entries in {}: {}", store.dir().display(), e),
        }
    }
}

fn spawn_refresher(inner: Weak<PolicyInner>, mut refresh_rx: mpsc::Receiver<()>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, background refresh disabled");
        return;
    };

    handle.spawn(async move {
        while refresh_rx.recv().await.is_some() {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let policy = CachePolicy { inner };
            match policy.refresh_if_stale().await {
                Ok(Some(entry)) => info!("Background refresh cached {}", entry.name()),
                Ok(None) => {}
                Err(e) => error!("Background refresh failed: {}", e),
            }
        }
        debug!("Background refresher stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::tools::tests::{flat_png, noisy_png};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use regex::Regex;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    const HOST: &str = "localhost:8000";

    struct StubSource {
        image: Option<Vec<u8>>,
        as_link: bool,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn inline(image: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                image: Some(image),
                as_link: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn link(image: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                image: Some(image),
                as_link: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                image: None,
                as_link: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageSource for StubSource {
        async fn locate(&self, _remote: &str) -> Result<Located, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (&self.image, self.as_link) {
                (None, _) => Err(FetchError::BadUpstreamStatus(503)),
                (Some(data), false) => Ok(Located::Inline {
                    data: data.clone(),
                    extension: "png".into(),
                }),
                (Some(_), true) => Ok(Located::Link {
                    url: "https://img.example.com/a.png".into(),
                    extension: "png".into(),
                }),
            }
        }

        async fn download(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
            let data = self.image.clone().unwrap_or_default();
            tokio::fs::write(dest, &data)
                .await
                .map_err(|e| FetchError::filesystem(dest, e))?;
            Ok(data.len() as u64)
        }
    }

    fn setup(
        mode: Mode,
        max_cache_size: usize,
        update_interval: u64,
        source: Arc<StubSource>,
    ) -> (TempDir, CachePolicy) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig {
            mode,
            max_cache_size,
            update_interval,
            remotes: vec!["https://remote.example.com/api".into()],
            ..AppConfig::default()
        };
        std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();

        let (store, _) = ConfigStore::open(&path).unwrap();
        let policy = CachePolicy::new(Arc::new(store), source);
        (dir, policy)
    }

    fn cache_store(policy: &CachePolicy) -> CacheStore {
        policy.store(&policy.config().snapshot())
    }

    fn make_stale(policy: &CachePolicy) {
        policy.state().set_last_update(Utc::now() - Duration::seconds(3600));
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_empty_cache_fetches_synchronously() {
        let source = StubSource::inline(noisy_png(64, 64));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());

        let served = policy.serve(HOST).await.unwrap();

        assert_eq!(served.source, ServeSource::Remote);
        assert_eq!(source.calls(), 1);
        let pattern = Regex::new(r"^http://localhost:8000/cache/\d+\.jpg$").unwrap();
        assert!(pattern.is_match(&served.url), "unexpected url {}", served.url);

        let store = cache_store(&policy);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
        assert!(std::fs::read(served.entry.path()).unwrap().starts_with(&[0xFF, 0xD8]));
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served_without_remote_call() {
        let source = StubSource::inline(noisy_png(64, 64));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());

        let first = policy.serve(HOST).await.unwrap();
        let second = policy.serve(HOST).await.unwrap();

        assert_eq!(second.source, ServeSource::Cache);
        assert_eq!(second.url, first.url);
        assert_eq!(source.calls(), 1);
        assert_eq!(policy.config().snapshot().mode, Mode::Remote);
    }

    #[tokio::test]
    async fn test_cap_reached_switches_to_local_for_good() {
        let source = StubSource::inline(noisy_png(64, 64));
        let (dir, policy) = setup(Mode::Remote, 2, 10, source.clone());

        assert_eq!(policy.serve(HOST).await.unwrap().source, ServeSource::Remote);
        assert_eq!(policy.serve(HOST).await.unwrap().source, ServeSource::Cache);
        assert_eq!(policy.config().snapshot().mode, Mode::Remote);

        make_stale(&policy);
        let served = policy.serve(HOST).await.unwrap();
        assert_eq!(served.source, ServeSource::CacheRefreshing);

        let switched = wait_for(|| policy.config().snapshot().mode == Mode::Local).await;
        assert!(switched, "mode never switched to local");
        assert_eq!(source.calls(), 2);
        assert_eq!(cache_store(&policy).count().unwrap(), 2);

        let persisted = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(persisted.contains(r#""Mode": "local""#));

        make_stale(&policy);
        for _ in 0..5 {
            assert_eq!(policy.serve(HOST).await.unwrap().source, ServeSource::Cache);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_local_mode_never_refreshes_a_stale_cache() {
        let source = StubSource::inline(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Local, 0, 1, source.clone());
        let store = cache_store(&policy);
        store.ensure_dirs().unwrap();
        std::fs::write(store.path_for("1.jpg"), b"cached").unwrap();

        make_stale(&policy);
        let served = policy.serve(HOST).await.unwrap();

        assert_eq!(served.source, ServeSource::Cache);
        assert_eq!(served.url, "http://localhost:8000/cache/1.jpg");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_local_mode_still_fetches_when_cache_is_empty() {
        let source = StubSource::inline(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Local, 0, 10, source.clone());

        let served = policy.serve(HOST).await.unwrap();

        assert_eq!(served.source, ServeSource::Remote);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_entries_are_pruned_before_fetching() {
        let source = StubSource::inline(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());
        let store = cache_store(&policy);
        store.ensure_dirs().unwrap();
        std::fs::write(store.path_for("junk.txt"), b"not an image").unwrap();
        std::fs::write(store.path_for("empty.jpg"), b"").unwrap();

        let served = policy.serve(HOST).await.unwrap();

        assert_eq!(served.source, ServeSource::Remote);
        let names: Vec<_> = store.list().unwrap().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec![served.entry.name().to_string()]);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported() {
        let source = StubSource::failing();
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());

        let err = policy.serve(HOST).await.unwrap_err();

        assert!(matches!(err, FetchError::BadUpstreamStatus(503)));
        assert!(err.is_upstream());
        assert!(cache_store(&policy).list().is_err());
    }

    #[tokio::test]
    async fn test_linked_image_is_downloaded() {
        let source = StubSource::link(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());

        let entry = policy.fetch_and_cache().await.unwrap();

        assert!(entry.name().ends_with(".jpg"));
        assert!(entry.path().is_file());
    }

    #[tokio::test]
    async fn test_png_kept_as_is_still_named_jpg() {
        let png = flat_png(16, 16);
        let source = StubSource::inline(png.clone());
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source);

        let entry = policy.fetch_and_cache().await.unwrap();

        assert!(entry.name().ends_with(".jpg"));
        assert_eq!(std::fs::read(entry.path()).unwrap(), png);
    }

    #[tokio::test]
    async fn test_undecodable_download_aborts_and_leaves_temp_file() {
        let source = StubSource::inline(b"<html>oops</html>".to_vec());
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source);

        let err = policy.fetch_and_cache().await.unwrap_err();

        assert!(matches!(err, FetchError::Transcode(_)));
        let store = cache_store(&policy);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let source = StubSource::inline(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source.clone());

        let results = futures::future::join_all((0..5).map(|_| policy.serve(HOST))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(source.calls(), 1);
        assert_eq!(cache_store(&policy).count().unwrap(), 1);
        let remote_served = results
            .iter()
            .filter(|r| r.as_ref().unwrap().source == ServeSource::Remote)
            .count();
        assert_eq!(remote_served, 1);
    }

    #[tokio::test]
    async fn test_successful_fetch_adds_exactly_one_entry() {
        let source = StubSource::inline(noisy_png(32, 32));
        let (_dir, policy) = setup(Mode::Remote, 0, 10, source);
        policy.fetch_and_cache().await.unwrap();
        let before = cache_store(&policy).count().unwrap();

        policy.fetch_and_cache().await.unwrap();

        assert_eq!(cache_store(&policy).count().unwrap(), before + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entries_published_during_concurrent_serves_survive() {
        let source = StubSource::inline(noisy_png(256, 256));
        let (_dir, policy) = setup(Mode::Remote, 0, 3600, source);
        let store = cache_store(&policy);
        store.ensure_dirs().unwrap();
        std::fs::write(store.path_for("1.jpg"), b"\xFF\xD8\xFFseed").unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let policy = policy.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut served = Vec::new();
                    while !done.load(Ordering::SeqCst) {
                        let hit = policy.serve(HOST).await.unwrap();
                        assert_eq!(hit.source, ServeSource::Cache);
                        served.push(hit.entry);
                    }
                    served
                })
            })
            .collect();

        let mut fetched = Vec::new();
        for _ in 0..5 {
            fetched.push(policy.fetch_and_cache().await.unwrap());
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            for entry in reader.await.unwrap() {
                let bytes = std::fs::read(entry.path()).unwrap();
                if entry.name() != "1.jpg" {
                    assert!(image::load_from_memory(&bytes).is_ok(), "{} served partial", entry.name());
                }
            }
        }
        assert_eq!(store.count().unwrap(), 6);
        assert!(fetched.iter().all(|entry| entry.path().is_file()));
        assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_not_held_up_by_running_fetch() {
        let source = StubSource::inline(noisy_png(1024, 1024));
        let (_dir, policy) = setup(Mode::Remote, 0, 3600, source.clone());
        let store = cache_store(&policy);
        store.ensure_dirs().unwrap();
        std::fs::write(store.path_for("1.jpg"), b"\xFF\xD8\xFFseed").unwrap();

        let fetching = policy.clone();
        let fetch = tokio::spawn(async move { fetching.fetch_and_cache().await });
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let hit = policy.serve(HOST).await.unwrap();

        assert_eq!(hit.entry.name(), "1.jpg");
        assert!(!fetch.is_finished());
        assert!(fetch.await.unwrap().is_ok());
    }
}
