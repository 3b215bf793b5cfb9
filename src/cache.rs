use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::AppError;

pub const CACHE_HIT_HEADER: &str = "x-images-cache-hit";
pub const KV_HIT_HEADER: &str = "x-images-kv-hit";

/// An encoded response body plus the headers captured with it.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub body: Bytes,
    pub headers: HashMap<String, String>,
}

impl CachedResponse {
    pub fn new(body: Bytes, content_type: &str) -> Self {
        CachedResponse {
            body,
            headers: HashMap::from([("content-type".to_string(), content_type.to_string())]),
        }
    }
}

/// Response cache strategy, keyed by full request URL. Selected once at
/// startup; handlers never branch on which backend is behind it.
#[async_trait]
pub trait ImageCache: Send + Sync {
    async fn init(&self) -> Result<(), AppError>;
    async fn get(&self, url: &str) -> Option<CachedResponse>;
    async fn put(&self, url: &str, response: &CachedResponse);
    async fn delete(&self, url: &str);
}

/// Backend selection knobs, normally resolved from the environment once at
/// plugin build time.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Hard off-switch; wins over everything else.
    pub disabled: bool,
    /// Prefer the persistent key-value backend over the in-memory cache.
    pub prefer_kv: bool,
    /// Generation tag namespacing all entries. Changes per deployment so a
    /// new build never serves bytes cached by an old one.
    pub generation: String,
    /// Root directory of the disk-backed key-value store.
    pub root: PathBuf,
    /// Emit `x-images-*` diagnostic headers on cache hits.
    pub emit_headers: bool,
}

impl CacheConfig {
    /// `IMAGES_USE_CACHE=false` disables caching; `IMAGES_USE_KV=true` or a
    /// set `IMAGES_DEPLOYMENT_ID` selects the key-value backend;
    /// `IMAGES_USE_HEADERS=false` suppresses the diagnostic headers.
    pub fn from_env() -> Self {
        let deployment_id = env::var("IMAGES_DEPLOYMENT_ID").ok();
        CacheConfig {
            disabled: env_flag("IMAGES_USE_CACHE") == Some(false),
            prefer_kv: env_flag("IMAGES_USE_KV").unwrap_or(deployment_id.is_some()),
            generation: deployment_id.unwrap_or_else(|| "dev".to_string()),
            root: env::var_os("IMAGES_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".images-cache")),
            emit_headers: env_flag("IMAGES_USE_HEADERS").unwrap_or(true),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backend {
    Noop,
    Memory,
    Kv,
}

/// Pure capability/selection policy, separated from construction so it can be
/// tested without touching the filesystem.
pub(crate) fn select_backend(config: &CacheConfig) -> Backend {
    if config.disabled {
        Backend::Noop
    } else if config.prefer_kv {
        Backend::Kv
    } else {
        Backend::Memory
    }
}

/// Build and initialize the configured backend, falling back to the no-op
/// cache instead of failing startup when initialization goes wrong.
pub async fn build_cache(config: &CacheConfig) -> Arc<dyn ImageCache> {
    match select_backend(config) {
        Backend::Noop => {
            info!("response cache disabled");
            Arc::new(NoopCache)
        }
        Backend::Memory => Arc::new(MemoryCache::new(config)),
        Backend::Kv => {
            let cache = KvCache::new(config);
            match cache.init().await {
                Ok(()) => Arc::new(cache),
                Err(err) => {
                    error!("cache not available: {err}");
                    Arc::new(NoopCache)
                }
            }
        }
    }
}

/// In-process response cache; the platform-cache analog. Entries are keyed
/// under the generation tag, so a restarted process with a new tag never sees
/// entries it did not write (moot in-process, but keeps the key contract
/// identical across backends).
pub struct MemoryCache {
    entries: DashMap<String, CachedResponse>,
    generation: String,
    emit_headers: bool,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        MemoryCache {
            entries: DashMap::new(),
            generation: config.generation.clone(),
            emit_headers: config.emit_headers,
        }
    }

    fn key(&self, url: &str) -> String {
        format!("{}:{url}", self.generation)
    }
}

#[async_trait]
impl ImageCache for MemoryCache {
    async fn init(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get(&self, url: &str) -> Option<CachedResponse> {
        let mut cached = self.entries.get(&self.key(url))?.clone();
        if self.emit_headers {
            cached
                .headers
                .insert(CACHE_HIT_HEADER.to_string(), "true".to_string());
            cached
                .headers
                .insert(KV_HIT_HEADER.to_string(), "false".to_string());
        }
        Some(cached)
    }

    async fn put(&self, url: &str, response: &CachedResponse) {
        self.entries.insert(self.key(url), response.clone());
    }

    async fn delete(&self, url: &str) {
        self.entries.remove(&self.key(url));
    }
}

/// Disk-backed key-value cache: survives restarts, shared across workers.
///
/// Layout is `<root>/<generation>/<sha256(url)>.{bin,json}` with the body in
/// the `.bin` file and the captured headers serialized next to it. The store
/// has no generational namespacing of its own, so `init` enumerates sibling
/// generation directories and deletes the stale ones.
pub struct KvCache {
    root: PathBuf,
    generation: String,
    emit_headers: bool,
}

impl KvCache {
    pub fn new(config: &CacheConfig) -> Self {
        KvCache {
            root: config.root.clone(),
            generation: config.generation.clone(),
            emit_headers: config.emit_headers,
        }
    }

    fn entry_stem(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.root.join(&self.generation).join(format!("{digest:x}"))
    }

    async fn clear_old_generations(&self) -> std::io::Result<()> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy() == self.generation.as_str() {
                continue;
            }
            fs::remove_dir_all(entry.path()).await?;
            info!("deleted stale cache generation: {:?}", entry.file_name());
        }
        Ok(())
    }
}

#[async_trait]
impl ImageCache for KvCache {
    async fn init(&self) -> Result<(), AppError> {
        let generation_dir = self.root.join(&self.generation);
        fs::create_dir_all(&generation_dir)
            .await
            .map_err(|e| AppError::Config(format!("cannot create cache dir: {e}")))?;

        // Stale generations are cleaned up best-effort; a failure here must
        // not take the preferred backend down with it.
        if let Err(err) = self.clear_old_generations().await {
            warn!("failed to clear old cache generations: {err}");
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> Option<CachedResponse> {
        let stem = self.entry_stem(url);
        let body = fs::read(stem.with_extension("bin")).await.ok()?;
        let mut headers: HashMap<String, String> = match fs::read(stem.with_extension("json")).await
        {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "image/png".to_string());
        if self.emit_headers {
            headers.insert(CACHE_HIT_HEADER.to_string(), "true".to_string());
            headers.insert(KV_HIT_HEADER.to_string(), "true".to_string());
        }

        Some(CachedResponse {
            body: body.into(),
            headers,
        })
    }

    async fn put(&self, url: &str, response: &CachedResponse) {
        let stem = self.entry_stem(url);
        if let Err(err) = fs::write(stem.with_extension("bin"), &response.body).await {
            error!("failed to store cache body for {url}: {err}");
            return;
        }
        match serde_json::to_vec(&response.headers) {
            Ok(raw) => {
                if let Err(err) = fs::write(stem.with_extension("json"), raw).await {
                    error!("failed to store cache headers for {url}: {err}");
                }
            }
            Err(err) => error!("failed to serialize cache headers for {url}: {err}"),
        }
    }

    async fn delete(&self, url: &str) {
        let stem = self.entry_stem(url);
        let _ = fs::remove_file(stem.with_extension("bin")).await;
        let _ = fs::remove_file(stem.with_extension("json")).await;
    }
}

/// Always a miss; puts are discarded. Used when caching is disabled or the
/// preferred backend failed to come up.
pub struct NoopCache;

#[async_trait]
impl ImageCache for NoopCache {
    async fn init(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get(&self, _url: &str) -> Option<CachedResponse> {
        None
    }

    async fn put(&self, _url: &str, _response: &CachedResponse) {}

    async fn delete(&self, _url: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(root: &Path) -> CacheConfig {
        CacheConfig {
            disabled: false,
            prefer_kv: false,
            generation: "gen-a".to_string(),
            root: root.to_path_buf(),
            emit_headers: true,
        }
    }

    #[test]
    fn selection_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        assert_eq!(select_backend(&cfg), Backend::Memory);

        cfg.prefer_kv = true;
        assert_eq!(select_backend(&cfg), Backend::Kv);

        // disable wins over the kv preference
        cfg.disabled = true;
        assert_eq!(select_backend(&cfg), Backend::Noop);
    }

    #[actix_web::test]
    async fn memory_cache_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(&config(tmp.path()));
        let stored = CachedResponse::new(Bytes::from_static(b"abc"), "image/png");

        assert!(cache.get("/images/a.png?rw=1").await.is_none());
        cache.put("/images/a.png?rw=1", &stored).await;

        let hit = cache.get("/images/a.png?rw=1").await.unwrap();
        assert_eq!(hit.body, stored.body);
        assert_eq!(hit.headers.get(CACHE_HIT_HEADER).unwrap(), "true");
        assert_eq!(hit.headers.get(KV_HIT_HEADER).unwrap(), "false");

        cache.delete("/images/a.png?rw=1").await;
        assert!(cache.get("/images/a.png?rw=1").await.is_none());
    }

    #[actix_web::test]
    async fn memory_cache_keys_include_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        let cache_a = MemoryCache::new(&cfg);
        cfg.generation = "gen-b".to_string();
        let cache_b = MemoryCache::new(&cfg);

        assert_ne!(cache_a.key("/x"), cache_b.key("/x"));
    }

    #[actix_web::test]
    async fn kv_cache_round_trip_and_header_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = KvCache::new(&config(tmp.path()));
        cache.init().await.unwrap();

        let mut stored = CachedResponse::new(Bytes::from_static(b"gifdata"), "image/gif");
        stored.headers.remove("content-type");
        cache.put("/images/b.gif", &stored).await;

        let hit = cache.get("/images/b.gif").await.unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"gifdata"));
        // content-type defaults to image/png when none was captured
        assert_eq!(hit.headers.get("content-type").unwrap(), "image/png");
        assert_eq!(hit.headers.get(KV_HIT_HEADER).unwrap(), "true");

        cache.delete("/images/b.gif").await;
        assert!(cache.get("/images/b.gif").await.is_none());
    }

    #[actix_web::test]
    async fn kv_init_purges_stale_generations() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());

        let old = KvCache::new(&cfg);
        old.init().await.unwrap();
        old.put("/images/c.png", &CachedResponse::new(Bytes::from_static(b"old"), "image/png"))
            .await;

        cfg.generation = "gen-b".to_string();
        let new = KvCache::new(&cfg);
        new.init().await.unwrap();

        assert!(!tmp.path().join("gen-a").exists());
        assert!(tmp.path().join("gen-b").exists());
        // the old entry is unreachable from the new generation either way
        assert!(new.get("/images/c.png").await.is_none());
    }

    #[actix_web::test]
    async fn suppressed_headers_leave_hits_unmarked() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.emit_headers = false;
        let cache = MemoryCache::new(&cfg);

        cache
            .put("/x", &CachedResponse::new(Bytes::from_static(b"1"), "image/png"))
            .await;
        let hit = cache.get("/x").await.unwrap();
        assert!(!hit.headers.contains_key(CACHE_HIT_HEADER));
    }

    #[actix_web::test]
    async fn build_cache_disabled_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.disabled = true;
        let cache = build_cache(&cfg).await;
        cache
            .put("/x", &CachedResponse::new(Bytes::from_static(b"1"), "image/png"))
            .await;
        assert!(cache.get("/x").await.is_none());
    }
}
