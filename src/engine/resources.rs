// src/engine/resources.rs
//
// Resource lifecycle: item-scoped handles, a bounded LRU cache of transformed
// images, and a periodic memory-pressure check.

use crate::config::ProcessorConfig;
use crate::engine::io::{Fingerprint, SourceBytes};
use crate::error::PressError;
use image::DynamicImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

type ResourceResult<T> = std::result::Result<T, PressError>;

/// Entries evicted at once when an insert finds the cache full.
const CACHE_EVICT_BATCH: usize = 10;

/// Budget used when neither a configured nor a detected limit is available.
pub const FALLBACK_MEMORY_BUDGET: u64 = 1024 * 1024 * 1024;

const MIN_RESERVED_MEMORY: u64 = 64 * 1024 * 1024;
const MAX_RESERVED_MEMORY: u64 = 512 * 1024 * 1024;

/// Knobs taken from `ProcessorConfig`.
#[derive(Debug, Clone, Copy)]
struct Limits {
    cache_capacity: usize,
    cache_max_pixels: u64,
    pressure_ratio: f64,
    budget: u64,
    check_interval: Duration,
}

/// Cache identity: which source, and which pipeline produced the pixels.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: Fingerprint,
    /// Rendering of the stage list and size ceiling, see `pipeline::variant_key`.
    pub variant: String,
}

impl CacheKey {
    pub fn new(source: Fingerprint, variant: impl Into<String>) -> Self {
        Self {
            source,
            variant: variant.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.variant)
    }
}

/// What one live handle keeps in memory.
#[derive(Debug, Clone, Copy, Default)]
struct HandleUsage {
    source_bytes: u64,
    /// Largest decoded buffer reported for the item so far.
    decoded_bytes: u64,
}

impl HandleUsage {
    fn total(&self) -> u64 {
        self.source_bytes + self.decoded_bytes
    }
}

struct CacheEntry {
    image: Arc<DynamicImage>,
    bytes: u64,
    last_access: u64,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    handles: HashMap<u64, HandleUsage>,
    cache: HashMap<CacheKey, CacheEntry>,
    /// monotonic access tick used for LRU ordering
    tick: u64,
}

impl State {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn cached_bytes(&self) -> u64 {
        self.cache.values().map(|e| e.bytes).sum()
    }

    fn handle_bytes(&self) -> u64 {
        self.handles.values().map(HandleUsage::total).sum()
    }

    fn tracked_bytes(&self) -> u64 {
        self.cached_bytes() + self.handle_bytes()
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        if count == 0 || self.cache.is_empty() {
            return 0;
        }
        let mut by_age: Vec<(u64, CacheKey)> = self
            .cache
            .iter()
            .map(|(k, e)| (e.last_access, k.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(access, _)| *access);
        let mut evicted = 0;
        for (_, key) in by_age.into_iter().take(count) {
            if self.cache.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

struct Inner {
    limits: Limits,
    state: Mutex<State>,
}

impl Inner {
    fn release_id(&self, id: u64) -> bool {
        self.state.lock().handles.remove(&id).is_some()
    }

    /// Insert into the cache. With `owner` set, the insert only happens while
    /// that handle is still registered, so work abandoned by a run that has
    /// already cleaned up cannot repopulate the cache.
    fn insert(&self, key: CacheKey, image: Arc<DynamicImage>, owner: Option<u64>) -> bool {
        let limits = self.limits;
        let pixels = image.width() as u64 * image.height() as u64;
        if limits.cache_capacity == 0 || pixels > limits.cache_max_pixels {
            return false;
        }
        let bytes = image.as_bytes().len() as u64;
        let mut state = self.state.lock();
        if owner.is_some_and(|id| !state.handles.contains_key(&id)) {
            return false;
        }
        if !state.cache.contains_key(&key) && state.cache.len() >= limits.cache_capacity {
            let evicted = state.evict_oldest(CACHE_EVICT_BATCH.min(limits.cache_capacity));
            debug!(evicted, "image cache full, evicted oldest entries");
        }
        let last_access = state.touch();
        state.cache.insert(
            key,
            CacheEntry {
                image,
                bytes,
                last_access,
            },
        );
        true
    }

    /// Usage is the larger of what the registry tracks and the process RSS.
    fn check_pressure(&self) -> usize {
        let resident = resident_memory_bytes();
        let mut state = self.state.lock();
        let tracked = state.tracked_bytes();
        let usage = resident.map_or(tracked, |rss| rss.max(tracked));
        let threshold = self.limits.budget as f64 * self.limits.pressure_ratio;
        if (usage as f64) <= threshold {
            return 0;
        }
        let target = state.cache.len() / 2;
        let evicted = state.evict_oldest(target);
        warn!(
            usage,
            tracked,
            resident = resident.unwrap_or(0),
            budget = self.limits.budget,
            evicted,
            "memory pressure, evicted half of the image cache"
        );
        evicted
    }
}

/// A live item handle, held from source read until the item is encoded.
/// Released exactly once: by `ResourceManager::release`, by drop, or by
/// `ResourceManager::cleanup`, whichever comes first.
pub struct ResourceHandle {
    id: u64,
    payload: SourceBytes,
    manager: Weak<Inner>,
}

impl ResourceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Account a decoded buffer held for this item. Keeps the largest value.
    pub fn record_decoded(&self, bytes: u64) {
        if let Some(inner) = self.manager.upgrade() {
            if let Some(usage) = inner.state.lock().handles.get_mut(&self.id) {
                usage.decoded_bytes = usage.decoded_bytes.max(bytes);
            }
        }
    }

    /// Cache a result produced under this handle. Refused once the handle was
    /// released or reclaimed by `cleanup`.
    pub fn cache_result(&self, key: CacheKey, image: Arc<DynamicImage>) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|inner| inner.insert(key, image, Some(self.id)))
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.release_id(self.id);
        }
    }
}

/// Snapshot of manager state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub outstanding_handles: usize,
    pub cached_entries: usize,
    pub cached_bytes: u64,
    /// Cache plus every live handle's source and decoded bytes.
    pub estimated_usage: u64,
    /// Process RSS where the platform reports it.
    pub resident_bytes: Option<u64>,
    pub budget: u64,
    /// Less than half of the cache capacity is in use.
    pub is_optimized: bool,
}

struct Watcher {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Owns every outstanding handle and the transformed-image cache.
pub struct ResourceManager {
    inner: Arc<Inner>,
    watcher: Mutex<Option<Watcher>>,
}

impl ResourceManager {
    pub fn new(config: &ProcessorConfig) -> Self {
        let budget = config
            .memory_budget
            .or_else(detect_memory_budget)
            .unwrap_or(FALLBACK_MEMORY_BUDGET);
        let limits = Limits {
            cache_capacity: config.cache_capacity,
            cache_max_pixels: config.cache_max_pixels,
            pressure_ratio: config.memory_pressure_ratio,
            budget,
            check_interval: config.memory_check_interval,
        };
        debug!(budget, cache_capacity = limits.cache_capacity, "resource manager created");
        Self {
            inner: Arc::new(Inner {
                limits,
                state: Mutex::new(State::default()),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Register a payload and get its handle. Never fails.
    pub fn acquire(&self, payload: SourceBytes) -> ResourceHandle {
        let mut state = self.inner.state.lock();
        state.next_handle += 1;
        let id = state.next_handle;
        state.handles.insert(
            id,
            HandleUsage {
                source_bytes: payload.len() as u64,
                decoded_bytes: 0,
            },
        );
        ResourceHandle {
            id,
            payload,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Release a handle. Consuming it makes a second release impossible.
    pub fn release(&self, handle: ResourceHandle) {
        drop(handle);
    }

    /// Cache an image. Returns `false` when it was not cached
    /// (over the pixel ceiling or caching disabled).
    pub fn cache(&self, key: CacheKey, image: Arc<DynamicImage>) -> bool {
        self.inner.insert(key, image, None)
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let mut state = self.inner.state.lock();
        let tick = state.touch();
        state.cache.get_mut(key).map(|entry| {
            entry.last_access = tick;
            Arc::clone(&entry.image)
        })
    }

    /// Evict half of the cache if usage crosses the pressure threshold.
    /// Returns the number of evicted entries.
    pub fn check_memory_pressure(&self) -> usize {
        self.inner.check_pressure()
    }

    /// Forget every outstanding handle and clear the cache.
    pub fn cleanup(&self) {
        let mut state = self.inner.state.lock();
        let handles = state.handles.len();
        let cached = state.cache.len();
        state.handles.clear();
        state.cache.clear();
        debug!(handles, cached, "resources cleaned up");
    }

    pub fn outstanding_handles(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    pub fn stats(&self) -> ResourceStats {
        let state = self.inner.state.lock();
        let cached_bytes = state.cached_bytes();
        ResourceStats {
            outstanding_handles: state.handles.len(),
            cached_entries: state.cache.len(),
            cached_bytes,
            estimated_usage: cached_bytes + state.handle_bytes(),
            resident_bytes: resident_memory_bytes(),
            budget: self.inner.limits.budget,
            is_optimized: state.cache.len() * 2 < self.inner.limits.cache_capacity,
        }
    }

    /// Start the periodic pressure check. Returns `false` when it was
    /// already running.
    pub fn start_watcher(&self) -> ResourceResult<bool> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(false);
        }
        let (stop, stop_rx) = mpsc::channel::<()>();
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.limits.check_interval;
        let thread = std::thread::Builder::new()
            .name("batchpress-memory-watch".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match inner.upgrade() {
                        Some(inner) => {
                            inner.check_pressure();
                        }
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| PressError::internal_panic(format!("failed to spawn memory watcher: {e}")))?;
        *watcher = Some(Watcher { stop, thread });
        info!(interval_ms = interval.as_millis() as u64, "memory watcher started");
        Ok(true)
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Stop the periodic check and wait for its thread.
    pub fn stop_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            let _ = watcher.stop.send(());
            if watcher.thread.join().is_err() {
                warn!("memory watcher thread panicked");
            }
            debug!("memory watcher stopped");
        }
    }

    /// Stop the watcher (if running) and release everything.
    pub fn shutdown(&self) {
        self.stop_watcher();
        self.cleanup();
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(&ProcessorConfig::default())
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Container limit or physical memory, minus a reserve for the OS and runtime.
pub fn detect_memory_budget() -> Option<u64> {
    let total = detect_cgroup_v2_memory()
        .or_else(detect_cgroup_v1_memory)
        .or_else(detect_system_memory)?;
    let reserved = compute_reserved_memory(total);
    Some(total.saturating_sub(reserved)).filter(|b| *b > 0)
}

/// 5% of total, clamped to [64MB, 512MB].
fn compute_reserved_memory(total_bytes: u64) -> u64 {
    (total_bytes / 20).clamp(MIN_RESERVED_MEMORY, MAX_RESERVED_MEMORY)
}

#[cfg(target_os = "linux")]
fn detect_cgroup_v2_memory() -> Option<u64> {
    let rel = std::fs::read_to_string("/proc/self/cgroup")
        .ok()
        .and_then(|c| parse_cgroup2_relative_path(&c))
        .unwrap_or_default();
    let path = join_cgroup_path("/sys/fs/cgroup", &rel, "memory.max");
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(target_os = "linux")]
fn detect_cgroup_v1_memory() -> Option<u64> {
    let content = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes").ok()?;
    let memory: u64 = content.trim().parse().ok()?;
    // near-u64::MAX values mean "unlimited"
    if memory > 1_000_000_000_000_000 {
        return None;
    }
    Some(memory)
}

#[cfg(not(target_os = "linux"))]
fn detect_cgroup_v2_memory() -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn detect_cgroup_v1_memory() -> Option<u64> {
    None
}

#[cfg(unix)]
fn detect_system_memory() -> Option<u64> {
    // Safety: sysconf only reads system configuration values.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

#[cfg(not(unix))]
fn detect_system_memory() -> Option<u64> {
    None
}

/// Resident set size of this process.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    // Safety: sysconf only reads system configuration values.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    parse_statm_resident(&statm, page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

/// `size resident shared ...` in pages -> resident bytes
fn parse_statm_resident(statm: &str, page_size: u64) -> Option<u64> {
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    pages.checked_mul(page_size)
}

/// `0::/docker/abcd` -> `/docker/abcd`
fn parse_cgroup2_relative_path(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.starts_with("0::"))
        .map(|line| line[3..].to_string())
}

fn join_cgroup_path(mount_point: &str, rel: &str, file: &str) -> String {
    let base = mount_point.trim_end_matches('/');
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        format!("{base}/{file}")
    } else {
        format!("{base}/{rel}/{file}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn manager(capacity: usize) -> ResourceManager {
        let config = ProcessorConfig {
            cache_capacity: capacity,
            // far above any RSS so only explicit pressure tests evict
            memory_budget: Some(1 << 50),
            ..ProcessorConfig::default()
        };
        ResourceManager::new(&config)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(
            Fingerprint {
                name: name.to_string(),
                byte_size: 1,
                last_modified_ms: 0,
            },
            "fit4096",
        )
    }

    fn image(w: u32, h: u32) -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::new(w, h)))
    }

    fn payload(len: usize) -> SourceBytes {
        SourceBytes::Memory(Arc::new(vec![0; len]))
    }

    #[test]
    fn test_acquire_release_exactly_once() {
        let rm = manager(4);
        let a = rm.acquire(payload(10));
        let b = rm.acquire(payload(10));
        assert_ne!(a.id(), b.id());
        assert_eq!(rm.outstanding_handles(), 2);
        rm.release(a);
        assert_eq!(rm.outstanding_handles(), 1);
        drop(b);
        assert_eq!(rm.outstanding_handles(), 0);
    }

    #[test]
    fn test_cleanup_then_drop_does_not_double_release() {
        let rm = manager(4);
        let handle = rm.acquire(payload(4));
        rm.cleanup();
        assert_eq!(rm.outstanding_handles(), 0);
        let next = rm.acquire(payload(4));
        drop(handle);
        // the live handle acquired after cleanup is untouched
        assert_eq!(rm.outstanding_handles(), 1);
        drop(next);
        assert_eq!(rm.outstanding_handles(), 0);
    }

    #[test]
    fn test_handle_outliving_manager_is_harmless() {
        let rm = manager(4);
        let handle = rm.acquire(payload(3));
        drop(rm);
        assert_eq!(handle.bytes().len(), 3);
    }

    #[test]
    fn test_cache_lookup_and_lru_eviction() {
        let rm = manager(3);
        assert!(rm.cache(key("a"), image(2, 2)));
        assert!(rm.cache(key("b"), image(2, 2)));
        assert!(rm.cache(key("c"), image(2, 2)));
        // touch a so b is the oldest
        assert!(rm.lookup(&key("a")).is_some());
        // full: evicts min(10, capacity) oldest, i.e. all three
        assert!(rm.cache(key("d"), image(2, 2)));
        assert!(rm.lookup(&key("d")).is_some());
        assert!(rm.lookup(&key("b")).is_none());
        assert!(rm.stats().cached_entries <= 3);
    }

    #[test]
    fn test_large_images_not_cached() {
        let config = ProcessorConfig {
            cache_max_pixels: 100,
            ..ProcessorConfig::default()
        };
        let rm = ResourceManager::new(&config);
        assert!(!rm.cache(key("big"), image(20, 20)));
        assert!(rm.lookup(&key("big")).is_none());
    }

    #[test]
    fn test_pressure_evicts_half_oldest_first() {
        let config = ProcessorConfig {
            memory_budget: Some(100),
            cache_max_pixels: 1_000_000,
            ..ProcessorConfig::default()
        };
        let rm = ResourceManager::new(&config);
        for name in ["a", "b", "c", "d"] {
            rm.cache(key(name), image(10, 10));
        }
        rm.lookup(&key("a"));
        assert_eq!(rm.check_memory_pressure(), 2);
        assert_eq!(rm.stats().cached_entries, 2);
        assert!(rm.lookup(&key("a")).is_some());
        assert!(rm.lookup(&key("b")).is_none());
    }

    #[test]
    fn test_no_eviction_below_threshold() {
        let rm = manager(10);
        rm.cache(key("a"), image(2, 2));
        assert_eq!(rm.check_memory_pressure(), 0);
        let stats = rm.stats();
        assert_eq!(stats.cached_entries, 1);
        assert_eq!(stats.cached_bytes, 12);
        assert!(stats.is_optimized);
    }

    #[test]
    fn test_watcher_start_and_shutdown() {
        let config = ProcessorConfig {
            memory_check_interval: Duration::from_millis(5),
            ..ProcessorConfig::default()
        };
        let rm = ResourceManager::new(&config);
        assert!(rm.start_watcher().unwrap());
        assert!(!rm.start_watcher().unwrap());
        assert!(rm.is_watching());
        let handle = rm.acquire(payload(1));
        std::thread::sleep(Duration::from_millis(20));
        rm.shutdown();
        assert!(!rm.is_watching());
        assert_eq!(rm.outstanding_handles(), 0);
        drop(handle);
    }

    #[test]
    fn test_variants_of_one_source_are_separate_entries() {
        let rm = manager(4);
        let source = key("a").source;
        rm.cache(CacheKey::new(source.clone(), "fit4096|resize50"), image(2, 2));
        assert!(rm.lookup(&CacheKey::new(source.clone(), "fit4096|resize50")).is_some());
        assert!(rm.lookup(&CacheKey::new(source, "fit4096|resize25")).is_none());
    }

    #[test]
    fn test_decoded_bytes_count_toward_usage() {
        let rm = manager(4);
        let handle = rm.acquire(payload(100));
        assert_eq!(rm.stats().estimated_usage, 100);
        handle.record_decoded(4_000);
        handle.record_decoded(1_000);
        assert_eq!(rm.stats().estimated_usage, 4_100);
        drop(handle);
        assert_eq!(rm.stats().estimated_usage, 0);
    }

    #[test]
    fn test_in_flight_decodes_trigger_pressure() {
        let config = ProcessorConfig {
            memory_budget: Some(10_000),
            ..ProcessorConfig::default()
        };
        let rm = ResourceManager::new(&config);
        rm.cache(key("a"), image(2, 2));
        rm.cache(key("b"), image(2, 2));
        let handle = rm.acquire(payload(10));
        // cached bytes alone are far below the budget
        handle.record_decoded(50_000);
        assert_eq!(rm.check_memory_pressure(), 1);
        drop(handle);
    }

    #[test]
    fn test_result_not_cached_after_cleanup() {
        let rm = manager(4);
        let handle = rm.acquire(payload(1));
        assert!(handle.cache_result(key("a"), image(2, 2)));
        rm.cleanup();
        // an abandoned worker finishing late
        assert!(!handle.cache_result(key("b"), image(2, 2)));
        assert_eq!(rm.stats().cached_entries, 0);
    }

    #[test]
    fn test_parse_statm_resident() {
        assert_eq!(parse_statm_resident("2000 512 100 1 0 300 0\n", 4096), Some(512 * 4096));
        assert_eq!(parse_statm_resident("2000", 4096), None);
        assert_eq!(parse_statm_resident("", 4096), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_reported_on_linux() {
        assert!(resident_memory_bytes().is_some_and(|rss| rss > 0));
        assert!(manager(1).stats().resident_bytes.is_some());
    }

    #[test]
    fn test_reserved_memory_bounds() {
        assert_eq!(compute_reserved_memory(0), MIN_RESERVED_MEMORY);
        assert_eq!(compute_reserved_memory(u64::MAX / 2), MAX_RESERVED_MEMORY);
        assert_eq!(compute_reserved_memory(4 * 1024 * 1024 * 1024), 4 * 1024 * 1024 * 1024 / 20);
    }

    #[test]
    fn test_cgroup_path_helpers() {
        assert_eq!(
            parse_cgroup2_relative_path("0::/docker/abc\n").as_deref(),
            Some("/docker/abc")
        );
        assert_eq!(parse_cgroup2_relative_path("5:memory:/x"), None);
        assert_eq!(join_cgroup_path("/sys/fs/cgroup", "/", "memory.max"), "/sys/fs/cgroup/memory.max");
        assert_eq!(
            join_cgroup_path("/sys/fs/cgroup/", "/a/b", "memory.max"),
            "/sys/fs/cgroup/a/b/memory.max"
        );
    }
}
