// src/engine/pool.rs
//
// Global worker pool for per-item transforms.
//
// One lazily built rayon pool is shared by every batch; a chunk's items are
// spawned onto it and report back over a channel. Thread count follows
// available_parallelism() (which respects cgroup CPU quotas) unless
// BATCHPRESS_WORKER_THREADS overrides it. Changes after first use have no
// effect.

use rayon::ThreadPool;
use std::sync::OnceLock;
use tracing::{debug, warn};

const WORKER_THREADS_ENV: &str = "BATCHPRESS_WORKER_THREADS";

/// Minimum number of worker threads
const MIN_WORKER_THREADS: usize = 1;

static GLOBAL_THREAD_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

fn configured_threads() -> usize {
    std::env::var(WORKER_THREADS_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_WORKER_THREADS)
        })
        .max(MIN_WORKER_THREADS)
}

fn build_pool(num_threads: usize) -> Option<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("batchpress-worker-{i}"))
        .build()
        .map_err(|e| warn!(num_threads, error = %e, "failed to build worker pool"))
        .ok()
}

/// The shared pool, or `None` if neither the preferred nor the minimal
/// configuration could be built.
pub fn get_pool() -> Option<&'static ThreadPool> {
    GLOBAL_THREAD_POOL
        .get_or_init(|| {
            let num_threads = configured_threads();
            let pool = build_pool(num_threads).or_else(|| build_pool(MIN_WORKER_THREADS));
            if pool.is_some() {
                debug!(num_threads, "worker pool ready");
            }
            pool
        })
        .as_ref()
}

/// Threads available to a chunk; rayon's global pool size when the shared
/// pool could not be built.
pub fn worker_count() -> usize {
    get_pool()
        .map(|pool| pool.current_num_threads())
        .unwrap_or_else(rayon::current_num_threads)
        .max(MIN_WORKER_THREADS)
}

/// Run `job` on the shared pool, falling back to rayon's global pool.
pub fn spawn<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    match get_pool() {
        Some(pool) => pool.spawn(job),
        None => rayon::spawn(job),
    }
}
