//! The daemon-wide service context.
//!
//! Everything a compile task needs arrives through this one object: caches,
//! the worker pool, the RPC channel, credentials, the subprocess runner,
//! and the link-admission queue. No process-wide mutable singletons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use eyre::Result;
use lx_auth::{RefreshOptions, TokenRefresher};
use lx_deps::DepsCache;
use lx_http::{HttpRpc, NoAuth, TokenProvider};
use lx_outcache::OutputCache;
use lx_resolve::{DirectiveCache, IncludeMemoCache};
use lx_runtime::WorkerPool;
use lx_subproc::{SubprocOptions, SubprocRunner};
use tracing::info;

use crate::config::Config;
use crate::task::TaskSnapshot;

/// Finished-task snapshots kept for the status page.
const FINISHED_SNAPSHOT_KEEP: usize = 128;

pub struct Service {
    pub config: Config,
    pub pool: Arc<WorkerPool>,
    pub deps_cache: DepsCache,
    pub directive_cache: DirectiveCache,
    pub memo_cache: IncludeMemoCache,
    pub output_cache: OutputCache,
    pub subprocs: Arc<SubprocRunner>,
    pub rpc: HttpRpc,
    pub auth: Option<Arc<TokenRefresher>>,
    /// One "link-sized" upload at a time, process-wide; tokio semaphores
    /// admit waiters FIFO
    pub link_admission: Arc<tokio::sync::Semaphore>,

    next_task_id: AtomicU64,
    snapshots: Mutex<Snapshots>,
    quit: tokio::sync::Notify,
}

#[derive(Default)]
struct Snapshots {
    active: HashMap<u64, TaskSnapshot>,
    finished: Vec<TaskSnapshot>,
}

impl Service {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let pool = WorkerPool::new("lx-worker", config.worker_threads);

        // the refresher parks its retry backoff on the pool so shutdown can
        // cancel an outstanding refresh
        let auth = config
            .credentials
            .clone()
            .map(|source| TokenRefresher::new(source, RefreshOptions::default(), pool.clone()));

        let provider: Arc<dyn TokenProvider> = match &auth {
            Some(refresher) => refresher.clone(),
            None => Arc::new(NoAuth),
        };

        let output_cache = OutputCache::open(
            config.output_cache_dir.clone(),
            config.output_cache_max_bytes,
        )
        .await?;

        let subprocs = SubprocRunner::new(SubprocOptions {
            max_total: config.max_subprocs,
            max_heavy: config.max_heavy_subprocs,
        });

        info!(
            endpoint = %config.server_endpoint,
            workers = config.worker_threads,
            "service context ready"
        );

        Ok(Arc::new(Self {
            rpc: HttpRpc::new(config.http_options(), provider),
            deps_cache: DepsCache::new(config.deps_cache_max_entries),
            directive_cache: DirectiveCache::new(8192),
            memo_cache: IncludeMemoCache::new(),
            output_cache,
            pool,
            subprocs,
            auth,
            link_admission: Arc::new(tokio::sync::Semaphore::new(1)),
            next_task_id: AtomicU64::new(1),
            snapshots: Mutex::new(Snapshots::default()),
            quit: tokio::sync::Notify::new(),
            config,
        }))
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Trace id for one task: the serial number plus a random tag so logs
    /// from daemon restarts never collide.
    pub fn make_trace_id(&self, task_id: u64) -> String {
        format!("{task_id:x}-{:08x}", rand::random::<u32>())
    }

    /// Called by tasks on their owner thread at every state transition.
    pub fn update_snapshot(&self, snapshot: TaskSnapshot) {
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshot.terminal {
            snapshots.active.remove(&snapshot.id);
            snapshots.finished.push(snapshot);
            if snapshots.finished.len() > FINISHED_SNAPSHOT_KEEP {
                snapshots.finished.remove(0);
            }
        } else {
            snapshots.active.insert(snapshot.id, snapshot);
        }
    }

    /// Serialize the current task set for `/status`.
    pub fn status_json(&self) -> String {
        let snapshots = self.snapshots.lock().unwrap();
        let mut all: Vec<&TaskSnapshot> = snapshots.active.values().collect();
        all.sort_by_key(|s| s.id);
        all.extend(snapshots.finished.iter());
        let list: Vec<TaskSnapshot> = all.into_iter().cloned().collect();
        facet_json::to_string(&list)
    }

    pub fn shutdown(&self) {
        if let Some(auth) = &self.auth {
            auth.shutdown();
        }
    }

    /// Ask the daemon to exit (the `/quitquitquit` endpoint).
    pub fn request_quit(&self) {
        self.quit.notify_waiters();
    }

    pub async fn quit_requested(&self) {
        self.quit.notified().await;
    }
}
