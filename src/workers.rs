//! Background worker threads driven from the main loop.
//!
//! Workers never block the main thread. `update(max_batch)` nudges a worker
//! awake and reports how much work is pending, `pause()` parks it so it
//! cannot race render state, and `shutdown()` joins it with a bounded
//! wait-and-warn loop. The main thread only ever touches workers through
//! this contract.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::lock_or_recover;

/// Unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct WorkerInner {
    queue: VecDeque<Job>,
    paused: bool,
    shutdown: bool,
    in_flight: usize,
    completed: u64,
}

struct WorkerShared {
    inner: Mutex<WorkerInner>,
    work_cv: Condvar,
}

/// A named worker thread with a job queue and a pause flag.
///
/// Workers start paused; the main loop's service window unpauses them for
/// its bounded budget and re-pauses them before rendering when the client
/// runs single-threaded.
pub struct QueueWorker {
    name: String,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl QueueWorker {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            inner: Mutex::new(WorkerInner {
                queue: VecDeque::new(),
                paused: true,
                shutdown: false,
                in_flight: 0,
                completed: 0,
            }),
            work_cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(thread_shared))?;
        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, job: Job) {
        {
            let mut inner = lock_or_recover(&self.shared.inner, "workers::enqueue");
            inner.queue.push_back(job);
        }
        self.shared.work_cv.notify_all();
    }

    /// Unpause the worker and report pending work (queued plus in flight).
    /// Never blocks; the batch hint only bounds this service window's claim
    /// on the queue, the thread itself drains continuously while unpaused.
    pub fn update(&self, _max_batch: usize) -> usize {
        let pending = {
            let mut inner = lock_or_recover(&self.shared.inner, "workers::update");
            inner.paused = false;
            inner.queue.len() + inner.in_flight
        };
        self.shared.work_cv.notify_all();
        pending
    }

    /// Park the worker after it finishes its current job.
    pub fn pause(&self) {
        let mut inner = lock_or_recover(&self.shared.inner, "workers::pause");
        inner.paused = true;
    }

    pub fn pending(&self) -> usize {
        let inner = lock_or_recover(&self.shared.inner, "workers::pending");
        inner.queue.len() + inner.in_flight
    }

    pub fn completed(&self) -> u64 {
        let inner = lock_or_recover(&self.shared.inner, "workers::completed");
        inner.completed
    }

    /// Stop the thread, waiting up to `grace` before warning and blocking on
    /// the final join. Queued-but-unstarted jobs are dropped.
    pub fn shutdown(&mut self, grace: Duration) {
        {
            let mut inner = lock_or_recover(&self.shared.inner, "workers::shutdown");
            inner.shutdown = true;
            inner.paused = false;
        }
        self.shared.work_cv.notify_all();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if !handle.is_finished() {
            tracing::warn!(worker = %self.name, "worker still busy past shutdown grace; waiting");
        }
        let _ = handle.join();
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown(Duration::from_secs(1));
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    loop {
        let job = {
            let mut inner = lock_or_recover(&shared.inner, "workers::worker_loop");
            loop {
                if inner.shutdown {
                    return;
                }
                if !inner.paused {
                    if let Some(job) = inner.queue.pop_front() {
                        inner.in_flight += 1;
                        break job;
                    }
                }
                inner = match shared
                    .work_cv
                    .wait_timeout(inner, Duration::from_millis(100))
                {
                    Ok((guard, _timed_out)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        };
        job();
        let mut inner = lock_or_recover(&shared.inner, "workers::worker_loop");
        inner.in_flight -= 1;
        inner.completed += 1;
    }
}

/// The worker trio plus the generic IO threads, created and destroyed by the
/// lifecycle in dependency order.
pub struct WorkerSet {
    pub texture_cache: Option<QueueWorker>,
    pub image_decode: Option<QueueWorker>,
    pub texture_fetch: Option<QueueWorker>,
    pub vfs: QueueWorker,
    pub lfs: QueueWorker,
}

impl WorkerSet {
    pub fn start(config: &AppConfig) -> io::Result<Self> {
        let texture_cache = if config.texture_cache {
            Some(QueueWorker::spawn("texture-cache")?)
        } else {
            None
        };
        let image_decode = if config.image_decode {
            Some(QueueWorker::spawn("image-decode")?)
        } else {
            None
        };
        let texture_fetch = if config.texture_fetch {
            Some(QueueWorker::spawn("texture-fetch")?)
        } else {
            None
        };
        Ok(Self {
            texture_cache,
            image_decode,
            texture_fetch,
            vfs: QueueWorker::spawn("vfs-io")?,
            lfs: QueueWorker::spawn("lfs-io")?,
        })
    }

    /// One pass of the main loop's service window. Returns
    /// `(work_pending, io_pending)` so the caller can budget further passes.
    pub fn update_all(&self, max_batch: usize) -> (usize, usize) {
        let mut work_pending = 0;
        if let Some(worker) = &self.texture_cache {
            work_pending += worker.update(max_batch);
        }
        if let Some(worker) = &self.image_decode {
            work_pending += worker.update(max_batch);
        }
        if let Some(worker) = &self.texture_fetch {
            work_pending += worker.update(max_batch);
        }
        let io_pending = self.vfs.update(max_batch) + self.lfs.update(max_batch);
        (work_pending, io_pending)
    }

    /// Park the decode-side workers before rendering. The fetch worker is IO
    /// bound and keeps running.
    pub fn pause_render_sensitive(&self) {
        if let Some(worker) = &self.texture_cache {
            worker.pause();
        }
        if let Some(worker) = &self.image_decode {
            worker.pause();
        }
    }

    /// Tear down every worker. IO threads go last; the cache workers may
    /// still flush through them while draining.
    pub fn shutdown_all(&mut self, grace: Duration) {
        if let Some(worker) = &mut self.texture_cache {
            worker.shutdown(grace);
        }
        if let Some(worker) = &mut self.image_decode {
            worker.shutdown(grace);
        }
        if let Some(worker) = &mut self.texture_fetch {
            worker.shutdown(grace);
        }
        self.vfs.shutdown(grace);
        self.lfs.shutdown(grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn paused_worker_holds_jobs_until_updated() {
        let mut worker = QueueWorker::spawn("test-paused").expect("spawn worker");
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        worker.enqueue(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));

        // Workers start paused; the job must not run yet.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(worker.pending(), 1);

        let pending = worker.update(1);
        assert_eq!(pending, 1);
        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn shutdown_joins_the_thread() {
        let mut worker = QueueWorker::spawn("test-shutdown").expect("spawn worker");
        worker.update(1);
        worker.shutdown(Duration::from_secs(1));
        // A second shutdown is a no-op, not a panic.
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn completed_counter_tracks_drained_jobs() {
        let mut worker = QueueWorker::spawn("test-drain").expect("spawn worker");
        for _ in 0..5 {
            worker.enqueue(Box::new(|| {}));
        }
        worker.update(1);
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.completed(), 5);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn worker_set_respects_disabled_workers() {
        use clap::Parser;
        let config = AppConfig::parse_from([
            "gridview",
            "--texture-cache",
            "false",
            "--image-decode",
            "false",
        ]);
        let mut set = WorkerSet::start(&config).expect("start worker set");
        assert!(set.texture_cache.is_none());
        assert!(set.image_decode.is_none());
        assert!(set.texture_fetch.is_some());
        let (work_pending, io_pending) = set.update_all(1);
        assert_eq!(work_pending, 0);
        assert_eq!(io_pending, 0);
        set.shutdown_all(Duration::from_secs(1));
    }
}
