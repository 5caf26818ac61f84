//! Fixed-size pool of pipeline build threads.
//!
//! Each thread owns an [`IrPools`], so concurrent translations never share arena storage.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nova_shader::IrPools;
use tracing::debug;

use crate::error::Result;
use crate::sync::{lock, wait_timeout};

/// Poll interval of [`ShaderWorkers::wait_for_requests`] for its stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State owned by one worker thread and lent to every job it runs.
#[derive(Debug, Default)]
pub struct WorkerContext {
    pub pools: IrPools,
}

type Job = Box<dyn FnOnce(&mut WorkerContext) + Send + 'static>;

/// `max(available_parallelism, 2) - 1`: leaves one core to the caller, but always at least one
/// worker.
pub fn default_worker_count() -> usize {
    let available = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    available.max(2) - 1
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *lock(&self.count) += 1;
    }

    fn finish(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Marks a job finished even if it panics.
struct FinishOnDrop<'a>(&'a Pending);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct ShaderWorkers {
    queue: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl ShaderWorkers {
    pub fn new(count: usize, name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());
        let mut threads = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let receiver = Arc::clone(&receiver);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{name}:{index}"))
                .spawn(move || run_worker(&receiver, &pending))?;
            threads.push(handle);
        }
        debug!(workers = threads.len(), name, "started shader workers");
        Ok(Self {
            queue: Some(sender),
            threads,
            pending,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.threads.len()
    }

    pub fn queue_work(&self, job: impl FnOnce(&mut WorkerContext) + Send + 'static) {
        self.pending.add();
        let Some(queue) = &self.queue else {
            self.pending.finish();
            return;
        };
        if let Err(mpsc::SendError(job)) = queue.send(Box::new(job)) {
            // Every worker has exited; run the job here rather than lose it.
            let _finish = FinishOnDrop(&self.pending);
            job(&mut WorkerContext::default());
        }
    }

    /// Blocks until every queued job has finished or `stop` is raised.
    pub fn wait_for_requests(&self, stop: &AtomicBool) {
        let mut count = lock(&self.pending.count);
        while *count != 0 && !stop.load(Ordering::Relaxed) {
            count = wait_timeout(&self.pending.idle, count, STOP_POLL_INTERVAL);
        }
    }
}

impl Drop for ShaderWorkers {
    fn drop(&mut self) {
        // Closing the channel lets each thread drain the queue and exit.
        self.queue.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker(receiver: &Mutex<Receiver<Job>>, pending: &Pending) {
    let mut context = WorkerContext::default();
    loop {
        let job = lock(receiver).recv();
        let Ok(job) = job else {
            break;
        };
        let _finish = FinishOnDrop(pending);
        job(&mut context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pool_leaves_one_core_free() {
        let count = default_worker_count();
        assert!(count >= 1);
        let available = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        assert_eq!(count, available.max(2) - 1);
    }

    #[test]
    fn waits_for_every_queued_job() {
        let workers = ShaderWorkers::new(3, "test").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            workers.queue_work(move |_| {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        workers.wait_for_requests(&AtomicBool::new(false));
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn raised_stop_returns_immediately() {
        let workers = ShaderWorkers::new(1, "test").unwrap();
        let (release, blocked) = mpsc::channel::<()>();
        workers.queue_work(move |_| {
            let _ = blocked.recv();
        });
        workers.wait_for_requests(&AtomicBool::new(true));
        release.send(()).unwrap();
        workers.wait_for_requests(&AtomicBool::new(false));
    }
}
