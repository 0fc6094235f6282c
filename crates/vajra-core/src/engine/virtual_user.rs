use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsCollector;
use crate::task::{TaskFactory, TaskResult};

/// How long a throttled virtual user sleeps before re-checking the flag.
const THROTTLE_BACKOFF: Duration = Duration::from_millis(10);

struct UserHandle {
    user_id: u32,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the ordered pool of virtual users for one test.
///
/// The control loop is the single writer: `set_target_count` and `shutdown`
/// take `&mut self`, so the user collection never needs a lock. Removal is
/// LIFO — the most-recently-added user goes first so long-lived users keep
/// their warmed connections.
pub struct VirtualUserManager {
    factory: Arc<dyn TaskFactory>,
    metrics: Arc<MetricsCollector>,
    throttled: Arc<AtomicBool>,
    root_cancel: CancellationToken,
    users: Vec<UserHandle>,
    next_user_id: u32,
    task_seq: Arc<AtomicU64>,
}

impl VirtualUserManager {
    pub fn new(factory: Arc<dyn TaskFactory>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            factory,
            metrics,
            throttled: Arc::new(AtomicBool::new(false)),
            root_cancel: CancellationToken::new(),
            users: Vec::new(),
            next_user_id: 0,
            task_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Grow or shrink the pool to exactly `target` live users.
    pub fn set_target_count(&mut self, target: u32) {
        while (self.users.len() as u32) < target {
            self.spawn_user();
        }
        while (self.users.len() as u32) > target {
            // LIFO: cancel the newest user. Its loop observes the token at
            // the next iteration boundary, so any in-flight task completes.
            if let Some(user) = self.users.pop() {
                user.cancel.cancel();
            }
        }
    }

    fn spawn_user(&mut self) {
        let user_id = self.next_user_id;
        self.next_user_id += 1;

        let cancel = self.root_cancel.child_token();
        let join = tokio::spawn(run_virtual_user(
            user_id,
            Arc::clone(&self.factory),
            Arc::clone(&self.metrics),
            cancel.clone(),
            Arc::clone(&self.throttled),
            Arc::clone(&self.task_seq),
        ));
        self.users.push(UserHandle {
            user_id,
            cancel,
            join,
        });
    }

    /// Number of users currently owned by the pool.
    pub fn live_count(&self) -> u32 {
        self.users.len() as u32
    }

    /// Ids of the live users in spawn order, for diagnostics.
    pub fn user_ids(&self) -> Vec<u32> {
        self.users.iter().map(|u| u.user_id).collect()
    }

    /// Flip the shared throttle flag; users pause while it is set.
    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::Relaxed);
    }

    /// Cancel every user and wait up to `budget` for their loops to exit.
    ///
    /// Returns `true` if every user drained inside the budget; stragglers
    /// beyond it are aborted and `false` is returned.
    pub async fn shutdown(&mut self, budget: Duration) -> bool {
        self.root_cancel.cancel();
        let deadline = Instant::now() + budget;
        let mut drained = true;

        let mut remaining = std::mem::take(&mut self.users);
        for user in &mut remaining {
            let left = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(left, &mut user.join).await {
                Ok(_) => {}
                Err(_) => {
                    drained = false;
                    break;
                }
            }
        }
        if !drained {
            for user in &remaining {
                user.join.abort();
            }
        }
        drained
    }
}

/// One virtual user: construct a task, execute it, record the outcome, loop.
///
/// The loop checks cancellation at its head and never lets a task error or
/// panic escape — a panicking invocation is recorded as a `panic`-kind
/// failure and the user keeps running.
async fn run_virtual_user(
    user_id: u32,
    factory: Arc<dyn TaskFactory>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
    throttled: Arc<AtomicBool>,
    task_seq: Arc<AtomicU64>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if throttled.load(Ordering::Relaxed) {
            tokio::select! {
                _ = tokio::time::sleep(THROTTLE_BACKOFF) => {}
                _ = cancel.cancelled() => return,
            }
            continue;
        }

        let task = factory.create_task();
        let task_id = task_seq.fetch_add(1, Ordering::Relaxed);

        metrics.add_active(1);
        let start = Instant::now();
        let outcome = AssertUnwindSafe(task.execute()).catch_unwind().await;
        let latency_nanos = start.elapsed().as_nanos() as u64;
        metrics.add_active(-1);

        let result = match outcome {
            Ok(Ok(output)) => TaskResult::success(task_id, latency_nanos, output.bytes_processed),
            Ok(Err(err)) => TaskResult::failure(task_id, latency_nanos, err.kind()),
            Err(_) => {
                tracing::error!(user_id, task_id, "task invocation panicked");
                TaskResult::failure(task_id, latency_nanos, "panic".to_string())
            }
        };
        metrics.record_result(&result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
