//! In-process retry queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::retry::RetryPolicy;
use super::task::Task;
use crate::error::{QueueError, TaskError};
use crate::ports::{Clock, SystemClock};

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,

    /// Applied to tasks created with [`Queue::submit`].
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

struct QueueState {
    tasks: Vec<Arc<Task>>,
    /// Earliest pending retry, as of the last dispatch.
    next: Option<DateTime<Utc>>,
}

/// Holds tasks and keeps attempting them until each one is done.
///
/// One dispatch loop runs per queue, either in the caller's task via
/// [`run`](Queue::run) or spawned by [`start`](Queue::start). Attempts within a
/// dispatch pass run one after another.
///
/// # Shutdown
/// [`shutdown`](Queue::shutdown) stops intake and waits until every queued
/// task is done, including tasks waiting for a retry. Cancelling the context
/// passed to `run`/`start` stops the loop right away instead.
///
/// Intake closes when the loop observes the shutdown request, so an
/// `enqueue` racing with `shutdown` may still be accepted. The accept flag is
/// read and flipped under the state lock: a task that was accepted is always
/// seen by a later dispatch pass and drained like the rest.
pub struct Queue {
    name: String,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    accepting: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    wake: Notify,
    shutdown: CancellationToken,
    background: StdMutex<Option<JoinHandle<()>>>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(QueueConfig {
            name: name.into(),
            ..QueueConfig::default()
        })
    }

    pub fn from_config(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: config.name,
            retry: config.retry,
            clock,
            state: Mutex::new(QueueState {
                tasks: Vec::new(),
                next: None,
            }),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            background: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks not yet done.
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Add `task` and wake the dispatch loop.
    pub async fn enqueue(&self, task: Task) -> Result<Arc<Task>, QueueError> {
        let task = Arc::new(task);
        {
            let mut state = self.state.lock().await;
            if !self.is_accepting() {
                return Err(QueueError::ShuttingDown(self.name.clone()));
            }
            state.tasks.push(Arc::clone(&task));
        }
        debug!(queue = %self.name, task = %task.id(), "task enqueued");
        self.wake.notify_one();
        Ok(task)
    }

    /// Enqueue `func` as a locked task using the queue's retry policy.
    pub async fn submit<F, Fut>(&self, func: F) -> Result<Arc<Task>, QueueError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.enqueue(Task::new(func).with_policy(&self.retry).lock())
            .await
    }

    /// One pass: attempt every task that is due, then drop finished ones.
    ///
    /// Returns whether unfinished tasks remain.
    pub async fn dispatch(&self, ctx: &CancellationToken) -> bool {
        let snapshot = self.state.lock().await.tasks.clone();
        let now = self.clock.now();

        let mut next: Option<DateTime<Utc>> = None;
        for task in &snapshot {
            if ctx.is_cancelled() {
                break;
            }
            if task.is_due(now) {
                // Failures are logged by the task itself.
                let _ = task.attempt_with(ctx, self.clock.as_ref()).await;
            }
            if !task.done() {
                let at = task.next_attempt().unwrap_or(now);
                next = Some(next.map_or(at, |current| current.min(at)));
            }
        }

        let mut state = self.state.lock().await;
        state.tasks.retain(|task| !task.done());
        state.next = next;
        !state.tasks.is_empty()
    }

    /// Run the dispatch loop in the current task until the queue is drained
    /// after a shutdown request, or `ctx` is cancelled.
    ///
    /// # Panics
    /// If the queue was started with [`start`](Queue::start) or another loop
    /// is already running.
    pub async fn run(&self, ctx: CancellationToken) {
        if self.started.load(Ordering::SeqCst) {
            panic!("queue '{}' was started in the background; use shutdown()", self.name);
        }
        self.run_loop(ctx).await;
    }

    /// Spawn the dispatch loop.
    ///
    /// # Panics
    /// If the queue was already started.
    pub fn start(self: &Arc<Self>, ctx: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("queue '{}' already started", self.name);
        }
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move { queue.run_loop(ctx).await });
        *self.background.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop intake and wait for the background loop to drain the queue.
    ///
    /// # Panics
    /// If the queue was not started with [`start`](Queue::start).
    pub async fn shutdown(&self) {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            panic!("shutdown() on queue '{}' which was not started with start()", self.name);
        };

        info!(queue = %self.name, "shutdown requested");
        self.shutdown.cancel();
        if let Err(err) = handle.await
            && err.is_panic()
        {
            std::panic::resume_unwind(err.into_panic());
        }
        self.accepting.store(false, Ordering::SeqCst);
        info!(queue = %self.name, "queue stopped");
    }

    async fn run_loop(&self, ctx: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("queue '{}' is already running", self.name);
        }
        let _running = RunningGuard(&self.running);
        info!(queue = %self.name, "dispatch loop started");

        loop {
            let more = self.dispatch(&ctx).await;
            if !self.is_accepting() && !more {
                info!(queue = %self.name, "queue drained");
                return;
            }

            let delay = self.sleep_for().await;
            tokio::select! {
                _ = sleep_or_forever(delay) => {}
                _ = ctx.cancelled() => {
                    info!(queue = %self.name, "context cancelled; dispatch loop stopped");
                    return;
                }
                _ = self.wake.notified() => {}
                _ = self.shutdown.cancelled(), if self.is_accepting() => {
                    let _state = self.state.lock().await;
                    self.accepting.store(false, Ordering::SeqCst);
                    info!(queue = %self.name, "draining queue");
                }
            }
        }
    }

    async fn sleep_for(&self) -> Option<Duration> {
        let next = self.state.lock().await.next?;
        let wait = next - self.clock.now();
        Some(wait.to_std().unwrap_or(Duration::ZERO))
    }
}

/// Shut down every queue concurrently and wait for all of them.
pub async fn join(queues: &[Arc<Queue>]) {
    join_all(queues.iter().map(|queue| queue.shutdown())).await;
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use std::sync::atomic::AtomicU32;

    fn start_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn dispatch_drops_finished_tasks() {
        let queue = Queue::new("unit");
        let task = queue.submit(|_| async { Ok(()) }).await.unwrap();

        assert!(!queue.dispatch(&CancellationToken::new()).await);
        assert!(task.done());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn dispatch_waits_for_the_retry_time() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let queue = Queue::with_clock(QueueConfig::default(), clock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TaskError::failed("first try"))
                } else {
                    Ok(())
                }
            }
        })
        .retries(3)
        .no_jitter();
        let task = queue.enqueue(task).await.unwrap();
        let ctx = CancellationToken::new();

        assert!(queue.dispatch(&ctx).await);
        let retry_at = task.next_attempt().unwrap();
        assert_eq!(retry_at, start_time() + chrono::Duration::minutes(2));

        // Not due yet.
        assert!(queue.dispatch(&ctx).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.set(retry_at);
        assert!(!queue.dispatch(&ctx).await);
        assert_eq!(task.result(), Ok(()));
        assert_eq!(task.attempts(), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_every_task() {
        let queue = Arc::new(Queue::new("drain"));
        queue.start(CancellationToken::new());
        let done = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let done = Arc::clone(&done);
            let task = queue
                .submit(move |_| {
                    let done = Arc::clone(&done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
            tasks.push(task);
        }

        queue.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(tasks.iter().all(|task| task.result().is_ok()));
        assert!(queue.is_empty().await);
        let err = queue.submit(|_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, QueueError::ShuttingDown("drain".into()));
    }

    #[tokio::test]
    async fn shutdown_waits_for_pending_retries() {
        let config = QueueConfig {
            name: "retrying".into(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                jitter: false,
                ..RetryPolicy::default()
            },
        };
        let queue = Arc::new(Queue::from_config(config));
        queue.start(CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = queue
            .submit(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TaskError::failed("flaky"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        queue.shutdown().await;

        assert_eq!(task.result(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn join_shuts_down_every_queue() {
        let queues: Vec<Arc<Queue>> = ["one", "two"]
            .into_iter()
            .map(|name| Arc::new(Queue::new(name)))
            .collect();
        let mut tasks = Vec::new();
        for queue in &queues {
            queue.start(CancellationToken::new());
            tasks.push(queue.submit(|_| async { Ok(()) }).await.unwrap());
        }

        join(&queues).await;

        assert!(tasks.iter().all(|task| task.done()));
        assert!(queues.iter().all(|queue| !queue.is_accepting()));
    }

    #[tokio::test]
    async fn cancelling_the_context_stops_run() {
        let queue = Queue::new("cancel");
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        queue.run(ctx).await;
        assert!(queue.is_accepting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tasks_accepted_during_shutdown_are_drained() {
        let queue = Arc::new(Queue::new("racing"));
        queue.start(CancellationToken::new());

        let mut producers = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                let mut accepted = Vec::new();
                loop {
                    match queue.submit(|_| async { Ok(()) }).await {
                        Ok(task) => accepted.push(task),
                        Err(QueueError::ShuttingDown(_)) => return accepted,
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        queue.shutdown().await;

        let mut accepted = Vec::new();
        for producer in producers {
            accepted.extend(producer.await.unwrap());
        }
        assert!(!accepted.is_empty());
        assert!(accepted.iter().all(|task| task.result().is_ok()));
    }

    #[tokio::test]
    #[should_panic(expected = "already running")]
    async fn second_concurrent_run_panics() {
        let queue = Arc::new(Queue::new("twice"));
        let first = Arc::clone(&queue);
        tokio::spawn(async move { first.run(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.run(CancellationToken::new()).await;
    }

    #[tokio::test]
    #[should_panic(expected = "not started with start()")]
    async fn shutdown_requires_start() {
        Queue::new("unit").shutdown().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already started")]
    async fn start_twice_panics() {
        let queue = Arc::new(Queue::new("unit"));
        queue.start(CancellationToken::new());
        queue.start(CancellationToken::new());
    }

    #[test]
    fn config_from_json() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"name": "emails", "retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.name, "emails");
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.retry.jitter);
    }
}
