//! A unit of retryable work.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{Backoff, MaxAttempts, RetryPolicy};
use super::state::TaskState;
use crate::domain::TaskId;
use crate::error::{TaskError, panic_message};
use crate::ports::{Clock, SystemClock};

type TaskFn = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;
type AfterFn = Box<dyn FnOnce(&Task) + Send>;

/// A function plus its retry bookkeeping.
///
/// Configure with the builder methods, then hand it to a
/// [`Queue`](super::Queue) or call [`attempt`](Task::attempt) yourself. Once
/// the task has been locked (tasks created by `Queue::submit` are) the
/// builder methods panic.
///
/// The function receives a token that is cancelled when the queue context is
/// cancelled or the per-attempt deadline passes.
pub struct Task {
    id: TaskId,
    func: TaskFn,
    max_attempts: MaxAttempts,
    backoff: Backoff,
    within: Option<Duration>,
    metadata: HashMap<String, Value>,
    locked: bool,
    after: Mutex<Option<AfterFn>>,
    progress: Mutex<Progress>,
}

struct Progress {
    state: TaskState,
    attempts: u32,
    next_attempt: Option<DateTime<Utc>>,
    last_delay: Duration,
    error: Option<TaskError>,
}

impl Task {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let policy = RetryPolicy::default();
        Self {
            id: TaskId::generate(),
            func: Box::new(move |ctx| func(ctx).boxed()),
            max_attempts: policy.max_attempts(),
            backoff: Backoff {
                base: policy.base_delay(),
                max_timeout: policy.max_timeout(),
                jitter: policy.jitter,
            },
            within: policy.within(),
            metadata: HashMap::new(),
            locked: false,
            after: Mutex::new(None),
            progress: Mutex::new(Progress {
                state: TaskState::Scheduled,
                attempts: 0,
                next_attempt: None,
                last_delay: policy.base_delay(),
                error: None,
            }),
        }
    }

    /// Maximum number of attempts. `-1` retries until success or a
    /// `DoNotReattempt` error.
    ///
    /// # Panics
    /// If `n < -1` or the task is locked.
    pub fn retries(mut self, n: i32) -> Self {
        self.ensure_configurable("retries");
        self.max_attempts = MaxAttempts::from_count(n);
        self
    }

    /// Upper bound for the delay between attempts. Zero leaves the delay
    /// uncapped.
    pub fn max_timeout(mut self, limit: Duration) -> Self {
        self.ensure_configurable("max_timeout");
        self.backoff.max_timeout = limit;
        self
    }

    /// Upper limit for the duration of each attempt.
    pub fn within(mut self, limit: Duration) -> Self {
        self.ensure_configurable("within");
        self.within = Some(limit);
        self
    }

    /// Don't attempt the task before `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.ensure_configurable("not_before");
        self.progress_mut().next_attempt = Some(at);
        self
    }

    /// Use the plain exponential curve between attempts.
    pub fn no_jitter(mut self) -> Self {
        self.ensure_configurable("no_jitter");
        self.backoff.jitter = false;
        self
    }

    /// Run `callback` once, when the task succeeds or fails permanently.
    ///
    /// # Panics
    /// If a callback was already set or the task is locked.
    pub fn after<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.ensure_configurable("after");
        let slot = self.after.get_mut().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            panic!("after callback already set on task {}", self.id);
        }
        *slot = Some(Box::new(callback));
        self
    }

    /// Take every setting from `policy`.
    pub fn with_policy(mut self, policy: &RetryPolicy) -> Self {
        self.ensure_configurable("with_policy");
        self.max_attempts = policy.max_attempts();
        self.backoff = Backoff {
            base: policy.base_delay(),
            max_timeout: policy.max_timeout(),
            jitter: policy.jitter,
        };
        self.within = policy.within();
        self.progress_mut().last_delay = policy.base_delay();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Freeze the configuration.
    pub fn lock(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn state(&self) -> TaskState {
        self.progress().state
    }

    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn attempts(&self) -> u32 {
        self.progress().attempts
    }

    /// When the next attempt is due. `None` before the first attempt unless
    /// `not_before` was set.
    pub fn next_attempt(&self) -> Option<DateTime<Utc>> {
        self.progress().next_attempt
    }

    /// Whether an attempt may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let progress = self.progress();
        progress.state.is_runnable() && progress.next_attempt.is_none_or(|at| at <= now)
    }

    /// Final outcome.
    ///
    /// # Panics
    /// If the task is not done yet.
    pub fn result(&self) -> Result<(), TaskError> {
        let progress = self.progress();
        match progress.state {
            TaskState::Succeeded => Ok(()),
            TaskState::Dead => Err(progress
                .error
                .clone()
                .unwrap_or_else(|| TaskError::failed("task failed"))),
            _ => panic!("result() called on task {} before it finished", self.id),
        }
    }

    /// Run the function once, now.
    ///
    /// Returns the attempt's error; on a retryable failure the next attempt
    /// time is available from [`next_attempt`](Task::next_attempt).
    pub async fn attempt(&self, ctx: &CancellationToken) -> Result<(), TaskError> {
        self.attempt_with(ctx, &SystemClock).await
    }

    /// [`attempt`](Task::attempt) with the retry time computed from `clock`.
    pub async fn attempt_with(
        &self,
        ctx: &CancellationToken,
        clock: &dyn Clock,
    ) -> Result<(), TaskError> {
        let attempt = {
            let mut progress = self.progress();
            match progress.state {
                TaskState::Succeeded => return Err(TaskError::AlreadyComplete),
                TaskState::Dead => {
                    return Err(progress
                        .error
                        .clone()
                        .unwrap_or_else(|| TaskError::failed("task failed")));
                }
                TaskState::Running => {
                    return Err(TaskError::failed("an attempt is already in progress"));
                }
                TaskState::Scheduled => {}
            }
            if self.max_attempts.exhausted(progress.attempts) {
                let err = TaskError::MaxAttemptsExceeded {
                    attempts: progress.attempts,
                    last: progress
                        .error
                        .as_ref()
                        .map_or_else(|| "no attempts allowed".to_string(), ToString::to_string),
                };
                progress.state = TaskState::Dead;
                progress.error = Some(err.clone());
                progress.next_attempt = None;
                Err(err)
            } else {
                progress.state = TaskState::Running;
                progress.attempts += 1;
                Ok(progress.attempts)
            }
        };
        let attempt = match attempt {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(task = %self.id, error = %err, "task out of attempts");
                self.run_after();
                return Err(err);
            }
        };
        debug!(task = %self.id, attempt, "attempting task");

        let mut guard = InFlight {
            task: self,
            armed: true,
        };
        let result = self.run_once(ctx).await;
        guard.armed = false;
        let now = clock.now();

        let (result, finished) = {
            let mut progress = self.progress();
            match result {
                Ok(()) => {
                    progress.state = TaskState::Succeeded;
                    progress.error = None;
                    progress.next_attempt = None;
                    info!(task = %self.id, attempts = attempt, "task succeeded");
                    (Ok(()), true)
                }
                Err(err) if err.is_terminal() => {
                    warn!(task = %self.id, attempt, error = %err, "task failed permanently");
                    progress.state = TaskState::Dead;
                    progress.error = Some(err.clone());
                    progress.next_attempt = None;
                    (Err(err), true)
                }
                Err(err) if self.max_attempts.exhausted(attempt) => {
                    let err = TaskError::MaxAttemptsExceeded {
                        attempts: attempt,
                        last: err.to_string(),
                    };
                    warn!(task = %self.id, error = %err, "task out of attempts");
                    progress.state = TaskState::Dead;
                    progress.error = Some(err.clone());
                    progress.next_attempt = None;
                    (Err(err), true)
                }
                Err(err) => {
                    let delay = self.backoff.next_delay(attempt, progress.last_delay);
                    let next = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    warn!(
                        task = %self.id,
                        attempt,
                        error = %err,
                        retry_at = %next,
                        "task attempt failed; retrying"
                    );
                    progress.state = TaskState::Scheduled;
                    progress.last_delay = delay;
                    progress.next_attempt = Some(next);
                    progress.error = Some(err.clone());
                    (Err(err), false)
                }
            }
        };

        if finished {
            self.run_after();
        }
        result
    }

    async fn run_once(&self, ctx: &CancellationToken) -> Result<(), TaskError> {
        let token = ctx.child_token();
        // Calling `func` inside the future keeps a panic before the first
        // await inside `catch_unwind` as well.
        let guarded = AssertUnwindSafe(async { (self.func)(token.clone()).await }).catch_unwind();

        let outcome = match self.within {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    token.cancel();
                    return Err(TaskError::DeadlineExceeded(limit));
                }
            },
            None => guarded.await,
        };

        outcome.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))))
    }

    fn run_after(&self) {
        let callback = self
            .after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    fn ensure_configurable(&self, method: &str) {
        if self.locked {
            panic!("{method}() called on locked task {}", self.id);
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress_mut(&mut self) -> &mut Progress {
        self.progress.get_mut().unwrap_or_else(|e| e.into_inner())
    }
}

/// Puts an interrupted attempt back: when the future running it is dropped
/// before the function returns, the task is scheduled again and the attempt
/// does not count.
struct InFlight<'a> {
    task: &'a Task,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut progress = self.task.progress();
        if progress.state == TaskState::Running {
            progress.state = TaskState::Scheduled;
            progress.attempts = progress.attempts.saturating_sub(1);
            debug!(task = %self.task.id, "attempt interrupted; task rescheduled");
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &progress.state)
            .field("attempts", &progress.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("next_attempt", &progress.next_attempt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let task = Task::new(|_| async { Ok(()) });
        task.attempt(&CancellationToken::new()).await.unwrap();

        assert!(task.done());
        assert_eq!(task.attempts(), 1);
        assert_eq!(task.result(), Ok(()));
        assert_eq!(
            task.attempt(&CancellationToken::new()).await,
            Err(TaskError::AlreadyComplete)
        );
    }

    #[tokio::test]
    async fn no_jitter_backoff_follows_the_capped_curve() {
        let clock = ManualClock::new(start());
        let task = Task::new(|_| async { Err(TaskError::failed("boom")) })
            .retries(-1)
            .no_jitter()
            .max_timeout(Duration::from_secs(10 * 60));
        let ctx = CancellationToken::new();

        let mut delays = Vec::new();
        for _ in 0..6 {
            let err = task.attempt_with(&ctx, &clock).await.unwrap_err();
            assert_eq!(err, TaskError::failed("boom"));
            let next = task.next_attempt().unwrap();
            delays.push((next - clock.now()).num_minutes());
            clock.set(next);
        }

        assert_eq!(delays, vec![2, 4, 8, 10, 10, 10]);
        assert!(!task.done());
    }

    #[tokio::test]
    async fn exhausting_attempts_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::failed("still broken")) }
        })
        .retries(2);
        let ctx = CancellationToken::new();

        assert!(task.attempt(&ctx).await.is_err());
        assert!(!task.done());
        let err = task.attempt(&ctx).await.unwrap_err();
        assert_eq!(
            err,
            TaskError::MaxAttemptsExceeded {
                attempts: 2,
                last: "still broken".into()
            }
        );
        assert!(task.done());
        assert_eq!(task.result(), Err(err.clone()));

        // A dead task does not run again.
        assert_eq!(task.attempt(&ctx).await, Err(err));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn do_not_reattempt_ends_the_task() {
        let task = Task::new(|_| async { Err(TaskError::do_not_reattempt("bad input")) })
            .retries(-1);
        let err = task.attempt(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, TaskError::do_not_reattempt("bad input"));
        assert_eq!(task.state(), TaskState::Dead);
        assert_eq!(task.next_attempt(), None);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let task = Task::new(|_| async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        let err = task.attempt(&CancellationToken::new()).await.unwrap_err();

        match err {
            TaskError::MaxAttemptsExceeded { last, .. } => assert!(last.contains("kaboom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_cancels_the_attempt() {
        let task = Task::new(|ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Ok(())
        })
        .retries(3)
        .within(Duration::from_millis(50));

        let err = task.attempt(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, TaskError::DeadlineExceeded(Duration::from_millis(50)));
        assert_eq!(task.state(), TaskState::Scheduled);
    }

    #[tokio::test]
    async fn after_runs_once_on_completion() {
        let seen = Arc::new(AtomicU32::new(0));
        let hook = Arc::clone(&seen);
        let task = Task::new(|_| async { Err(TaskError::failed("nope")) })
            .retries(2)
            .after(move |task| {
                assert!(task.done());
                hook.fetch_add(task.attempts(), Ordering::SeqCst);
            });
        let ctx = CancellationToken::new();

        let _ = task.attempt(&ctx).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        let _ = task.attempt(&ctx).await;
        let _ = task.attempt(&ctx).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_never_runs_the_function() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .retries(0);

        let err = task.attempt(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            TaskError::MaxAttemptsExceeded {
                attempts: 0,
                last: "no attempts allowed".into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(task.attempts(), 0);
        assert_eq!(task.result(), Err(err));
    }

    #[tokio::test]
    async fn dropped_attempt_is_rescheduled() {
        let task = Task::new(|_| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let ctx = CancellationToken::new();

        let interrupted =
            tokio::time::timeout(Duration::from_millis(10), task.attempt(&ctx)).await;
        assert!(interrupted.is_err());

        assert_eq!(task.state(), TaskState::Scheduled);
        assert_eq!(task.attempts(), 0);
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn not_before_delays_the_first_attempt() {
        let at = start() + chrono::Duration::minutes(5);
        let task = Task::new(|_| async { Ok(()) }).not_before(at);

        assert!(!task.is_due(start()));
        assert!(task.is_due(at));
    }

    #[test]
    fn metadata_is_kept() {
        let task = Task::new(|_| async { Ok(()) }).with_metadata("flow", "orders");
        assert_eq!(task.metadata()["flow"], Value::from("orders"));
    }

    #[test]
    #[should_panic(expected = "locked task")]
    fn locked_task_rejects_configuration() {
        let _ = Task::new(|_| async { Ok(()) }).lock().retries(3);
    }

    #[test]
    #[should_panic(expected = "after callback already set")]
    fn after_cannot_be_set_twice() {
        let _ = Task::new(|_| async { Ok(()) }).after(|_| {}).after(|_| {});
    }

    #[test]
    #[should_panic(expected = "before it finished")]
    fn result_before_completion_panics() {
        let _ = Task::new(|_| async { Ok(()) }).result();
    }
}
