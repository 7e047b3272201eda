//! Trailing-edge debouncing of change notifications
//!
//! A [`Debouncer`] owns a worker task. [`Debouncer::trigger`] only records a
//! deadline and wakes the worker; the action always runs on its own spawned
//! task, never on the caller's path.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

/// Coalesces bursts of `trigger()` calls into single executions of an action.
///
/// - the action runs no earlier than the quiet period after the last trigger
/// - at most one execution is in flight
/// - triggers arriving during an execution fold into one follow-up execution
pub struct Debouncer {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

struct Shared {
    quiet: Duration,
    state: Mutex<State>,
    wake: Notify,
}

#[derive(Default)]
struct State {
    pending: bool,
    deadline: Option<Instant>,
}

enum Due {
    Idle,
    Wait(Instant),
    Run,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide what the worker does next; clears the pending flag when due
    fn poll_due(&self, now: Instant) -> Due {
        let mut state = self.state();
        match (state.pending, state.deadline) {
            (false, _) | (true, None) => Due::Idle,
            (true, Some(deadline)) if now < deadline => Due::Wait(deadline),
            (true, Some(_)) => {
                state.pending = false;
                state.deadline = None;
                Due::Run
            }
        }
    }
}

impl Debouncer {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new<F, Fut>(quiet: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            quiet,
            state: Mutex::new(State::default()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), action));
        Self { shared, worker }
    }

    /// Request an execution; restarts the quiet period
    pub fn trigger(&self) {
        {
            let mut state = self.shared.state();
            state.pending = true;
            state.deadline = Some(Instant::now() + self.shared.quiet);
        }
        self.shared.wake.notify_one();
    }

    pub fn quiet_period(&self) -> Duration {
        self.shared.quiet
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker<F, Fut>(shared: Arc<Shared>, action: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        shared.wake.notified().await;

        loop {
            match shared.poll_due(Instant::now()) {
                Due::Idle => break,
                Due::Wait(deadline) => sleep_until(deadline).await,
                Due::Run => {
                    debug!("Quiet period elapsed, running debounced action");
                    if let Err(e) = tokio::spawn(action()).await {
                        error!("Debounced action failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const QUIET: Duration = Duration::from_millis(100);

    fn recording_debouncer(runs: Arc<Mutex<Vec<Instant>>>, work: Duration) -> Debouncer {
        Debouncer::new(QUIET, move || {
            let runs = runs.clone();
            async move {
                runs.lock().unwrap().push(Instant::now());
                sleep(work).await;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_once_after_last_trigger() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = recording_debouncer(runs.clone(), Duration::ZERO);

        let mut last_trigger = Instant::now();
        for _ in 0..10 {
            last_trigger = Instant::now();
            debouncer.trigger();
            sleep(QUIET / 2).await;
        }
        sleep(QUIET * 3).await;

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0] >= last_trigger + QUIET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_trigger_no_run() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let _debouncer = recording_debouncer(runs.clone(), Duration::ZERO);

        sleep(QUIET * 5).await;
        assert!(runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_run_separately() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = recording_debouncer(runs.clone(), Duration::ZERO);

        debouncer.trigger();
        sleep(QUIET * 2).await;
        debouncer.trigger();
        debouncer.trigger();
        sleep(QUIET * 2).await;

        assert_eq!(runs.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_execution_coalesce_into_one_more_run() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let work = Duration::from_millis(500);
        let debouncer = recording_debouncer(runs.clone(), work);

        debouncer.trigger();
        // inside the first execution
        sleep(QUIET + Duration::from_millis(50)).await;
        assert_eq!(runs.lock().unwrap().len(), 1);
        for _ in 0..5 {
            debouncer.trigger();
        }

        sleep(work * 4).await;

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[1] >= runs[0] + work);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_single_execution_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let executions = Arc::new(AtomicUsize::new(0));

        let debouncer = {
            let (in_flight, max_in_flight, executions) =
                (in_flight.clone(), max_in_flight.clone(), executions.clone());
            Arc::new(Debouncer::new(QUIET, move || {
                let (in_flight, max_in_flight, executions) =
                    (in_flight.clone(), max_in_flight.clone(), executions.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    executions.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }))
        };

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let debouncer = debouncer.clone();
                tokio::spawn(async move { debouncer.trigger() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        sleep(QUIET * 5).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_worker() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = recording_debouncer(runs.clone(), Duration::ZERO);

        debouncer.trigger();
        drop(debouncer);
        sleep(QUIET * 3).await;

        assert!(runs.lock().unwrap().is_empty());
    }
}
