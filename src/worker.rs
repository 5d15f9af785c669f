//! Named worker threads.
//!
//! Every long-running loop in the engine (line follower, rule cycle, fan-out,
//! aggregation, refresh, sweep) runs on its own named thread. A panic inside a
//! worker is contained and logged; it ends that worker only.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick};

use crate::error::{ExecutionError, LogmonError, LogmonResult};
use crate::shutdown::Shutdown;

/// Spawns `body` on a thread called `name`.
///
/// Control characters in `name` are replaced; names carry user-supplied paths
/// and patterns, and a NUL byte would make the spawn panic.
pub(crate) fn spawn_worker<F>(name: String, body: F) -> LogmonResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let name = thread_name(&name);
    let worker_name = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                tracing::error!(worker = %worker_name, "worker panicked; terminating it");
            }
        })
        .map_err(|e| {
            LogmonError::from(ExecutionError::Spawn {
                name,
                message: e.to_string(),
            })
        })
}

fn thread_name(name: &str) -> String {
    name.chars().map(|c| if c.is_control() { '?' } else { c }).collect()
}

/// Runs one iteration of a periodic job, containing a panic so the next tick
/// still fires.
fn run_contained<F: FnMut()>(name: &str, job: &mut F) {
    if panic::catch_unwind(AssertUnwindSafe(&mut *job)).is_err() {
        tracing::error!(worker = %name, "periodic job panicked; retrying on next tick");
    }
}

/// Joins a stored handle unless the caller is the worker itself.
pub(crate) fn join_worker(slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

/// A closure run on a fixed interval until stopped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    shutdown: Shutdown,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Starts running `job` every `interval`. The first run happens after one
    /// full interval. A panicking run is logged and the task keeps ticking.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut job: F) -> LogmonResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let shutdown = Shutdown::new();
        let worker_shutdown = shutdown.clone();
        let ticker = tick(interval);
        let job_name = name.clone();
        let handle = spawn_worker(name.clone(), move || loop {
            select! {
                recv(worker_shutdown.signal()) -> _ => break,
                recv(ticker) -> _ => {
                    if worker_shutdown.is_triggered() {
                        break;
                    }
                    run_contained(&job_name, &mut job);
                }
            }
        })?;

        Ok(Self {
            name,
            shutdown,
            join: Mutex::new(Some(handle)),
        })
    }

    /// The worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the task and waits for an in-flight run to finish. Idempotent.
    pub fn stop(&self) {
        self.shutdown.trigger();
        join_worker(&self.join);
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_periodic_task_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::spawn("logmon-test-periodic", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(120));
        task.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "expected several runs, got {after_stop}");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);

        // Stopping twice is a no-op.
        task.stop();
    }

    #[test]
    fn test_worker_panic_is_contained() {
        let handle = spawn_worker("logmon-test-panic".to_string(), || {
            panic!("boom");
        })
        .unwrap();
        // The panic is caught inside the worker, so join succeeds.
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_periodic_task_survives_panicking_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::spawn("logmon-test-flaky", Duration::from_millis(10), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run fails");
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(150));
        task.stop();
        let runs = runs.load(Ordering::SeqCst);
        assert!(runs >= 3, "task stopped ticking after a panic: {runs} runs");
    }

    #[test]
    fn test_control_characters_in_name_do_not_fail_spawn() {
        let handle = spawn_worker("logmon-rule-ab\0c\n".to_string(), || {}).unwrap();
        assert_eq!(handle.thread().name(), Some("logmon-rule-ab?c?"));
        assert!(handle.join().is_ok());
    }
}
