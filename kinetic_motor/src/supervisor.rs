//! # Task Supervisor
//!
//! One owner for the background loops of a component (heartbeat, monitor,
//! health check, autosave, cleanup).
//!
//! # Design
//!
//! - Every task receives a [`ShutdownSignal`]; [`TaskSupervisor::shutdown`]
//!   raises it and awaits each task, aborting any that outlive the grace period.
//! - Periodic tasks isolate errors: a failing tick is logged and retried
//!   after its retry delay; it never ends the loop.
//! - Cancellation is cooperative. A tick in flight is dropped at its next
//!   suspension point.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Grace period granted to tasks on shutdown before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Cancellation token handed to supervised tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested (or the supervisor is gone).
    pub async fn cancelled(&mut self) {
        // An Err means the sender was dropped, which also means shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` on cancel.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Timing of a periodic task.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    /// Pause after a successful tick.
    pub period: Duration,
    /// Pause after a failed tick.
    pub retry_delay: Duration,
}

impl Schedule {
    pub const fn every(period: Duration) -> Self {
        Self {
            period,
            retry_delay: period,
        }
    }

    pub const fn with_retry(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Owner of a group of background tasks.
pub struct TaskSupervisor {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSupervisor {
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// A signal tied to this supervisor.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown.subscribe(),
        }
    }

    /// Spawn a long-running task that watches its own [`ShutdownSignal`].
    pub fn spawn<F, Fut>(&mut self, task: &str, body: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = body(self.signal());
        debug!(supervisor = %self.name, task, "Spawning task");
        self.tasks.push((task.to_string(), tokio::spawn(future)));
    }

    /// Spawn a loop that runs `tick` immediately, then after every
    /// `schedule.period` (or `schedule.retry_delay` when the tick failed).
    pub fn spawn_periodic<F, Fut, E>(&mut self, task: &str, schedule: Schedule, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let supervisor = self.name.clone();
        let name = task.to_string();
        self.spawn(task, move |mut signal| async move {
            loop {
                let outcome = tokio::select! {
                    outcome = tick() => outcome,
                    _ = signal.cancelled() => break,
                };
                let pause = match outcome {
                    Ok(()) => schedule.period,
                    Err(e) => {
                        warn!(supervisor = %supervisor, task = %name, "Periodic task failed: {e}");
                        schedule.retry_delay
                    }
                };
                if !signal.sleep(pause).await {
                    break;
                }
            }
            debug!(supervisor = %supervisor, task = %name, "Task stopped");
        });
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Whether the named task is still running.
    pub fn is_running(&self, task: &str) -> bool {
        self.tasks
            .iter()
            .any(|(name, h)| name == task && !h.is_finished())
    }

    /// Signal every task and wait for it to finish.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for (task, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(supervisor = %self.name, task = %task, "Task panicked: {e}"),
                Err(_) => {
                    warn!(supervisor = %self.name, task = %task, "Task ignored shutdown, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn periodic_task_runs_until_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let mut supervisor = TaskSupervisor::new("test");
        let counter = Arc::clone(&ticks);
        supervisor.spawn_periodic(
            "counter",
            Schedule::every(Duration::from_millis(5)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(supervisor.is_running("counter"));
        supervisor.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn failing_tick_uses_retry_delay_and_keeps_running() {
        let ticks = Arc::new(AtomicU32::new(0));
        let mut supervisor = TaskSupervisor::new("test");
        let counter = Arc::clone(&ticks);
        supervisor.spawn_periodic(
            "flaky",
            Schedule::every(Duration::from_secs(60)).with_retry(Duration::from_millis(5)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn long_running_task_sees_cancellation() {
        let mut supervisor = TaskSupervisor::new("test");
        let (tx, rx) = tokio::sync::oneshot::channel();
        supervisor.spawn("waiter", move |mut signal| async move {
            signal.cancelled().await;
            let _ = tx.send(());
        });
        supervisor.shutdown().await;
        assert!(rx.await.is_ok());
    }
}
