// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic background tasks
//!
//! Every long-running loop in the fleet (inventory reconciliation,
//! heartbeats, log rotation, ...) is a [`BackgroundTask`] registered with a
//! [`Driver`].  The driver runs each task on its period, supports explicit
//! wakeup through an [`Activator`], and terminates the task when the
//! process-wide shutdown channel fires.

use futures::future::BoxFuture;
use slog::Logger;
use slog::debug;
use slog::o;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// One iteration of a background activity.
///
/// The task's `activate` runs to completion before the next period is
/// considered; a slow activation delays subsequent ones rather than
/// stacking up.
pub trait BackgroundTask: Send + 'static {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()>;
}

/// Handle used to wake a registered task ahead of its next tick.
#[derive(Clone)]
pub struct Activator(Arc<Notify>);

impl Activator {
    pub fn new() -> Activator {
        Activator(Arc::new(Notify::new()))
    }

    pub fn activate(&self) {
        self.0.notify_one();
    }
}

impl Default for Activator {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the tokio tasks running registered background tasks.
///
/// Dropping the driver aborts any task that has not yet observed
/// shutdown.
pub struct Driver {
    shutdown: watch::Receiver<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Driver {
    pub fn new(shutdown: watch::Receiver<bool>) -> Driver {
        Driver { shutdown, tasks: Vec::new() }
    }

    /// Register `imp` to run once immediately and then every `period`,
    /// returning an [`Activator`] that triggers an extra run on demand.
    pub fn register(
        &mut self,
        name: &str,
        period: Duration,
        mut imp: Box<dyn BackgroundTask>,
        log: &Logger,
    ) -> Activator {
        let activator = Activator::new();
        let notify = Arc::clone(&activator.0);
        let log = log.new(o!("background_task" => name.to_string()));
        let mut shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        debug!(log, "activating"; "reason" => "timeout");
                    }
                    _ = notify.notified() => {
                        debug!(log, "activating"; "reason" => "signaled");
                        // fold the pending tick into this activation
                        interval.reset();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(log, "shutting down");
                            return;
                        }
                        continue;
                    }
                }
                if *shutdown.borrow() {
                    debug!(log, "shutting down");
                    return;
                }
                imp.activate(&log).await;
            }
        }));

        activator
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct Counter(Arc<AtomicUsize>);

    impl BackgroundTask for Counter {
        fn activate<'a>(&'a mut self, _: &'a Logger) -> BoxFuture<'a, ()> {
            async move {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[tokio::test]
    async fn runs_immediately_and_on_activation() {
        let count = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = watch::channel(false);
        let mut driver = Driver::new(rx);
        let activator = driver.register(
            "counter",
            Duration::from_secs(3600),
            Box::new(Counter(Arc::clone(&count))),
            &test_logger(),
        );

        // first tick fires immediately
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        activator.activate();
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl BackgroundTask for Recorder {
        fn activate<'a>(&'a mut self, _: &'a Logger) -> BoxFuture<'a, ()> {
            async move {
                self.0.lock().unwrap().push("ran");
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = watch::channel(false);
        let mut driver = Driver::new(rx);
        driver.register(
            "recorder",
            Duration::from_millis(10),
            Box::new(Recorder(Arc::clone(&runs))),
            &test_logger(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_shutdown = runs.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.lock().unwrap().len(), after_shutdown);
    }
}
