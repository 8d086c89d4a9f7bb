//! Cancellable periodic refresh task shared by the caches.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Owns a running poll loop. Dropping the handle aborts the loop; [`stop`]
/// shuts it down and waits for the in-flight tick to finish.
///
/// [`stop`]: PollHandle::stop
pub struct PollHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Runs `tick` every `period`. Each tick is awaited to completion before the
/// next one is scheduled, so slow refreshes never pile up.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> PollHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; callers already hold a fresh snapshot.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = interval.tick() => {
                    debug!("{} poll tick", name);
                    tick().await;
                }
            }
        }
        debug!("{} poller exited", name);
    });

    info!("⏱ {} polling every {:?}", name, period);
    PollHandle {
        name,
        shutdown,
        task: Some(task),
    }
}

impl PollHandle {
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("⏹ {} polling stopped", self.name);
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
