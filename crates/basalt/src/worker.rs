//! Background view maintenance on a tokio runtime.
//!
//! The worker wakes on a fixed interval, drains the asynchronous view
//! update queue, and runs one step of every unfinished view build.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::database::Basalt;

/// Handle to a running background worker.
#[derive(Debug)]
pub struct ViewWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ViewWorker {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(db: Basalt, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(&db),
                    _ = stop.changed() => break,
                }
            }
            debug!("view worker stopped");
        });
        Self { shutdown, handle }
    }

    /// Stops the worker after its current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "view worker ended abnormally");
        }
    }
}

fn tick(db: &Basalt) {
    match db.process_queue() {
        Ok(0) => {}
        Ok(applied) => debug!(applied, "view worker applied queued updates"),
        Err(e) => warn!(error = %e, "view worker could not drain the update queue"),
    }
    match db.step_builds() {
        Ok(report) if report.stepped > 0 => {
            debug!(stepped = report.stepped, finished = report.finished, "view worker stepped builds");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "view worker could not step builds"),
    }
}
