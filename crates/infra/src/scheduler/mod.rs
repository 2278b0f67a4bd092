//! Settlement scheduler.
//!
//! Each driver is a synchronous `run_once` that can be called from a test, a
//! cron binary, or the periodic worker spawned here. Drivers are restart-safe
//! by construction: everything they trigger is keyed, so a crashed run picks
//! up where it left off without double-moving money.

pub mod billing;
pub mod payout_sweep;
pub mod reconciliation;
pub mod statements;

pub use billing::BillingDriver;
pub use payout_sweep::PayoutSweepDriver;
pub use reconciliation::ReconciliationDriver;
pub use statements::StatementDriver;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// What one driver run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Items acted on this run.
    pub processed: u32,
    /// Items visited but intentionally left alone (not due, below minimum,
    /// already done under this key).
    pub skipped: u32,
    /// Items that errored; they will be revisited next run.
    pub failed: u32,
}

impl DriverReport {
    pub fn merge(&mut self, other: DriverReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Handle to a background worker thread. Dropping it requests shutdown and
/// joins the thread.
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `tick` every `interval` on a dedicated thread until shutdown.
///
/// The first tick runs after one full interval, not immediately; callers that
/// want an immediate pass invoke `run_once` themselves before spawning.
pub fn spawn_periodic<F>(name: &str, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let thread_name = name.to_string();

    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            tracing::info!(worker = %thread_name, ?interval, "scheduler worker started");
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                        tracing::info!(worker = %thread_name, "scheduler worker stopping");
                        break;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                }
            }
        })
        .expect("worker threads can always be spawned");

    WorkerHandle {
        shutdown: shutdown_tx,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn worker_ticks_and_stops_on_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        let handle = spawn_periodic("test-worker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(40));
        handle.shutdown();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn report_merge_adds_counts() {
        let mut a = DriverReport { processed: 1, skipped: 2, failed: 0 };
        a.merge(DriverReport { processed: 3, skipped: 0, failed: 1 });
        assert_eq!(a, DriverReport { processed: 4, skipped: 2, failed: 1 });
    }
}
