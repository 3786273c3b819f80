/// Periodic presence polling, independent of the duplex connection
use crate::backend::ChatBackend;
use crate::types::PresenceSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Latest snapshot plus how fresh it is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceReading {
    pub snapshot: PresenceSnapshot,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Consecutive failed or timed-out ticks since the last success
    pub missed_polls: u32,
    /// Poll period the reading was produced under
    pub period: Duration,
    received: Option<Instant>,
}

impl PresenceReading {
    fn fresh(snapshot: PresenceSnapshot, period: Duration) -> Self {
        Self {
            snapshot,
            fetched_at: Some(Utc::now()),
            missed_polls: 0,
            period,
            received: Some(Instant::now()),
        }
    }

    /// Stale after one missed poll interval, but still served until replaced.
    /// Half a period of slack absorbs fetch latency jitter.
    pub fn is_stale(&self) -> bool {
        let Some(received) = self.received else {
            return true;
        };
        self.missed_polls > 0 || received.elapsed() > self.period + self.period / 2
    }
}

pub struct PresencePoller {
    backend: Arc<dyn ChatBackend>,
}

impl PresencePoller {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Poll on a fixed period (first tick immediately) until the handle is stopped
    pub fn start(&self, period: Duration) -> PresenceHandle {
        let (tx, rx) = watch::channel(PresenceReading {
            period,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let backend = self.backend.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // A fetch outliving its period counts as a missed poll
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = timeout(period, backend.fetch_presence()) => result,
                };

                match result {
                    Ok(Ok(snapshot)) => {
                        debug!("Presence snapshot: {} users", snapshot.len());
                        tx.send_replace(PresenceReading::fresh(snapshot, period));
                    }
                    Ok(Err(e)) => {
                        // No backoff: the next fixed tick retries
                        warn!("Error fetching online status: {}", e);
                        tx.send_modify(|reading| reading.missed_polls += 1);
                    }
                    Err(_) => {
                        warn!("Online status fetch timed out after {:?}", period);
                        tx.send_modify(|reading| reading.missed_polls += 1);
                    }
                }
            }
            debug!("Presence poller stopped");
        });

        PresenceHandle { rx, cancel, task }
    }
}

/// Cancellable handle to a running poller; dropping it stops the poller
pub struct PresenceHandle {
    rx: watch::Receiver<PresenceReading>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn current(&self) -> PresenceReading {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceReading> {
        self.rx.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
