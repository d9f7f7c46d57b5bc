use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use stream_cancel::{Trigger, Valved};
use tokio::time::sleep;

use crate::adapter::BleAdapter;
use crate::config::DEFAULT_MAX_SCAN_DURATION;
use crate::store::AdvertisementStore;
use crate::{Error, Result};

/// Lifecycle of the adapter-wide scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    /// The scan ran its full duration.
    Completed,
    /// The scan was stopped by the operator.
    Cancelled,
    /// The adapter failed mid-scan. See `last_error`.
    Failed,
}

struct ScanStatus {
    state: ScanState,
    last_error: Option<Error>,
    /// Incremented on every `start`. A forwarding task may only retire
    /// the scan it was spawned for; a stale task observing its valve
    /// close must not touch a successor's state.
    generation: u64,
}

/// Owns the single adapter-wide scan session.
///
/// At most one scan is active per controller at any time; this is
/// enforced by the state machine, not by callers. Observations are
/// forwarded into the [`AdvertisementStore`], which fans them out to
/// any number of observers. A finished scan (completed, cancelled or
/// failed) leaves the store contents intact; the store is cleared when
/// the next scan starts.
pub struct ScanController<A: BleAdapter> {
    adapter: Arc<A>,
    store: Arc<AdvertisementStore>,
    status: Arc<Mutex<ScanStatus>>,
    stopper: Option<Trigger>,
    max_duration: Duration,
}

impl<A: BleAdapter> ScanController<A> {
    pub fn new(adapter: Arc<A>, store: Arc<AdvertisementStore>) -> Self {
        Self {
            adapter,
            store,
            status: Arc::new(Mutex::new(ScanStatus {
                state: ScanState::Idle,
                last_error: None,
                generation: 0,
            })),
            stopper: None,
            max_duration: DEFAULT_MAX_SCAN_DURATION,
        }
    }

    /// Upper bound accepted by [`start`](Self::start). Defaults to
    /// [`DEFAULT_MAX_SCAN_DURATION`].
    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn state(&self) -> ScanState {
        self.status.lock().unwrap().state
    }

    /// Error that moved the last scan into [`ScanState::Failed`].
    pub fn last_error(&self) -> Option<Error> {
        self.status.lock().unwrap().last_error.clone()
    }

    pub fn store(&self) -> &Arc<AdvertisementStore> {
        &self.store
    }

    /// Start a scan bounded by `duration`.
    ///
    /// Clears the store, then forwards every reported observation into
    /// it until the duration elapses or [`stop`](Self::stop) is called.
    /// Legal from any state except `Scanning`; finished scans fold back
    /// to idle implicitly.
    pub async fn start(&mut self, duration: Duration) -> Result<()> {
        if duration.is_zero() || duration > self.max_duration {
            return Err(Error::InvalidDuration {
                requested: duration,
                max: self.max_duration,
            });
        }

        let generation = {
            let mut status = self.status.lock().unwrap();
            if status.state == ScanState::Scanning {
                return Err(Error::AlreadyScanning);
            }
            status.state = ScanState::Scanning;
            status.last_error = None;
            status.generation += 1;
            status.generation
        };

        // Fresh store for a fresh scan session.
        self.store.clear();

        let observations = match self.adapter.scan_events().await {
            Ok(observations) => observations,
            Err(e) => {
                let mut status = self.status.lock().unwrap();
                status.state = ScanState::Failed;
                status.last_error = Some(e.clone());
                return Err(e);
            }
        };

        log::info!("Starting scan for {:?}", duration);

        let (stopper, mut observations) = Valved::new(observations);
        self.stopper = Some(stopper);

        let adapter = self.adapter.clone();
        let store = self.store.clone();
        let status = self.status.clone();

        tokio::spawn(async move {
            let deadline = sleep(duration);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        finish_scan(&status, generation, ScanState::Completed);
                        log::info!("Scan completed after {:?}", duration);
                        break;
                    }
                    observation = observations.next() => match observation {
                        Some(Ok(observation)) => {
                            log::trace!("Observation from {}", observation.address);
                            store.upsert(observation);
                        }
                        Some(Err(e)) => {
                            log::warn!("Scan failed: {}", e);
                            let mut status = status.lock().unwrap();
                            if status.generation == generation
                                && status.state == ScanState::Scanning
                            {
                                status.state = ScanState::Failed;
                                status.last_error = Some(e);
                            }
                            break;
                        }
                        // The valve was triggered or the platform
                        // stream ended on its own.
                        None => {
                            finish_scan(&status, generation, ScanState::Cancelled);
                            break;
                        }
                    }
                }
            }

            // A successor scan owns the platform scan now; releasing it
            // here would kill the successor's observation flow.
            let current = status.lock().unwrap().generation == generation;
            if current {
                if let Err(e) = adapter.stop_scan().await {
                    log::warn!("Failed to stop platform scan: {}", e);
                }
            }
        });

        Ok(())
    }

    /// Cancel an in-flight scan. No-op if nothing is scanning. Store
    /// contents are left intact.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut status = self.status.lock().unwrap();
            if status.state != ScanState::Scanning {
                log::debug!("No scan in progress");
                self.stopper.take();
                return Ok(());
            }
            status.state = ScanState::Cancelled;
        }

        // Dropping the trigger ends the observation stream promptly;
        // the forwarding task then releases the platform scan.
        self.stopper.take();

        log::info!("Scan cancelled");
        Ok(())
    }
}

fn finish_scan(status: &Mutex<ScanStatus>, generation: u64, state: ScanState) {
    let mut status = status.lock().unwrap();
    if status.generation == generation && status.state == ScanState::Scanning {
        status.state = state;
    }
}
