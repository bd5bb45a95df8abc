//! Shared KMS health state.
//!
//! One instance is shared by every plugin talking to the same CMK. Failing
//! data-plane calls push their error onto a bounded channel with a
//! non-blocking send; a single drain task folds them into the last-error
//! record. The data plane therefore never waits on health bookkeeping, even
//! with a full channel under sustained upstream failure.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ProviderError;

/// Default interval after which a cached health result goes stale.
pub const DEFAULT_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// Default capacity of the error-notification channel.
pub const DEFAULT_ERR_BUF_SIZE: usize = 100;

#[derive(Debug, Default)]
struct LastCheck {
    err: Option<ProviderError>,
    at: Option<Instant>,
}

/// Process-wide holder of the most recent KMS health signal.
pub struct SharedHealthCheck {
    check_period: Duration,
    last: RwLock<LastCheck>,

    errc_tx: mpsc::Sender<ProviderError>,
    errc_rx: Mutex<Option<mpsc::Receiver<ProviderError>>>,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    closed_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl SharedHealthCheck {
    /// Creates the health state with the given staleness period and error
    /// channel capacity. A zero capacity is clamped to one; the drop-on-full
    /// producer contract is unaffected.
    pub fn new(check_period: Duration, err_buf_size: usize) -> Self {
        let (errc_tx, errc_rx) = mpsc::channel(err_buf_size.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = oneshot::channel();
        Self {
            check_period,
            last: RwLock::new(LastCheck::default()),
            errc_tx,
            errc_rx: Mutex::new(Some(errc_rx)),
            stop_tx,
            stop_rx,
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx: Mutex::new(Some(closed_rx)),
        }
    }

    /// Drains error notifications into the last-error record until
    /// [`Self::stop`] is called. Run this on its own task before any plugin
    /// starts serving.
    pub async fn start(&self) {
        let mut errc_rx = match self.errc_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("health check drain task already started");
                return;
            }
        };

        info!(period = ?self.check_period, "starting health check routine");
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    warn!("exiting health check routine");
                    break;
                }
                received = errc_rx.recv() => {
                    match received {
                        Some(err) => self.record_err(Some(err)).await,
                        None => break,
                    }
                }
            }
        }

        if let Some(closed_tx) = self.closed_tx.lock().await.take() {
            let _ = closed_tx.send(());
        }
    }

    /// Signals the drain task to exit and waits for its acknowledgement.
    /// Idempotent: a second call only waits for the first to finish.
    pub async fn stop(&self) {
        let mut closed_rx = self.closed_rx.lock().await;
        let _ = self.stop_tx.send(true);
        if let Some(rx) = closed_rx.take() {
            let _ = rx.await;
        }
    }

    /// Returns whether a check happened within the staleness period, together
    /// with the last recorded error.
    pub async fn is_recently_checked(&self) -> (bool, Option<ProviderError>) {
        let last = self.last.read().await;
        let never = last.err.is_none() && last.at.is_none();
        let latest = last
            .at
            .is_some_and(|at| at.elapsed() < self.check_period);
        (!never && latest, last.err.clone())
    }

    /// Overwrites the health record with the given outcome, stamped now.
    pub async fn record_err(&self, err: Option<ProviderError>) {
        let mut last = self.last.write().await;
        last.err = err;
        last.at = Some(Instant::now());
    }

    /// Pushes an error onto the notification channel without blocking; the
    /// notification is dropped when the channel is full or closed.
    pub fn notify(&self, err: ProviderError) {
        if let Err(dropped) = self.errc_tx.try_send(err) {
            debug!(error = %dropped, "health error channel full, dropping notification");
        }
    }
}
