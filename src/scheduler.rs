use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    ledger::LedgerError,
    reconcile::{ConvergeError, ConvergeOutcome, Reconciler},
    topology::PrimaryNode,
};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Result of a submission whose request was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The cluster now satisfies the verdict.
    Satisfied { key: String, primary: PrimaryNode },
    /// Recorded, but this cycle failed; the timer keeps retrying.
    Pending { key: String, error: ConvergeError },
}

impl SubmitOutcome {
    pub fn key(&self) -> &str {
        match self {
            Self::Satisfied { key, .. } | Self::Pending { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Nothing was recorded.
    Rejected(LedgerError),
    /// The scheduler was already stopped; nothing was recorded.
    Stopped,
    /// Recorded, but the scheduler stopped while this call waited.
    Cancelled { key: String },
    /// Recorded, but the convergence task died without an outcome.
    CycleAborted { key: String, details: String },
}

impl SubmitError {
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Rejected(_) | Self::Stopped => None,
            Self::Cancelled { key } | Self::CycleAborted { key, .. } => Some(key),
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{e}"),
            Self::Stopped => write!(f, "scheduler is stopped"),
            Self::Cancelled { key } => {
                write!(f, "scheduler stopped while waiting for request {key}")
            }
            Self::CycleAborted { key, details } => {
                write!(f, "convergence for request {key} aborted: {details}")
            }
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<LedgerError> for SubmitError {
    fn from(value: LedgerError) -> Self {
        Self::Rejected(value)
    }
}

/// Runs convergence on a fixed interval and on every accepted submission.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    stop: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        let (stop, _rx) = watch::channel(false);
        Self {
            reconciler,
            interval,
            stop,
            timer: Mutex::new(None),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Starts the timer loop. Returns false if it is already running or the
    /// scheduler has been stopped.
    pub fn start(&self) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_some() || self.is_stopped() {
            return false;
        }
        info!(interval_secs = self.interval.as_secs(), "starting convergence timer");
        *timer = Some(tokio::spawn(timer_loop(
            self.reconciler.clone(),
            self.interval,
            self.stop.subscribe(),
        )));
        true
    }

    /// Stops the timer and releases waiting submissions. A cycle already in
    /// flight runs to completion in the background; no new cycle starts.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            if let Err(err) = timer.await {
                warn!(%err, "convergence timer ended abnormally");
            }
            info!("convergence timer stopped");
        }
    }

    /// Records a request and waits for one convergence attempt.
    pub async fn submit(
        &self,
        key: Option<String>,
        master_count: u32,
        servant_count: u32,
    ) -> Result<SubmitOutcome, SubmitError> {
        if self.is_stopped() {
            return Err(SubmitError::Stopped);
        }

        let mut stop_rx = self.stop.subscribe();
        let (key, cycle) = {
            let mut ledger = self.reconciler.ledger().lock().await;
            let key = match key {
                Some(k) if !k.is_empty() => k,
                _ => ledger.new_key(),
            };
            if let Err(err) = ledger.record_request(key.clone(), master_count, servant_count) {
                warn!(%key, master_count, servant_count, %err, "scale request rejected");
                return Err(err.into());
            }
            info!(%key, master_count, servant_count, "scale request accepted");

            // `stop()` may have run while this call waited for the ledger.
            if self.is_stopped() {
                info!(%key, "scheduler stopped while the request was recorded; no cycle started");
                return Err(SubmitError::Cancelled { key });
            }
            let cycle = spawn_cycle(&self.reconciler, stop_rx.clone());
            (key, cycle)
        };

        tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                info!(%key, "scheduler stopped; releasing waiting submission");
                Err(SubmitError::Cancelled { key })
            }
            joined = cycle => match joined {
                Ok(None) => Err(SubmitError::Cancelled { key }),
                Ok(Some(Ok(outcome))) => Ok(SubmitOutcome::Satisfied {
                    key,
                    primary: outcome.applied().primary.clone(),
                }),
                Ok(Some(Err(error))) => {
                    warn!(%key, code = error.code(), %error, "convergence failed; will retry");
                    Ok(SubmitOutcome::Pending { key, error })
                }
                Err(join_err) => {
                    error!(%key, error = %join_err, "convergence task aborted");
                    Err(SubmitError::CycleAborted {
                        key,
                        details: join_err.to_string(),
                    })
                }
            },
        }
    }

    /// Waits for `signal`, then stops the scheduler. Given to
    /// `with_graceful_shutdown`, this releases blocked submissions before the
    /// server starts draining their connections.
    pub async fn stop_on<F>(self: Arc<Self>, signal: F)
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("shutdown requested; stopping scheduler");
        self.stop().await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

type CycleResult = Option<Result<ConvergeOutcome, ConvergeError>>;

// Cycles run on their own task so that neither a cancelled waiter nor a
// stopping timer can interrupt an external tool half way. A cycle still
// queued on the reconciler's gate when stop is requested never starts.
fn spawn_cycle(
    reconciler: &Arc<Reconciler>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<CycleResult> {
    let reconciler = reconciler.clone();
    tokio::spawn(async move { reconciler.converge_unless_stopped(&stop).await })
}

async fn timer_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            _ = ticker.tick() => {}
        }

        reconciler.ledger().lock().await.purge_expired();

        let cycle = spawn_cycle(&reconciler, stop_rx.clone());
        tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                info!("stop requested during a cycle; it will finish in the background");
                break;
            }
            joined = cycle => log_cycle(joined),
        }
    }
}

fn log_cycle(joined: Result<CycleResult, JoinError>) {
    match joined {
        Ok(None) => debug!("scheduled cycle dropped; scheduler is stopping"),
        Ok(Some(Ok(ConvergeOutcome::Skipped(applied)))) => {
            debug!(target_state = %applied.state, "scheduled cycle: nothing to do");
        }
        Ok(Some(Ok(ConvergeOutcome::Converged(applied)))) => {
            info!(target_state = %applied.state, "scheduled cycle converged");
        }
        Ok(Some(Err(err))) => {
            warn!(code = err.code(), error = %err, "scheduled cycle failed; retrying next tick");
        }
        Err(err) => {
            error!(error = %err, "scheduled cycle aborted; retrying next tick");
        }
    }
}
