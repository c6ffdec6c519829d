use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;

use super::rto_manager::calculate_next_timeout;

/// Maximum retransmits for the handshake timers (T1-init, T1-cookie).
pub(crate) const MAX_INIT_RETRANS: usize = 10;
/// No retransmit limit (T2-shutdown, T3-rtx, T-reconfig).
pub(crate) const NO_MAX_RETRANS: usize = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RtxTimerId {
    T1Init,
    T1Cookie,
    T2Shutdown,
    T3Rtx,
    Reconfig,
}

impl fmt::Display for RtxTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RtxTimerId::T1Init => "T1-init",
            RtxTimerId::T1Cookie => "T1-cookie",
            RtxTimerId::T2Shutdown => "T2-shutdown",
            RtxTimerId::T3Rtx => "T3-rtx",
            RtxTimerId::Reconfig => "T-reconfig",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub(crate) trait RtxTimerObserver {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize);
    async fn on_retransmission_failure(&mut self, id: RtxTimerId);
}

/// A retransmission timer with exponential backoff.
///
/// `start` spawns a task that sleeps the backed-off interval and invokes the
/// observer on each expiry; once `n_rtos` exceeds `max_retrans` (when
/// nonzero) the failure callback fires and the timer stops itself. The
/// observer is held weakly: the task dies with the association, so the
/// timer/association relationship carries no ownership cycle.
pub(crate) struct RtxTimer<T: RtxTimerObserver + Send + 'static> {
    id: RtxTimerId,
    observer: Weak<AsyncMutex<T>>,
    max_retrans: usize,
    rto_max: f64,
    // Generation-tagged so a finished task never clears a successor's slot.
    slot: Arc<Mutex<Option<(u64, mpsc::Sender<()>)>>>,
    next_gen: AtomicU64,
}

impl<T: RtxTimerObserver + Send + 'static> RtxTimer<T> {
    pub(crate) fn new(
        observer: Weak<AsyncMutex<T>>,
        id: RtxTimerId,
        max_retrans: usize,
        rto_max: f64,
    ) -> Self {
        RtxTimer {
            id,
            observer,
            max_retrans,
            rto_max,
            slot: Arc::new(Mutex::new(None)),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Starts the timer with the given RTO in milliseconds. A no-op when
    /// already running.
    pub(crate) fn start(&self, rto: f64) -> bool {
        let (gen, mut rx) = {
            let mut slot = self.slot.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            let (tx, rx) = mpsc::channel(1);
            let gen = self.next_gen.fetch_add(1, Ordering::SeqCst);
            *slot = Some((gen, tx));
            (gen, rx)
        };

        let id = self.id;
        let max_retrans = self.max_retrans;
        let rto_max = self.rto_max;
        let observer = self.observer.clone();
        let slot = Arc::clone(&self.slot);

        tokio::spawn(async move {
            let mut n_rtos = 0usize;
            loop {
                let interval = calculate_next_timeout(rto, n_rtos, rto_max);
                tokio::select! {
                    _ = sleep(Duration::from_micros((interval * 1000.0) as u64)) => {
                        n_rtos += 1;
                        if max_retrans == 0 || n_rtos <= max_retrans {
                            if let Some(obs) = observer.upgrade() {
                                let mut o = obs.lock().await;
                                o.on_retransmission_timeout(id, n_rtos).await;
                            } else {
                                break;
                            }
                        } else {
                            // Retransmit budget exhausted: stop and report.
                            {
                                let mut cleared = slot.lock().unwrap();
                                if matches!(&*cleared, Some((g, _)) if *g == gen) {
                                    *cleared = None;
                                }
                            }
                            if let Some(obs) = observer.upgrade() {
                                let mut o = obs.lock().await;
                                o.on_retransmission_failure(id).await;
                            }
                            return;
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
            let mut cleared = slot.lock().unwrap();
            if matches!(&*cleared, Some((g, _)) if *g == gen) {
                *cleared = None;
            }
        });
        true
    }

    /// Stops the timer; the spawned task exits on its next poll.
    pub(crate) fn stop(&self) {
        self.slot.lock().unwrap().take();
    }

    pub(crate) fn close(&self) {
        self.stop();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}
