use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;

/// Delayed-ack interval (RFC 4960 sec 6.2: within 200 ms of arrival).
pub(crate) const ACK_INTERVAL: Duration = Duration::from_millis(200);

#[async_trait]
pub(crate) trait AckTimerObserver {
    async fn on_ack_timeout(&mut self);
}

/// Single-shot delayed-ack timer.
pub(crate) struct AckTimer<T: AckTimerObserver + Send + 'static> {
    observer: Weak<AsyncMutex<T>>,
    interval: Duration,
    slot: Arc<Mutex<Option<(u64, mpsc::Sender<()>)>>>,
    next_gen: AtomicU64,
}

impl<T: AckTimerObserver + Send + 'static> AckTimer<T> {
    pub(crate) fn new(observer: Weak<AsyncMutex<T>>, interval: Duration) -> Self {
        AckTimer {
            observer,
            interval,
            slot: Arc::new(Mutex::new(None)),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Arms the timer. A no-op when already armed.
    pub(crate) fn start(&self) -> bool {
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

        let interval = self.interval;
        let observer = self.observer.clone();
        let slot = Arc::clone(&self.slot);

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(interval) => {
                    // Disarm before the callback so the observer may re-arm.
                    {
                        let mut cleared = slot.lock().unwrap();
                        if matches!(&*cleared, Some((g, _)) if *g == gen) {
                            *cleared = None;
                        }
                    }
                    if let Some(obs) = observer.upgrade() {
                        let mut o = obs.lock().await;
                        o.on_ack_timeout().await;
                    }
                }
                _ = rx.recv() => {
                    let mut cleared = slot.lock().unwrap();
                    if matches!(&*cleared, Some((g, _)) if *g == gen) {
                        *cleared = None;
                    }
                }
            }
        });
        true
    }

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
