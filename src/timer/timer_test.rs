use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::ack_timer::{AckTimer, AckTimerObserver};
use super::rto_manager::{calculate_next_timeout, RtoManager, DEFAULT_RTO_MAX, RTO_INITIAL};
use super::rtx_timer::{RtxTimer, RtxTimerId, RtxTimerObserver};

#[test]
fn test_rto_manager_initial_value() {
    let m = RtoManager::new(0.0);
    assert_eq!(m.get_rto(), RTO_INITIAL);
}

#[test]
fn test_rto_manager_first_measurement() {
    let mut m = RtoManager::new(0.0);
    // First sample: SRTT = R, RTTVAR = R/2, RTO = SRTT + 4*RTTVAR = 3R.
    let srtt = m.set_new_rtt(600.0);
    assert_eq!(srtt, 600.0);
    assert_eq!(m.get_rto(), 1800.0);
}

#[test]
fn test_rto_manager_subsequent_measurements() {
    let mut m = RtoManager::new(0.0);
    m.set_new_rtt(600.0);
    // RTTVAR = 3/4*300 + 1/4*|600-600| = 225; SRTT stays 600.
    let srtt = m.set_new_rtt(600.0);
    assert_eq!(srtt, 600.0);
    assert_eq!(m.get_rto(), 600.0 + 4.0 * 225.0);
}

#[test]
fn test_rto_manager_clamps_to_bounds() {
    let mut m = RtoManager::new(0.0);
    // A tiny RTT still yields the 1 second floor.
    m.set_new_rtt(10.0);
    assert_eq!(m.get_rto(), 1000.0);

    let mut m = RtoManager::new(2000.0);
    m.set_new_rtt(10_000.0);
    assert_eq!(m.get_rto(), 2000.0);
}

#[test]
fn test_rto_manager_reset() {
    let mut m = RtoManager::new(0.0);
    m.set_new_rtt(100.0);
    m.reset();
    assert_eq!(m.get_rto(), RTO_INITIAL);
    // The next sample is treated as the first again.
    let srtt = m.set_new_rtt(800.0);
    assert_eq!(srtt, 800.0);
}

#[test]
fn test_calculate_next_timeout_backoff() {
    assert_eq!(calculate_next_timeout(1000.0, 0, DEFAULT_RTO_MAX), 1000.0);
    assert_eq!(calculate_next_timeout(1000.0, 1, DEFAULT_RTO_MAX), 2000.0);
    assert_eq!(calculate_next_timeout(1000.0, 2, DEFAULT_RTO_MAX), 4000.0);
    assert_eq!(calculate_next_timeout(1000.0, 5, DEFAULT_RTO_MAX), 32000.0);
    // The cap kicks in.
    assert_eq!(calculate_next_timeout(1000.0, 10, DEFAULT_RTO_MAX), 60000.0);
    assert_eq!(calculate_next_timeout(1000.0, 63, DEFAULT_RTO_MAX), 60000.0);
}

struct TimeoutRecorder {
    timeouts: Vec<(RtxTimerId, usize)>,
    failure: Option<RtxTimerId>,
    failure_tx: mpsc::Sender<()>,
}

#[async_trait]
impl RtxTimerObserver for TimeoutRecorder {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize) {
        self.timeouts.push((id, n_rtos));
    }

    async fn on_retransmission_failure(&mut self, id: RtxTimerId) {
        self.failure = Some(id);
        let _ = self.failure_tx.try_send(());
    }
}

#[tokio::test]
async fn test_rtx_timer_expires_and_fails() {
    let (failure_tx, mut failure_rx) = mpsc::channel(1);
    let observer = Arc::new(Mutex::new(TimeoutRecorder {
        timeouts: vec![],
        failure: None,
        failure_tx,
    }));
    let timer = RtxTimer::new(Arc::downgrade(&observer), RtxTimerId::T1Init, 2, 60_000.0);

    assert!(timer.start(10.0));
    assert!(!timer.start(10.0), "start while running is a no-op");

    timeout(Duration::from_secs(5), failure_rx.recv())
        .await
        .expect("timer never reported failure");

    let obs = observer.lock().await;
    assert_eq!(
        obs.timeouts,
        vec![(RtxTimerId::T1Init, 1), (RtxTimerId::T1Init, 2)]
    );
    assert_eq!(obs.failure, Some(RtxTimerId::T1Init));
    drop(obs);

    assert!(!timer.is_running(), "timer stops itself after failure");
    // It can be started again after a failure.
    assert!(timer.start(10.0));
    timer.stop();
}

#[tokio::test]
async fn test_rtx_timer_stop_prevents_expiry() {
    let (failure_tx, _failure_rx) = mpsc::channel(1);
    let observer = Arc::new(Mutex::new(TimeoutRecorder {
        timeouts: vec![],
        failure: None,
        failure_tx,
    }));
    let timer = RtxTimer::new(
        Arc::downgrade(&observer),
        RtxTimerId::T3Rtx,
        0,
        60_000.0,
    );

    assert!(timer.start(50.0));
    timer.stop();
    assert!(!timer.is_running());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(observer.lock().await.timeouts.is_empty());
}

struct AckRecorder {
    fired: usize,
    fired_tx: mpsc::Sender<()>,
}

#[async_trait]
impl AckTimerObserver for AckRecorder {
    async fn on_ack_timeout(&mut self) {
        self.fired += 1;
        let _ = self.fired_tx.try_send(());
    }
}

#[tokio::test]
async fn test_ack_timer_is_single_shot() {
    let (fired_tx, mut fired_rx) = mpsc::channel(1);
    let observer = Arc::new(Mutex::new(AckRecorder { fired: 0, fired_tx }));
    let timer = AckTimer::new(Arc::downgrade(&observer), Duration::from_millis(20));

    assert!(timer.start());
    assert!(!timer.start(), "start while armed is a no-op");

    timeout(Duration::from_secs(5), fired_rx.recv())
        .await
        .expect("ack timer never fired");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observer.lock().await.fired, 1);
    assert!(!timer.is_running());

    // Re-arming works after a shot.
    assert!(timer.start());
    timer.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observer.lock().await.fired, 1);
}
