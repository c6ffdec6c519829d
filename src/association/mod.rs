pub(crate) mod association_internal;
pub(crate) mod association_stats;

#[cfg(test)]
mod association_test;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use crate::config::{Config, RECEIVE_MTU};
use crate::error::{Error, Result};
use crate::error_cause::ErrorCause;
use crate::stream::Stream;
use crate::timer::ack_timer::{AckTimer, ACK_INTERVAL};
use crate::timer::rtx_timer::{RtxTimer, RtxTimerId, MAX_INIT_RETRANS, NO_MAX_RETRANS};
use crate::PacketConn;
use association_internal::AssociationInternal;
use association_stats::AssociationStats;

/// Incoming streams queue at most this many deep before new arrivals are
/// dropped.
pub(crate) const ACCEPT_CH_SIZE: usize = 16;

/// Association states (RFC 4960 sec 13.2 plus an explicit Closed).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AssociationState {
    #[default]
    Closed = 0,
    CookieWait = 1,
    CookieEchoed = 2,
    Established = 3,
    ShutdownAckSent = 4,
    ShutdownPending = 5,
    ShutdownReceived = 6,
    ShutdownSent = 7,
}

impl From<u8> for AssociationState {
    fn from(v: u8) -> Self {
        match v {
            1 => AssociationState::CookieWait,
            2 => AssociationState::CookieEchoed,
            3 => AssociationState::Established,
            4 => AssociationState::ShutdownAckSent,
            5 => AssociationState::ShutdownPending,
            6 => AssociationState::ShutdownReceived,
            7 => AssociationState::ShutdownSent,
            _ => AssociationState::Closed,
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownSent => "ShutdownSent",
        };
        f.write_str(s)
    }
}

/// A single-homed SCTP association over one packet conduit.
///
/// All protocol state lives in an internal structure behind one mutex; a
/// read task and a write task (plus timer tasks) serialize through it. This
/// handle exposes the user-facing operations and observability.
pub struct Association {
    name: String,
    state: Arc<AtomicU8>,
    bytes_received: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicUsize>,
    mtu: u32,
    max_message_size: Arc<AtomicU32>,
    cwnd: Arc<AtomicU32>,
    rwnd: Arc<AtomicU32>,
    srtt: Arc<AtomicU64>,

    net_conn: Arc<dyn PacketConn + Send + Sync>,
    association_internal: Arc<Mutex<AssociationInternal>>,

    accept_ch_rx: Mutex<mpsc::Receiver<Arc<Stream>>>,
    close_loop_rx: Mutex<broadcast::Receiver<()>>,
    read_loop_done_rx: watch::Receiver<bool>,
}

impl Association {
    /// Opens an association as the initiating side and waits for the
    /// handshake to complete.
    pub async fn client(config: Config) -> Result<Self> {
        Association::new(config, true).await
    }

    /// Accepts an association as the responding side and waits for the
    /// handshake to complete.
    pub async fn server(config: Config) -> Result<Self> {
        Association::new(config, false).await
    }

    async fn new(config: Config, is_client: bool) -> Result<Self> {
        let net_conn = Arc::clone(&config.net_conn);

        let (awake_tx, awake_rx) = mpsc::channel(1);
        let awake_tx = Arc::new(awake_tx);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CH_SIZE);
        let (handshake_tx, mut handshake_rx) = mpsc::channel(1);
        let (close_tx, close_rx_read) = broadcast::channel(1);
        let close_rx_write = close_tx.subscribe();
        let close_rx_shutdown = close_tx.subscribe();
        let (done_tx, done_rx) = watch::channel(false);

        let internal = AssociationInternal::new(
            &config,
            Arc::clone(&awake_tx),
            accept_tx,
            handshake_tx,
            close_tx,
        );

        let name = internal.name.clone();
        let mtu = internal.mtu;
        let rto_max = internal.rto_max;
        let state = Arc::clone(&internal.state);
        let cwnd = Arc::clone(&internal.cwnd);
        let rwnd = Arc::clone(&internal.rwnd);
        let srtt = Arc::clone(&internal.srtt);
        let max_message_size = Arc::clone(&internal.max_message_size);
        let stats = Arc::clone(&internal.stats);

        let association_internal = Arc::new(Mutex::new(internal));
        {
            // Timers hold a weak back-reference to the association; they can
            // only be wired up once the mutex-wrapped allocation exists.
            let weak = Arc::downgrade(&association_internal);
            let mut ai = association_internal.lock().await;
            ai.t1_init = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Init,
                MAX_INIT_RETRANS,
                rto_max,
            ));
            ai.t1_cookie = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Cookie,
                MAX_INIT_RETRANS,
                rto_max,
            ));
            ai.t2_shutdown = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T2Shutdown,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.t3_rtx = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T3Rtx,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.t_reconfig = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::Reconfig,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.ack_timer = Some(AckTimer::new(weak, ACK_INTERVAL));
        }

        let bytes_received = Arc::new(AtomicUsize::new(0));
        let bytes_sent = Arc::new(AtomicUsize::new(0));

        tokio::spawn(read_loop(
            name.clone(),
            Arc::clone(&bytes_received),
            Arc::clone(&net_conn),
            close_rx_read,
            Arc::clone(&association_internal),
            done_tx,
            Arc::clone(&stats),
        ));
        tokio::spawn(write_loop(
            name.clone(),
            Arc::clone(&bytes_sent),
            Arc::clone(&net_conn),
            close_rx_write,
            Arc::clone(&association_internal),
            awake_rx,
            Arc::clone(&stats),
        ));

        if is_client {
            let mut ai = association_internal.lock().await;
            ai.init_client()?;
        }

        let assoc = Association {
            name,
            state,
            bytes_received,
            bytes_sent,
            mtu,
            max_message_size,
            cwnd,
            rwnd,
            srtt,
            net_conn,
            association_internal,
            accept_ch_rx: Mutex::new(accept_rx),
            close_loop_rx: Mutex::new(close_rx_shutdown),
            read_loop_done_rx: done_rx,
        };

        let mut done_rx = assoc.read_loop_done_rx.clone();
        tokio::select! {
            res = handshake_rx.recv() => match res {
                Some(None) => Ok(assoc),
                Some(Some(err)) => {
                    let _ = assoc.close().await;
                    Err(err)
                }
                None => {
                    let _ = assoc.close().await;
                    Err(Error::ErrAssociationClosedBeforeConn)
                }
            },
            _ = wait_for(&mut done_rx) => Err(Error::ErrAssociationClosedBeforeConn),
        }
    }

    /// Initiates the shutdown sequence and waits for it to complete. The
    /// returned future is cancel-safe: dropping it abandons the wait, not
    /// the in-flight shutdown. Wrap in `tokio::time::timeout` for a
    /// deadline.
    pub async fn shutdown(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);

        if self.state() != AssociationState::Established {
            return Err(Error::ErrShutdownNonEstablished);
        }

        {
            let mut ai = self.association_internal.lock().await;
            // Attempt a graceful shutdown.
            ai.set_state(AssociationState::ShutdownPending);
            if ai.inflight_queue.is_empty() {
                // No more outstanding, send shutdown.
                ai.will_send_shutdown = true;
                ai.awake_write_loop();
                ai.set_state(AssociationState::ShutdownSent);
            }
        }

        let mut rx = self.close_loop_rx.lock().await;
        loop {
            match rx.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                _ => continue,
            }
        }
        Ok(())
    }

    /// Ends the association and cleans up all state.
    pub async fn close(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);
        {
            let mut ai = self.association_internal.lock().await;
            ai.close().await?;
        }
        let mut done_rx = self.read_loop_done_rx.clone();
        wait_for(&mut done_rx).await;
        Ok(())
    }

    /// Sends an ABORT with a user-initiated cause and closes immediately.
    pub async fn abort(&self, reason: &str) {
        log::debug!("[{}] aborting association: {}", self.name, reason);
        {
            let mut ai = self.association_internal.lock().await;
            if ai.get_state() == AssociationState::Closed {
                return;
            }
            ai.will_send_abort = true;
            ai.will_send_abort_cause = Some(ErrorCause::user_initiated_abort(Bytes::from(
                reason.as_bytes().to_vec(),
            )));
            ai.awake_write_loop();
        }
        let mut done_rx = self.read_loop_done_rx.clone();
        wait_for(&mut done_rx).await;
    }

    /// Opens an outgoing stream. Fails once the association is shutting
    /// down, or when the stream id is already in use.
    pub async fn open_stream(
        &self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        let mut ai = self.association_internal.lock().await;
        ai.open_stream(stream_identifier, default_payload_type)
    }

    /// Waits for the next incoming stream. Fails once the association has
    /// closed.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>> {
        let mut rx = self.accept_ch_rx.lock().await;
        rx.recv().await.ok_or(Error::ErrAssociationClosed)
    }

    fn state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Number of bytes sent on the conduit.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Number of bytes received from the conduit.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// The association's current MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// The current congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.cwnd.load(Ordering::SeqCst)
    }

    /// The peer's current receiver window in bytes.
    pub fn rwnd(&self) -> u32 {
        self.rwnd.load(Ordering::SeqCst)
    }

    /// The latest smoothed round-trip time in milliseconds.
    pub fn srtt(&self) -> f64 {
        f64::from_bits(self.srtt.load(Ordering::SeqCst))
    }

    /// The maximum message size accepted by `Stream::write`.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size.load(Ordering::SeqCst)
    }

    pub fn set_max_message_size(&self, max_message_size: u32) {
        self.max_message_size
            .store(max_message_size, Ordering::SeqCst);
    }

    /// Total bytes of user data buffered across the pending and inflight
    /// queues.
    pub async fn buffered_amount(&self) -> usize {
        let ai = self.association_internal.lock().await;
        ai.pending_queue.get_num_bytes() + ai.inflight_queue.get_num_bytes()
    }
}

async fn wait_for(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop(
    name: String,
    bytes_received: Arc<AtomicUsize>,
    net_conn: Arc<dyn PacketConn + Send + Sync>,
    mut close_loop_ch: broadcast::Receiver<()>,
    association_internal: Arc<Mutex<AssociationInternal>>,
    done_tx: watch::Sender<bool>,
    stats: Arc<AssociationStats>,
) {
    log::debug!("[{}] read loop entered", name);

    let mut buffer = vec![0u8; RECEIVE_MTU];
    let mut close_err: Option<Error> = None;
    loop {
        let n = tokio::select! {
            _ = close_loop_ch.recv() => break,
            result = net_conn.recv(&mut buffer) => match result {
                Ok(n) => n,
                Err(err) => {
                    log::debug!("[{}] conduit read ended: {}", name, err);
                    break;
                }
            }
        };

        // Size a new buffer to what was read; the payload is handed to the
        // reassembly queue without further copying.
        let inbound = Bytes::copy_from_slice(&buffer[..n]);
        bytes_received.fetch_add(n, Ordering::SeqCst);
        stats.inc_packets_received();

        let result = {
            let mut ai = association_internal.lock().await;
            ai.handle_inbound(&inbound).await
        };
        if let Err(err) = result {
            log::warn!("[{}] failed to handle inbound packet: {}", name, err);
            close_err = Some(err);
            break;
        }
    }

    {
        let mut ai = association_internal.lock().await;
        ai.close_err = close_err;
        if let Err(err) = ai.close().await {
            log::warn!("[{}] failed to close association: {}", name, err);
        }
    }
    let _ = done_tx.send(true);

    log::debug!("[{}] read loop exited", name);
}

async fn write_loop(
    name: String,
    bytes_sent: Arc<AtomicUsize>,
    net_conn: Arc<dyn PacketConn + Send + Sync>,
    mut close_loop_ch: broadcast::Receiver<()>,
    association_internal: Arc<Mutex<AssociationInternal>>,
    mut awake_write_loop_ch: mpsc::Receiver<()>,
    stats: Arc<AssociationStats>,
) {
    log::debug!("[{}] write loop entered", name);

    'outer: loop {
        let (raw_packets, mut ok) = {
            let mut ai = association_internal.lock().await;
            ai.gather_outbound()
        };

        for raw in &raw_packets {
            if let Err(err) = net_conn.send(raw).await {
                log::warn!("[{}] failed to write packet on conduit: {}", name, err);
                ok = false;
                break;
            }
            bytes_sent.fetch_add(raw.len(), Ordering::SeqCst);
            stats.inc_packets_sent();
        }

        if !ok {
            break 'outer;
        }

        tokio::select! {
            _ = awake_write_loop_ch.recv() => {}
            _ = close_loop_ch.recv() => break 'outer,
        }
    }

    {
        let mut ai = association_internal.lock().await;
        if let Err(err) = ai.close().await {
            log::warn!("[{}] failed to close association: {}", name, err);
        }
    }

    log::debug!("[{}] write loop exited", name);
}
