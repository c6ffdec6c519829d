use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc, Notify};

use super::association_stats::AssociationStats;
use super::{AssociationState, ACCEPT_CH_SIZE};
use crate::chunk::chunk_abort::ChunkAbort;
use crate::chunk::chunk_cookie::{ChunkCookieAck, ChunkCookieEcho};
use crate::chunk::chunk_error::ChunkError;
use crate::chunk::chunk_forward_tsn::{ChunkForwardTsn, ChunkForwardTsnStream};
use crate::chunk::chunk_heartbeat::{ChunkHeartbeat, ChunkHeartbeatAck};
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::chunk::chunk_reconfig::ChunkReconfig;
use crate::chunk::chunk_selective_ack::{ChunkSelectiveAck, GapAckBlock};
use crate::chunk::chunk_shutdown::{ChunkShutdown, ChunkShutdownAck, ChunkShutdownComplete};
use crate::chunk::chunk_type::CT_FORWARD_TSN;
use crate::chunk::Chunk;
use crate::config::{
    Config, COMMON_HEADER_SIZE, DATA_CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_SCTP_SRC_DST_PORT, INITIAL_MTU, INITIAL_RECV_BUF_SIZE,
};
use crate::error::{Error, Result};
use crate::error_cause::ErrorCause;
use crate::packet::Packet;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use crate::param::param_state_cookie::ParamStateCookie;
use crate::param::param_zero_checksum::{ParamZeroChecksumAcceptable, DTLS_ERROR_DETECTION_METHOD};
use crate::param::Param;
use crate::queue::payload_queue::PayloadQueue;
use crate::queue::pending_queue::PendingQueue;
use crate::queue::reassembly_queue::ReassemblyQueue;
use crate::queue::receive_payload_queue::{get_max_tsn_offset, ReceivePayloadQueue};
use crate::stream::Stream;
use crate::timer::ack_timer::{AckTimer, AckTimerObserver};
use crate::timer::rto_manager::RtoManager;
use crate::timer::rtx_timer::{RtxTimer, RtxTimerId, RtxTimerObserver};
use crate::util::{sna16_lt, sna32_gt, sna32_gte, sna32_lt, sna32_lte};
use crate::PacketConn;

/// The maximum number of inbound reconfig requests kept deferred; beyond
/// this the request is rejected and the peer must retransmit.
const MAX_RECONFIG_REQUESTS: usize = 1000;

/// Ack transmission state.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AckState {
    /// Ack timer is off.
    #[default]
    Idle,
    /// Will send an ack on the next write-loop pass.
    Immediate,
    /// Ack timer is on; the ack is being delayed.
    Delay,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckState::Idle => "Idle",
            AckState::Immediate => "Immediate",
            AckState::Delay => "Delay",
        };
        f.write_str(s)
    }
}

/// Ack mode, for testing the delayed-ack machinery.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AckMode {
    #[default]
    Normal,
    NoDelay,
    AlwaysDelay,
}

/// All mutable association state. Lives behind one `tokio::sync::Mutex`;
/// the read loop, write loop and timer callbacks serialize through it.
pub(crate) struct AssociationInternal {
    pub(crate) name: String,

    pub(crate) state: Arc<AtomicU8>,
    pub(crate) max_message_size: Arc<AtomicU32>,
    pub(crate) max_receive_buffer_size: u32,
    pub(crate) my_max_num_inbound_streams: u16,
    pub(crate) my_max_num_outbound_streams: u16,

    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) peer_verification_tag: u32,
    pub(crate) my_verification_tag: u32,
    pub(crate) initial_tsn: u32,
    pub(crate) my_next_tsn: u32,
    pub(crate) min_tsn2measure_rtt: u32,
    pub(crate) cumulative_tsn_ack_point: u32,
    pub(crate) advanced_peer_tsn_ack_point: u32,
    pub(crate) use_forward_tsn: bool,
    pub(crate) send_zero_checksum: bool,
    pub(crate) recv_zero_checksum: bool,
    pub(crate) zero_checksum_rtx_toggle: bool,

    pub(crate) will_send_forward_tsn: bool,
    pub(crate) will_retransmit_fast: bool,
    pub(crate) will_retransmit_reconfig: bool,
    pub(crate) will_send_shutdown: bool,
    pub(crate) will_send_shutdown_ack: bool,
    pub(crate) will_send_shutdown_complete: bool,
    pub(crate) will_send_abort: bool,
    pub(crate) will_send_abort_cause: Option<ErrorCause>,

    // Reconfig
    pub(crate) my_next_rsn: u32,
    pub(crate) reconfigs: HashMap<u32, ChunkReconfig>,
    pub(crate) reconfig_requests: HashMap<u32, ParamOutgoingResetRequest>,

    pub(crate) my_cookie: Option<ParamStateCookie>,

    pub(crate) payload_queue: ReceivePayloadQueue,
    pub(crate) inflight_queue: PayloadQueue,
    pub(crate) pending_queue: Arc<PendingQueue>,
    pub(crate) control_queue: VecDeque<Packet>,

    pub(crate) mtu: u32,
    /// Maximum DATA chunk payload size.
    pub(crate) max_payload_size: u32,

    // Congestion control
    pub(crate) cwnd: Arc<AtomicU32>,
    pub(crate) rwnd: Arc<AtomicU32>,
    pub(crate) ssthresh: u32,
    pub(crate) partial_bytes_acked: u32,
    pub(crate) in_fast_recovery: bool,
    pub(crate) fast_recover_exit_point: u32,
    pub(crate) min_cwnd: u32,
    pub(crate) fast_rtx_wnd: u32,
    pub(crate) cwnd_ca_step: u32,

    pub(crate) srtt: Arc<AtomicU64>,
    pub(crate) rto_mgr: RtoManager,
    pub(crate) rto_max: f64,
    pub(crate) t1_init: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t1_cookie: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t2_shutdown: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t3_rtx: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t_reconfig: Option<RtxTimer<AssociationInternal>>,
    pub(crate) ack_timer: Option<AckTimer<AssociationInternal>>,

    // Chunks stored for retransmission
    pub(crate) stored_init: Option<ChunkInit>,
    pub(crate) stored_cookie_echo: Option<ChunkCookieEcho>,

    pub(crate) streams: HashMap<u16, Arc<Stream>>,
    pub(crate) accept_ch_tx: Option<mpsc::Sender<Arc<Stream>>>,
    pub(crate) awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    pub(crate) close_loop_ch_tx: Option<broadcast::Sender<()>>,
    pub(crate) handshake_completed_ch_tx: Option<mpsc::Sender<Option<Error>>>,
    pub(crate) close_err: Option<Error>,

    pub(crate) ack_state: AckState,
    pub(crate) ack_mode: AckMode,
    // Per inbound packet context.
    pub(crate) delayed_ack_triggered: bool,
    pub(crate) immediate_ack_triggered: bool,

    pub(crate) stats: Arc<AssociationStats>,

    pub(crate) block_write: bool,
    pub(crate) write_pending: Arc<AtomicBool>,
    pub(crate) write_notify: Arc<Notify>,

    pub(crate) net_conn: Arc<dyn PacketConn + Send + Sync>,

    rng: StdRng,
}

impl AssociationInternal {
    pub(crate) fn new(
        config: &Config,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
        accept_ch_tx: mpsc::Sender<Arc<Stream>>,
        handshake_completed_ch_tx: mpsc::Sender<Option<Error>>,
        close_loop_ch_tx: broadcast::Sender<()>,
    ) -> Self {
        let max_receive_buffer_size = if config.max_receive_buffer_size == 0 {
            INITIAL_RECV_BUF_SIZE
        } else {
            config.max_receive_buffer_size
        };
        let max_message_size = if config.max_message_size == 0 {
            DEFAULT_MAX_MESSAGE_SIZE
        } else {
            config.max_message_size
        };
        let mtu = if config.mtu == 0 { INITIAL_MTU } else { config.mtu };
        let rto_max = if config.rto_max == 0.0 {
            crate::timer::rto_manager::DEFAULT_RTO_MAX
        } else {
            config.rto_max
        };

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let my_verification_tag: u32 = rng.gen();
        let tsn: u32 = rng.gen();

        let name = if config.name.is_empty() {
            format!("{my_verification_tag:08x}")
        } else {
            config.name.clone()
        };

        let mut this = AssociationInternal {
            name,
            state: Arc::new(AtomicU8::new(AssociationState::Closed as u8)),
            max_message_size: Arc::new(AtomicU32::new(max_message_size)),
            max_receive_buffer_size,
            // These two max values have us not need to follow RFC 4960
            // sec 5.1.1 where this peer may be incapable of supporting the
            // requested amount of outbound streams from the other peer.
            my_max_num_inbound_streams: u16::MAX,
            my_max_num_outbound_streams: u16::MAX,
            source_port: 0,
            destination_port: 0,
            peer_verification_tag: 0,
            my_verification_tag,
            initial_tsn: tsn,
            my_next_tsn: tsn,
            min_tsn2measure_rtt: tsn,
            cumulative_tsn_ack_point: tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: tsn.wrapping_sub(1),
            use_forward_tsn: false,
            send_zero_checksum: false,
            recv_zero_checksum: config.enable_zero_checksum,
            zero_checksum_rtx_toggle: config.zero_checksum_rtx_toggle,
            will_send_forward_tsn: false,
            will_retransmit_fast: false,
            will_retransmit_reconfig: false,
            will_send_shutdown: false,
            will_send_shutdown_ack: false,
            will_send_shutdown_complete: false,
            will_send_abort: false,
            will_send_abort_cause: None,
            my_next_rsn: tsn,
            reconfigs: HashMap::new(),
            reconfig_requests: HashMap::new(),
            my_cookie: None,
            payload_queue: ReceivePayloadQueue::new(get_max_tsn_offset(max_receive_buffer_size)),
            inflight_queue: PayloadQueue::new(),
            pending_queue: Arc::new(PendingQueue::new()),
            control_queue: VecDeque::new(),
            mtu,
            max_payload_size: mtu - (COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE),
            cwnd: Arc::new(AtomicU32::new(0)),
            rwnd: Arc::new(AtomicU32::new(0)),
            ssthresh: 0,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recover_exit_point: 0,
            min_cwnd: config.min_cwnd,
            fast_rtx_wnd: config.fast_rtx_wnd,
            cwnd_ca_step: config.cwnd_ca_step,
            srtt: Arc::new(AtomicU64::new(0f64.to_bits())),
            rto_mgr: RtoManager::new(config.rto_max),
            rto_max,
            t1_init: None,
            t1_cookie: None,
            t2_shutdown: None,
            t3_rtx: None,
            t_reconfig: None,
            ack_timer: None,
            stored_init: None,
            stored_cookie_echo: None,
            streams: HashMap::new(),
            accept_ch_tx: Some(accept_ch_tx),
            awake_write_loop_ch,
            close_loop_ch_tx: Some(close_loop_ch_tx),
            handshake_completed_ch_tx: Some(handshake_completed_ch_tx),
            close_err: None,
            ack_state: AckState::Idle,
            ack_mode: AckMode::Normal,
            delayed_ack_triggered: false,
            immediate_ack_triggered: false,
            stats: Arc::new(AssociationStats::default()),
            block_write: config.block_write,
            write_pending: Arc::new(AtomicBool::new(false)),
            write_notify: Arc::new(Notify::new()),
            net_conn: Arc::clone(&config.net_conn),
            rng,
        };

        // RFC 4960 sec 7.2.1: the initial cwnd before DATA transmission MUST
        // be set to min(4*MTU, max(2*MTU, 4380 bytes)).
        this.set_cwnd(std::cmp::min(4 * mtu, std::cmp::max(2 * mtu, 4380)));
        log::trace!(
            "[{}] updated cwnd={} ssthresh={} inflight={} (INI)",
            this.name,
            this.cwnd(),
            this.ssthresh,
            this.inflight_queue.get_num_bytes()
        );

        this
    }

    /// Client entry: build and send INIT, arm T1-init, enter CookieWait.
    pub(crate) fn init_client(&mut self) -> Result<()> {
        let mut init = ChunkInit {
            initial_tsn: self.my_next_tsn,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            params: vec![],
        };
        init.set_supported_extensions();
        if self.recv_zero_checksum {
            init.params
                .push(Param::ZeroChecksumAcceptable(ParamZeroChecksumAcceptable {
                    edmid: DTLS_ERROR_DETECTION_METHOD,
                }));
        }
        self.stored_init = Some(init);

        self.send_init()?;

        // Set the state before starting the timer so a timer expiration
        // cannot race an inconsistent state.
        self.set_state(AssociationState::CookieWait);
        if let Some(t1init) = &self.t1_init {
            t1init.start(self.rto_mgr.get_rto());
        }
        Ok(())
    }

    fn send_init(&mut self) -> Result<()> {
        let Some(stored_init) = self.stored_init.clone() else {
            return Err(Error::ErrInitNotStoredToSend);
        };
        log::debug!("[{}] sending INIT", self.name);

        self.source_port = DEFAULT_SCTP_SRC_DST_PORT;
        self.destination_port = DEFAULT_SCTP_SRC_DST_PORT;

        let outbound = Packet {
            source_port: self.source_port,
            destination_port: self.destination_port,
            // An INIT carries verification tag 0.
            verification_tag: 0,
            chunks: vec![Chunk::Init(stored_init)],
        };
        self.control_queue.push_back(outbound);
        self.awake_write_loop();
        Ok(())
    }

    fn send_cookie_echo(&mut self) -> Result<()> {
        let Some(stored_cookie_echo) = self.stored_cookie_echo.clone() else {
            return Err(Error::ErrCookieEchoNotStoredToSend);
        };
        log::debug!("[{}] sending COOKIE-ECHO", self.name);

        let outbound = self.create_packet(vec![Chunk::CookieEcho(stored_cookie_echo)]);
        self.control_queue.push_back(outbound);
        self.awake_write_loop();
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.get_state() != AssociationState::Closed {
            self.set_state(AssociationState::Closed);
            log::debug!("[{}] closing association..", self.name);

            let _ = self.net_conn.close().await;

            self.close_all_timers();

            // Dropping the sender releases the read and write loops.
            self.close_loop_ch_tx.take();
            self.accept_ch_tx.take();
            self.handshake_completed_ch_tx.take();

            let close_err = self.close_err.clone();
            let sis: Vec<u16> = self.streams.keys().copied().collect();
            for si in sis {
                if let Some(s) = self.streams.remove(&si) {
                    s.unregister(close_err.clone());
                }
            }

            // Unblock any writer parked on the block-write gate.
            self.notify_block_writable();

            log::debug!("[{}] association closed", self.name);
            log::debug!(
                "[{}] stats nPackets (in) : {}",
                self.name,
                self.stats.get_num_packets_received()
            );
            log::debug!(
                "[{}] stats nPackets (out) : {}",
                self.name,
                self.stats.get_num_packets_sent()
            );
            log::debug!(
                "[{}] stats nDATAs (in) : {}",
                self.name,
                self.stats.get_num_datas()
            );
            log::debug!(
                "[{}] stats nSACKs (in) : {}",
                self.name,
                self.stats.get_num_sacks_received()
            );
            log::debug!(
                "[{}] stats nSACKs (out) : {}",
                self.name,
                self.stats.get_num_sacks_sent()
            );
            log::debug!(
                "[{}] stats nT3Timeouts : {}",
                self.name,
                self.stats.get_num_t3timeouts()
            );
            log::debug!(
                "[{}] stats nAckTimeouts: {}",
                self.name,
                self.stats.get_num_ack_timeouts()
            );
            log::debug!(
                "[{}] stats nFastRetrans: {}",
                self.name,
                self.stats.get_num_fast_retrans()
            );
        }
        Ok(())
    }

    fn close_all_timers(&self) {
        if let Some(t) = &self.t1_init {
            t.close();
        }
        if let Some(t) = &self.t1_cookie {
            t.close();
        }
        if let Some(t) = &self.t2_shutdown {
            t.close();
        }
        if let Some(t) = &self.t3_rtx {
            t.close();
        }
        if let Some(t) = &self.t_reconfig {
            t.close();
        }
        if let Some(t) = &self.ack_timer {
            t.close();
        }
    }

    pub(crate) fn awake_write_loop(&self) {
        // Capacity-1 channel: extra wakes collapse.
        let _ = self.awake_write_loop_ch.try_send(());
    }

    /// Marks the association writable again and releases a blocked writer.
    fn notify_block_writable(&self) {
        self.write_pending.store(false, Ordering::SeqCst);
        self.write_notify.notify_one();
    }

    pub(crate) fn set_state(&self, new_state: AssociationState) {
        let old = self.state.swap(new_state as u8, Ordering::SeqCst);
        if old != new_state as u8 {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                AssociationState::from(old),
                new_state
            );
        }
    }

    pub(crate) fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub(crate) fn cwnd(&self) -> u32 {
        self.cwnd.load(Ordering::SeqCst)
    }

    /// Every cwnd assignment clamps at the configured minimum from below.
    pub(crate) fn set_cwnd(&self, cwnd: u32) {
        self.cwnd
            .store(std::cmp::max(cwnd, self.min_cwnd), Ordering::SeqCst);
    }

    pub(crate) fn rwnd(&self) -> u32 {
        self.rwnd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_rwnd(&self, rwnd: u32) {
        self.rwnd.store(rwnd, Ordering::SeqCst);
    }

    /// Last received cumulative TSN.
    fn peer_last_tsn(&self) -> u32 {
        self.payload_queue.get_cumulative_tsn()
    }

    fn store_srtt(&self, srtt: f64) {
        self.srtt.store(srtt.to_bits(), Ordering::SeqCst);
    }

    fn complete_handshake(&mut self, err: Option<Error>) -> bool {
        if let Some(tx) = &self.handshake_completed_ch_tx {
            tx.try_send(err).is_ok()
        } else {
            false
        }
    }

    fn generate_next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        tsn
    }

    fn generate_next_rsn(&mut self) -> u32 {
        let rsn = self.my_next_rsn;
        self.my_next_rsn = self.my_next_rsn.wrapping_add(1);
        rsn
    }

    fn create_packet(&self, chunks: Vec<Chunk>) -> Packet {
        Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            chunks,
        }
    }

    fn marshal_packet(&self, p: &Packet) -> Result<Bytes> {
        p.marshal(!self.send_zero_checksum || chunk_mandatory_checksum(&p.chunks))
    }

    // Inbound path ---------------------------------------------------------

    /// Parses one raw packet and dispatches its chunks in order.
    pub(crate) async fn handle_inbound(&mut self, raw: &Bytes) -> Result<()> {
        let pkt = match Packet::unmarshal(!self.recv_zero_checksum, raw) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("[{}] unable to parse SCTP packet {}", self.name, err);
                return Ok(());
            }
        };
        if let Err(err) = pkt.check() {
            log::warn!("[{}] failed validating packet {}", self.name, err);
            return Ok(());
        }

        self.handle_chunks_start();

        for c in &pkt.chunks {
            self.handle_chunk(&pkt, c).await?;
        }

        self.handle_chunks_end();

        Ok(())
    }

    pub(crate) fn handle_chunks_start(&mut self) {
        self.delayed_ack_triggered = false;
        self.immediate_ack_triggered = false;
    }

    pub(crate) fn handle_chunks_end(&mut self) {
        if self.immediate_ack_triggered {
            self.ack_state = AckState::Immediate;
            if let Some(t) = &self.ack_timer {
                t.stop();
            }
            self.awake_write_loop();
        } else if self.delayed_ack_triggered {
            // Will send the ack on the next ack timeout.
            self.ack_state = AckState::Delay;
            if let Some(t) = &self.ack_timer {
                t.start();
            }
        }
    }

    async fn handle_chunk(&mut self, pkt: &Packet, chunk: &Chunk) -> Result<()> {
        if let Err(err) = chunk.check() {
            log::error!("[{}] failed validating chunk: {}", self.name, err);
            return Ok(());
        }

        let mut is_abort = false;
        let result = match chunk {
            Chunk::Init(c) => self.handle_init(pkt, c),
            Chunk::InitAck(c) => self.handle_init_ack(pkt, c),
            Chunk::Abort(c) => {
                is_abort = true;
                self.handle_abort(c).await
            }
            Chunk::Error(c) => {
                log::debug!("[{}] {}", self.name, c);
                Ok(vec![])
            }
            Chunk::Heartbeat(c) => self.handle_heartbeat(c),
            Chunk::CookieEcho(c) => Ok(self.handle_cookie_echo(c)),
            Chunk::CookieAck(_) => {
                self.handle_cookie_ack();
                Ok(vec![])
            }
            Chunk::PayloadData(c) => Ok(self.handle_data(c)),
            Chunk::Sack(c) => self.handle_sack(c).map(|_| vec![]),
            Chunk::Reconfig(c) => self.handle_reconfig(c),
            Chunk::ForwardTsn(c) => Ok(self.handle_forward_tsn(c)),
            Chunk::Shutdown(c) => {
                self.handle_shutdown(c);
                Ok(vec![])
            }
            Chunk::ShutdownAck(c) => {
                self.handle_shutdown_ack(c);
                Ok(vec![])
            }
            Chunk::ShutdownComplete(c) => self.handle_shutdown_complete(c).await.map(|_| vec![]),
            Chunk::HeartbeatAck(_) | Chunk::Unknown(_) => Err(Error::ErrChunkTypeUnhandled),
        };

        // Log and absorb; the only fatal condition is an ABORT.
        let packets = match result {
            Ok(packets) => packets,
            Err(err) => {
                if is_abort {
                    return Err(err);
                }
                log::error!("[{}] failed to handle chunk: {}", self.name, err);
                return Ok(());
            }
        };

        if !packets.is_empty() {
            self.control_queue.extend(packets);
            self.awake_write_loop();
        }
        Ok(())
    }

    pub(crate) fn handle_init(&mut self, pkt: &Packet, init: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] INIT received in state '{}'", self.name, state);

        // RFC 4960 sec 5.2.2: unexpected INIT in states other than CLOSED,
        // COOKIE-ECHOED, COOKIE-WAIT.
        if state != AssociationState::Closed
            && state != AssociationState::CookieWait
            && state != AssociationState::CookieEchoed
        {
            return Err(Error::ErrHandleInitState);
        }

        // NOTE: Committing these before receiving a COOKIE ECHO containing
        // our cookie is not compliant with RFC 9260 sec 5.1; it makes us
        // marginally more open to resource attacks.
        self.my_max_num_inbound_streams =
            std::cmp::min(init.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams =
            std::cmp::min(init.num_outbound_streams, self.my_max_num_outbound_streams);
        self.peer_verification_tag = init.initiate_tag;
        self.source_port = pkt.destination_port;
        self.destination_port = pkt.source_port;

        // RFC 4960 13.2: last TSN received in sequence starts at the peer's
        // initial TSN minus one.
        self.payload_queue.init(init.initial_tsn.wrapping_sub(1));

        self.set_rwnd(init.advertised_receiver_window_credit);
        log::debug!("[{}] initial rwnd={}", self.name, self.rwnd());

        for param in &init.params {
            match param {
                Param::SupportedExtensions(v) => {
                    if v.chunk_types.contains(&CT_FORWARD_TSN) {
                        log::debug!("[{}] use ForwardTSN (on init)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
                Param::ZeroChecksumAcceptable(v) => {
                    self.send_zero_checksum = v.edmid == DTLS_ERROR_DETECTION_METHOD;
                }
                _ => {}
            }
        }
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on init)", self.name);
        }

        let mut init_ack = ChunkInit {
            initial_tsn: self.my_next_tsn,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            params: vec![],
        };

        if self.my_cookie.is_none() {
            // Random bytes rather than the RFC 4960 sec 5.1.3 construction.
            self.my_cookie = Some(ParamStateCookie::new(&mut self.rng));
        }
        if let Some(cookie) = &self.my_cookie {
            init_ack.params.push(Param::StateCookie(cookie.clone()));
        }
        if self.recv_zero_checksum {
            init_ack
                .params
                .push(Param::ZeroChecksumAcceptable(ParamZeroChecksumAcceptable {
                    edmid: DTLS_ERROR_DETECTION_METHOD,
                }));
        }
        log::debug!(
            "[{}] sendZeroChecksum={} (on init)",
            self.name,
            self.send_zero_checksum
        );
        init_ack.set_supported_extensions();

        log::debug!("[{}] sending INIT-ACK", self.name);
        Ok(vec![self.create_packet(vec![Chunk::InitAck(init_ack)])])
    }

    pub(crate) fn handle_init_ack(&mut self, pkt: &Packet, init_ack: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] INIT-ACK received in state '{}'", self.name, state);

        // RFC 4960 sec 5.2.3: an INIT ACK outside COOKIE-WAIT is discarded.
        if state != AssociationState::CookieWait {
            return Ok(vec![]);
        }

        self.my_max_num_inbound_streams =
            std::cmp::min(init_ack.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams = std::cmp::min(
            init_ack.num_outbound_streams,
            self.my_max_num_outbound_streams,
        );
        self.peer_verification_tag = init_ack.initiate_tag;
        self.payload_queue.init(init_ack.initial_tsn.wrapping_sub(1));

        if self.source_port != pkt.destination_port || self.destination_port != pkt.source_port {
            log::warn!("[{}] handle_init_ack: port mismatch", self.name);
            return Ok(vec![]);
        }

        self.set_rwnd(init_ack.advertised_receiver_window_credit);
        log::debug!("[{}] initial rwnd={}", self.name, self.rwnd());

        // RFC 4960 sec 7.2.1: the initial ssthresh MAY be the peer's
        // advertised window.
        self.ssthresh = self.rwnd();
        log::trace!(
            "[{}] updated cwnd={} ssthresh={} inflight={} (INI)",
            self.name,
            self.cwnd(),
            self.ssthresh,
            self.inflight_queue.get_num_bytes()
        );

        if let Some(t1init) = &self.t1_init {
            t1init.stop();
        }
        self.stored_init = None;

        let mut cookie_param = None;
        for param in &init_ack.params {
            match param {
                Param::StateCookie(v) => cookie_param = Some(v),
                Param::SupportedExtensions(v) => {
                    if v.chunk_types.contains(&CT_FORWARD_TSN) {
                        log::debug!("[{}] use ForwardTSN (on initAck)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
                Param::ZeroChecksumAcceptable(v) => {
                    self.send_zero_checksum = v.edmid == DTLS_ERROR_DETECTION_METHOD;
                }
                _ => {}
            }
        }
        log::debug!(
            "[{}] sendZeroChecksum={} (on initAck)",
            self.name,
            self.send_zero_checksum
        );
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on initAck)", self.name);
        }

        let Some(cookie) = cookie_param else {
            return Err(Error::ErrInitAckNoCookie);
        };

        self.stored_cookie_echo = Some(ChunkCookieEcho {
            cookie: cookie.cookie.clone(),
        });

        if let Err(err) = self.send_cookie_echo() {
            log::error!("[{}] failed to send cookie-echo: {}", self.name, err);
        }

        if let Some(t1cookie) = &self.t1_cookie {
            t1cookie.start(self.rto_mgr.get_rto());
        }
        self.set_state(AssociationState::CookieEchoed);
        Ok(vec![])
    }

    pub(crate) fn handle_heartbeat(&self, c: &ChunkHeartbeat) -> Result<Vec<Packet>> {
        log::trace!("[{}] HEARTBEAT received", self.name);
        let Some(Param::HeartbeatInfo(hbi)) = c.params.first() else {
            log::warn!("[{}] heartbeat without heartbeat info", self.name);
            return Ok(vec![]);
        };

        Ok(vec![self.create_packet(vec![Chunk::HeartbeatAck(
            ChunkHeartbeatAck {
                params: vec![Param::HeartbeatInfo(ParamHeartbeatInfo {
                    heartbeat_information: hbi.heartbeat_information.clone(),
                })],
            },
        )])])
    }

    pub(crate) fn handle_cookie_echo(&mut self, c: &ChunkCookieEcho) -> Vec<Packet> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ECHO received in state '{}'", self.name, state);

        let Some(my_cookie) = &self.my_cookie else {
            log::debug!("[{}] COOKIE-ECHO received before initialization", self.name);
            return vec![];
        };

        match state {
            AssociationState::Established => {
                if my_cookie.cookie != c.cookie {
                    return vec![];
                }
                // Duplicate cookie: resend the ack without re-entering the
                // handshake.
            }
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                if my_cookie.cookie != c.cookie {
                    return vec![];
                }

                if let Some(t1init) = &self.t1_init {
                    t1init.stop();
                }
                self.stored_init = None;
                if let Some(t1cookie) = &self.t1_cookie {
                    t1cookie.stop();
                }
                self.stored_cookie_echo = None;

                self.set_state(AssociationState::Established);
                self.complete_handshake(None);
            }
            _ => return vec![],
        }

        vec![self.create_packet(vec![Chunk::CookieAck(ChunkCookieAck)])]
    }

    pub(crate) fn handle_cookie_ack(&mut self) {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ACK received in state '{}'", self.name, state);

        // RFC 4960 sec 5.2.5: outside COOKIE-ECHOED, silently discard.
        if state != AssociationState::CookieEchoed {
            return;
        }

        if let Some(t1cookie) = &self.t1_cookie {
            t1cookie.stop();
        }
        self.stored_cookie_echo = None;

        self.set_state(AssociationState::Established);
        self.complete_handshake(None);
    }

    pub(crate) fn handle_data(&mut self, d: &ChunkPayloadData) -> Vec<Packet> {
        log::trace!(
            "[{}] DATA: tsn={} immediateSack={} len={}",
            self.name,
            d.tsn,
            d.immediate_sack,
            d.user_data.len()
        );
        self.stats.inc_datas();

        let can_push = self.payload_queue.can_push(d.tsn);
        if can_push {
            if let Some(stream) =
                self.get_or_create_stream(d.stream_identifier, true, PayloadProtocolIdentifier::Unknown)
            {
                if self.get_my_receiver_window_credit() > 0 {
                    // Hand the chunk to the stream as soon as it arrives.
                    self.payload_queue.push(d.tsn);
                    stream.handle_data(d);
                } else {
                    // Receive buffer is full.
                    let last_tsn = self.payload_queue.get_last_tsn_received();
                    if let Some(last_tsn) = last_tsn.filter(|last| sna32_lt(d.tsn, *last)) {
                        log::debug!(
                            "[{}] receive buffer full, but accepted as this is a missing chunk with tsn={} ssn={} (last={})",
                            self.name, d.tsn, d.stream_sequence_number, last_tsn
                        );
                        self.payload_queue.push(d.tsn);
                        stream.handle_data(d);
                    } else {
                        log::debug!(
                            "[{}] receive buffer full, dropping DATA with tsn={} ssn={}",
                            self.name,
                            d.tsn,
                            d.stream_sequence_number
                        );
                    }
                }
            } else {
                // Accept queue full: silently discard; the sender retries on
                // T3-rtx.
                log::debug!("[{}] discarding ssn={}", self.name, d.stream_sequence_number);
                return vec![];
            }
        } else {
            self.payload_queue.record_duplicate(d.tsn);
        }

        self.handle_peer_last_tsn_and_acknowledgement(d.immediate_sack)
    }

    /// Common tail of DATA and FORWARD-TSN handling: advance the peer's
    /// cumulative TSN and decide how to acknowledge.
    fn handle_peer_last_tsn_and_acknowledgement(&mut self, sack_immediately: bool) -> Vec<Packet> {
        let mut reply = vec![];

        // RFC 3758 sec 3.6: advance peer_last_tsn while the next TSN is
        // present. Every advance may release deferred reset requests.
        while self.payload_queue.pop(false) {
            let rst_reqs: Vec<ParamOutgoingResetRequest> =
                self.reconfig_requests.values().cloned().collect();
            for rst_req in rst_reqs {
                let resp = self.reset_streams_if_any(&rst_req);
                log::debug!("[{}] RESET RESPONSE: {}", self.name, resp);
                reply.push(resp);
            }
        }

        let has_packet_loss = self.payload_queue.size() > 0;
        if has_packet_loss {
            log::trace!(
                "[{}] packetloss: {}",
                self.name,
                self.payload_queue.get_gap_ack_blocks_string()
            );
        }

        if (self.ack_state != AckState::Immediate
            && !sack_immediately
            && !has_packet_loss
            && self.ack_mode == AckMode::Normal)
            || self.ack_mode == AckMode::AlwaysDelay
        {
            if self.ack_state == AckState::Idle {
                self.delayed_ack_triggered = true;
            } else {
                self.immediate_ack_triggered = true;
            }
        } else {
            self.immediate_ack_triggered = true;
        }

        reply
    }

    pub(crate) fn get_my_receiver_window_credit(&self) -> u32 {
        let bytes_queued: usize = self
            .streams
            .values()
            .map(|s| s.get_num_bytes_in_reassembly_queue())
            .sum();
        if bytes_queued >= self.max_receive_buffer_size as usize {
            0
        } else {
            self.max_receive_buffer_size - bytes_queued as u32
        }
    }

    pub(crate) fn open_stream(
        &mut self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        match self.get_state() {
            AssociationState::ShutdownAckSent
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownReceived
            | AssociationState::ShutdownSent
            | AssociationState::Closed => return Err(Error::ErrAssociationClosed),
            _ => {}
        }
        if self.streams.contains_key(&stream_identifier) {
            return Err(Error::ErrStreamAlreadyExist);
        }
        match self.create_stream(stream_identifier, false) {
            Some(s) => {
                s.set_default_payload_type(default_payload_type);
                Ok(s)
            }
            None => Err(Error::ErrStreamCreateFailed),
        }
    }

    /// The caller must have checked that no stream exists for this id.
    fn create_stream(&mut self, stream_identifier: u16, accept: bool) -> Option<Arc<Stream>> {
        let stream = Arc::new(Stream {
            stream_identifier,
            name: format!("{}:{}", stream_identifier, self.name),
            max_payload_size: self.max_payload_size,
            max_message_size: Arc::clone(&self.max_message_size),
            association_state: Arc::clone(&self.state),
            awake_write_loop_ch: Arc::clone(&self.awake_write_loop_ch),
            pending_queue: Arc::clone(&self.pending_queue),
            block_write: self.block_write,
            write_pending: Arc::clone(&self.write_pending),
            write_notify: Arc::clone(&self.write_notify),
            default_payload_type: AtomicU32::new(PayloadProtocolIdentifier::Unknown as u32),
            sequence_number: AtomicU16::new(0),
            reassembly_queue: std::sync::Mutex::new(ReassemblyQueue::new(stream_identifier)),
            read_notifier: Notify::new(),
            read_err: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            unordered: AtomicBool::new(false),
            reliability_type: AtomicU8::new(0),
            reliability_value: AtomicU32::new(0),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low: AtomicUsize::new(0),
            on_buffered_amount_low: std::sync::Mutex::new(None),
        });

        if accept {
            let Some(tx) = &self.accept_ch_tx else {
                return None;
            };
            match tx.try_send(Arc::clone(&stream)) {
                Ok(()) => {
                    self.streams.insert(stream_identifier, Arc::clone(&stream));
                    log::debug!(
                        "[{}] accepted a new stream (streamIdentifier: {})",
                        self.name,
                        stream_identifier
                    );
                }
                Err(_) => {
                    // Accept queue full: drop the new stream.
                    log::debug!(
                        "[{}] dropped a new stream (acceptCh size: {})",
                        self.name,
                        ACCEPT_CH_SIZE
                    );
                    return None;
                }
            }
        } else {
            self.streams.insert(stream_identifier, Arc::clone(&stream));
        }

        Some(stream)
    }

    pub(crate) fn get_or_create_stream(
        &mut self,
        stream_identifier: u16,
        accept: bool,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Option<Arc<Stream>> {
        if let Some(s) = self.streams.get(&stream_identifier) {
            let s = Arc::clone(s);
            if default_payload_type != PayloadProtocolIdentifier::Unknown {
                s.set_default_payload_type(default_payload_type);
            }
            return Some(s);
        }
        let s = self.create_stream(stream_identifier, accept);
        if let Some(s) = &s {
            if default_payload_type != PayloadProtocolIdentifier::Unknown {
                s.set_default_payload_type(default_payload_type);
            }
        }
        s
    }

    // SACK processing ------------------------------------------------------

    fn process_selective_ack(
        &mut self,
        sack: &ChunkSelectiveAck,
    ) -> Result<(HashMap<u16, usize>, u32)> {
        let mut bytes_acked_per_stream: HashMap<u16, usize> = HashMap::new();

        // New ack point: pop every TSN in (cumulative_tsn_ack_point,
        // cumulative_tsn_ack] from the inflight queue.
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32_lte(i, sack.cumulative_tsn_ack) {
            let Some(c) = self.inflight_queue.pop(i) else {
                return Err(Error::ErrInflightQueueTsnPop(i));
            };

            if !c.acked {
                // RFC 4960 sec 6.3.2 R3: a SACK acknowledging the earliest
                // outstanding TSN resets T3-rtx.
                if i == self.cumulative_tsn_ack_point.wrapping_add(1) {
                    if let Some(t3) = &self.t3_rtx {
                        t3.stop();
                    }
                }

                let n_bytes_acked = c.user_data.len();
                *bytes_acked_per_stream
                    .entry(c.stream_identifier)
                    .or_insert(0) += n_bytes_acked;

                // RFC 4960 sec 6.3.1 C4/C5: at most one RTT sample per round
                // trip, never from a retransmitted chunk (Karn).
                if c.n_sent == 1 && sna32_gte(c.tsn, self.min_tsn2measure_rtt) {
                    self.min_tsn2measure_rtt = self.my_next_tsn;
                    if let Some(since) = c.since {
                        let rtt = since.elapsed().as_secs_f64() * 1000.0;
                        let srtt = self.rto_mgr.set_new_rtt(rtt);
                        self.store_srtt(srtt);
                        log::trace!(
                            "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                            self.name,
                            rtt,
                            srtt,
                            self.rto_mgr.get_rto()
                        );
                    }
                }
            }

            if self.in_fast_recovery && c.tsn == self.fast_recover_exit_point {
                log::debug!("[{}] exit fast-recovery", self.name);
                self.in_fast_recovery = false;
            }

            i = i.wrapping_add(1);
        }

        let mut htna = sack.cumulative_tsn_ack;

        // Mark selectively acknowledged chunks.
        for g in &sack.gap_ack_blocks {
            for offset in g.start..=g.end {
                let tsn = sack.cumulative_tsn_ack.wrapping_add(offset as u32);
                let Some(c) = self.inflight_queue.get(tsn) else {
                    return Err(Error::ErrTsnRequestNotExist(tsn));
                };
                let (already_acked, n_sent, since, si) = (c.acked, c.n_sent, c.since, c.stream_identifier);

                if !already_acked {
                    let n_bytes_acked = self.inflight_queue.mark_as_acked(tsn);
                    *bytes_acked_per_stream.entry(si).or_insert(0) += n_bytes_acked;

                    log::trace!("[{}] tsn={} has been sacked", self.name, tsn);

                    if n_sent == 1 && sna32_gte(tsn, self.min_tsn2measure_rtt) {
                        self.min_tsn2measure_rtt = self.my_next_tsn;
                        if let Some(since) = since {
                            let rtt = since.elapsed().as_secs_f64() * 1000.0;
                            let srtt = self.rto_mgr.set_new_rtt(rtt);
                            self.store_srtt(srtt);
                            log::trace!(
                                "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                                self.name,
                                rtt,
                                srtt,
                                self.rto_mgr.get_rto()
                            );
                        }
                    }

                    if sna32_lt(htna, tsn) {
                        htna = tsn;
                    }
                }
            }
        }

        Ok((bytes_acked_per_stream, htna))
    }

    fn on_cumulative_tsn_ack_point_advanced(&mut self, total_bytes_acked: usize) {
        // RFC 4960 sec 6.3.2 R2: stop T3-rtx once everything is
        // acknowledged; otherwise restart it.
        if self.inflight_queue.is_empty() {
            log::trace!(
                "[{}] SACK: no more packet in-flight (pending={})",
                self.name,
                self.pending_queue.len()
            );
            if let Some(t3) = &self.t3_rtx {
                t3.stop();
            }
        } else {
            log::trace!("[{}] T3-rtx timer start (pt2)", self.name);
            if let Some(t3) = &self.t3_rtx {
                t3.start(self.rto_mgr.get_rto());
            }
        }

        if self.cwnd() <= self.ssthresh {
            // RFC 4960 sec 7.2.1: slow start grows cwnd only when the window
            // is being fully used, the ack advances the cumulative point and
            // we are not in fast recovery.
            if !self.in_fast_recovery && !self.pending_queue.is_empty() {
                self.set_cwnd(
                    self.cwnd() + std::cmp::min(total_bytes_acked as u32, self.cwnd()),
                );
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} acked={} (SS)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked
                );
            } else {
                log::trace!(
                    "[{}] cwnd did not grow: cwnd={} ssthresh={} acked={} FR={} pending={}",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked,
                    self.in_fast_recovery,
                    self.pending_queue.len()
                );
            }
        } else {
            // RFC 4960 sec 7.2.2: congestion avoidance.
            self.partial_bytes_acked += total_bytes_acked as u32;
            if self.partial_bytes_acked >= self.cwnd() && !self.pending_queue.is_empty() {
                self.partial_bytes_acked -= self.cwnd();
                let step = std::cmp::max(self.mtu, self.cwnd_ca_step);
                self.set_cwnd(self.cwnd() + step);
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} acked={} (CA)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked
                );
            }
        }
    }

    fn process_fast_retransmission(
        &mut self,
        cum_tsn_ack: u32,
        gap_ack_blocks: &[GapAckBlock],
        htna: u32,
        cum_tsn_ack_point_advanced: bool,
    ) -> Result<()> {
        // HTNA algorithm, RFC 4960 sec 7.2.4: increment the miss indicator
        // of chunks the SACK reported missing:
        //  a) outside fast recovery, only below the highest TSN newly acked;
        //  b) inside fast recovery with an advancing cumulative point, for
        //     every TSN reported missing.
        if !self.in_fast_recovery || cum_tsn_ack_point_advanced {
            let max_tsn = if !self.in_fast_recovery {
                htna
            } else {
                let mut max_tsn = cum_tsn_ack;
                if let Some(last) = gap_ack_blocks.last() {
                    max_tsn = max_tsn.wrapping_add(last.end as u32);
                }
                max_tsn
            };

            let mut tsn = cum_tsn_ack.wrapping_add(1);
            while sna32_lt(tsn, max_tsn) {
                let enter_fast_recovery = {
                    let Some(c) = self.inflight_queue.get_mut(tsn) else {
                        return Err(Error::ErrTsnRequestNotExist(tsn));
                    };
                    if !c.acked && !c.abandoned() && c.miss_indicator < 3 {
                        c.miss_indicator += 1;
                        c.miss_indicator == 3
                    } else {
                        false
                    }
                };
                if enter_fast_recovery && !self.in_fast_recovery {
                    // RFC 4960 sec 7.2.4 2): adjust ssthresh and cwnd as on
                    // loss detection.
                    self.in_fast_recovery = true;
                    self.fast_recover_exit_point = htna;
                    self.ssthresh = std::cmp::max(self.cwnd() / 2, 4 * self.mtu);
                    self.set_cwnd(self.ssthresh);
                    self.partial_bytes_acked = 0;
                    self.will_retransmit_fast = true;
                    log::trace!(
                        "[{}] updated cwnd={} ssthresh={} inflight={} (FR)",
                        self.name,
                        self.cwnd(),
                        self.ssthresh,
                        self.inflight_queue.get_num_bytes()
                    );
                }
                tsn = tsn.wrapping_add(1);
            }
        }

        if self.in_fast_recovery && cum_tsn_ack_point_advanced {
            self.will_retransmit_fast = true;
        }

        Ok(())
    }

    pub(crate) fn handle_sack(&mut self, sack: &ChunkSelectiveAck) -> Result<()> {
        log::trace!(
            "[{}] {}, state={}",
            self.name,
            sack,
            self.get_state()
        );

        let state = self.get_state();
        if state != AssociationState::Established
            && state != AssociationState::ShutdownPending
            && state != AssociationState::ShutdownReceived
        {
            return Ok(());
        }

        self.stats.inc_sacks_received();

        // RFC 4960 sec 6.2.1 D)i): a cumulative ack below the ack point is
        // an out-of-order SACK; drop it and change nothing.
        if sna32_gt(self.cumulative_tsn_ack_point, sack.cumulative_tsn_ack) {
            log::debug!(
                "[{}] SACK cumulative ACK {} is older than ack point {}",
                self.name,
                sack.cumulative_tsn_ack,
                self.cumulative_tsn_ack_point
            );
            return Ok(());
        }

        let (bytes_acked_per_stream, htna) = self.process_selective_ack(sack)?;

        let total_bytes_acked: usize = bytes_acked_per_stream.values().sum();

        let mut cum_tsn_ack_point_advanced = false;
        if sna32_lt(self.cumulative_tsn_ack_point, sack.cumulative_tsn_ack) {
            log::trace!(
                "[{}] SACK: cumTSN advanced: {} -> {}",
                self.name,
                self.cumulative_tsn_ack_point,
                sack.cumulative_tsn_ack
            );
            self.cumulative_tsn_ack_point = sack.cumulative_tsn_ack;
            cum_tsn_ack_point_advanced = true;
            self.on_cumulative_tsn_ack_point_advanced(total_bytes_acked);
        }

        // Streams only touch their own atomics here, so no lock juggling is
        // needed around the buffer-release callbacks.
        for (si, n_bytes_acked) in &bytes_acked_per_stream {
            if let Some(s) = self.streams.get(si) {
                s.on_buffer_released(*n_bytes_acked);
            }
        }

        // RFC 4960 sec 6.2.1 D)ii): rwnd = a_rwnd minus bytes still in
        // flight.
        let bytes_outstanding = self.inflight_queue.get_num_bytes() as u32;
        if bytes_outstanding >= sack.advertised_receiver_window_credit {
            self.set_rwnd(0);
        } else {
            self.set_rwnd(sack.advertised_receiver_window_credit - bytes_outstanding);
        }

        self.process_fast_retransmission(
            sack.cumulative_tsn_ack,
            &sack.gap_ack_blocks,
            htna,
            cum_tsn_ack_point_advanced,
        )?;

        if self.use_forward_tsn {
            // RFC 3758 sec 3.5 C1
            if sna32_lt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
                self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point;
            }
            // RFC 3758 sec 3.5 C2
            let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
            while let Some(c) = self.inflight_queue.get(i) {
                if !c.abandoned() {
                    break;
                }
                self.advanced_peer_tsn_ack_point = i;
                i = i.wrapping_add(1);
            }
            // RFC 3758 sec 3.5 C3
            if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
                self.will_send_forward_tsn = true;
            }
            self.awake_write_loop();
        }

        self.postprocess_sack(state, cum_tsn_ack_point_advanced);

        Ok(())
    }

    fn postprocess_sack(&mut self, state: AssociationState, mut should_awake_write_loop: bool) {
        if !self.inflight_queue.is_empty() {
            // Start the timer (a no-op when already running).
            log::trace!("[{}] T3-rtx timer start (pt3)", self.name);
            if let Some(t3) = &self.t3_rtx {
                t3.start(self.rto_mgr.get_rto());
            }
        } else if state == AssociationState::ShutdownPending {
            // No more outstanding, send shutdown.
            should_awake_write_loop = true;
            self.will_send_shutdown = true;
            self.set_state(AssociationState::ShutdownSent);
        } else if state == AssociationState::ShutdownReceived {
            // No more outstanding, send shutdown ack.
            should_awake_write_loop = true;
            self.will_send_shutdown_ack = true;
            self.set_state(AssociationState::ShutdownAckSent);
        }

        if should_awake_write_loop {
            self.awake_write_loop();
        }
    }

    // Shutdown / abort -----------------------------------------------------

    pub(crate) fn handle_shutdown(&mut self, _: &ChunkShutdown) {
        let state = self.get_state();
        match state {
            AssociationState::Established => {
                if !self.inflight_queue.is_empty() {
                    self.set_state(AssociationState::ShutdownReceived);
                } else {
                    // No more outstanding, send shutdown ack.
                    self.will_send_shutdown_ack = true;
                    self.set_state(AssociationState::ShutdownAckSent);
                    self.awake_write_loop();
                }
            }
            AssociationState::ShutdownSent => {
                self.will_send_shutdown_ack = true;
                self.set_state(AssociationState::ShutdownAckSent);
                self.awake_write_loop();
            }
            _ => {}
        }
    }

    pub(crate) fn handle_shutdown_ack(&mut self, _: &ChunkShutdownAck) {
        let state = self.get_state();
        if state == AssociationState::ShutdownSent || state == AssociationState::ShutdownAckSent {
            if let Some(t2) = &self.t2_shutdown {
                t2.stop();
            }
            self.will_send_shutdown_complete = true;
            self.awake_write_loop();
        }
    }

    pub(crate) async fn handle_shutdown_complete(&mut self, _: &ChunkShutdownComplete) -> Result<()> {
        if self.get_state() == AssociationState::ShutdownAckSent {
            if let Some(t2) = &self.t2_shutdown {
                t2.stop();
            }
            self.close().await?;
        }
        Ok(())
    }

    async fn handle_abort(&mut self, c: &ChunkAbort) -> Result<Vec<Packet>> {
        let mut err_str = String::new();
        for cause in &c.error_causes {
            err_str += &format!("({cause})");
        }
        let err = Error::ErrAbortChunk(err_str);
        self.close_err = Some(err.clone());
        let _ = self.close().await;
        Err(err)
    }

    // Reconfig -------------------------------------------------------------

    pub(crate) fn handle_reconfig(&mut self, c: &ChunkReconfig) -> Result<Vec<Packet>> {
        log::trace!("[{}] {}", self.name, c);

        let mut pp = vec![];
        if let Some(param_a) = &c.param_a {
            if let Some(p) = self.handle_reconfig_param(param_a)? {
                pp.push(p);
            }
        }
        if let Some(param_b) = &c.param_b {
            if let Some(p) = self.handle_reconfig_param(param_b)? {
                pp.push(p);
            }
        }
        Ok(pp)
    }

    pub(crate) fn handle_reconfig_param(&mut self, param: &Param) -> Result<Option<Packet>> {
        match param {
            Param::OutgoingResetRequest(req) => {
                if sna32_lt(self.peer_last_tsn(), req.sender_last_tsn)
                    && self.reconfig_requests.len() >= MAX_RECONFIG_REQUESTS
                {
                    // RFC 6525 sec 5.1.1 allows at most one request in
                    // flight; a well-behaved peer never gets here. Drop the
                    // request without replying and let it retransmit.
                    return Err(Error::ErrTooManyReconfigRequests);
                }
                self.reconfig_requests
                    .insert(req.reconfig_request_sequence_number, req.clone());
                Ok(Some(self.reset_streams_if_any(req)))
            }
            Param::ReconfigResponse(resp) => {
                if resp.result == ReconfigResult::InProgress {
                    // RFC 6525 sec 5.2.7: restart the timer for this RSN.
                    if self
                        .reconfigs
                        .contains_key(&resp.reconfig_response_sequence_number)
                    {
                        if let Some(t) = &self.t_reconfig {
                            t.stop();
                            t.start(self.rto_mgr.get_rto());
                        }
                    }
                    return Ok(None);
                }
                self.reconfigs
                    .remove(&resp.reconfig_response_sequence_number);
                if self.reconfigs.is_empty() {
                    if let Some(t) = &self.t_reconfig {
                        t.stop();
                    }
                }
                Ok(None)
            }
            _ => Err(Error::ErrParameterType),
        }
    }

    pub(crate) fn reset_streams_if_any(&mut self, req: &ParamOutgoingResetRequest) -> Packet {
        let mut result = ReconfigResult::SuccessPerformed;
        if sna32_lte(req.sender_last_tsn, self.peer_last_tsn()) {
            log::debug!(
                "[{}] resetting streams: senderLastTSN={} <= peerLastTSN={}",
                self.name,
                req.sender_last_tsn,
                self.peer_last_tsn()
            );
            for id in &req.stream_identifiers {
                let Some(s) = self.streams.get(id) else {
                    continue;
                };
                s.on_inbound_stream_reset();
                log::debug!("[{}] deleting stream {}", self.name, id);
                self.streams.remove(id);
            }
            self.reconfig_requests
                .remove(&req.reconfig_request_sequence_number);
        } else {
            log::debug!(
                "[{}] reset deferred: senderLastTSN={} > peerLastTSN={}",
                self.name,
                req.sender_last_tsn,
                self.peer_last_tsn()
            );
            result = ReconfigResult::InProgress;
        }

        self.create_packet(vec![Chunk::Reconfig(ChunkReconfig {
            param_a: Some(Param::ReconfigResponse(ParamReconfigResponse {
                reconfig_response_sequence_number: req.reconfig_request_sequence_number,
                result,
            })),
            param_b: None,
        })])
    }

    // Forward-TSN ----------------------------------------------------------

    pub(crate) fn handle_forward_tsn(&mut self, c: &ChunkForwardTsn) -> Vec<Packet> {
        log::trace!("[{}] {}", self.name, c);

        if !self.use_forward_tsn {
            log::warn!("[{}] received FwdTSN but not enabled", self.name);
            // Report the chunk as unrecognized.
            let cerr = ChunkError {
                error_causes: vec![ErrorCause::unrecognized_chunk_type()],
            };
            return vec![self.create_packet(vec![Chunk::Error(cerr)])];
        }

        // RFC 3758 sec 3.6: a stale FORWARD TSN still earns a SACK, since
        // the duplicate may mean our previous SACK was lost.
        if sna32_lte(c.new_cumulative_tsn, self.peer_last_tsn()) {
            log::trace!("[{}] sending ack on Forward TSN", self.name);
            self.ack_state = AckState::Immediate;
            if let Some(t) = &self.ack_timer {
                t.stop();
            }
            self.awake_write_loop();
            return vec![];
        }

        // Advance the cumulative TSN point to the chunk's value, popping
        // through missing TSNs.
        while sna32_lt(self.peer_last_tsn(), c.new_cumulative_tsn) {
            self.payload_queue.pop(true);
        }

        // Report the abandoned largest ordered SSN to the listed streams so
        // the reassembly queues can drop partial messages.
        for forwarded in &c.streams {
            if let Some(s) = self.streams.get(&forwarded.identifier) {
                s.handle_forward_tsn_for_ordered(forwarded.sequence);
            }
        }

        // The chunk does not say which streams it skipped for unordered
        // chunks, so every stream hears about the new cumulative TSN.
        for s in self.streams.values() {
            s.handle_forward_tsn_for_unordered(c.new_cumulative_tsn);
        }

        self.handle_peer_last_tsn_and_acknowledgement(false)
    }

    /// RFC 3758 sec 3.5 C4: one entry per stream with the highest abandoned
    /// ordered SSN in the advanced range.
    pub(crate) fn create_forward_tsn(&self) -> ChunkForwardTsn {
        let mut stream_map: HashMap<u16, u16> = HashMap::new();
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32_lte(i, self.advanced_peer_tsn_ack_point) {
            let Some(c) = self.inflight_queue.get(i) else {
                break;
            };
            match stream_map.get(&c.stream_identifier) {
                Some(ssn) if !sna16_lt(*ssn, c.stream_sequence_number) => {}
                _ => {
                    stream_map.insert(c.stream_identifier, c.stream_sequence_number);
                }
            }
            i = i.wrapping_add(1);
        }

        let mut fwd_tsn = ChunkForwardTsn {
            new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
            streams: vec![],
        };
        for (si, ssn) in stream_map {
            fwd_tsn.streams.push(ChunkForwardTsnStream {
                identifier: si,
                sequence: ssn,
            });
        }
        log::trace!(
            "[{}] building fwd-tsn: newCumulativeTSN={} cumTSN={}",
            self.name,
            fwd_tsn.new_cumulative_tsn,
            self.cumulative_tsn_ack_point
        );
        fwd_tsn
    }

    // Outbound path --------------------------------------------------------

    fn move_pending_data_chunk_to_inflight_queue(
        &mut self,
        mut c: ChunkPayloadData,
    ) -> ChunkPayloadData {
        // Once the ending fragment leaves the pending queue the whole
        // message is in flight and may be abandoned.
        if c.ending_fragment {
            c.set_all_inflight();
        }

        c.tsn = self.generate_next_tsn();
        // Used for RTT measurement and to timeout PR-SCTP lifetimes.
        c.since = Some(Instant::now());
        c.n_sent = 1;

        self.check_partial_reliability_status(&c);

        log::trace!(
            "[{}] sending ppi={} tsn={} ssn={} sent={} len={} ({},{})",
            self.name,
            c.payload_type,
            c.tsn,
            c.stream_sequence_number,
            c.n_sent,
            c.user_data.len(),
            c.beginning_fragment,
            c.ending_fragment
        );

        self.inflight_queue.push_no_check(c.clone());
        c
    }

    /// Pops pending chunks to send as far as cwnd and rwnd allow, gathering
    /// stream ids of end-of-stream sentinels along the way.
    pub(crate) fn pop_pending_data_chunks_to_send(&mut self) -> (Vec<ChunkPayloadData>, Vec<u16>) {
        let mut chunks = vec![];
        let mut sis_to_reset = vec![];

        if !self.pending_queue.is_empty() {
            // RFC 4960 sec 6.1 A): no new data when the peer's rwnd
            // indicates no buffer space. (A zero-window probe is the
            // exception, below.)
            loop {
                let Some(c) = self.pending_queue.peek() else {
                    break; // no more pending data
                };

                let data_len = c.user_data.len();
                if data_len == 0 {
                    // End-of-stream sentinel: collect its stream id for an
                    // outgoing reset.
                    sis_to_reset.push(c.stream_identifier);
                    if self
                        .pending_queue
                        .pop(c.beginning_fragment, c.unordered)
                        .is_none()
                    {
                        log::error!("[{}] failed to pop from pending queue", self.name);
                        break;
                    }
                    continue;
                }

                if self.inflight_queue.get_num_bytes() + data_len > self.cwnd() as usize {
                    break; // would exceed cwnd
                }
                if data_len > self.rwnd() as usize {
                    break; // no more rwnd
                }

                self.set_rwnd(self.rwnd() - data_len as u32);

                let Some(popped) = self.pending_queue.pop(c.beginning_fragment, c.unordered)
                else {
                    log::error!("[{}] failed to pop from pending queue", self.name);
                    break;
                };
                let popped = self.move_pending_data_chunk_to_inflight_queue(popped);
                chunks.push(popped);
            }

            // The sender can always have one DATA chunk in flight.
            if chunks.is_empty() && self.inflight_queue.is_empty() {
                // Send a zero-window probe.
                if let Some(c) = self.pending_queue.peek() {
                    if let Some(popped) =
                        self.pending_queue.pop(c.beginning_fragment, c.unordered)
                    {
                        let popped = self.move_pending_data_chunk_to_inflight_queue(popped);
                        chunks.push(popped);
                    }
                }
            }

            if self.block_write && !chunks.is_empty() && self.pending_queue.is_empty() {
                log::trace!(
                    "[{}] all pending data have been sent, notify writable",
                    self.name
                );
                self.notify_block_writable();
            }
        }

        (chunks, sis_to_reset)
    }

    /// Marks a chunk abandoned once its stream's reliability budget is
    /// spent. DCEP messages are exempt.
    fn check_partial_reliability_status(&self, c: &ChunkPayloadData) {
        if !self.use_forward_tsn || c.payload_type == PayloadProtocolIdentifier::Dcep {
            return;
        }

        if let Some(s) = self.streams.get(&c.stream_identifier) {
            match s.reliability_type() {
                crate::stream::ReliabilityType::Rexmit => {
                    if c.n_sent >= s.reliability_value() {
                        c.set_abandoned(true);
                        log::trace!(
                            "[{}] marked as abandoned: tsn={} ppi={} (rexmit: {})",
                            self.name,
                            c.tsn,
                            c.payload_type,
                            c.n_sent
                        );
                    }
                }
                crate::stream::ReliabilityType::Timed => {
                    if let Some(since) = c.since {
                        let elapsed = since.elapsed().as_millis() as u64;
                        if elapsed >= s.reliability_value() as u64 {
                            c.set_abandoned(true);
                            log::trace!(
                                "[{}] marked as abandoned: tsn={} ppi={} (timed: {})",
                                self.name,
                                c.tsn,
                                c.payload_type,
                                elapsed
                            );
                        }
                    }
                }
                crate::stream::ReliabilityType::Reliable => {}
            }
        } else {
            // Remote has reset its side of the stream; data can still flow.
            log::trace!(
                "[{}] stream {} not found, remote reset",
                self.name,
                c.stream_identifier
            );
        }
    }

    /// Bundles DATA chunks into packets up to the path MTU.
    fn bundle_data_chunks_into_packets(&self, chunks: Vec<ChunkPayloadData>) -> Vec<Packet> {
        let mut packets = vec![];
        let mut chunks_to_send = vec![];
        let mut bytes_in_packet = COMMON_HEADER_SIZE as usize;

        for c in chunks {
            // RFC 4960 sec 6.1: bundle as long as the resulting packet does
            // not exceed the path MTU.
            let chunk_size_in_packet = DATA_CHUNK_HEADER_SIZE as usize + c.user_data.len();
            let chunk_size_in_packet =
                chunk_size_in_packet + crate::util::get_padding(chunk_size_in_packet);
            if bytes_in_packet + chunk_size_in_packet > self.mtu as usize {
                packets.push(self.create_packet(std::mem::take(&mut chunks_to_send)));
                bytes_in_packet = COMMON_HEADER_SIZE as usize;
            }
            chunks_to_send.push(Chunk::PayloadData(c));
            bytes_in_packet += chunk_size_in_packet;
        }

        if !chunks_to_send.is_empty() {
            packets.push(self.create_packet(chunks_to_send));
        }
        packets
    }

    /// Selects marked chunks for retransmission after a T3-rtx expiry, up to
    /// `min(cwnd, rwnd)`. The first chunk is always included even when rwnd
    /// cannot hold it (zero-window probe).
    pub(crate) fn get_data_packets_to_retransmit(&mut self) -> Vec<Packet> {
        let awnd = std::cmp::min(self.cwnd(), self.rwnd()) as usize;
        let rwnd = self.rwnd() as usize;
        let mut chunks = vec![];
        let mut bytes_to_send = 0usize;
        let mut done = false;

        let mut i = 0u32;
        while !done {
            let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
            i += 1;
            let c = {
                let Some(c) = self.inflight_queue.get_mut(tsn) else {
                    break; // end of outstanding data
                };
                if !c.retransmit {
                    continue;
                }
                if i == 1 && rwnd < c.user_data.len() {
                    // Send it as a zero window probe.
                    done = true;
                } else if bytes_to_send + c.user_data.len() > awnd {
                    break;
                }

                // Clear the flag so the chunk is not retransmitted again
                // before the next T3-rtx expiry.
                c.retransmit = false;
                bytes_to_send += c.user_data.len();
                c.n_sent += 1;
                c.clone()
            };

            self.check_partial_reliability_status(&c);

            log::trace!(
                "[{}] retransmitting tsn={} ssn={} sent={}",
                self.name,
                c.tsn,
                c.stream_sequence_number,
                c.n_sent
            );
            chunks.push(c);
        }

        self.bundle_data_chunks_into_packets(chunks)
    }

    pub(crate) fn create_selective_ack_chunk(&mut self) -> ChunkSelectiveAck {
        ChunkSelectiveAck {
            cumulative_tsn_ack: self.peer_last_tsn(),
            advertised_receiver_window_credit: self.get_my_receiver_window_credit(),
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        }
    }

    fn gather_data_packets_to_retransmit(&mut self, raw_packets: &mut Vec<Bytes>) {
        for p in self.get_data_packets_to_retransmit() {
            match self.marshal_packet(&p) {
                Ok(raw) => raw_packets.push(raw),
                Err(_) => log::warn!(
                    "[{}] failed to serialize a DATA packet to be retransmitted",
                    self.name
                ),
            }
        }
    }

    fn gather_outbound_data_and_reconfig_packets(&mut self, raw_packets: &mut Vec<Bytes>) {
        // Pop unsent chunks from the pending queue as far as cwnd and rwnd
        // allow.
        let (chunks, sis_to_reset) = self.pop_pending_data_chunks_to_send();
        if !chunks.is_empty() {
            // Start the T3-rtx timer (a no-op when already running).
            log::trace!("[{}] T3-rtx timer start (pt1)", self.name);
            if let Some(t3) = &self.t3_rtx {
                t3.start(self.rto_mgr.get_rto());
            }
            for p in self.bundle_data_chunks_into_packets(chunks) {
                match self.marshal_packet(&p) {
                    Ok(raw) => raw_packets.push(raw),
                    Err(_) => log::warn!("[{}] failed to serialize a DATA packet", self.name),
                }
            }
        }

        if !sis_to_reset.is_empty() || self.will_retransmit_reconfig {
            if self.will_retransmit_reconfig {
                self.will_retransmit_reconfig = false;
                log::debug!(
                    "[{}] retransmit {} RECONFIG chunk(s)",
                    self.name,
                    self.reconfigs.len()
                );
                let reconfigs: Vec<ChunkReconfig> = self.reconfigs.values().cloned().collect();
                for c in reconfigs {
                    let p = self.create_packet(vec![Chunk::Reconfig(c)]);
                    match self.marshal_packet(&p) {
                        Ok(raw) => raw_packets.push(raw),
                        Err(_) => log::warn!(
                            "[{}] failed to serialize a RECONFIG packet to be retransmitted",
                            self.name
                        ),
                    }
                }
            }

            if !sis_to_reset.is_empty() {
                let rsn = self.generate_next_rsn();
                let tsn = self.my_next_tsn.wrapping_sub(1);
                log::debug!(
                    "[{}] sending RECONFIG: rsn={} tsn={} streams={:?}",
                    self.name,
                    rsn,
                    tsn,
                    sis_to_reset
                );
                let c = ChunkReconfig {
                    param_a: Some(Param::OutgoingResetRequest(ParamOutgoingResetRequest {
                        reconfig_request_sequence_number: rsn,
                        reconfig_response_sequence_number: 0,
                        sender_last_tsn: tsn,
                        stream_identifiers: sis_to_reset,
                    })),
                    param_b: None,
                };
                // Keep it for retransmission until acknowledged.
                self.reconfigs.insert(rsn, c.clone());
                let p = self.create_packet(vec![Chunk::Reconfig(c)]);
                match self.marshal_packet(&p) {
                    Ok(raw) => raw_packets.push(raw),
                    Err(_) => log::warn!(
                        "[{}] failed to serialize a RECONFIG packet to be transmitted",
                        self.name
                    ),
                }
            }

            if !self.reconfigs.is_empty() {
                if let Some(t) = &self.t_reconfig {
                    t.start(self.rto_mgr.get_rto());
                }
            }
        }
    }

    fn gather_outbound_fast_retransmission_packets(&mut self, raw_packets: &mut Vec<Bytes>) {
        if !self.will_retransmit_fast {
            return;
        }
        self.will_retransmit_fast = false;

        let fast_retrans_wnd = std::cmp::max(self.mtu, self.fast_rtx_wnd);
        let mut fast_retrans_size = COMMON_HEADER_SIZE;
        let mut to_fast_retrans = vec![];

        let mut i = 0u32;
        loop {
            let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
            i += 1;
            let c = {
                let Some(c) = self.inflight_queue.get_mut(tsn) else {
                    break; // end of outstanding data
                };
                if c.acked || c.abandoned() {
                    continue;
                }
                if c.n_sent > 1 || c.miss_indicator < 3 {
                    continue;
                }

                // RFC 4960 sec 7.2.4 3): retransmit as many of the earliest
                // marked DATA chunks as fit a single packet, ignoring cwnd
                // and without delay.
                let data_chunk_size = DATA_CHUNK_HEADER_SIZE + c.user_data.len() as u32;
                if fast_retrans_wnd < fast_retrans_size + data_chunk_size {
                    break;
                }
                fast_retrans_size += data_chunk_size;
                c.n_sent += 1;
                c.clone()
            };

            self.stats.inc_fast_retrans();
            self.check_partial_reliability_status(&c);
            log::trace!(
                "[{}] fast-retransmit: tsn={} sent={} htna={}",
                self.name,
                c.tsn,
                c.n_sent,
                self.fast_recover_exit_point
            );
            to_fast_retrans.push(c);
        }

        if !to_fast_retrans.is_empty() {
            for p in self.bundle_data_chunks_into_packets(to_fast_retrans) {
                match self.marshal_packet(&p) {
                    Ok(raw) => raw_packets.push(raw),
                    Err(_) => log::warn!(
                        "[{}] failed to serialize a DATA packet to be fast-retransmitted",
                        self.name
                    ),
                }
            }
        }
    }

    fn gather_outbound_sack_packets(&mut self, raw_packets: &mut Vec<Bytes>) {
        if self.ack_state != AckState::Immediate {
            return;
        }
        self.ack_state = AckState::Idle;
        let sack = self.create_selective_ack_chunk();
        self.stats.inc_sacks_sent();
        log::debug!("[{}] sending {}", self.name, sack);
        let p = self.create_packet(vec![Chunk::Sack(sack)]);
        match self.marshal_packet(&p) {
            Ok(raw) => raw_packets.push(raw),
            Err(_) => log::warn!("[{}] failed to serialize a SACK packet", self.name),
        }
    }

    fn gather_outbound_forward_tsn_packets(&mut self, raw_packets: &mut Vec<Bytes>) {
        if !self.will_send_forward_tsn {
            return;
        }
        self.will_send_forward_tsn = false;
        if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            let fwd_tsn = self.create_forward_tsn();
            let p = self.create_packet(vec![Chunk::ForwardTsn(fwd_tsn)]);
            match self.marshal_packet(&p) {
                Ok(raw) => raw_packets.push(raw),
                Err(_) => log::warn!("[{}] failed to serialize a Forward TSN packet", self.name),
            }
        }
    }

    fn gather_outbound_shutdown_packets(&mut self, raw_packets: &mut Vec<Bytes>) -> bool {
        let mut ok = true;
        if self.will_send_shutdown {
            self.will_send_shutdown = false;
            let shutdown = ChunkShutdown {
                cumulative_tsn_ack: self.cumulative_tsn_ack_point,
            };
            let p = self.create_packet(vec![Chunk::Shutdown(shutdown)]);
            match self.marshal_packet(&p) {
                Ok(raw) => {
                    if let Some(t2) = &self.t2_shutdown {
                        t2.start(self.rto_mgr.get_rto());
                    }
                    raw_packets.push(raw);
                }
                Err(_) => log::warn!("[{}] failed to serialize a Shutdown packet", self.name),
            }
        } else if self.will_send_shutdown_ack {
            self.will_send_shutdown_ack = false;
            let p = self.create_packet(vec![Chunk::ShutdownAck(ChunkShutdownAck)]);
            match self.marshal_packet(&p) {
                Ok(raw) => {
                    if let Some(t2) = &self.t2_shutdown {
                        t2.start(self.rto_mgr.get_rto());
                    }
                    raw_packets.push(raw);
                }
                Err(_) => log::warn!("[{}] failed to serialize a ShutdownAck packet", self.name),
            }
        } else if self.will_send_shutdown_complete {
            self.will_send_shutdown_complete = false;
            let p = self.create_packet(vec![Chunk::ShutdownComplete(ChunkShutdownComplete)]);
            match self.marshal_packet(&p) {
                Ok(raw) => {
                    raw_packets.push(raw);
                    // Final packet of the association.
                    ok = false;
                }
                Err(_) => log::warn!(
                    "[{}] failed to serialize a ShutdownComplete packet",
                    self.name
                ),
            }
        }
        ok
    }

    fn gather_abort_packet(&mut self) -> Result<Bytes> {
        let cause = self.will_send_abort_cause.take();
        self.will_send_abort = false;

        let mut abort = ChunkAbort::default();
        if let Some(cause) = cause {
            abort.error_causes.push(cause);
        }
        let p = self.create_packet(vec![Chunk::Abort(abort)]);
        self.marshal_packet(&p)
    }

    /// Gathers outgoing packets for one write-loop pass. A `false` second
    /// value tells the write loop to close the association after the final
    /// send.
    pub(crate) fn gather_outbound(&mut self) -> (Vec<Bytes>, bool) {
        if self.will_send_abort {
            return match self.gather_abort_packet() {
                Ok(pkt) => (vec![pkt], false),
                Err(_) => {
                    log::warn!("[{}] failed to serialize an abort packet", self.name);
                    (vec![], false)
                }
            };
        }

        let mut raw_packets = vec![];

        if !self.control_queue.is_empty() {
            let packets: Vec<Packet> = self.control_queue.drain(..).collect();
            for p in packets {
                match self.marshal_packet(&p) {
                    Ok(raw) => raw_packets.push(raw),
                    Err(_) => log::warn!("[{}] failed to serialize a control packet", self.name),
                }
            }
        }

        let mut ok = true;
        match self.get_state() {
            AssociationState::Established => {
                self.gather_data_packets_to_retransmit(&mut raw_packets);
                self.gather_outbound_data_and_reconfig_packets(&mut raw_packets);
                self.gather_outbound_fast_retransmission_packets(&mut raw_packets);
                self.gather_outbound_sack_packets(&mut raw_packets);
                self.gather_outbound_forward_tsn_packets(&mut raw_packets);
            }
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {
                self.gather_data_packets_to_retransmit(&mut raw_packets);
                self.gather_outbound_fast_retransmission_packets(&mut raw_packets);
                self.gather_outbound_sack_packets(&mut raw_packets);
                ok = self.gather_outbound_shutdown_packets(&mut raw_packets);
            }
            AssociationState::ShutdownAckSent => {
                ok = self.gather_outbound_shutdown_packets(&mut raw_packets);
            }
            _ => {}
        }

        (raw_packets, ok)
    }
}

fn chunk_mandatory_checksum(chunks: &[Chunk]) -> bool {
    chunks
        .iter()
        .any(|c| matches!(c, Chunk::Init(_) | Chunk::CookieEcho(_)))
}

#[async_trait]
impl RtxTimerObserver for AssociationInternal {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize) {
        // The TSN has not moved in several attempts: speculatively toggle
        // zero checksum, as a workaround for peers with a broken
        // zero-checksum implementation.
        if self.zero_checksum_rtx_toggle
            && self.cumulative_tsn_ack_point.wrapping_add(1) == self.initial_tsn
            && n_rtos % 3 == 0
        {
            self.send_zero_checksum = !self.send_zero_checksum;
        }

        match id {
            RtxTimerId::T1Init => {
                if let Err(err) = self.send_init() {
                    log::debug!(
                        "[{}] failed to retransmit init (nRtos={}): {}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }
            RtxTimerId::T1Cookie => {
                if let Err(err) = self.send_cookie_echo() {
                    log::debug!(
                        "[{}] failed to retransmit cookie-echo (nRtos={}): {}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }
            RtxTimerId::T2Shutdown => {
                log::debug!(
                    "[{}] retransmission of shutdown timeout (nRtos={})",
                    self.name,
                    n_rtos
                );
                match self.get_state() {
                    AssociationState::ShutdownSent => {
                        self.will_send_shutdown = true;
                        self.awake_write_loop();
                    }
                    AssociationState::ShutdownAckSent => {
                        self.will_send_shutdown_ack = true;
                        self.awake_write_loop();
                    }
                    _ => {}
                }
            }
            RtxTimerId::T3Rtx => {
                self.stats.inc_t3timeouts();

                // RFC 4960 sec 6.3.3 E1 / sec 7.2.3: on T3-rtx expiry,
                // ssthresh = max(cwnd/2, 4*MTU) and cwnd = 1*MTU.
                self.ssthresh = std::cmp::max(self.cwnd() / 2, 4 * self.mtu);
                self.set_cwnd(self.mtu);
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} inflight={} (RTO)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    self.inflight_queue.get_num_bytes()
                );

                // RFC 3758 sec 3.5 A5: try to advance the advanced peer ack
                // point per C2 - C5.
                if self.use_forward_tsn {
                    let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
                    while let Some(c) = self.inflight_queue.get(i) {
                        if !c.abandoned() {
                            break;
                        }
                        self.advanced_peer_tsn_ack_point = i;
                        i = i.wrapping_add(1);
                    }
                    if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
                        self.will_send_forward_tsn = true;
                    }
                }

                log::debug!(
                    "[{}] T3-rtx timed out: nRtos={} cwnd={} ssthresh={}",
                    self.name,
                    n_rtos,
                    self.cwnd(),
                    self.ssthresh
                );

                self.inflight_queue.mark_all_to_retransmit();
                self.awake_write_loop();
            }
            RtxTimerId::Reconfig => {
                self.will_retransmit_reconfig = true;
                self.awake_write_loop();
            }
        }
    }

    async fn on_retransmission_failure(&mut self, id: RtxTimerId) {
        match id {
            RtxTimerId::T1Init => {
                log::error!("[{}] retransmission failure: T1-init", self.name);
                self.complete_handshake(Some(Error::ErrHandshakeInitAck));
            }
            RtxTimerId::T1Cookie => {
                log::error!("[{}] retransmission failure: T1-cookie", self.name);
                self.complete_handshake(Some(Error::ErrHandshakeCookieEcho));
            }
            RtxTimerId::T2Shutdown => {
                log::error!("[{}] retransmission failure: T2-shutdown", self.name);
            }
            RtxTimerId::T3Rtx => {
                // T3-rtx does not fail by design: connectivity loss shows up
                // at the transport below (ICE) first.
                log::error!("[{}] retransmission failure: T3-rtx (DATA)", self.name);
            }
            RtxTimerId::Reconfig => {}
        }
    }
}

#[async_trait]
impl AckTimerObserver for AssociationInternal {
    async fn on_ack_timeout(&mut self) {
        log::trace!("[{}] ack timed out (ackState: {})", self.name, self.ack_state);
        self.stats.inc_ack_timeouts();
        self.ack_state = AckState::Immediate;
        self.awake_write_loop();
    }
}
