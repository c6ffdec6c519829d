use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::time::timeout;

use super::association_internal::AssociationInternal;
use super::*;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::chunk::chunk_selective_ack::{ChunkSelectiveAck, GapAckBlock};
use crate::chunk::Chunk;
use crate::error_cause::UNRECOGNIZED_CHUNK_TYPE;
use crate::packet::Packet;
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::ReconfigResult;
use crate::param::param_state_cookie::ParamStateCookie;
use crate::param::Param;
use crate::stream::ReliabilityType;
use crate::timer::rtx_timer::{RtxTimerId, RtxTimerObserver};

// An in-memory packet pipe standing in for the DTLS transport.
struct PipeConn {
    tx: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: TokioMutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl crate::PacketConn for PipeConn {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(pkt) => {
                let n = pkt.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed")),
        }
    }

    async fn send(&self, b: &[u8]) -> io::Result<usize> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(b.to_vec())
                .await
                .map(|_| b.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

fn pipe() -> (Arc<PipeConn>, Arc<PipeConn>) {
    let (tx_a, rx_b) = mpsc::channel(64);
    let (tx_b, rx_a) = mpsc::channel(64);
    (
        Arc::new(PipeConn {
            tx: std::sync::Mutex::new(Some(tx_a)),
            rx: TokioMutex::new(rx_a),
        }),
        Arc::new(PipeConn {
            tx: std::sync::Mutex::new(Some(tx_b)),
            rx: TokioMutex::new(rx_b),
        }),
    )
}

struct InternalHarness {
    ai: AssociationInternal,
    accept_rx: mpsc::Receiver<Arc<crate::Stream>>,
    handshake_rx: mpsc::Receiver<Option<Error>>,
    _awake_rx: mpsc::Receiver<()>,
}

fn make_internal(name: &str) -> InternalHarness {
    let (conn, _peer) = pipe();
    let mut config = Config::new(conn);
    config.name = name.to_owned();
    config.seed = Some(42);

    let (awake_tx, awake_rx) = mpsc::channel(1);
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CH_SIZE);
    let (handshake_tx, handshake_rx) = mpsc::channel(1);
    let (close_tx, _close_rx) = broadcast::channel(1);

    let ai = AssociationInternal::new(
        &config,
        Arc::new(awake_tx),
        accept_tx,
        handshake_tx,
        close_tx,
    );
    InternalHarness {
        ai,
        accept_rx,
        handshake_rx,
        _awake_rx: awake_rx,
    }
}

fn inflight_chunk(tsn: u32, si: u16, len: usize) -> ChunkPayloadData {
    ChunkPayloadData {
        tsn,
        stream_identifier: si,
        beginning_fragment: true,
        ending_fragment: true,
        payload_type: PayloadProtocolIdentifier::Binary,
        user_data: Bytes::from(vec![0u8; len]),
        n_sent: 1,
        since: Some(std::time::Instant::now()),
        ..Default::default()
    }
}

fn data_chunk(tsn: u32, si: u16, payload: &'static [u8]) -> ChunkPayloadData {
    ChunkPayloadData {
        tsn,
        stream_identifier: si,
        beginning_fragment: true,
        ending_fragment: true,
        payload_type: PayloadProtocolIdentifier::Binary,
        user_data: Bytes::from_static(payload),
        ..Default::default()
    }
}

fn sack(cumulative_tsn_ack: u32, a_rwnd: u32, gaps: Vec<GapAckBlock>) -> ChunkSelectiveAck {
    ChunkSelectiveAck {
        cumulative_tsn_ack,
        advertised_receiver_window_credit: a_rwnd,
        gap_ack_blocks: gaps,
        duplicate_tsn: vec![],
    }
}

fn unmarshal_chunks(raw: &Bytes) -> Vec<Chunk> {
    Packet::unmarshal(true, raw).unwrap().chunks
}

// Handshake handlers ------------------------------------------------------

#[test]
fn test_handle_init_responds_with_init_ack_and_cookie() {
    let mut h = make_internal("server");
    let mut init = ChunkInit {
        initiate_tag: 0x1234_5678,
        advertised_receiver_window_credit: 512 * 1024,
        num_outbound_streams: 10,
        num_inbound_streams: 10,
        initial_tsn: 5000,
        params: vec![],
    };
    init.set_supported_extensions();
    let pkt = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };

    let replies = h.ai.handle_init(&pkt, &init).unwrap();
    assert_eq!(replies.len(), 1);

    assert_eq!(h.ai.peer_verification_tag, 0x1234_5678);
    assert_eq!(h.ai.rwnd(), 512 * 1024);
    assert!(h.ai.use_forward_tsn);
    assert_eq!(h.ai.payload_queue.get_cumulative_tsn(), 4999);

    let reply = &replies[0];
    assert_eq!(reply.verification_tag, 0x1234_5678);
    match &reply.chunks[0] {
        Chunk::InitAck(ia) => {
            assert_eq!(ia.initiate_tag, h.ai.my_verification_tag);
            assert!(ia
                .params
                .iter()
                .any(|p| matches!(p, Param::StateCookie(_))));
            assert!(ia
                .params
                .iter()
                .any(|p| matches!(p, Param::SupportedExtensions(_))));
        }
        other => panic!("expected INIT-ACK, got {other}"),
    }
}

#[test]
fn test_handle_init_rejected_in_established() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    let init = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 1,
        params: vec![],
    };
    let pkt = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };
    assert_eq!(
        h.ai.handle_init(&pkt, &init).unwrap_err(),
        Error::ErrHandleInitState
    );
}

#[test]
fn test_client_handshake_state_transitions() {
    let mut h = make_internal("client");
    h.ai.init_client().unwrap();
    assert_eq!(h.ai.get_state(), AssociationState::CookieWait);

    // The INIT rides in a dedicated packet with a zero verification tag.
    let (raw_packets, ok) = h.ai.gather_outbound();
    assert!(ok);
    assert_eq!(raw_packets.len(), 1);
    let init_packet = Packet::unmarshal(true, &raw_packets[0]).unwrap();
    assert_eq!(init_packet.verification_tag, 0);
    assert!(matches!(init_packet.chunks[0], Chunk::Init(_)));

    // Peer responds with an INIT-ACK carrying a cookie.
    let mut rng = rand::rngs::mock::StepRng::new(3, 5);
    let cookie = ParamStateCookie::new(&mut rng);
    let mut init_ack = ChunkInit {
        initiate_tag: 0xabcd,
        advertised_receiver_window_credit: 1024 * 1024,
        num_outbound_streams: 100,
        num_inbound_streams: 100,
        initial_tsn: 7777,
        params: vec![Param::StateCookie(cookie.clone())],
    };
    init_ack.set_supported_extensions();
    let pkt = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: h.ai.my_verification_tag,
        chunks: vec![],
    };
    h.ai.handle_init_ack(&pkt, &init_ack).unwrap();

    assert_eq!(h.ai.get_state(), AssociationState::CookieEchoed);
    assert_eq!(h.ai.peer_verification_tag, 0xabcd);
    assert_eq!(h.ai.rwnd(), 1024 * 1024);
    assert_eq!(h.ai.ssthresh, 1024 * 1024);
    assert!(h.ai.use_forward_tsn);
    assert_eq!(h.ai.payload_queue.get_cumulative_tsn(), 7776);

    // The COOKIE-ECHO is queued for transmission.
    let (raw_packets, _) = h.ai.gather_outbound();
    assert_eq!(raw_packets.len(), 1);
    match &unmarshal_chunks(&raw_packets[0])[0] {
        Chunk::CookieEcho(ce) => assert_eq!(ce.cookie, cookie.cookie),
        other => panic!("expected COOKIE-ECHO, got {other}"),
    }

    // COOKIE-ACK completes the handshake.
    h.ai.handle_cookie_ack();
    assert_eq!(h.ai.get_state(), AssociationState::Established);
    assert_eq!(h.handshake_rx.try_recv().unwrap(), None);
}

#[test]
fn test_init_ack_without_cookie_fails() {
    let mut h = make_internal("client");
    h.ai.init_client().unwrap();
    let init_ack = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 1,
        params: vec![],
    };
    let pkt = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: h.ai.my_verification_tag,
        chunks: vec![],
    };
    assert_eq!(
        h.ai.handle_init_ack(&pkt, &init_ack).unwrap_err(),
        Error::ErrInitAckNoCookie
    );
}

// Data reception ----------------------------------------------------------

#[tokio::test]
async fn test_handle_data_delivers_and_arms_delayed_ack() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);

    h.ai.handle_chunks_start();
    let replies = h.ai.handle_data(&data_chunk(1, 9, b"hi"));
    assert!(replies.is_empty());
    h.ai.handle_chunks_end();

    assert_eq!(h.ai.payload_queue.get_cumulative_tsn(), 1);
    assert_eq!(
        h.ai.get_state(),
        AssociationState::Established
    );

    // The stream was created lazily and surfaced on the accept queue.
    let s = h.accept_rx.try_recv().unwrap();
    assert_eq!(s.stream_identifier(), 9);
    let mut buf = [0u8; 8];
    let (n, _) = s.read_sctp(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hi");

    // In-order data without an immediate trigger means a delayed ack.
    let sack = h.ai.create_selective_ack_chunk();
    assert_eq!(sack.cumulative_tsn_ack, 1);
    assert!(sack.gap_ack_blocks.is_empty());
}

#[test]
fn test_handle_data_gap_triggers_immediate_ack() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);

    h.ai.handle_chunks_start();
    h.ai.handle_data(&data_chunk(3, 9, b"gap"));
    h.ai.handle_chunks_end();

    let sack = h.ai.create_selective_ack_chunk();
    assert_eq!(sack.cumulative_tsn_ack, 0);
    assert_eq!(sack.gap_ack_blocks, vec![GapAckBlock { start: 3, end: 3 }]);
}

#[test]
fn test_handle_data_duplicate_is_reported() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);

    h.ai.handle_chunks_start();
    h.ai.handle_data(&data_chunk(1, 9, b"once"));
    h.ai.handle_data(&data_chunk(1, 9, b"again"));
    h.ai.handle_chunks_end();

    let sack = h.ai.create_selective_ack_chunk();
    assert_eq!(sack.duplicate_tsn, vec![1]);
}

// SACK processing ---------------------------------------------------------

#[test]
fn test_sack_advances_ack_point_and_grows_cwnd() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 12;
    h.ai.min_tsn2measure_rtt = 10;
    h.ai.ssthresh = 1_000_000; // keep slow start
    h.ai.inflight_queue.push_no_check(inflight_chunk(10, 1, 1000));
    h.ai.inflight_queue.push_no_check(inflight_chunk(11, 1, 1000));
    // Slow start only grows while there is more to send.
    h.ai.pending_queue.push(data_chunk(0, 1, b"more"));

    let old_cwnd = h.ai.cwnd();
    h.ai.handle_sack(&sack(11, 100_000, vec![])).unwrap();

    assert_eq!(h.ai.cumulative_tsn_ack_point, 11);
    assert!(h.ai.inflight_queue.is_empty());
    assert_eq!(h.ai.cwnd(), old_cwnd + 2000);
    assert_eq!(h.ai.rwnd(), 100_000);
}

#[test]
fn test_sack_older_than_ack_point_changes_nothing() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 10;
    h.ai.my_next_tsn = 12;
    h.ai.inflight_queue.push_no_check(inflight_chunk(11, 1, 100));

    let old_cwnd = h.ai.cwnd();
    let old_rwnd = h.ai.rwnd();
    h.ai.handle_sack(&sack(5, 100_000, vec![])).unwrap();

    assert_eq!(h.ai.cumulative_tsn_ack_point, 10);
    assert_eq!(h.ai.inflight_queue.len(), 1);
    assert_eq!(h.ai.cwnd(), old_cwnd);
    assert_eq!(h.ai.rwnd(), old_rwnd);
}

#[test]
fn test_three_gap_reports_enter_fast_recovery() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 14;
    h.ai.min_tsn2measure_rtt = 10;
    for tsn in 10..=13 {
        h.ai.inflight_queue.push_no_check(inflight_chunk(tsn, 1, 100));
    }

    let old_cwnd = h.ai.cwnd();
    let mtu = h.ai.mtu;

    // TSN 10 was dropped; three SACKs report the growing gap.
    h.ai.handle_sack(&sack(9, 100_000, vec![GapAckBlock { start: 2, end: 2 }]))
        .unwrap();
    assert!(!h.ai.in_fast_recovery);
    h.ai.handle_sack(&sack(9, 100_000, vec![GapAckBlock { start: 2, end: 3 }]))
        .unwrap();
    assert!(!h.ai.in_fast_recovery);
    h.ai.handle_sack(&sack(9, 100_000, vec![GapAckBlock { start: 2, end: 4 }]))
        .unwrap();

    assert!(h.ai.in_fast_recovery);
    assert_eq!(h.ai.fast_recover_exit_point, 13);
    assert_eq!(h.ai.ssthresh, std::cmp::max(old_cwnd / 2, 4 * mtu));
    assert_eq!(h.ai.cwnd(), h.ai.ssthresh);
    assert_eq!(h.ai.partial_bytes_acked, 0);

    // The next write-loop pass retransmits TSN 10 in a single packet,
    // ignoring cwnd.
    let (raw_packets, _) = h.ai.gather_outbound();
    let retransmitted: Vec<u32> = raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .filter_map(|c| match c {
            Chunk::PayloadData(d) => Some(d.tsn),
            _ => None,
        })
        .collect();
    assert_eq!(retransmitted, vec![10]);
    assert_eq!(h.ai.inflight_queue.get(10).unwrap().n_sent, 2);
}

#[test]
fn test_sack_exits_fast_recovery_at_exit_point() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 12;
    h.ai.in_fast_recovery = true;
    h.ai.fast_recover_exit_point = 11;
    h.ai.inflight_queue.push_no_check(inflight_chunk(10, 1, 100));
    h.ai.inflight_queue.push_no_check(inflight_chunk(11, 1, 100));

    h.ai.handle_sack(&sack(11, 100_000, vec![])).unwrap();
    assert!(!h.ai.in_fast_recovery);
}

// T3-rtx ------------------------------------------------------------------

#[tokio::test]
async fn test_t3_rtx_collapses_cwnd_and_marks_retransmits() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 12;
    h.ai.set_rwnd(100_000);
    h.ai.inflight_queue.push_no_check(inflight_chunk(10, 1, 100));
    h.ai.inflight_queue.push_no_check(inflight_chunk(11, 1, 100));

    let old_cwnd = h.ai.cwnd();
    let mtu = h.ai.mtu;
    h.ai.on_retransmission_timeout(RtxTimerId::T3Rtx, 1).await;

    assert_eq!(h.ai.cwnd(), mtu);
    assert_eq!(h.ai.ssthresh, std::cmp::max(old_cwnd / 2, 4 * mtu));
    assert!(h.ai.inflight_queue.get(10).unwrap().retransmit);
    assert!(h.ai.inflight_queue.get(11).unwrap().retransmit);

    // The write-loop pass bundles both into one retransmitted packet.
    let (raw_packets, _) = h.ai.gather_outbound();
    let retransmitted: Vec<u32> = raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .filter_map(|c| match c {
            Chunk::PayloadData(d) => Some(d.tsn),
            _ => None,
        })
        .collect();
    assert_eq!(retransmitted, vec![10, 11]);
}

#[tokio::test]
async fn test_t3_rtx_zero_rwnd_sends_single_probe() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 12;
    h.ai.set_rwnd(0);
    h.ai.inflight_queue.push_no_check(inflight_chunk(10, 1, 100));
    h.ai.inflight_queue.push_no_check(inflight_chunk(11, 1, 100));
    h.ai.on_retransmission_timeout(RtxTimerId::T3Rtx, 1).await;

    let (raw_packets, _) = h.ai.gather_outbound();
    let retransmitted: Vec<u32> = raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .filter_map(|c| match c {
            Chunk::PayloadData(d) => Some(d.tsn),
            _ => None,
        })
        .collect();
    assert_eq!(retransmitted, vec![10], "only the zero-window probe goes out");
}

// Transmission ------------------------------------------------------------

#[test]
fn test_pop_pending_respects_rwnd_with_probe() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.set_rwnd(0);
    h.ai.pending_queue.push(data_chunk(0, 1, b"probe"));
    h.ai.pending_queue.push(data_chunk(0, 1, b"waits"));

    let (chunks, sis_to_reset) = h.ai.pop_pending_data_chunks_to_send();
    assert!(sis_to_reset.is_empty());
    assert_eq!(chunks.len(), 1, "exactly one zero-window probe");
    assert_eq!(h.ai.inflight_queue.len(), 1);
    assert_eq!(h.ai.pending_queue.len(), 1);
}

#[test]
fn test_pop_pending_collects_reset_sentinels() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.set_rwnd(100_000);
    let sentinel = ChunkPayloadData {
        stream_identifier: 3,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::new(),
        ..Default::default()
    };
    h.ai.pending_queue.push(sentinel);
    h.ai.pending_queue.push(data_chunk(0, 1, b"data"));

    let (chunks, sis_to_reset) = h.ai.pop_pending_data_chunks_to_send();
    assert_eq!(sis_to_reset, vec![3]);
    assert_eq!(chunks.len(), 1);
    assert_eq!(&chunks[0].user_data[..], b"data");
}

#[test]
fn test_reset_request_is_sent_and_stored_for_retransmission() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.set_rwnd(100_000);
    let sentinel = ChunkPayloadData {
        stream_identifier: 3,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::new(),
        ..Default::default()
    };
    h.ai.pending_queue.push(sentinel);

    let expected_last_tsn = h.ai.my_next_tsn.wrapping_sub(1);
    let (raw_packets, _) = h.ai.gather_outbound();
    assert_eq!(raw_packets.len(), 1);
    match &unmarshal_chunks(&raw_packets[0])[0] {
        Chunk::Reconfig(r) => match r.param_a.as_ref().unwrap() {
            Param::OutgoingResetRequest(req) => {
                assert_eq!(req.stream_identifiers, vec![3]);
                assert_eq!(req.sender_last_tsn, expected_last_tsn);
            }
            other => panic!("expected outgoing reset request, got {other}"),
        },
        other => panic!("expected RECONFIG, got {other}"),
    }
    assert_eq!(h.ai.reconfigs.len(), 1, "stored for retransmission");
}

// Reconfig reception ------------------------------------------------------

#[test]
fn test_inbound_reset_deferred_until_tsn_reached() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);
    h.ai.open_stream(9, PayloadProtocolIdentifier::Binary)
        .unwrap();

    let req = ParamOutgoingResetRequest {
        reconfig_request_sequence_number: 1,
        reconfig_response_sequence_number: 0,
        sender_last_tsn: 2,
        stream_identifiers: vec![9],
    };
    // Data up to TSN 2 has not arrived yet: defer with InProgress.
    let reply = h.ai.handle_reconfig_param(&Param::OutgoingResetRequest(req)).unwrap().unwrap();
    match &reply.chunks[0] {
        Chunk::Reconfig(r) => match r.param_a.as_ref().unwrap() {
            Param::ReconfigResponse(resp) => {
                assert_eq!(resp.result, ReconfigResult::InProgress);
            }
            other => panic!("expected reconfig response, got {other}"),
        },
        other => panic!("expected RECONFIG, got {other}"),
    }
    assert_eq!(h.ai.reconfig_requests.len(), 1);
    assert!(h.ai.streams.contains_key(&9));

    // Once the missing data arrives the deferred reset is performed.
    h.ai.handle_chunks_start();
    h.ai.handle_data(&data_chunk(1, 9, b"a"));
    let replies = h.ai.handle_data(&data_chunk(2, 9, b"b"));
    h.ai.handle_chunks_end();

    let performed = replies.iter().any(|p| {
        matches!(
            &p.chunks[0],
            Chunk::Reconfig(r) if matches!(
                r.param_a.as_ref().unwrap(),
                Param::ReconfigResponse(resp) if resp.result == ReconfigResult::SuccessPerformed
            )
        )
    });
    assert!(performed, "expected a SuccessPerformed response");
    assert!(h.ai.reconfig_requests.is_empty());
    assert!(!h.ai.streams.contains_key(&9), "stream deleted on reset");
}

#[test]
fn test_inbound_reset_performed_immediately_when_current() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(5);
    h.ai.open_stream(3, PayloadProtocolIdentifier::Binary)
        .unwrap();

    let req = ParamOutgoingResetRequest {
        reconfig_request_sequence_number: 7,
        reconfig_response_sequence_number: 0,
        sender_last_tsn: 5,
        stream_identifiers: vec![3],
    };
    let reply = h.ai.handle_reconfig_param(&Param::OutgoingResetRequest(req)).unwrap().unwrap();
    match &reply.chunks[0] {
        Chunk::Reconfig(r) => match r.param_a.as_ref().unwrap() {
            Param::ReconfigResponse(resp) => {
                assert_eq!(resp.reconfig_response_sequence_number, 7);
                assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
            }
            other => panic!("expected reconfig response, got {other}"),
        },
        other => panic!("expected RECONFIG, got {other}"),
    }
    assert!(!h.ai.streams.contains_key(&3));
}

#[test]
fn test_too_many_reconfig_requests_rejected() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);
    for rsn in 0..1000u32 {
        h.ai.reconfig_requests.insert(
            rsn,
            ParamOutgoingResetRequest {
                reconfig_request_sequence_number: rsn,
                reconfig_response_sequence_number: 0,
                sender_last_tsn: 100,
                stream_identifiers: vec![],
            },
        );
    }
    let req = ParamOutgoingResetRequest {
        reconfig_request_sequence_number: 5000,
        reconfig_response_sequence_number: 0,
        sender_last_tsn: 100,
        stream_identifiers: vec![],
    };
    assert_eq!(
        h.ai.handle_reconfig_param(&Param::OutgoingResetRequest(req))
            .unwrap_err(),
        Error::ErrTooManyReconfigRequests
    );
}

// Forward-TSN -------------------------------------------------------------

#[tokio::test]
async fn test_abandoned_chunk_advances_peer_ack_point() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.use_forward_tsn = true;
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.advanced_peer_tsn_ack_point = 9;
    h.ai.my_next_tsn = 11;

    let c = inflight_chunk(10, 4, 100);
    let mut c2 = c.clone();
    c2.stream_sequence_number = 5;
    c2.set_abandoned(true);
    c2.set_all_inflight();
    h.ai.inflight_queue.push_no_check(c2);

    h.ai.handle_sack(&sack(9, 100_000, vec![])).unwrap();
    assert_eq!(h.ai.advanced_peer_tsn_ack_point, 10);
    assert!(h.ai.will_send_forward_tsn);

    let (raw_packets, _) = h.ai.gather_outbound();
    let fwd: Vec<ChunkForwardTsn> = raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .filter_map(|c| match c {
            Chunk::ForwardTsn(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(fwd.len(), 1);
    assert_eq!(fwd[0].new_cumulative_tsn, 10);
    assert_eq!(fwd[0].streams.len(), 1);
    assert_eq!(fwd[0].streams[0].identifier, 4);
    assert_eq!(fwd[0].streams[0].sequence, 5);
}

#[test]
fn test_handle_forward_tsn_advances_peer_last_tsn() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.use_forward_tsn = true;
    h.ai.payload_queue.init(0);

    h.ai.handle_chunks_start();
    // TSN 1 never arrives; 2 is waiting in the gap.
    h.ai.handle_data(&data_chunk(2, 9, b"late"));
    h.ai.handle_forward_tsn(&ChunkForwardTsn {
        new_cumulative_tsn: 2,
        streams: vec![],
    });
    h.ai.handle_chunks_end();

    assert_eq!(h.ai.payload_queue.get_cumulative_tsn(), 2);
}

#[test]
fn test_handle_forward_tsn_stale_only_acks() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.use_forward_tsn = true;
    h.ai.payload_queue.init(10);

    let replies = h.ai.handle_forward_tsn(&ChunkForwardTsn {
        new_cumulative_tsn: 5,
        streams: vec![],
    });
    assert!(replies.is_empty());
    assert_eq!(h.ai.payload_queue.get_cumulative_tsn(), 10);
    let (raw_packets, _) = h.ai.gather_outbound();
    assert!(
        raw_packets
            .iter()
            .flat_map(|raw| unmarshal_chunks(raw))
            .any(|c| matches!(c, Chunk::Sack(_))),
        "a stale Forward-TSN still earns a SACK"
    );
}

#[test]
fn test_handle_forward_tsn_when_unsupported_replies_error() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.payload_queue.init(0);

    let replies = h.ai.handle_forward_tsn(&ChunkForwardTsn {
        new_cumulative_tsn: 5,
        streams: vec![],
    });
    assert_eq!(replies.len(), 1);
    match &replies[0].chunks[0] {
        Chunk::Error(e) => {
            assert_eq!(e.error_causes[0].code, UNRECOGNIZED_CHUNK_TYPE);
        }
        other => panic!("expected ERROR, got {other}"),
    }
}

#[tokio::test]
async fn test_rexmit_reliability_abandons_after_budget() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.use_forward_tsn = true;
    h.ai.set_rwnd(100_000);

    let s = h
        .ai
        .open_stream(6, PayloadProtocolIdentifier::Binary)
        .unwrap();
    s.set_reliability_params(false, ReliabilityType::Rexmit, 1);
    s.write(&Bytes::from_static(b"lossy")).await.unwrap();

    // First transmission consumes the whole budget of 1.
    let (chunks, _) = h.ai.pop_pending_data_chunks_to_send();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].abandoned());
}

// Stream management -------------------------------------------------------

#[test]
fn test_open_stream_rejected_when_shutting_down() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::ShutdownSent);
    assert_eq!(
        h.ai.open_stream(1, PayloadProtocolIdentifier::Binary)
            .unwrap_err(),
        Error::ErrAssociationClosed
    );
}

#[test]
fn test_open_stream_twice_fails() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::Established);
    h.ai.open_stream(1, PayloadProtocolIdentifier::Binary)
        .unwrap();
    assert_eq!(
        h.ai.open_stream(1, PayloadProtocolIdentifier::Binary)
            .unwrap_err(),
        Error::ErrStreamAlreadyExist
    );
}

// Shutdown handlers -------------------------------------------------------

#[test]
fn test_shutdown_received_with_empty_inflight_sends_ack() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.handle_shutdown(&crate::chunk::chunk_shutdown::ChunkShutdown {
        cumulative_tsn_ack: 0,
    });
    assert_eq!(h.ai.get_state(), AssociationState::ShutdownAckSent);

    let (raw_packets, ok) = h.ai.gather_outbound();
    assert!(ok);
    assert!(raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .any(|c| matches!(c, Chunk::ShutdownAck(_))));
}

#[test]
fn test_shutdown_received_with_inflight_waits() {
    let mut h = make_internal("server");
    h.ai.set_state(AssociationState::Established);
    h.ai.cumulative_tsn_ack_point = 9;
    h.ai.my_next_tsn = 11;
    h.ai.inflight_queue.push_no_check(inflight_chunk(10, 1, 10));

    h.ai.handle_shutdown(&crate::chunk::chunk_shutdown::ChunkShutdown {
        cumulative_tsn_ack: 0,
    });
    assert_eq!(h.ai.get_state(), AssociationState::ShutdownReceived);

    // Acknowledgement of the outstanding data progresses the shutdown.
    h.ai.handle_sack(&sack(10, 100_000, vec![])).unwrap();
    assert_eq!(h.ai.get_state(), AssociationState::ShutdownAckSent);
}

#[test]
fn test_shutdown_ack_leads_to_complete() {
    let mut h = make_internal("client");
    h.ai.set_state(AssociationState::ShutdownSent);
    h.ai.handle_shutdown_ack(&crate::chunk::chunk_shutdown::ChunkShutdownAck);

    let (raw_packets, ok) = h.ai.gather_outbound();
    assert!(!ok, "the association closes after SHUTDOWN-COMPLETE");
    assert!(raw_packets
        .iter()
        .flat_map(|raw| unmarshal_chunks(raw))
        .any(|c| matches!(c, Chunk::ShutdownComplete(_))));
}

// End-to-end --------------------------------------------------------------

fn client_server_configs() -> (Config, Config) {
    let (ca, cb) = pipe();
    let mut cfg_c = Config::new(ca);
    cfg_c.name = "client".to_owned();
    cfg_c.seed = Some(1);
    let mut cfg_s = Config::new(cb);
    cfg_s.name = "server".to_owned();
    cfg_s.seed = Some(2);
    (cfg_c, cfg_s)
}

async fn establish() -> (Association, Association) {
    let (cfg_c, cfg_s) = client_server_configs();
    let server = tokio::spawn(Association::server(cfg_s));
    let client = timeout(Duration::from_secs(10), Association::client(cfg_c))
        .await
        .expect("client handshake timed out")
        .expect("client handshake failed");
    let server = timeout(Duration::from_secs(10), server)
        .await
        .expect("server handshake timed out")
        .unwrap()
        .expect("server handshake failed");
    (client, server)
}

#[tokio::test]
async fn test_association_handshake() {
    let (client, server) = establish().await;
    assert!(client.srtt() >= 0.0);
    assert_eq!(client.mtu(), 1228);
    let _ = client.close().await;
    let _ = server.close().await;
}

#[tokio::test]
async fn test_ordered_reliable_delivery() {
    let (client, server) = establish().await;

    let s = client
        .open_stream(7, PayloadProtocolIdentifier::Binary)
        .await
        .unwrap();

    // A 3000-byte message fragments into multiple DATA chunks and
    // reassembles intact on the far side.
    let msg: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let n = s
        .write_sctp(&Bytes::from(msg.clone()), PayloadProtocolIdentifier::Binary)
        .await
        .unwrap();
    assert_eq!(n, 3000);

    let rs = timeout(Duration::from_secs(10), server.accept_stream())
        .await
        .expect("accept timed out")
        .unwrap();
    assert_eq!(rs.stream_identifier(), 7);

    let mut buf = vec![0u8; 4096];
    let (n, ppi) = timeout(Duration::from_secs(10), rs.read_sctp(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(n, 3000);
    assert_eq!(&buf[..n], &msg[..]);
    assert_eq!(ppi, PayloadProtocolIdentifier::Binary);

    // A second message on the same stream keeps its payload type.
    s.write_sctp(
        &Bytes::from_static(b"hello"),
        PayloadProtocolIdentifier::String,
    )
    .await
    .unwrap();
    let (n, ppi) = timeout(Duration::from_secs(10), rs.read_sctp(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(ppi, PayloadProtocolIdentifier::String);

    let _ = client.close().await;
    let _ = server.close().await;
}

#[tokio::test]
async fn test_buffered_amount_drains_after_ack() {
    let (client, server) = establish().await;

    let s = client
        .open_stream(1, PayloadProtocolIdentifier::Binary)
        .await
        .unwrap();
    s.write(&Bytes::from_static(b"tracked")).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while s.buffered_amount() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "buffered amount never drained"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.buffered_amount().await, 0);

    let _ = client.close().await;
    let _ = server.close().await;
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let (client, server) = establish().await;

    let s = client
        .open_stream(2, PayloadProtocolIdentifier::Binary)
        .await
        .unwrap();
    s.write(&Bytes::from_static(b"bye")).await.unwrap();
    let rs = timeout(Duration::from_secs(10), server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(10), rs.read_sctp(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"bye");

    timeout(Duration::from_secs(10), client.shutdown())
        .await
        .expect("shutdown timed out")
        .expect("shutdown failed");

    // The peer ends up closed as well: its accept queue is gone.
    let accept_result = timeout(Duration::from_secs(10), server.accept_stream())
        .await
        .expect("server never noticed the shutdown");
    assert!(accept_result.is_err());
}

#[tokio::test]
async fn test_abort_tears_down_both_sides() {
    let (client, server) = establish().await;

    timeout(Duration::from_secs(10), client.abort("no longer needed"))
        .await
        .expect("abort timed out");

    let accept_result = timeout(Duration::from_secs(10), server.accept_stream())
        .await
        .expect("server never noticed the abort");
    assert!(accept_result.is_err());
}
