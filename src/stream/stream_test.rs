use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use super::*;
use crate::association::AssociationState;
use crate::queue::reassembly_queue::ReassemblyQueue;

fn make_stream(max_payload_size: u32) -> (Arc<Stream>, mpsc::Receiver<()>) {
    let (awake_tx, awake_rx) = mpsc::channel(1);
    let stream = Arc::new(Stream {
        stream_identifier: 3,
        name: "3:test".to_owned(),
        max_payload_size,
        max_message_size: Arc::new(AtomicU32::new(65536)),
        association_state: Arc::new(AtomicU8::new(AssociationState::Established as u8)),
        awake_write_loop_ch: Arc::new(awake_tx),
        pending_queue: Arc::new(crate::queue::pending_queue::PendingQueue::new()),
        block_write: false,
        write_pending: Arc::new(AtomicBool::new(false)),
        write_notify: Arc::new(Notify::new()),
        default_payload_type: AtomicU32::new(PayloadProtocolIdentifier::Binary as u32),
        sequence_number: AtomicU16::new(0),
        reassembly_queue: Mutex::new(ReassemblyQueue::new(3)),
        read_notifier: Notify::new(),
        read_err: Mutex::new(None),
        closed: AtomicBool::new(false),
        unordered: AtomicBool::new(false),
        reliability_type: AtomicU8::new(0),
        reliability_value: AtomicU32::new(0),
        buffered_amount: AtomicUsize::new(0),
        buffered_amount_low: AtomicUsize::new(0),
        on_buffered_amount_low: Mutex::new(None),
    });
    (stream, awake_rx)
}

#[test]
fn test_packetize_single_chunk() {
    let (s, _rx) = make_stream(1200);
    let chunks = s.packetize(
        &Bytes::from_static(b"hello"),
        PayloadProtocolIdentifier::Binary,
    );
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].beginning_fragment);
    assert!(chunks[0].ending_fragment);
    assert_eq!(chunks[0].stream_sequence_number, 0);
    assert_eq!(s.sequence_number.load(Ordering::SeqCst), 1);
}

#[test]
fn test_packetize_fragments_to_max_payload_size() {
    let (s, _rx) = make_stream(1200);
    let msg = Bytes::from(vec![0xabu8; 3000]);
    let chunks = s.packetize(&msg, PayloadProtocolIdentifier::Binary);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].user_data.len(), 1200);
    assert_eq!(chunks[1].user_data.len(), 1200);
    assert_eq!(chunks[2].user_data.len(), 600);

    assert!(chunks[0].beginning_fragment);
    assert!(!chunks[0].ending_fragment);
    assert!(!chunks[1].beginning_fragment);
    assert!(!chunks[1].ending_fragment);
    assert!(!chunks[2].beginning_fragment);
    assert!(chunks[2].ending_fragment);

    // One SSN per message.
    assert!(chunks.iter().all(|c| c.stream_sequence_number == 0));

    // Fragments share the abandonment state.
    chunks[1].set_abandoned(true);
    chunks[0].set_all_inflight();
    assert!(chunks[2].abandoned());
}

#[test]
fn test_packetize_unordered_does_not_consume_ssn() {
    let (s, _rx) = make_stream(1200);
    s.set_reliability_params(true, ReliabilityType::Rexmit, 3);
    let chunks = s.packetize(
        &Bytes::from_static(b"data"),
        PayloadProtocolIdentifier::Binary,
    );
    assert!(chunks[0].unordered);
    assert_eq!(s.sequence_number.load(Ordering::SeqCst), 0);
}

#[test]
fn test_packetize_dcep_is_always_ordered() {
    let (s, _rx) = make_stream(1200);
    s.set_reliability_params(true, ReliabilityType::Timed, 50);
    let chunks = s.packetize(
        &Bytes::from_static(b"open"),
        PayloadProtocolIdentifier::Dcep,
    );
    assert!(!chunks[0].unordered);
}

#[tokio::test]
async fn test_write_pushes_to_pending_queue_and_wakes() {
    let (s, mut awake_rx) = make_stream(1200);
    let n = s.write(&Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(s.buffered_amount(), 5);
    assert_eq!(s.pending_queue.len(), 1);
    assert!(awake_rx.try_recv().is_ok(), "write loop was not woken");
}

#[tokio::test]
async fn test_write_fails_when_not_established() {
    let (s, _rx) = make_stream(1200);
    s.association_state
        .store(AssociationState::CookieWait as u8, Ordering::SeqCst);
    let err = s.write(&Bytes::from_static(b"x")).await.unwrap_err();
    assert_eq!(err, Error::ErrPayloadDataStateNotExist);
}

#[tokio::test]
async fn test_write_fails_on_oversized_message() {
    let (s, _rx) = make_stream(1200);
    s.max_message_size.store(4, Ordering::SeqCst);
    let err = s.write(&Bytes::from_static(b"12345")).await.unwrap_err();
    assert_eq!(err, Error::ErrOutboundPacketTooLarge);
}

#[tokio::test]
async fn test_read_returns_handled_data() {
    let (s, _rx) = make_stream(1200);
    let chunk = crate::chunk::chunk_payload_data::ChunkPayloadData {
        stream_identifier: 3,
        tsn: 1,
        beginning_fragment: true,
        ending_fragment: true,
        payload_type: PayloadProtocolIdentifier::String,
        user_data: Bytes::from_static(b"ping"),
        ..Default::default()
    };
    s.handle_data(&chunk);

    let mut buf = [0u8; 16];
    let (n, ppi) = s.read_sctp(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(ppi, PayloadProtocolIdentifier::String);
}

#[tokio::test]
async fn test_read_unblocks_on_close() {
    let (s, _rx) = make_stream(1200);
    let reader = Arc::clone(&s);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        reader.read(&mut buf).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    s.unregister(Some(Error::ErrAssociationClosed));
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), Error::ErrAssociationClosed);
}

#[test]
fn test_close_queues_reset_sentinel() {
    let (s, _rx) = make_stream(1200);
    s.close().unwrap();
    assert_eq!(s.pending_queue.len(), 1);
    let c = s.pending_queue.peek().unwrap();
    assert!(c.user_data.is_empty());
    assert_eq!(c.stream_identifier, 3);
    // Closing twice queues nothing more.
    s.close().unwrap();
    assert_eq!(s.pending_queue.len(), 1);
}

#[test]
fn test_buffered_amount_low_callback() {
    let (s, _rx) = make_stream(1200);
    s.buffered_amount.store(1000, Ordering::SeqCst);
    s.set_buffered_amount_low_threshold(500);

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    s.on_buffered_amount_low(Box::new(move || {
        fired2.store(true, Ordering::SeqCst);
    }));

    s.on_buffer_released(300);
    assert!(!fired.load(Ordering::SeqCst), "still above the threshold");
    s.on_buffer_released(300);
    assert!(fired.load(Ordering::SeqCst), "crossed the threshold");
    assert_eq!(s.buffered_amount(), 400);
}
