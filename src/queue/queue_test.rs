use bytes::Bytes;

use super::payload_queue::PayloadQueue;
use super::pending_queue::PendingQueue;
use super::reassembly_queue::ReassemblyQueue;
use super::receive_payload_queue::{get_max_tsn_offset, ReceivePayloadQueue};
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::chunk::chunk_selective_ack::GapAckBlock;

fn make_data_chunk(tsn: u32, si: u16, payload: &'static [u8]) -> ChunkPayloadData {
    ChunkPayloadData {
        tsn,
        stream_identifier: si,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::from_static(payload),
        ..Default::default()
    }
}

mod payload_queue {
    use super::*;

    #[test]
    fn test_push_and_pop_in_tsn_order() {
        let mut q = PayloadQueue::new();
        q.push_no_check(make_data_chunk(11, 0, b"bb"));
        q.push_no_check(make_data_chunk(10, 0, b"aa"));
        q.push_no_check(make_data_chunk(12, 0, b"cc"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.get_num_bytes(), 6);

        // Only the lowest TSN pops.
        assert!(q.pop(12).is_none());
        assert_eq!(q.pop(10).unwrap().tsn, 10);
        assert_eq!(q.pop(11).unwrap().tsn, 11);
        assert_eq!(q.pop(12).unwrap().tsn, 12);
        assert!(q.is_empty());
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_mark_as_acked_zeroes_byte_contribution() {
        let mut q = PayloadQueue::new();
        q.push_no_check(make_data_chunk(1, 0, b"hello"));
        q.push_no_check(make_data_chunk(2, 0, b"world"));
        assert_eq!(q.get_num_bytes(), 10);

        assert_eq!(q.mark_as_acked(2), 5);
        assert_eq!(q.get_num_bytes(), 5);
        assert!(q.get(2).unwrap().acked);
        // Acking twice contributes nothing further.
        assert_eq!(q.mark_as_acked(2), 0);
        assert_eq!(q.get_num_bytes(), 5);
        // Popping an acked entry does not disturb the byte count.
        assert_eq!(q.pop(1).unwrap().tsn, 1);
        q.pop(2);
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_mark_all_to_retransmit_skips_acked() {
        let mut q = PayloadQueue::new();
        q.push_no_check(make_data_chunk(1, 0, b"a"));
        q.push_no_check(make_data_chunk(2, 0, b"b"));
        q.mark_as_acked(1);
        q.mark_all_to_retransmit();
        assert!(!q.get(1).unwrap().retransmit);
        assert!(q.get(2).unwrap().retransmit);
    }

    #[test]
    fn test_tsn_order_across_wraparound() {
        let mut q = PayloadQueue::new();
        q.push_no_check(make_data_chunk(0, 0, b"b"));
        q.push_no_check(make_data_chunk(u32::MAX, 0, b"a"));
        // Serial order: MAX comes before 0.
        assert!(q.pop(0).is_none());
        assert_eq!(q.pop(u32::MAX).unwrap().tsn, u32::MAX);
        assert_eq!(q.pop(0).unwrap().tsn, 0);
    }
}

mod pending_queue {
    use super::*;

    fn fragment(si: u16, begin: bool, end: bool, unordered: bool, payload: &'static [u8]) -> ChunkPayloadData {
        ChunkPayloadData {
            stream_identifier: si,
            beginning_fragment: begin,
            ending_fragment: end,
            unordered,
            user_data: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_and_byte_accounting() {
        let q = PendingQueue::new();
        q.push(fragment(0, true, true, false, b"msg1"));
        q.push(fragment(0, true, true, false, b"msg02"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get_num_bytes(), 10);

        let c = q.peek().unwrap();
        let c = q.pop(c.beginning_fragment, c.unordered).unwrap();
        assert_eq!(&c.user_data[..], b"msg1");
        let c = q.peek().unwrap();
        let c = q.pop(c.beginning_fragment, c.unordered).unwrap();
        assert_eq!(&c.user_data[..], b"msg02");
        assert!(q.is_empty());
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_fragments_of_a_message_pop_contiguously() {
        let q = PendingQueue::new();
        // An ordered message in two fragments.
        q.push(fragment(0, true, false, false, b"frag1-"));
        q.push(fragment(0, false, true, false, b"frag2"));

        // Pop the beginning fragment; the selection locks to this message.
        let c = q.peek().unwrap();
        let c = q.pop(c.beginning_fragment, c.unordered).unwrap();
        assert_eq!(&c.user_data[..], b"frag1-");

        // An unordered message arrives in between.
        q.push(fragment(0, true, true, true, b"other"));

        // The remaining fragment still pops first.
        let c = q.peek().unwrap();
        let c = q.pop(c.beginning_fragment, c.unordered).unwrap();
        assert_eq!(&c.user_data[..], b"frag2");

        let c = q.peek().unwrap();
        let c = q.pop(c.beginning_fragment, c.unordered).unwrap();
        assert_eq!(&c.user_data[..], b"other");
    }

    #[test]
    fn test_unordered_is_preferred_when_unselected() {
        let q = PendingQueue::new();
        q.push(fragment(0, true, true, false, b"ordered"));
        q.push(fragment(0, true, true, true, b"unordered"));
        let c = q.peek().unwrap();
        assert!(c.unordered);
    }
}

mod receive_payload_queue {
    use super::*;

    #[test]
    fn test_get_max_tsn_offset_clamps() {
        assert_eq!(get_max_tsn_offset(0), 2000);
        assert_eq!(get_max_tsn_offset(1024 * 1024), 1024 * 1024 * 4 / 500);
        assert_eq!(get_max_tsn_offset(u32::MAX / 8), 40000);
    }

    #[test]
    fn test_push_pop_in_order() {
        let mut q = ReceivePayloadQueue::new(2000);
        q.init(99);
        assert!(q.push(100));
        assert!(q.push(101));
        assert_eq!(q.size(), 2);

        assert!(q.pop(false));
        assert_eq!(q.get_cumulative_tsn(), 100);
        assert!(q.pop(false));
        assert_eq!(q.get_cumulative_tsn(), 101);
        assert!(!q.pop(false));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_duplicates_and_window() {
        let mut q = ReceivePayloadQueue::new(2000);
        q.init(0);
        assert!(q.push(1));
        assert!(!q.can_push(1), "duplicate");
        assert!(!q.can_push(0), "at or below cumulative");
        assert!(!q.can_push(2001), "beyond the window");
        assert!(q.can_push(2000), "at the window edge");

        q.record_duplicate(1);
        q.record_duplicate(0);
        assert_eq!(q.pop_duplicates(), vec![1, 0]);
        assert!(q.pop_duplicates().is_empty());
    }

    #[test]
    fn test_gap_ack_blocks() {
        let mut q = ReceivePayloadQueue::new(2000);
        q.init(0);
        q.push(2);
        q.push(3);
        q.push(5);
        assert_eq!(
            q.get_gap_ack_blocks(),
            vec![
                GapAckBlock { start: 2, end: 3 },
                GapAckBlock { start: 5, end: 5 },
            ]
        );

        // Filling the hole merges everything into one run.
        q.push(4);
        assert_eq!(q.get_gap_ack_blocks(), vec![GapAckBlock { start: 2, end: 5 }]);

        q.push(1);
        while q.pop(false) {}
        assert_eq!(q.get_cumulative_tsn(), 5);
        assert!(q.get_gap_ack_blocks().is_empty());
    }

    #[test]
    fn test_forced_pop_advances_past_missing() {
        let mut q = ReceivePayloadQueue::new(2000);
        q.init(10);
        q.push(13);
        assert!(!q.pop(false), "11 is missing");
        assert!(q.pop(true));
        assert!(q.pop(true));
        assert_eq!(q.get_cumulative_tsn(), 12);
        // 13 is present now.
        assert!(q.pop(false));
        assert_eq!(q.get_cumulative_tsn(), 13);
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_window_across_wraparound() {
        let mut q = ReceivePayloadQueue::new(2000);
        q.init(u32::MAX);
        assert!(q.push(0));
        assert!(q.push(1));
        assert_eq!(
            q.get_gap_ack_blocks(),
            vec![GapAckBlock { start: 1, end: 2 }]
        );
        assert!(q.pop(false));
        assert_eq!(q.get_cumulative_tsn(), 0);
    }
}

mod reassembly_queue {
    use super::*;

    fn ordered_chunk(
        si: u16,
        tsn: u32,
        ssn: u16,
        begin: bool,
        end: bool,
        payload: &'static [u8],
    ) -> ChunkPayloadData {
        ChunkPayloadData {
            stream_identifier: si,
            tsn,
            stream_sequence_number: ssn,
            beginning_fragment: begin,
            ending_fragment: end,
            payload_type: PayloadProtocolIdentifier::Binary,
            user_data: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    fn unordered_chunk(
        si: u16,
        tsn: u32,
        begin: bool,
        end: bool,
        payload: &'static [u8],
    ) -> ChunkPayloadData {
        let mut c = ordered_chunk(si, tsn, 0, begin, end, payload);
        c.unordered = true;
        c
    }

    #[test]
    fn test_ordered_single_fragment() {
        let mut rq = ReassemblyQueue::new(7);
        assert!(rq.push(ordered_chunk(7, 100, 0, true, true, b"hello")));
        let mut buf = [0u8; 16];
        let (n, ppi) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(ppi, PayloadProtocolIdentifier::Binary);
        assert_eq!(rq.get_num_bytes(), 0);
    }

    #[test]
    fn test_ordered_fragmented_message() {
        let mut rq = ReassemblyQueue::new(0);
        assert!(!rq.push(ordered_chunk(0, 1, 0, true, false, b"foo")));
        assert!(!rq.push(ordered_chunk(0, 2, 0, false, false, b"bar")));
        assert!(rq.push(ordered_chunk(0, 3, 0, false, true, b"baz")));
        let mut buf = [0u8; 16];
        let (n, _) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"foobarbaz");
    }

    #[test]
    fn test_ordered_delivery_follows_ssn() {
        let mut rq = ReassemblyQueue::new(0);
        // SSN 1 lands first; it must wait for SSN 0.
        assert!(rq.push(ordered_chunk(0, 2, 1, true, true, b"second")));
        let mut buf = [0u8; 16];
        assert!(rq.read(&mut buf).is_none());

        assert!(rq.push(ordered_chunk(0, 1, 0, true, true, b"first")));
        let (n, _) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"first");
        let (n, _) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_unordered_assembles_on_tsn_contiguity() {
        let mut rq = ReassemblyQueue::new(0);
        assert!(!rq.push(unordered_chunk(0, 11, false, true, b"end")));
        assert!(rq.push(unordered_chunk(0, 10, true, false, b"start-")));
        let mut buf = [0u8; 16];
        let (n, _) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"start-end");
    }

    #[test]
    fn test_wrong_stream_rejected() {
        let mut rq = ReassemblyQueue::new(5);
        assert!(!rq.push(ordered_chunk(6, 1, 0, true, true, b"nope")));
        assert_eq!(rq.get_num_bytes(), 0);
    }

    #[test]
    fn test_short_buffer() {
        let mut rq = ReassemblyQueue::new(0);
        rq.push(ordered_chunk(0, 1, 0, true, true, b"too big for buf"));
        let mut buf = [0u8; 4];
        let result = rq.read(&mut buf).unwrap();
        assert_eq!(result.unwrap_err(), crate::error::Error::ErrShortBuffer);
    }

    #[test]
    fn test_forward_tsn_for_ordered_drops_abandoned() {
        let mut rq = ReassemblyQueue::new(0);
        // An incomplete message at SSN 0 that the sender abandoned.
        rq.push(ordered_chunk(0, 1, 0, true, false, b"partial"));
        // A complete message at SSN 1.
        rq.push(ordered_chunk(0, 3, 1, true, true, b"kept"));

        rq.forward_tsn_for_ordered(0);
        assert_eq!(rq.next_ssn, 1);

        let mut buf = [0u8; 16];
        let (n, _) = rq.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"kept");
    }

    #[test]
    fn test_forward_tsn_for_unordered_drops_stale_fragments() {
        let mut rq = ReassemblyQueue::new(0);
        rq.push(unordered_chunk(0, 4, true, false, b"stale"));
        assert!(rq.get_num_bytes() > 0);
        rq.forward_tsn_for_unordered(4);
        assert_eq!(rq.get_num_bytes(), 0);
    }
}
