use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::util::{sna32_gt, sna32_lte};

/// Estimate of the average chunk size, used to convert the receive buffer
/// size into a TSN window. There is no theory behind this estimate.
const AVG_CHUNK_SIZE: u32 = 500;
/// Bounds on the offset over the cumulative TSN we will enqueue irrespective
/// of the receive buffer size.
const MIN_TSN_OFFSET: u32 = 2000;
const MAX_TSN_OFFSET: u32 = 40000;

/// The maximum offset over the current cumulative TSN we are willing to
/// enqueue. This keeps receive-buffer bytes within a small multiple of the
/// configured maximum.
pub(crate) fn get_max_tsn_offset(max_receive_buffer_size: u32) -> u32 {
    // 4 is a magic number here. There is no theory behind this.
    ((max_receive_buffer_size * 4) / AVG_CHUNK_SIZE).clamp(MIN_TSN_OFFSET, MAX_TSN_OFFSET)
}

/// Tracks the set of received TSNs above the cumulative TSN, as a fixed
/// bitmask window. A bit position can only collide with itself because two
/// in-window TSNs never differ by the mask capacity or more.
#[derive(Debug)]
pub(crate) struct ReceivePayloadQueue {
    cumulative_tsn: u32,
    /// Highest TSN received; equals `cumulative_tsn` while the queue is
    /// empty.
    tail_tsn: u32,
    n: usize,
    mask: Vec<u64>,
    dup_tsn: Vec<u32>,
    max_tsn_offset: u32,
}

impl ReceivePayloadQueue {
    pub(crate) fn new(max_tsn_offset: u32) -> Self {
        // The mask capacity rounds up to whole words; the window bound
        // itself stays exact.
        let capacity = max_tsn_offset.div_ceil(64) * 64;
        ReceivePayloadQueue {
            cumulative_tsn: 0,
            tail_tsn: 0,
            n: 0,
            mask: vec![0; (capacity / 64) as usize],
            dup_tsn: vec![],
            max_tsn_offset,
        }
    }

    /// Re-bases the window at the peer's initial TSN minus one.
    pub(crate) fn init(&mut self, base_tsn: u32) {
        self.cumulative_tsn = base_tsn;
        self.tail_tsn = base_tsn;
        self.n = 0;
        self.mask.fill(0);
        self.dup_tsn.clear();
    }

    fn bit_index(&self, tsn: u32) -> (usize, u64) {
        let capacity = self.mask.len() * 64;
        let i = (tsn as usize) % capacity;
        (i / 64, 1u64 << (i % 64))
    }

    fn has(&self, tsn: u32) -> bool {
        if !sna32_gt(tsn, self.cumulative_tsn)
            || tsn.wrapping_sub(self.cumulative_tsn) > self.max_tsn_offset
        {
            return false;
        }
        let (word, bit) = self.bit_index(tsn);
        self.mask[word] & bit != 0
    }

    /// A TSN can be pushed when it is neither a duplicate nor outside the
    /// receive window.
    pub(crate) fn can_push(&self, tsn: u32) -> bool {
        if sna32_lte(tsn, self.cumulative_tsn) || self.has(tsn) {
            return false;
        }
        tsn.wrapping_sub(self.cumulative_tsn) <= self.max_tsn_offset
    }

    pub(crate) fn push(&mut self, tsn: u32) -> bool {
        if !self.can_push(tsn) {
            return false;
        }
        let (word, bit) = self.bit_index(tsn);
        self.mask[word] |= bit;
        if self.n == 0 || sna32_gt(tsn, self.tail_tsn) {
            self.tail_tsn = tsn;
        }
        self.n += 1;
        true
    }

    /// Remembers a duplicate for the next SACK.
    pub(crate) fn record_duplicate(&mut self, tsn: u32) {
        if sna32_lte(tsn, self.cumulative_tsn) || self.has(tsn) {
            self.dup_tsn.push(tsn);
        }
    }

    /// Advances the cumulative TSN by one if the next TSN has been received,
    /// or unconditionally when `force` is set (Forward-TSN processing).
    pub(crate) fn pop(&mut self, force: bool) -> bool {
        let next = self.cumulative_tsn.wrapping_add(1);
        if self.has(next) {
            let (word, bit) = self.bit_index(next);
            self.mask[word] &= !bit;
            self.n -= 1;
        } else if !force {
            return false;
        }
        self.cumulative_tsn = next;
        if self.n == 0 || sna32_gt(self.cumulative_tsn, self.tail_tsn) {
            self.tail_tsn = self.cumulative_tsn;
        }
        true
    }

    /// Runs of received TSNs above the cumulative TSN, as offsets for a SACK.
    pub(crate) fn get_gap_ack_blocks(&self) -> Vec<GapAckBlock> {
        let mut blocks = vec![];
        if self.n == 0 {
            return blocks;
        }
        let mut run_start: Option<u32> = None;
        let mut tsn = self.cumulative_tsn.wrapping_add(1);
        loop {
            let received = self.has(tsn);
            match (received, run_start) {
                (true, None) => run_start = Some(tsn),
                (false, Some(start)) => {
                    blocks.push(GapAckBlock {
                        start: start.wrapping_sub(self.cumulative_tsn) as u16,
                        end: tsn.wrapping_sub(1).wrapping_sub(self.cumulative_tsn) as u16,
                    });
                    run_start = None;
                }
                _ => {}
            }
            if tsn == self.tail_tsn {
                if let Some(start) = run_start {
                    blocks.push(GapAckBlock {
                        start: start.wrapping_sub(self.cumulative_tsn) as u16,
                        end: tsn.wrapping_sub(self.cumulative_tsn) as u16,
                    });
                }
                break;
            }
            tsn = tsn.wrapping_add(1);
        }
        blocks
    }

    pub(crate) fn get_gap_ack_blocks_string(&self) -> String {
        let blocks = self.get_gap_ack_blocks();
        let mut s = format!("cumTSN={}", self.cumulative_tsn);
        for b in blocks {
            s += &format!(",{}-{}", b.start, b.end);
        }
        s
    }

    pub(crate) fn pop_duplicates(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dup_tsn)
    }

    pub(crate) fn get_last_tsn_received(&self) -> Option<u32> {
        if self.n > 0 {
            Some(self.tail_tsn)
        } else {
            None
        }
    }

    pub(crate) fn get_cumulative_tsn(&self) -> u32 {
        self.cumulative_tsn
    }

    pub(crate) fn size(&self) -> usize {
        self.n
    }
}
