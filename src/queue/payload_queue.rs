use std::collections::HashMap;

use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::util::sna32_lt;

/// The inflight queue: an ordered mapping from TSN to sent-but-unacked DATA
/// chunks. TSNs are assigned sequentially, so the window is contiguous with
/// gaps only in the acked/abandoned sense, and entries stay in the map until
/// the cumulative ack point passes them.
#[derive(Debug, Default)]
pub(crate) struct PayloadQueue {
    chunk_map: HashMap<u32, ChunkPayloadData>,
    sorted: Vec<u32>,
    dirty: bool,
    n_bytes: usize,
}

impl PayloadQueue {
    pub(crate) fn new() -> Self {
        PayloadQueue::default()
    }

    fn update_sorted_keys(&mut self) {
        if !self.dirty {
            return;
        }
        self.sorted = self.chunk_map.keys().copied().collect();
        self.sorted.sort_unstable_by(|a, b| {
            if a == b {
                std::cmp::Ordering::Equal
            } else if sna32_lt(*a, *b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        self.dirty = false;
    }

    pub(crate) fn push_no_check(&mut self, c: ChunkPayloadData) {
        self.n_bytes += c.user_data.len();
        self.chunk_map.insert(c.tsn, c);
        self.dirty = true;
    }

    pub(crate) fn get(&self, tsn: u32) -> Option<&ChunkPayloadData> {
        self.chunk_map.get(&tsn)
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut ChunkPayloadData> {
        self.chunk_map.get_mut(&tsn)
    }

    /// Removes the entry for `tsn` only when it is the lowest outstanding
    /// TSN; cumulative ack processing pops strictly in order.
    pub(crate) fn pop(&mut self, tsn: u32) -> Option<ChunkPayloadData> {
        self.update_sorted_keys();
        if self.sorted.first() != Some(&tsn) {
            return None;
        }
        self.sorted.remove(0);
        let c = self.chunk_map.remove(&tsn)?;
        if !c.acked {
            self.n_bytes -= c.user_data.len();
        }
        Some(c)
    }

    /// Marks `tsn` acked and returns the bytes it contributed; acked entries
    /// contribute zero bytes to the inflight byte count from here on.
    pub(crate) fn mark_as_acked(&mut self, tsn: u32) -> usize {
        if let Some(c) = self.chunk_map.get_mut(&tsn) {
            if c.acked {
                return 0;
            }
            c.acked = true;
            c.retransmit = false;
            let n_bytes_acked = c.user_data.len();
            self.n_bytes -= n_bytes_acked;
            // The payload is no longer needed once acked.
            c.user_data = bytes::Bytes::new();
            n_bytes_acked
        } else {
            0
        }
    }

    pub(crate) fn mark_all_to_retransmit(&mut self) {
        for c in self.chunk_map.values_mut() {
            if c.acked || c.abandoned() {
                continue;
            }
            c.retransmit = true;
        }
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.chunk_map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunk_map.is_empty()
    }
}
