use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::util::{sna16_lt, sna16_lte, sna32_lt, sna32_lte};

fn sort_chunks_by_tsn(chunks: &mut [ChunkPayloadData]) {
    chunks.sort_by(|a, b| {
        if a.tsn == b.tsn {
            std::cmp::Ordering::Equal
        } else if sna32_lt(a.tsn, b.tsn) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
}

/// The fragments of one user message, kept sorted by TSN.
#[derive(Debug)]
pub(crate) struct ChunkSet {
    pub(crate) ssn: u16,
    pub(crate) ppi: PayloadProtocolIdentifier,
    pub(crate) chunks: Vec<ChunkPayloadData>,
}

impl ChunkSet {
    fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        ChunkSet {
            ssn,
            ppi,
            chunks: vec![],
        }
    }

    fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        // Duplicate fragments are dropped on the floor.
        if self.chunks.iter().any(|c| c.tsn == chunk.tsn) {
            return false;
        }
        self.chunks.push(chunk);
        sort_chunks_by_tsn(&mut self.chunks);
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        let n = self.chunks.len();
        if n == 0 || !self.chunks[0].beginning_fragment || !self.chunks[n - 1].ending_fragment {
            return false;
        }
        // Fragments must be TSN-contiguous.
        let mut last_tsn: Option<u32> = None;
        for c in &self.chunks {
            if let Some(l) = last_tsn {
                if c.tsn != l.wrapping_add(1) {
                    return false;
                }
            }
            last_tsn = Some(c.tsn);
        }
        true
    }

    fn n_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.user_data.len()).sum()
    }
}

/// Per-stream reassembly of DATA chunks into user messages.
///
/// Ordered messages queue as chunk sets keyed by SSN and are released in SSN
/// order; unordered fragments are matched into messages by TSN contiguity
/// and released as soon as they complete.
#[derive(Debug)]
pub(crate) struct ReassemblyQueue {
    pub(crate) si: u16,
    pub(crate) next_ssn: u16,
    ordered: Vec<ChunkSet>,
    unordered: Vec<ChunkSet>,
    unordered_chunks: Vec<ChunkPayloadData>,
    n_bytes: usize,
}

impl ReassemblyQueue {
    pub(crate) fn new(si: u16) -> Self {
        ReassemblyQueue {
            si,
            next_ssn: 0,
            ordered: vec![],
            unordered: vec![],
            unordered_chunks: vec![],
            n_bytes: 0,
        }
    }

    /// Returns true when the push made a complete message readable.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        if chunk.stream_identifier != self.si {
            return false;
        }

        if chunk.unordered {
            self.n_bytes += chunk.user_data.len();
            self.unordered_chunks.push(chunk);
            sort_chunks_by_tsn(&mut self.unordered_chunks);
            if let Some(cset) = self.find_complete_unordered_chunk_set() {
                self.unordered.push(cset);
                return true;
            }
            return false;
        }

        // Defense against late fragments of messages already delivered or
        // abandoned.
        if sna16_lt(chunk.stream_sequence_number, self.next_ssn) {
            return false;
        }

        self.n_bytes += chunk.user_data.len();
        let ssn = chunk.stream_sequence_number;
        let ppi = chunk.payload_type;
        if let Some(set) = self.ordered.iter_mut().find(|s| s.ssn == ssn) {
            return set.push(chunk);
        }
        let mut cset = ChunkSet::new(ssn, ppi);
        let complete = cset.push(chunk);
        self.ordered.push(cset);
        self.ordered.sort_by(|a, b| {
            if a.ssn == b.ssn {
                std::cmp::Ordering::Equal
            } else if sna16_lt(a.ssn, b.ssn) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        complete
    }

    fn find_complete_unordered_chunk_set(&mut self) -> Option<ChunkSet> {
        let mut start_idx: Option<usize> = None;
        let mut n_chunks = 0;
        let mut last_tsn = 0u32;
        let mut found = false;

        for (i, c) in self.unordered_chunks.iter().enumerate() {
            if c.beginning_fragment {
                start_idx = Some(i);
                n_chunks = 1;
                last_tsn = c.tsn;
                if c.ending_fragment {
                    found = true;
                    break;
                }
                continue;
            }
            if start_idx.is_none() {
                continue;
            }
            if c.tsn != last_tsn.wrapping_add(1) {
                start_idx = None;
                continue;
            }
            last_tsn = c.tsn;
            n_chunks += 1;
            if c.ending_fragment {
                found = true;
                break;
            }
        }

        if !found {
            return None;
        }
        let start = start_idx.unwrap();
        let chunks: Vec<ChunkPayloadData> =
            self.unordered_chunks.drain(start..start + n_chunks).collect();
        let mut cset = ChunkSet::new(0, chunks[0].payload_type);
        cset.chunks = chunks;
        Some(cset)
    }

    pub(crate) fn is_readable(&self) -> bool {
        if !self.unordered.is_empty() {
            return true;
        }
        if let Some(first) = self.ordered.first() {
            return first.is_complete() && sna16_lte(first.ssn, self.next_ssn);
        }
        false
    }

    /// Copies the next complete message into `buf`. `None` means nothing is
    /// readable right now.
    pub(crate) fn read(
        &mut self,
        buf: &mut [u8],
    ) -> Option<Result<(usize, PayloadProtocolIdentifier)>> {
        let cset = if !self.unordered.is_empty() {
            self.unordered.remove(0)
        } else if !self.ordered.is_empty() {
            let first = &self.ordered[0];
            if !first.is_complete() || sna16_lt(self.next_ssn, first.ssn) {
                return None;
            }
            let cset = self.ordered.remove(0);
            if cset.ssn == self.next_ssn {
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
            cset
        } else {
            return None;
        };

        let n_bytes = cset.n_bytes();
        self.n_bytes -= n_bytes;
        if buf.len() < n_bytes {
            return Some(Err(Error::ErrShortBuffer));
        }
        let mut offset = 0;
        for c in &cset.chunks {
            buf[offset..offset + c.user_data.len()].copy_from_slice(&c.user_data);
            offset += c.user_data.len();
        }
        Some(Ok((n_bytes, cset.ppi)))
    }

    /// Drops ordered messages abandoned by the peer (everything at or below
    /// `last_ssn`) and advances the expected SSN past them.
    pub(crate) fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let mut released = 0;
        self.ordered.retain(|set| {
            if sna16_lte(set.ssn, last_ssn) && !set.is_complete() {
                released += set.n_bytes();
                false
            } else {
                true
            }
        });
        self.n_bytes -= released;
        if sna16_lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Drops incomplete unordered fragments at or below the new cumulative
    /// TSN; complete messages already assembled stay readable.
    pub(crate) fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let mut released = 0;
        self.unordered_chunks.retain(|c| {
            if sna32_lte(c.tsn, new_cumulative_tsn) {
                released += c.user_data.len();
                false
            } else {
                true
            }
        });
        self.n_bytes -= released;
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}
