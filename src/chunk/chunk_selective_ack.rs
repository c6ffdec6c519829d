use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::CT_SACK;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const SELECTIVE_ACK_MIN_LENGTH: usize = 12;

/// A contiguous run of received TSNs, as offsets from the cumulative TSN ack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for GapAckBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChunkSelectiveAck {
    pub cumulative_tsn_ack: u32,
    pub advertised_receiver_window_credit: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsn: Vec<u32>,
}

impl ChunkSelectiveAck {
    pub(crate) fn value_length(&self) -> usize {
        SELECTIVE_ACK_MIN_LENGTH + self.gap_ack_blocks.len() * 4 + self.duplicate_tsn.len() * 4
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        let header = ChunkHeader {
            typ: CT_SACK,
            flags: 0,
            value_length: self.value_length() as u16,
        };
        header.marshal_to(buf);
        buf.extend_from_slice(&self.cumulative_tsn_ack.to_be_bytes());
        buf.extend_from_slice(&self.advertised_receiver_window_credit.to_be_bytes());
        buf.extend_from_slice(&(self.gap_ack_blocks.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.duplicate_tsn.len() as u16).to_be_bytes());
        for g in &self.gap_ack_blocks {
            buf.extend_from_slice(&g.start.to_be_bytes());
            buf.extend_from_slice(&g.end.to_be_bytes());
        }
        for t in &self.duplicate_tsn {
            buf.extend_from_slice(&t.to_be_bytes());
        }
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.value_length() < SELECTIVE_ACK_MIN_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let num_gaps = u16::from_be_bytes([value[8], value[9]]) as usize;
        let num_dups = u16::from_be_bytes([value[10], value[11]]) as usize;
        if value.len() < SELECTIVE_ACK_MIN_LENGTH + (num_gaps + num_dups) * 4 {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let mut gap_ack_blocks = Vec::with_capacity(num_gaps);
        let mut offset = SELECTIVE_ACK_MIN_LENGTH;
        for _ in 0..num_gaps {
            gap_ack_blocks.push(GapAckBlock {
                start: u16::from_be_bytes([value[offset], value[offset + 1]]),
                end: u16::from_be_bytes([value[offset + 2], value[offset + 3]]),
            });
            offset += 4;
        }
        let mut duplicate_tsn = Vec::with_capacity(num_dups);
        for _ in 0..num_dups {
            duplicate_tsn.push(u32::from_be_bytes([
                value[offset],
                value[offset + 1],
                value[offset + 2],
                value[offset + 3],
            ]));
            offset += 4;
        }
        Ok(ChunkSelectiveAck {
            cumulative_tsn_ack: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
            advertised_receiver_window_credit: u32::from_be_bytes([
                value[4], value[5], value[6], value[7],
            ]),
            gap_ack_blocks,
            duplicate_tsn,
        })
    }
}

impl fmt::Display for ChunkSelectiveAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SACK cumTsnAck={} arwnd={} gaps={:?} dups={}",
            self.cumulative_tsn_ack,
            self.advertised_receiver_window_credit,
            self.gap_ack_blocks
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>(),
            self.duplicate_tsn.len(),
        )
    }
}
