use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::chunk_type::CT_PAYLOAD_DATA;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const PAYLOAD_DATA_ENDING_FRAGMENT_BITMASK: u8 = 1;
pub(crate) const PAYLOAD_DATA_BEGINNING_FRAGMENT_BITMASK: u8 = 2;
pub(crate) const PAYLOAD_DATA_UNORDERED_BITMASK: u8 = 4;
pub(crate) const PAYLOAD_DATA_IMMEDIATE_SACK: u8 = 8;

/// DATA chunk value header: TSN, stream id, SSN and PPID before user data.
pub(crate) const PAYLOAD_DATA_HEADER_SIZE: usize = 12;

/// Payload protocol identifiers registered for WebRTC data channels.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadProtocolIdentifier {
    Dcep = 50,
    String = 51,
    Binary = 53,
    StringEmpty = 56,
    BinaryEmpty = 57,
    #[default]
    Unknown = 0,
}

impl From<u32> for PayloadProtocolIdentifier {
    fn from(v: u32) -> Self {
        match v {
            50 => PayloadProtocolIdentifier::Dcep,
            51 => PayloadProtocolIdentifier::String,
            53 => PayloadProtocolIdentifier::Binary,
            56 => PayloadProtocolIdentifier::StringEmpty,
            57 => PayloadProtocolIdentifier::BinaryEmpty,
            _ => PayloadProtocolIdentifier::Unknown,
        }
    }
}

impl fmt::Display for PayloadProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// A DATA chunk together with the sender-side bookkeeping that rides along
/// while it sits in the pending or inflight queue.
///
/// All fragments of one user message share the `abandoned`/`all_inflight`
/// pair, so abandoning any fragment abandons the message, and so clones of a
/// chunk (inflight entry, bundled packet) agree about its PR-SCTP state. A
/// chunk only reports itself abandoned once every fragment has left the
/// pending queue.
#[derive(Debug, Default, Clone)]
pub struct ChunkPayloadData {
    pub unordered: bool,
    pub beginning_fragment: bool,
    pub ending_fragment: bool,
    pub immediate_sack: bool,

    pub tsn: u32,
    pub stream_identifier: u16,
    pub stream_sequence_number: u16,
    pub payload_type: PayloadProtocolIdentifier,
    pub user_data: Bytes,

    /// Transmission count; a chunk with `n_sent > 1` never yields an RTT
    /// sample (Karn's algorithm).
    pub(crate) n_sent: u32,
    /// First-send timestamp, for RTT measurement and timed reliability.
    pub(crate) since: Option<Instant>,
    pub(crate) acked: bool,
    pub(crate) miss_indicator: u32,
    pub(crate) retransmit: bool,

    pub(crate) abandoned: Arc<AtomicBool>,
    pub(crate) all_inflight: Arc<AtomicBool>,
}

impl ChunkPayloadData {
    pub(crate) fn abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst) && self.all_inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn set_abandoned(&self, abandoned: bool) {
        self.abandoned.store(abandoned, Ordering::SeqCst);
    }

    /// Called when the ending fragment moves to the inflight queue; from
    /// here on the whole message can be abandoned.
    pub(crate) fn set_all_inflight(&self) {
        self.all_inflight.store(true, Ordering::SeqCst);
    }

    /// A fragment of the same message, sharing the abandonment state.
    pub(crate) fn sibling(&self) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        (Arc::clone(&self.abandoned), Arc::clone(&self.all_inflight))
    }

    pub(crate) fn with_shared_state(
        mut self,
        state: (Arc<AtomicBool>, Arc<AtomicBool>),
    ) -> Self {
        self.abandoned = state.0;
        self.all_inflight = state.1;
        self
    }

    pub(crate) fn value_length(&self) -> usize {
        PAYLOAD_DATA_HEADER_SIZE + self.user_data.len()
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        let mut flags = 0u8;
        if self.ending_fragment {
            flags |= PAYLOAD_DATA_ENDING_FRAGMENT_BITMASK;
        }
        if self.beginning_fragment {
            flags |= PAYLOAD_DATA_BEGINNING_FRAGMENT_BITMASK;
        }
        if self.unordered {
            flags |= PAYLOAD_DATA_UNORDERED_BITMASK;
        }
        if self.immediate_sack {
            flags |= PAYLOAD_DATA_IMMEDIATE_SACK;
        }
        let header = ChunkHeader {
            typ: CT_PAYLOAD_DATA,
            flags,
            value_length: self.value_length() as u16,
        };
        header.marshal_to(buf);
        buf.extend_from_slice(&self.tsn.to_be_bytes());
        buf.extend_from_slice(&self.stream_identifier.to_be_bytes());
        buf.extend_from_slice(&self.stream_sequence_number.to_be_bytes());
        buf.extend_from_slice(&(self.payload_type as u32).to_be_bytes());
        buf.extend_from_slice(&self.user_data);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.value_length() < PAYLOAD_DATA_HEADER_SIZE {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let flags = header.flags;
        Ok(ChunkPayloadData {
            ending_fragment: flags & PAYLOAD_DATA_ENDING_FRAGMENT_BITMASK != 0,
            beginning_fragment: flags & PAYLOAD_DATA_BEGINNING_FRAGMENT_BITMASK != 0,
            unordered: flags & PAYLOAD_DATA_UNORDERED_BITMASK != 0,
            immediate_sack: flags & PAYLOAD_DATA_IMMEDIATE_SACK != 0,
            tsn: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
            stream_identifier: u16::from_be_bytes([value[4], value[5]]),
            stream_sequence_number: u16::from_be_bytes([value[6], value[7]]),
            payload_type: u32::from_be_bytes([value[8], value[9], value[10], value[11]]).into(),
            user_data: value.slice(PAYLOAD_DATA_HEADER_SIZE..),
            ..Default::default()
        })
    }
}

impl fmt::Display for ChunkPayloadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DATA tsn={} si={} ssn={} ppi={} len={} ({}{}{}{})",
            self.tsn,
            self.stream_identifier,
            self.stream_sequence_number,
            self.payload_type,
            self.user_data.len(),
            if self.beginning_fragment { "B" } else { "" },
            if self.ending_fragment { "E" } else { "" },
            if self.unordered { "U" } else { "" },
            if self.immediate_sack { "I" } else { "" },
        )
    }
}
