pub mod chunk_abort;
pub mod chunk_cookie;
pub mod chunk_error;
pub mod chunk_forward_tsn;
pub mod chunk_heartbeat;
pub mod chunk_init;
pub mod chunk_payload_data;
pub mod chunk_reconfig;
pub mod chunk_selective_ack;
pub mod chunk_shutdown;
pub mod chunk_type;
pub mod chunk_unknown;


use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::get_padding;
use chunk_abort::ChunkAbort;
use chunk_cookie::{ChunkCookieAck, ChunkCookieEcho};
use chunk_error::ChunkError;
use chunk_forward_tsn::ChunkForwardTsn;
use chunk_heartbeat::{ChunkHeartbeat, ChunkHeartbeatAck};
use chunk_init::ChunkInit;
use chunk_payload_data::ChunkPayloadData;
use chunk_reconfig::ChunkReconfig;
use chunk_selective_ack::ChunkSelectiveAck;
use chunk_shutdown::{ChunkShutdown, ChunkShutdownAck, ChunkShutdownComplete};
use chunk_type::*;
use chunk_unknown::ChunkUnknown;

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

/// The 4-byte header every chunk starts with: type, flags and the value
/// length including the header itself (excluding padding).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub typ: ChunkType,
    pub flags: u8,
    pub value_length: u16,
}

impl ChunkHeader {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooShort);
        }
        let length = u16::from_be_bytes([raw[2], raw[3]]);
        if (length as usize) < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooShort);
        }
        let value_length = length - CHUNK_HEADER_SIZE as u16;
        if raw.len() < CHUNK_HEADER_SIZE + value_length as usize {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        Ok(ChunkHeader {
            typ: ChunkType(raw[0]),
            flags: raw[1],
            value_length,
        })
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.typ.0, self.flags]);
        buf.extend_from_slice(&(self.value_length + CHUNK_HEADER_SIZE as u16).to_be_bytes());
    }

    pub(crate) fn value_length(&self) -> usize {
        self.value_length as usize
    }
}

impl fmt::Display for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typ)
    }
}

/// The closed set of chunk kinds an association handles. Dispatch is a
/// single `match`; kinds we do not know parse into `Unknown` so the chunks
/// parsed before them still get processed.
#[derive(Debug, Clone)]
pub enum Chunk {
    Init(ChunkInit),
    InitAck(ChunkInit),
    PayloadData(ChunkPayloadData),
    Sack(ChunkSelectiveAck),
    Heartbeat(ChunkHeartbeat),
    HeartbeatAck(ChunkHeartbeatAck),
    Abort(ChunkAbort),
    Shutdown(ChunkShutdown),
    ShutdownAck(ChunkShutdownAck),
    Error(ChunkError),
    CookieEcho(ChunkCookieEcho),
    CookieAck(ChunkCookieAck),
    ShutdownComplete(ChunkShutdownComplete),
    Reconfig(ChunkReconfig),
    ForwardTsn(ChunkForwardTsn),
    Unknown(ChunkUnknown),
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Init(_) => CT_INIT,
            Chunk::InitAck(_) => CT_INIT_ACK,
            Chunk::PayloadData(_) => CT_PAYLOAD_DATA,
            Chunk::Sack(_) => CT_SACK,
            Chunk::Heartbeat(_) => CT_HEARTBEAT,
            Chunk::HeartbeatAck(_) => CT_HEARTBEAT_ACK,
            Chunk::Abort(_) => CT_ABORT,
            Chunk::Shutdown(_) => CT_SHUTDOWN,
            Chunk::ShutdownAck(_) => CT_SHUTDOWN_ACK,
            Chunk::Error(_) => CT_ERROR,
            Chunk::CookieEcho(_) => CT_COOKIE_ECHO,
            Chunk::CookieAck(_) => CT_COOKIE_ACK,
            Chunk::ShutdownComplete(_) => CT_SHUTDOWN_COMPLETE,
            Chunk::Reconfig(_) => CT_RECONFIG,
            Chunk::ForwardTsn(_) => CT_FORWARD_TSN,
            Chunk::Unknown(c) => ChunkType(c.typ),
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self {
            Chunk::Init(c) | Chunk::InitAck(c) => c.check(),
            _ => Ok(()),
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Chunk::Init(c) | Chunk::InitAck(c) => c.value_length(),
            Chunk::PayloadData(c) => c.value_length(),
            Chunk::Sack(c) => c.value_length(),
            Chunk::Heartbeat(c) => c.value_length(),
            Chunk::HeartbeatAck(c) => c.value_length(),
            Chunk::Abort(c) => c.value_length(),
            Chunk::Shutdown(_) => chunk_shutdown::SHUTDOWN_VALUE_LENGTH,
            Chunk::ShutdownAck(_) | Chunk::ShutdownComplete(_) | Chunk::CookieAck(_) => 0,
            Chunk::Error(c) => c.value_length(),
            Chunk::CookieEcho(c) => c.value_length(),
            Chunk::Reconfig(c) => c.value_length(),
            Chunk::ForwardTsn(c) => c.value_length(),
            Chunk::Unknown(c) => c.value_length(),
        }
    }

    /// Writes the chunk header followed by the value, without trailing
    /// padding; padding between chunks is the packet's concern.
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Chunk::Init(c) => c.marshal_to(false, buf),
            Chunk::InitAck(c) => c.marshal_to(true, buf),
            Chunk::PayloadData(c) => c.marshal_to(buf),
            Chunk::Sack(c) => c.marshal_to(buf),
            Chunk::Heartbeat(c) => c.marshal_to(buf),
            Chunk::HeartbeatAck(c) => c.marshal_to(buf),
            Chunk::Abort(c) => c.marshal_to(buf),
            Chunk::Shutdown(c) => c.marshal_to(buf),
            Chunk::ShutdownAck(c) => c.marshal_to(buf),
            Chunk::Error(c) => c.marshal_to(buf),
            Chunk::CookieEcho(c) => c.marshal_to(buf),
            Chunk::CookieAck(c) => c.marshal_to(buf),
            Chunk::ShutdownComplete(c) => c.marshal_to(buf),
            Chunk::Reconfig(c) => c.marshal_to(buf),
            Chunk::ForwardTsn(c) => c.marshal_to(buf),
            Chunk::Unknown(c) => c.marshal_to(buf),
        }
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.value_length());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parses one chunk starting at `raw[0]`. The number of bytes consumed
    /// is `CHUNK_HEADER_SIZE + value_length()` plus padding, computed by the
    /// caller.
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::ErrChunkHeaderTooShort);
        }
        Ok(match ChunkType(raw[0]) {
            CT_INIT => Chunk::Init(ChunkInit::unmarshal(raw)?),
            CT_INIT_ACK => Chunk::InitAck(ChunkInit::unmarshal(raw)?),
            CT_PAYLOAD_DATA => Chunk::PayloadData(ChunkPayloadData::unmarshal(raw)?),
            CT_SACK => Chunk::Sack(ChunkSelectiveAck::unmarshal(raw)?),
            CT_HEARTBEAT => Chunk::Heartbeat(ChunkHeartbeat::unmarshal(raw)?),
            CT_HEARTBEAT_ACK => Chunk::HeartbeatAck(ChunkHeartbeatAck::unmarshal(raw)?),
            CT_ABORT => Chunk::Abort(ChunkAbort::unmarshal(raw)?),
            CT_SHUTDOWN => Chunk::Shutdown(ChunkShutdown::unmarshal(raw)?),
            CT_SHUTDOWN_ACK => Chunk::ShutdownAck(ChunkShutdownAck::unmarshal(raw)?),
            CT_ERROR => Chunk::Error(ChunkError::unmarshal(raw)?),
            CT_COOKIE_ECHO => Chunk::CookieEcho(ChunkCookieEcho::unmarshal(raw)?),
            CT_COOKIE_ACK => Chunk::CookieAck(ChunkCookieAck::unmarshal(raw)?),
            CT_SHUTDOWN_COMPLETE => {
                Chunk::ShutdownComplete(ChunkShutdownComplete::unmarshal(raw)?)
            }
            CT_RECONFIG => Chunk::Reconfig(ChunkReconfig::unmarshal(raw)?),
            CT_FORWARD_TSN => Chunk::ForwardTsn(ChunkForwardTsn::unmarshal(raw)?),
            _ => Chunk::Unknown(ChunkUnknown::unmarshal(raw)?),
        })
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::PayloadData(c) => write!(f, "{c}"),
            Chunk::Sack(c) => write!(f, "{c}"),
            Chunk::ForwardTsn(c) => write!(f, "{c}"),
            Chunk::Abort(c) => write!(f, "{c}"),
            Chunk::Error(c) => write!(f, "{c}"),
            Chunk::Unknown(c) => write!(f, "{c}"),
            other => write!(f, "{}", other.chunk_type()),
        }
    }
}

/// Marshals a parameter list the way chunk values embed it: every parameter
/// padded to a 4-byte boundary except the last.
pub(crate) fn marshal_params(params: &[crate::param::Param], buf: &mut BytesMut) -> Result<()> {
    for (idx, p) in params.iter().enumerate() {
        p.marshal_to(buf)?;
        if idx != params.len() - 1 {
            let padding = get_padding(p.value_length());
            buf.extend_from_slice(&[0u8; 3][..padding]);
        }
    }
    Ok(())
}

/// Total wire length of a parameter list including inter-parameter padding.
pub(crate) fn params_length(params: &[crate::param::Param]) -> usize {
    let mut length = 0;
    for (idx, p) in params.iter().enumerate() {
        let l = crate::param::PARAM_HEADER_LENGTH + p.value_length();
        length += l;
        if idx != params.len() - 1 {
            length += get_padding(l);
        }
    }
    length
}

/// Parses a packed parameter list out of a chunk value.
pub(crate) fn unmarshal_params(raw: &Bytes) -> Result<Vec<crate::param::Param>> {
    let mut params = vec![];
    let mut offset = 0;
    while offset + crate::param::PARAM_HEADER_LENGTH <= raw.len() {
        let p = crate::param::Param::unmarshal(&raw.slice(offset..))?;
        let length = crate::param::PARAM_HEADER_LENGTH + p.value_length();
        offset += length + get_padding(length);
        params.push(p);
    }
    Ok(params)
}
