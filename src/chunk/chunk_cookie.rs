use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::{CT_COOKIE_ACK, CT_COOKIE_ECHO};
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::Result;

/// COOKIE-ECHO returns the state cookie from an INIT-ACK verbatim.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkCookieEcho {
    pub cookie: Bytes,
}

impl ChunkCookieEcho {
    pub(crate) fn value_length(&self) -> usize {
        self.cookie.len()
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_COOKIE_ECHO,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        buf.extend_from_slice(&self.cookie);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        Ok(ChunkCookieEcho {
            cookie: raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length()),
        })
    }
}

impl fmt::Display for ChunkCookieEcho {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COOKIE-ECHO len={}", self.cookie.len())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkCookieAck;

impl ChunkCookieAck {
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_COOKIE_ACK,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(buf);
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        ChunkHeader::unmarshal(raw)?;
        Ok(ChunkCookieAck)
    }
}
