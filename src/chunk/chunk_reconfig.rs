use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::CT_RECONFIG;
use super::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::Result;
use crate::param::{Param, PARAM_HEADER_LENGTH};
use crate::util::get_padding;

/// RE-CONFIG chunk (RFC 6525): carries one reconfiguration parameter,
/// optionally followed by a second.
#[derive(Debug, Default, Clone)]
pub struct ChunkReconfig {
    pub param_a: Option<Param>,
    pub param_b: Option<Param>,
}

impl ChunkReconfig {
    pub(crate) fn value_length(&self) -> usize {
        let mut length = 0;
        if let Some(a) = &self.param_a {
            length += PARAM_HEADER_LENGTH + a.value_length();
        }
        if let Some(b) = &self.param_b {
            length += get_padding(length) + PARAM_HEADER_LENGTH + b.value_length();
        }
        length
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        ChunkHeader {
            typ: CT_RECONFIG,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(buf);
        if let Some(a) = &self.param_a {
            a.marshal_to(buf)?;
            if self.param_b.is_some() {
                let l = PARAM_HEADER_LENGTH + a.value_length();
                buf.extend_from_slice(&[0u8; 3][..get_padding(l)]);
            }
        }
        if let Some(b) = &self.param_b {
            b.marshal_to(buf)?;
        }
        Ok(())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let mut param_a = None;
        let mut param_b = None;
        if value.len() >= PARAM_HEADER_LENGTH {
            let a = Param::unmarshal(&value)?;
            let l = PARAM_HEADER_LENGTH + a.value_length();
            let offset = l + get_padding(l);
            param_a = Some(a);
            if value.len() >= offset + PARAM_HEADER_LENGTH {
                param_b = Some(Param::unmarshal(&value.slice(offset..))?);
            }
        }
        Ok(ChunkReconfig { param_a, param_b })
    }
}

impl fmt::Display for ChunkReconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RECONFIG")?;
        if let Some(a) = &self.param_a {
            write!(f, " {a}")?;
        }
        if let Some(b) = &self.param_b {
            write!(f, " {b}")?;
        }
        Ok(())
    }
}
