use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_type::{CT_FORWARD_TSN, CT_RECONFIG};
use super::{marshal_params, params_length, unmarshal_params, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::param::param_supported_extensions::ParamSupportedExtensions;
use crate::param::Param;

pub(crate) const INIT_CHUNK_MIN_LENGTH: usize = 16;

/// INIT and INIT-ACK share one layout: initiate tag, advertised receiver
/// window credit, stream counts, initial TSN and a parameter list. Which of
/// the two a value is depends on the chunk type that carried it.
#[derive(Debug, Default, Clone)]
pub struct ChunkInit {
    pub initiate_tag: u32,
    pub advertised_receiver_window_credit: u32,
    pub num_outbound_streams: u16,
    pub num_inbound_streams: u16,
    pub initial_tsn: u32,
    pub params: Vec<Param>,
}

impl ChunkInit {
    /// Advertises RECONFIG and FORWARD-TSN support to the peer.
    pub(crate) fn set_supported_extensions(&mut self) {
        self.params
            .push(Param::SupportedExtensions(ParamSupportedExtensions {
                chunk_types: vec![CT_RECONFIG, CT_FORWARD_TSN],
            }));
    }

    pub(crate) fn check(&self) -> Result<()> {
        // RFC 4960 sec 3.3.2: a receiver of an INIT with the Initiate Tag
        // set to zero MUST treat it as an error and discard.
        if self.initiate_tag == 0 {
            return Err(Error::ErrChunkTypeInitInitiateTagZero);
        }
        if self.advertised_receiver_window_credit < 1500 {
            return Err(Error::ErrInitAdvertisedReceiver1500);
        }
        if self.num_outbound_streams == 0 {
            return Err(Error::ErrInitOutboundStreamRequestZero);
        }
        if self.num_inbound_streams == 0 {
            return Err(Error::ErrInitInboundStreamRequestZero);
        }
        Ok(())
    }

    pub(crate) fn value_length(&self) -> usize {
        INIT_CHUNK_MIN_LENGTH + params_length(&self.params)
    }

    pub(crate) fn marshal_to(&self, is_ack: bool, buf: &mut BytesMut) -> Result<()> {
        let header = ChunkHeader {
            typ: if is_ack {
                super::chunk_type::CT_INIT_ACK
            } else {
                super::chunk_type::CT_INIT
            },
            flags: 0,
            value_length: self.value_length() as u16,
        };
        header.marshal_to(buf);
        buf.extend_from_slice(&self.initiate_tag.to_be_bytes());
        buf.extend_from_slice(&self.advertised_receiver_window_credit.to_be_bytes());
        buf.extend_from_slice(&self.num_outbound_streams.to_be_bytes());
        buf.extend_from_slice(&self.num_inbound_streams.to_be_bytes());
        buf.extend_from_slice(&self.initial_tsn.to_be_bytes());
        marshal_params(&self.params, buf)
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.value_length() < INIT_CHUNK_MIN_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let params = unmarshal_params(&value.slice(INIT_CHUNK_MIN_LENGTH..))?;
        Ok(ChunkInit {
            initiate_tag: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
            advertised_receiver_window_credit: u32::from_be_bytes([
                value[4], value[5], value[6], value[7],
            ]),
            num_outbound_streams: u16::from_be_bytes([value[8], value[9]]),
            num_inbound_streams: u16::from_be_bytes([value[10], value[11]]),
            initial_tsn: u32::from_be_bytes([value[12], value[13], value[14], value[15]]),
            params,
        })
    }
}

impl fmt::Display for ChunkInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "initiate_tag={} a_rwnd={} streams=({},{}) initial_tsn={}",
            self.initiate_tag,
            self.advertised_receiver_window_credit,
            self.num_outbound_streams,
            self.num_inbound_streams,
            self.initial_tsn,
        )
    }
}
