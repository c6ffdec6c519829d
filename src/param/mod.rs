pub mod param_heartbeat_info;
pub mod param_outgoing_reset_request;
pub mod param_reconfig_response;
pub mod param_state_cookie;
pub mod param_supported_extensions;
pub mod param_unknown;
pub mod param_zero_checksum;

#[cfg(test)]
mod param_test;

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use param_heartbeat_info::ParamHeartbeatInfo;
use param_outgoing_reset_request::ParamOutgoingResetRequest;
use param_reconfig_response::ParamReconfigResponse;
use param_state_cookie::ParamStateCookie;
use param_supported_extensions::ParamSupportedExtensions;
use param_unknown::ParamUnknown;
use param_zero_checksum::ParamZeroChecksumAcceptable;

pub(crate) const PARAM_HEADER_LENGTH: usize = 4;

pub(crate) const PT_HEARTBEAT_INFO: u16 = 1;
pub(crate) const PT_STATE_COOKIE: u16 = 7;
pub(crate) const PT_OUT_SSN_RESET_REQ: u16 = 13;
pub(crate) const PT_RECONFIG_RESPONSE: u16 = 16;
pub(crate) const PT_ZERO_CHECKSUM_ACCEPTABLE: u16 = 0x8001;
pub(crate) const PT_SUPPORTED_EXTENSIONS: u16 = 0x8008;

/// The closed set of parameter kinds carried by INIT/INIT-ACK, HEARTBEAT and
/// RECONFIG chunks. Unrecognized parameters round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    HeartbeatInfo(ParamHeartbeatInfo),
    StateCookie(ParamStateCookie),
    OutgoingResetRequest(ParamOutgoingResetRequest),
    ReconfigResponse(ParamReconfigResponse),
    SupportedExtensions(ParamSupportedExtensions),
    ZeroChecksumAcceptable(ParamZeroChecksumAcceptable),
    Unknown(ParamUnknown),
}

impl Param {
    pub(crate) fn param_type(&self) -> u16 {
        match self {
            Param::HeartbeatInfo(_) => PT_HEARTBEAT_INFO,
            Param::StateCookie(_) => PT_STATE_COOKIE,
            Param::OutgoingResetRequest(_) => PT_OUT_SSN_RESET_REQ,
            Param::ReconfigResponse(_) => PT_RECONFIG_RESPONSE,
            Param::SupportedExtensions(_) => PT_SUPPORTED_EXTENSIONS,
            Param::ZeroChecksumAcceptable(_) => PT_ZERO_CHECKSUM_ACCEPTABLE,
            Param::Unknown(p) => p.typ,
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Param::HeartbeatInfo(p) => p.value_length(),
            Param::StateCookie(p) => p.value_length(),
            Param::OutgoingResetRequest(p) => p.value_length(),
            Param::ReconfigResponse(p) => p.value_length(),
            Param::SupportedExtensions(p) => p.value_length(),
            Param::ZeroChecksumAcceptable(p) => p.value_length(),
            Param::Unknown(p) => p.value_length(),
        }
    }

    /// Writes the parameter header and value, without trailing padding.
    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.param_type().to_be_bytes());
        buf.extend_from_slice(
            &((PARAM_HEADER_LENGTH + self.value_length()) as u16).to_be_bytes(),
        );
        match self {
            Param::HeartbeatInfo(p) => p.marshal_value(buf),
            Param::StateCookie(p) => p.marshal_value(buf),
            Param::OutgoingResetRequest(p) => p.marshal_value(buf),
            Param::ReconfigResponse(p) => p.marshal_value(buf),
            Param::SupportedExtensions(p) => p.marshal_value(buf),
            Param::ZeroChecksumAcceptable(p) => p.marshal_value(buf),
            Param::Unknown(p) => p.marshal_value(buf),
        }
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PARAM_HEADER_LENGTH + self.value_length());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PARAM_HEADER_LENGTH {
            return Err(Error::ErrParamHeaderTooShort);
        }
        let typ = u16::from_be_bytes([raw[0], raw[1]]);
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if length < PARAM_HEADER_LENGTH || raw.len() < length {
            return Err(Error::ErrParamValueTooShort);
        }
        let value = raw.slice(PARAM_HEADER_LENGTH..length);
        Ok(match typ {
            PT_HEARTBEAT_INFO => Param::HeartbeatInfo(ParamHeartbeatInfo::unmarshal(&value)?),
            PT_STATE_COOKIE => Param::StateCookie(ParamStateCookie::unmarshal(&value)?),
            PT_OUT_SSN_RESET_REQ => {
                Param::OutgoingResetRequest(ParamOutgoingResetRequest::unmarshal(&value)?)
            }
            PT_RECONFIG_RESPONSE => {
                Param::ReconfigResponse(ParamReconfigResponse::unmarshal(&value)?)
            }
            PT_SUPPORTED_EXTENSIONS => {
                Param::SupportedExtensions(ParamSupportedExtensions::unmarshal(&value)?)
            }
            PT_ZERO_CHECKSUM_ACCEPTABLE => {
                Param::ZeroChecksumAcceptable(ParamZeroChecksumAcceptable::unmarshal(&value)?)
            }
            _ => Param::Unknown(ParamUnknown { typ, value }),
        })
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::OutgoingResetRequest(p) => write!(f, "{p}"),
            Param::ReconfigResponse(p) => write!(f, "{p}"),
            Param::StateCookie(p) => write!(f, "StateCookie len={}", p.cookie.len()),
            Param::HeartbeatInfo(_) => write!(f, "HeartbeatInfo"),
            Param::SupportedExtensions(_) => write!(f, "SupportedExtensions"),
            Param::ZeroChecksumAcceptable(p) => write!(f, "ZeroChecksum edmid={}", p.edmid),
            Param::Unknown(p) => write!(f, "ParamUnknown type={}", p.typ),
        }
    }
}
