use bytes::{Bytes, BytesMut};
use rand::Rng;

use crate::error::Result;

pub(crate) const STATE_COOKIE_LENGTH: usize = 32;

/// The server-generated state cookie echoed back by the client to prove the
/// handshake is fresh. Generated from random bytes rather than the RFC 4960
/// sec 5.1.3 MAC construction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamStateCookie {
    pub cookie: Bytes,
}

impl ParamStateCookie {
    pub(crate) fn new<R: Rng>(rng: &mut R) -> Self {
        let mut cookie = vec![0u8; STATE_COOKIE_LENGTH];
        rng.fill(&mut cookie[..]);
        ParamStateCookie {
            cookie: Bytes::from(cookie),
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        self.cookie.len()
    }

    pub(crate) fn marshal_value(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.cookie);
        Ok(())
    }

    pub(crate) fn unmarshal(value: &Bytes) -> Result<Self> {
        Ok(ParamStateCookie {
            cookie: value.clone(),
        })
    }
}
