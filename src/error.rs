use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Named association errors.
///
/// Handlers return an error only for conditions fatal to the association
/// (an observed ABORT); everything else is logged and absorbed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("abort chunk, with following errors: {0}")]
    ErrAbortChunk(String),
    #[error("shutdown called in non-established state")]
    ErrShutdownNonEstablished,
    #[error("association closed before connecting")]
    ErrAssociationClosedBeforeConn,
    #[error("association closed")]
    ErrAssociationClosed,
    #[error("silently discard")]
    ErrSilentlyDiscard,
    #[error("the init not stored to send")]
    ErrInitNotStoredToSend,
    #[error("cookie echo not stored to send")]
    ErrCookieEchoNotStoredToSend,
    #[error("sctp packet must not have a source port of 0")]
    ErrSctpPacketSourcePortZero,
    #[error("sctp packet must not have a destination port of 0")]
    ErrSctpPacketDestinationPortZero,
    #[error("init chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("init chunk expects a verification tag of 0 on the packet when out-of-the-blue")]
    ErrInitChunkVerifyTagNotZero,
    #[error("todo: handle init when in state")]
    ErrHandleInitState,
    #[error("no cookie in init ack")]
    ErrInitAckNoCookie,
    #[error("unable to be popped from inflight queue tsn: {0}")]
    ErrInflightQueueTsnPop(u32),
    #[error("requested non-existent tsn: {0}")]
    ErrTsnRequestNotExist(u32),
    #[error("sending reset packet in non-established state")]
    ErrResetPacketInStateNotExist,
    #[error("unexpected parameter type")]
    ErrParameterType,
    #[error("sending payload data in non-established state")]
    ErrPayloadDataStateNotExist,
    #[error("unhandled chunk type")]
    ErrChunkTypeUnhandled,
    #[error("handshake failed (INIT ACK)")]
    ErrHandshakeInitAck,
    #[error("handshake failed (COOKIE ECHO)")]
    ErrHandshakeCookieEcho,
    #[error("too many outstanding reconfig requests")]
    ErrTooManyReconfigRequests,

    #[error("raw is smaller than the minimum length for a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("unable to parse SCTP chunk, not enough data for complete header")]
    ErrParseSctpChunkNotEnoughData,
    #[error("checksum mismatch theirs")]
    ErrChecksumMismatch,

    #[error("chunk header is too short")]
    ErrChunkHeaderTooShort,
    #[error("chunk value is shorter than the declared length")]
    ErrChunkValueNotLongEnough,
    #[error("init chunk initiate tag must not be 0")]
    ErrChunkTypeInitInitiateTagZero,
    #[error("init chunk advertised receiver window credit must be >= 1500")]
    ErrInitAdvertisedReceiver1500,
    #[error("init chunk number of outbound streams must not be 0")]
    ErrInitOutboundStreamRequestZero,
    #[error("init chunk number of inbound streams must not be 0")]
    ErrInitInboundStreamRequestZero,
    #[error("param header is too short")]
    ErrParamHeaderTooShort,
    #[error("param value is shorter than the declared length")]
    ErrParamValueTooShort,
    #[error("error cause is too short")]
    ErrErrorCauseTooShort,

    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,
    #[error("stream closed")]
    ErrStreamClosed,
    #[error("stream already exists")]
    ErrStreamAlreadyExist,
    #[error("failed to create a stream")]
    ErrStreamCreateFailed,
    #[error("short buffer")]
    ErrShortBuffer,
}
