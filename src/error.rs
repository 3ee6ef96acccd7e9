use thiserror::Error;

/// Error kinds surfaced by the CTRL core.
///
/// Invalid inbound frames never show up here: the wire is untrusted, so a
/// frame that fails length, alignment or CMAC checks is dropped without a
/// reply (the peer retransmits once it misses our ACK).
#[derive(Debug, Error)]
pub enum CtrlError {
    /// An API call that needs a live TCP connection or an authenticated
    /// session arrived while we had neither.
    #[error("not connected to server")]
    NotConnected,

    /// The outbox is closed for business until the first sync ack of the
    /// session arrives.
    #[error("session not synchronized yet")]
    NotSynchronized,

    /// The encoded frame would not fit the u16 length prefix.
    #[error("payload too long for a single frame")]
    PayloadTooLong,

    /// The transport refused the bytes; the caller may retry.
    #[error("transport busy")]
    TransportBusy,

    /// The outbox is at capacity; the row was not queued.
    #[error("out of memory: outbox full")]
    OutOfMemory,

    /// Third OUT_OF_SYNC report within one session; the connection is torn
    /// down and the outbox wiped.
    #[error("out of sync with server, session aborted")]
    OutOfSyncFatal,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
