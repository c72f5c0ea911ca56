use crate::firmware::{ApplicationType, FirmwareImageType};
use crate::version::Version;

/// Errors surfaced by the flasher core, per the error kinds in the core
/// design: recoverable framing hiccups are absorbed locally and never reach
/// here (see [`crate::framing`]); what does reach here is either a hard I/O
/// failure, an exhausted retry budget, or a policy refusal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error("no probe method succeeded at any configured baud rate")]
    ProbeExhausted,

    #[error(transparent)]
    ImageInvalid(#[from] ImageError),

    #[error(
        "refusing cross-flash: running {app_type:?} firmware is not \
         compatible with image type {image_type:?} (pass --allow-cross-flashing to override)"
    )]
    CrossFlashRefused {
        app_type: ApplicationType,
        image_type: FirmwareImageType,
    },

    #[error(
        "refusing downgrade: image version {image} is older than running \
         version {running} (pass --allow-downgrades or --force to override)"
    )]
    DowngradeRefused { running: Version, image: Version },

    #[error("failed to enter the Gecko bootloader: {0}")]
    BootloaderEntryFailed(String),

    #[error("XMODEM transfer failed at block {block}: {reason}")]
    XmodemFailed { block: u32, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

/// Failure modes specific to GBL image parsing and validation (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("malformed GBL image: {0}")]
    MalformedGbl(String),

    #[error("GBL CRC-32 checksum mismatch")]
    ChecksumMismatch,

    #[error("GBL image has no NabuCasa metadata record")]
    MissingMetadata,
}

pub type Result<T> = std::result::Result<T, Error>;
