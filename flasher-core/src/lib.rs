//! Core logic for identifying and flashing Silicon Labs radio coprocessors:
//! GBL image validation, the ASH/CPC/Spinel application protocols, the
//! Gecko bootloader's text menu, and XMODEM-CRC image transfer.
//!
//! The CLI crate is a thin wrapper around [`orchestrator::Flasher`]; this
//! crate has no knowledge of argument parsing or process exit codes.

pub mod error;
pub mod firmware;
pub mod framing;
pub mod gbl;
pub mod orchestrator;
pub mod session;
pub mod transport;
pub mod version;
pub mod xmodem;

pub use error::{Error, ImageError, Result};
pub use firmware::{ApplicationType, FirmwareImageType};
pub use gbl::{GblImage, NabuCasaMetadata};
pub use orchestrator::{evaluate_policy, Flasher, FlashPolicy, PolicyOutcome, ProbeConfig, ProbeMethod, ResetHook};
pub use session::ProbeResult;
pub use transport::{ScriptedTransport, SerialTransport, Transport};
pub use version::Version;
