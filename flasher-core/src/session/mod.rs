//! Application-identification sessions (§4.3–§4.6, C3–C6).
//!
//! Each session type knows how to identify itself at an unknown baud rate
//! and, where applicable, command a reboot into the Gecko bootloader. These
//! are modeled as a closed, tagged sum rather than a shared trait object
//! (§9 design note) — the set of application kinds this tool speaks to is
//! fixed by the hardware family, not something a caller extends at runtime.

pub mod ash_ezsp;
pub mod bootloader;
pub mod cpc;
pub mod spinel;

use crate::firmware::ApplicationType;
use crate::version::Version;

/// The outcome of successfully identifying the application running on the
/// far end of the transport.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub app_type: ApplicationType,
    pub app_version: Version,
    pub baudrate_used: u32,
    /// The negotiated EZSP protocol version (§4.3), when `app_type` is
    /// [`ApplicationType::Ezsp`]. `None` for every other application kind,
    /// and for EZSP itself until a probe has actually negotiated one.
    pub ezsp_protocol_version: Option<u8>,
}
