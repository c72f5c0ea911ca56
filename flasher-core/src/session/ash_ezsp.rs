//! ASH link management and the EZSP command layer built on top of it (§4.3,
//! C3). EZSP identifies a running Zigbee NCP image and can command it to
//! reboot into the Gecko bootloader.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::firmware::ApplicationType;
use crate::framing::ash::{self, AshDecoder, AshFrame};
use crate::session::ProbeResult;
use crate::transport::Transport;
use crate::version::Version;

const MAX_RESET_ATTEMPTS: u32 = 3;
const MAX_DATA_RETRIES: u32 = 3;

/// Consecutive malformed frames tolerated before giving up on the link
/// (§7's propagation policy: resync locally, but not forever).
const BAD_FRAME_BUDGET: u32 = 10;

/// EZSP frame ids this tool needs. EZSP versions up to 7 use a one-byte
/// frame id in a fixed position; from protocol version 8 onward NCPs
/// negotiate an extended frame format with a two-byte id space. Exactly
/// where that cutover lands is left unstated by the upstream protocol
/// documentation bundled with this tool, so [`launch_bootloader_frame_id`]
/// treats it as a version-gated lookup rather than a single constant.
mod ezsp_frame_id {
    pub const VERSION: u8 = 0x00;
    pub const GET_MFG_TOKEN: u8 = 0x0B;
    pub const SET_MFG_TOKEN: u8 = 0x0C;
    pub const LAUNCH_STANDALONE_BOOTLOADER_LEGACY: u8 = 0x8F;
    pub const LAUNCH_STANDALONE_BOOTLOADER_V8: u8 = 0x8F;
}

/// The manufacturing token carrying the device's custom IEEE/EUI-64 address
/// (used by `write-ieee`, §6).
const MFG_CUSTOM_EUI64_TOKEN: u8 = 0x01;

/// The manufacturing token carrying the free-form build-identification
/// string (e.g. `"7.1.3.0 GA"`) that probing parses as the application
/// version (§4.3).
const MFG_STRING_TOKEN: u8 = 0x00;

/// Protocol version the host proposes first, per §4.3's negotiation: the
/// NCP's `version` response reveals the highest protocol version *it*
/// supports, and the host re-sends `version` with that value if it differs.
const DESIRED_PROTOCOL_VERSION: u8 = 0x04;

/// Requests the bootloader run in standalone "normal" mode, i.e. go straight
/// to the XMODEM menu rather than waiting for further EZSP traffic.
const STANDALONE_BOOTLOADER_NORMAL_MODE: u16 = 1;

fn launch_bootloader_frame_id(ezsp_version: u8) -> u8 {
    if ezsp_version >= 8 {
        ezsp_frame_id::LAUNCH_STANDALONE_BOOTLOADER_V8
    } else {
        ezsp_frame_id::LAUNCH_STANDALONE_BOOTLOADER_LEGACY
    }
}

/// Drives the ASH link's reset handshake and stop-and-wait DATA exchange.
/// Only one exchange is ever outstanding at a time (§5's window-of-one).
struct AshLink<'t> {
    transport: &'t mut dyn Transport,
    decoder: AshDecoder,
    frm_num: u8,
    ack_num: u8,
}

impl<'t> AshLink<'t> {
    fn new(transport: &'t mut dyn Transport) -> Self {
        AshLink {
            transport,
            decoder: AshDecoder::new(),
            frm_num: 0,
            ack_num: 0,
        }
    }

    async fn next_frame(&mut self, deadline: Duration) -> Result<AshFrame> {
        let mut consecutive_bad = 0u32;
        loop {
            let mut buf = [0u8; 64];
            let n = self.transport.read_with_deadline(&mut buf, deadline).await?;
            for result in self.decoder.push(&buf[..n]) {
                match result {
                    Ok(frame) => return Ok(frame),
                    Err(_) => {
                        // resync on the next flag, per §4.3, up to a budget
                        consecutive_bad += 1;
                        if consecutive_bad >= BAD_FRAME_BUDGET {
                            return Err(Error::SessionFailed(
                                "ASH link exceeded its consecutive bad-frame budget".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Sends RST and waits for RSTACK, establishing (or re-establishing)
    /// the link at frm_num = ack_num = 0.
    async fn reset(&mut self, deadline: Duration) -> Result<u8> {
        for _ in 0..MAX_RESET_ATTEMPTS {
            self.transport.write_all(&ash::encode(&AshFrame::Rst)).await?;
            match self.next_frame(deadline).await {
                Ok(AshFrame::RstAck { version, .. }) => {
                    self.frm_num = 0;
                    self.ack_num = 0;
                    return Ok(version);
                }
                _ => continue,
            }
        }
        Err(Error::SessionFailed("ASH link never produced RSTACK".into()))
    }

    /// Sends one EZSP command frame and returns the matching response
    /// payload, handling the DATA/ACK exchange transparently.
    async fn command(&mut self, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
        for _ in 0..MAX_DATA_RETRIES {
            let frame = AshFrame::Data {
                frm_num: self.frm_num,
                ack_num: self.ack_num,
                payload: payload.to_vec(),
            };
            self.transport.write_all(&ash::encode(&frame)).await?;

            match self.next_frame(deadline).await {
                Ok(AshFrame::Ack { ack_num }) if ack_num == (self.frm_num + 1) & 0x7 => {
                    self.frm_num = (self.frm_num + 1) & 0x7;
                }
                Ok(AshFrame::Nak { .. }) => continue,
                Ok(_) => continue,
                Err(_) => continue,
            }

            match self.next_frame(deadline).await {
                Ok(AshFrame::Data { frm_num, payload, .. }) => {
                    self.ack_num = (frm_num + 1) & 0x7;
                    self.transport
                        .write_all(&ash::encode(&AshFrame::Ack { ack_num: self.ack_num }))
                        .await?;
                    return Ok(payload);
                }
                _ => continue,
            }
        }
        Err(Error::SessionFailed("EZSP command exchange never completed".into()))
    }
}

fn ezsp_frame(seq: u8, frame_id: u8, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + params.len());
    out.push(seq);
    out.push(0x00); // frame control: host -> NCP, no-callback command
    out.push(frame_id);
    out.extend_from_slice(params);
    out
}

/// Strips the 3-byte `[seq, frameControl, frameId]` header a response frame
/// carries on the wire, leaving just the command's own parameter bytes.
fn ezsp_params(frame: &[u8]) -> Result<&[u8]> {
    frame
        .get(3..)
        .ok_or_else(|| Error::ProtocolError("EZSP response frame shorter than its header".into()))
}

/// Negotiates the EZSP protocol version used for the rest of the session:
/// propose [`DESIRED_PROTOCOL_VERSION`], then re-propose whatever the NCP
/// reports as its own maximum if that differs (§4.3).
async fn negotiate_version(link: &mut AshLink<'_>, deadline: Duration) -> Result<u8> {
    let response = link
        .command(&ezsp_frame(0, ezsp_frame_id::VERSION, &[DESIRED_PROTOCOL_VERSION]), deadline)
        .await?;
    let params = ezsp_params(&response)?;
    if params.is_empty() {
        return Err(Error::ProtocolError("EZSP VERSION response was empty".into()));
    }
    let ncp_max_version = params[0];
    if ncp_max_version == DESIRED_PROTOCOL_VERSION {
        return Ok(ncp_max_version);
    }
    link.command(&ezsp_frame(1, ezsp_frame_id::VERSION, &[ncp_max_version]), deadline)
        .await?;
    Ok(ncp_max_version)
}

/// Attempts to identify an EZSP NCP at the transport's current baud rate.
/// Returns `Err(Error::Timeout)` if nothing answers, so callers can try the
/// next candidate baud rate without treating it as a hard failure (§4.8).
///
/// The application version is read from the `MFG_STRING` token's build
/// string (e.g. `"7.1.3.0 GA"`), not derived from the `version` command's
/// stack-version bytes — those only identify the EmberZNet stack build, not
/// the specific application image flashed on top of it (§4.3, §8 scenario
/// S2).
pub async fn probe(transport: &mut dyn Transport, deadline: Duration) -> Result<ProbeResult> {
    let mut link = AshLink::new(transport);
    link.reset(deadline).await?;
    let ezsp_protocol_version = negotiate_version(&mut link, deadline).await?;

    let response = link
        .command(&ezsp_frame(2, ezsp_frame_id::GET_MFG_TOKEN, &[MFG_STRING_TOKEN]), deadline)
        .await?;
    let params = ezsp_params(&response)?;
    if params.is_empty() {
        return Err(Error::ProtocolError("EZSP mfg-token response was empty".into()));
    }
    let token_len = params[0] as usize;
    let token_data = params.get(1..1 + token_len).unwrap_or(&params[1..]);
    let build_string = std::str::from_utf8(token_data)
        .map_err(|_| Error::ProtocolError("EZSP MFG_STRING token was not valid UTF-8".into()))?
        .trim_end_matches('\0')
        .trim();
    let app_version = Version::parse(build_string)
        .ok_or_else(|| Error::ProtocolError(format!("EZSP build string '{build_string}' did not parse")))?;

    Ok(ProbeResult {
        app_type: ApplicationType::Ezsp,
        app_version,
        baudrate_used: 0,
        ezsp_protocol_version: Some(ezsp_protocol_version),
    })
}

/// Commands the NCP to reboot into the Gecko bootloader (§4.3's C8 trigger).
pub async fn launch_bootloader(
    transport: &mut dyn Transport,
    ezsp_version: u8,
    deadline: Duration,
) -> Result<()> {
    let mut link = AshLink::new(transport);
    link.reset(deadline).await?;

    let frame_id = launch_bootloader_frame_id(ezsp_version);
    let params = STANDALONE_BOOTLOADER_NORMAL_MODE.to_le_bytes();
    let response = link.command(&ezsp_frame(1, frame_id, &params), deadline).await?;
    let status = ezsp_params(&response).ok().and_then(|p| p.first().copied());
    match status {
        Some(0x00) => Ok(()),
        Some(code) => Err(Error::BootloaderEntryFailed(format!(
            "NCP rejected launchStandaloneBootloader with status {code:#04x}"
        ))),
        None => Err(Error::BootloaderEntryFailed(
            "launchStandaloneBootloader response was empty".into(),
        )),
    }
}

/// Reads the device's custom EUI-64 manufacturing token (used by the
/// `write-ieee` subcommand's read-back verification).
pub async fn read_eui64(transport: &mut dyn Transport, deadline: Duration) -> Result<[u8; 8]> {
    let mut link = AshLink::new(transport);
    link.reset(deadline).await?;

    let response = link
        .command(&ezsp_frame(2, ezsp_frame_id::GET_MFG_TOKEN, &[MFG_CUSTOM_EUI64_TOKEN]), deadline)
        .await?;
    let params = ezsp_params(&response)?;
    if params.len() < 1 + 8 {
        return Err(Error::ProtocolError("EZSP mfg-token response too short for an EUI-64".into()));
    }
    let mut eui = [0u8; 8];
    eui.copy_from_slice(&params[1..9]);
    Ok(eui)
}

/// Writes the device's custom IEEE/EUI-64 manufacturing token (used by the
/// `write-ieee` subcommand, §6). Callers are expected to read it back with
/// [`read_eui64`] afterward to confirm the write took.
pub async fn write_eui64(transport: &mut dyn Transport, eui: [u8; 8], deadline: Duration) -> Result<()> {
    let mut link = AshLink::new(transport);
    link.reset(deadline).await?;

    let mut params = vec![MFG_CUSTOM_EUI64_TOKEN, eui.len() as u8];
    params.extend_from_slice(&eui);
    let response = link.command(&ezsp_frame(3, ezsp_frame_id::SET_MFG_TOKEN, &params), deadline).await?;
    let status = ezsp_params(&response).ok().and_then(|p| p.first().copied());
    match status {
        Some(0x00) => Ok(()),
        Some(code) => Err(Error::ProtocolError(format!("NCP rejected setMfgToken with status {code:#04x}"))),
        None => Err(Error::ProtocolError("setMfgToken response was empty".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::ash::{encode, AshFrame};
    use crate::transport::ScriptedTransport;

    fn rstack_bytes(version: u8) -> Vec<u8> {
        encode(&AshFrame::RstAck { version, reset_code: 2 })
    }

    fn data(frm_num: u8, ack_num: u8, payload: Vec<u8>) -> AshFrame {
        AshFrame::Data { frm_num, ack_num, payload }
    }

    /// §8 scenario S2: RSTACK, then `version(0x04)` reporting stack type 2 /
    /// stack version 0x6771 (EmberZNet 7.1.3), then `getMfgToken(MFG_STRING)`
    /// returning `"7.1.3.0 GA"`.
    #[tokio::test]
    async fn probe_reads_version_from_mfg_string_token() {
        let version_params = [DESIRED_PROTOCOL_VERSION, 2, 0x71, 0x67]; // stack type 2, version 0x6771 LE
        let version_reply = ezsp_frame(0, ezsp_frame_id::VERSION, &version_params);

        let build_string = b"7.1.3.0 GA";
        let mut mfg_params = vec![build_string.len() as u8];
        mfg_params.extend_from_slice(build_string);
        let mfg_reply = ezsp_frame(0, ezsp_frame_id::GET_MFG_TOKEN, &mfg_params);

        let mut t = ScriptedTransport::new(115200)
            .expect_write(encode(&AshFrame::Rst))
            .then_read(rstack_bytes(2))
            .expect_write(encode(&data(
                0,
                0,
                ezsp_frame(0, ezsp_frame_id::VERSION, &[DESIRED_PROTOCOL_VERSION]),
            )))
            .then_read(encode(&AshFrame::Ack { ack_num: 1 }))
            .then_read(encode(&data(0, 0, version_reply)))
            .expect_write(encode(&AshFrame::Ack { ack_num: 1 }))
            .expect_write(encode(&data(
                1,
                1,
                ezsp_frame(2, ezsp_frame_id::GET_MFG_TOKEN, &[MFG_STRING_TOKEN]),
            )))
            .then_read(encode(&AshFrame::Ack { ack_num: 2 }))
            .then_read(encode(&data(1, 1, mfg_reply)))
            .expect_write(encode(&AshFrame::Ack { ack_num: 2 }));

        let result = probe(&mut t, Duration::from_millis(10)).await.unwrap();
        assert_eq!(result.app_type, ApplicationType::Ezsp);
        assert_eq!(result.app_version, Version::parse("7.1.3.0").unwrap());
    }

    #[tokio::test]
    async fn write_eui64_reports_ncp_rejection() {
        let eui = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let mut params = vec![MFG_CUSTOM_EUI64_TOKEN, 8];
        params.extend_from_slice(&eui);
        let reply = ezsp_frame(0, ezsp_frame_id::SET_MFG_TOKEN, &[0x01]); // non-zero status

        let mut t = ScriptedTransport::new(115200)
            .expect_write(encode(&AshFrame::Rst))
            .then_read(rstack_bytes(2))
            .expect_write(encode(&data(0, 0, ezsp_frame(3, ezsp_frame_id::SET_MFG_TOKEN, &params))))
            .then_read(encode(&AshFrame::Ack { ack_num: 1 }))
            .then_read(encode(&data(0, 0, reply)))
            .expect_write(encode(&AshFrame::Ack { ack_num: 1 }));

        let err = write_eui64(&mut t, eui, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
    }
}
