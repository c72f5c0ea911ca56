//! Spinel (host-to-NCP control protocol used by OpenThread RCPs) session
//! (§4.5, C5): property get/set over HDLC-lite framing.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::firmware::ApplicationType;
use crate::framing::hdlc_lite::{self, HdlcLiteDecoder};
use crate::session::ProbeResult;
use crate::transport::Transport;
use crate::version::Version;

const CMD_RESET: u32 = 1;
const CMD_PROP_VALUE_GET: u32 = 2;
const CMD_PROP_VALUE_SET: u32 = 3;
const CMD_PROP_VALUE_IS: u32 = 6;

const PROP_NCP_VERSION: u32 = 2;
const PROP_CAPS: u32 = 5;
/// Vendor-range property this tool uses to trigger a bootloader reboot on
/// Silicon Labs RCPs; not part of the open Spinel property registry.
const PROP_STREAM_BOOTLOADER: u32 = 0x3C00;

const MAX_TID: u8 = 15;
const MAX_RETRIES: u32 = 3;

/// Consecutive malformed packets tolerated before giving up on the link
/// (§7's propagation policy: resync locally, but not forever).
const BAD_FRAME_BUDGET: u32 = 10;

/// Encodes a Spinel packed-unsigned-integer (7 bits per byte, little-end
/// first, continuation bit set on all but the last byte).
fn encode_packed(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

fn decode_packed(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        value |= ((b & 0x7F) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

struct SpinelLink<'t> {
    transport: &'t mut dyn Transport,
    decoder: HdlcLiteDecoder,
    tid: u8,
}

impl<'t> SpinelLink<'t> {
    fn new(transport: &'t mut dyn Transport) -> Self {
        SpinelLink {
            transport,
            decoder: HdlcLiteDecoder::new(),
            tid: 1,
        }
    }

    fn next_tid(&mut self) -> u8 {
        let tid = self.tid;
        self.tid = if self.tid == MAX_TID { 1 } else { self.tid + 1 };
        tid
    }

    async fn next_packet(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        let mut consecutive_bad = 0u32;
        loop {
            let mut buf = [0u8; 128];
            let n = self.transport.read_with_deadline(&mut buf, deadline).await?;
            for result in self.decoder.push(&buf[..n]) {
                match result {
                    Ok(packet) => return Ok(packet),
                    Err(_) => {
                        consecutive_bad += 1;
                        if consecutive_bad >= BAD_FRAME_BUDGET {
                            return Err(Error::SessionFailed(
                                "Spinel link exceeded its consecutive bad-frame budget".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Sends a command and waits for the response carrying the matching tid.
    async fn command(&mut self, cmd: u32, body: &[u8], deadline: Duration) -> Result<Vec<u8>> {
        for _ in 0..MAX_RETRIES {
            let tid = self.next_tid();
            let header = 0x80 | tid;
            let mut packet = vec![header];
            packet.extend_from_slice(&encode_packed(cmd));
            packet.extend_from_slice(body);
            self.transport.write_all(&hdlc_lite::encode(&packet)).await?;

            match self.next_packet(deadline).await {
                Ok(response) if response.first() == Some(&(0x80 | tid)) => {
                    return Ok(response[1..].to_vec());
                }
                _ => continue,
            }
        }
        Err(Error::SessionFailed("Spinel command exchange never completed".into()))
    }

    async fn get_property(&mut self, property: u32, deadline: Duration) -> Result<Vec<u8>> {
        let body = encode_packed(property);
        let response = self.command(CMD_PROP_VALUE_GET, &body, deadline).await?;
        let (cmd, consumed) =
            decode_packed(&response).ok_or_else(|| Error::ProtocolError("malformed Spinel command id".into()))?;
        if cmd != CMD_PROP_VALUE_IS {
            return Err(Error::ProtocolError(format!(
                "expected CMD_PROP_VALUE_IS in reply, got {cmd}"
            )));
        }
        let rest = &response[consumed..];
        let (got_property, prop_consumed) =
            decode_packed(rest).ok_or_else(|| Error::ProtocolError("malformed Spinel property id".into()))?;
        if got_property != property {
            return Err(Error::ProtocolError(format!(
                "expected property {property} in reply, got {got_property}"
            )));
        }
        Ok(rest[prop_consumed..].to_vec())
    }
}

/// Attempts to identify a Spinel RCP at the transport's current baud rate.
pub async fn probe(transport: &mut dyn Transport, deadline: Duration) -> Result<ProbeResult> {
    let mut link = SpinelLink::new(transport);
    let _caps = link.get_property(PROP_CAPS, deadline).await?;
    let version_bytes = link.get_property(PROP_NCP_VERSION, deadline).await?;
    let text = std::str::from_utf8(&version_bytes)
        .map_err(|_| Error::ProtocolError("Spinel NCP version property was not valid UTF-8".into()))?;
    let text = text.trim_end_matches('\0');
    let app_version = Version::parse(text)
        .ok_or_else(|| Error::ProtocolError(format!("Spinel NCP version '{text}' did not parse")))?;

    Ok(ProbeResult {
        app_type: ApplicationType::Spinel,
        app_version,
        baudrate_used: 0,
        ezsp_protocol_version: None,
    })
}

/// Commands the RCP to reboot into the Gecko bootloader via the vendor
/// `STREAM_BOOTLOADER` property.
pub async fn launch_bootloader(transport: &mut dyn Transport, deadline: Duration) -> Result<()> {
    let mut link = SpinelLink::new(transport);
    let tid = link.next_tid();
    let header = 0x80 | tid;
    let mut packet = vec![header];
    packet.extend_from_slice(&encode_packed(CMD_PROP_VALUE_SET));
    packet.extend_from_slice(&encode_packed(PROP_STREAM_BOOTLOADER));
    packet.push(1);
    link.transport.write_all(&hdlc_lite::encode(&packet)).await?;

    match link.next_packet(deadline).await {
        Ok(_) => Ok(()),
        Err(Error::Timeout) => {
            // Some RCPs drop the link before acking this one; the reboot
            // itself is what matters, not the response.
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn is_packet(tid: u8, property: u32, value: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80 | tid];
        packet.extend_from_slice(&encode_packed(CMD_PROP_VALUE_IS));
        packet.extend_from_slice(&encode_packed(property));
        packet.extend_from_slice(value);
        packet
    }

    #[test]
    fn packed_uint_round_trips_across_boundary() {
        for v in [0u32, 1, 127, 128, 0x3C00, 0xFFFF] {
            let encoded = encode_packed(v);
            let (decoded, consumed) = decode_packed(&encoded).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[tokio::test]
    async fn probe_reads_caps_then_version() {
        let mut t = ScriptedTransport::new(115200)
            .expect_write(hdlc_lite::encode(&{
                let mut p = vec![0x81];
                p.extend_from_slice(&encode_packed(CMD_PROP_VALUE_GET));
                p.extend_from_slice(&encode_packed(PROP_CAPS));
                p
            }))
            .then_read(hdlc_lite::encode(&is_packet(1, PROP_CAPS, &[0x01])))
            .expect_write(hdlc_lite::encode(&{
                let mut p = vec![0x82];
                p.extend_from_slice(&encode_packed(CMD_PROP_VALUE_GET));
                p.extend_from_slice(&encode_packed(PROP_NCP_VERSION));
                p
            }))
            .then_read(hdlc_lite::encode(&is_packet(2, PROP_NCP_VERSION, b"2.4.1\0")));

        let result = probe(&mut t, Duration::from_millis(10)).await.unwrap();
        assert_eq!(result.app_type, ApplicationType::Spinel);
        assert_eq!(result.app_version, Version::parse("2.4.1").unwrap());
    }
}
