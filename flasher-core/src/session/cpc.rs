//! CPC session (§4.4, C4): property get/set against the co-processor's
//! system control endpoint, used to command a bootloader reboot, plus the
//! dedicated secondary-version endpoint (§4.2) used to identify the RCP's
//! running application version.
//!
//! The property ids below are not published by the upstream CPC daemon's
//! own documentation bundle carried alongside this tool; they are this
//! tool's own internal property numbering, kept consistent between the
//! `get` and `set` calls that use them. Sequence/ack bookkeeping has no
//! dedicated header field in §4.2's 7-byte layout, so it is folded into the
//! two spare bits of `control` the same way ASH packs frame kind and
//! sequence/ack into a single control byte.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::firmware::ApplicationType;
use crate::framing::cpc::{self, CpcDecoder, CpcFrame};
use crate::session::ProbeResult;
use crate::transport::Transport;
use crate::version::Version;

const SYSTEM_ENDPOINT: u8 = 0;
/// The secondary-side version query endpoint (§4.2): identifies the
/// application version actually running on the RCP, as distinct from the
/// system endpoint's own link-protocol version.
const SECONDARY_VERSION_ENDPOINT: u8 = 15;

const FRAME_TYPE_GET: u8 = 0;
const FRAME_TYPE_IS: u8 = 1;
const FRAME_TYPE_SET: u8 = 2;

const PROP_CPC_VERSION: u16 = 0x0001;
const PROP_BOOTLOADER_REBOOT_MODE: u16 = 0x0002;
const PROP_REBOOT: u16 = 0x0003;

/// Requests a reboot straight into the bootloader's standalone mode.
const REBOOT_MODE_BOOTLOADER: u8 = 2;

const MAX_RETRIES: u32 = 3;

/// Consecutive malformed frames tolerated before giving up on the link
/// (§7's propagation policy: resync locally, but not forever).
const BAD_FRAME_BUDGET: u32 = 10;

/// Packs a frame type (2 bits) and this link's seq/ack (3 bits each) into
/// the single `control` byte the wire header has room for.
fn build_control(frame_type: u8, seq: u8, ack: u8) -> u8 {
    (frame_type << 6) | ((seq & 0x7) << 3) | (ack & 0x7)
}

fn frame_type_of(control: u8) -> u8 {
    control >> 6
}

struct CpcLink<'t> {
    transport: &'t mut dyn Transport,
    decoder: CpcDecoder,
    seq: u8,
}

impl<'t> CpcLink<'t> {
    fn new(transport: &'t mut dyn Transport) -> Self {
        CpcLink {
            transport,
            decoder: CpcDecoder::new(),
            seq: 0,
        }
    }

    async fn next_frame(&mut self, endpoint: u8, deadline: Duration) -> Result<CpcFrame> {
        let mut consecutive_bad = 0u32;
        loop {
            let mut buf = [0u8; 128];
            let n = self.transport.read_with_deadline(&mut buf, deadline).await?;
            for result in self.decoder.push(&buf[..n]) {
                match result {
                    Ok(frame) if frame.endpoint == endpoint => return Ok(frame),
                    Ok(_) => continue,
                    Err(_) => {
                        consecutive_bad += 1;
                        if consecutive_bad >= BAD_FRAME_BUDGET {
                            return Err(Error::SessionFailed(
                                "CPC link exceeded its consecutive bad-frame budget".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn exchange(
        &mut self,
        endpoint: u8,
        frame_type: u8,
        property: u16,
        value: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(2 + value.len());
        payload.extend_from_slice(&property.to_le_bytes());
        payload.extend_from_slice(value);

        for _ in 0..MAX_RETRIES {
            let control = build_control(frame_type, self.seq, self.seq);
            let frame = CpcFrame {
                endpoint,
                control,
                payload: payload.clone(),
            };
            self.transport.write_all(&cpc::encode(&frame)).await?;
            self.seq = self.seq.wrapping_add(1) & 0x7;

            match self.next_frame(endpoint, deadline).await {
                Ok(reply) if frame_type_of(reply.control) == FRAME_TYPE_IS && reply.payload.len() >= 2 => {
                    return Ok(reply.payload[2..].to_vec());
                }
                _ => continue,
            }
        }
        Err(Error::SessionFailed("CPC property exchange never completed".into()))
    }
}

fn parse_triple_version(value: &[u8]) -> Result<Version> {
    if value.len() < 12 {
        return Err(Error::ProtocolError("CPC version property shorter than three u32 components".into()));
    }
    let major = u32::from_le_bytes(value[0..4].try_into().unwrap());
    let minor = u32::from_le_bytes(value[4..8].try_into().unwrap());
    let patch = u32::from_le_bytes(value[8..12].try_into().unwrap());
    Ok(Version::parse(&format!("{major}.{minor}.{patch}")).expect("dotted decimal of three integers always parses"))
}

/// Attempts to identify a CPC RCP at the transport's current baud rate.
/// Confirms the link over the system endpoint's `PROP_CPC_VERSION`, then
/// reads the application version actually running on the RCP from the
/// dedicated secondary-version endpoint (§4.2) — the system endpoint only
/// identifies the CPC link protocol itself, not the firmware on top of it.
/// Both properties carry three little-endian `u32` version components, not
/// a text string (§4.4).
pub async fn probe(transport: &mut dyn Transport, deadline: Duration) -> Result<ProbeResult> {
    let mut link = CpcLink::new(transport);
    link.exchange(SYSTEM_ENDPOINT, FRAME_TYPE_GET, PROP_CPC_VERSION, &[], deadline).await?;

    let secondary = link
        .exchange(SECONDARY_VERSION_ENDPOINT, FRAME_TYPE_GET, PROP_CPC_VERSION, &[], deadline)
        .await?;
    let app_version = parse_triple_version(&secondary)?;

    Ok(ProbeResult {
        app_type: ApplicationType::Cpc,
        app_version,
        baudrate_used: 0,
        ezsp_protocol_version: None,
    })
}

/// Commands the RCP to reboot into the Gecko bootloader.
pub async fn launch_bootloader(transport: &mut dyn Transport, deadline: Duration) -> Result<()> {
    let mut link = CpcLink::new(transport);
    link.exchange(
        SYSTEM_ENDPOINT,
        FRAME_TYPE_SET,
        PROP_BOOTLOADER_REBOOT_MODE,
        &[REBOOT_MODE_BOOTLOADER],
        deadline,
    )
    .await?;
    link.exchange(SYSTEM_ENDPOINT, FRAME_TYPE_SET, PROP_REBOOT, &[1], deadline).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn is_frame(endpoint: u8, seq: u8, property: u16, value: &[u8]) -> CpcFrame {
        let mut payload = property.to_le_bytes().to_vec();
        payload.extend_from_slice(value);
        CpcFrame {
            endpoint,
            control: build_control(FRAME_TYPE_IS, seq, seq),
            payload,
        }
    }

    fn get_frame(endpoint: u8, seq: u8, property: u16) -> CpcFrame {
        CpcFrame {
            endpoint,
            control: build_control(FRAME_TYPE_GET, seq, seq),
            payload: property.to_le_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn probe_reads_secondary_endpoint_version() {
        let mut system_value = 4u32.to_le_bytes().to_vec();
        system_value.extend_from_slice(&3u32.to_le_bytes());
        system_value.extend_from_slice(&1u32.to_le_bytes());

        let mut secondary_value = 5u32.to_le_bytes().to_vec();
        secondary_value.extend_from_slice(&0u32.to_le_bytes());
        secondary_value.extend_from_slice(&2u32.to_le_bytes());

        let mut t = ScriptedTransport::new(115200)
            .expect_write(cpc::encode(&get_frame(SYSTEM_ENDPOINT, 0, PROP_CPC_VERSION)))
            .then_read(cpc::encode(&is_frame(SYSTEM_ENDPOINT, 0, PROP_CPC_VERSION, &system_value)))
            .expect_write(cpc::encode(&get_frame(SECONDARY_VERSION_ENDPOINT, 1, PROP_CPC_VERSION)))
            .then_read(cpc::encode(&is_frame(SECONDARY_VERSION_ENDPOINT, 1, PROP_CPC_VERSION, &secondary_value)));

        let result = probe(&mut t, Duration::from_millis(10)).await.unwrap();
        assert_eq!(result.app_type, ApplicationType::Cpc);
        assert_eq!(result.app_version, Version::parse("5.0.2").unwrap());
    }
}
