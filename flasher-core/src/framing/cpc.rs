//! CPC (Co-Processor Communication) framing (§4.2): a fixed 7-byte header
//! `[flag, len_lo, len_hi, endpoint, control, hcs_lo, hcs_hi]` followed by an
//! optional payload and a 2-byte FCS, each independently checksummed with
//! CRC-16/CCITT-FALSE.

use crc::{Crc, CRC_16_IBM_3740};

use crate::error::Error;

/// This layer's own CRC-16 instance — see the note in `ash.rs` about not
/// sharing instances across layers even when parameters coincide.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Marks the start of a CPC frame on the wire. Part of the header itself —
/// the HCS is computed over the flag along with the rest of the header,
/// not just the fields following it (§4.2).
const FLAG: u8 = 0x14;

const HEADER_LEN: usize = 7;

/// A single CPC frame: the fixed 7-byte header plus a variable-length
/// payload, both independently checksummed. Sequence/ack bookkeeping lives
/// in `control`, the way the spec's header leaves it — there is no separate
/// seq/ack field on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpcFrame {
    pub endpoint: u8,
    pub control: u8,
    pub payload: Vec<u8>,
}

fn header_bytes(frame: &CpcFrame) -> [u8; HEADER_LEN] {
    let len = frame.payload.len() as u16;
    let mut header = [0u8; HEADER_LEN];
    header[0] = FLAG;
    header[1..3].copy_from_slice(&len.to_le_bytes());
    header[3] = frame.endpoint;
    header[4] = frame.control;
    let hcs = CRC16.checksum(&header[0..5]);
    header[5..7].copy_from_slice(&hcs.to_le_bytes());
    header
}

/// Serializes a frame to its complete wire form: the 7-byte header
/// (flag included) followed by the payload and its trailing FCS.
pub fn encode(frame: &CpcFrame) -> Vec<u8> {
    let header = header_bytes(frame);
    let fcs = CRC16.checksum(&frame.payload);

    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len() + 2);
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    out.extend_from_slice(&fcs.to_le_bytes());
    out
}

/// Decodes one frame out of `bytes`, which must begin with the sync flag.
/// Returns the frame and the number of bytes consumed, so callers can
/// advance past it and keep scanning the rest of a buffer.
pub fn decode(bytes: &[u8]) -> Result<(CpcFrame, usize), Error> {
    if bytes.first() != Some(&FLAG) {
        return Err(Error::FramingError("CPC frame missing sync flag".into()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(Error::FramingError("CPC frame shorter than header".into()));
    }
    let header = &bytes[0..HEADER_LEN];
    let expected_hcs = u16::from_le_bytes([header[5], header[6]]);
    let actual_hcs = CRC16.checksum(&header[0..5]);
    if expected_hcs != actual_hcs {
        return Err(Error::FramingError("CPC header checksum mismatch".into()));
    }

    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    let endpoint = header[3];
    let control = header[4];

    let payload_start = HEADER_LEN;
    let payload_end = payload_start + len;
    let frame_end = payload_end + 2;
    if bytes.len() < frame_end {
        return Err(Error::FramingError("CPC frame payload/FCS overruns buffer".into()));
    }

    let payload = &bytes[payload_start..payload_end];
    let expected_fcs = u16::from_le_bytes([bytes[payload_end], bytes[payload_end + 1]]);
    let actual_fcs = CRC16.checksum(payload);
    if expected_fcs != actual_fcs {
        return Err(Error::FramingError("CPC payload checksum mismatch".into()));
    }

    Ok((
        CpcFrame {
            endpoint,
            control,
            payload: payload.to_vec(),
        },
        frame_end,
    ))
}

/// Streaming frame extractor. Resynchronizes on the next [`FLAG`] byte if a
/// frame fails to decode, rather than giving up on the whole stream.
#[derive(Default)]
pub struct CpcDecoder {
    buf: Vec<u8>,
}

impl CpcDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<CpcFrame, Error>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let Some(start) = self.buf.iter().position(|&b| b == FLAG) else {
                self.buf.clear();
                break;
            };
            if start > 0 {
                self.buf.drain(0..start);
            }

            match decode(&self.buf) {
                Ok((frame, consumed)) => {
                    self.buf.drain(0..consumed);
                    out.push(Ok(frame));
                }
                Err(e) if self.buf.len() < HEADER_LEN + 2 => {
                    // Might just be incomplete so far; wait for more bytes.
                    let _ = e;
                    break;
                }
                Err(e) => {
                    // Corrupt frame: drop the flag byte and keep scanning.
                    self.buf.drain(0..1);
                    out.push(Err(e));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = CpcFrame {
            endpoint: 2,
            control: 0,
            payload: vec![0x01, 0x02, 0x03, 0x04],
        };
        let wire = encode(&frame);
        let (decoded, consumed) = decode(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn header_matches_bit_exact_layout() {
        let frame = CpcFrame {
            endpoint: 5,
            control: 7,
            payload: vec![0xAA, 0xBB],
        };
        let wire = encode(&frame);
        assert_eq!(wire[0], FLAG);
        assert_eq!(&wire[1..3], &2u16.to_le_bytes()); // len
        assert_eq!(wire[3], 5); // endpoint
        assert_eq!(wire[4], 7); // control
        let hcs = CRC16.checksum(&wire[0..5]);
        assert_eq!(&wire[5..7], &hcs.to_le_bytes());
        assert_eq!(&wire[7..9], &[0xAA, 0xBB]);
    }

    #[test]
    fn decoder_resyncs_after_corruption() {
        let good = CpcFrame {
            endpoint: 1,
            control: 0,
            payload: vec![0xAA],
        };
        let mut wire = encode(&good);
        wire[2] ^= 0xFF; // corrupt the length field inside the header
        wire.extend_from_slice(&encode(&good));

        let mut decoder = CpcDecoder::new();
        let results = decoder.push(&wire);
        assert!(results.iter().any(|r| r.is_err()));
        assert!(results.iter().any(|r| r.as_ref().ok() == Some(&good)));
    }

    #[test]
    fn decoder_waits_for_more_bytes_on_partial_frame() {
        let frame = CpcFrame {
            endpoint: 1,
            control: 0,
            payload: vec![1, 2, 3],
        };
        let wire = encode(&frame);
        let mut decoder = CpcDecoder::new();
        let partial = decoder.push(&wire[..wire.len() - 3]);
        assert!(partial.is_empty());
        let rest = decoder.push(&wire[wire.len() - 3..]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].as_ref().unwrap(), &frame);
    }
}
