//! Spinel's HDLC-lite framing (§4.5): a smaller escape set than ASH, no
//! scrambling, and CRC-16/CCITT with a reflected, non-complemented residue.

use crc::{Crc, CRC_16_X_25};

use crate::error::Error;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_X_25);

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const XOR_ESCAPE: u8 = 0x20;

fn needs_escape(b: u8) -> bool {
    matches!(b, 0x7E | 0x7D)
}

fn stuff(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ XOR_ESCAPE);
        } else {
            out.push(b);
        }
    }
    out
}

fn unstuff(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            let next = iter
                .next()
                .ok_or_else(|| Error::FramingError("truncated HDLC-lite escape sequence".into()))?;
            out.push(next ^ XOR_ESCAPE);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Encodes a Spinel packet payload into a complete wire frame (flags, CRC,
/// escaping included).
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let crc = CRC16.checksum(payload);
    let mut body = Vec::with_capacity(payload.len() + 2);
    body.extend_from_slice(payload);
    body.extend_from_slice(&crc.to_le_bytes());

    let stuffed = stuff(&body);
    let mut out = Vec::with_capacity(stuffed.len() + 2);
    out.push(FLAG);
    out.extend_from_slice(&stuffed);
    out.push(FLAG);
    out
}

/// Decodes a frame's interior bytes (between two flags) into its Spinel
/// packet payload, verifying the trailing CRC.
pub fn decode(interior: &[u8]) -> Result<Vec<u8>, Error> {
    let body = unstuff(interior)?;
    if body.len() < 2 {
        return Err(Error::FramingError("HDLC-lite frame shorter than a CRC".into()));
    }
    let (payload, crc_bytes) = body.split_at(body.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let actual = CRC16.checksum(payload);
    if expected != actual {
        return Err(Error::FramingError("HDLC-lite frame CRC mismatch".into()));
    }
    Ok(payload.to_vec())
}

/// Streaming frame extractor. Empty frames (back-to-back flags, used by
/// some Spinel NCPs as keepalive/sync noise) are skipped rather than
/// surfaced as errors (§4.5).
#[derive(Default)]
pub struct HdlcLiteDecoder {
    buf: Vec<u8>,
    in_frame: bool,
}

impl HdlcLiteDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, Error>> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == FLAG {
                if self.in_frame && !self.buf.is_empty() {
                    out.push(decode(&self.buf));
                }
                self.buf.clear();
                self.in_frame = true;
            } else if self.in_frame {
                self.buf.push(b);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let payload = vec![0x80, 0x02, 0x02, 0x7E, 0x7D, 0x01];
        let wire = encode(&payload);
        assert_eq!(wire.first(), Some(&FLAG));
        assert_eq!(wire.last(), Some(&FLAG));
        let decoded = decode(&wire[1..wire.len() - 1]).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn empty_frames_are_skipped_by_the_decoder() {
        let mut wire = vec![FLAG, FLAG, FLAG];
        wire.extend_from_slice(&encode(&[0x80, 0x01]));
        let mut decoder = HdlcLiteDecoder::new();
        let results = decoder.push(&wire);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &vec![0x80, 0x01]);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut wire = encode(&[0x80, 0x02]);
        let last = wire.len() - 2;
        wire[last] ^= 0xFF;
        assert!(decode(&wire[1..wire.len() - 1]).is_err());
    }
}
