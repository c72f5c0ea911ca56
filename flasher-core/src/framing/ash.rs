//! ASH (Asynchronous Serial Host) framing: byte-stuffing, the pseudo-random
//! XOR scrambler, and CRC-16/CCITT-FALSE framing (§4.2).

use crc::{Crc, CRC_16_IBM_3740};

use crate::error::Error;

/// This layer's own CRC-16 instance. Deliberately not shared with CPC's
/// header/FCS CRC even though the parameters are identical — see the
/// "implement once, don't share instances across layers" design note.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const XOR_ESCAPE: u8 = 0x20;

fn needs_escape(b: u8) -> bool {
    matches!(b, 0x7E | 0x7D | 0x11 | 0x13 | 0x18 | 0x1A)
}

/// Pseudo-random scrambler sequence: seeded at 0x42, advanced by
/// `x <- (x >> 1) ^ ((x & 1) * 0xB8)`. The emitted byte is the state
/// *before* advancing, so the first byte XORed into a frame is 0x42 itself.
struct Randomizer(u8);

impl Randomizer {
    fn new() -> Self {
        Randomizer(0x42)
    }
}

impl Iterator for Randomizer {
    type Item = u8;
    fn next(&mut self) -> Option<u8> {
        let out = self.0;
        self.0 = (self.0 >> 1) ^ ((self.0 & 1).wrapping_mul(0xB8));
        Some(out)
    }
}

fn scramble(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().zip(Randomizer::new()).map(|(b, r)| b ^ r).collect()
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
                .ok_or_else(|| Error::FramingError("truncated escape sequence".into()))?;
            out.push(next ^ XOR_ESCAPE);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// A decoded ASH frame (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AshFrame {
    Data { frm_num: u8, ack_num: u8, payload: Vec<u8> },
    Ack { ack_num: u8 },
    Nak { ack_num: u8 },
    Rst,
    RstAck { version: u8, reset_code: u8 },
    Error { version: u8, error_code: u8 },
}

fn control_and_payload(frame: &AshFrame) -> (u8, Vec<u8>) {
    match frame {
        AshFrame::Data { frm_num, ack_num, payload } => {
            (((frm_num & 0x7) << 4) | (ack_num & 0x7), payload.clone())
        }
        AshFrame::Ack { ack_num } => (0x80 | (ack_num & 0x7), Vec::new()),
        AshFrame::Nak { ack_num } => (0xA0 | (ack_num & 0x7), Vec::new()),
        AshFrame::Rst => (0xC0, Vec::new()),
        AshFrame::RstAck { version, reset_code } => (0xC1, vec![*version, *reset_code]),
        AshFrame::Error { version, error_code } => (0xC2, vec![*version, *error_code]),
    }
}

/// Encodes a complete wire frame, flags included.
pub fn encode(frame: &AshFrame) -> Vec<u8> {
    let (control, payload) = control_and_payload(frame);
    let mut body = Vec::with_capacity(1 + payload.len() + 2);
    body.push(control);
    body.extend_from_slice(&payload);
    let crc = CRC16.checksum(&body);
    body.extend_from_slice(&crc.to_be_bytes());

    let scrambled = scramble(&body);
    let stuffed = stuff(&scrambled);

    let mut out = Vec::with_capacity(stuffed.len() + 2);
    out.push(FLAG);
    out.extend_from_slice(&stuffed);
    out.push(FLAG);
    out
}

/// Decodes a single frame's interior bytes (the bytes strictly between two
/// flags, not including the flags themselves).
pub fn decode(interior: &[u8]) -> Result<AshFrame, Error> {
    let unstuffed = unstuff(interior)?;
    let body = scramble(&unstuffed); // XOR is self-inverse
    if body.len() < 3 {
        return Err(Error::FramingError("ASH frame shorter than control+CRC".into()));
    }
    let (head, crc_bytes) = body.split_at(body.len() - 2);
    let expected_crc = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
    let actual_crc = CRC16.checksum(head);
    if expected_crc != actual_crc {
        return Err(Error::FramingError("ASH frame CRC mismatch".into()));
    }

    let control = head[0];
    let payload = &head[1..];
    if control & 0x80 == 0 {
        Ok(AshFrame::Data {
            frm_num: (control >> 4) & 0x7,
            ack_num: control & 0x7,
            payload: payload.to_vec(),
        })
    } else if control & 0xE0 == 0x80 {
        Ok(AshFrame::Ack { ack_num: control & 0x7 })
    } else if control & 0xE0 == 0xA0 {
        Ok(AshFrame::Nak { ack_num: control & 0x7 })
    } else if control == 0xC0 {
        Ok(AshFrame::Rst)
    } else if control == 0xC1 {
        if payload.len() < 2 {
            return Err(Error::FramingError("RSTACK payload too short".into()));
        }
        Ok(AshFrame::RstAck { version: payload[0], reset_code: payload[1] })
    } else if control == 0xC2 {
        if payload.len() < 2 {
            return Err(Error::FramingError("ERROR payload too short".into()));
        }
        Ok(AshFrame::Error { version: payload[0], error_code: payload[1] })
    } else {
        Err(Error::FramingError(format!("unrecognized ASH control byte {control:#04x}")))
    }
}

/// Streaming frame extractor: feed it bytes as they arrive from the
/// transport, get back zero or more decode results. Restartable after a
/// delimiter; bytes preceding the first flag are dropped silently (§4.2).
#[derive(Default)]
pub struct AshDecoder {
    buf: Vec<u8>,
    in_frame: bool,
}

impl AshDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<AshFrame, Error>> {
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
            // bytes before the first flag are simply never buffered.
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = AshFrame::Data { frm_num: 3, ack_num: 5, payload: vec![1, 2, 3, 0x7E, 0x7D] };
        let wire = encode(&frame);
        assert_eq!(wire.first(), Some(&FLAG));
        assert_eq!(wire.last(), Some(&FLAG));
        let decoded = decode(&wire[1..wire.len() - 1]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn control_frames_round_trip() {
        for frame in [
            AshFrame::Ack { ack_num: 2 },
            AshFrame::Nak { ack_num: 1 },
            AshFrame::Rst,
            AshFrame::RstAck { version: 2, reset_code: 0 },
            AshFrame::Error { version: 2, error_code: 0x51 },
        ] {
            let wire = encode(&frame);
            let decoded = decode(&wire[1..wire.len() - 1]).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn decoder_streams_multiple_frames() {
        let a = AshFrame::Rst;
        let b = AshFrame::Ack { ack_num: 0 };
        let mut wire = encode(&a);
        wire.extend_from_slice(&encode(&b));

        let mut decoder = AshDecoder::new();
        let results = decoder.push(&wire);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &a);
        assert_eq!(results[1].as_ref().unwrap(), &b);
    }

    #[test]
    fn garbage_before_first_flag_is_dropped() {
        let mut wire = vec![0xFF, 0xEE, 0xDD];
        wire.extend_from_slice(&encode(&AshFrame::Rst));
        let mut decoder = AshDecoder::new();
        let results = decoder.push(&wire);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &AshFrame::Rst);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut wire = encode(&AshFrame::Rst);
        let last = wire.len() - 2; // last byte before trailing flag
        wire[last] ^= 0xFF;
        assert!(decode(&wire[1..wire.len() - 1]).is_err());
    }
}
