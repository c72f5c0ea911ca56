//! XMODEM-CRC transfer (§4.6): the bootloader's "upload gbl" menu option
//! drops the link into a raw byte pipe and speaks this protocol until the
//! image has been sent.

use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM};

use crate::error::{Error, Result};
use crate::transport::Transport;

const BLOCK_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_MODE: u8 = b'C';

const BLOCK_LEN: usize = 128;
const MAX_RETRIES_PER_BLOCK: u32 = 10;
const MAX_CONSECUTIVE_CANCELS: u32 = 2;

/// Invoked after each block is acknowledged, with `(blocks_sent, total_blocks)`.
pub type ProgressFn<'a> = dyn FnMut(usize, usize) + 'a;

/// Pads the final short block with this filler byte, per the original
/// XMODEM convention (SUB / Ctrl-Z).
const PAD: u8 = 0x1A;

fn blocks(data: &[u8]) -> Vec<[u8; BLOCK_LEN]> {
    data.chunks(BLOCK_LEN)
        .map(|chunk| {
            let mut block = [PAD; BLOCK_LEN];
            block[..chunk.len()].copy_from_slice(chunk);
            block
        })
        .collect()
}

/// Drives an XMODEM-CRC send of `data` over `transport`, which must already
/// be parked at the bootloader's upload prompt. Blocks are numbered 1..=255
/// and wrap back to 1, as required by the protocol (§4.6).
pub async fn send(
    transport: &mut dyn Transport,
    data: &[u8],
    deadline: Duration,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<()> {
    wait_for_handshake(transport, deadline).await?;

    let chunks = blocks(data);
    let total = chunks.len();
    let mut block_no: u8 = 1;

    for (index, chunk) in chunks.iter().enumerate() {
        send_block(transport, block_no, chunk, deadline).await?;
        if let Some(cb) = progress.as_deref_mut() {
            cb(index + 1, total);
        }
        block_no = block_no.wrapping_add(1);
        if block_no == 0 {
            block_no = 1;
        }
    }

    send_eot(transport, deadline).await
}

async fn wait_for_handshake(transport: &mut dyn Transport, deadline: Duration) -> Result<()> {
    let mut buf = [0u8; 1];
    loop {
        let n = transport.read_with_deadline(&mut buf, deadline).await?;
        if n == 1 && buf[0] == CRC_MODE {
            return Ok(());
        }
    }
}

async fn send_block(
    transport: &mut dyn Transport,
    block_no: u8,
    block: &[u8; BLOCK_LEN],
    deadline: Duration,
) -> Result<()> {
    let crc = BLOCK_CRC.checksum(block);
    let mut frame = Vec::with_capacity(3 + BLOCK_LEN + 2);
    frame.push(SOH);
    frame.push(block_no);
    frame.push(!block_no);
    frame.extend_from_slice(block);
    frame.extend_from_slice(&crc.to_be_bytes());

    let mut cancels = 0u32;
    for attempt in 0..MAX_RETRIES_PER_BLOCK {
        transport.write_all(&frame).await?;

        let mut reply = [0u8; 1];
        let n = transport.read_with_deadline(&mut reply, deadline).await;
        match n {
            Ok(1) if reply[0] == ACK => return Ok(()),
            Ok(1) if reply[0] == NAK => {
                cancels = 0;
                continue;
            }
            Ok(1) if reply[0] == CAN => {
                cancels += 1;
                if cancels >= MAX_CONSECUTIVE_CANCELS {
                    return Err(Error::Cancelled);
                }
            }
            Ok(_) => continue,
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        }
        if attempt + 1 == MAX_RETRIES_PER_BLOCK {
            return Err(Error::XmodemFailed {
                block: block_no as u32,
                reason: "exhausted retries without an ACK".into(),
            });
        }
    }
    Err(Error::XmodemFailed {
        block: block_no as u32,
        reason: "exhausted retries without an ACK".into(),
    })
}

async fn send_eot(transport: &mut dyn Transport, deadline: Duration) -> Result<()> {
    for _ in 0..MAX_RETRIES_PER_BLOCK {
        transport.write_all(&[EOT]).await?;
        let mut reply = [0u8; 1];
        match transport.read_with_deadline(&mut reply, deadline).await {
            Ok(1) if reply[0] == ACK => return Ok(()),
            _ => continue,
        }
    }
    Err(Error::XmodemFailed {
        block: 0,
        reason: "transfer end was never acknowledged".into(),
    })
}
