//! Wire framing for the three link layers this tool speaks over a serial
//! port: ASH (EZSP transport), CPC, and Spinel's HDLC-lite. XMODEM is framed
//! separately (see [`crate::xmodem`]) since it runs after the bootloader
//! menu has already dropped the connection into a raw byte pipe.

pub mod ash;
pub mod cpc;
pub mod hdlc_lite;
