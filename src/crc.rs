//! CRC16 over target memory.
//!
//! CRC-16/XMODEM (polynomial 0x1021, zero seed), the same checksum the
//! SAM-BA serial layer uses, so host tools can verify transfers with `Z`.

use crc::{Crc, CRC_16_XMODEM};

use crate::address::Address;
use crate::hal::Hardware;

pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const CHUNK: usize = 64;

/// CRC16 of a byte slice
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC16 of `len` bytes of target memory starting at `addr`
pub fn crc16_memory<H: Hardware>(hal: &mut H, addr: Address, len: u32) -> u16 {
    let mut digest = CRC16.digest();
    let mut buff = [0u8; CHUNK];
    let mut done = 0u32;

    while done < len {
        let n = core::cmp::min(CHUNK as u32, len - done) as usize;
        hal.read_bytes(addr.offset(done), &mut buff[..n]);
        digest.update(&buff[..n]);
        done += n as u32;
    }

    digest.finalize()
}
