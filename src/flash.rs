//! NVM controller driver: row erase and page-buffered write.
//!
//! Register layout follows the SAM D21 NVMCTRL peripheral. Flash is mapped
//! from address zero, erased in rows of four pages and written one page
//! buffer at a time.

use crate::address::Address;
use crate::hal::Hardware;
use crate::Error;

/// NVMCTRL peripheral base
pub const NVMCTRL_BASE: u32 = 0x4100_4000;

pub const NVMCTRL_CTRLA: Address = Address::new(NVMCTRL_BASE);
pub const NVMCTRL_CTRLB: Address = Address::new(NVMCTRL_BASE + 0x04);
pub const NVMCTRL_PARAM: Address = Address::new(NVMCTRL_BASE + 0x08);
pub const NVMCTRL_INTFLAG: Address = Address::new(NVMCTRL_BASE + 0x14);
pub const NVMCTRL_ADDR: Address = Address::new(NVMCTRL_BASE + 0x1C);

/// Command execution key, must accompany every CTRLA command
pub const CMDEX_KEY: u16 = 0xA5 << 8;

/// Erase row
pub const CMD_ER: u16 = 0x02;
/// Write page
pub const CMD_WP: u16 = 0x04;
/// Page buffer clear
pub const CMD_PBC: u16 = 0x44;

/// CTRLB manual page write bit
pub const CTRLB_MANW: u32 = 1 << 7;

/// INTFLAG ready bit
pub const INTFLAG_READY: u8 = 1 << 0;

/// Value of every erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Largest page size PARAM.PSZ can report
pub const MAX_PAGE_SIZE: usize = 1024;

/// Pages per erase row
pub const PAGES_PER_ROW: u32 = 4;

/// Flash page size and count, as reported by the NVM controller
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Geometry {
    pub page_size: u32,
    pub pages: u32,
}

impl Geometry {
    /// Decode the NVMCTRL PARAM register (NVMP in bits 15:0, PSZ in 18:16)
    pub fn from_param(param: u32) -> Self {
        let psz = (param >> 16) & 0x7;
        let pages = param & 0xFFFF;

        Self {
            page_size: 8 << psz,
            pages,
        }
    }

    /// Read the geometry from the controller
    pub fn read<H: Hardware>(hal: &mut H) -> Self {
        Self::from_param(hal.read_u32(NVMCTRL_PARAM))
    }

    pub fn page_words(&self) -> u32 {
        self.page_size / 4
    }

    pub fn row_size(&self) -> u32 {
        self.page_size * PAGES_PER_ROW
    }

    /// Total flash size in bytes, which is also the end address of flash
    pub fn capacity(&self) -> u32 {
        self.page_size * self.pages
    }
}

/// Flash programming engine
#[derive(Clone, Debug, PartialEq)]
pub struct Nvm {
    geometry: Geometry,
    ready_timeout: Option<u32>,
}

impl Nvm {
    /// Create an engine for the given geometry.
    ///
    /// `ready_timeout` bounds how many times READY is polled after each
    /// command; `None` waits forever.
    pub fn new(geometry: Geometry, ready_timeout: Option<u32>) -> Self {
        Self {
            geometry,
            ready_timeout,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Erase every row from the one containing `start` to the end of flash
    pub fn erase_from<H: Hardware, E>(&self, hal: &mut H, start: Address) -> Result<(), Error<E>> {
        let end = self.geometry.capacity();
        let mut addr = start.value();

        debug!("Erasing flash from 0x{:08x} to 0x{:08x}", addr, end);

        while addr < end {
            // ADDR takes a half-word address
            hal.write_u32(NVMCTRL_ADDR, addr / 2);
            self.command(hal, CMD_ER)?;

            addr = match addr.checked_add(self.geometry.row_size()) {
                Some(a) => a,
                None => break,
            };
        }

        Ok(())
    }

    /// Program `words` words from target memory at `src` into flash at `dst`
    pub fn write_from_memory<H: Hardware, E>(
        &self,
        hal: &mut H,
        src: Address,
        dst: Address,
        words: u32,
    ) -> Result<(), Error<E>> {
        debug!("Writing {} words from {} to flash at {}", words, src, dst);

        self.program(hal, dst, words, |hal, i| hal.read_u32(src.offset(i * 4)))
    }

    /// Program one page from a local buffer into flash at `dst`.
    ///
    /// `page` is truncated to whole words and to one page.
    pub fn write_page<H: Hardware, E>(
        &self,
        hal: &mut H,
        page: &[u8],
        dst: Address,
    ) -> Result<(), Error<E>> {
        let words = core::cmp::min(page.len() as u32 / 4, self.geometry.page_words());

        self.program(hal, dst, words, |_hal, i| {
            let i = i as usize * 4;
            u32::from_le_bytes([page[i], page[i + 1], page[i + 2], page[i + 3]])
        })
    }

    fn program<H, E, F>(
        &self,
        hal: &mut H,
        dst: Address,
        words: u32,
        mut word_at: F,
    ) -> Result<(), Error<E>>
    where
        H: Hardware,
        F: FnMut(&mut H, u32) -> u32,
    {
        // Automatic page write
        let ctrlb = hal.read_u32(NVMCTRL_CTRLB);
        hal.write_u32(NVMCTRL_CTRLB, ctrlb & !CTRLB_MANW);

        let page_words = self.geometry.page_words();
        let mut done = 0;

        while done < words {
            self.command(hal, CMD_PBC)?;

            let n = core::cmp::min(page_words, words - done);
            for i in done..done + n {
                let w = word_at(hal, i);
                hal.write_u32(dst.offset(i * 4), w);
            }

            self.command(hal, CMD_WP)?;

            done += n;
        }

        Ok(())
    }

    /// Issue a controller command and wait for READY
    fn command<H: Hardware, E>(&self, hal: &mut H, cmd: u16) -> Result<(), Error<E>> {
        hal.write_u16(NVMCTRL_CTRLA, CMDEX_KEY | cmd);
        self.wait_ready(hal)
    }

    fn wait_ready<H: Hardware, E>(&self, hal: &mut H) -> Result<(), Error<E>> {
        let mut polls: u32 = 0;

        loop {
            if hal.read_u8(NVMCTRL_INTFLAG) & INTFLAG_READY != 0 {
                return Ok(());
            }

            polls = polls.saturating_add(1);

            if let Some(limit) = self.ready_timeout {
                if polls >= limit {
                    error!("NVM controller not ready after {} polls", polls);
                    return Err(Error::FlashTimeout { polls });
                }
            }
        }
    }
}
