//! Host-side simulation of the target.
//!
//! [`SimChip`] models a SAM D21G18: 256 KiB of flash behind an NVM controller
//! with a page buffer, 32 KiB of RAM, and a Cortex-M style stack pointer and
//! interrupt mask. [`Loopback`] is a queued byte transport and [`Replay`] a
//! scripted network transfer, so full sessions run without hardware.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Instant;

use crate::address::{Address, Window};
use crate::flash::{
    CMDEX_KEY, CMD_ER, CMD_PBC, CMD_WP, ERASED_BYTE, INTFLAG_READY, NVMCTRL_ADDR, NVMCTRL_BASE,
    NVMCTRL_CTRLA, NVMCTRL_CTRLB, NVMCTRL_INTFLAG, NVMCTRL_PARAM, PAGES_PER_ROW,
};
use crate::hal::{Clock, Hardware};
use crate::installer::{Status, TransferService};
use crate::transport::{Transport, TransportKind};

pub const FLASH_PAGE_SIZE: u32 = 64;
pub const FLASH_PAGES: u32 = 4096;
pub const FLASH_SIZE: u32 = FLASH_PAGE_SIZE * FLASH_PAGES;

pub const RAM_START: u32 = 0x2000_0000;
pub const RAM_SIZE: u32 = 0x8000;

/// Stack pointer at reset, the top of RAM
pub const INITIAL_SP: u32 = RAM_START + RAM_SIZE;

// PSZ = 3 for 64 byte pages
const PARAM: u32 = (3 << 16) | FLASH_PAGES;

const NVM_REGS_LEN: u32 = 0x20;

/// Accessible memory of the simulated chip
pub fn windows() -> [Window; 3] {
    [
        Window::new(0, FLASH_SIZE),
        Window::new(RAM_START, RAM_SIZE),
        Window::new(NVMCTRL_BASE, NVM_REGS_LEN),
    ]
}

/// Simulated chip
pub struct SimChip {
    flash: Vec<u8>,
    ram: Vec<u8>,
    page_buffer: Vec<u8>,
    /// Flash page the page buffer was last written for
    buffer_page: Option<u32>,
    ctrlb: u32,
    nvm_addr: u32,
    stalled: bool,
    sp: u32,
    interrupts: bool,
    calls: Vec<(u32, u32)>,
    commands: Vec<u16>,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChip {
    /// A chip with erased flash and zeroed RAM
    pub fn new() -> Self {
        Self {
            flash: vec![ERASED_BYTE; FLASH_SIZE as usize],
            ram: vec![0; RAM_SIZE as usize],
            page_buffer: vec![ERASED_BYTE; FLASH_PAGE_SIZE as usize],
            buffer_page: None,
            ctrlb: 0x80,
            nvm_addr: 0,
            stalled: false,
            sp: INITIAL_SP,
            interrupts: true,
            calls: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Load `image` into flash at `offset`, as a programmer would
    pub fn load_flash(&mut self, offset: u32, image: &[u8]) {
        let start = offset as usize;
        self.flash[start..start + image.len()].copy_from_slice(image);
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    /// Keep the NVM controller busy forever
    pub fn stall_nvm(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// `(stack_pointer, entry)` of every call made through [`Hardware::call`]
    pub fn calls(&self) -> &[(u32, u32)] {
        &self.calls
    }

    /// NVM controller commands issued so far
    pub fn nvm_commands(&self) -> &[u16] {
        &self.commands
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn ram_offset(addr: u32) -> Option<usize> {
        match addr.checked_sub(RAM_START) {
            Some(o) if o < RAM_SIZE => Some(o as usize),
            _ => None,
        }
    }

    fn read_byte(&self, addr: u32) -> u8 {
        if addr < FLASH_SIZE {
            return self.flash[addr as usize];
        }
        if let Some(o) = Self::ram_offset(addr) {
            return self.ram[o];
        }

        trace!("Read from unmapped address 0x{:08x}", addr);
        0
    }

    fn write_byte(&mut self, addr: u32, value: u8) {
        if addr < FLASH_SIZE {
            // Flash writes land in the page buffer until a write page command
            self.buffer_page = Some(addr / FLASH_PAGE_SIZE);
            self.page_buffer[(addr % FLASH_PAGE_SIZE) as usize] = value;
            return;
        }
        if let Some(o) = Self::ram_offset(addr) {
            self.ram[o] = value;
            return;
        }

        trace!("Write to unmapped address 0x{:08x}", addr);
    }

    fn nvm_command(&mut self, value: u16) {
        if value & 0xFF00 != CMDEX_KEY {
            warn!("NVM command 0x{:04x} without execution key ignored", value);
            return;
        }

        let cmd = value & 0x7F;
        self.commands.push(cmd);

        match cmd {
            CMD_ER => {
                let row = FLASH_PAGE_SIZE * PAGES_PER_ROW;
                let start = ((self.nvm_addr * 2) / row * row) as usize;
                let end = (start + row as usize).min(self.flash.len());
                if start < end {
                    self.flash[start..end].fill(ERASED_BYTE);
                }
            }
            CMD_PBC => {
                self.page_buffer.fill(ERASED_BYTE);
            }
            CMD_WP => {
                if let Some(page) = self.buffer_page.take() {
                    let start = (page * FLASH_PAGE_SIZE) as usize;
                    // Programming can only clear bits
                    for (f, b) in self.flash[start..start + FLASH_PAGE_SIZE as usize]
                        .iter_mut()
                        .zip(self.page_buffer.iter())
                    {
                        *f &= *b;
                    }
                }
            }
            other => debug!("Unsupported NVM command 0x{:02x}", other),
        }
    }

    fn is_nvm(addr: Address) -> bool {
        addr.value() >= NVMCTRL_BASE && addr.value() < NVMCTRL_BASE + NVM_REGS_LEN
    }

    fn nvm_read(&self, addr: Address) -> u32 {
        match addr {
            NVMCTRL_CTRLB => self.ctrlb,
            NVMCTRL_PARAM => PARAM,
            NVMCTRL_INTFLAG => {
                if self.stalled {
                    0
                } else {
                    INTFLAG_READY as u32
                }
            }
            NVMCTRL_ADDR => self.nvm_addr,
            _ => 0,
        }
    }

    fn nvm_write(&mut self, addr: Address, value: u32) {
        match addr {
            NVMCTRL_CTRLA => self.nvm_command(value as u16),
            NVMCTRL_CTRLB => self.ctrlb = value,
            NVMCTRL_ADDR => self.nvm_addr = value & 0x3F_FFFF,
            _ => (),
        }
    }
}

impl Hardware for SimChip {
    fn read_u8(&mut self, addr: Address) -> u8 {
        if Self::is_nvm(addr) {
            return self.nvm_read(addr) as u8;
        }
        self.read_byte(addr.value())
    }

    fn read_u16(&mut self, addr: Address) -> u16 {
        if Self::is_nvm(addr) {
            return self.nvm_read(addr) as u16;
        }
        let a = addr.value();
        u16::from_le_bytes([self.read_byte(a), self.read_byte(a.wrapping_add(1))])
    }

    fn read_u32(&mut self, addr: Address) -> u32 {
        if Self::is_nvm(addr) {
            return self.nvm_read(addr);
        }
        let mut b = [0u8; 4];
        for (i, v) in b.iter_mut().enumerate() {
            *v = self.read_byte(addr.value().wrapping_add(i as u32));
        }
        u32::from_le_bytes(b)
    }

    fn write_u8(&mut self, addr: Address, value: u8) {
        if Self::is_nvm(addr) {
            return self.nvm_write(addr, value as u32);
        }
        self.write_byte(addr.value(), value)
    }

    fn write_u16(&mut self, addr: Address, value: u16) {
        if Self::is_nvm(addr) {
            return self.nvm_write(addr, value as u32);
        }
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.write_byte(addr.value().wrapping_add(i as u32), *b);
        }
    }

    fn write_u32(&mut self, addr: Address, value: u32) {
        if Self::is_nvm(addr) {
            return self.nvm_write(addr, value);
        }
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.write_byte(addr.value().wrapping_add(i as u32), *b);
        }
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn stack_pointer(&mut self) -> u32 {
        self.sp
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.sp = sp;
    }

    fn call(&mut self, stack_pointer: u32, entry: u32) {
        // The simulated applet returns immediately
        self.sp = stack_pointer;
        self.calls.push((stack_pointer, entry));
    }
}

/// Queued byte transport
pub struct Loopback {
    kind: TransportKind,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

/// Error from a [`Loopback`] stream receive that ran out of queued input
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Starved;

impl Loopback {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            input: VecDeque::new(),
            output: Vec::new(),
        }
    }

    /// Queue bytes for the monitor to receive
    pub fn push(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }

    /// Bytes queued but not yet received
    pub fn pending(&self) -> usize {
        self.input.len()
    }

    /// Take everything the monitor has sent so far
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

impl Transport for Loopback {
    type Error = Starved;

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), Starved> {
        self.output.push(byte);
        Ok(())
    }

    fn receive_byte(&mut self) -> Result<u8, Starved> {
        self.input.pop_front().ok_or(Starved)
    }

    fn has_pending_input(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn send_block(&mut self, data: &[u8]) -> Result<usize, Starved> {
        self.output.extend_from_slice(data);
        Ok(data.len())
    }

    fn receive_block(&mut self, buff: &mut [u8]) -> Result<usize, Starved> {
        let n = buff.len().min(self.input.len());
        for (b, v) in buff.iter_mut().zip(self.input.drain(..n)) {
            *b = v;
        }
        Ok(n)
    }

    fn receive_stream(&mut self, buff: &mut [u8]) -> Result<usize, Starved> {
        if self.input.is_empty() && !buff.is_empty() {
            return Err(Starved);
        }
        self.receive_block(buff)
    }
}

/// Scripted network write transfer.
///
/// The payload (credential, expected checksum, image) is released in
/// fixed-size packets, one per poll, and the final poll reports completion.
pub struct Replay {
    payload: Vec<u8>,
    packet: usize,
    released: usize,
    received: VecDeque<u8>,
    /// Number of initial response attempts that report not-yet-sent
    busy_responses: usize,
    started: bool,
    fail_with: Option<Status>,
    responses: Vec<Status>,
    ended: bool,
}

impl Replay {
    /// Replay `payload` in packets of `packet` bytes
    pub fn new(payload: Vec<u8>, packet: usize) -> Self {
        Self {
            payload,
            packet: packet.max(1),
            released: 0,
            received: VecDeque::new(),
            busy_responses: 0,
            started: false,
            fail_with: None,
            responses: Vec::new(),
            ended: false,
        }
    }

    /// Build the install payload for `image`: credential, big-endian
    /// checksum, then the image bytes
    pub fn install(credential: &[u8], checksum: u16, image: &[u8], packet: usize) -> Self {
        let mut payload = credential.to_vec();
        payload.extend_from_slice(&checksum.to_be_bytes());
        payload.extend_from_slice(image);
        Self::new(payload, packet)
    }

    /// Report the response as not yet delivered `n` times
    pub fn busy_responses(mut self, n: usize) -> Self {
        self.busy_responses = n;
        self
    }

    /// Fail the transfer at the service level once data starts flowing
    pub fn fail_with(mut self, status: Status) -> Self {
        self.fail_with = Some(status);
        self
    }

    /// Statuses delivered to the peer
    pub fn responses(&self) -> &[Status] {
        &self.responses
    }

    pub fn ended(&self) -> bool {
        self.ended
    }
}

impl TransferService for Replay {
    type Error = Infallible;

    fn run(&mut self) -> Status {
        if self.ended {
            return Status::NoTraffic;
        }
        if !self.started {
            // First poll sees the write request arrive with no data
            self.started = true;
            return Status::NoTraffic;
        }
        if let Some(s) = self.fail_with {
            return s;
        }
        if self.released >= self.payload.len() {
            return Status::Completed;
        }

        let end = (self.released + self.packet).min(self.payload.len());
        self.received.extend(self.payload[self.released..end].iter().copied());
        self.released = end;

        if self.released == self.payload.len() {
            Status::Completed
        } else {
            Status::Receiving
        }
    }

    fn is_write_request(&self) -> bool {
        true
    }

    fn take_bytes(&mut self, buff: &mut [u8]) -> bool {
        let n = buff.len();
        if self.received.len() < n {
            return false;
        }
        for (b, v) in buff.iter_mut().zip(self.received.drain(..n)) {
            *b = v;
        }
        true
    }

    fn pending(&self) -> usize {
        self.received.len()
    }

    fn respond(&mut self, status: Status) -> nb::Result<(), Infallible> {
        if self.busy_responses > 0 {
            self.busy_responses -= 1;
            return Err(nb::Error::WouldBlock);
        }
        self.responses.push(status);
        Ok(())
    }

    fn end(&mut self) {
        self.ended = true;
    }
}

/// Clock advanced by hand
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    pub now: u64,
    /// Added to `now` on every read
    pub step: u64,
}

impl Clock for ManualClock {
    fn millis(&mut self) -> u64 {
        self.now += self.step;
        self.now
    }
}

/// Wall clock for hosted runs
pub struct HostClock(Instant);

impl Default for HostClock {
    fn default() -> Self {
        Self(Instant::now())
    }
}

impl Clock for HostClock {
    fn millis(&mut self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crc::{crc16, crc16_memory};
    use crate::flash::{Geometry, Nvm};
    use crate::Error;

    type Result<T> = core::result::Result<T, Error<()>>;

    #[test]
    fn reports_d21g18_geometry() {
        let mut chip = SimChip::new();
        let g = Geometry::read(&mut chip);

        assert_eq!(g.page_size, FLASH_PAGE_SIZE);
        assert_eq!(g.capacity(), FLASH_SIZE);
    }

    #[test]
    fn ram_round_trip_all_widths() {
        let mut chip = SimChip::new();

        chip.write_u8(Address(RAM_START), 0xA5);
        chip.write_u16(Address(RAM_START + 2), 0xBEEF);
        chip.write_u32(Address(RAM_START + 4), 0xDEAD_BEEF);

        assert_eq!(chip.read_u8(Address(RAM_START)), 0xA5);
        assert_eq!(chip.read_u16(Address(RAM_START + 2)), 0xBEEF);
        assert_eq!(chip.read_u32(Address(RAM_START + 4)), 0xDEAD_BEEF);
    }

    #[test]
    fn flash_needs_write_page() {
        let mut chip = SimChip::new();

        chip.write_u32(Address(0x100), 0x1234_5678);
        assert_eq!(chip.read_u32(Address(0x100)), 0xFFFF_FFFF);

        chip.write_u16(NVMCTRL_CTRLA, CMDEX_KEY | CMD_WP);
        assert_eq!(chip.read_u32(Address(0x100)), 0x1234_5678);
    }

    #[test]
    fn erase_then_read_back_erased() -> Result<()> {
        let mut chip = SimChip::new();
        let nvm = Nvm::new(Geometry::read(&mut chip), None);

        let data = [0u8; 64];
        for page in 0..8 {
            nvm.write_page(&mut chip, &data, Address(0x2000 + page * 64))?;
        }
        assert!(chip.flash()[0x2000..0x2200].iter().all(|b| *b == 0));

        nvm.erase_from(&mut chip, Address(0x2000))?;

        assert!(chip.flash()[0x2000..].iter().all(|b| *b == ERASED_BYTE));
        assert_eq!(
            chip.nvm_commands().iter().filter(|c| **c == CMD_ER).count(),
            (FLASH_SIZE - 0x2000) as usize / 256
        );

        Ok(())
    }

    #[test]
    fn write_clears_manual_write_mode() -> Result<()> {
        let mut chip = SimChip::new();
        let nvm = Nvm::new(Geometry::read(&mut chip), None);

        nvm.write_page(&mut chip, &[0u8; 64], Address(0))?;

        assert_eq!(chip.read_u32(NVMCTRL_CTRLB) & crate::flash::CTRLB_MANW, 0);
        assert_eq!(chip.nvm_commands(), &[CMD_PBC, CMD_WP]);

        Ok(())
    }

    #[test]
    fn multi_page_write_from_memory() -> Result<()> {
        let mut chip = SimChip::new();
        let nvm = Nvm::new(Geometry::read(&mut chip), None);

        let data: Vec<u8> = (0..200u32).map(|i| (i * 3) as u8).collect();
        chip.write_bytes(Address(RAM_START), &data);

        // 50 words: three full pages and a two word tail
        nvm.write_from_memory(&mut chip, Address(RAM_START), Address(0x4000), 50)?;

        assert_eq!(&chip.flash()[0x4000..0x4000 + 200], &data[..]);
        assert_eq!(chip.nvm_commands().iter().filter(|c| **c == CMD_WP).count(), 4);

        Ok(())
    }

    #[test]
    fn stalled_controller_times_out() {
        let mut chip = SimChip::new();
        let nvm = Nvm::new(Geometry::read(&mut chip), Some(1000));
        chip.stall_nvm(true);

        let r: Result<()> = nvm.erase_from(&mut chip, Address(0));

        assert_eq!(r, Err(Error::FlashTimeout { polls: 1000 }));
    }

    #[test]
    fn memory_crc_matches_slice_crc() {
        let mut chip = SimChip::new();
        let data: Vec<u8> = (0..300u32).map(|i| (i ^ 0x5a) as u8).collect();
        chip.write_bytes(Address(RAM_START + 0x10), &data);

        assert_eq!(crc16_memory(&mut chip, Address(RAM_START + 0x10), 300), crc16(&data));
        assert_eq!(crc16_memory(&mut chip, Address(RAM_START), 0), 0);
    }

    #[test]
    fn loopback_stream_starves() {
        let mut l = Loopback::new(TransportKind::UsbCdc);
        let mut buff = [0u8; 4];

        assert_eq!(l.receive_block(&mut buff), Ok(0));
        assert_eq!(l.receive_stream(&mut buff), Err(Starved));

        l.push(&[1, 2]);
        assert_eq!(l.receive_stream(&mut buff), Ok(2));
    }

    #[test]
    fn replay_takes_whole_requests_only() {
        let mut r = Replay::new((1..=6).collect(), 4);
        assert_eq!(r.run(), Status::NoTraffic);
        assert_eq!(r.run(), Status::Receiving);

        let mut buff = [0u8; 3];
        assert!(r.take_bytes(&mut buff));
        assert_eq!(buff, [1, 2, 3]);

        // One byte pending, nothing is taken
        assert!(!r.take_bytes(&mut buff));
        assert_eq!(r.pending(), 1);

        assert_eq!(r.run(), Status::Completed);
        assert!(r.take_bytes(&mut buff));
        assert_eq!(buff, [4, 5, 6]);
    }
}
