//! Network image installer.
//!
//! Installs an application image received as a network write request. The
//! request carries a credential, the big-endian CRC16 of the image and the
//! image itself. Pages are programmed as they arrive; once the transfer
//! completes the image is verified, a status is returned to the peer, and
//! the device either starts the new application or erases it and resets.

use core::fmt::Debug;

use crate::address::Address;
use crate::crc::crc16_memory;
use crate::flash::{Nvm, ERASED_BYTE, MAX_PAGE_SIZE};
use crate::hal::Hardware;
use crate::runner::{Exit, Step};
use crate::Error;

/// Length of the install credential
pub const CREDENTIAL_SIZE: usize = 8;

/// Transfer status, reported by the transfer service and returned to the peer
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Status {
    /// Nothing arrived this poll
    NoTraffic,
    /// Data arrived, the transfer continues
    Receiving,
    /// Transfer finished and the image was installed
    Completed,
    /// Credential mismatch
    CredentialError,
    /// Truncated or malformed payload
    BadImage,
    /// Image does not fit in flash
    CapacityExceeded,
    /// Image checksum mismatch
    ChecksumError,
    /// Transfer failed at the protocol level
    TransferError,
}

impl Status {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Status::CredentialError
                | Status::BadImage
                | Status::CapacityExceeded
                | Status::ChecksumError
                | Status::TransferError
        )
    }

    /// Whether this status ends the transfer
    pub fn is_final(&self) -> bool {
        self.is_error() || *self == Status::Completed
    }
}

/// Packet-level transfer service the installer is layered on
pub trait TransferService {
    type Error: Debug;

    /// Service the network, returning `NoTraffic`, `Receiving`, `Completed`
    /// or `TransferError`
    fn run(&mut self) -> Status;

    /// Whether the active request is a write (upload to the device)
    fn is_write_request(&self) -> bool;

    /// Take exactly `buff.len()` received bytes, or nothing if fewer are
    /// available
    fn take_bytes(&mut self, buff: &mut [u8]) -> bool;

    /// Received bytes not yet taken
    fn pending(&self) -> usize;

    /// Send the final response to the peer.
    ///
    /// `WouldBlock` means the response could not be sent yet and must be
    /// retried.
    fn respond(&mut self, status: Status) -> nb::Result<(), Self::Error>;

    /// Close the transfer
    fn end(&mut self);
}

/// Service for builds without a network transport
#[derive(Debug)]
pub enum Disabled {}

impl TransferService for Disabled {
    type Error = ();

    fn run(&mut self) -> Status {
        match *self {}
    }

    fn is_write_request(&self) -> bool {
        match *self {}
    }

    fn take_bytes(&mut self, _buff: &mut [u8]) -> bool {
        match *self {}
    }

    fn pending(&self) -> usize {
        match *self {}
    }

    fn respond(&mut self, _status: Status) -> nb::Result<(), ()> {
        match *self {}
    }

    fn end(&mut self) {
        match *self {}
    }
}

/// Installer progress
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Phase {
    AwaitingCredential,
    AwaitingChecksum,
    Streaming,
}

pub struct Installer<H, S> {
    hal: H,
    service: S,
    nvm: Nvm,
    credential: [u8; CREDENTIAL_SIZE],
    app_start: Address,

    phase: Phase,
    cursor: Address,
    image_size: u32,
    expected_crc: u16,
    /// Final status awaiting delivery to the peer
    pending: Option<Status>,
}

impl<H, S> Installer<H, S>
where
    H: Hardware,
    S: TransferService,
{
    /// Create an installer writing images to flash from `app_start`
    pub fn new(
        hal: H,
        service: S,
        nvm: Nvm,
        credential: [u8; CREDENTIAL_SIZE],
        app_start: Address,
    ) -> Self {
        Self {
            hal,
            service,
            nvm,
            credential,
            app_start,
            phase: Phase::AwaitingCredential,
            cursor: app_start,
            image_size: 0,
            expected_crc: 0,
            pending: None,
        }
    }

    /// Erase the application region ahead of the first poll
    pub fn start(&mut self) -> Result<(), Error<S::Error>> {
        info!("Network install session, erasing application flash from {}", self.app_start);
        self.nvm.erase_from(&mut self.hal, self.app_start)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Next flash address to be written
    pub fn cursor(&self) -> Address {
        self.cursor
    }

    /// Image bytes received so far
    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn expected_crc(&self) -> u16 {
        self.expected_crc
    }

    pub fn hardware(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn service(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn release(self) -> (H, S) {
        (self.hal, self.service)
    }

    /// Advance the session by one poll of the transfer service.
    ///
    /// Only polls that program flash report [`Step::Active`].
    pub fn poll(&mut self) -> Result<Step, Error<S::Error>> {
        // A final status still waiting for delivery is resent as-is
        if let Some(status) = self.pending {
            return self.finish(status, Step::Idle);
        }

        let mut status = self.service.run();
        if status == Status::NoTraffic {
            return Ok(Step::Idle);
        }

        let cursor = self.cursor;

        if !status.is_error() {
            if self.service.is_write_request() {
                status = self.receive(status)?;
            } else {
                debug!("Ignoring non-write request");
            }
        }

        let step = if self.cursor != cursor {
            Step::Active
        } else {
            Step::Idle
        };

        if status.is_final() {
            if status.is_error() {
                error!("Network install failed: {:?}", status);
            }
            self.pending = Some(status);
            return self.finish(status, step);
        }

        Ok(step)
    }

    fn receive(&mut self, mut status: Status) -> Result<Status, Error<S::Error>> {
        if self.phase == Phase::AwaitingCredential {
            let mut received = [0u8; CREDENTIAL_SIZE];

            if !self.service.take_bytes(&mut received) {
                return Ok(Status::BadImage);
            }
            if received != self.credential {
                return Ok(Status::CredentialError);
            }

            debug!("Credential accepted");
            self.phase = Phase::AwaitingChecksum;
        }

        if self.phase == Phase::AwaitingChecksum {
            let mut crc = [0u8; 2];

            if !self.service.take_bytes(&mut crc) {
                return Ok(Status::BadImage);
            }

            self.expected_crc = u16::from_be_bytes(crc);
            debug!("Expecting image checksum 0x{:04x}", self.expected_crc);
            self.phase = Phase::Streaming;
        }

        let page_size = self.nvm.geometry().page_size as usize;
        let mut page = [0u8; MAX_PAGE_SIZE];
        let page = &mut page[..page_size];

        while self.service.pending() >= page_size {
            if !self.fits(page_size as u32) {
                return Ok(Status::CapacityExceeded);
            }

            self.service.take_bytes(page);
            self.nvm.write_page(&mut self.hal, page, self.cursor)?;

            self.cursor = self.cursor.offset(page_size as u32);
            self.image_size += page_size as u32;
        }

        if status == Status::Completed {
            status = self.complete(page)?;
        }

        Ok(status)
    }

    /// Flush the trailing partial page and verify the image
    fn complete(&mut self, page: &mut [u8]) -> Result<Status, Error<S::Error>> {
        let tail = self.service.pending() & !0x3;

        if tail > 0 {
            if !self.fits(page.len() as u32) {
                return Ok(Status::CapacityExceeded);
            }

            self.service.take_bytes(&mut page[..tail]);
            page[tail..].fill(ERASED_BYTE);

            self.nvm.write_page(&mut self.hal, page, self.cursor)?;

            self.cursor = self.cursor.offset(page.len() as u32);
            self.image_size += tail as u32;
        }

        if self.service.pending() != 0 {
            warn!("{} trailing bytes after image", self.service.pending());
            return Ok(Status::BadImage);
        }

        let crc = crc16_memory(&mut self.hal, self.app_start, self.image_size);
        if crc != self.expected_crc {
            warn!(
                "Image checksum mismatch (expected 0x{:04x}, computed 0x{:04x})",
                self.expected_crc, crc
            );
            return Ok(Status::ChecksumError);
        }

        info!("Installed {} byte image, checksum 0x{:04x}", self.image_size, crc);

        Ok(Status::Completed)
    }

    fn fits(&self, len: u32) -> bool {
        let end = self.cursor.value() as u64 + len as u64;
        end <= self.nvm.geometry().capacity() as u64
    }

    /// Deliver the final status, then start the application or recover
    fn finish(&mut self, status: Status, step: Step) -> Result<Step, Error<S::Error>> {
        match self.service.respond(status) {
            Ok(()) => (),
            Err(nb::Error::WouldBlock) => return Ok(step),
            Err(nb::Error::Other(e)) => return Err(Error::Transport(e)),
        }

        self.service.end();
        self.pending = None;

        if !status.is_error() {
            return Ok(Step::Exit(Exit::StartApplication));
        }

        // Never leave a partial image behind
        if self.cursor != self.app_start {
            self.nvm.erase_from(&mut self.hal, self.app_start)?;
        }

        Ok(Step::Exit(Exit::Reset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crc::crc16;
    use crate::flash::Geometry;
    use crate::sim::{Replay, SimChip, FLASH_PAGE_SIZE, FLASH_SIZE};

    const CREDENTIAL: [u8; CREDENTIAL_SIZE] = *b"s3cr3t!!";
    const APP: u32 = 0x4000;

    fn installer(service: Replay) -> Installer<SimChip, Replay> {
        let mut chip = SimChip::new();
        let nvm = Nvm::new(Geometry::read(&mut chip), None);
        let mut i = Installer::new(chip, service, nvm, CREDENTIAL, Address(APP));
        i.start().unwrap();
        i
    }

    fn drive(i: &mut Installer<SimChip, Replay>) -> Exit {
        for _ in 0..10_000 {
            if let Step::Exit(e) = i.poll().unwrap() {
                return e;
            }
        }
        panic!("installer did not finish");
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 + 7) as u8).collect()
    }

    #[test]
    fn installs_page_aligned_image() {
        let img = image(FLASH_PAGE_SIZE as usize * 10);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 100));

        assert_eq!(drive(&mut i), Exit::StartApplication);

        assert_eq!(i.image_size(), img.len() as u32);
        assert_eq!(i.service().responses(), &[Status::Completed]);
        assert!(i.service().ended());
        assert_eq!(&i.hardware().flash()[APP as usize..APP as usize + img.len()], &img[..]);
    }

    #[test]
    fn partial_page_is_padded() {
        let img = image(FLASH_PAGE_SIZE as usize * 3 + 20);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 64));

        assert_eq!(drive(&mut i), Exit::StartApplication);

        // Checksum covers exactly the received bytes, not the padded page
        assert_eq!(i.image_size(), img.len() as u32);
        assert_eq!(i.cursor(), Address(APP + FLASH_PAGE_SIZE * 4));

        let flash = i.hardware().flash();
        let end = APP as usize + img.len();
        assert_eq!(&flash[APP as usize..end], &img[..]);
        assert!(flash[end..APP as usize + FLASH_PAGE_SIZE as usize * 4]
            .iter()
            .all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn wrong_credential_resets_without_erase() {
        let img = image(256);
        let mut i = installer(Replay::install(b"password", crc16(&img), &img, 512));
        let erases = i.hardware().nvm_commands().len();

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::CredentialError]);
        // Nothing was written, so nothing is erased
        assert_eq!(i.hardware().nvm_commands().len(), erases);
    }

    #[test]
    fn short_credential_is_bad_image() {
        let mut i = installer(Replay::new(b"s3c".to_vec(), 16));

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::BadImage]);
    }

    #[test]
    fn checksum_mismatch_erases_after_response() {
        let img = image(FLASH_PAGE_SIZE as usize * 4);
        let mut i =
            installer(Replay::install(&CREDENTIAL, crc16(&img) ^ 1, &img, 512).busy_responses(3));
        let region = APP as usize..APP as usize + img.len();

        assert_eq!(i.poll().unwrap(), Step::Idle);

        // Failure detected, but the image stays until the response is out
        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(i.poll().unwrap());
            assert!(i.service().responses().is_empty());
            assert_eq!(&i.hardware().flash()[region.clone()], &img[..]);
        }
        assert_eq!(steps, [Step::Active, Step::Idle, Step::Idle]);

        assert_eq!(i.poll().unwrap(), Step::Exit(Exit::Reset));
        assert_eq!(i.service().responses(), &[Status::ChecksumError]);
        assert!(i.hardware().flash()[APP as usize..].iter().all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn response_is_retried_with_same_status() {
        let img = image(FLASH_PAGE_SIZE as usize);
        let mut i =
            installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 512).busy_responses(2));

        // Request arrives, then the whole payload in one packet
        assert_eq!(i.poll().unwrap(), Step::Idle);
        assert_eq!(i.poll().unwrap(), Step::Active);
        // Resending the response alone is not activity
        assert_eq!(i.poll().unwrap(), Step::Idle);
        assert_eq!(i.poll().unwrap(), Step::Exit(Exit::StartApplication));

        assert_eq!(i.service().responses(), &[Status::Completed]);
    }

    #[test]
    fn oversized_image_exceeds_capacity() {
        let room = (FLASH_SIZE - APP) as usize;
        let img = image(room + FLASH_PAGE_SIZE as usize);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 4096));

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::CapacityExceeded]);
        assert!(i.hardware().flash()[APP as usize..].iter().all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn trailing_bytes_are_bad_image() {
        // Two bytes beyond the last whole word cannot be programmed
        let img = image(FLASH_PAGE_SIZE as usize + 2);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 512));

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::BadImage]);
    }

    #[test]
    fn service_failure_is_reported() {
        let mut i = installer(Replay::new(vec![0; 16], 16).fail_with(Status::TransferError));

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::TransferError]);
    }

    #[test]
    fn start_erases_application_region() {
        let mut chip = SimChip::new();
        chip.load_flash(0x100, &[0; 16]);
        chip.load_flash(APP, &[0; 16]);
        let nvm = Nvm::new(Geometry::read(&mut chip), None);

        let mut i = Installer::new(chip, Replay::new(vec![], 1), nvm, CREDENTIAL, Address(APP));
        i.start().unwrap();

        let flash = i.hardware().flash();
        assert!(flash[0x100..0x110].iter().all(|b| *b == 0));
        assert!(flash[APP as usize..APP as usize + 16].iter().all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn phases_advance_in_order() {
        let img = image(FLASH_PAGE_SIZE as usize * 2);
        let mut i = installer(Replay::install(&CREDENTIAL, 0xBEEF, &img, 10));

        assert_eq!(i.phase(), Phase::AwaitingCredential);
        assert_eq!(i.poll().unwrap(), Step::Idle);
        assert_eq!(i.phase(), Phase::AwaitingCredential);

        assert_eq!(i.poll().unwrap(), Step::Idle);
        assert_eq!(i.phase(), Phase::Streaming);
        assert_eq!(i.expected_crc(), 0xBEEF);
        assert_eq!(i.cursor(), Address(APP));
    }

    #[test]
    fn activity_only_when_pages_are_written() {
        let img = image(FLASH_PAGE_SIZE as usize * 2);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 10));

        // Request, then the credential and checksum packet
        assert_eq!(i.poll().unwrap(), Step::Idle);
        assert_eq!(i.poll().unwrap(), Step::Idle);

        // Six more packets buffer 60 bytes, the seventh completes a page
        let idle = (0..10).take_while(|_| i.poll().unwrap() == Step::Idle).count();
        assert_eq!(idle, 6);
        assert_eq!(i.cursor(), Address(APP + FLASH_PAGE_SIZE));
    }

    #[test]
    fn split_checksum_is_bad_image() {
        let img = image(FLASH_PAGE_SIZE as usize);
        let mut i = installer(Replay::install(&CREDENTIAL, crc16(&img), &img, 9));

        assert_eq!(drive(&mut i), Exit::Reset);
        assert_eq!(i.service().responses(), &[Status::BadImage]);
    }
}
