//! SAM-BA Bootloader Monitor.
//!
//! The resident monitor of a SAM D21 style bootloader: a command interpreter
//! for the SAM-BA monitor protocol (memory read / write, flash erase and
//! programming, CRC queries, applet calls), a network image installer, and
//! the run loop that hands over to the application.
//!
//! Hardware access goes through [`hal::Hardware`], so the whole monitor runs
//! on a host against the simulated chip in [`sim`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod address;
pub mod crc;
pub mod flash;
pub mod hal;
pub mod handoff;
pub mod identity;
pub mod indicator;
pub mod installer;
pub mod monitor;
pub mod protocol;
pub mod runner;
pub mod transport;

#[cfg(all(feature = "cortex-m", target_arch = "arm"))]
pub mod cortex;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

pub use address::{Address, AddressPolicy, Window};
pub use installer::{Installer, Status, TransferService, CREDENTIAL_SIZE};
pub use monitor::Monitor;
pub use runner::{run, run_until_exit, Exit, Poller, Step};
pub use transport::{Transport, TransportKind};

/// Default application start, just past the bootloader
pub const APP_START: u32 = 0x4000;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E> {
    /// Failure of the bound transport or transfer service
    #[error("transport error: {0:?}")]
    Transport(E),

    /// NVM controller never reported ready
    #[error("flash controller not ready after {polls} polls")]
    FlashTimeout { polls: u32 },
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Start the application if the run timeout passes without activity
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub exit_after_timeout: bool,

    /// Time to wait for activity before starting the application
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub run_timeout_ms: u64,

    /// Polls of the flash ready flag before giving up (unbounded if unset)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub ready_timeout: Option<u32>,

    /// Start of the application flash region
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "4000", parse(try_from_str = parse_hex))
    )]
    pub app_start: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            exit_after_timeout: false,
            run_timeout_ms: 5000,
            ready_timeout: None,
            app_start: APP_START,
        }
    }
}

/// Parse a hex number, with or without a `0x` prefix
pub fn parse_hex(s: &str) -> Result<u32, core::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}
