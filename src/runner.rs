//! Monitor main loop.
//!
//! A [`Poller`] is chosen once at start-up: the command interpreter for the
//! serial transports, or the installer for network installs. It is polled
//! until it asks to leave the bootloader or, when enabled, the run timeout
//! passes without any activity.

use core::fmt::Debug;

use crate::hal::{Boot, Clock, Hardware};
use crate::installer::{Installer, TransferService};
use crate::monitor::Monitor;
use crate::transport::Transport;
use crate::{Error, Options};

/// Ways out of the bootloader
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Exit {
    /// Hand over to the installed application
    StartApplication,
    /// Full device reset, back into the bootloader
    Reset,
}

/// Outcome of a single poll
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Step {
    /// Nothing received
    Idle,
    /// Commands were received, or image pages were programmed
    Active,
    /// Leave the bootloader
    Exit(Exit),
}

/// The loop function selected at start-up
pub enum Poller<'p, H, T, S> {
    Commands(Monitor<'p, H, T>),
    Network(Installer<H, S>),
}

impl<'p, H, T, S> Poller<'p, H, T, S>
where
    H: Hardware,
    T: Transport,
    S: TransferService,
{
    /// Select the network installer, erasing the application region first
    pub fn network(mut installer: Installer<H, S>) -> Result<Self, Error<S::Error>> {
        installer.start()?;
        Ok(Poller::Network(installer))
    }

    pub fn poll(&mut self) -> Step {
        match self {
            Poller::Commands(m) => settle(m.poll()),
            Poller::Network(i) => settle(i.poll()),
        }
    }
}

// Transport errors are logged and polling continues, a flash controller
// fault resets the device
fn settle<E: Debug>(r: Result<Step, Error<E>>) -> Step {
    match r {
        Ok(s) => s,
        Err(Error::FlashTimeout { polls }) => {
            error!("Flash controller fault after {} polls, resetting", polls);
            Step::Exit(Exit::Reset)
        }
        Err(Error::Transport(e)) => {
            warn!("Transport error: {:?}", e);
            Step::Idle
        }
    }
}

/// Poll until the poller exits or the run timeout passes without activity
pub fn run_until_exit<H, T, S, C>(
    poller: &mut Poller<H, T, S>,
    clock: &mut C,
    options: &Options,
) -> Exit
where
    H: Hardware,
    T: Transport,
    S: TransferService,
    C: Clock,
{
    let deadline = clock.millis().saturating_add(options.run_timeout_ms);
    let mut exit_after_timeout = options.exit_after_timeout;

    debug!(
        "Monitor running (timeout: {})",
        if exit_after_timeout {
            "enabled"
        } else {
            "disabled"
        }
    );

    loop {
        match poller.poll() {
            Step::Idle => (),
            Step::Active => {
                if exit_after_timeout {
                    debug!("Activity, timeout cancelled");
                }
                exit_after_timeout = false;
            }
            Step::Exit(e) => return e,
        }

        if exit_after_timeout && clock.millis() > deadline {
            info!("No activity before timeout");
            return Exit::StartApplication;
        }
    }
}

/// Run the monitor, leaving only by application start or reset
pub fn run<H, T, S, C, B>(
    mut poller: Poller<H, T, S>,
    clock: &mut C,
    boot: &mut B,
    options: &Options,
) -> !
where
    H: Hardware,
    T: Transport,
    S: TransferService,
    C: Clock,
    B: Boot,
{
    match run_until_exit(&mut poller, clock, options) {
        Exit::StartApplication => {
            info!("Starting application");
            boot.start_application()
        }
        Exit::Reset => {
            info!("Resetting");
            boot.system_reset()
        }
    }
}
