#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryInto;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};

use sam_ba_monitor::crc::{crc16, crc16_memory};
use sam_ba_monitor::flash::{Geometry, Nvm};
use sam_ba_monitor::hal::Boot;
use sam_ba_monitor::identity::{BuildStamp, CAPABILITIES, VERSION};
use sam_ba_monitor::indicator::{Leds, Pulses};
use sam_ba_monitor::installer::Disabled;
use sam_ba_monitor::sim::{self, HostClock, Loopback, Replay, SimChip};
use sam_ba_monitor::transport::SerialTransport;
use sam_ba_monitor::{
    run, run_until_exit, Address, AddressPolicy, Exit, Installer, Monitor, Options, Poller,
    TransportKind, CREDENTIAL_SIZE,
};

static PULSES: Pulses = Pulses::new();

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Serve the monitor protocol on a serial port against a simulated chip
    Serve {
        /// Serial port to listen on
        #[structopt(long, default_value = "/dev/ttyUSB0")]
        port: String,

        /// Serial port baud rate
        #[structopt(long, default_value = "115200")]
        baud: usize,

        /// Behave as the hardware USART (acknowledge applet calls)
        #[structopt(long)]
        usart: bool,

        /// Reject accesses outside the simulated chip's memory map
        #[structopt(long)]
        checked: bool,

        /// Image to preload at the application start
        #[structopt(long)]
        flash_image: Option<PathBuf>,
    },
    /// Replay a network install of an image against a simulated chip
    Install {
        /// Binary image to install
        image: PathBuf,

        /// Shared install credential (hex)
        #[structopt(long, default_value = "0000000000000000")]
        credential: String,

        /// Transfer packet size in bytes
        #[structopt(long, default_value = "512")]
        packet: usize,
    },
}

/// Boot exits for the hosted monitor, which end the process
struct HostBoot;

impl Boot for HostBoot {
    fn system_reset(&mut self) -> ! {
        info!("System reset requested");
        std::process::exit(2)
    }

    fn start_application(&mut self) -> ! {
        info!("Application start requested");
        std::process::exit(0)
    }
}

/// Activity LEDs reported through the log
#[derive(Default)]
struct LogLeds {
    tx: bool,
    rx: bool,
}

impl Leds for LogLeds {
    fn set_tx(&mut self, on: bool) {
        if on != self.tx {
            trace!("TX LED {}", if on { "on" } else { "off" });
        }
        self.tx = on;
    }

    fn set_rx(&mut self, on: bool) {
        if on != self.rx {
            trace!("RX LED {}", if on { "on" } else { "off" });
        }
        self.rx = on;
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let stamp = BuildStamp::current();
    info!("SAM-BA monitor v{} {} ({} {})", VERSION, CAPABILITIES, stamp.date, stamp.time);

    // Indicator tick, standing in for SysTick
    thread::spawn(|| {
        let mut leds = LogLeds::default();
        loop {
            PULSES.tick_leds(&mut leds);
            thread::sleep(Duration::from_millis(1));
        }
    });

    match o.command {
        Command::Serve {
            port,
            baud,
            usart,
            checked,
            flash_image,
        } => serve(&port, baud, usart, checked, flash_image, &o.options),
        Command::Install {
            image,
            credential,
            packet,
        } => install(&image, &credential, packet, &o.options),
    }
}

fn serve(
    port: &str,
    baud: usize,
    usart: bool,
    checked: bool,
    flash_image: Option<PathBuf>,
    options: &Options,
) -> anyhow::Result<()> {
    let mut chip = SimChip::new();

    if let Some(path) = flash_image {
        let image = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        info!(
            "Preloading {} at 0x{:08x}",
            bytefmt::format(image.len() as u64),
            options.app_start
        );
        chip.load_flash(options.app_start, &image);
    }

    info!("Connecting to serial port");

    let kind = if usart {
        TransportKind::Usart
    } else {
        TransportKind::UsbCdc
    };
    let transport = SerialTransport::linux(port, baud, kind)
        .map_err(|e| anyhow!("Error opening serial port {}: {:?}", port, e))?;

    let nvm = Nvm::new(Geometry::read(&mut chip), options.ready_timeout);

    let windows = sim::windows();
    let policy = if checked {
        AddressPolicy::Windows(&windows)
    } else {
        AddressPolicy::Unchecked
    };

    let monitor = Monitor::new(chip, transport, nvm, &PULSES).with_policy(policy);
    let poller: Poller<_, _, Disabled> = Poller::Commands(monitor);

    info!("Monitor listening on {} ({:?})", port, kind);

    run(poller, &mut HostClock::default(), &mut HostBoot, options)
}

fn install(
    path: &PathBuf,
    credential: &str,
    packet: usize,
    options: &Options,
) -> anyhow::Result<()> {
    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let credential: [u8; CREDENTIAL_SIZE] = hex::decode(credential)
        .context("decoding credential")?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("credential must be {} bytes", CREDENTIAL_SIZE))?;

    let checksum = crc16(&image);
    info!(
        "Installing {} (crc: 0x{:04x}) in {} byte packets",
        bytefmt::format(image.len() as u64),
        checksum,
        packet
    );

    let mut chip = SimChip::new();
    let nvm = Nvm::new(Geometry::read(&mut chip), options.ready_timeout);
    let replay = Replay::install(&credential, checksum, &image, packet);
    let app_start = Address::new(options.app_start);

    let installer = Installer::new(chip, replay, nvm, credential, app_start);
    let mut poller: Poller<SimChip, Loopback, Replay> =
        Poller::network(installer).map_err(|e| anyhow!("Error starting install: {}", e))?;

    let exit = run_until_exit(&mut poller, &mut HostClock::default(), options);

    let (mut chip, replay) = match poller {
        Poller::Network(i) => i.release(),
        Poller::Commands(_) => return Err(anyhow!("Install session lost")),
    };

    info!("Responses: {:?}", replay.responses());

    match exit {
        Exit::StartApplication => {
            let written = crc16_memory(&mut chip, app_start, image.len() as u32);
            info!("Install complete, flash crc: 0x{:04x}", written);
            Ok(())
        }
        Exit::Reset => Err(anyhow!("Install failed, device reset")),
    }
}
