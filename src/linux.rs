use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::Serial;

use crate::transport::{SerialTransport, TransportKind};

/// Read timeout after which the port reports no pending input
pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

impl SerialTransport<Serial> {
    /// Open and configure a linux serial port (8N1, no flow control)
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        kind: TransportKind,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(POLL_TIMEOUT)?;

        Ok(Self::new(port, kind))
    }
}
