//! Byte transports the monitor can be bound to.

use core::fmt::Debug;

use embedded_hal::serial::{Read, Write};

use crate::indicator::Pulses;

/// Which physical channel backs the monitor
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TransportKind {
    /// Hardware USART
    Usart,
    /// USB CDC serial emulation
    UsbCdc,
    /// Network image transfer
    Network,
}

/// Byte and block I/O over the active channel
pub trait Transport {
    type Error: Debug;

    fn kind(&self) -> TransportKind;

    /// Send a single byte, blocking until accepted
    fn send_byte(&mut self, byte: u8) -> Result<(), Self::Error>;

    /// Receive a single byte, blocking until one arrives
    fn receive_byte(&mut self) -> Result<u8, Self::Error>;

    /// Whether a byte can be received without blocking
    fn has_pending_input(&mut self) -> bool;

    /// Send a block, returning the number of bytes sent
    fn send_block(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Receive whatever is available without blocking, up to `buff.len()`
    fn receive_block(&mut self, buff: &mut [u8]) -> Result<usize, Self::Error>;

    /// Send a block using the channel's streaming protocol.
    ///
    /// Channels without their own flow control send a plain block.
    fn send_stream(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.send_block(data)
    }

    /// Receive a block using the channel's streaming protocol.
    ///
    /// Channels without their own flow control receive a plain block.
    fn receive_stream(&mut self, buff: &mut [u8]) -> Result<usize, Self::Error> {
        self.receive_block(buff)
    }
}

/// Transport over an `embedded-hal` serial port
pub struct SerialTransport<S> {
    port: S,
    kind: TransportKind,
    peeked: Option<u8>,
}

impl<S, E> SerialTransport<S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: Debug,
{
    pub fn new(port: S, kind: TransportKind) -> Self {
        Self {
            port,
            kind,
            peeked: None,
        }
    }

    pub fn release(self) -> S {
        self.port
    }

    fn poll_byte(&mut self) -> Result<Option<u8>, E> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }

        match self.port.read() {
            Ok(b) => Ok(Some(b)),
            Err(nb::Error::WouldBlock) => Ok(None),
            Err(nb::Error::Other(e)) => Err(e),
        }
    }
}

impl<S, E> Transport for SerialTransport<S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: Debug,
{
    type Error = E;

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), E> {
        block!(self.port.write(byte))?;
        block!(self.port.flush())
    }

    fn receive_byte(&mut self) -> Result<u8, E> {
        match self.peeked.take() {
            Some(b) => Ok(b),
            None => block!(self.port.read()),
        }
    }

    fn has_pending_input(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }

        match self.port.read() {
            Ok(b) => {
                self.peeked = Some(b);
                true
            }
            Err(nb::Error::WouldBlock) => false,
            Err(nb::Error::Other(e)) => {
                warn!("Serial read error: {:?}", e);
                false
            }
        }
    }

    fn send_block(&mut self, data: &[u8]) -> Result<usize, E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(data.len())
    }

    fn receive_block(&mut self, buff: &mut [u8]) -> Result<usize, E> {
        let mut n = 0;

        while n < buff.len() {
            match self.poll_byte()? {
                Some(b) => {
                    buff[n] = b;
                    n += 1;
                }
                None => break,
            }
        }

        Ok(n)
    }

    fn receive_stream(&mut self, buff: &mut [u8]) -> Result<usize, E> {
        for b in buff.iter_mut() {
            *b = self.receive_byte()?;
        }

        Ok(buff.len())
    }
}

/// The bound transport, pulsing the activity indicators on every transfer
pub struct Link<'p, T> {
    transport: T,
    pulses: &'p Pulses,
}

impl<'p, T: Transport> Link<'p, T> {
    pub fn new(transport: T, pulses: &'p Pulses) -> Self {
        Self { transport, pulses }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn release(self) -> T {
        self.transport
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), T::Error> {
        self.transport.send_byte(byte)?;
        self.pulses.pulse_tx();
        Ok(())
    }

    pub fn send(&mut self, data: &[u8]) -> Result<usize, T::Error> {
        let n = self.transport.send_block(data)?;
        self.pulses.pulse_tx();
        Ok(n)
    }

    pub fn receive(&mut self, buff: &mut [u8]) -> Result<usize, T::Error> {
        let n = self.transport.receive_block(buff)?;
        if n > 0 {
            self.pulses.pulse_rx();
        }
        Ok(n)
    }

    pub fn send_stream(&mut self, data: &[u8]) -> Result<usize, T::Error> {
        let n = self.transport.send_stream(data)?;
        self.pulses.pulse_tx();
        Ok(n)
    }

    pub fn receive_stream(&mut self, buff: &mut [u8]) -> Result<usize, T::Error> {
        let n = self.transport.receive_stream(buff)?;
        if n > 0 {
            self.pulses.pulse_rx();
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockSerial {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl Read<u8> for MockSerial {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    impl Write<u8> for MockSerial {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            self.tx.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    fn serial(input: &[u8]) -> SerialTransport<MockSerial> {
        let port = MockSerial {
            rx: input.iter().copied().collect(),
            tx: Vec::new(),
        };
        SerialTransport::new(port, TransportKind::Usart)
    }

    #[test]
    fn receive_block_drains_available() {
        let mut t = serial(b"abc");
        let mut buff = [0u8; 8];

        assert_eq!(t.receive_block(&mut buff), Ok(3));
        assert_eq!(&buff[..3], b"abc");
        assert_eq!(t.receive_block(&mut buff), Ok(0));
    }

    #[test]
    fn peeked_byte_is_not_lost() {
        let mut t = serial(b"xy");

        assert!(t.has_pending_input());
        assert_eq!(t.receive_byte(), Ok(b'x'));

        let mut buff = [0u8; 4];
        assert_eq!(t.receive_block(&mut buff), Ok(1));
        assert_eq!(buff[0], b'y');
        assert!(!t.has_pending_input());
    }

    #[test]
    fn sends_reach_port() {
        let mut t = serial(&[]);

        t.send_byte(b'>').unwrap();
        assert_eq!(t.send_block(b"X\r\n"), Ok(3));

        assert_eq!(t.release().tx, b">X\r\n".to_vec());
    }

    #[test]
    fn link_pulses_indicators() {
        let pulses = Pulses::new();
        let mut link = Link::new(serial(b"1"), &pulses);

        let mut buff = [0u8; 4];
        link.receive(&mut buff).unwrap();
        assert!(pulses.lit().rx);
        assert!(!pulses.lit().tx);

        link.send(b"ok").unwrap();
        assert!(pulses.lit().tx);
    }

    #[test]
    fn empty_receive_leaves_rx_dark() {
        let pulses = Pulses::new();
        let mut link = Link::new(serial(&[]), &pulses);

        let mut buff = [0u8; 4];
        assert_eq!(link.receive(&mut buff), Ok(0));
        assert!(!pulses.lit().rx);
    }
}
