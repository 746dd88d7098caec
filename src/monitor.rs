//! SAM-BA command interpreter.
//!
//! Each poll drains the transport into a buffer and runs it through the
//! command state machine. Hex digits accumulate into the operand, `,`
//! commits the operand as the pointer, `#` dispatches the pending command and
//! any other byte becomes the pending command.

use core::cmp::min;
use core::fmt::Write as _;

use heapless::String;

use crate::address::{Address, AddressPolicy};
use crate::crc::crc16_memory;
use crate::flash::Nvm;
use crate::hal::Hardware;
use crate::handoff::call_applet;
use crate::identity::{BuildStamp, CAPABILITIES, VERSION};
use crate::indicator::Pulses;
use crate::protocol::{Command, Token, BUFFER_SIZE, CRLF, NO_COMMAND, PROMPT, USART_ACK};
use crate::runner::Step;
use crate::transport::{Link, Transport, TransportKind};
use crate::Error;

/// Interpreter state, persisting across polls
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Pending command letter
    pub command: u8,
    /// Accumulated hex operand
    pub operand: u32,
    /// Pointer committed by `,`
    pub pointer: Address,
    /// Terminal (ASCII) formatting mode
    pub terminal: bool,
    /// Source buffer recorded by `Y<addr>,0#`
    pub flash_source: Option<Address>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            command: NO_COMMAND,
            operand: 0,
            pointer: Address::default(),
            terminal: false,
            flash_source: None,
        }
    }
}

pub struct Monitor<'p, H, T> {
    hal: H,
    link: Link<'p, T>,
    nvm: Nvm,
    policy: AddressPolicy<'p>,
    session: Session,
}

impl<'p, H, T> Monitor<'p, H, T>
where
    H: Hardware,
    T: Transport,
{
    /// Bind the monitor to a transport
    pub fn new(hal: H, transport: T, nvm: Nvm, pulses: &'p Pulses) -> Self {
        Self {
            hal,
            link: Link::new(transport, pulses),
            nvm,
            policy: AddressPolicy::Unchecked,
            session: Session::default(),
        }
    }

    /// Restrict memory access to the policy's windows
    pub fn with_policy(mut self, policy: AddressPolicy<'p>) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn hardware(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn transport(&mut self) -> &mut T {
        self.link.transport()
    }

    pub fn release(self) -> (H, T) {
        (self.hal, self.link.release())
    }

    /// Receive and interpret whatever input is available
    pub fn poll(&mut self) -> Result<Step, Error<T::Error>> {
        let mut buff = [0u8; BUFFER_SIZE];
        let len = self.link.receive(&mut buff)?;

        if len == 0 {
            return Ok(Step::Idle);
        }

        trace!("Received {} bytes", len);

        let mut i = 0;
        while i < len {
            let b = buff[i];
            i += 1;

            match Token::from(b) {
                Token::Filler => (),
                Token::Digit(d) => {
                    self.session.operand = (self.session.operand << 4) | d as u32;
                }
                Token::Separator => {
                    self.session.pointer = Address::from(self.session.operand);
                    self.session.operand = 0;
                }
                Token::Letter(c) => {
                    self.session.command = c;
                    self.session.operand = 0;
                }
                Token::Terminator => {
                    i += self.terminate(&buff[i..len])?;
                }
            }
        }

        Ok(Step::Active)
    }

    /// Handle `#`: dispatch the pending command, returning how many of the
    /// following buffered bytes it consumed.
    ///
    /// The pending command and operand are cleared even when dispatch fails.
    fn terminate(&mut self, rest: &[u8]) -> Result<usize, Error<T::Error>> {
        let result = self.execute(rest);

        self.session.command = NO_COMMAND;
        self.session.operand = 0;

        let consumed = result?;

        if self.session.terminal {
            self.link.send_byte(PROMPT)?;
        }

        Ok(consumed)
    }

    fn execute(&mut self, rest: &[u8]) -> Result<usize, Error<T::Error>> {
        if self.session.terminal {
            self.link.send(CRLF)?;
        }

        match Command::from_letter(self.session.command) {
            Some(c) => self.dispatch(c, rest),
            None => {
                trace!("No-op terminator (command 0x{:02x})", self.session.command);
                Ok(0)
            }
        }
    }

    fn permits(&self, addr: Address, len: u32) -> bool {
        let ok = self.policy.permits(addr, len);
        if !ok {
            warn!("Rejected access to {} ({} bytes)", addr, len);
        }
        ok
    }

    fn dispatch(&mut self, command: Command, rest: &[u8]) -> Result<usize, Error<T::Error>> {
        let pointer = self.session.pointer;
        let operand = self.session.operand;

        debug!("Command {:?} (pointer: {}, operand: 0x{:x})", command, pointer, operand);

        match command {
            Command::WriteByte | Command::WriteHalfWord | Command::WriteWord => {
                let width = command.width().unwrap_or(4);
                if self.permits(pointer, width) {
                    match width {
                        1 => self.hal.write_u8(pointer, operand as u8),
                        2 => self.hal.write_u16(pointer, operand as u16),
                        _ => self.hal.write_u32(pointer, operand),
                    }
                }
            }
            Command::ReadByte | Command::ReadHalfWord | Command::ReadWord => {
                let width = command.width().unwrap_or(4);
                if self.permits(pointer, width) {
                    let value = match width {
                        1 => self.hal.read_u8(pointer) as u32,
                        2 => self.hal.read_u16(pointer) as u32,
                        _ => self.hal.read_u32(pointer),
                    };
                    self.reply_value(value, width)?;
                }
            }
            Command::SendFile => {
                if self.permits(pointer, operand) {
                    return self.receive_file(pointer, operand, rest);
                }
            }
            Command::ReceiveFile => {
                if self.permits(pointer, operand) {
                    self.send_file(pointer, operand)?;
                }
            }
            Command::Go => {
                let table = Address::from(operand);
                if self.permits(table, 8) {
                    call_applet(&mut self.hal, table);

                    if self.link.kind() == TransportKind::Usart {
                        self.link.send_byte(USART_ACK)?;
                    }
                }
            }
            Command::Terminal => {
                self.session.terminal = true;
                self.link.send(CRLF)?;
            }
            Command::NonTerminal => {
                if !self.session.terminal {
                    self.link.send(CRLF)?;
                }
                self.session.terminal = false;
            }
            Command::Version => self.reply_version()?,
            Command::EraseFlash => {
                let start = Address::from(operand);
                if self.permits(start, 0) {
                    self.nvm.erase_from(&mut self.hal, start)?;
                    self.link.send(b"X\r\n")?;
                }
            }
            Command::WriteFlash => self.write_flash(pointer, operand)?,
            Command::Checksum => {
                if self.permits(pointer, operand) {
                    let crc = crc16_memory(&mut self.hal, pointer, operand);

                    let mut s: String<16> = String::new();
                    let _ = write!(s, "Z{:08X}#\r\n", crc);
                    self.link.send(s.as_bytes())?;
                }
            }
        }

        Ok(0)
    }

    /// `S`: bytes already buffered after the terminator are used first, the
    /// remainder is streamed from the transport
    fn receive_file(
        &mut self,
        addr: Address,
        len: u32,
        rest: &[u8],
    ) -> Result<usize, Error<T::Error>> {
        let buffered = min(rest.len(), len as usize);
        self.hal.write_bytes(addr, &rest[..buffered]);

        let mut done = buffered as u32;
        let mut chunk = [0u8; BUFFER_SIZE];

        while done < len {
            let want = min(BUFFER_SIZE as u32, len - done) as usize;
            let n = self.link.receive_stream(&mut chunk[..want])?;
            self.hal.write_bytes(addr.offset(done), &chunk[..n]);
            done += n as u32;
        }

        trace!("Received {} bytes to {} ({} buffered)", len, addr, buffered);

        Ok(buffered)
    }

    /// `R`: stream memory out over the transport
    fn send_file(&mut self, addr: Address, len: u32) -> Result<(), Error<T::Error>> {
        let mut chunk = [0u8; BUFFER_SIZE];
        let mut done = 0u32;

        while done < len {
            let n = min(BUFFER_SIZE as u32, len - done) as usize;
            self.hal.read_bytes(addr.offset(done), &mut chunk[..n]);
            self.link.send_stream(&chunk[..n])?;
            done += n as u32;
        }

        Ok(())
    }

    /// `Y`: operand zero records the source buffer, otherwise `operand` bytes
    /// are programmed from it into flash at the pointer
    fn write_flash(&mut self, dst: Address, len: u32) -> Result<(), Error<T::Error>> {
        if len == 0 {
            self.session.flash_source = Some(dst);
        } else {
            match self.session.flash_source {
                Some(src) if self.permits(src, len) && self.permits(dst, len) => {
                    self.nvm.write_from_memory(&mut self.hal, src, dst, len / 4)?;
                }
                Some(_) => return Ok(()),
                None => warn!("Flash write to {} without a source buffer", dst),
            }
        }

        self.link.send(b"Y\r\n")?;

        Ok(())
    }

    fn reply_value(&mut self, value: u32, width: u32) -> Result<(), Error<T::Error>> {
        if self.session.terminal {
            let mut s: String<16> = String::new();
            let _ = write!(s, "0x{:0w$X}\r\n", value, w = width as usize * 2);
            self.link.send(s.as_bytes())?;
        } else {
            let bytes = value.to_le_bytes();
            self.link.send(&bytes[..width as usize])?;
        }

        Ok(())
    }

    fn reply_version(&mut self) -> Result<(), Error<T::Error>> {
        let stamp = BuildStamp::current();

        let mut s: String<64> = String::new();
        let _ = write!(
            s,
            "v{} {} {} {}\r\n",
            VERSION,
            CAPABILITIES,
            stamp.date.as_str(),
            stamp.time.as_str()
        );
        self.link.send(s.as_bytes())?;

        Ok(())
    }
}
