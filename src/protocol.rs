//! SAM-BA monitor wire protocol.
//!
//! Commands are ASCII: a command letter, optional hexadecimal operands and a
//! `#` terminator, e.g. `W20001000,2A#`.

/// Terminates a command and triggers dispatch
pub const TERMINATOR: u8 = b'#';

/// Commits the accumulated operand as the target pointer
pub const SEPARATOR: u8 = b',';

/// Filler byte, ignored entirely
pub const FILLER: u8 = 0xFF;

/// Emitted after every dispatched command in terminal mode
pub const PROMPT: u8 = b'>';

/// Acknowledgement sent on the USART after a returning `G`
pub const USART_ACK: u8 = 0x06;

/// Line break used by every textual reply
pub const CRLF: &[u8] = b"\r\n";

/// Pending command before any letter was received, and after every dispatch
pub const NO_COMMAND: u8 = b'z';

/// Size of the receive buffer drained on each poll
pub const BUFFER_SIZE: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Write a byte at the pointer
    WriteByte = b'O' as isize,
    /// Write a half-word at the pointer
    WriteHalfWord = b'H' as isize,
    /// Write a word at the pointer
    WriteWord = b'W' as isize,

    /// Read a byte at the pointer
    ReadByte = b'o' as isize,
    /// Read a half-word at the pointer
    ReadHalfWord = b'h' as isize,
    /// Read a word at the pointer
    ReadWord = b'w' as isize,

    /// Receive `operand` bytes into memory at the pointer
    SendFile = b'S' as isize,
    /// Send `operand` bytes from memory at the pointer
    ReceiveFile = b'R' as isize,

    /// Call the code whose vector table is at `operand`
    Go = b'G' as isize,

    /// Switch to terminal (ASCII) mode
    Terminal = b'T' as isize,
    /// Switch to binary mode
    NonTerminal = b'N' as isize,

    /// Report version, capabilities and build stamp
    Version = b'V' as isize,

    /// Erase flash from `operand` to the end of flash
    EraseFlash = b'X' as isize,
    /// Set the flash write source buffer, or write from it into flash
    WriteFlash = b'Y' as isize,
    /// CRC16 of `operand` bytes at the pointer
    Checksum = b'Z' as isize,
}

impl Command {
    /// Decode a pending command letter, `None` for letters without an action
    pub fn from_letter(letter: u8) -> Option<Self> {
        use Command::*;

        let c = match letter {
            b'O' => WriteByte,
            b'H' => WriteHalfWord,
            b'W' => WriteWord,
            b'o' => ReadByte,
            b'h' => ReadHalfWord,
            b'w' => ReadWord,
            b'S' => SendFile,
            b'R' => ReceiveFile,
            b'G' => Go,
            b'T' => Terminal,
            b'N' => NonTerminal,
            b'V' => Version,
            b'X' => EraseFlash,
            b'Y' => WriteFlash,
            b'Z' => Checksum,
            _ => return None,
        };

        Some(c)
    }

    /// Access width in bytes for the single-value read and write commands
    pub fn width(&self) -> Option<u32> {
        match self {
            Command::WriteByte | Command::ReadByte => Some(1),
            Command::WriteHalfWord | Command::ReadHalfWord => Some(2),
            Command::WriteWord | Command::ReadWord => Some(4),
            _ => None,
        }
    }
}

/// Classification of one received byte
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Token {
    /// Ignored filler
    Filler,
    /// Hexadecimal digit value
    Digit(u8),
    /// `,`
    Separator,
    /// `#`
    Terminator,
    /// Anything else becomes the pending command
    Letter(u8),
}

impl From<u8> for Token {
    fn from(b: u8) -> Self {
        match b {
            FILLER => Token::Filler,
            b'0'..=b'9' => Token::Digit(b - b'0'),
            b'A'..=b'F' => Token::Digit(b - b'A' + 0xa),
            b'a'..=b'f' => Token::Digit(b - b'a' + 0xa),
            SEPARATOR => Token::Separator,
            TERMINATOR => Token::Terminator,
            other => Token::Letter(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_bytes() {
        assert_eq!(Token::from(b'7'), Token::Digit(7));
        assert_eq!(Token::from(b'C'), Token::Digit(0xc));
        assert_eq!(Token::from(b'f'), Token::Digit(0xf));
        assert_eq!(Token::from(b','), Token::Separator);
        assert_eq!(Token::from(b'#'), Token::Terminator);
        assert_eq!(Token::from(0xFF), Token::Filler);
        assert_eq!(Token::from(b'w'), Token::Letter(b'w'));
        assert_eq!(Token::from(b'G'), Token::Letter(b'G'));
    }

    #[test]
    fn letters_decode() {
        assert_eq!(Command::from_letter(b'W'), Some(Command::WriteWord));
        assert_eq!(Command::from_letter(b'Z'), Some(Command::Checksum));
        assert_eq!(Command::from_letter(NO_COMMAND), None);
        assert_eq!(Command::from_letter(b'q'), None);

        assert_eq!(Command::ReadHalfWord.width(), Some(2));
        assert_eq!(Command::Go.width(), None);
    }
}
