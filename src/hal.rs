//! Hardware capabilities the monitor is built on.
//!
//! Everything that touches the target directly goes through these traits, so
//! the interpreter and installer run unchanged against a simulated chip.

use crate::address::Address;

/// Memory access, interrupt masking and control transfer on the target
pub trait Hardware {
    fn read_u8(&mut self, addr: Address) -> u8;
    fn read_u16(&mut self, addr: Address) -> u16;
    fn read_u32(&mut self, addr: Address) -> u32;

    fn write_u8(&mut self, addr: Address, value: u8);
    fn write_u16(&mut self, addr: Address, value: u16);
    fn write_u32(&mut self, addr: Address, value: u32);

    /// Copy memory starting at `addr` into `buff`
    fn read_bytes(&mut self, addr: Address, buff: &mut [u8]) {
        for (i, b) in buff.iter_mut().enumerate() {
            *b = self.read_u8(addr.offset(i as u32));
        }
    }

    /// Copy `data` into memory starting at `addr`
    fn write_bytes(&mut self, addr: Address, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(addr.offset(i as u32), *b);
        }
    }

    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    /// Current privileged (main) stack pointer
    fn stack_pointer(&mut self) -> u32;

    /// Overwrite the privileged stack pointer
    fn set_stack_pointer(&mut self, sp: u32);

    /// Rebase the privileged stack onto `stack_pointer` and branch to `entry`.
    ///
    /// Returns only if the called code returns, with the caller's stack
    /// pointer reinstated.
    fn call(&mut self, stack_pointer: u32, entry: u32);
}

/// One-way exits out of the bootloader
pub trait Boot {
    /// Full device reset, restarting into the bootloader
    fn system_reset(&mut self) -> !;

    /// Start the installed application from its vector table
    fn start_application(&mut self) -> !;
}

/// Monotonic millisecond clock
pub trait Clock {
    fn millis(&mut self) -> u64;
}
