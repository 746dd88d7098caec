//! Transfer of control into code loaded on the target.

use crate::address::Address;
use crate::hal::Hardware;

/// Initial stack pointer and reset handler from a vector table
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vectors {
    pub stack_pointer: u32,
    pub entry: u32,
}

impl Vectors {
    /// Read the first two words of the vector table at `table`
    pub fn read<H: Hardware>(hal: &mut H, table: Address) -> Self {
        Self {
            stack_pointer: hal.read_u32(table),
            entry: hal.read_u32(table.offset(4)),
        }
    }
}

/// Call the code whose vector table is at `table`.
///
/// Interrupts are masked and the stack is rebased onto the applet's initial
/// stack pointer. A full application never comes back; if the called code
/// does return, the monitor's stack pointer is reinstated and interrupts are
/// re-enabled.
pub fn call_applet<H: Hardware>(hal: &mut H, table: Address) {
    hal.disable_interrupts();

    let saved = hal.stack_pointer();
    let vectors = Vectors::read(hal, table);

    info!(
        "Calling applet at {} (sp: 0x{:08x}, entry: 0x{:08x})",
        table, vectors.stack_pointer, vectors.entry
    );

    hal.call(vectors.stack_pointer, vectors.entry);

    hal.set_stack_pointer(saved);
    hal.enable_interrupts();

    debug!("Applet returned");
}
