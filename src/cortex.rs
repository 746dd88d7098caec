//! Bare-metal Cortex-M0+ backend.

use core::arch::asm;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::SCB;

use crate::address::Address;
use crate::hal::{Boot, Clock, Hardware};

const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;

/// Direct memory access on the running core
pub struct CortexM {
    app_start: Address,
}

impl CortexM {
    /// Safety: the monitor gets raw access to the whole address space, there
    /// must be no other owner of the memory it is told to touch
    pub unsafe fn new(app_start: Address) -> Self {
        Self { app_start }
    }
}

impl Hardware for CortexM {
    fn read_u8(&mut self, addr: Address) -> u8 {
        unsafe { ptr::read_volatile(addr.value() as *const u8) }
    }

    fn read_u16(&mut self, addr: Address) -> u16 {
        unsafe { ptr::read_volatile(addr.value() as *const u16) }
    }

    fn read_u32(&mut self, addr: Address) -> u32 {
        unsafe { ptr::read_volatile(addr.value() as *const u32) }
    }

    fn write_u8(&mut self, addr: Address, value: u8) {
        unsafe { ptr::write_volatile(addr.value() as *mut u8, value) }
    }

    fn write_u16(&mut self, addr: Address, value: u16) {
        unsafe { ptr::write_volatile(addr.value() as *mut u16, value) }
    }

    fn write_u32(&mut self, addr: Address, value: u32) {
        unsafe { ptr::write_volatile(addr.value() as *mut u32, value) }
    }

    fn disable_interrupts(&mut self) {
        cortex_m::interrupt::disable();
    }

    fn enable_interrupts(&mut self) {
        unsafe { cortex_m::interrupt::enable() }
    }

    fn stack_pointer(&mut self) -> u32 {
        cortex_m::register::msp::read()
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        unsafe { asm!("msr MSP, {}", in(reg) sp, options(nomem, nostack, preserves_flags)) }
    }

    fn call(&mut self, stack_pointer: u32, entry: u32) {
        // Entry addresses from a vector table carry the thumb bit
        unsafe {
            asm!(
                "mrs {saved}, MSP",
                "msr MSP, {sp}",
                "blx {entry}",
                "msr MSP, {saved}",
                sp = in(reg) stack_pointer,
                entry = in(reg) entry,
                saved = out(reg) _,
                clobber_abi("C"),
            )
        }
    }
}

impl Boot for CortexM {
    fn system_reset(&mut self) -> ! {
        SCB::sys_reset()
    }

    fn start_application(&mut self) -> ! {
        cortex_m::interrupt::disable();

        let table = self.app_start.value();
        unsafe {
            ptr::write_volatile(SCB_VTOR, table);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            cortex_m::asm::bootload(table as *const u32)
        }
    }
}

/// Millisecond counter advanced from the SysTick handler
pub struct Ticks {
    millis: AtomicU32,
}

impl Ticks {
    pub const fn new() -> Self {
        Self {
            millis: AtomicU32::new(0),
        }
    }

    /// Call once per millisecond, from interrupt context only.
    ///
    /// Load and store rather than read-modify-write, thumbv6m has no atomic
    /// RMW instructions and the handler is the only writer.
    pub fn tick(&self) {
        let now = self.millis.load(Ordering::Relaxed);
        self.millis.store(now.wrapping_add(1), Ordering::Relaxed);
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Clock for &'a Ticks {
    fn millis(&mut self) -> u64 {
        self.millis.load(Ordering::Relaxed) as u64
    }
}
