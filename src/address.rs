//! Raw target addresses.
//!
//! Every address the monitor dereferences comes straight from operator
//! supplied hex. The conversion from number to address happens here and
//! nowhere else, along with the optional window check.

use core::fmt;

/// Raw memory address on the target
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u32);

impl Address {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Address `n` bytes further on, wrapping at the top of the address space
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Contiguous range of accessible memory
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Window {
    pub start: u32,
    pub len: u32,
}

impl Window {
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// Check `[addr, addr + len)` lies entirely inside this window
    pub fn contains(&self, addr: Address, len: u32) -> bool {
        let offset = match addr.0.checked_sub(self.start) {
            Some(o) => o,
            None => return false,
        };

        match offset.checked_add(len) {
            Some(end) => end <= self.len,
            None => false,
        }
    }
}

/// Access policy applied before any command touches memory
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AddressPolicy<'a> {
    /// Any address is accepted, as the stock SAM-BA monitor does
    Unchecked,
    /// Accesses must fall entirely within one of the windows
    Windows(&'a [Window]),
}

impl<'a> Default for AddressPolicy<'a> {
    fn default() -> Self {
        AddressPolicy::Unchecked
    }
}

impl<'a> AddressPolicy<'a> {
    pub fn permits(&self, addr: Address, len: u32) -> bool {
        match self {
            AddressPolicy::Unchecked => true,
            AddressPolicy::Windows(windows) => windows.iter().any(|w| w.contains(addr, len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS: &[Window] = &[
        Window::new(0x0000_0000, 0x4_0000),
        Window::new(0x2000_0000, 0x8000),
    ];

    #[test]
    fn window_bounds() {
        let w = Window::new(0x2000_0000, 0x100);

        assert!(w.contains(Address(0x2000_0000), 4));
        assert!(w.contains(Address(0x2000_00fc), 4));
        assert!(!w.contains(Address(0x2000_00fd), 4));
        assert!(!w.contains(Address(0x1fff_fffc), 4));
        assert!(!w.contains(Address(0x2000_0000), u32::MAX));
    }

    #[test]
    fn unchecked_permits_anything() {
        let p = AddressPolicy::default();

        assert!(p.permits(Address(0xffff_fffc), 4));
        assert!(p.permits(Address(0x4100_4000), 4));
    }

    #[test]
    fn windows_reject_outside_access() {
        let p = AddressPolicy::Windows(WINDOWS);

        assert!(p.permits(Address(0x1000), 4));
        assert!(p.permits(Address(0x2000_7ffc), 4));
        assert!(!p.permits(Address(0x2000_7ffe), 4));
        assert!(!p.permits(Address(0x4100_4000), 1));
    }

    #[test]
    fn offsets_wrap_and_display() {
        assert_eq!(Address(0xffff_fffe).offset(4), Address(2));
        assert_eq!(format!("{}", Address(0x4000)), "0x00004000");
    }
}
