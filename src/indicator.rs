//! TX / RX activity indicators.
//!
//! The main loop starts a pulse after each transfer; a periodic tick (the
//! SysTick handler on hardware) counts pulses down and drives the LEDs.
//! Only plain atomic loads and stores are used so this also builds for
//! cores without compare-and-swap.

use core::sync::atomic::{AtomicU16, Ordering};

use embedded_hal::digital::v2::OutputPin;

/// Pulse length in ticks (milliseconds)
pub const PULSE_PERIOD: u16 = 100;

/// Countdowns shared between the main loop and the tick handler
pub struct Pulses {
    tx: AtomicU16,
    rx: AtomicU16,
}

/// LED states after a tick
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Lit {
    pub tx: bool,
    pub rx: bool,
}

impl Pulses {
    pub const fn new() -> Self {
        Self {
            tx: AtomicU16::new(0),
            rx: AtomicU16::new(0),
        }
    }

    /// Start (or restart) the transmit pulse
    pub fn pulse_tx(&self) {
        self.tx.store(PULSE_PERIOD, Ordering::Relaxed);
    }

    /// Start (or restart) the receive pulse
    pub fn pulse_rx(&self) {
        self.rx.store(PULSE_PERIOD, Ordering::Relaxed);
    }

    /// Advance both countdowns by one tick
    pub fn tick(&self) -> Lit {
        Lit {
            tx: countdown(&self.tx),
            rx: countdown(&self.rx),
        }
    }

    /// Advance one tick and update the LEDs
    pub fn tick_leds<L: Leds>(&self, leds: &mut L) {
        let lit = self.tick();
        leds.set_tx(lit.tx);
        leds.set_rx(lit.rx);
    }

    pub fn lit(&self) -> Lit {
        Lit {
            tx: self.tx.load(Ordering::Relaxed) != 0,
            rx: self.rx.load(Ordering::Relaxed) != 0,
        }
    }
}

impl Default for Pulses {
    fn default() -> Self {
        Self::new()
    }
}

// Returns whether the pulse is still running after this tick
fn countdown(c: &AtomicU16) -> bool {
    match c.load(Ordering::Relaxed) {
        0 => false,
        n => {
            c.store(n - 1, Ordering::Relaxed);
            n > 1
        }
    }
}

/// Activity LEDs
pub trait Leds {
    fn set_tx(&mut self, on: bool);
    fn set_rx(&mut self, on: bool);
}

/// Activity LEDs on a pair of output pins
pub struct PinLeds<TX, RX> {
    tx: TX,
    rx: RX,
}

impl<TX, RX> PinLeds<TX, RX>
where
    TX: OutputPin,
    RX: OutputPin,
{
    pub fn new(tx: TX, rx: RX) -> Self {
        Self { tx, rx }
    }

    pub fn release(self) -> (TX, RX) {
        (self.tx, self.rx)
    }
}

fn drive<P: OutputPin>(pin: &mut P, on: bool) {
    let r = if on { pin.set_high() } else { pin.set_low() };
    if r.is_err() {
        trace!("Failed to drive indicator pin");
    }
}

impl<TX, RX> Leds for PinLeds<TX, RX>
where
    TX: OutputPin,
    RX: OutputPin,
{
    fn set_tx(&mut self, on: bool) {
        drive(&mut self.tx, on)
    }

    fn set_rx(&mut self, on: bool) {
        drive(&mut self.rx, on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::convert::Infallible;

    #[derive(Default)]
    struct Pin(bool);

    impl OutputPin for Pin {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0 = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0 = true;
            Ok(())
        }
    }

    #[test]
    fn pulse_expires_after_period() {
        let p = Pulses::new();
        p.pulse_tx();

        for _ in 0..PULSE_PERIOD - 1 {
            assert!(p.tick().tx);
        }

        assert_eq!(p.tick(), Lit { tx: false, rx: false });
        assert_eq!(p.tick(), Lit::default());
    }

    #[test]
    fn pulses_are_independent() {
        let p = Pulses::new();
        p.pulse_rx();

        let lit = p.tick();
        assert!(lit.rx);
        assert!(!lit.tx);
    }

    #[test]
    fn retrigger_restarts_countdown() {
        let p = Pulses::new();
        p.pulse_rx();
        for _ in 0..50 {
            p.tick();
        }
        p.pulse_rx();
        for _ in 0..PULSE_PERIOD - 1 {
            assert!(p.tick().rx);
        }
        assert!(!p.tick().rx);
    }

    #[test]
    fn tick_drives_pins() {
        let p = Pulses::new();
        let mut leds = PinLeds::new(Pin::default(), Pin::default());

        p.pulse_tx();
        p.tick_leds(&mut leds);

        let (tx, rx) = leds.release();
        assert!(tx.0);
        assert!(!rx.0);
    }
}
