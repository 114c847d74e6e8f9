use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::signal::Signal;

use crate::RawMutex;

/// Byte transport to the modem, implemented by the UART driver.
///
/// All methods are non-blocking. The driver reports new bytes and carrier changes through
/// [`IoEvents`].
pub trait ModemUart {
    /// Queues `bytes` for transmission, returns how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Number of received bytes waiting in the driver's buffer.
    fn bytes_available(&self) -> usize;

    /// Takes one received byte. Only valid when `bytes_available() > 0`.
    fn read_byte(&mut self) -> Option<u8>;

    /// Reconfigures the local side of the link.
    fn set_baud_rate(&mut self, baud_rate: u32);

    /// Drives the DTR control line.
    fn set_dtr(&mut self, active: bool);
}

const RX: u8 = 1;
const TX: u8 = 1 << 1;
const CARRIER_LOST: u8 = 1 << 2;

/// A set of pending I/O events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoFlags(u8);

impl IoFlags {
    pub fn rx(&self) -> bool {
        self.0 & RX != 0
    }

    pub fn tx(&self) -> bool {
        self.0 & TX != 0
    }

    pub fn carrier_lost(&self) -> bool {
        self.0 & CARRIER_LOST != 0
    }
}

/// Event flags shared between the UART interrupt (producer) and the engine task (consumer).
///
/// The producer only sets flags and wakes the consumer, it never touches engine state.
pub struct IoEvents {
    flags: AtomicU8,
    wake: Signal<RawMutex, ()>,
}

impl Default for IoEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl IoEvents {
    pub const fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            wake: Signal::new(),
        }
    }

    fn raise(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
        self.wake.signal(());
    }

    /// New bytes were received.
    pub fn notify_rx(&self) {
        self.raise(RX);
    }

    /// The transmit buffer has room again.
    pub fn notify_tx_ready(&self) {
        self.raise(TX);
    }

    /// DCD dropped.
    pub fn notify_carrier_lost(&self) {
        self.raise(CARRIER_LOST);
    }

    /// Takes all pending flags without waiting.
    pub fn take(&self) -> IoFlags {
        IoFlags(self.flags.swap(0, Ordering::AcqRel))
    }

    /// Waits until at least one flag is set and takes all of them.
    pub async fn wait(&self) -> IoFlags {
        loop {
            let flags = self.take();
            if flags.0 != 0 {
                return flags;
            }
            self.wake.wait().await;
        }
    }
}

#[cfg(test)]
mod test_uart {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn test_flags_accumulate_until_taken() {
        let events = IoEvents::new();
        assert_eq!(events.take(), IoFlags(0));
        events.notify_rx();
        events.notify_carrier_lost();
        let flags = block_on(events.wait());
        assert!(flags.rx());
        assert!(flags.carrier_lost());
        assert!(!flags.tx());
        assert_eq!(events.take(), IoFlags(0));
    }
}
