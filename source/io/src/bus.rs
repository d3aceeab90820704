//! Shared CAN bus types
//!
//! The crate does not drive CAN hardware itself. It consumes a transport
//! through [CanTransport], and receives frames through [FrameSink]
//! listeners that the transport invokes from its receive interrupt.

use core::cell::Cell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex};

/// Numeric identifier of a physical bus, e.g. `BusId(1)` for CAN1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct BusId(pub u8);

/// Identifies one outbound physical frame: a standard id on a given bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct FrameKey {
    /// The bus the frame is sent on
    pub bus: BusId,
    /// The standard (11-bit) frame id
    pub id: u16,
}

impl FrameKey {
    /// Create a new key
    pub const fn new(bus: BusId, id: u16) -> Self {
        Self { bus, id }
    }
}

/// A listener for frames with one particular id
///
/// Invoked from interrupt context. Implementations must not block, and
/// must only do a bounded amount of work.
pub trait FrameSink: Sync {
    /// Handle the payload of one received frame
    fn on_frame(&self, data: &[u8]);
}

/// A CAN transport, provided by the platform
pub trait CanTransport<'a> {
    /// Error reported by the transport
    type Error;

    /// Transmit one 8-byte data frame
    fn send(&self, bus: BusId, id: u16, data: &[u8; 8]) -> Result<(), Self::Error>;

    /// Route frames received on `bus` with the given `id` to `sink`
    fn register_listener(
        &self,
        bus: BusId,
        id: u16,
        sink: &'a dyn FrameSink,
    ) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy)]
struct Latest {
    data: Option<[u8; 8]>,
    count: u32,
}

/// Holds the most recent payload received for one actuator
///
/// Written from the receive interrupt, read from the control task. Payloads
/// shorter than 8 bytes are zero-padded, longer ones are truncated.
pub struct FeedbackBuffer<R: RawMutex> {
    inner: BlockingMutex<R, Cell<Latest>>,
}

impl<R: RawMutex> Default for FeedbackBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> FeedbackBuffer<R> {
    /// Create an empty buffer
    pub const fn new() -> Self {
        Self {
            inner: BlockingMutex::new(Cell::new(Latest {
                data: None,
                count: 0,
            })),
        }
    }

    /// Store a received payload
    pub fn store(&self, data: &[u8]) {
        let mut buf = [0u8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        self.inner.lock(|l| {
            let mut v = l.get();
            v.data = Some(buf);
            v.count = v.count.wrapping_add(1);
            l.set(v);
        });
    }

    /// The most recent payload, if any frame has arrived yet
    pub fn latest(&self) -> Option<[u8; 8]> {
        self.inner.lock(|l| l.get().data)
    }

    /// How many frames have been stored so far (wrapping)
    pub fn frames_received(&self) -> u32 {
        self.inner.lock(|l| l.get().count)
    }
}

impl<R: RawMutex + Sync> FrameSink for FeedbackBuffer<R> {
    fn on_frame(&self, data: &[u8]) {
        self.store(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    #[test]
    fn pads_and_truncates() {
        let buf = FeedbackBuffer::<CriticalSectionRawMutex>::new();
        assert_eq!(buf.latest(), None);
        assert_eq!(buf.frames_received(), 0);

        buf.on_frame(&[1, 2, 3]);
        assert_eq!(buf.latest(), Some([1, 2, 3, 0, 0, 0, 0, 0]));

        buf.on_frame(&[9; 12]);
        assert_eq!(buf.latest(), Some([9; 8]));
        assert_eq!(buf.frames_received(), 2);
    }
}
