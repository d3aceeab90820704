//! Interrupt to task frame handoff
//!
//! A receive interrupt copies each raw frame into an [RxHandoff] and returns
//! immediately. The decode task awaits frames on the other side. The queue is
//! bounded: when the task falls behind, new frames are dropped and counted,
//! never blocking the interrupt.

use core::cell::Cell;

use embassy_sync::{
    blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex},
    channel::Channel,
};
use embassy_time::{with_timeout, Duration};

/// The largest frame the handoff can carry
pub const FRAME_CAPACITY: usize = 32;

/// The default queue depth
pub const HANDOFF_DEPTH: usize = 4;

/// One raw frame, copied out of the receive buffer
pub type RawFrame = heapless::Vec<u8, FRAME_CAPACITY>;

/// Errors when pushing a frame
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum HandoffError {
    /// The frame is longer than [FRAME_CAPACITY]
    TooLong,
    /// The queue is full, the frame was dropped
    Full,
}

/// A bounded single-producer single-consumer frame queue
pub struct RxHandoff<R: RawMutex, const DEPTH: usize = HANDOFF_DEPTH> {
    chan: Channel<R, RawFrame, DEPTH>,
    overflows: BlockingMutex<R, Cell<u32>>,
}

impl<R: RawMutex, const DEPTH: usize> Default for RxHandoff<R, DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex, const DEPTH: usize> RxHandoff<R, DEPTH> {
    /// Create an empty handoff
    pub const fn new() -> Self {
        Self {
            chan: Channel::new(),
            overflows: BlockingMutex::new(Cell::new(0)),
        }
    }

    /// Queue a copy of `data`. Never blocks.
    ///
    /// Safe to call from interrupt context.
    pub fn push_from_isr(&self, data: &[u8]) -> Result<(), HandoffError> {
        let frame = RawFrame::from_slice(data).map_err(|_| HandoffError::TooLong)?;
        self.chan.try_send(frame).map_err(|_| {
            self.overflows.lock(|o| o.set(o.get().wrapping_add(1)));
            io_warn!("handoff full, frame dropped");
            HandoffError::Full
        })
    }

    /// Wait for the oldest queued frame
    pub async fn recv(&self) -> RawFrame {
        self.chan.receive().await
    }

    /// Wait for the oldest queued frame, at most `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<RawFrame> {
        with_timeout(timeout, self.chan.receive()).await.ok()
    }

    /// Take the oldest queued frame, if any, without waiting
    pub fn try_recv(&self) -> Option<RawFrame> {
        self.chan.try_receive().ok()
    }

    /// Drop every queued frame
    pub fn clear(&self) {
        while self.chan.try_receive().is_ok() {}
    }

    /// How many frames have been dropped because the queue was full
    pub fn overflows(&self) -> u32 {
        self.overflows.lock(|o| o.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use futures::executor::block_on;

    type Handoff = RxHandoff<CriticalSectionRawMutex, 2>;

    #[test]
    fn fifo_and_overflow() {
        let h = Handoff::new();
        h.push_from_isr(&[1]).unwrap();
        h.push_from_isr(&[2, 2]).unwrap();
        assert_eq!(h.push_from_isr(&[3]), Err(HandoffError::Full));
        assert_eq!(h.overflows(), 1);

        block_on(async {
            assert_eq!(h.recv().await.as_slice(), &[1]);
            assert_eq!(h.recv().await.as_slice(), &[2, 2]);
            assert!(h.recv_timeout(Duration::from_millis(5)).await.is_none());
        });
    }

    #[test]
    fn rejects_oversized() {
        let h = Handoff::new();
        assert_eq!(h.push_from_isr(&[0; FRAME_CAPACITY + 1]), Err(HandoffError::TooLong));
        assert_eq!(h.overflows(), 0);
        assert!(h.try_recv().is_none());
        h.push_from_isr(&[0; FRAME_CAPACITY]).unwrap();
        assert_eq!(h.try_recv().map(|f| f.len()), Some(FRAME_CAPACITY));
    }

    #[test]
    fn clear_drains() {
        let h = Handoff::new();
        h.push_from_isr(&[1]).unwrap();
        h.push_from_isr(&[2]).unwrap();
        h.clear();
        assert!(h.try_recv().is_none());
        h.push_from_isr(&[3]).unwrap();
        assert_eq!(h.try_recv().unwrap().as_slice(), &[3]);
    }
}
