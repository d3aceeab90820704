//! Receiver link arbitration
//!
//! Several radio receivers may be connected at once, each with a fixed
//! priority (lower number wins). At any time only the highest-priority
//! receiver with a live link feeds control frames to the application. When
//! it loses its link, the next one takes over without any coordination
//! beyond a shared [PriorityMask].
//!
//! ## Flow
//!
//! 1. [Receiver::enable] registers the receiver's interrupt callback with its
//!    [UartLink] and sets its bit in the mask.
//! 2. In interrupt context, [RxSink::on_rx] only queues frames of the right
//!    length, and only if no higher-priority link holds the mask.
//! 3. The receiver's task runs [Receiver::run], which waits for a first frame,
//!    marks the link up, then decodes frames until none arrives within
//!    [RcCfg::LINK_TIMEOUT]. On that timeout the bit is cleared, letting
//!    lower priorities through, and the task waits for a first frame again.
//! 4. Each valid frame is published in a [ControlFrames] pair behind a
//!    [RwLock], and passed to every registered observer.

use core::{
    cell::{Cell, RefCell},
    sync::atomic::{AtomicU32, Ordering},
};

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex};
use embassy_time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    handoff::{RxHandoff, HANDOFF_DEPTH},
    rwlock::{ReadGuard, RwLock},
};

/// Link timeout used by most receivers: 100 ms without a frame
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_millis(100);

/// The default number of observers per receiver
pub const OBSERVERS: usize = 4;

/// The highest usable priority
pub const MAX_PRIORITY: u8 = 31;

/// One bit per receiver with a live (or starting) link
///
/// Bit `p` belongs to the receiver with priority `p`. There must be exactly
/// one mask shared by all receivers of a system.
pub struct PriorityMask(AtomicU32);

impl Default for PriorityMask {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityMask {
    /// Create a mask with no bits set
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn bit(p: u8) -> u32 {
        1u32.checked_shl(u32::from(p)).unwrap_or(0)
    }

    /// Set priority `p`'s bit
    pub fn set(&self, p: u8) {
        self.0.fetch_or(Self::bit(p), Ordering::AcqRel);
    }

    /// Clear priority `p`'s bit
    pub fn clear(&self, p: u8) {
        self.0.fetch_and(!Self::bit(p), Ordering::AcqRel);
    }

    /// Is priority `p`'s bit set?
    pub fn is_set(&self, p: u8) -> bool {
        self.bits() & Self::bit(p) != 0
    }

    /// All bits
    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// The highest active priority, or 32 if none is active
    pub fn lowest_active(&self) -> u32 {
        self.bits().trailing_zeros()
    }

    /// May a receiver with priority `p` feed frames?
    pub fn admits(&self, p: u8) -> bool {
        self.lowest_active() >= u32::from(p)
    }
}

/// Errors when decoding a receiver frame
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum RcDecodeError {
    /// The frame has the wrong length
    Length,
    /// A field is outside its valid range
    OutOfRange,
}

/// A receiver wire protocol
pub trait RcProtocol {
    /// The exact length of one frame
    const FRAME_LEN: usize;

    /// The decoded control state
    type Control: Copy + Default + Send + Sync + 'static;

    /// Decode and validate one frame
    fn decode(buf: &[u8]) -> Result<Self::Control, RcDecodeError>;
}

/// Metadata trait to contain relevant generics
pub trait RcCfg: 'static {
    /// Mutex type used for the handoff, the frames and the bookkeeping
    ///
    /// Must be usable from interrupt context, e.g. `CriticalSectionRawMutex`.
    type Mutex: RawMutex + Send + Sync + 'static;

    /// Wire protocol
    type Protocol: RcProtocol;

    /// Amount of time without a valid-length frame before the link is
    /// considered lost
    const LINK_TIMEOUT: Duration;
}

type Control<Cfg> = <<Cfg as RcCfg>::Protocol as RcProtocol>::Control;

/// The latest decoded control state, and the one before it
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ControlFrames<C> {
    /// The latest state
    pub current: C,
    /// The state before `current`
    pub previous: C,
}

impl<C> ControlFrames<C> {
    /// Did the projected value change between `previous` and `current`?
    ///
    /// ```rust
    /// use pyro_io::arbiter::ControlFrames;
    ///
    /// let f = ControlFrames { current: (1, 2), previous: (0, 2) };
    /// assert!(f.changed(|c| c.0));
    /// assert!(!f.changed(|c| c.1));
    /// ```
    pub fn changed<T: PartialEq>(&self, f: impl Fn(&C) -> T) -> bool {
        f(&self.current) != f(&self.previous)
    }
}

/// Where a receiver is in its link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum LinkState {
    /// Not listening
    Disabled,
    /// Listening, no frame since enable or since the last link loss
    WaitingFirstPacket,
    /// Frames are arriving
    Active,
}

/// Counters kept by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct LinkStats {
    /// Frames decoded and published
    pub accepted: u32,
    /// Frames that failed decoding
    pub invalid: u32,
    /// Frames dropped because the decode task fell behind
    pub overflowed: u32,
    /// Times the link timed out after being up
    pub link_losses: u32,
}

/// The interrupt-side callback of a byte stream
pub trait RxSink: Sync {
    /// Handle one received chunk. Returns whether it was taken.
    fn on_rx(&self, buf: &[u8]) -> bool;
}

/// A UART (or similar) receive path, provided by the platform
pub trait UartLink<'a> {
    /// Error reported by the link
    type Error;

    /// Deliver received chunks to `sink`, registered under `owner`
    fn add_rx_callback(&self, owner: u32, sink: &'a dyn RxSink) -> Result<(), Self::Error>;

    /// Stop delivering to the sink registered under `owner`
    fn remove_rx_callback(&self, owner: u32) -> Result<(), Self::Error>;
}

/// A callback run on every published frame pair
pub type Observer<'a, C> = &'a (dyn Fn(&ControlFrames<C>) + Sync + 'a);

/// The receiver's observer list is full
#[derive(Debug, PartialEq)]
pub struct ObserverListFull;

#[derive(Clone, Copy)]
struct Link {
    state: LinkState,
    stats: LinkStats,
}

/// One prioritized radio receiver
pub struct Receiver<'a, Cfg, const DEPTH: usize = HANDOFF_DEPTH, const OBS: usize = OBSERVERS>
where
    Cfg: RcCfg,
{
    priority: u8,
    mask: &'a PriorityMask,
    handoff: RxHandoff<Cfg::Mutex, DEPTH>,
    link: BlockingMutex<Cfg::Mutex, Cell<Link>>,
    frames: RwLock<Cfg::Mutex, ControlFrames<Control<Cfg>>>,
    observers: BlockingMutex<Cfg::Mutex, RefCell<heapless::Vec<Observer<'a, Control<Cfg>>, OBS>>>,
}

impl<'a, Cfg, const DEPTH: usize, const OBS: usize> Receiver<'a, Cfg, DEPTH, OBS>
where
    Cfg: RcCfg,
{
    /// Create a disabled receiver with the given priority
    ///
    /// `priority` must not exceed [MAX_PRIORITY]. Lower numbers win.
    pub fn new(priority: u8, mask: &'a PriorityMask) -> Self {
        debug_assert!(priority <= MAX_PRIORITY);
        Self {
            priority,
            mask,
            handoff: RxHandoff::new(),
            link: BlockingMutex::new(Cell::new(Link {
                state: LinkState::Disabled,
                stats: LinkStats::default(),
            })),
            frames: RwLock::new(ControlFrames::default()),
            observers: BlockingMutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// This receiver's priority
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// This receiver's link state
    pub fn state(&self) -> LinkState {
        self.link.lock(|l| l.get().state)
    }

    /// Frame counters
    pub fn stats(&self) -> LinkStats {
        let mut stats = self.link.lock(|l| l.get().stats);
        stats.overflowed = self.handoff.overflows();
        stats
    }

    fn with_link<U>(&self, f: impl FnOnce(&mut Link) -> U) -> U {
        self.link.lock(|l| {
            let mut v = l.get();
            let out = f(&mut v);
            l.set(v);
            out
        })
    }

    /// Move from `from` to `to`, unless the state changed underneath us
    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.with_link(|l| {
            let hit = l.state == from;
            if hit {
                l.state = to;
            }
            hit
        })
    }

    /// Start listening on `link`
    ///
    /// The receiver claims its priority bit right away, so lower priorities
    /// are held off until this receiver has seen a frame and then lost its
    /// link.
    pub fn enable<L: UartLink<'a>>(&'a self, link: &L) -> Result<(), L::Error> {
        link.add_rx_callback(u32::from(self.priority), self)?;
        self.with_link(|l| l.state = LinkState::WaitingFirstPacket);
        self.mask.set(self.priority);
        Ok(())
    }

    /// Stop listening on `link`, releasing the priority bit
    pub fn disable<L: UartLink<'a>>(&'a self, link: &L) -> Result<(), L::Error> {
        self.with_link(|l| l.state = LinkState::Disabled);
        self.mask.clear(self.priority);
        self.handoff.clear();
        link.remove_rx_callback(u32::from(self.priority))
    }

    /// Add a callback for every published frame pair
    ///
    /// Observers run in registration order, in the receiver's task, while the
    /// frames are write-locked. They must not try to lock the frames.
    pub fn register_observer(
        &self,
        observer: Observer<'a, Control<Cfg>>,
    ) -> Result<(), ObserverListFull> {
        self.observers
            .lock(|o| o.borrow_mut().push(observer))
            .map_err(|_| ObserverListFull)
    }

    /// Read access to the frame pair
    pub async fn frames(&self) -> ReadGuard<'_, Cfg::Mutex, ControlFrames<Control<Cfg>>> {
        self.frames.read().await
    }

    /// A copy of the frame pair
    pub async fn snapshot(&self) -> ControlFrames<Control<Cfg>> {
        *self.frames.read().await
    }

    /// A copy of the frame pair, if it is not being written right now
    pub fn try_snapshot(&self) -> Option<ControlFrames<Control<Cfg>>> {
        self.frames.try_read().map(|f| *f)
    }

    /// One link session
    ///
    /// Waits as long as necessary for a first frame, then decodes frames
    /// until the link times out (or the receiver is disabled).
    pub async fn run_link(&self) {
        let first = self.handoff.recv().await;
        // A previous session may have been cancelled while active.
        let up = self.with_link(|l| {
            let enabled = l.state != LinkState::Disabled;
            if enabled {
                l.state = LinkState::Active;
            }
            enabled
        });
        if !up {
            return;
        }
        self.mask.set(self.priority);
        io_info!("rc link {=u8} up", self.priority);
        self.process(&first).await;

        loop {
            match self.handoff.recv_timeout(Cfg::LINK_TIMEOUT).await {
                Some(frame) if self.state() == LinkState::Active => self.process(&frame).await,
                Some(_) => return,
                None => {
                    if self.transition(LinkState::Active, LinkState::WaitingFirstPacket) {
                        self.mask.clear(self.priority);
                        self.with_link(|l| l.stats.link_losses = l.stats.link_losses.wrapping_add(1));
                        io_warn!("rc link {=u8} lost", self.priority);
                    }
                    return;
                }
            }
        }
    }

    /// The receiver task body
    pub async fn run(&self) -> ! {
        loop {
            self.run_link().await;
        }
    }

    async fn process(&self, raw: &[u8]) {
        let ctrl = match Cfg::Protocol::decode(raw) {
            Ok(c) => c,
            Err(_e) => {
                self.with_link(|l| l.stats.invalid = l.stats.invalid.wrapping_add(1));
                io_debug!("rc link {=u8} rejected frame", self.priority);
                return;
            }
        };

        // Observers may register more observers, so dispatch from a copy.
        let observers = self.observers.lock(|o| o.borrow().clone());
        let mut frames = self.frames.write().await;
        frames.previous = frames.current;
        frames.current = ctrl;
        for observer in observers.iter() {
            observer(&*frames);
        }
        drop(frames);

        self.with_link(|l| l.stats.accepted = l.stats.accepted.wrapping_add(1));
    }
}

impl<'a, Cfg, const DEPTH: usize, const OBS: usize> RxSink for Receiver<'a, Cfg, DEPTH, OBS>
where
    Cfg: RcCfg,
{
    fn on_rx(&self, buf: &[u8]) -> bool {
        if self.state() == LinkState::Disabled
            || buf.len() != Cfg::Protocol::FRAME_LEN
            || !self.mask.admits(self.priority)
        {
            return false;
        }
        self.handoff.push_from_isr(buf).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use futures::executor::block_on;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    /// Two bytes, the first must be below 100
    struct Pair;

    impl RcProtocol for Pair {
        const FRAME_LEN: usize = 2;
        type Control = (u8, u8);

        fn decode(buf: &[u8]) -> Result<(u8, u8), RcDecodeError> {
            match buf {
                [a, b] if *a < 100 => Ok((*a, *b)),
                [_, _] => Err(RcDecodeError::OutOfRange),
                _ => Err(RcDecodeError::Length),
            }
        }
    }

    struct TestCfg;

    impl RcCfg for TestCfg {
        type Mutex = CriticalSectionRawMutex;
        type Protocol = Pair;
        const LINK_TIMEOUT: Duration = Duration::from_millis(20);
    }

    type Rx = Receiver<'static, TestCfg, 4, 2>;

    #[derive(Default)]
    struct Uart {
        sinks: Mutex<Vec<(u32, &'static dyn RxSink)>>,
    }

    impl UartLink<'static> for Uart {
        type Error = ();

        fn add_rx_callback(&self, owner: u32, sink: &'static dyn RxSink) -> Result<(), ()> {
            self.sinks.lock().unwrap().push((owner, sink));
            Ok(())
        }

        fn remove_rx_callback(&self, owner: u32) -> Result<(), ()> {
            self.sinks.lock().unwrap().retain(|(o, _)| *o != owner);
            Ok(())
        }
    }

    fn receiver(priority: u8, mask: &'static PriorityMask) -> &'static Rx {
        Box::leak(Box::new(Rx::new(priority, mask)))
    }

    fn mask() -> &'static PriorityMask {
        Box::leak(Box::new(PriorityMask::new()))
    }

    #[test]
    fn mask_ops() {
        let m = PriorityMask::new();
        assert_eq!(m.lowest_active(), 32);
        assert!(m.admits(0));
        assert!(m.admits(MAX_PRIORITY));

        m.set(3);
        m.set(5);
        assert!(m.is_set(3));
        assert!(!m.is_set(4));
        assert_eq!(m.bits(), 0b101000);
        assert_eq!(m.lowest_active(), 3);
        assert!(m.admits(2));
        assert!(m.admits(3));
        assert!(!m.admits(5));

        m.clear(3);
        assert!(m.admits(5));
        // Out of range priorities never touch the mask.
        m.set(40);
        assert_eq!(m.bits(), 0b100000);
    }

    #[test]
    fn gating() {
        let mask = mask();
        let rx = receiver(2, mask);
        let uart = Uart::default();

        assert!(!rx.on_rx(&[1, 2]), "disabled receivers take nothing");
        rx.enable(&uart).unwrap();
        assert_eq!(rx.state(), LinkState::WaitingFirstPacket);
        assert!(mask.is_set(2));

        assert!(!rx.on_rx(&[1, 2, 3]), "wrong length");
        assert!(rx.on_rx(&[1, 2]));

        mask.set(1);
        assert!(!rx.on_rx(&[1, 2]), "a higher priority holds the mask");
        mask.clear(1);

        rx.disable(&uart).unwrap();
        assert_eq!(rx.state(), LinkState::Disabled);
        assert!(!mask.is_set(2));
        assert!(uart.sinks.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_frames_change_nothing() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static COUNT: fn(&ControlFrames<(u8, u8)>) = |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        };

        let mask = mask();
        let rx = receiver(0, mask);
        let uart = Uart::default();
        rx.enable(&uart).unwrap();
        rx.register_observer(&COUNT).unwrap();

        assert!(rx.on_rx(&[7, 1]));
        assert!(rx.on_rx(&[200, 1]));
        block_on(rx.run_link());

        let frames = rx.try_snapshot().unwrap();
        assert_eq!(frames.current, (7, 1));
        assert_eq!(frames.previous, (0, 0));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        let stats = rx.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.link_losses, 1);
        assert_eq!(rx.state(), LinkState::WaitingFirstPacket);
        assert!(!mask.is_set(0));
    }

    #[test]
    fn observers_see_frames_in_order() {
        static SEEN: Mutex<Vec<(char, u8, u8)>> = Mutex::new(Vec::new());
        static FIRST: fn(&ControlFrames<(u8, u8)>) = |f| {
            SEEN.lock().unwrap().push(('a', f.current.0, f.previous.0));
        };
        static SECOND: fn(&ControlFrames<(u8, u8)>) = |f| {
            SEEN.lock().unwrap().push(('b', f.current.0, f.previous.0));
        };

        let rx = receiver(4, mask());
        let uart = Uart::default();
        rx.enable(&uart).unwrap();
        rx.register_observer(&FIRST).unwrap();
        rx.register_observer(&SECOND).unwrap();
        assert_eq!(rx.register_observer(&FIRST), Err(ObserverListFull));

        assert!(rx.on_rx(&[1, 0]));
        assert!(rx.on_rx(&[2, 0]));
        block_on(async {
            rx.run_link().await;
            let f = rx.snapshot().await;
            assert!(f.changed(|c| c.0));
            assert!(!f.changed(|c| c.1));
        });

        assert_eq!(
            SEEN.lock().unwrap().as_slice(),
            &[('a', 1, 0), ('b', 1, 0), ('a', 2, 1), ('b', 2, 1)]
        );
    }

    #[test]
    fn overflow_is_counted() {
        let rx = receiver(6, mask());
        let uart = Uart::default();
        rx.enable(&uart).unwrap();
        for i in 0..4 {
            assert!(rx.on_rx(&[i, 0]));
        }
        assert!(!rx.on_rx(&[9, 9]));
        assert_eq!(rx.stats().overflowed, 1);
    }
}
