//! Frame multiplexing
//!
//! Several actuators of the scaled-integer family share one 8-byte command
//! frame, each owning a 2-byte slot. A [FrameMultiplexer] collects the slot
//! values and transmits the frame once every registered slot has been
//! refreshed since the last transmission. This keeps a group of actuators
//! commanded together, with one frame per control cycle.
//!
//! Multiplexers are owned by a [MuxRegistry], which creates exactly one per
//! [FrameKey] on first use.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex};

use crate::bus::{CanTransport, FrameKey};

/// The number of 2-byte slots in one frame
pub const SLOTS: usize = 4;

/// The default number of multiplexers a registry can hold
pub const REGISTRY_SIZE: usize = 8;

/// Outcome of a slot update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Completion {
    /// This update completed the frame, and it has been handed to the transport
    Sent,
    /// Other registered slots have not been refreshed yet
    Pending,
}

/// Errors from a [FrameMultiplexer]
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum MuxError<E> {
    /// The slot index is outside `0..4`
    InvalidSlot,
    /// Another actuator already owns this slot
    AlreadyRegistered,
    /// Nobody registered this slot
    Unregistered,
    /// The transport refused the frame
    Bus(E),
}

/// The registry has no room for another multiplexer
#[derive(Debug, PartialEq)]
pub struct RegistryFull;

struct SlotTable {
    key: Option<FrameKey>,
    registered: [bool; SLOTS],
    fresh: [bool; SLOTS],
    values: [i16; SLOTS],
}

/// Combines up to four slot values into one outbound frame
pub struct FrameMultiplexer<'a, R: RawMutex, T> {
    transport: &'a T,
    table: BlockingMutex<R, RefCell<SlotTable>>,
}

impl<'a, R: RawMutex, T: CanTransport<'a>> FrameMultiplexer<'a, R, T> {
    const fn unassigned(transport: &'a T) -> Self {
        Self {
            transport,
            table: BlockingMutex::new(RefCell::new(SlotTable {
                key: None,
                registered: [false; SLOTS],
                fresh: [false; SLOTS],
                values: [0; SLOTS],
            })),
        }
    }

    fn assign(&self, key: FrameKey) {
        self.table.lock(|t| t.borrow_mut().key = Some(key));
    }

    /// The frame this multiplexer transmits
    ///
    /// Always `Some` for multiplexers handed out by a [MuxRegistry].
    pub fn key(&self) -> Option<FrameKey> {
        self.table.lock(|t| t.borrow().key)
    }

    /// Claim a slot. Each slot can be claimed once.
    pub fn register(&self, slot: usize) -> Result<(), MuxError<T::Error>> {
        if slot >= SLOTS {
            return Err(MuxError::InvalidSlot);
        }
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            if core::mem::replace(&mut t.registered[slot], true) {
                io_warn!("mux slot {=usize} claimed twice", slot);
                return Err(MuxError::AlreadyRegistered);
            }
            Ok(())
        })
    }

    /// Give back a slot claimed by [FrameMultiplexer::register]
    pub(crate) fn release(&self, slot: usize) {
        if slot >= SLOTS {
            return;
        }
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            t.registered[slot] = false;
            t.fresh[slot] = false;
            t.values[slot] = 0;
        });
    }

    /// Set a slot value, transmitting the frame if it is now complete
    ///
    /// The frame is built under the multiplexer's lock, with each registered
    /// slot's value big-endian at offset `2 * slot` and unregistered slots
    /// left zero. All slots are then marked stale, so the next frame waits for
    /// a full set of fresh values again. The transport is called after the
    /// lock has been released.
    pub fn update(&self, slot: usize, value: i16) -> Result<Completion, MuxError<T::Error>> {
        if slot >= SLOTS {
            return Err(MuxError::InvalidSlot);
        }

        let ready = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            if !t.registered[slot] {
                return Err(MuxError::Unregistered);
            }
            t.values[slot] = value;
            t.fresh[slot] = true;

            let complete = (0..SLOTS).all(|i| !t.registered[i] || t.fresh[i]);
            if !complete {
                return Ok(None);
            }
            let key = t.key.ok_or(MuxError::Unregistered)?;

            let mut frame = [0u8; 8];
            for i in (0..SLOTS).filter(|&i| t.registered[i]) {
                frame[2 * i..][..2].copy_from_slice(&t.values[i].to_be_bytes());
            }
            t.fresh = [false; SLOTS];
            Ok(Some((key, frame)))
        })?;

        match ready {
            None => Ok(Completion::Pending),
            Some((key, frame)) => {
                io_trace!("mux frame {=u16:X} sent", key.id);
                self.transport
                    .send(key.bus, key.id, &frame)
                    .map_err(MuxError::Bus)?;
                Ok(Completion::Sent)
            }
        }
    }

    /// Which slots have been claimed
    pub fn registered_slots(&self) -> [bool; SLOTS] {
        self.table.lock(|t| t.borrow().registered)
    }

    /// Which claimed slots still need a fresh value before the next frame
    pub fn pending_slots(&self) -> [bool; SLOTS] {
        self.table.lock(|t| {
            let t = t.borrow();
            core::array::from_fn(|i| t.registered[i] && !t.fresh[i])
        })
    }
}

/// Owns the multiplexers for one transport, one per [FrameKey]
pub struct MuxRegistry<'a, R: RawMutex, T, const N: usize = REGISTRY_SIZE> {
    transport: &'a T,
    muxes: [FrameMultiplexer<'a, R, T>; N],
    used: BlockingMutex<R, Cell<usize>>,
}

impl<'a, R: RawMutex, T: CanTransport<'a>, const N: usize> MuxRegistry<'a, R, T, N> {
    /// Create an empty registry bound to `transport`
    pub fn new(transport: &'a T) -> Self {
        Self {
            transport,
            muxes: core::array::from_fn(|_| FrameMultiplexer::unassigned(transport)),
            used: BlockingMutex::new(Cell::new(0)),
        }
    }

    /// The transport all multiplexers send through
    pub fn transport(&self) -> &'a T {
        self.transport
    }

    /// Find the multiplexer for `key`, creating it on first use
    ///
    /// Creation is serialized, so concurrent callers with the same key
    /// always receive the same multiplexer.
    pub fn get_or_create(&self, key: FrameKey) -> Result<&FrameMultiplexer<'a, R, T>, RegistryFull> {
        self.used.lock(|used| {
            let n = used.get();
            if let Some(m) = self.muxes[..n].iter().find(|m| m.key() == Some(key)) {
                return Ok(m);
            }
            let m = self.muxes.get(n).ok_or(RegistryFull)?;
            m.assign(key);
            used.set(n + 1);
            io_debug!("mux created for frame {=u16:X}", key.id);
            Ok(m)
        })
    }

    /// Find an existing multiplexer
    pub fn get(&self, key: FrameKey) -> Option<&FrameMultiplexer<'a, R, T>> {
        let n = self.len();
        self.muxes[..n].iter().find(|m| m.key() == Some(key))
    }

    /// The number of multiplexers created so far
    pub fn len(&self) -> usize {
        self.used.lock(|u| u.get())
    }

    /// `true` until the first multiplexer is created
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
