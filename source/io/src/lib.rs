//! # Pyro I/O
//!
//! This is the actuator and receiver I/O core of the pyro robot controller.
//! It sits between a platform's CAN and UART drivers and the control code,
//! and is intended for bare metal devices running an async executor such as
//! embassy. It never allocates.
//!
//! ## Actuators
//!
//! Motors are reached over CAN, through a [CanTransport](bus::CanTransport)
//! provided by the platform. Two motor families are supported:
//!
//! 1. Scaled-integer motors (M3508, M2006, GM6020). Up to four of them share
//!    one 8-byte command frame, each owning a 2-byte slot. A
//!    [FrameMultiplexer](mux::FrameMultiplexer) collects the slot values and
//!    sends the frame once every registered slot has a fresh value, so a
//!    group is always commanded together.
//! 2. Packed-field motors (DM4310 style). Each command fills a frame of its
//!    own with bit-packed, range-quantized position, velocity, gain and
//!    torque fields.
//!
//! Both are exposed through the [Actuator](motor::Actuator) trait. Feedback
//! frames are stored by the transport's receive interrupt into a
//! [FeedbackBuffer](bus::FeedbackBuffer), and decoded on request by the
//! control task.
//!
//! ## Receivers
//!
//! Radio receivers deliver frames over a UART. A receive interrupt hands each
//! frame to an [RxHandoff](handoff::RxHandoff), and a decode task validates
//! and publishes it.
//!
//! Several receivers may be connected at once. Each [Receiver](arbiter::Receiver)
//! has a fixed priority, and all of them share one
//! [PriorityMask](arbiter::PriorityMask):
//!
//! * A receiver's bit is set while its link is up.
//! * A receiver only accepts frames while no higher-priority bit is set.
//! * A receiver that hears nothing for its link timeout clears its bit, and
//!   the next priority takes over.
//!
//! Decoded frames are kept as a current/previous pair behind a
//! writer-priority [RwLock](rwlock::RwLock), so edge detection ("did this
//! switch just move?") needs no extra state in the control code.
//!
//! ## Contexts
//!
//! Entry points called from interrupts (`on_frame`, `on_rx`,
//! `push_from_isr`) never wait and do bounded work. Everything that may
//! wait is `async`. Shared state called from interrupts must use a mutex
//! that is interrupt safe, such as `CriticalSectionRawMutex`.
//!
//! ## Logging
//!
//! With the `defmt-logging` feature, link changes, rejected frames and
//! dropped frames are logged through `defmt`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod arbiter;
pub mod bus;
pub mod codec;
pub mod dr16;
pub mod handoff;
pub mod motor;
pub mod mux;
pub mod rwlock;

pub use crate::{
    arbiter::{PriorityMask, Receiver},
    bus::{BusId, FrameKey},
    motor::Actuator,
    mux::{Completion, MuxRegistry},
    rwlock::RwLock,
};
