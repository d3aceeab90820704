//! Actuators
//!
//! An actuator couples a [MotorCodec] with its bus wiring: where commands go
//! and where feedback comes from. Control code talks to the [Actuator] trait
//! and does not care which motor family is behind it.
//!
//! Feedback is pulled, not pushed. The transport's receive interrupt stores
//! the newest frame in a [FeedbackBuffer], and [Actuator::update_feedback]
//! decodes it when the control loop asks for it.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{
    bus::{BusId, CanTransport, FeedbackBuffer, FrameKey},
    codec::{
        FeedbackSample, MitCommand, MotorCodec, PackedCodec, PackedRanges, ScaledCodec,
        ScaledModel, DISABLE, ENABLE,
    },
    mux::{Completion, FrameMultiplexer, MuxError, MuxRegistry},
};

/// Errors from actuator construction and commands
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum MotorError<E> {
    /// The motor id is not valid for this model
    InvalidId(u8),
    /// No multiplexer could be created for the command frame
    RegistryFull,
    /// The command frame multiplexer refused the request
    Mux(MuxError<E>),
    /// The transport refused a frame or listener
    Bus(E),
}

impl<E> From<MuxError<E>> for MotorError<E> {
    fn from(value: MuxError<E>) -> Self {
        Self::Mux(value)
    }
}

/// A torque-commanded motor
pub trait Actuator {
    /// Error reported by commands
    type Error;

    /// Put the motor into active control
    fn enable(&mut self) -> Result<(), Self::Error>;

    /// Take the motor out of active control
    fn disable(&mut self) -> Result<(), Self::Error>;

    /// Has [Actuator::enable] been called more recently than [Actuator::disable]?
    fn is_enabled(&self) -> bool;

    /// Decode the newest received frame
    ///
    /// The current sample moves to [Actuator::previous_feedback]. Returns
    /// `false`, leaving both samples unchanged, until the first frame arrives.
    fn update_feedback(&mut self) -> bool;

    /// Command a torque
    ///
    /// Commands are not gated on [Actuator::is_enabled]. Motors that need an
    /// explicit enable ignore them until enabled.
    fn send_command(&mut self, torque: f32) -> Result<Completion, Self::Error>;

    /// The most recently decoded sample
    fn feedback(&self) -> &FeedbackSample;

    /// The sample decoded before [Actuator::feedback]
    fn previous_feedback(&self) -> &FeedbackSample;
}

/// A scaled-integer motor, commanded through a shared frame
pub struct ScaledMotor<'a, R: RawMutex, T> {
    codec: ScaledCodec,
    id: u8,
    slot: usize,
    mux: &'a FrameMultiplexer<'a, R, T>,
    buffer: &'a FeedbackBuffer<R>,
    enabled: bool,
    current: FeedbackSample,
    previous: FeedbackSample,
}

impl<'a, R, T> ScaledMotor<'a, R, T>
where
    R: RawMutex + Sync,
    T: CanTransport<'a>,
{
    /// Wire up motor `id` of the given model on `bus`
    ///
    /// This routes the motor's feedback frames into `buffer` and claims the
    /// motor's slot in its command frame's multiplexer, creating that
    /// multiplexer if this is the first motor in the frame.
    pub fn new<const N: usize>(
        model: ScaledModel,
        id: u8,
        bus: BusId,
        registry: &'a MuxRegistry<'a, R, T, N>,
        buffer: &'a FeedbackBuffer<R>,
    ) -> Result<Self, MotorError<T::Error>> {
        let (Some(tx_id), Some(rx_id), Some(slot)) =
            (model.command_id(id), model.feedback_id(id), model.slot(id))
        else {
            return Err(MotorError::InvalidId(id));
        };

        let mux = registry
            .get_or_create(FrameKey::new(bus, tx_id))
            .map_err(|_| MotorError::RegistryFull)?;
        mux.register(slot)?;
        if let Err(e) = registry.transport().register_listener(bus, rx_id, buffer) {
            mux.release(slot);
            return Err(MotorError::Bus(e));
        }

        Ok(Self {
            codec: ScaledCodec::new(model),
            id,
            slot,
            mux,
            buffer,
            enabled: false,
            current: FeedbackSample::default(),
            previous: FeedbackSample::default(),
        })
    }

    /// The motor id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// The motor's slot in its command frame
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<'a, R, T> Actuator for ScaledMotor<'a, R, T>
where
    R: RawMutex + Sync,
    T: CanTransport<'a>,
{
    type Error = MotorError<T::Error>;

    fn enable(&mut self) -> Result<(), Self::Error> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), Self::Error> {
        self.enabled = false;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn update_feedback(&mut self) -> bool {
        let Some(raw) = self.buffer.latest() else {
            return false;
        };
        self.previous = self.current;
        self.current = self.codec.decode_feedback(&raw);
        true
    }

    fn send_command(&mut self, torque: f32) -> Result<Completion, Self::Error> {
        let raw = self.codec.encode_command(&torque);
        Ok(self.mux.update(self.slot, raw)?)
    }

    fn feedback(&self) -> &FeedbackSample {
        &self.current
    }

    fn previous_feedback(&self) -> &FeedbackSample {
        &self.previous
    }
}

/// A packed-field motor, with a frame of its own
pub struct PackedMotor<'a, R: RawMutex, T> {
    codec: PackedCodec,
    bus: BusId,
    tx_id: u16,
    transport: &'a T,
    buffer: &'a FeedbackBuffer<R>,
    kp: f32,
    kd: f32,
    enabled: bool,
    current: FeedbackSample,
    previous: FeedbackSample,
}

impl<'a, R, T> PackedMotor<'a, R, T>
where
    R: RawMutex + Sync,
    T: CanTransport<'a>,
{
    /// Wire up a motor that takes commands on `tx_id` and reports on `rx_id`
    pub fn new(
        codec: PackedCodec,
        bus: BusId,
        tx_id: u16,
        rx_id: u16,
        transport: &'a T,
        buffer: &'a FeedbackBuffer<R>,
    ) -> Result<Self, MotorError<T::Error>> {
        transport
            .register_listener(bus, rx_id, buffer)
            .map_err(MotorError::Bus)?;
        Ok(Self {
            codec,
            bus,
            tx_id,
            transport,
            buffer,
            kp: 0.0,
            kd: 0.0,
            enabled: false,
            current: FeedbackSample::default(),
            previous: FeedbackSample::default(),
        })
    }

    /// Set the gains used by [Actuator::send_command]
    ///
    /// With both gains at zero (the default) a command is pure torque.
    pub fn set_gains(&mut self, kp: f32, kd: f32) {
        self.kp = kp;
        self.kd = kd;
    }

    /// The field ranges, to match the limits configured in the motor
    pub fn ranges_mut(&mut self) -> &mut PackedRanges {
        &mut self.codec.ranges
    }

    /// Send a full position/velocity/gain/torque command
    pub fn send_mit(&self, cmd: &MitCommand) -> Result<(), MotorError<T::Error>> {
        let frame = self.codec.encode_command(cmd);
        self.send_raw(&frame)
    }

    /// Send one of the fixed control frames, e.g. [crate::codec::SAVE_ZERO]
    pub fn send_raw(&self, frame: &[u8; 8]) -> Result<(), MotorError<T::Error>> {
        self.transport
            .send(self.bus, self.tx_id, frame)
            .map_err(MotorError::Bus)
    }
}

impl<'a, R, T> Actuator for PackedMotor<'a, R, T>
where
    R: RawMutex + Sync,
    T: CanTransport<'a>,
{
    type Error = MotorError<T::Error>;

    fn enable(&mut self) -> Result<(), Self::Error> {
        self.send_raw(&ENABLE)?;
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), Self::Error> {
        self.send_raw(&DISABLE)?;
        self.enabled = false;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn update_feedback(&mut self) -> bool {
        let Some(raw) = self.buffer.latest() else {
            return false;
        };
        self.previous = self.current;
        self.current = self.codec.decode_feedback(&raw);
        true
    }

    fn send_command(&mut self, torque: f32) -> Result<Completion, Self::Error> {
        self.send_mit(&MitCommand {
            position: 0.0,
            velocity: 0.0,
            kp: self.kp,
            kd: self.kd,
            torque,
        })?;
        Ok(Completion::Sent)
    }

    fn feedback(&self) -> &FeedbackSample {
        &self.current
    }

    fn previous_feedback(&self) -> &FeedbackSample {
        &self.previous
    }
}
