//! Interpreters and controllers driven by a gateway.
//!
//! A gateway does not own its collaborators. They live in a [`Collaborators`]
//! arena shared by the gateway and whoever inspects them after a run; the
//! gateway keeps [`InterpreterHandle`]s and [`ControllerHandle`]s and
//! resolves them on use.

use ncsim_common::SimTime;
use ncsim_packet::{Payload, Schedule};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

// ============================================================================
// Interfaces
// ============================================================================

/// Observes what the gateway receives and turns it into observations and
/// rewards for a scheduler.
///
/// Device indices count sensors first, then actuators.
pub trait Interpreter: Send {
    /// The gateway received `payload` from device `sender`.
    fn on_packet_received(&mut self, sender: usize, payload: &Payload, now: SimTime);

    /// The gateway created `schedule`. `actuators` lists the device indices
    /// the schedule grants a control slot to.
    fn on_schedule_created(&mut self, schedule: &Schedule, actuators: &[usize], now: SimTime);

    /// Reward for the latest schedule.
    fn reward(&self, now: SimTime) -> f64;

    /// One value per device index.
    fn observation(&self, now: SimTime) -> Vec<f64>;

    /// Whether the episode is over.
    fn done(&self) -> bool {
        false
    }

    /// Start a new episode.
    fn reset(&mut self) {}
}

/// Computes control values from sensor data.
///
/// Control loop `i` pairs sensor `i` with actuator `i`.
pub trait Controller: Send {
    /// Sensor `sensor` reported `state`.
    fn on_sensor_data_received(&mut self, sensor: usize, state: f64, now: SimTime);

    /// Control value for the actuator of loop `actuator`. Has no side
    /// effects, so it may be asked hypothetically.
    fn control(&self, actuator: usize) -> f64;
}

// ============================================================================
// Implementations
// ============================================================================

/// Tracks how long every device has been waiting.
///
/// A sensor waits until the gateway receives data from it; an actuator waits
/// until a schedule grants it a control slot. Observations are waiting times
/// in seconds; the reward is the negated mean waiting time of the sensors.
#[derive(Debug, Clone)]
pub struct WaitingTimeInterpreter {
    sensors: usize,
    last_served: Vec<SimTime>,
    received: Vec<u64>,
}

impl WaitingTimeInterpreter {
    /// Create an interpreter for `sensors` sensors and `actuators` actuators.
    pub fn new(sensors: usize, actuators: usize) -> Self {
        WaitingTimeInterpreter {
            sensors,
            last_served: vec![SimTime::ZERO; sensors + actuators],
            received: vec![0; sensors],
        }
    }

    /// Packets received per sensor.
    pub fn received(&self) -> &[u64] {
        &self.received
    }
}

impl Interpreter for WaitingTimeInterpreter {
    fn on_packet_received(&mut self, sender: usize, _payload: &Payload, now: SimTime) {
        if sender < self.sensors {
            self.last_served[sender] = now;
            self.received[sender] += 1;
        }
    }

    fn on_schedule_created(&mut self, _schedule: &Schedule, actuators: &[usize], now: SimTime) {
        for &index in actuators {
            if let Some(served) = self.last_served.get_mut(index) {
                *served = now;
            }
        }
    }

    fn reward(&self, now: SimTime) -> f64 {
        if self.sensors == 0 {
            return 0.0;
        }
        let total: f64 = self.last_served[..self.sensors]
            .iter()
            .map(|t| (now - *t).as_secs_f64())
            .sum();
        -total / self.sensors as f64
    }

    fn observation(&self, now: SimTime) -> Vec<f64> {
        self.last_served.iter().map(|t| (now - *t).as_secs_f64()).collect()
    }

    fn reset(&mut self) {
        self.last_served.fill(SimTime::ZERO);
        self.received.fill(0);
    }
}

/// State feedback `u = -k (x - setpoint)` on the latest sample of each loop.
#[derive(Debug, Clone)]
pub struct LinearController {
    gains: Vec<f64>,
    setpoint: f64,
    states: Vec<Option<f64>>,
}

impl LinearController {
    /// Create a controller with one gain per control loop.
    pub fn new(gains: Vec<f64>, setpoint: f64) -> Self {
        let states = vec![None; gains.len()];
        LinearController {
            gains,
            setpoint,
            states,
        }
    }

    /// Latest sample of loop `index`.
    pub fn state(&self, index: usize) -> Option<f64> {
        self.states.get(index).copied().flatten()
    }
}

impl Controller for LinearController {
    fn on_sensor_data_received(&mut self, sensor: usize, state: f64, now: SimTime) {
        trace!(sensor, state, time = %now, "sensor data");
        if let Some(slot) = self.states.get_mut(sensor) {
            *slot = Some(state);
        }
    }

    fn control(&self, actuator: usize) -> f64 {
        match (self.gains.get(actuator), self.state(actuator)) {
            (Some(gain), Some(state)) => -gain * (state - self.setpoint),
            _ => 0.0,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Handle of an interpreter in a [`Collaborators`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpreterHandle(usize);

/// Handle of a controller in a [`Collaborators`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerHandle(usize);

/// Arena shared between a gateway and the code inspecting it.
pub type SharedCollaborators = Arc<Mutex<Collaborators>>;

/// Owns the interpreters and controllers of a simulation.
#[derive(Default)]
pub struct Collaborators {
    interpreters: Vec<Box<dyn Interpreter>>,
    controllers: Vec<Box<dyn Controller>>,
}

impl Collaborators {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the arena for sharing.
    pub fn shared(self) -> SharedCollaborators {
        Arc::new(Mutex::new(self))
    }

    /// Add an interpreter.
    pub fn add_interpreter(&mut self, interpreter: Box<dyn Interpreter>) -> InterpreterHandle {
        self.interpreters.push(interpreter);
        InterpreterHandle(self.interpreters.len() - 1)
    }

    /// Add a controller.
    pub fn add_controller(&mut self, controller: Box<dyn Controller>) -> ControllerHandle {
        self.controllers.push(controller);
        ControllerHandle(self.controllers.len() - 1)
    }

    /// Resolve an interpreter handle.
    pub fn interpreter(&self, handle: InterpreterHandle) -> Option<&dyn Interpreter> {
        self.interpreters.get(handle.0).map(|i| i.as_ref())
    }

    /// Resolve an interpreter handle for mutation.
    pub fn interpreter_mut(&mut self, handle: InterpreterHandle) -> Option<&mut (dyn Interpreter + 'static)> {
        self.interpreters.get_mut(handle.0).map(|i| i.as_mut())
    }

    /// Resolve a controller handle.
    pub fn controller(&self, handle: ControllerHandle) -> Option<&dyn Controller> {
        self.controllers.get(handle.0).map(|c| c.as_ref())
    }

    /// Resolve a controller handle for mutation.
    pub fn controller_mut(&mut self, handle: ControllerHandle) -> Option<&mut (dyn Controller + 'static)> {
        self.controllers.get_mut(handle.0).map(|c| c.as_mut())
    }
}
