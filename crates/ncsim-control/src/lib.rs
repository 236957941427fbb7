//! # ncsim-control
//!
//! Scheduling and control collaborators of an NCSim gateway.
//!
//! This crate provides:
//! - The [`Scheduler`] trait and the algorithms implementing it:
//!   round robin, random, greedy waiting time and learned schedulers
//! - [`create_scheduler`], the factory mapping a [`SchedulerKind`] and a
//!   protocol to a scheduler
//! - The [`Interpreter`] and [`Controller`] interfaces with simple
//!   implementations, kept in a [`Collaborators`] arena and addressed by
//!   handles

pub mod collaborators;
pub mod greedy;
pub mod learned;
pub mod random;
pub mod round_robin;

use ncsim_packet::{MacAddress, PacketError, ProtocolType, Schedule, SlotAssignment};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use collaborators::{
    Collaborators, Controller, ControllerHandle, Interpreter, InterpreterHandle, LinearController,
    SharedCollaborators, WaitingTimeInterpreter,
};
pub use greedy::{GreedyWaitingCsma, GreedyWaitingTdma};
pub use learned::{GreedyPolicy, LearnedTdma, Policy, RandomPolicy};
pub use random::{RandomCsma, RandomTdma};
pub use round_robin::RoundRobinTdma;

// ============================================================================
// Error Types
// ============================================================================

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A scheduler needs at least one device.
    #[error("Scheduler has no devices")]
    NoDevices,

    /// A schedule must cover at least one slot.
    #[error("Schedule length must be at least one slot")]
    ZeroTimeslots,

    /// The factory has no scheduler for this combination.
    #[error("Scheduler '{kind}' does not support {protocol:?}")]
    Unsupported {
        /// Requested kind.
        kind: SchedulerKind,
        /// Requested protocol.
        protocol: ProtocolType,
    },

    /// The action set of a learned scheduler would be too large to enumerate.
    #[error("Action set of {size} actions exceeds the limit of {limit}")]
    ActionSetTooLarge {
        /// Number of actions.
        size: u128,
        /// Largest supported number.
        limit: usize,
    },

    /// A policy picked an action outside the action set.
    #[error("Policy chose action {index} of {size}")]
    InvalidAction {
        /// Chosen index.
        index: usize,
        /// Size of the action set.
        size: usize,
    },

    /// Unknown scheduler name.
    #[error("Unknown scheduler kind: {0}")]
    UnknownKind(String),

    /// The produced schedule is invalid.
    #[error("Invalid schedule: {0}")]
    Schedule(#[from] PacketError),
}

// ============================================================================
// Scheduler interface
// ============================================================================

/// Produces one schedule per scheduling round.
///
/// `observation` holds one value per device index, sensors first; what the
/// values mean is up to the [`Interpreter`] that produced them.
pub trait Scheduler: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Protocol of the produced schedules.
    fn protocol(&self) -> ProtocolType;

    /// Produce the next schedule.
    fn next_schedule(&mut self, observation: &[f64], last_reward: f64) -> Result<Schedule, SchedulerError>;

    /// Start a new episode.
    fn reset(&mut self) {}
}

/// The devices a scheduler assigns the medium to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerDevices {
    /// Sensor addresses, in device index order.
    pub sensors: Vec<MacAddress>,
    /// Actuator addresses, in device index order after the sensors.
    pub actuators: Vec<MacAddress>,
}

impl SchedulerDevices {
    /// Sensors followed by actuators.
    pub fn all(&self) -> Vec<MacAddress> {
        self.sensors.iter().chain(self.actuators.iter()).copied().collect()
    }
}

/// Flags for one slot per entry of `devices`: the first of consecutive slots
/// of an actuator reserves a control slot, every other slot carries flag 0.
pub(crate) fn assign_flags(devices: &[MacAddress], actuators: &[MacAddress]) -> Vec<SlotAssignment> {
    let mut previous: Option<MacAddress> = None;
    devices
        .iter()
        .map(|&device| {
            let flag = u8::from(actuators.contains(&device) && previous != Some(device));
            previous = Some(device);
            SlotAssignment::new(device, flag)
        })
        .collect()
}

/// Value of `observation` at `index`, zero when missing.
pub(crate) fn observed(observation: &[f64], index: usize) -> f64 {
    observation.get(index).copied().unwrap_or(0.0)
}

// ============================================================================
// Factory
// ============================================================================

/// Scheduler algorithms known to [`create_scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Uniformly random decisions.
    Random,
    /// Devices in turn.
    RoundRobin,
    /// Learned scheduler while exploring.
    MyDqn,
    /// Learned scheduler driven by an external agent.
    Dqn,
    /// Longest waiting devices first.
    GreedyWait,
    /// Learned scheduler with a fixed policy.
    FixedDqn,
}

impl SchedulerKind {
    /// Every kind, in declaration order.
    pub const ALL: [SchedulerKind; 6] = [
        SchedulerKind::Random,
        SchedulerKind::RoundRobin,
        SchedulerKind::MyDqn,
        SchedulerKind::Dqn,
        SchedulerKind::GreedyWait,
        SchedulerKind::FixedDqn,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Random => "random",
            SchedulerKind::RoundRobin => "round_robin",
            SchedulerKind::MyDqn => "my_dqn",
            SchedulerKind::Dqn => "dqn",
            SchedulerKind::GreedyWait => "greedy_wait",
            SchedulerKind::FixedDqn => "fixed_dqn",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        SchedulerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SchedulerError::UnknownKind(s.to_string()))
    }
}

/// Create a scheduler for `timeslots` slots per schedule.
///
/// TDMA schedulers assign slots to sensors and actuators; CSMA schedulers
/// assign probabilities to the sensors only. `seed` feeds the random
/// schedulers and policies.
pub fn create_scheduler(
    kind: SchedulerKind,
    protocol: ProtocolType,
    devices: &SchedulerDevices,
    timeslots: u32,
    seed: u64,
) -> Result<Box<dyn Scheduler>, SchedulerError> {
    if timeslots == 0 {
        return Err(SchedulerError::ZeroTimeslots);
    }
    let scheduler: Box<dyn Scheduler> = match (kind, protocol) {
        (SchedulerKind::Random, ProtocolType::Tdma) => Box::new(RandomTdma::new(devices, timeslots, seed)?),
        (SchedulerKind::Random, ProtocolType::Csma) => {
            Box::new(RandomCsma::new(devices.sensors.clone(), timeslots, seed)?)
        }
        (SchedulerKind::RoundRobin, ProtocolType::Tdma) => Box::new(RoundRobinTdma::new(devices, timeslots)?),
        (SchedulerKind::GreedyWait, ProtocolType::Tdma) => Box::new(GreedyWaitingTdma::new(devices, timeslots)?),
        (SchedulerKind::GreedyWait, ProtocolType::Csma) => {
            Box::new(GreedyWaitingCsma::new(devices.sensors.clone(), timeslots)?)
        }
        (SchedulerKind::MyDqn, ProtocolType::Tdma) => Box::new(LearnedTdma::new(
            devices,
            timeslots,
            Box::new(RandomPolicy::new(seed)),
        )?),
        (SchedulerKind::FixedDqn, ProtocolType::Tdma) => {
            Box::new(LearnedTdma::new(devices, timeslots, Box::new(GreedyPolicy))?)
        }
        (kind, protocol) => return Err(SchedulerError::Unsupported { kind, protocol }),
    };
    tracing::debug!(scheduler = scheduler.name(), ?protocol, timeslots, "scheduler created");
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn devices(sensors: u64, actuators: u64) -> SchedulerDevices {
        SchedulerDevices {
            sensors: (1..=sensors).map(MacAddress::from_counter).collect(),
            actuators: (sensors + 1..=sensors + actuators).map(MacAddress::from_counter).collect(),
        }
    }

    #[test]
    fn test_factory_matrix() {
        let devices = devices(2, 2);
        let supported = [
            (SchedulerKind::Random, ProtocolType::Tdma),
            (SchedulerKind::Random, ProtocolType::Csma),
            (SchedulerKind::RoundRobin, ProtocolType::Tdma),
            (SchedulerKind::GreedyWait, ProtocolType::Tdma),
            (SchedulerKind::GreedyWait, ProtocolType::Csma),
            (SchedulerKind::MyDqn, ProtocolType::Tdma),
            (SchedulerKind::FixedDqn, ProtocolType::Tdma),
        ];
        for kind in SchedulerKind::ALL {
            for protocol in [ProtocolType::Tdma, ProtocolType::Csma] {
                let result = create_scheduler(kind, protocol, &devices, 3, 1);
                if supported.contains(&(kind, protocol)) {
                    let scheduler = result.unwrap();
                    assert_eq!(scheduler.protocol(), protocol);
                } else {
                    assert!(matches!(result, Err(SchedulerError::Unsupported { .. })), "{} {:?}", kind, protocol);
                }
            }
        }
    }

    #[test]
    fn test_factory_rejects_empty_schedules() {
        let result = create_scheduler(SchedulerKind::RoundRobin, ProtocolType::Tdma, &devices(1, 1), 0, 0);
        assert!(matches!(result, Err(SchedulerError::ZeroTimeslots)));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("round_robin".parse::<SchedulerKind>().unwrap(), SchedulerKind::RoundRobin);
        assert_eq!("Greedy-Wait".parse::<SchedulerKind>().unwrap(), SchedulerKind::GreedyWait);
        assert!("fancy".parse::<SchedulerKind>().is_err());
        for kind in SchedulerKind::ALL {
            assert_eq!(kind.to_string().parse::<SchedulerKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_assign_flags_marks_first_actuator_slot() {
        let s = MacAddress::from_counter(1);
        let a = MacAddress::from_counter(2);
        let flags: Vec<u8> = assign_flags(&[s, a, a, s, a], &[a]).iter().map(|x| x.flag).collect();
        assert_eq!(flags, vec![0, 1, 0, 0, 1]);
    }
}
