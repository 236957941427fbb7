//! YAML schema of a scenario.
//!
//! Every section has defaults, so a scenario only names what it changes:
//!
//! ```yaml
//! kind: ncs
//! seed: 7
//! ncs:
//!   protocol: tdma
//!   scheduler: round_robin
//!   loops:
//!     - sensor: { name: s1, x: 1.0, y: 1.0 }
//!       actuator: { name: a1, x: 1.0, y: -1.0 }
//! ```

use ncsim_common::{CodeRate, LinkSettings, Mcs, ProtocolType};
use ncsim_control::SchedulerKind;
use ncsim_phy::{AttenuationKind, BandSpec};
use serde::{Deserialize, Serialize};

/// What a scenario simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// A gateway closing control loops of sensors and actuators.
    #[default]
    Ncs,
    /// A resource manager polling generic devices.
    ContentionFree,
}

/// Root of a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    /// What to simulate.
    pub kind: ScenarioKind,
    /// Seed of every random decision.
    pub seed: u64,
    /// Simulated time in seconds when the command line gives none.
    pub duration_s: f64,
    /// The shared band.
    pub band: BandSpec,
    /// Attenuation models summed on every link.
    pub attenuation: Vec<AttenuationKind>,
    /// Physical layer parameters.
    pub phy: PhyYaml,
    /// Transmit parameters of every device.
    pub link: LinkYaml,
    /// Devices of a `ncs` scenario.
    pub ncs: Option<NcsYaml>,
    /// Devices of a `contention_free` scenario.
    pub contention_free: Option<ContentionFreeYaml>,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            kind: ScenarioKind::default(),
            seed: 0,
            duration_s: 10.0,
            band: BandSpec::default(),
            attenuation: vec![AttenuationKind::Fspl],
            phy: PhyYaml::default(),
            link: LinkYaml::default(),
            ncs: None,
            contention_free: None,
        }
    }
}

/// Physical layer section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhyYaml {
    /// Length of the slots frames are aligned to, in microseconds.
    pub time_slot_us: u64,
    /// Receiver temperature in °C.
    pub temperature_c: f64,
}

impl Default for PhyYaml {
    fn default() -> Self {
        PhyYaml {
            time_slot_us: 1,
            temperature_c: 20.0,
        }
    }
}

/// Transmit parameters section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkYaml {
    /// Transmit power in dBm.
    pub power_dbm: f64,
    /// Bit rate in bits per second.
    pub bit_rate: f64,
    /// Code rate as `[k, n]`.
    pub code_rate: [u32; 2],
}

impl Default for LinkYaml {
    fn default() -> Self {
        LinkYaml {
            power_dbm: 0.0,
            bit_rate: 100e3,
            code_rate: [1, 2],
        }
    }
}

impl LinkYaml {
    /// The link settings, or `None` for an invalid code rate.
    pub fn settings(&self) -> Option<LinkSettings> {
        let code_rate = CodeRate::new(self.code_rate[0], self.code_rate[1])?;
        Some(LinkSettings {
            power_dbm: self.power_dbm,
            mcs: Mcs::bpsk(code_rate, self.bit_rate),
        })
    }
}

/// A named position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementYaml {
    /// Device name, unique within the scenario.
    pub name: String,
    /// Position in metres.
    #[serde(default)]
    pub x: f64,
    /// Position in metres.
    #[serde(default)]
    pub y: f64,
}

/// What a sensor observes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceYaml {
    /// A fixed value.
    Constant(f64),
    /// A Gaussian random walk.
    RandomWalk {
        /// Starting value.
        initial: f64,
        /// Standard deviation of a step.
        std_dev: f64,
    },
}

impl Default for SourceYaml {
    fn default() -> Self {
        SourceYaml::Constant(1.0)
    }
}

/// A sensor of a control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorYaml {
    /// Device name, unique within the scenario.
    pub name: String,
    /// Position in metres.
    #[serde(default)]
    pub x: f64,
    /// Position in metres.
    #[serde(default)]
    pub y: f64,
    /// Observed source, written as a single-key map such as `{ constant: 1.0 }`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub source: SourceYaml,
    /// Seconds between two samples.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_s: f64,
}

fn default_sample_interval() -> f64 {
    0.02
}

fn default_gain() -> f64 {
    1.0
}

/// One control loop: sensor `i` feeds the controller of actuator `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopYaml {
    /// The sensor.
    pub sensor: SensorYaml,
    /// The actuator.
    pub actuator: PlacementYaml,
    /// Feedback gain of the loop.
    #[serde(default = "default_gain")]
    pub gain: f64,
}

/// Section of a `ncs` scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NcsYaml {
    /// Medium access discipline.
    pub protocol: ProtocolType,
    /// Scheduling algorithm of the gateway.
    pub scheduler: SchedulerKind,
    /// Length of a schedule slot in seconds.
    pub slot_length_s: f64,
    /// Slots per schedule.
    pub timeslots: u32,
    /// Setpoint of every loop.
    pub setpoint: f64,
    /// The gateway.
    pub gateway: PlacementYaml,
    /// The control loops.
    pub loops: Vec<LoopYaml>,
}

impl Default for NcsYaml {
    fn default() -> Self {
        NcsYaml {
            protocol: ProtocolType::Tdma,
            scheduler: SchedulerKind::RoundRobin,
            slot_length_s: 0.04,
            timeslots: 5,
            setpoint: 0.0,
            gateway: PlacementYaml {
                name: "gateway".to_string(),
                x: 0.0,
                y: 0.0,
            },
            loops: Vec::new(),
        }
    }
}

/// Periodic traffic of a contention-free device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficYaml {
    /// Name of the destination device.
    pub dest: String,
    /// Seconds between two packets.
    #[serde(default = "default_traffic_interval")]
    pub interval_s: f64,
    /// Payload size in bytes.
    #[serde(default = "default_traffic_bytes")]
    pub bytes: usize,
}

fn default_traffic_interval() -> f64 {
    0.1
}

fn default_traffic_bytes() -> usize {
    20
}

/// A generic device of the contention-free protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDeviceYaml {
    /// Device name, unique within the scenario.
    pub name: String,
    /// Position in metres.
    #[serde(default)]
    pub x: f64,
    /// Position in metres.
    #[serde(default)]
    pub y: f64,
    /// Traffic to generate.
    #[serde(default)]
    pub traffic: Option<TrafficYaml>,
}

/// Section of a `contention_free` scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentionFreeYaml {
    /// Slots granted per assignment.
    pub assign_slots: u32,
    /// The resource manager.
    pub rrm: PlacementYaml,
    /// The polled devices.
    pub devices: Vec<NetworkDeviceYaml>,
}

impl Default for ContentionFreeYaml {
    fn default() -> Self {
        ContentionFreeYaml {
            assign_slots: 50_000,
            rrm: PlacementYaml {
                name: "rrm".to_string(),
                x: 0.0,
                y: 0.0,
            },
            devices: Vec::new(),
        }
    }
}
