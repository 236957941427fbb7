//! # ncsim-model
//!
//! YAML scenario loading and simulation building for NCSim.
//!
//! This crate provides:
//! - The scenario schema ([`Scenario`] and its sections), with defaults for
//!   everything a scenario leaves out
//! - Loading from files and strings, and validation
//! - [`build_simulation`], turning a scenario into a context and the
//!   registered entities of every device

pub mod build;
pub mod scenario;

pub use build::{build_simulation, BuiltSimulation, DeviceInfo, DeviceRole};
pub use scenario::{
    ContentionFreeYaml, LinkYaml, LoopYaml, NcsYaml, NetworkDeviceYaml, PhyYaml, PlacementYaml, Scenario,
    ScenarioKind, SensorYaml, SourceYaml, TrafficYaml,
};

use ncsim_common::{MacAddress, SimError};
use ncsim_control::{create_scheduler, SchedulerDevices, SchedulerError};
use ncsim_phy::PhyError;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading, validating or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two devices share a name.
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),

    /// A device refers to a device that does not exist.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The section the scenario kind needs is missing.
    #[error("Scenario of kind '{0}' needs a '{0}' section")]
    MissingSection(&'static str),

    /// Scheduler construction error.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Channel construction error.
    #[error("Channel error: {0}")]
    Phy(#[from] PhyError),

    /// Error while wiring the devices.
    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),
}

// ============================================================================
// Loading
// ============================================================================

/// Load and validate a scenario file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_scenario_from_str(&yaml)
}

/// Parse and validate a scenario.
pub fn load_scenario_from_str(yaml: &str) -> Result<Scenario, ModelError> {
    let scenario: Scenario = serde_yaml::from_str(yaml)?;
    scenario.validate()?;
    Ok(scenario)
}

// ============================================================================
// Validation
// ============================================================================

fn positive(value: f64, what: &str) -> Result<(), ModelError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ModelError::InvalidConfig(format!("{} must be positive, got {}", what, value)))
    }
}

fn unique<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), ModelError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ModelError::DuplicateDevice(name.to_string()));
        }
    }
    Ok(())
}

impl Scenario {
    /// Check the scenario for everything that would make building it fail
    /// or its results meaningless.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.attenuation.is_empty() {
            return Err(ModelError::InvalidConfig("attenuation list is empty".to_string()));
        }
        positive(self.duration_s, "duration_s")?;
        positive(self.band.frequency, "band frequency")?;
        positive(self.band.bandwidth, "band bandwidth")?;
        positive(self.link.bit_rate, "bit_rate")?;
        if self.phy.time_slot_us == 0 {
            return Err(ModelError::InvalidConfig("time_slot_us must be positive".to_string()));
        }
        if self.link.settings().is_none() {
            return Err(ModelError::InvalidConfig(format!(
                "code rate {}/{} is not a rate k/n with 0 < k <= n",
                self.link.code_rate[0], self.link.code_rate[1]
            )));
        }
        match self.kind {
            ScenarioKind::Ncs => self.ncs.as_ref().ok_or(ModelError::MissingSection("ncs"))?.validate(),
            ScenarioKind::ContentionFree => self
                .contention_free
                .as_ref()
                .ok_or(ModelError::MissingSection("contention_free"))?
                .validate(),
        }
    }
}

impl NcsYaml {
    fn validate(&self) -> Result<(), ModelError> {
        if self.loops.is_empty() {
            return Err(ModelError::InvalidConfig("no control loops".to_string()));
        }
        if self.timeslots == 0 {
            return Err(ModelError::InvalidConfig("schedule length must be at least one slot".to_string()));
        }
        positive(self.slot_length_s, "slot_length_s")?;
        for control_loop in &self.loops {
            positive(control_loop.sensor.sample_interval_s, "sample_interval_s")?;
            if let SourceYaml::RandomWalk { std_dev, .. } = control_loop.sensor.source {
                if !(std_dev >= 0.0 && std_dev.is_finite()) {
                    return Err(ModelError::InvalidConfig(format!(
                        "sensor '{}' has step deviation {}",
                        control_loop.sensor.name, std_dev
                    )));
                }
            }
        }
        unique(
            std::iter::once(self.gateway.name.as_str())
                .chain(self.loops.iter().map(|l| l.sensor.name.as_str()))
                .chain(self.loops.iter().map(|l| l.actuator.name.as_str())),
        )?;
        // placeholder addresses; only the device counts matter here
        let n = self.loops.len() as u64;
        let devices = SchedulerDevices {
            sensors: (1..=n).map(MacAddress::from_counter).collect(),
            actuators: (n + 1..=2 * n).map(MacAddress::from_counter).collect(),
        };
        create_scheduler(self.scheduler, self.protocol, &devices, self.timeslots, 0)?;
        Ok(())
    }
}

impl ContentionFreeYaml {
    fn validate(&self) -> Result<(), ModelError> {
        if self.devices.is_empty() {
            return Err(ModelError::InvalidConfig("no devices to poll".to_string()));
        }
        if self.assign_slots == 0 {
            return Err(ModelError::InvalidConfig("assign_slots must be positive".to_string()));
        }
        unique(std::iter::once(self.rrm.name.as_str()).chain(self.devices.iter().map(|d| d.name.as_str())))?;
        for device in &self.devices {
            if let Some(traffic) = &device.traffic {
                if !self.devices.iter().any(|d| d.name == traffic.dest) {
                    return Err(ModelError::UnknownDevice(traffic.dest.clone()));
                }
                positive(traffic.interval_s, "traffic interval_s")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ncsim_common::ProtocolType;
    use ncsim_control::SchedulerKind;
    use ncsim_phy::AttenuationKind;
    use std::io::Write;

    const NCS: &str = r#"
kind: ncs
seed: 3
ncs:
  protocol: tdma
  scheduler: round_robin
  loops:
    - sensor: { name: s1, x: 1.0, y: 1.0 }
      actuator: { name: a1, x: 1.0, y: -1.0 }
    - sensor:
        name: s2
        x: 2.0
        source: { random_walk: { initial: 0.5, std_dev: 0.1 } }
      actuator: { name: a2, x: 2.0, y: -1.0 }
      gain: 0.5
"#;

    const CONTENTION_FREE: &str = r#"
kind: contention_free
contention_free:
  assign_slots: 20000
  devices:
    - name: d1
      x: 1.0
      traffic: { dest: d2 }
    - name: d2
      x: 2.0
"#;

    #[test]
    fn test_defaults_fill_in() {
        let scenario = load_scenario_from_str(NCS).unwrap();
        assert_eq!(scenario.seed, 3);
        assert_eq!(scenario.band.frequency, 2.4e9);
        assert_eq!(scenario.band.bandwidth, 22e6);
        assert_eq!(scenario.attenuation, vec![AttenuationKind::Fspl]);
        assert_eq!(scenario.phy.time_slot_us, 1);
        assert_eq!(scenario.phy.temperature_c, 20.0);
        assert_eq!(scenario.link.bit_rate, 100e3);
        let ncs = scenario.ncs.unwrap();
        assert_eq!(ncs.protocol, ProtocolType::Tdma);
        assert_eq!(ncs.scheduler, SchedulerKind::RoundRobin);
        assert_eq!(ncs.slot_length_s, 0.04);
        assert_eq!(ncs.timeslots, 5);
        assert_eq!(ncs.gateway.name, "gateway");
        assert_eq!(ncs.loops[0].gain, 1.0);
        assert_eq!(ncs.loops[0].sensor.source, SourceYaml::Constant(1.0));
        assert_eq!(ncs.loops[0].sensor.sample_interval_s, 0.02);
        assert_eq!(ncs.loops[1].gain, 0.5);
        assert_eq!(
            ncs.loops[1].sensor.source,
            SourceYaml::RandomWalk {
                initial: 0.5,
                std_dev: 0.1
            }
        );
    }

    #[test]
    fn test_contention_free_defaults() {
        let scenario = load_scenario_from_str(CONTENTION_FREE).unwrap();
        let section = scenario.contention_free.unwrap();
        assert_eq!(section.assign_slots, 20_000);
        assert_eq!(section.rrm.name, "rrm");
        let traffic = section.devices[0].traffic.as_ref().unwrap();
        assert_eq!(traffic.interval_s, 0.1);
        assert_eq!(traffic.bytes, 20);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "kind: ncs\nwormholes: 3\n";
        assert!(matches!(load_scenario_from_str(yaml), Err(ModelError::YamlError(_))));
        let yaml = NCS.replace("gain: 0.5", "gain: 0.5\n      colour: red");
        assert!(matches!(load_scenario_from_str(&yaml), Err(ModelError::YamlError(_))));
    }

    #[test]
    fn test_validation_errors() {
        let no_loops = "kind: ncs\nncs:\n  loops: []\n";
        assert!(matches!(load_scenario_from_str(no_loops), Err(ModelError::InvalidConfig(_))));

        let missing = "kind: ncs\n";
        assert!(matches!(load_scenario_from_str(missing), Err(ModelError::MissingSection("ncs"))));

        let duplicate = NCS.replace("name: a2", "name: s1");
        assert!(matches!(
            load_scenario_from_str(&duplicate),
            Err(ModelError::DuplicateDevice(name)) if name == "s1"
        ));

        let no_attenuation = format!("attenuation: []\n{}", NCS);
        assert!(matches!(load_scenario_from_str(&no_attenuation), Err(ModelError::InvalidConfig(_))));

        let zero_slots = NCS.replace("scheduler: round_robin", "scheduler: round_robin\n  timeslots: 0");
        assert!(matches!(load_scenario_from_str(&zero_slots), Err(ModelError::InvalidConfig(_))));

        let bad_slot = NCS.replace("scheduler: round_robin", "scheduler: round_robin\n  slot_length_s: 0.0");
        assert!(matches!(load_scenario_from_str(&bad_slot), Err(ModelError::InvalidConfig(_))));

        let bad_rate = format!("link: {{ bit_rate: -1.0 }}\n{}", NCS);
        assert!(matches!(load_scenario_from_str(&bad_rate), Err(ModelError::InvalidConfig(_))));

        let bad_code = format!("link: {{ code_rate: [3, 2] }}\n{}", NCS);
        assert!(matches!(load_scenario_from_str(&bad_code), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_unsupported_scheduler_rejected() {
        let yaml = NCS.replace("protocol: tdma", "protocol: csma");
        assert!(matches!(
            load_scenario_from_str(&yaml),
            Err(ModelError::Scheduler(SchedulerError::Unsupported { .. }))
        ));
        let yaml = NCS.replace("scheduler: round_robin", "scheduler: dqn");
        assert!(matches!(
            load_scenario_from_str(&yaml),
            Err(ModelError::Scheduler(SchedulerError::Unsupported {
                kind: SchedulerKind::Dqn,
                protocol: ProtocolType::Tdma
            }))
        ));
    }

    #[test]
    fn test_unknown_traffic_destination() {
        let yaml = CONTENTION_FREE.replace("dest: d2", "dest: d9");
        assert!(matches!(
            load_scenario_from_str(&yaml),
            Err(ModelError::UnknownDevice(name)) if name == "d9"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONTENTION_FREE.as_bytes()).unwrap();
        let scenario = load_scenario(file.path()).unwrap();
        assert_eq!(scenario.kind, ScenarioKind::ContentionFree);
        assert!(matches!(
            load_scenario(Path::new("/nonexistent/scenario.yaml")),
            Err(ModelError::IoError(_))
        ));
    }

    #[test]
    fn test_bundled_scenarios_build() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
        let mut count = 0;
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let scenario = load_scenario(&path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
            let built = build_simulation(&scenario, None).unwrap();
            assert!(!built.devices.is_empty(), "{}", path.display());
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_sensor_source_map_forms() {
        let scenario = load_scenario_from_str(&NCS.replace(
            "sensor: { name: s1, x: 1.0, y: 1.0 }",
            "sensor: { name: s1, x: 1.0, y: 1.0, source: { constant: -2.5 } }",
        ))
        .unwrap();
        let ncs = scenario.ncs.unwrap();
        assert_eq!(ncs.loops[0].sensor.source, SourceYaml::Constant(-2.5));

        let yaml = NCS.replace("source: { random_walk: { initial: 0.5, std_dev: 0.1 } }", "source: { sine: 1.0 }");
        assert!(matches!(load_scenario_from_str(&yaml), Err(ModelError::YamlError(_))));
    }
}
