//! Turning a validated scenario into registered entities.

use crate::scenario::{ContentionFreeYaml, NcsYaml, Scenario, ScenarioKind, SourceYaml};
use crate::ModelError;
use ncsim_common::{EntityId, EntityRegistry, LinkSettings, MacAddress, SimContext, SimTime};
use ncsim_control::{
    create_scheduler, Collaborators, LinearController, SchedulerDevices, SharedCollaborators, WaitingTimeInterpreter,
};
use ncsim_devices::{
    Assembly, DeviceIds, Gateway, GatewayConfig, NetworkDeviceConfig, RrmConfig, RrmDevice, SensorConfig,
    SensorSource, SimpleActuator, SimpleNetworkDevice, SimpleSensor, TrafficConfig,
};
use ncsim_mac::MacConfig;
use ncsim_phy::{FrequencyBand, PhyConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Role of a device in the built simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Schedules and controls.
    Gateway,
    /// Samples a control loop.
    Sensor,
    /// Applies controls.
    Actuator,
    /// Grants the medium in the contention-free protocol.
    ResourceManager,
    /// Polled device of the contention-free protocol.
    NetworkDevice,
}

/// A device of the built simulation, for display and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Device name from the scenario.
    pub name: String,
    /// Role.
    pub role: DeviceRole,
    /// Address.
    pub mac: String,
    /// Entity of the physical layer.
    pub phy_entity_id: u64,
    /// Entity of the MAC layer.
    pub mac_entity_id: u64,
    /// Entity of the device logic.
    pub device_entity_id: u64,
}

impl DeviceInfo {
    fn new(name: &str, role: DeviceRole, mac: MacAddress, ids: DeviceIds) -> Self {
        DeviceInfo {
            name: name.to_string(),
            role,
            mac: mac.to_string(),
            phy_entity_id: ids.phy.0,
            mac_entity_id: ids.mac.0,
            device_entity_id: ids.device.0,
        }
    }
}

/// Result of building a simulation from a scenario.
pub struct BuiltSimulation {
    /// Context with every initial event posted.
    pub context: SimContext,
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Interpreter and controller of a `ncs` scenario.
    pub collaborators: Option<SharedCollaborators>,
    /// Every device, in build order.
    pub devices: Vec<DeviceInfo>,
    /// Seed the context was created with.
    pub seed: u64,
}

impl BuiltSimulation {
    /// Find a device by name.
    pub fn device(&self, name: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Name of the device an entity belongs to.
    pub fn device_of(&self, entity: EntityId) -> Option<&DeviceInfo> {
        self.devices
            .iter()
            .find(|d| [d.phy_entity_id, d.mac_entity_id, d.device_entity_id].contains(&entity.0))
    }
}

/// Build a simulation from a scenario. `seed` overrides the scenario seed.
pub fn build_simulation(scenario: &Scenario, seed: Option<u64>) -> Result<BuiltSimulation, ModelError> {
    scenario.validate()?;
    let seed = seed.unwrap_or(scenario.seed);
    let link = scenario
        .link
        .settings()
        .ok_or_else(|| ModelError::InvalidConfig("invalid code rate".to_string()))?;

    let mut ctx = SimContext::new(seed);
    let band = FrequencyBand::new(&mut ctx, scenario.band, scenario.attenuation.clone())?;
    let phy_config = PhyConfig {
        time_slot: SimTime::from_micros(scenario.phy.time_slot_us),
        temperature_c: scenario.phy.temperature_c,
    };
    let mut asm = Assembly::new(ctx, Arc::new(band), phy_config);
    // component seeds are drawn in build order
    let mut seeds = ChaCha8Rng::seed_from_u64(seed);

    let mut devices = Vec::new();
    let collaborators = match scenario.kind {
        ScenarioKind::Ncs => {
            let section = scenario.ncs.as_ref().ok_or(ModelError::MissingSection("ncs"))?;
            Some(build_ncs(&mut asm, section, link, &mut seeds, &mut devices)?)
        }
        ScenarioKind::ContentionFree => {
            let section = scenario
                .contention_free
                .as_ref()
                .ok_or(ModelError::MissingSection("contention_free"))?;
            build_contention_free(&mut asm, section, link, &mut devices)?;
            None
        }
    };
    let (context, entities) = asm.finish();
    info!(kind = ?scenario.kind, devices = devices.len(), entities = entities.len(), seed, "simulation built");
    Ok(BuiltSimulation {
        context,
        entities,
        collaborators,
        devices,
        seed,
    })
}

fn build_ncs(
    asm: &mut Assembly,
    section: &NcsYaml,
    link: LinkSettings,
    seeds: &mut ChaCha8Rng,
    devices: &mut Vec<DeviceInfo>,
) -> Result<SharedCollaborators, ModelError> {
    let mac = MacConfig {
        slot_length: SimTime::from_secs(section.slot_length_s),
        link,
        protocol: section.protocol,
    };
    let mut sensors = Vec::with_capacity(section.loops.len());
    for control_loop in &section.loops {
        let yaml = &control_loop.sensor;
        let source = match yaml.source {
            SourceYaml::Constant(value) => SensorSource::Constant(value),
            SourceYaml::RandomWalk { initial, std_dev } => SensorSource::random_walk(initial, std_dev, seeds.gen())
                .map_err(|e| ModelError::InvalidConfig(format!("sensor '{}': {}", yaml.name, e)))?,
        };
        let config = SensorConfig {
            name: yaml.name.clone(),
            x: yaml.x,
            y: yaml.y,
            mac,
            source,
            sample_interval: SimTime::from_secs(yaml.sample_interval_s),
            seed: seeds.gen(),
        };
        let (ids, addr) = SimpleSensor::build(asm, config)?;
        devices.push(DeviceInfo::new(&yaml.name, DeviceRole::Sensor, addr, ids));
        sensors.push(addr);
    }
    let mut actuators = Vec::with_capacity(section.loops.len());
    for control_loop in &section.loops {
        let yaml = &control_loop.actuator;
        let (ids, addr) = SimpleActuator::build(asm, &yaml.name, yaml.x, yaml.y, mac)?;
        devices.push(DeviceInfo::new(&yaml.name, DeviceRole::Actuator, addr, ids));
        actuators.push(addr);
    }

    let scheduler_devices = SchedulerDevices {
        sensors: sensors.clone(),
        actuators: actuators.clone(),
    };
    let scheduler = create_scheduler(
        section.scheduler,
        section.protocol,
        &scheduler_devices,
        section.timeslots,
        seeds.gen(),
    )?;
    let mut arena = Collaborators::new();
    let interpreter = arena.add_interpreter(Box::new(WaitingTimeInterpreter::new(sensors.len(), actuators.len())));
    let gains = section.loops.iter().map(|l| l.gain).collect();
    let controller = arena.add_controller(Box::new(LinearController::new(gains, section.setpoint)));
    let collaborators = arena.shared();

    let config = GatewayConfig {
        name: section.gateway.name.clone(),
        x: section.gateway.x,
        y: section.gateway.y,
        mac,
        sensors,
        actuators,
    };
    let (ids, addr) = Gateway::build(asm, config, scheduler, collaborators.clone(), interpreter, controller)?;
    devices.push(DeviceInfo::new(&section.gateway.name, DeviceRole::Gateway, addr, ids));
    Ok(collaborators)
}

fn build_contention_free(
    asm: &mut Assembly,
    section: &ContentionFreeYaml,
    link: LinkSettings,
    devices: &mut Vec<DeviceInfo>,
) -> Result<(), ModelError> {
    // addresses are handed out in build order, so destinations are known
    // before the devices exist
    let first = asm.ctx().peek_mac_address().as_u64();
    let address_of = |name: &str| -> Result<MacAddress, ModelError> {
        section
            .devices
            .iter()
            .position(|d| d.name == name)
            .map(|i| MacAddress::from_counter(first + i as u64))
            .ok_or_else(|| ModelError::UnknownDevice(name.to_string()))
    };
    let mut polled = Vec::with_capacity(section.devices.len());
    for yaml in &section.devices {
        let expected = address_of(&yaml.name)?;
        let traffic = match &yaml.traffic {
            Some(traffic) => Some(TrafficConfig {
                dest: address_of(&traffic.dest)?,
                interval: SimTime::from_secs(traffic.interval_s),
                bytes: traffic.bytes,
            }),
            None => None,
        };
        let config = NetworkDeviceConfig {
            name: yaml.name.clone(),
            x: yaml.x,
            y: yaml.y,
            link,
            traffic,
        };
        let (ids, addr) = SimpleNetworkDevice::build(asm, config)?;
        if addr != expected {
            return Err(ModelError::InvalidConfig(format!(
                "device '{}' got address {} instead of {}",
                yaml.name, addr, expected
            )));
        }
        devices.push(DeviceInfo::new(&yaml.name, DeviceRole::NetworkDevice, addr, ids));
        polled.push(addr);
    }
    let config = RrmConfig {
        name: section.rrm.name.clone(),
        x: section.rrm.x,
        y: section.rrm.y,
        link,
        devices: polled,
        assign_slots: section.assign_slots,
    };
    let (ids, addr) = RrmDevice::build(asm, config)?;
    devices.push(DeviceInfo::new(&section.rrm.name, DeviceRole::ResourceManager, addr, ids));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_scenario_from_str;
    use ncsim_common::journal::SimRecord;
    use ncsim_common::Kernel;

    const NCS: &str = r#"
kind: ncs
ncs:
  loops:
    - sensor: { name: s1, x: 1.0, y: 1.0, source: { constant: 2.0 } }
      actuator: { name: a1, x: 1.0, y: -1.0 }
      gain: 0.5
"#;

    fn run(built: BuiltSimulation, secs: f64) -> (Kernel, Vec<SimRecord>) {
        let mut ctx = built.context;
        ctx.enable_journal();
        let mut kernel = Kernel::new(ctx, built.entities);
        kernel.run_until(SimTime::from_secs(secs));
        let records = kernel.context_mut().take_records().into_iter().map(|r| r.record).collect();
        (kernel, records)
    }

    #[test]
    fn test_ncs_devices_in_build_order() {
        let scenario = load_scenario_from_str(NCS).unwrap();
        let built = build_simulation(&scenario, None).unwrap();
        let names: Vec<&str> = built.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["s1", "a1", "gateway"]);
        assert_eq!(built.device("a1").map(|d| d.role), Some(DeviceRole::Actuator));
        assert_eq!(built.entities.len(), 9);
        let gateway = built.device("gateway").unwrap();
        let found = built.device_of(EntityId::new(gateway.mac_entity_id)).unwrap();
        assert_eq!(found.name, "gateway");
        assert!(built.collaborators.is_some());
    }

    #[test]
    fn test_ncs_scenario_applies_controls() {
        let scenario = load_scenario_from_str(NCS).unwrap();
        let (kernel, records) = run(build_simulation(&scenario, None).unwrap(), 0.5);
        assert!(kernel.halted().is_empty());
        assert!(records.contains(&SimRecord::ControlApplied {
            actuator: "a1".to_string(),
            value: -1.0,
        }));
    }

    #[test]
    fn test_same_seed_same_run() {
        let yaml = NCS.replace("{ constant: 2.0 }", "{ random_walk: { initial: 0.0, std_dev: 0.5 } }");
        let scenario = load_scenario_from_str(&yaml).unwrap();
        let (_, a) = run(build_simulation(&scenario, Some(11)).unwrap(), 0.5);
        let (_, b) = run(build_simulation(&scenario, Some(11)).unwrap(), 0.5);
        let (_, c) = run(build_simulation(&scenario, Some(12)).unwrap(), 0.5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_contention_free_addresses() {
        let yaml = r#"
kind: contention_free
contention_free:
  assign_slots: 20000
  devices:
    - { name: d1, x: 1.0, traffic: { dest: d2, interval_s: 0.05 } }
    - { name: d2, x: 2.0 }
"#;
        let scenario = load_scenario_from_str(yaml).unwrap();
        let built = build_simulation(&scenario, None).unwrap();
        assert_eq!(built.device("rrm").map(|d| d.mac.as_str()), Some("00:00:00:00:00:00"));
        assert!(built.collaborators.is_none());
        let (kernel, records) = run(built, 0.5);
        assert!(kernel.halted().is_empty());
        assert!(records
            .iter()
            .any(|r| matches!(r, SimRecord::PayloadReceived { device, .. } if device == "d2")));
    }
}
