//! # ncsim-devices
//!
//! Device compositions for NCSim.
//!
//! This crate provides:
//! - [`Assembly`] - Owns the context and registry while a simulation is put
//!   together, and adds the physical layer of every device
//! - The devices of a networked control system: [`Gateway`],
//!   [`SimpleSensor`] and [`SimpleActuator`]
//! - The devices of the contention-free protocol: [`SimpleNetworkDevice`]
//!   and [`RrmDevice`]
//!
//! A device is three entities: its [`SimplePhy`], a MAC layer from
//! `ncsim-mac`, and the device logic on top, connected through module ports.

pub mod actuator;
pub mod gateway;
pub mod network;
pub mod rrm;
pub mod sensor;

use ncsim_common::{
    Device, Entity, EntityId, EntityRegistry, ListenerMode, Module, Port, SimContext, SimError,
};
use ncsim_phy::{PhyConfig, SharedBand, SimplePhy};

pub use actuator::SimpleActuator;
pub use gateway::{Gateway, GatewayConfig};
pub use network::{NetworkDeviceConfig, SimpleNetworkDevice, TrafficConfig};
pub use rrm::{RrmConfig, RrmDevice};
pub use sensor::{SensorConfig, SensorSource, SimpleSensor};

/// Tag of the listener on a device's port towards its MAC.
pub(crate) const TAG_MAC: u64 = 1;

/// Entities making up one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIds {
    /// Physical layer.
    pub phy: EntityId,
    /// MAC layer.
    pub mac: EntityId,
    /// Device logic.
    pub device: EntityId,
}

/// Collects the entities of a simulation while it is being built.
pub struct Assembly {
    ctx: SimContext,
    entities: EntityRegistry,
    band: SharedBand,
    phy_config: PhyConfig,
    next_id: u64,
}

impl Assembly {
    /// Start building on `ctx`. Every physical layer added uses `band` and
    /// `phy_config`.
    pub fn new(ctx: SimContext, band: SharedBand, phy_config: PhyConfig) -> Self {
        Assembly {
            ctx,
            entities: EntityRegistry::new(),
            band,
            phy_config,
            // entity 0 is the kernel's own source id
            next_id: 1,
        }
    }

    /// The context being built on.
    pub fn ctx(&mut self) -> &mut SimContext {
        &mut self.ctx
    }

    /// The shared band.
    pub fn band(&self) -> &SharedBand {
        &self.band
    }

    /// Reserve a new entity id.
    pub fn next_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Reserve ids for a phy, a MAC and a device.
    pub fn device_ids(&mut self) -> DeviceIds {
        DeviceIds {
            phy: self.next_id(),
            mac: self.next_id(),
            device: self.next_id(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        self.entities.register(entity);
    }

    /// Create a device at `(x, y)` with its physical layer registered under
    /// `phy_id`. Returns the device and the phy's `mac` port.
    pub fn add_phy(&mut self, phy_id: EntityId, name: &str, x: f64, y: f64) -> Result<(Device, Port), SimError> {
        let device = Device::new(&mut self.ctx, name, x, y);
        let phy = SimplePhy::new(
            &mut self.ctx,
            phy_id,
            device.clone(),
            self.band.clone(),
            self.phy_config.clone(),
        )?;
        let port = phy.mac_port().clone();
        self.entities.register(Box::new(phy));
        Ok((device, port))
    }

    /// Finish building.
    pub fn finish(self) -> (SimContext, EntityRegistry) {
        (self.ctx, self.entities)
    }
}

/// Create the device module `name` with a `mac` port connected to
/// `mac_port`, listened to by `owner`.
pub(crate) fn mac_link(ctx: &mut SimContext, owner: EntityId, name: &str, mac_port: &Port) -> Result<Port, SimError> {
    let mut module = Module::new(name, Some(owner));
    let port = module.add_port(ctx, "mac")?;
    ctx.bi_connect(&port, mac_port)?;
    ctx.listen(&port, ListenerMode::Immediate, owner, TAG_MAC)?;
    Ok(port)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ncsim_phy::{AttenuationKind, BandSpec, FrequencyBand};
    use std::sync::Arc;

    pub fn assembly(seed: u64) -> Assembly {
        let mut ctx = SimContext::new(seed);
        ctx.enable_journal();
        let band = FrequencyBand::new(&mut ctx, BandSpec::default(), vec![AttenuationKind::Fspl]).unwrap();
        Assembly::new(ctx, Arc::new(band), PhyConfig::default())
    }
}
