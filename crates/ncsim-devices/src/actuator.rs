//! Actuators applying the control values they receive.

use crate::{mac_link, Assembly, DeviceIds, TAG_MAC};
use ncsim_common::journal::SimRecord;
use ncsim_common::{Entity, EntityId, Event, EventPayload, MacAddress, SimContext, SimError, Signal};
use ncsim_mac::{ActuatorMacTdma, MacConfig};
use ncsim_packet::Payload;
use tracing::{debug, info};

/// Applies every control value its MAC passes up and remembers the latest.
pub struct SimpleActuator {
    id: EntityId,
    name: String,
    last_control: Option<f64>,
    applied: u64,
}

impl SimpleActuator {
    /// Add an actuator at `(x, y)` with its phy and MAC to `asm`. Returns the
    /// entity ids and the actuator's address.
    pub fn build(
        asm: &mut Assembly,
        name: &str,
        x: f64,
        y: f64,
        mac_config: MacConfig,
    ) -> Result<(DeviceIds, MacAddress), SimError> {
        let ids = asm.device_ids();
        let (_, phy_port) = asm.add_phy(ids.phy, name, x, y)?;
        let addr = asm.ctx().new_mac_address();
        let mac = ActuatorMacTdma::new(asm.ctx(), ids.mac, name, addr, &phy_port, mac_config)?;
        mac_link(asm.ctx(), ids.device, name, mac.network_port())?;
        asm.register(Box::new(mac));
        debug!(device = name, mac = %addr, "actuator initialized");
        asm.register(Box::new(SimpleActuator {
            id: ids.device,
            name: name.to_string(),
            last_control: None,
            applied: 0,
        }));
        Ok((ids, addr))
    }

    /// The control value applied last.
    pub fn last_control(&self) -> Option<f64> {
        self.last_control
    }

    /// Control values applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    fn apply(&mut self, value: f64, ctx: &mut SimContext) {
        info!(device = %self.name, value, "control applied");
        self.last_control = Some(value);
        self.applied += 1;
        ctx.record(SimRecord::ControlApplied {
            actuator: self.name.clone(),
            value,
        });
    }
}

impl Entity for SimpleActuator {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::Notified(n) = &event.payload {
            if n.tag == TAG_MAC {
                if let Signal::Payload(Payload::Value(value)) = &n.value {
                    self.apply(*value, ctx);
                }
            }
        }
        Ok(())
    }
}
