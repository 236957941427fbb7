//! The resource manager of the contention-free protocol.

use crate::{mac_link, Assembly, DeviceIds, TAG_MAC};
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, LinkSettings, MacAddress, Port, SimContext, SimError, SimTime,
    Signal, StackMessage,
};
use ncsim_mac::SimpleRrmMac;
use tracing::{debug, trace};

const TIMER_START: u64 = 1;

const TOKEN_ASSIGN: u64 = 1;

/// Everything needed to add a resource manager.
#[derive(Debug, Clone)]
pub struct RrmConfig {
    /// Device name.
    pub name: String,
    /// Position.
    pub x: f64,
    /// Position.
    pub y: f64,
    /// Power and MCS of the announcements.
    pub link: LinkSettings,
    /// Devices the medium is handed to, in turn.
    pub devices: Vec<MacAddress>,
    /// Slots granted per assignment.
    pub assign_slots: u32,
}

/// Grants the medium to its devices round-robin, one assignment after the
/// other.
pub struct RrmDevice {
    id: EntityId,
    name: String,
    port: Port,
    devices: Vec<MacAddress>,
    assign_slots: u32,
    next: usize,
    assignments: u64,
    forwarded: u64,
}

impl RrmDevice {
    /// Add the resource manager with its phy and MAC to `asm`. The first
    /// assignment is made at time zero.
    pub fn build(asm: &mut Assembly, config: RrmConfig) -> Result<(DeviceIds, MacAddress), SimError> {
        let ids = asm.device_ids();
        let (_, phy_port) = asm.add_phy(ids.phy, &config.name, config.x, config.y)?;
        let mac = SimpleRrmMac::new(asm.ctx(), ids.mac, &config.name, &phy_port, config.link)?;
        let addr = mac.addr();
        let port = mac_link(asm.ctx(), ids.device, &config.name, mac.transport_port())?;
        asm.register(Box::new(mac));
        asm.ctx()
            .post_at(SimTime::ZERO, vec![ids.device], EventPayload::Timer { timer_id: TIMER_START });
        debug!(device = %config.name, devices = config.devices.len(), "resource manager initialized");
        asm.register(Box::new(RrmDevice {
            id: ids.device,
            name: config.name,
            port,
            devices: config.devices,
            assign_slots: config.assign_slots,
            next: 0,
            assignments: 0,
            forwarded: 0,
        }));
        Ok((ids, addr))
    }

    /// Assignments made so far.
    pub fn assignments(&self) -> u64 {
        self.assignments
    }

    /// Payloads the MAC passed up so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    fn assign_next(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(dest) = self.devices.get(self.next).copied() else {
            return Ok(());
        };
        self.next = (self.next + 1) % self.devices.len();
        self.assignments += 1;
        trace!(device = %self.name, dest = %dest, slots = self.assign_slots, "assigning medium");
        let command = Command::Assign {
            dest,
            slots: self.assign_slots,
        };
        ctx.send(
            self.port.output,
            Signal::Message(StackMessage::with_reply(command, self.id, TOKEN_ASSIGN)),
        )
    }
}

impl Entity for RrmDevice {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id: TIMER_START } => self.assign_next(ctx),
            EventPayload::Processed {
                token: TOKEN_ASSIGN, ..
            } => self.assign_next(ctx),
            EventPayload::Notified(n) if n.tag == TAG_MAC => {
                if let Signal::Payload(payload) = &n.value {
                    self.forwarded += 1;
                    trace!(device = %self.name, payload = %payload, "payload overheard");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assembly;
    use ncsim_common::journal::SimRecord;
    use ncsim_common::Kernel;

    fn rrm(devices: Vec<MacAddress>, assign_slots: u32) -> RrmConfig {
        RrmConfig {
            name: "rrm".to_string(),
            x: 0.0,
            y: 0.0,
            link: LinkSettings::default(),
            devices,
            assign_slots,
        }
    }

    #[test]
    fn test_assigns_round_robin() {
        let mut asm = assembly(0);
        let devices = vec![MacAddress::from_counter(1), MacAddress::from_counter(2)];
        RrmDevice::build(&mut asm, rrm(devices, 1_000)).unwrap();
        let (ctx, entities) = asm.finish();
        let mut kernel = Kernel::new(ctx, entities);
        kernel.run_until(SimTime::from_millis(10));
        let dests: Vec<String> = kernel
            .context_mut()
            .take_records()
            .into_iter()
            .filter_map(|r| match r.record {
                SimRecord::SlotsAssigned { dest, slots } => {
                    assert_eq!(slots, 1_000);
                    Some(dest)
                }
                _ => None,
            })
            .collect();
        // each round: 1 slot to the boundary, 1360 on the air, 1001 of window
        assert_eq!(dests.len(), 5);
        assert_eq!(dests[0], MacAddress::from_counter(1).to_string());
        assert_eq!(dests[1], MacAddress::from_counter(2).to_string());
        assert_eq!(dests[2], dests[0]);
    }

    #[test]
    fn test_no_devices_no_assignments() {
        let mut asm = assembly(0);
        RrmDevice::build(&mut asm, rrm(Vec::new(), 10)).unwrap();
        let (ctx, entities) = asm.finish();
        let mut kernel = Kernel::new(ctx, entities);
        kernel.run_until(SimTime::from_millis(10));
        assert!(kernel.halted().is_empty());
        assert!(kernel.context_mut().take_records().is_empty());
    }
}
