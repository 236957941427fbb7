//! The gateway of a networked control system.
//!
//! The gateway runs one loop: at every schedule creation time it asks its
//! scheduler for a schedule, using the interpreter's observation and reward,
//! hands `{schedule, clock}` to its MAC and sets the next creation time to
//! `now + end_time × slot_length`. For every control slot of a TDMA schedule
//! it sends the controller's value to that actuator when the slot starts.
//! Sensor data coming up from the MAC feeds the interpreter and the
//! controller.

use crate::{mac_link, Assembly, DeviceIds, TAG_MAC};
use ncsim_common::journal::SimRecord;
use ncsim_common::metric_defs;
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, MacAddress, Packet, Port, Schedule, SimContext, SimError,
    SimTime, Signal, StackMessage,
};
use ncsim_control::{ControllerHandle, InterpreterHandle, Scheduler, SharedCollaborators};
use ncsim_mac::{GatewayMac, MacConfig};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

const TIMER_SCHEDULE: u64 = 1;
const TIMER_CONTROL_BASE: u64 = 0x1_0000_0000; // control number is added to this

const TOKEN_SCHEDULE: u64 = 1;
const TOKEN_CONTROL: u64 = 2;

/// Placement and peers of a gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Device name.
    pub name: String,
    /// Position.
    pub x: f64,
    /// Position.
    pub y: f64,
    /// MAC parameters.
    pub mac: MacConfig,
    /// Sensor addresses; sensor `i` has device index `i`.
    pub sensors: Vec<MacAddress>,
    /// Actuator addresses; actuator `i` has device index `sensors.len() + i`.
    pub actuators: Vec<MacAddress>,
}

/// The scheduling and control device.
pub struct Gateway {
    id: EntityId,
    name: String,
    port: Port,
    slot_length: SimTime,
    scheduler: Box<dyn Scheduler>,
    collaborators: SharedCollaborators,
    interpreter: InterpreterHandle,
    controller: ControllerHandle,
    index_to_mac: Vec<MacAddress>,
    mac_to_index: BTreeMap<MacAddress, usize>,
    sensors: usize,
    actuators: Vec<MacAddress>,
    next_schedule_creation: SimTime,
    pending_controls: BTreeMap<u64, MacAddress>,
    next_control: u64,
    schedules_created: u64,
}

impl Gateway {
    /// Add the gateway with its phy and MAC to `asm`. The first schedule is
    /// created at time zero.
    pub fn build(
        asm: &mut Assembly,
        config: GatewayConfig,
        scheduler: Box<dyn Scheduler>,
        collaborators: SharedCollaborators,
        interpreter: InterpreterHandle,
        controller: ControllerHandle,
    ) -> Result<(DeviceIds, MacAddress), SimError> {
        let ids = asm.device_ids();
        let (_, phy_port) = asm.add_phy(ids.phy, &config.name, config.x, config.y)?;
        let addr = asm.ctx().new_mac_address();
        let mac = GatewayMac::new(asm.ctx(), ids.mac, &config.name, addr, &phy_port, config.mac)?;
        let port = mac_link(asm.ctx(), ids.device, &config.name, mac.network_port())?;
        asm.register(Box::new(mac));

        let index_to_mac: Vec<MacAddress> = config.sensors.iter().chain(config.actuators.iter()).copied().collect();
        let mac_to_index = index_to_mac.iter().enumerate().map(|(i, mac)| (*mac, i)).collect();
        asm.ctx()
            .post_at(SimTime::ZERO, vec![ids.device], EventPayload::Timer { timer_id: TIMER_SCHEDULE });
        info!(device = %config.name, mac = %addr, scheduler = scheduler.name(), "gateway initialized");
        asm.register(Box::new(Gateway {
            id: ids.device,
            name: config.name,
            port,
            slot_length: config.mac.slot_length,
            scheduler,
            collaborators,
            interpreter,
            controller,
            index_to_mac,
            mac_to_index,
            sensors: config.sensors.len(),
            actuators: config.actuators,
            next_schedule_creation: SimTime::ZERO,
            pending_controls: BTreeMap::new(),
            next_control: 0,
            schedules_created: 0,
        }));
        Ok((ids, addr))
    }

    /// Schedules created so far.
    pub fn schedules_created(&self) -> u64 {
        self.schedules_created
    }

    /// Address of device `index`.
    pub fn mac_of(&self, index: usize) -> Option<MacAddress> {
        self.index_to_mac.get(index).copied()
    }

    fn index_of(&self, mac: MacAddress) -> Result<usize, SimError> {
        self.mac_to_index
            .get(&mac)
            .copied()
            .ok_or_else(|| SimError::protocol(self.id, format!("no device index for MAC address {}", mac)))
    }

    fn missing(&self, what: &str) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: format!("{} handle does not resolve", what),
        }
    }

    fn create_schedule(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let (observation, reward) = {
            let collaborators = self.collaborators.lock();
            let interpreter = collaborators
                .interpreter(self.interpreter)
                .ok_or_else(|| self.missing("interpreter"))?;
            (interpreter.observation(now), interpreter.reward(now))
        };
        metrics::gauge!(metric_defs::CONTROL_REWARD.name, "node" => self.name.clone()).set(reward);

        let schedule = self
            .scheduler
            .next_schedule(&observation, reward)
            .map_err(|e| SimError::HandlerError {
                entity: self.id,
                message: e.to_string(),
            })?;
        let control_slots: Vec<(u32, MacAddress)> = match &schedule {
            Schedule::Tdma(tdma) => tdma
                .control_entries(&self.actuators)
                .map(|e| (e.start, e.device))
                .collect(),
            Schedule::Csma(_) => Vec::new(),
        };
        let control_indices = control_slots
            .iter()
            .map(|(_, mac)| self.index_of(*mac))
            .collect::<Result<Vec<_>, _>>()?;
        {
            let mut collaborators = self.collaborators.lock();
            let interpreter = collaborators
                .interpreter_mut(self.interpreter)
                .ok_or_else(|| self.missing("interpreter"))?;
            interpreter.on_schedule_created(&schedule, &control_indices, now);
        }

        self.schedules_created += 1;
        self.next_schedule_creation = now + self.slot_length.times(u64::from(schedule.end_time()));
        debug!(
            device = %self.name,
            schedule = %schedule,
            next = %self.next_schedule_creation,
            reward,
            "schedule created"
        );
        let command = Command::SendSchedule { schedule, clock: now };
        ctx.send(
            self.port.output,
            Signal::Message(StackMessage::with_reply(command, self.id, TOKEN_SCHEDULE)),
        )?;

        for (start, actuator) in control_slots {
            let number = self.next_control;
            self.next_control += 1;
            self.pending_controls.insert(number, actuator);
            ctx.post_at(
                now + self.slot_length.times(u64::from(start)),
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_CONTROL_BASE + number,
                },
            );
        }
        ctx.post_at(
            self.next_schedule_creation,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_SCHEDULE,
            },
        );
        Ok(())
    }

    fn send_control(&mut self, number: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(receiver) = self.pending_controls.remove(&number) else {
            return Ok(());
        };
        let index = self.index_of(receiver)?;
        let control = {
            let collaborators = self.collaborators.lock();
            let controller = collaborators
                .controller(self.controller)
                .ok_or_else(|| self.missing("controller"))?;
            controller.control(index.saturating_sub(self.sensors))
        };
        debug!(device = %self.name, actuator = %receiver, control, "sending control");
        let command = Command::SendControl { control, receiver };
        ctx.send(
            self.port.output,
            Signal::Message(StackMessage::with_reply(command, self.id, TOKEN_CONTROL)),
        )
    }

    fn on_sensor_data(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        let header = packet.ncs_header()?;
        let index = self.index_of(header.source)?;
        if index >= self.sensors {
            warn!(device = %self.name, source = %header.source, "sensor data from an actuator ignored");
            return Ok(());
        }
        let Some(state) = packet.payload.as_value() else {
            return Err(SimError::protocol(
                self.id,
                format!("sensor data without a value: {}", packet.payload),
            ));
        };
        let now = ctx.time();
        {
            let mut collaborators = self.collaborators.lock();
            collaborators
                .interpreter_mut(self.interpreter)
                .ok_or_else(|| self.missing("interpreter"))?
                .on_packet_received(index, &packet.payload, now);
            collaborators
                .controller_mut(self.controller)
                .ok_or_else(|| self.missing("controller"))?
                .on_sensor_data_received(index, state, now);
        }
        trace!(device = %self.name, sensor = index, state, "sensor data received");
        ctx.record(SimRecord::SensorDataReceived {
            sensor: header.source.to_string(),
            value: state,
        });
        Ok(())
    }
}

impl Entity for Gateway {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer {
                timer_id: TIMER_SCHEDULE,
            } => self.create_schedule(ctx),
            EventPayload::Timer { timer_id } if *timer_id >= TIMER_CONTROL_BASE => {
                self.send_control(timer_id - TIMER_CONTROL_BASE, ctx)
            }
            EventPayload::Notified(n) if n.tag == TAG_MAC => match &n.value {
                Signal::Packet(packet) => self.on_sensor_data(packet, ctx),
                _ => Ok(()),
            },
            EventPayload::Processed { token, .. } => {
                trace!(device = %self.name, token, "mac finished a command");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
