//! TDMA MAC layers for the gateway, sensor and actuator roles.
//!
//! The gateway broadcasts schedules (type 0) stamped with its clock. Slot
//! `i` of a schedule starts at `clock + i * slot_length`. Sensors send their
//! latest sample (type 1) in every slot they own; actuators receive control
//! values (type 2) and acknowledge them in their own unflagged slots.

use crate::{unexpected, MacConfig, MacPorts, TAG_PHY, TAG_UPPER};
use ncsim_common::journal::SimRecord;
use ncsim_common::metric_defs;
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, ListenerMode, MacAddress, Notification, Packet, Port, Schedule,
    SimContext, SimError, SimTime, Signal, StackMessage, SubscriptionId,
};
use ncsim_packet::{Header, NcsMacHeader, PacketType, Payload, TdmaSchedule};
use std::collections::VecDeque;
use tracing::{debug, info, trace};

const TIMER_SLOT: u64 = 1;
const TIMER_RECEIVE_TIMEOUT_BASE: u64 = 0x1_0000_0000; // receive generation is added to this
const TIMER_ACK_SLOT_BASE: u64 = 0x2_0000_0000; // schedule generation is added to this

const TOKEN_DATA: u64 = 1;
const TOKEN_ACK: u64 = 2;
const TOKEN_SCHEDULE: u64 = 3;
const TOKEN_CONTROL: u64 = 4;

/// The schedule and gateway clock carried by a schedule packet.
fn schedule_of(owner: EntityId, packet: &Packet) -> Result<(Schedule, SimTime), SimError> {
    let Payload::Schedule { schedule, .. } = &packet.payload else {
        return Err(unexpected(owner, format!("schedule payload {}", packet.payload)));
    };
    let Some(Payload::Clock(micros)) = packet.trailer else {
        return Err(unexpected(owner, "schedule packet without clock trailer"));
    };
    Ok((schedule.clone(), SimTime::from_micros(micros)))
}

fn ncs_packet(header: NcsMacHeader, payload: Payload) -> Packet {
    Packet::new(Header::Ncs(header), payload)
}

// ============================================================================
// Sensor
// ============================================================================

/// Position within the sensor's own slots of the current schedule.
#[derive(Debug, Clone, Copy)]
struct SlotWalk {
    end: u32,
    slot: u32,
}

/// Sensor MAC: sends the most recent sample in every slot the schedule
/// assigns to this sensor.
///
/// Reception is suspended from the moment a schedule arrives until the last
/// owned slot of that schedule has been used, so schedules arriving in
/// between are ignored.
pub struct SensorMacTdma {
    id: EntityId,
    addr: MacAddress,
    name: String,
    config: MacConfig,
    ports: MacPorts,
    receiving: bool,
    schedule: Option<TdmaSchedule>,
    gateway: Option<MacAddress>,
    gateway_clock: SimTime,
    last_data: Option<Packet>,
    network_cmd: Option<StackMessage>,
    walk: Option<SlotWalk>,
}

impl SensorMacTdma {
    /// Create the layer and connect it to `phy_mac_port`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        addr: MacAddress,
        phy_mac_port: &Port,
        config: MacConfig,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "network", phy_mac_port, ListenerMode::Immediate)?;
        debug!(device, mac = %addr, "sensor mac initialized");
        Ok(SensorMacTdma {
            id,
            addr,
            name: device.to_string(),
            config,
            ports,
            receiving: true,
            schedule: None,
            gateway: None,
            gateway_clock: SimTime::ZERO,
            last_data: None,
            network_cmd: None,
            walk: None,
        })
    }

    /// The layer's address.
    pub fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Port towards the device.
    pub fn network_port(&self) -> &Port {
        self.ports.upper()
    }

    /// Whether received frames are currently processed.
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Address of the gateway the last schedule came from.
    pub fn gateway(&self) -> Option<MacAddress> {
        self.gateway
    }

    fn on_phy_packet(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        if !self.receiving {
            trace!(device = %self.name, "packet ignored, not receiving");
            return Ok(());
        }
        let header = packet.ncs_header()?;
        if header.packet_type != PacketType::Schedule {
            return Ok(());
        }
        let (schedule, clock) = schedule_of(self.id, packet)?;
        let Schedule::Tdma(schedule) = schedule else {
            return Err(unexpected(self.id, "CSMA schedule at a TDMA sensor"));
        };
        debug!(device = %self.name, clock = %clock, schedule = %schedule, "received a schedule");
        self.gateway = Some(header.source);
        self.gateway_clock = clock;
        self.receiving = false;
        let span = schedule.next_relevant_timespan(self.addr, 0);
        self.schedule = Some(schedule);
        self.enter_span(span, ctx);
        Ok(())
    }

    fn enter_span(&mut self, span: Option<(u32, u32)>, ctx: &mut SimContext) {
        match span {
            Some((start, end)) => {
                debug!(device = %self.name, start, end, "next relevant timespan");
                self.walk = Some(SlotWalk { end, slot: start });
                self.wait_for_slot(ctx, start);
            }
            None => {
                self.walk = None;
                debug!(device = %self.name, "starting to receive");
                self.receiving = true;
            }
        }
    }

    fn wait_for_slot(&self, ctx: &mut SimContext, slot: u32) {
        let at = self.gateway_clock + self.config.slot_length.times(u64::from(slot));
        ctx.post_at(at, vec![self.id], EventPayload::Timer { timer_id: TIMER_SLOT });
    }

    fn on_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(walk) = self.walk else {
            return Ok(());
        };
        match self.last_data.clone() {
            Some(packet) => {
                debug!(device = %self.name, slot = walk.slot, "transmitting data");
                self.ports
                    .transmit(ctx, self.id, packet, &self.config.link, TOKEN_DATA)
            }
            None => {
                debug!(device = %self.name, slot = walk.slot, "no sensor data to send yet");
                self.next_slot(ctx);
                Ok(())
            }
        }
    }

    fn next_slot(&mut self, ctx: &mut SimContext) {
        let Some(walk) = self.walk.as_mut() else {
            return;
        };
        walk.slot += 1;
        if walk.slot < walk.end {
            let slot = walk.slot;
            self.wait_for_slot(ctx, slot);
            return;
        }
        let after = walk.end;
        let span = self
            .schedule
            .as_ref()
            .and_then(|s| s.next_relevant_timespan(self.addr, after));
        self.enter_span(span, ctx);
    }

    fn on_network_command(&mut self, message: &StackMessage) -> Result<(), SimError> {
        let Command::SensorData { state } = message.command else {
            return Err(unexpected(self.id, "command for a sensor mac"));
        };
        let header = NcsMacHeader::new(self.config.protocol, PacketType::SensorData, self.addr);
        self.last_data = Some(ncs_packet(header, Payload::Value(state)));
        self.network_cmd = Some(message.clone());
        trace!(device = %self.name, state, "new sensor data saved");
        Ok(())
    }
}

impl Entity for SensorMacTdma {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Notified(n) if n.tag == TAG_PHY => match &n.value {
                Signal::Packet(packet) => self.on_phy_packet(packet, ctx),
                _ => Ok(()),
            },
            EventPayload::Notified(n) if n.tag == TAG_UPPER => match &n.value {
                Signal::Message(message) => self.on_network_command(message),
                other => Err(unexpected(self.id, format!("{} on the network port", other.kind()))),
            },
            EventPayload::Timer { timer_id: TIMER_SLOT } => self.on_slot(ctx),
            EventPayload::Processed { token: TOKEN_DATA, .. } => {
                if let Some(cmd) = self.network_cmd.take() {
                    cmd.set_processed(ctx, None);
                }
                self.next_slot(ctx);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Actuator
// ============================================================================

struct PendingReceive {
    message: StackMessage,
    process: SubscriptionId,
    generation: u64,
}

/// Actuator MAC: stores schedules, hands control values addressed to it up
/// to the device and acknowledges the latest one in its next unflagged slot.
///
/// The `network` port is queued and accepts [`Command::Receive`], which
/// completes with the next control payload or with nothing once its
/// duration has passed.
pub struct ActuatorMacTdma {
    id: EntityId,
    addr: MacAddress,
    name: String,
    config: MacConfig,
    ports: MacPorts,
    schedule: Option<Schedule>,
    gateway: Option<MacAddress>,
    receive: Option<PendingReceive>,
    receive_generation: u64,
    ack_slots: VecDeque<SimTime>,
    schedule_generation: u64,
    last_control: Option<f64>,
    ack_due: bool,
}

impl ActuatorMacTdma {
    /// Create the layer and connect it to `phy_mac_port`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        addr: MacAddress,
        phy_mac_port: &Port,
        config: MacConfig,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "network", phy_mac_port, ListenerMode::Queued)?;
        debug!(device, mac = %addr, "actuator mac initialized");
        Ok(ActuatorMacTdma {
            id,
            addr,
            name: device.to_string(),
            config,
            ports,
            schedule: None,
            gateway: None,
            receive: None,
            receive_generation: 0,
            ack_slots: VecDeque::new(),
            schedule_generation: 0,
            last_control: None,
            ack_due: false,
        })
    }

    /// The layer's address.
    pub fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Port towards the device.
    pub fn network_port(&self) -> &Port {
        self.ports.upper()
    }

    /// The latest schedule received.
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Whether a receive command is pending.
    pub fn is_receiving(&self) -> bool {
        self.receive.is_some()
    }

    fn on_phy_packet(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        let header = packet.ncs_header()?;
        match header.packet_type {
            PacketType::Schedule => {
                let (schedule, clock) = schedule_of(self.id, packet)?;
                debug!(device = %self.name, schedule = %schedule, "received a schedule");
                self.gateway = Some(header.source);
                self.plan_acks(&schedule, clock, ctx);
                self.schedule = Some(schedule);
            }
            PacketType::Control if header.dest == Some(self.addr) => {
                let value = packet.payload.as_value();
                debug!(device = %self.name, control = ?value, "received a control value");
                self.last_control = value;
                self.ack_due = true;
                self.ports.deliver_up(ctx, Signal::Payload(packet.payload.clone()))?;
                if let Some(pending) = self.receive.take() {
                    pending
                        .message
                        .set_processed(ctx, Some(Signal::Payload(packet.payload.clone())));
                    ctx.process_done(pending.process);
                }
            }
            PacketType::Control | PacketType::SensorData => {}
        }
        Ok(())
    }

    /// Remember the start times of this actuator's unflagged slots.
    fn plan_acks(&mut self, schedule: &Schedule, clock: SimTime, ctx: &mut SimContext) {
        self.schedule_generation += 1;
        self.ack_slots.clear();
        let Schedule::Tdma(tdma) = schedule else {
            return;
        };
        for (i, slot) in tdma.action().iter().enumerate() {
            if slot.device == self.addr && slot.flag == 0 {
                let at = clock + self.config.slot_length.times(i as u64 + 1);
                self.ack_slots.push_back(at);
            }
        }
        self.wait_for_ack_slot(ctx);
    }

    fn wait_for_ack_slot(&mut self, ctx: &mut SimContext) {
        if let Some(at) = self.ack_slots.pop_front() {
            ctx.post_at(
                at,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_ACK_SLOT_BASE + self.schedule_generation,
                },
            );
        }
    }

    fn on_ack_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        match (self.ack_due, self.gateway, self.last_control) {
            (true, Some(gateway), Some(control)) => {
                self.ack_due = false;
                let header = NcsMacHeader::new(self.config.protocol, PacketType::Control, self.addr).with_dest(gateway);
                debug!(device = %self.name, control, "acknowledging control value");
                self.ports.transmit(
                    ctx,
                    self.id,
                    ncs_packet(header, Payload::Value(control)),
                    &self.config.link,
                    TOKEN_ACK,
                )
            }
            _ => {
                self.wait_for_ack_slot(ctx);
                Ok(())
            }
        }
    }

    fn on_network_command(&mut self, notification: &Notification, ctx: &mut SimContext) -> Result<(), SimError> {
        let message = match &notification.value {
            Signal::Message(message) => message,
            other => return Err(unexpected(self.id, format!("{} on the network port", other.kind()))),
        };
        let Command::Receive { duration } = message.command else {
            return Err(unexpected(self.id, "command for an actuator mac"));
        };
        debug!(device = %self.name, duration = %duration, "entering receive mode");
        self.receive_generation += 1;
        self.receive = Some(PendingReceive {
            message: message.clone(),
            process: notification.subscription,
            generation: self.receive_generation,
        });
        ctx.post_event(
            duration,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RECEIVE_TIMEOUT_BASE + self.receive_generation,
            },
        );
        Ok(())
    }

    fn on_receive_timeout(&mut self, generation: u64, ctx: &mut SimContext) {
        if self.receive.as_ref().map(|r| r.generation) != Some(generation) {
            return;
        }
        if let Some(pending) = self.receive.take() {
            debug!(device = %self.name, "receive timed out");
            pending.message.set_processed(ctx, None);
            ctx.process_done(pending.process);
        }
    }
}

impl Entity for ActuatorMacTdma {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Notified(n) if n.tag == TAG_PHY => match &n.value {
                Signal::Packet(packet) => self.on_phy_packet(packet, ctx),
                _ => Ok(()),
            },
            EventPayload::ProcessStart(n) if n.tag == TAG_UPPER => self.on_network_command(n, ctx),
            EventPayload::Timer { timer_id } if *timer_id >= TIMER_ACK_SLOT_BASE => {
                if *timer_id - TIMER_ACK_SLOT_BASE == self.schedule_generation {
                    self.on_ack_slot(ctx)
                } else {
                    Ok(())
                }
            }
            EventPayload::Timer { timer_id } if *timer_id >= TIMER_RECEIVE_TIMEOUT_BASE => {
                self.on_receive_timeout(*timer_id - TIMER_RECEIVE_TIMEOUT_BASE, ctx);
                Ok(())
            }
            EventPayload::Processed { token: TOKEN_ACK, .. } => {
                self.wait_for_ack_slot(ctx);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Diagnostic counters of a [`GatewayMac`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayCounters {
    /// Schedules put on the air.
    pub schedules_sent: u64,
    /// Control values put on the air.
    pub controls_sent: u64,
    /// Sensor data frames received.
    pub data_received: u64,
    /// Acknowledgements received from actuators.
    pub acks_received: u64,
}

/// Messages of one kind, sent one after the other.
#[derive(Default)]
struct Lane {
    queue: VecDeque<StackMessage>,
    in_flight: Option<StackMessage>,
}

/// Gateway MAC: broadcasts schedules and sends control values, each kind
/// through its own queue, and passes received sensor data up.
pub struct GatewayMac {
    id: EntityId,
    addr: MacAddress,
    name: String,
    config: MacConfig,
    ports: MacPorts,
    schedules: Lane,
    controls: Lane,
    counters: GatewayCounters,
}

impl GatewayMac {
    /// Create the layer and connect it to `phy_mac_port`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        addr: MacAddress,
        phy_mac_port: &Port,
        config: MacConfig,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "network", phy_mac_port, ListenerMode::Immediate)?;
        debug!(device, mac = %addr, "gateway mac initialized");
        Ok(GatewayMac {
            id,
            addr,
            name: device.to_string(),
            config,
            ports,
            schedules: Lane::default(),
            controls: Lane::default(),
            counters: GatewayCounters::default(),
        })
    }

    /// The layer's address.
    pub fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Port towards the gateway device.
    pub fn network_port(&self) -> &Port {
        self.ports.upper()
    }

    /// Counters collected so far.
    pub fn counters(&self) -> GatewayCounters {
        self.counters
    }

    fn on_network_command(&mut self, signal: &Signal, ctx: &mut SimContext) -> Result<(), SimError> {
        let Signal::Message(message) = signal else {
            return Err(unexpected(self.id, format!("{} on the network port", signal.kind())));
        };
        match message.command {
            Command::SendSchedule { .. } => {
                self.schedules.queue.push_back(message.clone());
                self.pump_schedules(ctx)
            }
            Command::SendControl { .. } => {
                self.controls.queue.push_back(message.clone());
                self.pump_controls(ctx)
            }
            _ => Err(unexpected(self.id, "command for a gateway mac")),
        }
    }

    fn pump_schedules(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.schedules.in_flight.is_some() {
            return Ok(());
        }
        let Some(message) = self.schedules.queue.pop_front() else {
            return Ok(());
        };
        let Command::SendSchedule { schedule, clock } = &message.command else {
            return Ok(());
        };
        let size = schedule.encoded_len(false);
        let header = NcsMacHeader::new(schedule.protocol(), PacketType::Schedule, self.addr);
        let packet = ncs_packet(
            header,
            Payload::Schedule {
                schedule: schedule.clone(),
                size,
            },
        )
        .with_trailer(Payload::Clock(clock.as_micros()));
        info!(device = %self.name, schedule = %schedule, bytes = size, "sending schedule");
        ctx.record(SimRecord::ScheduleSent {
            gateway: self.name.clone(),
            schedule: schedule.to_string(),
            bytes: size,
        });
        self.ports
            .transmit(ctx, self.id, packet, &self.config.link, TOKEN_SCHEDULE)?;
        self.schedules.in_flight = Some(message);
        Ok(())
    }

    fn pump_controls(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.controls.in_flight.is_some() {
            return Ok(());
        }
        let Some(message) = self.controls.queue.pop_front() else {
            return Ok(());
        };
        let Command::SendControl { control, receiver } = message.command else {
            return Ok(());
        };
        let header = NcsMacHeader::new(self.config.protocol, PacketType::Control, self.addr).with_dest(receiver);
        debug!(device = %self.name, control, receiver = %receiver, "sending control");
        ctx.record(SimRecord::ControlSent {
            actuator: receiver.to_string(),
            value: control,
        });
        self.ports.transmit(
            ctx,
            self.id,
            ncs_packet(header, Payload::Value(control)),
            &self.config.link,
            TOKEN_CONTROL,
        )?;
        self.controls.in_flight = Some(message);
        Ok(())
    }

    fn on_phy_packet(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        let header = packet.ncs_header()?;
        match header.packet_type {
            PacketType::SensorData => {
                debug!(device = %self.name, source = %header.source, data = %packet.payload, "received sensor data");
                self.counters.data_received += 1;
                metrics::counter!(metric_defs::MAC_DATA_RECEIVED.name, "node" => self.name.clone()).increment(1);
                self.ports.deliver_up(ctx, Signal::Packet(packet.clone()))?;
            }
            PacketType::Control if header.dest == Some(self.addr) => {
                debug!(device = %self.name, source = %header.source, "received actuator ack");
                self.counters.acks_received += 1;
                metrics::counter!(metric_defs::MAC_ACKS_RECEIVED.name, "node" => self.name.clone()).increment(1);
            }
            PacketType::Control | PacketType::Schedule => {}
        }
        Ok(())
    }

    fn on_processed(&mut self, token: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        if token == TOKEN_SCHEDULE {
            if let Some(message) = self.schedules.in_flight.take() {
                message.set_processed(ctx, None);
            }
            self.counters.schedules_sent += 1;
            metrics::counter!(metric_defs::MAC_SCHEDULES_SENT.name, "node" => self.name.clone()).increment(1);
            self.pump_schedules(ctx)
        } else {
            if let Some(message) = self.controls.in_flight.take() {
                message.set_processed(ctx, None);
            }
            self.counters.controls_sent += 1;
            metrics::counter!(metric_defs::MAC_CONTROLS_SENT.name, "node" => self.name.clone()).increment(1);
            self.pump_controls(ctx)
        }
    }
}

impl Entity for GatewayMac {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Notified(n) if n.tag == TAG_PHY => match &n.value {
                Signal::Packet(packet) => self.on_phy_packet(packet, ctx),
                _ => Ok(()),
            },
            EventPayload::Notified(n) if n.tag == TAG_UPPER => self.on_network_command(&n.value, ctx),
            EventPayload::Processed { token, .. } if *token == TOKEN_SCHEDULE || *token == TOKEN_CONTROL => {
                self.on_processed(*token, ctx)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use ncsim_common::{Kernel, ProtocolType};
    use ncsim_packet::SlotAssignment;

    const SLOT: SimTime = SimTime::from_millis(40);

    struct Ncs {
        kernel: Kernel,
        gateway_seen: crate::testing::Seen,
        actuator_seen: crate::testing::Seen,
    }

    /// A gateway, a sensor and an actuator within a few metres. The gateway
    /// sends `schedule` at t=0 and a control of 1.5 to the actuator at
    /// `control_at`.
    fn ncs(schedule: impl Fn(MacAddress, MacAddress) -> TdmaSchedule, control_at: Option<SimTime>) -> Ncs {
        let mut h = Harness::new();
        let config = MacConfig::default();
        let gw_addr = h.ctx.new_mac_address();
        let sensor_addr = h.ctx.new_mac_address();
        let actuator_addr = h.ctx.new_mac_address();

        let gw_phy = h.phy("gw", 0.0);
        let gw_id = h.next_id();
        let gw = GatewayMac::new(&mut h.ctx, gw_id, "gw", gw_addr, &gw_phy, config).unwrap();
        let sensor_phy = h.phy("s", 2.0);
        let sensor_id = h.next_id();
        let sensor = SensorMacTdma::new(&mut h.ctx, sensor_id, "s", sensor_addr, &sensor_phy, config).unwrap();
        let actuator_phy = h.phy("a", 3.0);
        let actuator_id = h.next_id();
        let actuator = ActuatorMacTdma::new(&mut h.ctx, actuator_id, "a", actuator_addr, &actuator_phy, config).unwrap();

        let schedule = Schedule::Tdma(schedule(sensor_addr, actuator_addr));
        let (gw_upper, gateway_seen) = h.upper(
            gw.network_port(),
            vec![
                Command::SendSchedule {
                    schedule,
                    clock: SimTime::ZERO,
                },
                Command::SendControl {
                    control: 1.5,
                    receiver: actuator_addr,
                },
            ],
        );
        let (sensor_upper, _) = h.upper(sensor.network_port(), vec![Command::SensorData { state: 0.25 }]);
        let (_, actuator_seen) = h.upper(actuator.network_port(), vec![]);
        h.register(Box::new(gw));
        h.register(Box::new(sensor));
        h.register(Box::new(actuator));

        h.at(SimTime::ZERO, sensor_upper, 0);
        h.at(SimTime::ZERO, gw_upper, 0);
        if let Some(at) = control_at {
            h.at(at, gw_upper, 1);
        }
        Ncs {
            kernel: h.into_kernel(),
            gateway_seen,
            actuator_seen,
        }
    }

    fn records(kernel: &mut Kernel) -> Vec<ncsim_common::journal::TimedRecord> {
        kernel.context_mut().take_records()
    }

    #[test]
    fn test_sensor_sends_in_each_owned_slot() {
        let mut ncs = ncs(
            |s, a| {
                TdmaSchedule::new(vec![
                    SlotAssignment::new(s, 0),
                    SlotAssignment::new(s, 0),
                    SlotAssignment::new(a, 0),
                    SlotAssignment::new(s, 0),
                ])
            },
            None,
        );
        ncs.kernel.run_until(SimTime::from_secs(1.0));

        let data: Vec<SimTime> = ncs
            .gateway_seen
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, Signal::Packet(_)))
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(data.len(), 3);
        // slots 1, 2 and 4, each frame a few milliseconds long
        for (time, slot) in data.iter().zip([1u64, 2, 4]) {
            let start = SLOT.times(slot);
            assert!(*time > start && *time < start + SimTime::from_millis(5), "{} vs slot {}", time, slot);
        }
    }

    #[test]
    fn test_schedule_record_and_size() {
        let mut ncs = ncs(
            |s, a| TdmaSchedule::new(vec![SlotAssignment::new(s, 0), SlotAssignment::new(a, 1)]),
            None,
        );
        ncs.kernel.run_until(SimTime::from_secs(1.0));
        let sent: Vec<_> = records(&mut ncs.kernel)
            .into_iter()
            .filter_map(|r| match r.record {
                SimRecord::ScheduleSent { bytes, .. } => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![2 * 7 + 1]);
    }

    #[test]
    fn test_actuator_receives_control_and_acknowledges() {
        // slot 2 reserved for the control, slot 3 for the ack
        let mut ncs = ncs(
            |s, a| {
                TdmaSchedule::new(vec![
                    SlotAssignment::new(s, 0),
                    SlotAssignment::new(a, 1),
                    SlotAssignment::new(a, 0),
                ])
            },
            Some(SLOT.times(2)),
        );
        ncs.kernel.run_until(SimTime::from_secs(1.0));

        let controls: Vec<f64> = ncs
            .actuator_seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Signal::Payload(p) => p.as_value(),
                _ => None,
            })
            .collect();
        assert_eq!(controls, vec![1.5]);

        let acks = records(&mut ncs.kernel)
            .into_iter()
            .filter(|r| matches!(&r.record, SimRecord::TransmissionStarted { sender, .. } if sender == "a"))
            .count();
        assert_eq!(acks, 1);
    }

    #[test]
    fn test_sensor_without_slots_keeps_receiving() {
        let mut h = Harness::new();
        let phy = h.phy("s", 0.0);
        let id = h.next_id();
        let addr = h.ctx.new_mac_address();
        let mut sensor = SensorMacTdma::new(&mut h.ctx, id, "s", addr, &phy, MacConfig::default()).unwrap();
        let other = h.ctx.new_mac_address();
        let schedule = Schedule::Tdma(TdmaSchedule::new(vec![SlotAssignment::new(other, 0)]));
        let packet = ncs_packet(
            NcsMacHeader::new(ProtocolType::Tdma, PacketType::Schedule, other),
            Payload::Schedule { schedule, size: 8 },
        )
        .with_trailer(Payload::Clock(0));
        sensor.on_phy_packet(&packet, &mut h.ctx).unwrap();
        assert!(sensor.is_receiving());
        assert_eq!(sensor.gateway(), Some(other));
    }

    #[test]
    fn test_foreign_header_is_fatal() {
        let mut h = Harness::new();
        let phy = h.phy("s", 0.0);
        let id = h.next_id();
        let addr = h.ctx.new_mac_address();
        let mut sensor = SensorMacTdma::new(&mut h.ctx, id, "s", addr, &phy, MacConfig::default()).unwrap();
        let packet = Packet::new(Header::Fake(3), Payload::Fake(3));
        assert!(sensor.on_phy_packet(&packet, &mut h.ctx).is_err());
    }

    #[test]
    fn test_actuator_receive_times_out() {
        let mut h = Harness::new();
        let phy = h.phy("a", 0.0);
        let id = h.next_id();
        let addr = h.ctx.new_mac_address();
        let actuator = ActuatorMacTdma::new(&mut h.ctx, id, "a", addr, &phy, MacConfig::default()).unwrap();
        let (upper, seen) = h.upper(
            actuator.network_port(),
            vec![Command::Receive {
                duration: SimTime::from_millis(10),
            }],
        );
        h.register(Box::new(actuator));
        h.at(SimTime::ZERO, upper, 0);
        let mut kernel = h.into_kernel();
        kernel.run();
        assert!(seen.lock().is_empty());
        assert!(kernel.halted().is_empty());
        assert_eq!(kernel.time().as_millis(), 10);
    }
}
