//! Probabilistic channel access following CSMA schedules.

use crate::{unexpected, MacConfig, MacPorts, TAG_PHY, TAG_UPPER};
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, ListenerMode, MacAddress, Packet, Port, Schedule, SimContext,
    SimError, SimTime, Signal, StackMessage,
};
use ncsim_packet::{Header, NcsMacHeader, PacketType, Payload};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

const TIMER_SLOT: u64 = 1;
const TOKEN_DATA: u64 = 1;

struct Attempts {
    p: f64,
    slot: u32,
    end: u32,
}

/// Sensor MAC for CSMA schedules.
///
/// A schedule valid for `n` slots gives the sensor slots `1..n`. At the
/// start of each one the sensor sends its latest sample with the probability
/// the schedule assigns to it. Reception resumes after the last slot.
pub struct SensorMacCsma {
    id: EntityId,
    addr: MacAddress,
    name: String,
    config: MacConfig,
    ports: MacPorts,
    rng: ChaCha8Rng,
    receiving: bool,
    gateway_clock: SimTime,
    last_data: Option<Packet>,
    network_cmd: Option<StackMessage>,
    attempts: Option<Attempts>,
    sent: u64,
}

impl SensorMacCsma {
    /// Create the layer and connect it to `phy_mac_port`. Send decisions are
    /// drawn from a generator seeded with `seed`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        addr: MacAddress,
        phy_mac_port: &Port,
        config: MacConfig,
        seed: u64,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "network", phy_mac_port, ListenerMode::Immediate)?;
        debug!(device, mac = %addr, "csma sensor mac initialized");
        Ok(SensorMacCsma {
            id,
            addr,
            name: device.to_string(),
            config,
            ports,
            rng: ChaCha8Rng::seed_from_u64(seed),
            receiving: true,
            gateway_clock: SimTime::ZERO,
            last_data: None,
            network_cmd: None,
            attempts: None,
            sent: 0,
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

    /// Frames sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn on_phy_packet(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        if !self.receiving {
            return Ok(());
        }
        let header = packet.ncs_header()?;
        if header.packet_type != PacketType::Schedule {
            return Ok(());
        }
        let (Payload::Schedule { schedule, .. }, Some(Payload::Clock(micros))) = (&packet.payload, &packet.trailer)
        else {
            return Err(unexpected(self.id, "schedule packet without schedule or clock"));
        };
        let Schedule::Csma(schedule) = schedule else {
            return Err(unexpected(self.id, "TDMA schedule at a CSMA sensor"));
        };
        let p = schedule.get_my_p(self.addr);
        debug!(device = %self.name, p, schedule = %schedule, "received a schedule");
        self.gateway_clock = SimTime::from_micros(*micros);
        if schedule.end_time() <= 1 || p <= 0.0 {
            return Ok(());
        }
        self.receiving = false;
        self.attempts = Some(Attempts {
            p,
            slot: 1,
            end: schedule.end_time(),
        });
        self.wait_for_slot(ctx, 1);
        Ok(())
    }

    fn wait_for_slot(&self, ctx: &mut SimContext, slot: u32) {
        let at = self.gateway_clock + self.config.slot_length.times(u64::from(slot));
        ctx.post_at(at, vec![self.id], EventPayload::Timer { timer_id: TIMER_SLOT });
    }

    fn on_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(p) = self.attempts.as_ref().map(|a| a.p) else {
            return Ok(());
        };
        let draw: f64 = self.rng.gen();
        match self.last_data.clone() {
            Some(packet) if draw < p => {
                trace!(device = %self.name, draw, p, "sending in this slot");
                self.ports
                    .transmit(ctx, self.id, packet, &self.config.link, TOKEN_DATA)
            }
            _ => {
                self.next_slot(ctx);
                Ok(())
            }
        }
    }

    fn next_slot(&mut self, ctx: &mut SimContext) {
        let Some(attempts) = self.attempts.as_mut() else {
            return;
        };
        attempts.slot += 1;
        if attempts.slot < attempts.end {
            let slot = attempts.slot;
            self.wait_for_slot(ctx, slot);
        } else {
            self.attempts = None;
            self.receiving = true;
        }
    }

    fn on_network_command(&mut self, message: &StackMessage) -> Result<(), SimError> {
        let Command::SensorData { state } = message.command else {
            return Err(unexpected(self.id, "command for a sensor mac"));
        };
        let header = NcsMacHeader::new(self.config.protocol, PacketType::SensorData, self.addr);
        self.last_data = Some(Packet::new(Header::Ncs(header), Payload::Value(state)));
        self.network_cmd = Some(message.clone());
        Ok(())
    }
}

impl Entity for SensorMacCsma {
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
                self.sent += 1;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::GatewayMac;
    use ncsim_common::ProtocolType;
    use ncsim_packet::CsmaSchedule;

    fn run(p_sensor: f64, length: u32) -> (u64, usize) {
        let mut h = Harness::new();
        let config = MacConfig {
            protocol: ProtocolType::Csma,
            ..MacConfig::default()
        };
        let gw_addr = h.ctx.new_mac_address();
        let addr = h.ctx.new_mac_address();
        let other = h.ctx.new_mac_address();
        let gw_phy = h.phy("gw", 0.0);
        let gw_id = h.next_id();
        let gw = GatewayMac::new(&mut h.ctx, gw_id, "gw", gw_addr, &gw_phy, config).unwrap();
        let phy = h.phy("s", 1.0);
        let id = h.next_id();
        let sensor = SensorMacCsma::new(&mut h.ctx, id, "s", addr, &phy, config, 3).unwrap();

        let schedule = CsmaSchedule::new(vec![(addr, p_sensor), (other, 1.0 - p_sensor)], length).unwrap();
        let (gw_upper, gw_seen) = h.upper(
            gw.network_port(),
            vec![Command::SendSchedule {
                schedule: Schedule::Csma(schedule),
                clock: SimTime::ZERO,
            }],
        );
        let (sensor_upper, _) = h.upper(sensor.network_port(), vec![Command::SensorData { state: 1.0 }]);
        h.register(Box::new(gw));
        h.register(Box::new(sensor));
        h.at(SimTime::ZERO, sensor_upper, 0);
        h.at(SimTime::ZERO, gw_upper, 0);
        let mut kernel = h.into_kernel();
        kernel.run_until(SimTime::from_secs(2.0));
        let received = gw_seen.lock().iter().filter(|(_, s)| matches!(s, Signal::Packet(_))).count();
        (u64::from(length), received)
    }

    #[test]
    fn test_certain_sender_uses_every_slot() {
        let (length, received) = run(1.0, 6);
        assert_eq!(received as u64, length - 1);
    }

    #[test]
    fn test_silent_sender_never_sends() {
        let (_, received) = run(0.0, 6);
        assert_eq!(received, 0);
    }

    #[test]
    fn test_partial_probability_sends_some() {
        let (length, received) = run(0.5, 40);
        assert!(received > 0 && (received as u64) < length - 1, "received {}", received);
    }
}
