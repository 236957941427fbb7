//! Generic devices of the contention-free protocol.

use crate::{mac_link, Assembly, DeviceIds};
use ncsim_common::journal::SimRecord;
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, LinkSettings, MacAddress, Packet, Port, SimContext, SimError,
    SimTime, Signal, StackMessage,
};
use ncsim_mac::SimpleMac;
use ncsim_packet::{Header, Payload, SimpleTransportHeader};
use tracing::{debug, info};

/// How long a device waits for a packet before it re-arms its receiver.
pub const RECEIVE_TIMEOUT: SimTime = SimTime::from_millis(100_000);

const TIMER_TRAFFIC: u64 = 1;

const TOKEN_RECEIVE: u64 = 1;

/// Periodic traffic sent by a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficConfig {
    /// Destination of every packet.
    pub dest: MacAddress,
    /// Time between two packets; the first leaves at time zero.
    pub interval: SimTime,
    /// Payload size in bytes.
    pub bytes: usize,
}

/// Everything needed to add a contention-free device.
#[derive(Debug, Clone)]
pub struct NetworkDeviceConfig {
    /// Device name.
    pub name: String,
    /// Position.
    pub x: f64,
    /// Position.
    pub y: f64,
    /// Power and MCS of every transmission.
    pub link: LinkSettings,
    /// Traffic to generate, if any.
    pub traffic: Option<TrafficConfig>,
}

/// A device that keeps its receiver armed and optionally sends periodic
/// traffic, queued by its MAC until the resource manager grants it the
/// medium.
pub struct SimpleNetworkDevice {
    id: EntityId,
    name: String,
    addr: MacAddress,
    port: Port,
    traffic: Option<TrafficConfig>,
    sent: u64,
    received: u64,
}

impl SimpleNetworkDevice {
    /// Add a device with its phy and MAC to `asm`.
    pub fn build(asm: &mut Assembly, config: NetworkDeviceConfig) -> Result<(DeviceIds, MacAddress), SimError> {
        let ids = asm.device_ids();
        let (_, phy_port) = asm.add_phy(ids.phy, &config.name, config.x, config.y)?;
        let addr = asm.ctx().new_mac_address();
        let mac = SimpleMac::new(asm.ctx(), ids.mac, &config.name, addr, &phy_port, config.link)?;
        let port = mac_link(asm.ctx(), ids.device, &config.name, mac.transport_port())?;
        asm.register(Box::new(mac));

        let mut device = SimpleNetworkDevice {
            id: ids.device,
            name: config.name,
            addr,
            port,
            traffic: config.traffic,
            sent: 0,
            received: 0,
        };
        device.arm_receiver(asm.ctx())?;
        if device.traffic.is_some() {
            asm.ctx()
                .post_at(SimTime::ZERO, vec![ids.device], EventPayload::Timer { timer_id: TIMER_TRAFFIC });
        }
        debug!(device = %device.name, mac = %addr, "network device initialized");
        asm.register(Box::new(device));
        Ok((ids, addr))
    }

    /// Packets handed to the MAC so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Packets received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn arm_receiver(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let command = Command::Receive {
            duration: RECEIVE_TIMEOUT,
        };
        ctx.send(
            self.port.output,
            Signal::Message(StackMessage::with_reply(command, self.id, TOKEN_RECEIVE)),
        )
    }

    fn send_traffic(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(traffic) = self.traffic else {
            return Ok(());
        };
        let header = SimpleTransportHeader {
            source: self.addr,
            dest: traffic.dest,
        };
        let packet = Packet::new(Header::SimpleTransport(header), Payload::Fake(traffic.bytes));
        self.sent += 1;
        debug!(device = %self.name, dest = %traffic.dest, bytes = traffic.bytes, "sending packet");
        ctx.send(self.port.output, Signal::Packet(packet))?;
        ctx.post_event(traffic.interval, vec![self.id], EventPayload::Timer { timer_id: TIMER_TRAFFIC });
        Ok(())
    }
}

impl Entity for SimpleNetworkDevice {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer {
                timer_id: TIMER_TRAFFIC,
            } => self.send_traffic(ctx),
            EventPayload::Processed {
                token: TOKEN_RECEIVE,
                value,
            } => {
                if let Some(Signal::Payload(payload)) = value {
                    self.received += 1;
                    info!(device = %self.name, payload = %payload, "received payload");
                    ctx.record(SimRecord::PayloadReceived {
                        device: self.name.clone(),
                        bytes: payload.byte_size(),
                    });
                }
                self.arm_receiver(ctx)
            }
            _ => Ok(()),
        }
    }
}
