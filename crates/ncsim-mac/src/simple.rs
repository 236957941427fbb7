//! The contention-free polled protocol.
//!
//! The resource manager owns address `00:00:00:00:00:00`. It grants the
//! medium to one device at a time with an announcement: a packet with a
//! [`SimpleMacHeader`] from the manager to the device, flag `1`, whose payload
//! is the number `n` of granted time slots. For the next `n` slots the device
//! may send from its queue; all other packets carry flag `0`.

use crate::{unexpected, MacPorts, TAG_PHY, TAG_UPPER};
use ncsim_common::journal::SimRecord;
use ncsim_common::metric_defs;
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, LinkSettings, ListenerMode, MacAddress, Notification, Packet,
    Port, SimContext, SimError, SimTime, Signal, StackMessage, SubscriptionId,
};
use ncsim_packet::{Header, Payload, SimpleMacHeader};
use ncsim_phy::TIME_SLOT_LENGTH;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Packets a [`SimpleMac`] keeps queued. The oldest is dropped when a new
/// one arrives at a full queue.
pub const SIMPLE_MAC_QUEUE_LIMIT: usize = 100;

const FLAG_GRANT: u8 = 1;

const TOKEN_SEND: u64 = 1;
const TOKEN_ANNOUNCEMENT: u64 = 2;

const TIMER_GRANT_WINDOW: u64 = 1;
const TIMER_GRANT_END_BASE: u64 = 0x1_0000_0000; // grant generation is added to this
const TIMER_RECEIVE_TIMEOUT_BASE: u64 = 0x2_0000_0000; // receive generation is added to this

// ============================================================================
// Device side
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Grant {
    stop: SimTime,
    generation: u64,
    idling: bool,
}

struct PendingReceive {
    message: StackMessage,
    generation: u64,
}

/// Device MAC of the contention-free protocol.
///
/// The `transport` port accepts packets with a
/// [`SimpleTransportHeader`](ncsim_packet::SimpleTransportHeader), which are
/// queued until the next grant, and [`Command::Receive`], which completes
/// with the payload of the next packet addressed to this device or with
/// nothing once its duration has passed.
pub struct SimpleMac {
    id: EntityId,
    addr: MacAddress,
    name: String,
    link: LinkSettings,
    ports: MacPorts,
    queue: VecDeque<Packet>,
    grant: Option<Grant>,
    grant_generation: u64,
    sending: bool,
    receive: Option<PendingReceive>,
    receive_generation: u64,
}

impl SimpleMac {
    /// Create the layer and connect it to `phy_mac_port`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        addr: MacAddress,
        phy_mac_port: &Port,
        link: LinkSettings,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "transport", phy_mac_port, ListenerMode::Immediate)?;
        debug!(device, mac = %addr, "initialization completed");
        Ok(SimpleMac {
            id,
            addr,
            name: device.to_string(),
            link,
            ports,
            queue: VecDeque::with_capacity(SIMPLE_MAC_QUEUE_LIMIT),
            grant: None,
            grant_generation: 0,
            sending: false,
            receive: None,
            receive_generation: 0,
        })
    }

    /// The layer's address.
    pub fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Port towards the transport layer.
    pub fn transport_port(&self) -> &Port {
        self.ports.upper()
    }

    /// Packets waiting for a grant.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a receive command is pending.
    pub fn is_receiving(&self) -> bool {
        self.receive.is_some()
    }

    fn on_phy_packet(&mut self, packet: &Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        let header = packet.simple_mac_header()?;
        if header.dest != self.addr {
            return Ok(());
        }
        if header.source == MacAddress::RESOURCE_MANAGER {
            debug!(device = %self.name, packet = %packet, "received a packet from the resource manager");
            if header.flag == FLAG_GRANT {
                let Payload::Slots(slots) = packet.payload else {
                    return Err(unexpected(self.id, format!("grant payload {}", packet.payload)));
                };
                self.start_grant(slots, ctx)?;
            }
            return Ok(());
        }
        match self.receive.take() {
            Some(pending) => {
                info!(device = %self.name, "received packet");
                pending
                    .message
                    .set_processed(ctx, Some(Signal::Payload(packet.payload.clone())));
            }
            None => debug!(device = %self.name, "packet ignored, not receiving"),
        }
        Ok(())
    }

    fn start_grant(&mut self, slots: u32, ctx: &mut SimContext) -> Result<(), SimError> {
        let total = TIME_SLOT_LENGTH.times(u64::from(slots));
        self.grant_generation += 1;
        self.grant = Some(Grant {
            stop: ctx.time() + total,
            generation: self.grant_generation,
            idling: false,
        });
        info!(device = %self.name, slots, "got permission to transmit");
        ctx.post_event(
            total,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_GRANT_END_BASE + self.grant_generation,
            },
        );
        self.drain(ctx)
    }

    /// Send the head of the queue if the grant leaves room for it.
    fn drain(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(grant) = self.grant.as_mut() else {
            return Ok(());
        };
        if self.sending || grant.idling {
            return Ok(());
        }
        let Some(next) = self.queue.front() else {
            debug!(device = %self.name, "packet queue empty, nothing to transmit");
            return Ok(());
        };
        let time_left = (grant.stop - ctx.time()).as_secs_f64();
        if time_left <= next.transmission_time(self.link.mcs.bit_rate) {
            info!(device = %self.name, time_left, "next packet is too large to be transmitted, idling");
            grant.idling = true;
            return Ok(());
        }
        if let Some(packet) = self.queue.pop_front() {
            debug!(device = %self.name, time_left, packet = %packet, "transmitting packet");
            self.sending = true;
            self.ports.transmit(ctx, self.id, packet, &self.link, TOKEN_SEND)?;
        }
        Ok(())
    }

    fn on_transport(&mut self, signal: &Signal, ctx: &mut SimContext) -> Result<(), SimError> {
        match signal {
            Signal::Message(message) => {
                let Command::Receive { duration } = message.command else {
                    return Err(unexpected(self.id, "command for a simple mac"));
                };
                debug!(device = %self.name, duration = %duration, "entering receive mode");
                self.receive_generation += 1;
                self.receive = Some(PendingReceive {
                    message: message.clone(),
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
            Signal::Packet(payload) => {
                let transport = payload.simple_transport_header()?;
                let header = SimpleMacHeader {
                    source: self.addr,
                    dest: transport.dest,
                    flag: 0,
                };
                if self.queue.len() == SIMPLE_MAC_QUEUE_LIMIT {
                    warn!(device = %self.name, "packet queue full, dropping the oldest packet");
                    metrics::counter!(metric_defs::MAC_QUEUE_DROPPED.name, "node" => self.name.clone()).increment(1);
                    self.queue.pop_front();
                }
                self.queue
                    .push_back(Packet::new(Header::SimpleMac(header), Payload::Packet(Box::new(payload.clone()))));
                self.drain(ctx)
            }
            other => Err(unexpected(self.id, format!("{} on the transport port", other.kind()))),
        }
    }

    fn on_timer(&mut self, timer_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        if timer_id >= TIMER_RECEIVE_TIMEOUT_BASE {
            let generation = timer_id - TIMER_RECEIVE_TIMEOUT_BASE;
            if self.receive.as_ref().map(|r| r.generation) == Some(generation) {
                if let Some(pending) = self.receive.take() {
                    debug!(device = %self.name, "receive timed out");
                    pending.message.set_processed(ctx, None);
                }
            }
        } else if timer_id >= TIMER_GRANT_END_BASE {
            let generation = timer_id - TIMER_GRANT_END_BASE;
            if self.grant.map(|g| g.generation) == Some(generation) {
                debug!(device = %self.name, "grant expired");
                self.grant = None;
            }
        }
        Ok(())
    }
}

impl Entity for SimpleMac {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Notified(n) if n.tag == TAG_PHY => match &n.value {
                Signal::Packet(packet) => self.on_phy_packet(packet, ctx),
                _ => Ok(()),
            },
            EventPayload::Notified(n) if n.tag == TAG_UPPER => self.on_transport(&n.value, ctx),
            EventPayload::Processed { token: TOKEN_SEND, .. } => {
                self.sending = false;
                self.drain(ctx)
            }
            EventPayload::Timer { timer_id } => self.on_timer(*timer_id, ctx),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Resource manager side
// ============================================================================

struct Announcement {
    message: StackMessage,
    process: SubscriptionId,
    slots: u32,
}

/// Resource manager MAC of the contention-free protocol.
///
/// The `transport` port is queued and accepts [`Command::Assign`]. Each
/// assignment sends an announcement and completes `slots + 1` time slots
/// after the announcement left the air; the extra slot keeps consecutive
/// grants apart. The payload of every received packet is passed up,
/// whatever its destination.
pub struct SimpleRrmMac {
    id: EntityId,
    name: String,
    link: LinkSettings,
    ports: MacPorts,
    current: Option<Announcement>,
}

impl SimpleRrmMac {
    /// Create the layer and connect it to `phy_mac_port`.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: &str,
        phy_mac_port: &Port,
        link: LinkSettings,
    ) -> Result<Self, SimError> {
        let ports = MacPorts::new(ctx, id, device, "transport", phy_mac_port, ListenerMode::Queued)?;
        debug!(device, mac = %MacAddress::RESOURCE_MANAGER, "initialization completed");
        Ok(SimpleRrmMac {
            id,
            name: device.to_string(),
            link,
            ports,
            current: None,
        })
    }

    /// The resource manager address.
    pub fn addr(&self) -> MacAddress {
        MacAddress::RESOURCE_MANAGER
    }

    /// Port towards the transport layer.
    pub fn transport_port(&self) -> &Port {
        self.ports.upper()
    }

    fn on_assign(&mut self, notification: &Notification, ctx: &mut SimContext) -> Result<(), SimError> {
        let message = match &notification.value {
            Signal::Message(message) => message,
            other => return Err(unexpected(self.id, format!("{} on the transport port", other.kind()))),
        };
        let Command::Assign { dest, slots } = message.command else {
            return Err(unexpected(self.id, "command for a resource manager mac"));
        };
        let header = SimpleMacHeader {
            source: MacAddress::RESOURCE_MANAGER,
            dest,
            flag: FLAG_GRANT,
        };
        let announcement = Packet::new(Header::SimpleMac(header), Payload::Slots(slots));
        debug!(device = %self.name, announcement = %announcement, "sending new announcement");
        metrics::counter!(metric_defs::MAC_GRANTS.name, "node" => self.name.clone()).increment(1);
        ctx.record(SimRecord::SlotsAssigned {
            dest: dest.to_string(),
            slots,
        });
        self.ports
            .transmit(ctx, self.id, announcement, &self.link, TOKEN_ANNOUNCEMENT)?;
        self.current = Some(Announcement {
            message: message.clone(),
            process: notification.subscription,
            slots,
        });
        Ok(())
    }

    fn on_announced(&mut self, ctx: &mut SimContext) {
        if let Some(current) = &self.current {
            let window = TIME_SLOT_LENGTH.times(u64::from(current.slots) + 1);
            ctx.post_event(window, vec![self.id], EventPayload::Timer { timer_id: TIMER_GRANT_WINDOW });
        }
    }

    fn on_window_end(&mut self, ctx: &mut SimContext) {
        if let Some(current) = self.current.take() {
            current.message.set_processed(ctx, None);
            ctx.process_done(current.process);
        }
    }
}

impl Entity for SimpleRrmMac {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Notified(n) if n.tag == TAG_PHY => match &n.value {
                Signal::Packet(packet) => self.ports.deliver_up(ctx, Signal::Payload(packet.payload.clone())),
                _ => Ok(()),
            },
            EventPayload::ProcessStart(n) if n.tag == TAG_UPPER => self.on_assign(n, ctx),
            EventPayload::Processed {
                token: TOKEN_ANNOUNCEMENT,
                ..
            } => {
                self.on_announced(ctx);
                Ok(())
            }
            EventPayload::Timer {
                timer_id: TIMER_GRANT_WINDOW,
            } => {
                self.on_window_end(ctx);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, Seen};
    use ncsim_common::Kernel;
    use ncsim_packet::SimpleTransportHeader;

    struct Setup {
        kernel: Kernel,
        rrm_seen: Seen,
        receiver_seen: Seen,
    }

    fn transport_packet(source: MacAddress, dest: MacAddress, bytes: usize) -> Packet {
        Packet::new(
            Header::SimpleTransport(SimpleTransportHeader { source, dest }),
            Payload::Fake(bytes),
        )
    }

    /// An RRM, a sender with `packets` queued at t=0 and a receiver listening
    /// for one second. The RRM grants `slots` slots to the sender at t=1ms.
    fn setup(packets: usize, bytes: usize, slots: u32) -> Setup {
        let mut h = Harness::new();
        let link = LinkSettings::default();
        let rrm_phy = h.phy("rrm", 0.0);
        let rrm_id = h.next_id();
        let rrm = SimpleRrmMac::new(&mut h.ctx, rrm_id, "rrm", &rrm_phy, link).unwrap();

        let tx_addr = h.ctx.new_mac_address();
        let rx_addr = h.ctx.new_mac_address();
        let tx_phy = h.phy("tx", 1.0);
        let tx_id = h.next_id();
        let tx = SimpleMac::new(&mut h.ctx, tx_id, "tx", tx_addr, &tx_phy, link).unwrap();
        let rx_phy = h.phy("rx", 2.0);
        let rx_id = h.next_id();
        let rx = SimpleMac::new(&mut h.ctx, rx_id, "rx", rx_addr, &rx_phy, link).unwrap();

        let (rrm_upper, rrm_seen) = h.upper(
            rrm.transport_port(),
            vec![Command::Assign {
                dest: tx_addr,
                slots,
            }],
        );
        let (rx_upper, receiver_seen) = h.upper(
            rx.transport_port(),
            vec![Command::Receive {
                duration: SimTime::from_secs(1.0),
            }],
        );
        let tx_port = tx.transport_port().clone();
        h.register(Box::new(rrm));
        h.register(Box::new(tx));
        h.register(Box::new(rx));
        h.at(SimTime::ZERO, rx_upper, 0);
        h.at(SimTime::from_millis(1), rrm_upper, 0);

        let mut kernel = h.into_kernel();
        // queue the packets as if the transport layer had sent them
        let ctx = kernel.context_mut();
        let mut sender = ncsim_common::Module::new("transport", None);
        let out = sender.add_port(ctx, "mac").unwrap();
        ctx.connect(out.output, tx_port.input).unwrap();
        for _ in 0..packets {
            ctx.send(out.output, Signal::Packet(transport_packet(tx_addr, rx_addr, bytes)))
                .unwrap();
        }
        Setup {
            kernel,
            rrm_seen,
            receiver_seen,
        }
    }

    fn delivered(seen: &Seen) -> usize {
        seen.lock()
            .iter()
            .filter(|(_, s)| matches!(s, Signal::Payload(Payload::Packet(_))))
            .count()
    }

    #[test]
    fn test_granted_device_sends_and_receiver_completes_once() {
        // 20 kB/s: a 100 byte packet (plus 13 byte header) needs ~9 ms
        let mut setup = setup(3, 100, 50_000);
        setup.kernel.run_until(SimTime::from_secs(2.0));
        // the receive command completes with the first packet only
        assert_eq!(delivered(&setup.receiver_seen), 1);
        // the resource manager sees every packet on the air
        assert_eq!(delivered(&setup.rrm_seen), 3);
    }

    #[test]
    fn test_packet_too_large_for_grant_is_kept() {
        // 1 ms grant, 9 ms packet
        let mut setup = setup(1, 100, 1_000);
        setup.kernel.run_until(SimTime::from_secs(2.0));
        assert_eq!(delivered(&setup.rrm_seen), 0);
        assert_eq!(delivered(&setup.receiver_seen), 0);
    }

    #[test]
    fn test_assign_completes_after_window() {
        let mut h = Harness::new();
        let phy = h.phy("rrm", 0.0);
        let id = h.next_id();
        let rrm = SimpleRrmMac::new(&mut h.ctx, id, "rrm", &phy, LinkSettings::default()).unwrap();
        let dest = h.ctx.new_mac_address();
        let (upper, _) = h.upper(
            rrm.transport_port(),
            vec![Command::Assign { dest, slots: 10 }, Command::Assign { dest, slots: 10 }],
        );
        h.register(Box::new(rrm));
        h.at(SimTime::ZERO, upper, 0);
        h.at(SimTime::ZERO, upper, 1);
        let mut kernel = h.into_kernel();
        kernel.run();
        let starts: Vec<u64> = kernel
            .context_mut()
            .take_records()
            .into_iter()
            .filter(|r| matches!(r.record, SimRecord::TransmissionStarted { .. }))
            .map(|r| r.time.as_micros())
            .collect();
        // 13 byte header + 2 byte payload: 1200 µs on the air, plus 11 slots
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1] - starts[0], 1_200 + 11 + 1);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut h = Harness::new();
        let phy = h.phy("tx", 0.0);
        let id = h.next_id();
        let addr = h.ctx.new_mac_address();
        let mut mac = SimpleMac::new(&mut h.ctx, id, "tx", addr, &phy, LinkSettings::default()).unwrap();
        for _ in 0..SIMPLE_MAC_QUEUE_LIMIT + 5 {
            let packet = transport_packet(addr, MacAddress::from_counter(9), 10);
            mac.on_transport(&Signal::Packet(packet), &mut h.ctx).unwrap();
        }
        assert_eq!(mac.queued(), SIMPLE_MAC_QUEUE_LIMIT);
    }
}
