//! The physical layer.
//!
//! [`SimplePhy`] does not model propagation delays. Its `mac` port accepts
//! [`Command::Transmit`] messages, one at a time: the frame starts at the
//! next time slot boundary and the message completes once it is on the air
//! no more.
//!
//! On the receive side every transmission on the band adds to the received
//! power. For each frame sensed while not transmitting, the bit error rate
//! is recomputed on every change of the received power, and bit errors are
//! accumulated piecewise as `ber * elapsed * bit_rate`, using the header
//! bit rate during the header and the payload bit rate afterwards. The sum
//! is rounded once when the frame completes. Frames whose bit error rate
//! exceeds the maximum correctable rate of their scheme are dropped; all
//! others leave through the `mac` port.

use crate::band::SharedBand;
use ncsim_common::journal::SimRecord;
use ncsim_common::metric_defs;
use ncsim_common::radio::{dbm_to_mw, mw_to_dbm, thermal_noise_mw, DEFAULT_TEMPERATURE_C};
use ncsim_common::{
    Command, Device, Entity, EntityId, Event, EventPayload, ListenerMode, Mcs, Module, Notification, Port,
    SimContext, SimError, SimTime, Signal, StackMessage, SubscriptionId, Transmission,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Length of one time slot of the slotted physical clock.
pub const TIME_SLOT_LENGTH: SimTime = SimTime::from_micros(1);

const TAG_MAC_PORT: u64 = 1;
const TAG_NEW_TRANSMISSION: u64 = 2;
const TAG_ATTENUATION_BASE: u64 = 0x1_0000_0000; // transmission id is added to this

const TIMER_SLOT_BOUNDARY: u64 = 1;
const TIMER_SEND_COMPLETE: u64 = 2;
const TIMER_HEADER_COMPLETE_BASE: u64 = 0x1_0000_0000; // transmission id is added to this
const TIMER_FRAME_COMPLETE_BASE: u64 = 0x2_0000_0000; // transmission id is added to this

/// Physical layer parameters.
#[derive(Debug, Clone)]
pub struct PhyConfig {
    /// Slot length frames are aligned to.
    pub time_slot: SimTime,
    /// Receiver temperature in °C, for the thermal noise.
    pub temperature_c: f64,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            time_slot: TIME_SLOT_LENGTH,
            temperature_c: DEFAULT_TEMPERATURE_C,
        }
    }
}

/// Bit error bookkeeping for a frame being received.
#[derive(Debug, Clone)]
struct Reception {
    mcs: Mcs,
    ber: f64,
    bit_errors: f64,
    last_change: SimTime,
}

impl Reception {
    fn accumulate(&mut self, now: SimTime) {
        let elapsed = (now - self.last_change).as_secs_f64();
        self.bit_errors += self.ber * elapsed * self.mcs.bit_rate;
        self.last_change = now;
    }
}

/// A transmission of another device currently on the air.
struct Sensed {
    transmission: Arc<Transmission>,
    received_mw: f64,
    attenuation_subscription: SubscriptionId,
    reception: Option<Reception>,
}

struct PendingSend {
    message: StackMessage,
    process: SubscriptionId,
}

/// Physical layer entity of a device.
pub struct SimplePhy {
    id: EntityId,
    device: Device,
    band: SharedBand,
    config: PhyConfig,
    module: Module,
    mac_port: Port,

    // Sending
    transmitting: bool,
    current_transmission: Option<u64>,
    pending: Option<PendingSend>,

    // Receiving
    thermal_noise_mw: f64,
    received_power_mw: f64,
    sensed: BTreeMap<u64, Sensed>,
}

impl SimplePhy {
    /// Create the layer and subscribe it to the band.
    pub fn new(
        ctx: &mut SimContext,
        id: EntityId,
        device: Device,
        band: SharedBand,
        config: PhyConfig,
    ) -> Result<Self, SimError> {
        let mut module = Module::new(format!("{}.phy", device.name), Some(id));
        let mac_port = module.add_port(ctx, "mac")?;
        ctx.listen(&mac_port, ListenerMode::Queued, id, TAG_MAC_PORT)?;
        ctx.subscribe_entity(band.new_transmission(), 0, id, TAG_NEW_TRANSMISSION)?;

        let thermal_noise_mw = thermal_noise_mw(band.spec().bandwidth, config.temperature_c);
        info!(
            device = %device.name,
            noise_dbm = mw_to_dbm(thermal_noise_mw),
            "initialized phy"
        );
        Ok(SimplePhy {
            id,
            device,
            band,
            config,
            module,
            mac_port,
            transmitting: false,
            current_transmission: None,
            pending: None,
            thermal_noise_mw,
            received_power_mw: thermal_noise_mw,
            sensed: BTreeMap::new(),
        })
    }

    /// The port to connect the MAC layer to.
    pub fn mac_port(&self) -> &Port {
        &self.mac_port
    }

    /// The module holding the layer's ports.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The device the layer belongs to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether a frame of this layer is on the air.
    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Thermal noise plus the power of every sensed transmission, in mW.
    pub fn received_power_mw(&self) -> f64 {
        self.received_power_mw
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn handle_mac_command(&mut self, notification: &Notification, ctx: &mut SimContext) -> Result<(), SimError> {
        let message = match &notification.value {
            Signal::Message(message) if matches!(message.command, Command::Transmit { .. }) => message.clone(),
            other => {
                return Err(SimError::protocol(
                    self.id,
                    format!("phy accepts transmit commands only, got {}", other.kind()),
                ))
            }
        };
        debug!(device = %self.device.name, "received transmit command");
        self.pending = Some(PendingSend {
            message,
            process: notification.subscription,
        });
        ctx.post_event(
            ctx.next_time_slot(self.config.time_slot),
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_SLOT_BOUNDARY,
            },
        );
        Ok(())
    }

    fn start_transmission(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(pending) = &self.pending else {
            return Ok(());
        };
        let Command::Transmit {
            packet,
            power_dbm,
            mcs,
        } = &pending.message.command
        else {
            return Ok(());
        };
        self.transmitting = true;
        let t = self
            .band
            .transmit(ctx, &self.device, *power_dbm, packet.clone(), *mcs, *mcs)?;
        self.current_transmission = Some(t.id);
        ctx.post_at(
            t.stop,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_SEND_COMPLETE,
            },
        );
        Ok(())
    }

    fn finish_transmission(&mut self, ctx: &mut SimContext) {
        self.transmitting = false;
        self.current_transmission = None;
        if let Some(pending) = self.pending.take() {
            pending.message.set_processed(ctx, None);
            ctx.process_done(pending.process);
        }
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    fn update_ber(&self, sensed: &Sensed) -> Option<f64> {
        let reception = sensed.reception.as_ref()?;
        let signal = sensed.received_mw;
        let noise = (self.received_power_mw - signal).max(f64::MIN_POSITIVE);
        Some(
            reception
                .mcs
                .bit_error_rate(mw_to_dbm(signal), mw_to_dbm(noise), reception.mcs.bit_rate),
        )
    }

    fn refresh_ber(&mut self, id: u64) {
        let ber = self.sensed.get(&id).and_then(|s| self.update_ber(s));
        if let (Some(ber), Some(reception)) = (ber, self.sensed.get_mut(&id).and_then(|s| s.reception.as_mut())) {
            reception.ber = ber;
        }
    }

    /// Apply a change of the received power: close the current error
    /// accumulation interval of every reception, then recompute their rates.
    fn change_received_power(&mut self, now: SimTime, delta_mw: f64) {
        if delta_mw == 0.0 {
            return;
        }
        for sensed in self.sensed.values_mut() {
            if let Some(reception) = sensed.reception.as_mut() {
                reception.accumulate(now);
            }
        }
        self.received_power_mw += delta_mw;
        debug!(
            device = %self.device.name,
            delta_mw,
            total_mw = self.received_power_mw,
            "received power changed"
        );
        let ids: Vec<u64> = self.sensed.keys().copied().collect();
        for id in ids {
            self.refresh_ber(id);
        }
    }

    fn on_new_transmission(&mut self, t: &Arc<Transmission>, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.current_transmission == Some(t.id) || t.sender.key == self.device.key {
            return Ok(());
        }
        let model = self
            .band
            .attenuation_model(ctx, &self.device, &t.sender)
            .map_err(|e| e.into_sim_error(self.id))?;
        let received_mw = dbm_to_mw(t.power_dbm - model.attenuation());
        let attenuation_subscription =
            ctx.subscribe_entity(model.changes(), 0, self.id, TAG_ATTENUATION_BASE + t.id)?;
        debug!(device = %self.device.name, transmission = %t, received_mw, "transmission sensed");

        self.sensed.insert(
            t.id,
            Sensed {
                transmission: t.clone(),
                received_mw,
                attenuation_subscription,
                reception: None,
            },
        );
        self.change_received_power(ctx.time(), received_mw);
        ctx.post_at(
            t.stop,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_FRAME_COMPLETE_BASE + t.id,
            },
        );

        if !self.transmitting {
            info!(device = %self.device.name, transmission = t.id, "receiving");
            if let Some(sensed) = self.sensed.get_mut(&t.id) {
                sensed.reception = Some(Reception {
                    mcs: t.mcs_header,
                    ber: 0.0,
                    bit_errors: 0.0,
                    last_change: ctx.time(),
                });
            }
            self.refresh_ber(t.id);
            ctx.post_at(
                t.header_stop(),
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_HEADER_COMPLETE_BASE + t.id,
                },
            );
        }
        Ok(())
    }

    fn on_attenuation_change(&mut self, id: u64, attenuation: f64, now: SimTime) {
        let Some(sensed) = self.sensed.get_mut(&id) else {
            return;
        };
        let received_mw = dbm_to_mw(sensed.transmission.power_dbm - attenuation);
        let delta = received_mw - sensed.received_mw;
        sensed.received_mw = received_mw;
        debug!(device = %self.device.name, transmission = id, attenuation, "attenuation to sender changed");
        self.change_received_power(now, delta);
    }

    fn on_header_complete(&mut self, id: u64, now: SimTime) {
        let Some(sensed) = self.sensed.get_mut(&id) else {
            return;
        };
        let payload_mcs = sensed.transmission.mcs_payload;
        if let Some(reception) = sensed.reception.as_mut() {
            reception.accumulate(now);
            reception.mcs = payload_mcs;
        }
        self.refresh_ber(id);
    }

    fn on_frame_complete(&mut self, id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(received_mw) = self.sensed.get(&id).map(|s| s.received_mw) else {
            return Ok(());
        };
        self.change_received_power(ctx.time(), -received_mw);
        let Some(sensed) = self.sensed.remove(&id) else {
            return Ok(());
        };
        ctx.unsubscribe(sensed.attenuation_subscription);

        let Some(mut reception) = sensed.reception else {
            return Ok(());
        };
        reception.accumulate(ctx.time());
        let t = sensed.transmission;
        let bit_errors = reception.bit_errors.round() as u64;
        let ber = bit_errors as f64 / t.bit_size() as f64;
        let max_ber = t.mcs_payload.max_correctable_ber();
        let node = self.device.name.clone();

        if ber > max_ber {
            info!(
                device = %node,
                ber = format!("{:.3}%", ber * 100.0),
                max_ber = format!("{:.3}%", max_ber * 100.0),
                "packet received with uncorrectable errors"
            );
            metrics::counter!(metric_defs::PHY_RX_DROPPED.name, "node" => node.clone()).increment(1);
            ctx.record(SimRecord::FrameDropped {
                id,
                receiver: node,
                bit_errors,
                ber,
                max_ber,
            });
        } else {
            info!(device = %node, ber = format!("{:.3}%", ber * 100.0), "packet successfully received");
            metrics::counter!(metric_defs::PHY_RX_DELIVERED.name, "node" => node.clone()).increment(1);
            ctx.record(SimRecord::FrameDelivered {
                id,
                receiver: node,
                bit_errors,
                ber,
            });
            ctx.send(self.mac_port.output, Signal::Packet(t.packet.clone()))?;
        }
        Ok(())
    }
}

impl Entity for SimplePhy {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ProcessStart(n) if n.tag == TAG_MAC_PORT => self.handle_mac_command(n, ctx),
            EventPayload::Notified(n) if n.tag == TAG_NEW_TRANSMISSION => match &n.value {
                Signal::Transmission(t) => self.on_new_transmission(t, ctx),
                _ => Ok(()),
            },
            EventPayload::Notified(n) if n.tag >= TAG_ATTENUATION_BASE => {
                if let Signal::Attenuation(value) = &n.value {
                    self.on_attenuation_change(n.tag - TAG_ATTENUATION_BASE, *value, ctx.time());
                }
                Ok(())
            }
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_SLOT_BOUNDARY => self.start_transmission(ctx),
                TIMER_SEND_COMPLETE => {
                    self.finish_transmission(ctx);
                    Ok(())
                }
                id if id >= TIMER_FRAME_COMPLETE_BASE => self.on_frame_complete(id - TIMER_FRAME_COMPLETE_BASE, ctx),
                id if id >= TIMER_HEADER_COMPLETE_BASE => {
                    self.on_header_complete(id - TIMER_HEADER_COMPLETE_BASE, ctx.time());
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attenuation::{fspl, AttenuationKind, BandSpec};
    use crate::band::FrequencyBand;
    use ncsim_common::radio::CodeRate;
    use ncsim_common::{EntityRegistry, Kernel, Packet};
    use ncsim_packet::{Header, Payload};
    use parking_lot::Mutex;

    /// Collects every packet leaving a phy.
    struct Sink {
        id: EntityId,
        packets: Arc<Mutex<Vec<Packet>>>,
    }

    impl Entity for Sink {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
            if let EventPayload::Notified(n) = &event.payload {
                if let Signal::Packet(p) = &n.value {
                    self.packets.lock().push(p.clone());
                }
            }
            Ok(())
        }
    }

    struct Setup {
        kernel: Kernel,
        sender_port: Port,
        received: Arc<Mutex<Vec<Packet>>>,
    }

    fn setup(distance: f64) -> Setup {
        let mut ctx = SimContext::new(0);
        ctx.enable_journal();
        let band = Arc::new(FrequencyBand::new(&mut ctx, BandSpec::default(), vec![AttenuationKind::Fspl]).unwrap());
        let tx_device = Device::new(&mut ctx, "tx", 0.0, 0.0);
        let rx_device = Device::new(&mut ctx, "rx", distance, 0.0);
        let tx = SimplePhy::new(&mut ctx, EntityId(1), tx_device, band.clone(), PhyConfig::default()).unwrap();
        let rx = SimplePhy::new(&mut ctx, EntityId(2), rx_device, band, PhyConfig::default()).unwrap();

        let mut sink_module = Module::new("sink", Some(EntityId(3)));
        let sink_port = sink_module.add_port(&mut ctx, "phy").unwrap();
        ctx.bi_connect(&sink_port, rx.mac_port()).unwrap();
        ctx.listen(&sink_port, ListenerMode::Immediate, EntityId(3), 0).unwrap();

        let mut sender_module = Module::new("sender", Some(EntityId(4)));
        let sender_port = sender_module.add_port(&mut ctx, "phy").unwrap();
        ctx.bi_connect(&sender_port, tx.mac_port()).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let mut entities = EntityRegistry::new();
        entities.register(Box::new(tx));
        entities.register(Box::new(rx));
        entities.register(Box::new(Sink {
            id: EntityId(3),
            packets: received.clone(),
        }));
        Setup {
            kernel: Kernel::new(ctx, entities),
            sender_port,
            received,
        }
    }

    fn send(setup: &mut Setup, mcs: Mcs) {
        let command = Command::Transmit {
            packet: Packet::new(Header::Fake(10), Payload::Fake(115)),
            power_dbm: 0.0,
            mcs,
        };
        let port = setup.sender_port.output;
        setup
            .kernel
            .context_mut()
            .send(port, Signal::Message(StackMessage::new(command)))
            .unwrap();
    }

    fn frame_records(kernel: &mut Kernel) -> Vec<SimRecord> {
        kernel
            .context_mut()
            .take_records()
            .into_iter()
            .map(|r| r.record)
            .filter(|r| matches!(r, SimRecord::FrameDelivered { .. } | SimRecord::FrameDropped { .. }))
            .collect()
    }

    #[test]
    fn test_strong_frame_delivered_once() {
        let mut setup = setup(1.0);
        send(&mut setup, Mcs::default());
        setup.kernel.run();
        assert_eq!(setup.received.lock().len(), 1);
        let records = frame_records(&mut setup.kernel);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], SimRecord::FrameDelivered { bit_errors: 0, .. }));
        // slot aligned start plus 10 ms on the air
        assert_eq!(setup.kernel.time().as_micros(), 10_001);
    }

    #[test]
    fn test_weak_frame_dropped() {
        let mut setup = setup(1000.0);
        let mcs = Mcs::bpsk(CodeRate::new(99, 100).unwrap(), 100e3);
        send(&mut setup, mcs);
        setup.kernel.run();
        assert!(setup.received.lock().is_empty());
        let records = frame_records(&mut setup.kernel);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], SimRecord::FrameDropped { .. }));
    }

    #[test]
    fn test_bit_errors_match_constant_snr() {
        let mut setup = setup(3.0);
        let mcs = Mcs::default();
        send(&mut setup, mcs);
        setup.kernel.run();

        let noise = thermal_noise_mw(BandSpec::default().bandwidth, DEFAULT_TEMPERATURE_C);
        let signal = dbm_to_mw(-fspl(3.0, BandSpec::default().frequency));
        let ber = mcs.bit_error_rate(mw_to_dbm(signal), mw_to_dbm(noise), mcs.bit_rate);
        let expected = ber * 1000.0;
        assert!(expected > 5.0, "expected a noticeable error count, got {}", expected);

        let records = frame_records(&mut setup.kernel);
        let SimRecord::FrameDelivered { bit_errors, .. } = records[0] else {
            panic!("frame not delivered: {:?}", records);
        };
        assert!((bit_errors as f64 - expected).abs() <= 1.0);
    }

    #[test]
    fn test_sender_does_not_receive_itself() {
        let mut setup = setup(1.0);
        send(&mut setup, Mcs::default());
        setup.kernel.run();
        let records = frame_records(&mut setup.kernel);
        assert!(records.iter().all(|r| matches!(r, SimRecord::FrameDelivered { receiver, .. } if receiver == "rx")));
    }
}
