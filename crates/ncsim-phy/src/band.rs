//! The shared medium.

use crate::attenuation::{AttenuationKind, AttenuationModel, BandSpec};
use crate::PhyError;
use ncsim_common::journal::SimRecord;
use ncsim_common::metric_defs;
use ncsim_common::notifier::NotifierId;
use ncsim_common::{Device, Mcs, Packet, SimContext, SimError, SimTime, Signal, Transmission};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A band shared by every physical layer of a simulation.
pub type SharedBand = Arc<FrequencyBand>;

/// How long a finished transmission stays queryable by default.
pub const DEFAULT_HISTORY: SimTime = SimTime::from_millis(1000);

struct ReachNotifier {
    receiver: Device,
    radius: f64,
    notifier: NotifierId,
}

#[derive(Default)]
struct BandState {
    models: BTreeMap<(u64, u64), Arc<AttenuationModel>>,
    transmissions: Vec<Arc<Transmission>>,
    reach: BTreeMap<(u64, u64), ReachNotifier>,
    next_transmission_id: u64,
}

/// A frequency band: the transmissions sent on it and the attenuation
/// models between every pair of devices using it.
///
/// Attenuation models are created on first request and kept for the whole
/// run. The model for `(a, b)` is the same instance as the one for `(b, a)`.
/// Transmissions that ended more than the history window ago are dropped
/// when the next one starts.
pub struct FrequencyBand {
    spec: BandSpec,
    kinds: Vec<AttenuationKind>,
    history: SimTime,
    new_transmission: NotifierId,
    state: Mutex<BandState>,
}

impl FrequencyBand {
    /// Create a band whose attenuation models combine `kinds`.
    pub fn new(ctx: &mut SimContext, spec: BandSpec, kinds: Vec<AttenuationKind>) -> Result<Self, PhyError> {
        if kinds.is_empty() {
            return Err(PhyError::EmptyModelList);
        }
        Ok(FrequencyBand {
            spec,
            kinds,
            history: DEFAULT_HISTORY,
            new_transmission: ctx.create_notifier("band.new_transmission", None),
            state: Mutex::new(BandState::default()),
        })
    }

    /// Keep finished transmissions for `history` instead of [`DEFAULT_HISTORY`].
    pub fn with_history(mut self, history: SimTime) -> Self {
        self.history = history;
        self
    }

    /// Number of transmissions currently kept.
    pub fn stored_transmissions(&self) -> usize {
        self.state.lock().transmissions.len()
    }

    /// Frequency and bandwidth.
    pub fn spec(&self) -> &BandSpec {
        &self.spec
    }

    /// Notifier triggered with [`Signal::Transmission`] whenever a
    /// transmission starts.
    pub fn new_transmission(&self) -> NotifierId {
        self.new_transmission
    }

    /// The attenuation model between `a` and `b`.
    pub fn attenuation_model(
        &self,
        ctx: &mut SimContext,
        a: &Device,
        b: &Device,
    ) -> Result<Arc<AttenuationModel>, PhyError> {
        let key = (a.key.min(b.key), a.key.max(b.key));
        let mut state = self.state.lock();
        if let Some(model) = state.models.get(&key) {
            return Ok(model.clone());
        }
        let model = AttenuationModel::create(ctx, &self.spec, &self.kinds, a, b)?;
        state.models.insert(key, model.clone());
        Ok(model)
    }

    /// Number of attenuation models created so far.
    pub fn model_count(&self) -> usize {
        self.state.lock().models.len()
    }

    /// Put `packet` on the air now.
    pub fn transmit(
        &self,
        ctx: &mut SimContext,
        sender: &Device,
        power_dbm: f64,
        packet: Packet,
        mcs_header: Mcs,
        mcs_payload: Mcs,
    ) -> Result<Arc<Transmission>, SimError> {
        let (transmission, reached) = {
            let mut state = self.state.lock();
            let horizon = ctx.time().sub(self.history).unwrap_or(SimTime::ZERO);
            state.transmissions.retain(|t| t.stop >= horizon);
            let id = state.next_transmission_id;
            state.next_transmission_id += 1;
            let t = Arc::new(Transmission::new(
                id,
                sender.clone(),
                power_dbm,
                packet,
                mcs_header,
                mcs_payload,
                ctx.time(),
            ));
            state.transmissions.push(t.clone());
            let reached: Vec<NotifierId> = state
                .reach
                .values()
                .filter(|r| r.receiver.distance_to(sender) <= r.radius)
                .map(|r| r.notifier)
                .collect();
            (t, reached)
        };

        debug!(transmission = %transmission, "added to band");
        metrics::counter!(metric_defs::PHY_TX_FRAMES.name, "node" => sender.name.clone()).increment(1);
        ctx.record(SimRecord::TransmissionStarted {
            id: transmission.id,
            sender: sender.name.clone(),
            bytes: transmission.packet.byte_size(),
            power_dbm,
            stop_us: transmission.stop.as_micros(),
        });

        ctx.trigger(self.new_transmission, Signal::Transmission(transmission.clone()))?;
        for notifier in reached {
            ctx.trigger(notifier, Signal::Transmission(transmission.clone()))?;
        }
        Ok(transmission)
    }

    /// Every transmission overlapping `[from, to]`, as far back as the
    /// history window reaches.
    pub fn transmissions_between(&self, from: SimTime, to: SimTime) -> Vec<Arc<Transmission>> {
        self.state
            .lock()
            .transmissions
            .iter()
            .filter(|t| {
                let (a, b) = (t.start, t.stop);
                (a <= from && from <= to && to <= b) || (from <= a && a <= to) || (from <= b && b <= to)
            })
            .cloned()
            .collect()
    }

    /// Transmissions active at `now`.
    pub fn active_transmissions(&self, now: SimTime) -> Vec<Arc<Transmission>> {
        self.state
            .lock()
            .transmissions
            .iter()
            .filter(|t| t.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Transmissions active at `now` whose sender lies within `radius`
    /// metres of `receiver`.
    pub fn active_transmissions_in_reach(&self, now: SimTime, receiver: &Device, radius: f64) -> Vec<Arc<Transmission>> {
        self.active_transmissions(now)
            .into_iter()
            .filter(|t| t.sender.distance_to(receiver) <= radius)
            .collect()
    }

    /// Notifier triggered whenever a transmission starts whose sender lies
    /// within `radius` metres of `receiver`. Repeated calls with the same
    /// arguments return the same notifier.
    pub fn new_transmission_in_reach(&self, ctx: &mut SimContext, receiver: &Device, radius: f64) -> NotifierId {
        let key = (receiver.key, radius.to_bits());
        let mut state = self.state.lock();
        if let Some(reach) = state.reach.get(&key) {
            return reach.notifier;
        }
        let notifier = ctx.create_notifier(
            format!("band.new_transmission_within_{}m_of_{}", radius, receiver.name),
            None,
        );
        state.reach.insert(
            key,
            ReachNotifier {
                receiver: receiver.clone(),
                radius,
                notifier,
            },
        );
        notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ncsim_packet::{Header, Payload};

    fn band(ctx: &mut SimContext) -> FrequencyBand {
        FrequencyBand::new(ctx, BandSpec::default(), vec![AttenuationKind::Fspl]).unwrap()
    }

    fn packet() -> Packet {
        Packet::new(Header::Fake(10), Payload::Fake(115))
    }

    #[test]
    fn test_empty_model_list_rejected() {
        let mut ctx = SimContext::new(0);
        assert!(matches!(
            FrequencyBand::new(&mut ctx, BandSpec::default(), vec![]),
            Err(PhyError::EmptyModelList)
        ));
    }

    #[test]
    fn test_attenuation_model_is_symmetric_and_cached() {
        let mut ctx = SimContext::new(0);
        let band = band(&mut ctx);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let b = Device::new(&mut ctx, "b", 3.0, 4.0);
        let ab = band.attenuation_model(&mut ctx, &a, &b).unwrap();
        for _ in 0..5 {
            let ba = band.attenuation_model(&mut ctx, &b, &a).unwrap();
            assert!(Arc::ptr_eq(&ab, &ba));
        }
        assert_eq!(band.model_count(), 1);
        assert!(band.attenuation_model(&mut ctx, &a, &a).is_err());
    }

    #[test]
    fn test_transmit_and_activity() {
        let mut ctx = SimContext::new(0);
        let band = band(&mut ctx);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        ctx.set_time(SimTime::from_micros(100));
        // 125 bytes at 100 kbit/s: 10 ms
        let t = band.transmit(&mut ctx, &a, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        assert_eq!(t.stop.as_micros(), 10_100);
        assert_eq!(ctx.trigger_count(band.new_transmission()), 1);

        assert_eq!(band.active_transmissions(SimTime::from_micros(5_000)).len(), 1);
        assert_eq!(band.active_transmissions(SimTime::from_micros(10_100)).len(), 1);
        assert!(band.active_transmissions(SimTime::from_micros(10_101)).is_empty());

        assert_eq!(band.transmissions_between(SimTime::ZERO, SimTime::from_micros(100)).len(), 1);
        assert_eq!(band.transmissions_between(SimTime::from_micros(200), SimTime::from_micros(300)).len(), 1);
        assert!(band.transmissions_between(SimTime::from_micros(10_200), SimTime::from_micros(20_000)).is_empty());
    }

    #[test]
    fn test_finished_transmissions_are_pruned() {
        let mut ctx = SimContext::new(0);
        let band = band(&mut ctx).with_history(SimTime::from_millis(50));
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        // each lasts 10 ms
        for start_ms in [0, 20, 40] {
            ctx.set_time(SimTime::from_millis(start_ms));
            band.transmit(&mut ctx, &a, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        }
        assert_eq!(band.stored_transmissions(), 3);

        // first ended at 10 ms, second at 30 ms
        ctx.set_time(SimTime::from_millis(70));
        band.transmit(&mut ctx, &a, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        assert_eq!(band.stored_transmissions(), 3);
        assert!(band.transmissions_between(SimTime::ZERO, SimTime::from_millis(15)).is_empty());
        assert_eq!(band.transmissions_between(SimTime::from_millis(25), SimTime::from_millis(75)).len(), 3);

        ctx.set_time(SimTime::from_millis(500));
        band.transmit(&mut ctx, &a, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        assert_eq!(band.stored_transmissions(), 1);
    }

    #[test]
    fn test_reach_notifiers() {
        let mut ctx = SimContext::new(0);
        let band = band(&mut ctx);
        let near = Device::new(&mut ctx, "near", 0.0, 0.0);
        let far = Device::new(&mut ctx, "far", 100.0, 0.0);
        let receiver = Device::new(&mut ctx, "rx", 5.0, 0.0);
        let reach = band.new_transmission_in_reach(&mut ctx, &receiver, 10.0);
        assert_eq!(band.new_transmission_in_reach(&mut ctx, &receiver, 10.0), reach);

        band.transmit(&mut ctx, &near, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        band.transmit(&mut ctx, &far, 0.0, packet(), Mcs::default(), Mcs::default()).unwrap();
        assert_eq!(ctx.trigger_count(band.new_transmission()), 2);
        assert_eq!(ctx.trigger_count(reach), 1);
        assert_eq!(band.active_transmissions_in_reach(ctx.time(), &receiver, 10.0).len(), 1);
    }
}
