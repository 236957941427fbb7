//! Sensors sampling a source and handing the value to their MAC.

use crate::{mac_link, Assembly, DeviceIds};
use ncsim_common::{
    Command, Entity, EntityId, Event, EventPayload, MacAddress, Port, ProtocolType, SimContext, SimError, SimTime,
    Signal, StackMessage,
};
use ncsim_mac::{MacConfig, SensorMacCsma, SensorMacTdma};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, NormalError};
use tracing::{debug, trace};

const TIMER_SAMPLE: u64 = 1;

/// What a sensor observes.
#[derive(Debug, Clone)]
pub enum SensorSource {
    /// Always the same value.
    Constant(f64),
    /// A Gaussian random walk.
    RandomWalk {
        /// Current value.
        value: f64,
        /// Step distribution.
        step: Normal<f64>,
        /// Generator for the steps.
        rng: ChaCha8Rng,
    },
}

impl SensorSource {
    /// A random walk starting at `initial` whose steps have standard
    /// deviation `step_std_dev`, which must be finite and not negative.
    pub fn random_walk(initial: f64, step_std_dev: f64, seed: u64) -> Result<Self, NormalError> {
        if !(step_std_dev >= 0.0 && step_std_dev.is_finite()) {
            return Err(NormalError::BadVariance);
        }
        Ok(SensorSource::RandomWalk {
            value: initial,
            step: Normal::new(0.0, step_std_dev)?,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Advance the source and return the new value.
    pub fn sample(&mut self) -> f64 {
        match self {
            SensorSource::Constant(value) => *value,
            SensorSource::RandomWalk { value, step, rng } => {
                *value += step.sample(rng);
                *value
            }
        }
    }
}

/// Everything needed to add a sensor.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Device name.
    pub name: String,
    /// Position.
    pub x: f64,
    /// Position.
    pub y: f64,
    /// MAC parameters; the protocol selects the MAC layer.
    pub mac: MacConfig,
    /// Observed source.
    pub source: SensorSource,
    /// Time between two samples.
    pub sample_interval: SimTime,
    /// Seed of the CSMA send decisions.
    pub seed: u64,
}

/// Samples its source every `sample_interval` and passes the value to its
/// MAC, which keeps the latest one for the next slot.
pub struct SimpleSensor {
    id: EntityId,
    name: String,
    port: Port,
    source: SensorSource,
    interval: SimTime,
    samples: u64,
}

impl SimpleSensor {
    /// Add a sensor with its phy and MAC to `asm`. Returns the entity ids and
    /// the sensor's address.
    pub fn build(asm: &mut Assembly, config: SensorConfig) -> Result<(DeviceIds, MacAddress), SimError> {
        let ids = asm.device_ids();
        let (_, phy_port) = asm.add_phy(ids.phy, &config.name, config.x, config.y)?;
        let addr = asm.ctx().new_mac_address();
        let network = match config.mac.protocol {
            ProtocolType::Tdma => {
                let mac = SensorMacTdma::new(asm.ctx(), ids.mac, &config.name, addr, &phy_port, config.mac)?;
                let port = mac.network_port().clone();
                asm.register(Box::new(mac));
                port
            }
            ProtocolType::Csma => {
                let mac = SensorMacCsma::new(asm.ctx(), ids.mac, &config.name, addr, &phy_port, config.mac, config.seed)?;
                let port = mac.network_port().clone();
                asm.register(Box::new(mac));
                port
            }
        };
        let port = mac_link(asm.ctx(), ids.device, &config.name, &network)?;
        asm.ctx()
            .post_at(SimTime::ZERO, vec![ids.device], EventPayload::Timer { timer_id: TIMER_SAMPLE });
        debug!(device = %config.name, mac = %addr, protocol = ?config.mac.protocol, "sensor initialized");
        asm.register(Box::new(SimpleSensor {
            id: ids.device,
            name: config.name,
            port,
            source: config.source,
            interval: config.sample_interval,
            samples: 0,
        }));
        Ok((ids, addr))
    }

    /// Samples taken so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn sample(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let state = self.source.sample();
        self.samples += 1;
        trace!(device = %self.name, state, "state sampled");
        let message = StackMessage::new(Command::SensorData { state });
        ctx.send(self.port.output, Signal::Message(message))?;
        ctx.post_event(self.interval, vec![self.id], EventPayload::Timer { timer_id: TIMER_SAMPLE });
        Ok(())
    }
}

impl Entity for SimpleSensor {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id: TIMER_SAMPLE } => self.sample(ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_source() {
        let mut source = SensorSource::Constant(2.5);
        assert_eq!(source.sample(), 2.5);
        assert_eq!(source.sample(), 2.5);
    }

    #[test]
    fn test_random_walk_is_reproducible() {
        let mut a = SensorSource::random_walk(1.0, 0.1, 9).unwrap();
        let mut b = SensorSource::random_walk(1.0, 0.1, 9).unwrap();
        let first = a.sample();
        assert_eq!(first, b.sample());
        assert_ne!(first, 1.0);
        for _ in 0..10 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_random_walk_rejects_bad_deviation() {
        for std_dev in [-1.0, -f64::MIN_POSITIVE, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                SensorSource::random_walk(0.0, std_dev, 0),
                Err(NormalError::BadVariance)
            ));
        }
        let mut flat = SensorSource::random_walk(3.0, 0.0, 0).unwrap();
        assert_eq!(flat.sample(), 3.0);
    }
}
