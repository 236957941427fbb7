//! Random schedulers, mostly as baselines.

use crate::{assign_flags, Scheduler, SchedulerDevices, SchedulerError};
use ncsim_packet::{CsmaSchedule, MacAddress, ProtocolType, Schedule, TdmaSchedule};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Draws the owner of every slot uniformly from all devices.
pub struct RandomTdma {
    devices: Vec<MacAddress>,
    actuators: Vec<MacAddress>,
    timeslots: u32,
    seed: u64,
    rng: ChaCha8Rng,
}

impl RandomTdma {
    /// Create a scheduler drawing from a generator seeded with `seed`.
    pub fn new(devices: &SchedulerDevices, timeslots: u32, seed: u64) -> Result<Self, SchedulerError> {
        let all = devices.all();
        if all.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        Ok(RandomTdma {
            devices: all,
            actuators: devices.actuators.clone(),
            timeslots,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl Scheduler for RandomTdma {
    fn name(&self) -> &'static str {
        "random_tdma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Tdma
    }

    fn next_schedule(&mut self, _observation: &[f64], _last_reward: f64) -> Result<Schedule, SchedulerError> {
        let mut owners = Vec::with_capacity(self.timeslots as usize);
        for _ in 0..self.timeslots {
            if let Some(device) = self.devices.choose(&mut self.rng) {
                owners.push(*device);
            }
        }
        Ok(Schedule::Tdma(TdmaSchedule::new(assign_flags(&owners, &self.actuators))))
    }

    fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
    }
}

/// Assigns random probabilities, normalized to sum to one.
///
/// Schedules are valid for `timeslots + 1` slots, which gives the sensors
/// slots `1..=timeslots`.
pub struct RandomCsma {
    sensors: Vec<MacAddress>,
    timeslots: u32,
    seed: u64,
    rng: ChaCha8Rng,
}

impl RandomCsma {
    /// Create a scheduler drawing from a generator seeded with `seed`.
    pub fn new(sensors: Vec<MacAddress>, timeslots: u32, seed: u64) -> Result<Self, SchedulerError> {
        if sensors.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        Ok(RandomCsma {
            sensors,
            timeslots,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl Scheduler for RandomCsma {
    fn name(&self) -> &'static str {
        "random_csma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Csma
    }

    fn next_schedule(&mut self, _observation: &[f64], _last_reward: f64) -> Result<Schedule, SchedulerError> {
        // bounded away from zero so the sum never vanishes
        let weights: Vec<f64> = self.sensors.iter().map(|_| self.rng.gen_range(0.01..1.0)).collect();
        let pairs = normalized(&self.sensors, &weights);
        Ok(Schedule::Csma(CsmaSchedule::new(pairs, self.timeslots + 1)?))
    }

    fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
    }
}

/// Pair each device with its share of the weight sum. Equal shares when the
/// weights sum to zero.
pub(crate) fn normalized(devices: &[MacAddress], weights: &[f64]) -> Vec<(MacAddress, f64)> {
    let total: f64 = weights.iter().sum();
    devices
        .iter()
        .zip(weights)
        .map(|(&device, &w)| {
            let p = if total > 0.0 { w / total } else { 1.0 / devices.len() as f64 };
            (device, p)
        })
        .collect()
}
