//! Learned TDMA scheduling.
//!
//! The action set holds every multiset of `timeslots` devices, listed like
//! combinations with replacement of the device indices in lexicographic
//! order. A [`Policy`] picks one action per round from the observation; how
//! a policy is trained is not part of the simulation.

use crate::{observed, Scheduler, SchedulerDevices, SchedulerError};
use ncsim_packet::{MacAddress, ProtocolType, Schedule, SlotAssignment, TdmaSchedule};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Largest action set a [`LearnedTdma`] enumerates.
pub const MAX_ACTIONS: usize = 1 << 20;

/// Picks an action index for an observation.
pub trait Policy: Send {
    /// Index into `actions`, where every action lists device indices in
    /// non-decreasing order.
    fn choose(&mut self, observation: &[f64], actions: &[Vec<usize>]) -> usize;

    /// Reward for the previous choice.
    fn observe_reward(&mut self, _reward: f64) {}
}

/// Uniform exploration.
pub struct RandomPolicy {
    rng: ChaCha8Rng,
}

impl RandomPolicy {
    /// Create a policy drawing from a generator seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        RandomPolicy {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Policy for RandomPolicy {
    fn choose(&mut self, _observation: &[f64], actions: &[Vec<usize>]) -> usize {
        if actions.is_empty() {
            return 0;
        }
        self.rng.gen_range(0..actions.len())
    }
}

/// Picks the action covering the largest total observed value, counting
/// every device once. Ties go to the first action.
pub struct GreedyPolicy;

impl Policy for GreedyPolicy {
    fn choose(&mut self, observation: &[f64], actions: &[Vec<usize>]) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for (i, action) in actions.iter().enumerate() {
            let mut score = 0.0;
            let mut previous = None;
            for &device in action {
                if previous != Some(device) {
                    score += observed(observation, device);
                }
                previous = Some(device);
            }
            if score > best.1 {
                best = (i, score);
            }
        }
        best.0
    }
}

/// Number of multisets of size `k` drawn from `n` items, `None` past `u128`.
fn multiset_count(n: usize, k: usize) -> Option<u128> {
    if n == 0 {
        return Some(u128::from(k == 0));
    }
    // C(n + k - 1, k), multiplied incrementally so every step divides exactly
    let mut count: u128 = 1;
    for i in 1..=k as u128 {
        count = count.checked_mul(n as u128 - 1 + i)? / i;
    }
    Some(count)
}

/// Every non-decreasing sequence of `k` indices below `n`.
fn combinations_with_replacement(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut result = Vec::new();
    if n == 0 {
        return result;
    }
    let mut current = vec![0; k];
    loop {
        result.push(current.clone());
        // rightmost position that can still grow
        let Some(pos) = current.iter().rposition(|&i| i < n - 1) else {
            return result;
        };
        let next = current[pos] + 1;
        for slot in current.iter_mut().skip(pos) {
            *slot = next;
        }
    }
}

/// TDMA scheduler choosing among all multisets of devices.
pub struct LearnedTdma {
    devices: Vec<MacAddress>,
    actuators: Vec<MacAddress>,
    actions: Vec<Vec<usize>>,
    policy: Box<dyn Policy>,
    last_action: Option<usize>,
}

impl LearnedTdma {
    /// Create a scheduler over sensors followed by actuators.
    pub fn new(devices: &SchedulerDevices, timeslots: u32, policy: Box<dyn Policy>) -> Result<Self, SchedulerError> {
        let all = devices.all();
        if all.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        let size = multiset_count(all.len(), timeslots as usize).unwrap_or(u128::MAX);
        if size > MAX_ACTIONS as u128 {
            return Err(SchedulerError::ActionSetTooLarge {
                size,
                limit: MAX_ACTIONS,
            });
        }
        let actions = combinations_with_replacement(all.len(), timeslots as usize);
        debug!(actions = actions.len(), devices = all.len(), timeslots, "action set built");
        Ok(LearnedTdma {
            devices: all,
            actuators: devices.actuators.clone(),
            actions,
            policy,
            last_action: None,
        })
    }

    /// The action set.
    pub fn actions(&self) -> &[Vec<usize>] {
        &self.actions
    }

    /// Index of the action chosen last.
    pub fn last_action(&self) -> Option<usize> {
        self.last_action
    }
}

impl Scheduler for LearnedTdma {
    fn name(&self) -> &'static str {
        "learned_tdma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Tdma
    }

    fn next_schedule(&mut self, observation: &[f64], last_reward: f64) -> Result<Schedule, SchedulerError> {
        if self.last_action.is_some() {
            self.policy.observe_reward(last_reward);
        }
        let index = self.policy.choose(observation, &self.actions);
        let action = self.actions.get(index).ok_or(SchedulerError::InvalidAction {
            index,
            size: self.actions.len(),
        })?;
        self.last_action = Some(index);
        let mut slots = Vec::with_capacity(action.len());
        let mut previous = None;
        for &i in action {
            let device = self.devices[i];
            let flag = u8::from(self.actuators.contains(&device) && previous != Some(i));
            slots.push(SlotAssignment::new(device, flag));
            previous = Some(i);
        }
        Ok(Schedule::Tdma(TdmaSchedule::new(slots)))
    }

    fn reset(&mut self) {
        self.last_action = None;
    }
}
