//! Greedy waiting time schedulers.
//!
//! Both read the observation as the time each device has been waiting for
//! the medium, indexed like the device list.

use crate::random::normalized;
use crate::{observed, Scheduler, SchedulerDevices, SchedulerError};
use ncsim_packet::{CsmaSchedule, MacAddress, ProtocolType, Schedule, SlotAssignment, TdmaSchedule};
use tracing::trace;

/// Gives every slot to the device waiting longest.
///
/// After a device is picked its waiting time drops to zero and every other
/// device waits one slot longer. Actuators take a control slot followed by
/// an acknowledgement slot when both fit. Ties go to the lower index.
pub struct GreedyWaitingTdma {
    devices: Vec<MacAddress>,
    actuators: Vec<MacAddress>,
    timeslots: u32,
}

impl GreedyWaitingTdma {
    /// Create a scheduler over sensors followed by actuators.
    pub fn new(devices: &SchedulerDevices, timeslots: u32) -> Result<Self, SchedulerError> {
        let all = devices.all();
        if all.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        Ok(GreedyWaitingTdma {
            devices: all,
            actuators: devices.actuators.clone(),
            timeslots,
        })
    }
}

/// Index of the largest value, the first one on ties.
fn longest(waits: &[f64]) -> usize {
    let mut best = 0;
    for (i, w) in waits.iter().enumerate() {
        if *w > waits[best] {
            best = i;
        }
    }
    best
}

impl Scheduler for GreedyWaitingTdma {
    fn name(&self) -> &'static str {
        "greedy_waiting_tdma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Tdma
    }

    fn next_schedule(&mut self, observation: &[f64], _last_reward: f64) -> Result<Schedule, SchedulerError> {
        let mut waits: Vec<f64> = (0..self.devices.len()).map(|i| observed(observation, i)).collect();
        let slot_weight = 1.0 / f64::from(self.timeslots);
        let mut action = Vec::with_capacity(self.timeslots as usize);
        while action.len() < self.timeslots as usize {
            let chosen = longest(&waits);
            let device = self.devices[chosen];
            let used = if self.actuators.contains(&device) {
                action.push(SlotAssignment::new(device, 1));
                if action.len() < self.timeslots as usize {
                    action.push(SlotAssignment::new(device, 0));
                    2
                } else {
                    1
                }
            } else {
                action.push(SlotAssignment::new(device, 0));
                1
            };
            trace!(device = %device, wait = waits[chosen], "greedy pick");
            for (i, w) in waits.iter_mut().enumerate() {
                if i == chosen {
                    *w = 0.0;
                } else {
                    *w += slot_weight * f64::from(used);
                }
            }
        }
        Ok(Schedule::Tdma(TdmaSchedule::new(action)))
    }
}

/// Probabilities proportional to the sensors' waiting times.
///
/// Schedules are valid for `timeslots + 1` slots. Equal probabilities when
/// nobody is waiting.
pub struct GreedyWaitingCsma {
    sensors: Vec<MacAddress>,
    timeslots: u32,
}

impl GreedyWaitingCsma {
    /// Create a scheduler over `sensors`.
    pub fn new(sensors: Vec<MacAddress>, timeslots: u32) -> Result<Self, SchedulerError> {
        if sensors.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        Ok(GreedyWaitingCsma { sensors, timeslots })
    }
}

impl Scheduler for GreedyWaitingCsma {
    fn name(&self) -> &'static str {
        "greedy_waiting_csma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Csma
    }

    fn next_schedule(&mut self, observation: &[f64], _last_reward: f64) -> Result<Schedule, SchedulerError> {
        let waits: Vec<f64> = (0..self.sensors.len())
            .map(|i| observed(observation, i).max(0.0))
            .collect();
        let pairs = normalized(&self.sensors, &waits);
        Ok(Schedule::Csma(CsmaSchedule::new(pairs, self.timeslots + 1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::devices;

    fn owners(schedule: &Schedule) -> Vec<(u64, u8)> {
        let Schedule::Tdma(tdma) = schedule else {
            panic!("expected a TDMA schedule");
        };
        tdma.action().iter().map(|s| (s.device.as_u64(), s.flag)).collect()
    }

    #[test]
    fn test_longest_waiting_device_first() {
        let mut scheduler = GreedyWaitingTdma::new(&devices(3, 0), 3).unwrap();
        let schedule = scheduler.next_schedule(&[0.1, 0.5, 0.3], 0.0).unwrap();
        assert_eq!(owners(&schedule), vec![(2, 0), (3, 0), (1, 0)]);
    }

    #[test]
    fn test_actuator_takes_two_slots() {
        let mut scheduler = GreedyWaitingTdma::new(&devices(1, 1), 3).unwrap();
        let schedule = scheduler.next_schedule(&[0.0, 1.0], 0.0).unwrap();
        assert_eq!(owners(&schedule), vec![(2, 1), (2, 0), (1, 0)]);
        // a control slot without room for the acknowledgement
        let mut scheduler = GreedyWaitingTdma::new(&devices(1, 1), 1).unwrap();
        let schedule = scheduler.next_schedule(&[0.0, 1.0], 0.0).unwrap();
        assert_eq!(owners(&schedule), vec![(2, 1)]);
    }

    #[test]
    fn test_missing_observation_counts_as_zero() {
        let mut scheduler = GreedyWaitingTdma::new(&devices(2, 0), 2).unwrap();
        let schedule = scheduler.next_schedule(&[], 0.0).unwrap();
        assert_eq!(owners(&schedule), vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_csma_probabilities_follow_waiting_times() {
        let sensors = devices(3, 0).sensors;
        let mut scheduler = GreedyWaitingCsma::new(sensors.clone(), 4).unwrap();
        let Schedule::Csma(csma) = scheduler.next_schedule(&[1.0, 3.0, 0.0], 0.0).unwrap() else {
            panic!("expected a CSMA schedule");
        };
        assert!((csma.get_my_p(sensors[0]) - 0.25).abs() < 1e-12);
        assert!((csma.get_my_p(sensors[1]) - 0.75).abs() < 1e-12);
        assert_eq!(csma.get_my_p(sensors[2]), 0.0);
        assert_eq!(csma.end_time(), 5);

        let Schedule::Csma(idle) = scheduler.next_schedule(&[], 0.0).unwrap() else {
            panic!("expected a CSMA schedule");
        };
        assert!((idle.get_my_p(sensors[2]) - 1.0 / 3.0).abs() < 1e-12);
    }
}
