//! Round robin TDMA scheduling.

use crate::{Scheduler, SchedulerDevices, SchedulerError};
use ncsim_packet::{MacAddress, ProtocolType, Schedule, SlotAssignment, TdmaSchedule};
use tracing::debug;

/// Assigns slots to the devices in turn.
///
/// An actuator takes two consecutive slots: flag `1` for the control message
/// from the gateway, then flag `0` for its acknowledgement. The cursor only
/// advances after a slot with flag `0`, and it carries over from one schedule
/// to the next.
pub struct RoundRobinTdma {
    devices: Vec<MacAddress>,
    actuators: Vec<MacAddress>,
    timeslots: u32,
    next_device: usize,
    was_actuator: bool,
    schedule: Option<TdmaSchedule>,
}

impl RoundRobinTdma {
    /// Create a scheduler over sensors followed by actuators.
    pub fn new(devices: &SchedulerDevices, timeslots: u32) -> Result<Self, SchedulerError> {
        let all = devices.all();
        if all.is_empty() {
            return Err(SchedulerError::NoDevices);
        }
        Ok(RoundRobinTdma {
            devices: all,
            actuators: devices.actuators.clone(),
            timeslots,
            next_device: 0,
            was_actuator: false,
            schedule: None,
        })
    }

    /// Position in the device list the next slot goes to.
    pub fn cursor(&self) -> usize {
        self.next_device
    }

    /// The latest schedule produced.
    pub fn schedule(&self) -> Option<&TdmaSchedule> {
        self.schedule.as_ref()
    }

    /// The first entry of an actuator in the latest schedule whose start slot
    /// is after `last_control_slot`.
    pub fn get_next_control_slot(&self, last_control_slot: u32) -> Option<(u32, MacAddress)> {
        self.schedule
            .as_ref()?
            .entries()
            .iter()
            .find(|e| self.actuators.contains(&e.device) && e.start > last_control_slot)
            .map(|e| (e.start, e.device))
    }
}

impl Scheduler for RoundRobinTdma {
    fn name(&self) -> &'static str {
        "round_robin_tdma"
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Tdma
    }

    fn next_schedule(&mut self, _observation: &[f64], _last_reward: f64) -> Result<Schedule, SchedulerError> {
        let mut action = Vec::with_capacity(self.timeslots as usize);
        for _ in 0..self.timeslots {
            let device = self.devices[self.next_device];
            if self.actuators.contains(&device) {
                let flag = if self.was_actuator { 0 } else { 1 };
                self.was_actuator = !self.was_actuator;
                action.push(SlotAssignment::new(device, flag));
            } else {
                action.push(SlotAssignment::new(device, 0));
            }
            if !self.was_actuator {
                self.next_device = (self.next_device + 1) % self.devices.len();
            }
        }
        let schedule = TdmaSchedule::new(action);
        debug!(cursor = self.next_device, "new schedule generated");
        self.schedule = Some(schedule.clone());
        Ok(Schedule::Tdma(schedule))
    }

    fn reset(&mut self) {
        self.next_device = 0;
        self.was_actuator = false;
        self.schedule = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::devices;
    use std::collections::BTreeMap;

    fn flags(schedule: &Schedule) -> Vec<(u64, u8)> {
        let Schedule::Tdma(tdma) = schedule else {
            panic!("expected a TDMA schedule");
        };
        tdma.action().iter().map(|s| (s.device.as_u64(), s.flag)).collect()
    }

    #[test]
    fn test_sensor_cursor_wraps() {
        let mut rr = RoundRobinTdma::new(&devices(3, 0), 7).unwrap();
        let schedule = rr.next_schedule(&[], 0.0).unwrap();
        assert_eq!(
            flags(&schedule),
            vec![(1, 0), (2, 0), (3, 0), (1, 0), (2, 0), (3, 0), (1, 0)]
        );
        assert_eq!(rr.cursor(), 7 % 3);
    }

    #[test]
    fn test_actuator_takes_control_and_ack_slot() {
        let mut rr = RoundRobinTdma::new(&devices(1, 1), 3).unwrap();
        let first = rr.next_schedule(&[], 0.0).unwrap();
        assert_eq!(flags(&first), vec![(1, 0), (2, 1), (2, 0)]);
        // the duty cycle carries over a schedule boundary
        let mut rr = RoundRobinTdma::new(&devices(1, 1), 2).unwrap();
        let first = rr.next_schedule(&[], 0.0).unwrap();
        let second = rr.next_schedule(&[], 0.0).unwrap();
        assert_eq!(flags(&first), vec![(1, 0), (2, 1)]);
        assert_eq!(flags(&second), vec![(2, 0), (1, 0)]);
    }

    #[test]
    fn test_every_device_gets_its_share() {
        let mut rr = RoundRobinTdma::new(&devices(3, 2), 4).unwrap();
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        let rounds = 35;
        for _ in 0..rounds {
            let schedule = rr.next_schedule(&[], 0.0).unwrap();
            for (device, _) in flags(&schedule) {
                *counts.entry(device).or_default() += 1;
            }
        }
        // 3 sensors with one slot and 2 actuators with two: 7 slots per turn
        let turns = rounds * 4 / 7;
        assert_eq!(counts.len(), 5);
        for (device, count) in counts {
            assert!(count >= turns, "device {} got {} slots", device, count);
        }
    }

    #[test]
    fn test_next_control_slot_compares_numerically() {
        // 12 slots: the actuator entries start at slot 2, 5, 8 and 11
        let mut rr = RoundRobinTdma::new(&devices(1, 1), 12).unwrap();
        rr.next_schedule(&[], 0.0).unwrap();
        let actuator = MacAddress::from_counter(2);
        assert_eq!(rr.get_next_control_slot(0), Some((2, actuator)));
        assert_eq!(rr.get_next_control_slot(8), Some((11, actuator)));
        assert_eq!(rr.get_next_control_slot(9), Some((11, actuator)));
        assert_eq!(rr.get_next_control_slot(11), None);
    }

    #[test]
    fn test_reset_restarts_at_first_device() {
        let mut rr = RoundRobinTdma::new(&devices(2, 1), 2).unwrap();
        let first = rr.next_schedule(&[], 0.0).unwrap();
        rr.next_schedule(&[], 0.0).unwrap();
        rr.reset();
        assert_eq!(rr.cursor(), 0);
        assert!(rr.get_next_control_slot(0).is_none());
        assert_eq!(rr.next_schedule(&[], 0.0).unwrap(), first);
    }
}
