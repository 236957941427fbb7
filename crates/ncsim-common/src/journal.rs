//! Structured records of protocol-level happenings, collected by the
//! [`SimContext`](crate::SimContext) when enabled and drained by the runner
//! into statistics and traces.

use crate::SimTime;
use serde::Serialize;

/// Something worth recording during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimRecord {
    /// A device started sending a frame.
    TransmissionStarted {
        /// Transmission id, unique per band.
        id: u64,
        /// Sending device name.
        sender: String,
        /// Encoded frame size in bytes.
        bytes: usize,
        /// Transmit power in dBm.
        power_dbm: f64,
        /// Stop time in microseconds.
        stop_us: u64,
    },
    /// A receiver accepted a frame.
    FrameDelivered {
        /// Transmission id.
        id: u64,
        /// Receiving device name.
        receiver: String,
        /// Rounded number of bit errors.
        bit_errors: u64,
        /// Bit error rate of the frame.
        ber: f64,
    },
    /// A receiver discarded a frame with too many bit errors.
    FrameDropped {
        /// Transmission id.
        id: u64,
        /// Receiving device name.
        receiver: String,
        /// Rounded number of bit errors.
        bit_errors: u64,
        /// Bit error rate of the frame.
        ber: f64,
        /// Maximum correctable bit error rate of the MCS.
        max_ber: f64,
    },
    /// The gateway issued a schedule.
    ScheduleSent {
        /// Gateway device name.
        gateway: String,
        /// Textual schedule.
        schedule: String,
        /// Encoded schedule size in bytes.
        bytes: usize,
    },
    /// The gateway received sensor data.
    SensorDataReceived {
        /// Sending sensor name.
        sensor: String,
        /// Sampled value.
        value: f64,
    },
    /// The gateway sent a control value.
    ControlSent {
        /// Target actuator name.
        actuator: String,
        /// Control value.
        value: f64,
    },
    /// An actuator applied a control value.
    ControlApplied {
        /// Actuator name.
        actuator: String,
        /// Control value.
        value: f64,
    },
    /// The resource manager granted the medium to a device.
    SlotsAssigned {
        /// Receiving address.
        dest: String,
        /// Number of granted slots.
        slots: u32,
    },
    /// A contention-free device received a packet addressed to it.
    PayloadReceived {
        /// Receiving device name.
        device: String,
        /// Payload size in bytes.
        bytes: usize,
    },
    /// An entity returned an error and stopped receiving events.
    EntityHalted {
        /// Entity id.
        entity: u64,
        /// Error message.
        error: String,
    },
}

impl SimRecord {
    /// Record kind as used in traces.
    pub fn kind(&self) -> &'static str {
        match self {
            SimRecord::TransmissionStarted { .. } => "transmission_started",
            SimRecord::FrameDelivered { .. } => "frame_delivered",
            SimRecord::FrameDropped { .. } => "frame_dropped",
            SimRecord::ScheduleSent { .. } => "schedule_sent",
            SimRecord::SensorDataReceived { .. } => "sensor_data_received",
            SimRecord::ControlSent { .. } => "control_sent",
            SimRecord::ControlApplied { .. } => "control_applied",
            SimRecord::SlotsAssigned { .. } => "slots_assigned",
            SimRecord::PayloadReceived { .. } => "payload_received",
            SimRecord::EntityHalted { .. } => "entity_halted",
        }
    }
}

/// A record with the simulation time it was made at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedRecord {
    /// Simulation time.
    pub time: SimTime,
    /// The record.
    pub record: SimRecord,
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    pub(crate) enabled: bool,
    pub(crate) records: Vec<TimedRecord>,
}
