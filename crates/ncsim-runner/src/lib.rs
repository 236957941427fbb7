//! # ncsim-runner
//!
//! Runs a built NCSim simulation and reports on it.
//!
//! - [`EventLoop`] drives the kernel for a duration and folds the journal
//!   into [`SimulationStats`]
//! - [`TraceRecorder`] writes the journal as a JSON trace
//! - [`metrics_export`] collects the `metrics` emitted by the protocol layers

pub mod metrics_export;

use metrics_export::{InMemoryRecorder, MetricsSnapshot};
use ncsim_common::journal::{SimRecord, TimedRecord};
use ncsim_common::{EntityId, Kernel};
use ncsim_control::SharedCollaborators;
use ncsim_model::{BuiltSimulation, DeviceInfo};
use serde::Serialize;
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

pub use ncsim_common::SimTime;

// ============================================================================
// Error Types
// ============================================================================

/// Runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] ncsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] ncsim_common::SimError),

    /// Scheduler error, from the `schedule` command.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] ncsim_control::SchedulerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Statistics
// ============================================================================

/// An entity stopped by an error during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaltedEntity {
    /// Entity id.
    pub entity: u64,
    /// Device the entity belongs to.
    pub device: Option<String>,
    /// Simulation time of the error in microseconds.
    pub time_us: u64,
    /// Error message.
    pub error: String,
}

/// Simulation statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Seed of the run.
    pub seed: u64,
    /// Total events processed.
    pub total_events: u64,
    /// Frames put on the air.
    pub transmissions: u64,
    /// Frames accepted by a receiver.
    pub frames_delivered: u64,
    /// Frames discarded by a receiver for too many bit errors.
    pub frames_dropped: u64,
    /// Schedules issued by gateways.
    pub schedules_sent: u64,
    /// Sensor samples received by gateways.
    pub sensor_data_received: u64,
    /// Control values sent by gateways.
    pub controls_sent: u64,
    /// Control values applied by actuators.
    pub controls_applied: u64,
    /// Grants made by resource managers.
    pub slots_assigned: u64,
    /// Packets received by contention-free devices.
    pub payloads_received: u64,
    /// Entities stopped by an error.
    pub halted_entities: Vec<HaltedEntity>,
    /// Last control value applied per actuator.
    pub last_controls: std::collections::BTreeMap<String, f64>,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
    /// Metrics collected during the run, if a recorder was attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

impl SimulationStats {
    fn count(&mut self, record: &TimedRecord, devices: &[DeviceInfo]) {
        match &record.record {
            SimRecord::TransmissionStarted { .. } => self.transmissions += 1,
            SimRecord::FrameDelivered { .. } => self.frames_delivered += 1,
            SimRecord::FrameDropped { .. } => self.frames_dropped += 1,
            SimRecord::ScheduleSent { .. } => self.schedules_sent += 1,
            SimRecord::SensorDataReceived { .. } => self.sensor_data_received += 1,
            SimRecord::ControlSent { .. } => self.controls_sent += 1,
            SimRecord::ControlApplied { actuator, value } => {
                self.controls_applied += 1;
                self.last_controls.insert(actuator.clone(), *value);
            }
            SimRecord::SlotsAssigned { .. } => self.slots_assigned += 1,
            SimRecord::PayloadReceived { .. } => self.payloads_received += 1,
            SimRecord::EntityHalted { entity, error } => self.halted_entities.push(HaltedEntity {
                entity: *entity,
                device: device_of(devices, EntityId(*entity)).map(|d| d.name.clone()),
                time_us: record.time.as_micros(),
                error: error.clone(),
            }),
        }
    }
}

fn device_of(devices: &[DeviceInfo], entity: EntityId) -> Option<&DeviceInfo> {
    devices
        .iter()
        .find(|d| [d.phy_entity_id, d.mac_entity_id, d.device_entity_id].contains(&entity.0))
}

/// Name of the device with address `mac`, or `mac` itself.
fn name_of(devices: &[DeviceInfo], mac: &str) -> String {
    devices
        .iter()
        .find(|d| d.mac == mac)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| mac.to_string())
}

// ============================================================================
// Trace Output
// ============================================================================

/// One line of the JSON trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// Device the record concerns.
    pub origin: String,
    /// Simulation time in microseconds.
    pub time_us: u64,
    /// Simulation time as text.
    pub timestamp: String,
    /// The record, flattened with its `kind` tag.
    #[serde(flatten)]
    pub record: SimRecord,
}

impl TraceEntry {
    fn new(record: TimedRecord, devices: &[DeviceInfo]) -> Self {
        let origin = match &record.record {
            SimRecord::TransmissionStarted { sender, .. } => sender.clone(),
            SimRecord::FrameDelivered { receiver, .. } | SimRecord::FrameDropped { receiver, .. } => {
                receiver.clone()
            }
            SimRecord::ScheduleSent { gateway, .. } => gateway.clone(),
            SimRecord::SensorDataReceived { sensor, .. } => name_of(devices, sensor),
            SimRecord::ControlSent { actuator, .. } => name_of(devices, actuator),
            SimRecord::ControlApplied { actuator, .. } => actuator.clone(),
            SimRecord::SlotsAssigned { dest, .. } => name_of(devices, dest),
            SimRecord::PayloadReceived { device, .. } => device.clone(),
            SimRecord::EntityHalted { entity, .. } => device_of(devices, EntityId(*entity))
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("entity-{}", entity)),
        };
        TraceEntry {
            origin,
            time_us: record.time.as_micros(),
            timestamp: record.time.to_string(),
            record: record.record,
        }
    }
}

/// Trace recorder for outputting simulation records.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder. Entries are kept even without output.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Record an entry.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Entries recorded so far.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Write all entries as one JSON array.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Drives a built simulation.
///
/// [`EventLoop::run`] may be called repeatedly; each call continues where
/// the previous one stopped and returns the statistics accumulated so far.
pub struct EventLoop {
    kernel: Kernel,
    devices: Vec<DeviceInfo>,
    collaborators: Option<SharedCollaborators>,
    trace: TraceRecorder,
    stats: SimulationStats,
    metrics: Option<InMemoryRecorder>,
    wall_time: std::time::Duration,
}

impl EventLoop {
    /// Take over a built simulation. The journal is switched on here, so
    /// nothing before the first event is recorded.
    pub fn new(simulation: BuiltSimulation) -> Self {
        let BuiltSimulation {
            mut context,
            entities,
            collaborators,
            devices,
            seed,
        } = simulation;
        context.enable_journal();
        EventLoop {
            kernel: Kernel::new(context, entities),
            devices,
            collaborators,
            trace: TraceRecorder::new(None),
            stats: SimulationStats {
                seed,
                ..SimulationStats::default()
            },
            metrics: None,
            wall_time: std::time::Duration::ZERO,
        }
    }

    /// Write the trace to `output` on [`EventLoop::finish`].
    pub fn with_trace(mut self, output: Box<dyn Write>) -> Self {
        self.trace = TraceRecorder::new(Some(output));
        self
    }

    /// Embed snapshots of `recorder` in the statistics.
    pub fn with_metrics(mut self, recorder: InMemoryRecorder) -> Self {
        self.metrics = Some(recorder);
        self
    }

    /// The kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Devices of the simulation, in build order.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Interpreter and controller of a `ncs` scenario.
    pub fn collaborators(&self) -> Option<&SharedCollaborators> {
        self.collaborators.as_ref()
    }

    /// The trace so far.
    pub fn trace(&self) -> &TraceRecorder {
        &self.trace
    }

    /// Run for `duration` of simulated time.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let start = self.kernel.time();
        let end = start.add(duration).ok_or_else(|| {
            RunnerError::ConfigError(format!("duration {} overflows the simulation clock", duration))
        })?;
        info!(start = %start, end = %end, "running simulation");

        let wall_start = Instant::now();
        let processed = self.kernel.run_until(end);
        self.wall_time += wall_start.elapsed();

        for record in self.kernel.context_mut().take_records() {
            self.stats.count(&record, &self.devices);
            self.trace.record(TraceEntry::new(record, &self.devices));
        }
        if !self.kernel.halted().is_empty() {
            warn!(halted = self.kernel.halted().len(), "entities halted during the run");
        }

        self.stats.total_events = self.kernel.events_processed();
        self.stats.simulation_time_us = self.kernel.time().as_micros();
        self.stats.wall_time_ms = self.wall_time.as_millis() as u64;
        self.stats.metrics = self.metrics.as_ref().map(InMemoryRecorder::snapshot);
        info!(
            events = processed,
            time = %self.kernel.time(),
            wall_ms = self.stats.wall_time_ms,
            "simulation finished"
        );
        Ok(self.stats.clone())
    }

    /// Write the trace, if one was requested.
    pub fn finish(mut self) -> Result<SimulationStats, RunnerError> {
        self.trace.flush()?;
        Ok(self.stats)
    }
}
