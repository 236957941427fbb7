//! # ncsim-common
//!
//! Common types and traits for the NCSim simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`]) and the [`Kernel`] driving them
//! - Notifiers ([`notifier`]) and the module/port framework ([`construction`])
//! - Devices with positions ([`position`]) and radio primitives ([`radio`])

pub mod construction;
pub mod journal;
pub mod kernel;
pub mod messages;
pub mod metric_defs;
pub mod notifier;
pub mod position;
pub mod radio;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::construction::GateRegistry;
use crate::journal::{Journal, SimRecord, TimedRecord};
use crate::notifier::NotifierRegistry;

pub use construction::{GateId, Listener, ListenerMode, Module, Port};
pub use kernel::Kernel;
pub use messages::{Command, Reply, Signal, StackMessage};
pub use ncsim_packet::{MacAddress, Packet, PacketError, ProtocolType, Schedule};
pub use notifier::{Notification, NotifierId, ProcessMode, SubscriptionId};
pub use position::{Device, Position, SharedPosition};
pub use radio::{CodeRate, LinkSettings, Mcs, Modulation, Transmission};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },

    /// A gate id that was never created.
    #[error("Unknown gate: {0:?}")]
    UnknownGate(GateId),

    /// A notifier id that was never created.
    #[error("Unknown notifier: {0:?}")]
    UnknownNotifier(NotifierId),

    /// A module already has a port with this name.
    #[error("Module '{module}' already has a port named '{port}'")]
    DuplicatePort {
        /// Module name.
        module: String,
        /// Port name.
        port: String,
    },

    /// A module already has a submodule with this name.
    #[error("Module '{module}' already has a submodule named '{name}'")]
    DuplicateSubmodule {
        /// Module name.
        module: String,
        /// Submodule name.
        name: String,
    },

    /// A module has no port with this name.
    #[error("Module '{module}' has no port named '{port}'")]
    UnknownPort {
        /// Module name.
        module: String,
        /// Port name.
        port: String,
    },

    /// A protocol layer received something it cannot handle.
    #[error("Protocol error in entity {entity:?}: {message}")]
    Protocol {
        /// Entity that detected the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },

    /// Packet or schedule error.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

impl SimError {
    /// Shorthand for [`SimError::Protocol`].
    pub fn protocol(entity: EntityId, message: impl Into<String>) -> Self {
        SimError::Protocol {
            entity,
            message: message.into(),
        }
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Latest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds, rounded to the nearest microsecond. Negative
    /// values clamp to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0).round().max(0.0) as u64)
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }

    /// Multiply a duration by an integer factor, saturating.
    pub fn times(&self, factor: u64) -> SimTime {
        SimTime(self.0.saturating_mul(factor))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then insertion order)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Notifiers ===========
    /// A notifier the entity subscribed to with a callback was triggered.
    Notified(Notification),
    /// A process subscription was started by a trigger. The entity must call
    /// [`SimContext::process_done`] once the process finished.
    ProcessStart(Notification),
    /// A one-shot wait on a notifier returned.
    Wakeup(Notification),

    // =========== Stack messages ===========
    /// A stack message sent by this entity was processed by a lower layer.
    Processed {
        /// Token chosen by the sender of the message.
        token: u64,
        /// Optional return value.
        value: Option<Signal>,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Address allocation
// ============================================================================

/// Hands out unique MAC addresses, counting upwards from 1. Address 0 is
/// reserved for the resource manager.
#[derive(Debug, Clone)]
pub struct MacAllocator {
    next: u64,
}

impl MacAllocator {
    /// Create an allocator whose first address is `00:00:00:00:00:01`.
    pub fn new() -> Self {
        MacAllocator { next: 1 }
    }

    /// The address the next [`MacAllocator::allocate`] returns.
    pub fn peek(&self) -> MacAddress {
        MacAddress::from_counter(self.next)
    }

    /// Allocate the next address.
    pub fn allocate(&mut self) -> MacAddress {
        let addr = MacAddress::from_counter(self.next);
        self.next += 1;
        addr
    }
}

impl Default for MacAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Besides time, randomness and event posting, the context owns the notifier
/// and gate registries, so that callbacks and module connections can be
/// resolved while an entity handles an event.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    seed: u64,
    pending_events: Vec<Event>,
    immediate_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
    pub(crate) notifiers: NotifierRegistry,
    pub(crate) gates: GateRegistry,
    macs: MacAllocator,
    next_device_key: u64,
    journal: Journal,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            pending_events: Vec::new(),
            immediate_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
            notifiers: NotifierRegistry::default(),
            gates: GateRegistry::default(),
            macs: MacAllocator::new(),
            next_device_key: 1,
            journal: Journal::default(),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Seed this context was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by the kernel).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Entity whose handler is currently running.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Set the source entity (used by the kernel).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    fn make_event(&mut self, time: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> Event {
        let event = Event {
            id: EventId(self.next_event_id),
            time,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        event
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let event = self.make_event(self.time + delay, targets, payload);
        let id = event.id;
        self.pending_events.push(event);
        id
    }

    /// Post an event at an absolute time. Times in the past fire at the
    /// current time.
    pub fn post_at(&mut self, time: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let time = time.max(self.time);
        let event = self.make_event(time, targets, payload);
        let id = event.id;
        self.pending_events.push(event);
        id
    }

    /// Post an event to occur at the current time, after every event already
    /// queued for this instant.
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Deliver a payload to `entity` right after the running handler returns,
    /// before any other queued event.
    pub fn deliver(&mut self, entity: EntityId, payload: EventPayload) {
        let event = self.make_event(self.time, vec![entity], payload);
        self.immediate_events.push(event);
    }

    /// Delay until the next boundary of a slotted clock. A full slot when the
    /// current time already lies on a boundary.
    pub fn next_time_slot(&self, slot: SimTime) -> SimTime {
        if slot == SimTime::ZERO {
            return SimTime::ZERO;
        }
        SimTime(slot.0 - self.time.0 % slot.0)
    }

    /// Take all pending timed events (used by the kernel).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all immediate deliveries in emission order (used by the kernel).
    pub fn take_immediate(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.immediate_events)
    }

    /// Get the next event ID (used for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Allocate a unique MAC address for this run.
    pub fn new_mac_address(&mut self) -> MacAddress {
        self.macs.allocate()
    }

    /// The address [`SimContext::new_mac_address`] hands out next.
    pub fn peek_mac_address(&self) -> MacAddress {
        self.macs.peek()
    }

    /// Allocate a unique device key for this run.
    pub fn new_device_key(&mut self) -> u64 {
        let key = self.next_device_key;
        self.next_device_key += 1;
        key
    }

    /// Start collecting [`SimRecord`]s.
    pub fn enable_journal(&mut self) {
        self.journal.enabled = true;
    }

    /// Whether records are being collected.
    pub fn journal_enabled(&self) -> bool {
        self.journal.enabled
    }

    /// Add a record stamped with the current time. Ignored while the journal
    /// is disabled.
    pub fn record(&mut self, record: SimRecord) {
        if self.journal.enabled {
            self.journal.records.push(TimedRecord {
                time: self.time,
                record,
            });
        }
    }

    /// Take all records collected so far.
    pub fn take_records(&mut self) -> Vec<TimedRecord> {
        std::mem::take(&mut self.journal.records)
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 0.0001);
        // 0.04 * 1e6 is not exact in binary
        assert_eq!(SimTime::from_secs(0.04).as_micros(), 40_000);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t2 - t1), SimTime::ZERO);
        assert_eq!(t2.times(3).as_millis(), 150);
    }

    #[test]
    fn test_next_time_slot() {
        let mut ctx = SimContext::new(0);
        let slot = SimTime::from_micros(10);
        assert_eq!(ctx.next_time_slot(slot).as_micros(), 10);
        ctx.set_time(SimTime::from_micros(13));
        assert_eq!(ctx.next_time_slot(slot).as_micros(), 7);
    }

    #[test]
    fn test_post_at_clamps_to_now() {
        let mut ctx = SimContext::new(0);
        ctx.set_time(SimTime::from_micros(500));
        ctx.post_at(SimTime::from_micros(100), vec![EntityId(1)], EventPayload::Timer { timer_id: 1 });
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time.as_micros(), 500);
    }

    #[test]
    fn test_mac_allocation_is_per_context() {
        let mut a = SimContext::new(0);
        let mut b = SimContext::new(0);
        assert_eq!(a.new_mac_address(), MacAddress::from_counter(1));
        assert_eq!(a.new_mac_address(), MacAddress::from_counter(2));
        assert_eq!(b.new_mac_address(), MacAddress::from_counter(1));
    }

    #[test]
    fn test_journal_disabled_by_default() {
        let mut ctx = SimContext::new(0);
        ctx.record(SimRecord::EntityHalted {
            entity: 1,
            error: "x".into(),
        });
        assert!(ctx.take_records().is_empty());
        ctx.enable_journal();
        ctx.record(SimRecord::EntityHalted {
            entity: 1,
            error: "x".into(),
        });
        assert_eq!(ctx.take_records().len(), 1);
    }
}
