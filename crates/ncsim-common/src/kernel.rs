//! The discrete-event kernel.
//!
//! Timed events live in a min-heap ordered by `(time, id)`, so events for the
//! same instant run in the order they were posted. Deliveries made with
//! [`SimContext::deliver`] bypass the heap: they run right after the handler
//! that emitted them, before any sibling delivery emitted earlier.
//!
//! An entity whose handler returns an error is logged and halted. It receives
//! no further events; every other entity keeps running.

use crate::journal::SimRecord;
use crate::metric_defs;
use crate::{EntityId, EntityRegistry, Event, EventId, EventPayload, SimContext, SimTime};
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use tracing::{error, trace, warn};

/// Runs events against a set of entities.
pub struct Kernel {
    queue: BinaryHeap<Event>,
    immediate: VecDeque<Event>,
    entities: EntityRegistry,
    context: SimContext,
    halted: BTreeSet<EntityId>,
    events_processed: u64,
    ended: bool,
}

impl Kernel {
    /// Create a kernel. Events already posted on `context` are picked up on
    /// the first run.
    pub fn new(context: SimContext, entities: EntityRegistry) -> Self {
        Kernel {
            queue: BinaryHeap::new(),
            immediate: VecDeque::new(),
            entities,
            context,
            halted: BTreeSet::new(),
            events_processed: 0,
            ended: false,
        }
    }

    /// Queue an externally created event.
    pub fn schedule(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// Queue a [`EventPayload::SimulationEnd`] at `time`.
    pub fn schedule_end(&mut self, time: SimTime) {
        let id = self.context.next_event_id();
        self.queue.push(Event {
            id: EventId(id),
            time,
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });
    }

    /// The simulation context.
    pub fn context(&self) -> &SimContext {
        &self.context
    }

    /// Mutable access to the simulation context.
    pub fn context_mut(&mut self) -> &mut SimContext {
        &mut self.context
    }

    /// The registered entities.
    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Current simulation time.
    pub fn time(&self) -> SimTime {
        self.context.time()
    }

    /// Events dispatched so far.
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Entities stopped after an error.
    pub fn halted(&self) -> &BTreeSet<EntityId> {
        &self.halted
    }

    /// Whether a [`EventPayload::SimulationEnd`] was reached.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Number of timed events still queued.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.immediate.len()
    }

    fn collect(&mut self) {
        let immediate = self.context.take_immediate();
        for event in immediate.into_iter().rev() {
            self.immediate.push_front(event);
        }
        for event in self.context.take_pending_events() {
            self.queue.push(event);
        }
    }

    fn next_event(&mut self, end: SimTime) -> Option<Event> {
        if let Some(event) = self.immediate.pop_front() {
            return Some(event);
        }
        match self.queue.peek() {
            Some(event) if event.time <= end => self.queue.pop(),
            _ => None,
        }
    }

    fn dispatch(&mut self, event: &Event) {
        for target in &event.targets {
            if self.halted.contains(target) {
                trace!(entity = target.0, "event for halted entity dropped");
                continue;
            }
            let Some(entity) = self.entities.get_mut(*target) else {
                warn!(entity = target.0, payload = ?event.payload, "event for unknown entity");
                continue;
            };
            self.context.set_source(*target);
            if let Err(e) = entity.handle_event(event, &mut self.context) {
                error!(entity = target.0, time_us = event.time.as_micros(), error = %e, "entity halted");
                metrics::counter!(metric_defs::KERNEL_HALTED_ENTITIES.name).increment(1);
                self.context.record(SimRecord::EntityHalted {
                    entity: target.0,
                    error: e.to_string(),
                });
                self.halted.insert(*target);
            }
        }
    }

    /// Run every event due at or before `end`. May be called again with a
    /// later `end` to continue. Returns the number of events dispatched.
    pub fn run_until(&mut self, end: SimTime) -> u64 {
        self.run_until_with(end, |_, _| {})
    }

    /// Like [`Kernel::run_until`], calling `observer` after every event.
    pub fn run_until_with<F>(&mut self, end: SimTime, mut observer: F) -> u64
    where
        F: FnMut(&Event, &mut SimContext),
    {
        self.collect();
        let mut processed = 0;
        while !self.ended {
            let Some(event) = self.next_event(end) else {
                break;
            };
            if event.time > self.context.time() {
                self.context.set_time(event.time);
            }
            if matches!(event.payload, EventPayload::SimulationEnd) {
                self.ended = true;
            }
            self.dispatch(&event);
            self.collect();
            observer(&event, &mut self.context);
            processed += 1;
            self.events_processed += 1;
        }
        if !self.ended && end != SimTime::MAX && self.context.time() < end {
            self.context.set_time(end);
        }
        processed
    }

    /// Run until a [`EventPayload::SimulationEnd`] or until no events are left.
    pub fn run(&mut self) -> u64 {
        self.run_until(SimTime::MAX)
    }
}
