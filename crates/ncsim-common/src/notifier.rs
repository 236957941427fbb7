//! Notifiers: named publish/subscribe channels living in the [`SimContext`].
//!
//! A notifier has three kinds of subscribers:
//!
//! - **Callbacks**, ordered by priority (highest first, ties in subscription
//!   order). Closure callbacks run synchronously inside [`SimContext::trigger`];
//!   entity callbacks are delivered as [`EventPayload::Notified`] right after
//!   the running handler returns.
//! - **Process subscriptions**, delivered as [`EventPayload::ProcessStart`].
//!   The receiving entity reports completion with [`SimContext::process_done`].
//!   See [`ProcessMode`] for how overlapping triggers are treated.
//! - **One-shot waiters**, delivered as [`EventPayload::Wakeup`] on the next
//!   trigger only.

use crate::{EntityId, EventPayload, SimContext, SimError, Signal};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// Identifier of a notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierId(pub u64);

/// Identifier of a single subscription on a notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    /// Notifier the subscription belongs to.
    pub notifier: NotifierId,
    /// Slot within the notifier.
    pub slot: u64,
}

/// Closure invoked synchronously on trigger.
pub type CallbackFn = Box<dyn FnMut(&Signal, &mut SimContext) + Send>;

/// What a callback subscription invokes.
#[derive(Clone)]
pub enum CallbackTarget {
    /// A closure.
    Fn(Arc<Mutex<CallbackFn>>),
    /// An entity, receiving [`EventPayload::Notified`] with `tag`.
    Entity {
        /// Receiving entity.
        entity: EntityId,
        /// Tag passed back in the notification.
        tag: u64,
    },
}

/// Payload of notifier deliveries to entities.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The notifier that was triggered.
    pub notifier: NotifierId,
    /// Subscription the delivery belongs to.
    pub subscription: SubscriptionId,
    /// Tag chosen at subscription time.
    pub tag: u64,
    /// Trigger value.
    pub value: Signal,
}

/// How a process subscription treats triggers while an instance is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Start a new instance on every trigger.
    NonBlocking,
    /// Ignore triggers while an instance is running.
    Blocking,
    /// Buffer trigger values and start them one at a time, in trigger order.
    Queued,
}

struct CallbackEntry {
    slot: u64,
    priority: i32,
    target: CallbackTarget,
}

struct ProcessEntry {
    slot: u64,
    entity: EntityId,
    tag: u64,
    mode: ProcessMode,
    running: bool,
    queue: VecDeque<Signal>,
}

struct Waiter {
    slot: u64,
    entity: EntityId,
    tag: u64,
}

pub(crate) struct NotifierState {
    name: String,
    owner: Option<EntityId>,
    callbacks: Vec<CallbackEntry>,
    processes: Vec<ProcessEntry>,
    waiters: Vec<Waiter>,
    next_slot: u64,
    triggers: u64,
}

impl NotifierState {
    fn new_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }
}

#[derive(Default)]
pub(crate) struct NotifierRegistry {
    notifiers: Vec<NotifierState>,
}

impl NotifierRegistry {
    fn get(&self, id: NotifierId) -> Result<&NotifierState, SimError> {
        self.notifiers
            .get(id.0 as usize)
            .ok_or(SimError::UnknownNotifier(id))
    }

    fn get_mut(&mut self, id: NotifierId) -> Result<&mut NotifierState, SimError> {
        self.notifiers
            .get_mut(id.0 as usize)
            .ok_or(SimError::UnknownNotifier(id))
    }

    fn has_callback(&self, sub: SubscriptionId) -> bool {
        self.get(sub.notifier)
            .map(|n| n.callbacks.iter().any(|c| c.slot == sub.slot))
            .unwrap_or(false)
    }
}

impl SimContext {
    /// Create a notifier.
    pub fn create_notifier(&mut self, name: impl Into<String>, owner: Option<EntityId>) -> NotifierId {
        let id = NotifierId(self.notifiers.notifiers.len() as u64);
        self.notifiers.notifiers.push(NotifierState {
            name: name.into(),
            owner,
            callbacks: Vec::new(),
            processes: Vec::new(),
            waiters: Vec::new(),
            next_slot: 0,
            triggers: 0,
        });
        id
    }

    /// Name of a notifier.
    pub fn notifier_name(&self, id: NotifierId) -> Option<&str> {
        self.notifiers.get(id).ok().map(|n| n.name.as_str())
    }

    /// Entity that owns a notifier, if any.
    pub fn notifier_owner(&self, id: NotifierId) -> Option<EntityId> {
        self.notifiers.get(id).ok().and_then(|n| n.owner)
    }

    /// Number of times a notifier was triggered.
    pub fn trigger_count(&self, id: NotifierId) -> u64 {
        self.notifiers.get(id).map(|n| n.triggers).unwrap_or(0)
    }

    fn add_callback(
        &mut self,
        id: NotifierId,
        priority: i32,
        target: CallbackTarget,
    ) -> Result<SubscriptionId, SimError> {
        let state = self.notifiers.get_mut(id)?;
        let slot = state.new_slot();
        let pos = state
            .callbacks
            .iter()
            .position(|c| c.priority < priority)
            .unwrap_or(state.callbacks.len());
        state.callbacks.insert(
            pos,
            CallbackEntry {
                slot,
                priority,
                target,
            },
        );
        Ok(SubscriptionId { notifier: id, slot })
    }

    /// Subscribe a closure. Higher priorities run first.
    pub fn subscribe_callback<F>(&mut self, id: NotifierId, priority: i32, callback: F) -> Result<SubscriptionId, SimError>
    where
        F: FnMut(&Signal, &mut SimContext) + Send + 'static,
    {
        let boxed: CallbackFn = Box::new(callback);
        self.add_callback(id, priority, CallbackTarget::Fn(Arc::new(Mutex::new(boxed))))
    }

    /// Subscribe an entity callback, delivered as [`EventPayload::Notified`].
    pub fn subscribe_entity(
        &mut self,
        id: NotifierId,
        priority: i32,
        entity: EntityId,
        tag: u64,
    ) -> Result<SubscriptionId, SimError> {
        self.add_callback(id, priority, CallbackTarget::Entity { entity, tag })
    }

    /// Remove a callback subscription. Returns whether it existed. A callback
    /// removed during a trigger is not invoked for the rest of that trigger.
    pub fn unsubscribe(&mut self, sub: SubscriptionId) -> bool {
        match self.notifiers.get_mut(sub.notifier) {
            Ok(state) => {
                let before = state.callbacks.len();
                state.callbacks.retain(|c| c.slot != sub.slot);
                state.callbacks.len() != before
            }
            Err(_) => false,
        }
    }

    /// Subscribe an entity as a process.
    pub fn subscribe_process(
        &mut self,
        id: NotifierId,
        entity: EntityId,
        tag: u64,
        mode: ProcessMode,
    ) -> Result<SubscriptionId, SimError> {
        let state = self.notifiers.get_mut(id)?;
        let slot = state.new_slot();
        state.processes.push(ProcessEntry {
            slot,
            entity,
            tag,
            mode,
            running: false,
            queue: VecDeque::new(),
        });
        Ok(SubscriptionId { notifier: id, slot })
    }

    /// Remove a process subscription. An instance that is already running is
    /// not cancelled; buffered values are discarded.
    pub fn unsubscribe_process(&mut self, sub: SubscriptionId) -> bool {
        match self.notifiers.get_mut(sub.notifier) {
            Ok(state) => {
                let before = state.processes.len();
                state.processes.retain(|p| p.slot != sub.slot);
                state.processes.len() != before
            }
            Err(_) => false,
        }
    }

    /// Resume `entity` with [`EventPayload::Wakeup`] on the next trigger.
    pub fn wait(&mut self, id: NotifierId, entity: EntityId, tag: u64) -> Result<SubscriptionId, SimError> {
        let state = self.notifiers.get_mut(id)?;
        let slot = state.new_slot();
        state.waiters.push(Waiter { slot, entity, tag });
        Ok(SubscriptionId { notifier: id, slot })
    }

    /// Report that the process instance started for `sub` has finished.
    /// Queued subscriptions start their next buffered value, if any.
    pub fn process_done(&mut self, sub: SubscriptionId) {
        let next = match self.notifiers.get_mut(sub.notifier) {
            Ok(state) => match state.processes.iter_mut().find(|p| p.slot == sub.slot) {
                Some(process) => {
                    let queued = if process.mode == ProcessMode::Queued {
                        process.queue.pop_front()
                    } else {
                        None
                    };
                    match queued {
                        Some(value) => Some((process.entity, process.tag, value)),
                        None => {
                            process.running = false;
                            None
                        }
                    }
                }
                None => None,
            },
            Err(_) => None,
        };
        if let Some((entity, tag, value)) = next {
            self.deliver(
                entity,
                EventPayload::ProcessStart(Notification {
                    notifier: sub.notifier,
                    subscription: sub,
                    tag,
                    value,
                }),
            );
        }
    }

    /// Trigger a notifier with `value`.
    pub fn trigger(&mut self, id: NotifierId, value: Signal) -> Result<(), SimError> {
        let plan: Vec<(u64, CallbackTarget)> = {
            let state = self.notifiers.get_mut(id)?;
            state.triggers += 1;
            trace!(notifier = %state.name, "trigger");
            state
                .callbacks
                .iter()
                .map(|c| (c.slot, c.target.clone()))
                .collect()
        };

        for (slot, target) in plan {
            let sub = SubscriptionId { notifier: id, slot };
            if !self.notifiers.has_callback(sub) {
                continue;
            }
            match target {
                CallbackTarget::Fn(callback) => match callback.try_lock() {
                    Some(mut guard) => {
                        let f: &mut CallbackFn = &mut guard;
                        f(&value, self);
                    }
                    None => {
                        warn!(
                            notifier = self.notifier_name(id).unwrap_or("?"),
                            "callback re-entered by its own trigger, skipped"
                        );
                    }
                },
                CallbackTarget::Entity { entity, tag } => {
                    self.deliver(
                        entity,
                        EventPayload::Notified(Notification {
                            notifier: id,
                            subscription: sub,
                            tag,
                            value: value.clone(),
                        }),
                    );
                }
            }
        }

        let mut starts = Vec::new();
        let waiters = {
            let state = self.notifiers.get_mut(id)?;
            for process in state.processes.iter_mut() {
                let start = match process.mode {
                    ProcessMode::NonBlocking => true,
                    ProcessMode::Blocking => !process.running,
                    ProcessMode::Queued => {
                        if process.running {
                            process.queue.push_back(value.clone());
                        }
                        !process.running
                    }
                };
                if start {
                    process.running = true;
                    starts.push((process.entity, process.slot, process.tag));
                }
            }
            std::mem::take(&mut state.waiters)
        };

        for (entity, slot, tag) in starts {
            self.deliver(
                entity,
                EventPayload::ProcessStart(Notification {
                    notifier: id,
                    subscription: SubscriptionId { notifier: id, slot },
                    tag,
                    value: value.clone(),
                }),
            );
        }
        for waiter in waiters {
            self.deliver(
                waiter.entity,
                EventPayload::Wakeup(Notification {
                    notifier: id,
                    subscription: SubscriptionId {
                        notifier: id,
                        slot: waiter.slot,
                    },
                    tag: waiter.tag,
                    value: value.clone(),
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attenuation(signal: &Signal) -> f64 {
        match signal {
            Signal::Attenuation(v) => *v,
            _ => f64::NAN,
        }
    }

    #[test]
    fn test_callbacks_run_by_priority() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, label) in [(0, "low"), (5, "high"), (0, "low2"), (-1, "after")] {
            let order = order.clone();
            ctx.subscribe_callback(n, priority, move |_, _| order.lock().push(label))
                .unwrap();
        }
        ctx.trigger(n, Signal::Empty).unwrap();
        assert_eq!(*order.lock(), vec!["high", "low", "low2", "after"]);
        assert_eq!(ctx.trigger_count(n), 1);
    }

    #[test]
    fn test_unsubscribe_during_trigger() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        let calls = Arc::new(Mutex::new(0));
        let victim = Arc::new(Mutex::new(None));
        {
            let victim = victim.clone();
            ctx.subscribe_callback(n, 1, move |_, ctx| {
                if let Some(sub) = *victim.lock() {
                    ctx.unsubscribe(sub);
                }
            })
            .unwrap();
        }
        let counted = calls.clone();
        let sub = ctx
            .subscribe_callback(n, 0, move |_, _| *counted.lock() += 1)
            .unwrap();
        *victim.lock() = Some(sub);
        ctx.trigger(n, Signal::Empty).unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn test_entity_callback_delivery() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        ctx.subscribe_entity(n, 0, EntityId(4), 9).unwrap();
        ctx.trigger(n, Signal::Attenuation(3.0)).unwrap();
        let events = ctx.take_immediate();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].targets, vec![EntityId(4)]);
        match &events[0].payload {
            EventPayload::Notified(notification) => {
                assert_eq!(notification.tag, 9);
                assert_eq!(attenuation(&notification.value), 3.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_queued_process_serializes_triggers() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        let sub = ctx
            .subscribe_process(n, EntityId(1), 0, ProcessMode::Queued)
            .unwrap();
        ctx.trigger(n, Signal::Attenuation(1.0)).unwrap();
        ctx.trigger(n, Signal::Attenuation(2.0)).unwrap();
        ctx.trigger(n, Signal::Attenuation(3.0)).unwrap();

        let started: Vec<f64> = ctx
            .take_immediate()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ProcessStart(n) => Some(attenuation(&n.value)),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![1.0]);

        ctx.process_done(sub);
        ctx.process_done(sub);
        ctx.process_done(sub);
        let replayed: Vec<f64> = ctx
            .take_immediate()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ProcessStart(n) => Some(attenuation(&n.value)),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![2.0, 3.0]);

        // idle again: the next trigger starts straight away
        ctx.trigger(n, Signal::Attenuation(4.0)).unwrap();
        assert_eq!(ctx.take_immediate().len(), 1);
    }

    #[test]
    fn test_blocking_and_non_blocking_processes() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        let blocking = ctx
            .subscribe_process(n, EntityId(1), 0, ProcessMode::Blocking)
            .unwrap();
        ctx.subscribe_process(n, EntityId(2), 0, ProcessMode::NonBlocking)
            .unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        let targets: Vec<EntityId> = ctx.take_immediate().iter().map(|e| e.targets[0]).collect();
        assert_eq!(targets, vec![EntityId(1), EntityId(2), EntityId(2)]);

        ctx.process_done(blocking);
        assert!(ctx.take_immediate().is_empty());
        ctx.trigger(n, Signal::Empty).unwrap();
        assert_eq!(ctx.take_immediate().len(), 2);
    }

    #[test]
    fn test_unsubscribed_process_drops_queue() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        let sub = ctx
            .subscribe_process(n, EntityId(1), 0, ProcessMode::Queued)
            .unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        ctx.take_immediate();
        assert!(ctx.unsubscribe_process(sub));
        ctx.process_done(sub);
        assert!(ctx.take_immediate().is_empty());
    }

    #[test]
    fn test_wait_is_one_shot() {
        let mut ctx = SimContext::new(0);
        let n = ctx.create_notifier("n", None);
        ctx.wait(n, EntityId(3), 1).unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        ctx.trigger(n, Signal::Empty).unwrap();
        let events = ctx.take_immediate();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EventPayload::Wakeup(_)));
    }

    #[test]
    fn test_nested_trigger_from_callback() {
        let mut ctx = SimContext::new(0);
        let outer = ctx.create_notifier("outer", None);
        let inner = ctx.create_notifier("inner", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            ctx.subscribe_callback(inner, 0, move |signal, _| seen.lock().push(attenuation(signal)))
                .unwrap();
        }
        ctx.subscribe_callback(outer, 0, move |_, ctx| {
            ctx.trigger(inner, Signal::Attenuation(7.0)).unwrap();
        })
        .unwrap();
        ctx.trigger(outer, Signal::Empty).unwrap();
        assert_eq!(*seen.lock(), vec![7.0]);
    }

    #[test]
    fn test_unknown_notifier() {
        let mut ctx = SimContext::new(0);
        assert!(matches!(
            ctx.trigger(NotifierId(42), Signal::Empty),
            Err(SimError::UnknownNotifier(NotifierId(42)))
        ));
    }
}
