//! Module/port/gate framework for composing protocol layers.
//!
//! A [`Module`] exposes named [`Port`]s. A port has an input and an output
//! gate. Sending on a gate triggers the gate's "receives" notifier and then
//! forwards the value to every gate it is connected to. Layers listen on the
//! input gate of their ports with [`SimContext::listen`].

use crate::notifier::{NotifierId, ProcessMode, SubscriptionId};
use crate::{EntityId, SimContext, SimError, Signal};
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

/// Identifier of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GateId(pub u64);

struct GateEntry {
    name: String,
    receives: NotifierId,
    targets: Vec<GateId>,
}

#[derive(Default)]
pub(crate) struct GateRegistry {
    gates: Vec<GateEntry>,
}

impl GateRegistry {
    fn get(&self, id: GateId) -> Result<&GateEntry, SimError> {
        self.gates.get(id.0 as usize).ok_or(SimError::UnknownGate(id))
    }

    fn get_mut(&mut self, id: GateId) -> Result<&mut GateEntry, SimError> {
        self.gates.get_mut(id.0 as usize).ok_or(SimError::UnknownGate(id))
    }
}

/// A bidirectional port: values arrive on `input` and leave via `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Port name, unique within its module.
    pub name: String,
    /// Gate other modules send to.
    pub input: GateId,
    /// Gate this module sends from.
    pub output: GateId,
}

/// How a port listener is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Delivered as [`EventPayload::Notified`](crate::EventPayload::Notified)
    /// on every send, overlapping freely.
    Immediate,
    /// Delivered as [`EventPayload::ProcessStart`](crate::EventPayload::ProcessStart),
    /// one value at a time in arrival order. The listener calls
    /// [`SimContext::process_done`] when it is ready for the next value.
    Queued,
}

/// Handle of a registered port listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// An immediate listener.
    Callback(SubscriptionId),
    /// A queued listener.
    Process(SubscriptionId),
}

impl Listener {
    /// Underlying subscription.
    pub fn subscription(&self) -> SubscriptionId {
        match self {
            Listener::Callback(sub) | Listener::Process(sub) => *sub,
        }
    }
}

/// A named container of ports and nested modules.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    owner: Option<EntityId>,
    ports: BTreeMap<String, Port>,
    submodules: BTreeMap<String, Module>,
}

impl Module {
    /// Create a module without ports.
    pub fn new(name: impl Into<String>, owner: Option<EntityId>) -> Self {
        Module {
            name: name.into(),
            owner,
            ports: BTreeMap::new(),
            submodules: BTreeMap::new(),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity implementing the module.
    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    /// Add a port with fresh input and output gates.
    pub fn add_port(&mut self, ctx: &mut SimContext, name: &str) -> Result<Port, SimError> {
        if self.ports.contains_key(name) {
            return Err(SimError::DuplicatePort {
                module: self.name.clone(),
                port: name.to_string(),
            });
        }
        let base = format!("({}).{}", self.name, name);
        let port = Port {
            name: name.to_string(),
            input: ctx.create_gate(format!("{}.input", base)),
            output: ctx.create_gate(format!("{}.output", base)),
        };
        self.ports.insert(name.to_string(), port.clone());
        Ok(port)
    }

    /// Look up a port.
    pub fn port(&self, name: &str) -> Result<&Port, SimError> {
        self.ports.get(name).ok_or_else(|| SimError::UnknownPort {
            module: self.name.clone(),
            port: name.to_string(),
        })
    }

    /// All ports, ordered by name.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    /// Nest a module.
    pub fn add_submodule(&mut self, name: &str, module: Module) -> Result<(), SimError> {
        if self.submodules.contains_key(name) {
            return Err(SimError::DuplicateSubmodule {
                module: self.name.clone(),
                name: name.to_string(),
            });
        }
        self.submodules.insert(name.to_string(), module);
        Ok(())
    }

    /// A nested module.
    pub fn submodule(&self, name: &str) -> Option<&Module> {
        self.submodules.get(name)
    }
}

impl SimContext {
    /// Create a gate and its "receives" notifier.
    pub fn create_gate(&mut self, name: impl Into<String>) -> GateId {
        let name = name.into();
        let receives = self.create_notifier(format!("{}.receives", name), None);
        let id = GateId(self.gates.gates.len() as u64);
        self.gates.gates.push(GateEntry {
            name,
            receives,
            targets: Vec::new(),
        });
        id
    }

    /// Notifier triggered whenever `gate` receives a value.
    pub fn gate_receives(&self, gate: GateId) -> Result<NotifierId, SimError> {
        Ok(self.gates.get(gate)?.receives)
    }

    /// Gate name.
    pub fn gate_name(&self, gate: GateId) -> Option<&str> {
        self.gates.get(gate).ok().map(|g| g.name.as_str())
    }

    /// Make every value sent on `from` be sent on `to` as well.
    pub fn connect(&mut self, from: GateId, to: GateId) -> Result<(), SimError> {
        self.gates.get(to)?;
        self.gates.get_mut(from)?.targets.push(to);
        Ok(())
    }

    /// Connect `a.output` to `b.input` and `b.output` to `a.input`.
    pub fn bi_connect(&mut self, a: &Port, b: &Port) -> Result<(), SimError> {
        self.connect(a.output, b.input)?;
        self.connect(b.output, a.input)
    }

    /// Send a value on a gate: trigger its "receives" notifier, then forward
    /// to connected gates in connection order. Every gate is visited at most
    /// once per send.
    pub fn send(&mut self, gate: GateId, signal: Signal) -> Result<(), SimError> {
        let mut visited = HashSet::new();
        self.send_inner(gate, &signal, &mut visited)
    }

    fn send_inner(&mut self, gate: GateId, signal: &Signal, visited: &mut HashSet<GateId>) -> Result<(), SimError> {
        if !visited.insert(gate) {
            return Ok(());
        }
        let (receives, targets) = {
            let entry = self.gates.get(gate)?;
            trace!(gate = %entry.name, signal = signal.kind(), "send");
            (entry.receives, entry.targets.clone())
        };
        self.trigger(receives, signal.clone())?;
        for target in targets {
            self.send_inner(target, signal, visited)?;
        }
        Ok(())
    }

    /// Register `entity` as the listener of the port's input gate.
    pub fn listen(&mut self, port: &Port, mode: ListenerMode, entity: EntityId, tag: u64) -> Result<Listener, SimError> {
        let receives = self.gate_receives(port.input)?;
        match mode {
            ListenerMode::Immediate => Ok(Listener::Callback(self.subscribe_entity(receives, 0, entity, tag)?)),
            ListenerMode::Queued => Ok(Listener::Process(self.subscribe_process(
                receives,
                entity,
                tag,
                ProcessMode::Queued,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventPayload;

    fn targets_of(ctx: &mut SimContext) -> Vec<(EntityId, u64)> {
        ctx.take_immediate()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Notified(n) | EventPayload::ProcessStart(n) => Some((e.targets[0], n.tag)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut ctx = SimContext::new(0);
        let mut module = Module::new("mac", None);
        module.add_port(&mut ctx, "phy").unwrap();
        assert!(matches!(
            module.add_port(&mut ctx, "phy"),
            Err(SimError::DuplicatePort { .. })
        ));
        assert!(module.port("phy").is_ok());
        assert!(matches!(module.port("network"), Err(SimError::UnknownPort { .. })));
    }

    #[test]
    fn test_bi_connect_routes_both_ways() {
        let mut ctx = SimContext::new(0);
        let mut phy = Module::new("phy", Some(EntityId(1)));
        let mut mac = Module::new("mac", Some(EntityId(2)));
        let phy_port = phy.add_port(&mut ctx, "mac").unwrap();
        let mac_port = mac.add_port(&mut ctx, "phy").unwrap();
        ctx.bi_connect(&phy_port, &mac_port).unwrap();
        ctx.listen(&phy_port, ListenerMode::Queued, EntityId(1), 10).unwrap();
        ctx.listen(&mac_port, ListenerMode::Immediate, EntityId(2), 20).unwrap();

        ctx.send(mac_port.output, Signal::Empty).unwrap();
        assert_eq!(targets_of(&mut ctx), vec![(EntityId(1), 10)]);

        ctx.send(phy_port.output, Signal::Empty).unwrap();
        assert_eq!(targets_of(&mut ctx), vec![(EntityId(2), 20)]);
    }

    #[test]
    fn test_fan_out_and_cycles() {
        let mut ctx = SimContext::new(0);
        let a = ctx.create_gate("a");
        let b = ctx.create_gate("b");
        let c = ctx.create_gate("c");
        ctx.connect(a, b).unwrap();
        ctx.connect(a, c).unwrap();
        ctx.connect(c, a).unwrap();
        for (gate, tag) in [(a, 1), (b, 2), (c, 3)] {
            let n = ctx.gate_receives(gate).unwrap();
            ctx.subscribe_entity(n, 0, EntityId(9), tag).unwrap();
        }
        ctx.send(a, Signal::Empty).unwrap();
        let tags: Vec<u64> = targets_of(&mut ctx).into_iter().map(|(_, t)| t).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_gate() {
        let mut ctx = SimContext::new(0);
        let a = ctx.create_gate("a");
        assert!(matches!(ctx.connect(a, GateId(99)), Err(SimError::UnknownGate(_))));
        assert!(ctx.send(GateId(99), Signal::Empty).is_err());
    }
}
