//! Values carried by notifiers and ports, and the commands exchanged between
//! protocol layers.

use crate::radio::{Mcs, Transmission};
use crate::{EntityId, EventPayload, SimContext, SimTime};
use ncsim_packet::{MacAddress, Packet, Payload, Schedule};
use std::sync::Arc;

/// A value sent through a port or passed to a notifier trigger.
#[derive(Debug, Clone)]
pub enum Signal {
    /// No value.
    Empty,
    /// A packet.
    Packet(Packet),
    /// A bare payload, e.g. a received packet's content handed upwards.
    Payload(Payload),
    /// A command for another layer.
    Message(StackMessage),
    /// A transmission that just started.
    Transmission(Arc<Transmission>),
    /// A new device position.
    Position {
        /// X coordinate in metres.
        x: f64,
        /// Y coordinate in metres.
        y: f64,
    },
    /// A new attenuation value in dB.
    Attenuation(f64),
    /// A change of received power in mW.
    PowerDelta(f64),
    /// A schedule.
    Schedule(Schedule),
}

/// Where to report completion of a [`StackMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Entity waiting for completion.
    pub entity: EntityId,
    /// Token echoed in [`EventPayload::Processed`].
    pub token: u64,
}

/// Commands understood by the stack layers.
#[derive(Debug, Clone)]
pub enum Command {
    /// PHY: send a packet.
    Transmit {
        /// Packet to send.
        packet: Packet,
        /// Transmit power in dBm.
        power_dbm: f64,
        /// Modulation and coding scheme for header and payload.
        mcs: Mcs,
    },
    /// MAC: listen for a packet addressed to this device for `duration`.
    /// Completes with the packet's payload, or with nothing on timeout.
    Receive {
        /// Listening time.
        duration: SimTime,
    },
    /// Resource manager MAC: grant the medium to `dest`.
    Assign {
        /// Device allowed to send.
        dest: MacAddress,
        /// Number of granted time slots.
        slots: u32,
    },
    /// Gateway MAC: broadcast a schedule.
    SendSchedule {
        /// The schedule.
        schedule: Schedule,
        /// Gateway clock the schedule's slots are relative to.
        clock: SimTime,
    },
    /// Gateway MAC: send a control value to an actuator.
    SendControl {
        /// Control value.
        control: f64,
        /// Actuator address.
        receiver: MacAddress,
    },
    /// Sensor MAC: replace the data to send in the next own slot.
    SensorData {
        /// Latest sensor state.
        state: f64,
    },
}

/// A command plus the address to report completion to.
#[derive(Debug, Clone)]
pub struct StackMessage {
    /// The command.
    pub command: Command,
    /// Completion target, if the sender waits for it.
    pub reply: Option<Reply>,
}

impl StackMessage {
    /// A command nobody waits for.
    pub fn new(command: Command) -> Self {
        StackMessage {
            command,
            reply: None,
        }
    }

    /// A command whose completion is reported to `entity` with `token`.
    pub fn with_reply(command: Command, entity: EntityId, token: u64) -> Self {
        StackMessage {
            command,
            reply: Some(Reply { entity, token }),
        }
    }

    /// Report completion to the waiting entity, if any.
    pub fn set_processed(&self, ctx: &mut SimContext, value: Option<Signal>) {
        if let Some(reply) = self.reply {
            ctx.deliver(
                reply.entity,
                EventPayload::Processed {
                    token: reply.token,
                    value,
                },
            );
        }
    }
}

impl Signal {
    /// The packet, if this signal carries one.
    pub fn as_packet(&self) -> Option<&Packet> {
        match self {
            Signal::Packet(p) => Some(p),
            _ => None,
        }
    }

    /// The stack message, if this signal carries one.
    pub fn as_message(&self) -> Option<&StackMessage> {
        match self {
            Signal::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Short name of the variant for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Empty => "empty",
            Signal::Packet(_) => "packet",
            Signal::Payload(_) => "payload",
            Signal::Message(_) => "message",
            Signal::Transmission(_) => "transmission",
            Signal::Position { .. } => "position",
            Signal::Attenuation(_) => "attenuation",
            Signal::PowerDelta(_) => "power_delta",
            Signal::Schedule(_) => "schedule",
        }
    }
}
