//! # ncsim-mac
//!
//! MAC layers for NCSim.
//!
//! This crate provides:
//! - TDMA roles of the networked control system: [`SensorMacTdma`],
//!   [`ActuatorMacTdma`] and [`GatewayMac`]
//! - A probabilistic sensor MAC following CSMA schedules ([`SensorMacCsma`])
//! - The contention-free polled protocol: [`SimpleMac`] on the devices and
//!   [`SimpleRrmMac`] on the resource manager
//!
//! Every layer is an entity owning a module with a `phy` port, connected to
//! the `mac` port of a [`SimplePhy`](ncsim_phy::SimplePhy), and an upper
//! port (`network` or `transport`) towards the device.

pub mod csma;
pub mod simple;
pub mod tdma;

use ncsim_common::{
    Command, EntityId, ListenerMode, LinkSettings, Module, Packet, Port, ProtocolType, SimContext,
    SimError, SimTime, Signal, StackMessage,
};

pub use csma::SensorMacCsma;
pub use simple::{SimpleMac, SimpleRrmMac, SIMPLE_MAC_QUEUE_LIMIT};
pub use tdma::{ActuatorMacTdma, GatewayMac, SensorMacTdma};

/// Tag of the `phy` port listener.
pub(crate) const TAG_PHY: u64 = 1;
/// Tag of the upper port listener.
pub(crate) const TAG_UPPER: u64 = 2;

/// Length of one schedule slot unless configured otherwise.
pub const DEFAULT_SCHEDULE_SLOT: SimTime = SimTime::from_millis(40);

// ============================================================================
// Configuration
// ============================================================================

/// Parameters shared by the schedule driven MAC layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacConfig {
    /// Length of one schedule slot.
    pub slot_length: SimTime,
    /// Transmit power and coding.
    pub link: LinkSettings,
    /// Protocol the headers are built for.
    pub protocol: ProtocolType,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            slot_length: DEFAULT_SCHEDULE_SLOT,
            link: LinkSettings::default(),
            protocol: ProtocolType::Tdma,
        }
    }
}

// ============================================================================
// Ports
// ============================================================================

/// The module of a MAC layer with its two ports.
#[derive(Debug, Clone)]
pub struct MacPorts {
    module: Module,
    phy: Port,
    upper: Port,
}

impl MacPorts {
    /// Create the module `"{device}.mac"`, connect its `phy` port to
    /// `phy_mac_port` and register `owner` as listener on both ports.
    pub fn new(
        ctx: &mut SimContext,
        owner: EntityId,
        device: &str,
        upper_name: &str,
        phy_mac_port: &Port,
        upper_mode: ListenerMode,
    ) -> Result<Self, SimError> {
        let mut module = Module::new(format!("{}.mac", device), Some(owner));
        let phy = module.add_port(ctx, "phy")?;
        let upper = module.add_port(ctx, upper_name)?;
        ctx.bi_connect(&phy, phy_mac_port)?;
        ctx.listen(&phy, ListenerMode::Immediate, owner, TAG_PHY)?;
        ctx.listen(&upper, upper_mode, owner, TAG_UPPER)?;
        Ok(MacPorts { module, phy, upper })
    }

    /// The module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Port towards the physical layer.
    pub fn phy(&self) -> &Port {
        &self.phy
    }

    /// Port towards the device.
    pub fn upper(&self) -> &Port {
        &self.upper
    }

    /// Hand `packet` to the physical layer; completion comes back as
    /// `Processed { token }`.
    pub fn transmit(
        &self,
        ctx: &mut SimContext,
        owner: EntityId,
        packet: Packet,
        link: &LinkSettings,
        token: u64,
    ) -> Result<(), SimError> {
        let command = Command::Transmit {
            packet,
            power_dbm: link.power_dbm,
            mcs: link.mcs,
        };
        ctx.send(
            self.phy.output,
            Signal::Message(StackMessage::with_reply(command, owner, token)),
        )
    }

    /// Send a value up to the device.
    pub fn deliver_up(&self, ctx: &mut SimContext, signal: Signal) -> Result<(), SimError> {
        ctx.send(self.upper.output, signal)
    }
}

/// Protocol error for a header the layer cannot handle.
pub(crate) fn unexpected(owner: EntityId, what: impl std::fmt::Display) -> SimError {
    SimError::protocol(owner, format!("unexpected {}", what))
}
