//! # ncsim-packet
//!
//! Packet, header and schedule types for the NCSim networked control simulator.
//!
//! Packets in the simulator are never serialized to bytes. Each part only
//! reports the number of bytes it would occupy on air, which the physical
//! layer turns into a transmission duration.
//!
//! ## Packet Structure
//!
//! - Header: one of the MAC or transport headers below
//! - Payload: a sized value, possibly another packet
//! - Trailer (optional): carried along but not counted towards the size
//!
//! ## Example
//!
//! ```rust
//! use ncsim_packet::{Header, MacAddress, NcsMacHeader, Packet, PacketType, Payload, ProtocolType};
//!
//! let header = NcsMacHeader::new(ProtocolType::Csma, PacketType::SensorData, MacAddress::from_counter(1));
//! let packet = Packet::new(Header::Ncs(header), Payload::Value(0.25));
//! assert_eq!(packet.byte_size(), 7 + 4);
//! ```

pub mod error;
pub mod schedule;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::PacketError;
pub use schedule::{
    csma_encode, tdma_encode, CsmaControllerSchedule, CsmaSchedule, Schedule, SlotAssignment,
    TdmaEntry, TdmaSchedule,
};

// ============================================================================
// Constants
// ============================================================================

/// Size of a [`SimpleMacHeader`] in bytes.
pub const SIMPLE_MAC_HEADER_SIZE: usize = 13;

/// Size of a [`SimpleTransportHeader`] in bytes.
pub const SIMPLE_TRANSPORT_HEADER_SIZE: usize = 12;

/// Length of a MAC address in bytes.
pub const MAC_ADDRESS_LEN: usize = 6;

// ============================================================================
// Addresses
// ============================================================================

/// A 6-byte device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    /// Address reserved for the resource manager of the contention-free protocol.
    pub const RESOURCE_MANAGER: MacAddress = MacAddress([0; MAC_ADDRESS_LEN]);

    /// Build the address for a counter value (big-endian, lower 48 bits).
    pub fn from_counter(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut addr = [0u8; MAC_ADDRESS_LEN];
        addr.copy_from_slice(&bytes[2..]);
        MacAddress(addr)
    }

    /// Numeric value of the address.
    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; MAC_ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Header Types
// ============================================================================

/// Medium access discipline of a networked control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    /// Slotted access, one device per slot.
    Tdma,
    /// Probabilistic access per slot.
    Csma,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Tdma => write!(f, "tdma"),
            ProtocolType::Csma => write!(f, "csma"),
        }
    }
}

/// Type discriminator of an [`NcsMacHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// A schedule issued by the gateway.
    Schedule = 0,
    /// A sensor sample.
    SensorData = 1,
    /// A control value for an actuator.
    Control = 2,
}

impl PacketType {
    /// Raw header byte value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short label for metrics and logs.
    pub fn as_label(self) -> &'static str {
        match self {
            PacketType::Schedule => "schedule",
            PacketType::SensorData => "sensor_data",
            PacketType::Control => "control",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Schedule),
            1 => Ok(PacketType::SensorData),
            2 => Ok(PacketType::Control),
            other => Err(PacketError::UnknownPacketType(other)),
        }
    }
}

/// Header used by the contention-free MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleMacHeader {
    /// Sender address.
    pub source: MacAddress,
    /// Receiver address.
    pub dest: MacAddress,
    /// Single flag byte. `1` marks a medium grant from the resource manager.
    pub flag: u8,
}

/// Transport header carrying addresses down to the contention-free MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTransportHeader {
    /// Sender address.
    pub source: MacAddress,
    /// Receiver address.
    pub dest: MacAddress,
}

/// MAC header of the networked control system protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcsMacHeader {
    /// Protocol the header was built for; determines its size.
    pub protocol: ProtocolType,
    /// Packet type.
    pub packet_type: PacketType,
    /// Sender address.
    pub source: MacAddress,
    /// Receiver address, if any.
    pub dest: Option<MacAddress>,
    /// "More packets follow" marker.
    pub more: Option<u8>,
}

impl NcsMacHeader {
    /// Create a header without destination.
    pub fn new(protocol: ProtocolType, packet_type: PacketType, source: MacAddress) -> Self {
        NcsMacHeader {
            protocol,
            packet_type,
            source,
            dest: None,
            more: None,
        }
    }

    /// Set the destination address.
    pub fn with_dest(mut self, dest: MacAddress) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Size on air. TDMA addresses are implied by the slot, so only the
    /// type byte is counted. CSMA frames other than schedules carry the
    /// source address as well.
    pub fn byte_size(&self) -> usize {
        match (self.protocol, self.packet_type) {
            (ProtocolType::Tdma, _) => 1,
            (ProtocolType::Csma, PacketType::Schedule) => 1,
            (ProtocolType::Csma, _) => 1 + MAC_ADDRESS_LEN,
        }
    }
}

/// Any header a packet can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Header {
    /// Contention-free MAC header.
    SimpleMac(SimpleMacHeader),
    /// Transport header.
    SimpleTransport(SimpleTransportHeader),
    /// Networked control system MAC header.
    Ncs(NcsMacHeader),
    /// Opaque header of the given size.
    Fake(usize),
}

impl Header {
    /// Size on air in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            Header::SimpleMac(_) => SIMPLE_MAC_HEADER_SIZE,
            Header::SimpleTransport(_) => SIMPLE_TRANSPORT_HEADER_SIZE,
            Header::Ncs(h) => h.byte_size(),
            Header::Fake(size) => *size,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::SimpleMac(h) => write!(
                f,
                "(SimpleMacHeader: source: {}, dest: {}, flag: {})",
                h.source, h.dest, h.flag
            ),
            Header::SimpleTransport(h) => write!(
                f,
                "(SimpleTransportHeader: source: {}, dest: {})",
                h.source, h.dest
            ),
            Header::Ncs(h) => {
                write!(f, "(NcsMacHeader: {} type {}", h.protocol, h.packet_type.as_u8())?;
                write!(f, ", source: {}", h.source)?;
                if let Some(dest) = h.dest {
                    write!(f, ", dest: {}", dest)?;
                }
                write!(f, ")")
            }
            Header::Fake(size) => write!(f, "(FakeHeader: {} bytes)", size),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Packet payload. Values are sized by the length of their textual form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque payload of the given size.
    Fake(usize),
    /// Text message.
    Text(String),
    /// Sensor sample or control value.
    Value(f64),
    /// Number of granted slots.
    Slots(u32),
    /// A schedule with its precomputed encoded size.
    Schedule {
        /// The schedule.
        schedule: Schedule,
        /// Encoded size in bytes.
        size: usize,
    },
    /// Sender clock in microseconds.
    Clock(u64),
    /// Nested packet.
    Packet(Box<Packet>),
}

impl Payload {
    /// Size on air in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            Payload::Fake(size) => *size,
            Payload::Text(text) => text.len(),
            Payload::Value(value) => value.to_string().len(),
            Payload::Slots(slots) => slots.to_string().len(),
            Payload::Schedule { size, .. } => *size,
            Payload::Clock(micros) => (*micros as f64 / 1_000_000.0).to_string().len(),
            Payload::Packet(packet) => packet.byte_size(),
        }
    }

    /// The contained value, if this is a [`Payload::Value`].
    pub fn as_value(&self) -> Option<f64> {
        match self {
            Payload::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Fake(size) => write!(f, "(FakeTransmittable: {} bytes)", size),
            Payload::Text(text) => write!(f, "{}", text),
            Payload::Value(value) => write!(f, "{}", value),
            Payload::Slots(slots) => write!(f, "{}", slots),
            Payload::Schedule { schedule, .. } => write!(f, "{}", schedule),
            Payload::Clock(micros) => write!(f, "{}", *micros as f64 / 1_000_000.0),
            Payload::Packet(packet) => write!(f, "{}", packet),
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A packet: header, payload and an optional trailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet header.
    pub header: Header,
    /// Packet payload.
    pub payload: Payload,
    /// Trailer, not counted towards [`Packet::byte_size`].
    pub trailer: Option<Payload>,
}

impl Packet {
    /// Create a packet without trailer.
    pub fn new(header: Header, payload: Payload) -> Self {
        Packet {
            header,
            payload,
            trailer: None,
        }
    }

    /// Attach a trailer.
    pub fn with_trailer(mut self, trailer: Payload) -> Self {
        self.trailer = Some(trailer);
        self
    }

    /// Header plus payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.header.byte_size() + self.payload.byte_size()
    }

    /// Size in bits.
    pub fn bit_size(&self) -> usize {
        self.byte_size() * 8
    }

    /// Seconds needed to send the whole packet at `bitrate` bits per second.
    pub fn transmission_time(&self, bitrate: f64) -> f64 {
        self.bit_size() as f64 / bitrate
    }

    /// The NCS MAC header, or an error for any other header kind.
    pub fn ncs_header(&self) -> Result<&NcsMacHeader, PacketError> {
        match &self.header {
            Header::Ncs(h) => Ok(h),
            _ => Err(PacketError::UnexpectedHeader {
                expected: "NcsMacHeader",
            }),
        }
    }

    /// The contention-free MAC header, or an error for any other header kind.
    pub fn simple_mac_header(&self) -> Result<&SimpleMacHeader, PacketError> {
        match &self.header {
            Header::SimpleMac(h) => Ok(h),
            _ => Err(PacketError::UnexpectedHeader {
                expected: "SimpleMacHeader",
            }),
        }
    }

    /// The transport header, or an error for any other header kind.
    pub fn simple_transport_header(&self) -> Result<&SimpleTransportHeader, PacketError> {
        match &self.header {
            Header::SimpleTransport(h) => Ok(h),
            _ => Err(PacketError::UnexpectedHeader {
                expected: "SimpleTransportHeader",
            }),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.header, self.payload)?;
        if let Some(trailer) = &self.trailer {
            write!(f, ",{}", trailer)?;
        }
        Ok(())
    }
}
