//! TDMA and CSMA schedules and their encoded sizes.

use crate::{MacAddress, PacketError, ProtocolType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Tolerance when checking that CSMA probabilities sum to one.
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-6;

/// Bytes per schedule line.
const ENTRY_BYTES: usize = 7;
/// Bytes per line that repeats an already listed device in a compressed schedule.
const REPEATED_ENTRY_BYTES: usize = 3;
/// Trailing time byte.
const TRAILER_BYTES: usize = 1;

// ============================================================================
// TDMA
// ============================================================================

/// One slot of a scheduler decision: the device allowed to send and a flag.
///
/// For actuators, flag `1` reserves the slot for a control message from the
/// gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    /// Device owning the slot.
    pub device: MacAddress,
    /// Slot flag.
    pub flag: u8,
}

impl SlotAssignment {
    /// Create an assignment.
    pub fn new(device: MacAddress, flag: u8) -> Self {
        SlotAssignment { device, flag }
    }
}

/// A run of consecutive slots owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdmaEntry {
    /// First slot of the run (1-based).
    pub start: u32,
    /// Device owning the run.
    pub device: MacAddress,
    /// Flag of the first slot in the run.
    pub flag: u8,
    /// Literal run marker, always `1`.
    pub run: u8,
}

/// A TDMA schedule. Consecutive slots of the same device are collapsed into
/// one entry; the run ends where the next entry starts, and the last run ends
/// at the end marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TdmaSchedule {
    action: Vec<SlotAssignment>,
    entries: Vec<TdmaEntry>,
    end: u32,
}

impl TdmaSchedule {
    /// Build a schedule from one assignment per slot.
    pub fn new(action: Vec<SlotAssignment>) -> Self {
        let mut entries: Vec<TdmaEntry> = Vec::new();
        let mut last: Option<MacAddress> = None;
        for (i, slot) in action.iter().enumerate() {
            if last != Some(slot.device) {
                entries.push(TdmaEntry {
                    start: i as u32 + 1,
                    device: slot.device,
                    flag: slot.flag,
                    run: 1,
                });
            }
            last = Some(slot.device);
        }
        let end = action.len() as u32 + 1;
        let schedule = TdmaSchedule {
            action,
            entries,
            end,
        };
        debug!(content = %schedule, "TDMA schedule created");
        schedule
    }

    /// The per-slot decision this schedule was built from.
    pub fn action(&self) -> &[SlotAssignment] {
        &self.action
    }

    /// Collapsed entries.
    pub fn entries(&self) -> &[TdmaEntry] {
        &self.entries
    }

    /// End marker: one past the last assigned slot.
    pub fn end_time(&self) -> u32 {
        self.end
    }

    /// The first span `[start, end)` owned by `device` that starts after
    /// `after_slot`, or `None` when no such span exists.
    pub fn next_relevant_timespan(&self, device: MacAddress, after_slot: u32) -> Option<(u32, u32)> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.device == device && entry.start > after_slot {
                let end = self
                    .entries
                    .get(i + 1)
                    .map(|next| next.start)
                    .unwrap_or(self.end);
                return Some((entry.start, end));
            }
        }
        None
    }

    /// Entries whose flag reserves the slot for a control message to one of
    /// `actuators`.
    pub fn control_entries<'a>(
        &'a self,
        actuators: &'a [MacAddress],
    ) -> impl Iterator<Item = &'a TdmaEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.flag == 1 && actuators.contains(&e.device))
    }
}

impl fmt::Display for TdmaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            write!(f, "{} {} {} {} ", entry.start, entry.device, entry.flag, entry.run)?;
        }
        write!(f, "{}", self.end)
    }
}

// ============================================================================
// CSMA
// ============================================================================

fn check_probabilities(pairs: &[(MacAddress, f64)]) -> Result<(), PacketError> {
    for (_, p) in pairs {
        if !(0.0..=1.0).contains(p) {
            return Err(PacketError::ProbabilityOutOfRange(*p));
        }
    }
    let sum: f64 = pairs.iter().map(|(_, p)| p).sum();
    if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
        return Err(PacketError::InvalidProbabilities { sum });
    }
    Ok(())
}

fn write_pairs(f: &mut fmt::Formatter<'_>, pairs: &[(MacAddress, f64)]) -> fmt::Result {
    for (i, (addr, p)) in pairs.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{} {}", addr, p)?;
    }
    Ok(())
}

/// A CSMA schedule: a send probability per device, valid for `length` slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsmaSchedule {
    pairs: Vec<(MacAddress, f64)>,
    length: u32,
}

impl CsmaSchedule {
    /// Build a schedule. Fails unless the probabilities sum to one.
    pub fn new(pairs: Vec<(MacAddress, f64)>, length: u32) -> Result<Self, PacketError> {
        check_probabilities(&pairs)?;
        let schedule = CsmaSchedule { pairs, length };
        debug!(content = %schedule, "CSMA schedule created");
        Ok(schedule)
    }

    /// The `(device, probability)` pairs.
    pub fn pairs(&self) -> &[(MacAddress, f64)] {
        &self.pairs
    }

    /// Probability assigned to `addr`, `0` if it is not listed.
    pub fn get_my_p(&self, addr: MacAddress) -> f64 {
        self.pairs
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    /// Number of slots the schedule is valid for.
    pub fn end_time(&self) -> u32 {
        self.length
    }
}

impl fmt::Display for CsmaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, &self.pairs)?;
        if !self.pairs.is_empty() {
            write!(f, " ")?;
        }
        write!(f, "{}", self.length)
    }
}

/// Send probabilities for controllers, without a validity length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsmaControllerSchedule {
    pairs: Vec<(MacAddress, f64)>,
}

impl CsmaControllerSchedule {
    /// Build a schedule. Fails unless the probabilities sum to one.
    pub fn new(pairs: Vec<(MacAddress, f64)>) -> Result<Self, PacketError> {
        check_probabilities(&pairs)?;
        Ok(CsmaControllerSchedule { pairs })
    }

    /// The `(device, probability)` pairs.
    pub fn pairs(&self) -> &[(MacAddress, f64)] {
        &self.pairs
    }
}

impl fmt::Display for CsmaControllerSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, &self.pairs)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// A schedule issued by the gateway for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    /// Slot assignments.
    Tdma(TdmaSchedule),
    /// Send probabilities.
    Csma(CsmaSchedule),
}

impl Schedule {
    /// Protocol the schedule belongs to.
    pub fn protocol(&self) -> ProtocolType {
        match self {
            Schedule::Tdma(_) => ProtocolType::Tdma,
            Schedule::Csma(_) => ProtocolType::Csma,
        }
    }

    /// Number of slots covered before the next schedule is due.
    pub fn end_time(&self) -> u32 {
        match self {
            Schedule::Tdma(s) => s.end_time(),
            Schedule::Csma(s) => s.end_time(),
        }
    }

    /// Encoded size in bytes. `compressed` only affects TDMA schedules.
    pub fn encoded_len(&self, compressed: bool) -> usize {
        match self {
            Schedule::Tdma(s) => tdma_encode(s, compressed),
            Schedule::Csma(s) => csma_encode(s),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Tdma(s) => write!(f, "{}", s),
            Schedule::Csma(s) => write!(f, "{}", s),
        }
    }
}

// ============================================================================
// Encodings
// ============================================================================

/// Encoded size of a TDMA schedule in bytes.
///
/// Uncompressed, every entry costs 7 bytes. Compressed, every slot of the
/// underlying decision is listed, and devices already listed once cost 3
/// bytes instead of 7. Both add one trailing time byte.
pub fn tdma_encode(schedule: &TdmaSchedule, compressed: bool) -> usize {
    if !compressed {
        return schedule.entries().len() * ENTRY_BYTES + TRAILER_BYTES;
    }
    let mut seen = HashSet::new();
    let mut size = TRAILER_BYTES;
    for slot in schedule.action() {
        if seen.insert(slot.device) {
            size += ENTRY_BYTES;
        } else {
            size += REPEATED_ENTRY_BYTES;
        }
    }
    size
}

/// Encoded size of a CSMA schedule in bytes: 7 per pair plus the length byte.
pub fn csma_encode(schedule: &CsmaSchedule) -> usize {
    schedule.pairs().len() * ENTRY_BYTES + TRAILER_BYTES
}
