//! Error types for packet and schedule construction.

use thiserror::Error;

/// Errors raised while building or interpreting packets and schedules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PacketError {
    /// Header type byte outside the known range.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// CSMA probabilities do not add up to one.
    #[error("Invalid CSMA probabilities: sum is {sum}, expected 1.0")]
    InvalidProbabilities {
        /// Sum of all assigned probabilities.
        sum: f64,
    },

    /// A probability outside `[0, 1]`.
    #[error("Probability out of range: {0}")]
    ProbabilityOutOfRange(f64),

    /// Header kind does not fit the requested operation.
    #[error("Unexpected header: expected {expected}")]
    UnexpectedHeader {
        /// Description of the header that was expected.
        expected: &'static str,
    },
}
