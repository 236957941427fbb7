//! # ncsim-phy
//!
//! Radio channel and physical layer for NCSim.
//!
//! This crate provides:
//! - Attenuation models between device pairs ([`AttenuationModel`])
//! - The shared medium with its active transmissions ([`FrequencyBand`])
//! - The physical layer module turning send commands into transmissions and
//!   deciding frame correctness on the receive side ([`SimplePhy`])

pub mod attenuation;
pub mod band;
pub mod phy;

use ncsim_common::{EntityId, SimError};
use thiserror::Error;

pub use attenuation::{fspl, AttenuationKind, AttenuationModel, BandSpec, STANDBY_THRESHOLD};
pub use band::{FrequencyBand, SharedBand};
pub use phy::{PhyConfig, SimplePhy, TIME_SLOT_LENGTH};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while building or querying the channel.
#[derive(Debug, Error)]
pub enum PhyError {
    /// An attenuation model was requested between a device and itself.
    #[error("Attenuation between device '{0}' and itself requested")]
    SelfAttenuation(String),

    /// A band or joined model needs at least one attenuation model.
    #[error("No attenuation models configured")]
    EmptyModelList,

    /// Kernel error while wiring the notifiers of a model.
    #[error(transparent)]
    Sim(#[from] SimError),
}

impl PhyError {
    /// Convert into a [`SimError`] attributed to `entity`.
    pub fn into_sim_error(self, entity: EntityId) -> SimError {
        match self {
            PhyError::Sim(e) => e,
            other => SimError::protocol(entity, other.to_string()),
        }
    }
}
