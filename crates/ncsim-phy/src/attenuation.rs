//! Attenuation models.
//!
//! An [`AttenuationModel`] holds the propagation loss in dB between two
//! devices and triggers its `changes` notifier with [`Signal::Attenuation`]
//! whenever the value changes. Positional models follow the position
//! notifiers of both devices, but only recompute while the devices are
//! closer than [`STANDBY_THRESHOLD`].
//!
//! A joined model sums several models. It hooks the position notifiers at
//! priority 1 (before the contributors react) and -1 (after), so that a
//! position change results in a single update of the sum.

use crate::PhyError;
use ncsim_common::notifier::NotifierId;
use ncsim_common::{Device, SimContext, Signal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Distance in metres at and above which positional models ignore
/// position changes.
pub const STANDBY_THRESHOLD: f64 = 30.0;

const PRIORITY_BEFORE_UPDATES: i32 = 1;
const PRIORITY_UPDATE: i32 = 0;
const PRIORITY_AFTER_UPDATES: i32 = -1;

/// Frequency and bandwidth of a band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BandSpec {
    /// Centre frequency in Hz.
    pub frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
}

impl Default for BandSpec {
    fn default() -> Self {
        BandSpec {
            frequency: 2.4e9,
            bandwidth: 22e6,
        }
    }
}

/// A contributing attenuation model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum AttenuationKind {
    /// Free-space path loss at the band frequency.
    Fspl,
    /// A fixed loss, e.g. for walls.
    Constant {
        /// Loss in dB.
        db: f64,
    },
}

impl fmt::Display for AttenuationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttenuationKind::Fspl => write!(f, "fspl"),
            AttenuationKind::Constant { db } => write!(f, "constant({} dB)", db),
        }
    }
}

/// Free-space path loss in dB for a distance in metres and a frequency in
/// Hz. Zero for co-located devices.
pub fn fspl(distance: f64, frequency: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    20.0 * distance.log10() + 20.0 * frequency.log10() - 147.55
}

#[derive(Debug)]
enum Variant {
    Single(AttenuationKind),
    Joined(Vec<Arc<AttenuationModel>>),
}

#[derive(Debug)]
struct ModelState {
    attenuation: f64,
}

#[derive(Debug)]
struct JoinState {
    partials: Vec<f64>,
    gathering: bool,
}

/// Attenuation between two devices, in either direction.
#[derive(Debug)]
pub struct AttenuationModel {
    variant: Variant,
    devices: (Device, Device),
    state: Arc<Mutex<ModelState>>,
    changes: NotifierId,
}

impl AttenuationModel {
    /// Create a model for `a` and `b`. A single kind yields that model, more
    /// than one yields a joined model summing them.
    pub fn create(
        ctx: &mut SimContext,
        spec: &BandSpec,
        kinds: &[AttenuationKind],
        a: &Device,
        b: &Device,
    ) -> Result<Arc<Self>, PhyError> {
        if a.key == b.key {
            return Err(PhyError::SelfAttenuation(a.name.clone()));
        }
        match kinds {
            [] => Err(PhyError::EmptyModelList),
            [kind] => Self::create_single(ctx, spec, *kind, a, b),
            _ => Self::create_joined(ctx, spec, kinds, a, b),
        }
    }

    fn create_single(
        ctx: &mut SimContext,
        spec: &BandSpec,
        kind: AttenuationKind,
        a: &Device,
        b: &Device,
    ) -> Result<Arc<Self>, PhyError> {
        let changes = ctx.create_notifier(format!("{}-{}.attenuation.changes", a.name, b.name), None);
        let initial = match kind {
            AttenuationKind::Fspl => fspl(a.distance_to(b), spec.frequency),
            AttenuationKind::Constant { db } => db,
        };
        let state = Arc::new(Mutex::new(ModelState { attenuation: initial }));

        if kind == AttenuationKind::Fspl {
            let frequency = spec.frequency;
            for device in [a, b] {
                let position_changes = device.position.lock().changes();
                let (da, db) = (a.clone(), b.clone());
                let state = state.clone();
                ctx.subscribe_callback(position_changes, PRIORITY_UPDATE, move |_, ctx| {
                    let distance = da.distance_to(&db);
                    if distance < STANDBY_THRESHOLD {
                        set_attenuation(ctx, &state, changes, fspl(distance, frequency));
                    }
                })?;
            }
        }

        debug!(a = %a.name, b = %b.name, model = %kind, attenuation = initial, "attenuation model created");
        Ok(Arc::new(AttenuationModel {
            variant: Variant::Single(kind),
            devices: (a.clone(), b.clone()),
            state,
            changes,
        }))
    }

    fn create_joined(
        ctx: &mut SimContext,
        spec: &BandSpec,
        kinds: &[AttenuationKind],
        a: &Device,
        b: &Device,
    ) -> Result<Arc<Self>, PhyError> {
        let models = kinds
            .iter()
            .map(|kind| Self::create_single(ctx, spec, *kind, a, b))
            .collect::<Result<Vec<_>, _>>()?;
        let partials: Vec<f64> = models.iter().map(|m| m.attenuation()).collect();
        let initial: f64 = partials.iter().sum();
        let changes = ctx.create_notifier(format!("{}-{}.joined_attenuation.changes", a.name, b.name), None);
        let state = Arc::new(Mutex::new(ModelState { attenuation: initial }));
        let join = Arc::new(Mutex::new(JoinState {
            partials,
            gathering: false,
        }));

        for (index, model) in models.iter().enumerate() {
            let join = join.clone();
            let state = state.clone();
            ctx.subscribe_callback(model.changes(), PRIORITY_UPDATE, move |value, ctx| {
                let Signal::Attenuation(value) = value else {
                    return;
                };
                let sum = {
                    let mut join = join.lock();
                    join.partials[index] = *value;
                    (!join.gathering).then(|| join.partials.iter().sum::<f64>())
                };
                if let Some(sum) = sum {
                    set_attenuation(ctx, &state, changes, sum);
                }
            })?;
        }

        for device in [a, b] {
            let position_changes = device.position.lock().changes();
            let before = join.clone();
            ctx.subscribe_callback(position_changes, PRIORITY_BEFORE_UPDATES, move |_, _| {
                before.lock().gathering = true;
            })?;
            let after = join.clone();
            let state = state.clone();
            ctx.subscribe_callback(position_changes, PRIORITY_AFTER_UPDATES, move |_, ctx| {
                let sum = {
                    let mut join = after.lock();
                    join.gathering = false;
                    join.partials.iter().sum::<f64>()
                };
                set_attenuation(ctx, &state, changes, sum);
            })?;
        }

        Ok(Arc::new(AttenuationModel {
            variant: Variant::Joined(models),
            devices: (a.clone(), b.clone()),
            state,
            changes,
        }))
    }

    /// Current attenuation in dB.
    pub fn attenuation(&self) -> f64 {
        self.state.lock().attenuation
    }

    /// Notifier triggered with [`Signal::Attenuation`] on every change.
    pub fn changes(&self) -> NotifierId {
        self.changes
    }

    /// The two devices, in creation order.
    pub fn devices(&self) -> (&Device, &Device) {
        (&self.devices.0, &self.devices.1)
    }

    /// Models summed by a joined model; empty for a single model.
    pub fn contributors(&self) -> &[Arc<AttenuationModel>] {
        match &self.variant {
            Variant::Single(_) => &[],
            Variant::Joined(models) => models,
        }
    }
}

impl fmt::Display for AttenuationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Variant::Single(kind) => write!(f, "{}({}, {})", kind, self.devices.0.name, self.devices.1.name),
            Variant::Joined(models) => write!(
                f,
                "joined[{}]({}, {})",
                models.len(),
                self.devices.0.name,
                self.devices.1.name
            ),
        }
    }
}

fn set_attenuation(ctx: &mut SimContext, state: &Mutex<ModelState>, changes: NotifierId, value: f64) {
    {
        let mut state = state.lock();
        if state.attenuation == value {
            return;
        }
        state.attenuation = value;
    }
    if let Err(e) = ctx.trigger(changes, Signal::Attenuation(value)) {
        warn!(error = %e, "attenuation change not propagated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded_changes(ctx: &mut SimContext, model: &AttenuationModel) -> Arc<Mutex<Vec<f64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.subscribe_callback(model.changes(), 0, move |v, _| {
            if let Signal::Attenuation(v) = v {
                sink.lock().push(*v);
            }
        })
        .unwrap();
        seen
    }

    #[test]
    fn test_fspl_values() {
        assert_eq!(fspl(0.0, 2.4e9), 0.0);
        assert!((fspl(1.0, 2.4e9) - 40.05).abs() < 0.01);
        // +20 dB per decade
        assert!((fspl(10.0, 2.4e9) - fspl(1.0, 2.4e9) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_attenuation_rejected() {
        let mut ctx = SimContext::new(0);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let err = AttenuationModel::create(&mut ctx, &BandSpec::default(), &[AttenuationKind::Fspl], &a, &a);
        assert!(matches!(err, Err(PhyError::SelfAttenuation(_))));
    }

    #[test]
    fn test_fspl_follows_position_within_standby_threshold() {
        let mut ctx = SimContext::new(0);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let b = Device::new(&mut ctx, "b", 1.0, 0.0);
        let model = AttenuationModel::create(&mut ctx, &BandSpec::default(), &[AttenuationKind::Fspl], &a, &b).unwrap();
        let seen = recorded_changes(&mut ctx, &model);

        b.set_position(&mut ctx, 10.0, 0.0).unwrap();
        assert!((model.attenuation() - fspl(10.0, 2.4e9)).abs() < 1e-9);

        // beyond the threshold the old value is kept
        b.set_position(&mut ctx, 100.0, 0.0).unwrap();
        assert!((model.attenuation() - fspl(10.0, 2.4e9)).abs() < 1e-9);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_constant_model() {
        let mut ctx = SimContext::new(0);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let b = Device::new(&mut ctx, "b", 1.0, 0.0);
        let kinds = [AttenuationKind::Constant { db: 12.5 }];
        let model = AttenuationModel::create(&mut ctx, &BandSpec::default(), &kinds, &a, &b).unwrap();
        b.set_position(&mut ctx, 2.0, 0.0).unwrap();
        assert_eq!(model.attenuation(), 12.5);
        assert!(model.contributors().is_empty());
    }

    #[test]
    fn test_joined_model_sums_and_fires_once() {
        let mut ctx = SimContext::new(0);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let b = Device::new(&mut ctx, "b", 1.0, 0.0);
        let kinds = [AttenuationKind::Fspl, AttenuationKind::Fspl, AttenuationKind::Constant { db: 3.0 }];
        let model = AttenuationModel::create(&mut ctx, &BandSpec::default(), &kinds, &a, &b).unwrap();
        assert_eq!(model.contributors().len(), 3);
        assert!((model.attenuation() - (2.0 * fspl(1.0, 2.4e9) + 3.0)).abs() < 1e-9);

        let seen = recorded_changes(&mut ctx, &model);
        a.set_position(&mut ctx, -1.0, 0.0).unwrap();
        let expected = 2.0 * fspl(2.0, 2.4e9) + 3.0;
        assert_eq!(seen.lock().len(), 1);
        assert!((seen.lock()[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_kind_deserialization() {
        let kinds: Vec<AttenuationKind> =
            serde_json::from_str(r#"[{"model":"fspl"},{"model":"constant","db":4.0}]"#).unwrap();
        assert_eq!(kinds, vec![AttenuationKind::Fspl, AttenuationKind::Constant { db: 4.0 }]);
    }
}
