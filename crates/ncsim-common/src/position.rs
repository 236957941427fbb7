//! Devices and their positions on a 2-D plane.

use crate::notifier::NotifierId;
use crate::{SimContext, SimError, Signal};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A position in metres, with a notifier triggered on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    x: f64,
    y: f64,
    changes: NotifierId,
}

/// A position shared between a device and the models observing it.
pub type SharedPosition = Arc<Mutex<Position>>;

impl Position {
    /// Create a position and its change notifier.
    pub fn new(ctx: &mut SimContext, owner_name: &str, x: f64, y: f64) -> Self {
        let changes = ctx.create_notifier(format!("{}.position.changes", owner_name), None);
        Position { x, y, changes }
    }

    /// X coordinate.
    pub fn x(&self) -> f64 {
        self.x
    }

    /// Y coordinate.
    pub fn y(&self) -> f64 {
        self.y
    }

    /// Notifier triggered with [`Signal::Position`] after every change.
    pub fn changes(&self) -> NotifierId {
        self.changes
    }

    /// Euclidean distance in metres.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Move a shared position. The change notifier fires once, even when both
/// coordinates change, and not at all when the position stays the same.
pub fn set_position(ctx: &mut SimContext, position: &SharedPosition, x: f64, y: f64) -> Result<(), SimError> {
    let changes = {
        let mut pos = position.lock();
        if pos.x == x && pos.y == y {
            return Ok(());
        }
        pos.x = x;
        pos.y = y;
        pos.changes
    };
    ctx.trigger(changes, Signal::Position { x, y })
}

/// A device placed on the plane.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device name.
    pub name: String,
    /// Unique key within the run, used to identify device pairs.
    pub key: u64,
    /// Current position.
    pub position: SharedPosition,
}

impl Device {
    /// Create a device at `(x, y)`.
    pub fn new(ctx: &mut SimContext, name: impl Into<String>, x: f64, y: f64) -> Self {
        let name = name.into();
        let position = Position::new(ctx, &name, x, y);
        Device {
            key: ctx.new_device_key(),
            name,
            position: Arc::new(Mutex::new(position)),
        }
    }

    /// Distance to another device in metres.
    pub fn distance_to(&self, other: &Device) -> f64 {
        if Arc::ptr_eq(&self.position, &other.position) {
            return 0.0;
        }
        let a = self.position.lock().clone();
        let b = other.position.lock();
        a.distance_to(&b)
    }

    /// Move the device.
    pub fn set_position(&self, ctx: &mut SimContext, x: f64, y: f64) -> Result<(), SimError> {
        set_position(ctx, &self.position, x, y)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device('{}')", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let mut ctx = SimContext::new(0);
        let a = Device::new(&mut ctx, "a", 0.0, 0.0);
        let b = Device::new(&mut ctx, "b", 3.0, 4.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-12);
        assert_eq!(a.distance_to(&a), 0.0);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_position_change_triggers_once() {
        let mut ctx = SimContext::new(0);
        let device = Device::new(&mut ctx, "a", 0.0, 0.0);
        let changes = device.position.lock().changes();
        device.set_position(&mut ctx, 1.0, 2.0).unwrap();
        assert_eq!(ctx.trigger_count(changes), 1);
        device.set_position(&mut ctx, 1.0, 2.0).unwrap();
        assert_eq!(ctx.trigger_count(changes), 1);
        assert_eq!(device.position.lock().x(), 1.0);
    }
}
