//! Core types shared by ropes and cloth.
//!
//! - [`FlexBodyId`] - Unique identifier for a flexible body
//! - [`BodyFlags`] - Persistent body state (sleep, editing, field inhibit)
//! - [`BoundingSphere`] - Bounds used for force-field overlap tests
//! - [`RigidBodyState`] - Snapshot of a rigid body fed to force fields

use nalgebra::{Isometry3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unique identifier for a flexible body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlexBodyId(pub u64);

impl FlexBodyId {
    /// Create a new body ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for FlexBodyId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FlexBodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlexBody({})", self.0)
    }
}

bitflags::bitflags! {
    /// Body-level state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct BodyFlags: u32 {
        /// Ignore all force fields.
        const FORCE_FIELD_INHIBIT = 0b0000_0001;
        /// Body is asleep; stepping is a no-op until woken.
        const ASLEEP = 0b0000_0010;
        /// Body settled during warm start and starts asleep.
        const PRE_ASLEEP = 0b0000_0100;
        /// Body is being edited; physics buffers are not allocated.
        const EDITING = 0b0000_1000;
        /// Warm start already ran for this body.
        const WARM_STARTED = 0b0001_0000;
    }
}

/// ID generator for flexible bodies.
///
/// Thread-safe counter for generating unique IDs.
pub struct FlexBodyIdGenerator {
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for FlexBodyIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl FlexBodyIdGenerator {
    /// Create a new ID generator starting at 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Generate the next unique ID.
    pub fn next(&self) -> FlexBodyId {
        FlexBodyId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }
}

static ID_GENERATOR: FlexBodyIdGenerator = FlexBodyIdGenerator::new();

/// Generate a new unique flexible body ID.
pub fn next_body_id() -> FlexBodyId {
    ID_GENERATOR.next()
}

/// A bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingSphere {
    /// Sphere center.
    pub center: Point3<f32>,
    /// Sphere radius.
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere. Negative radii are clamped to zero.
    #[must_use]
    pub fn new(center: Point3<f32>, radius: f32) -> Self {
        Self {
            center,
            radius: radius.max(0.0),
        }
    }

    /// Sphere around the centroid of `points`, grown by `padding`.
    ///
    /// Returns a zero sphere at the origin for an empty set.
    #[must_use]
    pub fn from_points(points: &[Point3<f32>], padding: f32) -> Self {
        if points.is_empty() {
            return Self::new(Point3::origin(), padding);
        }

        let sum: Vector3<f32> = points.iter().map(|p| p.coords).sum();
        let center = Point3::from(sum / points.len() as f32);
        let radius_sq = points
            .iter()
            .map(|p| (p - center).norm_squared())
            .fold(0.0_f32, f32::max);

        Self::new(center, radius_sq.sqrt() + padding)
    }

    /// Transform this sphere by a rigid transform.
    #[must_use]
    pub fn transformed(&self, transform: &Isometry3<f32>) -> Self {
        Self::new(transform * self.center, self.radius)
    }

    /// Check whether two spheres overlap (touching counts).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let reach = self.radius + other.radius;
        (self.center - other.center).norm_squared() <= reach * reach
    }

    /// Check whether a point lies inside the sphere.
    #[must_use]
    pub fn contains(&self, point: &Point3<f32>) -> bool {
        (point - self.center).norm_squared() <= self.radius * self.radius
    }
}

/// Rigid body snapshot handed to force fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidBodyState {
    /// World transform of the body.
    pub transform: Isometry3<f32>,
    /// Linear velocity of the center of mass (world frame).
    pub linear_velocity: Vector3<f32>,
    /// Angular velocity (world frame).
    pub angular_velocity: Vector3<f32>,
    /// Mass in kg.
    pub mass: f32,
    /// Displaced volume in m³ (used by buoyancy).
    pub volume: f32,
}

impl RigidBodyState {
    /// A resting body of the given mass and volume.
    #[must_use]
    pub fn at_rest(transform: Isometry3<f32>, mass: f32, volume: f32) -> Self {
        Self {
            transform,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            mass,
            volume,
        }
    }

    /// Center of mass in world space.
    #[must_use]
    pub fn center(&self) -> Point3<f32> {
        self.transform * Point3::origin()
    }
}
