//! Coupling of particles to rigid bodies, static nodes and animation paths.
//!
//! Attachments are declared as slots on a body (rope ends, cloth corners),
//! each optionally naming a connector. On activation the connector is
//! resolved through a [`ConnectorGraph`]; a slot whose connector resolves
//! pins its particle to the target every substep.
//!
//! Reaction impulses for rigid bodies are accumulated per slot while the
//! body steps and flushed once at the end of the step under an
//! [`ImpulseLock`], because several bodies attached to the same rigid body
//! may step concurrently.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use nalgebra::{Isometry3, Point3, Vector3};
use tracing::warn;

use crate::error::{FlexError, Result};

/// Identifier of a node in the host's connector graph.
pub type ConnectorId = u64;

/// Maximum number of [`NodeRef::Link`] hops followed while resolving.
pub const MAX_LINK_HOPS: usize = 16;

/// A rigid body a particle can be attached to.
///
/// Implementations are shared between threads and use interior mutability.
pub trait RigidBodyTarget: Send + Sync + Debug {
    /// Current world transform.
    fn transform(&self) -> Isometry3<f32>;

    /// Queue an impulse given in the body's local frame at a local point.
    fn apply_impulse(&self, local_impulse: Vector3<f32>, local_position: Point3<f32>);

    /// Whether the body is asleep.
    fn is_asleep(&self) -> bool;

    /// Wake the body.
    fn wake(&self);

    /// Put the body to sleep.
    fn sleep(&self);
}

/// An animation path a particle can follow.
pub trait PathTarget: Send + Sync + Debug {
    /// World position at parameter `t` in `[0, 1]`.
    fn state_at(&self, t: f32) -> Point3<f32>;

    /// Seconds to traverse the path once. Non-positive means static.
    fn period(&self) -> f32 {
        0.0
    }
}

/// What a connector points at.
#[derive(Debug, Clone)]
pub enum NodeRef {
    /// The top-level scene root. Never a valid attachment.
    SceneRoot,
    /// A static transform node.
    Transform(Isometry3<f32>),
    /// A simulated rigid body.
    RigidBody(Arc<dyn RigidBodyTarget>),
    /// An animated path.
    Path(Arc<dyn PathTarget>),
    /// Forward to another connector.
    Link(ConnectorId),
}

/// Host connectivity, consulted when attachments are bound.
pub trait ConnectorGraph {
    /// Node a connector refers to, if any.
    fn node(&self, id: ConnectorId) -> Option<NodeRef>;
}

/// A [`ConnectorGraph`] backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct ConnectorMap {
    nodes: HashMap<ConnectorId, NodeRef>,
}

impl ConnectorMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector.
    pub fn insert(&mut self, id: ConnectorId, node: NodeRef) -> &mut Self {
        self.nodes.insert(id, node);
        self
    }

    /// Remove a connector.
    pub fn remove(&mut self, id: ConnectorId) -> Option<NodeRef> {
        self.nodes.remove(&id)
    }
}

impl ConnectorGraph for ConnectorMap {
    fn node(&self, id: ConnectorId) -> Option<NodeRef> {
        self.nodes.get(&id).cloned()
    }
}

/// Follow `id` through the graph to a concrete node.
///
/// # Errors
///
/// Returns [`FlexError::InvalidAttachment`] if the connector is missing,
/// resolves to the scene root, or the link chain exceeds [`MAX_LINK_HOPS`].
pub fn resolve_connector(graph: &dyn ConnectorGraph, id: ConnectorId) -> Result<NodeRef> {
    let mut current = id;
    for _ in 0..=MAX_LINK_HOPS {
        match graph.node(current) {
            None => {
                return Err(FlexError::invalid_attachment(format!(
                    "connector {current} does not resolve"
                )));
            }
            Some(NodeRef::SceneRoot) => {
                warn!(connector = id, "attachment to the scene root rejected");
                return Err(FlexError::invalid_attachment(format!(
                    "connector {id} resolves to the scene root"
                )));
            }
            Some(NodeRef::Link(next)) => current = next,
            Some(node) => return Ok(node),
        }
    }
    Err(FlexError::invalid_attachment(format!(
        "connector {id} exceeds {MAX_LINK_HOPS} link hops"
    )))
}

/// A resolved attachment target.
#[derive(Debug, Clone)]
pub enum AttachTarget {
    /// Fixed world point.
    Static(Point3<f32>),
    /// Point fixed in a rigid body's frame.
    RigidBody {
        /// The body.
        body: Arc<dyn RigidBodyTarget>,
        /// Attachment point in the body's local frame.
        local_anchor: Point3<f32>,
    },
    /// Point following an animation path.
    Path(Arc<dyn PathTarget>),
}

impl AttachTarget {
    /// Bind a resolved node for a particle currently at `particle_world`.
    ///
    /// Static nodes pin to their origin; rigid bodies keep the particle's
    /// current offset in their frame.
    #[must_use]
    pub fn from_node(node: NodeRef, particle_world: Point3<f32>) -> Option<Self> {
        match node {
            NodeRef::Transform(iso) => Some(Self::Static(iso * Point3::origin())),
            NodeRef::RigidBody(body) => {
                let local_anchor = body.transform().inverse_transform_point(&particle_world);
                Some(Self::RigidBody { body, local_anchor })
            }
            NodeRef::Path(path) => Some(Self::Path(path)),
            NodeRef::SceneRoot | NodeRef::Link(_) => None,
        }
    }

    /// World position of the target after `elapsed` seconds of simulation.
    #[must_use]
    pub fn world_position(&self, elapsed: f32) -> Point3<f32> {
        match self {
            Self::Static(p) => *p,
            Self::RigidBody { body, local_anchor } => body.transform() * local_anchor,
            Self::Path(path) => {
                let period = path.period();
                let t = if period > 0.0 {
                    elapsed.rem_euclid(period) / period
                } else {
                    0.0
                };
                path.state_at(t)
            }
        }
    }

    /// The rigid body, if this target is one.
    #[must_use]
    pub fn rigid_body(&self) -> Option<&Arc<dyn RigidBodyTarget>> {
        match self {
            Self::RigidBody { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// One attachment point of a body.
#[derive(Debug, Clone)]
pub struct AttachmentSlot {
    /// Particle index held by this slot.
    pub particle: usize,
    /// Connector to resolve on activation.
    pub connector: Option<ConnectorId>,
    /// Resolved target.
    pub target: Option<AttachTarget>,
    /// World position of the particle before activation; warm start slides
    /// from here to the target.
    pub origin: Option<Point3<f32>>,
    /// Reaction impulse accumulated this step (world frame).
    pub pending_impulse: Vector3<f32>,
}

impl AttachmentSlot {
    /// Unbound slot for `particle`.
    #[must_use]
    pub fn new(particle: usize) -> Self {
        Self {
            particle,
            connector: None,
            target: None,
            origin: None,
            pending_impulse: Vector3::zeros(),
        }
    }

    /// Set the connector to resolve.
    #[must_use]
    pub fn with_connector(mut self, connector: ConnectorId) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Whether the slot currently holds its particle.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.target.is_some()
    }

    /// Whether a connector was requested but did not resolve.
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.connector.is_some() && self.target.is_none()
    }

    /// Take the pending impulse, leaving zero.
    pub fn take_impulse(&mut self) -> Vector3<f32> {
        std::mem::replace(&mut self.pending_impulse, Vector3::zeros())
    }
}

/// Lock serializing impulse delivery to rigid bodies.
///
/// Clones share the same mutex.
#[derive(Debug, Clone, Default)]
pub struct ImpulseLock(Arc<Mutex<()>>);

impl ImpulseLock {
    /// Create a new lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock.
    ///
    /// A poisoned lock is recovered; the guarded data is `()`.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Anchor {
        transform: Mutex<Isometry3<f32>>,
        impulse: Mutex<Vector3<f32>>,
        asleep: AtomicBool,
    }

    impl Anchor {
        fn new() -> Self {
            Self {
                transform: Mutex::new(Isometry3::identity()),
                impulse: Mutex::new(Vector3::zeros()),
                asleep: AtomicBool::new(false),
            }
        }
    }

    impl RigidBodyTarget for Anchor {
        fn transform(&self) -> Isometry3<f32> {
            *self.transform.lock().unwrap()
        }
        fn apply_impulse(&self, local_impulse: Vector3<f32>, _local_position: Point3<f32>) {
            *self.impulse.lock().unwrap() += local_impulse;
        }
        fn is_asleep(&self) -> bool {
            self.asleep.load(Ordering::Relaxed)
        }
        fn wake(&self) {
            self.asleep.store(false, Ordering::Relaxed);
        }
        fn sleep(&self) {
            self.asleep.store(true, Ordering::Relaxed);
        }
    }

    #[derive(Debug)]
    struct Line;

    impl PathTarget for Line {
        fn state_at(&self, t: f32) -> Point3<f32> {
            Point3::new(t, 0.0, 0.0)
        }
        fn period(&self) -> f32 {
            2.0
        }
    }

    #[test]
    fn test_resolve_follows_links() {
        let mut graph = ConnectorMap::new();
        graph
            .insert(1, NodeRef::Link(2))
            .insert(2, NodeRef::Transform(Isometry3::translation(1.0, 2.0, 3.0)));

        let node = resolve_connector(&graph, 1).unwrap();
        assert!(matches!(node, NodeRef::Transform(_)));
    }

    #[test]
    fn test_resolve_rejects_scene_root_and_missing() {
        let mut graph = ConnectorMap::new();
        graph.insert(1, NodeRef::SceneRoot).insert(2, NodeRef::Link(1));

        assert!(matches!(
            resolve_connector(&graph, 2),
            Err(FlexError::InvalidAttachment(_))
        ));
        assert!(resolve_connector(&graph, 99).is_err());
    }

    #[test]
    fn test_resolve_rejects_link_cycles() {
        let mut graph = ConnectorMap::new();
        graph.insert(1, NodeRef::Link(2)).insert(2, NodeRef::Link(1));
        assert!(resolve_connector(&graph, 1).is_err());
    }

    #[test]
    fn test_static_target_pins_to_node_origin() {
        let node = NodeRef::Transform(Isometry3::translation(0.0, 0.0, 4.0));
        let target = AttachTarget::from_node(node, Point3::new(9.0, 9.0, 9.0)).unwrap();
        assert_relative_eq!(target.world_position(0.0).z, 4.0);
    }

    #[test]
    fn test_rigid_target_keeps_offset() {
        let body = Arc::new(Anchor::new());
        *body.transform.lock().unwrap() = Isometry3::translation(1.0, 0.0, 0.0);

        let node = NodeRef::RigidBody(body.clone());
        let target = AttachTarget::from_node(node, Point3::new(1.5, 0.0, 0.0)).unwrap();

        *body.transform.lock().unwrap() = Isometry3::translation(3.0, 0.0, 0.0);
        assert_relative_eq!(target.world_position(0.0).x, 3.5);
        assert!(target.rigid_body().is_some());
    }

    #[test]
    fn test_path_target_wraps_with_period() {
        let target = AttachTarget::Path(Arc::new(Line));
        assert_relative_eq!(target.world_position(0.5).x, 0.25);
        assert_relative_eq!(target.world_position(2.5).x, 0.25);
    }

    #[test]
    fn test_slot_impulse_take() {
        let mut slot = AttachmentSlot::new(3).with_connector(7);
        assert!(slot.is_unresolved());
        slot.pending_impulse = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(slot.take_impulse().x, 1.0);
        assert_relative_eq!(slot.pending_impulse.norm(), 0.0);
    }

    #[test]
    fn test_impulse_lock_shared() {
        let lock = ImpulseLock::new();
        let other = lock.clone();
        let body = Anchor::new();
        lock.with(|| body.apply_impulse(Vector3::x(), Point3::origin()));
        other.with(|| body.apply_impulse(Vector3::x(), Point3::origin()));
        assert_relative_eq!(body.impulse.lock().unwrap().x, 2.0);
    }
}
