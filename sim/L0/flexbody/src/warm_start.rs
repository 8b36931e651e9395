//! Pre-simulation before first display.
//!
//! Warm start runs the integrator for `duration / substep` iterations with no
//! rendering, so a body appears already sagged and settled. Attached
//! particles slide linearly from where they were before activation to their
//! resolved targets over the run. Slots whose connector did not resolve
//! simply hang free under gravity.

use tracing::{info, warn};

use crate::body::FlexBody;
use crate::error::Result;
use crate::integrator::{StepInput, StepStats};
use crate::types::BodyFlags;

/// Outcome of a warm start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmStartReport {
    /// Substeps run.
    pub iterations: u32,
    /// Whether the body ended below the settle force and starts asleep.
    pub settled: bool,
    /// Whether some requested attachment was missing.
    pub degraded: bool,
    /// Largest net force on a free particle in the final substep.
    pub max_net_force: f32,
}

impl FlexBody {
    /// Pre-simulate for `duration` seconds under the configured gravity.
    ///
    /// Reaction impulses produced during the run are discarded. On success
    /// [`stats`](FlexBody::stats) covers the whole run and the body is
    /// flagged [`BodyFlags::WARM_STARTED`]; if it settled it is also flagged
    /// asleep and attached rigid bodies are put to sleep.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::NumericalError`](crate::FlexError) if the run
    /// diverges.
    pub fn warm_start(&mut self, duration: f32) -> Result<WarmStartReport> {
        let dt = self.sim.substep_seconds();
        let iterations = (duration.max(0.0) / dt).round() as u32;
        let degraded = self.attachments.iter().any(|slot| slot.is_unresolved());
        if degraded {
            warn!(body = %self.id, "warm start without all attachments; hanging free");
        }

        let to_local = self.transform.inverse();
        for slot in &self.attachments {
            if let (Some(_), Some(origin)) = (&slot.target, slot.origin) {
                self.particles.teleport(slot.particle, to_local * origin);
            }
        }
        self.wake();

        let input = StepInput::new(1, self.sim.gravity);
        let mut last = StepStats::default();
        let mut outcome = Ok(());
        for i in 0..iterations {
            self.warm_alpha = Some((i + 1) as f32 / iterations as f32);
            match self.advance(&input, None) {
                Ok(stats) => last = stats,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.warm_alpha = None;
        for slot in &mut self.attachments {
            slot.pending_impulse = nalgebra::Vector3::zeros();
        }
        outcome?;

        self.particles.snapshot_initial();
        let max_net_force = last.max_net_force;
        let settled = iterations > 0 && max_net_force < self.sim.settle_force;
        self.stats = StepStats {
            substeps: iterations,
            fell_asleep: settled,
            ..last
        };
        self.insert_flags(BodyFlags::WARM_STARTED);
        if settled {
            self.insert_flags(BodyFlags::PRE_ASLEEP | BodyFlags::ASLEEP);
            for body in self.attachments.iter().filter_map(|s| s.target.as_ref()?.rigid_body()) {
                body.sleep();
            }
        }

        info!(
            body = %self.id,
            iterations,
            settled,
            degraded,
            max_net_force,
            "warm start complete"
        );
        Ok(WarmStartReport {
            iterations,
            settled,
            degraded,
            max_net_force,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{NodeRef, RigidBodyTarget};
    use crate::body::FlexibleBody;
    use crate::config::{RopeConfig, SimulationConfig};
    use crate::rope::Rope;
    use nalgebra::{Isometry3, Point3, Vector3};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Post {
        transform: Isometry3<f32>,
        asleep: Mutex<bool>,
    }

    impl RigidBodyTarget for Post {
        fn transform(&self) -> Isometry3<f32> {
            self.transform
        }
        fn apply_impulse(&self, _local_impulse: Vector3<f32>, _local_position: Point3<f32>) {}
        fn is_asleep(&self) -> bool {
            *self.asleep.lock().unwrap()
        }
        fn wake(&self) {
            *self.asleep.lock().unwrap() = false;
        }
        fn sleep(&self) {
            *self.asleep.lock().unwrap() = true;
        }
    }

    fn sim() -> SimulationConfig {
        SimulationConfig::default().with_gravity(Vector3::new(0.0, 0.0, -9.8))
    }

    #[test]
    fn test_iteration_count() {
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 4), sim()).unwrap();
        let report = rope.body_mut().warm_start(0.5).unwrap();
        assert_eq!(report.iterations, 100);
        assert!(!report.degraded);
        assert!(rope.body().flags().contains(BodyFlags::WARM_STARTED));
    }

    #[test]
    fn test_zero_duration_is_a_no_op() {
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 4), sim()).unwrap();
        let before = rope.body().positions().to_vec();
        let report = rope.body_mut().warm_start(0.0).unwrap();
        assert_eq!(report.iterations, 0);
        assert!(!report.settled);
        assert_eq!(rope.body().positions(), before.as_slice());
    }

    #[test]
    fn test_unresolved_slot_degrades_to_free_fall() {
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 4), sim()).unwrap();
        let body = rope.body_mut();
        body.attach_node(Rope::START, NodeRef::Transform(Isometry3::identity()))
            .unwrap();
        body.set_connector(Rope::END, Some(99)).unwrap();

        let report = body.warm_start(0.25).unwrap();
        assert!(report.degraded);
        assert!(body.positions()[4].z < 0.0);
        assert!(body.positions()[0].z.abs() < 1e-6);
    }

    #[test]
    fn test_attachment_slides_from_origin() {
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 4), sim()).unwrap();
        let body = rope.body_mut();
        // Target one unit above the start particle.
        body.attach_node(
            Rope::START,
            NodeRef::Transform(Isometry3::translation(0.0, 0.0, 1.0)),
        )
        .unwrap();
        assert!(body.positions()[0].z > 0.99);

        body.warm_start(0.1).unwrap();
        assert!((body.positions()[0].z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_settled_rope_starts_asleep() {
        let post = Arc::new(Post {
            transform: Isometry3::translation(1.0, 0.0, 0.0),
            asleep: Mutex::new(false),
        });
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 9), sim()).unwrap();
        let body = rope.body_mut();
        body.attach_node(Rope::START, NodeRef::Transform(Isometry3::identity()))
            .unwrap();
        body.attach_node(Rope::END, NodeRef::RigidBody(post.clone()))
            .unwrap();

        let report = body.warm_start(12.0).unwrap();
        assert!(report.settled);
        assert!(report.max_net_force < body.sim().settle_force);
        assert!(body.flags().contains(
            BodyFlags::WARM_STARTED | BodyFlags::PRE_ASLEEP | BodyFlags::ASLEEP
        ));
        assert!(post.is_asleep());

        let stats = body.stats();
        assert_eq!(stats.substeps, report.iterations);
        assert_eq!(stats.max_net_force, report.max_net_force);
        assert!(stats.fell_asleep);
    }

    #[test]
    fn test_short_run_stays_awake_with_stats() {
        let mut rope = Rope::new("r", RopeConfig::rope(1.0, 9), sim()).unwrap();
        let body = rope.body_mut();
        body.attach_node(Rope::START, NodeRef::Transform(Isometry3::identity()))
            .unwrap();

        let report = body.warm_start(0.1).unwrap();
        assert!(!report.settled);
        assert!(!body.is_asleep());
        assert_eq!(body.stats().substeps, 20);
        assert!(body.stats().max_net_force > 0.0);
        assert!(body.stats().kinetic_energy > 0.0);
    }
}
