//! Per-frame scheduling of many bodies.
//!
//! [`FrameDriver`] is a reference implementation of the scheduler contract.
//! Each frame runs three dependent phases:
//!
//! 1. **step**: every active body advances its substeps
//! 2. **reconstruct**: every body that stepped rebuilds its vertex stream
//!    into a private staging buffer
//! 3. **finalize**: staging buffers are swapped into the render-facing
//!    [`RenderBuffer`]s
//!
//! Phases 1 and 2 run in parallel on a dedicated rayon pool when the
//! `parallel` feature is enabled; sequential fallback when disabled. A
//! phase only starts once the previous one has finished for every body, so
//! finalize always observes fully integrated state.
//!
//! Errors are contained per body. A body whose error is
//! [fatal](FlexError::is_fatal_for_body) is deactivated; the others keep
//! running.
//!
//! # Example
//!
//! ```ignore
//! use sim_flexbody::{ConnectorMap, FlexController, FrameDriver, FrameEnv, FrameInput, RenderBuffer, RopeConfig, SimulationConfig};
//!
//! let sim = SimulationConfig::default().with_max_worker_threads(4);
//! let mut driver = FrameDriver::from_config(&sim)?;
//! let rope = FlexController::new_rope("rope", RopeConfig::rope(2.0, 16), sim)?;
//! let index = driver.add(rope);
//! driver.activate_all(&ConnectorMap::new());
//!
//! let report = driver.run_frame(&FrameInput::default(), &FrameEnv::default());
//! let vertices = driver.buffer(index).map(RenderBuffer::vertices);
//! ```

use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::attachment::{ConnectorGraph, ImpulseLock};
use crate::config::{MAX_THREAD_SLOTS, SimulationConfig};
use crate::controller::FlexController;
use crate::error::{FlexError, Result};
use crate::field_query::{FieldContext, FieldHierarchy, FieldVisitMask, RegionId};
use crate::integrator::{StepEnv, StepInput};
use crate::mesh::{ReconstructRequest, RenderVertex};
use crate::types::FlexBodyId;

/// Per-frame input shared by every body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    /// World gravity acceleration (m/s²).
    pub gravity: Vector3<f32>,
    /// World ambient wind velocity (m/s).
    pub ambient_wind: Vector3<f32>,
    /// Render request applied to every body.
    pub request: ReconstructRequest,
}

impl Default for FrameInput {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -9.81),
            ambient_wind: Vector3::zeros(),
            request: ReconstructRequest::default(),
        }
    }
}

/// Force-field hierarchy shared by every body in a frame.
#[derive(Clone, Copy)]
pub struct SharedFields<'a> {
    /// Spatial hierarchy.
    pub hierarchy: &'a dyn FieldHierarchy,
    /// Visit mask sized for the hierarchy.
    pub mask: &'a FieldVisitMask,
    /// Region queried for bodies without their own region.
    pub root: RegionId,
}

impl std::fmt::Debug for SharedFields<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFields")
            .field("fields", &self.hierarchy.field_count())
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Shared collaborators for a frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEnv<'a> {
    /// Force fields, if any.
    pub fields: Option<SharedFields<'a>>,
    /// Lock guarding rigid-body impulse delivery.
    pub impulse_lock: Option<&'a ImpulseLock>,
}

impl<'a> FrameEnv<'a> {
    fn step_env(&self) -> StepEnv<'a> {
        StepEnv {
            fields: self.fields.map(|shared| FieldContext {
                hierarchy: shared.hierarchy,
                mask: shared.mask,
                region: shared.root,
            }),
            impulse_lock: self.impulse_lock,
        }
    }
}

/// Render-facing vertex stream of one body.
#[derive(Debug, Clone, Default)]
pub struct RenderBuffer {
    vertices: Vec<RenderVertex>,
    lod: usize,
    frame: u64,
}

impl RenderBuffer {
    /// Vertices of the last finalized frame.
    #[must_use]
    pub fn vertices(&self) -> &[RenderVertex] {
        &self.vertices
    }

    /// LOD tier of the last finalized frame.
    #[must_use]
    pub const fn lod(&self) -> usize {
        self.lod
    }

    /// Frame number of the last finalize; 0 before the first.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }
}

/// Outcome of one frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Bodies that stepped successfully.
    pub stepped: usize,
    /// Bodies whose render buffer was refreshed.
    pub reconstructed: usize,
    /// Per-body failures.
    pub failures: Vec<(FlexBodyId, FlexError)>,
}

impl FrameReport {
    /// Whether every body succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of one body's work in a phase. `None` means skipped.
type PhaseResult = Option<Result<()>>;

/// Steps, reconstructs and finalizes a set of bodies each frame.
#[derive(Debug)]
pub struct FrameDriver {
    bodies: Vec<FlexController>,
    buffers: Vec<RenderBuffer>,
    staging: Vec<Vec<RenderVertex>>,
    frame: u64,
    workers: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl FrameDriver {
    /// Create a driver with `worker_threads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] unless `worker_threads` is in
    /// `1..=MAX_THREAD_SLOTS`, and [`FlexError::ResourceExhausted`] if the
    /// worker pool cannot be spawned.
    pub fn new(worker_threads: usize) -> Result<Self> {
        if worker_threads == 0 || worker_threads > MAX_THREAD_SLOTS {
            return Err(FlexError::invalid_config(format!(
                "worker threads must be in 1..={MAX_THREAD_SLOTS}, got {worker_threads}"
            )));
        }

        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("flexbody-{i}"))
            .build()
            .map_err(|err| FlexError::resource_exhausted(err.to_string()))?;

        Ok(Self {
            bodies: Vec::new(),
            buffers: Vec::new(),
            staging: Vec::new(),
            frame: 0,
            workers: worker_threads,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    /// Create a driver with `config.max_worker_threads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if `config` does not validate,
    /// and [`FlexError::ResourceExhausted`] if the worker pool cannot be
    /// spawned.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.max_worker_threads)
    }

    /// Worker threads stepping bodies.
    #[must_use]
    pub const fn worker_threads(&self) -> usize {
        self.workers
    }

    /// Number of bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Whether the driver has no bodies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Frames run so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Add a controller. Returns its index.
    pub fn add(&mut self, controller: FlexController) -> usize {
        self.bodies.push(controller);
        self.buffers.push(RenderBuffer::default());
        self.staging.push(Vec::new());
        self.bodies.len() - 1
    }

    /// Remove and return a controller, deactivating it first.
    ///
    /// Indices of later controllers shift down by one.
    pub fn remove(&mut self, index: usize) -> Option<FlexController> {
        if index >= self.bodies.len() {
            return None;
        }
        self.buffers.remove(index);
        self.staging.remove(index);
        let mut controller = self.bodies.remove(index);
        controller.deactivate();
        Some(controller)
    }

    /// Controller `index`.
    #[must_use]
    pub fn controller(&self, index: usize) -> Option<&FlexController> {
        self.bodies.get(index)
    }

    /// Mutable controller `index`.
    pub fn controller_mut(&mut self, index: usize) -> Option<&mut FlexController> {
        self.bodies.get_mut(index)
    }

    /// Iterator over all controllers.
    pub fn controllers(&self) -> impl ExactSizeIterator<Item = &FlexController> {
        self.bodies.iter()
    }

    /// Render buffer of controller `index`.
    #[must_use]
    pub fn buffer(&self, index: usize) -> Option<&RenderBuffer> {
        self.buffers.get(index)
    }

    /// Activate every inactive controller.
    ///
    /// Failures leave the controller inactive and are returned.
    pub fn activate_all(&mut self, graph: &dyn ConnectorGraph) -> Vec<(FlexBodyId, FlexError)> {
        let mut failures = Vec::new();
        for controller in &mut self.bodies {
            if let Err(err) = controller.activate(graph) {
                warn!(body = %controller.id(), %err, "activation failed");
                failures.push((controller.id(), err));
            }
        }
        failures
    }

    /// Run one frame: step, reconstruct, finalize.
    pub fn run_frame(&mut self, input: &FrameInput, env: &FrameEnv<'_>) -> FrameReport {
        self.frame += 1;
        let step_env = env.step_env();

        let step_one = |controller: &mut FlexController, thread: usize| -> PhaseResult {
            if !controller.is_active() {
                return None;
            }
            let step_input = StepInput::new(controller.substeps_per_frame(), input.gravity)
                .with_wind(input.ambient_wind)
                .with_thread(thread);
            Some(controller.step(&step_input, &step_env).map(|_| ()))
        };
        let rebuild_one = |controller: &mut FlexController,
                           staging: &mut Vec<RenderVertex>,
                           stepped: &PhaseResult|
         -> PhaseResult {
            match stepped {
                Some(Ok(())) => Some(controller.reconstruct_into(&input.request, staging)),
                _ => None,
            }
        };

        #[cfg(feature = "parallel")]
        let (stepped, rebuilt): (Vec<PhaseResult>, Vec<PhaseResult>) = {
            use rayon::iter::{
                IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator,
                ParallelIterator,
            };
            let bodies = &mut self.bodies;
            let staging = &mut self.staging;
            self.pool.install(|| {
                let stepped: Vec<PhaseResult> = bodies
                    .par_iter_mut()
                    .map(|controller| {
                        step_one(controller, rayon::current_thread_index().unwrap_or(0))
                    })
                    .collect();
                let rebuilt = bodies
                    .par_iter_mut()
                    .zip(staging.par_iter_mut())
                    .zip(stepped.par_iter())
                    .map(|((controller, out), result)| rebuild_one(controller, out, result))
                    .collect();
                (stepped, rebuilt)
            })
        };

        #[cfg(not(feature = "parallel"))]
        let (stepped, rebuilt): (Vec<PhaseResult>, Vec<PhaseResult>) = {
            let stepped: Vec<PhaseResult> = self
                .bodies
                .iter_mut()
                .map(|controller| step_one(controller, 0))
                .collect();
            let rebuilt = self
                .bodies
                .iter_mut()
                .zip(self.staging.iter_mut())
                .zip(&stepped)
                .map(|((controller, out), result)| rebuild_one(controller, out, result))
                .collect();
            (stepped, rebuilt)
        };

        self.finalize(input, stepped, rebuilt)
    }

    fn finalize(
        &mut self,
        input: &FrameInput,
        stepped: Vec<PhaseResult>,
        rebuilt: Vec<PhaseResult>,
    ) -> FrameReport {
        let mut report = FrameReport {
            frame: self.frame,
            ..FrameReport::default()
        };

        for (i, (step, rebuild)) in stepped.into_iter().zip(rebuilt).enumerate() {
            let controller = &mut self.bodies[i];
            let outcome = match (step, rebuild) {
                (None, _) => continue,
                (Some(Err(err)), _) => Err(err),
                (Some(Ok(())), rebuild) => {
                    report.stepped += 1;
                    match rebuild {
                        Some(Ok(())) => {
                            let buffer = &mut self.buffers[i];
                            std::mem::swap(&mut buffer.vertices, &mut self.staging[i]);
                            buffer.lod = controller.shape().clamp_lod(input.request.lod);
                            buffer.frame = self.frame;
                            report.reconstructed += 1;
                            Ok(())
                        }
                        Some(Err(err)) => Err(err),
                        None => Ok(()),
                    }
                }
            };

            if let Err(err) = outcome {
                warn!(body = %controller.id(), frame = self.frame, %err, "body failed");
                if err.is_fatal_for_body() {
                    controller.deactivate();
                }
                report.failures.push((controller.id(), err));
            }
        }

        debug!(
            frame = report.frame,
            stepped = report.stepped,
            reconstructed = report.reconstructed,
            failures = report.failures.len(),
            "frame complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{ConnectorMap, NodeRef};
    use crate::config::{ClothConfig, RopeConfig, SimulationConfig};
    use crate::field_query::RegionTree;
    use crate::force::{ForceField, WindField};
    use crate::types::BoundingSphere;
    use nalgebra::{Isometry3, Point3};

    fn sim() -> SimulationConfig {
        SimulationConfig::default().with_warm_start(0.0)
    }

    fn rope(name: &str) -> FlexController {
        FlexController::new_rope(name, RopeConfig::rope(1.0, 8), sim()).unwrap()
    }

    #[test]
    fn test_rejects_bad_thread_count() {
        assert!(FrameDriver::new(0).is_err());
        assert!(FrameDriver::new(MAX_THREAD_SLOTS + 1).is_err());
    }

    #[test]
    fn test_worker_count_from_config() {
        let config = sim().with_max_worker_threads(3);
        let mut driver = FrameDriver::from_config(&config).unwrap();
        assert_eq!(driver.worker_threads(), 3);

        for i in 0..5 {
            driver.add(rope(&format!("rope-{i}")));
        }
        driver.activate_all(&ConnectorMap::new());
        let report = driver.run_frame(&FrameInput::default(), &FrameEnv::default());
        assert!(report.is_clean());
        assert_eq!(report.stepped, 5);

        let too_many = sim().with_max_worker_threads(MAX_THREAD_SLOTS + 1);
        assert!(matches!(
            FrameDriver::from_config(&too_many),
            Err(FlexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_frame_steps_and_finalizes() {
        let mut driver = FrameDriver::new(2).unwrap();
        let a = driver.add(rope("a"));
        let b = driver.add(
            FlexController::new_cloth("b", ClothConfig::cotton(1.0, 1.0, 5, 5), sim()).unwrap(),
        );
        let idle = driver.add(rope("idle"));
        assert!(driver.activate_all(&ConnectorMap::new()).is_empty());
        driver.controller_mut(idle).unwrap().deactivate();

        let report = driver.run_frame(&FrameInput::default(), &FrameEnv::default());
        assert!(report.is_clean());
        assert_eq!(report.frame, 1);
        assert_eq!(report.stepped, 2);
        assert_eq!(report.reconstructed, 2);

        let cloth_buffer = driver.buffer(b).unwrap();
        assert_eq!(cloth_buffer.vertices().len(), 50);
        assert_eq!(cloth_buffer.frame(), 1);
        assert!(!driver.buffer(a).unwrap().vertices().is_empty());
        assert!(driver.buffer(idle).unwrap().vertices().is_empty());

        // Gravity pulled the free rope down.
        let body = driver.controller(a).unwrap().flex_body().unwrap();
        assert!(body.positions()[4].z < 0.0);
    }

    #[test]
    fn test_failing_body_is_contained() {
        let mut driver = FrameDriver::new(2).unwrap();
        let healthy = driver.add(rope("healthy"));
        let broken = driver.add(rope("broken"));
        driver.activate_all(&ConnectorMap::new());

        let body = driver
            .controller_mut(broken)
            .unwrap()
            .body_mut()
            .unwrap()
            .body_mut();
        body.set_particle_state(3, Point3::new(f32::NAN, 0.0, 0.0), Vector3::zeros())
            .unwrap();

        let report = driver.run_frame(&FrameInput::default(), &FrameEnv::default());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].1, FlexError::NumericalError(_)));
        assert!(!driver.controller(broken).unwrap().is_active());
        assert!(driver.controller(healthy).unwrap().is_active());
        assert_eq!(driver.buffer(healthy).unwrap().frame(), 1);

        let report = driver.run_frame(&FrameInput::default(), &FrameEnv::default());
        assert!(report.is_clean());
        assert_eq!(report.stepped, 1);
    }

    #[test]
    fn test_shared_fields_and_lock() {
        let mut tree = RegionTree::new(BoundingSphere::new(Point3::origin(), 100.0));
        let root = tree.root();
        tree.add_field(
            root,
            ForceField::Wind(WindField {
                bounds: BoundingSphere::new(Point3::origin(), 100.0),
                velocity: Vector3::new(0.0, 20.0, 0.0),
                drag: 1.0,
                exclusive: false,
            }),
        )
        .unwrap();
        let mask = FieldVisitMask::for_hierarchy(&tree).unwrap();
        let lock = ImpulseLock::new();

        let mut driver = FrameDriver::new(4).unwrap();
        let mut graph = ConnectorMap::new();
        graph.insert(1, NodeRef::Transform(Isometry3::identity()));
        let indices: Vec<usize> = (0..4)
            .map(|i| {
                let mut controller = rope(&format!("rope-{i}"));
                controller.set_connector(0, Some(1)).unwrap();
                driver.add(controller)
            })
            .collect();
        assert!(driver.activate_all(&graph).is_empty());

        let env = FrameEnv {
            fields: Some(SharedFields {
                hierarchy: &tree,
                mask: &mask,
                root,
            }),
            impulse_lock: Some(&lock),
        };
        let input = FrameInput {
            gravity: Vector3::zeros(),
            ..FrameInput::default()
        };
        let report = driver.run_frame(&input, &env);
        assert!(report.is_clean());

        for i in indices {
            let body = driver.controller(i).unwrap().flex_body().unwrap();
            assert_eq!(body.stats().fields, 1);
            assert!(body.positions()[8].y > 0.0);
        }
        assert!((0..mask.len()).all(|f| (0..MAX_THREAD_SLOTS).all(|t| !mask.is_visited(f, t))));
    }
}
