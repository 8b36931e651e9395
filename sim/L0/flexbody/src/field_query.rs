//! Force-field lookup over an external spatial hierarchy.
//!
//! A body collects the force fields overlapping its bounding sphere once per
//! step. The hierarchy may reference one field from several regions, so every
//! query marks the fields it has already seen in a [`FieldVisitMask`]. The
//! mask holds one bit per worker-thread slot per field: two threads stepping
//! different bodies never touch each other's bits, and each thread clears its
//! own bits before the query returns.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::debug;

use crate::config::MAX_THREAD_SLOTS;
use crate::error::{FlexError, Result};
use crate::force::ForceField;
use crate::types::BoundingSphere;

/// Index of a force field in a hierarchy.
pub type FieldId = usize;

/// Index of a region in a hierarchy.
pub type RegionId = usize;

/// Field ids accepted by a query.
pub type ActiveFields = SmallVec<[FieldId; 8]>;

/// Spatial structure that owns force fields.
///
/// Regions form a tree. Each region may list fields, and a field may be
/// listed by more than one region.
pub trait FieldHierarchy: Send + Sync {
    /// Bounds of a region, or `None` for an unknown id.
    fn region_bounds(&self, region: RegionId) -> Option<BoundingSphere>;

    /// Child regions of a region.
    fn child_regions(&self, region: RegionId) -> &[RegionId];

    /// Fields listed directly by a region.
    fn region_fields(&self, region: RegionId) -> &[FieldId];

    /// Look up a field by id.
    fn field(&self, id: FieldId) -> Option<&ForceField>;

    /// Number of field ids in use (ids are `0..field_count`).
    fn field_count(&self) -> usize;
}

/// Per-field, per-thread-slot "already visited" bits.
#[derive(Debug, Default)]
pub struct FieldVisitMask {
    bits: Vec<AtomicU64>,
}

impl FieldVisitMask {
    /// Mask for `field_count` fields with every bit clear.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::ResourceExhausted`] if storage cannot be allocated.
    pub fn new(field_count: usize) -> Result<Self> {
        let mut bits = Vec::new();
        bits.try_reserve_exact(field_count)?;
        bits.extend((0..field_count).map(|_| AtomicU64::new(0)));
        Ok(Self { bits })
    }

    /// Mask sized for every field of a hierarchy.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::ResourceExhausted`] if storage cannot be allocated.
    pub fn for_hierarchy(hierarchy: &dyn FieldHierarchy) -> Result<Self> {
        Self::new(hierarchy.field_count())
    }

    /// Number of fields tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the mask tracks no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set this slot's bit for `field`. Returns `true` if it was clear.
    pub fn try_visit(&self, field: FieldId, slot: usize) -> bool {
        let bit = 1_u64 << slot;
        self.bits
            .get(field)
            .is_some_and(|word| word.fetch_or(bit, Ordering::AcqRel) & bit == 0)
    }

    /// Clear this slot's bit for `field`.
    pub fn clear(&self, field: FieldId, slot: usize) {
        if let Some(word) = self.bits.get(field) {
            word.fetch_and(!(1_u64 << slot), Ordering::AcqRel);
        }
    }

    /// Whether this slot's bit for `field` is set.
    #[must_use]
    pub fn is_visited(&self, field: FieldId, slot: usize) -> bool {
        self.bits
            .get(field)
            .is_some_and(|word| word.load(Ordering::Acquire) & (1_u64 << slot) != 0)
    }
}

/// Everything a body needs to query fields during a step.
#[derive(Clone, Copy)]
pub struct FieldContext<'a> {
    /// Spatial structure owning the fields.
    pub hierarchy: &'a dyn FieldHierarchy,
    /// Shared visit mask, sized for `hierarchy`.
    pub mask: &'a FieldVisitMask,
    /// Region the body lives in.
    pub region: RegionId,
}

impl std::fmt::Debug for FieldContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldContext")
            .field("fields", &self.hierarchy.field_count())
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Collect the distinct fields overlapping `bounds`.
///
/// Fields of `start` are always considered; descendant regions are entered
/// only when their bounds intersect `bounds`. A field is accepted when its
/// own bounds intersect `bounds`. If any accepted field is exclusive, only
/// exclusive fields are returned.
///
/// # Errors
///
/// Returns [`FlexError::IndexOutOfBounds`] for a thread slot outside
/// `0..MAX_THREAD_SLOTS` or an unknown start region, and
/// [`FlexError::InvalidConfig`] if the mask is smaller than the hierarchy.
pub fn query_fields(
    hierarchy: &dyn FieldHierarchy,
    mask: &FieldVisitMask,
    start: RegionId,
    bounds: &BoundingSphere,
    thread_slot: usize,
) -> Result<ActiveFields> {
    if thread_slot >= MAX_THREAD_SLOTS {
        return Err(FlexError::index_out_of_bounds(format!(
            "thread slot {thread_slot} exceeds {MAX_THREAD_SLOTS}"
        )));
    }
    if mask.len() < hierarchy.field_count() {
        return Err(FlexError::invalid_config(format!(
            "visit mask covers {} fields, hierarchy has {}",
            mask.len(),
            hierarchy.field_count()
        )));
    }
    if hierarchy.region_bounds(start).is_none() {
        return Err(FlexError::index_out_of_bounds(format!(
            "unknown region {start}"
        )));
    }

    let mut visited: SmallVec<[FieldId; 16]> = SmallVec::new();
    let mut accepted = ActiveFields::new();
    let mut any_exclusive = false;

    let mut stack: SmallVec<[RegionId; 16]> = SmallVec::new();
    stack.push(start);
    while let Some(region) = stack.pop() {
        for &id in hierarchy.region_fields(region) {
            if !mask.try_visit(id, thread_slot) {
                continue;
            }
            visited.push(id);

            let Some(field) = hierarchy.field(id) else {
                continue;
            };
            if !field.bounds().intersects(bounds) {
                continue;
            }
            any_exclusive |= field.is_exclusive();
            accepted.push(id);
        }

        for &child in hierarchy.child_regions(region) {
            if hierarchy
                .region_bounds(child)
                .is_some_and(|b| b.intersects(bounds))
            {
                stack.push(child);
            }
        }
    }

    for &id in &visited {
        mask.clear(id, thread_slot);
    }

    if any_exclusive {
        accepted.retain(|id| {
            hierarchy
                .field(*id)
                .is_some_and(ForceField::is_exclusive)
        });
    }

    debug!(
        start,
        thread_slot,
        visited = visited.len(),
        accepted = accepted.len(),
        "field query"
    );
    Ok(accepted)
}

#[derive(Debug, Clone)]
struct Region {
    bounds: BoundingSphere,
    children: Vec<RegionId>,
    fields: Vec<FieldId>,
}

/// A simple owned [`FieldHierarchy`].
///
/// Region `0` is the root and is created by [`RegionTree::new`].
#[derive(Debug, Clone)]
pub struct RegionTree {
    regions: Vec<Region>,
    fields: Vec<ForceField>,
}

impl RegionTree {
    /// Tree with a single root region.
    #[must_use]
    pub fn new(root_bounds: BoundingSphere) -> Self {
        Self {
            regions: vec![Region {
                bounds: root_bounds,
                children: Vec::new(),
                fields: Vec::new(),
            }],
            fields: Vec::new(),
        }
    }

    /// Root region id.
    #[must_use]
    pub const fn root(&self) -> RegionId {
        0
    }

    /// Number of regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_mut(&mut self, region: RegionId) -> Result<&mut Region> {
        self.regions
            .get_mut(region)
            .ok_or_else(|| FlexError::index_out_of_bounds(format!("unknown region {region}")))
    }

    /// Add a child region under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown parent.
    pub fn add_region(&mut self, parent: RegionId, bounds: BoundingSphere) -> Result<RegionId> {
        let id = self.regions.len();
        self.region_mut(parent)?.children.push(id);
        self.regions.push(Region {
            bounds,
            children: Vec::new(),
            fields: Vec::new(),
        });
        Ok(id)
    }

    /// Register a field and list it under `region`.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown region.
    pub fn add_field(&mut self, region: RegionId, field: ForceField) -> Result<FieldId> {
        let id = self.fields.len();
        self.region_mut(region)?.fields.push(id);
        self.fields.push(field);
        Ok(id)
    }

    /// List an existing field under another region as well.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown region or field.
    pub fn link_field(&mut self, region: RegionId, field: FieldId) -> Result<()> {
        if field >= self.fields.len() {
            return Err(FlexError::index_out_of_bounds(format!(
                "unknown field {field}"
            )));
        }
        self.region_mut(region)?.fields.push(field);
        Ok(())
    }
}

impl FieldHierarchy for RegionTree {
    fn region_bounds(&self, region: RegionId) -> Option<BoundingSphere> {
        self.regions.get(region).map(|r| r.bounds)
    }

    fn child_regions(&self, region: RegionId) -> &[RegionId] {
        self.regions.get(region).map_or(&[], |r| &r.children)
    }

    fn region_fields(&self, region: RegionId) -> &[FieldId] {
        self.regions.get(region).map_or(&[], |r| &r.fields)
    }

    fn field(&self, id: FieldId) -> Option<&ForceField> {
        self.fields.get(id)
    }

    fn field_count(&self) -> usize {
        self.fields.len()
    }
}
