//! Contract between the core and the physics engine that owns the bodies.
//!
//! The core never integrates anything itself. It spawns bodies, reads their
//! positions and velocities, hands out impulses and manages point-to-point
//! constraints through [`PhysicsWorld`]. Every call takes handles minted by
//! the world and must tolerate handles that became invalid: lookups return
//! `None`, mutations return `false`.

use crate::store::EntityStore;
use crate::types::{BodyHandle, ConstraintHandle, NodeId};
use glam::Vec2;

/// Parameters of a body requested with [`PhysicsWorld::spawn_body`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyDesc {
    pub position: Vec2,
    pub radius: f32,
    /// Bounciness of contacts in `[0, 1]`.
    pub restitution: f32,
}

pub trait PhysicsWorld {
    /// Requests a new dynamic circular body.
    ///
    /// The handle is valid immediately, but the body may only become usable
    /// after a later step; poll [`PhysicsWorld::is_body_ready`].
    fn spawn_body(&mut self, desc: BodyDesc) -> BodyHandle;

    /// Removes a body and every constraint attached to it.
    fn remove_body(&mut self, body: BodyHandle) -> bool;

    fn is_body_ready(&self, body: BodyHandle) -> bool;

    fn translation(&self, body: BodyHandle) -> Option<Vec2>;

    fn linear_velocity(&self, body: BodyHandle) -> Option<Vec2>;

    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec2) -> bool;

    /// Applies an instantaneous impulse at the body's centre of mass.
    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec2) -> bool;

    /// Joins two ready bodies at the given local anchors.
    ///
    /// Returns `None` when either body is unknown or not ready yet.
    fn create_constraint(
        &mut self,
        anchor_a: Vec2,
        anchor_b: Vec2,
        body_a: BodyHandle,
        body_b: BodyHandle,
    ) -> Option<ConstraintHandle>;

    /// Removes a constraint. Idempotent: returns whether something was removed.
    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> bool;

    fn contains_constraint(&self, constraint: ConstraintHandle) -> bool;

    fn set_constraint_anchors(
        &mut self,
        constraint: ConstraintHandle,
        anchor_a: Vec2,
        anchor_b: Vec2,
    ) -> bool;
}

/// Position of particle `id`, or `None` while its body is not ready.
pub fn particle_position<W: PhysicsWorld + ?Sized>(
    store: &EntityStore,
    world: &W,
    id: NodeId,
) -> Option<Vec2> {
    let body = store.body_of(id).ok()?.ready()?;
    world.translation(body)
}

/// Mean position of the particles in `ids` that have a ready body.
pub fn centroid<W: PhysicsWorld + ?Sized>(
    store: &EntityStore,
    world: &W,
    ids: &[NodeId],
) -> Option<Vec2> {
    let (sum, count) = ids
        .iter()
        .filter_map(|&id| particle_position(store, world, id))
        .fold((Vec2::ZERO, 0usize), |(sum, n), p| (sum + p, n + 1));
    (count > 0).then(|| sum / count as f32)
}
