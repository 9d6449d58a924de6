//! Reference [`PhysicsWorld`]: circular bodies, zero-length springs between
//! anchor points and circle contacts with restitution.
//!
//! Integration is semi-implicit Euler. Bodies do not rotate, so local
//! anchors are plain offsets from the body centre. Mass is proportional to
//! area (`π r²`).

use crate::physics::{BodyDesc, PhysicsWorld};
use crate::types::{BodyHandle, ConstraintHandle};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Tuning of the reference world.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpringWorldConfig {
    /// Spring constant of every constraint.
    pub stiffness: f32,
    /// Damping of the relative velocity across a constraint.
    pub damping: f32,
    /// Velocity decay per second applied to every body.
    pub linear_damping: f32,
    /// Steps a spawned body stays pending before it becomes ready.
    pub registration_delay: u32,
    /// Positional correction factor for overlapping circles, in `[0, 1]`.
    pub contact_correction: f32,
}

impl Default for SpringWorldConfig {
    fn default() -> Self {
        Self {
            stiffness: 60.0,
            damping: 4.0,
            linear_damping: 0.8,
            registration_delay: 1,
            contact_correction: 0.8,
        }
    }
}

#[derive(Clone, Debug)]
struct Body {
    position: Vec2,
    velocity: Vec2,
    radius: f32,
    inv_mass: f32,
    restitution: f32,
    /// Steps left until the body is ready.
    pending: u32,
}

impl Body {
    fn ready(&self) -> bool {
        self.pending == 0
    }
}

#[derive(Clone, Copy, Debug)]
struct Spring {
    a: BodyHandle,
    b: BodyHandle,
    anchor_a: Vec2,
    anchor_b: Vec2,
}

#[derive(Debug, Default)]
pub struct SpringWorld {
    pub config: SpringWorldConfig,
    bodies: Vec<Option<Body>>,
    springs: Vec<Option<Spring>>,
    steps: u64,
}

impl SpringWorld {
    pub fn new(config: SpringWorldConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn body_count(&self) -> usize {
        self.bodies.iter().flatten().count()
    }

    pub fn constraint_count(&self) -> usize {
        self.springs.iter().flatten().count()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn body(&self, h: BodyHandle) -> Option<&Body> {
        self.bodies.get(h.0 as usize).and_then(Option::as_ref)
    }

    fn body_mut(&mut self, h: BodyHandle) -> Option<&mut Body> {
        self.bodies.get_mut(h.0 as usize).and_then(Option::as_mut)
    }

    fn ready_body(&self, h: BodyHandle) -> Option<&Body> {
        self.body(h).filter(|b| b.ready())
    }

    /// Advances the world by `dt` seconds.
    ///
    /// Pending bodies count down their registration delay and take no part
    /// in the step until they are ready.
    pub fn step(&mut self, dt: f32) {
        if dt <= 0.0 || !dt.is_finite() {
            return;
        }
        self.steps += 1;

        self.apply_springs(dt);

        let decay = 1.0 / (1.0 + self.config.linear_damping * dt);
        for body in self.bodies.iter_mut().flatten() {
            if !body.ready() {
                continue;
            }
            body.velocity *= decay;
            body.position += body.velocity * dt;
        }

        self.resolve_contacts();

        for body in self.bodies.iter_mut().flatten() {
            body.pending = body.pending.saturating_sub(1);
        }
    }

    fn apply_springs(&mut self, dt: f32) {
        let k = self.config.stiffness;
        let c = self.config.damping;
        for i in 0..self.springs.len() {
            let Some(s) = self.springs[i] else {
                continue;
            };
            let (Some(a), Some(b)) = (self.ready_body(s.a), self.ready_body(s.b)) else {
                continue;
            };
            let stretch = (b.position + s.anchor_b) - (a.position + s.anchor_a);
            let relative = b.velocity - a.velocity;
            let force = stretch * k + relative * c;
            let (inv_a, inv_b) = (a.inv_mass, b.inv_mass);

            if let Some(a) = self.body_mut(s.a) {
                a.velocity += force * inv_a * dt;
            }
            if let Some(b) = self.body_mut(s.b) {
                b.velocity -= force * inv_b * dt;
            }
        }
    }

    fn resolve_contacts(&mut self) {
        let n = self.bodies.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let (head, tail) = self.bodies.split_at_mut(j);
                let (Some(a), Some(b)) = (head[i].as_mut(), tail[0].as_mut()) else {
                    continue;
                };
                if !a.ready() || !b.ready() {
                    continue;
                }
                let delta = b.position - a.position;
                let min_dist = a.radius + b.radius;
                let dist_sq = delta.length_squared();
                if dist_sq >= min_dist * min_dist {
                    continue;
                }
                let dist = dist_sq.sqrt();
                let normal = if dist > f32::EPSILON {
                    delta / dist
                } else {
                    Vec2::X
                };
                let inv_sum = a.inv_mass + b.inv_mass;
                if inv_sum <= 0.0 {
                    continue;
                }

                let correction =
                    normal * (min_dist - dist) * self.config.contact_correction / inv_sum;
                a.position -= correction * a.inv_mass;
                b.position += correction * b.inv_mass;

                let closing = (b.velocity - a.velocity).dot(normal);
                if closing < 0.0 {
                    let e = 0.5 * (a.restitution + b.restitution);
                    let j = -(1.0 + e) * closing / inv_sum;
                    a.velocity -= normal * j * a.inv_mass;
                    b.velocity += normal * j * b.inv_mass;
                }
            }
        }
    }
}

impl PhysicsWorld for SpringWorld {
    fn spawn_body(&mut self, desc: BodyDesc) -> BodyHandle {
        let radius = desc.radius.max(f32::EPSILON);
        let mass = std::f32::consts::PI * radius * radius;
        let handle = BodyHandle(self.bodies.len() as u32);
        self.bodies.push(Some(Body {
            position: desc.position,
            velocity: Vec2::ZERO,
            radius,
            inv_mass: 1.0 / mass,
            restitution: desc.restitution.clamp(0.0, 1.0),
            pending: self.config.registration_delay,
        }));
        handle
    }

    fn remove_body(&mut self, body: BodyHandle) -> bool {
        let Some(slot) = self.bodies.get_mut(body.0 as usize) else {
            return false;
        };
        if slot.take().is_none() {
            return false;
        }
        for spring in self.springs.iter_mut() {
            if spring.is_some_and(|s| s.a == body || s.b == body) {
                *spring = None;
            }
        }
        true
    }

    fn is_body_ready(&self, body: BodyHandle) -> bool {
        self.ready_body(body).is_some()
    }

    fn translation(&self, body: BodyHandle) -> Option<Vec2> {
        self.ready_body(body).map(|b| b.position)
    }

    fn linear_velocity(&self, body: BodyHandle) -> Option<Vec2> {
        self.ready_body(body).map(|b| b.velocity)
    }

    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec2) -> bool {
        match self.body_mut(body) {
            Some(b) if b.ready() => {
                b.velocity = velocity;
                true
            }
            _ => false,
        }
    }

    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec2) -> bool {
        if !impulse.is_finite() {
            return false;
        }
        match self.body_mut(body) {
            Some(b) if b.ready() => {
                b.velocity += impulse * b.inv_mass;
                true
            }
            _ => false,
        }
    }

    fn create_constraint(
        &mut self,
        anchor_a: Vec2,
        anchor_b: Vec2,
        body_a: BodyHandle,
        body_b: BodyHandle,
    ) -> Option<ConstraintHandle> {
        if body_a == body_b {
            return None;
        }
        self.ready_body(body_a)?;
        self.ready_body(body_b)?;
        let handle = ConstraintHandle(self.springs.len() as u32);
        self.springs.push(Some(Spring {
            a: body_a,
            b: body_b,
            anchor_a,
            anchor_b,
        }));
        Some(handle)
    }

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> bool {
        self.springs
            .get_mut(constraint.0 as usize)
            .and_then(Option::take)
            .is_some()
    }

    fn contains_constraint(&self, constraint: ConstraintHandle) -> bool {
        self.springs
            .get(constraint.0 as usize)
            .is_some_and(Option::is_some)
    }

    fn set_constraint_anchors(
        &mut self,
        constraint: ConstraintHandle,
        anchor_a: Vec2,
        anchor_b: Vec2,
    ) -> bool {
        match self
            .springs
            .get_mut(constraint.0 as usize)
            .and_then(Option::as_mut)
        {
            Some(s) => {
                s.anchor_a = anchor_a;
                s.anchor_b = anchor_b;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn desc(x: f32, y: f32) -> BodyDesc {
        BodyDesc {
            position: Vec2::new(x, y),
            radius: 1.0,
            restitution: 0.5,
        }
    }

    fn ready_world() -> (SpringWorld, BodyHandle, BodyHandle) {
        let mut world = SpringWorld::default();
        let a = world.spawn_body(desc(0.0, 0.0));
        let b = world.spawn_body(desc(6.0, 0.0));
        world.step(1.0 / 60.0);
        (world, a, b)
    }

    #[test]
    fn bodies_become_ready_after_the_registration_delay() {
        let mut world = SpringWorld::new(SpringWorldConfig {
            registration_delay: 2,
            ..SpringWorldConfig::default()
        });
        let a = world.spawn_body(desc(0.0, 0.0));
        assert!(!world.is_body_ready(a));
        assert!(world.translation(a).is_none());
        world.step(0.1);
        assert!(!world.is_body_ready(a));
        world.step(0.1);
        assert!(world.is_body_ready(a));
        assert_eq!(world.translation(a), Some(Vec2::ZERO));
    }

    #[test]
    fn constraint_needs_ready_bodies() {
        let mut world = SpringWorld::default();
        let a = world.spawn_body(desc(0.0, 0.0));
        let b = world.spawn_body(desc(3.0, 0.0));
        assert!(world.create_constraint(Vec2::X, -Vec2::X, a, b).is_none());
        world.step(0.01);
        assert!(world.create_constraint(Vec2::X, -Vec2::X, a, b).is_some());
    }

    #[test]
    fn impulse_changes_velocity_by_inverse_mass() {
        let (mut world, a, _) = ready_world();
        let mass = std::f32::consts::PI;
        assert!(world.apply_impulse(a, Vec2::new(mass, 0.0)));
        let v = world.linear_velocity(a).unwrap();
        assert_relative_eq!(v.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(v.y, 0.0);
    }

    #[test]
    fn spring_pulls_anchors_together() {
        let (mut world, a, b) = ready_world();
        world
            .create_constraint(Vec2::X, -Vec2::X, a, b)
            .unwrap();
        let before = world.translation(b).unwrap().x - world.translation(a).unwrap().x;
        for _ in 0..30 {
            world.step(1.0 / 60.0);
        }
        let after = world.translation(b).unwrap().x - world.translation(a).unwrap().x;
        assert!(after < before);
    }

    #[test]
    fn overlapping_circles_are_pushed_apart() {
        let mut world = SpringWorld::default();
        let a = world.spawn_body(desc(0.0, 0.0));
        let b = world.spawn_body(desc(1.0, 0.0));
        world.step(1.0 / 60.0);
        world.step(1.0 / 60.0);
        let gap = world.translation(b).unwrap().x - world.translation(a).unwrap().x;
        assert!(gap > 1.0);
    }

    #[test]
    fn removing_a_constraint_is_idempotent() {
        let (mut world, a, b) = ready_world();
        let c = world.create_constraint(Vec2::X, -Vec2::X, a, b).unwrap();
        assert!(world.contains_constraint(c));
        assert!(world.remove_constraint(c));
        assert!(!world.remove_constraint(c));
        assert!(!world.contains_constraint(c));
        assert!(!world.set_constraint_anchors(c, Vec2::ZERO, Vec2::ZERO));
    }

    #[test]
    fn removing_a_body_drops_its_constraints() {
        let (mut world, a, b) = ready_world();
        let c = world.create_constraint(Vec2::X, -Vec2::X, a, b).unwrap();
        assert!(world.remove_body(a));
        assert!(!world.remove_body(a));
        assert!(!world.contains_constraint(c));
        assert!(!world.apply_impulse(a, Vec2::X));
        assert_eq!(world.body_count(), 1);
    }
}
