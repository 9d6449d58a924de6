//! Impulse-based containment dynamics.
//!
//! Groups have no body of their own. Each tick every group measures how far
//! its centroid drifted and hands its children an impulse against the drift,
//! plus a correction for children that strayed too far from the centre. An
//! impulse given to a child group is split evenly among that group's
//! children, down to the particles.
//!
//! Each group runs a small state machine:
//!
//! ```text
//! Init ─► InitialImpulse ─► CalcImpulse ─► Impulse ─┐
//!   │                          ▲                     │
//!   └──────────────────────────┴─────────────────────┘
//! ```
//!
//! `Init` waits until every descendant body is registered. `InitialImpulse`
//! runs once when [`Config::initial_impulse`] is set.

use crate::config::Config;
use crate::physics::{PhysicsWorld, centroid};
use crate::store::{EntityStore, ROOT};
use crate::types::NodeId;
use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f32::consts::{FRAC_PI_2, TAU};
use tracing::debug;

/// Squared displacement below which a group counts as not having moved.
pub const DISPLACEMENT_EPS: f32 = 1e-10;

/// Largest angle between a child's initial impulse and its radial direction.
pub const INITIAL_IMPULSE_JITTER: f32 = FRAC_PI_2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImpulsePhase {
    Init,
    InitialImpulse,
    CalcImpulse,
    Impulse,
}

#[derive(Clone, Debug)]
struct GroupImpulse {
    phase: ImpulsePhase,
    /// Centroid at the first ready tick; the root measures drift from here.
    anchor: Vec2,
    prev_centroid: Vec2,
    /// Unit direction used when the group did not move.
    fallback: Vec2,
    signature: u64,
    /// Centering impulse computed by the last `CalcImpulse`.
    centering: Vec2,
    magnitude: f32,
}

impl GroupImpulse {
    fn new(fallback: Vec2) -> Self {
        Self {
            phase: ImpulsePhase::Init,
            anchor: Vec2::ZERO,
            prev_centroid: Vec2::ZERO,
            fallback,
            signature: 0,
            centering: Vec2::ZERO,
            magnitude: 0.0,
        }
    }
}

/// Counters of one [`ImpulseDynamics::tick`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DynamicsReport {
    /// Groups that handed out impulses this tick.
    pub active_groups: usize,
    /// Groups still waiting in `Init`.
    pub waiting_groups: usize,
    /// Particles that received an impulse.
    pub impulses: usize,
}

/// Impulse that pushes a group back against its `displacement`.
///
/// A displacement whose squared length is below [`DISPLACEMENT_EPS`] has no
/// usable direction, so `fallback` (a unit vector) is used instead. The
/// result always has length `magnitude`.
pub fn centering_impulse(displacement: Vec2, magnitude: f32, fallback: Vec2) -> Vec2 {
    let dir = if displacement.length_squared() < DISPLACEMENT_EPS {
        fallback.normalize_or(Vec2::X)
    } else {
        -displacement.normalize_or(fallback)
    };
    dir * magnitude
}

/// Radial unit direction of `offset` turned by `jitter` radians.
///
/// A zero offset falls back to `fallback`.
pub fn jittered_outward(offset: Vec2, fallback: Vec2, jitter: f32) -> Vec2 {
    Vec2::from_angle(jitter).rotate(offset.normalize_or(fallback))
}

/// Impulse for one child of a group.
///
/// `base` is the group's magnitude divided by its child count, `share` the
/// child's part of the centering impulse. A child farther than
/// `max_displacement_scaling × radius` from `center` is pulled straight back
/// with `overshoot_scaling × base`; otherwise it gets its share plus the
/// attractor term (negative attractors push outward).
pub fn child_impulse(
    base: f32,
    share: Vec2,
    center: Vec2,
    child: Vec2,
    radius: f32,
    attractor: f32,
    cfg: &Config,
) -> Vec2 {
    let offset = child - center;
    let toward = -offset.normalize_or_zero();
    if offset.length() > cfg.max_displacement_scaling * radius {
        toward * base * cfg.overshoot_scaling
    } else {
        share + toward * base * attractor
    }
}

/// Magnitude of a group's impulse: `impulse_per_particle × area × count`.
pub fn group_magnitude(cfg: &Config, particle_count: usize) -> f32 {
    cfg.impulse_per_particle * cfg.particle_area() * particle_count as f32
}

#[derive(Debug)]
pub struct ImpulseDynamics {
    states: BTreeMap<NodeId, GroupImpulse>,
    rng: StdRng,
}

impl ImpulseDynamics {
    pub fn new(seed: u64) -> Self {
        Self {
            states: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn phase(&self, group: NodeId) -> Option<ImpulsePhase> {
        self.states.get(&group).map(|s| s.phase)
    }

    pub fn fallback_direction(&self, group: NodeId) -> Option<Vec2> {
        self.states.get(&group).map(|s| s.fallback)
    }

    /// Advances every group's machine by one tick and applies the
    /// resulting impulses to the world.
    pub fn tick<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        cfg: &Config,
    ) -> DynamicsReport {
        let mut report = DynamicsReport::default();
        let groups = store.groups_pre_order();
        self.states.retain(|g, _| store.contains(*g));

        let mut pending: BTreeMap<NodeId, Vec2> = BTreeMap::new();
        for group in groups {
            let Ok(particles) = store.get_all_particle_ids(group) else {
                continue;
            };
            let Ok(signature) = store.membership_signature(group) else {
                continue;
            };
            if particles.is_empty() {
                continue;
            }

            if !self.states.contains_key(&group) {
                let angle = self.rng.random_range(0.0..TAU);
                self.states
                    .insert(group, GroupImpulse::new(Vec2::from_angle(angle)));
            }
            let Some(state) = self.states.get_mut(&group) else {
                continue;
            };

            let all_ready = particles.iter().all(|&p| {
                store
                    .body_of(p)
                    .ok()
                    .and_then(|b| b.ready())
                    .is_some_and(|b| world.is_body_ready(b))
            });
            if !all_ready {
                state.phase = ImpulsePhase::Init;
                report.waiting_groups += 1;
                continue;
            }
            let Some(current) = centroid(store, world, &particles) else {
                continue;
            };

            if state.phase == ImpulsePhase::Init {
                state.anchor = current;
                state.prev_centroid = current;
                state.signature = signature;
                state.phase = if cfg.initial_impulse {
                    ImpulsePhase::InitialImpulse
                } else {
                    ImpulsePhase::CalcImpulse
                };
                debug!(group, particles = particles.len(), "group dynamics started");
            }
            if state.signature != signature {
                // Membership changed: the old centroid is meaningless.
                state.prev_centroid = current;
                state.signature = signature;
            }

            let magnitude = group_magnitude(cfg, particles.len());
            let Ok(node) = store.get_node(group) else {
                continue;
            };
            let children = node.children().to_vec();
            let depth = node.depth();
            let radius = node.as_group().map_or(0.0, |g| g.radius());
            let n = children.len().max(1) as f32;

            if state.phase == ImpulsePhase::InitialImpulse {
                for &c in &children {
                    let offset = child_position(store, world, c).map_or(Vec2::ZERO, |p| p - current);
                    let jitter = self
                        .rng
                        .random_range(-INITIAL_IMPULSE_JITTER..INITIAL_IMPULSE_JITTER);
                    let dir = jittered_outward(offset, state.fallback, jitter);
                    let impulse = dir * magnitude * cfg.initial_impulse_scaling / n;
                    distribute(store, c, impulse, &mut pending);
                }
                state.phase = ImpulsePhase::CalcImpulse;
            }

            if state.phase == ImpulsePhase::CalcImpulse {
                let displacement = if group == ROOT {
                    current - state.anchor
                } else {
                    current - state.prev_centroid
                };
                state.centering = centering_impulse(displacement, magnitude, state.fallback);
                state.magnitude = magnitude;
                state.prev_centroid = current;
                state.phase = ImpulsePhase::Impulse;
            }

            if state.phase == ImpulsePhase::Impulse {
                let share = state.centering / n;
                let base = state.magnitude / n;
                let attractor = cfg.attractor_at(depth);
                for &c in &children {
                    let Some(pos) = child_position(store, world, c) else {
                        continue;
                    };
                    let impulse = child_impulse(base, share, current, pos, radius, attractor, cfg);
                    distribute(store, c, impulse, &mut pending);
                }
                state.phase = ImpulsePhase::CalcImpulse;
                report.active_groups += 1;
            }
        }

        for (p, impulse) in pending {
            let Some(body) = store.body_of(p).ok().and_then(|b| b.ready()) else {
                continue;
            };
            if impulse.is_finite() && world.apply_impulse(body, impulse) {
                report.impulses += 1;
            }
        }
        report
    }
}

fn child_position<W: PhysicsWorld>(store: &EntityStore, world: &W, id: NodeId) -> Option<Vec2> {
    let ids = store.collect_particle_ids(id).ok()?;
    centroid(store, world, &ids)
}

/// Splits `impulse` evenly down the subtree of `node`, accumulating the
/// particle shares in `out`.
fn distribute(store: &EntityStore, node: NodeId, impulse: Vec2, out: &mut BTreeMap<NodeId, Vec2>) {
    let mut stack = vec![(node, impulse)];
    while let Some((id, impulse)) = stack.pop() {
        let Some(n) = store.node(id) else {
            continue;
        };
        if n.is_particle() {
            *out.entry(id).or_insert(Vec2::ZERO) += impulse;
            continue;
        }
        let children = n.children();
        if children.is_empty() {
            continue;
        }
        let split = impulse / children.len() as f32;
        stack.extend(children.iter().map(|&c| (c, split)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_hierarchy;
    use crate::node::NodeSpec;
    use crate::spring_world::SpringWorld;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn zero_displacement_uses_a_unit_fallback() {
        let cfg = Config {
            impulse_per_particle: 0.02,
            ..Config::default()
        };
        let magnitude = group_magnitude(&cfg, 4);
        let fallback = Vec2::from_angle(1.234);
        let impulse = centering_impulse(Vec2::ZERO, magnitude, fallback);

        assert!(impulse.is_finite());
        assert_relative_eq!(impulse.length(), magnitude, epsilon = 1e-6);
        assert_relative_eq!(impulse.normalize().length(), 1.0, epsilon = 1e-6);

        let share = impulse / 4.0;
        assert!(share.is_finite());
        let child = child_impulse(magnitude / 4.0, share, Vec2::ZERO, Vec2::ZERO, 2.0, 1.0, &cfg);
        assert!(child.is_finite());
    }

    #[test]
    fn tiny_displacement_is_treated_as_zero() {
        let impulse = centering_impulse(Vec2::new(1e-7, 0.0), 2.0, Vec2::Y);
        assert_abs_diff_eq!(impulse.x, 0.0);
        assert_abs_diff_eq!(impulse.y, 2.0);
    }

    #[test]
    fn centering_opposes_the_drift() {
        let drift = Vec2::new(0.3, -0.4);
        let impulse = centering_impulse(drift, 1.5, Vec2::X);
        assert!(impulse.dot(drift) < 0.0);
        assert_relative_eq!(impulse.length(), 1.5, epsilon = 1e-6);
    }

    #[test]
    fn overshooting_child_is_pulled_back() {
        let cfg = Config::default();
        let center = Vec2::new(1.0, 1.0);
        let child = center + Vec2::new(5.0, 2.0);
        // Share pointing outward must not win against the correction.
        let share = Vec2::new(10.0, 0.0);
        let impulse = child_impulse(0.5, share, center, child, 2.0, 0.0, &cfg);
        assert!(impulse.dot(center - child) > 0.0);
        assert_relative_eq!(impulse.length(), 0.5 * cfg.overshoot_scaling, epsilon = 1e-6);
    }

    #[test]
    fn attractor_sign_selects_pull_or_push() {
        let cfg = Config::default();
        let child = Vec2::new(1.0, 0.0);
        let pull = child_impulse(1.0, Vec2::ZERO, Vec2::ZERO, child, 4.0, 0.5, &cfg);
        let push = child_impulse(1.0, Vec2::ZERO, Vec2::ZERO, child, 4.0, -0.5, &cfg);
        assert!(pull.x < 0.0);
        assert!(push.x > 0.0);
        let none = child_impulse(1.0, Vec2::Y, Vec2::ZERO, child, 4.0, 0.0, &cfg);
        assert_eq!(none, Vec2::Y);
    }

    #[test]
    fn distribute_splits_by_child_count() {
        let mut store = EntityStore::new();
        let g = store.add_node(ROOT, NodeSpec::group(1.0)).unwrap();
        let a = store.add_node(g, NodeSpec::particle(1.0)).unwrap();
        let inner = store.add_node(g, NodeSpec::group(1.0)).unwrap();
        let b = store.add_node(inner, NodeSpec::particle(1.0)).unwrap();
        let c = store.add_node(inner, NodeSpec::particle(1.0)).unwrap();

        let mut out = BTreeMap::new();
        distribute(&store, g, Vec2::new(4.0, 0.0), &mut out);
        assert_eq!(out[&a], Vec2::new(2.0, 0.0));
        assert_eq!(out[&b], Vec2::new(1.0, 0.0));
        assert_eq!(out[&c], Vec2::new(1.0, 0.0));
    }

    #[test]
    fn groups_wait_for_registration_then_cycle() {
        let cfg = Config {
            entity_counts: vec![2, 3],
            ..Config::default()
        };
        let mut store = EntityStore::new();
        let mut world = SpringWorld::default();
        build_hierarchy(&mut store, &mut world, &cfg).unwrap();
        let mut dynamics = ImpulseDynamics::new(cfg.seed);

        let report = dynamics.tick(&mut store, &mut world, &cfg);
        assert_eq!(report.active_groups, 0);
        assert_eq!(dynamics.phase(ROOT), Some(ImpulsePhase::Init));

        world.step(1.0 / 60.0);
        for (p, _) in store.pending_bodies() {
            store.mark_body_ready(p).unwrap();
        }
        let report = dynamics.tick(&mut store, &mut world, &cfg);
        assert_eq!(report.active_groups, 3);
        assert_eq!(report.impulses, 6);
        assert_eq!(dynamics.phase(ROOT), Some(ImpulsePhase::CalcImpulse));
    }

    #[test]
    fn initial_impulse_pushes_children_outward() {
        let cfg = Config {
            entity_counts: vec![4],
            attractor_scaling: vec![0.0],
            ..Config::default()
        };
        let mut store = EntityStore::new();
        let mut world = SpringWorld::default();
        build_hierarchy(&mut store, &mut world, &cfg).unwrap();
        world.step(1.0 / 60.0);
        for (p, _) in store.pending_bodies() {
            store.mark_body_ready(p).unwrap();
        }
        let mut dynamics = ImpulseDynamics::new(cfg.seed);
        dynamics.tick(&mut store, &mut world, &cfg);

        // Every particle also got the same centering share; what remains
        // once the mean is removed is the outward initial impulse.
        let bodies: Vec<_> = store
            .get_children(ROOT)
            .unwrap()
            .iter()
            .map(|&p| store.body_of(p).unwrap().ready().unwrap())
            .collect();
        let velocities: Vec<Vec2> = bodies
            .iter()
            .map(|&b| world.linear_velocity(b).unwrap())
            .collect();
        let mean = velocities.iter().copied().sum::<Vec2>() / velocities.len() as f32;
        let positions: Vec<Vec2> = bodies
            .iter()
            .map(|&b| world.translation(b).unwrap())
            .collect();
        let center = positions.iter().copied().sum::<Vec2>() / positions.len() as f32;
        // Each jittered impulse stays within a quarter turn of its radial,
        // so the radial components add up to an outward push.
        let outward: f32 = velocities
            .iter()
            .zip(&positions)
            .map(|(v, p)| {
                assert!(v.is_finite());
                (*v - mean).dot(*p - center)
            })
            .sum();
        assert!(outward > 0.0);
    }

    #[test]
    fn jittered_direction_stays_within_a_quarter_turn() {
        let offset = Vec2::new(3.0, 4.0);
        for jitter in [-1.5, -0.7, 0.0, 0.4, 1.5] {
            let dir = jittered_outward(offset, Vec2::X, jitter);
            assert_relative_eq!(dir.length(), 1.0, epsilon = 1e-6);
            assert!(dir.dot(offset) > 0.0);
            assert_relative_eq!(dir.angle_to(offset.normalize()).abs(), f32::abs(jitter), epsilon = 1e-3);
        }
        assert_eq!(jittered_outward(Vec2::ZERO, Vec2::Y, 0.0), Vec2::Y);
    }

    #[test]
    fn initial_impulse_directions_depend_on_the_seed() {
        let cfg = Config {
            entity_counts: vec![4],
            attractor_scaling: vec![0.0],
            ..Config::default()
        };
        // Velocities relative to their mean cancel the shared centering
        // share, leaving only the initial impulses.
        let deviations = |seed: u64| {
            let mut store = EntityStore::new();
            let mut world = SpringWorld::default();
            build_hierarchy(&mut store, &mut world, &cfg).unwrap();
            world.step(1.0 / 60.0);
            for (p, _) in store.pending_bodies() {
                store.mark_body_ready(p).unwrap();
            }
            let mut dynamics = ImpulseDynamics::new(seed);
            dynamics.tick(&mut store, &mut world, &cfg);
            let velocities: Vec<Vec2> = store
                .get_children(ROOT)
                .unwrap()
                .iter()
                .map(|&p| {
                    let body = store.body_of(p).unwrap().ready().unwrap();
                    world.linear_velocity(body).unwrap()
                })
                .collect();
            let mean = velocities.iter().copied().sum::<Vec2>() / velocities.len() as f32;
            velocities.into_iter().map(|v| v - mean).collect::<Vec<_>>()
        };
        assert_eq!(deviations(1), deviations(1));
        let (a, b) = (deviations(1), deviations(2));
        assert!(a.iter().zip(&b).any(|(x, y)| x.distance(*y) > 1e-6));
    }

    #[test]
    fn same_seed_gives_same_fallbacks() {
        let cfg = Config {
            entity_counts: vec![3],
            ..Config::default()
        };
        let run = || {
            let mut store = EntityStore::new();
            let mut world = SpringWorld::default();
            build_hierarchy(&mut store, &mut world, &cfg).unwrap();
            let mut dynamics = ImpulseDynamics::new(7);
            dynamics.tick(&mut store, &mut world, &cfg);
            dynamics.fallback_direction(ROOT).unwrap()
        };
        assert_eq!(run(), run());
    }
}
