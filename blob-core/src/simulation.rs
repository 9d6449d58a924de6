//! Frame driver that ties the store, topology, dynamics, boundaries and
//! cosmetics together.
//!
//! One call to [`Simulation::tick`] runs, in order:
//! 1. deferred visual actions due this tick,
//! 2. body registration for bodies the world reports ready,
//! 3. the joint topology pass,
//! 4. group centre refresh,
//! 5. impulse dynamics,
//! 6. the relation animator,
//! 7. boundary tracing for every group drawn as a blob, followed by the
//!    budgeted geometry queue.
//!
//! The physics world is stepped by the caller after `tick`, so topology
//! corrections always land before impulses and both before integration.

use crate::blob::{Blob, BlobPolygon};
use crate::builder::{Built, build_hierarchy};
use crate::config::Config;
use crate::dynamics::{DynamicsReport, ImpulseDynamics};
use crate::error::{SimError, StoreError, TopologyWarning};
use crate::geometry::{BlobMesh, GeometryQueue};
use crate::joints::{JointTopology, TopologyReport};
use crate::physics::{PhysicsWorld, centroid, particle_position};
use crate::relations::RelationAnimator;
use crate::schedule::{DeferredAction, DeferredQueue};
use crate::store::{EntityStore, Removed};
use crate::types::NodeId;
use glam::{Vec2, Vec3};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What happened during one [`Simulation::tick`].
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub deferred_applied: usize,
    pub bodies_registered: usize,
    pub topology: TopologyReport,
    pub dynamics: DynamicsReport,
    pub retraced: usize,
    pub meshes_built: usize,
    pub warnings: Vec<TopologyWarning>,
}

/// A particle as handed to the renderer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleInstance {
    pub id: NodeId,
    pub position: Vec2,
    /// Radius times the particle's visual scale.
    pub radius: f32,
    pub color: Vec3,
    pub visible: bool,
}

/// A cosmetic relation between two drawn positions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelationSegment {
    pub from: NodeId,
    pub to: NodeId,
    pub start: Vec2,
    pub end: Vec2,
}

/// Everything the renderer needs for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameOutput {
    pub blobs: Vec<BlobPolygon>,
    pub meshes: Vec<BlobMesh>,
    pub particles: Vec<ParticleInstance>,
    pub relations: Vec<RelationSegment>,
}

pub struct Simulation<W: PhysicsWorld> {
    cfg: Config,
    store: EntityStore,
    world: W,
    built: Built,
    topology: JointTopology,
    dynamics: ImpulseDynamics,
    relations: RelationAnimator,
    deferred: DeferredQueue,
    blobs: BTreeMap<NodeId, Blob>,
    polygons: BTreeMap<NodeId, BlobPolygon>,
    geometry: GeometryQueue,
    tick: u64,
    last_warnings: usize,
}

impl<W: PhysicsWorld> Simulation<W> {
    /// Validates `cfg` and builds the hierarchy into `world`.
    pub fn new(cfg: Config, mut world: W) -> Result<Self, SimError> {
        cfg.validate()?;
        let mut store = EntityStore::new();
        let built = build_hierarchy(&mut store, &mut world, &cfg)?;
        info!(nodes = store.len(), seed = cfg.seed, "simulation ready");
        Ok(Self {
            topology: JointTopology::new(cfg.detach_experiment),
            dynamics: ImpulseDynamics::new(cfg.seed),
            relations: RelationAnimator::new(cfg.seed.wrapping_add(1)),
            geometry: GeometryQueue::new(cfg.particle_radius),
            deferred: DeferredQueue::default(),
            blobs: BTreeMap::new(),
            polygons: BTreeMap::new(),
            tick: 0,
            last_warnings: 0,
            cfg,
            store,
            world,
            built,
        })
    }

    /// Replaces the whole simulation with a fresh build of `cfg` in `world`.
    /// The current state is kept if `cfg` is invalid.
    pub fn rebuild(&mut self, cfg: Config, world: W) -> Result<(), SimError> {
        *self = Self::new(cfg, world)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn topology(&self) -> &JointTopology {
        &self.topology
    }

    pub fn dynamics(&self) -> &ImpulseDynamics {
        &self.dynamics
    }

    pub fn built(&self) -> &Built {
        &self.built
    }

    /// Number of completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Warnings raised by the last tick.
    pub fn last_warnings(&self) -> usize {
        self.last_warnings
    }

    pub fn pending_actions(&self) -> usize {
        self.deferred.len()
    }

    /// Runs one frame of the core. Step the world afterwards.
    pub fn tick(&mut self) -> Result<TickReport, SimError> {
        let now = self.tick;
        let mut report = TickReport {
            tick: now,
            ..TickReport::default()
        };

        for action in self.deferred.drain_due(now) {
            if self.apply(action)? {
                report.deferred_applied += 1;
            }
        }

        for (id, body) in self.store.pending_bodies() {
            if self.world.is_body_ready(body) && self.store.mark_body_ready(id)? {
                report.bodies_registered += 1;
            }
        }

        report.topology = self.topology.process(&mut self.store, &mut self.world);
        for e in &report.topology.errors {
            warn!(error = %e, "joint ring allocation failed");
        }

        for group in self.store.groups_pre_order() {
            let particles = self.store.get_all_particle_ids(group)?;
            if let Some(c) = centroid(&self.store, &self.world, &particles) {
                self.store.set_group_center(group, c)?;
            }
        }

        report.dynamics = self.dynamics.tick(&mut self.store, &mut self.world, &self.cfg);
        self.relations.tick(&mut self.store, &self.cfg.relations, now);

        let shown: Vec<NodeId> = self
            .store
            .groups_pre_order()
            .into_iter()
            .filter(|&g| self.shows_blob(g))
            .collect();
        self.blobs.retain(|g, _| self.store.contains(*g));
        self.polygons.retain(|g, _| shown.contains(g));
        for group in shown {
            let blob = self.blobs.entry(group).or_insert_with(|| Blob::new(group));
            let update = blob.update(
                &mut self.store,
                &self.world,
                self.cfg.trace_budget,
                self.cfg.trace_max_expansions,
            )?;
            report.retraced += usize::from(update.retraced);
            report.warnings.extend(update.warnings);
            match update.polygon {
                Some(polygon) => {
                    self.geometry.submit(now, &polygon);
                    self.polygons.insert(group, polygon);
                }
                None if blob.order().is_empty() => {
                    self.polygons.remove(&group);
                    self.geometry.forget(group);
                }
                None => {}
            }
        }
        let store = &self.store;
        self.geometry.retain(|g| store.contains(g));
        report.meshes_built = self.geometry.process(self.cfg.geometry_budget);

        self.last_warnings = report.warnings.len() + report.topology.errors.len();
        self.tick += 1;
        Ok(report)
    }

    /// Render data for the current state.
    pub fn frame(&self) -> FrameOutput {
        let blobs: Vec<BlobPolygon> = self
            .polygons
            .values()
            .filter(|p| self.shows_blob(p.group))
            .cloned()
            .collect();
        let meshes = blobs
            .iter()
            .filter_map(|p| self.geometry.mesh(p.group).cloned())
            .collect();

        let particles = self
            .built
            .particles
            .iter()
            .filter_map(|&id| {
                let p = self.store.node(id)?.as_particle()?;
                Some(ParticleInstance {
                    id,
                    position: particle_position(&self.store, &self.world, id)?,
                    radius: p.radius() * p.visual().scale(),
                    color: p.visual().color(),
                    visible: p.visual().visible(),
                })
            })
            .collect();

        let relations = self
            .relations
            .live()
            .iter()
            .filter_map(|r| {
                Some(RelationSegment {
                    from: r.from,
                    to: r.to,
                    start: self.position_of(r.from)?,
                    end: self.position_of(r.to)?,
                })
            })
            .collect();

        FrameOutput {
            blobs,
            meshes,
            particles,
            relations,
        }
    }

    /// Shows the children of `group` now and stops drawing its blob on the
    /// next tick. Returns `false` if the group was already expanded.
    pub fn expand(&mut self, group: NodeId) -> Result<bool, SimError> {
        let node = self.store.get_node(group)?;
        let visual = node.as_group().ok_or(StoreError::NotAGroup(group))?.visual();
        if visual.expanded() {
            return Ok(false);
        }
        let children = node.children().to_vec();
        let subtree = self.store.subtree(group)?;
        self.deferred.cancel_for(&subtree);

        for &c in &children {
            self.store.set_visible(c, true)?;
        }
        self.deferred.schedule(
            self.tick,
            DeferredAction::SetExpanded {
                node: group,
                expanded: true,
            },
        );
        debug!(group, children = children.len(), "expanding group");
        Ok(true)
    }

    /// Draws the blob of `group` now and hides everything below it on the
    /// next tick. The root cannot be collapsed.
    pub fn collapse(&mut self, group: NodeId) -> Result<bool, SimError> {
        if group == self.store.root() {
            return Ok(false);
        }
        let visual = *self
            .store
            .get_node(group)?
            .as_group()
            .ok_or(StoreError::NotAGroup(group))?
            .visual();
        let subtree = self.store.subtree(group)?;
        let pending_expand = self.expansion_pending(group);
        if !visual.expanded() && !pending_expand {
            return Ok(false);
        }
        self.deferred.cancel_for(&subtree);

        self.store.set_visible(group, true)?;
        self.store.set_expanded(group, false)?;
        for &id in subtree.iter().skip(1) {
            self.deferred.schedule(
                self.tick,
                DeferredAction::SetVisible {
                    node: id,
                    visible: false,
                },
            );
            if self.store.node(id).is_some_and(|n| n.is_group()) {
                self.deferred.schedule(
                    self.tick,
                    DeferredAction::SetExpanded {
                        node: id,
                        expanded: false,
                    },
                );
            }
        }
        debug!(group, hidden = subtree.len() - 1, "collapsing group");
        Ok(true)
    }

    /// Expands a collapsed group or collapses an expanded one.
    pub fn toggle(&mut self, group: NodeId) -> Result<bool, SimError> {
        let expanded = self
            .store
            .get_node(group)?
            .as_group()
            .ok_or(StoreError::NotAGroup(group))?
            .visual()
            .expanded();
        if expanded {
            self.collapse(group)
        } else {
            self.expand(group)
        }
    }

    /// Deepest group whose blob mesh contains `point`.
    pub fn group_at(&self, point: Vec2) -> Option<NodeId> {
        self.polygons
            .keys()
            .filter(|&&g| self.shows_blob(g))
            .filter(|&&g| self.geometry.mesh(g).is_some_and(|m| m.contains(point)))
            .max_by_key(|&&g| self.store.node(g).map_or(0, |n| n.depth()))
            .copied()
    }

    /// Visible particle under `point`, if any.
    pub fn particle_at(&self, point: Vec2) -> Option<NodeId> {
        self.frame()
            .particles
            .into_iter()
            .filter(|p| p.visible && p.position.distance(point) <= p.radius)
            .min_by(|a, b| {
                a.position
                    .distance_squared(point)
                    .total_cmp(&b.position.distance_squared(point))
            })
            .map(|p| p.id)
    }

    /// Sets the visual scale of every particle. Joint anchors follow on
    /// the next tick.
    pub fn scale_particles(&mut self, scale: f32) -> Result<usize, SimError> {
        let mut changed = 0;
        for &id in &self.built.particles {
            if self.store.contains(id) && self.store.set_particle_scale(id, scale)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Deletes `id` with its subtree, its bodies and its joints.
    pub fn remove(&mut self, id: NodeId) -> Result<Removed, SimError> {
        let removed = self
            .topology
            .delete_node(&mut self.store, &mut self.world, id)?;
        self.deferred.cancel_for(&removed.nodes);
        for node in &removed.nodes {
            self.blobs.remove(node);
            self.polygons.remove(node);
        }
        self.built.particles.retain(|p| !removed.nodes.contains(p));
        self.built.groups.retain(|g| !removed.nodes.contains(g));
        let store = &self.store;
        self.geometry.retain(|g| store.contains(g));
        info!(id, nodes = removed.nodes.len(), joints = removed.joints.len(), "removed subtree");
        Ok(removed)
    }

    /// Moves `id` under `new_parent`; the affected rings are rebuilt on the
    /// following ticks.
    pub fn reparent(&mut self, id: NodeId, new_parent: NodeId) -> Result<(), SimError> {
        self.topology
            .move_node(&mut self.store, &mut self.world, id, new_parent)?;
        let visible = self.store.get_node(new_parent)?.as_group().is_some_and(|g| {
            g.visual().visible() && g.visual().expanded()
        });
        self.store.set_visible(id, visible)?;
        Ok(())
    }

    fn apply(&mut self, action: DeferredAction) -> Result<bool, SimError> {
        match action {
            DeferredAction::SetVisible { node, visible } => {
                if !self.store.contains(node) {
                    return Ok(false);
                }
                self.store.set_visible(node, visible)?;
            }
            DeferredAction::SetExpanded { node, expanded } => {
                if !self.store.node(node).is_some_and(|n| n.is_group()) {
                    return Ok(false);
                }
                self.store.set_expanded(node, expanded)?;
            }
        }
        Ok(true)
    }

    fn shows_blob(&self, group: NodeId) -> bool {
        self.store
            .node(group)
            .and_then(|n| n.as_group())
            .is_some_and(|g| g.visual().shows_blob())
    }

    /// `true` if an expansion of `group` is still waiting in the queue.
    fn expansion_pending(&self, group: NodeId) -> bool {
        self.deferred.contains(DeferredAction::SetExpanded {
            node: group,
            expanded: true,
        })
    }

    fn position_of(&self, id: NodeId) -> Option<Vec2> {
        let node = self.store.node(id)?;
        match node.as_group() {
            Some(g) => Some(g.center()),
            None => particle_position(&self.store, &self.world, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spring_world::SpringWorld;
    use crate::store::ROOT;
    use approx::assert_relative_eq;

    const DT: f32 = 1.0 / 60.0;

    fn sim(counts: Vec<usize>) -> Simulation<SpringWorld> {
        let cfg = Config {
            entity_counts: counts,
            relations: crate::config::RelationConfig {
                spawn_chance: 0.0,
                ..Default::default()
            },
            ..Config::default()
        };
        Simulation::new(cfg, SpringWorld::default()).unwrap()
    }

    fn run(sim: &mut Simulation<SpringWorld>, ticks: usize) {
        for _ in 0..ticks {
            sim.tick().unwrap();
            sim.world_mut().step(DT);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = Config {
            entity_counts: vec![],
            ..Config::default()
        };
        assert!(matches!(
            Simulation::new(cfg, SpringWorld::default()),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn top_level_groups_become_blobs() {
        let mut sim = sim(vec![3, 4]);
        run(&mut sim, 10);

        assert!(sim.store().pending_bodies().is_empty());
        assert_eq!(sim.topology().len(), 3 * 4 + 3);
        let frame = sim.frame();
        assert_eq!(frame.blobs.len(), 3);
        assert_eq!(frame.meshes.len(), 3);
        for blob in &frame.blobs {
            assert_eq!(blob.points.len(), 4);
            assert!(blob.positions().all(|p| p.is_finite()));
        }
        assert_eq!(frame.particles.len(), 12);
        assert!(frame.particles.iter().all(|p| p.position.is_finite()));
        assert!(frame.particles.iter().all(|p| !p.visible));
        sim.store().assert_invariants();
    }

    #[test]
    fn simulation_stays_finite() {
        let mut sim = sim(vec![3, 3, 4]);
        run(&mut sim, 240);
        for p in sim.frame().particles {
            assert!(p.position.is_finite(), "particle {} at {:?}", p.id, p.position);
        }
        assert_eq!(sim.tick_count(), 240);
    }

    #[test]
    fn expand_shows_children_before_hiding_the_blob() {
        let mut sim = sim(vec![3, 4]);
        run(&mut sim, 5);
        let group = sim.store().get_children(ROOT).unwrap()[0];
        let children = sim.store().get_children(group).unwrap().to_vec();

        assert!(sim.expand(group).unwrap());
        for &c in &children {
            assert!(sim.store().is_visible(c).unwrap());
        }
        let center = sim.store().get_node(group).unwrap().as_group().unwrap().center();
        assert_eq!(sim.group_at(center), Some(group));
        assert!(sim.frame().blobs.iter().any(|b| b.group == group));

        run(&mut sim, 1);
        assert!(!sim.frame().blobs.iter().any(|b| b.group == group));
        assert!(!sim.expand(group).unwrap());
    }

    #[test]
    fn collapse_hides_descendants_on_the_next_tick() {
        let mut sim = sim(vec![3, 4]);
        run(&mut sim, 5);
        let group = sim.store().get_children(ROOT).unwrap()[1];
        let children = sim.store().get_children(group).unwrap().to_vec();
        sim.expand(group).unwrap();
        run(&mut sim, 1);

        assert!(sim.collapse(group).unwrap());
        let g = sim.store().get_node(group).unwrap().as_group().unwrap();
        assert!(g.visual().shows_blob());
        assert!(children.iter().all(|&c| sim.store().is_visible(c).unwrap()));

        run(&mut sim, 1);
        assert!(children.iter().all(|&c| !sim.store().is_visible(c).unwrap()));
        assert!(sim.frame().blobs.iter().any(|b| b.group == group));
        assert!(!sim.collapse(ROOT).unwrap());
    }

    #[test]
    fn collapse_cancels_a_pending_expansion() {
        let mut sim = sim(vec![3, 4]);
        run(&mut sim, 5);
        let group = sim.store().get_children(ROOT).unwrap()[2];
        sim.expand(group).unwrap();
        assert!(sim.collapse(group).unwrap());
        run(&mut sim, 1);
        let g = sim.store().get_node(group).unwrap().as_group().unwrap();
        assert!(!g.visual().expanded());
        assert!(g.visual().shows_blob());
    }

    #[test]
    fn removing_a_group_drops_its_blob_and_bodies() {
        let mut sim = sim(vec![3, 4]);
        run(&mut sim, 5);
        let group = sim.store().get_children(ROOT).unwrap()[0];
        let bodies = sim.world().body_count();

        let removed = sim.remove(group).unwrap();
        assert_eq!(removed.nodes.len(), 5);
        assert_eq!(sim.world().body_count(), bodies - 4);
        run(&mut sim, 5);

        let frame = sim.frame();
        assert!(frame.blobs.iter().all(|b| b.group != group));
        assert_eq!(frame.particles.len(), 8);
        sim.store().assert_invariants();
    }

    #[test]
    fn group_left_with_two_particles_draws_no_blob() {
        let mut sim = sim(vec![2, 3]);
        run(&mut sim, 5);
        let a = sim.store().get_children(ROOT).unwrap()[0];
        let b = sim.store().get_children(ROOT).unwrap()[1];
        assert!(sim.frame().meshes.iter().any(|m| m.group == a));

        let moved = sim.store().get_children(a).unwrap()[0];
        sim.reparent(moved, b).unwrap();
        run(&mut sim, 3);

        let frame = sim.frame();
        assert!(frame.blobs.iter().all(|blob| blob.group != a));
        assert!(frame.meshes.iter().all(|m| m.group != a));
        assert!(sim.group_at(sim.store().node(a).unwrap().as_group().unwrap().center()) != Some(a));
        for &c in sim.store().get_children(a).unwrap() {
            assert!(sim.store().is_visible(c).unwrap());
        }
        sim.store().assert_invariants();
    }

    #[test]
    fn particle_scale_reaches_the_anchors() {
        let mut sim = sim(vec![2, 3]);
        run(&mut sim, 5);
        assert_eq!(sim.scale_particles(1.5).unwrap(), 6);
        let report = sim.tick().unwrap();
        assert!(report.topology.anchors_rescaled > 0);
    }

    #[test]
    fn scale_change_and_removal_in_one_tick_scale_anchors_once() {
        let mut sim = sim(vec![2, 4]);
        run(&mut sim, 5);
        sim.scale_particles(1.5).unwrap();
        let group = sim.store().get_children(ROOT).unwrap()[0];
        let victim = sim.store().get_children(group).unwrap()[0];
        sim.remove(victim).unwrap();
        sim.tick().unwrap();

        assert_eq!(sim.topology().ring_of(group).len(), 3);
        for r in sim.topology().records() {
            assert_relative_eq!(r.anchor_a.length(), 1.5, epsilon = 1e-4);
            assert_relative_eq!(r.anchor_b.length(), 1.5, epsilon = 1e-4);
        }
    }
}
