//! Joint topology: which particles are joined, and keeping the store's chain
//! adjacency in lockstep with the constraints in the physics world.
//!
//! Every group owns a ring of joints between its children. Ring gap `k`
//! lies between children `k` and `k + 1` (wrapping around); for each gap the
//! particle of child `k` closest to the gap midpoint is joined to the
//! particle of child `k + 1` closest to it. Groups are allocated deepest
//! first, because a group picks its candidates among the particles its
//! children flagged as outer.

use crate::error::{JointError, StoreError};
use crate::physics::{PhysicsWorld, centroid, particle_position};
use crate::store::{EntityStore, Removed};
use crate::types::{ConstraintHandle, JointId, NodeId};
use glam::Vec2;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Relative scale change below which anchors are left alone.
const SCALE_EPS: f32 = 1e-4;

/// Book-keeping of one live joint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointRecord {
    /// Group whose ring this joint belongs to.
    pub group: NodeId,
    pub a: NodeId,
    pub b: NodeId,
    /// Anchor on `a`'s body, in its local frame.
    pub anchor_a: Vec2,
    /// Anchor on `b`'s body, in its local frame.
    pub anchor_b: Vec2,
    pub handle: ConstraintHandle,
}

impl JointRecord {
    pub fn id(&self) -> JointId {
        JointId::between(self.a, self.b)
    }

    /// Anchor on particle `id`, if it is an endpoint.
    pub fn anchor_on(&self, id: NodeId) -> Option<Vec2> {
        if id == self.a {
            Some(self.anchor_a)
        } else if id == self.b {
            Some(self.anchor_b)
        } else {
            None
        }
    }
}

/// A joint removed by the detach experiment, waiting to be recreated.
#[derive(Clone, Copy, Debug)]
struct Detached {
    group: NodeId,
    a: NodeId,
    b: NodeId,
    anchor_a: Vec2,
    anchor_b: Vec2,
}

/// Summary of one [`JointTopology::process`] pass.
#[derive(Debug, Default)]
pub struct TopologyReport {
    pub allocated_groups: Vec<NodeId>,
    pub joints_created: usize,
    pub anchors_rescaled: usize,
    pub reattached: usize,
    pub dropped: Vec<JointId>,
    /// Groups still waiting for bodies to be registered.
    pub waiting: usize,
    /// Non-transient allocation failures of this pass.
    pub errors: Vec<JointError>,
}

#[derive(Debug, Default)]
pub struct JointTopology {
    records: BTreeMap<JointId, JointRecord>,
    /// Groups whose ring is in place.
    allocated: BTreeSet<NodeId>,
    /// Groups whose allocation failed loudly; not retried until marked dirty.
    failed: BTreeSet<NodeId>,
    /// Groups whose ring must be rebuilt.
    dirty: BTreeSet<NodeId>,
    detached: Vec<Detached>,
    detach_experiment: bool,
}

impl JointTopology {
    pub fn new(detach_experiment: bool) -> Self {
        Self {
            detach_experiment,
            ..Self::default()
        }
    }

    pub fn record(&self, id: JointId) -> Option<&JointRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &JointRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_allocated(&self, group: NodeId) -> bool {
        self.allocated.contains(&group)
    }

    /// Ring joints owned by `group`.
    pub fn ring_of(&self, group: NodeId) -> Vec<JointId> {
        self.records
            .values()
            .filter(|r| r.group == group)
            .map(JointRecord::id)
            .collect()
    }

    /// Requests a rebuild of `group`'s ring on the next [`JointTopology::process`].
    pub fn mark_dirty(&mut self, group: NodeId) {
        self.failed.remove(&group);
        self.dirty.insert(group);
    }

    // ------------------------------------------------------------------
    // Single joints
    // ------------------------------------------------------------------

    /// Joins particles `a` and `b` as part of `group`'s ring.
    ///
    /// The constraint, the chain edge in `group` and all its ancestors and
    /// the joint ids on both particles are created together; if any step
    /// fails nothing is left behind.
    pub fn create_joint<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        group: NodeId,
        (a, anchor_a): (NodeId, Vec2),
        (b, anchor_b): (NodeId, Vec2),
    ) -> Result<JointId, JointError> {
        if a == b {
            return Err(JointError::SelfJoint(a));
        }
        let id = JointId::between(a, b);
        if self.records.contains_key(&id) {
            return Err(JointError::AlreadyJoined(id));
        }
        let body_a = store
            .body_of(a)?
            .ready()
            .ok_or(JointError::BodyNotYetRegistered(a))?;
        let body_b = store
            .body_of(b)?
            .ready()
            .ok_or(JointError::BodyNotYetRegistered(b))?;
        if !store.get_node(group)?.is_group() {
            return Err(StoreError::NotAGroup(group).into());
        }

        let handle = world
            .create_constraint(anchor_a, anchor_b, body_a, body_b)
            .ok_or(JointError::BodyNotYetRegistered(a))?;

        if let Err(e) = store.link_chain(group, a, b) {
            world.remove_constraint(handle);
            return Err(e.into());
        }
        store.attach_joint(a, id)?;
        store.attach_joint(b, id)?;

        self.records.insert(
            id,
            JointRecord {
                group,
                a,
                b,
                anchor_a,
                anchor_b,
                handle,
            },
        );
        Ok(id)
    }

    /// Removes a joint from the world and the store.
    ///
    /// The constraint is only removed if the world still holds it; a handle
    /// dropped out of band is tolerated.
    pub fn delete_joint<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        id: JointId,
    ) -> Result<JointRecord, JointError> {
        let record = self
            .records
            .remove(&id)
            .ok_or(JointError::UnknownJoint(id))?;
        if world.contains_constraint(record.handle) {
            world.remove_constraint(record.handle);
        } else {
            warn!(joint = %id, "constraint already gone from the physics world");
        }
        forget_in_store(store, record.a, record.b);
        Ok(record)
    }

    /// Replaces the anchors of joint `id`.
    ///
    /// The world constraint is retargeted in place when it supports that;
    /// otherwise a new constraint is created before the old one is removed,
    /// so the pair is never unjoined. With the detach experiment enabled the
    /// old constraint is removed first and the joint comes back on the next
    /// tick instead.
    pub fn update_joint<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        id: JointId,
        anchor_a: Vec2,
        anchor_b: Vec2,
    ) -> Result<(), JointError> {
        let record = *self
            .records
            .get(&id)
            .ok_or(JointError::UnknownJoint(id))?;

        if self.detach_experiment {
            self.detach_until_next_tick(store, world, record, (record.a, anchor_a), (record.b, anchor_b))?;
            return Ok(());
        }

        let handle = if world.set_constraint_anchors(record.handle, anchor_a, anchor_b) {
            record.handle
        } else {
            let body_a = store
                .body_of(record.a)?
                .ready()
                .ok_or(JointError::BodyNotYetRegistered(record.a))?;
            let body_b = store
                .body_of(record.b)?
                .ready()
                .ok_or(JointError::BodyNotYetRegistered(record.b))?;
            let handle = world
                .create_constraint(anchor_a, anchor_b, body_a, body_b)
                .ok_or(JointError::BodyNotYetRegistered(record.a))?;
            world.remove_constraint(record.handle);
            handle
        };

        if let Some(r) = self.records.get_mut(&id) {
            r.anchor_a = anchor_a;
            r.anchor_b = anchor_b;
            r.handle = handle;
        }
        Ok(())
    }

    /// Replaces joint `id` by a joint between new endpoints, in the same
    /// group's ring. Returns the id of the replacement.
    ///
    /// The replacement constraint, chain edge and joint ids are created
    /// before the old ones are removed; if the replacement cannot be
    /// created the old joint is left untouched. Endpoints equal to the old
    /// ones only move the anchors.
    pub fn replace_joint<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        id: JointId,
        (a, anchor_a): (NodeId, Vec2),
        (b, anchor_b): (NodeId, Vec2),
    ) -> Result<JointId, JointError> {
        let record = *self
            .records
            .get(&id)
            .ok_or(JointError::UnknownJoint(id))?;
        let new_id = JointId::between(a, b);
        if new_id == id {
            let (anchor_a, anchor_b) = if record.a == a {
                (anchor_a, anchor_b)
            } else {
                (anchor_b, anchor_a)
            };
            self.update_joint(store, world, id, anchor_a, anchor_b)?;
            return Ok(id);
        }

        if self.detach_experiment {
            if a == b {
                return Err(JointError::SelfJoint(a));
            }
            if self.records.contains_key(&new_id) {
                return Err(JointError::AlreadyJoined(new_id));
            }
            self.detach_until_next_tick(store, world, record, (a, anchor_a), (b, anchor_b))?;
            return Ok(new_id);
        }

        let created = self.create_joint(store, world, record.group, (a, anchor_a), (b, anchor_b))?;
        self.delete_joint(store, world, id)?;
        debug!(old = %id, new = %created, group = record.group, "replaced joint");
        Ok(created)
    }

    fn detach_until_next_tick<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        record: JointRecord,
        (a, anchor_a): (NodeId, Vec2),
        (b, anchor_b): (NodeId, Vec2),
    ) -> Result<(), JointError> {
        self.delete_joint(store, world, record.id())?;
        info!(joint = %record.id(), "detach experiment: joint detached until next tick");
        self.detached.push(Detached {
            group: record.group,
            a,
            b,
            anchor_a,
            anchor_b,
        });
        Ok(())
    }

    /// Recreates joints removed by the detach experiment.
    pub fn reattach_pending<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
    ) -> usize {
        let mut reattached = 0;
        for d in std::mem::take(&mut self.detached) {
            match self.create_joint(store, world, d.group, (d.a, d.anchor_a), (d.b, d.anchor_b)) {
                Ok(_) => reattached += 1,
                Err(e) if e.is_transient() => self.detached.push(d),
                Err(e) => warn!(group = d.group, a = d.a, b = d.b, error = %e, "could not reattach joint"),
            }
        }
        reattached
    }

    /// Drops records whose constraint disappeared from the world.
    ///
    /// The chain edge and joint ids go in the same step; the owning group is
    /// marked for reallocation.
    pub fn validate_handles<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &W,
    ) -> Vec<JointId> {
        let stale: Vec<JointRecord> = self
            .records
            .values()
            .filter(|r| !world.contains_constraint(r.handle))
            .copied()
            .collect();
        for r in &stale {
            warn!(joint = %r.id(), group = r.group, "dropping joint removed out of band");
            self.records.remove(&r.id());
            forget_in_store(store, r.a, r.b);
            if store.contains(r.group) {
                self.mark_dirty(r.group);
            }
        }
        stale.iter().map(JointRecord::id).collect()
    }

    // ------------------------------------------------------------------
    // Rings
    // ------------------------------------------------------------------

    /// Builds the joint ring of `group` and assigns the outer flags at its
    /// depth. Returns the number of joints created.
    ///
    /// ### Errors
    /// - [`JointError::InsufficientChildren`] for fewer than two children.
    /// - [`JointError::BodyNotYetRegistered`] while any descendant body is
    ///   pending; nothing is created in that case.
    /// - [`JointError::NoCandidate`] if a child offers no particle.
    pub fn allocate_group<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        group: NodeId,
    ) -> Result<usize, JointError> {
        let children = store.get_children(group)?.to_vec();
        if children.len() < 2 {
            error!(group, count = children.len(), "cannot allocate a joint ring");
            return Err(JointError::InsufficientChildren {
                group,
                count: children.len(),
            });
        }

        let particles = store.get_all_particle_ids(group)?;
        if let Some(&p) = particles
            .iter()
            .find(|&&p| particle_position(store, world, p).is_none())
        {
            return Err(JointError::BodyNotYetRegistered(p));
        }

        let mut centers = Vec::with_capacity(children.len());
        let mut candidates = Vec::with_capacity(children.len());
        for &c in &children {
            let ids = store.get_all_particle_ids(c)?;
            centers.push(centroid(store, world, &ids).unwrap_or(Vec2::ZERO));
            candidates.push(ring_candidates(store, c, &ids));
        }

        // Plan every pair first so a missing candidate leaves no joint behind.
        let n = children.len();
        let mut chosen: BTreeSet<NodeId> = BTreeSet::new();
        let mut plan: Vec<(NodeId, Vec2, NodeId, Vec2)> = Vec::with_capacity(n);
        for gap in 0..n {
            let next = (gap + 1) % n;
            let mid = (centers[gap] + centers[next]) * 0.5;
            let (a, pos_a) = closest(store, world, &candidates[gap], mid, &chosen)
                .ok_or(JointError::NoCandidate { group, gap })?;
            let (b, pos_b) = closest(store, world, &candidates[next], pos_a, &chosen)
                .ok_or(JointError::NoCandidate { group, gap })?;
            let id = JointId::between(a, b);
            if a == b
                || self.records.contains_key(&id)
                || plan.iter().any(|&(x, _, y, _)| JointId::between(x, y) == id)
            {
                continue;
            }
            chosen.insert(a);
            chosen.insert(b);
            plan.push((a, pos_a, b, pos_b));
        }

        let mut created = 0;
        for (a, pos_a, b, pos_b) in plan {
            let dir = (pos_b - pos_a).normalize_or_zero();
            let anchor_a = dir * anchor_length(store, a);
            let anchor_b = -dir * anchor_length(store, b);
            self.create_joint(store, world, group, (a, anchor_a), (b, anchor_b))?;
            created += 1;
        }

        let outer = self.assign_outer_flags(store, world, group)?;
        self.allocated.insert(group);
        self.failed.remove(&group);
        self.dirty.remove(&group);
        debug!(group, joints = created, outer, "allocated joint ring");
        Ok(created)
    }

    /// Flags which particles of `group` lie on its boundary.
    ///
    /// A candidate is outer when it is an endpoint of one of the group's
    /// ring joints, or when it is farther from the group centroid than the
    /// ring joint nearest to it. Every other particle of the group is
    /// flagged inner. Returns the number of outer particles.
    pub fn assign_outer_flags<W: PhysicsWorld>(
        &self,
        store: &mut EntityStore,
        world: &W,
        group: NodeId,
    ) -> Result<usize, JointError> {
        let depth = store.get_node(group)?.depth();
        let particles = store.get_all_particle_ids(group)?;
        let center = centroid(store, world, &particles).unwrap_or(Vec2::ZERO);

        let ring: Vec<&JointRecord> = self.records.values().filter(|r| r.group == group).collect();
        let endpoints: BTreeSet<NodeId> = ring.iter().flat_map(|r| [r.a, r.b]).collect();
        let midpoints: Vec<Vec2> = ring
            .iter()
            .filter_map(|r| {
                let pa = particle_position(store, world, r.a)?;
                let pb = particle_position(store, world, r.b)?;
                Some((pa + pb) * 0.5)
            })
            .collect();

        let mut candidates = BTreeSet::new();
        for c in store.get_children(group)?.to_vec() {
            let ids = store.get_all_particle_ids(c)?;
            candidates.extend(ring_candidates(store, c, &ids));
        }

        let mut outer_count = 0;
        for &p in particles.iter() {
            let outer = candidates.contains(&p)
                && (endpoints.contains(&p)
                    || particle_position(store, world, p).is_some_and(|pos| {
                        nearest(&midpoints, pos)
                            .is_some_and(|m| pos.distance(center) > m.distance(center))
                    }));
            store.set_outer(p, depth, outer)?;
            outer_count += usize::from(outer);
        }
        store.bump_outer_revision(group)?;
        Ok(outer_count)
    }

    /// Drops the ring of `group` and allocates it again.
    pub fn reallocate<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        group: NodeId,
    ) -> Result<usize, JointError> {
        for id in self.ring_of(group) {
            self.delete_joint(store, world, id)?;
        }
        self.allocated.remove(&group);
        self.allocate_group(store, world, group)
    }

    /// Corrects anchors of particles whose visual scale changed since their
    /// joints were laid out. Returns the number of joints updated.
    pub fn rescale_anchors<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
    ) -> Result<usize, JointError> {
        let mut scaled: Vec<(NodeId, f32)> = Vec::new();
        store.traverse_dfs(|n| {
            if let Some(p) = n.as_particle() {
                let v = p.visual();
                let ratio = v.scale() / v.rigid_scale();
                if (ratio - 1.0).abs() > SCALE_EPS && ratio.is_finite() {
                    scaled.push((n.id(), ratio));
                }
            }
        });

        let mut updated = 0;
        for (p, ratio) in scaled {
            let joints: Vec<JointId> = store.get_node(p)?.joint_ids().iter().copied().collect();
            for id in joints {
                let Some(r) = self.records.get(&id).copied() else {
                    continue;
                };
                let (anchor_a, anchor_b) = if r.a == p {
                    (r.anchor_a * ratio, r.anchor_b)
                } else {
                    (r.anchor_a, r.anchor_b * ratio)
                };
                self.update_joint(store, world, id, anchor_a, anchor_b)?;
                updated += 1;
            }
            store.settle_rigid_scale(p)?;
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Structural changes
    // ------------------------------------------------------------------

    /// Deletes `id` with its subtree, removing the bodies and constraints it
    /// owned. Groups that lost ring joints are marked for reallocation.
    pub fn delete_node<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        id: NodeId,
    ) -> Result<Removed, JointError> {
        let bodies: Vec<_> = store
            .collect_particle_ids(id)?
            .into_iter()
            .filter_map(|p| store.body_of(p).ok()?.handle())
            .collect();
        let removed = store.delete_node(id)?;
        self.release_joints(store, world, &removed.joints);
        for node in &removed.nodes {
            self.allocated.remove(node);
            self.failed.remove(node);
            self.dirty.remove(node);
        }
        self.detached
            .retain(|d| !removed.nodes.contains(&d.a) && !removed.nodes.contains(&d.b));
        for body in bodies {
            world.remove_body(body);
        }
        Ok(removed)
    }

    /// Moves `id` under `new_parent`. Joints that touched the moved subtree
    /// are removed; every affected group is rebuilt on the next pass.
    pub fn move_node<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
        id: NodeId,
        new_parent: NodeId,
    ) -> Result<Vec<JointId>, JointError> {
        let old_parent = store.get_node(id)?.parent();
        let detached = store.move_node(id, new_parent)?;
        self.release_joints(store, world, &detached);

        for g in store.subtree(id)? {
            if store.get_node(g)?.is_group() {
                self.mark_dirty(g);
            }
        }
        for g in [Some(new_parent), old_parent].into_iter().flatten() {
            if store.contains(g) {
                self.mark_dirty(g);
            }
        }
        Ok(detached)
    }

    /// Removes constraints and records of joints the store already detached.
    fn release_joints<W: PhysicsWorld>(
        &mut self,
        store: &EntityStore,
        world: &mut W,
        joints: &[JointId],
    ) {
        for id in joints {
            let Some(record) = self.records.remove(id) else {
                continue;
            };
            if world.contains_constraint(record.handle) {
                world.remove_constraint(record.handle);
            }
            if store.contains(record.group) {
                self.mark_dirty(record.group);
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-tick pass
    // ------------------------------------------------------------------

    /// Runs one topology pass: reattach detached joints, drop stale
    /// handles, allocate or rebuild rings deepest first, then correct
    /// scaled anchors.
    pub fn process<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &mut W,
    ) -> TopologyReport {
        let mut report = TopologyReport {
            reattached: self.reattach_pending(store, world),
            dropped: self.validate_handles(store, world),
            ..TopologyReport::default()
        };

        let mut groups: Vec<(u32, NodeId)> = store
            .groups_pre_order()
            .into_iter()
            .filter(|g| {
                self.dirty.contains(g) || (!self.allocated.contains(g) && !self.failed.contains(g))
            })
            .filter_map(|g| Some((store.node(g)?.depth(), g)))
            .collect();
        groups.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, g) in groups {
            if !self.children_settled(store, g) {
                report.waiting += 1;
                continue;
            }
            let result = if self.allocated.contains(&g) {
                self.reallocate(store, world, g)
            } else {
                self.allocate_group(store, world, g)
            };
            match result {
                Ok(n) => {
                    report.joints_created += n;
                    report.allocated_groups.push(g);
                }
                Err(e) if e.is_transient() => report.waiting += 1,
                Err(e) => {
                    self.allocated.remove(&g);
                    self.dirty.remove(&g);
                    self.failed.insert(g);
                    report.errors.push(e);
                }
            }
        }

        match self.rescale_anchors(store, world) {
            Ok(n) => report.anchors_rescaled = n,
            Err(e) if e.is_transient() => {}
            Err(e) => report.errors.push(e),
        }
        report
    }

    /// `true` when every child group has finished its own allocation attempt.
    fn children_settled(&self, store: &EntityStore, group: NodeId) -> bool {
        store.get_children(group).is_ok_and(|children| {
            children.iter().all(|c| {
                store.node(*c).is_some_and(|n| n.is_particle())
                    || (!self.dirty.contains(c)
                        && (self.allocated.contains(c) || self.failed.contains(c)))
            })
        })
    }
}

/// Removes the chain edge and joint ids of `a`-`b`, tolerating deleted nodes.
fn forget_in_store(store: &mut EntityStore, a: NodeId, b: NodeId) {
    let id = JointId::between(a, b);
    store.unlink_chain(a, b);
    for end in [a, b] {
        if store.contains(end) {
            let _ = store.detach_joint(end, id);
        }
    }
}

/// Particles of child `c` eligible for its parent's ring: the child itself
/// when it is a particle, otherwise the particles it flagged as outer, or
/// all of its particles when it has no outer flags yet.
fn ring_candidates(store: &EntityStore, c: NodeId, ids: &[NodeId]) -> Vec<NodeId> {
    let Some(node) = store.node(c) else {
        return Vec::new();
    };
    if node.is_particle() {
        return vec![c];
    }
    let depth = node.depth();
    let outer: Vec<NodeId> = ids
        .iter()
        .copied()
        .filter(|&p| {
            store
                .node(p)
                .and_then(|n| n.as_particle())
                .is_some_and(|p| p.is_outer_at(depth))
        })
        .collect();
    if outer.is_empty() { ids.to_vec() } else { outer }
}

/// Candidate closest to `target`, preferring particles not chosen yet.
fn closest<W: PhysicsWorld>(
    store: &EntityStore,
    world: &W,
    candidates: &[NodeId],
    target: Vec2,
    chosen: &BTreeSet<NodeId>,
) -> Option<(NodeId, Vec2)> {
    candidates
        .iter()
        .filter_map(|&p| Some((p, particle_position(store, world, p)?)))
        .min_by(|(pa, a), (pb, b)| {
            chosen
                .contains(pa)
                .cmp(&chosen.contains(pb))
                .then(a.distance_squared(target).total_cmp(&b.distance_squared(target)))
        })
}

fn nearest(points: &[Vec2], to: Vec2) -> Option<Vec2> {
    points
        .iter()
        .copied()
        .min_by(|a, b| a.distance_squared(to).total_cmp(&b.distance_squared(to)))
}

/// Distance from a particle's centre to its anchor at the scale its joints
/// were laid out for. A pending scale change is applied afterwards by
/// [`JointTopology::rescale_anchors`] to every joint of the particle.
fn anchor_length(store: &EntityStore, id: NodeId) -> f32 {
    store
        .node(id)
        .and_then(|n| n.as_particle())
        .map_or(0.0, |p| p.radius() * p.visual().rigid_scale())
}
