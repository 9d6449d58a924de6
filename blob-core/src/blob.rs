//! Boundary tracing: turns a group's outer particles into an ordered,
//! closed contour.
//!
//! The contour is the longest cycle through the group's chain restricted to
//! the particles flagged outer at the group's depth. Ordering is expensive,
//! so a [`Blob`] only re-traces when the group's membership or outer flags
//! change and spreads a long search over several ticks with a
//! [`CycleSearch`]. Positions are re-sampled every tick.

use crate::error::{TopologyWarning, TraceError};
use crate::node::Chain;
use crate::physics::{PhysicsWorld, particle_position};
use crate::store::EntityStore;
use crate::types::NodeId;
use glam::{Vec2, Vec3};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Expansion cap used by [`trace_boundary`].
pub const DEFAULT_MAX_EXPANSIONS: usize = 200_000;

/// Ordered contour of a group, sampled from the physics world.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobPolygon {
    pub group: NodeId,
    pub color: Vec3,
    /// Particle ids with their current positions, in contour order.
    pub points: Vec<(NodeId, Vec2)>,
    /// `true` when the ordering belongs to an older membership.
    pub stale: bool,
}

impl BlobPolygon {
    pub fn positions(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.points.iter().map(|&(_, p)| p)
    }
}

#[derive(Debug)]
struct Frame {
    node: NodeId,
    next: usize,
}

/// Resumable longest-cycle search over a small undirected graph.
///
/// Nodes of degree below two can never lie on a cycle; they are peeled off
/// before the search so it only explores the 2-core. The search walks an
/// explicit stack, so [`CycleSearch::advance`] can stop after any number of
/// expansions and continue later from the same place. The best cycle is
/// only replaced by a strictly longer one, so ties go to the cycle found
/// first.
#[derive(Debug)]
pub struct CycleSearch {
    group: NodeId,
    adjacency: BTreeMap<NodeId, Vec<NodeId>>,
    /// Core members in `members` order; later ones are only tried when no
    /// cycle runs through the earlier ones.
    starts: Vec<NodeId>,
    start_idx: usize,
    stack: Vec<Frame>,
    on_path: BTreeSet<NodeId>,
    best: Option<Vec<NodeId>>,
    expansions: usize,
    max_expansions: usize,
    done: bool,
    warnings: Vec<TopologyWarning>,
}

impl CycleSearch {
    /// Prepares a search over `chain` restricted to `members`.
    ///
    /// The cycle runs through the first member (in `members` order) that
    /// survives pruning and lies on any cycle. Neighbours that are not
    /// members are skipped; neighbours for which `is_live` returns `false`
    /// are reported as [`TopologyWarning::DanglingChainReference`] and
    /// treated as dead ends.
    pub fn new(
        group: NodeId,
        members: &[NodeId],
        chain: &Chain,
        is_live: impl Fn(NodeId) -> bool,
        max_expansions: usize,
    ) -> Self {
        let member_set: BTreeSet<NodeId> = members.iter().copied().collect();
        let mut warnings = Vec::new();
        let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for &m in members {
            let mut list = Vec::new();
            for &n in chain.neighbours(m) {
                if !is_live(n) {
                    warnings.push(TopologyWarning::DanglingChainReference {
                        group,
                        from: m,
                        to: n,
                    });
                    continue;
                }
                if n != m && member_set.contains(&n) && !list.contains(&n) {
                    list.push(n);
                }
            }
            adjacency.insert(m, list);
        }
        prune_to_core(&mut adjacency);

        let starts: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|m| adjacency.contains_key(m))
            .collect();

        let mut search = Self {
            group,
            adjacency,
            starts,
            start_idx: 0,
            stack: Vec::new(),
            on_path: BTreeSet::new(),
            best: None,
            expansions: 0,
            max_expansions,
            done: false,
            warnings,
        };
        search.begin_at(0);
        search
    }

    fn start(&self) -> Option<NodeId> {
        self.starts.get(self.start_idx).copied()
    }

    /// Restarts the walk from `starts[idx]`, or finishes when none is left.
    fn begin_at(&mut self, idx: usize) {
        self.start_idx = idx;
        self.stack.clear();
        self.on_path.clear();
        match self.start() {
            Some(s) => {
                self.stack.push(Frame { node: s, next: 0 });
                self.on_path.insert(s);
            }
            None => self.done = true,
        }
    }

    /// Explores up to `budget` edges. Returns `true` once the search is over.
    pub fn advance(&mut self, budget: usize) -> bool {
        let mut spent = 0;
        while !self.done && spent < budget {
            if self.expansions >= self.max_expansions {
                debug!(group = self.group, expansions = self.expansions, "cycle search capped");
                self.done = true;
                break;
            }
            let Some(top) = self.stack.last_mut() else {
                if self.best.is_some() {
                    self.done = true;
                } else {
                    self.begin_at(self.start_idx + 1);
                }
                continue;
            };
            let Some(&next) = self.adjacency.get(&top.node).and_then(|ns| ns.get(top.next)) else {
                if let Some(frame) = self.stack.pop() {
                    self.on_path.remove(&frame.node);
                }
                continue;
            };
            top.next += 1;
            spent += 1;
            self.expansions += 1;

            if Some(next) == self.start() {
                let len = self.stack.len();
                let longer = len >= 3 && self.best.as_ref().is_none_or(|b| len > b.len());
                if longer {
                    self.best = Some(self.stack.iter().map(|f| f.node).collect());
                    if len == self.adjacency.len() {
                        // Cannot get longer than every node of the core.
                        self.done = true;
                    }
                }
            } else if !self.on_path.contains(&next) {
                self.on_path.insert(next);
                self.stack.push(Frame { node: next, next: 0 });
            }
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn expansions(&self) -> usize {
        self.expansions
    }

    /// Warnings collected while preparing the search.
    pub fn warnings(&self) -> &[TopologyWarning] {
        &self.warnings
    }

    /// Best cycle found so far.
    pub fn result(&self) -> Result<Vec<NodeId>, TopologyWarning> {
        self.best
            .clone()
            .ok_or(TopologyWarning::NoCycleFound { group: self.group })
    }
}

/// Removes nodes of degree below two until none are left.
fn prune_to_core(adjacency: &mut BTreeMap<NodeId, Vec<NodeId>>) {
    let mut queue: Vec<NodeId> = adjacency
        .iter()
        .filter(|(_, ns)| ns.len() < 2)
        .map(|(&n, _)| n)
        .collect();
    while let Some(n) = queue.pop() {
        let Some(neighbours) = adjacency.remove(&n) else {
            continue;
        };
        for m in neighbours {
            if let Some(list) = adjacency.get_mut(&m) {
                list.retain(|&x| x != n);
                if list.len() < 2 {
                    queue.push(m);
                }
            }
        }
    }
}

/// Particles of `group` flagged outer at the group's depth, in pre-order.
pub fn outer_particles(store: &EntityStore, group: NodeId) -> Result<Vec<NodeId>, TraceError> {
    let depth = store.get_node(group)?.depth();
    Ok(store
        .collect_particle_ids(group)?
        .into_iter()
        .filter(|&p| {
            store
                .node(p)
                .and_then(|n| n.as_particle())
                .is_some_and(|p| p.is_outer_at(depth))
        })
        .collect())
}

/// Traces the boundary of `group` in one go.
///
/// ### Errors
/// - [`TopologyWarning::InsufficientOuterParticles`] for fewer than three
///   outer particles.
/// - [`TopologyWarning::NoCycleFound`] when the restricted chain is acyclic.
pub fn trace_boundary(store: &EntityStore, group: NodeId) -> Result<Vec<NodeId>, TraceError> {
    let outer = outer_particles(store, group)?;
    if outer.len() < 3 {
        return Err(TopologyWarning::InsufficientOuterParticles {
            group,
            count: outer.len(),
        }
        .into());
    }
    let mut search = CycleSearch::new(
        group,
        &outer,
        store.chain(group)?,
        |id| is_live_particle(store, id),
        DEFAULT_MAX_EXPANSIONS,
    );
    search.advance(usize::MAX);
    Ok(search.result()?)
}

fn is_live_particle(store: &EntityStore, id: NodeId) -> bool {
    store.node(id).is_some_and(|n| n.is_particle())
}

/// Outcome of one [`Blob::update`].
#[derive(Debug, Default)]
pub struct BlobUpdate {
    pub polygon: Option<BlobPolygon>,
    pub warnings: Vec<TopologyWarning>,
    /// A new ordering was adopted this tick.
    pub retraced: bool,
}

/// Per-group boundary state.
#[derive(Debug)]
pub struct Blob {
    group: NodeId,
    /// (membership signature, outer revision) of the adopted ordering.
    key: Option<(u64, u64)>,
    order: Vec<NodeId>,
    search: Option<((u64, u64), CycleSearch)>,
    stale: bool,
}

impl Blob {
    pub fn new(group: NodeId) -> Self {
        Self {
            group,
            key: None,
            order: Vec::new(),
            search: None,
            stale: true,
        }
    }

    pub fn group(&self) -> NodeId {
        self.group
    }

    /// Current contour order, possibly stale.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    /// Advances the boundary of this blob by one tick.
    ///
    /// Starts a retrace when the membership signature or the outer-flag
    /// revision changed, spends at most `budget` expansions on a running
    /// search and samples the current ordering. A failed search keeps the
    /// previous ordering, marked stale, and reports a warning. A group with
    /// fewer than three outer particles drops its ordering and produces no
    /// polygon; if it also has fewer than three children they are shown
    /// instead.
    pub fn update<W: PhysicsWorld>(
        &mut self,
        store: &mut EntityStore,
        world: &W,
        budget: usize,
        max_expansions: usize,
    ) -> Result<BlobUpdate, TraceError> {
        let mut update = BlobUpdate::default();
        let signature = store.membership_signature(self.group)?;
        let (revision, color) = match store.get_node(self.group)?.as_group() {
            Some(g) => (g.outer_revision(), g.visual().color()),
            None => return Err(crate::error::StoreError::NotAGroup(self.group).into()),
        };
        let key = (signature, revision);

        let searching_key = self.search.as_ref().map(|(k, _)| *k);
        if self.key != Some(key) && searching_key != Some(key) {
            self.search = None;
            let outer = outer_particles(store, self.group)?;
            if outer.len() < 3 {
                let warning = TopologyWarning::InsufficientOuterParticles {
                    group: self.group,
                    count: outer.len(),
                };
                warn!(group = self.group, count = outer.len(), "too few outer particles for a boundary");
                let children = store.get_children(self.group)?.to_vec();
                if children.len() < 3 {
                    for c in children {
                        store.set_visible(c, true)?;
                    }
                }
                update.warnings.push(warning);
                self.key = Some(key);
                self.order.clear();
                self.stale = true;
            } else {
                let search = CycleSearch::new(
                    self.group,
                    &outer,
                    store.chain(self.group)?,
                    |id| is_live_particle(store, id),
                    max_expansions,
                );
                for w in search.warnings() {
                    warn!(%w, "dangling chain reference");
                }
                update.warnings.extend(search.warnings().iter().cloned());
                debug!(group = self.group, outer = outer.len(), "retracing boundary");
                self.search = Some((key, search));
            }
        }

        if let Some((search_key, search)) = self.search.as_mut()
            && search.advance(budget)
        {
            let search_key = *search_key;
            match search.result() {
                Ok(order) => {
                    self.order = order;
                    self.stale = false;
                    update.retraced = true;
                }
                Err(w) => {
                    warn!(group = self.group, "no boundary cycle, keeping the previous contour");
                    self.stale = true;
                    update.warnings.push(w);
                }
            }
            self.key = Some(search_key);
            self.search = None;
        }

        if !self.order.is_empty() {
            let points: Vec<(NodeId, Vec2)> = self
                .order
                .iter()
                .filter_map(|&p| Some((p, particle_position(store, world, p)?)))
                .collect();
            if points.len() >= 3 {
                update.polygon = Some(BlobPolygon {
                    group: self.group,
                    color,
                    points,
                    stale: self.stale || self.search.is_some(),
                });
            }
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_hierarchy;
    use crate::config::Config;
    use crate::joints::JointTopology;
    use crate::node::NodeSpec;
    use crate::physics::BodyDesc;
    use crate::spring_world::SpringWorld;
    use crate::store::ROOT;

    fn chain(edges: &[(NodeId, NodeId)]) -> Chain {
        let mut chain = Chain::default();
        for &(a, b) in edges {
            chain.link(a, b);
        }
        chain
    }

    fn search(members: &[NodeId], chain: &Chain) -> CycleSearch {
        let mut s = CycleSearch::new(0, members, chain, |_| true, DEFAULT_MAX_EXPANSIONS);
        s.advance(usize::MAX);
        s
    }

    fn assert_valid_cycle(cycle: &[NodeId], chain: &Chain) {
        assert!(cycle.len() >= 3);
        let unique: BTreeSet<_> = cycle.iter().collect();
        assert_eq!(unique.len(), cycle.len(), "repeated node in {cycle:?}");
        for i in 0..cycle.len() {
            let (a, b) = (cycle[i], cycle[(i + 1) % cycle.len()]);
            assert!(chain.contains(a, b), "{a} and {b} are not adjacent");
        }
    }

    #[test]
    fn prefers_the_longest_cycle() {
        let c = chain(&[(1, 2), (2, 3), (3, 4), (4, 1), (1, 3)]);
        let cycle = search(&[1, 2, 3, 4], &c).result().unwrap();
        assert_eq!(cycle.len(), 4);
        assert_valid_cycle(&cycle, &c);
    }

    #[test]
    fn dead_ends_are_pruned() {
        let c = chain(&[(1, 2), (2, 3), (3, 1), (3, 4), (4, 5)]);
        let s = search(&[1, 2, 3, 4, 5], &c);
        let cycle = s.result().unwrap();
        assert_eq!(cycle.len(), 3);
        assert!(!cycle.contains(&4));
        assert_valid_cycle(&cycle, &c);
    }

    #[test]
    fn non_members_are_skipped() {
        let c = chain(&[(1, 2), (2, 3), (3, 1), (2, 9), (9, 3)]);
        let cycle = search(&[1, 2, 3], &c).result().unwrap();
        assert_eq!(cycle.len(), 3);
        assert!(!cycle.contains(&9));
    }

    #[test]
    fn acyclic_chain_reports_no_cycle() {
        let c = chain(&[(1, 2), (2, 3)]);
        let s = search(&[1, 2, 3], &c);
        assert!(s.is_done());
        assert_eq!(s.result(), Err(TopologyWarning::NoCycleFound { group: 0 }));
    }

    #[test]
    fn dangling_references_are_reported_and_skipped() {
        let c = chain(&[(1, 2), (2, 3), (3, 1), (3, 99)]);
        let mut s = CycleSearch::new(7, &[1, 2, 3], &c, |id| id != 99, 1_000);
        assert_eq!(
            s.warnings(),
            &[TopologyWarning::DanglingChainReference { group: 7, from: 3, to: 99 }]
        );
        s.advance(usize::MAX);
        assert_eq!(s.result().unwrap().len(), 3);
    }

    #[test]
    fn search_resumes_across_small_budgets() {
        let edges: Vec<_> = (0..12).map(|i| (i, (i + 1) % 12)).chain([(0, 6), (3, 9)]).collect();
        let c = chain(&edges);
        let members: Vec<NodeId> = (0..12).collect();
        let whole = search(&members, &c).result().unwrap();

        let mut stepped = CycleSearch::new(0, &members, &c, |_| true, DEFAULT_MAX_EXPANSIONS);
        let mut calls = 0;
        while !stepped.advance(3) {
            calls += 1;
        }
        assert!(calls > 1);
        assert_eq!(stepped.result().unwrap(), whole);
        assert_eq!(whole.len(), 12);
    }

    #[test]
    fn capped_search_keeps_its_best_cycle() {
        let edges: Vec<_> = (0..8).map(|i| (i, (i + 1) % 8)).chain([(0, 4), (2, 6)]).collect();
        let c = chain(&edges);
        let members: Vec<NodeId> = (0..8).collect();
        let mut s = CycleSearch::new(0, &members, &c, |_| true, 5);
        assert!(s.advance(usize::MAX));
        assert_eq!(s.expansions(), 5);
    }

    fn allocated_scene(counts: Vec<usize>) -> (EntityStore, SpringWorld) {
        let cfg = Config {
            entity_counts: counts,
            ..Config::default()
        };
        let mut store = EntityStore::new();
        let mut world = SpringWorld::default();
        build_hierarchy(&mut store, &mut world, &cfg).unwrap();
        world.step(1.0 / 60.0);
        for (p, _) in store.pending_bodies() {
            store.mark_body_ready(p).unwrap();
        }
        let mut topo = JointTopology::default();
        let report = topo.process(&mut store, &mut world);
        assert!(report.errors.is_empty());
        (store, world)
    }

    #[test]
    fn traced_boundaries_are_valid_cycles_of_outer_particles() {
        let (store, _) = allocated_scene(vec![3, 4, 5]);
        for group in store.groups_pre_order() {
            let cycle = trace_boundary(&store, group).unwrap();
            let chain = store.chain(group).unwrap();
            assert_valid_cycle(&cycle, chain);
            let depth = store.node(group).unwrap().depth();
            for p in &cycle {
                let particle = store.node(*p).unwrap().as_particle().unwrap();
                assert!(particle.is_outer_at(depth));
                assert!(store.is_ancestor(group, *p));
            }
        }
    }

    #[test]
    fn leaf_ring_boundary_covers_every_particle() {
        let (store, _) = allocated_scene(vec![2, 6]);
        let group = store.get_children(ROOT).unwrap()[0];
        let cycle = trace_boundary(&store, group).unwrap();
        assert_eq!(cycle.len(), 6);
    }

    #[test]
    fn blob_retraces_only_when_its_key_changes() {
        let (mut store, world) = allocated_scene(vec![2, 5]);
        let group = store.get_children(ROOT).unwrap()[0];
        store.set_visible(group, true).unwrap();
        let mut blob = Blob::new(group);

        let first = blob.update(&mut store, &world, usize::MAX, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert!(first.retraced);
        let polygon = first.polygon.unwrap();
        assert_eq!(polygon.points.len(), 5);
        assert!(!polygon.stale);

        let second = blob.update(&mut store, &world, usize::MAX, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert!(!second.retraced);
        assert!(second.polygon.is_some());

        store.bump_outer_revision(group).unwrap();
        let third = blob.update(&mut store, &world, usize::MAX, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert!(third.retraced);
    }

    #[test]
    fn losing_outer_particles_drops_the_polygon() {
        let (mut store, world) = allocated_scene(vec![2, 3]);
        let group = store.get_children(ROOT).unwrap()[0];
        let depth = store.node(group).unwrap().depth();
        let mut blob = Blob::new(group);
        let first = blob.update(&mut store, &world, usize::MAX, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert_eq!(first.polygon.unwrap().points.len(), 3);

        let p = store.get_children(group).unwrap()[0];
        store.set_outer(p, depth, false).unwrap();
        store.bump_outer_revision(group).unwrap();
        let second = blob.update(&mut store, &world, usize::MAX, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert!(second.polygon.is_none());
        assert!(blob.order().is_empty());
        assert!(matches!(
            second.warnings.as_slice(),
            [TopologyWarning::InsufficientOuterParticles { count: 2, .. }]
        ));
    }

    #[test]
    fn blob_spreads_a_trace_over_several_ticks() {
        let (mut store, world) = allocated_scene(vec![2, 8]);
        let group = store.get_children(ROOT).unwrap()[0];
        let mut blob = Blob::new(group);

        let first = blob.update(&mut store, &world, 2, DEFAULT_MAX_EXPANSIONS).unwrap();
        assert!(!first.retraced);
        assert!(first.polygon.is_none());
        assert!(blob.is_searching());

        let mut ticks = 1;
        while blob.is_searching() {
            blob.update(&mut store, &world, 2, DEFAULT_MAX_EXPANSIONS).unwrap();
            ticks += 1;
        }
        assert!(ticks > 2);
        assert_eq!(blob.order().len(), 8);
    }

    #[test]
    fn two_children_with_too_few_outer_particles_show_their_children() {
        let mut store = EntityStore::new();
        let mut world = SpringWorld::default();
        let group = store.add_node(ROOT, NodeSpec::group(2.0)).unwrap();
        let mut kids = Vec::new();
        for x in [-1.0, 1.0] {
            let body = world.spawn_body(BodyDesc {
                position: Vec2::new(x, 0.0),
                radius: 1.0,
                restitution: 0.0,
            });
            kids.push(store.add_node(group, NodeSpec::particle(1.0).with_body(body)).unwrap());
        }
        world.step(0.01);
        for &k in &kids {
            store.mark_body_ready(k).unwrap();
        }
        let mut topo = JointTopology::default();
        topo.allocate_group(&mut store, &mut world, group).unwrap();

        assert!(matches!(
            trace_boundary(&store, group),
            Err(TraceError::Topology(TopologyWarning::InsufficientOuterParticles { count: 2, .. }))
        ));

        let mut blob = Blob::new(group);
        let update = blob.update(&mut store, &world, 100, 1_000).unwrap();
        assert_eq!(
            update.warnings,
            vec![TopologyWarning::InsufficientOuterParticles { group, count: 2 }]
        );
        assert!(update.polygon.is_none());
        for k in kids {
            assert!(store.is_visible(k).unwrap());
        }
    }
}
