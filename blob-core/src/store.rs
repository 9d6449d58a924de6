//! Arena of nodes addressed by [`NodeId`].
//!
//! The [`EntityStore`] owns the canonical tree: parent/child links, per-node
//! cached handles, the chain adjacency of every group and secondary indexes
//! keyed by node properties. Every other component reads and writes through
//! it; nothing outside this module holds a mutable node reference.

use crate::error::{StoreError, StoreResult};
use crate::node::{BodyRef, Chain, KindSpec, Node, NodeKind, NodePatch, NodeSpec};
use crate::types::{BodyHandle, JointId, NodeId, PropValue};
use glam::{Vec2, Vec3};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Property key under which every node's depth is indexed.
pub const DEPTH_KEY: &str = "depth";

/// Id of the root node of every store.
pub const ROOT: NodeId = 0;

type Index = BTreeMap<PropValue, BTreeSet<NodeId>>;

#[derive(Debug)]
struct CachedParticles {
    signature: u64,
    ids: Arc<[NodeId]>,
}

/// Outcome of [`EntityStore::delete_node`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Removed {
    /// Every node removed, the deleted subtree first (pre-order), then any
    /// groups pruned because they were left without children.
    pub nodes: Vec<NodeId>,
    /// Joints that touched a removed particle. Their chain entries and
    /// joint-id records are already gone; the caller owns the constraints.
    pub joints: Vec<JointId>,
}

#[derive(Debug)]
pub struct EntityStore {
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
    indexes: BTreeMap<String, Index>,
    particle_cache: HashMap<NodeId, CachedParticles>,
    signature_builds: u64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    /// Creates a store holding only the root group.
    pub fn new() -> Self {
        let root = Node {
            id: ROOT,
            kind: KindSpec::Group { radius: 0.0 }.into_kind(Vec3::ONE),
            parent: None,
            children: Vec::new(),
            depth: 0,
            joint_ids: BTreeSet::new(),
            relations: Vec::new(),
            props: BTreeMap::new(),
            membership_signature: None,
        };

        let mut store = Self {
            nodes: BTreeMap::new(),
            next_id: ROOT + 1,
            indexes: BTreeMap::new(),
            particle_cache: HashMap::new(),
            signature_builds: 0,
        };
        store.indexes.insert(DEPTH_KEY.to_owned(), Index::new());
        store.nodes.insert(ROOT, root);
        store.index_node(ROOT);
        store
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_node(&self, id: NodeId) -> StoreResult<&Node> {
        self.nodes.get(&id).ok_or(StoreError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> StoreResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(StoreError::UnknownNode(id))
    }

    pub fn get_children(&self, id: NodeId) -> StoreResult<&[NodeId]> {
        Ok(self.get_node(id)?.children())
    }

    /// Number of times a membership signature was computed from scratch.
    pub fn signature_builds(&self) -> u64 {
        self.signature_builds
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Inserts a node under `parent` and returns its id.
    ///
    /// ### Errors
    /// - [`StoreError::UnknownParent`] if `parent` does not exist.
    /// - [`StoreError::NotAGroup`] if `parent` is a particle.
    /// - [`StoreError::DuplicateId`] if `spec.id` is already taken.
    pub fn add_node(&mut self, parent: NodeId, spec: NodeSpec) -> StoreResult<NodeId> {
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(StoreError::UnknownParent(parent))?;
        if !parent_node.is_group() {
            return Err(StoreError::NotAGroup(parent));
        }
        let depth = parent_node.depth + 1;

        let id = match spec.id {
            Some(id) if self.nodes.contains_key(&id) => return Err(StoreError::DuplicateId(id)),
            Some(id) => id,
            None => self.next_id,
        };
        self.next_id = self.next_id.max(id + 1);

        let node = Node {
            id,
            kind: spec.kind.into_kind(spec.color),
            parent: Some(parent),
            children: Vec::new(),
            depth,
            joint_ids: BTreeSet::new(),
            relations: Vec::new(),
            props: spec.props,
            membership_signature: None,
        };
        self.nodes.insert(id, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        self.index_node(id);
        self.invalidate_from(parent);
        Ok(id)
    }

    /// Merges `patch` into node `id`.
    ///
    /// Every check runs before anything is written, so a failed update
    /// leaves the node untouched. Indexed properties move between index
    /// buckets in the same call. The reserved `depth` key is ignored.
    ///
    /// Only childless, jointless nodes change kind. A particle never becomes
    /// a group and a particle with a body keeps its kind.
    pub fn update_node(&mut self, id: NodeId, patch: NodePatch) -> StoreResult<()> {
        let node = self.get_node(id)?;
        if let Some(kind) = &patch.kind {
            if id == ROOT {
                return Err(StoreError::RootImmutable);
            }
            if !node.children.is_empty() {
                return Err(StoreError::KindChangeWithChildren(id));
            }
            if !node.joint_ids.is_empty() {
                return Err(StoreError::KindChangeWithJoints(id));
            }
            if let NodeKind::Particle(p) = &node.kind {
                if matches!(kind, KindSpec::Group { .. }) {
                    return Err(StoreError::ParticleToGroup(id));
                }
                if p.body != BodyRef::Unassigned {
                    return Err(StoreError::KindChangeWithBody(id));
                }
            }
        }

        for (key, value) in &patch.props {
            if key == DEPTH_KEY {
                continue;
            }
            let old = self.get_node(id)?.props.get(key).cloned();
            if let Some(index) = self.indexes.get_mut(key) {
                if let Some(old) = &old {
                    index_remove(index, old, id);
                }
                if let Some(new) = value {
                    index.entry(new.clone()).or_default().insert(id);
                }
            }
            let node = self.node_mut(id)?;
            match value {
                Some(v) => {
                    node.props.insert(key.clone(), v.clone());
                }
                None => {
                    node.props.remove(key);
                }
            }
        }

        let node = self.node_mut(id)?;
        if let Some(kind) = patch.kind {
            let color = match &node.kind {
                NodeKind::Particle(p) => p.visual.color(),
                NodeKind::Group(g) => g.visual.color(),
            };
            node.kind = kind.into_kind(color);
        }
        if let Some(color) = patch.color {
            match &mut node.kind {
                NodeKind::Particle(p) => p.visual.set_color(color),
                NodeKind::Group(g) => g.visual.set_color(color),
            }
        }
        if let Some(radius) = patch.radius {
            match &mut node.kind {
                NodeKind::Particle(p) => p.radius = radius,
                NodeKind::Group(g) => g.radius = radius,
            }
        }

        if patch.kind.is_some() {
            let parent = node.parent;
            self.particle_cache.remove(&id);
            if let Some(parent) = parent {
                self.invalidate_from(parent);
            }
        }
        Ok(())
    }

    /// Reparents `id` under `new_parent` and recomputes depth for the whole
    /// moved subtree.
    ///
    /// Joints touching the moved subtree no longer belong to any ring and
    /// are detached from the store; their ids are returned so the caller can
    /// remove the constraints. Outer flags of moved particles are cleared.
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId) -> StoreResult<Vec<JointId>> {
        if id == ROOT {
            return Err(StoreError::RootImmutable);
        }
        let old_parent = self.get_node(id)?.parent.ok_or(StoreError::RootImmutable)?;
        let target = self
            .nodes
            .get(&new_parent)
            .ok_or(StoreError::UnknownParent(new_parent))?;
        if !target.is_group() {
            return Err(StoreError::NotAGroup(new_parent));
        }
        if new_parent == id || self.is_ancestor(id, new_parent) {
            return Err(StoreError::WouldCreateCycle {
                node: id,
                parent: new_parent,
            });
        }
        if old_parent == new_parent {
            return Ok(Vec::new());
        }

        let subtree = self.subtree(id)?;
        let detached = self.detach_joints_of(&subtree);

        if let Some(p) = self.nodes.get_mut(&old_parent) {
            p.children.retain(|&c| c != id);
        }
        if let Some(p) = self.nodes.get_mut(&new_parent) {
            p.children.push(id);
        }
        self.node_mut(id)?.parent = Some(new_parent);

        // Pre-order guarantees a parent's depth is fixed before its children.
        for &n in &subtree {
            let parent = self.get_node(n)?.parent.ok_or(StoreError::RootImmutable)?;
            let depth = self.get_node(parent)?.depth + 1;
            self.unindex_node(n);
            let node = self.node_mut(n)?;
            node.depth = depth;
            if let Some(p) = node.as_particle_mut() {
                p.outer.clear();
            }
            self.index_node(n);
        }

        self.invalidate_from(old_parent);
        self.invalidate_from(new_parent);
        self.prune_empty(old_parent);
        Ok(detached)
    }

    /// Removes `id` and its whole subtree.
    ///
    /// Index entries, cached particle lists, relations pointing into the
    /// subtree and joint records of surviving partners are cleaned up. A
    /// parent group left without children is removed as well.
    pub fn delete_node(&mut self, id: NodeId) -> StoreResult<Removed> {
        if id == ROOT {
            return Err(StoreError::RootImmutable);
        }
        let parent = self.get_node(id)?.parent.ok_or(StoreError::RootImmutable)?;
        let subtree = self.subtree(id)?;
        let joints = self.detach_joints_of(&subtree);

        for &n in &subtree {
            self.forget_node(n);
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|&c| c != id);
        }
        self.invalidate_from(parent);

        let mut nodes = subtree;
        nodes.extend(self.prune_empty(parent));

        let gone: BTreeSet<NodeId> = nodes.iter().copied().collect();
        for node in self.nodes.values_mut() {
            node.relations.retain(|r| !gone.contains(r));
        }

        Ok(Removed { nodes, joints })
    }

    /// Copies the subtree rooted at `id` under `new_parent` with fresh ids.
    ///
    /// Copies carry kind, radius, colour and properties. Physical state does
    /// not carry over: particles start without a body, and no joints, chain
    /// entries, outer flags or relations are copied.
    pub fn copy_subtree(&mut self, id: NodeId, new_parent: NodeId) -> StoreResult<NodeId> {
        if id == ROOT {
            return Err(StoreError::RootImmutable);
        }
        let target = self
            .nodes
            .get(&new_parent)
            .ok_or(StoreError::UnknownParent(new_parent))?;
        if !target.is_group() {
            return Err(StoreError::NotAGroup(new_parent));
        }

        let mut snapshot = Vec::new();
        for n in self.subtree(id)? {
            let node = self.get_node(n)?;
            let (kind, color) = match &node.kind {
                NodeKind::Particle(p) => (
                    KindSpec::Particle {
                        radius: p.radius,
                        body: None,
                    },
                    p.visual.color(),
                ),
                NodeKind::Group(g) => (KindSpec::Group { radius: g.radius }, g.visual.color()),
            };
            let spec = NodeSpec {
                id: None,
                kind,
                color,
                props: node.props.clone(),
            };
            snapshot.push((n, node.parent, spec));
        }

        let mut mapping: HashMap<NodeId, NodeId> = HashMap::new();
        for (old, old_parent, spec) in snapshot {
            let parent = if old == id {
                new_parent
            } else {
                old_parent
                    .and_then(|p| mapping.get(&p).copied())
                    .ok_or(StoreError::UnknownParent(old))?
            };
            let new = self.add_node(parent, spec)?;
            mapping.insert(old, new);
        }
        mapping.get(&id).copied().ok_or(StoreError::UnknownNode(id))
    }

    /// Removes groups left without children, walking upward from `start`.
    fn prune_empty(&mut self, start: NodeId) -> Vec<NodeId> {
        let mut pruned = Vec::new();
        let mut current = start;
        while current != ROOT {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            if !node.is_group() || !node.children.is_empty() {
                break;
            }
            let Some(parent) = node.parent else {
                break;
            };
            self.forget_node(current);
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|&c| c != current);
            }
            self.invalidate_from(parent);
            pruned.push(current);
            current = parent;
        }
        pruned
    }

    fn forget_node(&mut self, id: NodeId) {
        self.unindex_node(id);
        self.particle_cache.remove(&id);
        self.nodes.remove(&id);
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Ids of the subtree rooted at `id`, in pre-order.
    pub fn subtree(&self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        self.get_node(id)?;
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.get_node(n)?;
            out.push(n);
            stack.extend(node.children.iter().rev());
        }
        Ok(out)
    }

    /// All nodes in pre-order, starting at the root.
    pub fn flatten(&self) -> Vec<&Node> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.traverse_dfs(|n| out.push(n));
        out
    }

    /// Calls `f` for every node in pre-order.
    pub fn traverse_dfs<'a>(&'a self, mut f: impl FnMut(&'a Node)) {
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            f(node);
            stack.extend(node.children.iter().rev());
        }
    }

    /// Ids of every group in pre-order.
    pub fn groups_pre_order(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.traverse_dfs(|n| {
            if n.is_group() {
                out.push(n.id);
            }
        });
        out
    }

    /// Descendant particle ids of `id` in pre-order, computed without the cache.
    pub fn collect_particle_ids(&self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        let mut out = Vec::new();
        for n in self.subtree(id)? {
            if self.get_node(n)?.is_particle() {
                out.push(n);
            }
        }
        Ok(out)
    }

    /// Descendant particle ids of `id` in pre-order.
    ///
    /// The list is cached per group under its membership signature and is
    /// only rebuilt after a structural change invalidated that signature.
    /// Repeated calls without mutation return the same shared list. For a
    /// particle the list holds just the particle itself.
    pub fn get_all_particle_ids(&mut self, id: NodeId) -> StoreResult<Arc<[NodeId]>> {
        let node = self.get_node(id)?;
        if node.is_particle() {
            return Ok(Arc::from(vec![id]));
        }
        if let Some(sig) = node.membership_signature
            && let Some(cached) = self.particle_cache.get(&id)
            && cached.signature == sig
        {
            return Ok(Arc::clone(&cached.ids));
        }

        let ids = self.collect_particle_ids(id)?;
        let signature = signature_of(&ids);
        self.signature_builds += 1;
        self.node_mut(id)?.membership_signature = Some(signature);

        if let Some(cached) = self.particle_cache.get(&id)
            && cached.signature == signature
        {
            return Ok(Arc::clone(&cached.ids));
        }
        let ids: Arc<[NodeId]> = Arc::from(ids);
        self.particle_cache.insert(
            id,
            CachedParticles {
                signature,
                ids: Arc::clone(&ids),
            },
        );
        Ok(ids)
    }

    /// Membership signature of `id`, computing it if it was invalidated.
    pub fn membership_signature(&mut self, id: NodeId) -> StoreResult<u64> {
        if self.get_node(id)?.is_particle() {
            return Ok(signature_of(&[id]));
        }
        self.get_all_particle_ids(id)?;
        self.get_node(id)?
            .membership_signature
            .ok_or(StoreError::UnknownNode(id))
    }

    fn invalidate_from(&mut self, start: NodeId) {
        let mut current = Some(start);
        while let Some(id) = current {
            let Some(node) = self.nodes.get_mut(&id) else {
                break;
            };
            node.membership_signature = None;
            current = node.parent;
        }
    }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut current = self.get_node(id)?.parent;
        while let Some(p) = current {
            out.push(p);
            current = self.get_node(p)?.parent;
        }
        Ok(out)
    }

    /// `true` if `ancestor` lies strictly above `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes.get(&p).and_then(|n| n.parent);
        }
        false
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Starts indexing property `key` for every current and future node.
    pub fn create_index(&mut self, key: &str) {
        if self.indexes.contains_key(key) {
            return;
        }
        let mut index = Index::new();
        for (&id, node) in &self.nodes {
            if let Some(v) = node.props.get(key) {
                index.entry(v.clone()).or_default().insert(id);
            }
        }
        self.indexes.insert(key.to_owned(), index);
    }

    /// Ids whose property `key` equals `value`, in ascending order.
    pub fn find_by(&self, key: &str, value: &PropValue) -> StoreResult<Vec<NodeId>> {
        let index = self
            .indexes
            .get(key)
            .ok_or_else(|| StoreError::UnknownIndex(key.to_owned()))?;
        Ok(index
            .get(value)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    pub fn nodes_at_depth(&self, depth: u32) -> Vec<NodeId> {
        self.find_by(DEPTH_KEY, &PropValue::Int(i64::from(depth)))
            .unwrap_or_default()
    }

    fn index_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for (key, index) in self.indexes.iter_mut() {
            let value = if key == DEPTH_KEY {
                Some(PropValue::Int(i64::from(node.depth)))
            } else {
                node.props.get(key).cloned()
            };
            if let Some(v) = value {
                index.entry(v).or_default().insert(id);
            }
        }
    }

    fn unindex_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for (key, index) in self.indexes.iter_mut() {
            let value = if key == DEPTH_KEY {
                Some(PropValue::Int(i64::from(node.depth)))
            } else {
                node.props.get(key).cloned()
            };
            if let Some(v) = value {
                index_remove(index, &v, id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Joints and chains
    // ------------------------------------------------------------------

    /// Chain adjacency recorded for `group`'s subtree.
    pub fn chain(&self, group: NodeId) -> StoreResult<&Chain> {
        self.get_node(group)?
            .as_group()
            .map(|g| &g.chain)
            .ok_or(StoreError::NotAGroup(group))
    }

    /// Records the edge `a`-`b` in the chain of `group` and of every
    /// ancestor of `group`.
    pub fn link_chain(&mut self, group: NodeId, a: NodeId, b: NodeId) -> StoreResult<()> {
        self.require_particle(a)?;
        self.require_particle(b)?;
        if !self.get_node(group)?.is_group() {
            return Err(StoreError::NotAGroup(group));
        }
        let mut scopes = vec![group];
        scopes.extend(self.ancestors(group)?);
        for g in scopes {
            if let Some(grp) = self.node_mut(g)?.as_group_mut() {
                grp.chain.link(a, b);
            }
        }
        Ok(())
    }

    /// Removes the edge `a`-`b` from every chain that may hold it.
    pub fn unlink_chain(&mut self, a: NodeId, b: NodeId) {
        for g in self.chain_scopes(&[a, b]) {
            if let Some(grp) = self.nodes.get_mut(&g).and_then(|n| n.as_group_mut()) {
                grp.chain.unlink(a, b);
            }
        }
    }

    fn chain_scopes(&self, endpoints: &[NodeId]) -> BTreeSet<NodeId> {
        endpoints
            .iter()
            .flat_map(|&e| self.ancestors(e).unwrap_or_default())
            .collect()
    }

    pub fn attach_joint(&mut self, id: NodeId, joint: JointId) -> StoreResult<()> {
        self.require_particle(id)?;
        self.node_mut(id)?.joint_ids.insert(joint);
        Ok(())
    }

    pub fn detach_joint(&mut self, id: NodeId, joint: JointId) -> StoreResult<bool> {
        Ok(self.node_mut(id)?.joint_ids.remove(&joint))
    }

    /// Detaches every joint with an endpoint in `nodes`: joint ids on both
    /// endpoints and the chain edges in every scope.
    fn detach_joints_of(&mut self, nodes: &[NodeId]) -> Vec<JointId> {
        let joints: BTreeSet<JointId> = nodes
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .flat_map(|n| n.joint_ids.iter().copied())
            .collect();
        for &j in &joints {
            self.unlink_chain(j.a, j.b);
            for end in [j.a, j.b] {
                if let Some(n) = self.nodes.get_mut(&end) {
                    n.joint_ids.remove(&j);
                }
            }
        }
        // Forget any remaining edge of the removed particles.
        let scopes = self.chain_scopes(nodes);
        for g in scopes {
            if let Some(grp) = self.nodes.get_mut(&g).and_then(|n| n.as_group_mut()) {
                for &n in nodes {
                    grp.chain.forget(n);
                }
            }
        }
        joints.into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Particles
    // ------------------------------------------------------------------

    fn require_particle(&self, id: NodeId) -> StoreResult<()> {
        if self.get_node(id)?.is_particle() {
            Ok(())
        } else {
            Err(StoreError::NotAParticle(id))
        }
    }

    fn particle_mut(&mut self, id: NodeId) -> StoreResult<&mut crate::node::Particle> {
        self.node_mut(id)?
            .as_particle_mut()
            .ok_or(StoreError::NotAParticle(id))
    }

    fn group_mut(&mut self, id: NodeId) -> StoreResult<&mut crate::node::Group> {
        self.node_mut(id)?
            .as_group_mut()
            .ok_or(StoreError::NotAGroup(id))
    }

    pub fn body_of(&self, id: NodeId) -> StoreResult<BodyRef> {
        self.get_node(id)?
            .as_particle()
            .map(|p| p.body)
            .ok_or(StoreError::NotAParticle(id))
    }

    /// Records that a body was requested for particle `id`.
    pub fn register_body(&mut self, id: NodeId, body: BodyHandle) -> StoreResult<()> {
        self.particle_mut(id)?.body = BodyRef::Pending(body);
        Ok(())
    }

    /// Promotes a pending body to ready. Returns `false` if it was not pending.
    pub fn mark_body_ready(&mut self, id: NodeId) -> StoreResult<bool> {
        let particle = self.particle_mut(id)?;
        match particle.body {
            BodyRef::Pending(h) => {
                particle.body = BodyRef::Ready(h);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Particles whose body is still pending, in id order.
    pub fn pending_bodies(&self) -> Vec<(NodeId, BodyHandle)> {
        self.nodes
            .values()
            .filter_map(|n| match n.as_particle()?.body {
                BodyRef::Pending(h) => Some((n.id, h)),
                _ => None,
            })
            .collect()
    }

    pub fn set_outer(&mut self, id: NodeId, depth: u32, outer: bool) -> StoreResult<()> {
        self.particle_mut(id)?.outer.insert(depth, outer);
        Ok(())
    }

    /// Bumps the outer-flag revision of `group` after its flags were reassigned.
    pub fn bump_outer_revision(&mut self, group: NodeId) -> StoreResult<u64> {
        let g = self.group_mut(group)?;
        g.outer_revision += 1;
        Ok(g.outer_revision)
    }

    /// Sets the visual scale of a particle. Returns `false` for rejected values.
    pub fn set_particle_scale(&mut self, id: NodeId, scale: f32) -> StoreResult<bool> {
        Ok(self.particle_mut(id)?.visual.set_scale(scale))
    }

    /// Marks the current visual scale as the one joint anchors are laid out for.
    pub fn settle_rigid_scale(&mut self, id: NodeId) -> StoreResult<()> {
        self.particle_mut(id)?.visual.settle_rigid_scale();
        Ok(())
    }

    pub fn set_group_center(&mut self, id: NodeId, center: Vec2) -> StoreResult<()> {
        self.group_mut(id)?.center = center;
        Ok(())
    }

    pub fn set_visible(&mut self, id: NodeId, visible: bool) -> StoreResult<()> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Particle(p) => p.visual.set_visible(visible),
            NodeKind::Group(g) => g.visual.set_visible(visible),
        }
        Ok(())
    }

    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) -> StoreResult<()> {
        self.group_mut(id)?.visual.set_expanded(expanded);
        Ok(())
    }

    pub fn is_visible(&self, id: NodeId) -> StoreResult<bool> {
        Ok(match &self.get_node(id)?.kind {
            NodeKind::Particle(p) => p.visual.visible(),
            NodeKind::Group(g) => g.visual.visible(),
        })
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Adds a cosmetic relation `from → to`. Returns `false` if it existed.
    pub fn add_relation(&mut self, from: NodeId, to: NodeId) -> StoreResult<bool> {
        self.get_node(to)?;
        let node = self.node_mut(from)?;
        if node.relations.contains(&to) {
            return Ok(false);
        }
        node.relations.push(to);
        Ok(true)
    }

    pub fn remove_relation(&mut self, from: NodeId, to: NodeId) -> StoreResult<bool> {
        let node = self.node_mut(from)?;
        let before = node.relations.len();
        node.relations.retain(|&r| r != to);
        Ok(node.relations.len() != before)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for node in self.nodes.values() {
            match node.parent {
                None => {
                    assert_eq!(node.id, ROOT, "only the root may lack a parent");
                    assert_eq!(node.depth, 0);
                }
                Some(p) => {
                    let parent = self.get_node(p).expect("parent exists");
                    assert_eq!(node.depth, parent.depth + 1, "depth of {}", node.id);
                    assert!(parent.children.contains(&node.id));
                }
            }
            for &c in &node.children {
                assert_eq!(self.get_node(c).expect("child exists").parent, Some(node.id));
            }
            match &node.kind {
                NodeKind::Particle(_) => assert!(node.children.is_empty()),
                NodeKind::Group(g) => {
                    if node.id != ROOT {
                        assert!(!node.children.is_empty(), "empty group {}", node.id);
                    }
                    assert!(g.chain.is_symmetric(), "asymmetric chain in {}", node.id);
                }
            }
            let depth_bucket = self.nodes_at_depth(node.depth);
            assert!(depth_bucket.contains(&node.id));
        }
        assert_eq!(self.flatten().len(), self.nodes.len(), "unreachable nodes");
    }
}

fn index_remove(index: &mut Index, value: &PropValue, id: NodeId) {
    if let Some(bucket) = index.get_mut(value) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(value);
        }
    }
}

/// Hash of the ordered concatenation of particle ids.
pub fn signature_of(ids: &[NodeId]) -> u64 {
    let mut hasher = DefaultHasher::new();
    ids.len().hash(&mut hasher);
    for id in ids {
        id.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root ── g1 ── p2, p3
    ///      └─ g4 ── p5, g6 ── p7, p8
    fn sample() -> EntityStore {
        let mut s = EntityStore::new();
        let g1 = s.add_node(ROOT, NodeSpec::group(4.0)).unwrap();
        s.add_node(g1, NodeSpec::particle(1.0)).unwrap();
        s.add_node(g1, NodeSpec::particle(1.0)).unwrap();
        let g4 = s.add_node(ROOT, NodeSpec::group(4.0)).unwrap();
        s.add_node(g4, NodeSpec::particle(1.0)).unwrap();
        let g6 = s.add_node(g4, NodeSpec::group(2.0)).unwrap();
        s.add_node(g6, NodeSpec::particle(1.0)).unwrap();
        s.add_node(g6, NodeSpec::particle(1.0)).unwrap();
        s
    }

    #[test]
    fn add_node_computes_depth_and_links_parent() {
        let s = sample();
        s.assert_invariants();
        assert_eq!(s.get_node(7).unwrap().depth(), 3);
        assert_eq!(s.get_node(7).unwrap().parent(), Some(6));
        assert_eq!(s.get_children(4).unwrap(), &[5, 6]);
        assert_eq!(s.nodes_at_depth(1), vec![1, 4]);
    }

    #[test]
    fn add_node_rejects_unknown_parent_duplicate_and_particle_parent() {
        let mut s = sample();
        assert_eq!(
            s.add_node(99, NodeSpec::particle(1.0)),
            Err(StoreError::UnknownParent(99))
        );
        assert_eq!(
            s.add_node(1, NodeSpec::particle(1.0).with_id(2)),
            Err(StoreError::DuplicateId(2))
        );
        assert_eq!(
            s.add_node(2, NodeSpec::particle(1.0)),
            Err(StoreError::NotAGroup(2))
        );
    }

    #[test]
    fn explicit_ids_advance_the_counter() {
        let mut s = sample();
        let explicit = s.add_node(1, NodeSpec::particle(1.0).with_id(50)).unwrap();
        assert_eq!(explicit, 50);
        let next = s.add_node(1, NodeSpec::particle(1.0)).unwrap();
        assert_eq!(next, 51);
    }

    #[test]
    fn flatten_is_pre_order() {
        let s = sample();
        let ids: Vec<NodeId> = s.flatten().iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn update_node_moves_indexed_properties_between_buckets() {
        let mut s = sample();
        s.create_index("role");
        s.update_node(2, NodePatch::default().set_prop("role", "scout"))
            .unwrap();
        assert_eq!(s.find_by("role", &"scout".into()).unwrap(), vec![2]);

        s.update_node(2, NodePatch::default().set_prop("role", "guard"))
            .unwrap();
        assert!(s.find_by("role", &"scout".into()).unwrap().is_empty());
        assert_eq!(s.find_by("role", &"guard".into()).unwrap(), vec![2]);

        s.update_node(2, NodePatch::default().remove_prop("role"))
            .unwrap();
        assert!(s.find_by("role", &"guard".into()).unwrap().is_empty());
        assert!(s.get_node(2).unwrap().prop("role").is_none());
    }

    #[test]
    fn create_index_picks_up_existing_properties() {
        let mut s = EntityStore::new();
        s.add_node(ROOT, NodeSpec::particle(1.0).with_prop("tag", 3i64))
            .unwrap();
        assert_eq!(
            s.find_by("tag", &PropValue::Int(3)),
            Err(StoreError::UnknownIndex("tag".into()))
        );
        s.create_index("tag");
        assert_eq!(s.find_by("tag", &PropValue::Int(3)).unwrap(), vec![1]);
    }

    #[test]
    fn update_node_rejects_unknown_node_and_kind_change_with_children() {
        let mut s = sample();
        assert_eq!(
            s.update_node(42, NodePatch::default()),
            Err(StoreError::UnknownNode(42))
        );
        let patch = NodePatch::default().with_kind(KindSpec::Particle {
            radius: 1.0,
            body: None,
        });
        assert_eq!(
            s.update_node(1, patch),
            Err(StoreError::KindChangeWithChildren(1))
        );
    }

    #[test]
    fn kind_change_invalidates_ancestor_signatures() {
        let mut s = sample();
        let before = s.get_all_particle_ids(ROOT).unwrap();
        s.get_all_particle_ids(4).unwrap();
        assert!(s.get_node(4).unwrap().membership_signature().is_some());

        // A group added without children may still turn into a particle.
        let g = s.add_node(4, NodeSpec::group(1.0)).unwrap();
        s.get_all_particle_ids(4).unwrap();
        let patch = NodePatch::default().with_kind(KindSpec::Particle {
            radius: 1.0,
            body: None,
        });
        s.update_node(g, patch).unwrap();
        s.assert_invariants();
        assert!(s.get_node(4).unwrap().membership_signature().is_none());
        assert!(s.get_node(ROOT).unwrap().membership_signature().is_none());

        let after = s.get_all_particle_ids(ROOT).unwrap();
        assert_ne!(before, after);
        assert!(after.contains(&g));
        assert!(s.get_node(g).unwrap().is_particle());
    }

    #[test]
    fn particles_cannot_become_groups_or_drop_their_body() {
        let mut s = sample();
        let to_group = NodePatch::default().with_kind(KindSpec::Group { radius: 1.0 });
        assert_eq!(
            s.update_node(5, to_group),
            Err(StoreError::ParticleToGroup(5))
        );
        assert!(s.get_node(5).unwrap().is_particle());

        let body = s
            .add_node(4, NodeSpec::particle(1.0).with_body(BodyHandle(3)))
            .unwrap();
        let respec = NodePatch::default().with_kind(KindSpec::Particle {
            radius: 2.0,
            body: None,
        });
        assert_eq!(
            s.update_node(body, respec),
            Err(StoreError::KindChangeWithBody(body))
        );
        assert_eq!(s.body_of(body).unwrap(), BodyRef::Pending(BodyHandle(3)));
        s.assert_invariants();
    }

    #[test]
    fn particle_ids_are_cached_until_membership_changes() {
        let mut s = sample();
        let first = s.get_all_particle_ids(4).unwrap();
        let builds = s.signature_builds();
        let second = s.get_all_particle_ids(4).unwrap();
        assert_eq!(&*first, &[5, 7, 8]);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(s.signature_builds(), builds);

        let sig = s.membership_signature(4).unwrap();
        s.add_node(6, NodeSpec::particle(1.0)).unwrap();
        let third = s.get_all_particle_ids(4).unwrap();
        assert_eq!(&*third, &[5, 7, 8, 9]);
        assert_ne!(s.membership_signature(4).unwrap(), sig);
    }

    #[test]
    fn unrelated_mutation_keeps_cached_identity() {
        let mut s = sample();
        let first = s.get_all_particle_ids(4).unwrap();
        s.add_node(1, NodeSpec::particle(1.0)).unwrap();
        let second = s.get_all_particle_ids(4).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn move_node_recomputes_depth_of_the_subtree() {
        let mut s = sample();
        s.move_node(6, 1).unwrap();
        s.assert_invariants();
        assert_eq!(s.get_node(6).unwrap().depth(), 2);
        assert_eq!(s.get_node(7).unwrap().depth(), 3);

        s.move_node(6, ROOT).unwrap();
        s.assert_invariants();
        assert_eq!(s.get_node(6).unwrap().depth(), 1);
        assert_eq!(s.get_node(8).unwrap().depth(), 2);
        assert!(s.nodes_at_depth(1).contains(&6));
        assert!(!s.nodes_at_depth(3).contains(&8));
    }

    #[test]
    fn move_node_rejects_cycles_and_root() {
        let mut s = sample();
        assert_eq!(
            s.move_node(4, 6),
            Err(StoreError::WouldCreateCycle { node: 4, parent: 6 })
        );
        assert_eq!(s.move_node(ROOT, 1), Err(StoreError::RootImmutable));
        assert_eq!(s.move_node(6, 7), Err(StoreError::NotAGroup(7)));
    }

    #[test]
    fn move_node_prunes_the_emptied_group() {
        let mut s = sample();
        s.move_node(7, 1).unwrap();
        s.move_node(8, 1).unwrap();
        assert!(!s.contains(6));
        s.assert_invariants();
    }

    #[test]
    fn delete_node_cascades_and_cleans_indexes() {
        let mut s = sample();
        let removed = s.delete_node(6).unwrap();
        assert_eq!(removed.nodes, vec![6, 7, 8]);
        assert!(!s.contains(7));
        assert!(s.nodes_at_depth(3).is_empty());
        s.assert_invariants();
    }

    #[test]
    fn delete_last_child_prunes_parent_group() {
        let mut s = sample();
        s.delete_node(2).unwrap();
        let removed = s.delete_node(3).unwrap();
        assert_eq!(removed.nodes, vec![3, 1]);
        assert!(!s.contains(1));
        s.assert_invariants();
    }

    #[test]
    fn delete_node_detaches_joints_and_chain_on_both_sides() {
        let mut s = sample();
        let j = JointId::between(2, 5);
        s.link_chain(ROOT, 2, 5).unwrap();
        s.attach_joint(2, j).unwrap();
        s.attach_joint(5, j).unwrap();

        let removed = s.delete_node(1).unwrap();
        assert_eq!(removed.joints, vec![j]);
        assert!(s.get_node(5).unwrap().joint_ids().is_empty());
        assert!(s.chain(ROOT).unwrap().neighbours(5).is_empty());
        s.assert_invariants();
    }

    #[test]
    fn delete_node_drops_relations_into_the_subtree() {
        let mut s = sample();
        assert!(s.add_relation(5, 7).unwrap());
        assert!(!s.add_relation(5, 7).unwrap());
        s.delete_node(6).unwrap();
        assert!(s.get_node(5).unwrap().relations().is_empty());
    }

    #[test]
    fn copy_subtree_uses_fresh_ids_and_no_physical_state() {
        let mut s = sample();
        s.register_body(7, BodyHandle(3)).unwrap();
        let copy = s.copy_subtree(6, 1).unwrap();
        s.assert_invariants();

        let copied = s.get_node(copy).unwrap();
        assert_eq!(copied.depth(), 2);
        assert_eq!(copied.children().len(), 2);
        for &c in copied.children() {
            assert!(c > 8);
            assert_eq!(s.body_of(c).unwrap(), BodyRef::Unassigned);
        }
        assert_eq!(s.body_of(7).unwrap(), BodyRef::Pending(BodyHandle(3)));
    }

    #[test]
    fn chain_links_reach_every_ancestor_scope() {
        let mut s = sample();
        s.link_chain(6, 7, 8).unwrap();
        assert!(s.chain(6).unwrap().contains(7, 8));
        assert!(s.chain(4).unwrap().contains(8, 7));
        assert!(s.chain(ROOT).unwrap().contains(7, 8));
        assert!(!s.chain(1).unwrap().contains(7, 8));

        s.unlink_chain(8, 7);
        assert!(s.chain(ROOT).unwrap().is_empty());
        assert!(s.chain(6).unwrap().is_empty());
    }

    #[test]
    fn body_registration_goes_pending_then_ready() {
        let mut s = sample();
        assert_eq!(s.body_of(2).unwrap(), BodyRef::Unassigned);
        s.register_body(2, BodyHandle(0)).unwrap();
        assert_eq!(s.pending_bodies(), vec![(2, BodyHandle(0))]);
        assert!(s.mark_body_ready(2).unwrap());
        assert!(!s.mark_body_ready(2).unwrap());
        assert_eq!(s.body_of(2).unwrap(), BodyRef::Ready(BodyHandle(0)));
        assert_eq!(s.register_body(1, BodyHandle(1)), Err(StoreError::NotAParticle(1)));
    }
}
