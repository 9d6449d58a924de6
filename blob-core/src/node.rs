//! Node records held by the [`crate::store::EntityStore`].
//!
//! Fields are private to the crate: outside code reads nodes through
//! accessors and changes them only through store primitives, so index and
//! cache invalidation cannot be bypassed.

use crate::types::{BodyHandle, JointId, NodeId, PropValue};
use glam::{Vec2, Vec3};
use std::collections::{BTreeMap, BTreeSet};

/// Link from a particle to its physics body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyRef {
    /// No body requested yet (e.g. freshly copied subtrees).
    Unassigned,
    /// Body requested, the physics world has not realized it yet.
    Pending(BodyHandle),
    /// Body realized and safe to query.
    Ready(BodyHandle),
}

impl BodyRef {
    pub fn ready(&self) -> Option<BodyHandle> {
        match *self {
            BodyRef::Ready(h) => Some(h),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<BodyHandle> {
        match *self {
            BodyRef::Pending(h) | BodyRef::Ready(h) => Some(h),
            BodyRef::Unassigned => None,
        }
    }
}

/// Undirected adjacency between particles, induced by joints.
///
/// Every `link` inserts both directions and every `unlink` removes both, so
/// the map stays symmetric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    adjacency: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Chain {
    pub(crate) fn link(&mut self, a: NodeId, b: NodeId) {
        let na = self.adjacency.entry(a).or_default();
        if !na.contains(&b) {
            na.push(b);
        }
        let nb = self.adjacency.entry(b).or_default();
        if !nb.contains(&a) {
            nb.push(a);
        }
    }

    pub(crate) fn unlink(&mut self, a: NodeId, b: NodeId) {
        Self::remove_one(&mut self.adjacency, a, b);
        Self::remove_one(&mut self.adjacency, b, a);
    }

    /// Drops every edge touching `id`.
    pub(crate) fn forget(&mut self, id: NodeId) {
        if let Some(neighbours) = self.adjacency.remove(&id) {
            for n in neighbours {
                Self::remove_one(&mut self.adjacency, n, id);
            }
        }
    }

    fn remove_one(adjacency: &mut BTreeMap<NodeId, Vec<NodeId>>, from: NodeId, to: NodeId) {
        if let Some(list) = adjacency.get_mut(&from) {
            list.retain(|&n| n != to);
            if list.is_empty() {
                adjacency.remove(&from);
            }
        }
    }

    pub fn neighbours(&self, id: NodeId) -> &[NodeId] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, a: NodeId, b: NodeId) -> bool {
        self.neighbours(a).contains(&b)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[NodeId])> {
        self.adjacency.iter().map(|(&k, v)| (k, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum::<usize>() / 2
    }

    /// `true` when `b ∈ chain[a] ⇔ a ∈ chain[b]` holds for every entry.
    pub fn is_symmetric(&self) -> bool {
        self.adjacency
            .iter()
            .all(|(&a, list)| list.iter().all(|&b| self.contains(b, a)))
    }
}

/// Render state of a particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleVisual {
    color: Vec3,
    scale: f32,
    rigid_scale: f32,
    visible: bool,
}

impl ParticleVisual {
    pub fn new(color: Vec3) -> Self {
        Self {
            color,
            scale: 1.0,
            rigid_scale: 1.0,
            visible: false,
        }
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    /// Current visual scale.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Scale the joint anchors were last laid out for.
    pub fn rigid_scale(&self) -> f32 {
        self.rigid_scale
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_color(&mut self, color: Vec3) {
        self.color = color;
    }

    /// Non-positive or non-finite scales are ignored.
    pub(crate) fn set_scale(&mut self, scale: f32) -> bool {
        if scale > 0.0 && scale.is_finite() {
            self.scale = scale;
            true
        } else {
            false
        }
    }

    pub(crate) fn settle_rigid_scale(&mut self) {
        self.rigid_scale = self.scale;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }
}

/// Render state of a group.
///
/// A group is drawn as a blob while it is visible and collapsed; expanding
/// it hands the drawing over to its children.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupVisual {
    color: Vec3,
    visible: bool,
    expanded: bool,
}

impl GroupVisual {
    pub fn new(color: Vec3) -> Self {
        Self {
            color,
            visible: false,
            expanded: false,
        }
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn expanded(&self) -> bool {
        self.expanded
    }

    /// `true` when the group should be drawn as a blob.
    pub fn shows_blob(&self) -> bool {
        self.visible && !self.expanded
    }

    pub(crate) fn set_color(&mut self, color: Vec3) {
        self.color = color;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub(crate) fn set_expanded(&mut self, expanded: bool) {
        self.expanded = expanded;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub(crate) body: BodyRef,
    pub(crate) radius: f32,
    /// Outer flag per ancestor depth.
    pub(crate) outer: BTreeMap<u32, bool>,
    pub(crate) visual: ParticleVisual,
}

impl Particle {
    pub fn body(&self) -> BodyRef {
        self.body
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Whether this particle lies on the boundary of its ancestor at `depth`.
    pub fn is_outer_at(&self, depth: u32) -> bool {
        self.outer.get(&depth).copied().unwrap_or(false)
    }

    pub fn outer_flags(&self) -> &BTreeMap<u32, bool> {
        &self.outer
    }

    pub fn visual(&self) -> &ParticleVisual {
        &self.visual
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    /// Derived position of the group, refreshed from its particles each tick.
    pub(crate) center: Vec2,
    /// Nominal radius from the layout.
    pub(crate) radius: f32,
    /// Adjacency of every joint inside this group's subtree.
    pub(crate) chain: Chain,
    /// Bumped whenever outer flags at this group's depth are reassigned.
    pub(crate) outer_revision: u64,
    pub(crate) visual: GroupVisual,
}

impl Group {
    pub fn center(&self) -> Vec2 {
        self.center
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn outer_revision(&self) -> u64 {
        self.outer_revision
    }

    pub fn visual(&self) -> &GroupVisual {
        &self.visual
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Particle(Particle),
    Group(Group),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) depth: u32,
    pub(crate) joint_ids: BTreeSet<JointId>,
    pub(crate) relations: Vec<NodeId>,
    pub(crate) props: BTreeMap<String, PropValue>,
    pub(crate) membership_signature: Option<u64>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn joint_ids(&self) -> &BTreeSet<JointId> {
        &self.joint_ids
    }

    pub fn relations(&self) -> &[NodeId] {
        &self.relations
    }

    pub fn props(&self) -> &BTreeMap<String, PropValue> {
        &self.props
    }

    pub fn prop(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key)
    }

    /// Cached membership signature, `None` when invalidated.
    pub fn membership_signature(&self) -> Option<u64> {
        self.membership_signature
    }

    pub fn is_particle(&self) -> bool {
        matches!(self.kind, NodeKind::Particle(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group(_))
    }

    pub fn as_particle(&self) -> Option<&Particle> {
        match &self.kind {
            NodeKind::Particle(p) => Some(p),
            NodeKind::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match &self.kind {
            NodeKind::Group(g) => Some(g),
            NodeKind::Particle(_) => None,
        }
    }

    pub(crate) fn as_particle_mut(&mut self) -> Option<&mut Particle> {
        match &mut self.kind {
            NodeKind::Particle(p) => Some(p),
            NodeKind::Group(_) => None,
        }
    }

    pub(crate) fn as_group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.kind {
            NodeKind::Group(g) => Some(g),
            NodeKind::Particle(_) => None,
        }
    }
}

/// Kind-specific part of a [`NodeSpec`] or a kind-changing [`NodePatch`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KindSpec {
    Particle { radius: f32, body: Option<BodyHandle> },
    Group { radius: f32 },
}

impl KindSpec {
    pub(crate) fn into_kind(self, color: Vec3) -> NodeKind {
        match self {
            KindSpec::Particle { radius, body } => NodeKind::Particle(Particle {
                body: body.map_or(BodyRef::Unassigned, BodyRef::Pending),
                radius,
                outer: BTreeMap::new(),
                visual: ParticleVisual::new(color),
            }),
            KindSpec::Group { radius } => NodeKind::Group(Group {
                center: Vec2::ZERO,
                radius,
                chain: Chain::default(),
                outer_revision: 0,
                visual: GroupVisual::new(color),
            }),
        }
    }
}

/// Description of a node to insert with [`crate::store::EntityStore::add_node`].
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    pub id: Option<NodeId>,
    pub kind: KindSpec,
    pub color: Vec3,
    pub props: BTreeMap<String, PropValue>,
}

impl NodeSpec {
    pub fn particle(radius: f32) -> Self {
        Self::new(KindSpec::Particle { radius, body: None })
    }

    pub fn group(radius: f32) -> Self {
        Self::new(KindSpec::Group { radius })
    }

    fn new(kind: KindSpec) -> Self {
        Self {
            id: None,
            kind,
            color: Vec3::splat(0.8),
            props: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_body(mut self, body: BodyHandle) -> Self {
        if let KindSpec::Particle { body: b, .. } = &mut self.kind {
            *b = Some(body);
        }
        self
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.props.insert(key.to_owned(), value.into());
        self
    }
}

/// Field changes merged by [`crate::store::EntityStore::update_node`].
///
/// `props` maps a key to its new value, or to `None` to remove it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePatch {
    pub kind: Option<KindSpec>,
    pub props: BTreeMap<String, Option<PropValue>>,
    pub color: Option<Vec3>,
    pub radius: Option<f32>,
}

impl NodePatch {
    pub fn set_prop(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.props.insert(key.to_owned(), Some(value.into()));
        self
    }

    pub fn remove_prop(mut self, key: &str) -> Self {
        self.props.insert(key.to_owned(), None);
        self
    }

    pub fn with_kind(mut self, kind: KindSpec) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = Some(radius);
        self
    }
}
