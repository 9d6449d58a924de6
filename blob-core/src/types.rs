use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a node in an [`crate::store::EntityStore`].
///
/// Ids are handed out by the store's own counter and are never reused
/// while the node is part of the live tree.
pub type NodeId = usize;

/// Handle to a body owned by a [`crate::physics::PhysicsWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub u32);

/// Handle to a point-to-point constraint owned by a [`crate::physics::PhysicsWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintHandle(pub u32);

/// Identifier of a joint between two particles.
///
/// The pair is normalised so that `a < b`; a pair of particles can only
/// ever be joined once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointId {
    pub a: NodeId,
    pub b: NodeId,
}

impl JointId {
    pub fn between(x: NodeId, y: NodeId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// Returns the endpoint opposite to `id`, or `None` if `id` is not an endpoint.
    pub fn other(&self, id: NodeId) -> Option<NodeId> {
        if id == self.a {
            Some(self.b)
        } else if id == self.b {
            Some(self.a)
        } else {
            None
        }
    }

    pub fn touches(&self, id: NodeId) -> bool {
        self.a == id || self.b == id
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.a, self.b)
    }
}

/// A value stored under a node property key.
///
/// Property values are hashable and ordered so they can serve as keys of
/// the store's secondary indexes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Text(v.to_owned())
    }
}
