//! Error types for the compound-entity core.
//!
//! Errors fall into three groups:
//! - structural errors ([`StoreError`]) are caller misuse of the tree API and
//!   abort the operation that caused them;
//! - topology warnings ([`TopologyWarning`]) describe odd but non-corrupting
//!   data and are handled by a fallback;
//! - [`JointError::BodyNotYetRegistered`] is transient and is expected while
//!   the physics world is still realizing bodies.

use crate::types::{JointId, NodeId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Structural errors raised by [`crate::store::EntityStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No node with this id exists.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The requested parent does not exist.
    #[error("unknown parent {0}")]
    UnknownParent(NodeId),

    /// A node with the supplied explicit id already exists.
    #[error("duplicate node id {0}")]
    DuplicateId(NodeId),

    /// The node is a particle where a group was required.
    #[error("node {0} is not a group")]
    NotAGroup(NodeId),

    /// The node is a group where a particle was required.
    #[error("node {0} is not a particle")]
    NotAParticle(NodeId),

    /// Reparenting would make a node its own ancestor.
    #[error("moving node {node} under {parent} would create a cycle")]
    WouldCreateCycle {
        /// The node being moved.
        node: NodeId,
        /// The requested new parent.
        parent: NodeId,
    },

    /// The root node cannot be moved, copied or deleted.
    #[error("the root node cannot be moved, copied or deleted")]
    RootImmutable,

    /// No secondary index exists for this property key.
    #[error("no index for property `{0}`")]
    UnknownIndex(String),

    /// A node with children cannot change kind.
    #[error("node {0} has children and cannot change kind")]
    KindChangeWithChildren(NodeId),

    /// A particle that still takes part in joints cannot change kind.
    #[error("node {0} still has joints and cannot change kind")]
    KindChangeWithJoints(NodeId),

    /// A particle cannot become a group: the group would have no children.
    #[error("particle {0} cannot become a group")]
    ParticleToGroup(NodeId),

    /// A particle whose body is requested or registered cannot change kind.
    #[error("particle {0} has a physics body and cannot change kind")]
    KindChangeWithBody(NodeId),
}

/// Errors raised while creating, deleting or allocating joints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JointError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The particle's physics body has not been realized yet.
    #[error("body of particle {0} is not registered yet")]
    BodyNotYetRegistered(NodeId),

    /// A ring needs at least two distinct children.
    #[error("group {group} has {count} children, a joint ring needs at least 2")]
    InsufficientChildren {
        /// The group being allocated.
        group: NodeId,
        /// Number of children found.
        count: usize,
    },

    /// No particle could be chosen for a ring gap.
    #[error("no candidate particle for gap {gap} of group {group}")]
    NoCandidate {
        /// The group being allocated.
        group: NodeId,
        /// Index of the ring gap.
        gap: usize,
    },

    /// The joint is not known to the topology.
    #[error("unknown joint {0}")]
    UnknownJoint(JointId),

    /// The two particles are already joined.
    #[error("joint {0} already exists")]
    AlreadyJoined(JointId),

    /// Both endpoints are the same particle.
    #[error("particle {0} cannot be joined to itself")]
    SelfJoint(NodeId),
}

impl JointError {
    /// Returns `true` for errors that resolve themselves after a few ticks.
    pub fn is_transient(&self) -> bool {
        matches!(self, JointError::BodyNotYetRegistered(_))
    }
}

/// Physically odd but non-corrupting states found while tracing a boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyWarning {
    /// Fewer than three outer particles, no polygon can be formed.
    #[error("group {group} has only {count} outer particles")]
    InsufficientOuterParticles {
        /// The traced group.
        group: NodeId,
        /// Number of outer particles found.
        count: usize,
    },

    /// A chain entry points at a node that is not a live particle.
    #[error("chain of group {group} references missing particle {to} from {from}")]
    DanglingChainReference {
        /// The traced group.
        group: NodeId,
        /// The particle holding the reference.
        from: NodeId,
        /// The missing target.
        to: NodeId,
    },

    /// The chain restricted to the outer set contains no cycle.
    #[error("no boundary cycle found for group {group}")]
    NoCycleFound {
        /// The traced group.
        group: NodeId,
    },
}

/// Errors returned by [`crate::blob::trace_boundary`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Topology(#[from] TopologyWarning),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `entity_counts` is empty.
    #[error("entity_counts must name at least one level")]
    NoLevels,

    /// A level would create groups with fewer than two children.
    #[error("entity_counts[{depth}] = {count}, every level needs at least 2 entities")]
    TooFewEntities {
        /// Zero-based level index.
        depth: usize,
        /// Configured count.
        count: usize,
    },

    /// A numeric option is out of range.
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        /// Option name.
        name: &'static str,
        /// Human readable constraint.
        expected: &'static str,
        /// The offending value.
        value: f32,
    },

    /// The configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::simulation::Simulation`].
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Joint(#[from] JointError),

    #[error(transparent)]
    Trace(#[from] TraceError),
}
