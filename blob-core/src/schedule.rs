//! Next-tick deferred actions.
//!
//! Some visual changes must land one tick after the change that caused them
//! (hiding a blob only once its children are drawn, for example). Actions
//! are plain values captured when they are scheduled and are drained in the
//! order they were scheduled.

use crate::types::NodeId;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredAction {
    SetVisible { node: NodeId, visible: bool },
    SetExpanded { node: NodeId, expanded: bool },
}

#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: VecDeque<(u64, DeferredAction)>,
}

impl DeferredQueue {
    /// Schedules `action` to run on tick `due`.
    pub fn schedule(&mut self, due: u64, action: DeferredAction) {
        self.pending.push_back((due, action));
    }

    /// Removes and returns every action due at or before `tick`, in
    /// scheduling order.
    pub fn drain_due(&mut self, tick: u64) -> Vec<DeferredAction> {
        let mut due = Vec::new();
        let mut later = VecDeque::with_capacity(self.pending.len());
        for (at, action) in self.pending.drain(..) {
            if at <= tick {
                due.push(action);
            } else {
                later.push_back((at, action));
            }
        }
        self.pending = later;
        due
    }

    /// Drops every action that targets one of `nodes`.
    pub fn cancel_for(&mut self, nodes: &[NodeId]) {
        self.pending.retain(|(_, action)| {
            let target = match *action {
                DeferredAction::SetVisible { node, .. } | DeferredAction::SetExpanded { node, .. } => {
                    node
                }
            };
            !nodes.contains(&target)
        });
    }

    /// `true` if `action` is waiting in the queue.
    pub fn contains(&self, action: DeferredAction) -> bool {
        self.pending.iter().any(|(_, a)| *a == action)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
