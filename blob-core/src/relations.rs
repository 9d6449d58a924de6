//! Cosmetic relation edges between nodes of the same depth.
//!
//! Relations carry no physics. They appear at random, live for a fixed
//! number of ticks and disappear again, giving the viewer something to
//! draw between siblings and cousins.

use crate::config::RelationConfig;
use crate::store::EntityStore;
use crate::types::NodeId;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// A relation created by the animator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveRelation {
    pub from: NodeId,
    pub to: NodeId,
    pub born: u64,
}

#[derive(Debug)]
pub struct RelationAnimator {
    live: Vec<LiveRelation>,
    rng: StdRng,
}

impl RelationAnimator {
    pub fn new(seed: u64) -> Self {
        Self {
            live: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn live(&self) -> &[LiveRelation] {
        &self.live
    }

    /// Retires expired relations and possibly spawns one new relation.
    pub fn tick(&mut self, store: &mut EntityStore, cfg: &RelationConfig, tick: u64) {
        self.live.retain(|r| {
            if !store.contains(r.from) || !store.contains(r.to) {
                return false;
            }
            if tick.saturating_sub(r.born) < cfg.lifetime_ticks {
                return true;
            }
            match store.remove_relation(r.from, r.to) {
                Ok(_) => debug!(from = r.from, to = r.to, "relation retired"),
                Err(e) => debug!(from = r.from, to = r.to, error = %e, "relation source is gone"),
            }
            false
        });

        if self.live.len() >= cfg.max_live || !self.rng.random_bool(chance(cfg.spawn_chance)) {
            return;
        }
        if let Some((from, to)) = self.pick_pair(store)
            && let Ok(true) = store.add_relation(from, to)
        {
            debug!(from, to, "relation spawned");
            self.live.push(LiveRelation { from, to, born: tick });
        }
    }

    fn pick_pair(&mut self, store: &EntityStore) -> Option<(NodeId, NodeId)> {
        let root = store.root();
        let candidates: Vec<(NodeId, u32)> = store
            .flatten()
            .into_iter()
            .filter(|n| n.id() != root)
            .map(|n| (n.id(), n.depth()))
            .collect();
        let &(from, depth) = candidates.choose(&mut self.rng)?;
        let peers: Vec<NodeId> = store
            .nodes_at_depth(depth)
            .into_iter()
            .filter(|&id| id != from)
            .collect();
        let &to = peers.choose(&mut self.rng)?;
        Some((from, to))
    }
}

fn chance(p: f32) -> f64 {
    f64::from(p).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;

    fn store() -> EntityStore {
        let mut store = EntityStore::new();
        for _ in 0..3 {
            let g = store.add_node(store.root(), NodeSpec::group(2.0)).unwrap();
            for _ in 0..3 {
                store.add_node(g, NodeSpec::particle(0.5)).unwrap();
            }
        }
        store
    }

    fn always(max_live: usize, lifetime_ticks: u64) -> RelationConfig {
        RelationConfig {
            spawn_chance: 1.0,
            lifetime_ticks,
            max_live,
        }
    }

    #[test]
    fn relations_join_nodes_of_equal_depth() {
        let mut store = store();
        let mut anim = RelationAnimator::new(7);
        for t in 0..20 {
            anim.tick(&mut store, &always(50, 1000), t);
        }
        assert!(!anim.live().is_empty());
        for r in anim.live() {
            assert_ne!(r.from, r.to);
            let a = store.get_node(r.from).unwrap();
            let b = store.get_node(r.to).unwrap();
            assert_eq!(a.depth(), b.depth());
            assert!(a.relations().contains(&r.to));
        }
    }

    #[test]
    fn live_count_is_capped() {
        let mut store = store();
        let mut anim = RelationAnimator::new(1);
        for t in 0..40 {
            anim.tick(&mut store, &always(3, 1000), t);
            assert!(anim.live().len() <= 3);
        }
        assert_eq!(anim.live().len(), 3);
    }

    #[test]
    fn relations_expire_after_their_lifetime() {
        let mut store = store();
        let mut anim = RelationAnimator::new(3);
        anim.tick(&mut store, &always(1, 5), 0);
        let first = anim.live()[0];

        let quiet = RelationConfig {
            spawn_chance: 0.0,
            ..always(1, 5)
        };
        anim.tick(&mut store, &quiet, 4);
        assert_eq!(anim.live().len(), 1);
        anim.tick(&mut store, &quiet, 5);
        assert!(anim.live().is_empty());
        assert!(!store.get_node(first.from).unwrap().relations().contains(&first.to));
    }

    #[test]
    fn relation_removed_elsewhere_still_retires() {
        let mut store = store();
        let mut anim = RelationAnimator::new(5);
        anim.tick(&mut store, &always(1, 2), 0);
        let r = anim.live()[0];
        assert_eq!(store.remove_relation(r.from, r.to), Ok(true));

        anim.tick(&mut store, &always(0, 2), 2);
        assert!(anim.live().is_empty());
        assert!(store.get_node(r.from).unwrap().relations().is_empty());
    }

    #[test]
    fn deleted_endpoints_are_forgotten() {
        let mut store = store();
        let mut anim = RelationAnimator::new(11);
        anim.tick(&mut store, &always(1, 1000), 0);
        let r = anim.live()[0];
        store.delete_node(r.to).unwrap();
        anim.tick(&mut store, &always(0, 1000), 1);
        assert!(anim.live().is_empty());
    }
}
