//! Lays out the initial hierarchy from [`Config::entity_counts`].
//!
//! Every group places its children evenly on a ring. Radii are computed
//! bottom-up so neighbouring children on a ring just touch (scaled by
//! [`Config::ring_spacing`]); positions are assigned top-down.

use crate::config::Config;
use crate::error::StoreResult;
use crate::node::{NodePatch, NodeSpec};
use crate::physics::{BodyDesc, PhysicsWorld};
use crate::store::EntityStore;
use crate::types::NodeId;
use glam::{Vec2, Vec3};
use std::f32::consts::{PI, TAU};
use tracing::info;

/// Ids created by [`build_hierarchy`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Built {
    pub groups: Vec<NodeId>,
    pub particles: Vec<NodeId>,
}

/// Radius of the ring on which `n` children of radius `child_radius` sit.
pub fn ring_radius(n: usize, child_radius: f32, spacing: f32) -> f32 {
    if n < 2 {
        return 0.0;
    }
    child_radius / (PI / n as f32).sin() * spacing
}

/// Nominal radii per depth, root first. The last entry is the particle radius.
pub fn level_radii(cfg: &Config) -> Vec<f32> {
    let mut radii = vec![cfg.particle_radius; cfg.entity_counts.len() + 1];
    for level in (0..cfg.entity_counts.len()).rev() {
        let child = radii[level + 1];
        radii[level] = ring_radius(cfg.entity_counts[level], child, cfg.ring_spacing) + child;
    }
    radii
}

/// Builds the tree under the store's root and requests one body per particle.
///
/// The store is expected to hold only its root. Every particle is left
/// with a pending body; children of the root start visible and the root
/// itself starts expanded.
pub fn build_hierarchy<W: PhysicsWorld>(
    store: &mut EntityStore,
    world: &mut W,
    cfg: &Config,
) -> StoreResult<Built> {
    let radii = level_radii(cfg);
    let root = store.root();
    let mut built = Built::default();

    store.update_node(root, NodePatch::default().with_radius(radii[0]))?;
    store.set_visible(root, true)?;
    store.set_expanded(root, true)?;
    store.set_group_center(root, Vec2::ZERO)?;

    // (parent, parent centre, level of the children)
    let mut stack = vec![(root, Vec2::ZERO, 0usize)];
    while let Some((parent, center, level)) = stack.pop() {
        let Some(&n) = cfg.entity_counts.get(level) else {
            continue;
        };
        let child_radius = radii[level + 1];
        let ring = ring_radius(n, child_radius, cfg.ring_spacing);
        let leaf = level + 1 == cfg.entity_counts.len();
        let phase = level as f32 * 0.5;

        for k in 0..n {
            let angle = phase + TAU * k as f32 / n as f32;
            let pos = center + Vec2::from_angle(angle) * ring;
            let color = palette(level, k, n);

            if leaf {
                let body = world.spawn_body(BodyDesc {
                    position: pos,
                    radius: child_radius,
                    restitution: cfg.particle_restitution,
                });
                let id = store.add_node(
                    parent,
                    NodeSpec::particle(child_radius)
                        .with_body(body)
                        .with_color(color),
                )?;
                built.particles.push(id);
            } else {
                let id = store.add_node(parent, NodeSpec::group(child_radius).with_color(color))?;
                store.set_group_center(id, pos)?;
                built.groups.push(id);
                stack.push((id, pos, level + 1));
            }
        }
    }

    let top_level = store.get_children(root)?.to_vec();
    for child in top_level {
        store.set_visible(child, true)?;
    }

    info!(
        groups = built.groups.len(),
        particles = built.particles.len(),
        levels = cfg.entity_counts.len(),
        "built hierarchy"
    );
    Ok(built)
}

/// Colour of child `k` of `n` at `level`: hue by sibling index, lighter
/// with depth.
fn palette(level: usize, k: usize, n: usize) -> Vec3 {
    let hue = (k as f32 / n as f32 + level as f32 * 0.13).fract();
    let light = (0.45 + 0.12 * level as f32).min(0.85);
    hsl_to_rgb(hue, 0.55, light)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> Vec3 {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h * 6.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    Vec3::new(r + m, g + m, b + m)
}
