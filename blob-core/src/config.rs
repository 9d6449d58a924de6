use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Simulation parameters, fixed for the lifetime of one built tree.
///
/// Changing any field after construction requires a full rebuild through
/// [`crate::simulation::Simulation::new`]; nothing here is reconfigured
/// incrementally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Branching factor per depth level, root to leaf. The last entry is
    /// the number of particles in each lowest group.
    pub entity_counts: Vec<usize>,
    /// Impulse magnitude per unit of particle area and per particle.
    pub impulse_per_particle: f32,
    /// Scale of the corrective impulse given to an overshooting child.
    pub overshoot_scaling: f32,
    /// A child farther than this many group radii from the centre overshoots.
    pub max_displacement_scaling: f32,
    /// Whether each group seeds motion with one randomized outward impulse.
    pub initial_impulse: bool,
    /// Multiplier for the initial impulse.
    pub initial_impulse_scaling: f32,
    /// Attractor strength per depth; positive pulls toward the centre,
    /// negative pushes away. Missing depths are treated as `0.0`.
    pub attractor_scaling: Vec<f32>,
    /// Restitution handed to the physics world for particle contacts.
    pub particle_restitution: f32,
    /// Radius of a single particle.
    pub particle_radius: f32,
    /// Spacing factor between neighbours on a ring (`1.0` = touching).
    pub ring_spacing: f32,
    /// Seed for every random stream of the simulation.
    pub seed: u64,
    /// Cycle-search expansions per blob per tick.
    pub trace_budget: usize,
    /// Total expansions after which a cycle search settles for its best result.
    pub trace_max_expansions: usize,
    /// Geometry jobs processed per frame.
    pub geometry_budget: usize,
    /// Let `update_joint` leave a joint detached for one tick.
    pub detach_experiment: bool,
    pub relations: RelationConfig,
}

/// Settings of the cosmetic relation animator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationConfig {
    /// Chance per tick of spawning one relation.
    pub spawn_chance: f32,
    /// Ticks a relation lives before it is retired.
    pub lifetime_ticks: u64,
    /// Upper bound on simultaneously live relations.
    pub max_live: usize,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            spawn_chance: 0.05,
            lifetime_ticks: 240,
            max_live: 8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entity_counts: vec![3, 4, 6],
            impulse_per_particle: 0.02,
            overshoot_scaling: 2.0,
            max_displacement_scaling: 1.0,
            initial_impulse: true,
            initial_impulse_scaling: 1.0,
            attractor_scaling: vec![0.0, 0.5, 1.0],
            particle_restitution: 0.2,
            particle_radius: 1.0,
            ring_spacing: 1.05,
            seed: 0x5eed,
            trace_budget: 4_096,
            trace_max_expansions: 200_000,
            geometry_budget: 16,
            detach_experiment: false,
            relations: RelationConfig::default(),
        }
    }
}

impl Config {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that the configuration describes a buildable tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity_counts.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        for (depth, &count) in self.entity_counts.iter().enumerate() {
            if count < 2 {
                return Err(ConfigError::TooFewEntities { depth, count });
            }
        }
        positive("particle_radius", self.particle_radius)?;
        positive("ring_spacing", self.ring_spacing)?;
        positive("max_displacement_scaling", self.max_displacement_scaling)?;
        non_negative("impulse_per_particle", self.impulse_per_particle)?;
        non_negative("overshoot_scaling", self.overshoot_scaling)?;
        non_negative("initial_impulse_scaling", self.initial_impulse_scaling)?;
        if !(0.0..=1.0).contains(&self.particle_restitution) {
            return Err(ConfigError::OutOfRange {
                name: "particle_restitution",
                expected: "within [0, 1]",
                value: self.particle_restitution,
            });
        }
        if !(0.0..=1.0).contains(&self.relations.spawn_chance) {
            return Err(ConfigError::OutOfRange {
                name: "relations.spawn_chance",
                expected: "within [0, 1]",
                value: self.relations.spawn_chance,
            });
        }
        Ok(())
    }

    /// Attractor strength for groups at `depth`.
    pub fn attractor_at(&self, depth: u32) -> f32 {
        self.attractor_scaling
            .get(depth as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Area of one particle, used to scale impulses.
    pub fn particle_area(&self) -> f32 {
        std::f32::consts::PI * self.particle_radius * self.particle_radius
    }
}

fn positive(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            expected: "positive",
            value,
        })
    }
}

fn non_negative(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            expected: "non-negative",
            value,
        })
    }
}
