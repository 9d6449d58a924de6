//! Core library for compound soft-body entities.
//!
//! A tree of groups whose leaves are physical particles. Siblings are tied
//! into elastic rings, groups are kept together by impulses and every
//! collapsed group is drawn as one blob traced around its outer particles.
//!
//! Main components:
//! - [`store`]: the entity tree, its indexes and cached derived data.
//! - [`node`]: node kinds, visuals and the specs used to create or patch them.
//! - [`joints`]: joint rings between adjacent children and outer flags.
//! - [`dynamics`]: per-group impulse state machines.
//! - [`blob`]: boundary cycle search and per-group contours.
//! - [`geometry`]: fill meshes and the latest-wins mesh queue.
//! - [`relations`]: cosmetic relation edges.
//! - [`schedule`]: next-tick deferred actions.
//! - [`builder`]: lays the tree out from the configuration.
//! - [`simulation`]: the per-frame driver.
//! - [`physics`]: the physics world contract; [`spring_world`] implements it.
//! - [`config`], [`error`], [`types`]: configuration, errors and shared ids.

pub mod blob;
pub mod builder;
pub mod config;
pub mod dynamics;
pub mod error;
pub mod geometry;
pub mod joints;
pub mod node;
pub mod physics;
pub mod relations;
pub mod schedule;
pub mod simulation;
pub mod spring_world;
pub mod store;
pub mod types;
