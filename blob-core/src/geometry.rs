//! Fill meshes for blob contours and the queue that builds them.
//!
//! Contours arrive every frame, but only the newest contour of a group is
//! worth building: [`GeometryQueue`] keeps one job per group and replaces
//! it whenever a newer frame submits. Work is bounded per frame and resumes
//! where it stopped.

use crate::blob::BlobPolygon;
use crate::types::NodeId;
use glam::{Vec2, Vec3};
use std::collections::BTreeMap;

/// Triangle fan around the centroid of a closed contour.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobMesh {
    pub group: NodeId,
    pub frame: u64,
    pub color: Vec3,
    /// Vertex 0 is the centroid, followed by the outline in contour order.
    pub vertices: Vec<Vec2>,
    pub indices: Vec<u32>,
}

impl BlobMesh {
    /// Builds a mesh from `points`, pushing each outline vertex `inflate`
    /// units outward along its vertex normal.
    ///
    /// Returns `None` for fewer than three points or a degenerate contour.
    pub fn from_contour(
        group: NodeId,
        frame: u64,
        color: Vec3,
        points: &[Vec2],
        inflate: f32,
    ) -> Option<Self> {
        let n = points.len();
        if n < 3 || points.iter().any(|p| !p.is_finite()) {
            return None;
        }
        let area = signed_area(points);
        if area.abs() <= f32::EPSILON {
            return None;
        }
        // Outward is right of the walking direction for counter-clockwise contours.
        let orientation = area.signum();

        let centroid = points.iter().copied().sum::<Vec2>() / n as f32;
        let mut vertices = Vec::with_capacity(n + 1);
        vertices.push(centroid);
        for i in 0..n {
            let prev = points[(i + n - 1) % n];
            let next = points[(i + 1) % n];
            let tangent = (next - prev).normalize_or_zero();
            let normal = Vec2::new(tangent.y, -tangent.x) * orientation;
            vertices.push(points[i] + normal * inflate);
        }

        let mut indices = Vec::with_capacity(n * 3);
        for i in 0..n as u32 {
            indices.extend([0, i + 1, (i + 1) % n as u32 + 1]);
        }

        Some(Self {
            group,
            frame,
            color,
            vertices,
            indices,
        })
    }

    /// Outline vertices in contour order.
    pub fn outline(&self) -> &[Vec2] {
        &self.vertices[1..]
    }

    pub fn area(&self) -> f32 {
        signed_area(self.outline()).abs()
    }

    /// Even-odd point-in-polygon test against the outline.
    pub fn contains(&self, point: Vec2) -> bool {
        let outline = self.outline();
        let mut inside = false;
        let mut j = outline.len() - 1;
        for i in 0..outline.len() {
            let (a, b) = (outline[i], outline[j]);
            if (a.y > point.y) != (b.y > point.y)
                && point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Shoelace formula; positive for counter-clockwise contours.
pub fn signed_area(points: &[Vec2]) -> f32 {
    let n = points.len();
    (0..n)
        .map(|i| points[i].perp_dot(points[(i + 1) % n]))
        .sum::<f32>()
        * 0.5
}

#[derive(Clone, Debug)]
struct Job {
    frame: u64,
    color: Vec3,
    points: Vec<Vec2>,
}

/// Latest-wins geometry jobs, one slot per group.
#[derive(Debug)]
pub struct GeometryQueue {
    jobs: BTreeMap<NodeId, Job>,
    /// Group to resume from on the next `process` call.
    cursor: Option<NodeId>,
    inflate: f32,
    meshes: BTreeMap<NodeId, BlobMesh>,
}

impl GeometryQueue {
    pub fn new(inflate: f32) -> Self {
        Self {
            jobs: BTreeMap::new(),
            cursor: None,
            inflate,
            meshes: BTreeMap::new(),
        }
    }

    /// Queues the contour of `polygon` for `frame`. An older frame never
    /// replaces a newer job or mesh of the same group.
    pub fn submit(&mut self, frame: u64, polygon: &BlobPolygon) {
        let newer_exists = self
            .jobs
            .get(&polygon.group)
            .map(|j| j.frame)
            .max(self.meshes.get(&polygon.group).map(|m| m.frame))
            .is_some_and(|f| f > frame);
        if newer_exists {
            return;
        }
        self.jobs.insert(
            polygon.group,
            Job {
                frame,
                color: polygon.color,
                points: polygon.positions().collect(),
            },
        );
    }

    /// Builds up to `budget` meshes, continuing after the last group
    /// handled by the previous call. Returns the number built.
    pub fn process(&mut self, budget: usize) -> usize {
        let mut built = 0;
        while built < budget {
            let next = match self.cursor {
                Some(c) => self
                    .jobs
                    .range(c + 1..)
                    .next()
                    .or_else(|| self.jobs.iter().next())
                    .map(|(&g, _)| g),
                None => self.jobs.keys().next().copied(),
            };
            let Some(group) = next else {
                break;
            };
            let Some(job) = self.jobs.remove(&group) else {
                break;
            };
            self.cursor = Some(group);
            built += 1;
            match BlobMesh::from_contour(group, job.frame, job.color, &job.points, self.inflate) {
                Some(mesh) => {
                    self.meshes.insert(group, mesh);
                }
                None => {
                    self.meshes.remove(&group);
                }
            }
        }
        built
    }

    /// Forgets jobs and meshes of groups not in `keep`.
    pub fn retain(&mut self, keep: impl Fn(NodeId) -> bool) {
        self.jobs.retain(|&g, _| keep(g));
        self.meshes.retain(|&g, _| keep(g));
    }

    /// Drops the job and the mesh of `group`.
    pub fn forget(&mut self, group: NodeId) {
        self.jobs.remove(&group);
        self.meshes.remove(&group);
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    pub fn mesh(&self, group: NodeId) -> Option<&BlobMesh> {
        self.meshes.get(&group)
    }

    pub fn meshes(&self) -> impl Iterator<Item = &BlobMesh> {
        self.meshes.values()
    }
}
