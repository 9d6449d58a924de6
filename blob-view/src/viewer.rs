//! Interactive blob hierarchy viewer built with eframe/egui.
//!
//! [`Viewer`] owns a [`Simulation`] running on the reference
//! [`SpringWorld`] and draws every collapsed group as a filled blob.
//! Left click expands the blob under the cursor, right click collapses the
//! group around it and `Delete` removes the hovered entity.

use blob_core::{
    config::Config,
    error::SimError,
    simulation::{FrameOutput, Simulation},
    spring_world::{SpringWorld, SpringWorldConfig},
    types::NodeId,
};
use eframe::App;
use glam::{Vec2, Vec3};
use tracing::{error, info};

/// Physics time step per simulation tick, in seconds.
const PHYSICS_DT: f32 = 1.0 / 60.0;

/// Main application state for the viewer.
///
/// The per-frame update is:
/// 1. Handle panel widgets and canvas input.
/// 2. If `running`, advance the simulation once per `step_interval`.
/// 3. Draw the latest [`FrameOutput`].
pub struct Viewer {
    sim: Simulation<SpringWorld>,
    /// Configuration edited in the side panel; applied on rebuild.
    cfg: Config,
    world_cfg: SpringWorldConfig,

    running: bool,
    zoom: f32,
    pan: egui::Vec2,
    particle_scale: f32,
    show_particles: bool,
    show_outlines: bool,
    show_relations: bool,

    step_interval: f64,
    last_step_time: f64,
    last_step_dt: f64,
    hovered: Option<NodeId>,
    last_error: Option<String>,
}

impl Viewer {
    /// Creates a viewer running a fresh build of `cfg`.
    pub fn new(cfg: Config) -> Result<Self, SimError> {
        let world_cfg = SpringWorldConfig::default();
        let sim = Simulation::new(cfg.clone(), SpringWorld::new(world_cfg))?;
        Ok(Self {
            sim,
            cfg,
            world_cfg,
            running: true,
            zoom: 8.0,
            pan: egui::vec2(0.0, 0.0),
            particle_scale: 1.0,
            show_particles: true,
            show_outlines: true,
            show_relations: true,
            step_interval: f64::from(PHYSICS_DT),
            last_step_time: 0.0,
            last_step_dt: 0.0,
            hovered: None,
            last_error: None,
        })
    }

    /// Rebuilds the simulation from the edited configuration. On failure
    /// the running simulation is kept and the error is shown.
    fn rebuild(&mut self) {
        match self
            .sim
            .rebuild(self.cfg.clone(), SpringWorld::new(self.world_cfg))
        {
            Ok(()) => {
                info!(levels = self.cfg.entity_counts.len(), "rebuilt simulation");
                self.particle_scale = 1.0;
                self.last_error = None;
            }
            Err(e) => {
                error!(error = %e, "rebuild rejected");
                self.last_error = Some(e.to_string());
            }
        }
    }

    /// Runs one core tick followed by one physics step.
    fn step_once(&mut self) {
        match self.sim.tick() {
            Ok(_) => self.sim.world_mut().step(PHYSICS_DT),
            Err(e) => {
                error!(error = %e, "tick failed, pausing");
                self.last_error = Some(e.to_string());
                self.running = false;
            }
        }
    }

    fn report(&mut self, result: Result<bool, SimError>) {
        if let Err(e) = result {
            self.last_error = Some(e.to_string());
        }
    }

    /// Converts a world-space position to screen-space. The y-axis points
    /// up in world space.
    fn world_to_screen(&self, p: Vec2, rect: egui::Rect) -> egui::Pos2 {
        let center = rect.center();
        egui::pos2(
            center.x + p.x * self.zoom + self.pan.x,
            center.y - p.y * self.zoom + self.pan.y,
        )
    }

    /// Inverse of [`Viewer::world_to_screen`].
    fn screen_to_world(&self, p: egui::Pos2, rect: egui::Rect) -> Vec2 {
        let center = rect.center();
        let x = (p.x - center.x - self.pan.x) / self.zoom;
        let y = (center.y - p.y + self.pan.y) / self.zoom;
        Vec2::new(x, y)
    }

    /// Entity under `point`: the deepest blob, else a visible particle.
    fn entity_at(&self, point: Vec2) -> Option<NodeId> {
        self.sim
            .group_at(point)
            .or_else(|| self.sim.particle_at(point))
    }

    /// Parent of the entity under `point`, the group a collapse targets.
    fn enclosing_group(&self, point: Vec2) -> Option<NodeId> {
        let id = self.entity_at(point)?;
        self.sim.store().node(id)?.parent()
    }

    fn labeled_drag_usize(
        ui: &mut egui::Ui,
        label: &str,
        value: &mut usize,
        range: std::ops::RangeInclusive<usize>,
    ) {
        ui.horizontal(|ui| {
            ui.label(label);
            ui.add(egui::DragValue::new(value).range(range).speed(1.0));
        });
    }

    fn labeled_drag_f32(
        ui: &mut egui::Ui,
        label: &str,
        value: &mut f32,
        range: std::ops::RangeInclusive<f32>,
        speed: f64,
    ) {
        ui.horizontal(|ui| {
            ui.label(label);
            ui.add(egui::DragValue::new(value).range(range).speed(speed));
        });
    }

    /// Run controls, stepping, rebuild and zoom.
    fn ui_top_panel(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui
                    .button(if self.running { "⏸ Pause" } else { "▶ Run" })
                    .clicked()
                {
                    self.running = !self.running;
                }

                ui.add(
                    egui::DragValue::new(&mut self.step_interval)
                        .prefix("dt target = ")
                        .range(0.005..=1.0)
                        .speed(0.005),
                );

                if ui.button("Step").clicked() {
                    self.step_once();
                }

                if ui.button("Rebuild").clicked() {
                    self.rebuild();
                }

                ui.separator();
                ui.add(egui::Slider::new(&mut self.zoom, 0.5..=40.0).text("Zoom"));
            });
        });
    }

    /// Tick, entity counts, pending bodies and warnings.
    fn ui_status_bar(&self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                ui.label(format!("dt last = {:.3} s", self.last_step_dt));
                ui.label(format!("tick = {}", self.sim.tick_count()));
                ui.separator();
                ui.label(format!("particles = {}", self.sim.built().particles.len()));
                ui.label(format!("joints = {}", self.sim.topology().len()));
                ui.label(format!(
                    "pending bodies = {}",
                    self.sim.store().pending_bodies().len()
                ));
                ui.label(format!("warnings = {}", self.sim.last_warnings()));
                if let Some(id) = self.hovered
                    && let Some(node) = self.sim.store().node(id)
                {
                    ui.separator();
                    ui.label(format!("hover = #{id} (depth {})", node.depth()));
                }
                if let Some(e) = &self.last_error {
                    ui.separator();
                    ui.colored_label(egui::Color32::LIGHT_RED, e);
                }
            });
        });
    }

    /// Configuration editor. Tree and impulse options apply on rebuild;
    /// particle scale applies immediately.
    fn ui_config_panel(&mut self, ctx: &egui::Context) {
        egui::SidePanel::right("config_panel")
            .resizable(true)
            .default_width(240.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical().show(ui, |ui| {
                    ui.heading("Config");

                    ui.separator();
                    ui.label("Entities per level");
                    for (level, count) in self.cfg.entity_counts.iter_mut().enumerate() {
                        Self::labeled_drag_usize(ui, &format!("level {level}:"), count, 2..=16);
                    }
                    ui.horizontal(|ui| {
                        if ui.button("+ level").clicked() {
                            self.cfg.entity_counts.push(3);
                        }
                        if ui.button("− level").clicked() && self.cfg.entity_counts.len() > 1 {
                            self.cfg.entity_counts.pop();
                        }
                    });

                    ui.separator();
                    ui.label("Impulses");
                    Self::labeled_drag_f32(
                        ui,
                        "impulse_per_particle:",
                        &mut self.cfg.impulse_per_particle,
                        0.0..=1.0,
                        0.001,
                    );
                    Self::labeled_drag_f32(
                        ui,
                        "overshoot_scaling:",
                        &mut self.cfg.overshoot_scaling,
                        0.0..=10.0,
                        0.05,
                    );
                    Self::labeled_drag_f32(
                        ui,
                        "max_displacement_scaling:",
                        &mut self.cfg.max_displacement_scaling,
                        0.01..=5.0,
                        0.01,
                    );
                    ui.checkbox(&mut self.cfg.initial_impulse, "initial impulse");
                    Self::labeled_drag_f32(
                        ui,
                        "initial_impulse_scaling:",
                        &mut self.cfg.initial_impulse_scaling,
                        0.0..=10.0,
                        0.05,
                    );
                    ui.label("Attractor per depth");
                    for (depth, s) in self.cfg.attractor_scaling.iter_mut().enumerate() {
                        Self::labeled_drag_f32(ui, &format!("depth {depth}:"), s, -5.0..=5.0, 0.01);
                    }

                    ui.separator();
                    ui.label("Particles");
                    Self::labeled_drag_f32(
                        ui,
                        "particle_radius:",
                        &mut self.cfg.particle_radius,
                        0.1..=10.0,
                        0.05,
                    );
                    Self::labeled_drag_f32(
                        ui,
                        "restitution:",
                        &mut self.cfg.particle_restitution,
                        0.0..=1.0,
                        0.01,
                    );
                    Self::labeled_drag_f32(
                        ui,
                        "ring_spacing:",
                        &mut self.cfg.ring_spacing,
                        0.5..=4.0,
                        0.01,
                    );
                    let scale = egui::Slider::new(&mut self.particle_scale, 0.25..=3.0)
                        .text("visual scale");
                    if ui.add(scale).changed() {
                        let result = self.sim.scale_particles(self.particle_scale);
                        self.report(result.map(|n| n > 0));
                    }

                    ui.separator();
                    ui.label("Physics");
                    Self::labeled_drag_f32(
                        ui,
                        "stiffness:",
                        &mut self.world_cfg.stiffness,
                        0.0..=1000.0,
                        1.0,
                    );
                    Self::labeled_drag_f32(ui, "damping:", &mut self.world_cfg.damping, 0.0..=100.0, 0.1);
                    Self::labeled_drag_f32(
                        ui,
                        "linear_damping:",
                        &mut self.world_cfg.linear_damping,
                        0.0..=10.0,
                        0.01,
                    );
                    ui.checkbox(&mut self.cfg.detach_experiment, "detach experiment");

                    ui.separator();
                    ui.label("Relations");
                    Self::labeled_drag_f32(
                        ui,
                        "spawn_chance:",
                        &mut self.cfg.relations.spawn_chance,
                        0.0..=1.0,
                        0.01,
                    );
                    Self::labeled_drag_usize(ui, "max_live:", &mut self.cfg.relations.max_live, 0..=64);
                    ui.horizontal(|ui| {
                        ui.label("lifetime_ticks:");
                        ui.add(egui::DragValue::new(&mut self.cfg.relations.lifetime_ticks).range(1..=10_000));
                    });

                    ui.separator();
                    ui.label("Display");
                    ui.checkbox(&mut self.show_particles, "particles");
                    ui.checkbox(&mut self.show_outlines, "blob outlines");
                    ui.checkbox(&mut self.show_relations, "relations");

                    ui.separator();
                    ui.horizontal(|ui| {
                        ui.label("seed:");
                        ui.add(egui::DragValue::new(&mut self.cfg.seed));
                        if ui.button("🎲").clicked() {
                            self.cfg.seed = rand::random();
                        }
                    });
                    if ui.button("Reset cfg to default").clicked() {
                        self.cfg = Config::default();
                        self.world_cfg = SpringWorldConfig::default();
                    }
                    if ui.button("Rebuild").clicked() {
                        self.rebuild();
                    }
                });
            });
    }

    fn draw_frame(&self, painter: &egui::Painter, rect: egui::Rect, frame: &FrameOutput) {
        for mesh in &frame.meshes {
            let fill = color32(mesh.color, 200);
            let mut shape = egui::Mesh::default();
            for &v in &mesh.vertices {
                shape.colored_vertex(self.world_to_screen(v, rect), fill);
            }
            for tri in mesh.indices.chunks_exact(3) {
                shape.add_triangle(tri[0], tri[1], tri[2]);
            }
            painter.add(egui::Shape::mesh(shape));
        }

        if self.show_outlines {
            for blob in &frame.blobs {
                let points: Vec<egui::Pos2> = blob
                    .positions()
                    .map(|p| self.world_to_screen(p, rect))
                    .collect();
                let color = if blob.stale {
                    egui::Color32::GRAY
                } else {
                    color32(blob.color * 0.6, 255)
                };
                painter.add(egui::Shape::closed_line(points, egui::Stroke::new(1.5, color)));
            }
        }

        if self.show_particles {
            for p in frame.particles.iter().filter(|p| p.visible) {
                let center = self.world_to_screen(p.position, rect);
                let r = (p.radius * self.zoom).max(1.5);
                painter.circle_filled(center, r, color32(p.color, 255));
            }
        }

        if self.show_relations {
            let stroke = egui::Stroke::new(1.0, egui::Color32::from_rgba_unmultiplied(255, 255, 255, 96));
            for r in &frame.relations {
                painter.line_segment(
                    [
                        self.world_to_screen(r.start, rect),
                        self.world_to_screen(r.end, rect),
                    ],
                    stroke,
                );
            }
        }
    }

    /// Canvas: pan, zoom, expand/collapse/remove input and drawing.
    fn ui_central_panel(&mut self, ctx: &egui::Context) {
        egui::CentralPanel::default().show(ctx, |ui| {
            let response = ui.allocate_response(ui.available_size(), egui::Sense::click_and_drag());
            let rect = response.rect;
            let painter = ui.painter_at(rect);

            if response.dragged() {
                self.pan += response.drag_delta();
            }

            let hover_world = response.hover_pos().map(|p| self.screen_to_world(p, rect));
            self.hovered = hover_world.and_then(|p| self.entity_at(p));

            if response.clicked()
                && let Some(p) = hover_world
                && let Some(group) = self.sim.group_at(p)
            {
                let result = self.sim.expand(group);
                self.report(result);
            }
            if response.secondary_clicked()
                && let Some(p) = hover_world
                && let Some(group) = self.enclosing_group(p)
            {
                let result = self.sim.collapse(group);
                self.report(result);
            }
            if ctx.input(|i| i.key_pressed(egui::Key::Delete))
                && let Some(id) = self.hovered
                && id != self.sim.store().root()
            {
                if let Err(e) = self.sim.remove(id) {
                    self.last_error = Some(e.to_string());
                }
                self.hovered = None;
            }

            // Zoom around the mouse cursor.
            let scroll = ui.ctx().input(|i| i.raw_scroll_delta.y);
            if scroll != 0.0 {
                let pointer_screen = response.hover_pos().unwrap_or(rect.center());
                let world_before = self.screen_to_world(pointer_screen, rect);
                let factor = (1.0 + scroll * 0.001).clamp(0.5, 2.0);
                self.zoom = (self.zoom * factor).clamp(0.5, 40.0);
                let screen_after = self.world_to_screen(world_before, rect);
                self.pan += pointer_screen - screen_after;
            }

            let frame = self.sim.frame();
            self.draw_frame(&painter, rect, &frame);

            if self.running {
                let now = ctx.input(|i| i.time);
                let elapsed = now - self.last_step_time;
                if elapsed >= self.step_interval {
                    if self.last_step_time > 0.0 {
                        self.last_step_dt = elapsed;
                    }
                    self.step_once();
                    self.last_step_time = now;
                }
                ctx.request_repaint();
            }
        });
    }
}

impl App for Viewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.ui_top_panel(ctx);
        self.ui_status_bar(ctx);
        self.ui_config_panel(ctx);
        self.ui_central_panel(ctx);
    }
}

/// Converts a linear `[0, 1]` RGB colour to an egui colour.
fn color32(c: Vec3, alpha: u8) -> egui::Color32 {
    let to_u8 = |x: f32| (x.clamp(0.0, 1.0) * 255.0).round() as u8;
    egui::Color32::from_rgba_unmultiplied(to_u8(c.x), to_u8(c.y), to_u8(c.z), alpha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rect() -> egui::Rect {
        egui::Rect::from_min_size(egui::Pos2::new(0.0, 0.0), egui::vec2(800.0, 600.0))
    }

    fn small() -> Config {
        Config {
            entity_counts: vec![3, 4],
            ..Config::default()
        }
    }

    #[test]
    fn world_to_screen_and_back_is_roundtrip() {
        let mut viewer = Viewer::new(small()).unwrap();
        viewer.zoom = 2.0;
        viewer.pan = egui::vec2(15.0, -7.0);
        let rect = test_rect();

        for p in [Vec2::new(0.0, 0.0), Vec2::new(10.0, -5.0), Vec2::new(-3.5, 8.25)] {
            let back = viewer.screen_to_world(viewer.world_to_screen(p, rect), rect);
            assert!((back - p).abs().max_element() < 1e-4, "p={p:?}, back={back:?}");
        }
    }

    #[test]
    fn stepping_advances_the_simulation() {
        let mut viewer = Viewer::new(small()).unwrap();
        for _ in 0..5 {
            viewer.step_once();
        }
        assert_eq!(viewer.sim.tick_count(), 5);
        assert_eq!(viewer.sim.world().steps(), 5);
        assert!(viewer.last_error.is_none());
    }

    #[test]
    fn invalid_rebuild_keeps_the_running_simulation() {
        let mut viewer = Viewer::new(small()).unwrap();
        viewer.step_once();
        viewer.cfg.entity_counts = vec![1];
        viewer.rebuild();
        assert!(viewer.last_error.is_some());
        assert_eq!(viewer.sim.tick_count(), 1);

        viewer.cfg = small();
        viewer.rebuild();
        assert!(viewer.last_error.is_none());
        assert_eq!(viewer.sim.tick_count(), 0);
    }

    #[test]
    fn colours_are_clamped() {
        assert_eq!(color32(Vec3::new(2.0, -1.0, 0.5), 255), egui::Color32::from_rgb(255, 0, 128));
    }
}
