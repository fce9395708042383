use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use box_scrubber::{
    annotation_path, logging, AnnotationError, AnnotationSession, AppConfig, BoxSource, Coords,
    DisplayGeometry, ImageSequence, Rotation, SessionEvent,
};
use clap::Parser;
use eframe::egui;
use tracing::{info, warn};

const MIN_DRAG: f32 = 5.0;
const TICK_EVERY: usize = 5;
const MIN_TICK_SPACING: f32 = 32.0;
const LABEL_FONT: f32 = 12.0;

const USER_COLOR: egui::Color32 = egui::Color32::from_rgb(230, 40, 40);
const AUTO_COLOR: egui::Color32 = egui::Color32::from_rgb(40, 110, 240);
const MARKER_COLOR: egui::Color32 = egui::Color32::from_rgb(255, 190, 40);

// ── Command line ────────────────────────────────────────────────────────────

/// Step through a directory of frames drawing and tagging boxes.
#[derive(Debug, Parser)]
#[command(name = "box-scrubber", version)]
struct Args {
    /// Directory of .jpg/.png frames. A folder picker opens when omitted.
    dir: Option<PathBuf>,

    /// JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `box_scrubber=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

// ── Panel commands ──────────────────────────────────────────────────────────

enum TagCommand {
    Edit(usize, String),
    Remove(String),
    Add(String),
    Delete,
}

// ── App ─────────────────────────────────────────────────────────────────────

struct ScrubberApp {
    session: AnnotationSession<ImageSequence>,
    events: Rc<RefCell<Vec<SessionEvent>>>,

    texture: Option<egui::TextureHandle>,
    texture_key: Option<(usize, Rotation)>,
    /// Un-rotated size of the frame behind `texture`.
    image_size: (u32, u32),

    drag_start: Option<egui::Pos2>,
    scrub: usize,

    // tag panel state
    tag_edits: Vec<String>,
    new_tag: String,

    status: String,
}

impl ScrubberApp {
    fn new(mut session: AnnotationSession<ImageSequence>) -> Self {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        session.subscribe(move |e| sink.borrow_mut().push(e.clone()));

        let status = session
            .set_aside()
            .map(|backup| format!("Unreadable annotations moved to {}", backup.display()))
            .unwrap_or_default();

        Self {
            session,
            events,
            texture: None,
            texture_key: None,
            image_size: (0, 0),
            drag_start: None,
            scrub: 0,
            tag_edits: Vec::new(),
            new_tag: String::new(),
            status,
        }
    }

    /// Apply queued session notifications to the view.
    fn drain_events(&mut self) {
        let events: Vec<SessionEvent> = self.events.borrow_mut().drain(..).collect();
        let mut refresh_tags = false;
        for event in events {
            match event {
                SessionEvent::BoxAdded { coords, .. } => {
                    self.status = format!("Added box {coords}");
                }
                SessionEvent::BoxRemoved { coords, .. } => {
                    self.status = format!("Removed box {coords}");
                    refresh_tags = true;
                }
                SessionEvent::BoxesUpdated { frame } => {
                    if frame != self.session.current_frame() {
                        self.status = format!("Changed boxes on frame {frame}");
                    }
                    refresh_tags = true;
                }
                SessionEvent::FrameChanged { frame } => {
                    self.scrub = frame;
                    refresh_tags = true;
                }
                SessionEvent::BoxEdited { .. } | SessionEvent::BoxSelected(_) => {
                    refresh_tags = true;
                }
                SessionEvent::RotationChanged(angle) => {
                    self.status = format!("Rotation {angle}");
                }
            }
        }
        if refresh_tags {
            self.tag_edits = self
                .session
                .selected()
                .map(|b| b.tags.clone())
                .unwrap_or_default();
        }
    }

    fn report(&mut self, result: box_scrubber::Result<()>) {
        match result {
            Ok(()) => {}
            Err(AnnotationError::BoxNotFound { .. }) => {
                // The view is stale; drop the selection and redraw from the store.
                self.session.select(None);
                self.status = "Box no longer exists".to_string();
            }
            Err(e) => {
                warn!("{e}");
                self.status = e.to_string();
            }
        }
    }

    fn save(&mut self) {
        match self.session.save() {
            Ok(()) => {
                if let Some(path) = self.session.annotation_path() {
                    self.status = format!("Saved {}", path.display());
                }
            }
            Err(e) => {
                tracing::error!("save failed: {e}");
                self.status = format!("Save failed: {e}");
            }
        }
    }

    fn ensure_texture(&mut self, ctx: &egui::Context) {
        let key = (self.session.current_frame(), self.session.rotation());
        if self.texture_key == Some(key) {
            return;
        }
        self.texture_key = Some(key);
        self.texture = None;

        let Some(img) = self.session.current_image() else {
            self.status = format!("Frame {} could not be read", key.0);
            return;
        };
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        self.image_size = if key.1.swaps_axes() { (h, w) } else { (w, h) };
        let pixels = rgba.as_flat_samples();
        let color_image =
            egui::ColorImage::from_rgba_unmultiplied([w as usize, h as usize], pixels.as_slice());
        self.texture = Some(ctx.load_texture(
            format!("frame-{}", key.0),
            color_image,
            egui::TextureOptions::LINEAR,
        ));
    }

    fn geometry(&self, canvas_rect: egui::Rect) -> DisplayGeometry {
        DisplayGeometry::fit(
            self.image_size.0,
            self.image_size.1,
            canvas_rect.width().max(0.0) as u32,
            canvas_rect.height().max(0.0) as u32,
            self.session.rotation(),
        )
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        if ctx.wants_keyboard_input() {
            return;
        }
        let (undo, redo, prev, next, delete) = ctx.input(|i| {
            let z = i.modifiers.command && i.key_pressed(egui::Key::Z);
            (
                z && !i.modifiers.shift,
                z && i.modifiers.shift,
                i.key_pressed(egui::Key::ArrowLeft),
                i.key_pressed(egui::Key::ArrowRight),
                i.key_pressed(egui::Key::Delete),
            )
        });
        if undo {
            self.session.undo();
        }
        if redo {
            self.session.redo();
        }
        if prev {
            self.session.go_to_previous_frame();
        }
        if next {
            self.session.advance_to_next_frame();
        }
        if delete {
            if let Some(key) = self.session.selected().map(|b| b.key()) {
                let result = self.session.delete_box(key);
                self.report(result);
            }
        }
    }

    // ── Canvas ──────────────────────────────────────────────────────────────

    fn draw_boxes(&self, painter: &egui::Painter, canvas_rect: egui::Rect, geometry: &DisplayGeometry) {
        let selected = self.session.selected().map(|b| b.key());
        for b in self.session.current_boxes() {
            let r = geometry.rect_to_display(b.coords);
            let rect = egui::Rect::from_min_size(
                canvas_rect.min + egui::vec2(r.x as f32, r.y as f32),
                egui::vec2(r.w as f32, r.h as f32),
            );
            let color = match b.source {
                BoxSource::User => USER_COLOR,
                BoxSource::Automatic => AUTO_COLOR,
            };
            let width = if selected == Some(b.key()) { 3.0 } else { 1.0 };
            painter.rect_stroke(rect, 0.0, egui::Stroke::new(width, color), egui::StrokeKind::Middle);

            let label = fit_label(painter, &b.label(), rect.width());
            if !label.is_empty() {
                painter.text(
                    rect.left_top() + egui::vec2(2.0, 1.0),
                    egui::Align2::LEFT_TOP,
                    label,
                    egui::FontId::proportional(LABEL_FONT),
                    color,
                );
            }
        }
    }

    fn canvas(&mut self, ui: &mut egui::Ui) {
        let (response, painter) = ui.allocate_painter(ui.available_size(), egui::Sense::click_and_drag());
        let canvas_rect = response.rect;
        painter.rect_filled(canvas_rect, 0.0, egui::Color32::from_gray(40));

        let geometry = self.geometry(canvas_rect);
        let to_panel = |p: egui::Pos2| {
            let v = p - canvas_rect.min;
            (v.x as i32, v.y as i32)
        };

        if let Some(ref tex) = self.texture {
            let (ox, oy) = geometry.offset();
            let (bw, bh) = geometry.rotated_bitmap_size();
            let img_rect = egui::Rect::from_min_size(
                canvas_rect.min + egui::vec2(ox as f32, oy as f32),
                egui::vec2(bw as f32, bh as f32),
            );
            painter.image(
                tex.id(),
                img_rect,
                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                egui::Color32::WHITE,
            );
        }

        self.draw_boxes(&painter, canvas_rect, &geometry);

        if let (Some(start), Some(current)) = (self.drag_start, response.hover_pos()) {
            painter.rect_stroke(
                egui::Rect::from_two_pos(start, current),
                0.0,
                egui::Stroke::new(1.0, egui::Color32::YELLOW),
                egui::StrokeKind::Middle,
            );
        }

        if self.texture.is_none() {
            return;
        }

        if response.clicked() {
            if let Some(pos) = response.interact_pointer_pos() {
                self.session.select_box_at(to_panel(pos), &geometry);
            }
        }

        if response.drag_started_by(egui::PointerButton::Primary) {
            self.drag_start = response.interact_pointer_pos();
        }

        if response.drag_stopped_by(egui::PointerButton::Primary) {
            let end = response
                .interact_pointer_pos()
                .or(ui.ctx().input(|i| i.pointer.latest_pos()));
            if let (Some(start), Some(end)) = (self.drag_start.take(), end) {
                if (end - start).length() > MIN_DRAG {
                    if let Some(b) = self.session.draw_box(to_panel(start), to_panel(end), &geometry) {
                        self.session.select(Some(b.key()));
                    }
                }
            }
        }
    }

    // ── Tag panel ───────────────────────────────────────────────────────────

    fn tag_panel(&mut self, ui: &mut egui::Ui) {
        let Some(selected) = self.session.selected().cloned() else {
            ui.heading("No box selected");
            ui.label("Click a box to edit its tags, drag to draw one.");
            self.box_list(ui);
            return;
        };
        let key = selected.key();

        ui.heading(format!("Box: {}", selected.coords));
        ui.label(format!("Source: {}", selected.source));
        ui.separator();

        self.tag_edits.resize(selected.tags.len(), String::new());
        let mut commands = Vec::new();
        for (i, tag) in selected.tags.iter().enumerate() {
            ui.horizontal(|ui| {
                let edit = ui.text_edit_singleline(&mut self.tag_edits[i]);
                if edit.lost_focus() && self.tag_edits[i] != *tag {
                    commands.push(TagCommand::Edit(i, self.tag_edits[i].clone()));
                }
                if ui.small_button("✕").on_hover_text("Remove tag").clicked() {
                    commands.push(TagCommand::Remove(tag.clone()));
                }
            });
        }

        ui.horizontal(|ui| {
            let edit = ui.text_edit_singleline(&mut self.new_tag);
            let submitted = edit.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
            if (ui.button("Add").clicked() || submitted) && !self.new_tag.trim().is_empty() {
                let tag = std::mem::take(&mut self.new_tag);
                commands.push(TagCommand::Add(tag.trim().to_string()));
            }
        });

        ui.separator();
        if ui.button("Delete box").clicked() {
            commands.push(TagCommand::Delete);
        }

        for command in commands {
            let result = match command {
                TagCommand::Edit(i, text) => self.session.edit_tag(key, i, &text),
                TagCommand::Remove(tag) => self.session.remove_tag(key, &tag).map(|_| ()),
                TagCommand::Add(tag) => self.session.add_tag(key, &tag).map(|_| ()),
                TagCommand::Delete => self.session.delete_box(key),
            };
            self.report(result);
        }

        ui.separator();
        self.box_list(ui);
    }

    fn box_list(&mut self, ui: &mut egui::Ui) {
        let selected = self.session.selected().map(|b| b.key());
        let rows: Vec<(Coords, String)> = self
            .session
            .current_boxes()
            .iter()
            .map(|b| (b.key(), format!("{} {}", b.coords, b.label())))
            .collect();
        let frame = self.session.current_frame();
        ui.label(format!("{} boxes on frame {}", self.session.store().box_count(frame), frame + 1));
        egui::ScrollArea::vertical().show(ui, |ui| {
            for (key, text) in rows {
                if ui.selectable_label(selected == Some(key), text).clicked() {
                    self.session.select(Some(key));
                }
            }
        });
    }

    // ── Timeline ────────────────────────────────────────────────────────────

    fn marker_strip(&self, ui: &mut egui::Ui) {
        let (rect, _) = ui.allocate_exact_size(egui::vec2(ui.available_width(), 28.0), egui::Sense::hover());
        let painter = ui.painter_at(rect);
        painter.rect_filled(rect, 0.0, egui::Color32::from_gray(30));

        let count = self.session.frame_count();
        if count == 0 {
            return;
        }
        let span = (count.saturating_sub(1)).max(1) as f32;
        let x_of = |frame: usize| rect.left() + rect.width() * frame as f32 / span;

        let step = tick_step(rect.width() / span);
        for frame in (0..count).step_by(step) {
            let x = x_of(frame);
            painter.line_segment(
                [egui::pos2(x, rect.bottom() - 6.0), egui::pos2(x, rect.bottom())],
                egui::Stroke::new(1.0, egui::Color32::GRAY),
            );
            painter.text(
                egui::pos2(x + 2.0, rect.bottom() - 6.0),
                egui::Align2::LEFT_BOTTOM,
                frame.to_string(),
                egui::FontId::monospace(9.0),
                egui::Color32::GRAY,
            );
        }

        for frame in self.session.store().annotated_frames() {
            let x = x_of(frame);
            painter.line_segment(
                [egui::pos2(x, rect.top()), egui::pos2(x, rect.top() + 8.0)],
                egui::Stroke::new(2.0, MARKER_COLOR),
            );
        }

        let x = x_of(self.session.current_frame());
        painter.line_segment(
            [egui::pos2(x, rect.top()), egui::pos2(x, rect.bottom())],
            egui::Stroke::new(1.5, egui::Color32::WHITE),
        );
    }
}

/// Frames between labelled ticks: a multiple of five wide enough that labels
/// never crowd. A strip with no width gets `usize::MAX`, i.e. one tick.
fn tick_step(px_per_frame: f32) -> usize {
    if !(px_per_frame > 0.0) {
        return usize::MAX;
    }
    let ticks = (MIN_TICK_SPACING / px_per_frame / TICK_EVERY as f32).ceil().max(1.0) as usize;
    let mut step = ticks.saturating_mul(TICK_EVERY);
    // Rounding can leave the estimate one tick short.
    if (step as f32) * px_per_frame < MIN_TICK_SPACING {
        step = step.saturating_add(TICK_EVERY);
    }
    step
}

/// Shorten `text` with a trailing "..." until it fits `max_width` points.
fn fit_label(painter: &egui::Painter, text: &str, max_width: f32) -> String {
    let font = egui::FontId::proportional(LABEL_FONT);
    let width = |s: &str| {
        painter
            .layout_no_wrap(s.to_string(), font.clone(), egui::Color32::WHITE)
            .size()
            .x
    };
    if width(text) <= max_width {
        return text.to_string();
    }
    let mut chars: Vec<char> = text.chars().collect();
    while !chars.is_empty() {
        chars.pop();
        let candidate: String = chars.iter().collect::<String>() + "...";
        if width(&candidate) <= max_width {
            return candidate;
        }
    }
    String::new()
}

// ── eframe App impl ────────────────────────────────────────────────────────

impl eframe::App for ScrubberApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_keys(ctx);
        self.drain_events();
        self.ensure_texture(ctx);

        // Top toolbar
        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("◀ Prev").clicked() {
                    self.session.go_to_previous_frame();
                }
                if ui.button("Next ▶").clicked() {
                    self.session.advance_to_next_frame();
                }
                ui.separator();
                if ui.button("Rotate CCW").clicked() {
                    self.session.rotate_ccw();
                }
                if ui.button("Rotate CW").clicked() {
                    self.session.rotate_cw();
                }
                ui.separator();
                if ui.add_enabled(self.session.can_undo(), egui::Button::new("Undo")).clicked() {
                    self.session.undo();
                }
                if ui.add_enabled(self.session.can_redo(), egui::Button::new("Redo")).clicked() {
                    self.session.redo();
                }
                if ui.button("Save").clicked() {
                    self.save();
                }
                ui.separator();
                ui.label(format!(
                    "Frame {} / {}  ·  {}  ·  {}",
                    self.session.current_frame() + 1,
                    self.session.frame_count(),
                    self.session.rotation(),
                    self.status
                ));
            });
        });

        // Timeline
        egui::TopBottomPanel::bottom("timeline").show(ctx, |ui| {
            self.marker_strip(ui);
            let last = self.session.frame_count().saturating_sub(1);
            self.scrub = self.session.current_frame();
            let slider = ui.add(
                egui::Slider::new(&mut self.scrub, 0..=last).text("frame"),
            );
            if slider.changed() {
                self.session.go_to_frame(self.scrub);
            }
        });

        // Tags
        egui::SidePanel::right("tags").default_width(240.0).show(ctx, |ui| {
            self.tag_panel(ui);
        });

        // Canvas
        egui::CentralPanel::default().show(ctx, |ui| {
            self.canvas(ui);
        });

        self.drain_events();
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.log.filter = level;
    }
    if args.log_json {
        config.log.json = true;
    }
    logging::init(&config.log).context("installing log subscriber")?;

    let dir = match args.dir {
        Some(dir) => dir,
        None => rfd::FileDialog::new()
            .set_title("Choose a directory of frames")
            .pick_folder()
            .context("no frame directory chosen")?,
    };

    let frames = ImageSequence::open(&dir).with_context(|| format!("opening {}", dir.display()))?;
    let sidecar = annotation_path(&dir);
    info!(sidecar = %sidecar.display(), "annotations file");
    let session = AnnotationSession::open(frames, sidecar, &config);

    let title = format!(
        "box-scrubber - {}",
        dir.file_name().unwrap_or_default().to_string_lossy()
    );
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 860.0])
            .with_title(&title),
        ..Default::default()
    };

    eframe::run_native(
        &title,
        options,
        Box::new(move |_cc| Ok(Box::new(ScrubberApp::new(session)))),
    )
    .map_err(|e| anyhow::anyhow!("failed to run eframe: {e}"))
}
