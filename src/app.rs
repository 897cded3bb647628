//! Application state holding the wgpu graphics context and the mask pipeline
//!
//! The render loop owns the camera, the compositor and the soundboard. Mood
//! detection runs on its own thread and only reaches the render loop through
//! the shared expression selector and face tracker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::assets::{MaskLoader, MaskTable};
use crate::camera::{CameraCapture, CaptureStatus, FrameFeed};
use crate::compositor::{Compositor, OverlayMode};
use crate::detector::{Detector, DetectorConfig, DetectorEvent, DetectorState, FaceTracker};
use crate::error::{MoodMaskError, Result};
use crate::expression::{ExpressionLabel, ExpressionSelector};
use crate::ml::{AnalyzerConfig, FaceBox, OrtAnalyzer};
use crate::settings::Settings;
use crate::soundboard::{AudioPlayer, SoundPlayer, Soundboard};

pub const TITLE: &str = "Go big. Be Kind. Go West.";

const BUTTON_COLUMNS: usize = 3;
const BUTTON_SIZE: f32 = 96.0;
const THUMBNAIL_SIZE: u32 = 128;

/// Inputs of the last uploaded composite
#[derive(Clone, Copy, PartialEq)]
struct CompositeKey {
    frame_number: u64,
    revision: u64,
    face: Option<FaceBox>,
    mode: OverlayMode,
    masks: usize,
}

/// Everything the UI pass reads, copied out so egui does not borrow `App`
struct UiView {
    fps: f64,
    camera: String,
    placeholder: &'static str,
    detector: DetectorState,
    detection_requested: bool,
    detection_available: bool,
    current: ExpressionLabel,
    masks_loaded: usize,
    has_audio: bool,
    overlay_mode: OverlayMode,
    video: Option<(egui::TextureId, egui::Vec2)>,
    buttons: Vec<ButtonView>,
}

struct ButtonView {
    label: ExpressionLabel,
    hover: String,
    texture: Option<egui::TextureId>,
}

/// What the user did during the UI pass
#[derive(Default)]
struct UiActions {
    set_detection: Option<bool>,
    overlay_mode: Option<OverlayMode>,
    pressed: Option<usize>,
}

/// Main application state
pub struct App {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    size: PhysicalSize<u32>,

    mask_dir: PathBuf,
    masks: MaskTable,
    mask_loader: Option<MaskLoader>,
    selector: ExpressionSelector,
    tracker: FaceTracker,
    camera: Option<CameraCapture>,
    detector: Option<Detector>,
    compositor: Compositor,
    soundboard: Soundboard,

    // Composited video and mask thumbnails
    video_texture: Option<egui::TextureHandle>,
    last_composite: Option<CompositeKey>,
    button_textures: HashMap<ExpressionLabel, egui::TextureHandle>,

    // egui integration
    egui_ctx: egui::Context,
    egui_state: egui_winit::State,
    egui_renderer: egui_wgpu::Renderer,

    // Frame timing
    fps: f64,
    last_fps_update: Instant,
    frames_since_update: u64,

    shut_down: bool,
}

impl App {
    /// Create the graphics context and start the camera, mask loader,
    /// detector and audio output
    pub async fn new(window: Arc<Window>, settings: Settings) -> Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| MoodMaskError::graphics(format!("failed to create surface: {}", e)))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| MoodMaskError::graphics("failed to find suitable GPU adapter"))?;

        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Mood Mask Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| MoodMaskError::graphics(format!("failed to create device: {}", e)))?;

        let surface_caps = surface.get_capabilities(&adapter);

        // egui writes gamma-space colors
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| MoodMaskError::graphics("surface reports no formats"))?;

        log::info!("Surface format: {:?}", surface_format);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        surface.configure(&device, &config);

        // Initialize egui
        let egui_ctx = egui::Context::default();
        let mut style = (*egui_ctx.style()).clone();
        style.visuals.window_shadow = egui::epaint::Shadow::NONE;
        egui_ctx.set_style(style);

        let egui_state = egui_winit::State::new(
            egui_ctx.clone(),
            egui::ViewportId::ROOT,
            &window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );

        let egui_renderer = egui_wgpu::Renderer::new(&device, surface_format, None, 1, false);

        // Mask pipeline
        let selector = ExpressionSelector::new(settings.initial_expression);
        if settings.mood_detection_on_start {
            // Held until the detector reports ready
            selector.transition(DetectorEvent::Enable);
        }

        let (masks, mask_loader) = match MaskLoader::spawn(&settings.mask_dir, &ExpressionLabel::ALL) {
            Ok(loader) => (loader.table(), Some(loader)),
            Err(e) => {
                log::error!("Failed to start mask loader: {}", e);
                (MaskTable::new(), None)
            }
        };

        let tracker = FaceTracker::new();
        let camera = Self::start_camera(&settings);
        let detector = camera.as_ref().and_then(|camera| {
            Self::start_detector(&settings, camera, &masks, &selector, &tracker)
        });

        let player: Option<Box<dyn SoundPlayer>> = match AudioPlayer::new(&settings.sound_dir) {
            Ok(player) => Some(Box::new(player)),
            Err(e) => {
                log::warn!("{}. Sound buttons will only switch masks.", e);
                None
            }
        };

        let compositor = Compositor::new(settings.overlay_mode, settings.mask_scale, settings.mask_offset);

        Ok(Self {
            window,
            surface,
            device,
            queue,
            config,
            size,
            mask_dir: settings.mask_dir.clone(),
            masks,
            mask_loader,
            selector,
            tracker,
            camera,
            detector,
            compositor,
            soundboard: Soundboard::new(player),
            video_texture: None,
            last_composite: None,
            button_textures: HashMap::new(),
            egui_ctx,
            egui_state,
            egui_renderer,
            fps: 0.0,
            last_fps_update: Instant::now(),
            frames_since_update: 0,
            shut_down: false,
        })
    }

    fn start_camera(settings: &Settings) -> Option<CameraCapture> {
        for camera in CameraCapture::list_cameras() {
            log::info!("Found camera {}: {}", camera.index, camera.name);
        }
        log::info!("Connecting to camera {}", settings.camera_index);

        match CameraCapture::new(
            settings.camera_index,
            settings.capture_width,
            settings.capture_height,
            settings.stale_frame_limit(),
        ) {
            Ok(capture) => Some(capture),
            Err(e) => {
                log::error!("Failed to start camera capture: {}", e);
                None
            }
        }
    }

    fn start_detector(
        settings: &Settings,
        camera: &CameraCapture,
        masks: &MaskTable,
        selector: &ExpressionSelector,
        tracker: &FaceTracker,
    ) -> Option<Detector> {
        let model_dir = settings.model_dir.clone();
        let analyzer_config = AnalyzerConfig {
            score_threshold: settings.face_score_threshold,
            nms_threshold: settings.nms_threshold,
        };
        let load = move || {
            let dir = OrtAnalyzer::find_model_dir(model_dir.as_deref())?;
            OrtAnalyzer::load(&dir, analyzer_config)
        };

        let feed: Arc<dyn FrameFeed> = Arc::new(camera.feed());
        let config = DetectorConfig {
            interval: settings.detection_interval(),
            confidence_threshold: settings.confidence_threshold,
            track_faces: true,
        };

        match Detector::spawn(load, feed, masks.clone(), selector.clone(), tracker.clone(), config) {
            Ok(detector) => Some(detector),
            Err(e) => {
                log::error!("Failed to start mood detector: {}", e);
                None
            }
        }
    }

    /// Handle a window event, returning true if egui consumed it
    pub fn handle_window_event(&mut self, event: &WindowEvent) -> bool {
        let response = self.egui_state.on_window_event(&self.window, event);
        response.consumed
    }

    /// Resize the surface
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Whether mood detection can still be turned on this session
    fn detection_available(&self) -> bool {
        let camera_ok = self
            .camera
            .as_ref()
            .is_some_and(|camera| camera.status() != CaptureStatus::Failed);
        camera_ok && self.detector.as_ref().is_some_and(Detector::is_available)
    }

    /// Turn automatic mask switching on or off
    pub fn set_mood_detection(&mut self, enabled: bool) {
        if !self.detection_available() {
            log::warn!("Mood detection is unavailable");
            return;
        }
        if let Some(detector) = &self.detector {
            let state = detector.set_mood_detection(enabled);
            log::info!("Mood detection {}: {}", if enabled { "on" } else { "off" }, state.display_name());
        }
    }

    pub fn toggle_mood_detection(&mut self) {
        let requested = self.selector.detector_mode().detection_requested();
        self.set_mood_detection(!requested);
    }

    /// Press sound button `index`
    pub fn trigger_sound(&mut self, index: usize) {
        if let Some(label) = self.soundboard.trigger(index, &self.selector) {
            log::info!("Sound button {} -> mask {}", index + 1, label);
        }
    }

    /// Poll background work and refresh the textures the UI draws
    pub fn update(&mut self) {
        self.poll_mask_loader();
        self.update_button_textures();
        self.update_video();
    }

    fn poll_mask_loader(&mut self) {
        if !self.mask_loader.as_ref().is_some_and(MaskLoader::is_finished) {
            return;
        }
        if let Some(loader) = self.mask_loader.take() {
            let loaded = loader.join();
            if loaded == 0 {
                log::warn!("No masks loaded from {:?}, showing video only", self.mask_dir);
            }
        }
    }

    fn update_button_textures(&mut self) {
        if self.button_textures.len() == self.soundboard.buttons().len() {
            return;
        }

        for button in self.soundboard.buttons() {
            if self.button_textures.contains_key(&button.label) {
                continue;
            }
            let Some(mask) = self.masks.get(button.label) else {
                continue;
            };

            let thumbnail = image::imageops::thumbnail(&*mask, THUMBNAIL_SIZE, THUMBNAIL_SIZE);
            let color_image = egui::ColorImage::from_rgba_unmultiplied(
                [thumbnail.width() as usize, thumbnail.height() as usize],
                thumbnail.as_raw(),
            );
            let texture = self.egui_ctx.load_texture(
                format!("mask-{}", button.label),
                color_image,
                egui::TextureOptions::LINEAR,
            );
            self.button_textures.insert(button.label, texture);
        }
    }

    /// Composite the latest camera frame and upload it if anything changed
    fn update_video(&mut self) {
        let Some(frame) = self.camera.as_ref().and_then(CameraCapture::latest_frame) else {
            return;
        };

        let face = self.tracker.latest();
        let key = CompositeKey {
            frame_number: frame.frame_number,
            revision: self.selector.revision(),
            face,
            mode: self.compositor.mode(),
            masks: self.masks.len(),
        };
        if self.last_composite == Some(key) {
            return;
        }
        self.last_composite = Some(key);

        let label = self.selector.current();
        let Some(composite) = self.compositor.compose(&frame, &self.masks, label, face) else {
            log::warn!("Skipping malformed camera frame {}", frame.frame_number);
            return;
        };

        let color_image = egui::ColorImage::from_rgba_unmultiplied(
            [composite.image.width() as usize, composite.image.height() as usize],
            composite.image.as_raw(),
        );

        match &mut self.video_texture {
            Some(texture) => texture.set(color_image, egui::TextureOptions::LINEAR),
            None => {
                self.video_texture = Some(self.egui_ctx.load_texture(
                    "video",
                    color_image,
                    egui::TextureOptions::LINEAR,
                ))
            }
        }
    }

    /// Render the frame
    pub fn render(&mut self) -> std::result::Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });

        self.render_ui(&mut encoder, &view);

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        self.update_fps();

        Ok(())
    }

    fn ui_view(&self) -> UiView {
        let (camera, placeholder) = match &self.camera {
            None => ("unavailable".to_string(), "Camera unavailable"),
            Some(camera) => match camera.status() {
                CaptureStatus::Starting => ("starting".to_string(), "Waiting for camera..."),
                CaptureStatus::Streaming => (
                    camera.device_name().unwrap_or_else(|| "streaming".to_string()),
                    "Waiting for camera...",
                ),
                CaptureStatus::Failed => ("unavailable".to_string(), "Camera unavailable"),
                CaptureStatus::Stopped => ("stopped".to_string(), "Camera stopped"),
            },
        };

        let video = self.video_texture.as_ref().map(|texture| {
            let [width, height] = texture.size();
            (texture.id(), egui::vec2(width as f32, height as f32))
        });

        let buttons = self
            .soundboard
            .buttons()
            .iter()
            .map(|button| ButtonView {
                label: button.label,
                hover: button.hover_text(),
                texture: self.button_textures.get(&button.label).map(egui::TextureHandle::id),
            })
            .collect();

        UiView {
            fps: self.fps,
            camera,
            placeholder,
            detector: self.selector.detector_state(),
            detection_requested: self.selector.detector_mode().detection_requested(),
            detection_available: self.detection_available(),
            current: self.selector.current(),
            masks_loaded: self.masks.len(),
            has_audio: self.soundboard.has_audio(),
            overlay_mode: self.compositor.mode(),
            video,
            buttons,
        }
    }

    fn render_ui(&mut self, encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView) {
        let raw_input = self.egui_state.take_egui_input(&self.window);
        let ui_view = self.ui_view();

        let mut actions = UiActions::default();
        let full_output = self
            .egui_ctx
            .run(raw_input, |ctx| draw_ui(ctx, &ui_view, &mut actions));

        if let Some(enabled) = actions.set_detection {
            self.set_mood_detection(enabled);
        }
        if let Some(mode) = actions.overlay_mode {
            self.compositor.set_mode(mode);
        }
        if let Some(index) = actions.pressed {
            self.trigger_sound(index);
        }

        self.egui_state.handle_platform_output(&self.window, full_output.platform_output);

        let paint_jobs = self.egui_ctx.tessellate(full_output.shapes, full_output.pixels_per_point);

        for (id, image_delta) in &full_output.textures_delta.set {
            self.egui_renderer.update_texture(&self.device, &self.queue, *id, image_delta);
        }

        let screen_descriptor = egui_wgpu::ScreenDescriptor {
            size_in_pixels: [self.config.width, self.config.height],
            pixels_per_point: self.window.scale_factor() as f32,
        };

        self.egui_renderer.update_buffers(
            &self.device,
            &self.queue,
            encoder,
            &paint_jobs,
            &screen_descriptor,
        );

        {
            let mut render_pass = encoder
                .begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("egui Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                })
                .forget_lifetime();

            self.egui_renderer.render(&mut render_pass, &paint_jobs, &screen_descriptor);
        }

        for id in &full_output.textures_delta.free {
            self.egui_renderer.free_texture(id);
        }
    }

    fn update_fps(&mut self) {
        self.frames_since_update += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f64();
        if elapsed >= 1.0 {
            self.fps = self.frames_since_update as f64 / elapsed;
            self.frames_since_update = 0;
            self.last_fps_update = now;
        }
    }

    /// Stop detection, release the camera and the audio device. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down");

        if let Some(detector) = &mut self.detector {
            detector.shutdown();
        }
        if let Some(camera) = &mut self.camera {
            camera.stop();
            if !camera.tracks_stopped() {
                log::warn!("Camera stream did not report stopped");
            }
        }
        self.soundboard.release_audio();
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn draw_ui(ctx: &egui::Context, view: &UiView, actions: &mut UiActions) {
    egui::TopBottomPanel::top("title").show(ctx, |ui| {
        ui.vertical_centered(|ui| {
            ui.heading(TITLE);
        });
    });

    egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
        ui.horizontal(|ui| {
            ui.label(format!("FPS: {:.1}", view.fps));
            ui.separator();
            ui.label(format!("Camera: {}", view.camera));
            ui.separator();
            ui.label(format!("Mood: {}", view.detector.display_name()));
            ui.separator();
            ui.label(format!("Mask: {}", view.current));
            ui.separator();
            ui.label(format!("Masks: {}/{}", view.masks_loaded, ExpressionLabel::ALL.len()));
            if !view.has_audio {
                ui.separator();
                ui.label("No audio");
            }
        });
    });

    egui::SidePanel::right("controls").resizable(false).show(ctx, |ui| {
        let mut enabled = view.detection_requested && view.detection_available;
        let checkbox = ui.add_enabled(
            view.detection_available,
            egui::Checkbox::new(&mut enabled, "Use mood detection"),
        );
        if checkbox.changed() {
            actions.set_detection = Some(enabled);
        }

        ui.separator();
        ui.label("Overlay:");
        ui.horizontal(|ui| {
            for mode in [OverlayMode::Positioned, OverlayMode::FullFrame] {
                if ui.selectable_label(view.overlay_mode == mode, mode.display_name()).clicked() {
                    actions.overlay_mode = Some(mode);
                }
            }
        });

        ui.separator();
        egui::Grid::new("sound_buttons").spacing([6.0, 6.0]).show(ui, |ui| {
            for (index, button) in view.buttons.iter().enumerate() {
                let size = egui::vec2(BUTTON_SIZE, BUTTON_SIZE);
                let response = match button.texture {
                    Some(texture) => ui.add(
                        egui::ImageButton::new(egui::load::SizedTexture::new(texture, size))
                            .selected(button.label == view.current),
                    ),
                    None => ui.add_sized(size, egui::Button::new(button.label.as_str())),
                };
                if response.on_hover_text(&button.hover).clicked() {
                    actions.pressed = Some(index);
                }
                if (index + 1) % BUTTON_COLUMNS == 0 {
                    ui.end_row();
                }
            }
        });
    });

    egui::CentralPanel::default().show(ctx, |ui| match view.video {
        Some((texture, size)) => {
            let available = ui.available_size();
            let scale = (available.x / size.x).min(available.y / size.y).max(0.0);
            ui.centered_and_justified(|ui| {
                ui.add(
                    egui::Image::new(egui::load::SizedTexture::new(texture, size))
                        .fit_to_exact_size(size * scale),
                );
            });
        }
        None => {
            ui.centered_and_justified(|ui| {
                ui.label(view.placeholder);
            });
        }
    });
}
